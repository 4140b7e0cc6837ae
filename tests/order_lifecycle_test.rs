mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use commerce_orders::config::AppConfig;
use commerce_orders::errors::OrderError;
use commerce_orders::models::{
    Catalogue, DiscountValueType, FulfillmentStatus, Order, OrderEventType, OrderStatus, Sale,
    SaleChannelListing, Stock, Voucher, VoucherChannelListing, VoucherType,
};
use commerce_orders::money::Currency;
use commerce_orders::services::{
    CreateFulfillmentsInput, CreateReturnInput, CustomerInfo, FulfillmentLineInput,
    RecalculateOptions, ReturnLineInput, WarehouseLines,
};
use common::{usd, variant, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn voucher(app: &TestApp, code: &str, voucher_type: VoucherType, value: Decimal) -> Voucher {
    Voucher {
        id: Uuid::new_v4(),
        code: code.into(),
        name: Some(code.into()),
        voucher_type,
        discount_value_type: DiscountValueType::Percentage,
        usage_limit: None,
        used: 0,
        start_date: Utc::now() - Duration::days(1),
        end_date: None,
        apply_once_per_order: false,
        apply_once_per_customer: false,
        only_for_staff: false,
        countries: vec![],
        min_checkout_items_quantity: 0,
        channel_listings: vec![VoucherChannelListing {
            channel_id: app.channel_id,
            discount_value: value,
            currency: Currency::USD,
            min_spent: None,
        }],
    }
}

fn fulfill(app: &TestApp, order: &Order, line_id: Uuid, quantity: i32) -> CreateFulfillmentsInput {
    CreateFulfillmentsInput {
        order_id: order.id,
        lines_for_warehouses: vec![WarehouseLines {
            warehouse_id: app.warehouse_id,
            lines: vec![FulfillmentLineInput {
                order_line_id: line_id,
                quantity,
            }],
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn entire_order_voucher_takes_ten_percent() {
    let app = TestApp::new();
    let order = app.draft_order(dec!(0)).await;
    let code = voucher(&app, "SPRING10", VoucherType::EntireOrder, dec!(10));

    let mut tx = app.begin().await;
    tx.vouchers().save(&code).await.unwrap();
    app.service
        .add_variant_to_order(&mut tx, order.id, variant(dec!(25), false), 4, None)
        .await
        .unwrap();
    let order = app
        .service
        .add_voucher_to_order(&mut tx, order.id, "spring10", &CustomerInfo::default())
        .await
        .unwrap();
    app.service.commit(tx).await.unwrap();

    assert_eq!(order.subtotal.gross, usd(dec!(100.00)));
    assert_eq!(order.discount_amount, usd(dec!(10.00)));
    assert_eq!(order.total.gross, usd(dec!(90.00)));
    assert_eq!(order.undiscounted_total.gross, usd(dec!(100.00)));

    let mut tx = app.begin().await;
    let discounts = tx.orders().discounts(order.id).await.unwrap();
    assert_eq!(discounts.len(), 1);
    assert_eq!(discounts[0].voucher_id, Some(code.id));
    assert_eq!(tx.vouchers().get(code.id).await.unwrap().used, 1);
}

#[tokio::test]
async fn shipping_voucher_needs_a_delivery_method() {
    let app = TestApp::new();
    let order = app.draft_order(dec!(8)).await;
    let code = voucher(&app, "FREESHIP", VoucherType::Shipping, dec!(100));

    let mut tx = app.begin().await;
    tx.vouchers().save(&code).await.unwrap();
    app.service
        .add_variant_to_order(&mut tx, order.id, variant(dec!(30), false), 1, None)
        .await
        .unwrap();
    let result = app
        .service
        .add_voucher_to_order(&mut tx, order.id, "FREESHIP", &CustomerInfo::default())
        .await;

    assert_matches!(
        result,
        Err(OrderError::NotApplicable(ref e)) if e.message == "Please select a delivery method first."
    );
    assert_eq!(app.service.metrics().voucher_not_applicable.get(), 1);
    assert_eq!(tx.vouchers().get(code.id).await.unwrap().used, 0);
}

#[tokio::test]
async fn oversized_fulfillment_is_rejected_without_changes() {
    let app = TestApp::new();
    let variant = variant(dec!(12), true);
    let variant_id = variant.variant_id;

    let mut tx = app.begin().await;
    let mut order = Order::new(app.channel_id, Currency::USD, OrderStatus::PartiallyFulfilled);
    order.user_email = Some("buyer@example.com".into());
    tx.orders().save(&order).await.unwrap();
    let mut line = variant.into_line(order.id, 5).unwrap();
    line.quantity_fulfilled = 2;
    tx.orders().save_line(&line).await.unwrap();
    tx.stocks()
        .save(&Stock::new(app.warehouse_id, variant_id, 2))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = app.begin().await;
    let result = app
        .service
        .create_fulfillments(&mut tx, fulfill(&app, &order, line.id, 4))
        .await;
    let err = result.unwrap_err();
    assert_matches!(err, OrderError::InsufficientStock(ref e) if e.references_line(line.id));
    drop(tx);

    let mut tx = app.begin().await;
    assert_eq!(tx.orders().line(line.id).await.unwrap().quantity_fulfilled, 2);
    assert!(tx.fulfillments().for_order(order.id).await.unwrap().is_empty());
    drop(tx);
    assert_eq!(app.stock(variant_id).await.quantity, 2);
    assert_eq!(app.service.metrics().insufficient_stock.get(), 1);
}

#[tokio::test]
async fn canceling_a_fulfillment_restores_stock() {
    let app = TestApp::new();
    let item = variant(dec!(15), true);
    let variant_id = item.variant_id;
    app.seed_stock(variant_id, 10).await;
    let (order, lines) = app.placed_order(vec![(item, 3)]).await;
    assert_eq!(order.status, OrderStatus::Unfulfilled);
    assert_eq!(app.stock(variant_id).await.quantity_allocated, 3);

    let mut tx = app.begin().await;
    let fulfillments = app
        .service
        .create_fulfillments(&mut tx, fulfill(&app, &order, lines[0].id, 3))
        .await
        .unwrap();
    app.service.commit(tx).await.unwrap();
    assert_eq!(fulfillments.len(), 1);
    let stock = app.stock(variant_id).await;
    assert_eq!((stock.quantity, stock.quantity_allocated), (7, 0));

    let mut tx = app.begin().await;
    assert_eq!(
        tx.orders().get(order.id).await.unwrap().status,
        OrderStatus::Fulfilled
    );
    let canceled = app
        .service
        .cancel_fulfillment(&mut tx, fulfillments[0].id, None, None)
        .await
        .unwrap();
    assert_eq!(canceled.status, FulfillmentStatus::Canceled);
    let order = tx.orders().get(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Unfulfilled);
    assert_eq!(tx.orders().line(lines[0].id).await.unwrap().quantity_fulfilled, 0);
    app.service.commit(tx).await.unwrap();

    let stock = app.stock(variant_id).await;
    assert_eq!((stock.quantity, stock.quantity_allocated), (10, 3));

    let mut tx = app.begin().await;
    assert_matches!(
        app.service
            .cancel_fulfillment(&mut tx, fulfillments[0].id, None, None)
            .await,
        Err(OrderError::InvalidState(_))
    );
    drop(tx);

    let calls = app.plugins.calls();
    assert!(calls.contains(&"order_created"));
    assert!(calls.contains(&"fulfillment_created"));
    assert!(calls.contains(&"order_fulfilled"));
    assert!(calls.contains(&"fulfillment_canceled"));
}

#[tokio::test]
async fn canceling_an_order_releases_allocations_and_voucher() {
    let app = TestApp::new();
    let item = variant(dec!(40), true);
    let variant_id = item.variant_id;
    app.seed_stock(variant_id, 5).await;
    let code = voucher(&app, "WELCOME", VoucherType::EntireOrder, dec!(5));

    let order = app.draft_order(dec!(0)).await;
    let mut tx = app.begin().await;
    tx.vouchers().save(&code).await.unwrap();
    app.service
        .add_variant_to_order(&mut tx, order.id, item, 2, None)
        .await
        .unwrap();
    app.service
        .add_voucher_to_order(&mut tx, order.id, "WELCOME", &CustomerInfo::default())
        .await
        .unwrap();
    app.service
        .order_created(&mut tx, order.id, None, true)
        .await
        .unwrap();
    app.service.commit(tx).await.unwrap();
    assert_eq!(app.stock(variant_id).await.quantity_allocated, 2);

    let mut tx = app.begin().await;
    let canceled = app.service.cancel_order(&mut tx, order.id, None).await.unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert_eq!(tx.vouchers().get(code.id).await.unwrap().used, 0);
    let events = tx.order_events().for_order(order.id).await.unwrap();
    assert!(events
        .iter()
        .any(|event| event.event_type == OrderEventType::Canceled));
    app.service.commit(tx).await.unwrap();

    let stock = app.stock(variant_id).await;
    assert_eq!((stock.quantity, stock.quantity_allocated), (5, 0));

    let mut tx = app.begin().await;
    assert_matches!(
        app.service.cancel_order(&mut tx, order.id, None).await,
        Err(OrderError::InvalidState(_))
    );
}

#[tokio::test]
async fn placing_an_order_without_stock_fails() {
    let app = TestApp::new();
    let item = variant(dec!(10), true);
    app.seed_stock(item.variant_id, 1).await;
    let order = app.draft_order(dec!(0)).await;

    let mut tx = app.begin().await;
    app.service
        .add_variant_to_order(&mut tx, order.id, item, 2, None)
        .await
        .unwrap();
    assert_matches!(
        app.service.order_created(&mut tx, order.id, None, true).await,
        Err(OrderError::InsufficientStock(_))
    );
}

#[tokio::test]
async fn canceling_a_returned_order_does_not_restock_twice() {
    let app = TestApp::new();
    let item = variant(dec!(20), true);
    let variant_id = item.variant_id;
    app.seed_stock(variant_id, 5).await;
    let (order, lines) = app.placed_order(vec![(item, 3)]).await;

    let mut tx = app.begin().await;
    let fulfillments = app
        .service
        .create_fulfillments(&mut tx, fulfill(&app, &order, lines[0].id, 3))
        .await
        .unwrap();
    app.service
        .create_return_fulfillment(
            &mut tx,
            CreateReturnInput {
                order_id: order.id,
                user_id: None,
                lines: vec![ReturnLineInput {
                    fulfillment_line_id: fulfillments[0].lines[0].id,
                    quantity: 3,
                }],
                restock: true,
            },
        )
        .await
        .unwrap();
    app.service.commit(tx).await.unwrap();
    assert_eq!(app.stock(variant_id).await.quantity, 5);

    let mut tx = app.begin().await;
    let canceled = app.service.cancel_order(&mut tx, order.id, None).await.unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    app.service.commit(tx).await.unwrap();

    let stock = app.stock(variant_id).await;
    assert_eq!((stock.quantity, stock.quantity_allocated), (5, 0));
}

#[tokio::test]
async fn placing_an_unconfirmed_order_again_is_rejected() {
    let mut config = AppConfig::default();
    config.orders.automatically_confirm_all_new_orders = false;
    let app = TestApp::with_config(config);
    let item = variant(dec!(10), true);
    let variant_id = item.variant_id;
    app.seed_stock(variant_id, 10).await;
    let order = app.draft_order(dec!(0)).await;

    let mut tx = app.begin().await;
    app.service
        .add_variant_to_order(&mut tx, order.id, item, 2, None)
        .await
        .unwrap();
    let placed = app
        .service
        .order_created(&mut tx, order.id, None, true)
        .await
        .unwrap();
    assert_eq!(placed.status, OrderStatus::Unconfirmed);
    app.service.commit(tx).await.unwrap();

    let mut tx = app.begin().await;
    assert_matches!(
        app.service.order_created(&mut tx, order.id, None, false).await,
        Err(OrderError::InvalidState(_))
    );
    drop(tx);
    assert_eq!(app.stock(variant_id).await.quantity_allocated, 2);
}

#[tokio::test]
async fn sale_prices_draft_lines_and_sticks_after_placement() {
    let app = TestApp::new();
    let item = variant(dec!(50), false);
    let mut sale = Sale {
        id: Uuid::new_v4(),
        name: "Midsummer".into(),
        sale_type: DiscountValueType::Percentage,
        start_date: Utc::now() - Duration::days(1),
        end_date: None,
        catalogue: Catalogue {
            product_ids: vec![item.product_id],
            ..Default::default()
        },
        channel_listings: vec![SaleChannelListing {
            channel_id: app.channel_id,
            discount_value: dec!(20),
            currency: Currency::USD,
        }],
    };
    let order = app.draft_order(dec!(0)).await;

    let mut tx = app.begin().await;
    tx.sales().save(&sale).await.unwrap();
    let line = app
        .service
        .add_variant_to_order(&mut tx, order.id, item, 2, None)
        .await
        .unwrap();
    assert_eq!(line.sale_id, Some(sale.id));
    assert_eq!(line.unit_price.gross, usd(dec!(40.00)));
    let placed = app
        .service
        .order_created(&mut tx, order.id, None, true)
        .await
        .unwrap();
    assert_eq!(placed.total.gross, usd(dec!(80.00)));
    app.service.commit(tx).await.unwrap();

    let mut tx = app.begin().await;
    sale.end_date = Some(Utc::now() - Duration::hours(1));
    tx.sales().save(&sale).await.unwrap();
    let recalculated = app
        .service
        .recalculate_order(&mut tx, order.id, RecalculateOptions::default())
        .await
        .unwrap();
    assert_eq!(recalculated.total.gross, usd(dec!(80.00)));
    assert_eq!(tx.orders().line(line.id).await.unwrap().sale_id, Some(sale.id));
}
