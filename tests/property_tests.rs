//! Property-based tests for pricing and stock invariants.
//!
//! These tests use proptest to check that totals, discounts and stock
//! bookkeeping hold across a wide range of inputs.

mod common;

use chrono::Utc;
use commerce_orders::models::{
    DiscountInput, DiscountValueType, Voucher, VoucherChannelListing, VoucherType,
};
use commerce_orders::money::{Currency, ExchangeRates, Money};
use commerce_orders::services::{
    CreateFulfillmentsInput, DiscountService, FulfillmentLineInput, RecalculateOptions,
    WarehouseLines,
};
use common::{variant, TestApp};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

// Strategies for generating test data
fn cents_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn percent_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=10_000).prop_map(|basis_points| Decimal::new(basis_points, 2))
}

fn value_type_strategy() -> impl Strategy<Value = DiscountValueType> {
    prop_oneof![
        Just(DiscountValueType::Fixed),
        Just(DiscountValueType::Percentage)
    ]
}

fn voucher_with_min_quantity(min: i32) -> Voucher {
    Voucher {
        id: Uuid::new_v4(),
        code: "BULK".into(),
        name: None,
        voucher_type: VoucherType::EntireOrder,
        discount_value_type: DiscountValueType::Fixed,
        usage_limit: None,
        used: 0,
        start_date: Utc::now(),
        end_date: None,
        apply_once_per_order: false,
        apply_once_per_customer: false,
        only_for_staff: false,
        countries: vec![],
        min_checkout_items_quantity: min,
        channel_listings: vec![VoucherChannelListing {
            channel_id: Uuid::new_v4(),
            discount_value: Decimal::ONE,
            currency: Currency::USD,
            min_spent: None,
        }],
    }
}

// Property: a discount never exceeds its base and never goes negative
proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn discount_stays_within_base(
        value_type in value_type_strategy(),
        value in cents_strategy(),
        base in cents_strategy(),
    ) {
        let service = DiscountService::new(ExchangeRates::new(), true);
        let base = Money::new(base, Currency::USD);
        let amount = service
            .discount_amount_for(value_type, value, Currency::USD, &base)
            .unwrap();
        prop_assert!(!amount.is_negative());
        prop_assert!(amount.amount <= base.amount, "{} exceeds {}", amount, base);
    }

    #[test]
    fn percentage_discount_is_monotonic(
        low in percent_strategy(),
        high in percent_strategy(),
        base in cents_strategy(),
    ) {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let service = DiscountService::new(ExchangeRates::new(), false);
        let base = Money::new(base, Currency::USD);
        let small = service
            .discount_amount_for(DiscountValueType::Percentage, low, Currency::USD, &base)
            .unwrap();
        let large = service
            .discount_amount_for(DiscountValueType::Percentage, high, Currency::USD, &base)
            .unwrap();
        prop_assert!(small.amount <= large.amount);
    }
}

// Property: adding items never makes a minimum-quantity voucher invalid
proptest! {
    #[test]
    fn min_quantity_check_is_monotonic(min in 0i32..50, quantity in 0i32..100, extra in 0i32..100) {
        let voucher = voucher_with_min_quantity(min);
        if voucher.validate_min_checkout_items_quantity(quantity).is_ok() {
            prop_assert!(voucher
                .validate_min_checkout_items_quantity(quantity + extra)
                .is_ok());
        }
        prop_assert_eq!(
            voucher.validate_min_checkout_items_quantity(quantity).is_ok(),
            quantity >= min
        );
    }
}

// Property: order totals are idempotent and never negative
proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn recalculation_is_idempotent_and_non_negative(
        prices in prop::collection::vec((1i64..50_000, 1i32..6), 1..4),
        shipping in 0i64..5_000,
        discount_type in value_type_strategy(),
        discount_value in 0i64..200_000,
    ) {
        runtime().block_on(async {
            let app = TestApp::new();
            let order = app.draft_order(Decimal::new(shipping, 2)).await;
            let mut tx = app.begin().await;
            for (cents, quantity) in &prices {
                app.service
                    .add_variant_to_order(&mut tx, order.id, variant(Decimal::new(*cents, 2), false), *quantity, None)
                    .await
                    .unwrap();
            }
            let value = match discount_type {
                DiscountValueType::Percentage => Decimal::new(discount_value % 10_001, 2),
                DiscountValueType::Fixed => Decimal::new(discount_value, 2),
            };
            app.service
                .create_order_discount(
                    &mut tx,
                    order.id,
                    DiscountInput { value_type: discount_type, value, reason: None, name: None },
                    None,
                )
                .await
                .unwrap();

            let first = app
                .service
                .recalculate_order(&mut tx, order.id, RecalculateOptions::default())
                .await
                .unwrap();
            let second = app
                .service
                .recalculate_order(&mut tx, order.id, RecalculateOptions::default())
                .await
                .unwrap();
            assert_eq!(first, second);
            assert!(!second.total.gross.is_negative());
            assert!(!second.total.net.is_negative());
            assert!(second.discount_amount.amount <= second.undiscounted_total.gross.amount);
        });
    }
}

// Property: stock bookkeeping is conserved across fulfill and cancel
proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn fulfill_then_cancel_conserves_stock(on_hand in 1i32..50, ordered in 1i32..50, shipped in 1i32..50) {
        let ordered = ordered.min(on_hand);
        let shipped = shipped.min(ordered);
        runtime().block_on(async {
            let app = TestApp::new();
            let item = variant(Decimal::new(1999, 2), true);
            let variant_id = item.variant_id;
            app.seed_stock(variant_id, on_hand).await;
            let (order, lines) = app.placed_order(vec![(item, ordered)]).await;

            let mut tx = app.begin().await;
            let fulfillments = app
                .service
                .create_fulfillments(
                    &mut tx,
                    CreateFulfillmentsInput {
                        order_id: order.id,
                        lines_for_warehouses: vec![WarehouseLines {
                            warehouse_id: app.warehouse_id,
                            lines: vec![FulfillmentLineInput { order_line_id: lines[0].id, quantity: shipped }],
                        }],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            app.service.commit(tx).await.unwrap();

            let stock = app.stock(variant_id).await;
            assert_eq!(stock.quantity, on_hand - shipped);
            assert_eq!(stock.quantity_allocated, ordered - shipped);
            assert!(stock.quantity_allocated <= stock.quantity);

            let mut tx = app.begin().await;
            app.service
                .cancel_fulfillment(&mut tx, fulfillments[0].id, None, None)
                .await
                .unwrap();
            app.service.commit(tx).await.unwrap();

            let stock = app.stock(variant_id).await;
            assert_eq!(stock.quantity, on_hand);
            assert_eq!(stock.quantity_allocated, ordered);
        });
    }

    #[test]
    fn exceeding_stock_then_cancel_conserves_stock(on_hand in 1i32..30, ordered in 1i32..30, shipped in 1i32..60) {
        let ordered = ordered.min(on_hand);
        runtime().block_on(async {
            let app = TestApp::new();
            let item = variant(Decimal::new(1250, 2), true);
            let variant_id = item.variant_id;
            app.seed_stock(variant_id, on_hand).await;
            let (order, lines) = app.placed_order(vec![(item, ordered)]).await;

            let mut tx = app.begin().await;
            let fulfillments = app
                .service
                .create_fulfillments(
                    &mut tx,
                    CreateFulfillmentsInput {
                        order_id: order.id,
                        lines_for_warehouses: vec![WarehouseLines {
                            warehouse_id: app.warehouse_id,
                            lines: vec![FulfillmentLineInput { order_line_id: lines[0].id, quantity: shipped }],
                        }],
                        allow_stock_to_be_exceeded: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            app.service.commit(tx).await.unwrap();

            let stock = app.stock(variant_id).await;
            assert_eq!(stock.quantity, (on_hand - shipped).max(0));
            assert_eq!(fulfillments[0].lines[0].quantity_from_stock, shipped.min(on_hand));

            let mut tx = app.begin().await;
            app.service
                .cancel_fulfillment(&mut tx, fulfillments[0].id, None, None)
                .await
                .unwrap();
            app.service.commit(tx).await.unwrap();

            let stock = app.stock(variant_id).await;
            assert_eq!(stock.quantity, on_hand);
            assert!(stock.quantity_allocated <= stock.quantity);
        });
    }

    #[test]
    fn allocation_never_exceeds_stock(on_hand in 0i32..30, requests in prop::collection::vec(1i32..15, 1..6)) {
        runtime().block_on(async {
            let app = TestApp::new();
            let item = variant(Decimal::new(500, 2), true);
            let variant_id = item.variant_id;
            app.seed_stock(variant_id, on_hand).await;
            let order = app.draft_order(Decimal::ZERO).await;

            let mut tx = app.begin().await;
            let line = app
                .service
                .add_variant_to_order(&mut tx, order.id, item, 100, None)
                .await
                .unwrap();
            let mut granted = 0;
            for quantity in requests {
                if app.service.stock().allocate_stocks(&mut tx, &line, quantity).await.is_ok() {
                    granted += quantity;
                }
            }
            app.service.commit(tx).await.unwrap();

            let stock = app.stock(variant_id).await;
            assert_eq!(stock.quantity_allocated, granted);
            assert!(stock.quantity_allocated <= stock.quantity);
        });
    }
}

