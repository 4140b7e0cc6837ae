//! Order status derivation and the pure predicates gating payment and
//! cancel operations.

use chrono::Utc;
use tracing::{error, info, instrument};

use crate::db::Transaction;
use crate::errors::OrderError;
use crate::models::{Fulfillment, Order, OrderLine, OrderStatus, Payment};

/// Whether an explicit status change (confirm, cancel) is allowed.
pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    match (from, to) {
        (a, b) if a == b => false,
        (Canceled, _) => false,
        (_, Canceled) => true,
        (Draft, Unconfirmed | Unfulfilled) => true,
        (Unconfirmed, Unfulfilled) => true,
        (
            Unfulfilled | PartiallyFulfilled | Fulfilled | PartiallyReturned | Returned,
            Unfulfilled | PartiallyFulfilled | Fulfilled | PartiallyReturned | Returned,
        ) => true,
        _ => false,
    }
}

/// Derives the status from line quantities and fulfillments. The same
/// inputs always give the same status.
pub fn derive_order_status(
    current: OrderStatus,
    lines: &[OrderLine],
    fulfillments: &[Fulfillment],
) -> OrderStatus {
    if matches!(
        current,
        OrderStatus::Draft | OrderStatus::Unconfirmed | OrderStatus::Canceled
    ) {
        return current;
    }

    let total_quantity: i32 = lines.iter().map(|line| line.quantity).sum();
    if total_quantity == 0 {
        return current;
    }
    let quantity_fulfilled: i32 = lines.iter().map(|line| line.quantity_fulfilled).sum();
    let quantity_returned: i32 = fulfillments
        .iter()
        .filter(|fulfillment| fulfillment.status.counts_as_returned())
        .map(Fulfillment::total_quantity)
        .sum();

    if quantity_fulfilled <= 0 {
        OrderStatus::Unfulfilled
    } else if quantity_returned > 0 && quantity_returned < total_quantity {
        OrderStatus::PartiallyReturned
    } else if quantity_returned == total_quantity {
        OrderStatus::Returned
    } else if quantity_fulfilled < total_quantity {
        OrderStatus::PartiallyFulfilled
    } else {
        OrderStatus::Fulfilled
    }
}

/// Recomputes and persists the status of `order`.
#[instrument(skip(tx, order), fields(order_id = %order.id))]
pub async fn update_order_status(
    tx: &mut Transaction,
    order: &mut Order,
) -> Result<OrderStatus, OrderError> {
    let lines = tx.orders().lines(order.id).await?;
    let fulfillments = tx.fulfillments().for_order(order.id).await?;

    let status = derive_order_status(order.status, &lines, &fulfillments);
    if status != order.status {
        info!(from = %order.status, to = %status, "order status changed");
        order.status = status;
        order.updated_at = Utc::now();
        tx.orders().save(order).await.map_err(|e| {
            error!("Failed to save order status: {}", e);
            OrderError::from(e)
        })?;
    }
    Ok(status)
}

pub fn order_can_cancel(order: &Order, fulfillments: &[Fulfillment]) -> bool {
    fulfillments
        .iter()
        .all(|fulfillment| fulfillment.status.is_settled())
        && !matches!(order.status, OrderStatus::Canceled | OrderStatus::Draft)
}

pub fn order_can_capture(order: &Order, payment: Option<&Payment>) -> bool {
    payment.map_or(false, Payment::can_capture)
        && !matches!(order.status, OrderStatus::Draft | OrderStatus::Canceled)
}

pub fn order_can_void(_order: &Order, payment: Option<&Payment>) -> bool {
    payment.map_or(false, Payment::can_void)
}

pub fn order_can_refund(_order: &Order, payment: Option<&Payment>) -> bool {
    payment.map_or(false, Payment::can_refund)
}

pub fn clean_order_cancel(order: &Order, fulfillments: &[Fulfillment]) -> Result<(), OrderError> {
    if !order_can_cancel(order, fulfillments) {
        return Err(OrderError::InvalidState(format!(
            "Order {} cannot be canceled; its status is {} or it has active fulfillments",
            order.id, order.status
        )));
    }
    Ok(())
}

pub fn clean_order_capture(order: &Order, payment: Option<&Payment>) -> Result<(), OrderError> {
    if !order_can_capture(order, payment) {
        return Err(OrderError::InvalidState(format!(
            "Payment of order {} cannot be captured",
            order.id
        )));
    }
    Ok(())
}

pub fn clean_order_void(order: &Order, payment: Option<&Payment>) -> Result<(), OrderError> {
    if !order_can_void(order, payment) {
        return Err(OrderError::InvalidState(format!(
            "Payment of order {} cannot be voided",
            order.id
        )));
    }
    Ok(())
}

pub fn clean_order_refund(order: &Order, payment: Option<&Payment>) -> Result<(), OrderError> {
    if !order_can_refund(order, payment) {
        return Err(OrderError::InvalidState(format!(
            "Payment of order {} cannot be refunded",
            order.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChargeStatus, FulfillmentLine, FulfillmentStatus, PaymentTransaction, TransactionKind,
        VariantSnapshot,
    };
    use crate::money::{Currency, Money};
    use assert_matches::assert_matches;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn line(order_id: Uuid, quantity: i32, fulfilled: i32) -> OrderLine {
        let mut line = VariantSnapshot {
            variant_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            category_id: None,
            collection_ids: vec![],
            product_name: "Mug".into(),
            variant_name: "Blue".into(),
            sku: None,
            is_shipping_required: true,
            track_inventory: true,
            unit_price_net: Money::new(dec!(5), Currency::USD),
            tax_rate: dec!(0),
        }
        .into_line(order_id, quantity)
        .unwrap();
        line.quantity_fulfilled = fulfilled;
        line
    }

    fn fulfillment(order_id: Uuid, status: FulfillmentStatus, line: &OrderLine, qty: i32) -> Fulfillment {
        let mut f = Fulfillment::new(order_id, 1, status);
        f.lines.push(FulfillmentLine::new(line.id, qty, None, None));
        f
    }

    fn payment(order_id: Uuid, status: ChargeStatus, authorized: bool) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            order_id,
            is_active: true,
            charge_status: status,
            total: Money::new(dec!(10), Currency::USD),
            transactions: if authorized {
                vec![PaymentTransaction {
                    id: Uuid::new_v4(),
                    kind: TransactionKind::Auth,
                    is_success: true,
                    amount: Money::new(dec!(10), Currency::USD),
                    created_at: Utc::now(),
                }]
            } else {
                vec![]
            },
        }
    }

    #[rstest]
    #[case(5, 0, 0, OrderStatus::Unfulfilled)]
    #[case(5, 2, 0, OrderStatus::PartiallyFulfilled)]
    #[case(5, 5, 0, OrderStatus::Fulfilled)]
    #[case(5, 5, 2, OrderStatus::PartiallyReturned)]
    #[case(5, 5, 5, OrderStatus::Returned)]
    fn derives_status_from_quantities(
        #[case] quantity: i32,
        #[case] fulfilled: i32,
        #[case] returned: i32,
        #[case] expected: OrderStatus,
    ) {
        let order_id = Uuid::new_v4();
        let l = line(order_id, quantity, fulfilled);
        let fulfillments = if returned > 0 {
            vec![fulfillment(order_id, FulfillmentStatus::Returned, &l, returned)]
        } else {
            vec![]
        };
        assert_eq!(
            derive_order_status(OrderStatus::Unfulfilled, &[l], &fulfillments),
            expected
        );
    }

    #[rstest]
    #[case(OrderStatus::Draft)]
    #[case(OrderStatus::Unconfirmed)]
    #[case(OrderStatus::Canceled)]
    fn explicit_statuses_are_kept(#[case] status: OrderStatus) {
        let order_id = Uuid::new_v4();
        let l = line(order_id, 2, 2);
        assert_eq!(derive_order_status(status, &[l], &[]), status);
    }

    #[test]
    fn empty_order_keeps_status() {
        assert_eq!(
            derive_order_status(OrderStatus::PartiallyFulfilled, &[], &[]),
            OrderStatus::PartiallyFulfilled
        );
    }

    #[test]
    fn cancel_blocked_by_active_fulfillment() {
        let order = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::PartiallyFulfilled);
        let l = line(order.id, 2, 1);
        let active = fulfillment(order.id, FulfillmentStatus::Fulfilled, &l, 1);
        assert!(!order_can_cancel(&order, &[active.clone()]));
        assert_matches!(
            clean_order_cancel(&order, &[active]),
            Err(OrderError::InvalidState(_))
        );

        let canceled = fulfillment(order.id, FulfillmentStatus::Canceled, &l, 1);
        assert!(order_can_cancel(&order, &[canceled]));

        let draft = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Draft);
        assert!(!order_can_cancel(&draft, &[]));
    }

    #[test]
    fn payment_predicates() {
        let order = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Unfulfilled);
        let authorized = payment(order.id, ChargeStatus::NotCharged, true);
        let charged = payment(order.id, ChargeStatus::FullyCharged, true);

        assert!(order_can_capture(&order, Some(&authorized)));
        assert!(!order_can_capture(&order, Some(&charged)));
        assert!(!order_can_capture(&order, None));
        assert!(order_can_void(&order, Some(&authorized)));
        assert!(!order_can_void(&order, Some(&payment(order.id, ChargeStatus::NotCharged, false))));
        assert!(order_can_refund(&order, Some(&charged)));
        assert!(!order_can_refund(&order, Some(&authorized)));

        let draft = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Draft);
        assert!(!order_can_capture(&draft, Some(&authorized)));
        assert_matches!(
            clean_order_capture(&draft, Some(&authorized)),
            Err(OrderError::InvalidState(_))
        );
    }

    #[rstest]
    #[case(OrderStatus::Draft, OrderStatus::Unconfirmed, true)]
    #[case(OrderStatus::Unconfirmed, OrderStatus::Unfulfilled, true)]
    #[case(OrderStatus::Unfulfilled, OrderStatus::Canceled, true)]
    #[case(OrderStatus::Canceled, OrderStatus::Unfulfilled, false)]
    #[case(OrderStatus::Canceled, OrderStatus::Canceled, false)]
    #[case(OrderStatus::Fulfilled, OrderStatus::Draft, false)]
    fn transitions(#[case] from: OrderStatus, #[case] to: OrderStatus, #[case] allowed: bool) {
        assert_eq!(can_transition(from, to), allowed);
    }
}
