use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::db::Transaction;
use crate::errors::OrderError;
use crate::models::{OrderDiscount, OrderEvent, OrderEventOption, OrderEventType, OrderLine};

/// Appends an immutable event to the order's audit log.
pub async fn common_create_order_event(
    tx: &mut Transaction,
    option: OrderEventOption,
) -> Result<OrderEvent, OrderError> {
    if option.parameters.keys().any(|key| key.is_empty()) {
        return Err(OrderError::Validation(
            "order event parameter names must not be empty".to_string(),
        ));
    }

    let event = OrderEvent {
        id: Uuid::new_v4(),
        order_id: option.order_id,
        user_id: option.user_id,
        event_type: option.event_type,
        parameters: option.parameters,
        created_at: Utc::now(),
    };

    tx.order_events().save(&event).await.map_err(|e| {
        error!(order_id = %event.order_id, "Failed to save order event: {}", e);
        OrderError::from(e)
    })?;
    debug!(order_id = %event.order_id, event_type = %event.event_type, "order event recorded");
    Ok(event)
}

/// Event payload describing quantities per order line.
pub fn lines_per_quantity(lines: &[(i32, &OrderLine)]) -> Value {
    Value::Array(
        lines
            .iter()
            .map(|(quantity, line)| {
                json!({
                    "quantity": quantity,
                    "line_pk": line.id,
                    "item": format!("{} ({})", line.product_name, line.variant_name),
                })
            })
            .collect(),
    )
}

/// Event payload describing an order discount.
pub fn discount_parameters(discount: &OrderDiscount) -> Value {
    json!({
        "value": discount.value,
        "amount_value": discount.amount.amount,
        "currency": discount.amount.currency,
        "value_type": discount.value_type,
        "reason": discount.reason,
    })
}

pub async fn order_discount_event(
    tx: &mut Transaction,
    event_type: OrderEventType,
    user_id: Option<Uuid>,
    discount: &OrderDiscount,
    old_discount: Option<&OrderDiscount>,
) -> Result<OrderEvent, OrderError> {
    let mut payload = discount_parameters(discount);
    if let (Some(old), Some(map)) = (old_discount, payload.as_object_mut()) {
        map.insert("old_value".into(), json!(old.value));
        map.insert("old_value_type".into(), json!(old.value_type));
        map.insert("old_amount_value".into(), json!(old.amount.amount));
    }
    common_create_order_event(
        tx,
        OrderEventOption::new(discount.order_id, event_type)
            .by(user_id)
            .param("discount", payload),
    )
    .await
}
