use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentStatus {
    Fulfilled,
    Refunded,
    Returned,
    RefundedAndReturned,
    Replaced,
    Canceled,
    WaitingForApproval,
}

impl FulfillmentStatus {
    /// Fulfillments in these statuses no longer block canceling the order.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            FulfillmentStatus::Canceled
                | FulfillmentStatus::Refunded
                | FulfillmentStatus::Returned
                | FulfillmentStatus::RefundedAndReturned
                | FulfillmentStatus::Replaced
        )
    }

    pub fn counts_as_returned(&self) -> bool {
        matches!(
            self,
            FulfillmentStatus::Returned | FulfillmentStatus::RefundedAndReturned
        )
    }
}

/// A shipment of order-line quantities out of one warehouse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub id: Uuid,
    pub order_id: Uuid,
    /// 1-based sequence number within the order.
    pub fulfillment_order: i32,
    pub status: FulfillmentStatus,
    pub tracking_number: String,
    pub lines: Vec<FulfillmentLine>,
    pub created_at: DateTime<Utc>,
}

impl Fulfillment {
    pub fn new(order_id: Uuid, fulfillment_order: i32, status: FulfillmentStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            fulfillment_order,
            status,
            tracking_number: String::new(),
            lines: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn total_quantity(&self) -> i32 {
        self.lines.iter().map(|line| line.quantity).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentLine {
    pub id: Uuid,
    pub order_line_id: Uuid,
    pub quantity: i32,
    /// Stock row the quantity was taken from; `None` for lines that do not
    /// track inventory.
    pub stock_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    /// Part of `quantity` that actually left the stock row. Lower than
    /// `quantity` when stock was allowed to be exceeded, zero while waiting
    /// for approval. Restocking never puts back more than this.
    #[serde(default)]
    pub quantity_from_stock: i32,
}

impl FulfillmentLine {
    pub fn new(order_line_id: Uuid, quantity: i32, stock_id: Option<Uuid>, warehouse_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_line_id,
            quantity,
            stock_id,
            warehouse_id,
            quantity_from_stock: 0,
        }
    }
}
