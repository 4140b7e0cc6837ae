use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::money::{Currency, Money, TaxedMoney};

/// Lifecycle status of an order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    /// Staff-built order that has not been placed.
    Draft,
    /// Placed but waiting for staff confirmation.
    Unconfirmed,
    Unfulfilled,
    PartiallyFulfilled,
    PartiallyReturned,
    Returned,
    Fulfilled,
    Canceled,
}

impl OrderStatus {
    /// Statuses in which lines and discounts may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, OrderStatus::Draft | OrderStatus::Unconfirmed)
    }

    /// Statuses in which fulfillments may be created.
    pub fn accepts_fulfillments(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Draft | OrderStatus::Unconfirmed | OrderStatus::Canceled
        )
    }
}

/// Order aggregate root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,

    /// Customer account, absent for guest checkouts.
    pub user_id: Option<Uuid>,

    pub user_email: Option<String>,

    /// Sales channel the order was placed in.
    pub channel_id: Uuid,

    /// Fixed at creation; the store rejects later changes.
    pub currency: Currency,

    pub status: OrderStatus,

    pub voucher_id: Option<Uuid>,

    pub shipping_method_id: Option<Uuid>,

    /// ISO country code of the shipping address.
    pub shipping_country: Option<String>,

    pub billing_address_id: Option<Uuid>,

    pub shipping_address_id: Option<Uuid>,

    pub shipping_price: TaxedMoney,

    /// Sum of line totals after line-level discounts.
    pub subtotal: TaxedMoney,

    /// Subtotal plus shipping before any discount.
    pub undiscounted_total: TaxedMoney,

    /// Order-level discount applied to the total.
    pub discount_amount: Money,

    pub total: TaxedMoney,

    /// Captured minus refunded, derived from the payment ledger.
    pub total_paid: Money,

    pub customer_note: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(channel_id: Uuid, currency: Currency, status: OrderStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            user_email: None,
            channel_id,
            currency,
            status,
            voucher_id: None,
            shipping_method_id: None,
            shipping_country: None,
            billing_address_id: None,
            shipping_address_id: None,
            shipping_price: TaxedMoney::zero(currency),
            subtotal: TaxedMoney::zero(currency),
            undiscounted_total: TaxedMoney::zero(currency),
            discount_amount: Money::zero(currency),
            total: TaxedMoney::zero(currency),
            total_paid: Money::zero(currency),
            customer_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == OrderStatus::Draft
    }

    pub fn is_fully_paid(&self) -> bool {
        self.total_paid.amount >= self.total.gross.amount
    }

    /// Email used for per-customer voucher bookkeeping.
    pub fn customer_email(&self) -> Option<&str> {
        self.user_email.as_deref().filter(|email| !email.is_empty())
    }
}

/// Filter for [`crate::repositories::OrderRepository::filter_by_options`].
#[derive(Clone, Debug, Default)]
pub struct OrderFilterOptions {
    pub statuses: Option<Vec<OrderStatus>>,
    pub user_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub voucher_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
}

impl OrderFilterOptions {
    pub fn matches(&self, order: &Order) -> bool {
        self.statuses
            .as_ref()
            .map_or(true, |statuses| statuses.contains(&order.status))
            && self.user_id.map_or(true, |id| order.user_id == Some(id))
            && self.channel_id.map_or(true, |id| order.channel_id == id)
            && self.voucher_id.map_or(true, |id| order.voucher_id == Some(id))
            && self
                .created_after
                .map_or(true, |after| order.created_at > after)
    }
}
