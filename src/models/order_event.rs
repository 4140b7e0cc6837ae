use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::errors::OrderError;

/// Closed set of audit event kinds.
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
pub enum OrderEventType {
    Confirmed,
    DraftCreated,
    DraftCreatedFromReplace,
    AddedProducts,
    RemovedProducts,
    Placed,
    PlacedFromDraft,
    OversoldItems,
    Canceled,
    OrderMarkedAsPaid,
    OrderFullyPaid,
    OrderReplacementCreated,
    OrderDiscountAdded,
    OrderDiscountAutomaticallyUpdated,
    OrderDiscountUpdated,
    OrderDiscountDeleted,
    OrderLineDiscountUpdated,
    OrderLineDiscountRemoved,
    UpdatedAddress,
    EmailSent,
    PaymentAuthorized,
    PaymentCaptured,
    PaymentRefunded,
    PaymentVoided,
    PaymentFailed,
    ExternalServiceNotification,
    InvoiceRequested,
    InvoiceGenerated,
    InvoiceUpdated,
    InvoiceSent,
    FulfillmentCanceled,
    FulfillmentRestockedItems,
    FulfillmentFulfilledItems,
    FulfillmentRefunded,
    FulfillmentReturned,
    FulfillmentReplaced,
    FulfillmentAwaitsApproval,
    TrackingUpdated,
    NoteAdded,
    Other,
}

impl OrderEventType {
    /// Parses a stored event name, rejecting anything outside the known set.
    pub fn parse(name: &str) -> Result<Self, OrderError> {
        Self::from_str(name)
            .map_err(|_| OrderError::Validation(format!("Unknown order event type: {}", name)))
    }
}

/// Immutable audit record. Parameters hold event-specific payload whose
/// shape is implied by `event_type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: OrderEventType,
    pub parameters: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending an event.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderEventOption {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: OrderEventType,
    pub parameters: Map<String, Value>,
}

impl OrderEventOption {
    pub fn new(order_id: Uuid, event_type: OrderEventType) -> Self {
        Self {
            order_id,
            user_id: None,
            event_type,
            parameters: Map::new(),
        }
    }

    pub fn by(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}
