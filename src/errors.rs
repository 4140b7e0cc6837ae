use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::money::{Money, MoneyError};
use crate::repositories::StoreError;

/// A discount or voucher cannot be applied to the order in its current
/// state. Recoverable; shown to the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct NotApplicable {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_spent: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_checkout_items_quantity: Option<i32>,
}

impl NotApplicable {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            min_spent: None,
            min_checkout_items_quantity: None,
        }
    }

    pub fn min_spent(min_spent: Money) -> Self {
        Self {
            message: format!(
                "This offer is only valid for orders over {}",
                min_spent.amount
            ),
            min_spent: Some(min_spent),
            min_checkout_items_quantity: None,
        }
    }

    pub fn min_checkout_items_quantity(min: i32) -> Self {
        Self {
            message: format!(
                "This offer is only valid for orders with minimum of {} items",
                min
            ),
            min_spent: None,
            min_checkout_items_quantity: Some(min),
        }
    }
}

/// One line that could not be fulfilled or allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientStockItem {
    pub order_line_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("Insufficient stock for {} line(s)", .items.len())]
pub struct InsufficientStock {
    pub items: Vec<InsufficientStockItem>,
}

impl InsufficientStock {
    pub fn references_line(&self, order_line_id: Uuid) -> bool {
        self.items
            .iter()
            .any(|item| item.order_line_id == Some(order_line_id))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error(transparent)]
    NotApplicable(#[from] NotApplicable),

    #[error(transparent)]
    InsufficientStock(#[from] InsufficientStock),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Money error: {0}")]
    Money(MoneyError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MoneyError> for OrderError {
    fn from(error: MoneyError) -> Self {
        match error {
            MoneyError::Overflow(_) => OrderError::Validation(error.to_string()),
            other => OrderError::Money(other),
        }
    }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(errors: validator::ValidationErrors) -> Self {
        OrderError::Validation(errors.to_string())
    }
}

impl OrderError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrderError::NotApplicable(_) | OrderError::Validation(_) => StatusCode::BAD_REQUEST,
            OrderError::InsufficientStock(_) | OrderError::InvalidState(_) => StatusCode::CONFLICT,
            OrderError::NotFound(_) => StatusCode::NOT_FOUND,
            OrderError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            OrderError::Store(StoreError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            OrderError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            OrderError::Store(StoreError::Internal(_))
            | OrderError::Money(_)
            | OrderError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_applicable(&self) -> bool {
        matches!(self, OrderError::NotApplicable(_))
    }
}

/// Body returned by the API layer for a failed order operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category, e.g. "Bad Request"
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    pub message: String,
    /// Input field the error is attributed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

impl From<&OrderError> for ErrorResponse {
    fn from(error: &OrderError) -> Self {
        let status = error.status_code();
        let (code, message, field, details) = match error {
            OrderError::NotApplicable(err) => (
                "voucher_not_applicable",
                err.message.clone(),
                Some("voucher"),
                Some(json!({
                    "min_spent": err.min_spent,
                    "min_checkout_items_quantity": err.min_checkout_items_quantity,
                })),
            ),
            OrderError::InsufficientStock(err) => (
                "insufficient_stock",
                err.to_string(),
                Some("lines"),
                Some(json!({ "items": err.items })),
            ),
            OrderError::Validation(msg) => ("validation_error", msg.clone(), None, None),
            OrderError::NotFound(msg) => ("not_found", msg.clone(), None, None),
            OrderError::InvalidState(_) => (
                "invalid_state",
                "The operation is not allowed in the current state".to_string(),
                None,
                None,
            ),
            OrderError::Store(StoreError::NotFound { .. }) => (
                "not_found",
                "The requested resource was not found".to_string(),
                None,
                None,
            ),
            _ => (
                "internal_error",
                "An internal error occurred".to_string(),
                None,
                None,
            ),
        };
        Self {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: code.to_string(),
            message,
            field: field.map(str::to_string),
            details,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
