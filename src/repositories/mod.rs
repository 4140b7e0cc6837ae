//! Storage seams consumed by the services. Every method runs inside the
//! unit of work that handed out the repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Allocation, Fulfillment, Order, OrderDiscount, OrderEvent, OrderFilterOptions, OrderLine,
    Payment, Sale, Stock, Voucher,
};

pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait OrderRepository: Send {
    async fn get(&mut self, id: Uuid) -> Result<Order, StoreError>;
    /// Inserts or updates. The currency of an existing order cannot change.
    async fn save(&mut self, order: &Order) -> Result<(), StoreError>;
    async fn filter_by_options(
        &mut self,
        options: &OrderFilterOptions,
    ) -> Result<Vec<Order>, StoreError>;

    /// Lines of an order in insertion order.
    async fn lines(&mut self, order_id: Uuid) -> Result<Vec<OrderLine>, StoreError>;
    async fn line(&mut self, id: Uuid) -> Result<OrderLine, StoreError>;
    async fn save_line(&mut self, line: &OrderLine) -> Result<(), StoreError>;
    async fn delete_line(&mut self, id: Uuid) -> Result<(), StoreError>;

    async fn discounts(&mut self, order_id: Uuid) -> Result<Vec<OrderDiscount>, StoreError>;
    async fn discount(&mut self, id: Uuid) -> Result<OrderDiscount, StoreError>;
    async fn save_discount(&mut self, discount: &OrderDiscount) -> Result<(), StoreError>;
    async fn delete_discount(&mut self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StockRepository: Send {
    /// Reads a stock row; the unit of work holds it locked until it ends.
    async fn get_for_update(
        &mut self,
        variant_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<Option<Stock>, StoreError>;
    async fn get(&mut self, id: Uuid) -> Result<Stock, StoreError>;
    /// Stock rows of a variant ordered by warehouse id.
    async fn for_variant(&mut self, variant_id: Uuid) -> Result<Vec<Stock>, StoreError>;
    async fn save(&mut self, stock: &Stock) -> Result<(), StoreError>;
    /// Subtracts `quantity`, flooring at zero, and returns the updated row.
    async fn decrement_for_variant_and_warehouse(
        &mut self,
        variant_id: Uuid,
        warehouse_id: Uuid,
        quantity: i32,
    ) -> Result<Stock, StoreError>;

    async fn allocations_for_lines(
        &mut self,
        order_line_ids: &[Uuid],
    ) -> Result<Vec<Allocation>, StoreError>;
    async fn allocations_for_stock(&mut self, stock_id: Uuid)
        -> Result<Vec<Allocation>, StoreError>;
    async fn save_allocation(&mut self, allocation: &Allocation) -> Result<(), StoreError>;
    async fn delete_allocation(&mut self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FulfillmentRepository: Send {
    /// Reads a fulfillment; the unit of work holds it locked until it ends.
    async fn get_for_update(&mut self, id: Uuid) -> Result<Fulfillment, StoreError>;
    /// Fulfillments of an order ordered by `fulfillment_order`.
    async fn for_order(&mut self, order_id: Uuid) -> Result<Vec<Fulfillment>, StoreError>;
    async fn save(&mut self, fulfillment: &Fulfillment) -> Result<(), StoreError>;
    async fn delete(&mut self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OrderEventRepository: Send {
    /// Appends an event. Existing events are never replaced.
    async fn save(&mut self, event: &OrderEvent) -> Result<(), StoreError>;
    async fn for_order(&mut self, order_id: Uuid) -> Result<Vec<OrderEvent>, StoreError>;
}

#[async_trait]
pub trait VoucherRepository: Send {
    async fn get(&mut self, id: Uuid) -> Result<Voucher, StoreError>;
    async fn get_by_code(&mut self, code: &str) -> Result<Voucher, StoreError>;
    async fn save(&mut self, voucher: &Voucher) -> Result<(), StoreError>;
    async fn customer_usage_exists(
        &mut self,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<bool, StoreError>;
    async fn add_customer_usage(
        &mut self,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<(), StoreError>;
    async fn remove_customer_usage(
        &mut self,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SaleRepository: Send {
    async fn get(&mut self, id: Uuid) -> Result<Sale, StoreError>;
    async fn save(&mut self, sale: &Sale) -> Result<(), StoreError>;
    /// Sales running at `at`.
    async fn active(&mut self, at: DateTime<Utc>) -> Result<Vec<Sale>, StoreError>;
}

/// Read-only access to the payment ledger.
#[async_trait]
pub trait PaymentRepository: Send {
    async fn for_order(&mut self, order_id: Uuid) -> Result<Vec<Payment>, StoreError>;
}
