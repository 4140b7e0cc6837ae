//! Unit-of-work abstraction over the storage layer.

use async_trait::async_trait;

use crate::repositories::{
    FulfillmentRepository, OrderEventRepository, OrderRepository, PaymentRepository,
    SaleRepository, StockRepository, StoreError, VoucherRepository,
};

pub mod transaction;

pub use transaction::Transaction;

/// One storage transaction. Implementations discard uncommitted work when
/// dropped and must lock the stock and fulfillment rows they hand out until
/// they finish.
#[async_trait]
pub trait UnitOfWork: Send {
    fn orders(&mut self) -> &mut dyn OrderRepository;
    fn stocks(&mut self) -> &mut dyn StockRepository;
    fn fulfillments(&mut self) -> &mut dyn FulfillmentRepository;
    fn order_events(&mut self) -> &mut dyn OrderEventRepository;
    fn vouchers(&mut self) -> &mut dyn VoucherRepository;
    fn sales(&mut self) -> &mut dyn SaleRepository;
    fn payments(&mut self) -> &mut dyn PaymentRepository;

    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin_unit(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}
