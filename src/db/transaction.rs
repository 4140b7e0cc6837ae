/*!
 * Scoped transaction guard
 *
 * A use case opens a [`Transaction`] at the top, threads `&mut Transaction`
 * through every service call, and ends it with [`Transaction::commit`] or
 * [`Transaction::rollback`]. A transaction that goes out of scope unfinished
 * is rolled back. Notifications for the plugin manager are queued with
 * [`Transaction::defer`] and handed back only after a successful commit.
 */

use tracing::{debug, warn};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::events::OrderNotification;
use crate::repositories::{
    FulfillmentRepository, OrderEventRepository, OrderRepository, PaymentRepository,
    SaleRepository, StockRepository, StoreError, VoucherRepository,
};

pub struct Transaction {
    id: Uuid,
    unit: Box<dyn UnitOfWork>,
    deferred: Vec<OrderNotification>,
    finished: bool,
}

impl Transaction {
    pub async fn begin(store: &dyn Store) -> Result<Self, StoreError> {
        let unit = store.begin_unit().await?;
        let id = Uuid::new_v4();
        debug!(transaction_id = %id, "transaction started");
        Ok(Self {
            id,
            unit,
            deferred: Vec::new(),
            finished: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn orders(&mut self) -> &mut dyn OrderRepository {
        self.unit.orders()
    }

    pub fn stocks(&mut self) -> &mut dyn StockRepository {
        self.unit.stocks()
    }

    pub fn fulfillments(&mut self) -> &mut dyn FulfillmentRepository {
        self.unit.fulfillments()
    }

    pub fn order_events(&mut self) -> &mut dyn OrderEventRepository {
        self.unit.order_events()
    }

    pub fn vouchers(&mut self) -> &mut dyn VoucherRepository {
        self.unit.vouchers()
    }

    pub fn sales(&mut self) -> &mut dyn SaleRepository {
        self.unit.sales()
    }

    pub fn payments(&mut self) -> &mut dyn PaymentRepository {
        self.unit.payments()
    }

    /// Queues a notification to be sent once the transaction commits.
    pub fn defer(&mut self, notification: OrderNotification) {
        self.deferred.push(notification);
    }

    pub fn deferred(&self) -> &[OrderNotification] {
        &self.deferred
    }

    /// Commits and returns the queued notifications in the order they were
    /// deferred.
    pub async fn commit(mut self) -> Result<Vec<OrderNotification>, StoreError> {
        self.unit.commit().await?;
        self.finished = true;
        debug!(transaction_id = %self.id, "transaction committed");
        Ok(std::mem::take(&mut self.deferred))
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.unit.rollback().await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                transaction_id = %self.id,
                discarded_notifications = self.deferred.len(),
                "transaction dropped without commit, rolled back"
            );
        }
    }
}
