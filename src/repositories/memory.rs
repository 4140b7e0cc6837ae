//! In-memory [`Store`] used by tests and embedders without a database.
//!
//! A unit of work takes an owned lock on the whole data set for its lifetime,
//! which serialises stock checks the way a row lock would, and works on a
//! staged copy that is published on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    FulfillmentRepository, OrderEventRepository, OrderRepository, PaymentRepository,
    SaleRepository, StockRepository, StoreError, VoucherRepository,
};
use crate::db::{Store, UnitOfWork};
use crate::models::{
    Allocation, Fulfillment, Order, OrderDiscount, OrderEvent, OrderFilterOptions, OrderLine,
    Payment, Sale, Stock, Voucher, VoucherCustomer,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    orders: OrderTable,
    stocks: StockTable,
    fulfillments: FulfillmentTable,
    events: EventTable,
    vouchers: VoucherTable,
    sales: SaleTable,
    payments: PaymentTable,
}

#[derive(Debug, Clone, Default)]
struct OrderTable {
    orders: HashMap<Uuid, Order>,
    lines: Vec<OrderLine>,
    discounts: Vec<OrderDiscount>,
}

#[derive(Debug, Clone, Default)]
struct StockTable {
    stocks: Vec<Stock>,
    allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, Default)]
struct FulfillmentTable {
    fulfillments: Vec<Fulfillment>,
}

#[derive(Debug, Clone, Default)]
struct EventTable {
    events: Vec<OrderEvent>,
}

#[derive(Debug, Clone, Default)]
struct VoucherTable {
    vouchers: HashMap<Uuid, Voucher>,
    customers: Vec<VoucherCustomer>,
}

#[derive(Debug, Clone, Default)]
struct SaleTable {
    sales: HashMap<Uuid, Sale>,
}

#[derive(Debug, Clone, Default)]
struct PaymentTable {
    payments: Vec<Payment>,
}

/// Replaces the element matching `same` or appends `item`.
fn upsert<T: Clone>(items: &mut Vec<T>, item: &T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a payment. The order core only reads payments, so they are
    /// written outside of a unit of work.
    pub async fn insert_payment(&self, payment: Payment) {
        let mut tables = self.tables.lock().await;
        let id = payment.id;
        upsert(&mut tables.payments.payments, &payment, |p| p.id == id);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin_unit(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, staged }))
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn orders(&mut self) -> &mut dyn OrderRepository {
        &mut self.staged.orders
    }

    fn stocks(&mut self) -> &mut dyn StockRepository {
        &mut self.staged.stocks
    }

    fn fulfillments(&mut self) -> &mut dyn FulfillmentRepository {
        &mut self.staged.fulfillments
    }

    fn order_events(&mut self) -> &mut dyn OrderEventRepository {
        &mut self.staged.events
    }

    fn vouchers(&mut self) -> &mut dyn VoucherRepository {
        &mut self.staged.vouchers
    }

    fn sales(&mut self) -> &mut dyn SaleRepository {
        &mut self.staged.sales
    }

    fn payments(&mut self) -> &mut dyn PaymentRepository {
        &mut self.staged.payments
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        *self.guard = self.staged.clone();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged = self.guard.clone();
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for OrderTable {
    async fn get(&mut self, id: Uuid) -> Result<Order, StoreError> {
        self.orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Order", id))
    }

    async fn save(&mut self, order: &Order) -> Result<(), StoreError> {
        if let Some(existing) = self.orders.get(&order.id) {
            if existing.currency != order.currency {
                return Err(StoreError::InvalidInput(format!(
                    "order {} currency cannot change from {} to {}",
                    order.id, existing.currency, order.currency
                )));
            }
        }
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn filter_by_options(
        &mut self,
        options: &OrderFilterOptions,
    ) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .values()
            .filter(|order| options.matches(order))
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }

    async fn lines(&mut self, order_id: Uuid) -> Result<Vec<OrderLine>, StoreError> {
        Ok(self
            .lines
            .iter()
            .filter(|line| line.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn line(&mut self, id: Uuid) -> Result<OrderLine, StoreError> {
        self.lines
            .iter()
            .find(|line| line.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("OrderLine", id))
    }

    async fn save_line(&mut self, line: &OrderLine) -> Result<(), StoreError> {
        if !self.orders.contains_key(&line.order_id) {
            return Err(StoreError::not_found("Order", line.order_id));
        }
        upsert(&mut self.lines, line, |l| l.id == line.id);
        Ok(())
    }

    async fn delete_line(&mut self, id: Uuid) -> Result<(), StoreError> {
        let before = self.lines.len();
        self.lines.retain(|line| line.id != id);
        if self.lines.len() == before {
            return Err(StoreError::not_found("OrderLine", id));
        }
        Ok(())
    }

    async fn discounts(&mut self, order_id: Uuid) -> Result<Vec<OrderDiscount>, StoreError> {
        Ok(self
            .discounts
            .iter()
            .filter(|discount| discount.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn discount(&mut self, id: Uuid) -> Result<OrderDiscount, StoreError> {
        self.discounts
            .iter()
            .find(|discount| discount.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("OrderDiscount", id))
    }

    async fn save_discount(&mut self, discount: &OrderDiscount) -> Result<(), StoreError> {
        upsert(&mut self.discounts, discount, |d| d.id == discount.id);
        Ok(())
    }

    async fn delete_discount(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.discounts.retain(|discount| discount.id != id);
        Ok(())
    }
}

#[async_trait]
impl StockRepository for StockTable {
    async fn get_for_update(
        &mut self,
        variant_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<Option<Stock>, StoreError> {
        Ok(self
            .stocks
            .iter()
            .find(|stock| stock.variant_id == variant_id && stock.warehouse_id == warehouse_id)
            .cloned())
    }

    async fn get(&mut self, id: Uuid) -> Result<Stock, StoreError> {
        self.stocks
            .iter()
            .find(|stock| stock.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Stock", id))
    }

    async fn for_variant(&mut self, variant_id: Uuid) -> Result<Vec<Stock>, StoreError> {
        let mut stocks: Vec<Stock> = self
            .stocks
            .iter()
            .filter(|stock| stock.variant_id == variant_id)
            .cloned()
            .collect();
        stocks.sort_by_key(|stock| stock.warehouse_id);
        Ok(stocks)
    }

    async fn save(&mut self, stock: &Stock) -> Result<(), StoreError> {
        let duplicate = self.stocks.iter().any(|existing| {
            existing.id != stock.id
                && existing.variant_id == stock.variant_id
                && existing.warehouse_id == stock.warehouse_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "stock for variant {} in warehouse {} already exists",
                stock.variant_id, stock.warehouse_id
            )));
        }
        upsert(&mut self.stocks, stock, |s| s.id == stock.id);
        Ok(())
    }

    async fn decrement_for_variant_and_warehouse(
        &mut self,
        variant_id: Uuid,
        warehouse_id: Uuid,
        quantity: i32,
    ) -> Result<Stock, StoreError> {
        let stock = self
            .stocks
            .iter_mut()
            .find(|stock| stock.variant_id == variant_id && stock.warehouse_id == warehouse_id)
            .ok_or_else(|| {
                StoreError::not_found("Stock", format!("{}@{}", variant_id, warehouse_id))
            })?;
        stock.quantity = (stock.quantity - quantity).max(0);
        Ok(stock.clone())
    }

    async fn allocations_for_lines(
        &mut self,
        order_line_ids: &[Uuid],
    ) -> Result<Vec<Allocation>, StoreError> {
        Ok(self
            .allocations
            .iter()
            .filter(|allocation| order_line_ids.contains(&allocation.order_line_id))
            .cloned()
            .collect())
    }

    async fn allocations_for_stock(
        &mut self,
        stock_id: Uuid,
    ) -> Result<Vec<Allocation>, StoreError> {
        Ok(self
            .allocations
            .iter()
            .filter(|allocation| allocation.stock_id == stock_id)
            .cloned()
            .collect())
    }

    async fn save_allocation(&mut self, allocation: &Allocation) -> Result<(), StoreError> {
        upsert(&mut self.allocations, allocation, |a| a.id == allocation.id);
        Ok(())
    }

    async fn delete_allocation(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.allocations.retain(|allocation| allocation.id != id);
        Ok(())
    }
}

#[async_trait]
impl FulfillmentRepository for FulfillmentTable {
    async fn get_for_update(&mut self, id: Uuid) -> Result<Fulfillment, StoreError> {
        self.fulfillments
            .iter()
            .find(|fulfillment| fulfillment.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Fulfillment", id))
    }

    async fn for_order(&mut self, order_id: Uuid) -> Result<Vec<Fulfillment>, StoreError> {
        let mut fulfillments: Vec<Fulfillment> = self
            .fulfillments
            .iter()
            .filter(|fulfillment| fulfillment.order_id == order_id)
            .cloned()
            .collect();
        fulfillments.sort_by_key(|fulfillment| fulfillment.fulfillment_order);
        Ok(fulfillments)
    }

    async fn save(&mut self, fulfillment: &Fulfillment) -> Result<(), StoreError> {
        upsert(&mut self.fulfillments, fulfillment, |f| f.id == fulfillment.id);
        Ok(())
    }

    async fn delete(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.fulfillments.retain(|fulfillment| fulfillment.id != id);
        Ok(())
    }
}

#[async_trait]
impl OrderEventRepository for EventTable {
    async fn save(&mut self, event: &OrderEvent) -> Result<(), StoreError> {
        if self.events.iter().any(|existing| existing.id == event.id) {
            return Err(StoreError::Conflict(format!(
                "order event {} is immutable",
                event.id
            )));
        }
        self.events.push(event.clone());
        Ok(())
    }

    async fn for_order(&mut self, order_id: Uuid) -> Result<Vec<OrderEvent>, StoreError> {
        Ok(self
            .events
            .iter()
            .filter(|event| event.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VoucherRepository for VoucherTable {
    async fn get(&mut self, id: Uuid) -> Result<Voucher, StoreError> {
        self.vouchers
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Voucher", id))
    }

    async fn get_by_code(&mut self, code: &str) -> Result<Voucher, StoreError> {
        self.vouchers
            .values()
            .find(|voucher| voucher.code.eq_ignore_ascii_case(code))
            .cloned()
            .ok_or_else(|| StoreError::not_found("Voucher", code))
    }

    async fn save(&mut self, voucher: &Voucher) -> Result<(), StoreError> {
        let code_taken = self
            .vouchers
            .values()
            .any(|existing| existing.id != voucher.id && existing.code.eq_ignore_ascii_case(&voucher.code));
        if code_taken {
            return Err(StoreError::Conflict(format!(
                "voucher code {} already exists",
                voucher.code
            )));
        }
        self.vouchers.insert(voucher.id, voucher.clone());
        Ok(())
    }

    async fn customer_usage_exists(
        &mut self,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .customers
            .iter()
            .any(|usage| usage.voucher_id == voucher_id && usage.customer_email == customer_email))
    }

    async fn add_customer_usage(
        &mut self,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<(), StoreError> {
        self.customers.push(VoucherCustomer {
            voucher_id,
            customer_email: customer_email.to_string(),
        });
        Ok(())
    }

    async fn remove_customer_usage(
        &mut self,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<(), StoreError> {
        self.customers.retain(|usage| {
            !(usage.voucher_id == voucher_id && usage.customer_email == customer_email)
        });
        Ok(())
    }
}

#[async_trait]
impl SaleRepository for SaleTable {
    async fn get(&mut self, id: Uuid) -> Result<Sale, StoreError> {
        self.sales
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Sale", id))
    }

    async fn save(&mut self, sale: &Sale) -> Result<(), StoreError> {
        self.sales.insert(sale.id, sale.clone());
        Ok(())
    }

    async fn active(&mut self, at: DateTime<Utc>) -> Result<Vec<Sale>, StoreError> {
        let mut sales: Vec<Sale> = self
            .sales
            .values()
            .filter(|sale| sale.is_active(at))
            .cloned()
            .collect();
        sales.sort_by_key(|sale| (sale.start_date, sale.id));
        Ok(sales)
    }
}

#[async_trait]
impl PaymentRepository for PaymentTable {
    async fn for_order(&mut self, order_id: Uuid) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .payments
            .iter()
            .filter(|payment| payment.order_id == order_id)
            .cloned()
            .collect())
    }
}
