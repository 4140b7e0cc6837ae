use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::Transaction;
use crate::errors::{InsufficientStock, InsufficientStockItem, OrderError};
use crate::metrics::OrderMetrics;
use crate::models::{Allocation, OrderLine, Stock};

/// A quantity of an order line to take out of one warehouse.
#[derive(Clone, Copy, Debug)]
pub struct StockRequest<'a> {
    pub line: &'a OrderLine,
    pub warehouse_id: Uuid,
    pub quantity: i32,
}

impl<'a> StockRequest<'a> {
    pub fn new(line: &'a OrderLine, warehouse_id: Uuid, quantity: i32) -> Self {
        Self {
            line,
            warehouse_id,
            quantity,
        }
    }

    fn tracked_variant(&self) -> Option<Uuid> {
        if self.line.track_inventory {
            self.line.variant_id
        } else {
            None
        }
    }
}

/// Where a stock decrease landed and how much it took out. `quantity` can
/// be below the requested amount when stock was allowed to be exceeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StockTaken {
    pub stock_id: Option<Uuid>,
    pub quantity: i32,
}

/// Service for stock levels and allocations of order lines
#[derive(Clone)]
pub struct StockService {
    metrics: Arc<OrderMetrics>,
}

impl StockService {
    /// Creates a new stock service instance
    pub fn new(metrics: Arc<OrderMetrics>) -> Self {
        Self { metrics }
    }

    /// Reserves `quantity` of the line's variant across warehouses, in
    /// warehouse order. Nothing is reserved unless the whole quantity fits.
    #[instrument(skip(self, tx, line), fields(order_line_id = %line.id))]
    pub async fn allocate_stocks(
        &self,
        tx: &mut Transaction,
        line: &OrderLine,
        quantity: i32,
    ) -> Result<Vec<Allocation>, OrderError> {
        let variant_id = match (line.track_inventory, line.variant_id) {
            (true, Some(variant_id)) if quantity > 0 => variant_id,
            _ => return Ok(Vec::new()),
        };

        let stocks = tx.stocks().for_variant(variant_id).await?;
        let available: i32 = stocks.iter().map(|stock| stock.available().max(0)).sum();
        if available < quantity {
            self.metrics.insufficient_stock.inc();
            warn!(requested = quantity, available, "not enough stock to allocate");
            return Err(InsufficientStock {
                items: vec![InsufficientStockItem {
                    order_line_id: Some(line.id),
                    variant_id: Some(variant_id),
                    warehouse_id: None,
                    requested: quantity,
                    available,
                }],
            }
            .into());
        }

        let existing = tx.stocks().allocations_for_lines(&[line.id]).await?;
        let mut remaining = quantity;
        let mut allocations = Vec::new();
        for mut stock in stocks {
            if remaining == 0 {
                break;
            }
            let take = stock.available().max(0).min(remaining);
            if take == 0 {
                continue;
            }
            let mut allocation = existing
                .iter()
                .find(|allocation| allocation.stock_id == stock.id)
                .cloned()
                .unwrap_or_else(|| Allocation::new(line.id, stock.id, 0));
            allocation.quantity_allocated += take;
            stock.quantity_allocated += take;

            tx.stocks().save(&stock).await?;
            tx.stocks().save_allocation(&allocation).await?;
            remaining -= take;
            allocations.push(allocation);
        }

        debug!(allocations = allocations.len(), "stock allocated");
        Ok(allocations)
    }

    /// Releases up to `quantity` reserved for a line and returns how much was
    /// released. Allocations on `prefer_stock` are released first.
    pub async fn deallocate_stock(
        &self,
        tx: &mut Transaction,
        order_line_id: Uuid,
        quantity: i32,
        prefer_stock: Option<Uuid>,
    ) -> Result<i32, OrderError> {
        let mut allocations = tx.stocks().allocations_for_lines(&[order_line_id]).await?;
        allocations.sort_by_key(|allocation| Some(allocation.stock_id) != prefer_stock);

        let mut remaining = quantity;
        for mut allocation in allocations {
            if remaining <= 0 {
                break;
            }
            let release = allocation.quantity_allocated.min(remaining);
            let mut stock = tx.stocks().get(allocation.stock_id).await?;
            stock.quantity_allocated = (stock.quantity_allocated - release).max(0);
            tx.stocks().save(&stock).await?;

            allocation.quantity_allocated -= release;
            if allocation.quantity_allocated == 0 {
                tx.stocks().delete_allocation(allocation.id).await?;
            } else {
                tx.stocks().save_allocation(&allocation).await?;
            }
            remaining -= release;
        }
        Ok(quantity - remaining.max(0))
    }

    /// Drops every allocation held by the given lines.
    #[instrument(skip(self, tx, order_line_ids))]
    pub async fn deallocate_stock_for_lines(
        &self,
        tx: &mut Transaction,
        order_line_ids: &[Uuid],
    ) -> Result<(), OrderError> {
        let allocations = tx.stocks().allocations_for_lines(order_line_ids).await?;
        for allocation in allocations {
            let mut stock = tx.stocks().get(allocation.stock_id).await?;
            stock.quantity_allocated = (stock.quantity_allocated - allocation.quantity_allocated).max(0);
            tx.stocks().save(&stock).await?;
            tx.stocks().delete_allocation(allocation.id).await?;
        }
        Ok(())
    }

    /// Lists every request that cannot be served. Requests are summed per
    /// stock row, and a line may use what other lines have not reserved.
    /// Untracked lines are never short.
    pub async fn check_stock(
        &self,
        tx: &mut Transaction,
        requests: &[StockRequest<'_>],
        allow_stock_to_be_exceeded: bool,
    ) -> Result<Vec<InsufficientStockItem>, OrderError> {
        let mut groups: BTreeMap<(Uuid, Uuid), Vec<&StockRequest<'_>>> = BTreeMap::new();
        for request in requests {
            if let Some(variant_id) = request.tracked_variant() {
                groups
                    .entry((variant_id, request.warehouse_id))
                    .or_default()
                    .push(request);
            }
        }

        let mut missing = Vec::new();
        for ((variant_id, warehouse_id), group) in groups {
            let stock = tx.stocks().get_for_update(variant_id, warehouse_id).await?;
            let available = match stock {
                // A missing stock row cannot be oversold.
                None => 0,
                Some(_) if allow_stock_to_be_exceeded => continue,
                Some(stock) => {
                    let own_lines: Vec<Uuid> = group.iter().map(|request| request.line.id).collect();
                    let held_by_others: i32 = tx
                        .stocks()
                        .allocations_for_stock(stock.id)
                        .await?
                        .iter()
                        .filter(|allocation| !own_lines.contains(&allocation.order_line_id))
                        .map(|allocation| allocation.quantity_allocated)
                        .sum();
                    (stock.quantity - held_by_others).max(0)
                }
            };

            let requested: i32 = group.iter().map(|request| request.quantity).sum();
            if requested > available {
                missing.extend(group.iter().map(|request| InsufficientStockItem {
                    order_line_id: Some(request.line.id),
                    variant_id: Some(variant_id),
                    warehouse_id: Some(warehouse_id),
                    requested: request.quantity,
                    available,
                }));
            }
        }
        Ok(missing)
    }

    /// Takes stock out of warehouses for shipped quantities and releases the
    /// matching allocations. All requests are validated before any row is
    /// written. Returns what each request took out of stock.
    #[instrument(skip(self, tx, requests), fields(requests = requests.len()))]
    pub async fn decrease_stock(
        &self,
        tx: &mut Transaction,
        requests: &[StockRequest<'_>],
        allow_stock_to_be_exceeded: bool,
    ) -> Result<Vec<StockTaken>, OrderError> {
        let missing = self
            .check_stock(tx, requests, allow_stock_to_be_exceeded)
            .await?;
        if !missing.is_empty() {
            self.metrics.insufficient_stock.inc();
            return Err(InsufficientStock { items: missing }.into());
        }
        self.apply_decrease(tx, requests).await
    }

    /// Writes a decrease that has already been checked.
    pub(crate) async fn apply_decrease(
        &self,
        tx: &mut Transaction,
        requests: &[StockRequest<'_>],
    ) -> Result<Vec<StockTaken>, OrderError> {
        let mut used = Vec::with_capacity(requests.len());
        for request in requests {
            let Some(variant_id) = request.tracked_variant() else {
                used.push(StockTaken::default());
                continue;
            };
            let before = tx
                .stocks()
                .get_for_update(variant_id, request.warehouse_id)
                .await?
                .map_or(0, |stock| stock.quantity);
            let stock = tx
                .stocks()
                .decrement_for_variant_and_warehouse(variant_id, request.warehouse_id, request.quantity)
                .await?;
            let taken = (before - stock.quantity).max(0);
            if taken < request.quantity {
                warn!(
                    order_line_id = %request.line.id,
                    requested = request.quantity,
                    taken,
                    "stock exceeded, decrease floored at zero"
                );
            }
            self.deallocate_stock(tx, request.line.id, request.quantity, Some(stock.id))
                .await?;
            used.push(StockTaken {
                stock_id: Some(stock.id),
                quantity: taken,
            });
        }
        Ok(used)
    }

    /// Puts `quantity` of the line's variant back into a warehouse, creating
    /// the stock row when it does not exist. With `allocate` the returned
    /// quantity is reserved for the line again.
    #[instrument(skip(self, tx, line), fields(order_line_id = %line.id))]
    pub async fn increase_stock(
        &self,
        tx: &mut Transaction,
        line: &OrderLine,
        warehouse_id: Uuid,
        quantity: i32,
        allocate: bool,
    ) -> Result<Option<Stock>, OrderError> {
        let variant_id = match (line.track_inventory, line.variant_id) {
            (true, Some(variant_id)) if quantity > 0 => variant_id,
            _ => return Ok(None),
        };

        let mut stock = tx
            .stocks()
            .get_for_update(variant_id, warehouse_id)
            .await?
            .unwrap_or_else(|| Stock::new(warehouse_id, variant_id, 0));
        stock.quantity += quantity;
        if allocate {
            stock.quantity_allocated += quantity;
        }
        tx.stocks().save(&stock).await?;

        if allocate {
            let mut allocation = tx
                .stocks()
                .allocations_for_lines(&[line.id])
                .await?
                .into_iter()
                .find(|allocation| allocation.stock_id == stock.id)
                .unwrap_or_else(|| Allocation::new(line.id, stock.id, 0));
            allocation.quantity_allocated += quantity;
            tx.stocks().save_allocation(&allocation).await?;
        }

        info!(warehouse_id = %warehouse_id, quantity, "stock increased");
        Ok(Some(stock))
    }
}
