use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::FulfillmentConfig;
use crate::db::Transaction;
use crate::errors::{InsufficientStock, InsufficientStockItem, OrderError};
use crate::events::OrderNotification;
use crate::metrics::OrderMetrics;
use crate::models::{
    Fulfillment, FulfillmentLine, FulfillmentStatus, Order, OrderEventOption, OrderEventType,
    OrderLine, OrderStatus,
};
use crate::services::inventory::{StockRequest, StockService, StockTaken};
use crate::services::order_events::{common_create_order_event, lines_per_quantity};
use crate::services::order_status::update_order_status;

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct FulfillmentLineInput {
    pub order_line_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

/// Lines shipped out of one warehouse. Each group becomes one fulfillment.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct WarehouseLines {
    pub warehouse_id: Uuid,
    #[validate]
    pub lines: Vec<FulfillmentLineInput>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct CreateFulfillmentsInput {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    #[validate]
    pub lines_for_warehouses: Vec<WarehouseLines>,
    pub notify_customer: bool,
    /// Falls back to `fulfillment.auto_approve`.
    pub approved: Option<bool>,
    /// Falls back to `fulfillment.allow_stock_to_be_exceeded`.
    pub allow_stock_to_be_exceeded: Option<bool>,
    pub tracking_number: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ReturnLineInput {
    pub fulfillment_line_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CreateReturnInput {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    #[validate]
    pub lines: Vec<ReturnLineInput>,
    /// Put returned items back into the warehouse they were shipped from.
    pub restock: bool,
}

/// Service for fulfillments and the stock movements they cause
#[derive(Clone)]
pub struct FulfillmentService {
    stock: StockService,
    metrics: Arc<OrderMetrics>,
    config: FulfillmentConfig,
}

impl FulfillmentService {
    /// Creates a new fulfillment service instance
    pub fn new(stock: StockService, metrics: Arc<OrderMetrics>, config: FulfillmentConfig) -> Self {
        Self {
            stock,
            metrics,
            config,
        }
    }

    pub fn stock(&self) -> &StockService {
        &self.stock
    }

    /// Creates one fulfillment per warehouse. The whole request is checked
    /// first; if any line is short nothing is written and every short line
    /// is reported in a single `InsufficientStock`.
    #[instrument(skip(self, tx, input), fields(order_id = %input.order_id))]
    pub async fn create_fulfillments(
        &self,
        tx: &mut Transaction,
        input: CreateFulfillmentsInput,
    ) -> Result<Vec<Fulfillment>, OrderError> {
        input.validate()?;
        if input
            .lines_for_warehouses
            .iter()
            .all(|group| group.lines.is_empty())
        {
            return Err(OrderError::Validation(
                "At least one line is required to create a fulfillment".to_string(),
            ));
        }
        let approved = input.approved.unwrap_or(self.config.auto_approve);
        let allow_stock_to_be_exceeded = input
            .allow_stock_to_be_exceeded
            .unwrap_or(self.config.allow_stock_to_be_exceeded);

        let mut order = tx.orders().get(input.order_id).await?;
        if !order.status.accepts_fulfillments() {
            return Err(OrderError::InvalidState(format!(
                "Order {} with status {} cannot be fulfilled",
                order.id, order.status
            )));
        }
        let lines = tx.orders().lines(order.id).await?;
        let lines_by_id: HashMap<Uuid, &OrderLine> = lines.iter().map(|line| (line.id, line)).collect();

        let mut requested: BTreeMap<Uuid, i32> = BTreeMap::new();
        let mut requests = Vec::new();
        for group in &input.lines_for_warehouses {
            for entry in &group.lines {
                let line = lines_by_id.get(&entry.order_line_id).ok_or_else(|| {
                    OrderError::NotFound(format!(
                        "Order line {} does not belong to order {}",
                        entry.order_line_id, order.id
                    ))
                })?;
                *requested.entry(line.id).or_default() += entry.quantity;
                requests.push(StockRequest::new(line, group.warehouse_id, entry.quantity));
            }
        }

        let mut missing = Vec::new();
        if !allow_stock_to_be_exceeded {
            for (line_id, quantity) in &requested {
                let line = lines_by_id[line_id];
                if *quantity > line.quantity_unfulfilled() {
                    missing.push(InsufficientStockItem {
                        order_line_id: Some(line.id),
                        variant_id: line.variant_id,
                        warehouse_id: None,
                        requested: *quantity,
                        available: line.quantity_unfulfilled().max(0),
                    });
                }
            }
        }
        // Unapproved fulfillments only need the stock row to exist.
        missing.extend(
            self.stock
                .check_stock(tx, &requests, allow_stock_to_be_exceeded || !approved)
                .await?,
        );
        if !missing.is_empty() {
            self.metrics.insufficient_stock.inc();
            warn!(lines = missing.len(), "fulfillment rejected for insufficient stock");
            return Err(InsufficientStock { items: missing }.into());
        }

        let mut next_number = tx
            .fulfillments()
            .for_order(order.id)
            .await?
            .iter()
            .map(|fulfillment| fulfillment.fulfillment_order)
            .max()
            .unwrap_or(0);
        let status = if approved {
            FulfillmentStatus::Fulfilled
        } else {
            FulfillmentStatus::WaitingForApproval
        };

        let mut created = Vec::new();
        for group in input.lines_for_warehouses.iter().filter(|g| !g.lines.is_empty()) {
            next_number += 1;
            let mut fulfillment = Fulfillment::new(order.id, next_number, status);
            if let Some(tracking_number) = &input.tracking_number {
                fulfillment.tracking_number = tracking_number.clone();
            }

            let group_requests: Vec<StockRequest<'_>> = group
                .lines
                .iter()
                .map(|entry| {
                    StockRequest::new(
                        lines_by_id[&entry.order_line_id],
                        group.warehouse_id,
                        entry.quantity,
                    )
                })
                .collect();
            let taken = if approved {
                self.stock.apply_decrease(tx, &group_requests).await?
            } else {
                let mut taken = Vec::with_capacity(group_requests.len());
                for request in &group_requests {
                    let stock_id = match request.line.variant_id.filter(|_| request.line.track_inventory) {
                        Some(variant_id) => tx
                            .stocks()
                            .get_for_update(variant_id, request.warehouse_id)
                            .await?
                            .map(|stock| stock.id),
                        None => None,
                    };
                    taken.push(StockTaken {
                        stock_id,
                        quantity: 0,
                    });
                }
                taken
            };

            for (request, taken) in group_requests.iter().zip(taken) {
                let mut line = FulfillmentLine::new(
                    request.line.id,
                    request.quantity,
                    taken.stock_id,
                    Some(group.warehouse_id),
                );
                line.quantity_from_stock = taken.quantity;
                fulfillment.lines.push(line);
            }
            tx.fulfillments().save(&fulfillment).await?;
            created.push(fulfillment);
        }

        for (line_id, quantity) in &requested {
            let mut line = lines_by_id[line_id].clone();
            line.quantity_fulfilled += quantity;
            tx.orders().save_line(&line).await?;
        }

        let fulfillment_line_ids: Vec<Uuid> = created
            .iter()
            .flat_map(|fulfillment| fulfillment.lines.iter().map(|line| line.id))
            .collect();
        let event = if approved {
            OrderEventOption::new(order.id, OrderEventType::FulfillmentFulfilledItems)
                .param("fulfilled_items", json!(fulfillment_line_ids))
        } else {
            OrderEventOption::new(order.id, OrderEventType::FulfillmentAwaitsApproval)
                .param("awaiting_fulfillments", json!(fulfillment_line_ids))
        };
        common_create_order_event(tx, event.by(input.user_id)).await?;

        update_order_status(tx, &mut order).await?;

        if approved {
            for fulfillment in &created {
                tx.defer(OrderNotification::FulfillmentCreated {
                    fulfillment: fulfillment.clone(),
                    notify_customer: input.notify_customer,
                });
            }
            if order.status == OrderStatus::Fulfilled {
                tx.defer(OrderNotification::OrderFulfilled(order.clone()));
            }
        }
        tx.defer(OrderNotification::OrderUpdated(order.clone()));

        self.metrics.fulfillments_created.inc_by(created.len() as u64);
        info!(
            fulfillments = created.len(),
            status = %order.status,
            "fulfillments created"
        );
        Ok(created)
    }

    /// Cancels a fulfillment and returns its items to stock, either in the
    /// warehouse they came from or in `warehouse_override`. The returned
    /// quantity is reserved for its order line again.
    #[instrument(skip(self, tx))]
    pub async fn cancel_fulfillment(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
        warehouse_override: Option<Uuid>,
    ) -> Result<Fulfillment, OrderError> {
        let mut fulfillment = tx.fulfillments().get_for_update(fulfillment_id).await?;
        match fulfillment.status {
            FulfillmentStatus::Fulfilled => {}
            FulfillmentStatus::WaitingForApproval => {
                return self.cancel_waiting(tx, fulfillment, user_id).await;
            }
            FulfillmentStatus::Canceled => {
                return Err(OrderError::InvalidState(format!(
                    "Fulfillment {} is already canceled",
                    fulfillment.id
                )));
            }
            other => {
                return Err(OrderError::InvalidState(format!(
                    "Fulfillment {} with status {} cannot be canceled",
                    fulfillment.id, other
                )));
            }
        }

        let mut order = tx.orders().get(fulfillment.order_id).await?;
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::FulfillmentCanceled)
                .by(user_id)
                .param("fulfillment_order", fulfillment.fulfillment_order),
        )
        .await?;

        let restocked = self
            .restock_fulfillment_lines(tx, &fulfillment, warehouse_override)
            .await?;
        let warehouse = warehouse_override
            .or_else(|| fulfillment.lines.iter().find_map(|line| line.warehouse_id));
        if restocked > 0 {
            common_create_order_event(
                tx,
                OrderEventOption::new(order.id, OrderEventType::FulfillmentRestockedItems)
                    .by(user_id)
                    .param("quantity", restocked)
                    .param("warehouse", json!(warehouse)),
            )
            .await?;
        }

        fulfillment.status = FulfillmentStatus::Canceled;
        tx.fulfillments().save(&fulfillment).await?;
        update_order_status(tx, &mut order).await?;

        tx.defer(OrderNotification::FulfillmentCanceled(fulfillment.clone()));
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        self.metrics.fulfillments_canceled.inc();
        info!(fulfillment_id = %fulfillment.id, restocked, "fulfillment canceled");
        Ok(fulfillment)
    }

    /// Cancels a fulfillment that was never approved. Its quantities are
    /// released from the order lines and the fulfillment is deleted.
    pub async fn cancel_waiting_fulfillment(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Fulfillment, OrderError> {
        let fulfillment = tx.fulfillments().get_for_update(fulfillment_id).await?;
        self.cancel_waiting(tx, fulfillment, user_id).await
    }

    async fn cancel_waiting(
        &self,
        tx: &mut Transaction,
        mut fulfillment: Fulfillment,
        user_id: Option<Uuid>,
    ) -> Result<Fulfillment, OrderError> {
        if fulfillment.status != FulfillmentStatus::WaitingForApproval {
            return Err(OrderError::InvalidState(format!(
                "Fulfillment {} is not waiting for approval",
                fulfillment.id
            )));
        }

        let mut order = tx.orders().get(fulfillment.order_id).await?;
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::FulfillmentCanceled)
                .by(user_id)
                .param("fulfillment_order", fulfillment.fulfillment_order),
        )
        .await?;

        for fulfillment_line in &fulfillment.lines {
            let mut line = tx.orders().line(fulfillment_line.order_line_id).await?;
            line.quantity_fulfilled = (line.quantity_fulfilled - fulfillment_line.quantity).max(0);
            tx.orders().save_line(&line).await?;
        }
        tx.fulfillments().delete(fulfillment.id).await?;
        update_order_status(tx, &mut order).await?;

        fulfillment.status = FulfillmentStatus::Canceled;
        tx.defer(OrderNotification::FulfillmentCanceled(fulfillment.clone()));
        tx.defer(OrderNotification::OrderUpdated(order));
        self.metrics.fulfillments_canceled.inc();
        info!(fulfillment_id = %fulfillment.id, "waiting fulfillment canceled");
        Ok(fulfillment)
    }

    /// Approves a waiting fulfillment and takes its items out of stock.
    #[instrument(skip(self, tx))]
    pub async fn approve_fulfillment(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
        notify_customer: bool,
        allow_stock_to_be_exceeded: Option<bool>,
    ) -> Result<Fulfillment, OrderError> {
        let mut fulfillment = tx.fulfillments().get_for_update(fulfillment_id).await?;
        if fulfillment.status != FulfillmentStatus::WaitingForApproval {
            return Err(OrderError::InvalidState(format!(
                "Fulfillment {} with status {} cannot be approved",
                fulfillment.id, fulfillment.status
            )));
        }

        let mut order = tx.orders().get(fulfillment.order_id).await?;
        if !self.config.allow_unpaid && !order.is_fully_paid() {
            return Err(OrderError::InvalidState(format!(
                "Cannot approve fulfillment of unpaid order {}",
                order.id
            )));
        }

        let lines = tx.orders().lines(order.id).await?;
        let lines_by_id: HashMap<Uuid, &OrderLine> = lines.iter().map(|line| (line.id, line)).collect();
        let mut positions = Vec::new();
        let mut requests = Vec::new();
        for (index, fulfillment_line) in fulfillment.lines.iter().enumerate() {
            let (Some(line), Some(warehouse_id)) = (
                lines_by_id.get(&fulfillment_line.order_line_id),
                fulfillment_line.warehouse_id,
            ) else {
                continue;
            };
            positions.push(index);
            requests.push(StockRequest::new(line, warehouse_id, fulfillment_line.quantity));
        }

        let taken = self
            .stock
            .decrease_stock(
                tx,
                &requests,
                allow_stock_to_be_exceeded.unwrap_or(self.config.allow_stock_to_be_exceeded),
            )
            .await?;
        for (index, taken) in positions.into_iter().zip(taken) {
            let line = &mut fulfillment.lines[index];
            if taken.stock_id.is_some() {
                line.stock_id = taken.stock_id;
            }
            line.quantity_from_stock = taken.quantity;
        }

        fulfillment.status = FulfillmentStatus::Fulfilled;
        tx.fulfillments().save(&fulfillment).await?;
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::FulfillmentFulfilledItems)
                .by(user_id)
                .param(
                    "fulfilled_items",
                    json!(fulfillment.lines.iter().map(|line| line.id).collect::<Vec<_>>()),
                ),
        )
        .await?;
        update_order_status(tx, &mut order).await?;

        tx.defer(OrderNotification::FulfillmentApproved {
            fulfillment: fulfillment.clone(),
            notify_customer,
        });
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        if order.status == OrderStatus::Fulfilled {
            tx.defer(OrderNotification::OrderFulfilled(order));
        }
        info!(fulfillment_id = %fulfillment.id, "fulfillment approved");
        Ok(fulfillment)
    }

    /// Returns the fulfillment's items to stock and takes them off the order
    /// lines' fulfilled quantity. Only what was taken out of stock goes back.
    /// Returns the quantity put back.
    pub async fn restock_fulfillment_lines(
        &self,
        tx: &mut Transaction,
        fulfillment: &Fulfillment,
        warehouse_override: Option<Uuid>,
    ) -> Result<i32, OrderError> {
        let mut restocked = 0;
        for fulfillment_line in &fulfillment.lines {
            let mut line = tx.orders().line(fulfillment_line.order_line_id).await?;
            if let Some(warehouse_id) = warehouse_override.or(fulfillment_line.warehouse_id) {
                let quantity = fulfillment_line.quantity_from_stock;
                if self
                    .stock
                    .increase_stock(tx, &line, warehouse_id, quantity, true)
                    .await?
                    .is_some()
                {
                    restocked += quantity;
                }
            }
            line.quantity_fulfilled = (line.quantity_fulfilled - fulfillment_line.quantity).max(0);
            tx.orders().save_line(&line).await?;
        }
        Ok(restocked)
    }

    /// Releases everything an order holds. Allocations are dropped. Shipped
    /// items go back to the warehouse each fulfillment line was taken from,
    /// and quantities waiting for approval are released without touching
    /// stock. Both kinds of fulfillment end up canceled. Returned and other
    /// settled fulfillments are left alone, their stock was already handled.
    #[instrument(skip(self, tx, order), fields(order_id = %order.id))]
    pub async fn restock_order_lines(
        &self,
        tx: &mut Transaction,
        order: &Order,
    ) -> Result<i32, OrderError> {
        let lines = tx.orders().lines(order.id).await?;
        let line_ids: Vec<Uuid> = lines.iter().map(|line| line.id).collect();
        self.stock.deallocate_stock_for_lines(tx, &line_ids).await?;
        let mut lines_by_id: HashMap<Uuid, OrderLine> =
            lines.into_iter().map(|line| (line.id, line)).collect();

        let mut released: BTreeMap<Uuid, i32> = BTreeMap::new();
        let mut restocked = 0;
        let fulfillments = tx.fulfillments().for_order(order.id).await?;
        for mut fulfillment in fulfillments {
            let shipped = match fulfillment.status {
                FulfillmentStatus::Fulfilled => true,
                FulfillmentStatus::WaitingForApproval => false,
                _ => continue,
            };
            for fulfillment_line in &fulfillment.lines {
                let Some(line) = lines_by_id.get(&fulfillment_line.order_line_id) else {
                    continue;
                };
                if shipped {
                    match fulfillment_line.warehouse_id {
                        Some(warehouse_id) => {
                            let quantity = fulfillment_line.quantity_from_stock;
                            if self
                                .stock
                                .increase_stock(tx, line, warehouse_id, quantity, false)
                                .await?
                                .is_some()
                            {
                                restocked += quantity;
                            }
                        }
                        None => warn!(
                            fulfillment_line_id = %fulfillment_line.id,
                            "no warehouse to restock fulfilled items"
                        ),
                    }
                }
                *released.entry(line.id).or_default() += fulfillment_line.quantity;
            }
            fulfillment.status = FulfillmentStatus::Canceled;
            tx.fulfillments().save(&fulfillment).await?;
        }

        for (line_id, quantity) in released {
            if let Some(line) = lines_by_id.get_mut(&line_id) {
                line.quantity_fulfilled = (line.quantity_fulfilled - quantity).max(0);
                tx.orders().save_line(line).await?;
            }
        }
        Ok(restocked)
    }

    pub async fn fulfillment_tracking_updated(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
        tracking_number: String,
    ) -> Result<Fulfillment, OrderError> {
        let mut fulfillment = tx.fulfillments().get_for_update(fulfillment_id).await?;
        if fulfillment.status == FulfillmentStatus::Canceled {
            return Err(OrderError::InvalidState(format!(
                "Fulfillment {} is canceled",
                fulfillment.id
            )));
        }
        fulfillment.tracking_number = tracking_number;
        tx.fulfillments().save(&fulfillment).await?;

        common_create_order_event(
            tx,
            OrderEventOption::new(fulfillment.order_id, OrderEventType::TrackingUpdated)
                .by(user_id)
                .param("tracking_number", fulfillment.tracking_number.clone())
                .param("fulfillment", fulfillment.fulfillment_order),
        )
        .await?;
        tx.defer(OrderNotification::TrackingNumberUpdated(fulfillment.clone()));
        Ok(fulfillment)
    }

    /// Moves shipped quantities into a new `Returned` fulfillment. Order line
    /// quantities are left alone; the order status picks up the return.
    #[instrument(skip(self, tx, input), fields(order_id = %input.order_id))]
    pub async fn create_return_fulfillment(
        &self,
        tx: &mut Transaction,
        input: CreateReturnInput,
    ) -> Result<Fulfillment, OrderError> {
        input.validate()?;
        if input.lines.is_empty() {
            return Err(OrderError::Validation(
                "At least one line is required to create a return".to_string(),
            ));
        }

        let mut order = tx.orders().get(input.order_id).await?;
        if !order.status.accepts_fulfillments() {
            return Err(OrderError::InvalidState(format!(
                "Order {} with status {} cannot be returned",
                order.id, order.status
            )));
        }

        let mut returned: BTreeMap<Uuid, i32> = BTreeMap::new();
        for entry in &input.lines {
            *returned.entry(entry.fulfillment_line_id).or_default() += entry.quantity;
        }

        let mut fulfillments = tx.fulfillments().for_order(order.id).await?;
        let mut touched = HashSet::new();
        let mut moved = Vec::new();
        for (fulfillment_line_id, quantity) in &returned {
            let (fulfillment_id, source) = fulfillments
                .iter_mut()
                .filter(|fulfillment| fulfillment.status == FulfillmentStatus::Fulfilled)
                .find_map(|fulfillment| {
                    let id = fulfillment.id;
                    fulfillment
                        .lines
                        .iter_mut()
                        .find(|line| line.id == *fulfillment_line_id)
                        .map(|line| (id, line))
                })
                .ok_or_else(|| {
                    OrderError::NotFound(format!(
                        "Fulfilled line {} not found in order {}",
                        fulfillment_line_id, order.id
                    ))
                })?;
            if *quantity > source.quantity {
                return Err(OrderError::Validation(format!(
                    "Cannot return {} items of fulfillment line {}, only {} shipped",
                    quantity, source.id, source.quantity
                )));
            }
            let from_stock = (*quantity).min(source.quantity_from_stock);
            source.quantity -= quantity;
            source.quantity_from_stock -= from_stock;
            let mut line = FulfillmentLine::new(
                source.order_line_id,
                *quantity,
                source.stock_id,
                source.warehouse_id,
            );
            line.quantity_from_stock = from_stock;
            moved.push(line);
            touched.insert(fulfillment_id);
        }

        let next_number = fulfillments
            .iter()
            .map(|fulfillment| fulfillment.fulfillment_order)
            .max()
            .unwrap_or(0)
            + 1;
        for mut fulfillment in fulfillments {
            if !touched.contains(&fulfillment.id) {
                continue;
            }
            fulfillment.lines.retain(|line| line.quantity > 0);
            if fulfillment.lines.is_empty() {
                tx.fulfillments().delete(fulfillment.id).await?;
            } else {
                tx.fulfillments().save(&fulfillment).await?;
            }
        }

        let mut return_fulfillment =
            Fulfillment::new(order.id, next_number, FulfillmentStatus::Returned);
        return_fulfillment.lines = moved;
        tx.fulfillments().save(&return_fulfillment).await?;

        let lines = tx.orders().lines(order.id).await?;
        let lines_by_id: HashMap<Uuid, &OrderLine> = lines.iter().map(|line| (line.id, line)).collect();
        let mut restocked = 0;
        if input.restock {
            for fulfillment_line in &return_fulfillment.lines {
                let (Some(line), Some(warehouse_id)) = (
                    lines_by_id.get(&fulfillment_line.order_line_id),
                    fulfillment_line.warehouse_id,
                ) else {
                    continue;
                };
                let quantity = fulfillment_line.quantity_from_stock;
                if self
                    .stock
                    .increase_stock(tx, line, warehouse_id, quantity, false)
                    .await?
                    .is_some()
                {
                    restocked += quantity;
                }
            }
        }

        let returned_lines: Vec<(i32, &OrderLine)> = return_fulfillment
            .lines
            .iter()
            .filter_map(|fulfillment_line| {
                lines_by_id
                    .get(&fulfillment_line.order_line_id)
                    .map(|line| (fulfillment_line.quantity, *line))
            })
            .collect();
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::FulfillmentReturned)
                .by(input.user_id)
                .param("lines", lines_per_quantity(&returned_lines)),
        )
        .await?;
        if restocked > 0 {
            common_create_order_event(
                tx,
                OrderEventOption::new(order.id, OrderEventType::FulfillmentRestockedItems)
                    .by(input.user_id)
                    .param("quantity", restocked),
            )
            .await?;
        }

        update_order_status(tx, &mut order).await?;
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        info!(
            fulfillment_id = %return_fulfillment.id,
            status = %order.status,
            "return fulfillment created"
        );
        Ok(return_fulfillment)
    }
}
