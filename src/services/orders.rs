use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::{AppConfig, OrdersConfig};
use crate::db::{Store, Transaction};
use crate::errors::OrderError;
use crate::events::{self, OrderNotification, PluginManager};
use crate::metrics::OrderMetrics;
use crate::models::{
    DiscountInput, Fulfillment, Order, OrderDiscount, OrderDiscountType, OrderEventOption,
    OrderEventType, OrderFilterOptions, OrderLine, OrderStatus, TransactionKind, VariantSnapshot,
    Voucher,
};
use crate::money::{Currency, Money, TaxedMoney};
use crate::services::discounts::{
    lines_subtotal, lines_total_quantity, CustomerInfo, DiscountContext, DiscountService,
};
use crate::services::fulfillments::{CreateFulfillmentsInput, CreateReturnInput, FulfillmentService};
use crate::services::inventory::StockService;
use crate::services::order_events::{
    common_create_order_event, lines_per_quantity, order_discount_event,
};
use crate::services::order_status::{self, can_transition, clean_order_cancel};

/// Controls which parts of an order are recomputed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecalculateOptions {
    /// Recompute the voucher discount against the current lines.
    pub update_voucher_discount: bool,
}

impl Default for RecalculateOptions {
    fn default() -> Self {
        Self {
            update_voucher_discount: true,
        }
    }
}

/// Sum of order totals, all of which must be in `currency`.
pub fn sum_order_totals(orders: &[Order], currency: Currency) -> Result<TaxedMoney, OrderError> {
    orders
        .iter()
        .try_fold(TaxedMoney::zero(currency), |acc, order| acc.try_add(&order.total))
        .map_err(OrderError::from)
}

/// Entry point for order use cases. Every operation runs inside a
/// [`Transaction`] obtained from [`OrderService::begin`]; plugin
/// notifications go out from [`OrderService::commit`].
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn Store>,
    plugins: Arc<dyn PluginManager>,
    metrics: Arc<OrderMetrics>,
    discounts: DiscountService,
    fulfillments: FulfillmentService,
    config: OrdersConfig,
}

impl OrderService {
    /// Creates a new order service instance
    pub fn new(
        store: Arc<dyn Store>,
        plugins: Arc<dyn PluginManager>,
        metrics: Arc<OrderMetrics>,
        discounts: DiscountService,
        fulfillments: FulfillmentService,
        config: OrdersConfig,
    ) -> Self {
        Self {
            store,
            plugins,
            metrics,
            discounts,
            fulfillments,
            config,
        }
    }

    /// Wires every sub-service from the application configuration.
    pub fn from_config(
        store: Arc<dyn Store>,
        plugins: Arc<dyn PluginManager>,
        metrics: Arc<OrderMetrics>,
        config: &AppConfig,
    ) -> Result<Self, OrderError> {
        let discounts = DiscountService::from_config(&config.pricing)?;
        let stock = StockService::new(metrics.clone());
        let fulfillments =
            FulfillmentService::new(stock, metrics.clone(), config.fulfillment.clone());
        Ok(Self::new(
            store,
            plugins,
            metrics,
            discounts,
            fulfillments,
            config.orders.clone(),
        ))
    }

    pub fn discounts(&self) -> &DiscountService {
        &self.discounts
    }

    pub fn fulfillments(&self) -> &FulfillmentService {
        &self.fulfillments
    }

    pub fn stock(&self) -> &StockService {
        self.fulfillments.stock()
    }

    pub fn metrics(&self) -> &OrderMetrics {
        &self.metrics
    }

    pub async fn begin(&self) -> Result<Transaction, OrderError> {
        Ok(Transaction::begin(self.store.as_ref()).await?)
    }

    /// Commits and then sends the queued notifications. A failing plugin is
    /// logged and counted; the committed work stands.
    pub async fn commit(&self, tx: Transaction) -> Result<(), OrderError> {
        let notifications = tx.commit().await?;
        for notification in &notifications {
            if let Err(e) = events::dispatch(self.plugins.as_ref(), notification).await {
                self.metrics.notification_failures.inc();
                error!(
                    notification = notification.name(),
                    "Plugin notification failed: {}", e
                );
            }
        }
        debug!(sent = notifications.len(), "notifications dispatched");
        Ok(())
    }

    fn count_not_applicable<T>(&self, result: Result<T, OrderError>) -> Result<T, OrderError> {
        if let Err(OrderError::NotApplicable(ref e)) = result {
            self.metrics.voucher_not_applicable.inc();
            warn!("Voucher not applicable: {}", e);
        }
        result
    }

    async fn editable_order(&self, tx: &mut Transaction, order_id: Uuid) -> Result<Order, OrderError> {
        let order = tx.orders().get(order_id).await?;
        if !order.status.is_editable() {
            return Err(OrderError::InvalidState(format!(
                "Order {} with status {} can no longer be edited",
                order.id, order.status
            )));
        }
        Ok(order)
    }

    /// Sales only reprice orders that are still being edited. Placed
    /// orders keep the sale discount their lines were sold with.
    async fn sales_for(
        &self,
        tx: &mut Transaction,
        order: &Order,
    ) -> Result<Option<DiscountContext>, OrderError> {
        if !order.status.is_editable() {
            return Ok(None);
        }
        let context = self.discounts.fetch_active_discounts(tx, Utc::now()).await?;
        Ok(Some(context))
    }

    // Totals

    /// Recomputes line prices, the subtotal, order discounts and the total,
    /// in that order. Running it twice gives the same result.
    #[instrument(skip(self, tx))]
    pub async fn recalculate_order(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        options: RecalculateOptions,
    ) -> Result<Order, OrderError> {
        let mut order = tx.orders().get(order_id).await?;
        let mut lines = tx.orders().lines(order_id).await?;
        let sales = self.sales_for(tx, &order).await?;

        for line in &mut lines {
            let before = line.clone();
            self.discounts
                .apply_line_discount(line, sales.as_ref(), order.channel_id)?;
            if *line != before {
                tx.orders().save_line(line).await?;
            }
        }

        let before = order.clone();
        order.subtotal = lines_subtotal(order.currency, &lines)?;
        let undiscounted_subtotal = lines
            .iter()
            .try_fold(TaxedMoney::zero(order.currency), |acc, line| {
                acc.try_add(&line.undiscounted_total_price)
            })?;

        if options.update_voucher_discount {
            self.recalculate_voucher_discount(tx, &order, &lines).await?;
        }
        self.recalculate_order_discounts(tx, &order).await?;

        let base = self.discount_base(&order)?;
        let discount_total = tx
            .orders()
            .discounts(order.id)
            .await?
            .iter()
            .try_fold(Money::zero(order.currency), |acc, discount| acc.try_add(&discount.amount))?;
        order.discount_amount = discount_total.try_min(&base)?.clamp_non_negative();

        order.undiscounted_total = undiscounted_subtotal.try_add(&order.shipping_price)?;
        order.total = order
            .subtotal
            .try_add(&order.shipping_price)?
            .subtract_amount(&order.discount_amount)?
            .clamp_non_negative();

        if order != before {
            order.updated_at = Utc::now();
            tx.orders().save(&order).await?;
        }
        self.metrics.order_recalculations.inc();
        debug!(total = %order.total.gross, discount = %order.discount_amount, "order recalculated");
        Ok(order)
    }

    /// Displayed subtotal plus shipping; the most order discounts can take.
    fn discount_base(&self, order: &Order) -> Result<Money, OrderError> {
        Ok(self
            .discounts
            .displayed(&order.subtotal)
            .try_add(&self.discounts.displayed(&order.shipping_price))?)
    }

    async fn recalculate_voucher_discount(
        &self,
        tx: &mut Transaction,
        order: &Order,
        lines: &[OrderLine],
    ) -> Result<(), OrderError> {
        let existing: Vec<OrderDiscount> = tx
            .orders()
            .discounts(order.id)
            .await?
            .into_iter()
            .filter(|discount| discount.discount_type == OrderDiscountType::Voucher)
            .collect();

        let Some(voucher_id) = order.voucher_id else {
            for discount in existing {
                tx.orders().delete_discount(discount.id).await?;
            }
            return Ok(());
        };

        let voucher = tx.vouchers().get(voucher_id).await?;
        let amount = match self.count_not_applicable(
            self.discounts
                .get_voucher_discount_for_order(order, lines, &voucher),
        ) {
            Ok(amount) => amount,
            Err(OrderError::NotApplicable(_)) => Money::zero(order.currency),
            Err(e) => return Err(e),
        };

        let mut discount = existing
            .into_iter()
            .next()
            .unwrap_or_else(|| voucher_discount_row(order, &voucher));
        discount.value_type = voucher.discount_value_type;
        discount.value = voucher
            .listing_for(order.channel_id)
            .map_or(Decimal::ZERO, |listing| listing.discount_value);
        discount.amount = amount;
        tx.orders().save_discount(&discount).await?;
        Ok(())
    }

    /// Recomputes manual order discounts against the current subtotal and
    /// shipping. Returns `(old, new)` for every discount whose amount moved.
    pub async fn recalculate_order_discounts(
        &self,
        tx: &mut Transaction,
        order: &Order,
    ) -> Result<Vec<(OrderDiscount, OrderDiscount)>, OrderError> {
        let base = self.discount_base(order)?;
        let mut changed = Vec::new();
        let discounts = tx.orders().discounts(order.id).await?;
        for discount in discounts {
            if discount.discount_type != OrderDiscountType::Manual {
                continue;
            }
            let amount = self.discounts.discount_amount_for(
                discount.value_type,
                discount.value,
                order.currency,
                &base,
            )?;
            if amount == discount.amount {
                continue;
            }
            let mut updated = discount.clone();
            updated.amount = amount;
            tx.orders().save_discount(&updated).await?;
            order_discount_event(
                tx,
                OrderEventType::OrderDiscountAutomaticallyUpdated,
                None,
                &updated,
                Some(&discount),
            )
            .await?;
            changed.push((discount, updated));
        }
        Ok(changed)
    }

    /// Recomputes the paid total from the payment ledger: successful
    /// captures minus successful refunds, never below zero.
    #[instrument(skip(self, tx))]
    pub async fn update_order_total_paid(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
    ) -> Result<Order, OrderError> {
        let mut order = tx.orders().get(order_id).await?;
        let payments = tx.payments().for_order(order_id).await?;

        let mut total_paid = Money::zero(order.currency);
        for payment in payments.iter().filter(|p| p.counts_towards_total_paid()) {
            for transaction in payment.transactions.iter().filter(|t| t.is_success) {
                total_paid = match transaction.kind {
                    TransactionKind::Capture => total_paid.try_add(&transaction.amount)?,
                    TransactionKind::Refund => total_paid.try_sub(&transaction.amount)?,
                    _ => total_paid,
                };
            }
        }
        let total_paid = total_paid.clamp_non_negative();

        if total_paid != order.total_paid {
            order.total_paid = total_paid;
            order.updated_at = Utc::now();
            tx.orders().save(&order).await?;
        }
        Ok(order)
    }

    pub async fn order_subtotal(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
    ) -> Result<TaxedMoney, OrderError> {
        let order = tx.orders().get(order_id).await?;
        let lines = tx.orders().lines(order_id).await?;
        lines_subtotal(order.currency, &lines)
    }

    pub async fn order_total_quantity(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
    ) -> Result<i32, OrderError> {
        Ok(lines_total_quantity(&tx.orders().lines(order_id).await?))
    }

    pub async fn order_is_shipping_required(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
    ) -> Result<bool, OrderError> {
        Ok(tx
            .orders()
            .lines(order_id)
            .await?
            .iter()
            .any(|line| line.is_shipping_required))
    }

    pub async fn update_order_status(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
    ) -> Result<Order, OrderError> {
        let mut order = tx.orders().get(order_id).await?;
        order_status::update_order_status(tx, &mut order).await?;
        Ok(order)
    }

    pub async fn orders_by_option(
        &self,
        tx: &mut Transaction,
        options: &OrderFilterOptions,
    ) -> Result<Vec<Order>, OrderError> {
        Ok(tx.orders().filter_by_options(options).await?)
    }

    // Lifecycle

    /// Places an order: reserves stock for its lines, confirms it when
    /// configured to, and marks it fully paid when it already is.
    #[instrument(skip(self, tx))]
    pub async fn order_created(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
        from_draft: bool,
    ) -> Result<Order, OrderError> {
        let mut order = tx.orders().get(order_id).await?;
        if order.status != OrderStatus::Draft {
            return Err(OrderError::InvalidState(format!(
                "Order {} with status {} has already been placed",
                order.id, order.status
            )));
        }

        let lines = tx.orders().lines(order_id).await?;
        for line in lines {
            self.stock()
                .allocate_stocks(tx, &line, line.quantity_unfulfilled())
                .await?;
        }

        order.status = if self.config.automatically_confirm_all_new_orders {
            OrderStatus::Unfulfilled
        } else {
            OrderStatus::Unconfirmed
        };
        order.updated_at = Utc::now();
        tx.orders().save(&order).await?;

        let placed = if from_draft {
            OrderEventType::PlacedFromDraft
        } else {
            OrderEventType::Placed
        };
        common_create_order_event(tx, OrderEventOption::new(order.id, placed).by(user_id)).await?;
        tx.defer(OrderNotification::OrderCreated(order.clone()));

        if order.status == OrderStatus::Unfulfilled {
            tx.defer(OrderNotification::OrderConfirmed(order.clone()));
        }
        let order = self.update_order_total_paid(tx, order.id).await?;
        if order.is_fully_paid() && !order.total.gross.is_zero() {
            self.handle_fully_paid_order(tx, &order, user_id).await?;
        }
        info!(status = %order.status, "order placed");
        Ok(order)
    }

    async fn handle_fully_paid_order(
        &self,
        tx: &mut Transaction,
        order: &Order,
        user_id: Option<Uuid>,
    ) -> Result<(), OrderError> {
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::OrderFullyPaid).by(user_id),
        )
        .await?;
        tx.defer(OrderNotification::OrderFullyPaid(order.clone()));
        Ok(())
    }

    #[instrument(skip(self, tx))]
    pub async fn confirm_order(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Order, OrderError> {
        let mut order = tx.orders().get(order_id).await?;
        if order.status != OrderStatus::Unconfirmed
            || !can_transition(order.status, OrderStatus::Unfulfilled)
        {
            return Err(OrderError::InvalidState(format!(
                "Order {} with status {} cannot be confirmed",
                order.id, order.status
            )));
        }
        order.status = OrderStatus::Unfulfilled;
        order.updated_at = Utc::now();
        tx.orders().save(&order).await?;

        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::Confirmed).by(user_id),
        )
        .await?;
        tx.defer(OrderNotification::OrderConfirmed(order.clone()));
        Ok(order)
    }

    /// Cancels an order without active fulfillments, returning everything it
    /// held to stock and releasing its voucher.
    #[instrument(skip(self, tx))]
    pub async fn cancel_order(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Order, OrderError> {
        let mut order = tx.orders().get(order_id).await?;
        let fulfillments = tx.fulfillments().for_order(order_id).await?;
        clean_order_cancel(&order, &fulfillments)?;

        self.fulfillments.restock_order_lines(tx, &order).await?;
        if let Some(voucher_id) = order.voucher_id {
            self.release_voucher(tx, &order, voucher_id).await?;
        }

        order.status = OrderStatus::Canceled;
        order.updated_at = Utc::now();
        tx.orders().save(&order).await?;
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::Canceled).by(user_id),
        )
        .await?;

        tx.defer(OrderNotification::OrderCancelled(order.clone()));
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        info!("order canceled");
        Ok(order)
    }

    /// Records a captured payment and refreshes the paid total.
    pub async fn order_captured(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
        amount: Money,
        payment_id: Uuid,
    ) -> Result<Order, OrderError> {
        common_create_order_event(
            tx,
            OrderEventOption::new(order_id, OrderEventType::PaymentCaptured)
                .by(user_id)
                .param("amount", json!(amount.amount))
                .param("currency", amount.currency.code())
                .param("payment_id", json!(payment_id)),
        )
        .await?;
        let order = self.update_order_total_paid(tx, order_id).await?;
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        if order.is_fully_paid() {
            self.handle_fully_paid_order(tx, &order, user_id).await?;
        }
        Ok(order)
    }

    pub async fn order_refunded(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
        amount: Money,
        payment_id: Uuid,
    ) -> Result<Order, OrderError> {
        common_create_order_event(
            tx,
            OrderEventOption::new(order_id, OrderEventType::PaymentRefunded)
                .by(user_id)
                .param("amount", json!(amount.amount))
                .param("currency", amount.currency.code())
                .param("payment_id", json!(payment_id)),
        )
        .await?;
        let order = self.update_order_total_paid(tx, order_id).await?;
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        Ok(order)
    }

    pub async fn order_voided(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
        payment_id: Uuid,
    ) -> Result<Order, OrderError> {
        common_create_order_event(
            tx,
            OrderEventOption::new(order_id, OrderEventType::PaymentVoided)
                .by(user_id)
                .param("payment_id", json!(payment_id)),
        )
        .await?;
        let order = self.update_order_total_paid(tx, order_id).await?;
        tx.defer(OrderNotification::OrderUpdated(order.clone()));
        Ok(order)
    }

    // Lines

    /// Adds a variant to an editable order, merging with an existing line
    /// for the same variant.
    #[instrument(skip(self, tx, variant), fields(variant_id = %variant.variant_id))]
    pub async fn add_variant_to_order(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        variant: VariantSnapshot,
        quantity: i32,
        user_id: Option<Uuid>,
    ) -> Result<OrderLine, OrderError> {
        if quantity <= 0 {
            return Err(OrderError::Validation(format!(
                "Quantity must be positive, got {}",
                quantity
            )));
        }
        let order = self.editable_order(tx, order_id).await?;
        if variant.unit_price_net.currency != order.currency {
            return Err(OrderError::Validation(format!(
                "Variant is priced in {} but the order is in {}",
                variant.unit_price_net.currency, order.currency
            )));
        }

        let existing = tx
            .orders()
            .lines(order_id)
            .await?
            .into_iter()
            .find(|line| line.variant_id == Some(variant.variant_id));
        let mut line = match existing {
            Some(mut line) => {
                line.quantity = line.quantity.checked_add(quantity).ok_or_else(|| {
                    OrderError::Validation(format!(
                        "Quantity {} cannot be added to a line of {}",
                        quantity, line.quantity
                    ))
                })?;
                line
            }
            None => variant.into_line(order_id, quantity)?,
        };
        self.discounts
            .apply_line_discount(&mut line, None, order.channel_id)?;
        tx.orders().save_line(&line).await?;

        if !order.is_draft() {
            self.stock().allocate_stocks(tx, &line, quantity).await?;
        }
        common_create_order_event(
            tx,
            OrderEventOption::new(order_id, OrderEventType::AddedProducts)
                .by(user_id)
                .param("lines", lines_per_quantity(&[(quantity, &line)])),
        )
        .await?;

        self.recalculate_order(tx, order_id, RecalculateOptions::default())
            .await?;
        Ok(tx.orders().line(line.id).await?)
    }

    /// Sets a line's quantity. Zero deletes the line; the quantity cannot
    /// drop below what has already been fulfilled.
    #[instrument(skip(self, tx))]
    pub async fn change_order_line_quantity(
        &self,
        tx: &mut Transaction,
        line_id: Uuid,
        new_quantity: i32,
        user_id: Option<Uuid>,
    ) -> Result<Option<OrderLine>, OrderError> {
        let mut line = tx.orders().line(line_id).await?;
        let order = self.editable_order(tx, line.order_id).await?;
        if new_quantity < 0 || new_quantity < line.quantity_fulfilled {
            return Err(OrderError::Validation(format!(
                "Quantity {} is below the {} already fulfilled",
                new_quantity, line.quantity_fulfilled
            )));
        }
        if new_quantity == 0 {
            self.delete_order_line(tx, line_id, user_id).await?;
            return Ok(None);
        }

        let delta = new_quantity - line.quantity;
        if delta == 0 {
            return Ok(Some(line));
        }
        line.quantity = new_quantity;
        self.discounts
            .apply_line_discount(&mut line, None, order.channel_id)?;
        tx.orders().save_line(&line).await?;

        if !order.is_draft() {
            if delta > 0 {
                self.stock().allocate_stocks(tx, &line, delta).await?;
            } else {
                self.stock().deallocate_stock(tx, line.id, -delta, None).await?;
            }
        }
        let event_type = if delta > 0 {
            OrderEventType::AddedProducts
        } else {
            OrderEventType::RemovedProducts
        };
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, event_type)
                .by(user_id)
                .param("lines", lines_per_quantity(&[(delta.abs(), &line)])),
        )
        .await?;

        self.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await?;
        Ok(Some(tx.orders().line(line_id).await?))
    }

    #[instrument(skip(self, tx))]
    pub async fn delete_order_line(
        &self,
        tx: &mut Transaction,
        line_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Order, OrderError> {
        let line = tx.orders().line(line_id).await?;
        let order = self.editable_order(tx, line.order_id).await?;
        if line.quantity_fulfilled > 0 {
            return Err(OrderError::InvalidState(format!(
                "Order line {} has fulfilled items and cannot be deleted",
                line.id
            )));
        }

        self.stock().deallocate_stock_for_lines(tx, &[line.id]).await?;
        tx.orders().delete_line(line.id).await?;
        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::RemovedProducts)
                .by(user_id)
                .param("lines", lines_per_quantity(&[(line.quantity, &line)])),
        )
        .await?;

        self.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await
    }

    // Vouchers

    /// Applies a voucher code to an editable order, replacing any voucher it
    /// already has.
    #[instrument(skip(self, tx, customer))]
    pub async fn add_voucher_to_order(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        code: &str,
        customer: &CustomerInfo,
    ) -> Result<Order, OrderError> {
        let mut order = self.editable_order(tx, order_id).await?;
        let voucher = tx.vouchers().get_by_code(code).await?;
        if order.voucher_id == Some(voucher.id) {
            return Ok(order);
        }
        if order.voucher_id.is_some() {
            order = self
                .remove_voucher_from_order(tx, order_id, customer.user_id)
                .await?;
        }

        let customer = CustomerInfo {
            email: customer
                .email
                .clone()
                .or_else(|| order.customer_email().map(str::to_string)),
            ..customer.clone()
        };
        let lines = tx.orders().lines(order_id).await?;
        let subtotal = lines_subtotal(order.currency, &lines)?;
        self.count_not_applicable(
            self.discounts
                .validate_voucher_availability(&voucher, Utc::now()),
        )?;
        self.count_not_applicable(
            self.discounts
                .validate_voucher(
                    tx,
                    &voucher,
                    &subtotal,
                    lines_total_quantity(&lines),
                    &customer,
                    order.channel_id,
                )
                .await,
        )?;
        let amount = self.count_not_applicable(
            self.discounts
                .get_voucher_discount_for_order(&order, &lines, &voucher),
        )?;

        self.discounts.increase_voucher_usage(tx, voucher.id).await?;
        if let Some(email) = customer.email.as_deref().filter(|_| voucher.apply_once_per_customer) {
            self.discounts
                .add_voucher_usage_by_customer(tx, voucher.id, email)
                .await?;
        }

        order.voucher_id = Some(voucher.id);
        order.updated_at = Utc::now();
        tx.orders().save(&order).await?;

        let mut discount = voucher_discount_row(&order, &voucher);
        discount.amount = amount;
        tx.orders().save_discount(&discount).await?;
        order_discount_event(
            tx,
            OrderEventType::OrderDiscountAdded,
            customer.user_id,
            &discount,
            None,
        )
        .await?;

        info!(voucher_id = %voucher.id, "voucher applied");
        self.recalculate_order(tx, order_id, RecalculateOptions::default())
            .await
    }

    #[instrument(skip(self, tx))]
    pub async fn remove_voucher_from_order(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Order, OrderError> {
        let mut order = self.editable_order(tx, order_id).await?;
        let Some(voucher_id) = order.voucher_id else {
            return Ok(order);
        };

        self.release_voucher(tx, &order, voucher_id).await?;
        let discounts = tx.orders().discounts(order_id).await?;
        for discount in discounts {
            if discount.discount_type == OrderDiscountType::Voucher {
                tx.orders().delete_discount(discount.id).await?;
                order_discount_event(
                    tx,
                    OrderEventType::OrderDiscountDeleted,
                    user_id,
                    &discount,
                    None,
                )
                .await?;
            }
        }

        order.voucher_id = None;
        order.updated_at = Utc::now();
        tx.orders().save(&order).await?;
        self.recalculate_order(tx, order_id, RecalculateOptions::default())
            .await
    }

    async fn release_voucher(
        &self,
        tx: &mut Transaction,
        order: &Order,
        voucher_id: Uuid,
    ) -> Result<(), OrderError> {
        let voucher = self.discounts.decrease_voucher_usage(tx, voucher_id).await?;
        if voucher.apply_once_per_customer {
            if let Some(email) = order.customer_email() {
                self.discounts
                    .remove_voucher_usage_by_customer(tx, voucher_id, email)
                    .await?;
            }
        }
        Ok(())
    }

    // Manual discounts

    #[instrument(skip(self, tx, input))]
    pub async fn create_order_discount(
        &self,
        tx: &mut Transaction,
        order_id: Uuid,
        input: DiscountInput,
        user_id: Option<Uuid>,
    ) -> Result<OrderDiscount, OrderError> {
        input.validate()?;
        let order = self.editable_order(tx, order_id).await?;
        let has_manual = tx
            .orders()
            .discounts(order_id)
            .await?
            .iter()
            .any(|discount| discount.discount_type == OrderDiscountType::Manual);
        if has_manual {
            return Err(OrderError::Validation(
                "Only one manual discount can be applied to an order".to_string(),
            ));
        }

        let amount = self.discounts.discount_amount_for(
            input.value_type,
            input.value,
            order.currency,
            &self.discount_base(&order)?,
        )?;
        let discount = OrderDiscount {
            id: Uuid::new_v4(),
            order_id,
            discount_type: OrderDiscountType::Manual,
            value_type: input.value_type,
            value: input.value,
            amount,
            name: input.name,
            translated_name: None,
            reason: input.reason,
            voucher_id: None,
        };
        tx.orders().save_discount(&discount).await?;
        order_discount_event(tx, OrderEventType::OrderDiscountAdded, user_id, &discount, None)
            .await?;

        self.recalculate_order(tx, order_id, RecalculateOptions::default())
            .await?;
        Ok(tx.orders().discount(discount.id).await?)
    }

    #[instrument(skip(self, tx, input))]
    pub async fn update_order_discount(
        &self,
        tx: &mut Transaction,
        discount_id: Uuid,
        input: DiscountInput,
        user_id: Option<Uuid>,
    ) -> Result<OrderDiscount, OrderError> {
        input.validate()?;
        let old = tx.orders().discount(discount_id).await?;
        let order = self.editable_order(tx, old.order_id).await?;
        if old.discount_type != OrderDiscountType::Manual {
            return Err(OrderError::InvalidState(
                "Voucher discounts follow their voucher and cannot be edited".to_string(),
            ));
        }

        let mut discount = old.clone();
        discount.value_type = input.value_type;
        discount.value = input.value;
        discount.reason = input.reason.or(old.reason.clone());
        discount.name = input.name.or(old.name.clone());
        discount.amount = self.discounts.discount_amount_for(
            discount.value_type,
            discount.value,
            order.currency,
            &self.discount_base(&order)?,
        )?;
        tx.orders().save_discount(&discount).await?;
        order_discount_event(
            tx,
            OrderEventType::OrderDiscountUpdated,
            user_id,
            &discount,
            Some(&old),
        )
        .await?;

        self.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await?;
        Ok(tx.orders().discount(discount_id).await?)
    }

    #[instrument(skip(self, tx))]
    pub async fn remove_order_discount(
        &self,
        tx: &mut Transaction,
        discount_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Order, OrderError> {
        let discount = tx.orders().discount(discount_id).await?;
        let order = self.editable_order(tx, discount.order_id).await?;
        if discount.discount_type == OrderDiscountType::Voucher {
            return self.remove_voucher_from_order(tx, order.id, user_id).await;
        }

        tx.orders().delete_discount(discount.id).await?;
        order_discount_event(tx, OrderEventType::OrderDiscountDeleted, user_id, &discount, None)
            .await?;
        self.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await
    }

    #[instrument(skip(self, tx, input))]
    pub async fn update_order_line_discount(
        &self,
        tx: &mut Transaction,
        line_id: Uuid,
        input: DiscountInput,
        user_id: Option<Uuid>,
    ) -> Result<OrderLine, OrderError> {
        input.validate()?;
        let mut line = tx.orders().line(line_id).await?;
        let order = self.editable_order(tx, line.order_id).await?;
        let old_unit_price = line.unit_price;

        line.unit_discount_type = Some(input.value_type);
        line.unit_discount_value = input.value;
        line.unit_discount_reason = input.reason;
        self.discounts
            .apply_line_discount(&mut line, None, order.channel_id)?;
        tx.orders().save_line(&line).await?;

        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::OrderLineDiscountUpdated)
                .by(user_id)
                .param("line_pk", json!(line.id))
                .param(
                    "discount",
                    json!({
                        "value": line.unit_discount_value,
                        "value_type": line.unit_discount_type,
                        "amount_value": line.unit_discount_amount,
                        "currency": line.currency,
                        "reason": line.unit_discount_reason,
                        "old_unit_price": old_unit_price.net.amount,
                    }),
                ),
        )
        .await?;

        self.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await?;
        Ok(tx.orders().line(line_id).await?)
    }

    #[instrument(skip(self, tx))]
    pub async fn remove_order_line_discount(
        &self,
        tx: &mut Transaction,
        line_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<OrderLine, OrderError> {
        let mut line = tx.orders().line(line_id).await?;
        let order = self.editable_order(tx, line.order_id).await?;

        line.unit_discount_type = None;
        line.unit_discount_value = Decimal::ZERO;
        line.unit_discount_reason = None;
        self.discounts
            .apply_line_discount(&mut line, None, order.channel_id)?;
        tx.orders().save_line(&line).await?;

        common_create_order_event(
            tx,
            OrderEventOption::new(order.id, OrderEventType::OrderLineDiscountRemoved)
                .by(user_id)
                .param("line_pk", json!(line.id)),
        )
        .await?;

        self.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await?;
        Ok(tx.orders().line(line_id).await?)
    }

    // Fulfillments

    pub async fn create_fulfillments(
        &self,
        tx: &mut Transaction,
        input: CreateFulfillmentsInput,
    ) -> Result<Vec<Fulfillment>, OrderError> {
        self.fulfillments.create_fulfillments(tx, input).await
    }

    pub async fn cancel_fulfillment(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
        warehouse_override: Option<Uuid>,
    ) -> Result<Fulfillment, OrderError> {
        self.fulfillments
            .cancel_fulfillment(tx, fulfillment_id, user_id, warehouse_override)
            .await
    }

    pub async fn approve_fulfillment(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
        notify_customer: bool,
    ) -> Result<Fulfillment, OrderError> {
        self.fulfillments
            .approve_fulfillment(tx, fulfillment_id, user_id, notify_customer, None)
            .await
    }

    pub async fn create_return_fulfillment(
        &self,
        tx: &mut Transaction,
        input: CreateReturnInput,
    ) -> Result<Fulfillment, OrderError> {
        self.fulfillments.create_return_fulfillment(tx, input).await
    }

    pub async fn fulfillment_tracking_updated(
        &self,
        tx: &mut Transaction,
        fulfillment_id: Uuid,
        user_id: Option<Uuid>,
        tracking_number: String,
    ) -> Result<Fulfillment, OrderError> {
        self.fulfillments
            .fulfillment_tracking_updated(tx, fulfillment_id, user_id, tracking_number)
            .await
    }
}

fn voucher_discount_row(order: &Order, voucher: &Voucher) -> OrderDiscount {
    OrderDiscount {
        id: Uuid::new_v4(),
        order_id: order.id,
        discount_type: OrderDiscountType::Voucher,
        value_type: voucher.discount_value_type,
        value: voucher
            .listing_for(order.channel_id)
            .map_or(Decimal::ZERO, |listing| listing.discount_value),
        amount: Money::zero(order.currency),
        name: voucher.name.clone().or_else(|| Some(voucher.code.clone())),
        translated_name: None,
        reason: None,
        voucher_id: Some(voucher.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FulfillmentConfig;
    use crate::events::MockPluginManager;
    use crate::models::{
        ChargeStatus, DiscountValueType, Payment, PaymentTransaction, VoucherChannelListing,
        VoucherType,
    };
    use crate::money::ExchangeRates;
    use crate::repositories::memory::InMemoryStore;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    fn service(store: &InMemoryStore, plugins: MockPluginManager) -> OrderService {
        let metrics = Arc::new(OrderMetrics::new().unwrap());
        let discounts = DiscountService::new(ExchangeRates::new(), true);
        let fulfillments = FulfillmentService::new(
            StockService::new(metrics.clone()),
            metrics.clone(),
            FulfillmentConfig::default(),
        );
        OrderService::new(
            Arc::new(store.clone()),
            Arc::new(plugins),
            metrics,
            discounts,
            fulfillments,
            OrdersConfig::default(),
        )
    }

    fn variant(price: Decimal) -> VariantSnapshot {
        VariantSnapshot {
            variant_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            category_id: None,
            collection_ids: vec![],
            product_name: "Book".into(),
            variant_name: "Paperback".into(),
            sku: None,
            is_shipping_required: true,
            track_inventory: false,
            unit_price_net: usd(price),
            tax_rate: dec!(0),
        }
    }

    async fn draft(svc: &OrderService, tx: &mut Transaction) -> Order {
        let mut order = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Draft);
        order.shipping_price = TaxedMoney::from_net(usd(dec!(10)), dec!(0)).unwrap();
        tx.orders().save(&order).await.unwrap();
        svc.recalculate_order(tx, order.id, RecalculateOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn manual_discount_is_capped_and_updated_automatically() {
        let store = InMemoryStore::new();
        let svc = service(&store, MockPluginManager::new());
        let mut tx = svc.begin().await.unwrap();
        let order = draft(&svc, &mut tx).await;
        svc.add_variant_to_order(&mut tx, order.id, variant(dec!(20)), 2, None)
            .await
            .unwrap();

        let discount = svc
            .create_order_discount(
                &mut tx,
                order.id,
                DiscountInput {
                    value_type: DiscountValueType::Percentage,
                    value: dec!(50),
                    reason: Some("loyalty".into()),
                    name: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(discount.amount, usd(dec!(25.00)));

        let order = tx.orders().get(order.id).await.unwrap();
        assert_eq!(order.subtotal.gross, usd(dec!(40.00)));
        assert_eq!(order.total.gross, usd(dec!(25.00)));

        let line = tx.orders().lines(order.id).await.unwrap().remove(0);
        svc.change_order_line_quantity(&mut tx, line.id, 4, None)
            .await
            .unwrap();
        let discount = tx.orders().discount(discount.id).await.unwrap();
        assert_eq!(discount.amount, usd(dec!(45.00)));
        let events = tx.order_events().for_order(order.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == OrderEventType::OrderDiscountAutomaticallyUpdated));
    }

    #[tokio::test]
    async fn recalculation_is_idempotent() {
        let store = InMemoryStore::new();
        let svc = service(&store, MockPluginManager::new());
        let mut tx = svc.begin().await.unwrap();
        let order = draft(&svc, &mut tx).await;
        let line = svc
            .add_variant_to_order(&mut tx, order.id, variant(dec!(9.99)), 3, None)
            .await
            .unwrap();
        svc.update_order_line_discount(
            &mut tx,
            line.id,
            DiscountInput {
                value_type: DiscountValueType::Fixed,
                value: dec!(1.50),
                reason: None,
                name: None,
            },
            None,
        )
        .await
        .unwrap();

        let first = svc
            .recalculate_order(&mut tx, order.id, RecalculateOptions::default())
            .await
            .unwrap();
        let second = svc
            .recalculate_order(&mut tx, order.id, RecalculateOptions::default())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.subtotal.net, usd(dec!(25.47)));
    }

    #[tokio::test]
    async fn voucher_round_trip_updates_usage() {
        let store = InMemoryStore::new();
        let svc = service(&store, MockPluginManager::new());
        let mut tx = svc.begin().await.unwrap();
        let order = draft(&svc, &mut tx).await;
        svc.add_variant_to_order(&mut tx, order.id, variant(dec!(50)), 2, None)
            .await
            .unwrap();
        let voucher = Voucher {
            id: Uuid::new_v4(),
            code: "TENOFF".into(),
            name: None,
            voucher_type: VoucherType::EntireOrder,
            discount_value_type: DiscountValueType::Percentage,
            usage_limit: Some(5),
            used: 0,
            start_date: Utc::now() - chrono::Duration::days(1),
            end_date: None,
            apply_once_per_order: false,
            apply_once_per_customer: false,
            only_for_staff: false,
            countries: vec![],
            min_checkout_items_quantity: 0,
            channel_listings: vec![VoucherChannelListing {
                channel_id: order.channel_id,
                discount_value: dec!(10),
                currency: Currency::USD,
                min_spent: None,
            }],
        };
        tx.vouchers().save(&voucher).await.unwrap();

        let order = svc
            .add_voucher_to_order(&mut tx, order.id, "tenoff", &CustomerInfo::default())
            .await
            .unwrap();
        assert_eq!(order.discount_amount, usd(dec!(10.00)));
        assert_eq!(order.total.gross, usd(dec!(100.00)));
        assert_eq!(tx.vouchers().get(voucher.id).await.unwrap().used, 1);

        let order = svc
            .remove_voucher_from_order(&mut tx, order.id, None)
            .await
            .unwrap();
        assert_eq!(order.voucher_id, None);
        assert!(order.discount_amount.is_zero());
        assert_eq!(tx.vouchers().get(voucher.id).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn total_paid_follows_the_ledger() {
        let store = InMemoryStore::new();
        let svc = service(&store, MockPluginManager::new());
        let mut tx = svc.begin().await.unwrap();
        let order = draft(&svc, &mut tx).await;
        tx.commit().await.unwrap();

        let txn = |kind, amount| PaymentTransaction {
            id: Uuid::new_v4(),
            kind,
            is_success: true,
            amount: usd(amount),
            created_at: Utc::now(),
        };
        store
            .insert_payment(Payment {
                id: Uuid::new_v4(),
                order_id: order.id,
                is_active: true,
                charge_status: ChargeStatus::PartiallyRefunded,
                total: usd(dec!(30)),
                transactions: vec![
                    txn(TransactionKind::Capture, dec!(30)),
                    txn(TransactionKind::Refund, dec!(12)),
                ],
            })
            .await;
        store
            .insert_payment(Payment {
                id: Uuid::new_v4(),
                order_id: order.id,
                is_active: false,
                charge_status: ChargeStatus::Cancelled,
                total: usd(dec!(99)),
                transactions: vec![txn(TransactionKind::Capture, dec!(99))],
            })
            .await;

        let mut tx = svc.begin().await.unwrap();
        let order = svc.update_order_total_paid(&mut tx, order.id).await.unwrap();
        assert_eq!(order.total_paid, usd(dec!(18)));
    }

    #[tokio::test]
    async fn plugin_failures_do_not_undo_commit() {
        let store = InMemoryStore::new();
        let mut plugins = MockPluginManager::new();
        plugins.expect_order_confirmed().times(1).returning(|_| {
            Err(crate::events::PluginError::Failed {
                plugin: "mailer".into(),
                message: "smtp down".into(),
            })
        });
        let svc = service(&store, plugins);

        let mut tx = svc.begin().await.unwrap();
        let order = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Unconfirmed);
        tx.orders().save(&order).await.unwrap();
        svc.confirm_order(&mut tx, order.id, None).await.unwrap();
        svc.commit(tx).await.unwrap();

        assert_eq!(svc.metrics().notification_failures.get(), 1);
        let mut tx = svc.begin().await.unwrap();
        assert_eq!(
            tx.orders().get(order.id).await.unwrap().status,
            OrderStatus::Unfulfilled
        );
    }

    #[tokio::test]
    async fn line_edits_require_editable_order() {
        let store = InMemoryStore::new();
        let svc = service(&store, MockPluginManager::new());
        let mut tx = svc.begin().await.unwrap();
        let order = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Unfulfilled);
        tx.orders().save(&order).await.unwrap();

        assert_matches!(
            svc.add_variant_to_order(&mut tx, order.id, variant(dec!(5)), 1, None)
                .await,
            Err(OrderError::InvalidState(_))
        );
    }

    #[test]
    fn order_totals_sum_in_one_currency() {
        let mut a = Order::new(Uuid::new_v4(), Currency::USD, OrderStatus::Fulfilled);
        a.total = TaxedMoney::from_net(usd(dec!(10)), dec!(0.1)).unwrap();
        let mut b = a.clone();
        b.total = TaxedMoney::from_net(usd(dec!(5)), dec!(0)).unwrap();
        let sum = sum_order_totals(&[a.clone(), b], Currency::USD).unwrap();
        assert_eq!(sum.gross, usd(dec!(16.00)));
        assert_matches!(sum_order_totals(&[a], Currency::EUR), Err(OrderError::Money(_)));
    }
}
