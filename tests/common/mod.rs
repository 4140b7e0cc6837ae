#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use commerce_orders::config::AppConfig;
use commerce_orders::db::Transaction;
use commerce_orders::events::{PluginError, PluginManager};
use commerce_orders::metrics::OrderMetrics;
use commerce_orders::models::{Fulfillment, Order, OrderLine, OrderStatus, Stock, VariantSnapshot};
use commerce_orders::money::{Currency, Money, TaxedMoney};
use commerce_orders::repositories::memory::InMemoryStore;
use commerce_orders::services::{OrderService, RecalculateOptions};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

/// Plugin manager that records the name of every hook it receives.
#[derive(Default)]
pub struct RecordingPlugins {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingPlugins {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, name: &'static str) -> Result<(), PluginError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(name);
        }
        Ok(())
    }
}

#[async_trait]
impl PluginManager for RecordingPlugins {
    async fn order_created(&self, _order: &Order) -> Result<(), PluginError> {
        self.record("order_created")
    }
    async fn order_confirmed(&self, _order: &Order) -> Result<(), PluginError> {
        self.record("order_confirmed")
    }
    async fn order_updated(&self, _order: &Order) -> Result<(), PluginError> {
        self.record("order_updated")
    }
    async fn order_fully_paid(&self, _order: &Order) -> Result<(), PluginError> {
        self.record("order_fully_paid")
    }
    async fn order_cancelled(&self, _order: &Order) -> Result<(), PluginError> {
        self.record("order_cancelled")
    }
    async fn order_fulfilled(&self, _order: &Order) -> Result<(), PluginError> {
        self.record("order_fulfilled")
    }
    async fn fulfillment_created(
        &self,
        _fulfillment: &Fulfillment,
        _notify_customer: bool,
    ) -> Result<(), PluginError> {
        self.record("fulfillment_created")
    }
    async fn fulfillment_canceled(&self, _fulfillment: &Fulfillment) -> Result<(), PluginError> {
        self.record("fulfillment_canceled")
    }
    async fn fulfillment_approved(
        &self,
        _fulfillment: &Fulfillment,
        _notify_customer: bool,
    ) -> Result<(), PluginError> {
        self.record("fulfillment_approved")
    }
    async fn tracking_number_updated(
        &self,
        _fulfillment: &Fulfillment,
    ) -> Result<(), PluginError> {
        self.record("tracking_number_updated")
    }
}

/// In-memory store wired to an order service.
pub struct TestApp {
    pub store: InMemoryStore,
    pub plugins: Arc<RecordingPlugins>,
    pub service: OrderService,
    pub channel_id: Uuid,
    pub warehouse_id: Uuid,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let store = InMemoryStore::new();
        let plugins = Arc::new(RecordingPlugins::default());
        let metrics = Arc::new(OrderMetrics::new().expect("metrics registry"));
        let service =
            OrderService::from_config(Arc::new(store.clone()), plugins.clone(), metrics, &config)
                .expect("order service");
        Self {
            store,
            plugins,
            service,
            channel_id: Uuid::new_v4(),
            warehouse_id: Uuid::new_v4(),
        }
    }

    pub async fn begin(&self) -> Transaction {
        self.service.begin().await.expect("begin transaction")
    }

    /// Saves a draft order with the given shipping price.
    pub async fn draft_order(&self, shipping: Decimal) -> Order {
        let mut tx = self.begin().await;
        let mut order = Order::new(self.channel_id, Currency::USD, OrderStatus::Draft);
        order.user_email = Some("buyer@example.com".into());
        order.shipping_price = TaxedMoney::from_net(usd(shipping), dec!(0)).expect("shipping price");
        tx.orders().save(&order).await.expect("save order");
        let order = self
            .service
            .recalculate_order(&mut tx, order.id, RecalculateOptions::default())
            .await
            .expect("recalculate");
        self.service.commit(tx).await.expect("commit");
        order
    }

    pub async fn seed_stock(&self, variant_id: Uuid, quantity: i32) -> Stock {
        let mut tx = self.begin().await;
        let stock = Stock::new(self.warehouse_id, variant_id, quantity);
        tx.stocks().save(&stock).await.expect("save stock");
        tx.commit().await.expect("commit");
        stock
    }

    /// Adds one line per variant to a fresh draft and places the order.
    pub async fn placed_order(&self, items: Vec<(VariantSnapshot, i32)>) -> (Order, Vec<OrderLine>) {
        let order = self.draft_order(dec!(0)).await;
        let mut tx = self.begin().await;
        for (variant, quantity) in items {
            self.service
                .add_variant_to_order(&mut tx, order.id, variant, quantity, None)
                .await
                .expect("add variant");
        }
        let order = self
            .service
            .order_created(&mut tx, order.id, None, true)
            .await
            .expect("place order");
        let lines = tx.orders().lines(order.id).await.expect("lines");
        self.service.commit(tx).await.expect("commit");
        (order, lines)
    }

    pub async fn stock(&self, variant_id: Uuid) -> Stock {
        let mut tx = self.begin().await;
        tx.stocks()
            .get_for_update(variant_id, self.warehouse_id)
            .await
            .expect("read stock")
            .expect("stock row")
    }
}

pub fn usd(amount: Decimal) -> Money {
    Money::new(amount, Currency::USD)
}

pub fn variant(price: Decimal, track_inventory: bool) -> VariantSnapshot {
    VariantSnapshot {
        variant_id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        category_id: None,
        collection_ids: vec![],
        product_name: "Trail Shoe".into(),
        variant_name: "EU 42".into(),
        sku: Some("TRAIL-42".into()),
        is_shipping_required: true,
        track_inventory,
        unit_price_net: usd(price),
        tax_rate: dec!(0),
    }
}
