use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{Fulfillment, Order};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin {plugin} failed: {message}")]
    Failed { plugin: String, message: String },

    #[error("Notification channel closed")]
    ChannelClosed,
}

/// Snapshot handed to the plugin manager after a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderNotification {
    OrderCreated(Order),
    OrderConfirmed(Order),
    OrderUpdated(Order),
    OrderFullyPaid(Order),
    OrderCancelled(Order),
    OrderFulfilled(Order),
    FulfillmentCreated {
        fulfillment: Fulfillment,
        notify_customer: bool,
    },
    FulfillmentCanceled(Fulfillment),
    FulfillmentApproved {
        fulfillment: Fulfillment,
        notify_customer: bool,
    },
    TrackingNumberUpdated(Fulfillment),
}

impl OrderNotification {
    pub fn name(&self) -> &'static str {
        match self {
            OrderNotification::OrderCreated(_) => "order_created",
            OrderNotification::OrderConfirmed(_) => "order_confirmed",
            OrderNotification::OrderUpdated(_) => "order_updated",
            OrderNotification::OrderFullyPaid(_) => "order_fully_paid",
            OrderNotification::OrderCancelled(_) => "order_cancelled",
            OrderNotification::OrderFulfilled(_) => "order_fulfilled",
            OrderNotification::FulfillmentCreated { .. } => "fulfillment_created",
            OrderNotification::FulfillmentCanceled(_) => "fulfillment_canceled",
            OrderNotification::FulfillmentApproved { .. } => "fulfillment_approved",
            OrderNotification::TrackingNumberUpdated(_) => "tracking_number_updated",
        }
    }
}

/// Hooks invoked after order state changes have been committed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginManager: Send + Sync {
    async fn order_created(&self, order: &Order) -> Result<(), PluginError>;
    async fn order_confirmed(&self, order: &Order) -> Result<(), PluginError>;
    async fn order_updated(&self, order: &Order) -> Result<(), PluginError>;
    async fn order_fully_paid(&self, order: &Order) -> Result<(), PluginError>;
    async fn order_cancelled(&self, order: &Order) -> Result<(), PluginError>;
    async fn order_fulfilled(&self, order: &Order) -> Result<(), PluginError>;
    async fn fulfillment_created(
        &self,
        fulfillment: &Fulfillment,
        notify_customer: bool,
    ) -> Result<(), PluginError>;
    async fn fulfillment_canceled(&self, fulfillment: &Fulfillment) -> Result<(), PluginError>;
    async fn fulfillment_approved(
        &self,
        fulfillment: &Fulfillment,
        notify_customer: bool,
    ) -> Result<(), PluginError>;
    async fn tracking_number_updated(&self, fulfillment: &Fulfillment)
        -> Result<(), PluginError>;
}

/// Routes a notification to the matching hook.
pub async fn dispatch(
    manager: &dyn PluginManager,
    notification: &OrderNotification,
) -> Result<(), PluginError> {
    match notification {
        OrderNotification::OrderCreated(order) => manager.order_created(order).await,
        OrderNotification::OrderConfirmed(order) => manager.order_confirmed(order).await,
        OrderNotification::OrderUpdated(order) => manager.order_updated(order).await,
        OrderNotification::OrderFullyPaid(order) => manager.order_fully_paid(order).await,
        OrderNotification::OrderCancelled(order) => manager.order_cancelled(order).await,
        OrderNotification::OrderFulfilled(order) => manager.order_fulfilled(order).await,
        OrderNotification::FulfillmentCreated {
            fulfillment,
            notify_customer,
        } => {
            manager
                .fulfillment_created(fulfillment, *notify_customer)
                .await
        }
        OrderNotification::FulfillmentCanceled(fulfillment) => {
            manager.fulfillment_canceled(fulfillment).await
        }
        OrderNotification::FulfillmentApproved {
            fulfillment,
            notify_customer,
        } => {
            manager
                .fulfillment_approved(fulfillment, *notify_customer)
                .await
        }
        OrderNotification::TrackingNumberUpdated(fulfillment) => {
            manager.tracking_number_updated(fulfillment).await
        }
    }
}

/// Plugin manager that forwards every notification to a channel consumer.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<OrderNotification>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<OrderNotification>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, notification: OrderNotification) -> Result<(), PluginError> {
        debug!(notification = notification.name(), "forwarding notification");
        self.sender.send(notification).await.map_err(|e| {
            warn!("Failed to send notification: {}", e);
            PluginError::ChannelClosed
        })
    }
}

#[async_trait]
impl PluginManager for EventSender {
    async fn order_created(&self, order: &Order) -> Result<(), PluginError> {
        self.send(OrderNotification::OrderCreated(order.clone())).await
    }

    async fn order_confirmed(&self, order: &Order) -> Result<(), PluginError> {
        self.send(OrderNotification::OrderConfirmed(order.clone())).await
    }

    async fn order_updated(&self, order: &Order) -> Result<(), PluginError> {
        self.send(OrderNotification::OrderUpdated(order.clone())).await
    }

    async fn order_fully_paid(&self, order: &Order) -> Result<(), PluginError> {
        self.send(OrderNotification::OrderFullyPaid(order.clone())).await
    }

    async fn order_cancelled(&self, order: &Order) -> Result<(), PluginError> {
        self.send(OrderNotification::OrderCancelled(order.clone())).await
    }

    async fn order_fulfilled(&self, order: &Order) -> Result<(), PluginError> {
        self.send(OrderNotification::OrderFulfilled(order.clone())).await
    }

    async fn fulfillment_created(
        &self,
        fulfillment: &Fulfillment,
        notify_customer: bool,
    ) -> Result<(), PluginError> {
        self.send(OrderNotification::FulfillmentCreated {
            fulfillment: fulfillment.clone(),
            notify_customer,
        })
        .await
    }

    async fn fulfillment_canceled(&self, fulfillment: &Fulfillment) -> Result<(), PluginError> {
        self.send(OrderNotification::FulfillmentCanceled(fulfillment.clone()))
            .await
    }

    async fn fulfillment_approved(
        &self,
        fulfillment: &Fulfillment,
        notify_customer: bool,
    ) -> Result<(), PluginError> {
        self.send(OrderNotification::FulfillmentApproved {
            fulfillment: fulfillment.clone(),
            notify_customer,
        })
        .await
    }

    async fn tracking_number_updated(
        &self,
        fulfillment: &Fulfillment,
    ) -> Result<(), PluginError> {
        self.send(OrderNotification::TrackingNumberUpdated(fulfillment.clone()))
            .await
    }
}
