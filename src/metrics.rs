//! Prometheus counters for order processing.
//!
//! `OrderMetrics` owns its registry; construct it once at startup and share
//! it behind an `Arc`.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct OrderMetrics {
    registry: Registry,
    pub fulfillments_created: IntCounter,
    pub fulfillments_canceled: IntCounter,
    pub insufficient_stock: IntCounter,
    pub order_recalculations: IntCounter,
    pub voucher_not_applicable: IntCounter,
    pub notification_failures: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl OrderMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Self {
            fulfillments_created: counter(
                &registry,
                "fulfillments_created_total",
                "Total number of fulfillments created",
            )?,
            fulfillments_canceled: counter(
                &registry,
                "fulfillments_canceled_total",
                "Total number of fulfillments canceled",
            )?,
            insufficient_stock: counter(
                &registry,
                "insufficient_stock_total",
                "Total number of operations rejected for insufficient stock",
            )?,
            order_recalculations: counter(
                &registry,
                "order_recalculations_total",
                "Total number of order total recalculations",
            )?,
            voucher_not_applicable: counter(
                &registry,
                "voucher_not_applicable_total",
                "Total number of voucher applications rejected as not applicable",
            )?,
            notification_failures: counter(
                &registry,
                "notification_failures_total",
                "Total number of plugin notifications that failed after commit",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format of all counters.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let first = OrderMetrics::new().unwrap();
        let second = OrderMetrics::new().unwrap();
        first.fulfillments_created.inc();
        assert_eq!(first.fulfillments_created.get(), 1);
        assert_eq!(second.fulfillments_created.get(), 0);
        assert!(first.render().contains("fulfillments_created_total 1"));
    }
}
