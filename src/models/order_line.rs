use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order_discount::DiscountValueType;
use crate::money::{Currency, Money, MoneyError, TaxedMoney};

/// A line of an order. Product data is a snapshot taken when the line was
/// added, so later catalogue edits do not change placed orders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,

    pub variant_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub collection_ids: Vec<Uuid>,
    pub product_name: String,
    pub variant_name: String,
    pub product_sku: Option<String>,

    pub is_shipping_required: bool,
    /// Whether stock rows are touched for this line.
    pub track_inventory: bool,

    pub quantity: i32,
    pub quantity_fulfilled: i32,

    pub currency: Currency,
    pub undiscounted_unit_price: TaxedMoney,
    pub unit_price: TaxedMoney,
    pub undiscounted_total_price: TaxedMoney,
    pub total_price: TaxedMoney,

    /// Per-unit discount taken off the undiscounted net price.
    pub unit_discount_amount: Decimal,
    pub unit_discount_type: Option<DiscountValueType>,
    pub unit_discount_value: Decimal,
    pub unit_discount_reason: Option<String>,
    /// Catalogue sale behind `unit_discount_amount` when no manual line
    /// discount is set.
    #[serde(default)]
    pub sale_id: Option<Uuid>,

    pub tax_rate: Decimal,

    pub created_at: DateTime<Utc>,
}

impl OrderLine {
    pub fn quantity_unfulfilled(&self) -> i32 {
        self.quantity - self.quantity_fulfilled
    }

    pub fn is_fully_fulfilled(&self) -> bool {
        self.quantity_unfulfilled() <= 0
    }

    pub fn unit_discount(&self) -> Money {
        Money::new(self.unit_discount_amount, self.currency)
    }
}

/// Catalogue snapshot of a variant, supplied by the caller when adding a
/// variant to an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantSnapshot {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub category_id: Option<Uuid>,
    pub collection_ids: Vec<Uuid>,
    pub product_name: String,
    pub variant_name: String,
    pub sku: Option<String>,
    pub is_shipping_required: bool,
    pub track_inventory: bool,
    /// Channel price before sales, net of tax.
    pub unit_price_net: Money,
    pub tax_rate: Decimal,
}

impl VariantSnapshot {
    pub fn into_line(self, order_id: Uuid, quantity: i32) -> Result<OrderLine, MoneyError> {
        let currency = self.unit_price_net.currency;
        let unit = TaxedMoney::from_net(self.unit_price_net, self.tax_rate)?;
        let total = unit.try_multiply(Decimal::from(quantity))?;
        Ok(OrderLine {
            id: Uuid::new_v4(),
            order_id,
            variant_id: Some(self.variant_id),
            product_id: Some(self.product_id),
            category_id: self.category_id,
            collection_ids: self.collection_ids,
            product_name: self.product_name,
            variant_name: self.variant_name,
            product_sku: self.sku,
            is_shipping_required: self.is_shipping_required,
            track_inventory: self.track_inventory,
            quantity,
            quantity_fulfilled: 0,
            currency,
            undiscounted_unit_price: unit,
            unit_price: unit,
            undiscounted_total_price: total,
            total_price: total,
            unit_discount_amount: Decimal::ZERO,
            unit_discount_type: None,
            unit_discount_value: Decimal::ZERO,
            unit_discount_reason: None,
            sale_id: None,
            tax_rate: self.tax_rate,
            created_at: Utc::now(),
        })
    }
}
