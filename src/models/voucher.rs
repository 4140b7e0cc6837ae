use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::catalogue::Catalogue;
use super::order_discount::DiscountValueType;
use crate::errors::NotApplicable;
use crate::money::{Currency, Money};

/// What a voucher discounts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoucherType {
    Shipping,
    EntireOrder,
    SpecificProduct(Catalogue),
}

/// Per-channel value of a voucher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoucherChannelListing {
    pub channel_id: Uuid,
    pub discount_value: Decimal,
    pub currency: Currency,
    pub min_spent: Option<Decimal>,
}

impl VoucherChannelListing {
    pub fn min_spent(&self) -> Option<Money> {
        self.min_spent
            .map(|amount| Money::new(amount, self.currency))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_voucher_values"))]
pub struct Voucher {
    pub id: Uuid,

    #[validate(length(min = 1, max = 255))]
    pub code: String,

    pub name: Option<String>,

    pub voucher_type: VoucherType,

    pub discount_value_type: DiscountValueType,

    /// `None` and `Some(0)` mean unlimited.
    pub usage_limit: Option<i32>,

    #[validate(range(min = 0))]
    pub used: i32,

    pub start_date: DateTime<Utc>,

    pub end_date: Option<DateTime<Utc>>,

    /// Specific-product vouchers only discount the cheapest matching unit.
    pub apply_once_per_order: bool,

    pub apply_once_per_customer: bool,

    pub only_for_staff: bool,

    /// Shipping countries allowed for shipping vouchers; empty allows all.
    pub countries: Vec<String>,

    #[validate(range(min = 0))]
    pub min_checkout_items_quantity: i32,

    pub channel_listings: Vec<VoucherChannelListing>,
}

fn validate_voucher_values(voucher: &Voucher) -> Result<(), ValidationError> {
    match voucher.usage_limit {
        Some(limit) if limit < 0 => return Err(ValidationError::new("negative_usage_limit")),
        Some(limit) if limit > 0 && voucher.used > limit => {
            return Err(ValidationError::new("usage_limit_exceeded"))
        }
        _ => {}
    }
    for listing in &voucher.channel_listings {
        if listing.discount_value < Decimal::ZERO
            || listing.min_spent.map_or(false, |min| min < Decimal::ZERO)
        {
            return Err(ValidationError::new("negative_listing_value"));
        }
        if voucher.discount_value_type == DiscountValueType::Percentage
            && listing.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(ValidationError::new("percentage_above_100"));
        }
    }
    Ok(())
}

impl Voucher {
    pub fn listing_for(&self, channel_id: Uuid) -> Option<&VoucherChannelListing> {
        self.channel_listings
            .iter()
            .find(|listing| listing.channel_id == channel_id)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && self.end_date.map_or(true, |end| end > now)
    }

    /// Only a positive `usage_limit` caps usage.
    pub fn usage_limit(&self) -> Option<i32> {
        self.usage_limit.filter(|limit| *limit > 0)
    }

    pub fn has_usage_left(&self) -> bool {
        self.usage_limit().map_or(true, |limit| self.used < limit)
    }

    /// Fails when fewer items are ordered than the voucher requires. A failure
    /// for `quantity` implies a failure for every smaller quantity.
    pub fn validate_min_checkout_items_quantity(&self, quantity: i32) -> Result<(), NotApplicable> {
        let min = self.min_checkout_items_quantity;
        if min > 0 && min > quantity {
            return Err(NotApplicable::min_checkout_items_quantity(min));
        }
        Ok(())
    }
}

/// Records that a customer used a once-per-customer voucher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherCustomer {
    pub voucher_id: Uuid,
    pub customer_email: String,
}
