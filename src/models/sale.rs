use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::catalogue::Catalogue;
use super::order_discount::DiscountValueType;
use crate::money::Currency;

/// Per-channel value of a sale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaleChannelListing {
    pub channel_id: Uuid,
    pub discount_value: Decimal,
    pub currency: Currency,
}

/// Catalogue-wide price reduction. While active it lowers the unit price of
/// every matching order line in the channels it is listed in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_sale_values"))]
pub struct Sale {
    pub id: Uuid,

    #[validate(length(min = 1, max = 255))]
    pub name: String,

    pub sale_type: DiscountValueType,

    pub start_date: DateTime<Utc>,

    pub end_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub catalogue: Catalogue,

    pub channel_listings: Vec<SaleChannelListing>,
}

fn validate_sale_values(sale: &Sale) -> Result<(), ValidationError> {
    if sale.end_date.map_or(false, |end| end < sale.start_date) {
        return Err(ValidationError::new("end_before_start"));
    }
    for listing in &sale.channel_listings {
        if listing.discount_value < Decimal::ZERO {
            return Err(ValidationError::new("negative_listing_value"));
        }
        if sale.sale_type == DiscountValueType::Percentage
            && listing.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(ValidationError::new("percentage_above_100"));
        }
    }
    Ok(())
}

impl Sale {
    pub fn listing_for(&self, channel_id: Uuid) -> Option<&SaleChannelListing> {
        self.channel_listings
            .iter()
            .find(|listing| listing.channel_id == channel_id)
    }

    /// Started at or before `at` and not yet over. The end date itself is
    /// still part of the sale.
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.start_date <= at && self.end_date.map_or(true, |end| end >= at)
    }
}
