use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use rust_decimal::Decimal;

use crate::money::Money;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscountValueType {
    Fixed,
    Percentage,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderDiscountType {
    /// Mirrors the order's voucher; at most one per order.
    Voucher,
    /// Added by staff.
    Manual,
}

/// Order-level discount. `amount` is always derived from `value` and
/// `value_type` during recalculation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderDiscount {
    pub id: Uuid,
    pub order_id: Uuid,
    pub discount_type: OrderDiscountType,
    pub value_type: DiscountValueType,
    pub value: Decimal,
    pub amount: Money,
    pub name: Option<String>,
    pub translated_name: Option<String>,
    pub reason: Option<String>,
    pub voucher_id: Option<Uuid>,
}

/// Staff input for creating or updating a manual discount.
#[derive(Clone, Debug, PartialEq, Validate)]
#[validate(schema(function = "validate_discount_value"))]
pub struct DiscountInput {
    pub value_type: DiscountValueType,
    pub value: Decimal,
    #[validate(length(max = 255))]
    pub reason: Option<String>,
    #[validate(length(max = 255))]
    pub name: Option<String>,
}

fn validate_discount_value(input: &DiscountInput) -> Result<(), ValidationError> {
    if input.value <= Decimal::ZERO {
        return Err(ValidationError::new("discount_value_not_positive"));
    }
    if input.value_type == DiscountValueType::Percentage && input.value > Decimal::ONE_HUNDRED {
        return Err(ValidationError::new("percentage_above_100"));
    }
    Ok(())
}
