use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::PricingConfig;
use crate::db::Transaction;
use crate::errors::{NotApplicable, OrderError};
use crate::models::{
    Catalogue, DiscountValueType, Order, OrderLine, Sale, Voucher, VoucherChannelListing,
    VoucherType,
};
use crate::money::{Currency, ExchangeRates, Money, TaxedMoney};

const NOT_ASSIGNED_TO_CHANNEL: &str = "This voucher is not assigned to this channel";
const ONCE_PER_CUSTOMER: &str = "This offer is valid only once per customer.";

/// Who is applying a voucher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomerInfo {
    pub email: Option<String>,
    pub user_id: Option<Uuid>,
    pub is_staff: bool,
}

/// Sum of line totals.
pub fn lines_subtotal(currency: Currency, lines: &[OrderLine]) -> Result<TaxedMoney, OrderError> {
    lines
        .iter()
        .try_fold(TaxedMoney::zero(currency), |acc, line| {
            acc.try_add(&line.total_price)
        })
        .map_err(OrderError::from)
}

pub fn lines_total_quantity(lines: &[OrderLine]) -> i32 {
    lines.iter().map(|line| line.quantity).sum()
}

/// Sales running when an order is being edited.
#[derive(Clone, Debug, Default)]
pub struct DiscountContext {
    sales: Vec<Sale>,
}

impl DiscountContext {
    pub fn new(sales: Vec<Sale>) -> Self {
        Self { sales }
    }

    pub fn sales(&self) -> &[Sale] {
        &self.sales
    }

    pub fn is_empty(&self) -> bool {
        self.sales.is_empty()
    }
}

/// Best sale for a line and what it takes off one unit.
#[derive(Clone, Debug, PartialEq)]
pub struct SaleDiscount {
    pub sale_id: Uuid,
    pub sale_name: String,
    pub amount: Money,
}

#[derive(Clone)]
pub struct DiscountService {
    exchange_rates: Arc<ExchangeRates>,
    display_gross_prices: bool,
}

impl DiscountService {
    pub fn new(exchange_rates: ExchangeRates, display_gross_prices: bool) -> Self {
        Self {
            exchange_rates: Arc::new(exchange_rates),
            display_gross_prices,
        }
    }

    pub fn from_config(pricing: &PricingConfig) -> Result<Self, OrderError> {
        Ok(Self::new(
            pricing.exchange_rates()?,
            pricing.display_gross_prices,
        ))
    }

    pub fn display_gross_prices(&self) -> bool {
        self.display_gross_prices
    }

    /// Price shown to customers, gross or net depending on configuration.
    pub fn displayed(&self, price: &TaxedMoney) -> Money {
        price.display(self.display_gross_prices)
    }

    /// Discount taken off `base`. Never negative and never more than `base`.
    /// Fixed values are converted from `value_currency` first.
    pub fn discount_amount_for(
        &self,
        value_type: DiscountValueType,
        value: Decimal,
        value_currency: Currency,
        base: &Money,
    ) -> Result<Money, OrderError> {
        if value < Decimal::ZERO {
            return Err(OrderError::Validation(format!(
                "Discount value must not be negative, got {}",
                value
            )));
        }
        let base = base.clamp_non_negative();
        let discount = match value_type {
            DiscountValueType::Percentage => base.try_percentage(value)?,
            DiscountValueType::Fixed => self
                .exchange_rates
                .convert(&Money::new(value, value_currency), base.currency)?,
        };
        Ok(discount.try_min(&base)?.clamp_non_negative())
    }

    /// Voucher discount for an order. The minimum item quantity is checked
    /// before anything else so that the UI can show the required minimum.
    #[instrument(skip_all, fields(order_id = %order.id, voucher_id = %voucher.id))]
    pub fn get_voucher_discount_for_order(
        &self,
        order: &Order,
        lines: &[OrderLine],
        voucher: &Voucher,
    ) -> Result<Money, OrderError> {
        voucher.validate_min_checkout_items_quantity(lines_total_quantity(lines))?;

        let listing = voucher
            .listing_for(order.channel_id)
            .ok_or_else(|| NotApplicable::new(NOT_ASSIGNED_TO_CHANNEL))?;
        let subtotal = lines_subtotal(order.currency, lines)?;
        self.validate_min_spent(listing, &subtotal)?;

        let discount = match &voucher.voucher_type {
            VoucherType::Shipping => self.shipping_voucher_discount(order, lines, voucher, listing)?,
            VoucherType::EntireOrder => self.discount_amount_for(
                voucher.discount_value_type,
                listing.discount_value,
                listing.currency,
                &self.displayed(&subtotal),
            )?,
            VoucherType::SpecificProduct(catalogue) => {
                self.products_voucher_discount(voucher, listing, catalogue, lines)?
            }
        };
        debug!(discount = %discount, "voucher discount computed");
        Ok(discount)
    }

    fn shipping_voucher_discount(
        &self,
        order: &Order,
        lines: &[OrderLine],
        voucher: &Voucher,
        listing: &VoucherChannelListing,
    ) -> Result<Money, OrderError> {
        if !lines.iter().any(|line| line.is_shipping_required) {
            return Err(NotApplicable::new("Your order does not require shipping.").into());
        }
        if order.shipping_method_id.is_none() {
            return Err(NotApplicable::new("Please select a delivery method first.").into());
        }
        if !voucher.countries.is_empty() {
            let allowed = order.shipping_country.as_deref().map_or(false, |country| {
                voucher
                    .countries
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(country))
            });
            if !allowed {
                return Err(NotApplicable::new("This offer is not valid in your country.").into());
            }
        }
        self.discount_amount_for(
            voucher.discount_value_type,
            listing.discount_value,
            listing.currency,
            &self.displayed(&order.shipping_price),
        )
    }

    fn products_voucher_discount(
        &self,
        voucher: &Voucher,
        listing: &VoucherChannelListing,
        catalogue: &Catalogue,
        lines: &[OrderLine],
    ) -> Result<Money, OrderError> {
        let prices: Vec<(Money, i32)> = lines
            .iter()
            .filter(|line| line.quantity > 0 && catalogue.matches(line))
            .map(|line| (self.displayed(&line.unit_price), line.quantity))
            .collect();
        if prices.is_empty() {
            return Err(NotApplicable::new("This offer is only valid for selected items.").into());
        }
        self.get_products_voucher_discount(
            voucher.discount_value_type,
            listing,
            &prices,
            voucher.apply_once_per_order,
        )
    }

    /// Discount over unit prices given as `(unit price, quantity)`. Every unit
    /// is discounted on its own; with `apply_once_per_order` only the
    /// cheapest unit is.
    pub fn get_products_voucher_discount(
        &self,
        value_type: DiscountValueType,
        listing: &VoucherChannelListing,
        prices: &[(Money, i32)],
        apply_once_per_order: bool,
    ) -> Result<Money, OrderError> {
        let (first, _) = prices
            .first()
            .ok_or_else(|| OrderError::Validation("prices must not be empty".to_string()))?;
        let currency = first.currency;

        if apply_once_per_order {
            let mut cheapest = *first;
            for (price, _) in prices {
                if price.try_lt(&cheapest)? {
                    cheapest = *price;
                }
            }
            return self.discount_amount_for(
                value_type,
                listing.discount_value,
                listing.currency,
                &cheapest,
            );
        }

        prices.iter().try_fold(Money::zero(currency), |total, (price, quantity)| {
            let per_unit =
                self.discount_amount_for(value_type, listing.discount_value, listing.currency, price)?;
            Ok(total.try_add(&per_unit.try_multiply(Decimal::from(*quantity))?)?)
        })
    }

    pub fn validate_min_spent(
        &self,
        listing: &VoucherChannelListing,
        total: &TaxedMoney,
    ) -> Result<(), OrderError> {
        let Some(min_spent) = listing.min_spent() else {
            return Ok(());
        };
        let value = self.displayed(total);
        let threshold = self.exchange_rates.convert(&min_spent, value.currency)?;
        if value.try_lt(&threshold)? {
            return Err(NotApplicable::min_spent(min_spent).into());
        }
        Ok(())
    }

    /// Active window and usage limit.
    pub fn validate_voucher_availability(
        &self,
        voucher: &Voucher,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if !voucher.is_active(now) {
            return Err(NotApplicable::new("This voucher is not active.").into());
        }
        if !voucher.has_usage_left() {
            return Err(NotApplicable::new("This voucher has reached its usage limit.").into());
        }
        Ok(())
    }

    /// Full applicability check used when a voucher is attached to an order.
    #[instrument(skip(self, tx, voucher, total, customer), fields(voucher_id = %voucher.id))]
    pub async fn validate_voucher(
        &self,
        tx: &mut Transaction,
        voucher: &Voucher,
        total: &TaxedMoney,
        quantity: i32,
        customer: &CustomerInfo,
        channel_id: Uuid,
    ) -> Result<(), OrderError> {
        voucher.validate_min_checkout_items_quantity(quantity)?;
        let listing = voucher
            .listing_for(channel_id)
            .ok_or_else(|| NotApplicable::new(NOT_ASSIGNED_TO_CHANNEL))?;
        self.validate_min_spent(listing, total)?;

        if voucher.apply_once_per_customer {
            let email = customer
                .email
                .as_deref()
                .ok_or_else(|| NotApplicable::new(ONCE_PER_CUSTOMER))?;
            if tx.vouchers().customer_usage_exists(voucher.id, email).await? {
                return Err(NotApplicable::new(ONCE_PER_CUSTOMER).into());
            }
        }
        if voucher.only_for_staff && !customer.is_staff {
            return Err(NotApplicable::new("This offer is valid only for staff customers.").into());
        }
        Ok(())
    }

    pub async fn increase_voucher_usage(
        &self,
        tx: &mut Transaction,
        voucher_id: Uuid,
    ) -> Result<Voucher, OrderError> {
        let mut voucher = tx.vouchers().get(voucher_id).await?;
        if !voucher.has_usage_left() {
            warn!(voucher_id = %voucher_id, "voucher usage limit reached");
            return Err(NotApplicable::new("This voucher has reached its usage limit.").into());
        }
        voucher.used += 1;
        voucher.validate()?;
        tx.vouchers().save(&voucher).await?;
        Ok(voucher)
    }

    pub async fn decrease_voucher_usage(
        &self,
        tx: &mut Transaction,
        voucher_id: Uuid,
    ) -> Result<Voucher, OrderError> {
        let mut voucher = tx.vouchers().get(voucher_id).await?;
        voucher.used = (voucher.used - 1).max(0);
        tx.vouchers().save(&voucher).await?;
        Ok(voucher)
    }

    pub async fn add_voucher_usage_by_customer(
        &self,
        tx: &mut Transaction,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<(), OrderError> {
        if tx
            .vouchers()
            .customer_usage_exists(voucher_id, customer_email)
            .await?
        {
            return Err(NotApplicable::new(ONCE_PER_CUSTOMER).into());
        }
        tx.vouchers()
            .add_customer_usage(voucher_id, customer_email)
            .await?;
        Ok(())
    }

    pub async fn remove_voucher_usage_by_customer(
        &self,
        tx: &mut Transaction,
        voucher_id: Uuid,
        customer_email: &str,
    ) -> Result<(), OrderError> {
        tx.vouchers()
            .remove_customer_usage(voucher_id, customer_email)
            .await?;
        Ok(())
    }

    pub async fn fetch_active_discounts(
        &self,
        tx: &mut Transaction,
        now: DateTime<Utc>,
    ) -> Result<DiscountContext, OrderError> {
        let sales = tx.sales().active(now).await?;
        debug!(sales = sales.len(), "active sales loaded");
        Ok(DiscountContext::new(sales))
    }

    /// Discount one sale gives a unit priced `base`, or `None` when the sale
    /// does not cover the line or is not listed in the channel.
    pub fn get_sale_discount(
        &self,
        sale: &Sale,
        line: &OrderLine,
        channel_id: Uuid,
        base: &Money,
    ) -> Result<Option<Money>, OrderError> {
        if !sale.catalogue.matches(line) {
            return Ok(None);
        }
        let Some(listing) = sale.listing_for(channel_id) else {
            return Ok(None);
        };
        let discount = self.discount_amount_for(
            sale.sale_type,
            listing.discount_value,
            listing.currency,
            base,
        )?;
        Ok(Some(discount))
    }

    /// Picks the sale giving the lowest unit price. On a tie the sale that
    /// started first wins.
    pub fn calculate_discounted_price(
        &self,
        context: &DiscountContext,
        line: &OrderLine,
        channel_id: Uuid,
        base: &Money,
    ) -> Result<Option<SaleDiscount>, OrderError> {
        let mut best: Option<SaleDiscount> = None;
        for sale in context.sales() {
            let Some(amount) = self.get_sale_discount(sale, line, channel_id, base)? else {
                continue;
            };
            let better = match &best {
                Some(current) => current.amount.try_lt(&amount)?,
                None => amount.amount > Decimal::ZERO,
            };
            if better {
                best = Some(SaleDiscount {
                    sale_id: sale.id,
                    sale_name: sale.name.clone(),
                    amount,
                });
            }
        }
        Ok(best)
    }

    /// Sets the line's unit discount and refreshes its totals.
    ///
    /// A manual line discount always wins over sales. Without one, the best
    /// sale from `sales` applies. Passing `None` keeps whatever sale
    /// discount the line already carries, which is how placed orders keep
    /// the price they were sold at.
    pub fn apply_line_discount(
        &self,
        line: &mut OrderLine,
        sales: Option<&DiscountContext>,
        channel_id: Uuid,
    ) -> Result<(), OrderError> {
        let base = line.undiscounted_unit_price.net;
        let discount = match (line.unit_discount_type, sales) {
            (Some(value_type), _) => {
                line.sale_id = None;
                self.discount_amount_for(value_type, line.unit_discount_value, line.currency, &base)?
            }
            (None, Some(context)) => {
                let had_sale = line.sale_id.take().is_some();
                match self.calculate_discounted_price(context, line, channel_id, &base)? {
                    Some(best) => {
                        line.sale_id = Some(best.sale_id);
                        line.unit_discount_reason = Some(format!("Sale: {}", best.sale_name));
                        best.amount
                    }
                    None => {
                        if had_sale {
                            line.unit_discount_reason = None;
                        }
                        Money::zero(line.currency)
                    }
                }
            }
            (None, None) if line.sale_id.is_some() => {
                Money::new(line.unit_discount_amount, line.currency).try_min(&base)?
            }
            (None, None) => Money::zero(line.currency),
        };
        let quantity = Decimal::from(line.quantity);

        line.unit_discount_amount = discount.amount;
        line.unit_price = TaxedMoney::from_net(base.try_sub(&discount)?, line.tax_rate)?;
        line.total_price = line.unit_price.try_multiply(quantity)?;
        line.undiscounted_total_price = line.undiscounted_unit_price.try_multiply(quantity)?;
        Ok(())
    }
}
