//! Exact-decimal money arithmetic.
//!
//! Every monetary computation in the crate goes through [`Money`] and
//! [`TaxedMoney`]. Amounts are `rust_decimal::Decimal`; rounding always happens
//! at the currency's minor-unit precision using banker's rounding
//! (round-half-even).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Currencies without a minor unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "ISK", "JPY", "KMF", "KRW", "PYG", "RWF", "UGX", "UYI", "VND",
    "VUV", "XAF", "XOF", "XPF",
];

/// Currencies with three minor-unit digits.
const THREE_DECIMAL_CURRENCIES: &[&str] = &["BHD", "IQD", "JOD", "KWD", "LYD", "OMR", "TND"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("Currency mismatch: {left} != {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("No exchange rate configured from {from} to {to}")]
    MissingExchangeRate { from: Currency, to: Currency },

    #[error("Amount out of range: {0}")]
    Overflow(String),
}

fn checked(result: Option<Decimal>, operation: &str) -> Result<Decimal, MoneyError> {
    result.ok_or_else(|| MoneyError::Overflow(operation.to_string()))
}

/// ISO 4217 alphabetic currency code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const USD: Currency = Currency(*b"USD");
    pub const EUR: Currency = Currency(*b"EUR");

    pub fn new(code: &str) -> Result<Self, MoneyError> {
        let code = code.trim();
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_alphabetic()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        let mut out = [0u8; 3];
        for (slot, byte) in out.iter_mut().zip(bytes) {
            *slot = byte.to_ascii_uppercase();
        }
        Ok(Self(out))
    }

    pub fn code(&self) -> &str {
        // Constructed only from ASCII letters.
        std::str::from_utf8(&self.0).unwrap_or("XXX")
    }

    /// Number of minor-unit digits.
    pub fn precision(&self) -> u32 {
        let code = self.code();
        if ZERO_DECIMAL_CURRENCIES.contains(&code) {
            0
        } else if THREE_DECIMAL_CURRENCIES.contains(&code) {
            3
        } else {
            2
        }
    }

    /// Rounds `amount` half-even to this currency's precision.
    pub fn round(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.precision(), RoundingStrategy::MidpointNearestEven)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.code())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.code().to_string()
    }
}

/// An amount tagged with its currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    pub fn try_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        let amount = checked(self.amount.checked_add(other.amount), "add")?;
        Ok(Money::new(amount, self.currency))
    }

    pub fn try_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        let amount = checked(self.amount.checked_sub(other.amount), "subtract")?;
        Ok(Money::new(amount, self.currency))
    }

    /// Multiplies by `factor` and rounds to the currency precision.
    pub fn try_multiply(&self, factor: Decimal) -> Result<Money, MoneyError> {
        let amount = checked(self.amount.checked_mul(factor), "multiply")?;
        Ok(Money::new(self.currency.round(amount), self.currency))
    }

    /// `percent` of this amount, e.g. `try_percentage(dec!(10))` is a tenth.
    pub fn try_percentage(&self, percent: Decimal) -> Result<Money, MoneyError> {
        let factor = checked(percent.checked_div(Decimal::ONE_HUNDRED), "percentage")?;
        self.try_multiply(factor)
    }

    pub fn quantize(&self) -> Money {
        Money::new(self.currency.round(self.amount), self.currency)
    }

    pub fn try_min(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(if other.amount < self.amount { *other } else { *self })
    }

    pub fn try_lt(&self, other: &Money) -> Result<bool, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(self.amount < other.amount)
    }

    pub fn clamp_non_negative(&self) -> Money {
        if self.amount.is_sign_negative() {
            Money::zero(self.currency)
        } else {
            *self
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Net and gross variants of the same price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxedMoney {
    pub net: Money,
    pub gross: Money,
}

impl TaxedMoney {
    pub fn new(net: Money, gross: Money) -> Result<Self, MoneyError> {
        net.ensure_same_currency(&gross)?;
        Ok(Self { net, gross })
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            net: Money::zero(currency),
            gross: Money::zero(currency),
        }
    }

    /// Builds a taxed price from its net part and a tax rate such as `0.23`.
    pub fn from_net(net: Money, tax_rate: Decimal) -> Result<Self, MoneyError> {
        let net = net.quantize();
        let factor = checked(Decimal::ONE.checked_add(tax_rate), "tax rate")?;
        Ok(Self {
            net,
            gross: net.try_multiply(factor)?,
        })
    }

    pub fn currency(&self) -> Currency {
        self.net.currency
    }

    pub fn try_add(&self, other: &TaxedMoney) -> Result<TaxedMoney, MoneyError> {
        Ok(Self {
            net: self.net.try_add(&other.net)?,
            gross: self.gross.try_add(&other.gross)?,
        })
    }

    pub fn try_sub(&self, other: &TaxedMoney) -> Result<TaxedMoney, MoneyError> {
        Ok(Self {
            net: self.net.try_sub(&other.net)?,
            gross: self.gross.try_sub(&other.gross)?,
        })
    }

    /// Takes the same flat `amount` off both net and gross.
    pub fn subtract_amount(&self, amount: &Money) -> Result<TaxedMoney, MoneyError> {
        Ok(Self {
            net: self.net.try_sub(amount)?,
            gross: self.gross.try_sub(amount)?,
        })
    }

    pub fn try_multiply(&self, factor: Decimal) -> Result<TaxedMoney, MoneyError> {
        Ok(Self {
            net: self.net.try_multiply(factor)?,
            gross: self.gross.try_multiply(factor)?,
        })
    }

    pub fn clamp_non_negative(&self) -> TaxedMoney {
        Self {
            net: self.net.clamp_non_negative(),
            gross: self.gross.clamp_non_negative(),
        }
    }

    /// The amount shown to customers.
    pub fn display(&self, gross: bool) -> Money {
        if gross {
            self.gross
        } else {
            self.net
        }
    }
}

/// Conversion table used when a fixed discount is listed in a currency other
/// than the order's.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRates {
    rates: HashMap<(Currency, Currency), Decimal>,
}

impl ExchangeRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: Currency, to: Currency, rate: Decimal) {
        self.rates.insert((from, to), rate);
    }

    pub fn with_rate(mut self, from: Currency, to: Currency, rate: Decimal) -> Self {
        self.insert(from, to, rate);
        self
    }

    pub fn convert(&self, money: &Money, to: Currency) -> Result<Money, MoneyError> {
        if money.currency == to {
            return Ok(*money);
        }
        let missing = MoneyError::MissingExchangeRate {
            from: money.currency,
            to,
        };
        let rate = match self.rates.get(&(money.currency, to)) {
            Some(rate) => *rate,
            None => match self.rates.get(&(to, money.currency)) {
                Some(inverse) if !inverse.is_zero() => Decimal::ONE / *inverse,
                _ => return Err(missing),
            },
        };
        let amount = checked(money.amount.checked_mul(rate), "convert")?;
        Ok(Money::new(to.round(amount), to))
    }
}
