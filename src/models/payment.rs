use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::money::Money;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChargeStatus {
    NotCharged,
    Pending,
    PartiallyCharged,
    FullyCharged,
    PartiallyRefunded,
    FullyRefunded,
    Refused,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionKind {
    Auth,
    Capture,
    Refund,
    Void,
    /// Payment settled outside the gateway.
    External,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub is_success: bool,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

/// Read-only view of a payment owned by the payment subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub is_active: bool,
    pub charge_status: ChargeStatus,
    pub total: Money,
    pub transactions: Vec<PaymentTransaction>,
}

impl Payment {
    fn has_successful(&self, kind: TransactionKind) -> bool {
        self.transactions
            .iter()
            .any(|txn| txn.kind == kind && txn.is_success)
    }

    pub fn is_authorized(&self) -> bool {
        self.has_successful(TransactionKind::Auth)
    }

    pub fn is_voided(&self) -> bool {
        self.has_successful(TransactionKind::Void)
    }

    pub fn not_charged(&self) -> bool {
        self.charge_status == ChargeStatus::NotCharged
    }

    pub fn can_capture(&self) -> bool {
        self.is_active && self.not_charged()
    }

    pub fn can_void(&self) -> bool {
        self.is_active && self.not_charged() && self.is_authorized()
    }

    pub fn can_refund(&self) -> bool {
        self.is_active
            && matches!(
                self.charge_status,
                ChargeStatus::PartiallyCharged
                    | ChargeStatus::FullyCharged
                    | ChargeStatus::PartiallyRefunded
            )
    }

    /// Whether this payment contributes to the order's paid total.
    pub fn counts_towards_total_paid(&self) -> bool {
        !self.is_voided()
            && !matches!(
                self.charge_status,
                ChargeStatus::Cancelled | ChargeStatus::Refused
            )
    }
}
