use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Maximum length of a merchant-supplied ident, in characters
pub const IDENT_MAX_LEN: usize = 175;

/// Composite payment identity; the numeric id is scoped by project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentId {
    pub project_id: i64,
    pub payment_id: i64,
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.project_id, self.payment_id)
    }
}

impl FromStr for PaymentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (project, payment) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid payment id: {}", s))?;
        Ok(PaymentId {
            project_id: project
                .parse()
                .map_err(|_| format!("invalid project id: {}", project))?,
            payment_id: payment
                .parse()
                .map_err(|_| format!("invalid payment id: {}", payment))?,
        })
    }
}

/// Realized payment states, recorded in the append-only transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Open,
    Cancelled,
    Paid,
    Authorized,
    Failed,
    Refunded,
    Chargeback,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Open => "open",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Chargeback => "chargeback",
        }
    }

    /// Terminal states accept no further intents
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Cancelled
                | PaymentStatus::Paid
                | PaymentStatus::Failed
                | PaymentStatus::Refunded
                | PaymentStatus::Chargeback
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PaymentStatus::Open),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "paid" => Ok(PaymentStatus::Paid),
            "authorized" => Ok(PaymentStatus::Authorized),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "chargeback" => Ok(PaymentStatus::Chargeback),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// Payment configuration; every write appends a new version row, the
/// effective config is the latest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentConfig {
    pub payment_method_id: Option<i64>,
    pub country: Option<String>,
    pub locale: Option<String>,
    pub callback_url: Option<String>,
    pub callback_api_version: Option<String>,
    pub callback_project_key: Option<String>,
    pub return_url: Option<String>,
}

impl PaymentConfig {
    /// A callback is configured only when all three callback fields are set
    pub fn has_callback(&self) -> bool {
        self.callback_url.as_deref().is_some_and(|s| !s.is_empty())
            && self
                .callback_api_version
                .as_deref()
                .is_some_and(|s| !s.is_empty())
            && self
                .callback_project_key
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }
}

/// Root payment entity
#[derive(Debug, Clone)]
pub struct Payment {
    pub project_id: i64,
    pub id: i64,
    pub created: DateTime<Utc>,
    pub ident: String,
    /// Signed integer minor units
    pub amount: i64,
    /// Decimal exponent, 0-8
    pub subunits: i16,
    /// ISO 4217
    pub currency: String,
    pub config: PaymentConfig,
    pub metadata: Option<HashMap<String, String>>,
    /// Derived from the latest payment transaction; None when uninitialized
    pub status: Option<PaymentStatus>,
}

impl Payment {
    pub fn payment_id(&self) -> PaymentId {
        PaymentId {
            project_id: self.project_id,
            payment_id: self.id,
        }
    }

    /// Tentative transaction towards the given status, stamped with the
    /// current wall clock in nanoseconds and the payment's full amount
    pub fn new_transaction(&self, status: PaymentStatus) -> PaymentTransaction {
        PaymentTransaction {
            project_id: self.project_id,
            payment_id: self.id,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            amount: self.amount,
            subunits: self.subunits,
            currency: self.currency.clone(),
            status,
            comment: None,
        }
    }

    /// Decimal string representation of the amount, e.g. 1000 at 2 subunits
    /// renders as "10.00"
    pub fn amount_decimal(&self) -> String {
        if self.subunits == 0 {
            return self.amount.to_string();
        }
        let scale = 10i64.pow(self.subunits as u32);
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        let scale = scale as u64;
        format!(
            "{}{}.{:0width$}",
            sign,
            abs / scale,
            abs % scale,
            width = self.subunits as usize
        )
    }
}

/// Append-only log entry recording a realized payment state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub project_id: i64,
    pub payment_id: i64,
    /// Nanosecond wall-clock; strictly monotonic within a payment
    pub timestamp_ns: i64,
    pub amount: i64,
    pub subunits: i16,
    pub currency: String,
    pub status: PaymentStatus,
    pub comment: Option<String>,
}

impl PaymentTransaction {
    pub fn payment_id(&self) -> PaymentId {
        PaymentId {
            project_id: self.project_id,
            payment_id: self.payment_id,
        }
    }
}

/// Opaque bearer token granting one resolution to a payment
#[derive(Debug, Clone)]
pub struct PaymentToken {
    pub token: String,
    pub created: DateTime<Utc>,
    pub project_id: i64,
    pub payment_id: i64,
}

impl PaymentToken {
    /// New random token for the given payment, 160 bits of entropy
    pub fn generate(id: PaymentId) -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        PaymentToken {
            token: hex::encode(bytes),
            created: Utc::now(),
            project_id: id.project_id,
            payment_id: id.payment_id,
        }
    }
}

/// Payment method lifecycle; history is append-only, effective status is
/// the latest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethodStatus {
    Draft,
    Active,
    Inactive,
    Disabled,
}

impl PaymentMethodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodStatus::Draft => "draft",
            PaymentMethodStatus::Active => "active",
            PaymentMethodStatus::Inactive => "inactive",
            PaymentMethodStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for PaymentMethodStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PaymentMethodStatus::Draft),
            "active" => Ok(PaymentMethodStatus::Active),
            "inactive" => Ok(PaymentMethodStatus::Inactive),
            "disabled" => Ok(PaymentMethodStatus::Disabled),
            other => Err(format!("unknown payment method status: {}", other)),
        }
    }
}

impl fmt::Display for PaymentMethodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(project, provider, method_key)` configuration tuple driving a
/// provider integration
#[derive(Debug, Clone)]
pub struct PaymentMethod {
    pub id: i64,
    pub project_id: i64,
    pub provider_name: String,
    pub method_key: String,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub status: PaymentMethodStatus,
    pub metadata: Option<HashMap<String, String>>,
}

impl PaymentMethod {
    /// Only active methods accept new payments
    pub fn active(&self) -> bool {
        self.status == PaymentMethodStatus::Active
    }

    /// Disabled methods also block cancel/capture transitions
    pub fn disabled(&self) -> bool {
        self.status == PaymentMethodStatus::Disabled
    }
}

/// A registered PSP integration
#[derive(Debug, Clone)]
pub struct Provider {
    pub id: i64,
    pub name: String,
}

/// API key of a project, carrying the shared signing secret
#[derive(Debug, Clone)]
pub struct ProjectKey {
    pub key: String,
    pub project_id: i64,
    pub created: DateTime<Utc>,
    pub secret: String,
    pub active: bool,
}

impl ProjectKey {
    pub fn is_valid(&self) -> bool {
        self.active && !self.secret.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_id_display_round_trip() {
        let id = PaymentId {
            project_id: 3,
            payment_id: 12345,
        };
        assert_eq!(id.to_string(), "3-12345");
        assert_eq!("3-12345".parse::<PaymentId>().unwrap(), id);
        assert!("12345".parse::<PaymentId>().is_err());
    }

    #[test]
    fn amount_decimal_rendering() {
        let mut p = payment_fixture();
        assert_eq!(p.amount_decimal(), "10.00");
        p.amount = -1;
        assert_eq!(p.amount_decimal(), "-0.01");
        p.amount = 5;
        p.subunits = 0;
        assert_eq!(p.amount_decimal(), "5");
        p.amount = 123456;
        p.subunits = 4;
        assert_eq!(p.amount_decimal(), "12.3456");
    }

    #[test]
    fn callback_requires_all_fields() {
        let mut config = PaymentConfig {
            callback_url: Some("https://merchant.example.com/cb".to_string()),
            callback_api_version: Some("2".to_string()),
            ..Default::default()
        };
        assert!(!config.has_callback());
        config.callback_project_key = Some("key".to_string());
        assert!(config.has_callback());
        config.callback_url = Some(String::new());
        assert!(!config.has_callback());
    }

    #[test]
    fn new_transaction_carries_payment_fields() {
        let p = payment_fixture();
        let tx = p.new_transaction(PaymentStatus::Open);
        assert_eq!(tx.project_id, p.project_id);
        assert_eq!(tx.payment_id, p.id);
        assert_eq!(tx.amount, 1000);
        assert_eq!(tx.currency, "EUR");
        assert_eq!(tx.status, PaymentStatus::Open);
        assert!(tx.timestamp_ns > 0);
    }

    fn payment_fixture() -> Payment {
        Payment {
            project_id: 1,
            id: 1,
            created: Utc::now(),
            ident: "ord-1".to_string(),
            amount: 1000,
            subunits: 2,
            currency: "EUR".to_string(),
            config: PaymentConfig::default(),
            metadata: None,
            status: None,
        }
    }
}
