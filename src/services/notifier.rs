//! Signed callback notifier.
//!
//! Fires on commit intent: builds the v2 notification envelope for the
//! committed transaction, signs it with the callback project key's secret,
//! and delivers it to the configured callback URL. Deliveries flow through
//! a bounded queue that exerts backpressure on burst commits; transient
//! HTTP failures are retried with exponential backoff and the final
//! outcome is persisted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::{DbAccess, ServiceContext};
use crate::db;
use crate::error::PaymentError;
use crate::idcodec::IdCodec;
use crate::jsonutil::{string_i16, string_i64};
use crate::models::{PaymentConfig, PaymentId, PaymentStatus, PaymentTransaction};
use crate::nonce;
use crate::repos::{payment_repo, project_repo};
use crate::signature::{self, SignableMessage};

/// In-flight notifications buffered before senders block
pub const NOTIFICATION_BUFFER_SIZE: usize = 16;

/// Base-string layout identifier carried in `CallbackApiVersion`
pub const NOTIFICATION_API_VERSION_V2: &str = "2";

const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Signed JSON document POSTed to the merchant callback URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "PaymentId")]
    pub payment_id: String,
    #[serde(rename = "TransactionTimestamp", with = "string_i64")]
    pub transaction_timestamp: i64,
    #[serde(rename = "Status")]
    pub status: PaymentStatus,
    #[serde(rename = "Amount", with = "string_i64")]
    pub amount: i64,
    #[serde(rename = "Subunits", with = "string_i16")]
    pub subunits: i16,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "Nonce")]
    pub nonce: String,
    #[serde(rename = "Timestamp", with = "string_i64")]
    pub timestamp: i64,
    #[serde(rename = "Signature")]
    pub signature: String,
}

impl Notification {
    /// Envelope for a committed transaction, stamped with a fresh nonce
    /// and the current time; `signature` is filled by [`Notification::sign`]
    pub fn for_transaction(encoded_id: PaymentId, payment_tx: &PaymentTransaction) -> Self {
        Notification {
            payment_id: encoded_id.to_string(),
            transaction_timestamp: payment_tx.timestamp_ns,
            status: payment_tx.status,
            amount: payment_tx.amount,
            subunits: payment_tx.subunits,
            currency: payment_tx.currency.clone(),
            nonce: nonce::generate(),
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            signature: String::new(),
        }
    }

    pub fn sign(&mut self, secret: &[u8]) {
        self.signature = hex::encode(signature::sign(secret, self));
    }

    pub fn verify(&self, secret: &[u8]) -> bool {
        match hex::decode(&self.signature) {
            Ok(sig) => signature::verify(secret, self, &sig),
            Err(_) => false,
        }
    }
}

impl SignableMessage for Notification {
    fn signature_base_string(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.payment_id);
        buf.push_str(&self.transaction_timestamp.to_string());
        buf.push_str(self.status.as_str());
        buf.push_str(&self.amount.to_string());
        buf.push_str(&self.subunits.to_string());
        buf.push_str(&self.currency);
        buf.push_str(&self.nonce);
        buf.push_str(&self.timestamp.to_string());
        buf
    }
}

/// True when the payment's config carries a complete callback setup
pub fn can_callback(config: &PaymentConfig) -> bool {
    config.has_callback()
}

#[derive(Debug)]
struct PreparedNotification {
    id: PaymentId,
    transaction_timestamp: i64,
    url: String,
    notification: Notification,
}

/// Handle used to enqueue notifications; clones share one delivery worker
#[derive(Clone)]
pub struct Notifier {
    ctx: Arc<ServiceContext>,
    id_codec: IdCodec,
    queue: mpsc::Sender<PreparedNotification>,
}

impl Notifier {
    pub fn new(ctx: Arc<ServiceContext>, id_codec: IdCodec) -> Self {
        let (queue, rx) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        tokio::spawn(delivery_worker(ctx.clone(), rx));
        Notifier {
            ctx,
            id_codec,
            queue,
        }
    }

    /// Build, sign, and enqueue the notification for a committed
    /// transaction. A payment without callback configuration is a no-op.
    pub async fn notify(&self, payment_tx: &PaymentTransaction) -> Result<(), PaymentError> {
        let id = payment_tx.payment_id();
        let payment = payment_repo::payment_by_id(self.ctx.payment_db(DbAccess::ReadOnly), id)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error retrieving payment for notification");
                db::classify(&err)
            })?
            .ok_or(PaymentError::PaymentNotFound)?;

        if !can_callback(&payment.config) {
            tracing::debug!(payment_id = %id, "no callback configured, skipping notification");
            return Ok(());
        }
        let api_version = payment
            .config
            .callback_api_version
            .as_deref()
            .unwrap_or_default();
        if api_version != NOTIFICATION_API_VERSION_V2 {
            tracing::warn!(
                payment_id = %id,
                callback_api_version = api_version,
                "unsupported callback API version"
            );
            return Err(PaymentError::CallbackConfig);
        }
        let key = payment
            .config
            .callback_project_key
            .as_deref()
            .unwrap_or_default();
        let project_key =
            project_repo::project_key_by_key(self.ctx.principal_db(DbAccess::ReadOnly), key)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "error retrieving callback project key");
                    db::classify(&err)
                })?
                .ok_or(PaymentError::CallbackConfig)?;
        if !project_key.is_valid() {
            return Err(PaymentError::CallbackConfig);
        }
        let url = payment
            .config
            .callback_url
            .clone()
            .unwrap_or_default();

        let mut notification =
            Notification::for_transaction(self.encoded_payment_id(id), payment_tx);
        notification.sign(project_key.secret.as_bytes());

        // bounded queue: burst commits block here instead of piling up
        self.queue
            .send(PreparedNotification {
                id,
                transaction_timestamp: payment_tx.timestamp_ns,
                url,
                notification,
            })
            .await
            .map_err(|_| PaymentError::Cancelled)
    }

    fn encoded_payment_id(&self, mut id: PaymentId) -> PaymentId {
        id.payment_id = self.id_codec.hide(id.payment_id);
        id
    }
}

/// Default commit intent worker wired into the payment service
pub struct NotifyOnCommit {
    notifier: Notifier,
}

impl NotifyOnCommit {
    pub fn new(notifier: Notifier) -> Self {
        NotifyOnCommit { notifier }
    }
}

#[async_trait]
impl crate::services::intent::CommitIntentWorker for NotifyOnCommit {
    async fn commit_intent(&self, payment_tx: &PaymentTransaction) -> Result<(), PaymentError> {
        self.notifier.notify(payment_tx).await
    }
}

async fn delivery_worker(ctx: Arc<ServiceContext>, mut rx: mpsc::Receiver<PreparedNotification>) {
    loop {
        tokio::select! {
            prepared = rx.recv() => {
                match prepared {
                    Some(prepared) => handle_delivery(&ctx, prepared).await,
                    None => return,
                }
            }
            _ = ctx.cancelled() => {
                // stop accepting, drain what is already queued
                rx.close();
                while let Some(prepared) = rx.recv().await {
                    handle_delivery(&ctx, prepared).await;
                }
                tracing::info!("notification delivery worker drained");
                return;
            }
        }
    }
}

async fn handle_delivery(ctx: &Arc<ServiceContext>, prepared: PreparedNotification) {
    let outcome = deliver(ctx.http_client(), &prepared.url, &prepared.notification).await;
    if outcome.succeeded {
        tracing::info!(
            payment_id = %prepared.id,
            url = %prepared.url,
            attempts = outcome.attempts,
            "notification delivered"
        );
    } else {
        tracing::warn!(
            payment_id = %prepared.id,
            url = %prepared.url,
            attempts = outcome.attempts,
            status_code = ?outcome.status_code,
            "notification delivery failed"
        );
    }
    if let Err(err) = payment_repo::insert_notification_delivery(
        ctx.payment_db(DbAccess::ReadWrite),
        prepared.id,
        prepared.transaction_timestamp,
        &prepared.url,
        outcome.attempts as i32,
        outcome.status_code.map(i32::from),
        outcome.succeeded,
    )
    .await
    {
        tracing::error!(error = %err, "error recording notification delivery outcome");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub succeeded: bool,
}

/// POST the notification, retrying server errors and connect failures
/// with exponential backoff. Client errors (4xx) are terminal.
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    notification: &Notification,
) -> DeliveryOutcome {
    let mut attempts = 0;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        attempts += 1;
        let transient = match client.post(url).json(notification).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return DeliveryOutcome {
                        attempts,
                        status_code: Some(status.as_u16()),
                        succeeded: true,
                    };
                }
                if !status.is_server_error() {
                    return DeliveryOutcome {
                        attempts,
                        status_code: Some(status.as_u16()),
                        succeeded: false,
                    };
                }
                Some(status.as_u16())
            }
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "notification request error");
                None
            }
        };

        if attempts >= MAX_DELIVERY_ATTEMPTS {
            return DeliveryOutcome {
                attempts,
                status_code: transient,
                succeeded: false,
            };
        }
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment_tx() -> PaymentTransaction {
        PaymentTransaction {
            project_id: 1,
            payment_id: 42,
            timestamp_ns: 1_416_550_942_000_000_001,
            amount: -1000,
            subunits: 2,
            currency: "EUR".to_string(),
            status: PaymentStatus::Open,
            comment: None,
        }
    }

    #[test]
    fn base_string_concatenates_fields_in_order() {
        let mut n = Notification::for_transaction(
            PaymentId {
                project_id: 1,
                payment_id: 900719,
            },
            &payment_tx(),
        );
        n.nonce = "abc".to_string();
        n.timestamp = 7;
        assert_eq!(
            n.signature_base_string(),
            "1-9007191416550942000000001open-10002EURabc7"
        );
    }

    #[test]
    fn sign_then_verify() {
        let mut n = Notification::for_transaction(
            PaymentId {
                project_id: 1,
                payment_id: 1,
            },
            &payment_tx(),
        );
        n.sign(b"secret");
        assert!(n.verify(b"secret"));
        assert!(!n.verify(b"other"));
    }

    #[test]
    fn wire_format_uses_string_encoded_integers() {
        let mut n = Notification::for_transaction(
            PaymentId {
                project_id: 1,
                payment_id: 5,
            },
            &payment_tx(),
        );
        n.sign(b"secret");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["Status"], "open");
        assert_eq!(json["Amount"], "-1000");
        assert_eq!(json["Subunits"], "2");
        assert_eq!(
            json["TransactionTimestamp"],
            "1416550942000000001"
        );
        let decoded: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.amount, -1000);
        assert!(decoded.verify(b"secret"));
    }
}
