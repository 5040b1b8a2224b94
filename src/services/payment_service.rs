//! Payment service facade: creation, config/metadata versioning, tokens,
//! and the Intent* operations that feed the pipeline.
//!
//! All mutating operations take the caller's database transaction; the
//! caller commits. Within one payment, intents are serialized by the row
//! lock taken via `payment_by_id_for_update`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Postgres, Transaction};

use crate::context::{DbAccess, ServiceContext};
use crate::db;
use crate::error::PaymentError;
use crate::idcodec::IdCodec;
use crate::models::{Payment, PaymentId, PaymentToken, PaymentTransaction};
use crate::repos::{payment_method_repo, payment_repo, project_repo};
use crate::services::intent::{
    CommitIntent, CommitIntentWorker, Intent, IntentPipeline, PostIntentWorker, PreIntentWorker,
};
use crate::services::notifier::{Notifier, NotifyOnCommit};

/// Default maximum age of payment tokens
pub const PAYMENT_TOKEN_MAX_AGE: Duration = Duration::from_secs(15 * 60);
/// Query parameter carrying a payment token
pub const PAYMENT_TOKEN_PARAM: &str = "token";

pub struct PaymentService {
    ctx: Arc<ServiceContext>,
    id_codec: IdCodec,
    pipeline: IntentPipeline,
}

impl PaymentService {
    /// Create the service and register the notifier as the default commit
    /// intent worker.
    pub async fn new(ctx: Arc<ServiceContext>) -> Result<Arc<Self>, PaymentError> {
        let id_codec = IdCodec::new(
            ctx.config.payment_id_enc_prime,
            ctx.config.payment_id_enc_xor,
        )
        .map_err(|err| {
            tracing::error!(error = %err, "error initializing payment id codec");
            PaymentError::Internal
        })?;

        let mut pipeline = IntentPipeline::new(ctx.shutdown_signal())
            .with_commit_timeout(Duration::from_secs(ctx.config.commit_intent_timeout_secs));
        if let Some(deadline) = ctx.deadline() {
            pipeline = pipeline.with_deadline(deadline);
        }

        let service = Arc::new(PaymentService {
            ctx: ctx.clone(),
            id_codec,
            pipeline,
        });

        let notifier = Notifier::new(ctx, id_codec);
        service
            .pipeline
            .register_commit_intent_worker(Arc::new(NotifyOnCommit::new(notifier)))
            .await;

        Ok(service)
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Payment id with the numeric part obfuscated for external use
    pub fn encoded_payment_id(&self, mut id: PaymentId) -> PaymentId {
        id.payment_id = self.id_codec.hide(id.payment_id);
        id
    }

    pub fn decoded_payment_id(&self, mut id: PaymentId) -> PaymentId {
        id.payment_id = self.id_codec.show(id.payment_id);
        id
    }

    pub async fn register_pre_intent_worker(&self, worker: Arc<dyn PreIntentWorker>) {
        self.pipeline.register_pre_intent_worker(worker).await;
    }

    pub async fn register_post_intent_worker(&self, worker: Arc<dyn PostIntentWorker>) {
        self.pipeline.register_post_intent_worker(worker).await;
    }

    pub async fn register_commit_intent_worker(&self, worker: Arc<dyn CommitIntentWorker>) {
        self.pipeline.register_commit_intent_worker(worker).await;
    }

    /// Insert a payment with its initial config and metadata versions in
    /// one atomic unit.
    ///
    /// A duplicate `(project, ident)` surfaces as `DuplicateIdent`; when a
    /// callback is configured, the callback project key must resolve and
    /// belong to the payment's project.
    pub async fn create_payment(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &mut Payment,
    ) -> Result<(), PaymentError> {
        if payment.config.has_callback() {
            let key = payment
                .config
                .callback_project_key
                .as_deref()
                .unwrap_or_default();
            let callback_key =
                project_repo::project_key_by_key(self.ctx.principal_db(DbAccess::ReadOnly), key)
                    .await
                    .map_err(|err| {
                        tracing::error!(error = %err, "error retrieving callback project key");
                        db::classify(&err)
                    })?;
            match callback_key {
                None => {
                    tracing::error!(callback_project_key = key, "callback project key not found");
                    return Err(PaymentError::CallbackConfig);
                }
                Some(callback_key) if callback_key.project_id != payment.project_id => {
                    tracing::error!(
                        callback_project_key = key,
                        callback_project_id = callback_key.project_id,
                        project_id = payment.project_id,
                        "callback project mismatch"
                    );
                    return Err(PaymentError::CallbackConfig);
                }
                Some(_) => {}
            }
        }

        if let Err(err) = payment_repo::insert_payment_tx(tx, payment).await {
            if db::is_unique_violation(&err) {
                return Err(PaymentError::DuplicateIdent);
            }
            tracing::error!(error = %err, "error on insert payment");
            return Err(db::classify(&err));
        }

        self.set_payment_config(tx, payment).await?;
        self.set_payment_metadata(tx, payment).await
    }

    /// Append a config version. A configured payment method must exist,
    /// belong to the payment's project, and be active.
    pub async fn set_payment_config(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> Result<(), PaymentError> {
        if let Some(method_id) = payment.config.payment_method_id {
            let method = payment_method_repo::payment_method_by_id_tx(tx, method_id)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "error on select payment method");
                    db::classify(&err)
                })?
                .ok_or_else(|| {
                    tracing::warn!(payment_method_id = method_id, "payment method not found");
                    PaymentError::PaymentMethodNotFound
                })?;
            if method.project_id != payment.project_id {
                tracing::warn!(
                    payment_method_id = method_id,
                    "payment method project mismatch"
                );
                return Err(PaymentError::PaymentMethodConflict);
            }
            if !method.active() {
                tracing::warn!(payment_method_id = method_id, "payment method inactive");
                return Err(PaymentError::PaymentMethodInactive);
            }
        }
        payment_repo::insert_payment_config_tx(tx, payment)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error on insert payment config");
                db::classify(&err)
            })
    }

    /// Append a version of the payment metadata; a payment without
    /// metadata is a no-op
    pub async fn set_payment_metadata(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> Result<(), PaymentError> {
        if payment.metadata.is_none() {
            return Ok(());
        }
        payment_repo::insert_payment_metadata_tx(tx, payment)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error on insert payment metadata");
                db::classify(&err)
            })
    }

    /// Append a payment transaction. Timestamps are kept strictly
    /// monotonic within the payment.
    pub async fn set_payment_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_tx: &mut PaymentTransaction,
    ) -> Result<(), PaymentError> {
        let last = payment_repo::transaction_max_timestamp_tx(tx, payment_tx.payment_id())
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error reading transaction log");
                db::classify(&err)
            })?;
        if let Some(last) = last {
            if payment_tx.timestamp_ns <= last {
                payment_tx.timestamp_ns = last + 1;
            }
        }
        payment_repo::insert_payment_transaction_tx(tx, payment_tx)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error saving payment transaction");
                db::classify(&err)
            })
    }

    /// Latest transaction for the payment; `TransactionNotFound` when the
    /// payment is uninitialized
    pub async fn payment_transaction_current(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> Result<PaymentTransaction, PaymentError> {
        payment_repo::transaction_current_tx(tx, payment.payment_id())
            .await
            .map_err(|err| db::classify(&err))?
            .ok_or(PaymentError::TransactionNotFound)
    }

    pub async fn payment_by_id_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: PaymentId,
    ) -> Result<Payment, PaymentError> {
        payment_repo::payment_by_id_tx(tx, id, true)
            .await
            .map_err(|err| db::classify(&err))?
            .ok_or(PaymentError::PaymentNotFound)
    }

    /// All fields required for processing are present
    pub fn is_processable(&self, payment: &Payment) -> bool {
        payment.config.payment_method_id.is_some()
            && payment.config.country.is_some()
            && payment.config.locale.is_some()
    }

    /// At least one transaction exists
    pub fn is_initialized(&self, payment: &Payment) -> bool {
        payment.status.is_some()
    }

    pub async fn intent_open(
        &self,
        payment: &Payment,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        self.intent(payment, Intent::Open, timeout).await
    }

    pub async fn intent_cancel(
        &self,
        payment: &Payment,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        self.intent(payment, Intent::Cancel, timeout).await
    }

    pub async fn intent_paid(
        &self,
        payment: &Payment,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        self.intent(payment, Intent::Paid, timeout).await
    }

    pub async fn intent_authorized(
        &self,
        payment: &Payment,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        self.intent(payment, Intent::Authorized, timeout).await
    }

    pub async fn intent_failed(
        &self,
        payment: &Payment,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        self.intent(payment, Intent::Failed, timeout).await
    }

    async fn intent(
        &self,
        payment: &Payment,
        intent: Intent,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        if !intent.allowed_from(payment.status) {
            return Err(PaymentError::IntentNotAllowed);
        }
        if intent == Intent::Open && !self.is_processable(payment) {
            return Err(PaymentError::IntentNotAllowed);
        }

        let method_id = payment
            .config
            .payment_method_id
            .ok_or(PaymentError::PaymentMethodNotFound)?;
        let method = payment_method_repo::payment_method_by_id(
            self.ctx.payment_db(DbAccess::ReadOnly),
            method_id,
        )
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "error on select payment method");
            db::classify(&err)
        })?
        .ok_or(PaymentError::PaymentMethodNotFound)?;

        if intent == Intent::Open {
            if !method.active() {
                return Err(PaymentError::PaymentMethodInactive);
            }
        } else if method.disabled() {
            return Err(PaymentError::PaymentMethodDisabled);
        }

        let mut payment_tx = payment.new_transaction(intent.target_status());
        payment_tx.amount = intent.transaction_amount(payment.amount);

        self.pipeline.handle_intent(payment, payment_tx, timeout).await
    }

    pub async fn create_payment_token(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> Result<PaymentToken, PaymentError> {
        let token = PaymentToken::generate(payment.payment_id());
        payment_repo::insert_payment_token_tx(tx, &token)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error saving payment token");
                db::classify(&err)
            })?;
        Ok(token)
    }

    /// Payment associated with a live token
    pub async fn payment_by_token(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        token: &str,
    ) -> Result<Option<Payment>, PaymentError> {
        payment_repo::payment_by_token_tx(tx, token, PAYMENT_TOKEN_MAX_AGE)
            .await
            .map_err(|err| db::classify(&err))
    }

    pub async fn delete_payment_token(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        token: &str,
    ) -> Result<(), PaymentError> {
        payment_repo::delete_payment_token_tx(tx, token)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error deleting payment token");
                db::classify(&err)
            })
    }
}
