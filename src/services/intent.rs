//! Payment intent pipeline.
//!
//! Every state change on a payment runs through here. Registered workers
//! participate at three points:
//!
//! - PRE: a best-effort veto window. Workers run concurrently; the first
//!   error aborts the intent. No veto within the window is consent.
//! - POST: fire-and-forget side effects after the intent is accepted;
//!   errors are logged and never affect the outcome.
//! - COMMIT: side effects that become visible to the outside world, fanned
//!   out when the caller fires the returned commit handle.
//!
//! The pipeline persists nothing. The caller writes the returned
//! transaction inside its own database transaction and chooses whether to
//! fire commit before or after the database commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time;

use crate::error::PaymentError;
use crate::models::{Payment, PaymentStatus, PaymentTransaction};

/// Default ceiling on an unfired commit handle
pub const COMMIT_INTENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Requested state transitions and their rules: allowed source states and
/// the amount written to the new transaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Open,
    Cancel,
    Paid,
    Authorized,
    Failed,
}

impl Intent {
    pub fn target_status(&self) -> PaymentStatus {
        match self {
            Intent::Open => PaymentStatus::Open,
            Intent::Cancel => PaymentStatus::Cancelled,
            Intent::Paid => PaymentStatus::Paid,
            Intent::Authorized => PaymentStatus::Authorized,
            Intent::Failed => PaymentStatus::Failed,
        }
    }

    pub fn allowed_from(&self, status: Option<PaymentStatus>) -> bool {
        match self {
            Intent::Open => status.is_none(),
            Intent::Cancel | Intent::Authorized => status == Some(PaymentStatus::Open),
            Intent::Paid | Intent::Failed => matches!(
                status,
                Some(PaymentStatus::Open) | Some(PaymentStatus::Authorized)
            ),
        }
    }

    /// Amount recorded on the transaction row: the open row carries the
    /// negated payment amount, paid carries the full amount, the rest zero
    pub fn transaction_amount(&self, payment_amount: i64) -> i64 {
        match self {
            Intent::Open => -payment_amount,
            Intent::Paid => payment_amount,
            Intent::Cancel | Intent::Authorized | Intent::Failed => 0,
        }
    }
}

/// Veto participant. Send an error through `res` to abort the intent; once
/// `done` flips the window has closed and results are discarded.
#[async_trait]
pub trait PreIntentWorker: Send + Sync {
    async fn pre_intent(
        &self,
        payment: Payment,
        payment_tx: PaymentTransaction,
        done: watch::Receiver<bool>,
        res: mpsc::Sender<PaymentError>,
    );
}

/// Post-acceptance side effect. Errors drained from the returned channel
/// are logged only.
pub trait PostIntentWorker: Send + Sync {
    fn post_intent(
        &self,
        payment: Payment,
        payment_tx: PaymentTransaction,
    ) -> mpsc::Receiver<PaymentError>;
}

/// Commit-time side effect, invoked when the caller fires the commit
/// handle. The notifier is the canonical worker here.
#[async_trait]
pub trait CommitIntentWorker: Send + Sync {
    async fn commit_intent(&self, payment_tx: &PaymentTransaction) -> Result<(), PaymentError>;
}

/// One-shot commit trigger. Consuming `commit` guards against double
/// invocation; dropping the handle unfired discards the commit workers
/// once the commit window lapses.
pub struct CommitIntent {
    trigger: oneshot::Sender<()>,
}

impl CommitIntent {
    pub fn commit(self) {
        let _ = self.trigger.send(());
    }
}

pub struct IntentPipeline {
    shutdown: watch::Receiver<bool>,
    deadline: Option<Instant>,
    commit_timeout: Duration,
    pre: RwLock<Vec<Arc<dyn PreIntentWorker>>>,
    post: RwLock<Vec<Arc<dyn PostIntentWorker>>>,
    commit: RwLock<Vec<Arc<dyn CommitIntentWorker>>>,
}

impl IntentPipeline {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        IntentPipeline {
            shutdown,
            deadline: None,
            commit_timeout: COMMIT_INTENT_TIMEOUT,
            pre: RwLock::new(Vec::new()),
            post: RwLock::new(Vec::new()),
            commit: RwLock::new(Vec::new()),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub async fn register_pre_intent_worker(&self, worker: Arc<dyn PreIntentWorker>) {
        self.pre.write().await.push(worker);
    }

    pub async fn register_post_intent_worker(&self, worker: Arc<dyn PostIntentWorker>) {
        self.post.write().await.push(worker);
    }

    pub async fn register_commit_intent_worker(&self, worker: Arc<dyn CommitIntentWorker>) {
        self.commit.write().await.push(worker);
    }

    /// Run the pipeline for a tentative transaction.
    ///
    /// Returns the transaction together with the armed commit handle. The
    /// caller persists the transaction; the pipeline does not.
    pub async fn handle_intent(
        &self,
        payment: &Payment,
        payment_tx: PaymentTransaction,
        timeout: Duration,
    ) -> Result<(PaymentTransaction, CommitIntent), PaymentError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() + timeout > deadline {
                return Err(PaymentError::IntentTimeout);
            }
        }
        if *self.shutdown.borrow() {
            return Err(PaymentError::Cancelled);
        }

        self.run_pre_phase(payment, &payment_tx, timeout).await?;
        self.run_post_phase(payment, &payment_tx).await;
        let commit = self.arm_commit_phase(&payment_tx).await;

        Ok((payment_tx, commit))
    }

    async fn run_pre_phase(
        &self,
        payment: &Payment,
        payment_tx: &PaymentTransaction,
        timeout: Duration,
    ) -> Result<(), PaymentError> {
        let workers: Vec<Arc<dyn PreIntentWorker>> = self.pre.read().await.clone();
        if workers.is_empty() {
            return Ok(());
        }

        let (done_tx, done_rx) = watch::channel(false);
        let (err_tx, mut err_rx) = mpsc::channel::<PaymentError>(workers.len());
        for worker in workers {
            let p = payment.clone();
            let ptx = payment_tx.clone();
            let done = done_rx.clone();
            let res = err_tx.clone();
            tokio::spawn(async move {
                worker.pre_intent(p, ptx, done, res).await;
            });
        }
        // only workers hold senders now; a closed channel means all of
        // them finished without a veto
        drop(err_tx);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = done_tx.send(true);
                Err(PaymentError::Cancelled)
            }
            received = err_rx.recv() => {
                let _ = done_tx.send(true);
                match received {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            _ = time::sleep(timeout) => {
                // window elapsed without a veto: consent
                let _ = done_tx.send(true);
                Ok(())
            }
        }
    }

    async fn run_post_phase(&self, payment: &Payment, payment_tx: &PaymentTransaction) {
        let workers: Vec<Arc<dyn PostIntentWorker>> = self.post.read().await.clone();
        for worker in &workers {
            let mut errors = worker.post_intent(payment.clone(), payment_tx.clone());
            let intent = payment_tx.status;
            tokio::spawn(async move {
                while let Some(err) = errors.recv().await {
                    tracing::warn!(intent = %intent, error = %err, "error on post intent action");
                }
            });
        }
    }

    async fn arm_commit_phase(&self, payment_tx: &PaymentTransaction) -> CommitIntent {
        let workers: Vec<Arc<dyn CommitIntentWorker>> = self.commit.read().await.clone();
        let (trigger, fired) = oneshot::channel::<()>();
        let commit_timeout = self.commit_timeout;
        let payment_tx = payment_tx.clone();

        tokio::spawn(async move {
            match time::timeout(commit_timeout, fired).await {
                Ok(Ok(())) => {
                    let tasks = workers.into_iter().map(|worker| {
                        let ptx = payment_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = worker.commit_intent(&ptx).await {
                                tracing::warn!(
                                    intent = %ptx.status,
                                    error = %err,
                                    "error on commit intent action"
                                );
                            }
                        })
                    });
                    futures::future::join_all(tasks).await;
                }
                // handle dropped unfired, or the window lapsed
                _ => {
                    tracing::warn!(intent = %payment_tx.status, "commit intent dropped");
                }
            }
        });

        CommitIntent { trigger }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_INTENTS: [Intent; 5] = [
        Intent::Open,
        Intent::Cancel,
        Intent::Paid,
        Intent::Authorized,
        Intent::Failed,
    ];

    const ALL_STATUSES: [Option<PaymentStatus>; 8] = [
        None,
        Some(PaymentStatus::Open),
        Some(PaymentStatus::Cancelled),
        Some(PaymentStatus::Paid),
        Some(PaymentStatus::Authorized),
        Some(PaymentStatus::Failed),
        Some(PaymentStatus::Refunded),
        Some(PaymentStatus::Chargeback),
    ];

    #[test]
    fn transition_matrix_is_exact() {
        for status in ALL_STATUSES {
            for intent in ALL_INTENTS {
                let allowed = match (intent, status) {
                    (Intent::Open, None) => true,
                    (Intent::Cancel, Some(PaymentStatus::Open)) => true,
                    (Intent::Authorized, Some(PaymentStatus::Open)) => true,
                    (Intent::Paid, Some(PaymentStatus::Open))
                    | (Intent::Paid, Some(PaymentStatus::Authorized)) => true,
                    (Intent::Failed, Some(PaymentStatus::Open))
                    | (Intent::Failed, Some(PaymentStatus::Authorized)) => true,
                    _ => false,
                };
                assert_eq!(
                    intent.allowed_from(status),
                    allowed,
                    "intent {:?} from {:?}",
                    intent,
                    status
                );
            }
        }
    }

    #[test]
    fn terminal_states_accept_no_intent() {
        for status in [
            PaymentStatus::Cancelled,
            PaymentStatus::Paid,
            PaymentStatus::Failed,
        ] {
            for intent in ALL_INTENTS {
                assert!(!intent.allowed_from(Some(status)));
            }
        }
    }

    #[test]
    fn amount_policy() {
        assert_eq!(Intent::Open.transaction_amount(1000), -1000);
        assert_eq!(Intent::Paid.transaction_amount(1000), 1000);
        assert_eq!(Intent::Cancel.transaction_amount(1000), 0);
        assert_eq!(Intent::Authorized.transaction_amount(1000), 0);
        assert_eq!(Intent::Failed.transaction_amount(1000), 0);
    }
}
