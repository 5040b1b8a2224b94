use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::watch;

use crate::config::Config;

/// Read-only reads may go to a replica; everything else uses the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbAccess {
    ReadOnly,
    ReadWrite,
}

/// Shared runtime context: database pools, the outbound HTTP client, and
/// the process-wide shutdown signal.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Config,
    payment_rw: PgPool,
    payment_ro: Option<PgPool>,
    principal_rw: PgPool,
    principal_ro: Option<PgPool>,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl ServiceContext {
    pub fn new(
        config: Config,
        payment_rw: PgPool,
        payment_ro: Option<PgPool>,
        principal_rw: PgPool,
        principal_ro: Option<PgPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("paymentd/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(ServiceContext {
            config,
            payment_rw,
            payment_ro,
            principal_rw,
            principal_ro,
            http,
            shutdown,
            deadline: None,
        })
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn payment_db(&self, access: DbAccess) -> &PgPool {
        match access {
            DbAccess::ReadOnly => self.payment_ro.as_ref().unwrap_or(&self.payment_rw),
            DbAccess::ReadWrite => &self.payment_rw,
        }
    }

    pub fn principal_db(&self, access: DbAccess) -> &PgPool {
        match access {
            DbAccess::ReadOnly => self.principal_ro.as_ref().unwrap_or(&self.principal_rw),
            DbAccess::ReadWrite => &self.principal_rw,
        }
    }

    /// Shared outbound HTTP client: capped redirects, stable User-Agent
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when process shutdown is requested
    pub async fn cancelled(&self) {
        let mut rx = self.shutdown.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            // a dropped sender also means the process is going down
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
