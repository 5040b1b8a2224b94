//! PSP driver protocol and registry.
//!
//! A driver owns its provider transaction log and its routes (mounted
//! under `/<provider-name>`); the registry dispatches `init_payment` by
//! the provider name resolved from the payment method.

pub mod fritzpay;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;

use crate::context::ServiceContext;
use crate::error::PaymentError;
use crate::models::{Payment, PaymentMethod};

/// Result of driving a payment into its provider flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitPaymentOutcome {
    /// Freshly initialized: the waiting page while the provider call is in
    /// flight
    Initialized { redirect_url: String },
    /// A provider transaction already exists: the status page
    AlreadyInitialized { redirect_url: String },
}

impl InitPaymentOutcome {
    pub fn redirect_url(&self) -> &str {
        match self {
            InitPaymentOutcome::Initialized { redirect_url }
            | InitPaymentOutcome::AlreadyInitialized { redirect_url } => redirect_url,
        }
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Provider name; also the route mount point
    fn name(&self) -> &'static str;

    /// Wire the driver's routes and validate driver-local resources
    async fn attach(self: Arc<Self>, ctx: &Arc<ServiceContext>) -> Result<Router, PaymentError>;

    /// Start the provider flow for a payment. Idempotent: a payment with
    /// an existing provider transaction yields its status page instead of
    /// a second provider call.
    async fn init_payment(
        &self,
        payment: &Payment,
        method: &PaymentMethod,
    ) -> Result<InitPaymentOutcome, PaymentError>;
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        DriverRegistry {
            drivers: HashMap::new(),
        }
    }

    /// Attach a driver and return its routes nested under `/<name>`
    pub async fn attach(
        &mut self,
        ctx: &Arc<ServiceContext>,
        driver: Arc<dyn Driver>,
    ) -> Result<Router, PaymentError> {
        let name = driver.name();
        let routes = driver.clone().attach(ctx).await?;
        self.drivers.insert(name.to_string(), driver);
        tracing::info!(provider = name, "driver attached");
        Ok(Router::new().nest(&format!("/{}", name), routes))
    }

    pub fn driver(&self, provider_name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(provider_name).cloned()
    }

    /// Dispatch `init_payment` to the driver owning the method's provider
    pub async fn init_payment(
        &self,
        payment: &Payment,
        method: &PaymentMethod,
    ) -> Result<InitPaymentOutcome, PaymentError> {
        let driver = self.driver(&method.provider_name).ok_or_else(|| {
            tracing::error!(provider = %method.provider_name, "no driver for provider");
            PaymentError::Internal
        })?;
        driver.init_payment(payment, method).await
    }
}
