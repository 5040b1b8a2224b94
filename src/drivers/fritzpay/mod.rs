//! FritzPay demo PSP driver.
//!
//! Exercises the full driver protocol against a simulated provider: the
//! outbound `create_payment` envelope is written and committed locally
//! before the provider HTTP call runs on a detached task, so a crash
//! mid-call leaves a recoverable in-flight state. Provider responses and
//! callbacks are appended to the driver's own transaction log; final
//! states are driven through the intent pipeline.

pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{DbAccess, ServiceContext};
use crate::db;
use crate::drivers::{Driver, InitPaymentOutcome};
use crate::error::PaymentError;
use crate::models::{Payment, PaymentId, PaymentMethod};
use crate::routes::ApiError;
use crate::services::payment_service::PaymentService;

pub const DRIVER_NAME: &str = "fritzpay";

/// Stable route paths; return/cancel URLs are constructed from these
const ROUTE_PAYMENT: &str = "/payment";
const ROUTE_RETURN: &str = "/return";
const ROUTE_CANCEL: &str = "/cancel";

const PAYMENT_ID_PARAM: &str = "paymentID";

pub struct FritzpayDriver {
    ctx: Arc<ServiceContext>,
    service: Arc<PaymentService>,
}

#[derive(Debug, Serialize)]
struct FritzpayPaymentRequest {
    #[serde(rename = "paymentId")]
    payment_id: String,
    amount: String,
    currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    locale: Option<String>,
    #[serde(rename = "returnUrl")]
    return_url: String,
    #[serde(rename = "cancelUrl")]
    cancel_url: String,
}

#[derive(Debug, Deserialize)]
struct FritzpayPaymentResponse {
    id: String,
    state: String,
    #[serde(default)]
    links: Option<serde_json::Value>,
    #[serde(default, rename = "createTime")]
    create_time: Option<String>,
    #[serde(default, rename = "updateTime")]
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "paymentId")]
    payment_id: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct PaymentInfo {
    #[serde(rename = "paymentId")]
    payment_id: String,
    status: Option<String>,
    #[serde(rename = "providerState")]
    provider_state: Option<String>,
}

enum FinalizeAction {
    Paid,
    Cancel,
    Failed,
}

impl FritzpayDriver {
    pub fn new(ctx: Arc<ServiceContext>, service: Arc<PaymentService>) -> Arc<Self> {
        Arc::new(FritzpayDriver { ctx, service })
    }

    fn base_url(&self) -> &str {
        self.ctx.config.public_base_url.trim_end_matches('/')
    }

    fn route_url(&self, route: &str, id: PaymentId) -> String {
        let encoded = self.service.encoded_payment_id(id);
        format!(
            "{}/{}{}?{}={}",
            self.base_url(),
            DRIVER_NAME,
            route,
            PAYMENT_ID_PARAM,
            encoded
        )
    }

    fn payment_page_url(&self, id: PaymentId) -> String {
        self.route_url(ROUTE_PAYMENT, id)
    }

    fn decode_param(&self, raw: &str) -> Result<PaymentId, PaymentError> {
        let encoded: PaymentId = raw.parse().map_err(|_| PaymentError::PaymentNotFound)?;
        Ok(self.service.decoded_payment_id(encoded))
    }

    /// Drive the payment to a final state and return the merchant URL to
    /// redirect the user to
    async fn finalize(
        &self,
        id: PaymentId,
        action: FinalizeAction,
    ) -> Result<String, PaymentError> {
        let pool = self.ctx.payment_db(DbAccess::ReadWrite);
        let mut tx = pool.begin().await.map_err(|err| db::classify(&err))?;
        let payment = self.service.payment_by_id_for_update(&mut tx, id).await?;
        let timeout = Duration::from_millis(self.ctx.config.intent_timeout_ms);

        let (mut payment_tx, commit) = match action {
            FinalizeAction::Paid => self.service.intent_paid(&payment, timeout).await?,
            FinalizeAction::Cancel => self.service.intent_cancel(&payment, timeout).await?,
            FinalizeAction::Failed => self.service.intent_failed(&payment, timeout).await?,
        };
        self.service
            .set_payment_transaction(&mut tx, &mut payment_tx)
            .await?;
        tx.commit().await.map_err(|err| db::classify(&err))?;
        // durable first, then visible: the notification reflects
        // committed state
        commit.commit();

        Ok(payment
            .config
            .return_url
            .clone()
            .unwrap_or_else(|| self.payment_page_url(id)))
    }
}

#[async_trait]
impl Driver for FritzpayDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn attach(self: Arc<Self>, _ctx: &Arc<ServiceContext>) -> Result<Router, PaymentError> {
        Ok(Router::new()
            .route("/status", get(status))
            .route(ROUTE_PAYMENT, get(payment_info))
            .route(ROUTE_RETURN, get(return_handler))
            .route(ROUTE_CANCEL, get(cancel_handler))
            .route("/f", post(callback))
            .with_state(self))
    }

    async fn init_payment(
        &self,
        payment: &Payment,
        method: &PaymentMethod,
    ) -> Result<InitPaymentOutcome, PaymentError> {
        let id = payment.payment_id();
        let pool = self.ctx.payment_db(DbAccess::ReadWrite);
        let mut tx = pool.begin().await.map_err(|err| db::classify(&err))?;

        let current = sql::transaction_current_by_payment_id_tx(&mut tx, id)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error retrieving provider transaction");
                db::classify(&err)
            })?;
        if current.is_some() {
            tracing::debug!(payment_id = %id, "already initialized payment");
            return Ok(InitPaymentOutcome::AlreadyInitialized {
                redirect_url: self.payment_page_url(id),
            });
        }

        let config = sql::config_by_payment_method_tx(&mut tx, method)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error retrieving fritzpay config");
                db::classify(&err)
            })?
            .ok_or_else(|| {
                tracing::error!(
                    project_id = method.project_id,
                    method_key = %method.method_key,
                    "no fritzpay config for payment method"
                );
                PaymentError::Internal
            })?;

        let request = FritzpayPaymentRequest {
            payment_id: self.service.encoded_payment_id(id).to_string(),
            amount: payment.amount_decimal(),
            currency: payment.currency.clone(),
            locale: payment.config.locale.clone(),
            return_url: self.route_url(ROUTE_RETURN, id),
            cancel_url: self.route_url(ROUTE_CANCEL, id),
        };
        let data = serde_json::to_value(&request).map_err(|err| {
            tracing::error!(error = %err, "error encoding provider request");
            PaymentError::Internal
        })?;

        let mut provider_tx = sql::Transaction::new(id, sql::TRANSACTION_TYPE_CREATE_PAYMENT);
        provider_tx.data = Some(data.clone());
        sql::insert_transaction_tx(&mut tx, &provider_tx)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error saving provider transaction");
                db::classify(&err)
            })?;

        // commit before the provider call so a crash mid-call leaves a
        // recoverable in-flight state recorded locally
        tx.commit().await.map_err(|err| db::classify(&err))?;

        let ctx = self.ctx.clone();
        let service = self.service.clone();
        tokio::spawn(async move {
            do_init(ctx, service, config.endpoint, id, data).await;
        });

        Ok(InitPaymentOutcome::Initialized {
            redirect_url: self.payment_page_url(id),
        })
    }
}

/// Outbound provider call; runs detached from the initiating request
async fn do_init(
    ctx: Arc<ServiceContext>,
    service: Arc<PaymentService>,
    endpoint: String,
    id: PaymentId,
    request: serde_json::Value,
) {
    let response = ctx
        .http_client()
        .post(&endpoint)
        .json(&request)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(payment_id = %id, error = %err, "error on provider HTTP POST");
            record_error_and_fail(&ctx, &service, id, "connect_error").await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        tracing::error!(payment_id = %id, http_status = status.as_u16(), "provider returned error status");
        record_error_and_fail(&ctx, &service, id, &format!("http_{}", status.as_u16())).await;
        return;
    }

    let provider_payment = match response.json::<FritzpayPaymentResponse>().await {
        Ok(provider_payment) => provider_payment,
        Err(err) => {
            // unparseable response: short-circuit, no half-parsed envelope
            tracing::error!(payment_id = %id, error = %err, "error decoding provider response");
            record_error_and_fail(&ctx, &service, id, "decode_error").await;
            return;
        }
    };

    let mut provider_tx = sql::Transaction::new(id, sql::TRANSACTION_TYPE_CREATE_PAYMENT_RESPONSE);
    provider_tx.fritzpay_id = Some(provider_payment.id.clone());
    provider_tx.state = Some(provider_payment.state.clone());
    provider_tx.links = provider_payment.links.clone();
    provider_tx.provider_create_time = parse_provider_time(provider_payment.create_time.as_deref());
    provider_tx.provider_update_time = parse_provider_time(provider_payment.update_time.as_deref());
    provider_tx.data = Some(serde_json::json!({
        "id": provider_payment.id,
        "state": provider_payment.state,
    }));

    if let Err(err) =
        sql::insert_transaction(ctx.payment_db(DbAccess::ReadWrite), &provider_tx).await
    {
        tracing::error!(payment_id = %id, error = %err, "error saving provider response");
        return;
    }

    tracing::info!(
        payment_id = %id,
        fritzpay_id = %provider_payment.id,
        state = %provider_payment.state,
        "provider payment created"
    );
}

fn parse_provider_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(error = %err, raw = raw, "error parsing provider time");
            None
        }
    }
}

/// Append an error envelope and drive the payment to failed
async fn record_error_and_fail(
    ctx: &Arc<ServiceContext>,
    service: &Arc<PaymentService>,
    id: PaymentId,
    state: &str,
) {
    let mut provider_tx = sql::Transaction::new(id, sql::TRANSACTION_TYPE_ERROR);
    provider_tx.state = Some(state.to_string());
    if let Err(err) =
        sql::insert_transaction(ctx.payment_db(DbAccess::ReadWrite), &provider_tx).await
    {
        tracing::error!(payment_id = %id, error = %err, "error saving provider error transaction");
    }

    let pool = ctx.payment_db(DbAccess::ReadWrite);
    let result: Result<(), PaymentError> = async {
        let mut tx = pool.begin().await.map_err(|err| db::classify(&err))?;
        let payment = service.payment_by_id_for_update(&mut tx, id).await?;
        let timeout = Duration::from_millis(ctx.config.intent_timeout_ms);
        let (mut payment_tx, commit) = service.intent_failed(&payment, timeout).await?;
        payment_tx.comment = Some(format!("provider error: {}", state));
        service.set_payment_transaction(&mut tx, &mut payment_tx).await?;
        tx.commit().await.map_err(|err| db::classify(&err))?;
        commit.commit();
        Ok(())
    }
    .await;

    if let Err(err) = result {
        tracing::error!(payment_id = %id, error = %err, "error driving payment to failed");
    }
}

async fn status() -> &'static str {
    "FritzPay OK."
}

async fn payment_info(
    State(driver): State<Arc<FritzpayDriver>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaymentInfo>, ApiError> {
    let raw = params
        .get(PAYMENT_ID_PARAM)
        .ok_or(PaymentError::PaymentNotFound)?;
    let id = driver.decode_param(raw)?;

    let pool = driver.ctx.payment_db(DbAccess::ReadOnly);
    let payment = crate::repos::payment_repo::payment_by_id(pool, id)
        .await
        .map_err(|err| db::classify(&err))?
        .ok_or(PaymentError::PaymentNotFound)?;
    let provider_tx = sql::transaction_current_by_payment_id(pool, id)
        .await
        .map_err(|err| db::classify(&err))?;

    Ok(Json(PaymentInfo {
        payment_id: driver.service.encoded_payment_id(id).to_string(),
        status: payment.status.map(|s| s.as_str().to_string()),
        provider_state: provider_tx.and_then(|tx| tx.state),
    }))
}

async fn return_handler(
    State(driver): State<Arc<FritzpayDriver>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Redirect, ApiError> {
    let raw = params
        .get(PAYMENT_ID_PARAM)
        .ok_or(PaymentError::PaymentNotFound)?;
    let id = driver.decode_param(raw)?;
    let redirect = driver.finalize(id, FinalizeAction::Paid).await?;
    Ok(Redirect::to(&redirect))
}

async fn cancel_handler(
    State(driver): State<Arc<FritzpayDriver>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Redirect, ApiError> {
    let raw = params
        .get(PAYMENT_ID_PARAM)
        .ok_or(PaymentError::PaymentNotFound)?;
    let id = driver.decode_param(raw)?;
    let redirect = driver.finalize(id, FinalizeAction::Cancel).await?;
    Ok(Redirect::to(&redirect))
}

/// Provider-initiated state callback
async fn callback(
    State(driver): State<Arc<FritzpayDriver>>,
    Json(body): Json<CallbackBody>,
) -> Result<Response, ApiError> {
    let id = driver.decode_param(&body.payment_id)?;
    tracing::debug!(payment_id = %id, state = %body.state, "received provider callback");

    let mut provider_tx = sql::Transaction::new(id, sql::TRANSACTION_TYPE_CALLBACK);
    provider_tx.state = Some(body.state.clone());
    if let Err(err) = sql::insert_transaction(
        driver.ctx.payment_db(DbAccess::ReadWrite),
        &provider_tx,
    )
    .await
    {
        tracing::error!(payment_id = %id, error = %err, "error saving callback transaction");
        return Err(db::classify(&err).into());
    }

    match body.state.as_str() {
        "paid" => {
            driver.finalize(id, FinalizeAction::Paid).await?;
        }
        "cancelled" => {
            driver.finalize(id, FinalizeAction::Cancel).await?;
        }
        "failed" => {
            driver.finalize(id, FinalizeAction::Failed).await?;
        }
        other => {
            tracing::warn!(payment_id = %id, state = other, "unhandled callback state");
        }
    }

    Ok("OK".into_response())
}
