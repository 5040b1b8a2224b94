pub mod health;
pub mod payment;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::context::ServiceContext;
use crate::drivers::DriverRegistry;
use crate::error::PaymentError;
use crate::nonce::NonceCache;
use crate::services::payment_service::PaymentService;

/// Shared state of the admin/API surface
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ServiceContext>,
    pub service: Arc<PaymentService>,
    pub registry: Arc<DriverRegistry>,
    pub nonce_cache: Arc<NonceCache>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/payment",
            post(payment::create_payment).get(payment::payment_gateway),
        )
        .with_state(state)
}

/// Stable error body: machine-readable code, human message, retry hint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
    pub retriable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    Payment(PaymentError),
    Validation(String),
    Unauthorized(String),
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        ApiError::Payment(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Payment(err) => (
                err.status(),
                ErrorResponse {
                    code: err.code().to_string(),
                    // the taxonomy messages are safe; internals never
                    // carry details
                    error: err.to_string(),
                    retriable: err.is_retriable(),
                },
            ),
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    code: "validation_error".to_string(),
                    error: message,
                    retriable: false,
                },
            ),
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    code: "unauthorized".to_string(),
                    error: message,
                    retriable: false,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}
