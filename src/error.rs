use axum::http::StatusCode;
use thiserror::Error;

/// Closed error taxonomy for the payment service.
///
/// Database-layer errors are classified once at the repo boundary (see
/// `crate::db::classify`); everything the API or a driver sees is one of
/// these kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("database error")]
    Database,

    /// The single retriable database class (deadlock / lock wait timeout)
    #[error("database lock timeout")]
    DatabaseLockTimeout,

    #[error("duplicate ident in payment")]
    DuplicateIdent,

    #[error("payment not found")]
    PaymentNotFound,

    #[error("payment transaction not found")]
    TransactionNotFound,

    #[error("payment method not found")]
    PaymentMethodNotFound,

    #[error("payment method project mismatch")]
    PaymentMethodConflict,

    #[error("payment method inactive")]
    PaymentMethodInactive,

    #[error("payment method disabled")]
    PaymentMethodDisabled,

    #[error("callback config error")]
    CallbackConfig,

    #[error("intent not allowed")]
    IntentNotAllowed,

    #[error("intent timeout")]
    IntentTimeout,

    #[error("service shutting down")]
    Cancelled,

    #[error("internal error")]
    Internal,

    #[error("provider HTTP error")]
    ProviderHttp,

    #[error("unparseable provider response")]
    ProviderProtocol,
}

impl PaymentError {
    /// Stable machine-readable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::Database => "database_error",
            PaymentError::DatabaseLockTimeout => "lock_timeout",
            PaymentError::DuplicateIdent => "duplicate_ident",
            PaymentError::PaymentNotFound => "payment_not_found",
            PaymentError::TransactionNotFound => "transaction_not_found",
            PaymentError::PaymentMethodNotFound => "payment_method_not_found",
            PaymentError::PaymentMethodConflict => "payment_method_conflict",
            PaymentError::PaymentMethodInactive => "payment_method_inactive",
            PaymentError::PaymentMethodDisabled => "payment_method_disabled",
            PaymentError::CallbackConfig => "callback_config_error",
            PaymentError::IntentNotAllowed => "intent_not_allowed",
            PaymentError::IntentTimeout => "intent_timeout",
            PaymentError::Cancelled => "unavailable",
            PaymentError::Internal => "internal_error",
            PaymentError::ProviderHttp => "provider_http_error",
            PaymentError::ProviderProtocol => "provider_protocol_error",
        }
    }

    /// HTTP status for API responses; internal errors expose no details
    pub fn status(&self) -> StatusCode {
        match self {
            PaymentError::DuplicateIdent => StatusCode::CONFLICT,
            // retriable: the client should back off and repeat the request
            PaymentError::DatabaseLockTimeout => StatusCode::CONFLICT,
            PaymentError::PaymentNotFound | PaymentError::TransactionNotFound => {
                StatusCode::NOT_FOUND
            }
            PaymentError::PaymentMethodNotFound
            | PaymentError::PaymentMethodConflict
            | PaymentError::PaymentMethodInactive
            | PaymentError::PaymentMethodDisabled
            | PaymentError::CallbackConfig
            | PaymentError::IntentNotAllowed => StatusCode::BAD_REQUEST,
            PaymentError::IntentTimeout => StatusCode::GATEWAY_TIMEOUT,
            PaymentError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::Database
            | PaymentError::Internal
            | PaymentError::ProviderHttp
            | PaymentError::ProviderProtocol => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True if the caller may retry the same request unchanged
    pub fn is_retriable(&self) -> bool {
        matches!(self, PaymentError::DatabaseLockTimeout)
    }
}
