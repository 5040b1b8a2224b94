//! Payment API: `POST /payment` creates a payment from a signed merchant
//! request; `GET /payment` is the gateway page a token redirect lands on,
//! which opens the payment and defers to the PSP driver.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Redirect;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::DbAccess;
use crate::db;
use crate::error::PaymentError;
use crate::jsonutil::{opt_string_i64, string_i16, string_i64};
use crate::models::{Payment, PaymentConfig, IDENT_MAX_LEN};
use crate::nonce::{self, NONCE_LEN};
use crate::repos::{payment_method_repo, project_repo};
use crate::routes::{ApiError, AppState};
use crate::services::notifier::NOTIFICATION_API_VERSION_V2;
use crate::services::payment_service::PAYMENT_TOKEN_PARAM;
use crate::signature::{self, AuthenticatedRequest, SignableMessage};

/// Request JSON struct for POST /payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    #[serde(rename = "ProjectKey")]
    pub project_key: String,
    #[serde(rename = "Ident")]
    pub ident: String,
    #[serde(rename = "Amount", with = "string_i64")]
    pub amount: i64,
    #[serde(rename = "Subunits", with = "string_i16")]
    pub subunits: i16,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(
        rename = "PaymentMethodId",
        default,
        with = "opt_string_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub payment_method_id: Option<i64>,
    #[serde(rename = "Locale", default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "CallbackURL", default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(rename = "ReturnURL", default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(rename = "Timestamp", with = "string_i64")]
    pub timestamp: i64,
    #[serde(rename = "Nonce")]
    pub nonce: String,
    #[serde(rename = "Signature")]
    pub hex_signature: String,
}

impl CreatePaymentRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.project_key.is_empty() {
            return Err("missing ProjectKey".to_string());
        }
        if self.ident.is_empty() {
            return Err("missing Ident".to_string());
        }
        if self.ident.chars().count() > IDENT_MAX_LEN {
            return Err("invalid Ident".to_string());
        }
        if self.amount < 0 {
            return Err(format!("invalid Amount: {}", self.amount));
        }
        if !(0..=8).contains(&self.subunits) {
            return Err(format!("invalid Subunits: {}", self.subunits));
        }
        if self.currency.len() != 3 {
            return Err("invalid Currency".to_string());
        }
        if self.country.len() != 2 {
            return Err("invalid Country".to_string());
        }
        if self.timestamp == 0 {
            return Err("missing Timestamp".to_string());
        }
        if self.nonce.is_empty() {
            return Err("missing Nonce".to_string());
        }
        if self.nonce.len() > NONCE_LEN {
            return Err("invalid Nonce".to_string());
        }
        if let Some(locale) = &self.locale {
            if !is_valid_language_tag(locale) {
                return Err("invalid Locale".to_string());
            }
        }
        if let Some(callback_url) = &self.callback_url {
            if url::Url::parse(callback_url).is_err() {
                return Err("invalid CallbackURL".to_string());
            }
        }
        if let Some(return_url) = &self.return_url {
            if url::Url::parse(return_url).is_err() {
                return Err("invalid ReturnURL".to_string());
            }
        }
        Ok(())
    }
}

impl SignableMessage for CreatePaymentRequest {
    fn signature_base_string(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.project_key);
        buf.push_str(&self.ident);
        buf.push_str(&self.amount.to_string());
        buf.push_str(&self.subunits.to_string());
        buf.push_str(&self.currency);
        buf.push_str(&self.country);
        if let Some(method_id) = self.payment_method_id {
            buf.push_str(&method_id.to_string());
        }
        if let Some(locale) = &self.locale {
            buf.push_str(locale);
        }
        if let Some(callback_url) = &self.callback_url {
            buf.push_str(callback_url);
        }
        if let Some(return_url) = &self.return_url {
            buf.push_str(return_url);
        }
        if let Some(metadata) = &self.metadata {
            signature::write_sorted_metadata(&mut buf, metadata);
        }
        buf.push_str(&self.timestamp.to_string());
        buf.push_str(&self.nonce);
        buf
    }
}

impl AuthenticatedRequest for CreatePaymentRequest {
    fn signature(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.hex_signature)
    }
}

/// Minimal BCP-47 shape check: alphanumeric subtags of 1-8 characters
/// joined by hyphens, primary subtag alphabetic
fn is_valid_language_tag(tag: &str) -> bool {
    let mut subtags = tag.split('-');
    let Some(primary) = subtags.next() else {
        return false;
    };
    if primary.is_empty()
        || primary.len() > 8
        || !primary.chars().all(|c| c.is_ascii_alphabetic())
    {
        return false;
    }
    subtags.all(|s| {
        !s.is_empty() && s.len() <= 8 && s.chars().all(|c| c.is_ascii_alphanumeric())
    })
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(rename = "Ident")]
    pub ident: String,
    #[serde(rename = "Amount", with = "string_i64")]
    pub amount: i64,
    #[serde(rename = "Subunits", with = "string_i16")]
    pub subunits: i16,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(
        rename = "PaymentMethodId",
        default,
        with = "opt_string_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub payment_method_id: Option<i64>,
    #[serde(rename = "Locale", default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "CallbackURL", default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(rename = "ReturnURL", default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResponsePayment {
    #[serde(rename = "PaymentId")]
    pub payment_id: String,
    /// RFC3339 date/time string
    #[serde(rename = "Created")]
    pub created: String,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "RedirectURL")]
    pub redirect_url: String,
}

/// The JSON response struct for POST /payment
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    #[serde(rename = "Confirmation")]
    pub confirmation: Confirmation,
    #[serde(rename = "Payment")]
    pub payment: ResponsePayment,
    #[serde(rename = "Timestamp", with = "string_i64")]
    pub timestamp: i64,
    #[serde(rename = "Nonce")]
    pub nonce: String,
    #[serde(rename = "Signature")]
    pub signature: String,
}

impl CreatePaymentResponse {
    fn confirmation_from_request(request: &CreatePaymentRequest) -> Confirmation {
        Confirmation {
            ident: request.ident.clone(),
            amount: request.amount,
            subunits: request.subunits,
            currency: request.currency.clone(),
            country: request.country.clone(),
            payment_method_id: request.payment_method_id,
            locale: request.locale.clone(),
            callback_url: request.callback_url.clone(),
            return_url: request.return_url.clone(),
            metadata: request.metadata.clone(),
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

impl SignableMessage for CreatePaymentResponse {
    fn signature_base_string(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.confirmation.ident);
        buf.push_str(&self.confirmation.amount.to_string());
        buf.push_str(&self.confirmation.subunits.to_string());
        buf.push_str(&self.confirmation.currency);
        buf.push_str(&self.confirmation.country);
        if let Some(method_id) = self.confirmation.payment_method_id {
            buf.push_str(&method_id.to_string());
        }
        if let Some(locale) = &self.confirmation.locale {
            buf.push_str(locale);
        }
        if let Some(callback_url) = &self.confirmation.callback_url {
            buf.push_str(callback_url);
        }
        if let Some(return_url) = &self.confirmation.return_url {
            buf.push_str(return_url);
        }
        if let Some(metadata) = &self.confirmation.metadata {
            signature::write_sorted_metadata(&mut buf, metadata);
        }
        buf.push_str(&self.payment.payment_id);
        buf.push_str(&self.payment.created);
        buf.push_str(&self.payment.token);
        buf.push_str(&self.payment.redirect_url);
        buf.push_str(&self.timestamp.to_string());
        buf.push_str(&self.nonce);
        buf
    }
}

pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>, ApiError> {
    request.validate().map_err(ApiError::Validation)?;

    let project_key = project_repo::project_key_by_key(
        state.ctx.principal_db(DbAccess::ReadOnly),
        &request.project_key,
    )
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "error retrieving project key");
        ApiError::Payment(db::classify(&err))
    })?
    .filter(|key| key.is_valid())
    .ok_or_else(|| ApiError::Unauthorized("unknown project key".to_string()))?;

    let now = Utc::now().timestamp();
    if (now - request.timestamp).abs() > state.ctx.config.auth_timestamp_skew_secs {
        return Err(ApiError::Unauthorized("timestamp out of range".to_string()));
    }
    if !state.nonce_cache.check_and_store(&request.nonce) {
        return Err(ApiError::Unauthorized("nonce already used".to_string()));
    }
    let sig = request
        .signature()
        .map_err(|_| ApiError::Validation("invalid Signature".to_string()))?;
    if !signature::verify(project_key.secret.as_bytes(), &request, &sig) {
        return Err(ApiError::Unauthorized("invalid signature".to_string()));
    }

    let has_callback = request
        .callback_url
        .as_deref()
        .is_some_and(|url| !url.is_empty());
    let mut payment = Payment {
        project_id: project_key.project_id,
        id: 0,
        created: Utc::now(),
        ident: request.ident.clone(),
        amount: request.amount,
        subunits: request.subunits,
        currency: request.currency.clone(),
        config: PaymentConfig {
            payment_method_id: request.payment_method_id,
            country: Some(request.country.clone()),
            locale: request.locale.clone(),
            callback_url: request.callback_url.clone(),
            callback_api_version: has_callback
                .then(|| NOTIFICATION_API_VERSION_V2.to_string()),
            callback_project_key: has_callback.then(|| request.project_key.clone()),
            return_url: request.return_url.clone(),
        },
        metadata: request.metadata.clone(),
        status: None,
    };

    let pool = state.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| ApiError::Payment(db::classify(&err)))?;
    state.service.create_payment(&mut tx, &mut payment).await?;
    let token = state.service.create_payment_token(&mut tx, &payment).await?;
    tx.commit()
        .await
        .map_err(|err| ApiError::Payment(db::classify(&err)))?;

    tracing::info!(
        payment_id = %payment.payment_id(),
        project_id = payment.project_id,
        ident = %payment.ident,
        "payment created"
    );

    let base = state.ctx.config.public_base_url.trim_end_matches('/');
    let mut response = CreatePaymentResponse {
        confirmation: CreatePaymentResponse::confirmation_from_request(&request),
        payment: ResponsePayment {
            payment_id: state
                .service
                .encoded_payment_id(payment.payment_id())
                .to_string(),
            created: payment.created.to_rfc3339(),
            token: token.token.clone(),
            redirect_url: format!("{}/payment?{}={}", base, PAYMENT_TOKEN_PARAM, token.token),
        },
        timestamp: Utc::now().timestamp(),
        nonce: nonce::generate(),
        signature: String::new(),
    };
    response.sign(project_key.secret.as_bytes());

    Ok(Json(response))
}

/// Gateway page reached through the redirect URL. Resolves the single-use
/// token, opens the payment, and defers to the provider driver.
pub async fn payment_gateway(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Redirect, ApiError> {
    let token = params
        .get(PAYMENT_TOKEN_PARAM)
        .ok_or_else(|| ApiError::Validation("missing token".to_string()))?;

    let pool = state.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| ApiError::Payment(db::classify(&err)))?;

    let payment = state
        .service
        .payment_by_token(&mut tx, token)
        .await?
        .ok_or(PaymentError::PaymentNotFound)?;
    // single-use: the token dies with this resolution
    state.service.delete_payment_token(&mut tx, token).await?;

    // re-read under the row lock; intents on one payment are serialized
    let payment = state
        .service
        .payment_by_id_for_update(&mut tx, payment.payment_id())
        .await?;

    if !state.service.is_initialized(&payment) {
        let timeout = Duration::from_millis(state.ctx.config.intent_timeout_ms);
        let (mut payment_tx, commit) = state.service.intent_open(&payment, timeout).await?;
        state
            .service
            .set_payment_transaction(&mut tx, &mut payment_tx)
            .await?;
        tx.commit()
            .await
            .map_err(|err| ApiError::Payment(db::classify(&err)))?;
        commit.commit();
    } else {
        tx.commit()
            .await
            .map_err(|err| ApiError::Payment(db::classify(&err)))?;
    }

    let method_id = payment
        .config
        .payment_method_id
        .ok_or(PaymentError::PaymentMethodNotFound)?;
    let method = payment_method_repo::payment_method_by_id(
        state.ctx.payment_db(DbAccess::ReadOnly),
        method_id,
    )
    .await
    .map_err(|err| ApiError::Payment(db::classify(&err)))?
    .ok_or(PaymentError::PaymentMethodNotFound)?;

    let outcome = state.registry.init_payment(&payment, &method).await?;
    Ok(Redirect::to(outcome.redirect_url()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_fixture() -> CreatePaymentRequest {
        CreatePaymentRequest {
            project_key: "testkey".to_string(),
            ident: "ord-1".to_string(),
            amount: 1000,
            subunits: 2,
            currency: "EUR".to_string(),
            country: "DE".to_string(),
            payment_method_id: None,
            locale: None,
            callback_url: None,
            return_url: None,
            metadata: None,
            timestamp: 1416550942,
            nonce: "nonce1".to_string(),
            hex_signature: String::new(),
        }
    }

    #[test]
    fn base_string_omits_unset_optional_fields() {
        let request = request_fixture();
        assert_eq!(
            request.signature_base_string(),
            "testkeyord-110002EURDE1416550942nonce1"
        );
    }

    #[test]
    fn base_string_includes_optional_fields_in_order() {
        let mut request = request_fixture();
        request.payment_method_id = Some(7);
        request.locale = Some("de-DE".to_string());
        request.callback_url = Some("https://merchant.example.com/cb".to_string());
        request.return_url = Some("https://merchant.example.com/r".to_string());
        let mut metadata = HashMap::new();
        metadata.insert("b".to_string(), "2".to_string());
        metadata.insert("a".to_string(), "1".to_string());
        request.metadata = Some(metadata);
        assert_eq!(
            request.signature_base_string(),
            "testkeyord-110002EURDE7de-DEhttps://merchant.example.com/cb\
             https://merchant.example.com/ra1b21416550942nonce1"
        );
    }

    #[test]
    fn any_signed_field_changes_the_base_string() {
        let base = request_fixture().signature_base_string();
        let mut changed = request_fixture();
        changed.amount = 1001;
        assert_ne!(changed.signature_base_string(), base);
        let mut changed = request_fixture();
        changed.nonce = "nonce2".to_string();
        assert_ne!(changed.signature_base_string(), base);
        let mut changed = request_fixture();
        changed.currency = "USD".to_string();
        assert_ne!(changed.signature_base_string(), base);
    }

    #[test]
    fn validation_enforces_field_shapes() {
        assert!(request_fixture().validate().is_ok());

        let mut request = request_fixture();
        request.ident = "x".repeat(IDENT_MAX_LEN + 1);
        assert!(request.validate().is_err());

        let mut request = request_fixture();
        request.currency = "EURO".to_string();
        assert!(request.validate().is_err());

        let mut request = request_fixture();
        request.country = "DEU".to_string();
        assert!(request.validate().is_err());

        let mut request = request_fixture();
        request.subunits = 9;
        assert!(request.validate().is_err());

        let mut request = request_fixture();
        request.amount = -1;
        assert!(request.validate().is_err());

        let mut request = request_fixture();
        request.locale = Some("not a locale!".to_string());
        assert!(request.validate().is_err());

        let mut request = request_fixture();
        request.locale = Some("de-DE".to_string());
        assert!(request.validate().is_ok());

        let mut request = request_fixture();
        request.callback_url = Some("::not-a-url".to_string());
        assert!(request.validate().is_err());
    }

    #[test]
    fn request_json_uses_documented_field_names() {
        let json = r#"{
            "ProjectKey": "testkey",
            "Ident": "ord-1",
            "Amount": "1000",
            "Subunits": "2",
            "Currency": "EUR",
            "Country": "DE",
            "PaymentMethodId": "7",
            "Timestamp": "1416550942",
            "Nonce": "nonce1",
            "Signature": "deadbeef"
        }"#;
        let request: CreatePaymentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.amount, 1000);
        assert_eq!(request.payment_method_id, Some(7));
        assert_eq!(request.hex_signature, "deadbeef");
    }

    #[test]
    fn response_signs_and_verifies() {
        let mut response = CreatePaymentResponse {
            confirmation: CreatePaymentResponse::confirmation_from_request(&request_fixture()),
            payment: ResponsePayment {
                payment_id: "1-982450871".to_string(),
                created: "2014-11-21T07:02:22Z".to_string(),
                token: "token".to_string(),
                redirect_url: "http://localhost:8080/payment?token=token".to_string(),
            },
            timestamp: 1416550943,
            nonce: "server-nonce".to_string(),
            signature: String::new(),
        };
        response.sign(b"secret");
        assert!(response.verify(b"secret"));
        assert!(!response.verify(b"wrong"));
    }
}
