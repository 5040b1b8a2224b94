use std::env;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub payment_database_url: String,
    /// Optional read-only replica; falls back to the read-write pool
    pub payment_database_ro_url: Option<String>,
    pub principal_database_url: String,
    pub principal_database_ro_url: Option<String>,
    pub host: String,
    pub port: u16,
    /// Public base URL under which the daemon is reachable (redirects,
    /// provider return/cancel URLs)
    pub public_base_url: String,
    /// Multiplier for payment ID obfuscation; must be odd
    pub payment_id_enc_prime: u64,
    /// XOR mask for payment ID obfuscation
    pub payment_id_enc_xor: u64,
    /// Per-intent veto window in milliseconds
    pub intent_timeout_ms: u64,
    /// How long an unfired commit handle stays armed, in seconds
    pub commit_intent_timeout_secs: u64,
    /// Accepted clock skew on signed requests, in seconds
    pub auth_timestamp_skew_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let payment_database_url = env::var("PAYMENT_DATABASE_URL")
            .map_err(|_| "PAYMENT_DATABASE_URL must be set".to_string())?;

        let payment_database_ro_url = env::var("PAYMENT_DATABASE_RO_URL").ok();

        let principal_database_url = env::var("PRINCIPAL_DATABASE_URL")
            .map_err(|_| "PRINCIPAL_DATABASE_URL must be set".to_string())?;

        let principal_database_ro_url = env::var("PRINCIPAL_DATABASE_RO_URL").ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let payment_id_enc_prime: u64 = env::var("PAYMENT_ID_ENC_PRIME")
            .map_err(|_| "PAYMENT_ID_ENC_PRIME must be set".to_string())?
            .parse()
            .map_err(|_| "PAYMENT_ID_ENC_PRIME must be a valid u64".to_string())?;

        let payment_id_enc_xor: u64 = env::var("PAYMENT_ID_ENC_XOR")
            .map_err(|_| "PAYMENT_ID_ENC_XOR must be set".to_string())?
            .parse()
            .map_err(|_| "PAYMENT_ID_ENC_XOR must be a valid u64".to_string())?;

        let intent_timeout_ms: u64 = env::var("INTENT_TIMEOUT_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| "INTENT_TIMEOUT_MS must be a valid u64".to_string())?;

        let commit_intent_timeout_secs: u64 = env::var("COMMIT_INTENT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| "COMMIT_INTENT_TIMEOUT_SECS must be a valid u64".to_string())?;

        let auth_timestamp_skew_secs: i64 = env::var("AUTH_TIMESTAMP_SKEW_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| "AUTH_TIMESTAMP_SKEW_SECS must be a valid i64".to_string())?;

        Ok(Config {
            payment_database_url,
            payment_database_ro_url,
            principal_database_url,
            principal_database_ro_url,
            host,
            port,
            public_base_url,
            payment_id_enc_prime,
            payment_id_enc_xor,
            intent_timeout_ms,
            commit_intent_timeout_secs,
            auth_timestamp_skew_secs,
        })
    }
}
