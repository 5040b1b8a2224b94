use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::PaymentError;

/// Postgres deadlock_detected
const PG_DEADLOCK_DETECTED: &str = "40P01";
/// Postgres lock_not_available (NOWAIT / lock_timeout)
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
/// Postgres unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

pub async fn run_payment_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./db/migrations/payment").run(pool).await
}

pub async fn run_principal_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./db/migrations/principal").run(pool).await
}

/// Classify an sqlx error into the service taxonomy.
///
/// Lock waits and deadlocks are the single retriable class; everything else
/// collapses to the opaque `Database` kind. Callers that can interpret a
/// unique violation (duplicate ident) check `is_unique_violation` first.
pub fn classify(err: &sqlx::Error) -> PaymentError {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            if code == PG_DEADLOCK_DETECTED || code == PG_LOCK_NOT_AVAILABLE {
                return PaymentError::DatabaseLockTimeout;
            }
        }
    }
    PaymentError::Database
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code == PG_UNIQUE_VIOLATION;
        }
    }
    false
}
