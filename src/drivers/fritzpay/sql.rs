//! FritzPay driver persistence: versioned per-method config and the
//! append-only provider transaction log.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction as SqlxTransaction};

use crate::models::{PaymentId, PaymentMethod};

pub const TRANSACTION_TYPE_CREATE_PAYMENT: &str = "create_payment";
pub const TRANSACTION_TYPE_CREATE_PAYMENT_RESPONSE: &str = "create_payment_response";
pub const TRANSACTION_TYPE_CALLBACK: &str = "callback";
pub const TRANSACTION_TYPE_ERROR: &str = "error";

/// Driver config for a `(project, method_key)`; the effective row is the
/// one with the greatest `created`
#[derive(Debug, Clone)]
pub struct Config {
    pub project_id: i64,
    pub method_key: String,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub endpoint: String,
}

/// Envelope log row; request/response payloads are kept verbatim
#[derive(Debug, Clone)]
pub struct Transaction {
    pub project_id: i64,
    pub payment_id: i64,
    pub timestamp_ns: i64,
    pub transaction_type: String,
    pub fritzpay_id: Option<String>,
    pub state: Option<String>,
    pub data: Option<serde_json::Value>,
    pub links: Option<serde_json::Value>,
    pub provider_create_time: Option<DateTime<Utc>>,
    pub provider_update_time: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(id: PaymentId, transaction_type: &str) -> Self {
        Transaction {
            project_id: id.project_id,
            payment_id: id.payment_id,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            transaction_type: transaction_type.to_string(),
            fritzpay_id: None,
            state: None,
            data: None,
            links: None,
            provider_create_time: None,
            provider_update_time: None,
        }
    }
}

pub async fn config_by_payment_method_tx(
    tx: &mut SqlxTransaction<'_, Postgres>,
    method: &PaymentMethod,
) -> Result<Option<Config>, sqlx::Error> {
    let row: Option<(i64, String, DateTime<Utc>, String, String)> = sqlx::query_as(
        r#"
        SELECT
            c.project_id,
            c.method_key,
            c.created,
            c.created_by,
            c.endpoint
        FROM provider_fritzpay_config AS c
        WHERE
            c.project_id = $1
            AND
            c.method_key = $2
            AND
            c.created = (
                SELECT MAX(created) FROM provider_fritzpay_config
                WHERE
                    project_id = c.project_id
                    AND
                    method_key = c.method_key
            )
        "#,
    )
    .bind(method.project_id)
    .bind(&method.method_key)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|row| Config {
        project_id: row.0,
        method_key: row.1,
        created: row.2,
        created_by: row.3,
        endpoint: row.4,
    }))
}

pub async fn insert_config_tx(
    tx: &mut SqlxTransaction<'_, Postgres>,
    config: &Config,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO provider_fritzpay_config
            (project_id, method_key, created, created_by, endpoint)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(config.project_id)
    .bind(&config.method_key)
    .bind(config.created)
    .bind(&config.created_by)
    .bind(&config.endpoint)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_transaction_tx(
    tx: &mut SqlxTransaction<'_, Postgres>,
    transaction: &Transaction,
) -> Result<(), sqlx::Error> {
    insert_transaction_conn(&mut **tx, transaction).await
}

pub async fn insert_transaction(
    pool: &PgPool,
    transaction: &Transaction,
) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    insert_transaction_conn(&mut conn, transaction).await
}

async fn insert_transaction_conn(
    conn: &mut PgConnection,
    transaction: &Transaction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO provider_fritzpay_transaction
            (project_id, payment_id, timestamp, type, fritzpay_id, state, data, links,
             provider_create_time, provider_update_time)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(transaction.project_id)
    .bind(transaction.payment_id)
    .bind(transaction.timestamp_ns)
    .bind(&transaction.transaction_type)
    .bind(&transaction.fritzpay_id)
    .bind(&transaction.state)
    .bind(&transaction.data)
    .bind(&transaction.links)
    .bind(transaction.provider_create_time)
    .bind(transaction.provider_update_time)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn transaction_current_by_payment_id_tx(
    tx: &mut SqlxTransaction<'_, Postgres>,
    id: PaymentId,
) -> Result<Option<Transaction>, sqlx::Error> {
    transaction_current_conn(&mut **tx, id).await
}

pub async fn transaction_current_by_payment_id(
    pool: &PgPool,
    id: PaymentId,
) -> Result<Option<Transaction>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    transaction_current_conn(&mut conn, id).await
}

async fn transaction_current_conn(
    conn: &mut PgConnection,
    id: PaymentId,
) -> Result<Option<Transaction>, sqlx::Error> {
    type Row = (
        i64,
        i64,
        i64,
        String,
        Option<String>,
        Option<String>,
        Option<serde_json::Value>,
        Option<serde_json::Value>,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
    );
    let row: Option<Row> = sqlx::query_as(
        r#"
        SELECT
            t.project_id,
            t.payment_id,
            t.timestamp,
            t.type,
            t.fritzpay_id,
            t.state,
            t.data,
            t.links,
            t.provider_create_time,
            t.provider_update_time
        FROM provider_fritzpay_transaction AS t
        WHERE
            t.project_id = $1
            AND
            t.payment_id = $2
            AND
            t.timestamp = (
                SELECT MAX(timestamp) FROM provider_fritzpay_transaction
                WHERE
                    project_id = t.project_id
                    AND
                    payment_id = t.payment_id
            )
        "#,
    )
    .bind(id.project_id)
    .bind(id.payment_id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|row| Transaction {
        project_id: row.0,
        payment_id: row.1,
        timestamp_ns: row.2,
        transaction_type: row.3,
        fritzpay_id: row.4,
        state: row.5,
        data: row.6,
        links: row.7,
        provider_create_time: row.8,
        provider_update_time: row.9,
    }))
}
