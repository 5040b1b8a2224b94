//! Payment store: payments, their append-only config/metadata versions,
//! the transaction log, and bearer tokens.
//!
//! Mutating operations take the ambient database transaction; reads come
//! in transactional and pool-backed forms. "Current" reads select the
//! `MAX(timestamp)` row scoped by the parent.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::models::{
    Payment, PaymentConfig, PaymentId, PaymentStatus, PaymentToken, PaymentTransaction,
};

/// Insert the payment row; the generated id is written back
pub async fn insert_payment_tx(
    tx: &mut Transaction<'_, Postgres>,
    payment: &mut Payment,
) -> Result<(), sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO payment (project_id, created, ident, amount, subunits, currency)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(payment.project_id)
    .bind(payment.created)
    .bind(&payment.ident)
    .bind(payment.amount)
    .bind(payment.subunits)
    .bind(&payment.currency)
    .fetch_one(&mut **tx)
    .await?;

    payment.id = row.0;
    Ok(())
}

/// Append a new config version for the payment
pub async fn insert_payment_config_tx(
    tx: &mut Transaction<'_, Postgres>,
    payment: &Payment,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_config
            (project_id, payment_id, timestamp, payment_method_id, country, locale,
             callback_url, callback_api_version, callback_project_key, return_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(payment.project_id)
    .bind(payment.id)
    .bind(now_nanos())
    .bind(payment.config.payment_method_id)
    .bind(&payment.config.country)
    .bind(&payment.config.locale)
    .bind(&payment.config.callback_url)
    .bind(&payment.config.callback_api_version)
    .bind(&payment.config.callback_project_key)
    .bind(&payment.config.return_url)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Append a new version for every metadata entry of the payment
pub async fn insert_payment_metadata_tx(
    tx: &mut Transaction<'_, Postgres>,
    payment: &Payment,
) -> Result<(), sqlx::Error> {
    let Some(metadata) = &payment.metadata else {
        return Ok(());
    };
    let timestamp = now_nanos();
    for (name, value) in metadata {
        sqlx::query(
            r#"
            INSERT INTO payment_metadata (project_id, payment_id, name, timestamp, value)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(payment.project_id)
        .bind(payment.id)
        .bind(name)
        .bind(timestamp)
        .bind(value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Append a transaction log row; never updated or deleted
pub async fn insert_payment_transaction_tx(
    tx: &mut Transaction<'_, Postgres>,
    payment_tx: &PaymentTransaction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_transaction
            (project_id, payment_id, timestamp, amount, subunits, currency, status, comment)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(payment_tx.project_id)
    .bind(payment_tx.payment_id)
    .bind(payment_tx.timestamp_ns)
    .bind(payment_tx.amount)
    .bind(payment_tx.subunits)
    .bind(&payment_tx.currency)
    .bind(payment_tx.status.as_str())
    .bind(&payment_tx.comment)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Timestamp of the latest transaction for the payment, if any; used to
/// keep per-payment transaction timestamps strictly monotonic
pub async fn transaction_max_timestamp_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: PaymentId,
) -> Result<Option<i64>, sqlx::Error> {
    let row: (Option<i64>,) = sqlx::query_as(
        r#"
        SELECT MAX(timestamp) FROM payment_transaction
        WHERE project_id = $1 AND payment_id = $2
        "#,
    )
    .bind(id.project_id)
    .bind(id.payment_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.0)
}

pub async fn payment_by_id_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: PaymentId,
    for_update: bool,
) -> Result<Option<Payment>, sqlx::Error> {
    payment_by_id_conn(&mut **tx, id, for_update).await
}

pub async fn payment_by_id(pool: &PgPool, id: PaymentId) -> Result<Option<Payment>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    payment_by_id_conn(&mut conn, id, false).await
}

pub async fn payment_by_ident_tx(
    tx: &mut Transaction<'_, Postgres>,
    project_id: i64,
    ident: &str,
) -> Result<Option<Payment>, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM payment WHERE project_id = $1 AND ident = $2
        "#,
    )
    .bind(project_id)
    .bind(ident)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some((id,)) => {
            payment_by_id_conn(
                &mut **tx,
                PaymentId {
                    project_id,
                    payment_id: id,
                },
                false,
            )
            .await
        }
        None => Ok(None),
    }
}

pub async fn transaction_current_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: PaymentId,
) -> Result<Option<PaymentTransaction>, sqlx::Error> {
    transaction_current_conn(&mut **tx, id).await
}

pub async fn transaction_current(
    pool: &PgPool,
    id: PaymentId,
) -> Result<Option<PaymentTransaction>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    transaction_current_conn(&mut conn, id).await
}

pub async fn insert_payment_token_tx(
    tx: &mut Transaction<'_, Postgres>,
    token: &PaymentToken,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_token (token, created, project_id, payment_id)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(&token.token)
    .bind(token.created)
    .bind(token.project_id)
    .bind(token.payment_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Resolve a live token to its payment; tokens older than `max_age` are
/// not returned
pub async fn payment_by_token_tx(
    tx: &mut Transaction<'_, Postgres>,
    token: &str,
    max_age: Duration,
) -> Result<Option<Payment>, sqlx::Error> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::minutes(15));
    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT project_id, payment_id FROM payment_token
        WHERE token = $1 AND created > $2
        "#,
    )
    .bind(token)
    .bind(cutoff)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some((project_id, payment_id)) => {
            payment_by_id_conn(
                &mut **tx,
                PaymentId {
                    project_id,
                    payment_id,
                },
                false,
            )
            .await
        }
        None => Ok(None),
    }
}

pub async fn delete_payment_token_tx(
    tx: &mut Transaction<'_, Postgres>,
    token: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM payment_token WHERE token = $1")
        .bind(token)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Record the final delivery outcome of a callback notification
pub async fn insert_notification_delivery(
    pool: &PgPool,
    id: PaymentId,
    transaction_timestamp: i64,
    url: &str,
    attempts: i32,
    status_code: Option<i32>,
    succeeded: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_notification_delivery
            (project_id, payment_id, transaction_timestamp, url, attempts, status_code, succeeded)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id.project_id)
    .bind(id.payment_id)
    .bind(transaction_timestamp)
    .bind(url)
    .bind(attempts)
    .bind(status_code)
    .bind(succeeded)
    .execute(pool)
    .await?;
    Ok(())
}

async fn payment_by_id_conn(
    conn: &mut PgConnection,
    id: PaymentId,
    for_update: bool,
) -> Result<Option<Payment>, sqlx::Error> {
    // the row lock serializes intents on this payment
    let query = if for_update {
        r#"
        SELECT project_id, id, created, ident, amount, subunits, currency
        FROM payment
        WHERE project_id = $1 AND id = $2
        FOR UPDATE
        "#
    } else {
        r#"
        SELECT project_id, id, created, ident, amount, subunits, currency
        FROM payment
        WHERE project_id = $1 AND id = $2
        "#
    };

    let row: Option<(i64, i64, DateTime<Utc>, String, i64, i16, String)> = sqlx::query_as(query)
        .bind(id.project_id)
        .bind(id.payment_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let config = payment_config_current_conn(&mut *conn, id).await?;
    let metadata = payment_metadata_current_conn(&mut *conn, id).await?;
    let current = transaction_current_conn(&mut *conn, id).await?;

    Ok(Some(Payment {
        project_id: row.0,
        id: row.1,
        created: row.2,
        ident: row.3,
        amount: row.4,
        subunits: row.5,
        currency: row.6,
        config,
        metadata: if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        },
        status: current.map(|tx| tx.status),
    }))
}

async fn payment_config_current_conn(
    conn: &mut PgConnection,
    id: PaymentId,
) -> Result<PaymentConfig, sqlx::Error> {
    type ConfigRow = (
        Option<i64>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    );
    let row: Option<ConfigRow> = sqlx::query_as(
        r#"
        SELECT
            c.payment_method_id,
            c.country,
            c.locale,
            c.callback_url,
            c.callback_api_version,
            c.callback_project_key,
            c.return_url
        FROM payment_config AS c
        WHERE
            c.project_id = $1
            AND
            c.payment_id = $2
            AND
            c.timestamp = (
                SELECT MAX(timestamp) FROM payment_config
                WHERE
                    project_id = c.project_id
                    AND
                    payment_id = c.payment_id
            )
        "#,
    )
    .bind(id.project_id)
    .bind(id.payment_id)
    .fetch_optional(conn)
    .await?;

    Ok(match row {
        Some(row) => PaymentConfig {
            payment_method_id: row.0,
            country: row.1,
            locale: row.2,
            callback_url: row.3,
            callback_api_version: row.4,
            callback_project_key: row.5,
            return_url: row.6,
        },
        None => PaymentConfig::default(),
    })
}

async fn payment_metadata_current_conn(
    conn: &mut PgConnection,
    id: PaymentId,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT m.name, m.value
        FROM payment_metadata AS m
        WHERE
            m.project_id = $1
            AND
            m.payment_id = $2
            AND
            m.timestamp = (
                SELECT MAX(timestamp) FROM payment_metadata
                WHERE
                    project_id = m.project_id
                    AND
                    payment_id = m.payment_id
                    AND
                    name = m.name
            )
        "#,
    )
    .bind(id.project_id)
    .bind(id.payment_id)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().collect())
}

async fn transaction_current_conn(
    conn: &mut PgConnection,
    id: PaymentId,
) -> Result<Option<PaymentTransaction>, sqlx::Error> {
    let row: Option<(i64, i64, i64, i64, i16, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT
            t.project_id,
            t.payment_id,
            t.timestamp,
            t.amount,
            t.subunits,
            t.currency,
            t.status,
            t.comment
        FROM payment_transaction AS t
        WHERE
            t.project_id = $1
            AND
            t.payment_id = $2
            AND
            t.timestamp = (
                SELECT MAX(timestamp) FROM payment_transaction
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

    let Some(row) = row else {
        return Ok(None);
    };

    let status = row
        .6
        .parse::<PaymentStatus>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(Some(PaymentTransaction {
        project_id: row.0,
        payment_id: row.1,
        timestamp_ns: row.2,
        amount: row.3,
        subunits: row.4,
        currency: row.5,
        status,
        comment: row.7,
    }))
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
