//! Payment method store. Status and metadata history are append-only; the
//! effective value is the latest row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::models::{PaymentMethod, PaymentMethodStatus};

/// Insert the method row with an initial `draft` status entry; the
/// generated id is written back
pub async fn insert_payment_method_tx(
    tx: &mut Transaction<'_, Postgres>,
    method: &mut PaymentMethod,
) -> Result<(), sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO payment_method (project_id, provider_id, method_key, created, created_by)
        VALUES ($1, (SELECT id FROM provider WHERE name = $2), $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(method.project_id)
    .bind(&method.provider_name)
    .bind(&method.method_key)
    .bind(method.created)
    .bind(&method.created_by)
    .fetch_one(&mut **tx)
    .await?;

    method.id = row.0;
    method.status = PaymentMethodStatus::Draft;
    insert_payment_method_status_tx(tx, method).await
}

/// Append a status entry; the method's `status` field is the value written
pub async fn insert_payment_method_status_tx(
    tx: &mut Transaction<'_, Postgres>,
    method: &PaymentMethod,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_method_status (payment_method_id, timestamp, status, created_by)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(method.id)
    .bind(now_nanos())
    .bind(method.status.as_str())
    .bind(&method.created_by)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append a version for every metadata entry of the method
pub async fn insert_payment_method_metadata_tx(
    tx: &mut Transaction<'_, Postgres>,
    method: &PaymentMethod,
) -> Result<(), sqlx::Error> {
    let Some(metadata) = &method.metadata else {
        return Ok(());
    };
    let timestamp = now_nanos();
    for (name, value) in metadata {
        sqlx::query(
            r#"
            INSERT INTO payment_method_metadata
                (payment_method_id, name, timestamp, value, created_by)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(method.id)
        .bind(name)
        .bind(timestamp)
        .bind(value)
        .bind(&method.created_by)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn payment_method_metadata_tx(
    tx: &mut Transaction<'_, Postgres>,
    method_id: i64,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT m.name, m.value
        FROM payment_method_metadata AS m
        WHERE
            m.payment_method_id = $1
            AND
            m.timestamp = (
                SELECT MAX(timestamp) FROM payment_method_metadata
                WHERE
                    payment_method_id = m.payment_method_id
                    AND
                    name = m.name
            )
        "#,
    )
    .bind(method_id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.into_iter().collect())
}

pub async fn payment_method_by_id_tx(
    tx: &mut Transaction<'_, Postgres>,
    method_id: i64,
) -> Result<Option<PaymentMethod>, sqlx::Error> {
    payment_method_by_id_conn(&mut **tx, method_id).await
}

pub async fn payment_method_by_id(
    pool: &PgPool,
    method_id: i64,
) -> Result<Option<PaymentMethod>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    payment_method_by_id_conn(&mut conn, method_id).await
}

pub async fn payment_method_by_project_provider_key_tx(
    tx: &mut Transaction<'_, Postgres>,
    project_id: i64,
    provider_name: &str,
    method_key: &str,
) -> Result<Option<PaymentMethod>, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT m.id
        FROM payment_method AS m
        JOIN provider AS p ON p.id = m.provider_id
        WHERE m.project_id = $1 AND p.name = $2 AND m.method_key = $3
        "#,
    )
    .bind(project_id)
    .bind(provider_name)
    .bind(method_key)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some((id,)) => payment_method_by_id_conn(&mut **tx, id).await,
        None => Ok(None),
    }
}

async fn payment_method_by_id_conn(
    conn: &mut PgConnection,
    method_id: i64,
) -> Result<Option<PaymentMethod>, sqlx::Error> {
    let row: Option<(i64, i64, String, String, DateTime<Utc>, String, Option<String>)> =
        sqlx::query_as(
            r#"
            SELECT
                m.id,
                m.project_id,
                p.name,
                m.method_key,
                m.created,
                m.created_by,
                (
                    SELECT s.status FROM payment_method_status AS s
                    WHERE s.payment_method_id = m.id
                    ORDER BY s.timestamp DESC
                    LIMIT 1
                )
            FROM payment_method AS m
            JOIN provider AS p ON p.id = m.provider_id
            WHERE m.id = $1
            "#,
        )
        .bind(method_id)
        .fetch_optional(conn)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status = match row.6 {
        Some(status) => status
            .parse::<PaymentMethodStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        None => PaymentMethodStatus::Draft,
    };

    Ok(Some(PaymentMethod {
        id: row.0,
        project_id: row.1,
        provider_name: row.2,
        method_key: row.3,
        created: row.4,
        created_by: row.5,
        status,
        metadata: None,
    }))
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
