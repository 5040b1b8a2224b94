use sqlx::{PgPool, Postgres, Transaction};

use crate::models::Provider;

pub async fn provider_by_name_tx(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> Result<Option<Provider>, sqlx::Error> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT id, name FROM provider WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.map(|(id, name)| Provider { id, name }))
}

pub async fn provider_all(pool: &PgPool) -> Result<Vec<Provider>, sqlx::Error> {
    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM provider ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(id, name)| Provider { id, name })
        .collect())
}
