//! Project key lookups on the principal database. The key's secret signs
//! API requests and callback notifications.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::ProjectKey;

pub async fn project_key_by_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<ProjectKey>, sqlx::Error> {
    let row: Option<(String, i64, DateTime<Utc>, String, bool)> = sqlx::query_as(
        r#"
        SELECT key, project_id, created, secret, active
        FROM project_key
        WHERE key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| ProjectKey {
        key: row.0,
        project_id: row.1,
        created: row.2,
        secret: row.3,
        active: row.4,
    }))
}
