//! ABOUTME: Flow rows mirroring on-disk flow files, keyed by namespace+slug
//! ABOUTME: Checksums drive upserts; activation flags tombstone removed files

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use wf_core::{Error, Result};

/// Flow entity
#[derive(Debug, Clone, FromRow)]
pub struct FlowRow {
    pub id: i64,
    pub namespace_id: i64,
    pub slug: String,
    pub name: String,
    pub checksum: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flow repository
#[derive(Clone)]
pub struct FlowRepository {
    pool: PgPool,
}

impl FlowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a namespace id by slug, creating the namespace on first use
    pub async fn ensure_namespace(&self, slug: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO namespaces (slug, name)
            VALUES ($1, $1)
            ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug
            RETURNING id
            "#,
        )
        .bind(slug)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to ensure namespace: {}", e)))?;

        Ok(row.0)
    }

    /// Upsert a flow by (namespace, slug); checksum changes touch updated_at.
    /// The upsert always reactivates the flow.
    pub async fn upsert(
        &self,
        namespace_id: i64,
        slug: &str,
        name: &str,
        checksum: &str,
    ) -> Result<FlowRow> {
        let row = sqlx::query_as::<_, FlowRow>(
            r#"
            INSERT INTO flows (namespace_id, slug, name, checksum)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace_id, slug) DO UPDATE
            SET name = EXCLUDED.name,
                checksum = EXCLUDED.checksum,
                is_active = TRUE,
                updated_at = CASE
                    WHEN flows.checksum IS DISTINCT FROM EXCLUDED.checksum THEN NOW()
                    ELSE flows.updated_at
                END
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(slug)
        .bind(name)
        .bind(checksum)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert flow: {}", e)))?;

        Ok(row)
    }

    /// Tombstone pass: mark every flow of a namespace inactive before the
    /// registry re-activates the files it discovered.
    pub async fn deactivate_all(&self, namespace_id: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE flows SET is_active = FALSE WHERE namespace_id = $1")
                .bind(namespace_id)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to deactivate flows: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Fetch a flow by namespace slug + flow slug
    pub async fn get_by_slug(&self, namespace: &str, slug: &str) -> Result<Option<FlowRow>> {
        let row = sqlx::query_as::<_, FlowRow>(
            r#"
            SELECT f.* FROM flows f
            JOIN namespaces n ON n.id = f.namespace_id
            WHERE n.slug = $1 AND f.slug = $2
            "#,
        )
        .bind(namespace)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load flow: {}", e)))?;

        Ok(row)
    }

    /// All flows left inactive after a registry rebuild
    pub async fn list_inactive(&self) -> Result<Vec<FlowRow>> {
        let rows = sqlx::query_as::<_, FlowRow>(
            "SELECT * FROM flows WHERE NOT is_active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list inactive flows: {}", e)))?;

        Ok(rows)
    }
}
