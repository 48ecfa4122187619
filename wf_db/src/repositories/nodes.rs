//! ABOUTME: Target node registry per namespace
//! ABOUTME: Actions fan out to named nodes resolved here

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use wf_core::{Error, Result};

/// Node entity
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: i64,
    pub namespace_id: i64,
    pub name: String,
    pub address: String,
    pub credential_id: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Node repository
#[derive(Clone)]
pub struct NodeRepository {
    pool: PgPool,
}

impl NodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve active nodes by name within a namespace. Callers compare the
    /// returned set against the requested names to detect missing nodes.
    pub async fn find_by_names(
        &self,
        namespace_id: i64,
        names: &[String],
    ) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT * FROM nodes
            WHERE namespace_id = $1 AND is_active AND name = ANY($2)
            ORDER BY name
            "#,
        )
        .bind(namespace_id)
        .bind(names)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to resolve nodes: {}", e)))?;

        Ok(rows)
    }
}
