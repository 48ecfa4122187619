//! ABOUTME: Encrypted secret rows scoped to namespaces and flows
//! ABOUTME: Values stay encrypted here; the keeper decrypts at use time

use sqlx::{PgPool, Row};
use std::collections::HashMap;
use wf_core::{Error, Result};

/// Secret repository
#[derive(Clone)]
pub struct SecretRepository {
    pool: PgPool,
}

impl SecretRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Encrypted secrets of a namespace, keyed by secret name
    pub async fn namespace_secrets(&self, namespace_id: i64) -> Result<HashMap<String, Vec<u8>>> {
        let rows = sqlx::query(
            "SELECT key, value_enc FROM namespace_secrets WHERE namespace_id = $1",
        )
        .bind(namespace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load namespace secrets: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value_enc")))
            .collect())
    }

    /// Encrypted secrets of a flow, keyed by secret name
    pub async fn flow_secrets(&self, flow_id: i64) -> Result<HashMap<String, Vec<u8>>> {
        let rows = sqlx::query("SELECT key, value_enc FROM flow_secrets WHERE flow_id = $1")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to load flow secrets: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value_enc")))
            .collect())
    }
}
