//! Credential records: load, upsert, clear.

use super::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use zap_core::{
    error::ZapError,
    message::{CredentialRecord, Credentials},
    traits::CredentialStore,
};

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ZapError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ZapError::Store(format!("bad timestamp '{raw}': {e}")))
}

#[async_trait]
impl CredentialStore for Store {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, ZapError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT credentials FROM credentials WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ZapError::Store(format!("credential load failed: {e}")))?;

        match row {
            Some((raw,)) => {
                let value: serde_json::Value = serde_json::from_str(&raw)?;
                Ok(Some(Credentials(value)))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), ZapError> {
        let raw = serde_json::to_string(&credentials.0)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO credentials (session_id, credentials, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
             credentials = excluded.credentials, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(&raw)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("credential save failed: {e}")))?;

        debug!("credentials saved for {session_id}");
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<(), ZapError> {
        sqlx::query("DELETE FROM credentials WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ZapError::Store(format!("credential clear failed: {e}")))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CredentialRecord>, ZapError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT session_id, credentials, updated_at FROM credentials ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("credential list failed: {e}")))?;

        rows.into_iter()
            .map(|(session_id, raw, updated_at)| {
                Ok(CredentialRecord {
                    session_id,
                    credentials: Credentials(serde_json::from_str(&raw)?),
                    updated_at: parse_timestamp(&updated_at)?,
                })
            })
            .collect()
    }
}
