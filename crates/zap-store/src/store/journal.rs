//! Event journal: QR codes, received and sent messages, logouts.

use super::Store;
use async_trait::async_trait;
use zap_core::{error::ZapError, message::IncomingMessage, traits::EventJournal};

#[async_trait]
impl EventJournal for Store {
    async fn record_qr(&self, session_id: &str, code: &str) -> Result<(), ZapError> {
        sqlx::query("INSERT INTO qr_codes (session_id, code) VALUES (?, ?)")
            .bind(session_id)
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(|e| ZapError::Store(format!("qr journal write failed: {e}")))?;
        Ok(())
    }

    async fn record_received(
        &self,
        session_id: &str,
        message: &IncomingMessage,
    ) -> Result<(), ZapError> {
        sqlx::query(
            "INSERT INTO received_messages (session_id, message_id, sender, text, received_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&message.id)
        .bind(&message.from)
        .bind(&message.text)
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("received journal write failed: {e}")))?;
        Ok(())
    }

    async fn record_sent(
        &self,
        session_id: &str,
        to: &str,
        text: &str,
        message_id: &str,
    ) -> Result<(), ZapError> {
        sqlx::query(
            "INSERT INTO sent_messages (session_id, recipient, text, message_id) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(to)
        .bind(text)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("sent journal write failed: {e}")))?;
        Ok(())
    }

    async fn record_logout(&self, session_id: &str) -> Result<(), ZapError> {
        sqlx::query("INSERT INTO logouts (session_id) VALUES (?)")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ZapError::Store(format!("logout journal write failed: {e}")))?;
        Ok(())
    }
}

impl Store {
    /// QR codes generated for a session, oldest first: `(code, generated_at)`.
    pub async fn qr_codes(&self, session_id: &str) -> Result<Vec<(String, String)>, ZapError> {
        sqlx::query_as(
            "SELECT code, generated_at FROM qr_codes WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("qr journal read failed: {e}")))
    }

    /// Received messages for a session, oldest first: `(sender, text, received_at)`.
    pub async fn received_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, String, String)>, ZapError> {
        sqlx::query_as(
            "SELECT sender, text, received_at FROM received_messages \
             WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("received journal read failed: {e}")))
    }

    /// Sent messages for a session, oldest first: `(recipient, text, message_id)`.
    pub async fn sent_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, String, String)>, ZapError> {
        sqlx::query_as(
            "SELECT recipient, text, message_id FROM sent_messages \
             WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("sent journal read failed: {e}")))
    }

    /// Most recent logouts across all sessions: `(session_id, logged_out_at)`.
    pub async fn recent_logouts(&self, limit: i64) -> Result<Vec<(String, String)>, ZapError> {
        sqlx::query_as(
            "SELECT session_id, logged_out_at FROM logouts ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ZapError::Store(format!("logout journal read failed: {e}")))
    }
}
