use crate::{
    error::ZapError,
    message::{CredentialRecord, Credentials, IncomingMessage, TransportEvent},
};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Resolves to the transport's message id once the remote side has
/// acknowledged a send.
pub type SendAck = Pin<Box<dyn Future<Output = Result<String, ZapError>> + Send>>;

/// A live connection to the remote messaging service.
///
/// The wire protocol lives behind this trait. Lifecycle events travel on
/// the receiver returned alongside it in [`TransportHandle`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write a text message for a JID. Returns once the message is handed to
    /// the connection; the acknowledgement arrives through the [`SendAck`].
    async fn send_text(&mut self, to: &str, text: &str) -> Result<SendAck, ZapError>;

    /// Liveness check.
    async fn ping(&mut self) -> Result<(), ZapError>;

    /// Whether the underlying connection still reports itself open.
    fn is_open(&self) -> bool;

    /// Ask the remote service to invalidate the session.
    async fn logout(&mut self) -> Result<(), ZapError>;

    /// Tear the connection down without logging out.
    async fn close(&mut self);
}

/// A freshly constructed transport and its event stream.
pub struct TransportHandle {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Builds transports. One call per connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport for `session_id`. `None` credentials mean a fresh
    /// pairing: the transport is expected to emit a QR challenge.
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<TransportHandle, ZapError>;
}

/// Persistent credential storage keyed by session id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Stored credentials, or `None` when the session was never paired.
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, ZapError>;

    /// Upsert, replacing any prior record for `session_id`.
    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), ZapError>;

    /// Remove the record. No-op if absent.
    async fn clear(&self, session_id: &str) -> Result<(), ZapError>;

    /// All stored records.
    async fn list(&self) -> Result<Vec<CredentialRecord>, ZapError> {
        Ok(Vec::new())
    }
}

/// Append-only history of session activity.
///
/// Every method defaults to a no-op so a journal is optional.
#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn record_qr(&self, _session_id: &str, _code: &str) -> Result<(), ZapError> {
        Ok(())
    }

    async fn record_received(
        &self,
        _session_id: &str,
        _message: &IncomingMessage,
    ) -> Result<(), ZapError> {
        Ok(())
    }

    async fn record_sent(
        &self,
        _session_id: &str,
        _to: &str,
        _text: &str,
        _message_id: &str,
    ) -> Result<(), ZapError> {
        Ok(())
    }

    async fn record_logout(&self, _session_id: &str) -> Result<(), ZapError> {
        Ok(())
    }
}

/// Journal that records nothing.
pub struct NoopJournal;

impl EventJournal for NoopJournal {}
