use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque authentication material issued by the remote service after pairing.
///
/// The supervisor never looks inside; it only persists and replays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

/// Persisted credential record for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub session_id: String,
    pub credentials: Credentials,
    pub updated_at: DateTime<Utc>,
}

/// A message received by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Transport-assigned message id.
    pub id: String,
    /// Remote JID the message came from (e.g. `5511999887766@s.whatsapp.net`).
    pub from: String,
    /// Text content, or a placeholder for non-text messages.
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the message was sent by the session's own identity.
    #[serde(default)]
    pub from_me: bool,
}

/// Why a transport connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The session was terminated remotely. Never retried.
    LoggedOut,
    /// Recoverable disconnect, eligible for reconnection.
    Transient(String),
}

impl CloseReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::Transient(detail) => write!(f, "transient: {detail}"),
        }
    }
}

/// Lifecycle events emitted by a session transport, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new pairing code must be presented to the user.
    QrAvailable(String),
    /// The connection is established.
    Opened,
    /// The connection closed.
    Closed(CloseReason),
    /// The credential blob changed and should be persisted.
    CredentialsChanged(Credentials),
    /// A message arrived.
    MessageReceived(IncomingMessage),
}

impl TransportEvent {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::QrAvailable(_) => "qr-available",
            Self::Opened => "opened",
            Self::Closed(_) => "closed",
            Self::CredentialsChanged(_) => "credentials-changed",
            Self::MessageReceived(_) => "message-received",
        }
    }
}

/// Normalize a recipient into a WhatsApp JID.
///
/// Bare phone numbers get the `@s.whatsapp.net` server appended; anything
/// already containing `@` (personal or group JIDs) passes through.
pub fn normalize_recipient(to: &str) -> Option<String> {
    let to = to.trim();
    if to.is_empty() {
        return None;
    }
    if to.contains('@') {
        Some(to.to_string())
    } else {
        let digits: String = to.chars().filter(|c| !matches!(c, '+' | ' ' | '-')).collect();
        if digits.is_empty() {
            return None;
        }
        Some(format!("{digits}@s.whatsapp.net"))
    }
}
