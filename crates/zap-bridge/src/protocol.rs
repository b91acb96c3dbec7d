//! Frames exchanged with the bridge, as JSON text tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zap_core::{
    error::ZapError,
    message::{CloseReason, Credentials, IncomingMessage, TransportEvent},
};

/// Frames sent to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection. `credentials: null` asks for pairing.
    Hello {
        session_id: String,
        credentials: Option<Credentials>,
    },
    Send {
        request_id: String,
        to: String,
        text: String,
    },
    Logout,
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ZapError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Qr {
        code: String,
    },
    Open,
    Close {
        #[serde(default)]
        logged_out: bool,
        #[serde(default)]
        reason: String,
    },
    Creds {
        credentials: Credentials,
    },
    Message {
        id: String,
        from: String,
        text: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        from_me: bool,
    },
    /// Acknowledges a `send`.
    Sent {
        request_id: String,
        message_id: String,
    },
    SendFailed {
        request_id: String,
        error: String,
    },
}

impl BridgeFrame {
    pub fn parse(text: &str) -> Result<Self, ZapError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The lifecycle event this frame carries. `None` for send replies.
    pub fn into_event(self) -> Option<TransportEvent> {
        match self {
            Self::Qr { code } => Some(TransportEvent::QrAvailable(code)),
            Self::Open => Some(TransportEvent::Opened),
            Self::Close { logged_out, reason } => {
                let reason = if logged_out {
                    CloseReason::LoggedOut
                } else {
                    CloseReason::Transient(reason)
                };
                Some(TransportEvent::Closed(reason))
            }
            Self::Creds { credentials } => Some(TransportEvent::CredentialsChanged(credentials)),
            Self::Message {
                id,
                from,
                text,
                timestamp,
                from_me,
            } => Some(TransportEvent::MessageReceived(IncomingMessage {
                id,
                from,
                text,
                timestamp,
                from_me,
            })),
            Self::Sent { .. } | Self::SendFailed { .. } => None,
        }
    }
}
