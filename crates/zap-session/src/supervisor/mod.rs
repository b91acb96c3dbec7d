//! Connection Supervisor: one actor task per session.
//!
//! Commands from [`SessionHandle`]s, transport events and the supervisor's
//! own timers all arrive at a single intake loop, so every transition for
//! a session is applied one at a time in arrival order.

mod actor;


pub(crate) use actor::{Collaborators, Supervisor};

use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;
use zap_core::{error::ZapError, message::IncomingMessage};

/// Connection lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, transport not opened yet.
    Idle,
    /// Transport opened, waiting for the connection (or a QR scan).
    Connecting,
    Open,
    /// Tearing the transport down.
    Closing,
    /// No transport. Either waiting for a scheduled reconnect, or terminal
    /// after logout.
    Closed,
    /// Reconnect attempts exhausted. Terminal.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Requests a handle can make of its supervisor.
#[derive(Debug)]
pub(crate) enum Command {
    Send {
        to: String,
        text: String,
        reply: oneshot::Sender<Result<String, ZapError>>,
    },
    Qr(oneshot::Sender<String>),
    Messages(oneshot::Sender<Vec<IncomingMessage>>),
    ReconnectAttempts(oneshot::Sender<u32>),
    /// Log out, clear credentials and end the session.
    Logout(oneshot::Sender<()>),
    /// End the session, keeping credentials for the next run.
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to a running supervisor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    generation: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: String,
        generation: Uuid,
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            session_id,
            generation,
            commands,
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn generation(&self) -> Uuid {
        self.generation
    }

    /// Current state. Still readable after the supervisor has ended.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the supervisor task has ended.
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }

    /// Send a text message. Only valid while the connection is open.
    ///
    /// Returns the transport's message id.
    pub async fn send_message(&self, to: &str, text: &str) -> Result<String, ZapError> {
        let to = to.to_string();
        let text = text.to_string();
        self.request(|reply| Command::Send { to, text, reply }).await?
    }

    /// Most recent pairing code, or an empty string.
    pub async fn qr(&self) -> Result<String, ZapError> {
        self.request(Command::Qr).await
    }

    /// Buffered received messages in arrival order.
    pub async fn messages(&self) -> Result<Vec<IncomingMessage>, ZapError> {
        self.request(Command::Messages).await
    }

    pub async fn reconnect_attempts(&self) -> Result<u32, ZapError> {
        self.request(Command::ReconnectAttempts).await
    }

    /// Log the session out. Completes once the supervisor has torn down,
    /// cleared credentials and left the registry.
    pub async fn logout(&self) -> Result<(), ZapError> {
        self.request(Command::Logout).await
    }

    /// Stop the supervisor without logging out.
    pub async fn shutdown(&self) -> Result<(), ZapError> {
        self.request(Command::Shutdown).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ZapError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ZapError::SessionEnded(self.session_id.clone()))?;
        rx.await
            .map_err(|_| ZapError::SessionEnded(self.session_id.clone()))
    }
}
