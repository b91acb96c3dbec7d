use thiserror::Error;

/// Top-level error type for zap.
#[derive(Debug, Error)]
pub enum ZapError {
    /// A supervisor is already registered for this session id.
    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    /// No supervisor is registered for this session id.
    #[error("session '{0}' not found")]
    NotFound(String),

    /// Credential loading or transport construction failed during `initialize`.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// The operation requires an open connection.
    #[error("session '{0}' is not connected")]
    NotConnected(String),

    /// The supervisor behind a handle has already terminated.
    #[error("session '{0}' has ended")]
    SessionEnded(String),

    /// The recipient could not be turned into a WhatsApp address.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Error reported by the session transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credential store or journal error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
