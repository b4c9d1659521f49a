//! Error types for Miniserver communication
//!
//! One taxonomy for the whole engine: transport faults, command status
//! failures, authentication problems and lifecycle misuse all surface as
//! [`LoxoneError`] variants so callers can match on what actually went wrong.

use thiserror::Error;

/// Result type alias for Loxone operations
pub type Result<T> = std::result::Result<T, LoxoneError>;

/// Error types for Miniserver client operations
#[derive(Error, Debug)]
pub enum LoxoneError {
    /// Connection errors (socket setup, unexpected close)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frames, magic-byte violations, short reads
    #[error("Transport error: {0}")]
    Transport(String),

    /// WebSocket protocol errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A well-formed command response carrying a non-success status code
    #[error("Command failed with status code {0}")]
    CommandStatus(i32),

    /// A command was issued while another response was still outstanding
    #[error("Command already pending")]
    CommandPending,

    /// Authentication errors (credential rejected, key-material import failure)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Operation attempted outside its required connection state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Operation attempted after teardown
    #[error("Connection has been disposed")]
    Disposed,

    /// Operation observed cancellation of its connection scope
    #[error("Operation cancelled")]
    Cancelled,

    /// HTTP probe errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parsing errors (versions, timestamps, envelopes)
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl LoxoneError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        LoxoneError::Connection(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        LoxoneError::Transport(msg.into())
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        LoxoneError::Authentication(msg.into())
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        LoxoneError::Crypto(msg.into())
    }

    /// Create a parsing error
    pub fn parsing(msg: impl Into<String>) -> Self {
        LoxoneError::Parsing(msg.into())
    }

    /// Whether this error should tear down a live connection.
    ///
    /// Transport and authentication faults poison the socket; command status
    /// codes and lifecycle misuse do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoxoneError::Connection(_)
                | LoxoneError::Transport(_)
                | LoxoneError::WebSocket(_)
                | LoxoneError::Authentication(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LoxoneError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LoxoneError::WebSocket(err.to_string())
    }
}
