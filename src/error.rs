//! Error types for langbridge

use thiserror::Error;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The channel never opened, closed unexpectedly, or a write hit a
    /// closed channel. No auto-retry; the session moves to `Stopped`.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport failed before capability negotiation completed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server rejected negotiation or returned an error response.
    #[error("Server error [{code}]: {message}")]
    Protocol { code: i32, message: String },

    /// Local precondition violation: an action was invoked with no
    /// running session. No network I/O is performed.
    #[error("No running session. Connect before invoking actions.")]
    NotConnected,

    /// A feature's capability handler failed during consumption.
    /// Isolated per feature so one failure does not block negotiation.
    #[error("Feature '{feature}' failed: {message}")]
    Feature {
        feature: &'static str,
        message: String,
    },

    #[error("Invalid action binding: {0}")]
    InvalidAction(String),

    #[error("Request cancelled")]
    RequestCancelled,

    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    const CANCELLED_ERROR_CODE: i32 = -32800;

    pub fn error_code(&self) -> i32 {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Timeout(_) => -32001,
            Self::NotConnected => -32003,
            Self::RequestCancelled => Self::CANCELLED_ERROR_CODE,
            _ => -32000,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::RequestCancelled)
            || matches!(self, Self::Protocol { code, .. } if *code == Self::CANCELLED_ERROR_CODE)
    }

    /// Recoverable errors leave the bridge usable: the caller may
    /// reconnect or retry without restarting the process.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout(_) | Self::Transport(_) | Self::Connect(_)
        ) || self.is_cancelled()
    }
}

impl From<crate::protocol::ResponseError> for BridgeError {
    fn from(err: crate::protocol::ResponseError) -> Self {
        BridgeError::Protocol {
            code: err.code,
            message: err.message,
        }
    }
}
