use std::fmt;
use thiserror::Error;

/// The five abuse counters tracked by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    WrongPassword,
    InspectorConnection,
    DeviceConnection,
    DeviceMessage,
    InspectorMessage,
}

impl RateLimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitKind::WrongPassword => "wrong password",
            RateLimitKind::InspectorConnection => "new inspector connection",
            RateLimitKind::DeviceConnection => "new device connection",
            RateLimitKind::DeviceMessage => "device message",
            RateLimitKind::InspectorMessage => "inspector message",
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the logrelay protocol layer and server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid token id: {0}")]
    InvalidTokenId(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("token not found: {0}")]
    TokenNotFound(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(RateLimitKind),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error must bring the whole server down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::RateLimitExceeded(_))
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
