use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Missing target WebSocket URL")]
    MissingTarget,

    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Proxy tunnel error: {0}")]
    ProxyTunnel(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn invalid_target(target: &str, reason: impl Into<String>) -> Self {
        RelayError::InvalidTarget {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
