use serde::{Deserialize, Serialize};

/// Message sent to a client that connected without a `target` parameter
pub const MISSING_TARGET_MESSAGE: &str = "Missing ?target=ws://host:port/path";

/// Structured error sent over the client socket before it is closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn missing_target() -> Self {
        ErrorPayload {
            error: MISSING_TARGET_MESSAGE.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
