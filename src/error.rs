//! Error taxonomy shared by the engine, the registry and the collaborators.

use crate::protocol::SessionState;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Sender is not on the platform allow-list
    #[error("user {user_id} is not authorized on {platform}")]
    Unauthorized { platform: String, user_id: String },

    /// Malformed identifier, empty or oversized input
    #[error("invalid input: {0}")]
    Validation(String),

    /// Unknown session, tool adapter or callback identifier
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// Terminal capture or keystroke failure
    #[error("terminal backend error: {0}")]
    Backend(String),

    /// Poll watchdog exceeded its configured timeout
    #[error("no reply within {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// Hook fallback capture never produced a usable reply
    #[error("capture retries exhausted")]
    ExhaustedRetries,

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("hook payload rejected: {0}")]
    HookParse(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// HTTP status used by the hook endpoint for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 403,
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BridgeError::Validation("x".into()).status_code(), 400);
        assert_eq!(BridgeError::not_found("session", "a").status_code(), 404);
        assert_eq!(BridgeError::HookParse("bad".into()).status_code(), 500);
    }

    #[test]
    fn test_display() {
        let err = BridgeError::Timeout {
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "no reply within 90s");
        let err = BridgeError::InvalidTransition {
            from: SessionState::Idle,
            to: SessionState::Idle,
        };
        assert_eq!(err.to_string(), "invalid state transition idle -> idle");
    }
}
