//! Protocol types for chat-relay.
//!
//! Defines the inbound chat message, reply events, session states,
//! keystroke tokens and the JSON frames spoken by the socket connector.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message received from a chat connector. Every field is untrusted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub platform: String,
    pub user_id: String,
    pub channel_id: String,
    pub content: String,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(platform: &str, user_id: &str, channel_id: &str, content: &str) -> Self {
        Self {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            content: content.to_string(),
            timestamp: current_timestamp_ms(),
        }
    }
}

/// A finished reply produced by a watchdog run, consumed once by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEvent {
    pub session: String,
    pub text: String,
    pub timestamp: u64,
}

impl ReplyEvent {
    pub fn new(session: &str, text: String) -> Self {
        Self {
            session: session.to_string(),
            text,
            timestamp: current_timestamp_ms(),
        }
    }
}

/// One line of a session's input history file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub content: String,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Ready for new input
    Idle,
    /// Input sent, awaiting reply
    Processing,
    /// Tool is blocked on an interactive prompt
    WaitingInput,
    /// Last operation failed or timed out
    Error,
}

impl SessionState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Re-entering the current state is accepted so that rapid repeated
    /// input can re-arm a session that is already processing.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Processing)
                | (Processing, Idle)
                | (Processing, Error)
                | (Processing, WaitingInput)
                | (WaitingInput, Processing)
                | (Error, Processing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Processing => "processing",
            SessionState::WaitingInput => "waiting_input",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control keys that chat users can send by keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Tab,
    Escape,
    ShiftTab,
    Enter,
    Interrupt,
}

impl ControlKey {
    /// Match a whole (trimmed) chat message against the keyword vocabulary
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "tab" => Some(ControlKey::Tab),
            "esc" => Some(ControlKey::Escape),
            "shift-tab" => Some(ControlKey::ShiftTab),
            "enter" => Some(ControlKey::Enter),
            "interrupt" => Some(ControlKey::Interrupt),
            _ => None,
        }
    }

    /// Key name understood by `tmux send-keys`
    pub fn tmux_name(self) -> &'static str {
        match self {
            ControlKey::Tab => "Tab",
            ControlKey::Escape => "Escape",
            ControlKey::ShiftTab => "BTab",
            ControlKey::Enter => "Enter",
            ControlKey::Interrupt => "C-c",
        }
    }
}

/// What gets forwarded to a tool for one chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keystrokes {
    /// Literal text followed by Enter
    Text(String),
    /// A single control key, no Enter
    Key(ControlKey),
}

impl Keystrokes {
    pub fn from_input(input: &str) -> Self {
        match ControlKey::from_token(input) {
            Some(key) => Keystrokes::Key(key),
            None => Keystrokes::Text(input.to_string()),
        }
    }
}

/// Request frame read from the socket connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorRequest {
    /// Chat message from a user in a channel
    Message {
        user_id: String,
        channel_id: String,
        content: String,
    },
    /// Create a session on demand (admins only)
    CreateSession {
        user_id: String,
        name: String,
        tool: String,
        work_dir: String,
    },
    /// Remove a session (admins only)
    RemoveSession { user_id: String, name: String },
    /// Graceful shutdown request
    Shutdown,
}

/// Response frame written back through the socket connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorResponse {
    /// Message accepted into the inbound queue
    Accepted,
    /// Outbound chat text for a channel this connection has used
    Reply {
        channel_id: String,
        text: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
    },
    /// Inbound queue is full; the message was dropped
    Backpressure { accept: bool },
    SessionCreated { name: String },
    SessionRemoved { name: String },
    /// Shutdown acknowledged
    ShutdownAck,
    Error { message: String },
}

/// Outbound chat text handed to a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub text: String,
    pub timestamp: u64,
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_request_serialization() {
        let req = ConnectorRequest::Message {
            user_id: "alice".to_string(),
            channel_id: "general".to_string(),
            content: "Hello!".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"message\""));
        assert!(json.contains("\"user_id\":\"alice\""));
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Idle));
        assert!(Processing.can_transition_to(Error));
        assert!(WaitingInput.can_transition_to(Processing));
        assert!(Error.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processing));

        assert!(!Idle.can_transition_to(Error));
        assert!(!Idle.can_transition_to(WaitingInput));
        assert!(!Error.can_transition_to(Idle));
        assert!(!WaitingInput.can_transition_to(Idle));
    }

    #[test]
    fn test_keyword_translation() {
        assert_eq!(
            Keystrokes::from_input("esc"),
            Keystrokes::Key(ControlKey::Escape)
        );
        assert_eq!(
            Keystrokes::from_input(" Shift-Tab "),
            Keystrokes::Key(ControlKey::ShiftTab)
        );
        assert_eq!(
            Keystrokes::from_input("tab completion please"),
            Keystrokes::Text("tab completion please".to_string())
        );
    }
}
