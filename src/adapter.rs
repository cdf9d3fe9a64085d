//! Tool adapters: one per tool type (claude, codex, ...).
//!
//! An adapter knows how to start the tool in a terminal session, how to
//! submit input to it, how its completion should be detected (hook or
//! polling) and how to read its hook payloads.

use crate::error::{BridgeError, Result};
use crate::filter::{ActivityMatcher, PatternMatcher};
use crate::protocol::Keystrokes;
use crate::terminal::TerminalBackend;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shape of the JSON a tool posts to the hook endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFormat {
    /// Claude Code `Stop` hook input
    Claude,
    /// Codex `notify` program argument
    Codex,
    /// Loose format accepting several field names
    #[default]
    Generic,
}

/// Per-tool-type configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolProfile {
    /// Program and arguments started inside the terminal session
    pub command: Vec<String>,
    /// Completion is signalled by a hook callback instead of polling
    pub uses_hook: bool,
    pub hook_format: HookFormat,
    pub poll_interval_ms: u64,
    /// Consecutive identical captures that count as "done"
    pub stable_count: u32,
    /// Overall wait for a reply (poll) or for the hook to fire
    pub timeout_secs: u64,
    /// Pause between typing the input and pressing Enter
    pub submit_delay_ms: u64,
    /// Prompt marker the tool prints before user input, used to find the
    /// reply when no snapshot is available
    pub prompt: String,
    /// Trailing lines inspected for "still working" indicators
    pub thinking_window: usize,
    pub thinking_patterns: Vec<String>,
    /// Extra patterns for questions the tool blocks on
    pub prompt_patterns: Vec<String>,
    pub status_patterns: Vec<String>,
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            uses_hook: false,
            hook_format: HookFormat::Generic,
            poll_interval_ms: 1000,
            stable_count: 3,
            timeout_secs: 600,
            submit_delay_ms: 200,
            prompt: String::new(),
            thinking_window: 8,
            thinking_patterns: Vec::new(),
            prompt_patterns: Vec::new(),
            status_patterns: Vec::new(),
        }
    }
}

/// Typed result of reading a hook payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPayload {
    /// Working directory the tool reported; matched against sessions
    pub identifier: String,
    pub last_prompt: Option<String>,
    pub reply: Option<String>,
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn send_input(&self, session: &str, input: &Keystrokes) -> Result<()>;

    async fn create_session(&self, session: &str, work_dir: &Path) -> Result<()>;

    async fn is_alive(&self, session: &str) -> bool;

    fn uses_hook(&self) -> bool;

    fn poll_interval(&self) -> Duration;

    fn stable_count(&self) -> u32;

    fn timeout(&self) -> Duration;

    fn handle_hook_data(&self, raw: &[u8]) -> Result<HookPayload>;

    /// Prompt marker, empty when the tool has none configured
    fn prompt(&self) -> &str;

    fn matcher(&self) -> Arc<dyn ActivityMatcher>;
}

/// Adapter for an interactive CLI running in a terminal session
pub struct CliAdapter {
    name: String,
    profile: ToolProfile,
    backend: Arc<dyn TerminalBackend>,
    matcher: Arc<dyn ActivityMatcher>,
}

impl CliAdapter {
    pub fn new(name: &str, profile: ToolProfile, backend: Arc<dyn TerminalBackend>) -> Result<Self> {
        let matcher = PatternMatcher::with_extra(
            profile.thinking_window,
            &profile.thinking_patterns,
            &profile.prompt_patterns,
            &profile.status_patterns,
        )?;
        Ok(Self {
            name: name.to_string(),
            profile,
            backend,
            matcher: Arc::new(matcher),
        })
    }
}

#[async_trait]
impl ToolAdapter for CliAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_input(&self, session: &str, input: &Keystrokes) -> Result<()> {
        match input {
            Keystrokes::Text(text) => {
                // Type first, Enter after a pause so the CLI sees one submission
                let delay = Duration::from_millis(self.profile.submit_delay_ms);
                self.backend.send_keys(session, text, Some(delay)).await
            }
            Keystrokes::Key(key) => self.backend.send_key(session, *key).await,
        }
    }

    async fn create_session(&self, session: &str, work_dir: &Path) -> Result<()> {
        if self.profile.command.is_empty() {
            return Err(BridgeError::Validation(format!(
                "tool {} has no command configured",
                self.name
            )));
        }
        self.backend
            .create_session(session, &self.profile.command, work_dir)
            .await
    }

    async fn is_alive(&self, session: &str) -> bool {
        self.backend.is_alive(session).await
    }

    fn uses_hook(&self) -> bool {
        self.profile.uses_hook
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.profile.poll_interval_ms)
    }

    fn stable_count(&self) -> u32 {
        self.profile.stable_count
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.profile.timeout_secs)
    }

    fn handle_hook_data(&self, raw: &[u8]) -> Result<HookPayload> {
        let payload = parse_hook_payload(self.profile.hook_format, raw)?;
        debug!(
            tool = %self.name,
            identifier = %payload.identifier,
            has_reply = payload.reply.is_some(),
            "Parsed hook payload"
        );
        Ok(payload)
    }

    fn prompt(&self) -> &str {
        &self.profile.prompt
    }

    fn matcher(&self) -> Arc<dyn ActivityMatcher> {
        Arc::clone(&self.matcher)
    }
}

/// Field names accepted for each part of a payload, first match wins
struct FieldAliases {
    identifier: &'static [&'static str],
    prompt: &'static [&'static str],
    reply: &'static [&'static str],
}

const CLAUDE_FIELDS: FieldAliases = FieldAliases {
    identifier: &["cwd"],
    prompt: &["prompt", "last_user_prompt"],
    reply: &["last_assistant_message"],
};

const CODEX_FIELDS: FieldAliases = FieldAliases {
    identifier: &["cwd"],
    prompt: &["last-user-message"],
    reply: &["last-assistant-message"],
};

const GENERIC_FIELDS: FieldAliases = FieldAliases {
    identifier: &["cwd", "work_dir", "workdir", "project_dir", "identifier"],
    prompt: &["last_user_prompt", "prompt", "user_prompt", "input"],
    reply: &[
        "reply",
        "response",
        "last_assistant_message",
        "last-assistant-message",
        "output",
        "message",
    ],
};

/// Read a hook body into a [`HookPayload`]
pub fn parse_hook_payload(format: HookFormat, raw: &[u8]) -> Result<HookPayload> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| BridgeError::HookParse(format!("invalid JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| BridgeError::HookParse("payload is not a JSON object".to_string()))?;

    let fields = match format {
        HookFormat::Claude => &CLAUDE_FIELDS,
        HookFormat::Codex => &CODEX_FIELDS,
        HookFormat::Generic => &GENERIC_FIELDS,
    };

    let identifier = first_str(obj, fields.identifier)
        .ok_or_else(|| BridgeError::HookParse("payload has no working directory".to_string()))?;

    let mut last_prompt = first_str(obj, fields.prompt);
    if last_prompt.is_none() && format == HookFormat::Codex {
        // Codex lists every user message of the turn
        last_prompt = obj
            .get("input-messages")
            .and_then(Value::as_array)
            .and_then(|msgs| msgs.iter().rev().find_map(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }

    Ok(HookPayload {
        identifier,
        last_prompt,
        reply: first_str(obj, fields.reply),
    })
}

fn first_str(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}
