//! Configuration file model.
//!
//! The bridge is configured from one JSON file. Every section has defaults,
//! so a minimal file only lists tools, sessions and who may talk to them.

use crate::adapter::ToolProfile;
use crate::engine::EngineSettings;
use crate::error::{BridgeError, Result};
use crate::extractor::ExtractorConfig;
use crate::filter::PatternMatcher;
use crate::history::{validate_identifier, HistoryConfig};
use crate::watchdog::CaptureConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
    /// Platform name messages from this connector are tagged with
    pub platform: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/chat-relay.sock"),
            platform: "socket".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Address the callback endpoint listens on, e.g. `127.0.0.1:8765`
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    pub tool: String,
    pub work_dir: PathBuf,
    /// Start the terminal session at startup if it is not running
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket: SocketConfig,
    /// Callback endpoint; disabled when absent
    pub hook: Option<HookConfig>,
    /// Capacity of the inbound message queue
    pub inbound_queue: usize,
    pub default_session: Option<String>,
    /// Platform -> allowed user ids
    pub allow: HashMap<String, Vec<String>>,
    /// Platform -> user ids that may create and remove sessions
    pub admins: HashMap<String, Vec<String>>,
    pub history: HistoryConfig,
    pub capture: CaptureConfig,
    pub extract: ExtractorConfig,
    /// Tool type -> profile
    pub tools: HashMap<String, ToolProfile>,
    pub sessions: Vec<SessionConfig>,
    pub max_reply_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            hook: None,
            inbound_queue: 64,
            default_session: None,
            allow: HashMap::new(),
            admins: HashMap::new(),
            history: HistoryConfig::default(),
            capture: CaptureConfig::default(),
            extract: ExtractorConfig::default(),
            tools: HashMap::new(),
            sessions: Vec::new(),
            max_reply_chars: 3500,
        }
    }
}

fn invalid(message: impl Into<String>) -> BridgeError {
    BridgeError::Validation(message.into())
}

impl Config {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .context(format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .context(format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .context(format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inbound_queue == 0 {
            return Err(invalid("inbound_queue must be at least 1"));
        }
        if self.history.max_entries == 0 {
            return Err(invalid("history.max_entries must be at least 1"));
        }
        if self.capture.lines == 0 || self.capture.max_attempts == 0 {
            return Err(invalid("capture.lines and capture.max_attempts must be at least 1"));
        }
        if self.extract.tail_lines == 0 {
            return Err(invalid("extract.tail_lines must be at least 1"));
        }
        for (field, value) in [
            ("extract.boundary_ratio", self.extract.boundary_ratio),
            ("extract.fallback_fraction", self.extract.fallback_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(format!("{} must be in (0, 1], got {}", field, value)));
            }
        }

        for (name, tool) in &self.tools {
            validate_identifier("tool type", name)?;
            if tool.stable_count == 0 {
                return Err(invalid(format!("tool {}: stable_count must be at least 1", name)));
            }
            if tool.poll_interval_ms == 0 || tool.timeout_secs == 0 {
                return Err(invalid(format!(
                    "tool {}: poll_interval_ms and timeout_secs must be non-zero",
                    name
                )));
            }
            PatternMatcher::with_extra(
                tool.thinking_window,
                &tool.thinking_patterns,
                &tool.prompt_patterns,
                &tool.status_patterns,
            )?;
        }

        let mut seen = HashSet::new();
        for session in &self.sessions {
            validate_identifier("session name", &session.name)?;
            if !seen.insert(session.name.as_str()) {
                return Err(invalid(format!("duplicate session {}", session.name)));
            }
            if !self.tools.contains_key(&session.tool) {
                return Err(invalid(format!(
                    "session {} uses unknown tool {}",
                    session.name, session.tool
                )));
            }
        }

        if let Some(name) = &self.default_session {
            if !seen.contains(name.as_str()) {
                return Err(invalid(format!("default_session {} is not configured", name)));
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let to_sets = |lists: &HashMap<String, Vec<String>>| -> HashMap<String, HashSet<String>> {
            lists
                .iter()
                .map(|(platform, users)| (platform.clone(), users.iter().cloned().collect()))
                .collect()
        };
        EngineSettings {
            default_session: self.default_session.clone(),
            allow: to_sets(&self.allow),
            admins: to_sets(&self.admins),
            max_reply_chars: self.max_reply_chars,
            capture: self.capture,
            extract: self.extract,
        }
    }
}
