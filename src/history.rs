//! Per-session input history.
//!
//! Every input sent to a session is appended to
//! `{root}/{session}/history.jsonl` as one JSON record per line. The log is
//! bounded: once it grows past `max_entries` the oldest records are evicted
//! and the file is compacted, so evicted inputs cannot be recovered.
//!
//! Session identifiers may come straight from chat text, so they are
//! validated here before they are ever joined onto a filesystem path.

use crate::error::{BridgeError, Result};
use crate::protocol::{current_timestamp_ms, InputRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Maximum length of a session or tool identifier
pub const MAX_IDENTIFIER_LEN: usize = 64;

const HISTORY_FILE: &str = "history.jsonl";

/// Configuration for the input history store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Directory holding one subdirectory per session
    pub root: PathBuf,
    /// Entries kept per session
    pub max_entries: usize,
    /// Largest accepted input, in bytes
    pub max_content_bytes: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/history"),
            max_entries: 50,
            max_content_bytes: 64 * 1024,
        }
    }
}

/// Check that `id` is safe to use as a path component.
///
/// Accepts ASCII letters, digits, `-` and `_`; rejects empty or overlong
/// identifiers and anything resembling path traversal. `.` and `:` are
/// excluded because tmux rewrites them in session names.
pub fn validate_identifier(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BridgeError::Validation(format!("{} must not be empty", kind)));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(BridgeError::Validation(format!(
            "{} longer than {} characters",
            kind, MAX_IDENTIFIER_LEN
        )));
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(BridgeError::Validation(format!(
            "{} contains a path sequence: {:?}",
            kind, id
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(BridgeError::Validation(format!(
            "{} contains invalid characters: {:?}",
            kind, id
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct SessionLog {
    /// Oldest first
    entries: VecDeque<InputRecord>,
}

/// Bounded, persisted input log for every session
pub struct InputHistory {
    config: HistoryConfig,
    /// Session name -> its log. The outer lock is only held to look up or
    /// insert a log; reads and writes lock the per-session log.
    logs: Mutex<HashMap<String, Arc<RwLock<SessionLog>>>>,
}

impl InputHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Append one input for `session`
    pub fn record(&self, session: &str, content: &str) -> Result<InputRecord> {
        validate_identifier("session name", session)?;
        if content.trim().is_empty() {
            return Err(BridgeError::Validation("input must not be empty".to_string()));
        }
        if content.len() > self.config.max_content_bytes {
            return Err(BridgeError::Validation(format!(
                "input of {} bytes exceeds the {} byte limit",
                content.len(),
                self.config.max_content_bytes
            )));
        }

        let record = InputRecord {
            content: content.to_string(),
            timestamp: current_timestamp_ms(),
        };

        let log = self.log_for(session)?;
        let mut log = log.write().unwrap_or_else(PoisonError::into_inner);

        let dir = self.config.root.join(session);
        fs::create_dir_all(&dir)?;
        let path = dir.join(HISTORY_FILE);

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        log.entries.push_back(record.clone());
        if log.entries.len() > self.config.max_entries {
            while log.entries.len() > self.config.max_entries {
                log.entries.pop_front();
            }
            compact(&path, &log.entries)?;
        }

        debug!(session = %session, entries = log.entries.len(), "Recorded input");
        Ok(record)
    }

    /// Most recent input for `session`
    pub fn get_last(&self, session: &str) -> Result<InputRecord> {
        validate_identifier("session name", session)?;
        let log = self.log_for(session)?;
        let log = log.read().unwrap_or_else(PoisonError::into_inner);
        log.entries
            .back()
            .cloned()
            .ok_or_else(|| BridgeError::not_found("inputs for session", session))
    }

    /// All retained inputs for `session`, newest first
    pub fn get_all(&self, session: &str) -> Result<Vec<InputRecord>> {
        validate_identifier("session name", session)?;
        let log = self.log_for(session)?;
        let log = log.read().unwrap_or_else(PoisonError::into_inner);
        Ok(log.entries.iter().rev().cloned().collect())
    }

    pub fn has_input(&self, session: &str) -> bool {
        self.get_last(session).is_ok()
    }

    fn log_for(&self, session: &str) -> Result<Arc<RwLock<SessionLog>>> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = logs.get(session) {
            return Ok(Arc::clone(log));
        }
        let path = self.config.root.join(session).join(HISTORY_FILE);
        let entries = load(&path, self.config.max_entries)?;
        let log = Arc::new(RwLock::new(SessionLog { entries }));
        logs.insert(session.to_string(), Arc::clone(&log));
        Ok(log)
    }
}

/// Read a history file, keeping the newest `max` well-formed records
fn load(path: &Path, max: usize) -> Result<VecDeque<InputRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = VecDeque::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<InputRecord>(line) {
            Ok(record) => {
                entries.push_back(record);
                if entries.len() > max {
                    entries.pop_front();
                }
            }
            Err(e) => warn!("Skipping malformed history line in {:?}: {}", path, e),
        }
    }
    Ok(entries)
}

/// Rewrite the history file with exactly `entries`
fn compact(path: &Path, entries: &VecDeque<InputRecord>) -> Result<()> {
    let mut out = String::new();
    for record in entries {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, out)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
