//! Terminal backend: persistent, addressable terminal sessions.
//!
//! The engine only needs to capture pane text, type into a pane and ask
//! whether a session is alive. [`TmuxBackend`] provides that on top of the
//! `tmux` CLI.

use crate::error::{BridgeError, Result};
use crate::protocol::ControlKey;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Last `lines` lines of the session's pane, including scrollback
    async fn capture(&self, session: &str, lines: usize) -> Result<String>;

    /// Type `text` literally. With `submit_after`, wait that long and then
    /// press Enter.
    async fn send_keys(&self, session: &str, text: &str, submit_after: Option<Duration>)
        -> Result<()>;

    async fn send_key(&self, session: &str, key: ControlKey) -> Result<()>;

    async fn is_alive(&self, session: &str) -> bool;

    async fn list_sessions(&self) -> Result<Vec<String>>;

    /// Start `command` detached in a new session rooted at `work_dir`
    async fn create_session(&self, session: &str, command: &[String], work_dir: &Path)
        -> Result<()>;
}

/// [`TerminalBackend`] driving the `tmux` binary
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    binary: String,
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxBackend {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| BridgeError::Backend(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(BridgeError::Backend(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    async fn capture(&self, session: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines);
        let target = pane_target(session);
        let raw = self
            .run(&["capture-pane", "-p", "-J", "-t", &target, "-S", &start])
            .await?;
        Ok(last_lines(&raw, lines))
    }

    async fn send_keys(
        &self,
        session: &str,
        text: &str,
        submit_after: Option<Duration>,
    ) -> Result<()> {
        let target = pane_target(session);
        if !text.is_empty() {
            debug!(session = %session, "Typing {} bytes", text.len());
            self.run(&["send-keys", "-t", &target, "-l", "--", text])
                .await?;
        }
        if let Some(delay) = submit_after {
            tokio::time::sleep(delay).await;
            self.run(&["send-keys", "-t", &target, "Enter"]).await?;
        }
        Ok(())
    }

    async fn send_key(&self, session: &str, key: ControlKey) -> Result<()> {
        debug!(session = %session, "Sending key {}", key.tmux_name());
        self.run(&["send-keys", "-t", &pane_target(session), key.tmux_name()])
            .await
            .map(|_| ())
    }

    async fn is_alive(&self, session: &str) -> bool {
        self.run(&["has-session", "-t", &session_target(session)])
            .await
            .is_ok()
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            // No server means no sessions
            Err(BridgeError::Backend(msg)) if msg.contains("no server running") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn create_session(
        &self,
        session: &str,
        command: &[String],
        work_dir: &Path,
    ) -> Result<()> {
        if session.contains(['.', ':']) {
            return Err(BridgeError::Validation(format!(
                "tmux would rename session {:?}",
                session
            )));
        }
        let dir = work_dir.to_string_lossy();
        let mut args = vec!["new-session", "-d", "-s", session, "-c", dir.as_ref()];
        args.extend(command.iter().map(String::as_str));
        self.run(&args).await?;
        info!(session = %session, "Started tmux session in {}", dir);
        Ok(())
    }
}

/// Exact-match session target. A bare name would also match by prefix.
fn session_target(session: &str) -> String {
    format!("={}", session)
}

/// Active pane of the exactly named session
fn pane_target(session: &str) -> String {
    format!("={}:", session)
}

/// Keep the last `count` lines, ignoring the blank padding tmux adds below
/// the cursor
fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    let start = end.saturating_sub(count);
    lines[start..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_lines_drops_padding() {
        let raw = "a\nb\nc\nd\n\n\n\n";
        assert_eq!(last_lines(raw, 2), "c\nd");
        assert_eq!(last_lines(raw, 10), "a\nb\nc\nd");
        assert_eq!(last_lines("\n\n", 5), "");
    }

    #[tokio::test]
    async fn test_missing_binary_is_backend_error() {
        let backend = TmuxBackend::new("/nonexistent/tmux-binary");
        assert!(matches!(
            backend.capture("alpha", 10).await,
            Err(BridgeError::Backend(_))
        ));
        assert!(!backend.is_alive("alpha").await);
    }

    #[test]
    fn test_targets_are_exact() {
        assert_eq!(session_target("alpha"), "=alpha");
        assert_eq!(pane_target("alpha"), "=alpha:");
        assert_ne!(pane_target("alpha"), pane_target("alpha2"));
    }

    #[tokio::test]
    async fn test_rejects_names_tmux_would_rewrite() {
        // Rejected before tmux is ever run
        let backend = TmuxBackend::new("/nonexistent/tmux-binary");
        let cmd = vec!["claude".to_string()];
        for name in ["a.b", "host:0"] {
            assert!(matches!(
                backend.create_session(name, &cmd, Path::new("/tmp")).await,
                Err(BridgeError::Validation(_))
            ));
        }
        assert!(matches!(
            backend.create_session("alpha", &cmd, Path::new("/tmp")).await,
            Err(BridgeError::Backend(_))
        ));
    }
}
