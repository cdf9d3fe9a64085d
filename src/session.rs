//! Session registry and state machine.
//!
//! Owns every session record plus the channel bindings used to route
//! asynchronous replies. All access goes through one reader/writer lock
//! that never escapes this module, so no caller can hold it across I/O.
//!
//! Each session has at most one armed watchdog. Arming cancels whatever
//! was armed before, and releasing only succeeds for the lease that is
//! still installed, which keeps a superseded watchdog from delivering.

use crate::error::{BridgeError, Result};
use crate::history::validate_identifier;
use crate::protocol::{current_timestamp_ms, SessionState};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read-only view of a session handed to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub tool: String,
    pub work_dir: PathBuf,
    pub state: SessionState,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    /// Created on demand rather than from configuration
    pub dynamic: bool,
    pub creator: Option<String>,
    pub watchdog_armed: bool,
}

/// Chat route that most recently sent input to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub platform: String,
    pub channel_id: String,
}

/// Proof of an armed watchdog, returned by [`SessionRegistry::arm_watchdog`]
#[derive(Debug, Clone)]
pub struct WatchdogLease {
    session: String,
    generation: u64,
    token: CancellationToken,
}

impl WatchdogLease {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct WatchdogSlot {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct Session {
    name: String,
    tool: String,
    work_dir: PathBuf,
    state: SessionState,
    created_at: u64,
    dynamic: bool,
    creator: Option<String>,
    /// Pane capture taken just before the current turn was dispatched
    snapshot: Option<String>,
    watchdog: Option<WatchdogSlot>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            tool: self.tool.clone(),
            work_dir: self.work_dir.clone(),
            state: self.state,
            created_at: self.created_at,
            dynamic: self.dynamic,
            creator: self.creator.clone(),
            watchdog_armed: self.watchdog.is_some(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    /// Registration order, for "first registered session" routing
    order: Vec<String>,
    bindings: HashMap<String, ChannelBinding>,
    next_generation: u64,
}

impl RegistryInner {
    fn session_mut(&mut self, name: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| BridgeError::not_found("session", name))
    }
}

/// Thread-safe owner of all sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session from configuration
    pub async fn create(&self, name: &str, tool: &str, work_dir: PathBuf) -> Result<SessionInfo> {
        self.insert(name, tool, work_dir, false, None).await
    }

    /// Register a session created on demand by `creator`
    pub async fn create_dynamic(
        &self,
        name: &str,
        tool: &str,
        work_dir: PathBuf,
        creator: &str,
    ) -> Result<SessionInfo> {
        self.insert(name, tool, work_dir, true, Some(creator.to_string()))
            .await
    }

    async fn insert(
        &self,
        name: &str,
        tool: &str,
        work_dir: PathBuf,
        dynamic: bool,
        creator: Option<String>,
    ) -> Result<SessionInfo> {
        validate_identifier("session name", name)?;
        validate_identifier("tool type", tool)?;

        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(name) {
            return Err(BridgeError::AlreadyExists(name.to_string()));
        }
        let session = Session {
            name: name.to_string(),
            tool: tool.to_string(),
            work_dir,
            state: SessionState::Idle,
            created_at: current_timestamp_ms(),
            dynamic,
            creator,
            snapshot: None,
            watchdog: None,
        };
        let info = session.info();
        inner.sessions.insert(name.to_string(), session);
        inner.order.push(name.to_string());
        info!(session = %name, tool = %tool, dynamic, "Session registered");
        Ok(info)
    }

    /// Remove a session, cancelling its watchdog and dropping its binding
    pub async fn remove(&self, name: &str) -> Result<SessionInfo> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .remove(name)
            .ok_or_else(|| BridgeError::not_found("session", name))?;
        if let Some(slot) = &session.watchdog {
            slot.token.cancel();
        }
        inner.order.retain(|n| n != name);
        inner.bindings.remove(name);
        info!(session = %name, "Session removed");
        Ok(session.info())
    }

    pub async fn get(&self, name: &str) -> Result<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(name)
            .map(Session::info)
            .ok_or_else(|| BridgeError::not_found("session", name))
    }

    /// All sessions in registration order
    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|name| inner.sessions.get(name))
            .map(Session::info)
            .collect()
    }

    /// First registered session, if any
    pub async fn first(&self) -> Option<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .order
            .first()
            .and_then(|name| inner.sessions.get(name))
            .map(Session::info)
    }

    /// Move `name` to `state`, returning the previous state
    pub async fn set_state(&self, name: &str, state: SessionState) -> Result<SessionState> {
        let mut inner = self.inner.write().await;
        let session = inner.session_mut(name)?;
        let previous = session.state;
        if !previous.can_transition_to(state) {
            warn!(session = %name, "Rejected transition {} -> {}", previous, state);
            return Err(BridgeError::InvalidTransition {
                from: previous,
                to: state,
            });
        }
        session.state = state;
        if previous != state {
            debug!(session = %name, "State {} -> {}", previous, state);
        }
        Ok(previous)
    }

    /// Record the chat route that last sent input to `name`
    pub async fn bind_channel(&self, name: &str, platform: &str, channel_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(name) {
            return Err(BridgeError::not_found("session", name));
        }
        inner.bindings.insert(
            name.to_string(),
            ChannelBinding {
                platform: platform.to_string(),
                channel_id: channel_id.to_string(),
            },
        );
        Ok(())
    }

    pub async fn binding(&self, name: &str) -> Option<ChannelBinding> {
        self.inner.read().await.bindings.get(name).cloned()
    }

    pub async fn set_snapshot(&self, name: &str, snapshot: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.session_mut(name)?.snapshot = snapshot;
        Ok(())
    }

    pub async fn snapshot(&self, name: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.sessions.get(name).and_then(|s| s.snapshot.clone())
    }

    /// Session whose working directory matches `identifier`, ignoring
    /// trailing slashes on either side
    pub async fn find_by_work_dir(&self, identifier: &str) -> Option<SessionInfo> {
        let wanted = normalize_dir(identifier);
        if wanted.is_empty() {
            return None;
        }
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|name| inner.sessions.get(name))
            .find(|s| normalize_dir(&s.work_dir.to_string_lossy()) == wanted)
            .map(Session::info)
    }

    /// Install a fresh watchdog for `name`, cancelling any previous one
    pub async fn arm_watchdog(&self, name: &str) -> Result<WatchdogLease> {
        let mut inner = self.inner.write().await;
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let session = inner.session_mut(name)?;

        if let Some(previous) = session.watchdog.take() {
            debug!(
                session = %name,
                generation = previous.generation,
                "Cancelling superseded watchdog"
            );
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        session.watchdog = Some(WatchdogSlot {
            generation,
            token: token.clone(),
        });
        Ok(WatchdogLease {
            session: name.to_string(),
            generation,
            token,
        })
    }

    /// Clear the watchdog slot if `lease` is still the installed one.
    ///
    /// Returns `false` when the lease was superseded or disarmed, in which
    /// case the caller must not deliver anything.
    pub async fn release(&self, lease: &WatchdogLease) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(&lease.session) else {
            return false;
        };
        let current = matches!(
            &session.watchdog,
            Some(slot) if slot.generation == lease.generation && !slot.token.is_cancelled()
        );
        if current {
            session.watchdog = None;
        }
        current
    }

    /// Cancel and clear whatever watchdog `name` has armed
    pub async fn disarm(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(name) else {
            return false;
        };
        match session.watchdog.take() {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every armed watchdog (shutdown)
    pub async fn cancel_all(&self) -> usize {
        let mut inner = self.inner.write().await;
        let mut cancelled = 0;
        for session in inner.sessions.values_mut() {
            if let Some(slot) = session.watchdog.take() {
                slot.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

fn normalize_dir(path: &str) -> &str {
    let trimmed = path.trim();
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() && trimmed.starts_with('/') {
        "/"
    } else {
        stripped
    }
}
