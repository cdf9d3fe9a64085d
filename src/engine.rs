//! Orchestration engine.
//!
//! One consumer loop drains the inbound chat queue. Each message is
//! authorized, checked against the built-in commands and otherwise routed
//! to the active session. Watchdogs run as background tasks and hand their
//! result back through the session's channel binding, never through the
//! inbound queue.

use crate::adapter::ToolAdapter;
use crate::error::{BridgeError, Result};
use crate::extractor::ExtractorConfig;
use crate::filter::{strip_escape_sequences, trim_blank_edges};
use crate::history::InputHistory;
use crate::protocol::{current_timestamp_ms, ChatMessage, Keystrokes, ReplyEvent, SessionState};
use crate::session::{SessionInfo, SessionRegistry, WatchdogLease};
use crate::terminal::TerminalBackend;
use crate::watchdog::{
    sleep_or_cancel, wait_for_stable, Anchor, CaptureConfig, CapturePipeline, Extraction,
    PollSettings,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DENIED: &str = "Sorry, you are not allowed to use this bridge.";
pub const NO_ACTIVE_SESSION: &str = "No active session. Ask an admin to create one.";

const HELP: &str = "\
Messages are typed into the active session's terminal.
Commands:
  help       this text
  sessions   list sessions
  status     state of the active session
  whoami     your identity as the bridge sees it
  view [n]   last n lines of the terminal (default 50, max 500)
Keys: tab, esc, shift-tab, enter, interrupt";

pub const DEFAULT_VIEW_LINES: usize = 50;
pub const MAX_VIEW_LINES: usize = 500;

/// Outbound side of a chat connector
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// Active session override; otherwise the first registered session
    pub default_session: Option<String>,
    /// Platform -> user ids allowed to talk to the bridge
    pub allow: HashMap<String, HashSet<String>>,
    /// Platform -> user ids allowed to create and remove sessions
    pub admins: HashMap<String, HashSet<String>>,
    /// Longest outbound chat message; 0 disables chunking
    pub max_reply_chars: usize,
    pub capture: CaptureConfig,
    pub extract: ExtractorConfig,
}

/// What happened to a hook callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The payload carried a reply and it was sent
    Delivered,
    /// No reply in the payload; capturing the pane in the background
    Capturing,
    /// Nobody has talked to the session yet, so there is nowhere to reply
    NoChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Sessions,
    Status,
    Whoami,
    View(usize),
}

impl Command {
    /// Exact match on the trimmed message. A `view` argument that is not a
    /// number in range is not a command.
    fn parse(input: &str) -> Option<Self> {
        match input {
            "help" => Some(Command::Help),
            "sessions" => Some(Command::Sessions),
            "status" => Some(Command::Status),
            "whoami" => Some(Command::Whoami),
            "view" => Some(Command::View(DEFAULT_VIEW_LINES)),
            _ => {
                let lines: usize = input.strip_prefix("view ")?.trim().parse().ok()?;
                (1..=MAX_VIEW_LINES)
                    .contains(&lines)
                    .then_some(Command::View(lines))
            }
        }
    }
}

struct Inner {
    settings: EngineSettings,
    registry: SessionRegistry,
    history: InputHistory,
    backend: Arc<dyn TerminalBackend>,
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
    sinks: RwLock<HashMap<String, Arc<dyn ChatSink>>>,
    pipeline: CapturePipeline,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Cheap to clone; clones share all state
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn TerminalBackend>,
        adapters: HashMap<String, Arc<dyn ToolAdapter>>,
        history: InputHistory,
    ) -> Self {
        let pipeline = CapturePipeline::new(settings.capture, settings.extract);
        Self {
            inner: Arc::new(Inner {
                settings,
                registry: SessionRegistry::new(),
                history,
                backend,
                adapters,
                sinks: RwLock::new(HashMap::new()),
                pipeline,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    #[cfg(test)]
    pub fn history(&self) -> &InputHistory {
        &self.inner.history
    }

    /// Route outbound text for `platform` to `sink`
    pub fn register_sink(&self, platform: &str, sink: Arc<dyn ChatSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform.to_string(), sink);
    }

    fn sink(&self, platform: &str) -> Option<Arc<dyn ChatSink>> {
        self.inner
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(platform)
            .cloned()
    }

    fn adapter(&self, tool: &str) -> Result<Arc<dyn ToolAdapter>> {
        self.inner
            .adapters
            .get(tool)
            .cloned()
            .ok_or_else(|| BridgeError::not_found("tool adapter", tool))
    }

    /// Register a configured session, starting it when `auto_start` is set.
    ///
    /// A failed start is logged and the session stays registered.
    pub async fn add_session(
        &self,
        name: &str,
        tool: &str,
        work_dir: PathBuf,
        auto_start: bool,
    ) -> Result<SessionInfo> {
        let adapter = self.adapter(tool)?;
        let info = self
            .inner
            .registry
            .create(name, tool, work_dir.clone())
            .await?;
        if auto_start {
            if let Err(e) = ensure_started(adapter.as_ref(), name, &work_dir).await {
                warn!(session = %name, "Auto-start failed: {}", e);
            }
        }
        Ok(info)
    }

    /// Create a session on behalf of an admin
    pub async fn create_session(
        &self,
        platform: &str,
        user_id: &str,
        name: &str,
        tool: &str,
        work_dir: PathBuf,
    ) -> Result<SessionInfo> {
        self.require_admin(platform, user_id)?;
        let adapter = self.adapter(tool)?;
        let info = self
            .inner
            .registry
            .create_dynamic(name, tool, work_dir.clone(), user_id)
            .await?;

        if let Err(e) = ensure_started(adapter.as_ref(), name, &work_dir).await {
            if let Err(cleanup) = self.inner.registry.remove(name).await {
                warn!(session = %name, "Cleanup after failed start: {}", cleanup);
            }
            return Err(e);
        }
        Ok(info)
    }

    /// Forget a session on behalf of an admin. The terminal is left running.
    pub async fn remove_session(
        &self,
        platform: &str,
        user_id: &str,
        name: &str,
    ) -> Result<SessionInfo> {
        self.require_admin(platform, user_id)?;
        self.inner.registry.remove(name).await
    }

    fn is_allowed(&self, platform: &str, user_id: &str) -> bool {
        contains_user(&self.inner.settings.allow, platform, user_id)
    }

    fn is_admin(&self, platform: &str, user_id: &str) -> bool {
        contains_user(&self.inner.settings.admins, platform, user_id)
    }

    fn require_admin(&self, platform: &str, user_id: &str) -> Result<()> {
        if self.is_admin(platform, user_id) {
            Ok(())
        } else {
            Err(BridgeError::Unauthorized {
                platform: platform.to_string(),
                user_id: user_id.to_string(),
            })
        }
    }

    /// Drain `inbound` until it closes or the engine shuts down
    pub async fn run(&self, mut inbound: mpsc::Receiver<ChatMessage>) {
        info!("Engine started");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        info!("Inbound queue closed");
                        break;
                    }
                },
            }
        }
        inbound.close();
        info!("Engine stopped");
    }

    /// Stop accepting input, cancel every watchdog and wait up to `grace`
    /// for background tasks to wind down
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let cancelled = self.inner.registry.cancel_all().await;
        self.inner.tasks.close();
        info!(cancelled, "Cancelled outstanding watchdogs");

        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("Background tasks still running after {:?}", grace);
        }
    }

    pub async fn handle_message(&self, msg: ChatMessage) {
        if !self.is_allowed(&msg.platform, &msg.user_id) {
            let err = BridgeError::Unauthorized {
                platform: msg.platform.clone(),
                user_id: msg.user_id.clone(),
            };
            warn!("{}", err);
            self.reply(&msg, DENIED).await;
            return;
        }

        let content = msg.content.trim();
        if content.is_empty() {
            return;
        }

        if let Some(command) = Command::parse(content) {
            debug!(user = %msg.user_id, ?command, "Command");
            let text = self.run_command(command, &msg).await;
            self.reply(&msg, &text).await;
            return;
        }

        let Some(session) = self.active_session().await else {
            self.reply(&msg, NO_ACTIVE_SESSION).await;
            return;
        };

        if let Err(e) = self.dispatch(&session, &msg, content).await {
            warn!(session = %session.name, "Input not delivered: {}", e);
            let text = match &e {
                BridgeError::Validation(_) => format!("Input rejected: {}", e),
                BridgeError::Backend(_) => {
                    format!("Could not reach session {}: {}", session.name, e)
                }
                _ => format!("Session {}: {}", session.name, e),
            };
            self.reply(&msg, &text).await;
        }
    }

    async fn active_session(&self) -> Option<SessionInfo> {
        if let Some(name) = &self.inner.settings.default_session {
            if let Ok(info) = self.inner.registry.get(name).await {
                return Some(info);
            }
        }
        self.inner.registry.first().await
    }

    /// Send one chat message into `session` and arm its watchdog
    async fn dispatch(&self, session: &SessionInfo, msg: &ChatMessage, content: &str) -> Result<()> {
        let registry = &self.inner.registry;
        let name = session.name.as_str();
        registry
            .bind_channel(name, &msg.platform, &msg.channel_id)
            .await?;
        let adapter = self.adapter(&session.tool)?;

        let keystrokes = Keystrokes::from_input(content);
        let follow_up = session.state == SessionState::WaitingInput;

        // Rejected input never reaches the tool
        let input = match &keystrokes {
            Keystrokes::Text(text) => {
                self.inner.history.record(name, text)?;
                Some(text.clone())
            }
            Keystrokes::Key(_) => self.inner.history.get_last(name).ok().map(|r| r.content),
        };

        // The previous turn's watchdog must stop before the snapshot moves
        let lease = registry.arm_watchdog(name).await?;
        if let Err(e) = self
            .send_turn(name, adapter.as_ref(), &keystrokes, follow_up)
            .await
        {
            registry.release(&lease).await;
            return Err(e);
        }

        info!(
            session = %name,
            tool = %adapter.name(),
            follow_up,
            hook = adapter.uses_hook(),
            "Input dispatched"
        );

        let engine = self.clone();
        let task_lease = lease.clone();
        self.spawn_guarded(lease, async move {
            engine.watch(task_lease, adapter, input).await;
        });
        Ok(())
    }

    /// Snapshot the pane for a new turn, mark the session busy and type
    /// the input. A failed send puts the state back.
    async fn send_turn(
        &self,
        name: &str,
        adapter: &dyn ToolAdapter,
        keystrokes: &Keystrokes,
        follow_up: bool,
    ) -> Result<()> {
        let registry = &self.inner.registry;
        if matches!(keystrokes, Keystrokes::Text(_)) && !follow_up {
            let snapshot = match self
                .inner
                .backend
                .capture(name, self.inner.pipeline.capture_lines())
                .await
            {
                Ok(pane) => Some(pane),
                Err(e) => {
                    warn!(session = %name, "Snapshot capture failed: {}", e);
                    None
                }
            };
            registry.set_snapshot(name, snapshot).await?;
        }

        let previous = registry.set_state(name, SessionState::Processing).await?;
        if let Err(e) = adapter.send_input(name, keystrokes).await {
            // The superseded turn's watchdog is gone, so nothing would
            // ever bring a restored `processing` back to idle
            let restore = match previous {
                SessionState::Processing => SessionState::Idle,
                other => other,
            };
            if let Err(revert) = registry.set_state(name, restore).await {
                warn!(session = %name, "Could not restore state: {}", revert);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Run `task` on the tracker. A panic inside it fails the watchdog.
    fn spawn_guarded<F>(&self, lease: WatchdogLease, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                error!(
                    session = %lease.session(),
                    "Watchdog task panicked: {}",
                    panic_message(&*panic)
                );
                engine
                    .fail(&lease, BridgeError::Backend("watchdog task failed".to_string()))
                    .await;
            }
        });
    }

    async fn watch(&self, lease: WatchdogLease, adapter: Arc<dyn ToolAdapter>, input: Option<String>) {
        let session = lease.session();

        if adapter.uses_hook() {
            // The hook callback does the work; this only enforces the timeout
            let timeout = adapter.timeout();
            if sleep_or_cancel(timeout, lease.token()).await {
                self.fail(&lease, BridgeError::Timeout { after: timeout })
                    .await;
            }
            return;
        }

        let settings = PollSettings {
            interval: adapter.poll_interval(),
            stable_count: adapter.stable_count(),
            timeout: adapter.timeout(),
            capture_lines: self.inner.pipeline.capture_lines(),
        };
        let backend = self.inner.backend.as_ref();

        let result = match wait_for_stable(backend, session, &settings, lease.token()).await {
            Ok(raw) => {
                let snapshot = self.inner.registry.snapshot(session).await;
                let anchor = Anchor {
                    snapshot: snapshot.as_deref(),
                    input: input.as_deref(),
                    prompt: Some(adapter.prompt()),
                };
                let extraction = self.inner.pipeline.extract(&raw, anchor, adapter.matcher());
                if !extraction.thinking && !extraction.text.is_empty() {
                    Ok(extraction)
                } else {
                    debug!(
                        session = %session,
                        thinking = extraction.thinking,
                        "Stable pane has no finished reply, retrying capture"
                    );
                    self.inner
                        .pipeline
                        .retry_capture(backend, session, anchor, adapter.matcher(), lease.token())
                        .await
                }
            }
            Err(e) => Err(e),
        };

        self.finish(&lease, result).await;
    }

    async fn finish(&self, lease: &WatchdogLease, result: Result<Extraction>) {
        match result {
            Ok(extraction) => self.complete(lease, extraction).await,
            Err(BridgeError::Cancelled) => {
                debug!(session = %lease.session(), "Watchdog cancelled");
            }
            Err(e) => self.fail(lease, e).await,
        }
    }

    /// Deliver the reply if `lease` is still the armed watchdog. A reply
    /// ending in a question leaves the session waiting for the answer.
    async fn complete(&self, lease: &WatchdogLease, extraction: Extraction) {
        let session = lease.session();
        if !self.inner.registry.release(lease).await {
            debug!(session = %session, "Watchdog superseded, dropping result");
            return;
        }
        let Extraction {
            text,
            awaiting_input,
            ..
        } = extraction;

        if awaiting_input && !text.trim().is_empty() {
            match self
                .inner
                .registry
                .set_state(session, SessionState::WaitingInput)
                .await
            {
                Ok(_) => info!(session = %session, "Tool is waiting for an answer"),
                Err(e) => warn!(session = %session, "Keeping state: {}", e),
            }
        } else {
            self.settle(session).await;
        }

        if text.trim().is_empty() {
            info!(session = %session, "Empty reply, nothing to send");
            return;
        }
        self.deliver(ReplyEvent::new(session, text)).await;
    }

    async fn fail(&self, lease: &WatchdogLease, err: BridgeError) {
        let session = lease.session();
        if !self.inner.registry.release(lease).await {
            return;
        }
        warn!(session = %session, "Watchdog failed: {}", err);
        if let Err(e) = self
            .inner
            .registry
            .set_state(session, SessionState::Error)
            .await
        {
            warn!(session = %session, "Could not mark session failed: {}", e);
        }
        let notice = format!(
            "Session {} failed: {}. Send \"status\" to check on it.",
            session, err
        );
        self.deliver(ReplyEvent::new(session, notice)).await;
    }

    /// Back to idle after a reply; sessions in another state keep it
    async fn settle(&self, session: &str) {
        if let Err(e) = self
            .inner
            .registry
            .set_state(session, SessionState::Idle)
            .await
        {
            warn!(session = %session, "Keeping state: {}", e);
        }
    }

    /// Route a reply to the channel bound to its session
    async fn deliver(&self, event: ReplyEvent) -> bool {
        let Some(binding) = self.inner.registry.binding(&event.session).await else {
            warn!(session = %event.session, "No channel bound, dropping reply");
            return false;
        };
        let Some(sink) = self.sink(&binding.platform) else {
            warn!(
                session = %event.session,
                platform = %binding.platform,
                "No connector for platform, dropping reply"
            );
            return false;
        };

        for chunk in chunk_reply(&event.text, self.inner.settings.max_reply_chars) {
            if let Err(e) = sink.send(&binding.channel_id, &chunk).await {
                warn!(session = %event.session, "Reply delivery failed: {}", e);
                return false;
            }
        }

        let latency_ms = self
            .inner
            .history
            .get_last(&event.session)
            .ok()
            .map(|r| event.timestamp.saturating_sub(r.timestamp));
        info!(
            session = %event.session,
            chars = event.text.chars().count(),
            latency_ms = ?latency_ms,
            "Reply delivered"
        );
        true
    }

    /// Reply on the channel a message came from
    async fn reply(&self, msg: &ChatMessage, text: &str) {
        let Some(sink) = self.sink(&msg.platform) else {
            warn!(platform = %msg.platform, "No connector for platform");
            return;
        };
        for chunk in chunk_reply(text, self.inner.settings.max_reply_chars) {
            if let Err(e) = sink.send(&msg.channel_id, &chunk).await {
                warn!(channel = %msg.channel_id, "Reply failed: {}", e);
                return;
            }
        }
    }

    /// Handle a completion callback from a hook-driven tool
    pub async fn handle_hook(&self, cli_type: &str, raw: &[u8]) -> Result<HookOutcome> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let cli_type = cli_type.trim();
        if cli_type.is_empty() {
            return Err(BridgeError::Validation("missing cli_type".to_string()));
        }
        let adapter = self
            .inner
            .adapters
            .get(cli_type)
            .cloned()
            .ok_or_else(|| BridgeError::Validation(format!("unknown cli_type {:?}", cli_type)))?;

        let payload = adapter.handle_hook_data(raw)?;
        let registry = &self.inner.registry;
        let session = registry
            .find_by_work_dir(&payload.identifier)
            .await
            .ok_or_else(|| BridgeError::not_found("session for directory", &payload.identifier))?;
        let name = session.name.as_str();
        info!(session = %name, tool = %cli_type, "Hook received");

        if registry.binding(name).await.is_none() {
            registry.disarm(name).await;
            self.settle(name).await;
            info!(session = %name, "No channel bound, nothing to deliver");
            return Ok(HookOutcome::NoChannel);
        }

        match payload.reply {
            Some(reply) => {
                registry.disarm(name).await;
                self.settle(name).await;
                self.deliver(ReplyEvent::new(name, reply)).await;
                Ok(HookOutcome::Delivered)
            }
            None => {
                // Re-arming replaces the passive timer, so a newer message
                // still supersedes this capture
                let lease = registry.arm_watchdog(name).await?;
                let input = payload
                    .last_prompt
                    .or_else(|| self.inner.history.get_last(name).ok().map(|r| r.content));

                let engine = self.clone();
                let task_lease = lease.clone();
                self.spawn_guarded(lease, async move {
                    engine.capture_reply(task_lease, adapter, input).await;
                });
                Ok(HookOutcome::Capturing)
            }
        }
    }

    async fn capture_reply(
        &self,
        lease: WatchdogLease,
        adapter: Arc<dyn ToolAdapter>,
        input: Option<String>,
    ) {
        let session = lease.session();
        let snapshot = self.inner.registry.snapshot(session).await;
        let anchor = Anchor {
            snapshot: snapshot.as_deref(),
            input: input.as_deref(),
            prompt: Some(adapter.prompt()),
        };
        let result = self
            .inner
            .pipeline
            .retry_capture(
                self.inner.backend.as_ref(),
                session,
                anchor,
                adapter.matcher(),
                lease.token(),
            )
            .await;
        self.finish(&lease, result).await;
    }

    async fn run_command(&self, command: Command, msg: &ChatMessage) -> String {
        match command {
            Command::Help => HELP.to_string(),
            Command::Whoami => {
                let role = if self.is_admin(&msg.platform, &msg.user_id) {
                    "admin"
                } else {
                    "user"
                };
                format!(
                    "You are {} on {} (channel {}), {}",
                    msg.user_id, msg.platform, msg.channel_id, role
                )
            }
            Command::Sessions => self.describe_sessions().await,
            Command::Status => match self.active_session().await {
                Some(session) => self.describe_status(&session).await,
                None => NO_ACTIVE_SESSION.to_string(),
            },
            Command::View(lines) => match self.active_session().await {
                Some(session) => self.view(&session.name, lines).await,
                None => NO_ACTIVE_SESSION.to_string(),
            },
        }
    }

    async fn describe_sessions(&self) -> String {
        let sessions = self.inner.registry.list().await;
        if sessions.is_empty() {
            return "No sessions.".to_string();
        }
        let active = self.active_session().await.map(|s| s.name);
        let running: Option<HashSet<String>> = match self.inner.backend.list_sessions().await {
            Ok(names) => Some(names.into_iter().collect()),
            Err(e) => {
                debug!("Could not list terminal sessions: {}", e);
                None
            }
        };
        let mut out = String::from("Sessions:");
        for s in &sessions {
            let marker = if active.as_deref() == Some(s.name.as_str()) {
                "*"
            } else {
                " "
            };
            let stopped = running
                .as_ref()
                .is_some_and(|running| !running.contains(&s.name));
            out.push_str(&format!(
                "\n{} {} ({}, {}{})",
                marker,
                s.name,
                s.tool,
                s.state,
                if stopped { ", not running" } else { "" }
            ));
        }
        out
    }

    async fn describe_status(&self, session: &SessionInfo) -> String {
        let alive = match self.adapter(&session.tool) {
            Ok(adapter) => adapter.is_alive(&session.name).await,
            Err(_) => false,
        };
        let history = &self.inner.history;
        let last_input = if history.has_input(&session.name) {
            match history.get_all(&session.name) {
                Ok(records) if !records.is_empty() => {
                    let age = current_timestamp_ms().saturating_sub(records[0].timestamp) / 1000;
                    format!("{}s ago ({} kept)", age, records.len())
                }
                Ok(_) => "none".to_string(),
                Err(e) => format!("unreadable ({})", e),
            }
        } else {
            "none".to_string()
        };
        format!(
            "Session {}\nstate: {}\ntool: {}\nwork dir: {}\nalive: {}\nlast input: {}\nwatchdog: {}",
            session.name,
            session.state,
            session.tool,
            session.work_dir.display(),
            if alive { "yes" } else { "no" },
            last_input,
            if session.watchdog_armed { "armed" } else { "idle" },
        )
    }

    async fn view(&self, session: &str, lines: usize) -> String {
        match self.inner.backend.capture(session, lines).await {
            Ok(raw) => {
                let body = trim_blank_edges(&strip_escape_sequences(&raw));
                format!(
                    "Session {} (last {} lines):\n```\n{}\n```",
                    session,
                    lines,
                    body.replace("```", "'''")
                )
            }
            Err(e) => format!("Could not capture session {}: {}", session, e),
        }
    }
}

async fn ensure_started(adapter: &dyn ToolAdapter, name: &str, work_dir: &Path) -> Result<()> {
    if adapter.is_alive(name).await {
        debug!(session = %name, "Terminal session already running");
        return Ok(());
    }
    adapter.create_session(name, work_dir).await
}

fn contains_user(lists: &HashMap<String, HashSet<String>>, platform: &str, user_id: &str) -> bool {
    lists
        .get(platform)
        .is_some_and(|users| users.contains(user_id))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Split `text` into messages of at most `max_chars` characters, breaking
/// at line boundaries and hard-splitting lines that are too long
pub fn chunk_reply(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut len = 0;

    for line in text.split('\n') {
        let chars: Vec<char> = line.chars().collect();
        let pieces: Vec<String> = if chars.len() > max_chars {
            chars.chunks(max_chars).map(|c| c.iter().collect()).collect()
        } else {
            vec![line.to_string()]
        };

        for piece in pieces {
            let piece_len = piece.chars().count();
            let added = if lines.is_empty() { piece_len } else { piece_len + 1 };
            if !lines.is_empty() && len + added > max_chars {
                chunks.push(lines.join("\n"));
                lines.clear();
                len = piece_len;
            } else {
                len += added;
            }
            lines.push(piece);
        }
    }
    if !lines.is_empty() {
        chunks.push(lines.join("\n"));
    }
    chunks
}
