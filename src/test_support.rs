//! In-memory collaborators for unit tests.

use crate::engine::ChatSink;
use crate::error::{BridgeError, Result};
use crate::protocol::ControlKey;
use crate::terminal::TerminalBackend;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        session: String,
        text: String,
        submitted: bool,
    },
    Key {
        session: String,
        key: ControlKey,
    },
}

/// Terminal backend replaying queued screens.
///
/// Each capture pops the next queued screen; once the queue is empty the
/// most recent screen is returned again.
#[derive(Default)]
pub struct ScriptedBackend {
    screens: Mutex<VecDeque<std::result::Result<String, String>>>,
    current: Mutex<String>,
    sent: Mutex<Vec<Sent>>,
    alive: Mutex<HashSet<String>>,
    fail_sends: AtomicBool,
    send_delay_ms: AtomicU64,
    captures: AtomicUsize,
    last_capture_lines: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_screen(&self, text: &str) {
        self.screens.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn push_error(&self, message: &str) {
        self.screens
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    /// Replace the screen and drop anything queued
    pub fn set_screen(&self, text: &str) {
        self.screens.lock().unwrap().clear();
        *self.current.lock().unwrap() = text.to_string();
    }

    pub fn set_alive(&self, session: &str) {
        self.alive.lock().unwrap().insert(session.to_string());
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every typed text take `delay`, like a real terminal round trip
    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn last_capture_lines(&self) -> usize {
        self.last_capture_lines.load(Ordering::SeqCst)
    }

    fn check_send(&self) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BridgeError::Backend("pane is gone".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TerminalBackend for ScriptedBackend {
    async fn capture(&self, _session: &str, lines: usize) -> Result<String> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.last_capture_lines.store(lines, Ordering::SeqCst);
        let next = self.screens.lock().unwrap().pop_front();
        let screen = match next {
            Some(Ok(text)) => {
                *self.current.lock().unwrap() = text.clone();
                text
            }
            Some(Err(message)) => return Err(BridgeError::Backend(message)),
            None => self.current.lock().unwrap().clone(),
        };
        let all: Vec<&str> = screen.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }

    async fn send_keys(
        &self,
        session: &str,
        text: &str,
        submit_after: Option<Duration>,
    ) -> Result<()> {
        self.check_send()?;
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.sent.lock().unwrap().push(Sent::Text {
            session: session.to_string(),
            text: text.to_string(),
            submitted: submit_after.is_some(),
        });
        Ok(())
    }

    async fn send_key(&self, session: &str, key: ControlKey) -> Result<()> {
        self.check_send()?;
        self.sent.lock().unwrap().push(Sent::Key {
            session: session.to_string(),
            key,
        });
        Ok(())
    }

    async fn is_alive(&self, session: &str) -> bool {
        self.alive.lock().unwrap().contains(session)
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.alive.lock().unwrap().iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_session(
        &self,
        session: &str,
        _command: &[String],
        _work_dir: &Path,
    ) -> Result<()> {
        self.set_alive(session);
        Ok(())
    }
}

/// Chat sink that keeps everything it is asked to send
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(String, String)>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// (channel id, text) pairs in send order
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().into_iter().map(|(_, text)| text).collect()
    }

    /// Wait until at least `count` messages were sent
    pub async fn wait_for(&self, count: usize) -> Vec<(String, String)> {
        loop {
            let notified = self.notify.notified();
            if self.messages.lock().unwrap().len() >= count {
                return self.messages();
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ChatSink for RecordingSink {
    async fn send(&self, channel_id: &str, text: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        self.notify.notify_waiters();
        Ok(())
    }
}
