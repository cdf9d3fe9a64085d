//! Completion watchdog.
//!
//! Two strategies decide when a tool has finished answering. Hook-driven
//! tools call back over HTTP, so their watchdog is only a timer (see the
//! engine). Polling tools are watched by [`wait_for_stable`], which
//! captures the pane until it stops changing.
//!
//! Both strategies can fall back to [`CapturePipeline::retry_capture`],
//! which keeps capturing until the extracted reply no longer looks like
//! the tool is still thinking.

use crate::error::{BridgeError, Result};
use crate::extractor::{ExtractorConfig, IncrementalExtractor};
use crate::filter::{
    collapse_blank_runs, extract_after_prompt, is_border_line, strip_escape_sequences,
    trim_blank_edges, ActivityMatcher,
};
use crate::terminal::TerminalBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sleep for `duration` unless `token` fires first.
///
/// Returns `true` when the full duration elapsed.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Tuning for the poll-until-stable strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Consecutive identical captures required
    pub stable_count: u32,
    pub timeout: Duration,
    pub capture_lines: usize,
}

/// Counts consecutive byte-identical captures
#[derive(Debug)]
pub struct StabilityTracker {
    needed: u32,
    run: u32,
    last: Option<String>,
}

impl StabilityTracker {
    pub fn new(needed: u32) -> Self {
        Self {
            needed: needed.max(1),
            run: 0,
            last: None,
        }
    }

    /// Feed one capture; returns `true` once the last `needed` captures
    /// were identical
    pub fn observe(&mut self, capture: &str) -> bool {
        if self.last.as_deref() == Some(capture) {
            self.run += 1;
        } else {
            self.run = 1;
            self.last = Some(capture.to_string());
        }
        self.run >= self.needed
    }

    pub fn run(&self) -> u32 {
        self.run
    }
}

/// Capture `session` every `interval` until the pane is stable.
///
/// Returns the stable capture, [`BridgeError::Timeout`] once the overall
/// timeout passes, or [`BridgeError::Cancelled`] as soon as `token` fires.
pub async fn wait_for_stable(
    backend: &dyn TerminalBackend,
    session: &str,
    settings: &PollSettings,
    token: &CancellationToken,
) -> Result<String> {
    let deadline = Instant::now() + settings.timeout;
    let mut tracker = StabilityTracker::new(settings.stable_count);

    loop {
        if token.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let capture = backend.capture(session, settings.capture_lines).await?;
        if tracker.observe(&capture) {
            debug!(session = %session, run = tracker.run(), "Pane stable");
            return Ok(capture);
        }

        if Instant::now() >= deadline {
            return Err(BridgeError::Timeout {
                after: settings.timeout,
            });
        }
        if !sleep_or_cancel(settings.interval, token).await {
            return Err(BridgeError::Cancelled);
        }
    }
}

/// Tuning for the retry-capture procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Lines requested per capture
    pub lines: usize,
    /// Wait before the first attempt so the UI can finish rendering
    pub initial_delay_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            lines: 200,
            initial_delay_ms: 1500,
            max_attempts: 5,
            retry_delay_ms: 1000,
        }
    }
}

/// Reply text pulled out of one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    /// The capture still shows the tool working
    pub thinking: bool,
    /// The tool stopped on a question and needs the user's answer
    pub awaiting_input: bool,
}

/// Where to look for the reply inside a capture
#[derive(Debug, Clone, Copy, Default)]
pub struct Anchor<'a> {
    /// Pane capture taken just before the turn was dispatched
    pub snapshot: Option<&'a str>,
    /// The input the reply answers
    pub input: Option<&'a str>,
    /// The tool's prompt marker
    pub prompt: Option<&'a str>,
}

/// Capture, filter and extract pipeline shared by both strategies
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    capture: CaptureConfig,
    extract: ExtractorConfig,
}

impl CapturePipeline {
    pub fn new(capture: CaptureConfig, extract: ExtractorConfig) -> Self {
        Self { capture, extract }
    }

    pub fn capture_lines(&self) -> usize {
        self.capture.lines
    }

    /// Turn a raw capture into reply text
    pub fn extract(
        &self,
        raw: &str,
        anchor: Anchor<'_>,
        matcher: Arc<dyn ActivityMatcher>,
    ) -> Extraction {
        let clean = strip_escape_sequences(raw);
        // Judge on the whole pane tail; the reply alone may have lost the spinner
        let thinking = matcher.is_still_working(&clean);
        let awaiting_input = !thinking && matcher.is_awaiting_input(&clean);

        let text = match anchor.snapshot {
            Some(snapshot) => {
                let before = strip_escape_sequences(snapshot);
                let increment = IncrementalExtractor::new(self.extract, Arc::clone(&matcher))
                    .extract_increment(&clean, &before);
                match anchor.input {
                    Some(input) => drop_echo(&increment, input),
                    None => increment,
                }
            }
            None => {
                let after = after_anchor(&clean, anchor);
                let kept: Vec<&str> = after.lines().filter(|l| !is_border_line(l)).collect();
                let collapsed = trim_blank_edges(&collapse_blank_runs(&kept.join("\n"), 2));
                matcher.strip_status_lines(&collapsed)
            }
        };

        Extraction {
            text,
            thinking,
            awaiting_input,
        }
    }

    /// Capture until a finished reply shows up or attempts run out.
    ///
    /// An attempt that still looks like thinking is kept as a last-resort
    /// candidate. Exhausting every attempt is not an error: the candidate,
    /// or empty text, is returned.
    pub async fn retry_capture(
        &self,
        backend: &dyn TerminalBackend,
        session: &str,
        anchor: Anchor<'_>,
        matcher: Arc<dyn ActivityMatcher>,
        token: &CancellationToken,
    ) -> Result<Extraction> {
        let initial = Duration::from_millis(self.capture.initial_delay_ms);
        if !sleep_or_cancel(initial, token).await {
            return Err(BridgeError::Cancelled);
        }

        let attempts = self.capture.max_attempts.max(1);
        let retry_delay = Duration::from_millis(self.capture.retry_delay_ms);
        let mut candidate: Option<String> = None;
        let mut last_error = None;
        let mut captured = false;

        for attempt in 1..=attempts {
            match backend.capture(session, self.capture.lines).await {
                Ok(raw) => {
                    captured = true;
                    let extraction = self.extract(&raw, anchor, Arc::clone(&matcher));
                    if extraction.thinking {
                        debug!(session = %session, attempt, "Tool still working, retrying");
                        if !extraction.text.is_empty() {
                            candidate = Some(extraction.text);
                        }
                    } else if !extraction.text.is_empty() {
                        debug!(
                            session = %session,
                            attempt,
                            awaiting_input = extraction.awaiting_input,
                            "Captured reply"
                        );
                        return Ok(extraction);
                    }
                }
                Err(e) => {
                    warn!(session = %session, attempt, "Capture failed: {}", e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts && !sleep_or_cancel(retry_delay, token).await {
                return Err(BridgeError::Cancelled);
            }
        }

        if !captured {
            return Err(last_error
                .unwrap_or_else(|| BridgeError::Backend("no capture attempted".to_string())));
        }
        warn!(
            session = %session,
            has_candidate = candidate.is_some(),
            "{}",
            BridgeError::ExhaustedRetries
        );
        Ok(Extraction {
            text: candidate.unwrap_or_default(),
            thinking: false,
            awaiting_input: false,
        })
    }
}

/// Text after the input line, or after the prompt marker
fn after_anchor<'a>(clean: &'a str, anchor: Anchor<'_>) -> &'a str {
    if let Some(input) = anchor.input.map(str::trim).filter(|s| !s.is_empty()) {
        if clean.contains(input) {
            return extract_after_prompt(clean, input);
        }
        // Long inputs wrap; the first line is the part most likely intact
        if let Some(first) = input.lines().map(str::trim).find(|l| !l.is_empty()) {
            if clean.contains(first) {
                return extract_after_prompt(clean, first);
            }
        }
    }
    extract_after_prompt(clean, anchor.prompt.unwrap_or_default())
}

/// Drop the echoed input line leading an increment
fn drop_echo(increment: &str, input: &str) -> String {
    let Some(first_input) = input.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return increment.to_string();
    };
    let mut lines = increment.lines().peekable();
    while lines.peek().is_some_and(|l| l.trim().is_empty()) {
        lines.next();
    }
    match lines.peek() {
        Some(line) if line.contains(first_input) => {
            lines.next();
            trim_blank_edges(&lines.collect::<Vec<_>>().join("\n"))
        }
        _ => increment.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PatternMatcher;
    use crate::test_support::ScriptedBackend;

    fn settings(stable_count: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(100),
            stable_count,
            timeout: Duration::from_secs(10),
            capture_lines: 50,
        }
    }

    fn matcher() -> Arc<dyn ActivityMatcher> {
        Arc::new(PatternMatcher::builtin(5))
    }

    fn pipeline(max_attempts: u32) -> CapturePipeline {
        CapturePipeline::new(
            CaptureConfig {
                lines: 100,
                initial_delay_ms: 500,
                max_attempts,
                retry_delay_ms: 200,
            },
            ExtractorConfig::default(),
        )
    }

    #[test]
    fn test_tracker_resets_on_change() {
        let mut tracker = StabilityTracker::new(3);
        assert!(!tracker.observe("Done."));
        assert!(!tracker.observe("Done."));
        // A differing capture starts a new run
        assert!(!tracker.observe("Done!"));
        assert_eq!(tracker.run(), 1);
        assert!(!tracker.observe("Done!"));
        assert!(tracker.observe("Done!"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_identical_captures_are_stable() {
        let backend = ScriptedBackend::new();
        backend.push_screen("Working");
        backend.push_screen("Done.");
        backend.push_screen("Done.");
        backend.push_screen("Done.");
        backend.push_screen("changed later");

        let token = CancellationToken::new();
        let out = wait_for_stable(&backend, "alpha", &settings(3), &token)
            .await
            .unwrap();
        assert_eq!(out, "Done.");
        assert_eq!(backend.capture_count(), 4);
        assert_eq!(backend.last_capture_lines(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let backend = ScriptedBackend::new();
        for i in 0..1000 {
            backend.push_screen(&format!("frame {}", i));
        }
        let mut s = settings(3);
        s.timeout = Duration::from_secs(1);

        let token = CancellationToken::new();
        let err = wait_for_stable(&backend, "alpha", &s, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_capture_error_propagates() {
        let backend = ScriptedBackend::new();
        backend.push_error("no such session");
        let token = CancellationToken::new();
        assert!(matches!(
            wait_for_stable(&backend, "alpha", &settings(3), &token).await,
            Err(BridgeError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep_promptly() {
        let backend = Arc::new(ScriptedBackend::new());
        for i in 0..10 {
            backend.push_screen(&format!("frame {}", i));
        }
        let token = CancellationToken::new();
        let mut s = settings(3);
        s.interval = Duration::from_secs(3600);

        let task = {
            let backend = Arc::clone(&backend);
            let token = token.clone();
            tokio::spawn(async move { wait_for_stable(backend.as_ref(), "alpha", &s, &token).await })
        };
        tokio::task::yield_now().await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel should end the wait promptly")
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_extract_with_snapshot_drops_echo() {
        let before = "Welcome\n> ";
        let after = "Welcome\n> fix the tests\nAll tests pass now.\n\n> ";
        let out = pipeline(1).extract(
            after,
            Anchor {
                snapshot: Some(before),
                input: Some("fix the tests"),
                prompt: None,
            },
            matcher(),
        );
        assert_eq!(out.text, "All tests pass now.");
        assert!(!out.thinking);
    }

    #[test]
    fn test_extract_without_snapshot_uses_input() {
        let pane = "old reply\n> earlier\nold\n> fix it\n\x1b[1mFixed.\x1b[0m\n? for shortcuts";
        let out = pipeline(1).extract(
            pane,
            Anchor {
                snapshot: None,
                input: Some("fix it"),
                prompt: Some("> "),
            },
            matcher(),
        );
        assert_eq!(out.text, "Fixed.");

        // Unknown input falls back to the prompt marker
        let out = pipeline(1).extract(
            "noise\n> \nAnswer",
            Anchor {
                snapshot: None,
                input: Some("never typed"),
                prompt: Some("> "),
            },
            matcher(),
        );
        assert_eq!(out.text, "Answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_out_thinking() {
        let backend = ScriptedBackend::new();
        backend.push_screen("> hi\n✻ Thinking… (esc to interrupt)");
        backend.push_screen("> hi\nHello there.");

        let token = CancellationToken::new();
        let anchor = Anchor {
            snapshot: Some("> "),
            input: Some("hi"),
            prompt: None,
        };
        let out = pipeline(5)
            .retry_capture(&backend, "alpha", anchor, matcher(), &token)
            .await
            .unwrap();
        assert_eq!(out.text, "Hello there.");
        assert!(!out.awaiting_input);
        assert_eq!(backend.capture_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_candidate() {
        let backend = ScriptedBackend::new();
        backend.set_screen("> hi\npartial answer\nGenerating…");

        let token = CancellationToken::new();
        let anchor = Anchor {
            snapshot: Some("> "),
            input: Some("hi"),
            prompt: None,
        };
        let out = pipeline(3)
            .retry_capture(&backend, "alpha", anchor, matcher(), &token)
            .await
            .unwrap();
        assert!(out.text.contains("partial answer"));
        assert_eq!(backend.capture_count(), 3);
    }

    #[test]
    fn test_extract_flags_interactive_prompt() {
        let before = "Welcome\n> ";
        let after = "Welcome\n> clean up\nRemove build/ and dist/? (y/n)";
        let out = pipeline(1).extract(
            after,
            Anchor {
                snapshot: Some(before),
                input: Some("clean up"),
                prompt: None,
            },
            matcher(),
        );
        assert!(out.awaiting_input);
        assert!(!out.thinking);
        assert!(out.text.contains("(y/n)"));

        let busy = "Welcome\n> clean up\nContinue? (y/n)\n✻ Thinking… (esc to interrupt)";
        let out = pipeline(1).extract(busy, Anchor::default(), matcher());
        assert!(out.thinking);
        assert!(!out.awaiting_input);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_all_captures_failed() {
        let backend = ScriptedBackend::new();
        backend.push_error("gone");
        backend.push_error("gone");

        let token = CancellationToken::new();
        let result = pipeline(2)
            .retry_capture(&backend, "alpha", Anchor::default(), matcher(), &token)
            .await;
        assert!(matches!(result, Err(BridgeError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_during_initial_delay() {
        let backend = ScriptedBackend::new();
        let token = CancellationToken::new();
        token.cancel();
        let result = pipeline(2)
            .retry_capture(&backend, "alpha", Anchor::default(), matcher(), &token)
            .await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert_eq!(backend.capture_count(), 0);
    }
}
