//! Output filters for captured terminal text.
//!
//! - Escape sequence stripping (total and idempotent)
//! - Prompt anchoring (`extract_after_prompt`)
//! - Pluggable "still working", interactive-prompt and status-line
//!   detection via [`ActivityMatcher`]
//! - Border and blank-line cleanup helpers used by the extractor

use crate::error::{BridgeError, Result};
use regex::Regex;
use std::sync::OnceLock;

static ESCAPE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn escape_pattern() -> &'static Regex {
    ESCAPE_PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"\x1b\[[0-?]*[ -/]*[@-~]",        // CSI
            r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?", // OSC
            r"|\x1b[PX^_][^\x1b]*(?:\x1b\\)?", // DCS / SOS / PM / APC
            r"|\x1b[()*+][0-9A-Za-z]",         // charset designation
            r"|\x1b[@-Z\\-_]",                 // two-byte Fe
            r"|\x1b[0-9=<>]",                  // private Fp (DECSC, DECKPAM, ...)
            r"|\x{9b}[0-?]*[ -/]*[@-~]",       // 8-bit CSI
        ))
        .unwrap()
    })
}

/// Remove ANSI/VT control sequences, leaving visible text only.
///
/// Any control character that survives sequence removal (lone ESC, BEL,
/// backspace, carriage return) is dropped too, except `\n` and `\t`, so the
/// output never contains a byte that could start a new sequence.
pub fn strip_escape_sequences(text: &str) -> String {
    let stripped = escape_pattern().replace_all(text, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Return the part of `text` after the last occurrence of `prompt`.
///
/// Returns all of `text` when `prompt` is empty or absent.
pub fn extract_after_prompt<'a>(text: &'a str, prompt: &str) -> &'a str {
    if prompt.is_empty() {
        return text;
    }
    match text.rfind(prompt) {
        Some(pos) => &text[pos + prompt.len()..],
        None => text,
    }
}

/// Pure UI decoration: box drawing, block elements and whitespace only
pub fn is_border_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed.chars().all(|c| {
            ('\u{2500}'..='\u{259F}').contains(&c) || c.is_whitespace()
        })
}

/// Collapse runs of blank lines to at most `max_run` consecutive blanks
pub fn collapse_blank_runs(text: &str, max_run: usize) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            run += 1;
            if run > max_run {
                continue;
            }
            out.push("");
        } else {
            run = 0;
            out.push(line);
        }
    }
    out.join("\n")
}

/// Drop leading and trailing blank lines and trailing whitespace per line
pub fn trim_blank_edges(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let start = lines.iter().position(|l| !l.is_empty());
    let end = lines.iter().rposition(|l| !l.is_empty());
    match (start, end) {
        (Some(s), Some(e)) => lines[s..=e].join("\n"),
        _ => String::new(),
    }
}

/// Tool-specific detection of in-progress output and transient UI lines.
///
/// Implementations only look at text; they never do I/O. New tool types
/// can supply their own matcher without touching the engine.
pub trait ActivityMatcher: Send + Sync {
    /// Whether the tail of `text` shows the tool is still producing output.
    ///
    /// Must err on the side of `true`: a false positive only costs a retry.
    fn is_still_working(&self, text: &str) -> bool;

    /// Whether the tail of `text` is a question the tool is blocked on,
    /// such as a confirmation or a numbered choice
    fn is_awaiting_input(&self, text: &str) -> bool;

    /// Whether a single line is a transient UI artifact
    fn is_status_line(&self, line: &str) -> bool;

    /// Remove transient UI lines and re-collapse blank runs
    fn strip_status_lines(&self, text: &str) -> String {
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| !self.is_status_line(line))
            .collect();
        trim_blank_edges(&collapse_blank_runs(&kept.join("\n"), 2))
    }
}

/// Spinner glyphs used by Claude Code style status bars
const SPINNER_GLYPHS: &str = "·✻✽✶✳✢";

/// Default "still working" indicators
const BUILTIN_THINKING: &[&str] = &[
    // "✻ Thinking… (esc to interrupt)", "✶ Galloping…"
    r"^\s*[·✻✽✶✳✢*]\s+\S.*…",
    r"(?i)esc to interrupt",
    r"(?i)\b(thinking|working|processing|generating)(…|\.\.\.)",
    // Braille spinners
    r"^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
];

/// Default interactive prompt indicators
const BUILTIN_PROMPTS: &[&str] = &[
    r"(?i)[(\[]y/n[)\]]",
    r"(?i)[(\[]yes/no[)\]]",
    r"(?i)do you want to (proceed|continue|make this edit|create|run)",
    r"(?i)press enter to (continue|confirm)",
    // "❯ 1. Yes" selection menus
    r"^\s*❯\s*\d+\.\s+\S",
];

/// Lines from the bottom inspected by `is_awaiting_input`
const PROMPT_WINDOW: usize = 6;

/// Default transient UI lines
const BUILTIN_STATUS: &[&str] = &[
    r"^\s*[·✻✽✶✳✢]\s+\S",
    r"^[·✻✽✶✳✢⠐⠂⠈⠁⠉⠃⠋⠓⠒⠖⠦⠤\s]+$",
    r"(?i)esc to interrupt",
    r"(?i)\?\s+for shortcuts",
    r"(?i)(shift\+tab|ctrl\+[a-z]) to ",
    r"(?i)(bypass permissions|accept edits|plan mode) on",
    r"^\s*⏵⏵",
    r"^\s*[❯>]\s*$",
    r"(?i)↓\s*[\d.]+k?\s+tokens",
    r"(?i)context left until auto-compact",
];

/// Regex-driven [`ActivityMatcher`] configured per tool type
pub struct PatternMatcher {
    /// Number of trailing non-empty lines inspected by `is_still_working`
    window: usize,
    thinking: Vec<Regex>,
    prompts: Vec<Regex>,
    status: Vec<Regex>,
}

impl PatternMatcher {
    pub fn new(
        window: usize,
        thinking: Vec<Regex>,
        prompts: Vec<Regex>,
        status: Vec<Regex>,
    ) -> Self {
        Self {
            window: window.max(1),
            thinking,
            prompts,
            status,
        }
    }

    /// Built-in patterns plus optional tool-specific extras
    pub fn with_extra(
        window: usize,
        thinking_patterns: &[String],
        prompt_patterns: &[String],
        status_patterns: &[String],
    ) -> Result<Self> {
        let thinking = compile_all(BUILTIN_THINKING.iter().copied(), thinking_patterns)?;
        let prompts = compile_all(BUILTIN_PROMPTS.iter().copied(), prompt_patterns)?;
        let status = compile_all(BUILTIN_STATUS.iter().copied(), status_patterns)?;
        Ok(Self::new(window, thinking, prompts, status))
    }

    #[cfg(test)]
    pub fn builtin(window: usize) -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
        };
        Self::new(
            window,
            compile(BUILTIN_THINKING),
            compile(BUILTIN_PROMPTS),
            compile(BUILTIN_STATUS),
        )
    }
}

fn compile_all<'a>(
    builtin: impl Iterator<Item = &'a str>,
    extra: &'a [String],
) -> Result<Vec<Regex>> {
    builtin
        .chain(extra.iter().map(String::as_str))
        .map(|p| {
            Regex::new(p)
                .map_err(|e| BridgeError::Validation(format!("bad pattern {:?}: {}", p, e)))
        })
        .collect()
}

impl ActivityMatcher for PatternMatcher {
    fn is_still_working(&self, text: &str) -> bool {
        text.lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .take(self.window)
            .any(|line| self.thinking.iter().any(|re| re.is_match(line)))
    }

    fn is_awaiting_input(&self, text: &str) -> bool {
        text.lines()
            .rev()
            .filter(|line| !line.trim().is_empty() && !is_border_line(line))
            .take(PROMPT_WINDOW)
            .any(|line| self.prompts.iter().any(|re| re.is_match(line)))
    }

    fn is_status_line(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed.chars().count() == 1 && SPINNER_GLYPHS.contains(trimmed) {
            return true;
        }
        self.status.iter().any(|re| re.is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_escape_sequences() {
        let text = "\x1b[32mgreen\x1b[0m \x1b]0;title\x07plain\x1b[?25l";
        assert_eq!(strip_escape_sequences(text), "green plain");
    }

    #[test]
    fn test_strip_escape_sequences_idempotent() {
        let samples = [
            "\x1b\x1b[A[A",
            "\x1b[",
            "a\x1b]8;;http://x\x1b\\link\x1b]8;;\x1b\\b",
            "\x1b(B\x1b7\x1b8text\r\nnext\x08",
            "\u{9b}31mred",
            "no escapes at all\n\twith tab",
        ];
        for sample in samples {
            let once = strip_escape_sequences(sample);
            assert_eq!(strip_escape_sequences(&once), once, "sample {:?}", sample);
            assert!(!once.contains('\x1b'));
            assert!(once.chars().all(|c| !c.is_control() || c == '\n' || c == '\t'));
        }
    }

    #[test]
    fn test_extract_after_prompt() {
        let text = "> first\nold answer\n> second\nnew answer";
        assert_eq!(extract_after_prompt(text, "second"), "\nnew answer");
        assert_eq!(extract_after_prompt(text, ""), text);
        assert_eq!(extract_after_prompt(text, "missing"), text);
    }

    #[test]
    fn test_border_lines() {
        assert!(is_border_line("────────────"));
        assert!(is_border_line("  ╭──────╮ "));
        assert!(!is_border_line("│ > hello │"));
        assert!(!is_border_line(""));
        assert!(!is_border_line("---"));
    }

    #[test]
    fn test_collapse_blank_runs() {
        assert_eq!(collapse_blank_runs("a\n\n\n\n\nb", 2), "a\n\n\nb");
        assert_eq!(collapse_blank_runs("a\n\nb", 2), "a\n\nb");
    }

    #[test]
    fn test_still_working_detection() {
        let matcher = PatternMatcher::builtin(5);
        assert!(matcher.is_still_working("answer so far\n✻ Thinking… (esc to interrupt)\n"));
        assert!(matcher.is_still_working("⠹ Working"));
        assert!(!matcher.is_still_working("Here is the result.\n\n> "));
    }

    #[test]
    fn test_still_working_only_checks_window() {
        let matcher = PatternMatcher::builtin(2);
        let text = "✻ Thinking… (esc to interrupt)\nline a\nline b\nline c";
        assert!(!matcher.is_still_working(text));
    }

    #[test]
    fn test_strip_status_lines() {
        let matcher = PatternMatcher::builtin(5);
        let text = "Result line\n\n✢ Undulating… (3m 2s · ↓ 2.8k tokens)\n? for shortcuts\n❯ \n";
        assert_eq!(matcher.strip_status_lines(text), "Result line");
    }

    #[test]
    fn test_extra_patterns() {
        let matcher =
            PatternMatcher::with_extra(5, &["^Crunching".to_string()], &[], &[]).unwrap();
        assert!(matcher.is_still_working("Crunching numbers"));
        assert!(PatternMatcher::with_extra(5, &["(".to_string()], &[], &[]).is_err());

        let matcher =
            PatternMatcher::with_extra(5, &[], &["^Overwrite\\?".to_string()], &[]).unwrap();
        assert!(matcher.is_awaiting_input("file.txt exists\nOverwrite?"));
    }

    #[test]
    fn test_awaiting_input_detection() {
        let matcher = PatternMatcher::builtin(5);
        assert!(matcher.is_awaiting_input("Delete 3 files? (y/n)"));
        assert!(matcher.is_awaiting_input(
            "Edit src/main.rs\n────────\nDo you want to make this edit?\n❯ 1. Yes\n  2. No\n"
        ));
        assert!(!matcher.is_awaiting_input("All tests pass.\n\n> "));
        // Only the bottom of the pane counts
        let old = format!("Continue? (y/n)\ny\n{}", "done\n".repeat(10));
        assert!(!matcher.is_awaiting_input(&old));
    }
}
