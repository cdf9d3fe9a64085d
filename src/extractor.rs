//! Incremental extractor - computes the newly appended part of a pane.
//!
//! Given two captures of the same evolving terminal buffer, returns the
//! text that appeared in `after` but not in `before`, with borders, blank
//! runs and transient status lines removed. Pure: no I/O, no state.

use crate::filter::{collapse_blank_runs, is_border_line, trim_blank_edges, ActivityMatcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Tuning for the incremental extractor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Trailing lines of `after` examined by the primary strategy.
    /// Keep this below the capture window so the two captures overlap.
    pub tail_lines: usize,
    /// Fraction of `after` that must be passed before a changed line is
    /// trusted as the start of new output (fallback strategy)
    pub boundary_ratio: f64,
    /// Share of trailing lines returned when no boundary is found
    pub fallback_fraction: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            tail_lines: 150,
            boundary_ratio: 0.5,
            fallback_fraction: 0.2,
        }
    }
}

pub struct IncrementalExtractor {
    config: ExtractorConfig,
    matcher: Arc<dyn ActivityMatcher>,
}

impl IncrementalExtractor {
    pub fn new(config: ExtractorConfig, matcher: Arc<dyn ActivityMatcher>) -> Self {
        Self { config, matcher }
    }

    /// Text present in `after` that was not already in `before`
    pub fn extract_increment(&self, after: &str, before: &str) -> String {
        let known: HashSet<&str> = before
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let lines: Vec<&str> = after.lines().collect();

        if !lines.iter().any(|l| self.is_new_line(l, &known)) {
            return String::new();
        }

        let primary = self.cleanup(&self.tail_diff(&lines, &known));
        if !primary.is_empty() {
            return primary;
        }

        debug!(
            "Tail diff empty, falling back to boundary scan over {} lines",
            lines.len()
        );
        self.cleanup(&self.boundary_diff(&lines, &known))
    }

    /// A line carrying content that `before` did not have
    fn is_new_line(&self, line: &str, known: &HashSet<&str>) -> bool {
        let trimmed = line.trim();
        !trimmed.is_empty()
            && !known.contains(trimmed)
            && !is_border_line(trimmed)
            && !self.matcher.is_status_line(line)
    }

    /// Strategy 1: last K lines minus everything already seen
    fn tail_diff(&self, lines: &[&str], known: &HashSet<&str>) -> String {
        let start = lines.len().saturating_sub(self.config.tail_lines);
        lines[start..]
            .iter()
            .filter(|l| {
                let trimmed = l.trim();
                trimmed.is_empty() || !known.contains(trimmed)
            })
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Strategy 2: first changed line past the boundary, else the last slice
    fn boundary_diff(&self, lines: &[&str], known: &HashSet<&str>) -> String {
        let boundary = (lines.len() as f64 * self.config.boundary_ratio).floor() as usize;
        let start = lines
            .iter()
            .enumerate()
            .skip(boundary)
            .find(|(_, l)| self.is_new_line(l, known))
            .map(|(i, _)| i)
            .unwrap_or_else(|| {
                let keep = (lines.len() as f64 * self.config.fallback_fraction).ceil() as usize;
                lines.len().saturating_sub(keep.max(1))
            });
        lines[start..].join("\n")
    }

    fn cleanup(&self, text: &str) -> String {
        let kept: Vec<&str> = text.lines().filter(|l| !is_border_line(l)).collect();
        let collapsed = trim_blank_edges(&collapse_blank_runs(&kept.join("\n"), 2));
        self.matcher.strip_status_lines(&collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PatternMatcher;

    fn extractor(config: ExtractorConfig) -> IncrementalExtractor {
        IncrementalExtractor::new(config, Arc::new(PatternMatcher::builtin(5)))
    }

    #[test]
    fn test_no_change_yields_nothing() {
        let ex = extractor(ExtractorConfig::default());
        let pane = "$ claude\n╭────╮\n│ hi │\n╰────╯\nHello! How can I help?\n\n> ";
        assert_eq!(ex.extract_increment(pane, pane), "");
    }

    #[test]
    fn test_identical_chrome_only_pane_yields_nothing() {
        let ex = extractor(ExtractorConfig::default());
        let pane = "╭──────╮\n╰──────╯\n────────\n? for shortcuts\n❯ \n✻ Thinking… (esc to interrupt)";
        assert_eq!(ex.extract_increment(pane, pane), "");
    }

    #[test]
    fn test_identical_pane_with_repeated_lines_yields_nothing() {
        let ex = extractor(ExtractorConfig {
            tail_lines: 4,
            ..ExtractorConfig::default()
        });
        let pane = "ok\nok\n\nok\n> run\nok\nok\ndone\ndone\n> ";
        assert_eq!(ex.extract_increment(pane, pane), "");
    }

    #[test]
    fn test_appended_lines() {
        let ex = extractor(ExtractorConfig::default());
        let before = "line1\nline2\nline3";
        let after = format!("{}\nline4\nline5", before);
        assert_eq!(ex.extract_increment(&after, before), "line4\nline5");
    }

    #[test]
    fn test_cleanup_removes_ui_chrome() {
        let ex = extractor(ExtractorConfig::default());
        let before = "> what is 2+2";
        let after = "> what is 2+2\n\n● The answer is 4.\n\n\n\n\nAnything else?\n────────\n❯ \n? for shortcuts";
        assert_eq!(
            ex.extract_increment(after, before),
            "● The answer is 4.\n\n\nAnything else?"
        );
    }

    #[test]
    fn test_boundary_fallback_after_midpoint() {
        let ex = extractor(ExtractorConfig {
            tail_lines: 3,
            ..ExtractorConfig::default()
        });
        let before = (0..10).map(|i| format!("old{}", i)).collect::<Vec<_>>().join("\n");
        let after = "old0\nold1\nold2\nold3\nold4\nold5\nNEW\nold7\nold8\nold9";
        assert_eq!(
            ex.extract_increment(after, &before),
            "NEW\nold7\nold8\nold9"
        );
    }

    #[test]
    fn test_boundary_fallback_takes_last_fifth() {
        let ex = extractor(ExtractorConfig {
            tail_lines: 3,
            ..ExtractorConfig::default()
        });
        let before = (0..10).map(|i| format!("old{}", i)).collect::<Vec<_>>().join("\n");
        let after = "old0\nEARLY\nold2\nold3\nold4\nold5\nold6\nold7\nold8\nold9";
        assert_eq!(ex.extract_increment(after, &before), "old8\nold9");
    }

    #[test]
    fn test_pure_and_repeatable() {
        let ex = extractor(ExtractorConfig::default());
        let before = "a\nb";
        let after = "a\nb\nc";
        let first = ex.extract_increment(after, before);
        assert_eq!(first, ex.extract_increment(after, before));
        assert_eq!(first, "c");
    }
}
