//! Final-answer validation for candidate reasoner replies.
//!
//! Before the orchestrator accepts a text-only reply as the final answer it
//! runs the text through a [`ResponseValidator`]. A rejection produces an
//! [`AnswerDefect`] whose display text is sent back to the reasoner as a
//! correction-request turn, so every variant message is phrased as an
//! actionable instruction.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

lazy_static! {
    /// Unresolved template placeholders: `{{city}}`, `<answer here>`, `<insert value>`.
    static ref PLACEHOLDER_PATTERN: Regex = Regex::new(
        r"(?i)\{\{[^}]*\}\}|<(answer|insert|placeholder)[^>]*>"
    ).unwrap();

    /// Raw tool-call JSON leaking into prose.
    static ref TOOL_JSON_PATTERN: Regex = Regex::new(
        r#""(tool_calls?|tool_use|arguments)"\s*:"#
    ).unwrap();

    /// Leftover work markers.
    static ref WORK_MARKER_PATTERN: Regex = Regex::new(
        r"\b(TODO|FIXME)\b"
    ).unwrap();
}

/// Why a candidate answer was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnswerDefect {
    #[error("the answer is empty; provide the full answer text")]
    Empty,

    #[error("the answer is too short ({len} chars, minimum {min}); expand it")]
    TooShort { len: usize, min: usize },

    #[error("the answer is too long ({len} chars, maximum {max}); tighten it")]
    TooLong { len: usize, max: usize },

    #[error("the answer contains an unresolved placeholder near {snippet:?}; fill it in")]
    Placeholder { snippet: String },

    #[error("the answer leaks raw tool-call JSON near {snippet:?}; describe results in prose")]
    ToolJson { snippet: String },

    #[error("the answer contains an unfinished work marker near {snippet:?}; finish the thought")]
    WorkMarker { snippet: String },

    #[error("the answer has an unterminated code fence; close or remove it")]
    UnterminatedFence,
}

/// Checks a candidate final answer against format rules.
///
/// Implementations must be deterministic: the orchestrator may re-check the
/// same text when deciding whether to spend a correction turn.
pub trait ResponseValidator: Send + Sync {
    fn check(&self, answer: &str) -> Result<(), AnswerDefect>;
}

/// Default deterministic validator applied when the embedder supplies none.
#[derive(Debug, Clone)]
pub struct FormatValidator {
    min_chars: usize,
    max_chars: usize,
}

impl FormatValidator {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            min_chars,
            max_chars,
        }
    }

    fn inspect(&self, answer: &str) -> Result<(), AnswerDefect> {
        let trimmed = answer.trim();
        if trimmed.is_empty() {
            return Err(AnswerDefect::Empty);
        }
        let len = trimmed.chars().count();
        if len < self.min_chars {
            return Err(AnswerDefect::TooShort {
                len,
                min: self.min_chars,
            });
        }
        if len > self.max_chars {
            return Err(AnswerDefect::TooLong {
                len,
                max: self.max_chars,
            });
        }
        if let Some(m) = PLACEHOLDER_PATTERN.find(trimmed) {
            return Err(AnswerDefect::Placeholder {
                snippet: snippet(m.as_str()),
            });
        }
        if let Some(m) = TOOL_JSON_PATTERN.find(trimmed) {
            return Err(AnswerDefect::ToolJson {
                snippet: snippet(m.as_str()),
            });
        }
        if let Some(m) = WORK_MARKER_PATTERN.find(trimmed) {
            return Err(AnswerDefect::WorkMarker {
                snippet: snippet(m.as_str()),
            });
        }
        if trimmed.matches("```").count() % 2 != 0 {
            return Err(AnswerDefect::UnterminatedFence);
        }
        Ok(())
    }
}

impl Default for FormatValidator {
    fn default() -> Self {
        Self {
            min_chars: 1,
            max_chars: 8_000,
        }
    }
}

impl ResponseValidator for FormatValidator {
    fn check(&self, answer: &str) -> Result<(), AnswerDefect> {
        let verdict = self.inspect(answer);
        if let Err(defect) = &verdict {
            debug!(defect = %defect, "candidate answer rejected");
        }
        verdict
    }
}

/// Truncate matched text for defect messages.
fn snippet(matched: &str) -> String {
    const LIMIT: usize = 40;
    if matched.chars().count() <= LIMIT {
        matched.to_string()
    } else {
        let head: String = matched.chars().take(LIMIT).collect();
        format!("{head}…")
    }
}
