//! 🛡️ INPUT VALIDATION: the last line of defense before agent-submitted or
//! operator-submitted text is persisted or echoed back over the wire.
//! DECISION ARCHAEOLOGY: every rule below carries the reasoning for its
//! specific shape, not just the rule itself.
//! AUDIT CHECKPOINT: these patterns are what stands between a task
//! description and shell/HTML injection — treat changes here as security
//! changes, not style changes.
//!
//! Adapted from the teacher's `TaskContentValidator`: an allowlist regex for
//! the whole field, a blocklist of dangerous substrings, and HTML-escaping
//! as the final sanitization step.

use crate::error::{HubError, Result};
use regex::Regex;
use std::collections::HashSet;

/// 📏 MAX DESCRIPTION LENGTH: DoS protection via size limits on task bodies.
/// Why: 8KB covers a fully detailed task description — multi-paragraph
/// requirements, a short code snippet, a stack trace — without letting a
/// single submission become a memory/storage cost.
/// Alternative: 64KB (rejected: no coding-agent task needs this much free
/// text, and it bloats the durable history entries built from it).
pub const MAX_DESCRIPTION_LENGTH: usize = 8_000;

/// ✂️ MAX FREE TEXT LENGTH: bound on the smaller free-text fields the
/// protocol carries (progress snippets, failure reasons).
/// Why: 2KB is generous for a status update but rejects an agent trying to
/// smuggle a large payload through a field meant for a one-line summary.
pub const MAX_FREE_TEXT_LENGTH: usize = 2_000;

/// 🔤 SAFE CONTENT REGEX: allowlist, not blocklist, for validated text.
/// DECISION: allowlisting is strictly more secure than blocklisting here —
/// a blocklist can only ever cover attacks someone already thought of.
/// Why: this charset covers everything a task description or protocol
/// free-text field legitimately needs (prose, punctuation, common code
/// symbols) while excluding control characters and unicode confusables.
static SAFE_CONTENT_REGEX: &str = r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

/// 🚨 DANGEROUS PATTERNS: known attack shapes, checked as a second layer on
/// top of the allowlist (defense in depth, not a substitute for it).
/// Why: `<script`/`javascript:`/`data:text/html` guard against a
/// description being rendered unsanitized by some future dashboard;
/// `&&`/`||`/`;rm`/backtick/`$(` guard against the content ever reaching a
/// shell (e.g. a misconfigured agent that shells out with the description
/// as an argument); the path patterns guard against traversal if a field
/// is ever used to derive a filesystem path.
static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "&&",
    "||",
    ";rm",
    "`rm",
    "$(rm",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
];

#[derive(Debug, Clone)]
pub struct ContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl ContentValidator {
    pub fn new() -> Result<Self> {
        let safe_content_regex = Regex::new(SAFE_CONTENT_REGEX)
            .map_err(|e| HubError::Configuration(format!("invalid validation regex: {e}")))?;
        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();
        Ok(ContentValidator {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    pub fn validate_description(&self, content: &str) -> Result<String> {
        self.validate(content, MAX_DESCRIPTION_LENGTH)
    }

    pub fn validate_free_text(&self, content: &str) -> Result<String> {
        self.validate(content, MAX_FREE_TEXT_LENGTH)
    }

    fn validate(&self, content: &str, max_len: usize) -> Result<String> {
        if content.trim().is_empty() {
            return Err(HubError::Validation("field must not be empty".into()));
        }
        if content.len() > max_len {
            return Err(HubError::Validation(format!(
                "field exceeds maximum length of {max_len} characters"
            )));
        }
        if !self.safe_content_regex.is_match(content) {
            return Err(HubError::Validation("field contains disallowed characters".into()));
        }
        let lowered = content.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lowered.contains(pattern.as_str()) {
                return Err(HubError::Validation(format!("field matched disallowed pattern {pattern:?}")));
            }
        }
        Ok(html_escape::encode_text(content).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ContentValidator {
        ContentValidator::new().unwrap()
    }

    #[test]
    fn plain_description_passes_through() {
        let result = validator().validate_description("fix the login bug").unwrap();
        assert_eq!(result, "fix the login bug");
    }

    #[test]
    fn empty_description_rejected() {
        assert!(validator().validate_description("   ").is_err());
    }

    #[test]
    fn script_tag_rejected() {
        assert!(validator().validate_description("<script>alert(1)</script>").is_err());
    }

    #[test]
    fn command_substitution_rejected() {
        assert!(validator().validate_description("run $(rm -rf /)").is_err());
    }

    #[test]
    fn path_traversal_rejected() {
        assert!(validator().validate_free_text("../../etc/shadow").is_err());
    }

    #[test]
    fn html_is_escaped() {
        let result = validator().validate_free_text("a & b < c").unwrap();
        assert!(result.contains("&amp;"));
    }

    #[test]
    fn oversized_input_rejected() {
        let huge = "a".repeat(MAX_FREE_TEXT_LENGTH + 1);
        assert!(validator().validate_free_text(&huge).is_err());
    }
}
