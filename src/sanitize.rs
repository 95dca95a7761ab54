//! Line-level redaction of terminal output.
//!
//! Output leaving the PTY is split into lines and any line that looks
//! sensitive is replaced in full by [`REDACTION_MARKER`]. A line is sensitive
//! when it contains a blacklisted substring, when the whole line has the
//! shape of standard base64, or when it fully matches one of the configured
//! extra patterns.
//!
//! Matching is whole-line only: a secret sitting mid-line next to ordinary
//! text is not caught, and a line split across two PTY reads is judged as two
//! separate fragments. The base64 test is purely structural, so a bare word
//! whose length is a multiple of four (`exit`, `password`) is redacted too.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ConfigError;

/// Placeholder written in place of a redacted line.
pub const REDACTION_MARKER: &str = "[TRUNCATED]";

/// Blacklist used when the configuration does not provide one.
pub const DEFAULT_BLACKLIST: &[&str] = &["password"];

static BASE64_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[A-Za-z0-9+/]{4})*(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=|[A-Za-z0-9+/]{4})$",
    )
    .expect("base64 line pattern is valid")
});

/// Immutable redaction rules, shared read-only by every session.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    blacklist: Vec<String>,
    patterns: Vec<Regex>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            patterns: Vec::new(),
        }
    }
}

impl Sanitizer {
    /// Build a rule set from blacklisted substrings and extra whole-line
    /// regular expressions.
    ///
    /// An empty blacklist entry would match every line, so it is rejected
    /// along with patterns that fail to compile.
    pub fn new(blacklist: Vec<String>, patterns: &[String]) -> Result<Self, ConfigError> {
        if blacklist.iter().any(|entry| entry.is_empty()) {
            return Err(ConfigError::EmptyBlacklistEntry);
        }
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{p})$")).map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { blacklist, patterns })
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    /// Redact every sensitive line of `text`.
    ///
    /// Line separators are kept as they are. A trailing `\r` emitted by the
    /// PTY line discipline is not part of the tested content and survives
    /// after the marker.
    pub fn redact(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let (content, cr) = match line.strip_suffix('\r') {
                Some(content) => (content, "\r"),
                None => (line, ""),
            };
            if self.is_sensitive(content) {
                out.push_str(REDACTION_MARKER);
                out.push_str(cr);
            } else {
                out.push_str(line);
            }
        }
        out
    }

    /// Whether a single line (without its terminator) must be redacted.
    pub fn is_sensitive(&self, line: &str) -> bool {
        self.blacklist.iter().any(|word| line.contains(word.as_str()))
            || BASE64_LINE.is_match(line)
            || self.patterns.iter().any(|p| p.is_match(line))
    }
}
