//! Managed pull request comments
//!
//! A managed comment is identified by an HTML comment marker on its first
//! line. Publishing under a marker edits the existing comment instead of
//! adding a new one, so a pull request carries at most one comment per
//! marker.

use crate::error::ApiError;
use std::fmt;

/// Longest comment body the API accepts
pub const MAX_COMMENT_CHARS: usize = 65_536;

/// Default cap for a single untrusted field inside a comment
pub const MAX_FIELD_CHARS: usize = 500;

/// Name of a managed comment, rendered as `<!-- name -->`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommentMarker {
    name: String,
}

impl CommentMarker {
    /// Marker names are limited to ASCII letters, digits, `-` and `_` so
    /// they cannot close the HTML comment early.
    pub fn new(name: &str) -> Result<Self, ApiError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ApiError::Unprocessable(format!(
                "Invalid comment marker '{}'",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> String {
        format!("<!-- {} -->", self.name)
    }

    /// Whether a comment body belongs to this marker
    pub fn matches(&self, body: &str) -> bool {
        body.contains(&self.tag())
    }

    /// Full comment body: the marker line followed by the cleaned text
    ///
    /// Control characters are dropped and the result never exceeds
    /// `MAX_COMMENT_CHARS`.
    pub fn render(&self, body: &str) -> String {
        let tag = self.tag();
        let room = MAX_COMMENT_CHARS.saturating_sub(tag.chars().count() + 1);
        let text: String = strip_control(body).chars().take(room).collect();
        format!("{}\n{}", tag, text)
    }
}

impl fmt::Display for CommentMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// What publishing a managed comment did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentOutcome {
    Created { id: u64 },
    Updated { id: u64 },
}

impl CommentOutcome {
    pub fn id(&self) -> u64 {
        match self {
            CommentOutcome::Created { id } | CommentOutcome::Updated { id } => *id,
        }
    }
}

impl fmt::Display for CommentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommentOutcome::Created { .. } => f.write_str("Comment posted"),
            CommentOutcome::Updated { .. } => f.write_str("Comment updated"),
        }
    }
}

/// Make an untrusted value safe to embed in markdown
///
/// Cuts the value to `max_chars` characters, drops control characters other
/// than tab and newlines, and escapes backticks so the value cannot break
/// out of inline code.
pub fn sanitize_text(value: &str, max_chars: usize) -> String {
    let truncated: String = value.chars().take(max_chars).collect();
    strip_control(&truncated).replace('`', "\\`")
}

/// `url` if it is an https link into `host`, None otherwise
pub fn sanitize_url<'a>(url: &'a str, host: &str) -> Option<&'a str> {
    let rest = url.strip_prefix("https://")?.strip_prefix(host)?;
    rest.starts_with('/').then_some(url)
}

fn strip_control(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}
