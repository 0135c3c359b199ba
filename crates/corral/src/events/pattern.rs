//! Tag patterns used to select events.

use std::fmt;

use glob::{MatchOptions, Pattern, PatternError};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Selects events by tag.
///
/// Tags are hierarchical strings with `/`-separated segments. In a glob, `*`
/// and `?` never cross a `/`, so `job/*/complete` matches `job/42/complete`
/// but not `job/42/step/complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPattern {
    /// Matches one tag exactly.
    Exact(String),
    /// Matches every tag starting with the prefix.
    Prefix(String),
    /// Matches tags against a shell-style glob.
    Glob(Pattern),
}

impl TagPattern {
    /// Pattern matching only `tag`.
    #[must_use]
    pub fn exact(tag: impl Into<String>) -> Self {
        Self::Exact(tag.into())
    }

    /// Pattern matching every tag that begins with `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Compiles a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns an error when `pattern` is not a valid glob.
    pub fn glob(pattern: &str) -> Result<Self, PatternError> {
        Pattern::new(pattern).map(Self::Glob)
    }

    /// Reports whether `tag` is selected.
    #[must_use]
    pub fn matches(&self, tag: &str) -> bool {
        match self {
            Self::Exact(expected) => tag == expected,
            Self::Prefix(prefix) => tag.starts_with(prefix.as_str()),
            Self::Glob(pattern) => pattern.matches_with(tag, GLOB_OPTIONS),
        }
    }
}

impl fmt::Display for TagPattern {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(tag) => formatter.write_str(tag),
            Self::Prefix(prefix) => write!(formatter, "{prefix}*"),
            Self::Glob(pattern) => formatter.write_str(pattern.as_str()),
        }
    }
}

/// Interprets caller text: a lone trailing `*` declares a prefix, any other
/// glob metacharacter declares a glob, and anything else is an exact tag.
/// Text that fails to compile as a glob is matched exactly.
impl From<&str> for TagPattern {
    fn from(text: &str) -> Self {
        if let Some(prefix) = text.strip_suffix('*')
            && !has_glob_syntax(prefix)
        {
            return Self::prefix(prefix);
        }
        if has_glob_syntax(text) {
            return Pattern::new(text).map_or_else(|_| Self::exact(text), Self::Glob);
        }
        Self::exact(text)
    }
}

impl From<String> for TagPattern {
    fn from(text: String) -> Self {
        Self::from(text.as_str())
    }
}

impl From<&String> for TagPattern {
    fn from(text: &String) -> Self {
        Self::from(text.as_str())
    }
}

fn has_glob_syntax(text: &str) -> bool {
    text.contains(['*', '?', '['])
}
