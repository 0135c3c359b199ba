use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Supported output formats for the host process's own diagnostics.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
    /// Human-readable single line output.
    #[default]
    Compact,
}

/// Severity carried by forwarded log records.
///
/// Variants are ordered from least to most severe so thresholds compare
/// naturally: `LogLevel::Warn >= LogLevel::Info`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumString,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    /// Very fine-grained tracing output.
    Trace,
    /// Debugging output.
    Debug,
    /// Informational messages.
    #[default]
    Info,
    /// Recoverable problems.
    #[serde(alias = "warning")]
    #[strum(to_string = "warn", serialize = "warning")]
    Warn,
    /// Failures.
    #[serde(alias = "critical")]
    #[strum(to_string = "error", serialize = "critical")]
    Error,
}

impl LogLevel {
    /// Reports whether a record at this level passes `threshold`.
    #[must_use]
    pub fn passes(self, threshold: Self) -> bool {
        self >= threshold
    }
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;

/// Errors encountered while parsing a [`LogLevel`] from text.
pub type LogLevelParseError = strum::ParseError;
