//! A `tracing` layer that ships a daemon's own events to the log server.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::{LogForwarder, LogLevel};

/// Maps a `tracing` level onto the wire level.
#[must_use]
pub fn level_from_tracing(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

/// Forwards every enabled event through a [`LogForwarder`].
///
/// The event target becomes the logger name. Fields other than `message` are
/// appended as `key=value` pairs. Write failures are swallowed: a daemon that
/// loses its log channel keeps running.
#[derive(Clone)]
pub struct ForwardingLayer {
    forwarder: Arc<LogForwarder>,
}

impl ForwardingLayer {
    /// Wraps a connected forwarder.
    #[must_use]
    pub const fn new(forwarder: Arc<LogForwarder>) -> Self {
        Self { forwarder }
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = level_from_tracing(metadata.level());
        if !self.forwarder.enabled(level) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        // Nowhere left to report a failed write.
        self.forwarder
            .forward(level, metadata.target(), &visitor.finish())
            .ok();
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        if write!(self.fields, "{}={value:?}", field.name()).is_err() {
            self.fields.push_str(field.name());
        }
    }
}
