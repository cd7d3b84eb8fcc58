//! Component-scoped logger handle

use std::borrow::Cow;
use std::fmt::{self, Display, Write as _};

/// Longest error text carried into a single log entry
const MAX_ERROR_CHARS: usize = 200;

/// Rendered `key=value` pairs attached to a log entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFields {
    rendered: String,
}

impl LogFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. Values are rendered with `Display`.
    pub fn with(mut self, key: &str, value: impl Display) -> Self {
        if !self.rendered.is_empty() {
            self.rendered.push(' ');
        }
        // Writing into a String cannot fail
        let _ = write!(self.rendered, "{}={}", key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl Display for LogFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Reduce an error to its first line, bounded in length.
pub fn condense_error(error: &dyn Display) -> String {
    let text = error.to_string();
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= MAX_ERROR_CHARS {
        first_line.to_string()
    } else {
        let mut out: String = first_line.chars().take(MAX_ERROR_CHARS).collect();
        out.push_str("...");
        out
    }
}

/// Structured logger for one component.
///
/// Every component receives its own handle at construction time instead of
/// reaching for a global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logger {
    component: Cow<'static, str>,
}

impl Logger {
    pub fn new(component: &'static str) -> Self {
        Logger {
            component: Cow::Borrowed(component),
        }
    }

    /// Handle for a sub-component, named `<parent>.<component>`
    pub fn child(&self, component: &str) -> Self {
        Logger {
            component: Cow::Owned(format!("{}.{}", self.component, component)),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn debug(&self, operation: &str, message: &str, fields: LogFields) {
        tracing::debug!(
            component = &*self.component,
            operation = operation,
            details = %fields,
            "{}",
            message
        );
    }

    pub fn info(&self, operation: &str, message: &str, fields: LogFields) {
        tracing::info!(
            component = &*self.component,
            operation = operation,
            details = %fields,
            "{}",
            message
        );
    }

    pub fn warn(&self, operation: &str, message: &str, fields: LogFields) {
        tracing::warn!(
            component = &*self.component,
            operation = operation,
            details = %fields,
            "{}",
            message
        );
    }

    /// Log a failure with the condensed error text attached.
    pub fn failure(&self, operation: &str, error: &dyn Display, fields: LogFields) {
        let condensed = condense_error(error);
        tracing::error!(
            component = &*self.component,
            operation = operation,
            details = %fields,
            error = %condensed,
            "{} failed",
            operation
        );
    }
}
