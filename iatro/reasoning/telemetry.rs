use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{EventJournal, EventRecord, JsonLogger, LogLevel, LogRecord};

/// Builder for reasoning telemetry sinks.
pub struct ReasoningTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    journal: Option<EventJournal>,
}

impl ReasoningTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            journal: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below this level.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Records events into a shared journal.
    #[must_use]
    pub fn journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Records events into a private journal of the given capacity.
    #[must_use]
    pub fn journal_capacity(self, capacity: usize) -> Self {
        self.journal(EventJournal::new(capacity))
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ReasoningTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(ReasoningTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                journal: self.journal,
            }),
        })
    }
}

/// Telemetry handle shared across reasoning components.
#[derive(Clone)]
pub struct ReasoningTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ReasoningTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReasoningTelemetry")
            .field("module", &self.inner.module)
            .field("journal", &self.inner.journal.as_ref().map(EventJournal::len))
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    journal: Option<EventJournal>,
}

impl ReasoningTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ReasoningTelemetryBuilder {
        ReasoningTelemetryBuilder::new(module)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Records an event in the journal.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(journal) = &self.inner.journal {
            journal.record(EventRecord::new(&self.inner.module, event_type, payload));
        }
        Ok(())
    }

    /// Journal receiving events, if any.
    #[must_use]
    pub fn journal(&self) -> Option<&EventJournal> {
        self.inner.journal.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("reasoning.log");
        let journal = EventJournal::new(16);
        let telemetry = ReasoningTelemetry::builder("reasoning")
            .log_path(&path)
            .journal(journal.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "reasoning.session.started", json!({ "diseases": 3 }))
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "reasoning.selector.ranked", json!({}))
            .unwrap();
        telemetry
            .event("reasoning.session.converged", json!({ "steps": 2 }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("reasoning.session.started"));
        assert!(!content.contains("reasoning.selector.ranked"));
        assert_eq!(journal.snapshot().len(), 1);
        assert_eq!(telemetry.journal().map(EventJournal::len), Some(1));
    }
}
