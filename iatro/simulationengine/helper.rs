use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde_json::Value;
use shared_logging::{EventJournal, EventRecord, JsonLogger, LogLevel, LogRecord};

/// Telemetry builder for the simulation harness.
pub struct SimulationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    journal: Option<EventJournal>,
}

impl SimulationTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
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

    /// Builds telemetry.
    pub fn build(self) -> Result<SimulationTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(SimulationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                journal: self.journal,
            }),
        })
    }
}

/// Telemetry handle shared across simulation components.
#[derive(Clone)]
pub struct SimulationTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for SimulationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationTelemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    journal: Option<EventJournal>,
}

impl SimulationTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> SimulationTelemetryBuilder {
        SimulationTelemetryBuilder::new(module)
    }

    /// Logs metadata.
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

/// Generates a random seed for simulation runs.
#[must_use]
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Returns a reproducible RNG.
#[must_use]
pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let log_path = tmp.path().join("sim.log");
        let telemetry = SimulationTelemetry::builder("simulation")
            .log_path(&log_path)
            .journal_capacity(4)
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "simulation.batch.started", json!({ "seed": 1 }))
            .unwrap();
        telemetry
            .event("simulation.batch.completed", json!({ "converged": 3 }))
            .unwrap();
        assert!(std::fs::read_to_string(&log_path)
            .unwrap()
            .contains("simulation.batch.started"));
        assert_eq!(telemetry.journal().map(EventJournal::len), Some(1));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let (mut a, mut b) = (seeded_rng(7), seeded_rng(7));
        for _ in 0..4 {
            assert_eq!(a.gen::<u64>(), b.gen::<u64>());
        }
    }
}
