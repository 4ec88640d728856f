#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Iatro simulation harness: generates synthetic patients, runs them through the reasoning
//! engine, and reports convergence metrics and anomalies.

/// Telemetry and RNG helpers.
#[path = "../helper.rs"]
pub mod helper;

/// Scenario ordering strategies.
#[path = "../methods.rs"]
pub mod methods;

/// Seeded scenario generation.
#[path = "../scenario_generator.rs"]
pub mod scenario_generator;

/// Concurrent scenario runner.
#[path = "../simulator.rs"]
pub mod simulator;

/// Per-disease and batch aggregation.
#[path = "../metrics.rs"]
pub mod metrics;

/// Outlier detection over finished batches.
#[path = "../anomaly.rs"]
pub mod anomaly;

/// JSON harness report.
#[path = "../report.rs"]
pub mod report;

/// Harness settings file.
#[path = "../settings.rs"]
pub mod settings;

/// Runtime entry & CLI hooks.
#[path = "../main.rs"]
pub mod runtime;

pub use anomaly::{Anomaly, AnomalyConfig, AnomalyDetector, AnomalyReason};
pub use helper::{random_seed, seeded_rng, SimulationTelemetry, SimulationTelemetryBuilder};
pub use methods::ScenarioStrategy;
pub use metrics::{DiseaseMetrics, Summary};
pub use report::{HarnessReport, HarnessReportBuilder};
pub use runtime::{SimulationEngine, SimulationEngineBuilder};
pub use scenario_generator::{
    GeneratorConfig, Scenario, ScenarioBatch, ScenarioGenerator, SkippedDisease,
};
pub use settings::{HarnessSettings, SettingsError};
pub use simulator::{run_scenario, ScenarioResult, Simulator, TrajectorySample};
