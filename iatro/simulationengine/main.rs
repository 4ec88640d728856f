use std::sync::Arc;

use anyhow::{bail, Result};
use iatro_reasoning::{DiseaseId, EvidenceIndex, ReasoningTelemetry};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    anomaly::AnomalyDetector,
    helper::{random_seed, SimulationTelemetry},
    report::{HarnessReport, HarnessReportBuilder},
    scenario_generator::{ScenarioBatch, ScenarioGenerator},
    settings::HarnessSettings,
    simulator::Simulator,
};

/// High-level harness: generate, run, aggregate, review.
pub struct SimulationEngine {
    index: Arc<EvidenceIndex>,
    settings: HarnessSettings,
    seed: u64,
    only: Option<Vec<DiseaseId>>,
    telemetry: Option<SimulationTelemetry>,
    reasoning: Option<ReasoningTelemetry>,
}

impl SimulationEngine {
    /// Returns a builder.
    #[must_use]
    pub fn builder(index: Arc<EvidenceIndex>) -> SimulationEngineBuilder {
        SimulationEngineBuilder::new(index)
    }

    /// Seed used for scenario generation.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Generates the scenario batch without running it.
    #[must_use]
    pub fn generate(&self) -> ScenarioBatch {
        let generator = ScenarioGenerator::new(
            self.settings.generator.clone(),
            self.seed,
            self.settings.engine.max_steps,
        );
        match &self.only {
            Some(diseases) => generator.generate_for(&self.index, diseases),
            None => generator.generate(&self.index),
        }
    }

    /// Runs the full pipeline and returns the report.
    pub async fn run(&self) -> Result<HarnessReport> {
        let batch = self.generate();
        self.log(
            LogLevel::Info,
            "simulation.harness.generated",
            json!({
                "seed": self.seed,
                "scenarios": batch.scenarios.len(),
                "skipped": batch.skipped.len(),
            }),
        );
        for skipped in &batch.skipped {
            self.log(
                LogLevel::Warn,
                "simulation.disease.skipped",
                json!({
                    "disease": skipped.disease,
                    "name": skipped.name,
                    "usable": skipped.usable,
                    "required": skipped.required,
                }),
            );
        }

        let mut simulator = Simulator::new(
            Arc::clone(&self.index),
            self.settings.engine.clone(),
            self.telemetry.clone(),
        );
        if let Some(reasoning) = &self.reasoning {
            simulator = simulator.with_reasoning_telemetry(reasoning.clone());
        }
        let results = simulator.run(batch.scenarios).await?;
        let anomalies =
            AnomalyDetector::new(self.settings.anomaly.clone(), self.telemetry.clone())
                .review(&results);

        let report = HarnessReportBuilder::new(&self.index)
            .seed(self.seed)
            .configs(self.settings.engine.clone(), self.settings.generator.clone())
            .results(results)
            .anomalies(anomalies)
            .skipped(batch.skipped)
            .build();
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(
                "simulation.harness.completed",
                json!({
                    "seed": self.seed,
                    "total_tests": report.summary.total_tests,
                    "converged": report.summary.total_converged,
                    "anomalies": report.anomalies.len(),
                }),
            );
        }
        Ok(report)
    }

    /// Returns telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> Option<&SimulationTelemetry> {
        self.telemetry.as_ref()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

/// Builder for `SimulationEngine`.
pub struct SimulationEngineBuilder {
    index: Arc<EvidenceIndex>,
    settings: HarnessSettings,
    seed: Option<u64>,
    only: Option<Vec<String>>,
    telemetry: Option<SimulationTelemetry>,
    reasoning: Option<ReasoningTelemetry>,
}

impl SimulationEngineBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new(index: Arc<EvidenceIndex>) -> Self {
        Self {
            index,
            settings: HarnessSettings::default(),
            seed: None,
            only: None,
            telemetry: None,
            reasoning: None,
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn settings(mut self, settings: HarnessSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Seeds the generator, overriding the settings file.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Restricts the batch to diseases matched by name, case-insensitively.
    #[must_use]
    pub fn only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SimulationTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Telemetry handed to the reasoning engine.
    #[must_use]
    pub fn reasoning_telemetry(mut self, telemetry: ReasoningTelemetry) -> Self {
        self.reasoning = Some(telemetry);
        self
    }

    /// Builds the engine. Fails on invalid settings or unknown disease names.
    pub fn build(self) -> Result<SimulationEngine> {
        self.settings.validate()?;
        let only = match self.only {
            Some(names) => {
                let mut ids = Vec::with_capacity(names.len());
                for name in &names {
                    match self.index.disease_by_name(name) {
                        Some(disease) => ids.push(disease.id),
                        None => bail!("unknown disease `{name}`"),
                    }
                }
                Some(ids)
            }
            None => None,
        };
        let seed = self
            .seed
            .or(self.settings.seed)
            .unwrap_or_else(random_seed);
        Ok(SimulationEngine {
            index: self.index,
            settings: self.settings,
            seed,
            only,
            telemetry: self.telemetry,
            reasoning: self.reasoning,
        })
    }
}
