use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use iatro_reasoning::{BuildDiagnostics, EngineConfig, EvidenceIndex};
use serde::{Deserialize, Serialize};

use crate::{
    anomaly::Anomaly,
    metrics::{aggregate, summarize, DiseaseMetrics, Summary},
    scenario_generator::{GeneratorConfig, SkippedDisease},
    simulator::ScenarioResult,
};

/// Structured report summarizing a harness run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessReport {
    /// Timestamp.
    pub generated_at: DateTime<Utc>,
    /// Batch seed.
    pub seed: u64,
    /// Engine configuration used.
    pub engine: EngineConfig,
    /// Generator configuration used.
    pub generator: GeneratorConfig,
    /// Batch counters.
    pub summary: Summary,
    /// Per-disease metrics, ascending disease id.
    pub disease_metrics: Vec<DiseaseMetrics>,
    /// Flagged scenarios.
    pub anomalies: Vec<Anomaly>,
    /// Diseases the generator skipped.
    pub skipped: Vec<SkippedDisease>,
    /// Raw results with trajectories.
    pub scenarios: Vec<ScenarioResult>,
    /// Index build counters.
    pub index: BuildDiagnostics,
}

impl HarnessReport {
    /// Writes the report as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body).with_context(|| format!("writing {}", path.display()))
    }
}

/// Builder for `HarnessReport`.
pub struct HarnessReportBuilder<'a> {
    index: &'a EvidenceIndex,
    seed: u64,
    engine: EngineConfig,
    generator: GeneratorConfig,
    results: Vec<ScenarioResult>,
    anomalies: Vec<Anomaly>,
    skipped: Vec<SkippedDisease>,
}

impl<'a> HarnessReportBuilder<'a> {
    /// Creates builder.
    #[must_use]
    pub fn new(index: &'a EvidenceIndex) -> Self {
        Self {
            index,
            seed: 0,
            engine: EngineConfig::simulation(),
            generator: GeneratorConfig::default(),
            results: Vec::new(),
            anomalies: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Sets seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the configurations used.
    #[must_use]
    pub fn configs(mut self, engine: EngineConfig, generator: GeneratorConfig) -> Self {
        self.engine = engine;
        self.generator = generator;
        self
    }

    /// Sets results.
    #[must_use]
    pub fn results(mut self, results: Vec<ScenarioResult>) -> Self {
        self.results = results;
        self
    }

    /// Sets anomalies.
    #[must_use]
    pub fn anomalies(mut self, anomalies: Vec<Anomaly>) -> Self {
        self.anomalies = anomalies;
        self
    }

    /// Sets skipped diseases.
    #[must_use]
    pub fn skipped(mut self, skipped: Vec<SkippedDisease>) -> Self {
        self.skipped = skipped;
        self
    }

    /// Builds report.
    #[must_use]
    pub fn build(self) -> HarnessReport {
        HarnessReport {
            generated_at: Utc::now(),
            seed: self.seed,
            summary: summarize(&self.results, self.skipped.len()),
            disease_metrics: aggregate(&self.results, self.index),
            engine: self.engine,
            generator: self.generator,
            anomalies: self.anomalies,
            skipped: self.skipped,
            scenarios: self.results,
            index: self.index.diagnostics().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iatro_reasoning::{DiseaseId, KnowledgeBase};
    use tempfile::tempdir;

    #[test]
    fn json_shape_carries_every_section() {
        let kb = KnowledgeBase::default()
            .disease(1, "D1", 0.3)
            .phenotype(1, "P1", None)
            .lr(1, 1, 4.0);
        let index = EvidenceIndex::build(&kb).unwrap();
        let report = HarnessReportBuilder::new(&index)
            .seed(11)
            .skipped(vec![SkippedDisease {
                disease: DiseaseId(1),
                name: "D1".into(),
                usable: 1,
                required: 2,
            }])
            .build();
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        report.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        for key in [
            "generated_at",
            "seed",
            "engine",
            "generator",
            "summary",
            "disease_metrics",
            "anomalies",
            "skipped",
            "scenarios",
            "index",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["seed"], 11);
        assert_eq!(value["summary"]["skipped_diseases"], 1);
        assert_eq!(value["summary"]["total_tests"], 0);
        assert_eq!(value["index"]["rows_indexed"], 1);
    }
}
