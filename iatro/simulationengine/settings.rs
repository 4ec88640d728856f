use std::{fs, path::Path};

use iatro_reasoning::{ConfigError, EngineConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::{Table, Value};

use crate::{anomaly::AnomalyConfig, scenario_generator::GeneratorConfig};

/// Harness settings file: `[engine]`, `[generator]` and `[anomaly]` sections plus `seed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Engine configuration used for every scenario.
    pub engine: EngineConfig,
    /// Scenario generation.
    pub generator: GeneratorConfig,
    /// Anomaly thresholds.
    pub anomaly: AnomalyConfig,
    /// Batch seed; a random one is drawn when absent.
    pub seed: Option<u64>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::simulation(),
            generator: GeneratorConfig::default(),
            anomaly: AnomalyConfig::default(),
            seed: None,
        }
    }
}

impl HarnessSettings {
    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parses and validates a TOML document. Keys missing from `[engine]` keep the simulation
    /// profile's values.
    pub fn from_toml(raw: &str) -> Result<Self, SettingsError> {
        let mut doc: Table = toml::from_str(raw)?;
        if let Some(Value::Table(engine)) = doc.remove("engine") {
            let mut base = match Value::try_from(EngineConfig::simulation())? {
                Value::Table(table) => table,
                _ => Table::new(),
            };
            overlay(&mut base, engine);
            doc.insert("engine".into(), Value::Table(base));
        }
        let settings: Self = Value::Table(doc).try_into()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.engine.validate()?;
        self.generator.validate()?;
        self.anomaly.validate()
    }
}

fn overlay(base: &mut Table, patch: Table) {
    for (key, value) in patch {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(inner)), Value::Table(nested)) => overlay(inner, nested),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Errors raised while loading harness settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A harness value is out of bounds.
    #[error("invalid {section}.{field}: {reason}")]
    Invalid {
        /// Section name.
        section: &'static str,
        /// Offending key.
        field: &'static str,
        /// Human-readable bound.
        reason: &'static str,
    },
    /// The engine section is invalid.
    #[error("engine: {0}")]
    Engine(#[from] ConfigError),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing failure.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    /// TOML serialization failure.
    #[error("toml error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_override_defaults() {
        let settings = HarnessSettings::from_toml(
            r#"
seed = 7

[engine]
max_steps = 20

[generator]
scenarios_per_disease = 4

[anomaly]
sigma = 2.5
"#,
        )
        .unwrap();
        assert_eq!(settings.seed, Some(7));
        assert_eq!(settings.engine.max_steps, 20);
        assert_eq!(settings.engine.top_k, 30);
        assert_eq!(settings.generator.scenarios_per_disease, 4);
        assert!((settings.anomaly.sigma - 2.5).abs() < f64::EPSILON);
        assert_eq!(settings.generator.min_evidence, 2);
    }

    #[test]
    fn reports_the_failing_section() {
        let err = HarnessSettings::from_toml("[engine]\ntop_k = 0").unwrap_err();
        assert!(matches!(err, SettingsError::Engine(_)));
        let err = HarnessSettings::from_toml("[anomaly]\ndecline_run = 0").unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid {
                section: "anomaly",
                ..
            }
        ));
    }
}
