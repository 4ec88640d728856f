use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Heuristic exponents applied on top of the Bayesian update. The effective LR is
/// `lr^(1 + cluster + scarcity + stage)`, exponent capped at `1 + exponent_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    /// Exponent added per earlier confirmation in the same cluster backed by the disease.
    pub cluster_per_hit: f64,
    /// Upper bound of the cluster term.
    pub cluster_cap: f64,
    /// Maximum scarcity term, reached by diseases with no positive evidence rows.
    pub scarcity_weight: f64,
    /// Evidence-row count at and above which the scarcity term vanishes.
    pub scarcity_reference: usize,
    /// Stage term multiplier, applied to the leader's gap over the runner-up.
    pub stage_max: f64,
    /// Upper bound of the summed exponent.
    pub exponent_cap: f64,
}

impl BoostConfig {
    /// Pure Bayesian update: every term is zero.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            cluster_per_hit: 0.0,
            cluster_cap: 0.0,
            scarcity_weight: 0.0,
            scarcity_reference: 0,
            stage_max: 0.0,
            exponent_cap: 0.0,
        }
    }
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            cluster_per_hit: 0.25,
            cluster_cap: 0.7,
            scarcity_weight: 0.4,
            scarcity_reference: 5,
            stage_max: 0.5,
            exponent_cap: 1.5,
        }
    }
}

/// Engine configuration, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Leader posterior required to converge.
    pub confidence_threshold: f64,
    /// Evidence hits the leader needs before converging.
    pub min_evidence_hits: u32,
    /// Derive the hit requirement from the leader's evidence count instead.
    pub dynamic_evidence_hits: bool,
    /// Minimum leader/runner-up gap required to converge.
    pub min_gap: f64,
    /// Action budget; reaching it ends the session as inconclusive.
    pub max_steps: u32,
    /// Candidates offered per question.
    pub top_k: usize,
    /// Phenotypes whose best positive LR is below this are filtered first.
    pub lr_threshold: f64,
    /// Coverage penalty factor: scores are divided by `1 + alpha * coverage`.
    pub coverage_alpha: f64,
    /// Selector bonus for phenotypes in an already-confirmed cluster.
    pub cluster_boost: f64,
    /// Consecutive low-gain actions that end the session; `None` disables the check.
    pub stall_limit: Option<u32>,
    /// Leader posterior rise below which an action counts as low-gain.
    pub stall_min_gain: f64,
    /// Posteriors are clipped to `[epsilon, 1 - epsilon]`.
    pub epsilon: f64,
    /// Effective likelihood ratios are clamped to `[1 / max, max]`.
    pub max_effective_lr: f64,
    /// Update boosts.
    pub boosts: BoostConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.9,
            min_evidence_hits: 2,
            dynamic_evidence_hits: false,
            min_gap: 0.15,
            max_steps: 15,
            top_k: 15,
            lr_threshold: 1.0,
            coverage_alpha: 0.1,
            cluster_boost: 0.25,
            stall_limit: None,
            stall_min_gain: 0.05,
            epsilon: 1e-9,
            max_effective_lr: 1e6,
            boosts: BoostConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Profile for interactive sessions: 15 candidates, stops after 3 low-gain answers.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            top_k: 15,
            stall_limit: Some(3),
            ..Self::default()
        }
    }

    /// Profile for simulated sessions: 30 candidates, no stall detection.
    #[must_use]
    pub fn simulation() -> Self {
        Self {
            top_k: 30,
            stall_limit: None,
            ..Self::default()
        }
    }

    /// Loads a TOML file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parses a TOML document and validates it. Missing keys take default values.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every bound the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, field: &'static str, reason: &'static str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid { field, reason })
            }
        };
        check(
            self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0,
            "confidence_threshold",
            "must be in (0, 1]",
        )?;
        check(
            (0.0..1.0).contains(&self.min_gap),
            "min_gap",
            "must be in [0, 1)",
        )?;
        check(self.max_steps > 0, "max_steps", "must be positive")?;
        check(self.top_k > 0, "top_k", "must be positive")?;
        check(
            self.lr_threshold.is_finite() && self.lr_threshold >= 0.0,
            "lr_threshold",
            "must be finite and non-negative",
        )?;
        check(
            self.coverage_alpha.is_finite() && self.coverage_alpha >= 0.0,
            "coverage_alpha",
            "must be finite and non-negative",
        )?;
        check(
            self.cluster_boost.is_finite() && self.cluster_boost >= 0.0,
            "cluster_boost",
            "must be finite and non-negative",
        )?;
        check(
            self.stall_limit != Some(0),
            "stall_limit",
            "must be positive when set",
        )?;
        check(
            self.epsilon > 0.0 && self.epsilon < 0.5,
            "epsilon",
            "must be in (0, 0.5)",
        )?;
        check(
            self.max_effective_lr.is_finite() && self.max_effective_lr > 1.0,
            "max_effective_lr",
            "must be finite and exceed 1",
        )?;
        let b = &self.boosts;
        check(
            [b.cluster_per_hit, b.cluster_cap, b.scarcity_weight, b.stage_max, b.exponent_cap]
                .iter()
                .all(|v| v.is_finite() && *v >= 0.0),
            "boosts",
            "must be finite and non-negative",
        )
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of bounds.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Human-readable bound.
        reason: &'static str,
    },
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing failure.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
        EngineConfig::interactive().validate().unwrap();
        assert_eq!(EngineConfig::simulation().top_k, 30);
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = EngineConfig::from_toml(
            r#"
confidence_threshold = 0.85
max_steps = 20
stall_limit = 4

[boosts]
stage_max = 0.0
"#,
        )
        .unwrap();
        assert!((config.confidence_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.stall_limit, Some(4));
        assert_eq!(config.top_k, 15);
        assert!(config.boosts.stage_max.abs() < f64::EPSILON);
        assert!((config.boosts.scarcity_weight - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_out_of_bounds_values() {
        let err = EngineConfig::from_toml("min_gap = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "min_gap", .. }));
        let err = EngineConfig::from_toml("[boosts]\nstage_max = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "boosts", .. }));
        for (toml, field) in [
            ("max_effective_lr = inf", "max_effective_lr"),
            ("max_effective_lr = nan", "max_effective_lr"),
            ("epsilon = nan", "epsilon"),
            ("coverage_alpha = inf", "coverage_alpha"),
            ("cluster_boost = nan", "cluster_boost"),
            ("lr_threshold = inf", "lr_threshold"),
        ] {
            let err = EngineConfig::from_toml(toml).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { field: f, .. } if f == field),
                "{toml} should be rejected"
            );
        }
    }
}
