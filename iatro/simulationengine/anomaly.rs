use iatro_reasoning::DiseaseId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    helper::SimulationTelemetry,
    metrics::{mean, std_dev, variance},
    settings::SettingsError,
    simulator::ScenarioResult,
};

const MIN_BATCH_VARIANCE: f64 = 1e-12;

/// Anomaly thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Band half-width in standard deviations.
    pub sigma: f64,
    /// Consecutive strictly decreasing target-posterior steps that count as a decline.
    pub decline_run: usize,
    /// Delta variance above this multiple of the batch mean is volatile.
    pub variance_multiple: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sigma: 2.0,
            decline_run: 3,
            variance_multiple: 3.0,
        }
    }
}

impl AnomalyConfig {
    /// Checks bounds.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, reason: &'static str| {
            Err(SettingsError::Invalid {
                section: "anomaly",
                field,
                reason,
            })
        };
        if self.sigma.is_nan() || self.sigma <= 0.0 {
            return invalid("sigma", "must be positive");
        }
        if self.decline_run == 0 {
            return invalid("decline_run", "must be positive");
        }
        if self.variance_multiple.is_nan() || self.variance_multiple <= 0.0 {
            return invalid("variance_multiple", "must be positive");
        }
        Ok(())
    }
}

/// Normal range learned from converged results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// `mean - sigma * std_dev`.
    pub low: f64,
    /// `mean + sigma * std_dev`.
    pub high: f64,
}

impl Band {
    fn fit(values: &[f64], sigma: f64) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mean = mean(values);
        let std_dev = std_dev(values);
        Some(Self {
            mean,
            std_dev,
            low: mean - sigma * std_dev,
            high: mean + sigma * std_dev,
        })
    }

    fn excludes(&self, value: f64) -> bool {
        value < self.low || value > self.high
    }
}

/// Why a scenario was flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyReason {
    /// Steps to converge outside the band.
    StepsOutOfBand {
        /// Observed steps.
        steps: u32,
        /// Band used.
        band: Band,
    },
    /// Confidence at convergence outside the band.
    ConfidenceOutOfBand {
        /// Observed confidence.
        confidence: f64,
        /// Band used.
        band: Band,
    },
    /// Target posterior kept falling.
    SustainedDecline {
        /// Longest run of strictly decreasing steps.
        run: usize,
    },
    /// Step-to-step target posterior deltas vary far more than the batch norm.
    VolatileTrajectory {
        /// Delta variance of this trajectory.
        variance: f64,
        /// Mean delta variance over the batch.
        batch_mean: f64,
    },
}

impl AnomalyReason {
    /// Stable tag used in reports.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::StepsOutOfBand { .. } => "steps_out_of_band",
            Self::ConfidenceOutOfBand { .. } => "confidence_out_of_band",
            Self::SustainedDecline { .. } => "sustained_decline",
            Self::VolatileTrajectory { .. } => "volatile_trajectory",
        }
    }
}

/// A flagged scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Scenario id.
    pub scenario_id: Uuid,
    /// Target disease.
    pub disease: DiseaseId,
    /// Scenario label.
    pub label: String,
    /// Every reason that applied.
    pub reasons: Vec<AnomalyReason>,
}

/// Flags outliers in a finished batch.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    telemetry: Option<SimulationTelemetry>,
}

impl AnomalyDetector {
    /// Creates a detector.
    #[must_use]
    pub const fn new(config: AnomalyConfig, telemetry: Option<SimulationTelemetry>) -> Self {
        Self { config, telemetry }
    }

    /// Reviews a batch and returns the flagged scenarios in input order.
    #[must_use]
    pub fn review(&self, results: &[ScenarioResult]) -> Vec<Anomaly> {
        let converged: Vec<&ScenarioResult> = results.iter().filter(|r| r.converged).collect();
        let steps = Band::fit(
            &converged.iter().map(|r| f64::from(r.steps)).collect::<Vec<_>>(),
            self.config.sigma,
        );
        let confidence = Band::fit(
            &converged.iter().map(|r| r.confidence).collect::<Vec<_>>(),
            self.config.sigma,
        );
        let variances: Vec<Option<f64>> = results
            .iter()
            .map(|r| delta_variance(&r.target_series()))
            .collect();
        let batch_mean = mean(&variances.iter().flatten().copied().collect::<Vec<_>>());

        let anomalies: Vec<Anomaly> = results
            .iter()
            .zip(&variances)
            .filter_map(|(result, own)| {
                let mut reasons = Vec::new();
                if result.converged {
                    if let Some(band) = steps.filter(|b| b.excludes(f64::from(result.steps))) {
                        reasons.push(AnomalyReason::StepsOutOfBand {
                            steps: result.steps,
                            band,
                        });
                    }
                    if let Some(band) = confidence.filter(|b| b.excludes(result.confidence)) {
                        reasons.push(AnomalyReason::ConfidenceOutOfBand {
                            confidence: result.confidence,
                            band,
                        });
                    }
                }
                let run = longest_decline(&result.target_series());
                if run >= self.config.decline_run {
                    reasons.push(AnomalyReason::SustainedDecline { run });
                }
                let threshold = self.config.variance_multiple * batch_mean;
                if let Some(variance) = *own {
                    if batch_mean > MIN_BATCH_VARIANCE && variance > threshold {
                        reasons.push(AnomalyReason::VolatileTrajectory {
                            variance,
                            batch_mean,
                        });
                    }
                }
                (!reasons.is_empty()).then(|| Anomaly {
                    scenario_id: result.scenario_id,
                    disease: result.target,
                    label: result.label.clone(),
                    reasons,
                })
            })
            .collect();

        if let Some(tel) = &self.telemetry {
            let _ = tel.event(
                "simulation.review.completed",
                json!({
                    "total": results.len(),
                    "anomalies": anomalies.len(),
                }),
            );
        }
        anomalies
    }
}

/// Longest run of consecutive strictly decreasing steps.
#[must_use]
pub fn longest_decline(series: &[f64]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for pair in series.windows(2) {
        if pair[1] < pair[0] {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

fn delta_variance(series: &[f64]) -> Option<f64> {
    if series.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = series.windows(2).map(|p| p[1] - p[0]).collect();
    Some(variance(&deltas))
}
