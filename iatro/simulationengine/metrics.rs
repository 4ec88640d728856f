use std::collections::BTreeMap;

use iatro_reasoning::{DiseaseId, EvidenceIndex};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::simulator::ScenarioResult;

/// Aggregate outcome for one target disease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseMetrics {
    /// Target disease.
    pub disease: DiseaseId,
    /// Display name.
    pub name: String,
    /// Scenarios run.
    pub total_tests: usize,
    /// Scenarios that converged on the target.
    pub converged: usize,
    /// `converged / total_tests`.
    pub convergence_rate: f64,
    /// Mean steps over every scenario.
    pub avg_steps: f64,
    /// Fewest steps.
    pub min_steps: u32,
    /// Most steps.
    pub max_steps: u32,
    /// Mean confidence over every scenario.
    pub avg_confidence: f64,
    /// Mean final target posterior.
    pub avg_target_posterior: f64,
    /// Phenotypes with LR+ rows for the disease.
    pub evidence_phenotypes: usize,
    /// Failure bucket counts, first-seen order.
    pub failure_modes: IndexMap<String, usize>,
    /// Runs whose final leader was another disease.
    pub leader_mismatches: usize,
}

/// Batch-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Scenarios run.
    pub total_tests: usize,
    /// Diseases with at least one scenario.
    pub total_diseases: usize,
    /// Scenarios that converged on the target.
    pub total_converged: usize,
    /// `total_converged / total_tests`.
    pub overall_convergence_rate: f64,
    /// Mean steps.
    pub avg_steps: f64,
    /// Mean confidence.
    pub avg_confidence: f64,
    /// Diseases the generator skipped.
    pub skipped_diseases: usize,
}

/// Groups results by target disease, ascending id.
#[must_use]
pub fn aggregate(results: &[ScenarioResult], index: &EvidenceIndex) -> Vec<DiseaseMetrics> {
    let mut grouped: BTreeMap<DiseaseId, Vec<&ScenarioResult>> = BTreeMap::new();
    for result in results {
        grouped.entry(result.target).or_default().push(result);
    }
    grouped
        .into_iter()
        .map(|(disease, runs)| {
            let mut failure_modes = IndexMap::new();
            for mode in runs.iter().filter_map(|r| r.failure_mode()) {
                *failure_modes.entry(mode.to_string()).or_insert(0) += 1;
            }
            let converged = runs.iter().filter(|r| r.converged).count();
            let steps: Vec<f64> = runs.iter().map(|r| f64::from(r.steps)).collect();
            DiseaseMetrics {
                disease,
                name: runs[0].target_name.clone(),
                total_tests: runs.len(),
                converged,
                convergence_rate: ratio(converged, runs.len()),
                avg_steps: mean(&steps),
                min_steps: runs.iter().map(|r| r.steps).min().unwrap_or(0),
                max_steps: runs.iter().map(|r| r.steps).max().unwrap_or(0),
                avg_confidence: mean(&runs.iter().map(|r| r.confidence).collect::<Vec<_>>()),
                avg_target_posterior: mean(
                    &runs.iter().map(|r| r.target_posterior).collect::<Vec<_>>(),
                ),
                evidence_phenotypes: index.positive_evidence_count(disease),
                failure_modes,
                leader_mismatches: runs
                    .iter()
                    .filter(|r| r.leader != Some(r.target))
                    .count(),
            }
        })
        .collect()
}

/// Batch summary.
#[must_use]
pub fn summarize(results: &[ScenarioResult], skipped_diseases: usize) -> Summary {
    let total_converged = results.iter().filter(|r| r.converged).count();
    let total_diseases = results
        .iter()
        .map(|r| r.target)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    Summary {
        total_tests: results.len(),
        total_diseases,
        total_converged,
        overall_convergence_rate: ratio(total_converged, results.len()),
        avg_steps: mean(&results.iter().map(|r| f64::from(r.steps)).collect::<Vec<_>>()),
        avg_confidence: mean(&results.iter().map(|r| r.confidence).collect::<Vec<_>>()),
        skipped_diseases,
    }
}

/// Arithmetic mean, `0.0` for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let denominator = values.len() as f64;
        values.iter().sum::<f64>() / denominator
    }
}

/// Population standard deviation, `0.0` for an empty slice.
#[must_use]
pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Population variance, `0.0` for an empty slice.
#[must_use]
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    #[allow(clippy::cast_precision_loss)]
    let denominator = values.len() as f64;
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / denominator
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::ScenarioStrategy;
    use iatro_reasoning::{KnowledgeBase, SessionStatus, TerminationReason};
    use uuid::Uuid;

    fn result(
        target: u32,
        leader: u32,
        reason: TerminationReason,
        steps: u32,
        confidence: f64,
    ) -> ScenarioResult {
        let converged = reason == TerminationReason::Converged && target == leader;
        ScenarioResult {
            scenario_id: Uuid::new_v4(),
            label: "optimal-1".into(),
            target: DiseaseId(target),
            target_name: format!("D{target}"),
            strategy: ScenarioStrategy::Optimal,
            converged,
            status: if reason == TerminationReason::Converged {
                SessionStatus::Converged
            } else {
                SessionStatus::Inconclusive
            },
            termination_reason: reason,
            steps,
            leader: Some(DiseaseId(leader)),
            leader_name: None,
            leader_posterior: confidence,
            target_posterior: confidence,
            confidence,
            hit_count: 2,
            required_hits: 2,
            confirmed_path: Vec::new(),
            none_steps: 0,
            trajectory: Vec::new(),
        }
    }

    #[test]
    fn aggregates_per_disease() {
        let kb = KnowledgeBase::default()
            .disease(1, "D1", 0.3)
            .disease(2, "D2", 0.3)
            .phenotype(1, "P1", None)
            .lr(1, 1, 4.0);
        let index = EvidenceIndex::build(&kb).unwrap();
        let results = vec![
            result(1, 1, TerminationReason::Converged, 2, 0.95),
            result(1, 2, TerminationReason::Converged, 4, 0.2),
            result(1, 1, TerminationReason::MaxSteps, 15, 0.6),
            result(2, 2, TerminationReason::Converged, 3, 0.9),
        ];
        let metrics = aggregate(&results, &index);
        assert_eq!(metrics.len(), 2);
        let d1 = &metrics[0];
        assert_eq!(d1.total_tests, 3);
        assert_eq!(d1.converged, 1);
        assert!((d1.convergence_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!((d1.min_steps, d1.max_steps), (2, 15));
        assert!((d1.avg_steps - 7.0).abs() < 1e-9);
        assert_eq!(d1.failure_modes["converged_wrong_disease"], 1);
        assert_eq!(d1.failure_modes["max_steps"], 1);
        assert_eq!(d1.leader_mismatches, 1);
        assert_eq!(d1.evidence_phenotypes, 1);

        let summary = summarize(&results, 1);
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.total_diseases, 2);
        assert_eq!(summary.total_converged, 2);
        assert!((summary.overall_convergence_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.skipped_diseases, 1);
    }

    #[test]
    fn population_statistics() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values) - 5.0).abs() < 1e-12);
        assert!((std_dev(&values) - 2.0).abs() < 1e-12);
        assert!(std_dev(&[]).abs() < f64::EPSILON);
    }
}
