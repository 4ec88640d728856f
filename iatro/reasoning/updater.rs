use serde::{Deserialize, Serialize};

use crate::{
    config::{BoostConfig, EngineConfig},
    index::EvidenceIndex,
    knowledge::{DiseaseId, PhenotypeId},
    session::SessionState,
};

const MIN_LR: f64 = 1e-9;

/// Posterior movement of one disease during an update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorChange {
    /// Disease that moved.
    pub disease: DiseaseId,
    /// Posterior before the update.
    pub before: f64,
    /// Posterior after the update.
    pub after: f64,
    /// Likelihood ratio actually applied, after boosting and clamping.
    pub effective_lr: f64,
    /// Summed boost exponent.
    pub boost: f64,
}

/// Result of applying one confirmed phenotype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Confirmed phenotype.
    pub phenotype: PhenotypeId,
    /// One entry per disease with a positive LR row, ascending disease id.
    pub changes: Vec<PosteriorChange>,
}

impl UpdateReport {
    /// Change recorded for a disease, if it moved.
    #[must_use]
    pub fn change_for(&self, disease: DiseaseId) -> Option<&PosteriorChange> {
        self.changes.iter().find(|c| c.disease == disease)
    }
}

/// Boosted odds-form Bayesian update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorUpdater {
    boosts: BoostConfig,
    epsilon: f64,
    max_effective_lr: f64,
}

impl PosteriorUpdater {
    /// Creates an updater from engine configuration.
    #[must_use]
    pub const fn new(config: &EngineConfig) -> Self {
        Self {
            boosts: config.boosts,
            epsilon: config.epsilon,
            max_effective_lr: config.max_effective_lr,
        }
    }

    /// Applies a confirmation of `phenotype` to every disease with a positive LR row for it.
    ///
    /// Callers invoke this once per phenotype, on its first confirmation. Diseases without
    /// a row keep their posterior; nothing is renormalized.
    pub fn apply(
        &self,
        index: &EvidenceIndex,
        state: &mut SessionState,
        phenotype: PhenotypeId,
    ) -> UpdateReport {
        let (leader, gap) = match state.leader_and_runner_up() {
            Some(((id, top), runner_up)) => {
                (Some(id), runner_up.map_or(top, |(_, second)| top - second))
            }
            None => (None, 0.0),
        };
        let cluster = index.cluster_of(phenotype);

        let rows: Vec<_> = index
            .evidence_for_phenotype(phenotype)
            .filter_map(|e| e.lr_pos.map(|lr| (e.disease, lr)))
            .collect();
        let mut changes = Vec::with_capacity(rows.len());
        for (disease, lr) in rows {
            let stage = if leader == Some(disease) {
                self.boosts.stage_max * gap
            } else {
                0.0
            };
            let boost = (self.cluster_term(index, state, disease, phenotype, cluster)
                + self.scarcity_term(index.positive_evidence_count(disease))
                + stage)
                .min(self.boosts.exponent_cap);
            let effective_lr = lr
                .max(MIN_LR)
                .powf(1.0 + boost)
                .clamp(1.0 / self.max_effective_lr, self.max_effective_lr);

            let before = state.posterior(disease);
            let odds = before / (1.0 - before) * effective_lr;
            let after = (odds / (1.0 + odds)).clamp(self.epsilon, 1.0 - self.epsilon);
            state.set_posterior(disease, after);
            state.record_hit(disease);
            changes.push(PosteriorChange {
                disease,
                before,
                after,
                effective_lr,
                boost,
            });
        }
        UpdateReport { phenotype, changes }
    }

    /// Earlier confirmations in the same cluster that also support the disease.
    fn cluster_term(
        &self,
        index: &EvidenceIndex,
        state: &SessionState,
        disease: DiseaseId,
        phenotype: PhenotypeId,
        cluster: Option<&str>,
    ) -> f64 {
        let Some(cluster) = cluster else {
            return 0.0;
        };
        let supporting = state
            .confirmed()
            .iter()
            .filter(|p| **p != phenotype && index.cluster_of(**p) == Some(cluster))
            .filter(|p| {
                index
                    .evidence(disease, **p)
                    .and_then(|e| e.lr_pos)
                    .is_some_and(|lr| lr > 1.0)
            })
            .count();
        #[allow(clippy::cast_precision_loss)]
        let supporting = supporting as f64;
        (self.boosts.cluster_per_hit * supporting).min(self.boosts.cluster_cap)
    }

    #[allow(clippy::cast_precision_loss)]
    fn scarcity_term(&self, evidence_rows: usize) -> f64 {
        let reference = self.boosts.scarcity_reference;
        if reference == 0 || evidence_rows >= reference {
            return 0.0;
        }
        self.boosts.scarcity_weight * (reference - evidence_rows) as f64 / reference as f64
    }
}
