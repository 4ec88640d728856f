use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    index::EvidenceIndex,
    knowledge::PhenotypeId,
    session::SessionState,
};

/// A phenotype offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Phenotype id.
    pub phenotype: PhenotypeId,
    /// Display name.
    pub name: String,
    /// Ranking score after penalty and bonus.
    pub score: f64,
    /// Diseases with a positive LR for this phenotype.
    pub coverage: usize,
    /// Cluster tag.
    pub cluster: Option<String>,
    /// Plain-language explanation.
    pub description: String,
}

/// Ranked output of the selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Candidates, best first.
    pub candidates: Vec<Candidate>,
    /// Whether the LR filter left nothing and the unfiltered set was ranked instead.
    pub fallback: bool,
}

impl Selection {
    /// Whether nothing can be asked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Whether the phenotype is among the candidates.
    #[must_use]
    pub fn contains(&self, phenotype: PhenotypeId) -> bool {
        self.candidates.iter().any(|c| c.phenotype == phenotype)
    }
}

struct Scored {
    phenotype: PhenotypeId,
    score: f64,
    best_lr: Option<f64>,
    coverage: usize,
}

/// Ranks unasked phenotypes by expected posterior movement. Pure: never mutates the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuestionSelector {
    top_k: usize,
    lr_threshold: f64,
    coverage_alpha: f64,
    cluster_boost: f64,
}

impl QuestionSelector {
    /// Creates a selector from engine configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            top_k: config.top_k,
            lr_threshold: config.lr_threshold,
            coverage_alpha: config.coverage_alpha,
            cluster_boost: config.cluster_boost,
        }
    }

    /// Overrides how many candidates are returned.
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Ranks candidates for the next question.
    #[must_use]
    pub fn select(&self, index: &EvidenceIndex, state: &SessionState) -> Selection {
        let confirmed_clusters: BTreeSet<&str> = state
            .confirmed()
            .iter()
            .filter_map(|p| index.cluster_of(*p))
            .collect();

        let scored: Vec<Scored> = index
            .phenotypes()
            .filter(|p| !state.is_asked(p.id))
            .map(|p| self.score(index, state, p.id, &confirmed_clusters))
            .collect();

        let filtered: Vec<&Scored> = scored
            .iter()
            .filter(|s| s.score > 0.0 && s.best_lr.is_some_and(|lr| lr >= self.lr_threshold))
            .collect();
        let fallback = filtered.is_empty();
        let mut ranked = if fallback {
            scored.iter().collect()
        } else {
            filtered
        };
        // Phenotypes arrive in ascending id order; the stable sort keeps that for ties.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.top_k);

        let candidates = ranked
            .into_iter()
            .filter_map(|s| {
                let phenotype = index.phenotype(s.phenotype)?;
                Some(Candidate {
                    phenotype: s.phenotype,
                    name: phenotype.name.clone(),
                    score: s.score,
                    coverage: s.coverage,
                    cluster: phenotype.cluster.clone(),
                    description: phenotype.description.clone(),
                })
            })
            .collect();
        Selection {
            candidates,
            fallback,
        }
    }

    fn score(
        &self,
        index: &EvidenceIndex,
        state: &SessionState,
        phenotype: PhenotypeId,
        confirmed_clusters: &BTreeSet<&str>,
    ) -> Scored {
        let mut raw = 0.0;
        let mut best_lr: Option<f64> = None;
        let mut coverage = 0;
        for evidence in index.evidence_for_phenotype(phenotype) {
            let Some(lr) = evidence.lr_pos else { continue };
            raw += state.posterior(evidence.disease) * (lr - 1.0);
            best_lr = Some(best_lr.map_or(lr, |best| best.max(lr)));
            coverage += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let mut score = raw / (1.0 + self.coverage_alpha * coverage as f64);
        if index
            .cluster_of(phenotype)
            .is_some_and(|cluster| confirmed_clusters.contains(cluster))
        {
            score *= 1.0 + self.cluster_boost;
        }
        Scored {
            phenotype,
            score,
            best_lr,
            coverage,
        }
    }
}
