use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    index::EvidenceIndex,
    knowledge::{DiseaseId, PhenotypeId},
};

/// One row of the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    /// Disease.
    pub disease: DiseaseId,
    /// Display name.
    pub name: String,
    /// Current posterior.
    pub posterior: f64,
    /// Evidence hits so far.
    pub hits: u32,
    /// Ordinal urgency.
    pub triage_severity: u8,
}

/// Per-conversation record. Created at session start, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    confirmed: BTreeSet<PhenotypeId>,
    asked: BTreeSet<PhenotypeId>,
    path: Vec<PhenotypeId>,
    posteriors: BTreeMap<DiseaseId, f64>,
    hit_count: BTreeMap<DiseaseId, u32>,
    step: u32,
}

impl SessionState {
    /// Seeds posteriors from the priors, clipped to `[epsilon, 1 - epsilon]`.
    #[must_use]
    pub fn new(index: &EvidenceIndex, epsilon: f64) -> Self {
        let posteriors = index
            .diseases()
            .map(|d| (d.id, d.prior.clamp(epsilon, 1.0 - epsilon)))
            .collect();
        Self {
            confirmed: BTreeSet::new(),
            asked: BTreeSet::new(),
            path: Vec::new(),
            posteriors,
            hit_count: BTreeMap::new(),
            step: 0,
        }
    }

    /// Marks a phenotype as confirmed and asked. Returns `false` when it was already confirmed.
    pub fn confirm(&mut self, phenotype: PhenotypeId) -> bool {
        self.asked.insert(phenotype);
        let fresh = self.confirmed.insert(phenotype);
        if fresh {
            self.path.push(phenotype);
        }
        fresh
    }

    /// Marks a phenotype as asked without touching any posterior.
    pub fn skip(&mut self, phenotype: PhenotypeId) {
        self.asked.insert(phenotype);
    }

    /// Marks every displayed candidate as asked.
    pub fn skip_all(&mut self, phenotypes: impl IntoIterator<Item = PhenotypeId>) {
        self.asked.extend(phenotypes);
    }

    /// Counts one accepted action.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Confirmed phenotypes.
    #[must_use]
    pub const fn confirmed(&self) -> &BTreeSet<PhenotypeId> {
        &self.confirmed
    }

    /// Asked phenotypes, confirmed ones included.
    #[must_use]
    pub const fn asked(&self) -> &BTreeSet<PhenotypeId> {
        &self.asked
    }

    /// Confirmed phenotypes in confirmation order.
    #[must_use]
    pub fn path(&self) -> &[PhenotypeId] {
        &self.path
    }

    /// Whether the phenotype was asked.
    #[must_use]
    pub fn is_asked(&self, phenotype: PhenotypeId) -> bool {
        self.asked.contains(&phenotype)
    }

    /// Whether the phenotype was confirmed.
    #[must_use]
    pub fn is_confirmed(&self, phenotype: PhenotypeId) -> bool {
        self.confirmed.contains(&phenotype)
    }

    /// Current posterior, `0.0` for unknown diseases.
    #[must_use]
    pub fn posterior(&self, disease: DiseaseId) -> f64 {
        self.posteriors.get(&disease).copied().unwrap_or(0.0)
    }

    /// All posteriors in ascending disease id order.
    #[must_use]
    pub const fn posteriors(&self) -> &BTreeMap<DiseaseId, f64> {
        &self.posteriors
    }

    pub(crate) fn set_posterior(&mut self, disease: DiseaseId, posterior: f64) {
        self.posteriors.insert(disease, posterior);
    }

    /// Evidence hits recorded for a disease.
    #[must_use]
    pub fn hit_count(&self, disease: DiseaseId) -> u32 {
        self.hit_count.get(&disease).copied().unwrap_or(0)
    }

    pub(crate) fn record_hit(&mut self, disease: DiseaseId) {
        *self.hit_count.entry(disease).or_insert(0) += 1;
    }

    /// Accepted actions so far.
    #[must_use]
    pub const fn step(&self) -> u32 {
        self.step
    }

    /// Diseases ranked by descending posterior, ties by ascending id.
    #[must_use]
    pub fn ranking(&self) -> Vec<(DiseaseId, f64)> {
        let mut ranked: Vec<_> = self.posteriors.iter().map(|(d, p)| (*d, *p)).collect();
        // BTreeMap order is ascending id, so a stable sort keeps ties in id order.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// Leader and runner-up, if any.
    #[must_use]
    pub fn leader_and_runner_up(&self) -> Option<((DiseaseId, f64), Option<(DiseaseId, f64)>)> {
        let ranked = self.ranking();
        let mut iter = ranked.into_iter();
        let leader = iter.next()?;
        Some((leader, iter.next()))
    }

    /// Leader's posterior minus the runner-up's; the leader's posterior when it stands alone.
    #[must_use]
    pub fn leader_gap(&self) -> f64 {
        match self.leader_and_runner_up() {
            Some(((_, top), Some((_, second)))) => top - second,
            Some(((_, top), None)) => top,
            None => 0.0,
        }
    }

    /// Top `limit` standings with names from the index.
    #[must_use]
    pub fn leaderboard(&self, index: &EvidenceIndex, limit: usize) -> Vec<Standing> {
        self.ranking()
            .into_iter()
            .take(limit)
            .filter_map(|(disease, posterior)| {
                let info = index.disease(disease)?;
                Some(Standing {
                    disease,
                    name: info.name.clone(),
                    posterior,
                    hits: self.hit_count(disease),
                    triage_severity: info.triage_severity,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeBase;

    fn index() -> EvidenceIndex {
        let kb = KnowledgeBase::default()
            .disease(2, "B", 0.4)
            .disease(1, "A", 0.4)
            .disease(3, "C", 1.0)
            .phenotype(1, "X", None)
            .lr(1, 1, 3.0);
        EvidenceIndex::build(&kb).unwrap()
    }

    #[test]
    fn priors_are_clipped() {
        let state = SessionState::new(&index(), 1e-6);
        assert!((state.posterior(DiseaseId(3)) - (1.0 - 1e-6)).abs() < 1e-12);
        assert_eq!(state.step(), 0);
    }

    #[test]
    fn confirm_is_idempotent_and_skip_marks_asked() {
        let mut state = SessionState::new(&index(), 1e-9);
        assert!(state.confirm(PhenotypeId(1)));
        assert!(!state.confirm(PhenotypeId(1)));
        assert_eq!(state.path(), &[PhenotypeId(1)]);
        state.skip(PhenotypeId(2));
        assert!(state.is_asked(PhenotypeId(2)));
        assert!(!state.is_confirmed(PhenotypeId(2)));
        state.skip_all([PhenotypeId(3), PhenotypeId(4)]);
        assert_eq!(state.asked().len(), 4);
        assert_eq!(state.confirmed().len(), 1);
    }

    #[test]
    fn ranking_breaks_ties_by_id() {
        let state = SessionState::new(&index(), 1e-9);
        let ranked: Vec<_> = state.ranking().into_iter().map(|(d, _)| d).collect();
        assert_eq!(ranked, vec![DiseaseId(3), DiseaseId(1), DiseaseId(2)]);
        let board = state.leaderboard(&index(), 2);
        assert_eq!(board.len(), 2);
        assert_eq!(board[1].name, "A");
        assert!((state.leader_gap() - (1.0 - 1e-9 - 0.4)).abs() < 1e-9);
    }
}
