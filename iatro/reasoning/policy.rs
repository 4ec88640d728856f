use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    index::EvidenceIndex,
    knowledge::DiseaseId,
    session::SessionState,
};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Still asking.
    Active,
    /// Leader met every convergence criterion.
    Converged,
    /// Ended without convergence; the leader is a best guess.
    Inconclusive,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Confidence, evidence hits and gap all satisfied.
    Converged,
    /// Action budget exhausted.
    MaxSteps,
    /// The selector had nothing left to ask.
    NoCandidates,
    /// The leader stopped gaining.
    Stalled,
    /// The user quit.
    Quit,
}

impl TerminationReason {
    /// Stable label used in reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::MaxSteps => "max_steps",
            Self::NoCandidates => "no_candidates",
            Self::Stalled => "stalled",
            Self::Quit => "quit",
        }
    }

    const fn status(self) -> SessionStatus {
        match self {
            Self::Converged => SessionStatus::Converged,
            _ => SessionStatus::Inconclusive,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal output of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Leading disease, `None` only for an empty index.
    pub disease: Option<DiseaseId>,
    /// Its display name.
    pub name: Option<String>,
    /// Its posterior at termination.
    pub final_posterior: f64,
    /// Accepted actions.
    pub step_count: u32,
    /// Evidence hits of the leader.
    pub hit_count: u32,
    /// Hits the leader needed to converge.
    pub required_hits: u32,
    /// Leader minus runner-up.
    pub gap: f64,
    /// Why the session ended.
    pub reason: TerminationReason,
    /// Terminal status.
    pub status: SessionStatus,
}

impl Diagnosis {
    /// Whether the session converged.
    #[must_use]
    pub fn is_confident(&self) -> bool {
        self.status == SessionStatus::Converged
    }
}

/// Convergence state machine. Terminal states are sticky.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergencePolicy {
    confidence_threshold: f64,
    min_evidence_hits: u32,
    dynamic_evidence_hits: bool,
    min_gap: f64,
    max_steps: u32,
    stall_limit: Option<u32>,
    stall_min_gain: f64,
    status: SessionStatus,
    reason: Option<TerminationReason>,
    last_leader_posterior: Option<f64>,
    low_gain_run: u32,
}

impl ConvergencePolicy {
    /// Creates an active policy.
    #[must_use]
    pub const fn new(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            min_evidence_hits: config.min_evidence_hits,
            dynamic_evidence_hits: config.dynamic_evidence_hits,
            min_gap: config.min_gap,
            max_steps: config.max_steps,
            stall_limit: config.stall_limit,
            stall_min_gain: config.stall_min_gain,
            status: SessionStatus::Active,
            reason: None,
            last_leader_posterior: None,
            low_gain_run: 0,
        }
    }

    /// Replaces the step budget. Zero is raised to one.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Termination reason once terminal.
    #[must_use]
    pub const fn reason(&self) -> Option<TerminationReason> {
        self.reason
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status != SessionStatus::Active
    }

    /// Hits the disease needs before it may converge.
    #[must_use]
    pub fn required_hits(&self, index: &EvidenceIndex, disease: DiseaseId) -> u32 {
        if !self.dynamic_evidence_hits {
            return self.min_evidence_hits;
        }
        match index.positive_evidence_count(disease) {
            0..=2 => 1,
            3..=5 => 2,
            _ => 3,
        }
    }

    /// Evaluates the state after a confirm or "none" action. Returns the new status.
    pub fn evaluate(&mut self, index: &EvidenceIndex, state: &SessionState) -> SessionStatus {
        self.assess(index, state, true)
    }

    /// Evaluates the state after a skip. Convergence and the step budget are checked; the
    /// low-gain run and the last leader posterior are left as they were.
    pub fn evaluate_skip(&mut self, index: &EvidenceIndex, state: &SessionState) -> SessionStatus {
        self.assess(index, state, false)
    }

    fn assess(
        &mut self,
        index: &EvidenceIndex,
        state: &SessionState,
        track_stall: bool,
    ) -> SessionStatus {
        if self.is_terminal() {
            return self.status;
        }
        let Some(((leader, posterior), _)) = state.leader_and_runner_up() else {
            return self.finish(TerminationReason::NoCandidates);
        };
        let gap = state.leader_gap();
        if posterior >= self.confidence_threshold
            && state.hit_count(leader) >= self.required_hits(index, leader)
            && gap >= self.min_gap
        {
            return self.finish(TerminationReason::Converged);
        }
        if state.step() >= self.max_steps {
            return self.finish(TerminationReason::MaxSteps);
        }
        if !track_stall {
            return self.status;
        }
        if let Some(limit) = self.stall_limit {
            let gain = self
                .last_leader_posterior
                .map_or(f64::INFINITY, |last| posterior - last);
            if gain < self.stall_min_gain {
                self.low_gain_run += 1;
            } else {
                self.low_gain_run = 0;
            }
            if self.low_gain_run >= limit {
                return self.finish(TerminationReason::Stalled);
            }
        }
        self.last_leader_posterior = Some(posterior);
        self.status
    }

    /// Records the starting leader posterior so the first action's gain can be measured.
    pub fn observe_start(&mut self, state: &SessionState) {
        self.last_leader_posterior = state.ranking().first().map(|(_, p)| *p);
    }

    /// Ends the session for a reason decided outside the state machine.
    pub fn force(&mut self, reason: TerminationReason) -> SessionStatus {
        if self.is_terminal() {
            return self.status;
        }
        self.finish(reason)
    }

    /// Builds the terminal output from the current state.
    #[must_use]
    pub fn diagnosis(&self, index: &EvidenceIndex, state: &SessionState) -> Diagnosis {
        let leader = state.ranking().first().copied();
        let disease = leader.map(|(id, _)| id);
        Diagnosis {
            disease,
            name: disease
                .and_then(|id| index.disease(id))
                .map(|d| d.name.clone()),
            final_posterior: leader.map_or(0.0, |(_, p)| p),
            step_count: state.step(),
            hit_count: disease.map_or(0, |id| state.hit_count(id)),
            required_hits: disease.map_or(self.min_evidence_hits, |id| {
                self.required_hits(index, id)
            }),
            gap: state.leader_gap(),
            reason: self.reason.unwrap_or(TerminationReason::Quit),
            status: self.status,
        }
    }

    fn finish(&mut self, reason: TerminationReason) -> SessionStatus {
        self.reason = Some(reason);
        self.status = reason.status();
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeBase;

    fn index() -> EvidenceIndex {
        let kb = KnowledgeBase::default()
            .disease(1, "A", 0.5)
            .disease(2, "B", 0.1)
            .phenotype(1, "X", None)
            .lr(1, 1, 5.0);
        EvidenceIndex::build(&kb).unwrap()
    }

    #[test]
    fn converges_only_when_every_criterion_holds() {
        let index = index();
        let mut policy = ConvergencePolicy::new(&EngineConfig::default());
        let mut state = SessionState::new(&index, 1e-9);
        state.set_posterior(DiseaseId(1), 0.95);
        state.record_hit(DiseaseId(1));
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Active);

        state.record_hit(DiseaseId(1));
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Converged);
        let diagnosis = policy.diagnosis(&index, &state);
        assert_eq!(diagnosis.disease, Some(DiseaseId(1)));
        assert_eq!(diagnosis.reason, TerminationReason::Converged);
        assert_eq!(diagnosis.hit_count, 2);
        assert!(diagnosis.is_confident());
    }

    #[test]
    fn terminal_state_is_sticky() {
        let index = index();
        let config = EngineConfig {
            max_steps: 1,
            ..EngineConfig::default()
        };
        let mut policy = ConvergencePolicy::new(&config);
        let mut state = SessionState::new(&index, 1e-9);
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Inconclusive);
        assert_eq!(policy.reason(), Some(TerminationReason::MaxSteps));

        state.set_posterior(DiseaseId(1), 0.99);
        state.record_hit(DiseaseId(1));
        state.record_hit(DiseaseId(1));
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Inconclusive);
        assert_eq!(policy.force(TerminationReason::Quit), SessionStatus::Inconclusive);
        assert_eq!(policy.reason(), Some(TerminationReason::MaxSteps));
    }

    #[test]
    fn stalls_after_consecutive_low_gain_actions() {
        let index = index();
        let config = EngineConfig {
            stall_limit: Some(2),
            ..EngineConfig::default()
        };
        let mut policy = ConvergencePolicy::new(&config);
        let mut state = SessionState::new(&index, 1e-9);
        policy.observe_start(&state);

        state.set_posterior(DiseaseId(1), 0.7);
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Active);
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Active);
        state.set_posterior(DiseaseId(1), 0.71);
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Inconclusive);
        assert_eq!(policy.reason(), Some(TerminationReason::Stalled));
    }

    #[test]
    fn skips_never_count_towards_a_stall() {
        let index = index();
        let config = EngineConfig {
            stall_limit: Some(2),
            max_steps: 10,
            ..EngineConfig::default()
        };
        let mut policy = ConvergencePolicy::new(&config);
        let mut state = SessionState::new(&index, 1e-9);
        policy.observe_start(&state);
        for _ in 0..5 {
            state.advance();
            assert_eq!(policy.evaluate_skip(&index, &state), SessionStatus::Active);
        }
        // The first flat "none" after the skips starts the low-gain run at one.
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Active);
        state.advance();
        assert_eq!(policy.evaluate(&index, &state), SessionStatus::Inconclusive);
        assert_eq!(policy.reason(), Some(TerminationReason::Stalled));
    }

    #[test]
    fn skip_still_respects_the_step_budget() {
        let index = index();
        let config = EngineConfig {
            stall_limit: Some(1),
            max_steps: 2,
            ..EngineConfig::default()
        };
        let mut policy = ConvergencePolicy::new(&config);
        let mut state = SessionState::new(&index, 1e-9);
        policy.observe_start(&state);
        state.advance();
        assert_eq!(policy.evaluate_skip(&index, &state), SessionStatus::Active);
        state.advance();
        assert_eq!(policy.evaluate_skip(&index, &state), SessionStatus::Inconclusive);
        assert_eq!(policy.reason(), Some(TerminationReason::MaxSteps));
    }

    #[test]
    fn dynamic_hits_follow_evidence_count() {
        let index = index();
        let config = EngineConfig {
            dynamic_evidence_hits: true,
            ..EngineConfig::default()
        };
        let policy = ConvergencePolicy::new(&config);
        assert_eq!(policy.required_hits(&index, DiseaseId(1)), 1);
        let fixed = ConvergencePolicy::new(&EngineConfig::default());
        assert_eq!(fixed.required_hits(&index, DiseaseId(1)), 2);
    }
}
