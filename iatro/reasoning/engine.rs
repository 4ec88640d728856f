use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::{ConfigError, EngineConfig},
    index::EvidenceIndex,
    knowledge::PhenotypeId,
    policy::{ConvergencePolicy, Diagnosis, SessionStatus, TerminationReason},
    selector::{Candidate, QuestionSelector, Selection},
    session::{SessionState, Standing},
    telemetry::ReasoningTelemetry,
    updater::{PosteriorUpdater, UpdateReport},
};

/// Leaderboard rows attached to questions and progress reports.
pub const LEADERBOARD_SIZE: usize = 5;

/// Immutable prompt handed to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Accepted actions so far.
    pub step: u32,
    /// Ranked candidates, best first.
    pub candidates: Vec<Candidate>,
    /// Current leaders.
    pub leaderboard: Vec<Standing>,
    /// Whether the candidates come from the unfiltered fallback ranking.
    pub fallback: bool,
}

/// The single reply accepted per question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "phenotype", rename_all = "snake_case")]
pub enum Answer {
    /// The phenotype is present.
    Confirm(PhenotypeId),
    /// The user declines to answer about this phenotype.
    Skip(PhenotypeId),
    /// None of the displayed candidates is present.
    NoneOfThese,
    /// Stop the session.
    Quit,
}

/// What the session wants next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "turn", rename_all = "snake_case")]
pub enum Turn {
    /// Ask a question.
    Ask(Question),
    /// The session is over.
    Finished(Diagnosis),
}

/// Outcome of an accepted answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "progress", rename_all = "snake_case")]
pub enum Progress {
    /// The session continues.
    Updated {
        /// Current leaders.
        leaderboard: Vec<Standing>,
        /// Posterior changes, present only for a first confirmation.
        update: Option<UpdateReport>,
    },
    /// The answer ended the session.
    Finished(Diagnosis),
}

/// Recoverable answer rejection; the session is left unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session already reached a terminal state.
    #[error("session already finished")]
    Finished,
    /// The answer names a phenotype absent from the index.
    #[error("unknown phenotype {0}")]
    UnknownPhenotype(PhenotypeId),
}

/// Shared entry point: one index, many sessions.
#[derive(Debug, Clone)]
pub struct DiagnosisEngine {
    index: Arc<EvidenceIndex>,
    config: EngineConfig,
    telemetry: Option<ReasoningTelemetry>,
}

impl DiagnosisEngine {
    /// Creates an engine after validating the configuration.
    pub fn new(index: Arc<EvidenceIndex>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            index,
            config,
            telemetry: None,
        })
    }

    /// Attaches telemetry inherited by every session.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ReasoningTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Shared index.
    #[must_use]
    pub fn index(&self) -> &Arc<EvidenceIndex> {
        &self.index
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a session seeded from the priors.
    #[must_use]
    pub fn start_session(&self) -> DiagnosisSession {
        self.start_session_with_step_budget(self.config.max_steps)
    }

    /// Starts a session that ends inconclusive after `max_steps` actions instead of the
    /// configured budget.
    #[must_use]
    pub fn start_session_with_step_budget(&self, max_steps: u32) -> DiagnosisSession {
        let state = SessionState::new(&self.index, self.config.epsilon);
        let mut policy = ConvergencePolicy::new(&self.config).with_max_steps(max_steps);
        policy.observe_start(&state);
        let session = DiagnosisSession {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            index: Arc::clone(&self.index),
            selector: QuestionSelector::new(&self.config),
            updater: PosteriorUpdater::new(&self.config),
            policy,
            state,
            displayed: None,
            telemetry: self.telemetry.clone(),
        };
        session.log(
            LogLevel::Info,
            "reasoning.session.started",
            json!({
                "session_id": session.id,
                "diseases": self.index.disease_count(),
                "top_k": self.config.top_k,
                "max_steps": max_steps,
            }),
        );
        session
    }
}

/// One conversation. Owns its state; shares the index.
#[derive(Debug, Clone)]
pub struct DiagnosisSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    index: Arc<EvidenceIndex>,
    selector: QuestionSelector,
    updater: PosteriorUpdater,
    policy: ConvergencePolicy,
    state: SessionState,
    displayed: Option<Selection>,
    telemetry: Option<ReasoningTelemetry>,
}

impl DiagnosisSession {
    /// Session id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.policy.status()
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.policy.is_terminal()
    }

    /// Current leaders.
    #[must_use]
    pub fn leaderboard(&self) -> Vec<Standing> {
        self.state.leaderboard(&self.index, LEADERBOARD_SIZE)
    }

    /// Terminal output. While still active the leader is reported as if the user quit.
    #[must_use]
    pub fn diagnosis(&self) -> Diagnosis {
        self.policy.diagnosis(&self.index, &self.state)
    }

    /// Produces the next question, or the diagnosis once the session is over.
    ///
    /// An empty ranking even after fallback ends the session as inconclusive.
    pub fn next_question(&mut self) -> Turn {
        if self.policy.is_terminal() {
            return Turn::Finished(self.diagnosis());
        }
        let selection = self.selector.select(&self.index, &self.state);
        if selection.is_empty() {
            self.policy.force(TerminationReason::NoCandidates);
            return Turn::Finished(self.conclude());
        }
        self.log(
            LogLevel::Debug,
            "reasoning.selector.ranked",
            json!({
                "session_id": self.id,
                "step": self.state.step(),
                "candidates": selection.candidates.len(),
                "fallback": selection.fallback,
            }),
        );
        let question = Question {
            step: self.state.step(),
            candidates: selection.candidates.clone(),
            leaderboard: self.leaderboard(),
            fallback: selection.fallback,
        };
        self.displayed = Some(selection);
        Turn::Ask(question)
    }

    /// Applies one answer.
    pub fn answer(&mut self, answer: Answer) -> Result<Progress, SessionError> {
        if self.policy.is_terminal() {
            return Err(SessionError::Finished);
        }
        let skipped = matches!(answer, Answer::Skip(_));
        let update = match answer {
            Answer::Confirm(phenotype) => {
                self.ensure_known(phenotype)?;
                if self.state.confirm(phenotype) {
                    let report = self.updater.apply(&self.index, &mut self.state, phenotype);
                    self.log(
                        LogLevel::Debug,
                        "reasoning.posterior.updated",
                        json!({
                            "session_id": self.id,
                            "phenotype": phenotype,
                            "diseases": report.changes.len(),
                        }),
                    );
                    Some(report)
                } else {
                    None
                }
            }
            Answer::Skip(phenotype) => {
                self.ensure_known(phenotype)?;
                self.state.skip(phenotype);
                None
            }
            Answer::NoneOfThese => {
                let shown = match self.displayed.take() {
                    Some(selection) => selection,
                    None => self.selector.select(&self.index, &self.state),
                };
                self.state
                    .skip_all(shown.candidates.into_iter().map(|c| c.phenotype));
                None
            }
            Answer::Quit => {
                self.policy.force(TerminationReason::Quit);
                return Ok(Progress::Finished(self.conclude()));
            }
        };
        self.displayed = None;
        self.state.advance();
        let status = if skipped {
            self.policy.evaluate_skip(&self.index, &self.state)
        } else {
            self.policy.evaluate(&self.index, &self.state)
        };
        if status == SessionStatus::Active {
            Ok(Progress::Updated {
                leaderboard: self.leaderboard(),
                update,
            })
        } else {
            Ok(Progress::Finished(self.conclude()))
        }
    }

    fn ensure_known(&self, phenotype: PhenotypeId) -> Result<(), SessionError> {
        if self.index.phenotype(phenotype).is_some() {
            Ok(())
        } else {
            Err(SessionError::UnknownPhenotype(phenotype))
        }
    }

    fn conclude(&self) -> Diagnosis {
        let diagnosis = self.diagnosis();
        let event = if diagnosis.is_confident() {
            "reasoning.session.converged"
        } else {
            "reasoning.session.inconclusive"
        };
        let payload = json!({
            "session_id": self.id,
            "disease": diagnosis.disease,
            "posterior": diagnosis.final_posterior,
            "steps": diagnosis.step_count,
            "reason": diagnosis.reason,
        });
        self.log(LogLevel::Info, event, payload.clone());
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event, payload);
        }
        diagnosis
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BoostConfig,
        knowledge::{DiseaseId, KnowledgeBase},
    };
    use shared_logging::EventJournal;

    fn toy() -> Arc<EvidenceIndex> {
        let kb = KnowledgeBase::default()
            .disease(1, "A", 0.5)
            .disease(2, "B", 0.5)
            .phenotype(1, "X", None)
            .phenotype(2, "Y", None)
            .lr(1, 1, 6.0)
            .lr(2, 1, 1.0)
            .lr(2, 2, 8.0);
        Arc::new(EvidenceIndex::build(&kb).unwrap())
    }

    fn three_disease() -> Arc<EvidenceIndex> {
        let kb = KnowledgeBase::default()
            .disease(1, "D1", 0.3)
            .disease(2, "D2", 0.3)
            .disease(3, "D3", 0.3)
            .phenotype(1, "P1", None)
            .phenotype(2, "P2", None)
            .phenotype(3, "P3", None)
            .phenotype(4, "P4", None)
            .phenotype(5, "P5", None)
            .lr(1, 1, 10.0)
            .lr(1, 2, 6.0)
            .lr(1, 3, 3.5)
            .lr(2, 2, 2.0)
            .lr(2, 4, 5.0)
            .lr(3, 3, 2.0)
            .lr(3, 5, 4.0);
        Arc::new(EvidenceIndex::build(&kb).unwrap())
    }

    fn pure_config() -> EngineConfig {
        EngineConfig {
            boosts: BoostConfig::disabled(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn confirm_updates_and_repeat_is_noop() {
        let engine = DiagnosisEngine::new(toy(), pure_config()).unwrap();
        let mut session = engine.start_session();
        let Turn::Ask(question) = session.next_question() else {
            panic!("expected a question");
        };
        assert_eq!(question.step, 0);
        assert_eq!(question.leaderboard.len(), 2);

        let progress = session.answer(Answer::Confirm(PhenotypeId(1))).unwrap();
        let Progress::Updated { update, .. } = progress else {
            panic!("session ended early");
        };
        assert!(update.is_some());
        let after_first = session.state().posteriors().clone();
        assert!((after_first[&DiseaseId(1)] - 6.0 / 7.0).abs() < 1e-9);

        let Progress::Updated { update, .. } =
            session.answer(Answer::Confirm(PhenotypeId(1))).unwrap()
        else {
            panic!("session ended early");
        };
        assert!(update.is_none());
        assert_eq!(session.state().posteriors(), &after_first);
        assert_eq!(session.state().step(), 2);
    }

    #[test]
    fn skip_and_none_leave_posteriors_alone() {
        let engine = DiagnosisEngine::new(toy(), pure_config()).unwrap();
        let mut session = engine.start_session();
        let before = session.state().posteriors().clone();
        session.answer(Answer::Skip(PhenotypeId(2))).unwrap();
        let Turn::Ask(question) = session.next_question() else {
            panic!("expected a question");
        };
        assert_eq!(question.candidates[0].phenotype, PhenotypeId(1));
        session.answer(Answer::NoneOfThese).unwrap();
        assert_eq!(session.state().posteriors(), &before);
        assert!(session.state().is_asked(PhenotypeId(1)));

        assert!(matches!(session.next_question(), Turn::Finished(d)
            if d.reason == TerminationReason::NoCandidates));
    }

    #[test]
    fn rejects_unknown_phenotypes_and_answers_after_finish() {
        let engine = DiagnosisEngine::new(toy(), pure_config()).unwrap();
        let mut session = engine.start_session();
        let err = session.answer(Answer::Confirm(PhenotypeId(99))).unwrap_err();
        assert_eq!(err, SessionError::UnknownPhenotype(PhenotypeId(99)));
        assert_eq!(session.state().step(), 0);

        let Progress::Finished(diagnosis) = session.answer(Answer::Quit).unwrap() else {
            panic!("quit should finish");
        };
        assert_eq!(diagnosis.reason, TerminationReason::Quit);
        assert_eq!(diagnosis.status, SessionStatus::Inconclusive);
        assert_eq!(
            session.answer(Answer::Skip(PhenotypeId(1))).unwrap_err(),
            SessionError::Finished
        );
    }

    #[test]
    fn strongest_path_converges() {
        let journal = EventJournal::new(8);
        let telemetry = ReasoningTelemetry::builder("reasoning")
            .journal(journal.clone())
            .build()
            .unwrap();
        let engine = DiagnosisEngine::new(three_disease(), EngineConfig::simulation())
            .unwrap()
            .with_telemetry(telemetry);
        let mut session = engine.start_session();
        let mut finished = None;
        for phenotype in [1, 2, 3] {
            if let Progress::Finished(d) =
                session.answer(Answer::Confirm(PhenotypeId(phenotype))).unwrap()
            {
                finished = Some(d);
                break;
            }
        }
        let diagnosis = finished.expect("should converge");
        assert_eq!(diagnosis.disease, Some(DiseaseId(1)));
        assert_eq!(diagnosis.status, SessionStatus::Converged);
        assert!(diagnosis.final_posterior >= 0.9);
        assert!(diagnosis.gap >= 0.15);
        assert!(diagnosis.step_count <= 3);
        let events = journal.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "reasoning.session.converged");
    }

    #[test]
    fn max_steps_ends_inconclusive() {
        let config = EngineConfig {
            max_steps: 1,
            ..pure_config()
        };
        let engine = DiagnosisEngine::new(toy(), config).unwrap();
        let mut session = engine.start_session();
        let Progress::Finished(diagnosis) = session.answer(Answer::Skip(PhenotypeId(2))).unwrap()
        else {
            panic!("budget should end the session");
        };
        assert_eq!(diagnosis.reason, TerminationReason::MaxSteps);
        assert_eq!(diagnosis.step_count, 1);
        assert!(session.is_finished());
    }

    #[test]
    fn step_budget_override_replaces_the_configured_one() {
        let engine = DiagnosisEngine::new(toy(), pure_config()).unwrap();
        let mut session = engine.start_session_with_step_budget(2);
        assert!(matches!(
            session.answer(Answer::Skip(PhenotypeId(2))).unwrap(),
            Progress::Updated { .. }
        ));
        let Progress::Finished(diagnosis) = session.answer(Answer::NoneOfThese).unwrap() else {
            panic!("the overridden budget should end the session");
        };
        assert_eq!(diagnosis.reason, TerminationReason::MaxSteps);
        assert_eq!(diagnosis.step_count, 2);
    }

    #[test]
    fn repeated_skips_keep_an_interactive_session_open() {
        let engine = DiagnosisEngine::new(three_disease(), EngineConfig::interactive()).unwrap();
        let mut session = engine.start_session();
        for phenotype in [4, 5, 3, 2] {
            let progress = session.answer(Answer::Skip(PhenotypeId(phenotype))).unwrap();
            assert!(matches!(progress, Progress::Updated { .. }));
        }
        assert!(!session.is_finished());
        assert_eq!(session.state().step(), 4);
    }
}
