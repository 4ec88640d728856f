use std::sync::Arc;

use anyhow::{Context, Result};
use iatro_reasoning::{
    Answer, DiagnosisEngine, DiseaseId, EngineConfig, EvidenceIndex, PhenotypeId, Progress,
    ReasoningTelemetry, SessionStatus, TerminationReason, Turn,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::{
    helper::SimulationTelemetry, methods::ScenarioStrategy, scenario_generator::Scenario,
};

/// Action taken at a trajectory sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "phenotype", rename_all = "snake_case")]
pub enum SimulatedAction {
    /// Session start.
    Start,
    /// A prescribed phenotype was confirmed.
    Confirm(PhenotypeId),
    /// No prescribed phenotype was on offer.
    NoneOfThese,
}

/// Snapshot after each step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    /// Accepted actions so far.
    pub step: u32,
    /// Current leader.
    pub leader: Option<DiseaseId>,
    /// Leader posterior.
    pub leader_posterior: f64,
    /// Target posterior.
    pub target_posterior: f64,
    /// Action that produced this sample.
    pub action: SimulatedAction,
}

/// Outcome of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario id.
    pub scenario_id: Uuid,
    /// Scenario label.
    pub label: String,
    /// Target disease.
    pub target: DiseaseId,
    /// Target display name.
    pub target_name: String,
    /// Ordering strategy.
    pub strategy: ScenarioStrategy,
    /// Converged on the target.
    pub converged: bool,
    /// Terminal status.
    pub status: SessionStatus,
    /// Why the run ended.
    pub termination_reason: TerminationReason,
    /// Accepted actions.
    pub steps: u32,
    /// Final leader.
    pub leader: Option<DiseaseId>,
    /// Final leader name.
    pub leader_name: Option<String>,
    /// Final leader posterior.
    pub leader_posterior: f64,
    /// Final target posterior.
    pub target_posterior: f64,
    /// Final leader posterior when converged, else the target's.
    pub confidence: f64,
    /// Leader evidence hits.
    pub hit_count: u32,
    /// Hits the leader needed.
    pub required_hits: u32,
    /// Phenotypes confirmed, in order.
    pub confirmed_path: Vec<PhenotypeId>,
    /// Steps answered with "none of these".
    pub none_steps: u32,
    /// One sample per step, starting at step 0.
    pub trajectory: Vec<TrajectorySample>,
}

impl ScenarioResult {
    /// Failure bucket, `None` for runs that converged on the target.
    #[must_use]
    pub fn failure_mode(&self) -> Option<&'static str> {
        if self.converged {
            return None;
        }
        Some(match self.termination_reason {
            TerminationReason::Converged => "converged_wrong_disease",
            other => other.label(),
        })
    }

    /// Target posterior at every sample.
    #[must_use]
    pub fn target_series(&self) -> Vec<f64> {
        self.trajectory.iter().map(|s| s.target_posterior).collect()
    }
}

/// Drives the engine through one scenario.
pub fn run_scenario(engine: &DiagnosisEngine, scenario: &Scenario) -> ScenarioResult {
    let index = engine.index();
    let mut session = engine.start_session_with_step_budget(scenario.max_steps);
    let sample = |state: &iatro_reasoning::SessionState, action| {
        let leader = state.ranking().first().copied();
        TrajectorySample {
            step: state.step(),
            leader: leader.map(|(d, _)| d),
            leader_posterior: leader.map_or(0.0, |(_, p)| p),
            target_posterior: state.posterior(scenario.target),
            action,
        }
    };
    let mut trajectory = vec![sample(session.state(), SimulatedAction::Start)];
    let mut cursor = 0;
    let mut none_steps = 0;

    let diagnosis = loop {
        let question = match session.next_question() {
            Turn::Ask(question) => question,
            Turn::Finished(diagnosis) => break diagnosis,
        };
        while cursor < scenario.sequence.len()
            && session.state().is_asked(scenario.sequence[cursor])
        {
            cursor += 1;
        }
        let offered = scenario
            .sequence
            .get(cursor)
            .copied()
            .filter(|p| question.candidates.iter().any(|c| c.phenotype == *p));
        let (answer, action) = match offered {
            Some(phenotype) => (Answer::Confirm(phenotype), SimulatedAction::Confirm(phenotype)),
            None => {
                none_steps += 1;
                (Answer::NoneOfThese, SimulatedAction::NoneOfThese)
            }
        };
        match session.answer(answer) {
            Ok(Progress::Updated { .. }) => trajectory.push(sample(session.state(), action)),
            Ok(Progress::Finished(diagnosis)) => {
                trajectory.push(sample(session.state(), action));
                break diagnosis;
            }
            // Answers only name indexed phenotypes and the loop stops at the first terminal state.
            Err(_) => break session.diagnosis(),
        }
    };

    let state = session.state();
    let target_posterior = state.posterior(scenario.target);
    let converged =
        diagnosis.status == SessionStatus::Converged && diagnosis.disease == Some(scenario.target);
    ScenarioResult {
        scenario_id: scenario.id,
        label: scenario.label.clone(),
        target: scenario.target,
        target_name: scenario.target_name.clone(),
        strategy: scenario.strategy,
        converged,
        status: diagnosis.status,
        termination_reason: diagnosis.reason,
        steps: diagnosis.step_count,
        leader: diagnosis.disease,
        leader_name: diagnosis
            .disease
            .and_then(|d| index.disease(d))
            .map(|d| d.name.clone()),
        leader_posterior: diagnosis.final_posterior,
        target_posterior,
        confidence: if converged {
            diagnosis.final_posterior
        } else {
            target_posterior
        },
        hit_count: diagnosis.hit_count,
        required_hits: diagnosis.required_hits,
        confirmed_path: state.path().to_vec(),
        none_steps,
        trajectory,
    }
}

/// Runs scenario batches concurrently against one shared index.
pub struct Simulator {
    index: Arc<EvidenceIndex>,
    config: EngineConfig,
    reasoning: Option<ReasoningTelemetry>,
    telemetry: Option<SimulationTelemetry>,
}

impl Simulator {
    /// Creates a simulator.
    #[must_use]
    pub const fn new(
        index: Arc<EvidenceIndex>,
        config: EngineConfig,
        telemetry: Option<SimulationTelemetry>,
    ) -> Self {
        Self {
            index,
            config,
            reasoning: None,
            telemetry,
        }
    }

    /// Telemetry passed to every engine session.
    #[must_use]
    pub fn with_reasoning_telemetry(mut self, telemetry: ReasoningTelemetry) -> Self {
        self.reasoning = Some(telemetry);
        self
    }

    /// Runs every scenario on blocking workers and returns results in input order.
    pub async fn run(&self, scenarios: Vec<Scenario>) -> Result<Vec<ScenarioResult>> {
        let mut engine = DiagnosisEngine::new(Arc::clone(&self.index), self.config.clone())
            .context("invalid engine configuration")?;
        if let Some(tel) = &self.reasoning {
            engine = engine.with_telemetry(tel.clone());
        }
        let engine = Arc::new(engine);
        self.log(
            LogLevel::Info,
            "simulation.batch.started",
            json!({ "scenarios": scenarios.len() }),
        );

        let total = scenarios.len();
        let mut workers = JoinSet::new();
        for (position, scenario) in scenarios.into_iter().enumerate() {
            let engine = Arc::clone(&engine);
            workers.spawn_blocking(move || (position, run_scenario(&engine, &scenario)));
        }
        let mut slots: Vec<Option<ScenarioResult>> = vec![None; total];
        while let Some(joined) = workers.join_next().await {
            let (position, result) = joined.context("scenario worker failed")?;
            self.log(
                LogLevel::Debug,
                "simulation.scenario.completed",
                json!({
                    "scenario_id": result.scenario_id,
                    "label": result.label,
                    "converged": result.converged,
                    "steps": result.steps,
                }),
            );
            slots[position] = Some(result);
        }
        let results: Vec<ScenarioResult> = slots.into_iter().flatten().collect();

        if let Some(tel) = &self.telemetry {
            let _ = tel.event(
                "simulation.batch.completed",
                json!({
                    "scenarios": results.len(),
                    "converged": results.iter().filter(|r| r.converged).count(),
                }),
            );
        }
        Ok(results)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}
