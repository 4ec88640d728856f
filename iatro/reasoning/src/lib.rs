#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Interactive diagnostic reasoning: evidence index, question selection, posterior updates
//! and convergence.

/// Knowledge-store records and loaders.
#[path = "../knowledge.rs"]
pub mod knowledge;

/// Keyword rules for phenotype clusters.
#[path = "../clusters.rs"]
pub mod clusters;

/// Read-only evidence index.
#[path = "../index.rs"]
pub mod index;

/// Engine configuration.
#[path = "../config.rs"]
pub mod config;

/// Per-session state.
#[path = "../session.rs"]
pub mod session;

/// Question ranking.
#[path = "../selector.rs"]
pub mod selector;

/// Boosted Bayesian update.
#[path = "../updater.rs"]
pub mod updater;

/// Convergence state machine.
#[path = "../policy.rs"]
pub mod policy;

/// Question/answer protocol.
#[path = "../engine.rs"]
pub mod engine;

/// Telemetry builder/hook for reasoning components.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use config::{BoostConfig, ConfigError, EngineConfig};
pub use engine::{
    Answer, DiagnosisEngine, DiagnosisSession, Progress, Question, SessionError, Turn,
};
pub use index::{BuildDiagnostics, EvidenceIndex, IndexError, IndexOptions};
pub use knowledge::{DiseaseId, KnowledgeBase, KnowledgeError, PhenotypeId};
pub use policy::{ConvergencePolicy, Diagnosis, SessionStatus, TerminationReason};
pub use selector::{Candidate, QuestionSelector, Selection};
pub use session::{SessionState, Standing};
pub use telemetry::{ReasoningTelemetry, ReasoningTelemetryBuilder};
pub use updater::{PosteriorChange, PosteriorUpdater, UpdateReport};
