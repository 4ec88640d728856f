use std::fmt;

use serde::{Deserialize, Serialize};

/// How a scenario orders the phenotypes it will confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStrategy {
    /// Target phenotypes by descending LR.
    Optimal,
    /// Optimal order with competitor phenotypes mixed in.
    Suboptimal,
    /// Competitor phenotypes first.
    Adversarial,
    /// Uniform random permutation.
    Random,
    /// Round-robin across clusters.
    Diverse,
}

impl ScenarioStrategy {
    /// Every strategy, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Optimal,
        Self::Suboptimal,
        Self::Adversarial,
        Self::Random,
        Self::Diverse,
    ];

    /// Per-disease mix, cycled to the requested scenario count.
    pub const PLAN: [Self; 10] = [
        Self::Optimal,
        Self::Suboptimal,
        Self::Adversarial,
        Self::Random,
        Self::Diverse,
        Self::Suboptimal,
        Self::Random,
        Self::Suboptimal,
        Self::Diverse,
        Self::Random,
    ];

    /// Label for logging.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Optimal => "optimal",
            Self::Suboptimal => "suboptimal",
            Self::Adversarial => "adversarial",
            Self::Random => "random",
            Self::Diverse => "diverse",
        }
    }

    /// Whether the strategy draws a noise ratio.
    #[must_use]
    pub const fn is_noisy(self) -> bool {
        matches!(self, Self::Suboptimal)
    }
}

impl fmt::Display for ScenarioStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
