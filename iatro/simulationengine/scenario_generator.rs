use std::collections::BTreeMap;

use iatro_reasoning::{DiseaseId, EvidenceIndex, PhenotypeId};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use uuid::{Builder, Uuid};

use crate::{helper::seeded_rng, methods::ScenarioStrategy, settings::SettingsError};

const SUBOPTIMAL_POOL: usize = 5;
const ADVERSARIAL_LEAD: usize = 3;

/// Scenario generation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Diseases with fewer usable phenotypes are skipped.
    pub min_evidence: usize,
    /// Scenarios generated per disease.
    pub scenarios_per_disease: usize,
    /// Lower bound of the suboptimal noise ratio.
    pub noise_min: f64,
    /// Upper bound of the suboptimal noise ratio.
    pub noise_max: f64,
    /// Longest prescribed sequence.
    pub max_path_length: usize,
    /// A phenotype is a competitor when another disease's LR exceeds this multiple of the target's.
    pub competitor_factor: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            min_evidence: 2,
            scenarios_per_disease: 10,
            noise_min: 0.2,
            noise_max: 0.5,
            max_path_length: 10,
            competitor_factor: 1.5,
        }
    }
}

impl GeneratorConfig {
    /// Checks bounds.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, reason: &'static str| {
            Err(SettingsError::Invalid {
                section: "generator",
                field,
                reason,
            })
        };
        if self.scenarios_per_disease == 0 {
            return invalid("scenarios_per_disease", "must be positive");
        }
        if self.max_path_length == 0 {
            return invalid("max_path_length", "must be positive");
        }
        if !(0.0..=1.0).contains(&self.noise_min)
            || !(0.0..=1.0).contains(&self.noise_max)
            || self.noise_min > self.noise_max
        {
            return invalid("noise_min", "noise range must satisfy 0 <= min <= max <= 1");
        }
        if self.competitor_factor <= 0.0 {
            return invalid("competitor_factor", "must be positive");
        }
        Ok(())
    }
}

/// One synthetic patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario id, derived from the batch seed.
    pub id: Uuid,
    /// Label such as `suboptimal-2`.
    pub label: String,
    /// Disease the patient has.
    pub target: DiseaseId,
    /// Its display name.
    pub target_name: String,
    /// Ordering strategy.
    pub strategy: ScenarioStrategy,
    /// Noise ratio for suboptimal scenarios.
    pub noise: Option<f64>,
    /// Phenotypes the patient will confirm, in preference order.
    pub sequence: Vec<PhenotypeId>,
    /// Action budget for the run.
    pub max_steps: u32,
}

/// A disease left out of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDisease {
    /// Disease.
    pub disease: DiseaseId,
    /// Display name.
    pub name: String,
    /// Phenotypes with LR+ above 1.
    pub usable: usize,
    /// Minimum required.
    pub required: usize,
}

/// Generated scenarios plus the diseases that could not be covered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioBatch {
    /// Scenarios in generation order.
    pub scenarios: Vec<Scenario>,
    /// Diseases skipped for lack of evidence.
    pub skipped: Vec<SkippedDisease>,
}

/// Generates scenarios using seeded randomness.
#[derive(Debug, Clone)]
pub struct ScenarioGenerator {
    config: GeneratorConfig,
    seed: u64,
    max_steps: u32,
}

impl ScenarioGenerator {
    /// Creates generator with seed.
    #[must_use]
    pub const fn new(config: GeneratorConfig, seed: u64, max_steps: u32) -> Self {
        Self {
            config,
            seed,
            max_steps,
        }
    }

    /// Seed driving every random choice.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Generates scenarios for every disease in the index.
    #[must_use]
    pub fn generate(&self, index: &EvidenceIndex) -> ScenarioBatch {
        let all: Vec<DiseaseId> = index.diseases().map(|d| d.id).collect();
        self.generate_for(index, &all)
    }

    /// Generates scenarios for the listed diseases, in the order given.
    #[must_use]
    pub fn generate_for(&self, index: &EvidenceIndex, diseases: &[DiseaseId]) -> ScenarioBatch {
        let mut rng = seeded_rng(self.seed);
        let mut batch = ScenarioBatch::default();
        for &disease in diseases {
            let Some(info) = index.disease(disease) else {
                continue;
            };
            let profile = TargetProfile::new(index, disease, self.config.competitor_factor);
            if profile.ranked.len() < self.config.min_evidence {
                batch.skipped.push(SkippedDisease {
                    disease,
                    name: info.name.clone(),
                    usable: profile.ranked.len(),
                    required: self.config.min_evidence,
                });
                continue;
            }
            let mut ordinals: BTreeMap<&'static str, usize> = BTreeMap::new();
            for strategy in ScenarioStrategy::PLAN
                .iter()
                .copied()
                .cycle()
                .take(self.config.scenarios_per_disease)
            {
                let ordinal = ordinals.entry(strategy.label()).or_insert(0);
                *ordinal += 1;
                let noise = strategy
                    .is_noisy()
                    .then(|| rng.gen_range(self.config.noise_min..=self.config.noise_max));
                let sequence = self.sequence(&profile, strategy, noise.unwrap_or(0.0), &mut rng);
                batch.scenarios.push(Scenario {
                    id: Builder::from_random_bytes(rng.gen()).into_uuid(),
                    label: format!("{}-{}", strategy.label(), ordinal),
                    target: disease,
                    target_name: info.name.clone(),
                    strategy,
                    noise,
                    sequence,
                    max_steps: self.max_steps,
                });
            }
        }
        batch
    }

    fn sequence(
        &self,
        profile: &TargetProfile<'_>,
        strategy: ScenarioStrategy,
        noise: f64,
        rng: &mut SmallRng,
    ) -> Vec<PhenotypeId> {
        let limit = self.config.max_path_length;
        let mut sequence = match strategy {
            ScenarioStrategy::Optimal => profile.ranked.clone(),
            ScenarioStrategy::Suboptimal => {
                let pool: Vec<_> = profile.competitors.iter().take(SUBOPTIMAL_POOL).collect();
                let mut path = Vec::new();
                for &phenotype in profile.ranked.iter().take(limit) {
                    if !pool.is_empty() && rng.gen_bool(noise.clamp(0.0, 1.0)) {
                        if let Some(&&competitor) = pool.choose(rng) {
                            if !path.contains(&competitor) {
                                path.push(competitor);
                            }
                        }
                    }
                    path.push(phenotype);
                }
                path
            }
            ScenarioStrategy::Adversarial => profile
                .competitors
                .iter()
                .take(ADVERSARIAL_LEAD)
                .chain(profile.ranked.iter())
                .copied()
                .collect(),
            ScenarioStrategy::Random => {
                let mut all = profile.relevant.clone();
                all.shuffle(rng);
                all
            }
            ScenarioStrategy::Diverse => profile.round_robin(rng),
        };
        sequence.truncate(limit);
        sequence
    }
}

/// Phenotype lists derived once per target disease.
struct TargetProfile<'a> {
    index: &'a EvidenceIndex,
    /// LR+ above 1, descending LR, ties by id.
    ranked: Vec<PhenotypeId>,
    /// Every phenotype with an LR+ row for the target.
    relevant: Vec<PhenotypeId>,
    /// Phenotypes favouring another disease, strongest first.
    competitors: Vec<PhenotypeId>,
}

impl<'a> TargetProfile<'a> {
    fn new(index: &'a EvidenceIndex, target: DiseaseId, factor: f64) -> Self {
        let mut positive: Vec<(PhenotypeId, f64)> = index
            .evidence_for_disease(target)
            .filter_map(|e| e.lr_pos.map(|lr| (e.phenotype, lr)))
            .collect();
        let relevant = positive.iter().map(|(p, _)| *p).collect();
        positive.retain(|(_, lr)| *lr > 1.0);
        positive.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut competitors: Vec<(PhenotypeId, f64)> = index
            .phenotypes()
            .filter_map(|p| {
                let target_lr = index
                    .evidence(target, p.id)
                    .and_then(|e| e.lr_pos)
                    .unwrap_or(0.0);
                let rival = index
                    .evidence_for_phenotype(p.id)
                    .filter(|e| e.disease != target)
                    .filter_map(|e| e.lr_pos)
                    .fold(0.0, f64::max);
                (rival > factor * target_lr).then_some((p.id, rival))
            })
            .collect();
        competitors.sort_by(|a, b| b.1.total_cmp(&a.1));

        Self {
            index,
            ranked: positive.into_iter().map(|(p, _)| p).collect(),
            relevant,
            competitors: competitors.into_iter().map(|(p, _)| p).collect(),
        }
    }

    /// Ranked phenotypes grouped by cluster, clusters visited in shuffled order.
    fn round_robin(&self, rng: &mut SmallRng) -> Vec<PhenotypeId> {
        let mut groups: BTreeMap<&str, Vec<PhenotypeId>> = BTreeMap::new();
        for &phenotype in &self.ranked {
            let cluster = self.index.cluster_of(phenotype).unwrap_or("unclustered");
            groups.entry(cluster).or_default().push(phenotype);
        }
        let mut queues: Vec<_> = groups.into_values().map(Vec::into_iter).collect();
        queues.shuffle(rng);
        let mut sequence = Vec::with_capacity(self.ranked.len());
        while sequence.len() < self.ranked.len() {
            for queue in &mut queues {
                if let Some(phenotype) = queue.next() {
                    sequence.push(phenotype);
                }
            }
        }
        sequence
    }
}
