use std::{fmt, fs, path::Path};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Disease identifier as stored in the knowledge store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiseaseId(pub u32);

impl fmt::Display for DiseaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Phenotype identifier as stored in the knowledge store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhenotypeId(pub u32);

impl fmt::Display for PhenotypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Qualitative reliability tier of an evidence source. `A` is the strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvidenceGrade {
    /// Systematic reviews, large prospective studies.
    A,
    /// Smaller cohort or case-control studies.
    B,
    /// Expert opinion, guidelines without primary data.
    C,
}

impl EvidenceGrade {
    /// Higher is more reliable.
    #[must_use]
    pub const fn strength(self) -> u8 {
        match self {
            Self::A => 3,
            Self::B => 2,
            Self::C => 1,
        }
    }
}

/// Disease row of the knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseRecord {
    /// Identifier.
    pub id: DiseaseId,
    /// Display name.
    pub name: String,
    /// Pre-test probability; uniform when absent.
    #[serde(default)]
    pub prior: Option<f64>,
    /// Ordinal urgency, higher is more urgent.
    #[serde(default = "default_triage_severity")]
    pub triage_severity: u8,
    /// Free-text description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

const fn default_triage_severity() -> u8 {
    1
}

/// Phenotype row of the knowledge store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhenotypeRecord {
    /// Identifier.
    pub id: PhenotypeId,
    /// Display name.
    pub name: String,
    /// Body-system cluster used by exploration heuristics.
    #[serde(default)]
    pub cluster: Option<String>,
    /// Plain-language explanation shown next to the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PhenotypeRecord {
    /// The supplied description, else the parenthesised part of the name, else a
    /// "Plain terms" restatement of the name.
    #[must_use]
    pub fn lay_description(&self) -> String {
        if let Some(text) = self.description.as_deref().map(str::trim) {
            if !text.is_empty() {
                return text.to_string();
            }
        }
        let inner = self
            .name
            .split_once('(')
            .and_then(|(_, rest)| rest.rsplit_once(')'))
            .map(|(inner, _)| inner.trim())
            .filter(|inner| !inner.is_empty());
        match inner {
            Some(inner) => {
                let mut chars = inner.chars();
                let first = chars
                    .next()
                    .map(|c| c.to_uppercase().to_string())
                    .unwrap_or_default();
                format!("{first}{}.", chars.as_str().to_lowercase())
            }
            None => format!("Plain terms: {}.", self.name.trim().to_lowercase()),
        }
    }
}

/// Population context an evidence row was measured in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceContext {
    /// Lower age bound in months.
    #[serde(default)]
    pub age_min_months: Option<u32>,
    /// Upper age bound in months.
    #[serde(default)]
    pub age_max_months: Option<u32>,
    /// Care setting, e.g. `primary care` or `emergency`.
    #[serde(default)]
    pub setting: Option<String>,
    /// Geographic region.
    #[serde(default)]
    pub region: Option<String>,
}

/// Evidence row linking a disease to a phenotype. Every numeric field may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Disease the row describes.
    pub disease_id: DiseaseId,
    /// Phenotype the row describes.
    pub phenotype_id: PhenotypeId,
    /// True-positive rate.
    #[serde(default)]
    pub sensitivity: Option<f64>,
    /// True-negative rate.
    #[serde(default)]
    pub specificity: Option<f64>,
    /// Positive likelihood ratio, derived when absent.
    #[serde(default)]
    pub lr_pos: Option<f64>,
    /// Negative likelihood ratio, derived when absent.
    #[serde(default)]
    pub lr_neg: Option<f64>,
    /// Source reliability tier.
    #[serde(default)]
    pub evidence_grade: Option<EvidenceGrade>,
    /// Population context.
    #[serde(default, flatten)]
    pub context: EvidenceContext,
    /// Date the row was extracted from its source.
    #[serde(default)]
    pub extraction_date: Option<NaiveDate>,
    /// Citation or note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EvidenceRecord {
    /// Row carrying only likelihood ratios.
    #[must_use]
    pub fn with_lrs(
        disease_id: DiseaseId,
        phenotype_id: PhenotypeId,
        lr_pos: Option<f64>,
        lr_neg: Option<f64>,
    ) -> Self {
        Self {
            disease_id,
            phenotype_id,
            sensitivity: None,
            specificity: None,
            lr_pos,
            lr_neg,
            evidence_grade: None,
            context: EvidenceContext::default(),
            extraction_date: None,
            source: None,
        }
    }

    /// Row carrying only sensitivity and specificity.
    #[must_use]
    pub fn with_accuracy(
        disease_id: DiseaseId,
        phenotype_id: PhenotypeId,
        sensitivity: f64,
        specificity: f64,
    ) -> Self {
        Self {
            sensitivity: Some(sensitivity),
            specificity: Some(specificity),
            ..Self::with_lrs(disease_id, phenotype_id, None, None)
        }
    }

    /// Number of populated numeric fields.
    #[must_use]
    pub fn completeness(&self) -> usize {
        [self.sensitivity, self.specificity, self.lr_pos, self.lr_neg]
            .iter()
            .filter(|value| value.is_some())
            .count()
    }
}

/// The three read-only collections the engine consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    /// Disease rows.
    #[serde(default)]
    pub diseases: Vec<DiseaseRecord>,
    /// Phenotype rows.
    #[serde(default)]
    pub phenotypes: Vec<PhenotypeRecord>,
    /// Evidence rows.
    #[serde(default)]
    pub evidence: Vec<EvidenceRecord>,
}

impl KnowledgeBase {
    /// Loads a knowledge base document; the format follows the file extension (`.json` or `.toml`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KnowledgeError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json(&raw),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::from_toml(&raw),
            other => Err(KnowledgeError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Parses a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, KnowledgeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Parses a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, KnowledgeError> {
        Ok(toml::from_str(raw)?)
    }

    /// Adds a disease row.
    #[must_use]
    pub fn disease(mut self, id: u32, name: impl Into<String>, prior: f64) -> Self {
        self.diseases.push(DiseaseRecord {
            id: DiseaseId(id),
            name: name.into(),
            prior: Some(prior),
            triage_severity: default_triage_severity(),
            description: String::new(),
        });
        self
    }

    /// Adds a phenotype row.
    #[must_use]
    pub fn phenotype(mut self, id: u32, name: impl Into<String>, cluster: Option<&str>) -> Self {
        self.phenotypes.push(PhenotypeRecord {
            id: PhenotypeId(id),
            name: name.into(),
            cluster: cluster.map(str::to_string),
            description: None,
        });
        self
    }

    /// Adds an evidence row with an explicit positive likelihood ratio.
    #[must_use]
    pub fn lr(mut self, disease: u32, phenotype: u32, lr_pos: f64) -> Self {
        self.evidence.push(EvidenceRecord::with_lrs(
            DiseaseId(disease),
            PhenotypeId(phenotype),
            Some(lr_pos),
            None,
        ));
        self
    }

    /// Adds an arbitrary evidence row.
    #[must_use]
    pub fn row(mut self, record: EvidenceRecord) -> Self {
        self.evidence.push(record);
        self
    }
}

/// Errors raised while loading a knowledge store document.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Extension is neither `json` nor `toml`.
    #[error("unsupported knowledge base format `{0}` (expected .json or .toml)")]
    UnsupportedFormat(String),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML parsing failure.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
