use std::{
    cmp::Ordering,
    collections::{btree_map::Entry, BTreeMap},
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clusters,
    knowledge::{DiseaseId, EvidenceGrade, EvidenceRecord, KnowledgeBase, PhenotypeId},
};

/// Disease as seen by sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disease {
    /// Identifier.
    pub id: DiseaseId,
    /// Display name.
    pub name: String,
    /// Prior used to seed every session.
    pub prior: f64,
    /// Ordinal urgency.
    pub triage_severity: u8,
    /// Free-text description.
    pub description: String,
}

/// Phenotype as seen by sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phenotype {
    /// Identifier.
    pub id: PhenotypeId,
    /// Display name.
    pub name: String,
    /// Body-system cluster, supplied or inferred.
    pub cluster: Option<String>,
    /// Plain-language explanation, supplied or derived from the name.
    pub description: String,
}

/// Resolved evidence for one (disease, phenotype) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Disease side of the pair.
    pub disease: DiseaseId,
    /// Phenotype side of the pair.
    pub phenotype: PhenotypeId,
    /// True-positive rate.
    pub sensitivity: Option<f64>,
    /// True-negative rate.
    pub specificity: Option<f64>,
    /// Positive likelihood ratio, `None` when it cannot be computed.
    pub lr_pos: Option<f64>,
    /// Negative likelihood ratio, `None` when it cannot be computed.
    pub lr_neg: Option<f64>,
    /// Source reliability tier.
    pub grade: Option<EvidenceGrade>,
}

/// Counters collected while building the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDiagnostics {
    /// Evidence rows in the input.
    pub rows_read: usize,
    /// Logical rows kept after merging and dropping.
    pub rows_indexed: usize,
    /// Rows dropped because neither sens/spec nor an explicit LR was present.
    pub rows_missing_evidence: usize,
    /// Keys of the dropped rows, in input order.
    pub missing_rows: Vec<(DiseaseId, PhenotypeId)>,
    /// Rows discarded by the duplicate merge rule.
    pub duplicates_merged: usize,
    /// Kept rows without a computable positive LR.
    pub lr_pos_undefined: usize,
    /// Kept rows without a computable negative LR.
    pub lr_neg_undefined: usize,
    /// Diseases that received the uniform prior.
    pub priors_defaulted: usize,
    /// Phenotypes whose cluster was inferred from the name.
    pub clusters_inferred: usize,
}

/// Options applied while building the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Infer a cluster tag from the phenotype name when none is supplied.
    pub infer_clusters: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            infer_clusters: true,
        }
    }
}

/// Immutable index over the knowledge store. Every map iterates in ascending id order.
#[derive(Debug, Clone)]
pub struct EvidenceIndex {
    diseases: BTreeMap<DiseaseId, Disease>,
    phenotypes: BTreeMap<PhenotypeId, Phenotype>,
    by_disease: BTreeMap<DiseaseId, BTreeMap<PhenotypeId, Evidence>>,
    by_phenotype: BTreeMap<PhenotypeId, BTreeMap<DiseaseId, Evidence>>,
    diagnostics: BuildDiagnostics,
}

struct Candidate {
    evidence: Evidence,
    extraction_date: Option<NaiveDate>,
    completeness: usize,
}

impl Candidate {
    /// Merge precedence: grade, then extraction date, then completeness. Earlier rows win ties.
    fn outranks(&self, other: &Self) -> bool {
        let grade = |c: &Self| c.evidence.grade.map_or(0, EvidenceGrade::strength);
        grade(self)
            .cmp(&grade(other))
            .then_with(|| self.extraction_date.cmp(&other.extraction_date))
            .then_with(|| self.completeness.cmp(&other.completeness))
            == Ordering::Greater
    }
}

impl EvidenceIndex {
    /// Builds the index with default options.
    pub fn build(kb: &KnowledgeBase) -> Result<Self, IndexError> {
        Self::build_with(kb, IndexOptions::default())
    }

    /// Builds the index, failing fast on references to unknown ids or out-of-range values.
    pub fn build_with(kb: &KnowledgeBase, options: IndexOptions) -> Result<Self, IndexError> {
        if kb.diseases.is_empty() {
            return Err(IndexError::NoDiseases);
        }
        let mut diagnostics = BuildDiagnostics {
            rows_read: kb.evidence.len(),
            ..BuildDiagnostics::default()
        };

        #[allow(clippy::cast_precision_loss)]
        let uniform = 1.0 / kb.diseases.len() as f64;
        let mut diseases = BTreeMap::new();
        for record in &kb.diseases {
            let prior = match record.prior {
                Some(p) if (0.0..=1.0).contains(&p) => p,
                Some(p) => {
                    return Err(IndexError::InvalidPrior {
                        disease: record.id,
                        value: p,
                    })
                }
                None => {
                    diagnostics.priors_defaulted += 1;
                    uniform
                }
            };
            let disease = Disease {
                id: record.id,
                name: record.name.clone(),
                prior,
                triage_severity: record.triage_severity,
                description: record.description.clone(),
            };
            if diseases.insert(record.id, disease).is_some() {
                return Err(IndexError::DuplicateDisease(record.id));
            }
        }

        let mut phenotypes = BTreeMap::new();
        for record in &kb.phenotypes {
            let cluster = match &record.cluster {
                Some(tag) if !tag.trim().is_empty() => Some(tag.trim().to_lowercase()),
                _ if options.infer_clusters => {
                    let inferred = clusters::infer_cluster(&record.name).map(str::to_string);
                    if inferred.is_some() {
                        diagnostics.clusters_inferred += 1;
                    }
                    inferred
                }
                _ => None,
            };
            let phenotype = Phenotype {
                id: record.id,
                name: record.name.clone(),
                cluster,
                description: record.lay_description(),
            };
            if phenotypes.insert(record.id, phenotype).is_some() {
                return Err(IndexError::DuplicatePhenotype(record.id));
            }
        }

        let mut merged: BTreeMap<(DiseaseId, PhenotypeId), Candidate> = BTreeMap::new();
        for record in &kb.evidence {
            if !diseases.contains_key(&record.disease_id) {
                return Err(IndexError::UnknownDisease {
                    disease: record.disease_id,
                    phenotype: record.phenotype_id,
                });
            }
            if !phenotypes.contains_key(&record.phenotype_id) {
                return Err(IndexError::UnknownPhenotype {
                    disease: record.disease_id,
                    phenotype: record.phenotype_id,
                });
            }
            validate_record(record)?;
            let Some(evidence) = resolve(record) else {
                diagnostics.rows_missing_evidence += 1;
                diagnostics
                    .missing_rows
                    .push((record.disease_id, record.phenotype_id));
                continue;
            };
            let candidate = Candidate {
                evidence,
                extraction_date: record.extraction_date,
                completeness: record.completeness(),
            };
            match merged.entry((record.disease_id, record.phenotype_id)) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    diagnostics.duplicates_merged += 1;
                    if candidate.outranks(slot.get()) {
                        slot.insert(candidate);
                    }
                }
            }
        }

        let mut by_disease: BTreeMap<DiseaseId, BTreeMap<PhenotypeId, Evidence>> = BTreeMap::new();
        let mut by_phenotype: BTreeMap<PhenotypeId, BTreeMap<DiseaseId, Evidence>> =
            BTreeMap::new();
        for ((disease, phenotype), candidate) in merged {
            let evidence = candidate.evidence;
            if evidence.lr_pos.is_none() {
                diagnostics.lr_pos_undefined += 1;
            }
            if evidence.lr_neg.is_none() {
                diagnostics.lr_neg_undefined += 1;
            }
            by_disease
                .entry(disease)
                .or_default()
                .insert(phenotype, evidence);
            by_phenotype
                .entry(phenotype)
                .or_default()
                .insert(disease, evidence);
            diagnostics.rows_indexed += 1;
        }

        Ok(Self {
            diseases,
            phenotypes,
            by_disease,
            by_phenotype,
            diagnostics,
        })
    }

    /// Looks up a disease.
    #[must_use]
    pub fn disease(&self, id: DiseaseId) -> Option<&Disease> {
        self.diseases.get(&id)
    }

    /// Looks up a phenotype.
    #[must_use]
    pub fn phenotype(&self, id: PhenotypeId) -> Option<&Phenotype> {
        self.phenotypes.get(&id)
    }

    /// Case-insensitive disease lookup by name.
    #[must_use]
    pub fn disease_by_name(&self, name: &str) -> Option<&Disease> {
        let wanted = name.trim();
        self.diseases
            .values()
            .find(|d| d.name.eq_ignore_ascii_case(wanted))
    }

    /// Case-insensitive phenotype lookup by name.
    #[must_use]
    pub fn phenotype_by_name(&self, name: &str) -> Option<&Phenotype> {
        let wanted = name.trim();
        self.phenotypes
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(wanted))
    }

    /// Diseases in ascending id order.
    pub fn diseases(&self) -> impl Iterator<Item = &Disease> + '_ {
        self.diseases.values()
    }

    /// Phenotypes in ascending id order.
    pub fn phenotypes(&self) -> impl Iterator<Item = &Phenotype> + '_ {
        self.phenotypes.values()
    }

    /// Number of diseases.
    #[must_use]
    pub fn disease_count(&self) -> usize {
        self.diseases.len()
    }

    /// Evidence for one pair.
    #[must_use]
    pub fn evidence(&self, disease: DiseaseId, phenotype: PhenotypeId) -> Option<&Evidence> {
        self.by_disease.get(&disease)?.get(&phenotype)
    }

    /// Evidence rows of a disease, ascending phenotype id.
    pub fn evidence_for_disease(
        &self,
        disease: DiseaseId,
    ) -> impl Iterator<Item = &Evidence> + '_ {
        self.by_disease
            .get(&disease)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    /// Evidence rows of a phenotype, ascending disease id.
    pub fn evidence_for_phenotype(
        &self,
        phenotype: PhenotypeId,
    ) -> impl Iterator<Item = &Evidence> + '_ {
        self.by_phenotype
            .get(&phenotype)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    /// Number of rows with a positive LR for the disease.
    #[must_use]
    pub fn positive_evidence_count(&self, disease: DiseaseId) -> usize {
        self.evidence_for_disease(disease)
            .filter(|e| e.lr_pos.is_some())
            .count()
    }

    /// Number of diseases with a positive LR for the phenotype.
    #[must_use]
    pub fn coverage(&self, phenotype: PhenotypeId) -> usize {
        self.evidence_for_phenotype(phenotype)
            .filter(|e| e.lr_pos.is_some())
            .count()
    }

    /// Cluster tag of a phenotype.
    #[must_use]
    pub fn cluster_of(&self, phenotype: PhenotypeId) -> Option<&str> {
        self.phenotypes.get(&phenotype)?.cluster.as_deref()
    }

    /// Counters gathered at build time.
    #[must_use]
    pub const fn diagnostics(&self) -> &BuildDiagnostics {
        &self.diagnostics
    }
}

fn validate_record(record: &EvidenceRecord) -> Result<(), IndexError> {
    let invalid = |field: &'static str, value: f64| IndexError::InvalidEvidence {
        disease: record.disease_id,
        phenotype: record.phenotype_id,
        field,
        value,
    };
    for (field, value) in [
        ("sensitivity", record.sensitivity),
        ("specificity", record.specificity),
    ] {
        if let Some(v) = value {
            if !(0.0..=1.0).contains(&v) {
                return Err(invalid(field, v));
            }
        }
    }
    for (field, value) in [("lr_pos", record.lr_pos), ("lr_neg", record.lr_neg)] {
        if let Some(v) = value {
            if !(v.is_finite() && v > 0.0) {
                return Err(invalid(field, v));
            }
        }
    }
    Ok(())
}

/// Resolves likelihood ratios, deriving them from sensitivity/specificity when not supplied.
/// Returns `None` for rows that carry no usable evidence at all.
fn resolve(record: &EvidenceRecord) -> Option<Evidence> {
    let accuracy = record.sensitivity.zip(record.specificity);
    if accuracy.is_none() && record.lr_pos.is_none() && record.lr_neg.is_none() {
        return None;
    }
    let lr_pos = record.lr_pos.or_else(|| {
        accuracy
            .filter(|(_, spec)| *spec < 1.0)
            .map(|(sens, spec)| sens / (1.0 - spec))
            .filter(|lr| *lr > 0.0)
    });
    let lr_neg = record.lr_neg.or_else(|| {
        accuracy
            .filter(|(_, spec)| *spec > 0.0)
            .map(|(sens, spec)| (1.0 - sens) / spec)
            .filter(|lr| *lr > 0.0)
    });
    Some(Evidence {
        disease: record.disease_id,
        phenotype: record.phenotype_id,
        sensitivity: record.sensitivity,
        specificity: record.specificity,
        lr_pos,
        lr_neg,
        grade: record.evidence_grade,
    })
}

/// Errors raised while building the index. All of them are reported before any session starts.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    /// The knowledge store holds no disease.
    #[error("knowledge base contains no diseases")]
    NoDiseases,
    /// Two disease rows share an id.
    #[error("duplicate disease id {0}")]
    DuplicateDisease(DiseaseId),
    /// Two phenotype rows share an id.
    #[error("duplicate phenotype id {0}")]
    DuplicatePhenotype(PhenotypeId),
    /// Prior outside `[0, 1]`.
    #[error("disease {disease} has prior {value} outside [0, 1]")]
    InvalidPrior {
        /// Offending disease.
        disease: DiseaseId,
        /// Supplied prior.
        value: f64,
    },
    /// Evidence row references a disease that does not exist.
    #[error("evidence row ({disease}, {phenotype}) references unknown disease {disease}")]
    UnknownDisease {
        /// Missing disease.
        disease: DiseaseId,
        /// Phenotype of the row.
        phenotype: PhenotypeId,
    },
    /// Evidence row references a phenotype that does not exist.
    #[error("evidence row ({disease}, {phenotype}) references unknown phenotype {phenotype}")]
    UnknownPhenotype {
        /// Disease of the row.
        disease: DiseaseId,
        /// Missing phenotype.
        phenotype: PhenotypeId,
    },
    /// Probability outside `[0, 1]` or a non-positive likelihood ratio.
    #[error("evidence row ({disease}, {phenotype}) has invalid {field} = {value}")]
    InvalidEvidence {
        /// Disease of the row.
        disease: DiseaseId,
        /// Phenotype of the row.
        phenotype: PhenotypeId,
        /// Field name.
        field: &'static str,
        /// Supplied value.
        value: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::EvidenceRecord;

    fn base() -> KnowledgeBase {
        KnowledgeBase::default()
            .disease(1, "Croup", 0.1)
            .disease(2, "Bronchiolitis", 0.2)
            .phenotype(10, "Stridor", Some("respiratory"))
            .phenotype(11, "Wheezing", None)
            .phenotype(12, "Fever", None)
    }

    #[test]
    fn derives_likelihood_ratios() {
        let kb = base()
            .row(EvidenceRecord::with_accuracy(DiseaseId(1), PhenotypeId(10), 0.6, 0.98))
            .row(EvidenceRecord::with_accuracy(DiseaseId(2), PhenotypeId(11), 0.75, 0.85));
        let index = EvidenceIndex::build(&kb).unwrap();
        for (d, p, sens, spec) in [(1, 10, 0.6, 0.98), (2, 11, 0.75, 0.85)] {
            let e = index.evidence(DiseaseId(d), PhenotypeId(p)).unwrap();
            assert!((e.lr_pos.unwrap() - sens / (1.0 - spec)).abs() < 1e-6);
            assert!((e.lr_neg.unwrap() - (1.0 - sens) / spec).abs() < 1e-6);
        }
    }

    #[test]
    fn degenerate_specificity_leaves_ratio_undefined() {
        let kb = base()
            .row(EvidenceRecord::with_accuracy(DiseaseId(1), PhenotypeId(10), 0.5, 1.0))
            .row(EvidenceRecord::with_accuracy(DiseaseId(2), PhenotypeId(11), 0.5, 0.0));
        let index = EvidenceIndex::build(&kb).unwrap();
        let perfect = index.evidence(DiseaseId(1), PhenotypeId(10)).unwrap();
        assert_eq!(perfect.lr_pos, None);
        assert!((perfect.lr_neg.unwrap() - 0.5).abs() < 1e-9);
        let useless = index.evidence(DiseaseId(2), PhenotypeId(11)).unwrap();
        assert_eq!(useless.lr_neg, None);
        assert!((useless.lr_pos.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(index.diagnostics().lr_pos_undefined, 1);
        assert_eq!(index.diagnostics().lr_neg_undefined, 1);
        assert_eq!(index.coverage(PhenotypeId(10)), 0);
    }

    #[test]
    fn drops_rows_without_evidence_and_counts_them() {
        let kb = base()
            .row(EvidenceRecord::with_lrs(DiseaseId(1), PhenotypeId(12), None, None))
            .lr(2, 12, 1.5);
        let index = EvidenceIndex::build(&kb).unwrap();
        let diag = index.diagnostics();
        assert_eq!(diag.rows_read, 2);
        assert_eq!(diag.rows_indexed, 1);
        assert_eq!(diag.rows_missing_evidence, 1);
        assert_eq!(diag.missing_rows, vec![(DiseaseId(1), PhenotypeId(12))]);
        assert!(index.evidence(DiseaseId(1), PhenotypeId(12)).is_none());
    }

    #[test]
    fn unknown_references_fail_fast() {
        let err = EvidenceIndex::build(&base().lr(9, 10, 2.0)).unwrap_err();
        assert!(matches!(err, IndexError::UnknownDisease { disease: DiseaseId(9), .. }));
        let err = EvidenceIndex::build(&base().lr(1, 99, 2.0)).unwrap_err();
        assert!(matches!(err, IndexError::UnknownPhenotype { phenotype: PhenotypeId(99), .. }));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let kb = base().row(EvidenceRecord::with_accuracy(
            DiseaseId(1),
            PhenotypeId(10),
            1.2,
            0.5,
        ));
        assert!(matches!(
            EvidenceIndex::build(&kb),
            Err(IndexError::InvalidEvidence { field: "sensitivity", .. })
        ));
        assert_eq!(
            EvidenceIndex::build(&KnowledgeBase::default()).unwrap_err(),
            IndexError::NoDiseases
        );
    }

    #[test]
    fn duplicates_resolve_by_grade_then_date() {
        let mut graded = EvidenceRecord::with_lrs(DiseaseId(1), PhenotypeId(10), Some(30.0), None);
        graded.evidence_grade = Some(EvidenceGrade::A);
        let mut newer = EvidenceRecord::with_lrs(DiseaseId(1), PhenotypeId(10), Some(12.0), None);
        newer.evidence_grade = Some(EvidenceGrade::B);
        newer.extraction_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        let mut older = newer.clone();
        older.lr_pos = Some(9.0);
        older.extraction_date = NaiveDate::from_ymd_opt(2020, 1, 1);

        let kb = base().row(newer.clone()).row(graded).row(older.clone());
        let index = EvidenceIndex::build(&kb).unwrap();
        assert_eq!(index.evidence(DiseaseId(1), PhenotypeId(10)).unwrap().lr_pos, Some(30.0));
        assert_eq!(index.diagnostics().duplicates_merged, 2);

        let kb = base().row(older).row(newer);
        let index = EvidenceIndex::build(&kb).unwrap();
        assert_eq!(index.evidence(DiseaseId(1), PhenotypeId(10)).unwrap().lr_pos, Some(12.0));
    }

    #[test]
    fn first_row_wins_full_ties() {
        let kb = base().lr(1, 10, 4.0).lr(1, 10, 5.0);
        let index = EvidenceIndex::build(&kb).unwrap();
        assert_eq!(index.evidence(DiseaseId(1), PhenotypeId(10)).unwrap().lr_pos, Some(4.0));
    }

    #[test]
    fn infers_missing_clusters_and_defaults_priors() {
        let mut kb = base().lr(2, 11, 5.0);
        kb.diseases[1].prior = None;
        let index = EvidenceIndex::build(&kb).unwrap();
        assert_eq!(index.cluster_of(PhenotypeId(11)), Some("respiratory"));
        assert_eq!(index.cluster_of(PhenotypeId(12)), None);
        assert_eq!(index.diagnostics().clusters_inferred, 1);
        assert_eq!(index.diagnostics().priors_defaulted, 1);
        assert!((index.disease(DiseaseId(2)).unwrap().prior - 0.5).abs() < 1e-12);

        let plain = EvidenceIndex::build_with(&kb, IndexOptions { infer_clusters: false }).unwrap();
        assert_eq!(plain.cluster_of(PhenotypeId(11)), None);
    }

    #[test]
    fn iteration_is_ordered_by_id() {
        let kb = base().lr(2, 12, 1.5).lr(1, 12, 1.2).lr(1, 10, 17.0);
        let index = EvidenceIndex::build(&kb).unwrap();
        let diseases: Vec<_> = index
            .evidence_for_phenotype(PhenotypeId(12))
            .map(|e| e.disease)
            .collect();
        assert_eq!(diseases, vec![DiseaseId(1), DiseaseId(2)]);
        let phenotypes: Vec<_> = index
            .evidence_for_disease(DiseaseId(1))
            .map(|e| e.phenotype)
            .collect();
        assert_eq!(phenotypes, vec![PhenotypeId(10), PhenotypeId(12)]);
        assert_eq!(index.positive_evidence_count(DiseaseId(1)), 2);
        assert_eq!(index.coverage(PhenotypeId(12)), 2);
        assert_eq!(index.phenotype_by_name("stridor").unwrap().id, PhenotypeId(10));
    }
}
