//! Body-system cluster inference for phenotypes that arrive without a tag.

const RULES: &[(&str, &[&str])] = &[
    (
        "respiratory",
        &[
            "wheez", "tachypnea", "retraction", "hypox", "cough", "stridor", "barking",
            "pleuritic", "crackles", "dyspnea", "chest",
        ],
    ),
    (
        "ent",
        &[
            "ear", "throat", "tonsil", "otorrhea", "hoarseness", "sinus", "nasal", "rhinorrhea",
            "sneez",
        ],
    ),
    (
        "gi",
        &["vomit", "diarr", "abdominal", "suprapubic", "dehydration"],
    ),
    ("gu", &["dysuria", "urinary", "urination"]),
    (
        "skin",
        &[
            "rash", "itch", "prurit", "eczema", "vesicular", "erythema", "crust", "skin",
            "maculopapular",
        ],
    ),
    ("eye", &["eye", "conjunct", "eyelid"]),
];

/// Infers a cluster from a phenotype name. Returns `None` when no rule matches.
#[must_use]
pub fn infer_cluster(name: &str) -> Option<&'static str> {
    let lowered = name.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|(cluster, _)| *cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        assert_eq!(infer_cluster("Barking cough"), Some("respiratory"));
        // "chest" is checked before "ear".
        assert_eq!(infer_cluster("Chest retractions"), Some("respiratory"));
        assert_eq!(infer_cluster("Ear pulling/tugging"), Some("ent"));
        assert_eq!(infer_cluster("Dysuria (painful urination)"), Some("gu"));
        assert_eq!(infer_cluster("Eyelids stuck shut on waking"), Some("eye"));
        assert_eq!(infer_cluster("Headache"), None);
    }
}
