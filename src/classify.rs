//! Drift classification over raw job log text.
//!
//! The observer only needs a yes/no answer, so the predicate is a trait
//! and the default keyword matcher can be swapped for a smarter
//! classifier without touching the polling control flow.

/// Decides whether a failed job's log text indicates schema drift.
pub trait DriftClassifier: Send + Sync {
    fn is_schema_drift(&self, log_text: &str) -> bool;
}

/// Case-insensitive substring matching against a fixed keyword set.
///
/// Deliberately over-inclusive: a false positive costs one wasted repair
/// proposal, a false negative leaves a broken connection unwatched.
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

const DRIFT_KEYWORDS: &[&str] = &[
    "type mismatch",
    "column not found",
    "schema changed",
    "incompatible schema",
    "unknown column",
    "missing column",
    "invalid schema",
    "field not found",
    "cannot cast",
    "datatype mismatch",
    "schema validation failed",
];

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            keywords: DRIFT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn with_keywords(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DriftClassifier for KeywordClassifier {
    fn is_schema_drift(&self, log_text: &str) -> bool {
        let lowered = log_text.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_known_keywords() {
        let classifier = KeywordClassifier::new();
        assert!(classifier.is_schema_drift("Error: column not found: region"));
        assert!(classifier.is_schema_drift("sync aborted: incompatible schema for stream orders"));
        assert!(classifier.is_schema_drift("TYPE MISMATCH in field amount"));
    }

    #[test]
    fn test_case_insensitive() {
        let classifier = KeywordClassifier::new();
        assert!(classifier.is_schema_drift("SCHEMA CHANGED upstream"));
        assert!(classifier.is_schema_drift("Schema Changed upstream"));
    }

    #[test]
    fn test_unrelated_failures_not_drift() {
        let classifier = KeywordClassifier::new();
        assert!(!classifier.is_schema_drift("connection refused"));
        assert!(!classifier.is_schema_drift("out of memory"));
        assert!(!classifier.is_schema_drift(""));
    }

    #[test]
    fn test_custom_keywords() {
        let classifier = KeywordClassifier::with_keywords(vec!["Partition Gone".to_string()]);
        assert!(classifier.is_schema_drift("error: partition gone"));
        assert!(!classifier.is_schema_drift("column not found"));
    }
}
