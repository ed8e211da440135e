//! Safety gate: classifies a query into a severity level before retrieval.
//!
//! The gate sits on the critical path ahead of any network-bound work, so
//! classification is a pure, in-memory function of the query text. The gate
//! never fails: a classifier error or panic degrades to `safe` rather than
//! escalating severity or blocking the response.

use regex::Regex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{SafetyError, Stage, StageError};
use crate::types::{SafetyAssessment, SeverityLevel};

/// A query classifier that may fail.
pub trait SafetyClassifier: Send + Sync {
    fn classify(&self, query: &str) -> Result<SafetyAssessment, SafetyError>;
}

/// A single pattern rule.
struct SafetyRule {
    level: SeverityLevel,
    pattern: Regex,
    message: &'static str,
}

const EMERGENCY_GAS: &str = "EMERGENCY: Possible gas leak. Leave the area now, do not touch light switches or \
     create sparks, and call your gas utility or emergency services from outside.";
const EMERGENCY_FIRE: &str = "EMERGENCY: Possible fire or toxic gas. Evacuate immediately and call \
     emergency services. Do not try to fix the appliance yourself.";
const DANGER_ELECTRICAL: &str = "DANGER: Electrical hazard. Stop using the appliance and unplug it or switch \
     off its breaker if you can do so safely. Have it inspected by a qualified technician.";
const DANGER_HEAT: &str = "DANGER: Overheating or burning detected. Turn the appliance off, unplug it, \
     and keep clear until it has cooled down.";
const CAUTION_WATER: &str = "CAUTION: Water and electricity do not mix. Unplug the appliance before \
     inspecting hoses or cleaning up any water.";
const CAUTION_GENERAL: &str =
    "CAUTION: Unplug the appliance and take care before attempting this yourself.";

/// Pattern table, most severe first.
const RULES: &[(SeverityLevel, &str, &str)] = &[
    (
        SeverityLevel::Emergency,
        r"(?i)\b(smell|smells|smelling|odou?r)\b.*\bgas\b",
        EMERGENCY_GAS,
    ),
    (
        SeverityLevel::Emergency,
        r"(?i)\bgas\s+(leak|leaking|smell|odou?r)",
        EMERGENCY_GAS,
    ),
    (
        SeverityLevel::Emergency,
        r"(?i)\b(carbon\s+monoxide|co\s+(alarm|detector))\b",
        EMERGENCY_FIRE,
    ),
    (
        SeverityLevel::Emergency,
        r"(?i)\b(on\s+fire|fire|flames?|explo(de|ded|sion|ding))\b",
        EMERGENCY_FIRE,
    ),
    (
        SeverityLevel::Danger,
        r"(?i)\b(spark|sparks|sparking|sparked|arcing)\b",
        DANGER_ELECTRICAL,
    ),
    (
        SeverityLevel::Danger,
        r"(?i)\b(electric(al)?\s+)?shock(s|ed|ing)?\b",
        DANGER_ELECTRICAL,
    ),
    (
        SeverityLevel::Danger,
        r"(?i)\bexposed\s+wir(e|es|ing)\b",
        DANGER_ELECTRICAL,
    ),
    (
        SeverityLevel::Danger,
        r"(?i)\b(smoke|smoking|smoky|melt|melting|melted|overheat|overheating|overheated)\b",
        DANGER_HEAT,
    ),
    (
        SeverityLevel::Danger,
        r"(?i)\b(burning|burnt|burned)\s+(smell|odou?r|plastic|rubber)\b",
        DANGER_HEAT,
    ),
    (
        SeverityLevel::Caution,
        r"(?i)\b(leak|leaks|leaking|leaked|leakage|flood|flooding|flooded)\b",
        CAUTION_WATER,
    ),
    (
        SeverityLevel::Caution,
        r"(?i)\b(water|puddle)\s+(on|under|around)\s+the\s+floor\b",
        CAUTION_WATER,
    ),
    (
        SeverityLevel::Caution,
        r"(?i)\b(gas|broken\s+glass|tripp(ed|ing)\s+(the\s+)?breaker|hot\s+surface)\b",
        CAUTION_GENERAL,
    ),
];

/// Regex rule classifier for appliance hazards.
///
/// The most severe matching rule wins; no match is `safe`.
pub struct KeywordSafetyClassifier {
    rules: Vec<SafetyRule>,
}

impl KeywordSafetyClassifier {
    /// Build the classifier from the built-in rule table.
    pub fn new() -> Result<Self, SafetyError> {
        let rules = RULES
            .iter()
            .map(|(level, pattern, message)| {
                Regex::new(pattern)
                    .map(|re| SafetyRule {
                        level: *level,
                        pattern: re,
                        message: *message,
                    })
                    .map_err(|e| SafetyError::InvalidRule {
                        pattern: (*pattern).to_string(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl SafetyClassifier for KeywordSafetyClassifier {
    fn classify(&self, query: &str) -> Result<SafetyAssessment, SafetyError> {
        let hit = self
            .rules
            .iter()
            .filter(|rule| rule.pattern.is_match(query))
            .max_by_key(|rule| rule.level);
        Ok(match hit {
            Some(rule) => SafetyAssessment::new(rule.level, Some(rule.message.to_string())),
            None => SafetyAssessment::safe(),
        })
    }
}

/// Infallible front for an optional classifier.
#[derive(Clone, Default)]
pub struct SafetyGate {
    classifier: Option<Arc<dyn SafetyClassifier>>,
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl SafetyGate {
    pub fn new(classifier: Arc<dyn SafetyClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
        }
    }

    /// A gate with no classifier; every query is `safe`.
    pub fn disabled() -> Self {
        Self { classifier: None }
    }

    /// A gate backed by the built-in keyword rules, or disabled if they fail to compile.
    pub fn keyword() -> Self {
        match KeywordSafetyClassifier::new() {
            Ok(classifier) => Self::new(Arc::new(classifier)),
            Err(e) => {
                tracing::error!(error = %e, "Safety rules failed to compile, gate disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    /// Classify a query. Errors and panics inside the classifier yield `safe`.
    pub fn assess(&self, query: &str) -> SafetyAssessment {
        let Some(classifier) = &self.classifier else {
            return SafetyAssessment::safe();
        };
        let failure = match catch_unwind(AssertUnwindSafe(|| classifier.classify(query))) {
            Ok(Ok(assessment)) => return assessment,
            Ok(Err(e)) => StageError::failed(Stage::Safety, e.to_string()),
            Err(_) => StageError::failed(Stage::Safety, "classifier panicked"),
        };
        tracing::warn!(error = %failure, "Defaulting to safe");
        SafetyAssessment::safe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(query: &str) -> SeverityLevel {
        SafetyGate::keyword().assess(query).level
    }

    #[test]
    fn test_rules_compile() {
        let classifier = KeywordSafetyClassifier::new().unwrap();
        assert_eq!(classifier.rule_count(), RULES.len());
    }

    #[test]
    fn test_gas_smell_is_emergency() {
        let assessment = SafetyGate::keyword().assess("I smell gas from the oven");
        assert_eq!(assessment.level, SeverityLevel::Emergency);
        assert!(assessment.flag());
        assert!(assessment.message.unwrap().starts_with("EMERGENCY"));
    }

    #[test]
    fn test_fixture_levels() {
        assert_eq!(level("My microwave is sparking"), SeverityLevel::Danger);
        assert_eq!(
            level("Water leaking from washing machine"),
            SeverityLevel::Caution
        );
        assert_eq!(level("How to clean lint filter?"), SeverityLevel::Safe);
        assert_eq!(level("Dishwasher not draining properly"), SeverityLevel::Safe);
        assert_eq!(level("Refrigerator making loud noise"), SeverityLevel::Safe);
        assert_eq!(level("Oven temperature seems incorrect"), SeverityLevel::Safe);
        assert_eq!(
            level("My Samsung WF45 won't spin, what does E3 mean?"),
            SeverityLevel::Safe
        );
    }

    #[test]
    fn test_most_severe_rule_wins() {
        // Matches both the caution leak rule and the emergency gas rule.
        assert_eq!(level("gas leak near the stove"), SeverityLevel::Emergency);
        assert_eq!(
            level("dryer is smoking and the hose is leaking"),
            SeverityLevel::Danger
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(level("SPARKS coming out of the outlet"), SeverityLevel::Danger);
    }

    #[test]
    fn test_disabled_gate_is_safe() {
        let gate = SafetyGate::disabled();
        assert!(!gate.is_loaded());
        assert_eq!(gate.assess("I smell gas").level, SeverityLevel::Safe);
    }

    struct FailingClassifier;

    impl SafetyClassifier for FailingClassifier {
        fn classify(&self, _query: &str) -> Result<SafetyAssessment, SafetyError> {
            Err(SafetyError::ClassifierFailed {
                message: "model not loaded".into(),
            })
        }
    }

    struct PanickingClassifier;

    impl SafetyClassifier for PanickingClassifier {
        fn classify(&self, _query: &str) -> Result<SafetyAssessment, SafetyError> {
            panic!("index out of bounds")
        }
    }

    #[test]
    fn test_classifier_error_defaults_to_safe() {
        let gate = SafetyGate::new(Arc::new(FailingClassifier));
        let assessment = gate.assess("I smell gas from the oven");
        assert_eq!(assessment, SafetyAssessment::safe());
    }

    #[test]
    fn test_classifier_panic_defaults_to_safe() {
        let gate = SafetyGate::new(Arc::new(PanickingClassifier));
        assert_eq!(gate.assess("anything").level, SeverityLevel::Safe);
    }
}
