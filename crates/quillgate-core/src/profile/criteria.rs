//! Criterion definitions.

use serde::{Deserialize, Serialize};

/// How a criterion is evaluated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    /// Deterministic local check
    Rule,
    /// Judged by the external critic service
    Critic,
}

/// Parameters of a deterministic rule check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCheck {
    /// The section named by the criterion's affinity must be present.
    SectionPresent,

    /// Word count of the section body must lie within bounds.
    LengthBounds {
        min_words: usize,
        #[serde(default)]
        max_words: Option<usize>,
    },

    /// Artifact-wide word floor.
    MinTotalWords { min_words: usize },

    /// Template placeholders and data-source mentions must not leak.
    PlaceholderLeakage {
        #[serde(default)]
        extra_patterns: Vec<String>,
    },

    /// None of the listed phrases may appear.
    ForbiddenPhrases { phrases: Vec<String> },

    /// No Markdown or HTML constructs.
    NoMarkup,

    /// Extracted figures must lie within [min, max].
    NumericRange {
        #[serde(default)]
        field: Option<String>,
        min: f64,
        max: f64,
    },

    /// The section's structured block must be recoverable.
    BlockSchema,

    /// Block fields must agree across sections.
    CrossReference {
        fields: Vec<String>,
        sections: Vec<String>,
    },
}

impl RuleCheck {
    /// Short name used in logs and explanations.
    pub fn name(&self) -> &'static str {
        match self {
            RuleCheck::SectionPresent => "section_present",
            RuleCheck::LengthBounds { .. } => "length_bounds",
            RuleCheck::MinTotalWords { .. } => "min_total_words",
            RuleCheck::PlaceholderLeakage { .. } => "placeholder_leakage",
            RuleCheck::ForbiddenPhrases { .. } => "forbidden_phrases",
            RuleCheck::NoMarkup => "no_markup",
            RuleCheck::NumericRange { .. } => "numeric_range",
            RuleCheck::BlockSchema => "block_schema",
            RuleCheck::CrossReference { .. } => "cross_reference",
        }
    }

    /// Whether the check is meaningless without a section affinity.
    pub fn requires_section(&self) -> bool {
        matches!(
            self,
            RuleCheck::SectionPresent | RuleCheck::BlockSchema | RuleCheck::NumericRange { .. }
        )
    }
}

/// One weighted, independently evaluable quality check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Criterion {
    /// Unique identifier (e.g., "R1", "C2")
    pub id: String,

    /// Relative weight in (0, 1]
    pub weight: f64,

    /// Rule or critic
    pub kind: CriterionKind,

    /// Score at or above which the criterion passes
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,

    /// Section this criterion is scoped to, if any
    #[serde(default)]
    pub section: Option<String>,

    /// Rule parameters (rule criteria only)
    #[serde(default)]
    pub check: Option<RuleCheck>,

    /// Rubric dimension (critic criteria only), e.g. "tone"
    #[serde(default)]
    pub dimension: Option<String>,

    /// Free-text rubric guidance passed to the critic
    #[serde(default)]
    pub description: Option<String>,
}

fn default_pass_threshold() -> f64 {
    0.5
}

impl Criterion {
    /// Whether this criterion is scoped to the given section.
    pub fn targets(&self, section: &str) -> bool {
        self.section.as_deref() == Some(section)
    }

    pub fn is_rule(&self) -> bool {
        self.kind == CriterionKind::Rule
    }

    pub fn is_critic(&self) -> bool {
        self.kind == CriterionKind::Critic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_check_tagged_yaml() {
        let check: RuleCheck =
            serde_yaml::from_str("{ type: length_bounds, min_words: 200 }").unwrap();
        assert_eq!(
            check,
            RuleCheck::LengthBounds {
                min_words: 200,
                max_words: None
            }
        );
        assert_eq!(check.name(), "length_bounds");
    }

    #[test]
    fn test_criterion_defaults() {
        let c: Criterion = serde_yaml::from_str(
            r#"
id: C1
kind: critic
weight: 0.2
dimension: tone
"#,
        )
        .unwrap();
        assert_eq!(c.pass_threshold, 0.5);
        assert!(c.is_critic());
        assert!(c.section.is_none());
    }
}
