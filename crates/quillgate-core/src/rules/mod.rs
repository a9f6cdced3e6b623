//! Deterministic rule checks.
//!
//! Each rule criterion names one [`RuleCheck`]; the check is evaluated by a
//! pure function of the parsed sections. Evaluators never fail: bad input
//! produces a failing [`CriterionResult`] with an explanation.
//!
//! Criteria scoped to different sections are independent, which lets the
//! runtime evaluate them concurrently via [`RuleValidator::validate_section`].

mod consistency;
mod content;
pub mod patterns;
mod structure;

use crate::blocks::SchemaError;
use crate::profile::{Criterion, QualityProfile, RuleCheck};
use crate::types::{CriterionResult, Section};

/// Everything a rule check may look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub sections: &'a [Section],
    pub schema_errors: &'a [SchemaError],
}

impl<'a> RuleContext<'a> {
    pub fn new(sections: &'a [Section], schema_errors: &'a [SchemaError]) -> Self {
        Self {
            sections,
            schema_errors,
        }
    }

    pub fn section(&self, name: &str) -> Option<&'a Section> {
        self.sections.iter().find(|s| s.is_named(name))
    }

    pub fn schema_error(&self, section: &str) -> Option<&'a SchemaError> {
        self.schema_errors.iter().find(|e| e.section == section)
    }

    /// Text a criterion applies to: its section, or the whole artifact.
    ///
    /// `None` when the criterion targets a section that is absent.
    pub(crate) fn scope_text(&self, criterion: &Criterion) -> Option<String> {
        match &criterion.section {
            Some(name) => self.section(name).map(|s| s.raw_text.clone()),
            None => Some(self.sections.iter().map(|s| s.raw_text.as_str()).collect()),
        }
    }
}

/// Result for a check that does not apply (e.g. its optional section is absent).
pub(crate) fn not_applicable(criterion: &Criterion, why: impl AsRef<str>) -> CriterionResult {
    CriterionResult::scored(&criterion.id, 1.0, format!("Not applicable: {}", why.as_ref()))
}

/// Evaluate one rule criterion.
pub fn evaluate(criterion: &Criterion, ctx: &RuleContext<'_>) -> CriterionResult {
    let Some(check) = &criterion.check else {
        return CriterionResult::scored(&criterion.id, 0.0, "Criterion declares no rule check");
    };

    let result = match check {
        RuleCheck::SectionPresent => structure::section_present(criterion, ctx),
        RuleCheck::LengthBounds {
            min_words,
            max_words,
        } => structure::length_bounds(criterion, ctx, *min_words, *max_words),
        RuleCheck::MinTotalWords { min_words } => structure::min_total_words(criterion, ctx, *min_words),
        RuleCheck::BlockSchema => structure::block_schema(criterion, ctx),
        RuleCheck::PlaceholderLeakage { extra_patterns } => {
            content::placeholder_leakage(criterion, ctx, extra_patterns)
        }
        RuleCheck::ForbiddenPhrases { phrases } => content::forbidden_phrases(criterion, ctx, phrases),
        RuleCheck::NoMarkup => content::no_markup(criterion, ctx),
        RuleCheck::NumericRange { field, min, max } => {
            consistency::numeric_range(criterion, ctx, field.as_deref(), *min, *max)
        }
        RuleCheck::CrossReference { fields, sections } => {
            consistency::cross_reference(criterion, ctx, fields, sections)
        }
    };

    tracing::trace!(
        criterion = %criterion.id,
        check = check.name(),
        score = result.score,
        "Rule evaluated"
    );
    result
}

/// Whether a rule criterion reads the given section.
///
/// Artifact-wide criteria read every section.
pub fn reads_section(criterion: &Criterion, section: &str) -> bool {
    match (&criterion.section, &criterion.check) {
        (_, Some(RuleCheck::CrossReference { sections, .. })) => {
            criterion.targets(section) || sections.iter().any(|s| s == section)
        }
        (Some(own), _) => own == section,
        (None, _) => true,
    }
}

/// Runs the rule criteria of a profile.
pub struct RuleValidator<'p> {
    profile: &'p QualityProfile,
}

impl<'p> RuleValidator<'p> {
    pub fn new(profile: &'p QualityProfile) -> Self {
        Self { profile }
    }

    /// Evaluate every rule criterion, in profile order.
    pub fn validate(&self, ctx: &RuleContext<'_>) -> Vec<CriterionResult> {
        self.profile.rule_criteria().map(|c| evaluate(c, ctx)).collect()
    }

    /// Evaluate the rule criteria scoped to one section.
    pub fn validate_section(&self, section: &str, ctx: &RuleContext<'_>) -> Vec<CriterionResult> {
        self.profile
            .rule_criteria()
            .filter(|c| c.targets(section))
            .map(|c| evaluate(c, ctx))
            .collect()
    }

    /// Evaluate the rule criteria without section affinity.
    pub fn validate_global(&self, ctx: &RuleContext<'_>) -> Vec<CriterionResult> {
        self.profile
            .rule_criteria()
            .filter(|c| c.section.is_none())
            .map(|c| evaluate(c, ctx))
            .collect()
    }

    /// Re-evaluate only the rule criteria that read any of `sections`.
    pub fn revalidate(&self, sections: &[String], ctx: &RuleContext<'_>) -> Vec<CriterionResult> {
        self.profile
            .rule_criteria()
            .filter(|c| sections.iter().any(|s| reads_section(c, s)))
            .map(|c| evaluate(c, ctx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::StructuredBlockExtractor;
    use crate::profile::VALID_PROFILE;
    use crate::sections::SectionParser;

    fn run(doc: &str) -> Vec<CriterionResult> {
        let profile = QualityProfile::from_yaml(VALID_PROFILE).unwrap();
        let mut sections = SectionParser::new(&profile).parse(doc).unwrap();
        let errors = StructuredBlockExtractor::new(&profile).extract_all(&mut sections);
        RuleValidator::new(&profile).validate(&RuleContext::new(&sections, &errors))
    }

    #[test]
    fn test_validate_in_profile_order() {
        let results = run("Overview\nhello\nForecast\none two three four five six\n");
        let ids: Vec<_> = results.iter().map(|r| r.criterion_id.as_str()).collect();
        assert_eq!(ids, vec!["R1", "R2"]);
        assert!(results.iter().all(|r| r.evaluated && r.score == 1.0));
    }

    #[test]
    fn test_short_section_fails_length() {
        let results = run("Overview\nhello\nForecast\ntoo short\n");
        let r2 = results.iter().find(|r| r.criterion_id == "R2").unwrap();
        assert!(r2.score < 0.5);
        assert!(r2.explanation.contains("2 words"));
    }

    #[test]
    fn test_reads_section() {
        let profile = QualityProfile::from_yaml(VALID_PROFILE).unwrap();
        let r1 = profile.criterion("R1").unwrap();
        assert!(reads_section(r1, "forecast"));
        assert!(!reads_section(r1, "overview"));
    }
}
