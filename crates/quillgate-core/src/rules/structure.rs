//! Structural checks: presence, length and block completeness.

use super::{not_applicable, RuleContext};
use crate::profile::Criterion;
use crate::sections::word_count;
use crate::types::CriterionResult;

pub(super) fn section_present(criterion: &Criterion, ctx: &RuleContext<'_>) -> CriterionResult {
    let name = criterion.section.as_deref().unwrap_or_default();
    match ctx.section(name) {
        Some(s) if s.inferred => CriterionResult::scored(
            &criterion.id,
            1.0,
            format!("Section '{}' located by position (header: {:?})", name, s.header().trim()),
        ),
        Some(_) => CriterionResult::scored(&criterion.id, 1.0, format!("Section '{}' present", name)),
        None => CriterionResult::scored(&criterion.id, 0.0, format!("Section '{}' is missing", name)),
    }
}

pub(super) fn length_bounds(
    criterion: &Criterion,
    ctx: &RuleContext<'_>,
    min_words: usize,
    max_words: Option<usize>,
) -> CriterionResult {
    let words = match &criterion.section {
        Some(name) => match ctx.section(name) {
            Some(s) => word_count(s.body()),
            None => return not_applicable(criterion, format!("section '{}' absent", name)),
        },
        None => ctx.sections.iter().map(|s| word_count(&s.raw_text)).sum(),
    };

    let (score, verdict) = if words < min_words {
        (words as f64 / min_words as f64, format!("below minimum {}", min_words))
    } else {
        match max_words {
            Some(max) if words > max => (max as f64 / words as f64, format!("above maximum {}", max)),
            _ => (1.0, "within bounds".to_string()),
        }
    };

    CriterionResult::scored(&criterion.id, score, format!("{} words, {}", words, verdict))
}

pub(super) fn min_total_words(criterion: &Criterion, ctx: &RuleContext<'_>, min_words: usize) -> CriterionResult {
    let words: usize = ctx.sections.iter().map(|s| word_count(&s.raw_text)).sum();
    if words >= min_words {
        CriterionResult::scored(&criterion.id, 1.0, format!("{} words in total", words))
    } else {
        CriterionResult::scored(
            &criterion.id,
            words as f64 / min_words.max(1) as f64,
            format!("{} words in total, below floor of {}", words, min_words),
        )
    }
}

pub(super) fn block_schema(criterion: &Criterion, ctx: &RuleContext<'_>) -> CriterionResult {
    let name = criterion.section.as_deref().unwrap_or_default();
    let Some(section) = ctx.section(name) else {
        return not_applicable(criterion, format!("section '{}' absent", name));
    };

    match &section.structured_block {
        Some(block) if !block.partial => {
            CriterionResult::scored(&criterion.id, 1.0, format!("Block '{}' complete", block.schema_id))
        }
        Some(block) => {
            let recovered = block.fields.len();
            let expected = recovered + block.missing.len();
            CriterionResult::scored(
                &criterion.id,
                recovered as f64 / expected as f64,
                format!("Block '{}' partial, missing: {}", block.schema_id, block.missing.join(", ")),
            )
        }
        None => {
            let reason = ctx
                .schema_error(name)
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("No structured block in section '{}'", name));
            CriterionResult::scored(&criterion.id, 0.0, format!("SchemaError: {}", reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::SchemaError;
    use crate::profile::{CriterionKind, RuleCheck};
    use crate::types::{Section, StructuredBlock};
    use std::collections::BTreeMap;

    fn criterion(section: Option<&str>, check: RuleCheck) -> Criterion {
        Criterion {
            id: "R".to_string(),
            weight: 0.5,
            kind: CriterionKind::Rule,
            pass_threshold: 0.5,
            section: section.map(str::to_string),
            check: Some(check),
            dimension: None,
            description: None,
        }
    }

    fn section(name: &str, body: &str) -> Section {
        Section {
            name: Some(name.to_string()),
            order_index: 0,
            required: true,
            raw_text: format!("{name}\n{body}"),
            header_len: name.len() + 1,
            inferred: false,
            structured_block: None,
        }
    }

    #[test]
    fn test_length_above_max() {
        let sections = vec![section("forecast", "a b c d e f g h")];
        let c = criterion(
            Some("forecast"),
            RuleCheck::LengthBounds {
                min_words: 1,
                max_words: Some(4),
            },
        );
        let r = length_bounds(&c, &RuleContext::new(&sections, &[]), 1, Some(4));
        assert_eq!(r.score, 0.5);
    }

    #[test]
    fn test_length_absent_optional_section() {
        let c = criterion(
            Some("advice"),
            RuleCheck::LengthBounds {
                min_words: 10,
                max_words: None,
            },
        );
        let r = length_bounds(&c, &RuleContext::new(&[], &[]), 10, None);
        assert_eq!(r.score, 1.0);
        assert!(r.explanation.starts_with("Not applicable"));
    }

    #[test]
    fn test_min_total_words() {
        let sections = vec![section("a", "one two"), section("b", "three")];
        let c = criterion(None, RuleCheck::MinTotalWords { min_words: 10 });
        let r = min_total_words(&c, &RuleContext::new(&sections, &[]), 10);
        // headers count too: a, one, two, b, three
        assert_eq!(r.score, 0.5);
    }

    #[test]
    fn test_block_schema_scores() {
        let mut s = section("forecast", "x");
        let c = criterion(Some("forecast"), RuleCheck::BlockSchema);

        let errors = vec![SchemaError {
            section: "forecast".to_string(),
            schema_id: "forecast_data".to_string(),
            reason: "no recoverable fields".to_string(),
        }];
        let r = block_schema(&c, &RuleContext::new(std::slice::from_ref(&s), &errors));
        assert_eq!(r.score, 0.0);
        assert!(r.explanation.contains("no recoverable fields"));

        let mut fields = BTreeMap::new();
        fields.insert("sign".to_string(), serde_json::json!("Leo"));
        s.structured_block = Some(StructuredBlock {
            schema_id: "forecast_data".to_string(),
            fields,
            partial: true,
            missing: vec!["growth_index".to_string()],
        });
        let r = block_schema(&c, &RuleContext::new(std::slice::from_ref(&s), &[]));
        assert_eq!(r.score, 0.5);
    }

    #[test]
    fn test_inferred_section_present_noted() {
        let mut s = section("forecast", "x");
        s.inferred = true;
        let c = criterion(Some("forecast"), RuleCheck::SectionPresent);
        let r = section_present(&c, &RuleContext::new(std::slice::from_ref(&s), &[]));
        assert_eq!(r.score, 1.0);
        assert!(r.explanation.contains("by position"));
    }
}
