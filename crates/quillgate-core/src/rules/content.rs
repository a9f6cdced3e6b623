//! Content checks: leakage, forbidden phrases and markup.

use regex::Regex;

use super::patterns::{leakage_hits, markup_hits, strip_fences};
use super::{not_applicable, RuleContext};
use crate::profile::Criterion;
use crate::types::CriterionResult;

/// At most this many offending snippets are quoted in an explanation.
const QUOTED_HITS: usize = 3;

fn describe(hits: &[String]) -> String {
    let mut quoted: Vec<String> = hits.iter().take(QUOTED_HITS).map(|h| format!("{:?}", h)).collect();
    if hits.len() > QUOTED_HITS {
        quoted.push(format!("and {} more", hits.len() - QUOTED_HITS));
    }
    quoted.join(", ")
}

fn scope_or_skip(criterion: &Criterion, ctx: &RuleContext<'_>) -> Result<String, CriterionResult> {
    ctx.scope_text(criterion).ok_or_else(|| {
        not_applicable(
            criterion,
            format!("section '{}' absent", criterion.section.as_deref().unwrap_or_default()),
        )
    })
}

pub(super) fn placeholder_leakage(
    criterion: &Criterion,
    ctx: &RuleContext<'_>,
    extra_patterns: &[String],
) -> CriterionResult {
    let text = match scope_or_skip(criterion, ctx) {
        Ok(text) => text,
        Err(skipped) => return skipped,
    };

    let mut hits = leakage_hits(&text);
    for pattern in extra_patterns {
        // Profile loading rejects invalid patterns; fall back to a literal match regardless
        let re = Regex::new(pattern).or_else(|_| Regex::new(&regex::escape(pattern)));
        if let Ok(re) = re {
            hits.extend(re.find_iter(&text).map(|m| m.as_str().to_string()));
        }
    }

    if hits.is_empty() {
        CriterionResult::scored(&criterion.id, 1.0, "No placeholder or source leakage")
    } else {
        CriterionResult::scored(
            &criterion.id,
            1.0 / (1.0 + hits.len() as f64),
            format!("{} leaked fragment(s): {}", hits.len(), describe(&hits)),
        )
    }
}

pub(super) fn forbidden_phrases(criterion: &Criterion, ctx: &RuleContext<'_>, phrases: &[String]) -> CriterionResult {
    let text = match scope_or_skip(criterion, ctx) {
        Ok(text) => text.to_lowercase(),
        Err(skipped) => return skipped,
    };

    let hits: Vec<String> = phrases
        .iter()
        .flat_map(|phrase| {
            let needle = phrase.to_lowercase();
            let count = if needle.is_empty() { 0 } else { text.matches(&needle).count() };
            std::iter::repeat(phrase.clone()).take(count)
        })
        .collect();

    if hits.is_empty() {
        CriterionResult::scored(&criterion.id, 1.0, "No forbidden phrases")
    } else {
        CriterionResult::scored(
            &criterion.id,
            1.0 / (1.0 + hits.len() as f64),
            format!("{} forbidden phrase(s): {}", hits.len(), describe(&hits)),
        )
    }
}

pub(super) fn no_markup(criterion: &Criterion, ctx: &RuleContext<'_>) -> CriterionResult {
    let text = match scope_or_skip(criterion, ctx) {
        Ok(text) => strip_fences(&text),
        Err(skipped) => return skipped,
    };

    let hits = markup_hits(&text);
    if hits.is_empty() {
        CriterionResult::scored(&criterion.id, 1.0, "No Markdown or HTML")
    } else {
        CriterionResult::scored(
            &criterion.id,
            0.0,
            format!("{} markup construct(s): {}", hits.len(), describe(&hits)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{CriterionKind, RuleCheck};
    use crate::types::Section;

    fn criterion(section: Option<&str>) -> Criterion {
        Criterion {
            id: "R".to_string(),
            weight: 0.5,
            kind: CriterionKind::Rule,
            pass_threshold: 0.5,
            section: section.map(str::to_string),
            check: Some(RuleCheck::NoMarkup),
            dimension: None,
            description: None,
        }
    }

    fn sections(body: &str) -> Vec<Section> {
        vec![Section {
            name: Some("forecast".to_string()),
            order_index: 0,
            required: true,
            raw_text: format!("Forecast\n{body}"),
            header_len: 9,
            inferred: false,
            structured_block: None,
        }]
    }

    #[test]
    fn test_leakage_scores_decay() {
        let s = sections("Dear {{client}}, data by prokerala.\n");
        let r = placeholder_leakage(&criterion(None), &RuleContext::new(&s, &[]), &[]);
        assert!((r.score - 1.0 / 3.0).abs() < 1e-9);
        assert!(r.explanation.contains("prokerala"));
    }

    #[test]
    fn test_leakage_extra_patterns() {
        let s = sections("Report for ACME-XXXX\n");
        let r = placeholder_leakage(&criterion(None), &RuleContext::new(&s, &[]), &["XXXX".to_string()]);
        assert_eq!(r.score, 0.5);
    }

    #[test]
    fn test_forbidden_phrases_case_insensitive() {
        let s = sections("You should definitely BUY SHARES now. Buy shares!\n");
        let r = forbidden_phrases(
            &criterion(Some("forecast")),
            &RuleContext::new(&s, &[]),
            &["buy shares".to_string()],
        );
        assert!((r.score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_markup_ignores_data_fence() {
        let s = sections("Plain text.\n```data\n{\"sign\": \"Leo\"}\n```\n");
        let r = no_markup(&criterion(Some("forecast")), &RuleContext::new(&s, &[]));
        assert_eq!(r.score, 1.0);

        let s = sections("Some **bold** claim.\n");
        let r = no_markup(&criterion(Some("forecast")), &RuleContext::new(&s, &[]));
        assert_eq!(r.score, 0.0);
    }

    #[test]
    fn test_absent_section_not_applicable() {
        let r = no_markup(&criterion(Some("advice")), &RuleContext::new(&[], &[]));
        assert_eq!(r.score, 1.0);
    }
}
