//! Figure sanity and cross-section consistency.

use serde_json::Value as JsonValue;

use super::patterns::{percentages, strip_fences};
use super::{not_applicable, RuleContext};
use crate::profile::Criterion;
use crate::types::CriterionResult;

pub(super) fn numeric_range(
    criterion: &Criterion,
    ctx: &RuleContext<'_>,
    field: Option<&str>,
    min: f64,
    max: f64,
) -> CriterionResult {
    let name = criterion.section.as_deref().unwrap_or_default();
    let Some(section) = ctx.section(name) else {
        return not_applicable(criterion, format!("section '{}' absent", name));
    };

    let mut figures: Vec<(String, f64)> = Vec::new();
    if let Some(block) = &section.structured_block {
        match field {
            Some(f) => figures.extend(block.number(f).map(|v| (f.to_string(), v))),
            None => figures.extend(
                block
                    .fields
                    .keys()
                    .filter_map(|k| block.number(k).map(|v| (k.clone(), v))),
            ),
        }
    }
    if field.is_none() {
        let prose = strip_fences(section.body());
        figures.extend(percentages(&prose).into_iter().map(|v| (format!("{}%", v), v)));
    }

    if figures.is_empty() {
        return not_applicable(criterion, "no figures to check");
    }

    let out_of_range: Vec<String> = figures
        .iter()
        .filter(|(_, v)| !(min..=max).contains(v))
        .map(|(label, v)| format!("{}={}", label, v))
        .collect();

    let in_range = figures.len() - out_of_range.len();
    let score = in_range as f64 / figures.len() as f64;
    let explanation = if out_of_range.is_empty() {
        format!("{} figure(s) within [{}, {}]", figures.len(), min, max)
    } else {
        format!("Out of [{}, {}]: {}", min, max, out_of_range.join(", "))
    };

    CriterionResult::scored(&criterion.id, score, explanation)
}

fn normalized(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_lowercase(),
        JsonValue::Number(n) => n.as_f64().map(|f| f.to_string()).unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

pub(super) fn cross_reference(
    criterion: &Criterion,
    ctx: &RuleContext<'_>,
    fields: &[String],
    sections: &[String],
) -> CriterionResult {
    let absent: Vec<&str> = sections
        .iter()
        .filter(|s| ctx.section(s).is_none())
        .map(String::as_str)
        .collect();
    if !absent.is_empty() {
        return CriterionResult::scored(
            &criterion.id,
            0.0,
            format!("Cross-referenced section(s) missing: {}", absent.join(", ")),
        );
    }

    let mut disagreements = Vec::new();
    for field in fields {
        let values: Vec<Option<String>> = sections
            .iter()
            .map(|s| {
                ctx.section(s)
                    .and_then(|sec| sec.structured_block.as_ref())
                    .and_then(|b| b.fields.get(field))
                    .map(normalized)
            })
            .collect();

        let agree = values.iter().all(Option::is_some) && values.windows(2).all(|w| w[0] == w[1]);
        if !agree {
            let shown: Vec<String> = values
                .iter()
                .map(|v| v.clone().unwrap_or_else(|| "<missing>".to_string()))
                .collect();
            disagreements.push(format!("{} ({})", field, shown.join(" vs ")));
        }
    }

    let agreeing = fields.len() - disagreements.len();
    let score = agreeing as f64 / fields.len().max(1) as f64;
    let explanation = if disagreements.is_empty() {
        format!("{} field(s) agree across {}", fields.len(), sections.join(", "))
    } else {
        format!("Inconsistent: {}", disagreements.join("; "))
    };

    CriterionResult::scored(&criterion.id, score, explanation)
}
