//! System prompts for the LLM-backed critic and generator.
//!
//! The system prompts are stable across calls and are sent as cacheable
//! blocks. Everything that changes per call (the report, the rubric, the
//! feedback) goes into the user turn.

use crate::services::{Feedback, Rubric};

/// System prompt for the critic.
///
/// The critic scores on a 0 to 10 scale; the adapter normalises to [0, 1].
pub const CRITIC_SYSTEM_PROMPT: &str = r#"
You are an independent reviewer of business astrology reports.

You score a finished report against a fixed rubric.
You do not rewrite the report.
You do not invent criteria beyond the rubric.

## Scoring
- Score every rubric item on a scale from 0 to 10
- 10 means the report fully meets the item, 0 means it ignores it entirely
- Judge the whole report, but weigh the section an item names most heavily
- Keep each explanation to one or two sentences and point at concrete text

## Output Format (JSON only, no prose around it)
{
  "scores": {
    "<criterion id>": { "score": 0-10, "explanation": "string" }
  }
}

Every rubric id must appear exactly once in "scores".
"#;

/// System prompt for single-section rewrites.
pub const PATCH_SYSTEM_PROMPT: &str = r#"
You revise one section of a business astrology report.

## Rules
- Rewrite ONLY the named section; the rest of the report is context
- Fix every listed problem
- Keep the facts, names and figures already present unless a problem names them
- Do not shorten the section; extend and improve it
- Keep any structured data block in the section and keep it valid
- Do not repeat the section header and do not start any other section

Return only the new section body, without commentary.
"#;

/// System prompt for full regeneration.
pub const REGENERATE_SYSTEM_PROMPT: &str = r#"
You write business astrology reports for companies.

The previous draft was rejected by quality review. Write a complete new
report that addresses every listed problem.

## Rules
- Include every required section, in order, each under its usual header
- Use a professional, confident tone; move from the astrological picture to business logic
- Keep structured data blocks complete and valid
- Do not mention data sources, tools or the review itself

Return only the report text, without commentary.
"#;

/// System prompt for first drafts.
pub const GENERATE_SYSTEM_PROMPT: &str = r#"
You write business astrology reports for companies.

Use the facts provided by the user as the only source of company data.
Include every required section, in order, each under its usual header.
Keep structured data blocks complete and valid.

Return only the report text, without commentary.
"#;

/// User turn for a critic call.
pub fn render_critic_request(report: &str, rubric: &Rubric) -> String {
    let mut out = String::from("## Rubric\n");
    for item in &rubric.items {
        out.push_str(&format!("- {} ({})", item.criterion_id, item.dimension));
        if let Some(section) = &item.section {
            out.push_str(&format!(" [section: {}]", section));
        }
        if let Some(description) = &item.description {
            out.push_str(&format!(": {}", description));
        }
        out.push('\n');
    }
    out.push_str("\n## Report\n");
    out.push_str(report);
    out
}

/// User turn for a section rewrite.
pub fn render_patch_request(report: &str, section: &str, feedback: &Feedback) -> String {
    format!(
        "## Section to rewrite\n{}\n\n## Problems\n{}\n## Report\n{}",
        section,
        problems(feedback),
        report
    )
}

/// User turn for a full regeneration.
pub fn render_regenerate_request(report: &str, feedback: &Feedback) -> String {
    format!("## Problems\n{}\n## Previous draft\n{}", problems(feedback), report)
}

fn problems(feedback: &Feedback) -> String {
    if feedback.is_empty() {
        "- Improve overall quality\n".to_string()
    } else {
        feedback.render()
    }
}
