//! Core data model: artifacts, sections, structured blocks and scores.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::profile::CriterionKind;

/// One generated text document under evaluation.
///
/// Immutable once produced. A patched or regenerated artifact is a new
/// value with a new attempt number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationArtifact {
    /// The raw generated text
    pub text: String,

    /// Attempt number within a run (0 = first draft)
    pub attempt: u32,

    /// Id of the originating request
    pub request_id: String,
}

impl GenerationArtifact {
    /// Create a first-draft artifact.
    pub fn new(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attempt: 0,
            request_id: request_id.into(),
        }
    }

    /// Derive the next attempt of the same request with new text.
    pub fn next_attempt(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attempt: self.attempt + 1,
            request_id: self.request_id.clone(),
        }
    }
}

/// A named, ordered span of an artifact.
///
/// `raw_text` includes the section's own header line, so concatenating the
/// `raw_text` of every section reproduces the artifact byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    /// Configured section name; `None` for preamble or unknown trailing content
    pub name: Option<String>,

    /// Position in the artifact
    pub order_index: usize,

    /// Whether the profile marks this section as mandatory
    pub required: bool,

    /// Exact text of the span, header line included
    pub raw_text: String,

    /// Byte length of the header line (including its newline)
    pub header_len: usize,

    /// True when the header was located by positional inference
    #[serde(default)]
    pub inferred: bool,

    /// Parsed structured data, if the section carries a block
    #[serde(default)]
    pub structured_block: Option<StructuredBlock>,
}

impl Section {
    /// The header line of the section (empty for unnamed preamble).
    pub fn header(&self) -> &str {
        &self.raw_text[..self.header_len]
    }

    /// The section text without its header line.
    pub fn body(&self) -> &str {
        &self.raw_text[self.header_len..]
    }

    /// Whether this section carries the given configured name.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }

    /// Human-readable label, also used for unnamed sections in logs.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("(unnamed #{})", self.order_index),
        }
    }
}

/// Concatenate sections back into artifact text.
pub fn serialize_sections(sections: &[Section]) -> String {
    sections.iter().map(|s| s.raw_text.as_str()).collect()
}

/// Parsed key/value data extracted from a section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredBlock {
    /// Schema the block is expected to follow
    pub schema_id: String,

    /// Recovered fields
    pub fields: BTreeMap<String, JsonValue>,

    /// True if only some fields could be recovered
    pub partial: bool,

    /// Expected fields that could not be recovered
    #[serde(default)]
    pub missing: Vec<String>,
}

impl StructuredBlock {
    /// Numeric value of a field, accepting numbers and numeric strings.
    pub fn number(&self, field: &str) -> Option<f64> {
        match self.fields.get(field)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        }
    }
}

/// Outcome of evaluating one criterion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionResult {
    /// Criterion this result belongs to
    pub criterion_id: String,

    /// Score in [0, 1]; meaningless when `evaluated` is false
    pub score: f64,

    /// Why the criterion scored as it did
    pub explanation: String,

    /// False when the criterion could not be assessed
    pub evaluated: bool,
}

impl CriterionResult {
    /// An evaluated result. The score is clamped into [0, 1].
    pub fn scored(criterion_id: impl Into<String>, score: f64, explanation: impl Into<String>) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self {
            criterion_id: criterion_id.into(),
            score,
            explanation: explanation.into(),
            evaluated: true,
        }
    }

    /// A result for a criterion that could not be assessed.
    pub fn not_evaluated(criterion_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            criterion_id: criterion_id.into(),
            score: 0.0,
            explanation: reason.into(),
            evaluated: false,
        }
    }

    /// Whether the result clears a pass threshold. Unevaluated never passes.
    pub fn passes(&self, threshold: f64) -> bool {
        self.evaluated && self.score >= threshold
    }
}

/// Ordered decision bands over the total score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionBand {
    Accept,
    Patch,
    Regenerate,
    Reject,
}

impl std::fmt::Display for DecisionBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionBand::Accept => "ACCEPT",
            DecisionBand::Patch => "PATCH",
            DecisionBand::Regenerate => "REGENERATE",
            DecisionBand::Reject => "REJECT",
        };
        f.write_str(s)
    }
}

/// Aggregated, weighted quality assessment of an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreCard {
    /// Results in profile order
    pub results: Vec<CriterionResult>,

    /// Weighted mean over evaluated criteria
    pub total: f64,

    /// Band the total falls into
    pub decision_band: DecisionBand,

    /// Sub-scores of sections that own at least one evaluated criterion
    #[serde(default)]
    pub section_scores: BTreeMap<String, f64>,
}

impl ScoreCard {
    /// Look up a result by criterion id.
    pub fn result(&self, criterion_id: &str) -> Option<&CriterionResult> {
        self.results.iter().find(|r| r.criterion_id == criterion_id)
    }

    /// Number of criteria that contributed to the total.
    pub fn evaluated_count(&self) -> usize {
        self.results.iter().filter(|r| r.evaluated).count()
    }
}

/// Where a patch request originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Rule,
    Critic,
}

impl From<CriterionKind> for Origin {
    fn from(kind: CriterionKind) -> Self {
        match kind {
            CriterionKind::Rule => Origin::Rule,
            CriterionKind::Critic => Origin::Critic,
        }
    }
}

/// A replacement for one section, as requested from the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchInstruction {
    /// Section being replaced
    pub section_name: String,

    /// New section body
    pub replacement_text: String,

    /// Kind of criterion that made the section patch-eligible
    pub origin: Origin,

    /// Patch round that produced this instruction (1-based)
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(raw: &str, header_len: usize) -> Section {
        Section {
            name: Some("forecast".to_string()),
            order_index: 1,
            required: true,
            raw_text: raw.to_string(),
            header_len,
            inferred: false,
            structured_block: None,
        }
    }

    #[test]
    fn test_header_and_body_split() {
        let s = section("Forecast\nGood times ahead.\n", 9);
        assert_eq!(s.header(), "Forecast\n");
        assert_eq!(s.body(), "Good times ahead.\n");
        assert!(s.is_named("forecast"));
    }

    #[test]
    fn test_unnamed_label() {
        let mut s = section("tail", 0);
        s.name = None;
        s.order_index = 4;
        assert_eq!(s.label(), "(unnamed #4)");
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(CriterionResult::scored("R1", 1.7, "").score, 1.0);
        assert_eq!(CriterionResult::scored("R1", -0.2, "").score, 0.0);
        assert_eq!(CriterionResult::scored("R1", f64::NAN, "").score, 0.0);
    }

    #[test]
    fn test_not_evaluated_never_passes() {
        let r = CriterionResult::not_evaluated("C1", "critic timed out");
        assert!(!r.passes(0.0));
    }

    #[test]
    fn test_block_number_accepts_strings() {
        let mut fields = BTreeMap::new();
        fields.insert("growth".to_string(), JsonValue::String("12.5%".to_string()));
        fields.insert("risk".to_string(), serde_json::json!(3));
        let block = StructuredBlock {
            schema_id: "data".to_string(),
            fields,
            partial: false,
            missing: vec![],
        };
        assert_eq!(block.number("growth"), Some(12.5));
        assert_eq!(block.number("risk"), Some(3.0));
        assert_eq!(block.number("absent"), None);
    }

    #[test]
    fn test_next_attempt_keeps_request() {
        let a = GenerationArtifact::new("req-1", "text");
        let b = a.next_attempt("new text");
        assert_eq!(b.attempt, 1);
        assert_eq!(b.request_id, "req-1");
    }
}
