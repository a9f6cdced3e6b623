//! # quillgate-core
//!
//! Deterministic quality assessment for long-form generated text.
//!
//! This crate answers, for one generated artifact:
//! - Does it have the expected structure?
//! - How well does it meet each configured criterion?
//! - Should it be accepted, patched, regenerated or rejected?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: same text and profile always produce the same scorecard
//! 2. **No I/O**: beyond reading a profile file, nothing here touches the network
//! 3. **Lossless**: parsed sections always concatenate back to the input text
//! 4. **Soft failures are excluded, not zeroed**: unevaluated criteria drop out
//!    of the weighted mean
//!
//! Judgment-based (critic) criteria and the retry loop live in
//! `quillgate-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quillgate_core::{assess, QualityProfile, Decision};
//!
//! let profile = QualityProfile::from_file("profiles/company-zodiac.yaml")?;
//! let assessment = assess(&profile, &text, Vec::new())?;
//!
//! match assessment.decision {
//!     Decision::Accept => println!("OK: {:.2}", assessment.scorecard.total),
//!     Decision::Patch(targets) => println!("PATCH: {} section(s)", targets.len()),
//!     Decision::Regenerate | Decision::Reject => println!("REGENERATE"),
//! }
//! ```

pub mod aggregator;
pub mod blocks;
pub mod profile;
pub mod rules;
pub mod run;
pub mod sections;
pub mod splice;
pub mod types;

// Re-export main types at crate root
pub use aggregator::{AggregationError, Decision, PatchTarget, ScoreAggregator};
pub use blocks::{SchemaError, StructuredBlockExtractor};
pub use profile::{
    BlockSchemaSpec, Criterion, CriterionKind, Limits, ProfileError, QualityProfile, RuleCheck,
    SectionPrecedence, SectionSpec, Thresholds,
};
pub use rules::{RuleContext, RuleValidator};
pub use run::{
    AttemptOrigin, AttemptRecord, ClosedRun, Counters, Degradation, PatchOutcome, PatchRecord,
    RunFailure, RunOutcome, RunState, ValidationRun,
};
pub use sections::{normalize_marker, word_count, ParseError, SectionParser};
pub use splice::{SpliceError, Spliced, Splicer};
pub use types::{
    serialize_sections, CriterionResult, DecisionBand, GenerationArtifact, Origin,
    PatchInstruction, ScoreCard, Section, StructuredBlock,
};

use thiserror::Error;

/// Errors that can occur during a one-shot assessment
#[derive(Error, Debug)]
pub enum AssessError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Parsed sections, scorecard and decision for one artifact.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub sections: Vec<Section>,
    pub schema_errors: Vec<SchemaError>,
    pub scorecard: ScoreCard,
    pub decision: Decision,
}

/// Parse, validate and score a text in one pass.
///
/// `critic_results` carries any externally judged critic criteria; critic
/// criteria without a result are recorded as not evaluated.
pub fn assess(
    profile: &QualityProfile,
    text: &str,
    critic_results: Vec<CriterionResult>,
) -> Result<Assessment, AssessError> {
    let mut sections = SectionParser::new(profile).parse(text)?;
    let schema_errors = StructuredBlockExtractor::new(profile).extract_all(&mut sections);

    let ctx = RuleContext::new(&sections, &schema_errors);
    let mut results = RuleValidator::new(profile).validate(&ctx);
    results.extend(critic_results);

    let aggregator = ScoreAggregator::new(profile);
    let scorecard = aggregator.aggregate(results)?;
    let decision = aggregator.decide(&scorecard);

    Ok(Assessment {
        sections,
        schema_errors,
        scorecard,
        decision,
    })
}
