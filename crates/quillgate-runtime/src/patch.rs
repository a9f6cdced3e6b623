//! Patch applier.
//!
//! One patch round asks the generator for a replacement of every targeted
//! section, splices each accepted replacement into a scratch copy of the
//! sections, then re-validates only what the patched sections feed:
//!
//! 1. the patched section's block is re-extracted
//! 2. rule criteria reading a patched section are re-run
//! 3. critic criteria scoped to a patched section become unevaluated and
//!    are listed in [`PatchRound::awaiting`]
//!
//! and recomputes the touched sub-scores and the total. The orchestrator
//! then asks the critic about the patched artifact before deciding again.
//! The caller's sections are never modified, so an abandoned round leaves
//! nothing half-applied.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use quillgate_core::{
    serialize_sections, AggregationError, CriterionResult, GenerationArtifact, PatchInstruction,
    PatchOutcome, PatchRecord, PatchTarget, QualityProfile, RuleContext, RuleValidator,
    SchemaError, ScoreAggregator, ScoreCard, Section, Splicer,
};

use crate::cancel::{CancelToken, Cancelled};
use crate::resilience::{CircuitBreaker, Upstream};
use crate::services::{Feedback, Generator, GeneratorError};

/// Explanation carried by critic criteria invalidated by a patch.
pub const AWAITING_REJUDGEMENT: &str = "Awaiting re-judgement after patch";

/// Why a patch round produced no usable result.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch round {round}: no replacement could be applied")]
    NothingApplied { round: u32, records: Vec<PatchRecord> },

    #[error("Patch round {round}: rescoring failed: {source}")]
    Rescore {
        round: u32,
        records: Vec<PatchRecord>,
        #[source]
        source: AggregationError,
    },

    #[error("Patch round cancelled")]
    Cancelled { records: Vec<PatchRecord> },
}

impl PatchError {
    /// Patch records gathered before the round failed.
    pub fn into_records(self) -> Vec<PatchRecord> {
        match self {
            PatchError::NothingApplied { records, .. }
            | PatchError::Rescore { records, .. }
            | PatchError::Cancelled { records } => records,
        }
    }
}

/// Input state of a patch round.
#[derive(Debug, Clone, Copy)]
pub struct PatchInput<'a> {
    pub artifact: &'a GenerationArtifact,
    pub sections: &'a [Section],
    pub schema_errors: &'a [SchemaError],
    pub scorecard: &'a ScoreCard,
}

/// A completed patch round.
#[derive(Debug, Clone)]
pub struct PatchRound {
    pub round: u32,

    /// The patched artifact (next attempt number)
    pub artifact: GenerationArtifact,
    pub sections: Vec<Section>,
    pub schema_errors: Vec<SchemaError>,
    pub scorecard: ScoreCard,

    /// One record per target, applied or not
    pub records: Vec<PatchRecord>,

    /// Replacements requested from the generator this round
    pub requests: u32,

    /// Critic criteria invalidated by the patch, pending a new verdict
    pub awaiting: Vec<String>,
}

impl PatchRound {
    pub fn applied(&self) -> impl Iterator<Item = &PatchRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, PatchOutcome::Applied))
    }
}

/// Requests and splices section replacements.
pub struct PatchApplier {
    generator: Arc<dyn Generator>,
    profile: Arc<QualityProfile>,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl PatchApplier {
    pub fn new(
        generator: Arc<dyn Generator>,
        profile: Arc<QualityProfile>,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            generator,
            profile,
            timeout,
            breaker,
        }
    }

    /// Run one patch round over `targets`.
    pub async fn apply_round(
        &self,
        input: PatchInput<'_>,
        targets: &[PatchTarget],
        round: u32,
        cancel: &CancelToken,
    ) -> Result<PatchRound, PatchError> {
        let splicer = Splicer::new(&self.profile);
        let mut sections = input.sections.to_vec();
        let mut schema_errors = input.schema_errors.to_vec();
        let mut records = Vec::with_capacity(targets.len());
        let mut patched: Vec<String> = Vec::new();
        let mut requests = 0;

        for target in targets {
            let mut feedback = Feedback::default();
            feedback.add_failures(&self.profile, input.scorecard, Some(&target.failing));
            if let Some(err) = schema_errors.iter().find(|e| e.section == target.section) {
                feedback.note(err.to_string());
            }

            let context = GenerationArtifact {
                text: serialize_sections(&sections),
                attempt: input.artifact.attempt,
                request_id: input.artifact.request_id.clone(),
            };

            requests += 1;
            let reply = match self.request(&context, &target.section, &feedback, cancel).await {
                Ok(reply) => reply,
                Err(Cancelled) => return Err(PatchError::Cancelled { records }),
            };

            let mut record = PatchRecord {
                round,
                section: target.section.clone(),
                failing: target.failing.clone(),
                outcome: PatchOutcome::Applied,
                instruction: None,
            };

            let replacement = match reply {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(section = %target.section, round, error = %e, "Patch request failed");
                    record.outcome = PatchOutcome::GeneratorFailed { reason: e.to_string() };
                    records.push(record);
                    continue;
                }
            };

            record.instruction = Some(PatchInstruction {
                section_name: target.section.clone(),
                replacement_text: replacement.clone(),
                origin: target.origin,
                attempt: round,
            });

            match splicer.splice(&sections, &target.section, &replacement) {
                Ok(spliced) => {
                    sections = spliced.sections;
                    schema_errors.retain(|e| e.section != target.section);
                    schema_errors.extend(spliced.schema_error);
                    patched.push(target.section.clone());
                    tracing::debug!(section = %target.section, round, "Patch applied");
                }
                Err(e) => {
                    tracing::warn!(section = %target.section, round, error = %e, "Patch refused");
                    record.outcome = PatchOutcome::Refused { reason: e.to_string() };
                }
            }
            records.push(record);
        }

        if patched.is_empty() {
            return Err(PatchError::NothingApplied { round, records });
        }

        let updates = self.revalidate(&patched, &sections, &schema_errors);
        let awaiting = updates
            .iter()
            .filter(|r| self.profile.criterion(&r.criterion_id).is_some_and(|c| c.is_critic()))
            .map(|r| r.criterion_id.clone())
            .collect();
        let scorecard = match ScoreAggregator::new(&self.profile).rescore(input.scorecard, updates) {
            Ok(card) => card,
            Err(source) => return Err(PatchError::Rescore { round, records, source }),
        };

        Ok(PatchRound {
            round,
            artifact: input.artifact.next_attempt(serialize_sections(&sections)),
            sections,
            schema_errors,
            scorecard,
            records,
            requests,
            awaiting,
        })
    }

    /// Results for every criterion affected by the patched sections.
    fn revalidate(&self, patched: &[String], sections: &[Section], schema_errors: &[SchemaError]) -> Vec<CriterionResult> {
        let ctx = RuleContext::new(sections, schema_errors);
        let mut updates = RuleValidator::new(&self.profile).revalidate(patched, &ctx);
        updates.extend(
            patched
                .iter()
                .flat_map(|s| self.profile.criteria_for_section(s))
                .filter(|c| c.is_critic())
                .map(|c| CriterionResult::not_evaluated(&c.id, AWAITING_REJUDGEMENT)),
        );
        updates
    }

    async fn request(
        &self,
        artifact: &GenerationArtifact,
        section: &str,
        feedback: &Feedback,
        cancel: &CancelToken,
    ) -> Result<Result<String, GeneratorError>, Cancelled> {
        if self.breaker.is_open(Upstream::Generator) {
            return Ok(Err(GeneratorError::CircuitOpen));
        }

        let call = tokio::time::timeout(self.timeout, self.generator.patch_section(artifact, section, feedback));
        let outcome = match cancel.guard(call).await? {
            Ok(Ok(text)) if text.trim().is_empty() => {
                self.breaker.record_success(Upstream::Generator);
                Err(GeneratorError::EmptyOutput)
            }
            Ok(Ok(text)) => {
                self.breaker.record_success(Upstream::Generator);
                Ok(text)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(Upstream::Generator);
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure(Upstream::Generator);
                Err(GeneratorError::Timeout(self.timeout))
            }
        };
        Ok(outcome)
    }
}
