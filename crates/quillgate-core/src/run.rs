//! The record of one orchestration pass.
//!
//! A [`ValidationRun`] is created when an artifact arrives, mutated only by
//! the orchestrator, then closed into an immutable [`ClosedRun`] that is
//! handed to the outcome recorder. Closed runs serialize to one JSON record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::blocks::SchemaError;
use crate::profile::{Limits, QualityProfile};
use crate::sections::ParseError;
use crate::types::{DecisionBand, GenerationArtifact, PatchInstruction, ScoreCard};

/// SHA-256 hex digest of artifact text.
pub fn text_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// States of the orchestration state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Parse,
    Validate,
    Score,
    Decide,
    PatchLoop,
    RegenerateLoop,
    Final,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::Parse => "PARSE",
            RunState::Validate => "VALIDATE",
            RunState::Score => "SCORE",
            RunState::Decide => "DECIDE",
            RunState::PatchLoop => "PATCH_LOOP",
            RunState::RegenerateLoop => "REGENERATE_LOOP",
            RunState::Final => "FINAL",
        };
        f.write_str(s)
    }
}

/// One state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

/// Retry counters. Per-run totals that never decrease.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    /// Patch rounds started
    pub patch_rounds: u32,

    /// Individual section replacements requested from the generator
    pub patch_requests: u32,

    /// Full regenerations requested
    pub regenerations: u32,
}

impl Counters {
    /// Start a patch round if the budget allows.
    pub fn begin_patch_round(&mut self, limits: &Limits) -> bool {
        if self.patch_rounds >= limits.max_patch_rounds {
            return false;
        }
        self.patch_rounds += 1;
        true
    }

    /// Start a regeneration if the budget allows.
    pub fn begin_regeneration(&mut self, limits: &Limits) -> bool {
        if self.regenerations >= limits.max_regenerate_rounds {
            return false;
        }
        self.regenerations += 1;
        true
    }
}

/// A reason the run's output is below full confidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Critic criteria could not be judged for an attempt
    CriticUnavailable { attempt: u32, reason: String },

    /// The returned artifact never cleared the acceptance bar
    BelowQualityBar { attempt: u32, total: Option<f64> },
}

impl Degradation {
    /// The attempt this degradation was recorded against.
    pub fn attempt(&self) -> u32 {
        match self {
            Degradation::CriticUnavailable { attempt, .. } | Degradation::BelowQualityBar { attempt, .. } => *attempt,
        }
    }
}

/// How an artifact came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOrigin {
    Initial,
    Patched,
    Regenerated,
}

/// One artifact judged during the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub origin: AttemptOrigin,
    pub text_digest: String,
    pub text_chars: usize,

    #[serde(default)]
    pub parse_error: Option<ParseError>,

    #[serde(default)]
    pub schema_errors: Vec<SchemaError>,

    /// Absent when the artifact could not be parsed or scored
    #[serde(default)]
    pub scorecard: Option<ScoreCard>,

    #[serde(default)]
    pub error: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(artifact: &GenerationArtifact, origin: AttemptOrigin) -> Self {
        Self {
            attempt: artifact.attempt,
            origin,
            text_digest: text_digest(&artifact.text),
            text_chars: artifact.text.chars().count(),
            parse_error: None,
            schema_errors: Vec::new(),
            scorecard: None,
            error: None,
            recorded_at: Utc::now(),
        }
    }
}

/// Result of one requested section replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    Refused { reason: String },
    GeneratorFailed { reason: String },
}

/// A section replacement attempted during a patch round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchRecord {
    pub round: u32,
    pub section: String,
    pub failing: Vec<String>,
    pub outcome: PatchOutcome,

    /// Present when the generator produced a replacement
    #[serde(default)]
    pub instruction: Option<PatchInstruction>,
}

/// Why a run ended without an accepted artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RunFailure {
    /// Regeneration budget spent with no accepted artifact
    RegenerateExhausted,

    /// The generator could not produce a regeneration
    GeneratorUnavailable { detail: String },

    /// The caller gave up
    Cancelled,
}

/// Terminal decision of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Accepted,
    Failed { failure: RunFailure },
}

impl RunOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RunOutcome::Accepted)
    }
}

/// A run in progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationRun {
    pub run_id: Uuid,
    pub request_id: String,

    /// "name@version" of the profile the run was judged against
    pub profile: String,

    pub state: RunState,
    pub trail: Vec<Transition>,
    pub attempts: Vec<AttemptRecord>,
    pub patches: Vec<PatchRecord>,
    pub counters: Counters,
    pub degradations: Vec<Degradation>,
    pub started_at: DateTime<Utc>,
}

impl ValidationRun {
    pub fn new(request_id: impl Into<String>, profile: &QualityProfile) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request_id: request_id.into(),
            profile: format!("{}@{}", profile.name, profile.profile_version),
            state: RunState::Init,
            trail: Vec::new(),
            attempts: Vec::new(),
            patches: Vec::new(),
            counters: Counters::default(),
            degradations: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Move to a new state.
    pub fn transition(&mut self, to: RunState) {
        let from = self.state;
        tracing::debug!(run_id = %self.run_id, %from, %to, "State transition");
        self.trail.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }

    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
    }

    /// The record of the most recent attempt, for filling in as stages finish.
    pub fn current_attempt_mut(&mut self) -> Option<&mut AttemptRecord> {
        self.attempts.last_mut()
    }

    pub fn record_patch(&mut self, record: PatchRecord) {
        self.patches.push(record);
    }

    pub fn degrade(&mut self, degradation: Degradation) {
        tracing::warn!(run_id = %self.run_id, ?degradation, "Run degraded");
        self.degradations.push(degradation);
    }

    /// Degradations recorded against one attempt.
    pub fn degradations_for(&self, attempt: u32) -> impl Iterator<Item = &Degradation> {
        self.degradations.iter().filter(move |d| d.attempt() == attempt)
    }

    /// Whether `artifact`, judged as `scorecard`, falls short of full confidence.
    ///
    /// Degradations of earlier attempts do not count; a criterion left
    /// unevaluated on the delivered scorecard does, wherever it came from.
    pub fn is_degraded(&self, artifact: &GenerationArtifact, scorecard: Option<&ScoreCard>) -> bool {
        let unjudged = scorecard.map_or(true, |card| card.evaluated_count() < card.results.len());
        unjudged || self.degradations_for(artifact.attempt).next().is_some()
    }

    /// Close the run. No further mutation is possible.
    pub fn close(mut self, outcome: RunOutcome, final_artifact: &GenerationArtifact, scorecard: Option<ScoreCard>) -> ClosedRun {
        if self.state != RunState::Final {
            self.transition(RunState::Final);
        }

        let degraded = !outcome.is_accepted() || self.is_degraded(final_artifact, scorecard.as_ref());
        tracing::info!(
            run_id = %self.run_id,
            request_id = %self.request_id,
            accepted = outcome.is_accepted(),
            degraded,
            attempts = self.attempts.len(),
            patch_rounds = self.counters.patch_rounds,
            regenerations = self.counters.regenerations,
            total = scorecard.as_ref().map(|c| c.total),
            "Run closed"
        );

        ClosedRun {
            final_attempt: final_artifact.attempt,
            final_text_digest: text_digest(&final_artifact.text),
            final_band: scorecard.as_ref().map(|c| c.decision_band),
            final_total: scorecard.as_ref().map(|c| c.total),
            run: self,
            outcome,
            degraded,
            closed_at: Utc::now(),
        }
    }
}

/// An immutable, finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedRun {
    #[serde(flatten)]
    pub run: ValidationRun,

    pub outcome: RunOutcome,
    pub degraded: bool,
    pub final_attempt: u32,
    pub final_text_digest: String,

    #[serde(default)]
    pub final_band: Option<DecisionBand>,

    #[serde(default)]
    pub final_total: Option<f64>,

    pub closed_at: DateTime<Utc>,
}
