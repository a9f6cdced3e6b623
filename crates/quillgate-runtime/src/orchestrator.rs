//! Run orchestrator.
//!
//! Drives one artifact through the QA state machine:
//!
//! ```text
//! INIT -> PARSE -> VALIDATE -> SCORE -> DECIDE -> { PATCH_LOOP | REGENERATE_LOOP } -> FINAL
//! ```
//!
//! - PARSE failures skip straight to regeneration; structure cannot be patched
//! - VALIDATE fans out one blocking rule task per profile section (plus one
//!   for unscoped criteria) and runs the single critic call alongside them
//! - PATCH_LOOP returns to SCORE with the recomputed scorecard; when a
//!   patched section carries critic criteria, the critic judges the patched
//!   artifact first (VALIDATE) so no failing verdict is silently dropped
//! - REGENERATE_LOOP restarts at PARSE with a fresh artifact
//!
//! Every run ends in FINAL, is handed to the outcome sink, and returns an
//! artifact. When nothing was accepted the best-scoring artifact is returned
//! with `degraded = true`.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use quillgate_core::{
    AggregationError, AttemptOrigin, AttemptRecord, ClosedRun, CriterionResult, Decision, Degradation,
    GenerationArtifact, ParseError, QualityProfile, RuleContext, RuleValidator, RunFailure, RunOutcome,
    RunState, SchemaError, ScoreAggregator, ScoreCard, Section, SectionParser, StructuredBlockExtractor,
    ValidationRun,
};

use crate::cache::VerdictCache;
use crate::cancel::{CancelToken, Cancelled};
use crate::config::RuntimeConfig;
use crate::critic::CriticValidator;
use crate::patch::{PatchApplier, PatchError, PatchInput, PatchRound};
use crate::recorder::{NullSink, OutcomeSink};
use crate::resilience::{CircuitBreaker, Upstream};
use crate::services::{Critic, Feedback, GenerationRequest, Generator, GeneratorError};

/// Errors from the runtime orchestrator.
///
/// Only failures before a first artifact exists are errors; once a run has
/// an artifact it always ends with a [`QaResult`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Generator not configured")]
    GeneratorNotConfigured,

    #[error("Critic not configured")]
    CriticNotConfigured,

    #[error("Quality profile not configured")]
    ProfileNotConfigured,

    #[error("Initial generation failed: {0}")]
    Generation(#[from] GeneratorError),

    #[error("Run cancelled before a draft was produced")]
    Cancelled,
}

/// What the consumer receives.
#[derive(Debug, Clone)]
pub struct QaResult {
    pub final_text: String,

    /// Scorecard of the returned artifact, if it was ever scored
    pub scorecard: Option<ScoreCard>,

    /// True unless the artifact was accepted with every criterion judged
    pub degraded: bool,

    /// The closed run, as handed to the outcome sink
    pub run: ClosedRun,
}

impl QaResult {
    pub fn accepted(&self) -> bool {
        self.run.outcome.is_accepted()
    }
}

/// A parsed, validated and scored artifact.
#[derive(Debug, Clone)]
struct Validated {
    artifact: GenerationArtifact,
    sections: Vec<Section>,
    schema_errors: Vec<SchemaError>,
    scorecard: ScoreCard,
}

impl Validated {
    fn input(&self) -> PatchInput<'_> {
        PatchInput {
            artifact: &self.artifact,
            sections: &self.sections,
            schema_errors: &self.schema_errors,
            scorecard: &self.scorecard,
        }
    }
}

/// Outcome of the PARSE/VALIDATE/SCORE stages for one artifact.
enum Evaluation {
    Scored(Box<Validated>),
    Unparsed(ParseError),
    Unscored(AggregationError),
}

/// Per-run bookkeeping kept outside the run record.
struct Progress {
    feedback: Feedback,
    best: Option<(GenerationArtifact, ScoreCard)>,
    last_validated: Option<(GenerationArtifact, ScoreCard)>,
    last_attempt: u32,
}

impl Progress {
    fn new(first: &GenerationArtifact) -> Self {
        Self {
            feedback: Feedback::default(),
            best: None,
            last_validated: None,
            last_attempt: first.attempt,
        }
    }

    fn observe(&mut self, validated: &Validated) {
        let better = self
            .best
            .as_ref()
            .map_or(true, |(_, card)| validated.scorecard.total > card.total);
        if better {
            self.best = Some((validated.artifact.clone(), validated.scorecard.clone()));
        }
        self.last_validated = Some((validated.artifact.clone(), validated.scorecard.clone()));
        self.saw(validated.artifact.attempt);
    }

    fn saw(&mut self, attempt: u32) {
        self.last_attempt = self.last_attempt.max(attempt);
    }

    /// Attempt numbers only ever increase within a run.
    fn stamp(&mut self, mut artifact: GenerationArtifact) -> GenerationArtifact {
        self.last_attempt += 1;
        artifact.attempt = self.last_attempt;
        artifact
    }
}

/// The QA runtime.
///
/// Cheap to share behind an `Arc`; runs are independent of each other and
/// share only the read-only profile, the circuit breaker, the verdict cache
/// and the outcome sink.
pub struct Orchestrator {
    profile: Arc<QualityProfile>,
    generator: Arc<dyn Generator>,
    critic: CriticValidator,
    patcher: PatchApplier,
    recorder: Arc<dyn OutcomeSink>,
    config: RuntimeConfig,
    breaker: Arc<CircuitBreaker>,
}

impl Orchestrator {
    pub fn profile(&self) -> &QualityProfile {
        &self.profile
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Generate a first draft and run it.
    pub async fn generate_and_run(
        &self,
        request: &GenerationRequest,
        cancel: CancelToken,
    ) -> Result<QaResult, RuntimeError> {
        let draft = self
            .call_generator(self.generator.generate(request), &cancel)
            .await
            .map_err(|_| RuntimeError::Cancelled)??;
        Ok(self.run_with_cancel(draft, cancel).await)
    }

    /// Run an artifact that can not be cancelled.
    pub async fn run(&self, artifact: GenerationArtifact) -> QaResult {
        self.run_with_cancel(artifact, CancelToken::never()).await
    }

    /// Run an artifact to completion or cancellation.
    pub async fn run_with_cancel(&self, artifact: GenerationArtifact, cancel: CancelToken) -> QaResult {
        let mut run = ValidationRun::new(&artifact.request_id, &self.profile);
        tracing::info!(
            run_id = %run.run_id,
            request_id = %artifact.request_id,
            profile = %run.profile,
            "Run started"
        );

        let mut progress = Progress::new(&artifact);
        let mut current = artifact;
        let mut origin = AttemptOrigin::Initial;
        let limits = &self.profile.limits;
        let aggregator = ScoreAggregator::new(&self.profile);

        loop {
            let evaluation = match self.evaluate(&mut run, &current, origin, &cancel).await {
                Ok(evaluation) => evaluation,
                Err(Cancelled) => return self.cancelled(run, progress, current),
            };

            match evaluation {
                Evaluation::Unparsed(e) => {
                    progress.feedback.note(e.to_string());
                }
                Evaluation::Unscored(e) => {
                    progress.feedback.note(format!("The draft could not be scored: {}", e));
                }
                Evaluation::Scored(validated) => {
                    let mut state = *validated;
                    loop {
                        progress.observe(&state);
                        run.transition(RunState::Decide);

                        let targets = match aggregator.decide(&state.scorecard) {
                            Decision::Accept => {
                                let closed = run.close(RunOutcome::Accepted, &state.artifact, Some(state.scorecard.clone()));
                                return self.finish(closed, state.artifact, Some(state.scorecard));
                            }
                            Decision::Patch(targets) => targets,
                            Decision::Regenerate | Decision::Reject => break,
                        };

                        if !run.counters.begin_patch_round(limits) {
                            tracing::info!(
                                run_id = %run.run_id,
                                patch_rounds = run.counters.patch_rounds,
                                "Patch budget spent, escalating to regeneration"
                            );
                            break;
                        }
                        run.transition(RunState::PatchLoop);

                        let round = run.counters.patch_rounds;
                        match self.patcher.apply_round(state.input(), &targets, round, &cancel).await {
                            Ok(mut patched) => {
                                run.counters.patch_requests += patched.requests;
                                for record in &patched.records {
                                    run.record_patch(record.clone());
                                }
                                let mut attempt = AttemptRecord::new(&patched.artifact, AttemptOrigin::Patched);
                                attempt.schema_errors = patched.schema_errors.clone();

                                if !patched.awaiting.is_empty() {
                                    match self.rejudge(&mut run, &patched, &cancel).await {
                                        Ok(Ok(card)) => patched.scorecard = card,
                                        Ok(Err(e)) => {
                                            tracing::warn!(run_id = %run.run_id, round, error = %e, "Patched artifact could not be rescored, escalating to regeneration");
                                            progress.feedback.note(format!("The patched draft could not be scored: {}", e));
                                            attempt.error = Some(e.to_string());
                                            run.record_attempt(attempt);
                                            progress.saw(patched.artifact.attempt);
                                            break;
                                        }
                                        Err(Cancelled) => return self.cancelled(run, progress, state.artifact),
                                    }
                                }
                                attempt.scorecard = Some(patched.scorecard.clone());
                                run.record_attempt(attempt);

                                run.transition(RunState::Score);
                                state = Validated {
                                    artifact: patched.artifact,
                                    sections: patched.sections,
                                    schema_errors: patched.schema_errors,
                                    scorecard: patched.scorecard,
                                };
                            }
                            Err(PatchError::Cancelled { records }) => {
                                run.counters.patch_requests += records.len() as u32;
                                for record in records {
                                    run.record_patch(record);
                                }
                                return self.cancelled(run, progress, state.artifact);
                            }
                            Err(e) => {
                                tracing::warn!(run_id = %run.run_id, round, error = %e, "Patch round failed, escalating to regeneration");
                                progress.feedback.note(e.to_string());
                                let records = e.into_records();
                                run.counters.patch_requests += records.len() as u32;
                                for record in records {
                                    run.record_patch(record);
                                }
                                break;
                            }
                        }
                    }

                    progress.feedback.add_failures(&self.profile, &state.scorecard, None);
                    current = state.artifact;
                }
            }

            // REGENERATE_LOOP: retry the generator until it answers or the budget is spent
            run.transition(RunState::RegenerateLoop);
            let mut generator_failure: Option<String> = None;
            let next = loop {
                if !run.counters.begin_regeneration(limits) {
                    let failure = match generator_failure {
                        Some(detail) => RunFailure::GeneratorUnavailable { detail },
                        None => RunFailure::RegenerateExhausted,
                    };
                    return self.fail(run, progress, current, failure);
                }

                match self
                    .call_generator(self.generator.regenerate(&current, &progress.feedback), &cancel)
                    .await
                {
                    Err(Cancelled) => return self.cancelled(run, progress, current),
                    Ok(Ok(next)) => break next,
                    Ok(Err(e)) => {
                        tracing::warn!(
                            run_id = %run.run_id,
                            regenerations = run.counters.regenerations,
                            error = %e,
                            "Regeneration failed"
                        );
                        generator_failure = Some(e.to_string());
                    }
                }
            };

            current = progress.stamp(next);
            origin = AttemptOrigin::Regenerated;
        }
    }

    /// PARSE, VALIDATE and SCORE one artifact.
    async fn evaluate(
        &self,
        run: &mut ValidationRun,
        artifact: &GenerationArtifact,
        origin: AttemptOrigin,
        cancel: &CancelToken,
    ) -> Result<Evaluation, Cancelled> {
        run.transition(RunState::Parse);
        let mut record = AttemptRecord::new(artifact, origin);

        let mut sections = match SectionParser::new(&self.profile).parse(&artifact.text) {
            Ok(sections) => sections,
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, attempt = artifact.attempt, missing = ?e.missing, "Parse failed");
                record.parse_error = Some(e.clone());
                run.record_attempt(record);
                return Ok(Evaluation::Unparsed(e));
            }
        };
        let schema_errors = StructuredBlockExtractor::new(&self.profile).extract_all(&mut sections);
        record.schema_errors = schema_errors.clone();
        run.record_attempt(record);

        run.transition(RunState::Validate);
        let sections = Arc::new(sections);
        let shared_errors = Arc::new(schema_errors);
        let (mut results, critic) = tokio::join!(
            self.run_rules(sections.clone(), shared_errors.clone()),
            self.critic.judge(artifact, cancel)
        );
        let critic = critic?;
        if let Some(reason) = critic.unavailable {
            run.degrade(Degradation::CriticUnavailable {
                attempt: artifact.attempt,
                reason,
            });
        }
        results.extend(critic.results);

        run.transition(RunState::Score);
        let scorecard = match ScoreAggregator::new(&self.profile).aggregate(results) {
            Ok(card) => card,
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, attempt = artifact.attempt, error = %e, "Scoring failed");
                if let Some(record) = run.current_attempt_mut() {
                    record.error = Some(e.to_string());
                }
                return Ok(Evaluation::Unscored(e));
            }
        };

        tracing::debug!(
            run_id = %run.run_id,
            attempt = artifact.attempt,
            total = scorecard.total,
            band = ?scorecard.decision_band,
            "Artifact scored"
        );
        if let Some(record) = run.current_attempt_mut() {
            record.scorecard = Some(scorecard.clone());
        }

        Ok(Evaluation::Scored(Box::new(Validated {
            artifact: artifact.clone(),
            sections: Arc::unwrap_or_clone(sections),
            schema_errors: Arc::unwrap_or_clone(shared_errors),
            scorecard,
        })))
    }

    /// Critic pass over a patched artifact.
    ///
    /// Only the criteria the patch invalidated take the new verdict; the
    /// rest of the scorecard stands as the patch round left it.
    async fn rejudge(
        &self,
        run: &mut ValidationRun,
        patched: &PatchRound,
        cancel: &CancelToken,
    ) -> Result<Result<ScoreCard, AggregationError>, Cancelled> {
        run.transition(RunState::Validate);
        let pass = self.critic.judge(&patched.artifact, cancel).await?;
        if let Some(reason) = pass.unavailable {
            run.degrade(Degradation::CriticUnavailable {
                attempt: patched.artifact.attempt,
                reason,
            });
        }

        let updates = pass
            .results
            .into_iter()
            .filter(|r| patched.awaiting.contains(&r.criterion_id))
            .collect();
        Ok(ScoreAggregator::new(&self.profile).rescore(&patched.scorecard, updates))
    }

    /// Run every rule criterion, one blocking task per section scope.
    async fn run_rules(&self, sections: Arc<Vec<Section>>, schema_errors: Arc<Vec<SchemaError>>) -> Vec<CriterionResult> {
        let mut scopes: Vec<Option<String>> = self.profile.sections.iter().map(|s| Some(s.name.clone())).collect();
        scopes.push(None);

        let tasks = scopes.into_iter().map(|scope| {
            let profile = self.profile.clone();
            let sections = sections.clone();
            let schema_errors = schema_errors.clone();
            let task_scope = scope.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let ctx = RuleContext::new(&sections, &schema_errors);
                let validator = RuleValidator::new(&profile);
                match &task_scope {
                    Some(section) => validator.validate_section(section, &ctx),
                    None => validator.validate_global(&ctx),
                }
            });
            async move { (scope, handle.await) }
        });

        let mut results = Vec::new();
        for (scope, joined) in join_all(tasks).await {
            match joined {
                Ok(scoped) => results.extend(scoped),
                Err(e) => {
                    tracing::warn!(section = ?scope, error = %e, "Rule task failed, criteria not evaluated");
                    results.extend(
                        self.profile
                            .rule_criteria()
                            .filter(|c| c.section == scope)
                            .map(|c| CriterionResult::not_evaluated(&c.id, format!("Rule evaluation failed: {}", e))),
                    );
                }
            }
        }
        results
    }

    /// Call the generator behind its circuit, timeout and the cancel token.
    async fn call_generator<T, F>(&self, call: F, cancel: &CancelToken) -> Result<Result<T, GeneratorError>, Cancelled>
    where
        F: Future<Output = Result<T, GeneratorError>>,
    {
        if self.breaker.is_open(Upstream::Generator) {
            return Ok(Err(GeneratorError::CircuitOpen));
        }

        let timeout = self.config.generator_timeout;
        let outcome = match cancel.guard(tokio::time::timeout(timeout, call)).await? {
            Ok(Ok(value)) => {
                self.breaker.record_success(Upstream::Generator);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(Upstream::Generator);
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure(Upstream::Generator);
                Err(GeneratorError::Timeout(timeout))
            }
        };
        Ok(outcome)
    }

    /// Close a run that never reached acceptance.
    fn fail(&self, mut run: ValidationRun, progress: Progress, latest: GenerationArtifact, failure: RunFailure) -> QaResult {
        let (artifact, scorecard) = match progress.best {
            Some((artifact, card)) => (artifact, Some(card)),
            None => (latest, None),
        };
        tracing::warn!(
            run_id = %run.run_id,
            ?failure,
            attempt = artifact.attempt,
            total = scorecard.as_ref().map(|c| c.total),
            "No artifact accepted, returning best attempt"
        );
        run.degrade(Degradation::BelowQualityBar {
            attempt: artifact.attempt,
            total: scorecard.as_ref().map(|c| c.total),
        });
        let closed = run.close(RunOutcome::Failed { failure }, &artifact, scorecard.clone());
        self.finish(closed, artifact, scorecard)
    }

    /// Close a cancelled run with the last fully validated artifact.
    fn cancelled(&self, run: ValidationRun, progress: Progress, latest: GenerationArtifact) -> QaResult {
        tracing::info!(run_id = %run.run_id, "Run cancelled");
        let (artifact, scorecard) = match progress.last_validated {
            Some((artifact, card)) => (artifact, Some(card)),
            None => (latest, None),
        };
        let closed = run.close(
            RunOutcome::Failed {
                failure: RunFailure::Cancelled,
            },
            &artifact,
            scorecard.clone(),
        );
        self.finish(closed, artifact, scorecard)
    }

    fn finish(&self, closed: ClosedRun, artifact: GenerationArtifact, scorecard: Option<ScoreCard>) -> QaResult {
        self.recorder.enqueue(closed.clone());
        QaResult {
            final_text: artifact.text,
            scorecard,
            degraded: closed.degraded,
            run: closed,
        }
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    profile: Option<Arc<QualityProfile>>,
    generator: Option<Arc<dyn Generator>>,
    critic: Option<Arc<dyn Critic>>,
    config: RuntimeConfig,
    recorder: Option<Arc<dyn OutcomeSink>>,
    cache: Option<Arc<VerdictCache>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            profile: None,
            generator: None,
            critic: None,
            config: RuntimeConfig::default(),
            recorder: None,
            cache: None,
        }
    }

    pub fn profile(mut self, profile: Arc<QualityProfile>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn critic(mut self, critic: Arc<dyn Critic>) -> Self {
        self.critic = Some(critic);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Where closed runs go. Defaults to discarding them.
    pub fn recorder(mut self, recorder: Arc<dyn OutcomeSink>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Share a verdict cache between orchestrators. Without one, a cache is
    /// created from the config when caching is enabled.
    pub fn cache(mut self, cache: Arc<VerdictCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Orchestrator, RuntimeError> {
        let profile = self.profile.ok_or(RuntimeError::ProfileNotConfigured)?;
        let generator = self.generator.ok_or(RuntimeError::GeneratorNotConfigured)?;
        let critic = self.critic.ok_or(RuntimeError::CriticNotConfigured)?;
        let config = self.config;

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));

        let mut critic = CriticValidator::new(critic, &profile, config.critic_timeout, breaker.clone());
        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if config.cache.enabled => Some(Arc::new(VerdictCache::new(config.cache.max_entries, config.cache.ttl))),
            None => None,
        };
        if let Some(cache) = cache {
            critic = critic.with_cache(cache);
        }

        let patcher = PatchApplier::new(generator.clone(), profile.clone(), config.generator_timeout, breaker.clone());

        Ok(Orchestrator {
            profile,
            generator,
            critic,
            patcher,
            recorder: self.recorder.unwrap_or_else(|| Arc::new(NullSink)),
            config,
            breaker,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
