//! End-to-end runs of the orchestrator with scripted collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quillgate_core::{
    Degradation, GenerationArtifact, PatchOutcome, QualityProfile, RunFailure, RunOutcome, RunState,
};
use quillgate_runtime::{
    CancelHandle, CapturingSink, Critic, CriticError, CriticScore, CriticVerdict, Feedback,
    GenerationRequest, Generator, GeneratorError, Orchestrator, OrchestratorBuilder, Rubric,
    RuntimeConfig,
};

fn profile_yaml(max_patch_rounds: u32, max_regenerate_rounds: u32) -> String {
    format!(
        r#"
profile_version: "1.0"
name: "scenario"
sections:
  - name: overview
    marker: "Overview"
  - name: forecast
    marker: "Forecast"
criteria:
  - id: R1
    kind: rule
    weight: 0.3
    section: forecast
    check: {{ type: length_bounds, min_words: 8 }}
  - id: R2
    kind: rule
    weight: 0.2
    section: overview
    check: {{ type: length_bounds, min_words: 3 }}
  - id: C1
    kind: critic
    weight: 0.5
    dimension: tone
thresholds: {{ accept: 0.8, patch: 0.6, regenerate: 0.3, section_patch: 0.7 }}
limits: {{ max_patch_rounds: {}, max_regenerate_rounds: {} }}
"#,
        max_patch_rounds, max_regenerate_rounds
    )
}

/// C1 judges the forecast section itself.
const FORECAST_CRITIC_PROFILE: &str = r#"
profile_version: "1.0"
name: "scenario"
sections:
  - name: overview
    marker: "Overview"
  - name: forecast
    marker: "Forecast"
criteria:
  - id: R1
    kind: rule
    weight: 0.3
    section: forecast
    check: { type: length_bounds, min_words: 8 }
  - id: R2
    kind: rule
    weight: 0.2
    section: overview
    check: { type: length_bounds, min_words: 3 }
  - id: C1
    kind: critic
    weight: 0.5
    section: forecast
    dimension: depth
thresholds: { accept: 0.8, patch: 0.3, regenerate: 0.2, section_patch: 0.7 }
limits: { max_patch_rounds: 1, max_regenerate_rounds: 1 }
"#;

const GOOD: &str = "Overview\nA calm and steady year.\n\nForecast\nSteady growth is expected in every market this year.\n";
const SHORT_FORECAST: &str = "Overview\nA calm and steady year.\n\nForecast\nShort text here.\n";
const SHORT_OVERVIEW: &str = "Overview\nCalm.\n\nForecast\nSteady growth is expected in every market this year.\n";
const NO_FORECAST: &str = "Overview\nA calm and steady year.\n";
const POOR: &str = "Overview\nCalm.\n\nForecast\nShort.\n";

#[derive(Default)]
struct ScriptedGenerator {
    /// Reply to every patch request; `None` fails the request
    patch_reply: Option<String>,

    /// Replies to regeneration requests, in order; then `regen_default`
    regen_replies: Mutex<VecDeque<String>>,
    regen_default: Option<String>,

    /// Cancel this handle and hang when asked for a patch
    cancel_on_patch: Option<CancelHandle>,

    patch_calls: Mutex<Vec<String>>,
    regen_feedback: Mutex<Vec<Feedback>>,
}

impl ScriptedGenerator {
    fn patches_with(mut self, reply: &str) -> Self {
        self.patch_reply = Some(reply.to_string());
        self
    }

    fn regenerates(self, replies: &[&str]) -> Self {
        self.regen_replies.lock().extend(replies.iter().map(|r| r.to_string()));
        self
    }

    fn regenerates_forever(mut self, reply: &str) -> Self {
        self.regen_default = Some(reply.to_string());
        self
    }

    fn patch_calls(&self) -> Vec<String> {
        self.patch_calls.lock().clone()
    }

    fn regen_calls(&self) -> usize {
        self.regen_feedback.lock().len()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationArtifact, GeneratorError> {
        Ok(GenerationArtifact::new(&request.request_id, GOOD))
    }

    async fn patch_section(
        &self,
        _artifact: &GenerationArtifact,
        section: &str,
        _feedback: &Feedback,
    ) -> Result<String, GeneratorError> {
        self.patch_calls.lock().push(section.to_string());
        if let Some(handle) = &self.cancel_on_patch {
            handle.cancel();
            futures::future::pending::<()>().await;
        }
        self.patch_reply
            .clone()
            .ok_or_else(|| GeneratorError::Transport("connection reset".to_string()))
    }

    async fn regenerate(
        &self,
        artifact: &GenerationArtifact,
        feedback: &Feedback,
    ) -> Result<GenerationArtifact, GeneratorError> {
        self.regen_feedback.lock().push(feedback.clone());
        let next = self.regen_replies.lock().pop_front().or_else(|| self.regen_default.clone());
        match next {
            Some(text) => Ok(artifact.next_attempt(text)),
            None => Err(GeneratorError::Transport("connection reset".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

enum CriticMode {
    Scores(f64),
    /// `hit` when the artifact contains `needle`, `miss` otherwise
    Rewards { needle: &'static str, hit: f64, miss: f64 },
    /// Transport failure on the first call, then the score
    FailsFirst(f64),
    Hang,
}

struct ScriptedCritic {
    mode: CriticMode,
    calls: AtomicUsize,
}

#[async_trait]
impl Critic for ScriptedCritic {
    async fn judge(&self, artifact: &GenerationArtifact, rubric: &Rubric) -> Result<CriticVerdict, CriticError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let score = match self.mode {
            CriticMode::Scores(score) => score,
            CriticMode::FailsFirst(_) if call == 0 => {
                return Err(CriticError::Transport("connection refused".to_string()))
            }
            CriticMode::FailsFirst(score) => score,
            CriticMode::Rewards { needle, hit, miss } => {
                if artifact.text.contains(needle) {
                    hit
                } else {
                    miss
                }
            }
            CriticMode::Hang => futures::future::pending().await,
        };
        Ok(rubric
            .items
            .iter()
            .map(|item| {
                (
                    item.criterion_id.clone(),
                    CriticScore {
                        score,
                        explanation: "scripted".to_string(),
                    },
                )
            })
            .collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct Harness {
    orchestrator: Orchestrator,
    generator: Arc<ScriptedGenerator>,
    critic: Arc<ScriptedCritic>,
    sink: Arc<CapturingSink>,
}

fn harness_with(profile: &str, generator: ScriptedGenerator, mode: CriticMode, config: RuntimeConfig) -> Harness {
    let generator = Arc::new(generator);
    let critic = Arc::new(ScriptedCritic {
        mode,
        calls: AtomicUsize::new(0),
    });
    let sink = Arc::new(CapturingSink::new());
    let orchestrator = OrchestratorBuilder::new()
        .profile(Arc::new(QualityProfile::from_yaml(profile).unwrap()))
        .generator(generator.clone())
        .critic(critic.clone())
        .recorder(sink.clone())
        .config(config)
        .build()
        .unwrap();
    Harness {
        orchestrator,
        generator,
        critic,
        sink,
    }
}

fn harness(generator: ScriptedGenerator) -> Harness {
    harness_with(&profile_yaml(3, 2), generator, CriticMode::Scores(0.9), RuntimeConfig::default())
}

fn states(result: &quillgate_runtime::QaResult) -> Vec<RunState> {
    result.run.run.trail.iter().map(|t| t.to).collect()
}

#[tokio::test]
async fn missing_forecast_regenerates_without_patching() {
    let h = harness(ScriptedGenerator::default().regenerates(&[GOOD]));
    let result = h.orchestrator.run(GenerationArtifact::new("req", NO_FORECAST)).await;

    assert!(result.accepted());
    assert_eq!(result.final_text, GOOD);

    let run = &result.run.run;
    let first = &run.attempts[0];
    assert_eq!(first.parse_error.as_ref().unwrap().missing, vec!["forecast".to_string()]);
    assert!(first.scorecard.is_none());
    assert_eq!(run.counters.patch_rounds, 0);
    assert_eq!(run.counters.regenerations, 1);
    assert!(run.patches.is_empty());
    assert!(h.generator.patch_calls().is_empty());

    // straight from PARSE to REGENERATE_LOOP
    assert_eq!(&states(&result)[..2], &[RunState::Parse, RunState::RegenerateLoop]);

    let feedback = h.generator.regen_feedback.lock();
    assert!(feedback[0].notes.iter().any(|n| n.contains("forecast")));
}

#[tokio::test]
async fn critic_timeout_degrades_but_decides() {
    let config = RuntimeConfig {
        critic_timeout: Duration::from_millis(50),
        ..RuntimeConfig::default()
    };
    let h = harness_with(&profile_yaml(3, 2), ScriptedGenerator::default(), CriticMode::Hang, config);
    let result = h.orchestrator.run(GenerationArtifact::new("req", GOOD)).await;

    assert!(result.accepted());
    assert!(result.degraded);

    let card = result.scorecard.as_ref().unwrap();
    assert!((card.total - 1.0).abs() < 1e-9);
    let c1 = card.result("C1").unwrap();
    assert!(!c1.evaluated);
    assert!(c1.explanation.contains("Critic unavailable"));

    assert!(matches!(
        result.run.run.degradations[0],
        Degradation::CriticUnavailable { attempt: 0, .. }
    ));
    assert!(h.generator.patch_calls().is_empty());
}

#[tokio::test]
async fn sub_threshold_section_is_the_only_patch_target() {
    let h = harness(
        ScriptedGenerator::default().patches_with("A calm and steady year for the company."),
    );
    let result = h.orchestrator.run(GenerationArtifact::new("req", SHORT_OVERVIEW)).await;

    assert!(result.accepted());
    assert!(!result.degraded);
    assert_eq!(h.generator.patch_calls(), vec!["overview".to_string()]);

    // forecast untouched byte for byte
    let forecast = "Forecast\nSteady growth is expected in every market this year.\n";
    assert!(result.final_text.starts_with("Overview\nA calm and steady year for the company."));
    assert!(result.final_text.ends_with(forecast));

    // the total moved by exactly R2's weighted change
    let run = &result.run.run;
    let before = run.attempts[0].scorecard.as_ref().unwrap();
    let after = result.scorecard.as_ref().unwrap();
    assert!(before.total >= 0.8, "global total already passing");
    let r2_before = before.result("R2").unwrap().score;
    assert!((after.total - before.total - 0.2 * (1.0 - r2_before)).abs() < 1e-9);
    assert_eq!(after.result("R1"), before.result("R1"));
    assert_eq!(after.result("C1"), before.result("C1"));

    assert_eq!(run.counters.patch_rounds, 1);
    assert_eq!(run.counters.patch_requests, 1);
    assert_eq!(run.attempts.len(), 2);
}

#[tokio::test]
async fn patched_section_is_judged_again_by_the_critic() {
    let patch = "Steady growth is expected in every market this year.";
    let h = harness_with(
        FORECAST_CRITIC_PROFILE,
        ScriptedGenerator::default().patches_with(patch),
        CriticMode::Scores(0.2),
        RuntimeConfig::default(),
    );
    let result = h.orchestrator.run(GenerationArtifact::new("req", SHORT_FORECAST)).await;

    // the patch fixed the length rule but the critic still rejects the section
    assert!(!result.accepted());
    assert!(result.degraded);
    assert!(result.final_text.contains(patch));
    assert_eq!(h.critic.calls.load(Ordering::SeqCst), 2);

    let card = result.scorecard.as_ref().unwrap();
    let c1 = card.result("C1").unwrap();
    assert!(c1.evaluated);
    assert!((c1.score - 0.2).abs() < 1e-9);
    assert_eq!(card.result("R1").unwrap().score, 1.0);
    assert!((card.total - 0.6).abs() < 1e-9);

    // no recorded scorecard skips the critic verdict
    let run = &result.run.run;
    assert_eq!(run.counters.patch_rounds, 1);
    assert!(run
        .attempts
        .iter()
        .filter_map(|a| a.scorecard.as_ref())
        .all(|card| card.result("C1").map_or(false, |r| r.evaluated)));

    // PATCH_LOOP -> VALIDATE -> SCORE -> DECIDE
    let trail = states(&result);
    let patch = trail.iter().position(|s| *s == RunState::PatchLoop).unwrap();
    assert_eq!(
        &trail[patch..patch + 4],
        &[RunState::PatchLoop, RunState::Validate, RunState::Score, RunState::Decide]
    );
}

#[tokio::test]
async fn patch_accepted_once_critic_approves_new_section() {
    let patch = "Steady growth is expected in every market this year.";
    let h = harness_with(
        FORECAST_CRITIC_PROFILE,
        ScriptedGenerator::default().patches_with(patch),
        CriticMode::Rewards {
            needle: "Steady growth",
            hit: 0.9,
            miss: 0.2,
        },
        RuntimeConfig::default(),
    );
    let result = h.orchestrator.run(GenerationArtifact::new("req", SHORT_FORECAST)).await;

    assert!(result.accepted());
    assert!(!result.degraded);
    assert_eq!(h.critic.calls.load(Ordering::SeqCst), 2);

    let c1 = result.scorecard.as_ref().unwrap().result("C1").unwrap();
    assert!(c1.evaluated);
    assert!((c1.score - 0.9).abs() < 1e-9);
    assert_eq!(result.run.run.counters.regenerations, 0);
}

#[tokio::test]
async fn earlier_critic_outage_does_not_degrade_fully_judged_result() {
    let h = harness_with(
        &profile_yaml(3, 2),
        ScriptedGenerator::default().regenerates(&[GOOD]),
        CriticMode::FailsFirst(0.9),
        RuntimeConfig::default(),
    );
    let result = h.orchestrator.run(GenerationArtifact::new("req", POOR)).await;

    assert!(result.accepted());
    assert_eq!(result.final_text, GOOD);
    assert!(!result.degraded);
    assert_eq!(result.run.final_attempt, 1);

    // the outage stays on record against the attempt it hit
    assert!(matches!(
        result.run.run.degradations.as_slice(),
        [Degradation::CriticUnavailable { attempt: 0, .. }]
    ));
}

#[tokio::test]
async fn three_failed_patch_rounds_escalate_to_regeneration() {
    let h = harness(
        ScriptedGenerator::default()
            .patches_with("Brief text here.")
            .regenerates(&[GOOD]),
    );
    let result = h.orchestrator.run(GenerationArtifact::new("req", SHORT_FORECAST)).await;

    assert!(result.accepted());
    assert_eq!(result.final_text, GOOD);

    let run = &result.run.run;
    assert_eq!(run.counters.patch_rounds, 3);
    assert_eq!(run.counters.patch_requests, 3);
    assert_eq!(run.counters.regenerations, 1);
    assert_eq!(run.patches.len(), 3);
    assert!(run.patches.iter().all(|p| p.outcome == PatchOutcome::Applied));
    assert_eq!(h.generator.patch_calls(), vec!["forecast"; 3]);

    let trail = states(&result);
    assert_eq!(trail.iter().filter(|s| **s == RunState::PatchLoop).count(), 3);
    let first_regen = trail.iter().position(|s| *s == RunState::RegenerateLoop).unwrap();
    let last_patch = trail.iter().rposition(|s| *s == RunState::PatchLoop).unwrap();
    assert!(last_patch < first_regen);

    // attempt numbers never go backwards
    let attempts: Vec<u32> = run.attempts.iter().map(|a| a.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2, 3, 4]);

    // regeneration carried the unresolved failure
    let feedback = h.generator.regen_feedback.lock();
    assert!(feedback[0].failed.iter().any(|f| f.criterion_id == "R1"));
}

#[tokio::test]
async fn failed_run_returns_best_artifact_marked_degraded() {
    // patches fail outright; regenerations only get worse
    let h = harness(ScriptedGenerator::default().regenerates_forever(POOR));
    let result = h.orchestrator.run(GenerationArtifact::new("req", SHORT_FORECAST)).await;

    assert!(!result.accepted());
    assert!(result.degraded);
    assert_eq!(result.final_text, SHORT_FORECAST);
    assert_eq!(
        result.run.outcome,
        RunOutcome::Failed {
            failure: RunFailure::RegenerateExhausted
        }
    );

    let run = &result.run.run;
    assert_eq!(result.scorecard.as_ref().unwrap().total, run.attempts[0].scorecard.as_ref().unwrap().total);
    assert_eq!(result.run.final_attempt, 0);
    assert!(run
        .patches
        .iter()
        .all(|p| matches!(p.outcome, PatchOutcome::GeneratorFailed { .. })));
    assert!(run
        .degradations
        .iter()
        .any(|d| matches!(d, Degradation::BelowQualityBar { attempt: 0, .. })));
    assert_eq!(run.counters.regenerations, 2);
}

#[tokio::test]
async fn generator_outage_ends_with_generator_unavailable() {
    let h = harness(ScriptedGenerator::default());
    let result = h.orchestrator.run(GenerationArtifact::new("req", NO_FORECAST)).await;

    assert!(!result.accepted());
    assert_eq!(result.final_text, NO_FORECAST);
    assert!(result.scorecard.is_none());
    assert!(matches!(
        result.run.outcome,
        RunOutcome::Failed {
            failure: RunFailure::GeneratorUnavailable { .. }
        }
    ));
    // each failed regeneration still spends budget
    assert_eq!(result.run.run.counters.regenerations, 2);
    assert_eq!(h.generator.regen_calls(), 2);
}

#[tokio::test]
async fn cancellation_discards_in_flight_patch() {
    let handle = CancelHandle::new();
    let generator = ScriptedGenerator {
        cancel_on_patch: Some(handle.clone()),
        ..ScriptedGenerator::default()
    };
    let h = harness(generator);
    let result = h
        .orchestrator
        .run_with_cancel(GenerationArtifact::new("req", SHORT_FORECAST), handle.token())
        .await;

    assert_eq!(result.final_text, SHORT_FORECAST);
    assert!(result.degraded);
    assert_eq!(
        result.run.outcome,
        RunOutcome::Failed {
            failure: RunFailure::Cancelled
        }
    );
    assert!(result.run.run.patches.is_empty());
    assert_eq!(result.run.run.state, RunState::Final);
    assert_eq!(h.generator.regen_calls(), 0);
}

#[tokio::test]
async fn every_run_is_recorded_once() {
    let h = harness(ScriptedGenerator::default().regenerates(&[GOOD]));
    let first = h.orchestrator.run(GenerationArtifact::new("a", GOOD)).await;
    let second = h.orchestrator.run(GenerationArtifact::new("b", NO_FORECAST)).await;

    let recorded = h.sink.runs();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0], first.run);
    assert_eq!(recorded[1].run.request_id, second.run.run.request_id);
    assert_ne!(recorded[0].run.run_id, recorded[1].run.run_id);
}

#[tokio::test]
async fn identical_regeneration_is_judged_from_cache() {
    let h = harness(ScriptedGenerator::default().regenerates_forever(SHORT_FORECAST));
    let result = h.orchestrator.run(GenerationArtifact::new("req", SHORT_FORECAST)).await;

    // no patch reply, so every round fails and both regenerations happen
    let run = &result.run.run;
    assert_eq!(run.counters.regenerations, 2);
    assert_eq!(run.counters.patch_rounds, 3);
    assert_eq!(run.attempts.iter().filter(|a| a.scorecard.is_some()).count(), 3);

    // three judged attempts, one critic call
    assert_eq!(h.critic.calls.load(Ordering::SeqCst), 1);
    assert!(!result.degraded);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn budgets_are_never_exceeded(max_patch in 1u32..4, max_regen in 1u32..4) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let h = harness_with(
            &profile_yaml(max_patch, max_regen),
            ScriptedGenerator::default()
                .patches_with("Brief text here.")
                .regenerates_forever(SHORT_FORECAST),
            CriticMode::Scores(0.9),
            RuntimeConfig::default(),
        );
        let result = rt.block_on(h.orchestrator.run(GenerationArtifact::new("req", SHORT_FORECAST)));
        let counters = result.run.run.counters;

        prop_assert_eq!(counters.patch_rounds, max_patch);
        prop_assert_eq!(counters.regenerations, max_regen);
        prop_assert_eq!(h.generator.patch_calls().len() as u32, counters.patch_requests);
        prop_assert_eq!(h.generator.regen_calls() as u32, counters.regenerations);
        prop_assert!(!result.accepted());
        prop_assert_eq!(result.final_text, SHORT_FORECAST);
    }
}
