//! Critic adapter.
//!
//! Wraps exactly one call to the critic per validation pass. The call is
//! bounded by a timeout and guarded by the critic circuit. Any failure is
//! soft: every critic criterion comes back with `evaluated = false` and the
//! pass reports why, so the orchestrator can mark the run degraded.

use std::sync::Arc;
use std::time::Duration;

use quillgate_core::{CriterionResult, GenerationArtifact, QualityProfile};

use crate::cache::{VerdictCache, VerdictKey};
use crate::cancel::{CancelToken, Cancelled};
use crate::resilience::{CircuitBreaker, Upstream};
use crate::services::{Critic, CriticError, CriticVerdict, Rubric};

/// Outcome of one critic pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticPass {
    /// One result per critic criterion, in rubric order
    pub results: Vec<CriterionResult>,

    /// Set when some or all criteria could not be judged
    pub unavailable: Option<String>,

    /// True when the verdict came from the cache
    pub cached: bool,
}

impl CriticPass {
    fn unavailable(rubric: &Rubric, reason: String) -> Self {
        let results = rubric
            .items
            .iter()
            .map(|item| CriterionResult::not_evaluated(&item.criterion_id, format!("Critic unavailable: {}", reason)))
            .collect();
        Self {
            results,
            unavailable: Some(reason),
            cached: false,
        }
    }
}

/// Judges the critic criteria of a profile.
pub struct CriticValidator {
    critic: Arc<dyn Critic>,
    rubric: Rubric,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<VerdictCache>>,
}

impl CriticValidator {
    pub fn new(
        critic: Arc<dyn Critic>,
        profile: &QualityProfile,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            critic,
            rubric: Rubric::from_profile(profile),
            timeout,
            breaker,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<VerdictCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Judge an artifact.
    ///
    /// Only cancellation is an error; every other failure is folded into
    /// the returned pass.
    pub async fn judge(&self, artifact: &GenerationArtifact, cancel: &CancelToken) -> Result<CriticPass, Cancelled> {
        if self.rubric.is_empty() {
            return Ok(CriticPass {
                results: Vec::new(),
                unavailable: None,
                cached: false,
            });
        }

        let key = VerdictKey::new(&artifact.text, &self.rubric);
        if let Some(cache) = &self.cache {
            if let Some(verdict) = cache.get(&key).await {
                tracing::debug!(attempt = artifact.attempt, "Critic verdict served from cache");
                let mut pass = self.map_verdict(&verdict);
                pass.cached = true;
                return Ok(pass);
            }
        }

        match self.call(artifact, cancel).await? {
            Ok(verdict) => {
                let pass = self.map_verdict(&verdict);
                if pass.unavailable.is_none() {
                    if let Some(cache) = &self.cache {
                        cache.insert(key, verdict).await;
                    }
                }
                Ok(pass)
            }
            Err(e) => {
                tracing::warn!(
                    critic = self.critic.name(),
                    attempt = artifact.attempt,
                    error = %e,
                    "Critic unavailable, criteria excluded from scoring"
                );
                Ok(CriticPass::unavailable(&self.rubric, e.to_string()))
            }
        }
    }

    async fn call(
        &self,
        artifact: &GenerationArtifact,
        cancel: &CancelToken,
    ) -> Result<Result<CriticVerdict, CriticError>, Cancelled> {
        if self.breaker.is_open(Upstream::Critic) {
            return Ok(Err(CriticError::CircuitOpen));
        }

        let call = tokio::time::timeout(self.timeout, self.critic.judge(artifact, &self.rubric));
        let outcome = match cancel.guard(call).await? {
            Ok(Ok(verdict)) => {
                self.breaker.record_success(Upstream::Critic);
                Ok(verdict)
            }
            Ok(Err(e)) => {
                // A malformed answer still means the service is reachable
                if matches!(e, CriticError::Malformed(_)) {
                    self.breaker.record_success(Upstream::Critic);
                } else {
                    self.breaker.record_failure(Upstream::Critic);
                }
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure(Upstream::Critic);
                Err(CriticError::Timeout(self.timeout))
            }
        };
        Ok(outcome)
    }

    /// Map a verdict onto the rubric by criterion id.
    fn map_verdict(&self, verdict: &CriticVerdict) -> CriticPass {
        let mut omitted = Vec::new();
        let results = self
            .rubric
            .items
            .iter()
            .map(|item| match verdict.get(&item.criterion_id) {
                Some(s) if s.score.is_finite() => {
                    CriterionResult::scored(&item.criterion_id, s.score, s.explanation.clone())
                }
                _ => {
                    omitted.push(item.criterion_id.clone());
                    CriterionResult::not_evaluated(&item.criterion_id, "Critic returned no score")
                }
            })
            .collect();

        CriticPass {
            results,
            unavailable: (!omitted.is_empty())
                .then(|| format!("critic returned no score for {}", omitted.join(", "))),
            cached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use crate::services::CriticScore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROFILE: &str = r#"
profile_version: "1.0"
name: "t"
sections:
  - name: forecast
    marker: "Forecast"
criteria:
  - id: R1
    kind: rule
    weight: 0.5
    section: forecast
    check: { type: section_present }
  - id: C1
    kind: critic
    weight: 0.3
    dimension: tone
  - id: C2
    kind: critic
    weight: 0.2
    section: forecast
    dimension: depth
thresholds: { accept: 0.8, patch: 0.6, regenerate: 0.3, section_patch: 0.5 }
"#;

    enum Mode {
        Scores(Vec<(&'static str, f64)>),
        Fail,
        Hang,
    }

    struct FakeCritic {
        mode: Mode,
        calls: AtomicUsize,
    }

    impl FakeCritic {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Critic for FakeCritic {
        async fn judge(&self, _: &GenerationArtifact, _: &Rubric) -> Result<CriticVerdict, CriticError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                Mode::Scores(scores) => Ok(scores
                    .iter()
                    .map(|(id, s)| {
                        (
                            id.to_string(),
                            CriticScore {
                                score: *s,
                                explanation: "judged".to_string(),
                            },
                        )
                    })
                    .collect()),
                Mode::Fail => Err(CriticError::Transport("connection reset".to_string())),
                Mode::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(CriticError::Transport("unreachable".to_string()))
                }
            }
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn validator(critic: Arc<FakeCritic>, breaker: Arc<CircuitBreaker>) -> CriticValidator {
        let profile = QualityProfile::from_yaml(PROFILE).unwrap();
        CriticValidator::new(critic, &profile, Duration::from_secs(5), breaker)
    }

    fn artifact() -> GenerationArtifact {
        GenerationArtifact::new("req", "Forecast\nGood.\n")
    }

    #[tokio::test]
    async fn test_maps_verdict_by_id() {
        let critic = FakeCritic::new(Mode::Scores(vec![("C1", 0.9), ("C2", 0.4), ("C9", 1.0)]));
        let v = validator(critic, Arc::new(CircuitBreaker::default()));
        let pass = v.judge(&artifact(), &CancelToken::never()).await.unwrap();

        assert_eq!(pass.results.len(), 2);
        assert_eq!(pass.results[0].criterion_id, "C1");
        assert_eq!(pass.results[1].score, 0.4);
        assert!(pass.unavailable.is_none());
    }

    #[tokio::test]
    async fn test_omitted_criterion_not_evaluated() {
        let critic = FakeCritic::new(Mode::Scores(vec![("C1", 0.9)]));
        let v = validator(critic, Arc::new(CircuitBreaker::default()));
        let pass = v.judge(&artifact(), &CancelToken::never()).await.unwrap();

        assert!(pass.results[0].evaluated);
        assert!(!pass.results[1].evaluated);
        assert!(pass.unavailable.unwrap().contains("C2"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_soft() {
        let v = validator(FakeCritic::new(Mode::Fail), Arc::new(CircuitBreaker::default()));
        let pass = v.judge(&artifact(), &CancelToken::never()).await.unwrap();

        assert!(pass.results.iter().all(|r| !r.evaluated));
        assert!(pass.unavailable.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_soft() {
        let v = validator(FakeCritic::new(Mode::Hang), Arc::new(CircuitBreaker::default()));
        let pass = v.judge(&artifact(), &CancelToken::never()).await.unwrap();

        assert!(pass.results.iter().all(|r| !r.evaluated));
        assert!(pass.unavailable.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_call() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        breaker.record_failure(Upstream::Critic);

        let critic = FakeCritic::new(Mode::Scores(vec![("C1", 1.0), ("C2", 1.0)]));
        let v = validator(critic.clone(), breaker);
        let pass = v.judge(&artifact(), &CancelToken::never()).await.unwrap();

        assert_eq!(critic.calls.load(Ordering::SeqCst), 0);
        assert!(pass.unavailable.is_some());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_call() {
        let critic = FakeCritic::new(Mode::Scores(vec![("C1", 0.7), ("C2", 0.8)]));
        let v = validator(critic.clone(), Arc::new(CircuitBreaker::default()))
            .with_cache(Arc::new(VerdictCache::default()));

        let first = v.judge(&artifact(), &CancelToken::never()).await.unwrap();
        let second = v.judge(&artifact(), &CancelToken::never()).await.unwrap();

        assert_eq!(critic.calls.load(Ordering::SeqCst), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.results, second.results);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let handle = crate::cancel::CancelHandle::new();
        handle.cancel();
        let v = validator(FakeCritic::new(Mode::Hang), Arc::new(CircuitBreaker::default()));
        assert_eq!(v.judge(&artifact(), &handle.token()).await, Err(Cancelled));
    }
}
