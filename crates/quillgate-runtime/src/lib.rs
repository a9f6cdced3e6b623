//! # quillgate-runtime
//!
//! Async quality gate for generated reports.
//!
//! `quillgate-core` decides what is wrong with one artifact. This crate
//! does something about it: it calls the critic, asks the generator for
//! section patches or a full regeneration, and keeps going until an
//! artifact is accepted or the budgets are spent.
//!
//! ## Guarantees
//!
//! - The caller always gets an artifact back once one exists
//! - An artifact that was not accepted, or was accepted without the
//!   critic's judgment, is marked `degraded`
//! - Patch and regeneration budgets from the profile are never exceeded
//! - Cancellation never returns a half-patched artifact
//! - Recording a run never blocks or fails the run
//!
//! ## Example
//!
//! ```rust,ignore
//! use quillgate_runtime::{OrchestratorBuilder, BoundedRecorder, GenerationArtifact};
//!
//! let recorder = BoundedRecorder::new(1024);
//! let orchestrator = OrchestratorBuilder::new()
//!     .profile(profile)
//!     .generator(generator)
//!     .critic(critic)
//!     .recorder(Arc::new(recorder.clone()))
//!     .build()?;
//!
//! let result = orchestrator.run(GenerationArtifact::new("req-1", draft)).await;
//! if result.degraded {
//!     eprintln!("delivered below full confidence");
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod critic;
pub mod llm;
pub mod orchestrator;
pub mod patch;
pub mod prompts;
pub mod providers;
pub mod recorder;
pub mod resilience;
pub mod services;

pub use cache::{VerdictCache, VerdictKey};
pub use cancel::{CancelHandle, CancelToken, Cancelled};
pub use config::{CacheConfig, ConfigError, RuntimeConfig};
pub use critic::{CriticPass, CriticValidator};
pub use llm::{LlmCritic, LlmGenerator};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, QaResult, RuntimeError};
pub use patch::{PatchApplier, PatchError, PatchInput, PatchRound};
pub use providers::{
    ApiCredential, ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
    ProviderFactory, ProviderRegistry,
};
pub use recorder::{
    BoundedRecorder, CapturingSink, JsonlStore, NullSink, OutcomeSink, RecordStore, RecorderError,
};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Upstream};
pub use services::{
    Critic, CriticError, CriticScore, CriticVerdict, Feedback, GenerationRequest, Generator,
    GeneratorError, Rubric,
};

// Core types callers need to drive a run
pub use quillgate_core::{ClosedRun, GenerationArtifact, QualityProfile, ScoreCard};

#[cfg(feature = "anthropic")]
pub use providers::{AnthropicProvider, AnthropicProviderFactory};
