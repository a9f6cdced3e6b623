//! Generator and critic collaborators.
//!
//! The pipeline never produces text or judgments itself; it calls out to
//! implementations of these traits. `crate::llm` provides LLM-backed ones.

mod traits;

pub use traits::{
    Critic, CriticError, CriticScore, CriticVerdict, FailedCriterion, Feedback, GenerationRequest,
    Generator, GeneratorError, Rubric, RubricItem,
};
