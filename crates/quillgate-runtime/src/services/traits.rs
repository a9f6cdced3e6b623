//! Contracts of the external collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use quillgate_core::{CriterionResult, GenerationArtifact, QualityProfile, ScoreCard};

use crate::providers::ProviderError;

/// Errors from the generator service.
#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Generator transport failure: {0}")]
    Transport(String),

    #[error("Generator timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generator returned empty output")]
    EmptyOutput,

    #[error("Generator circuit is open")]
    CircuitOpen,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Errors from the critic service. All of them are soft failures.
#[derive(Error, Debug)]
pub enum CriticError {
    #[error("Critic transport failure: {0}")]
    Transport(String),

    #[error("Critic timed out after {0:?}")]
    Timeout(Duration),

    #[error("Critic circuit is open")]
    CircuitOpen,

    #[error("Malformed critic verdict: {0}")]
    Malformed(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// What the generator is asked to produce a first draft from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub request_id: String,

    /// Domain facts and instructions, already rendered by the caller
    pub context: String,
}

/// A criterion that failed, as reported back to the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedCriterion {
    pub criterion_id: String,
    pub score: f64,
    pub explanation: String,

    #[serde(default)]
    pub guidance: Option<String>,
}

/// Accumulated reasons an artifact needs work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub failed: Vec<FailedCriterion>,

    /// Free-form notes, e.g. missing sections
    pub notes: Vec<String>,
}

impl Feedback {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.notes.is_empty()
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Add every evaluated, failing result of `card`, optionally restricted
    /// to the given criterion ids.
    pub fn add_failures(&mut self, profile: &QualityProfile, card: &ScoreCard, only: Option<&[String]>) {
        for result in &card.results {
            let Some(criterion) = profile.criterion(&result.criterion_id) else {
                continue;
            };
            if let Some(ids) = only {
                if !ids.contains(&result.criterion_id) {
                    continue;
                }
            }
            if result.evaluated && !result.passes(criterion.pass_threshold) {
                self.push_failure(result, criterion.description.clone());
            }
        }
    }

    fn push_failure(&mut self, result: &CriterionResult, guidance: Option<String>) {
        if self.failed.iter().any(|f| f.criterion_id == result.criterion_id && f.explanation == result.explanation) {
            return;
        }
        self.failed.push(FailedCriterion {
            criterion_id: result.criterion_id.clone(),
            score: result.score,
            explanation: result.explanation.clone(),
            guidance,
        });
    }

    /// Plain-text rendering for prompts and logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for f in &self.failed {
            out.push_str(&format!("- [{}] score {:.2}: {}", f.criterion_id, f.score, f.explanation));
            if let Some(g) = &f.guidance {
                out.push_str(&format!(" (expected: {})", g));
            }
            out.push('\n');
        }
        for note in &self.notes {
            out.push_str(&format!("- {}\n", note));
        }
        out
    }
}

/// One critic criterion as presented to the judge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RubricItem {
    pub criterion_id: String,
    pub dimension: String,

    #[serde(default)]
    pub section: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// The critic criteria of a profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Rubric {
    pub items: Vec<RubricItem>,
}

impl Rubric {
    pub fn from_profile(profile: &QualityProfile) -> Self {
        let items = profile
            .critic_criteria()
            .map(|c| RubricItem {
                criterion_id: c.id.clone(),
                dimension: c.dimension.clone().unwrap_or_else(|| c.id.clone()),
                section: c.section.clone(),
                description: c.description.clone(),
            })
            .collect();
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Score for one criterion as judged by the critic, already in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticScore {
    pub score: f64,
    pub explanation: String,
}

/// The critic's answer: criterion id to score.
pub type CriticVerdict = BTreeMap<String, CriticScore>;

/// Text generator collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a first draft.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationArtifact, GeneratorError>;

    /// Produce a replacement body for one section.
    async fn patch_section(
        &self,
        artifact: &GenerationArtifact,
        section: &str,
        feedback: &Feedback,
    ) -> Result<String, GeneratorError>;

    /// Produce a whole new artifact.
    async fn regenerate(
        &self,
        artifact: &GenerationArtifact,
        feedback: &Feedback,
    ) -> Result<GenerationArtifact, GeneratorError>;

    fn name(&self) -> &str;
}

/// Independent judging service.
#[async_trait]
pub trait Critic: Send + Sync {
    /// Judge the whole artifact against every rubric item in one call.
    async fn judge(&self, artifact: &GenerationArtifact, rubric: &Rubric) -> Result<CriticVerdict, CriticError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillgate_core::ScoreAggregator;

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
    check: { type: length_bounds, min_words: 10 }
    description: "At least ten words"
  - id: C1
    kind: critic
    weight: 0.5
    dimension: tone
thresholds: { accept: 0.8, patch: 0.6, regenerate: 0.3, section_patch: 0.5 }
"#;

    #[test]
    fn test_rubric_lists_critic_criteria() {
        let profile = QualityProfile::from_yaml(PROFILE).unwrap();
        let rubric = Rubric::from_profile(&profile);
        assert_eq!(rubric.items.len(), 1);
        assert_eq!(rubric.items[0].criterion_id, "C1");
        assert_eq!(rubric.items[0].dimension, "tone");
    }

    #[test]
    fn test_feedback_collects_failures() {
        let profile = QualityProfile::from_yaml(PROFILE).unwrap();
        let card = ScoreAggregator::new(&profile)
            .aggregate(vec![
                CriterionResult::scored("R1", 0.2, "2 words, expected 10"),
                CriterionResult::scored("C1", 0.9, "fine"),
            ])
            .unwrap();

        let mut feedback = Feedback::default();
        feedback.add_failures(&profile, &card, None);
        feedback.add_failures(&profile, &card, None);
        feedback.note("section 'advice' missing");

        assert_eq!(feedback.failed.len(), 1);
        assert_eq!(feedback.failed[0].guidance.as_deref(), Some("At least ten words"));
        let text = feedback.render();
        assert!(text.contains("[R1] score 0.20"));
        assert!(text.contains("advice"));
    }

    #[test]
    fn test_feedback_restricted_to_ids() {
        let profile = QualityProfile::from_yaml(PROFILE).unwrap();
        let card = ScoreAggregator::new(&profile)
            .aggregate(vec![
                CriterionResult::scored("R1", 0.2, "short"),
                CriterionResult::scored("C1", 0.1, "flat"),
            ])
            .unwrap();

        let mut feedback = Feedback::default();
        feedback.add_failures(&profile, &card, Some(&["C1".to_string()]));
        assert_eq!(feedback.failed.len(), 1);
        assert_eq!(feedback.failed[0].criterion_id, "C1");
    }
}
