//! [`Critic`] and [`Generator`] backed by an [`LlmProvider`].

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use quillgate_core::GenerationArtifact;

use crate::prompts::{
    render_critic_request, render_patch_request, render_regenerate_request, CRITIC_SYSTEM_PROMPT,
    GENERATE_SYSTEM_PROMPT, PATCH_SYSTEM_PROMPT, REGENERATE_SYSTEM_PROMPT,
};
use crate::providers::{ChatMessage, CompletionConfig, LlmProvider};
use crate::services::{
    Critic, CriticError, CriticScore, CriticVerdict, Feedback, GenerationRequest, Generator,
    GeneratorError, Rubric,
};

/// Upper end of the scale the critic scores on.
pub const CRITIC_SCALE_MAX: f64 = 10.0;

lazy_static! {
    static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").unwrap();
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    scores: BTreeMap<String, RawScore>,
}

#[derive(Debug, Deserialize)]
struct RawScore {
    score: f64,
    #[serde(default)]
    explanation: String,
}

/// Pull the JSON object out of a model reply, fenced or bare.
fn extract_json(reply: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(reply) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

/// Parse a critic reply into a verdict normalised to [0, 1].
pub fn parse_verdict(reply: &str) -> Result<CriticVerdict, CriticError> {
    let json = extract_json(reply).ok_or_else(|| CriticError::Malformed("no JSON object in reply".to_string()))?;
    let raw: RawVerdict = serde_json::from_str(json).map_err(|e| CriticError::Malformed(e.to_string()))?;

    Ok(raw
        .scores
        .into_iter()
        .map(|(id, s)| {
            let score = (s.score / CRITIC_SCALE_MAX).clamp(0.0, 1.0);
            (
                id,
                CriticScore {
                    score,
                    explanation: s.explanation,
                },
            )
        })
        .collect())
}

/// Critic that asks a chat model to score the rubric.
pub struct LlmCritic {
    provider: Arc<dyn LlmProvider>,
    config: CompletionConfig,
}

impl LlmCritic {
    pub fn new(provider: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn judge(&self, artifact: &GenerationArtifact, rubric: &Rubric) -> Result<CriticVerdict, CriticError> {
        let messages = vec![
            ChatMessage::system(CRITIC_SYSTEM_PROMPT),
            ChatMessage::user(render_critic_request(&artifact.text, rubric)),
        ];
        let response = self.provider.complete(messages, &self.config).await?;
        if response.truncated() {
            return Err(CriticError::Malformed("reply truncated at token limit".to_string()));
        }
        parse_verdict(&response.content)
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}

/// Generator that drafts and revises reports with a chat model.
pub struct LlmGenerator {
    provider: Arc<dyn LlmProvider>,
    config: CompletionConfig,
}

impl LlmGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        Self { provider, config }
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, GeneratorError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let response = self.provider.complete(messages, &self.config).await?;
        if response.truncated() {
            tracing::warn!(provider = self.provider.name(), "Generator reply truncated at token limit");
        }
        if response.content.trim().is_empty() {
            return Err(GeneratorError::EmptyOutput);
        }
        Ok(response.content)
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationArtifact, GeneratorError> {
        let text = self.complete(GENERATE_SYSTEM_PROMPT, request.context.clone()).await?;
        Ok(GenerationArtifact::new(&request.request_id, text))
    }

    async fn patch_section(
        &self,
        artifact: &GenerationArtifact,
        section: &str,
        feedback: &Feedback,
    ) -> Result<String, GeneratorError> {
        let body = self
            .complete(PATCH_SYSTEM_PROMPT, render_patch_request(&artifact.text, section, feedback))
            .await?;
        Ok(body.trim().to_string())
    }

    async fn regenerate(
        &self,
        artifact: &GenerationArtifact,
        feedback: &Feedback,
    ) -> Result<GenerationArtifact, GeneratorError> {
        let text = self
            .complete(REGENERATE_SYSTEM_PROMPT, render_regenerate_request(&artifact.text, feedback))
            .await?;
        Ok(artifact.next_attempt(text))
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}
