//! Math tutoring flows built on the metered completion service.
//!
//! Every completion goes through [`MeteredCompletions::query_gated`], so each
//! flow either returns the model's answer or `Gate::Denied` when the user is
//! out of credits. Embedding lookups for recommendations are not billed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use credit_ledger::{
    ChatMessage, CompletionService, ContentPart, Gate, MeteredCompletions, UpstreamError, UserId,
};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, ModelsConfig, PromptsConfig};
use crate::videos::VideoIndex;

pub const NO_VIDEO_REPLY: &str = "No encontré ningún video relacionado";

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error(transparent)]
    Ledger(#[from] credit_ledger::Error),

    #[error("embedding failed: {0}")]
    Embedding(#[from] UpstreamError),
}

pub type AssistantResult<T> = Result<Gate<T>, AssistantError>;

pub struct MathAssistant {
    metered: MeteredCompletions,
    service: Arc<dyn CompletionService>,
    videos: Arc<dyn VideoIndex>,
    models: ModelsConfig,
    prompts: PromptsConfig,
    recommendation_limit: usize,
}

impl MathAssistant {
    pub fn new(
        config: &Config,
        metered: MeteredCompletions,
        service: Arc<dyn CompletionService>,
        videos: Arc<dyn VideoIndex>,
    ) -> Self {
        Self {
            metered,
            service,
            videos,
            models: config.models.clone(),
            prompts: config.prompts.clone(),
            recommendation_limit: config.recommendation.limit,
        }
    }

    pub fn metered(&self) -> &MeteredCompletions {
        &self.metered
    }

    /// Continue a conversation. `history` ends with the user's new message.
    pub async fn chat(&self, history: &[ChatMessage], user_id: UserId) -> AssistantResult<String> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.prompts.system.as_str()));
        messages.extend_from_slice(history);

        Ok(self
            .metered
            .query_gated(&messages, &self.models.chat, user_id)
            .await?)
    }

    /// Transcribe and classify the problem in a JPEG image.
    pub async fn parse_image(&self, image: &[u8], user_id: UserId) -> AssistantResult<String> {
        let messages = [ChatMessage::user_parts(vec![
            ContentPart::text(self.prompts.image_parse.as_str()),
            ContentPart::jpeg_base64(&BASE64.encode(image)),
        ])];

        Ok(self
            .metered
            .query_gated(&messages, &self.models.image, user_id)
            .await?)
    }

    pub async fn solve_problem(&self, problem: &str, user_id: UserId) -> AssistantResult<String> {
        let messages = [ChatMessage::user_parts(vec![ContentPart::text(
            solve_prompt(&self.prompts.problem_solve, problem),
        )])];

        Ok(self
            .metered
            .query_gated(&messages, &self.models.solve, user_id)
            .await?)
    }

    /// Pick the most relevant catalogue video for `problem`.
    pub async fn recommend_video(&self, problem: &str, user_id: UserId) -> AssistantResult<String> {
        let embedding = self.service.embed(problem, &self.models.embedding).await?;
        let hits = self
            .videos
            .nearest(&embedding, self.recommendation_limit)
            .await?;

        let mut candidates = String::new();
        for (id, distance) in hits {
            if let Some(video) = self.videos.details(id).await? {
                debug!(id, distance, "Recommendation candidate");
                let _ = writeln!(candidates, "{}:{}", video.url, video.description);
            }
        }
        if candidates.is_empty() {
            return Ok(Gate::Granted(NO_VIDEO_REPLY.to_string()));
        }

        let prompt = format!(
            "{}\n\nProblema de matemáticas: {problem}\n\nLista de videos y links:\n{candidates}",
            self.prompts.recommendation
        );
        let messages = [ChatMessage::user_parts(vec![ContentPart::text(prompt)])];

        Ok(self
            .metered
            .query_gated(&messages, &self.models.recommendation, user_id)
            .await?)
    }
}

fn solve_prompt(template: &str, problem: &str) -> String {
    if template.contains("{problem}") {
        template.replace("{problem}", problem)
    } else {
        format!("{template} {problem}")
    }
}
