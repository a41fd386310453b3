mod chat;
mod prompt;
mod webhook;

pub use chat::ChatCompletionGenerator;
pub use prompt::build_grounded_prompt;
pub use webhook::WebhookGenerator;

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::GenerationConfig;
use crate::engine::deadline::{QueryDeadline, deadline_expired};
use crate::engine::errors::{EngineError, GenerationError};
use crate::model::{
    ConversationTurn, EmbeddingModelProfile, EvidenceChunk, ResolvedCollection, ServedBy,
};

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub model: &'a EmbeddingModelProfile,
    pub evidence: &'a [EvidenceChunk],
    pub collections: &'a [ResolvedCollection],
    pub session_id: Option<&'a str>,
    pub history: &'a [ConversationTurn],
}

/// One answer-generation backend. Remote and local backends share this contract.
pub trait Generator: Send + Sync {
    fn backend_id(&self) -> &str;

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        deadline: Option<QueryDeadline>,
    ) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAnswer {
    pub text: String,
    pub served_by: ServedBy,
    pub backend_id: String,
}

/// Tries the remote workflow first, then each local backend in priority order.
pub struct AnswerOrchestrator {
    primary: Option<Box<dyn Generator>>,
    fallbacks: Vec<Box<dyn Generator>>,
    history_turns: usize,
}

impl AnswerOrchestrator {
    pub fn new(
        primary: Option<Box<dyn Generator>>,
        fallbacks: Vec<Box<dyn Generator>>,
        history_turns: usize,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            history_turns,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let primary = match &config.primary {
            Some(webhook) => Some(Box::new(WebhookGenerator::from_config(webhook)?) as Box<dyn Generator>),
            None => None,
        };

        let mut fallbacks = Vec::<Box<dyn Generator>>::with_capacity(config.fallbacks.len());
        for backend in &config.fallbacks {
            fallbacks.push(Box::new(ChatCompletionGenerator::from_config(backend)?));
        }

        Ok(Self::new(primary, fallbacks, config.history_turns))
    }

    pub fn backend_ids(&self) -> Vec<&str> {
        self.primary
            .iter()
            .chain(self.fallbacks.iter())
            .map(|backend| backend.backend_id())
            .collect()
    }

    pub fn answer(
        &self,
        request: &GenerationRequest<'_>,
        deadline: Option<QueryDeadline>,
    ) -> Result<GeneratedAnswer, EngineError> {
        let history = recent_turns(request.history, self.history_turns);
        let request = GenerationRequest {
            history,
            ..*request
        };

        let attempts = self
            .primary
            .iter()
            .map(|backend| (backend, ServedBy::Primary))
            .chain(self.fallbacks.iter().map(|backend| (backend, ServedBy::Fallback)));

        let mut attempted = Vec::<String>::new();
        let mut last_error = "no generation backend configured".to_string();
        for (backend, served_by) in attempts {
            if deadline_expired(deadline) {
                last_error = GenerationError::DeadlineExceeded.to_string();
                break;
            }

            attempted.push(backend.backend_id().to_string());
            match backend.generate(&request, deadline) {
                Ok(text) => {
                    info!(
                        backend = %backend.backend_id(),
                        served_by = ?served_by,
                        evidence = request.evidence.len(),
                        "generation succeeded"
                    );
                    return Ok(GeneratedAnswer {
                        text,
                        served_by,
                        backend_id: backend.backend_id().to_string(),
                    });
                }
                Err(err) => {
                    warn!(backend = %backend.backend_id(), error = %err, "generation backend failed");
                    last_error = format!("{}: {err}", backend.backend_id());
                }
            }
        }

        Err(EngineError::GenerationUnavailable {
            attempted,
            last_error,
        })
    }
}

fn recent_turns(history: &[ConversationTurn], keep: usize) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(keep)..]
}

/// Sends a JSON request bounded by `timeout` and decodes a JSON reply.
fn send_json(
    request: reqwest::blocking::RequestBuilder,
    timeout: Duration,
) -> Result<serde_json::Value, GenerationError> {
    if timeout.is_zero() {
        return Err(GenerationError::DeadlineExceeded);
    }

    let response = request.timeout(timeout).send().map_err(|err| {
        if err.is_timeout() {
            GenerationError::Timeout(timeout)
        } else {
            GenerationError::Unreachable(err.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(GenerationError::Status(status.as_u16()));
    }

    response
        .json::<serde_json::Value>()
        .map_err(|err| GenerationError::Malformed(err.to_string()))
}
