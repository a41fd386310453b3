use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ChatBackendConfig;
use crate::engine::deadline::{QueryDeadline, request_timeout};
use crate::engine::errors::GenerationError;

use super::{GenerationRequest, Generator, build_grounded_prompt, send_json};

/// Local or hosted model behind an OpenAI-compatible chat completions endpoint.
pub struct ChatCompletionGenerator {
    id: String,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    temperature: f64,
    client: reqwest::blocking::Client,
}

impl ChatCompletionGenerator {
    pub fn from_config(config: &ChatBackendConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .with_context(|| format!("failed to build HTTP client for backend '{}'", config.id))?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| env::var(name).ok())
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            id: config.id.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_millis(config.timeout_ms),
            temperature: config.temperature,
            client,
        })
    }

    fn request_body(&self, request: &GenerationRequest<'_>) -> Value {
        let prompt = build_grounded_prompt(request);

        let mut messages = Vec::<Value>::with_capacity(request.history.len() + 2);
        messages.push(json!({"role": "system", "content": prompt.system}));
        for turn in request.history {
            let role = match turn.role.as_str() {
                "assistant" => "assistant",
                _ => "user",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": prompt.user}));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": false,
        })
    }
}

impl Generator for ChatCompletionGenerator {
    fn backend_id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        deadline: Option<QueryDeadline>,
    ) -> Result<String, GenerationError> {
        let timeout = request_timeout(deadline, self.timeout);
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let mut http = self.client.post(&url).json(&self.request_body(request));
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }

        debug!(backend = %self.id, model = %self.model, "calling chat completions");
        let reply = send_json(http, timeout)?;
        completion_text(&reply)
    }
}

fn completion_text(reply: &Value) -> Result<String, GenerationError> {
    reply
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| {
            GenerationError::Malformed("chat completion has no choices[0].message.content".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{chunk, profile};
    use crate::model::ConversationTurn;

    fn backend() -> ChatCompletionGenerator {
        ChatCompletionGenerator::from_config(&ChatBackendConfig {
            id: "ollama".to_string(),
            endpoint: "http://localhost:11434/".to_string(),
            model: "llama3.2:3b".to_string(),
            api_key_env: None,
            timeout_ms: 1_000,
            temperature: 0.0,
        })
        .unwrap()
    }

    #[test]
    fn body_wraps_history_between_system_and_question() {
        let model = profile("local");
        let evidence = vec![chunk("staff", "doc-7", 0.91)];
        let history = vec![
            ConversationTurn {
                role: "user".to_string(),
                content: "hi".to_string(),
                timestamp: None,
            },
            ConversationTurn {
                role: "assistant".to_string(),
                content: "hello".to_string(),
                timestamp: None,
            },
        ];
        let request = GenerationRequest {
            query: "what is Jane Doe's specialty",
            model: &model,
            evidence: &evidence,
            collections: &[],
            session_id: None,
            history: &history,
        };

        let backend = backend();
        assert_eq!(backend.endpoint, "http://localhost:11434");
        let body = backend.request_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["role"], "user");
        assert!(messages[3]["content"].as_str().unwrap().contains("doc-7"));
        assert_eq!(body["model"], "llama3.2:3b");
    }

    #[test]
    fn completion_text_reads_first_choice() {
        let reply = json!({"choices": [{"message": {"role": "assistant", "content": " Cardiology [1]. "}}]});
        assert_eq!(completion_text(&reply).unwrap(), "Cardiology [1].");
        assert!(matches!(
            completion_text(&json!({"choices": []})),
            Err(GenerationError::Malformed(_))
        ));
    }
}
