use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::WebhookConfig;
use crate::engine::deadline::{QueryDeadline, request_timeout};
use crate::engine::errors::GenerationError;
use crate::model::ConversationTurn;
use crate::util::now_utc_string;

use super::{GenerationRequest, Generator, send_json};

const PAYLOAD_SOURCE: &str = "groundgate";

/// Remote answer workflow reached over an HTTP webhook.
pub struct WebhookGenerator {
    id: String,
    url: String,
    timeout: Duration,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Serialize)]
struct WorkflowPayload<'a> {
    message: &'a str,
    session_id: Option<&'a str>,
    model_id: &'a str,
    collections: Vec<WorkflowCollection<'a>>,
    evidence: Vec<WorkflowEvidence<'a>>,
    chat_history: &'a [ConversationTurn],
    timestamp: String,
    source: &'static str,
}

#[derive(Debug, Serialize)]
struct WorkflowCollection<'a> {
    name: &'a str,
    model_id: &'a str,
    provider: &'a str,
    item_count: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WorkflowEvidence<'a> {
    collection: &'a str,
    source_id: &'a str,
    text: &'a str,
    similarity: f64,
    model_id: &'a str,
    provider: &'a str,
    metadata: &'a BTreeMap<String, Value>,
}

impl WebhookGenerator {
    pub fn from_config(config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .context("failed to build webhook HTTP client")?;
        let password = config
            .password_env
            .as_deref()
            .and_then(|name| env::var(name).ok());

        Ok(Self {
            id: config.id.clone(),
            url: config.url.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            username: config.username.clone(),
            password,
            client,
        })
    }

    fn payload<'a>(&self, request: &'a GenerationRequest<'a>) -> WorkflowPayload<'a> {
        WorkflowPayload {
            message: request.query,
            session_id: request.session_id,
            model_id: &request.model.model_id,
            collections: request
                .collections
                .iter()
                .map(|collection| WorkflowCollection {
                    name: collection.name(),
                    model_id: &collection.descriptor.model_id,
                    provider: &collection.descriptor.provider,
                    item_count: collection.stats.map(|stats| stats.true_item_count),
                })
                .collect(),
            evidence: request
                .evidence
                .iter()
                .map(|chunk| WorkflowEvidence {
                    collection: &chunk.collection,
                    source_id: &chunk.source_id,
                    text: &chunk.text,
                    similarity: chunk.similarity,
                    model_id: &request.model.model_id,
                    provider: &request.model.provider,
                    metadata: &chunk.metadata,
                })
                .collect(),
            chat_history: request.history,
            timestamp: now_utc_string(),
            source: PAYLOAD_SOURCE,
        }
    }
}

impl Generator for WebhookGenerator {
    fn backend_id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        deadline: Option<QueryDeadline>,
    ) -> Result<String, GenerationError> {
        let timeout = request_timeout(deadline, self.timeout);
        let mut http = self.client.post(&self.url).json(&self.payload(request));
        if let Some(username) = &self.username {
            http = http.basic_auth(username, self.password.as_deref());
        }

        debug!(backend = %self.id, url = %self.url, evidence = request.evidence.len(), "calling workflow");
        let reply = send_json(http, timeout)?;
        workflow_answer(&reply)
    }
}

/// Reads the answer from a workflow reply, accepting a one-element array wrapper.
fn workflow_answer(reply: &Value) -> Result<String, GenerationError> {
    let body = match reply {
        Value::Array(items) => items.first(),
        other => Some(other),
    };

    let answer = body
        .and_then(|body| {
            ["response", "answer", "output"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_str))
        })
        .map(str::trim)
        .unwrap_or_default();
    if answer.is_empty() {
        return Err(GenerationError::Malformed(
            "workflow reply has no answer text".to_string(),
        ));
    }
    Ok(answer.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{chunk, profile, resolved};
    use serde_json::json;

    fn generator() -> WebhookGenerator {
        WebhookGenerator::from_config(&WebhookConfig {
            id: "workflow".to_string(),
            url: "http://127.0.0.1:9/webhook/rag".to_string(),
            timeout_ms: 500,
            username: Some("rag".to_string()),
            password_env: None,
        })
        .unwrap()
    }

    #[test]
    fn payload_carries_query_evidence_and_history() {
        let model = profile("local");
        let evidence = vec![chunk("staff", "doc-7", 0.91)];
        let collections = vec![resolved("staff", 12)];
        let history = vec![ConversationTurn {
            role: "user".to_string(),
            content: "hello".to_string(),
            timestamp: None,
        }];
        let request = GenerationRequest {
            query: "what is Jane Doe's specialty",
            model: &model,
            evidence: &evidence,
            collections: &collections,
            session_id: Some("session-1"),
            history: &history,
        };

        let generator = generator();
        let value = serde_json::to_value(generator.payload(&request)).unwrap();
        assert_eq!(value["message"], "what is Jane Doe's specialty");
        assert_eq!(value["session_id"], "session-1");
        assert_eq!(value["model_id"], "local");
        assert_eq!(value["collections"][0]["name"], "staff");
        assert_eq!(value["collections"][0]["item_count"], 12);
        assert_eq!(value["evidence"][0]["source_id"], "doc-7");
        assert_eq!(value["evidence"][0]["collection"], "staff");
        assert_eq!(value["evidence"][0]["model_id"], "local");
        assert_eq!(value["evidence"][0]["provider"], model.provider.as_str());
        assert_eq!(value["chat_history"][0]["content"], "hello");
        assert_eq!(value["source"], PAYLOAD_SOURCE);
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn workflow_answer_accepts_known_shapes() {
        assert_eq!(
            workflow_answer(&json!({"response": " Jane is a cardiologist [1]. "})).unwrap(),
            "Jane is a cardiologist [1]."
        );
        assert_eq!(
            workflow_answer(&json!([{"answer": "From the list."}])).unwrap(),
            "From the list."
        );
        assert!(matches!(
            workflow_answer(&json!({"response": ""})),
            Err(GenerationError::Malformed(_))
        ));
        assert!(workflow_answer(&json!({"status": "ok"})).is_err());
    }

    #[test]
    fn exhausted_budget_fails_before_sending() {
        let model = profile("local");
        let request = GenerationRequest {
            query: "q",
            model: &model,
            evidence: &[],
            collections: &[],
            session_id: None,
            history: &[],
        };
        let deadline = QueryDeadline::new(1);
        std::thread::sleep(Duration::from_millis(5));

        let err = generator().generate(&request, deadline).unwrap_err();
        assert!(matches!(err, GenerationError::DeadlineExceeded));
    }
}
