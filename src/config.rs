use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::EmbeddingModelProfile;
use crate::semantic::LOCAL_HASH_PROVIDER;

pub const DEFAULT_MODEL_ID: &str = "miniLM-L6-v2-local-v1";

/// Process-wide settings. Loaded once and shared read-only by every query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub retrieval: RetrievalConfig,
    pub models: ModelProfiles,
    pub classifier: ClassifierConfig,
    pub gate: GateConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_concurrent_searches: usize,
    pub probe_retries: usize,
    pub store_page_cap: Option<usize>,
    pub top_k: usize,
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_concurrent_searches: 4,
            probe_retries: 2,
            store_page_cap: Some(1000),
            top_k: 8,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelProfiles(pub Vec<EmbeddingModelProfile>);

impl Default for ModelProfiles {
    fn default() -> Self {
        Self(vec![
            EmbeddingModelProfile {
                model_id: DEFAULT_MODEL_ID.to_string(),
                provider: LOCAL_HASH_PROVIDER.to_string(),
                dimensions: 384,
                display_name: "Local hashed MiniLM-compatible space".to_string(),
            },
            EmbeddingModelProfile {
                model_id: "openai".to_string(),
                provider: "openai".to_string(),
                dimensions: 1536,
                display_name: "OpenAI text-embedding-3-small".to_string(),
            },
            EmbeddingModelProfile {
                model_id: "gemini".to_string(),
                provider: "gemini".to_string(),
                dimensions: 3072,
                display_name: "Google gemini-embedding-001".to_string(),
            },
        ])
    }
}

impl ModelProfiles {
    pub fn find(&self, model_id: &str) -> Option<&EmbeddingModelProfile> {
        let trimmed = model_id.trim();
        self.0.iter().find(|profile| profile.model_id == trimmed)
    }

    pub fn known_ids(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(|profile| profile.model_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRuleConfig {
    pub class: String,
    pub threshold: f64,
    pub patterns: Vec<String>,
}

/// Ordered rule table. The first rule with a matching pattern decides the class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub default_class: String,
    pub default_threshold: f64,
    pub rules: Vec<ClassifierRuleConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            default_class: "unclassified".to_string(),
            default_threshold: 0.65,
            rules: vec![
                rule(
                    "philosophical",
                    0.90,
                    &[
                        r"(?i)\bmeaning of (life|existence|it all)\b",
                        r"(?i)\b(purpose|point) of (life|existence|living|being)\b",
                        r"(?i)\bwhy (do|does|are|is) (we|humans|people|anything|the universe) (exist|live|matter)\b",
                        r"(?i)\b(free will|consciousness|morality|existential\w*|metaphysic\w*|afterlife|human nature|philosoph\w*)\b",
                        r"(?i)\bwhat is (love|truth|reality|happiness|beauty|justice|the soul|god)\b",
                    ],
                ),
                rule(
                    "general_science",
                    0.80,
                    &[
                        r"(?i)\b(physics|chemistry|biology|quantum|relativity|photosynthesis|gravity|thermodynamics|entropy|evolution)\b",
                        r"(?i)\b(atoms?|molecules?|dna|genes?|proteins?|photons?|electrons?|black holes?|big bang|speed of light)\b",
                        r"(?i)\b(scientific method|theory of \w+|laws? of (motion|physics|nature))\b",
                    ],
                ),
                rule(
                    "specific",
                    0.50,
                    &[
                        // Capitalised words count only after a lowercase word.
                        r"\b\p{Ll}+\s+\p{Lu}\p{Ll}+(?:\s+\p{Lu}\p{Ll}+)+\b",
                        r"\s\p{Lu}[\p{L}-]*'s\b",
                        r"\b\p{Ll}+\s+\p{Lu}\p{Ll}{2,}\b",
                        r"\b\p{Lu}{2,}\d*\b",
                        r#""[^"]+"|“[^”]+”"#,
                        r"\b\d+(?:\.\d+)+\b",
                        r"(?i)\b(section|clause|chapter|table|annex|appendix|article|page|contract|invoice|policy|ticket)\s+[\w.-]*\d[\w.-]*",
                    ],
                ),
                rule(
                    "explanatory",
                    0.75,
                    &[
                        r"(?i)^\s*(explain|define|describe|what\s+is|what\s+are|what's|how\s+does|how\s+do|why\s+does|why\s+is)\b",
                        r"(?i)\b(explain|describe|definition of|meaning of)\b",
                    ],
                ),
            ],
        }
    }
}

fn rule(class: &str, threshold: f64, patterns: &[&str]) -> ClassifierRuleConfig {
    ClassifierRuleConfig {
        class: class.to_string(),
        threshold,
        patterns: patterns.iter().map(|pattern| pattern.to_string()).collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Phrases that mean the generator could not ground its answer.
    pub negative_markers: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            negative_markers: [
                "the provided context does not contain",
                "context does not contain",
                "does not contain this information",
                "not available in the provided context",
                "not mentioned in the context",
                "no information about",
                "there is no information",
                "cannot answer based on",
                "unable to answer based on",
                "insufficient information",
                "não há informações",
                "contexto não contém",
                "não é possível responder",
            ]
            .iter()
            .map(|marker| marker.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub history_turns: usize,
    pub primary: Option<WebhookConfig>,
    /// Local fallbacks in priority order.
    pub fallbacks: Vec<ChatBackendConfig>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            history_turns: 6,
            primary: None,
            fallbacks: vec![
                ChatBackendConfig {
                    id: "openai-gpt-4o-mini".to_string(),
                    endpoint: "https://api.openai.com".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    api_key_env: Some("OPENAI_API_KEY".to_string()),
                    timeout_ms: 30_000,
                    temperature: 0.0,
                },
                ChatBackendConfig {
                    id: "ollama-llama3.2".to_string(),
                    endpoint: "http://localhost:11434".to_string(),
                    model: "llama3.2:3b".to_string(),
                    api_key_env: None,
                    timeout_ms: 60_000,
                    temperature: 0.0,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_id")]
    pub id: String,
    pub url: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_webhook_id() -> String {
    "workflow".to_string()
}

fn default_webhook_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBackendConfig {
    pub id: String,
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_chat_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub temperature: f64,
}

fn default_chat_timeout_ms() -> u64 {
    30_000
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str::<Self>(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.max_concurrent_searches == 0 {
            bail!("retrieval.max_concurrent_searches must be at least 1");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be at least 1");
        }

        if self.models.0.is_empty() {
            bail!("at least one embedding model profile must be configured");
        }
        let mut seen = HashSet::<&str>::new();
        for profile in &self.models.0 {
            if profile.model_id.trim().is_empty() {
                bail!("embedding model profiles need a non-empty model_id");
            }
            if profile.dimensions == 0 {
                bail!("model '{}' declares zero dimensions", profile.model_id);
            }
            if !seen.insert(profile.model_id.as_str()) {
                bail!("model '{}' is configured twice", profile.model_id);
            }
        }

        check_threshold("classifier.default_threshold", self.classifier.default_threshold)?;
        for rule in &self.classifier.rules {
            check_threshold(&format!("classifier rule '{}'", rule.class), rule.threshold)?;
            if rule.patterns.is_empty() {
                bail!("classifier rule '{}' has no patterns", rule.class);
            }
        }

        if self
            .gate
            .negative_markers
            .iter()
            .any(|marker| marker.trim().is_empty())
        {
            bail!("gate.negative_markers must not contain empty markers");
        }

        let mut backend_ids = HashSet::<&str>::new();
        let primary_id = self.generation.primary.as_ref().map(|primary| primary.id.as_str());
        for backend_id in primary_id
            .into_iter()
            .chain(self.generation.fallbacks.iter().map(|backend| backend.id.as_str()))
        {
            if !backend_ids.insert(backend_id) {
                bail!("generation backend id '{backend_id}' is used twice");
            }
        }

        Ok(())
    }
}

fn check_threshold(label: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{label} threshold {value} is outside 0.0..=1.0");
    }
    Ok(())
}
