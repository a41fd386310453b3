use std::time::Duration;

/// Failures that stop a query before the gate can decide.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("unknown embedding model '{model_id}' (known: {known})")]
    UnknownModel { model_id: String, known: String },

    #[error("metadata catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    #[error("embedding unavailable for model '{model_id}': {source}")]
    EmbeddingUnavailable {
        model_id: String,
        #[source]
        source: EmbeddingError,
    },

    #[error("generation unavailable after trying [{}]: {last_error}", .attempted.join(", "))]
    GenerationUnavailable {
        attempted: Vec<String>,
        last_error: String,
    },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuery => "empty_query",
            Self::UnknownModel { .. } => "unknown_model",
            Self::CatalogUnavailable { .. } => "catalog_unavailable",
            Self::EmbeddingUnavailable { .. } => "embedding_unavailable",
            Self::GenerationUnavailable { .. } => "generation_unavailable",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("collection '{0}' does not exist in the vector store")]
    NotFound(String),

    #[error("vector store request failed: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("no embedding backend for provider '{provider}'")]
    UnsupportedProvider { provider: String },

    #[error("text to embed is empty")]
    EmptyInput,

    #[error("embedding has {actual} dimensions, profile expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("backend returned a malformed payload: {0}")]
    Malformed(String),

    #[error("no time left in the query budget")]
    DeadlineExceeded,
}
