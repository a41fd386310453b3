pub mod classifier;
pub mod deadline;
pub mod errors;
pub mod gate;
pub mod resolver;
pub mod retriever;

#[cfg(test)]
pub mod testing;

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{AppConfig, ModelProfiles};
use crate::generation::AnswerOrchestrator;
use crate::model::{
    ConversationTurn, EmbeddingModelProfile, GateOutcome, RejectionReason, RetrievalReport,
};
use crate::semantic::{Embedder, LocalHashEmbedder};
use crate::store::{MetadataCatalog, SqliteCatalog, SqliteVectorStore, VectorStore};

use classifier::RelevanceClassifier;
use deadline::QueryDeadline;
use errors::{EmbeddingError, EngineError};
use gate::{GateInput, GroundingGate, NegativeMarkers};
use resolver::CollectionResolver;
use retriever::{ExhaustiveRetriever, RetrievalOutcome};

#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub query: String,
    pub model_id: String,
    pub session_id: Option<String>,
    pub history: Vec<ConversationTurn>,
    /// Overrides `retrieval.timeout_ms`; `Some(0)` disables the deadline.
    pub timeout_ms: Option<u64>,
    /// Caller floor on the classifier threshold. Never lowers it.
    pub min_threshold: Option<f64>,
}

/// External collaborators the engine talks to.
pub struct EngineParts {
    pub catalog: Box<dyn MetadataCatalog>,
    pub store: Box<dyn VectorStore>,
    pub embedder: Box<dyn Embedder>,
    pub orchestrator: AnswerOrchestrator,
}

/// Resolve, retrieve, classify, gate. Holds no per-query state.
pub struct GroundingEngine {
    models: ModelProfiles,
    classifier: RelevanceClassifier,
    markers: NegativeMarkers,
    parts: EngineParts,
    pool: rayon::ThreadPool,
    top_k: usize,
    probe_retries: usize,
    default_timeout_ms: u64,
}

impl GroundingEngine {
    pub fn new(config: &AppConfig, parts: EngineParts) -> Result<Self> {
        config.validate()?;
        let classifier = RelevanceClassifier::from_config(&config.classifier)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.retrieval.max_concurrent_searches)
            .thread_name(|index| format!("groundgate-search-{index}"))
            .build()
            .context("failed to build retrieval thread pool")?;
        info!(
            models = config.models.0.len(),
            rules = classifier.rules().len(),
            backends = ?parts.orchestrator.backend_ids(),
            workers = config.retrieval.max_concurrent_searches,
            "grounding engine ready"
        );

        Ok(Self {
            models: config.models.clone(),
            classifier,
            markers: NegativeMarkers::new(&config.gate.negative_markers),
            parts,
            pool,
            top_k: config.retrieval.top_k,
            probe_retries: config.retrieval.probe_retries,
            default_timeout_ms: config.retrieval.timeout_ms,
        })
    }

    /// Engine over the local SQLite index with the configured generation backends.
    pub fn open_local(config: &AppConfig, db_path: &Path) -> Result<Self> {
        let parts = EngineParts {
            catalog: Box::new(SqliteCatalog::new(db_path)),
            store: Box::new(SqliteVectorStore::new(
                db_path,
                config.retrieval.store_page_cap,
            )),
            embedder: Box::new(LocalHashEmbedder),
            orchestrator: AnswerOrchestrator::from_config(&config.generation)?,
        };
        Self::new(config, parts)
    }

    pub fn ask(&self, request: &AskRequest) -> Result<GateOutcome, EngineError> {
        let started = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(EngineError::EmptyQuery);
        }

        let profile = self.profile(&request.model_id)?;
        let deadline = QueryDeadline::new(request.timeout_ms.unwrap_or(self.default_timeout_ms));
        let classification = self
            .classifier
            .classify_with_floor(query, request.min_threshold);
        info!(
            model_id = %profile.model_id,
            class = %classification.class,
            threshold = classification.threshold,
            pattern = classification.matched_pattern.as_deref().unwrap_or("default"),
            "query classified"
        );

        let collections = CollectionResolver::new(
            self.parts.catalog.as_ref(),
            self.parts.store.as_ref(),
            self.probe_retries,
        )
        .resolve(profile)?;
        if collections.is_empty() {
            info!(model_id = %profile.model_id, "no searchable collections; rejecting");
            let mut report =
                RetrievalReport::from_scans(&profile.model_id, &classification, 0, Vec::new(), None);
            report.duration_ms = elapsed_ms(started);
            return Ok(GateOutcome::rejected(
                query,
                report,
                RejectionReason::NoSearchableCorpus,
            ));
        }

        let query_vector = self.embed_query(profile, query)?;

        let outcome = ExhaustiveRetriever::new(self.parts.store.as_ref(), &self.pool)
            .retrieve_all(&query_vector, &collections, deadline);
        let highest = outcome.highest_similarity();
        let RetrievalOutcome { candidates, scans } = outcome;
        let mut report = RetrievalReport::from_scans(
            &profile.model_id,
            &classification,
            collections.len(),
            scans,
            highest,
        );
        if report.degraded() {
            warn!(
                model_id = %profile.model_id,
                resolved = report.collections_resolved,
                searched = report.collections_searched,
                examined = report.total_items_examined,
                expected = report.expected_items,
                "retrieval incomplete"
            );
        }

        if let Some(deadline) = deadline
            && deadline.is_expired()
        {
            warn!(
                query = %query,
                elapsed_ms = deadline.elapsed_ms(),
                timeout_ms = deadline.timeout_ms(),
                "deadline expired during retrieval"
            );
            report.duration_ms = elapsed_ms(started);
            return Ok(GateOutcome::rejected(
                query,
                report,
                RejectionReason::DeadlineExceeded,
            ));
        }

        let gate = GroundingGate::new(&self.parts.orchestrator, &self.markers, self.top_k);
        let mut outcome = gate.evaluate(GateInput {
            query,
            classification: &classification,
            candidates: &candidates,
            report,
            profile,
            collections: &collections,
            session_id: request.session_id.as_deref(),
            history: &request.history,
            deadline,
        });
        outcome.report.duration_ms = elapsed_ms(started);
        Ok(outcome)
    }

    fn profile(&self, model_id: &str) -> Result<&EmbeddingModelProfile, EngineError> {
        self.models
            .find(model_id)
            .ok_or_else(|| EngineError::UnknownModel {
                model_id: model_id.trim().to_string(),
                known: self.models.known_ids().join(", "),
            })
    }

    fn embed_query(
        &self,
        profile: &EmbeddingModelProfile,
        query: &str,
    ) -> Result<Vec<f32>, EngineError> {
        let embedded = self
            .parts
            .embedder
            .embed(profile, query)
            .and_then(|vector| {
                if vector.len() == profile.dimensions {
                    Ok(vector)
                } else {
                    Err(EmbeddingError::DimensionMismatch {
                        expected: profile.dimensions,
                        actual: vector.len(),
                    })
                }
            });

        embedded.map_err(|source| EngineError::EmbeddingUnavailable {
            model_id: profile.model_id.clone(),
            source,
        })
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
