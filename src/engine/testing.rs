//! In-crate fakes for the engine's collaborators.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::deadline::QueryDeadline;
use crate::engine::errors::{EmbeddingError, GenerationError, StoreError};
use crate::generation::{GenerationRequest, Generator};
use crate::model::{
    CollectionDescriptor, CollectionStats, EmbeddingModelProfile, EvidenceChunk,
    ResolvedCollection,
};
use crate::semantic::{Embedder, LOCAL_HASH_PROVIDER};
use crate::store::{MetadataCatalog, SearchRequest, VectorStore};

pub const FAKE_DIMENSIONS: usize = 4;

pub fn profile(model_id: &str) -> EmbeddingModelProfile {
    EmbeddingModelProfile {
        model_id: model_id.to_string(),
        provider: LOCAL_HASH_PROVIDER.to_string(),
        dimensions: FAKE_DIMENSIONS,
        display_name: format!("{model_id} (test)"),
    }
}

pub fn descriptor(name: &str, model_id: &str, verified_present: bool) -> CollectionDescriptor {
    CollectionDescriptor {
        name: name.to_string(),
        model_id: model_id.to_string(),
        provider: model_id.to_string(),
        declared_item_count: 0,
        verified_present,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

pub fn resolved(name: &str, count: u64) -> ResolvedCollection {
    ResolvedCollection {
        descriptor: descriptor(name, "local", true),
        stats: Some(CollectionStats {
            true_item_count: count,
            dimensions: FAKE_DIMENSIONS,
        }),
        verified_by_probe: false,
    }
}

pub fn chunk(collection: &str, source_id: &str, similarity: f64) -> EvidenceChunk {
    EvidenceChunk {
        collection: collection.to_string(),
        source_id: source_id.to_string(),
        text: format!("text of {source_id}"),
        similarity,
        metadata: BTreeMap::new(),
    }
}

pub fn single_thread_pool() -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .expect("test pool should build")
}

#[derive(Debug, Clone, Default)]
struct FakeCollection {
    dimensions: usize,
    chunks: Vec<EvidenceChunk>,
    reported_count: Option<u64>,
    failing_search: bool,
    transient_describe_failures: usize,
}

/// Vector store over in-memory chunks with fixed similarities.
#[derive(Debug, Default)]
pub struct FakeStore {
    collections: Mutex<BTreeMap<String, FakeCollection>>,
    page_cap: Option<usize>,
    max_requested_limit: Mutex<usize>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(self, name: &str, items: Vec<(&str, f64)>) -> Self {
        let chunks = items
            .into_iter()
            .map(|(source_id, similarity)| chunk(name, source_id, similarity))
            .collect();
        self.with_collection(name, FAKE_DIMENSIONS, chunks)
    }

    pub fn with_uniform_collection(self, name: &str, count: usize, similarity: f64) -> Self {
        let chunks = (0..count)
            .map(|index| chunk(name, &format!("{name}-{index}"), similarity))
            .collect();
        self.with_collection(name, FAKE_DIMENSIONS, chunks)
    }

    pub fn with_collection_dimensions(self, name: &str, dimensions: usize, count: usize) -> Self {
        let chunks = (0..count)
            .map(|index| chunk(name, &format!("{name}-{index}"), 0.1))
            .collect();
        self.with_collection(name, dimensions, chunks)
    }

    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    pub fn with_failing_search(self, name: &str) -> Self {
        self.update(name, |collection| collection.failing_search = true)
    }

    pub fn with_reported_count(self, name: &str, count: u64) -> Self {
        self.update(name, |collection| collection.reported_count = Some(count))
    }

    pub fn with_transient_describe_failures(self, name: &str, failures: usize) -> Self {
        self.update(name, |collection| {
            collection.transient_describe_failures = failures;
        })
    }

    pub fn max_requested_limit(&self) -> usize {
        *self.max_requested_limit.lock().unwrap()
    }

    fn with_collection(self, name: &str, dimensions: usize, chunks: Vec<EvidenceChunk>) -> Self {
        self.collections.lock().unwrap().insert(
            name.to_string(),
            FakeCollection {
                dimensions,
                chunks,
                ..FakeCollection::default()
            },
        );
        self
    }

    fn update(self, name: &str, apply: impl FnOnce(&mut FakeCollection)) -> Self {
        if let Some(collection) = self.collections.lock().unwrap().get_mut(name) {
            apply(collection);
        }
        self
    }
}

impl VectorStore for FakeStore {
    fn describe(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        let mut collections = self.collections.lock().unwrap();
        let Some(entry) = collections.get_mut(collection) else {
            return Err(StoreError::NotFound(collection.to_string()));
        };
        if entry.transient_describe_failures > 0 {
            entry.transient_describe_failures -= 1;
            return Err(StoreError::Backend("connection reset".to_string()));
        }

        Ok(CollectionStats {
            true_item_count: entry
                .reported_count
                .unwrap_or(entry.chunks.len() as u64),
            dimensions: entry.dimensions,
        })
    }

    fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<EvidenceChunk>, StoreError> {
        {
            let mut max = self.max_requested_limit.lock().unwrap();
            *max = (*max).max(request.limit);
        }

        let collections = self.collections.lock().unwrap();
        let Some(entry) = collections.get(request.collection) else {
            return Err(StoreError::NotFound(request.collection.to_string()));
        };
        if entry.failing_search {
            return Err(StoreError::Backend("search timed out".to_string()));
        }

        let mut ranked = entry.chunks.clone();
        ranked.sort_by(|left, right| right.similarity.total_cmp(&left.similarity));
        let limit = self
            .page_cap
            .map_or(request.limit, |cap| cap.min(request.limit));
        Ok(ranked
            .into_iter()
            .filter(|chunk| chunk.similarity >= request.min_score)
            .skip(request.offset)
            .take(limit)
            .collect())
    }

    fn max_page_size(&self) -> Option<usize> {
        self.page_cap
    }
}

pub struct FakeCatalog {
    descriptors: Option<Vec<CollectionDescriptor>>,
}

impl FakeCatalog {
    pub fn new(descriptors: Vec<CollectionDescriptor>) -> Self {
        Self {
            descriptors: Some(descriptors),
        }
    }

    pub fn failing() -> Self {
        Self { descriptors: None }
    }
}

impl MetadataCatalog for FakeCatalog {
    fn list_collections(&self) -> Result<Vec<CollectionDescriptor>, StoreError> {
        self.descriptors
            .clone()
            .ok_or_else(|| StoreError::Backend("catalog database is locked".to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FakeEmbedder {
    Unit,
    Failing,
    WrongDimensions,
}

impl Embedder for FakeEmbedder {
    fn embed(
        &self,
        profile: &EmbeddingModelProfile,
        _text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        match self {
            Self::Unit => {
                let mut vector = vec![0.0; profile.dimensions];
                if let Some(first) = vector.first_mut() {
                    *first = 1.0;
                }
                Ok(vector)
            }
            Self::Failing => Err(EmbeddingError::UnsupportedProvider {
                provider: profile.provider.clone(),
            }),
            Self::WrongDimensions => Ok(vec![1.0; profile.dimensions + 1]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub evidence_ids: Vec<String>,
    pub history_len: usize,
    pub session_id: Option<String>,
}

/// Shared view of the calls a scripted generator received.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallLog {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<RecordedCall> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub fn last_history_len(&self) -> Option<usize> {
        self.last().map(|call| call.history_len)
    }
}

pub struct ScriptedGenerator {
    id: String,
    reply: Result<String, GenerationError>,
    delay: Option<Duration>,
    calls: CallLog,
}

impl ScriptedGenerator {
    pub fn answering(id: &str, reply: &str) -> Self {
        Self {
            id: id.to_string(),
            reply: Ok(reply.to_string()),
            delay: None,
            calls: CallLog::default(),
        }
    }

    pub fn failing(id: &str, error: GenerationError) -> Self {
        Self {
            id: id.to_string(),
            reply: Err(error),
            delay: None,
            calls: CallLog::default(),
        }
    }

    /// Sleeps before replying, to outlast a short query deadline.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

impl Generator for ScriptedGenerator {
    fn backend_id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        _deadline: Option<QueryDeadline>,
    ) -> Result<String, GenerationError> {
        self.calls.calls.lock().unwrap().push(RecordedCall {
            evidence_ids: request
                .evidence
                .iter()
                .map(|chunk| chunk.source_id.clone())
                .collect(),
            history_len: request.history.len(),
            session_id: request.session_id.map(str::to_string),
        });
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.reply.clone()
    }
}
