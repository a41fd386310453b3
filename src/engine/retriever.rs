use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::model::{CollectionScan, EvidenceChunk, ResolvedCollection, ScanStatus};
use crate::store::{SearchRequest, VectorStore};

use super::deadline::{QueryDeadline, deadline_expired};

#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    /// Every retrieved chunk, best first; ties keep retrieval order.
    pub candidates: Vec<EvidenceChunk>,
    /// One record per resolved collection, in resolution order.
    pub scans: Vec<CollectionScan>,
}

impl RetrievalOutcome {
    pub fn highest_similarity(&self) -> Option<f64> {
        self.candidates.first().map(|chunk| chunk.similarity)
    }
}

/// Reads every item of every resolved collection for one query vector.
pub struct ExhaustiveRetriever<'a> {
    store: &'a dyn VectorStore,
    pool: &'a rayon::ThreadPool,
}

impl<'a> ExhaustiveRetriever<'a> {
    pub fn new(store: &'a dyn VectorStore, pool: &'a rayon::ThreadPool) -> Self {
        Self { store, pool }
    }

    pub fn retrieve_all(
        &self,
        query_vector: &[f32],
        collections: &[ResolvedCollection],
        deadline: Option<QueryDeadline>,
    ) -> RetrievalOutcome {
        let per_collection = self.pool.install(|| {
            collections
                .par_iter()
                .map(|collection| self.scan_collection(collection.name(), query_vector, deadline))
                .collect::<Vec<(CollectionScan, Vec<EvidenceChunk>)>>()
        });

        let mut outcome = RetrievalOutcome::default();
        for (scan, chunks) in per_collection {
            outcome.candidates.extend(chunks);
            outcome.scans.push(scan);
        }
        outcome
            .candidates
            .sort_by(|left, right| right.similarity.total_cmp(&left.similarity));

        info!(
            collections = outcome.scans.len(),
            candidates = outcome.candidates.len(),
            degraded = outcome
                .scans
                .iter()
                .filter(|scan| scan.status != ScanStatus::Complete)
                .count(),
            "retrieval finished"
        );
        outcome
    }

    fn scan_collection(
        &self,
        collection: &str,
        query_vector: &[f32],
        deadline: Option<QueryDeadline>,
    ) -> (CollectionScan, Vec<EvidenceChunk>) {
        let mut scan = CollectionScan {
            collection: collection.to_string(),
            true_item_count: None,
            items_examined: 0,
            pages: 0,
            status: ScanStatus::Complete,
            error: None,
        };

        if deadline_expired(deadline) {
            scan.status = ScanStatus::TimedOut;
            warn!(collection = %collection, "deadline expired before collection scan started");
            return (scan, Vec::new());
        }

        // Counts are re-read at retrieval time; the resolver's figure may be stale.
        let stats = match self.store.describe(collection) {
            Ok(stats) => stats,
            Err(err) => {
                warn!(collection = %collection, error = %err, "describe failed; skipping collection");
                scan.status = ScanStatus::Failed;
                scan.error = Some(err.to_string());
                return (scan, Vec::new());
            }
        };
        let true_count = usize::try_from(stats.true_item_count).unwrap_or(usize::MAX);
        scan.true_item_count = Some(stats.true_item_count);

        let page_size = self
            .store
            .max_page_size()
            .map_or(true_count, |cap| cap.min(true_count))
            .max(1);

        let mut chunks = Vec::<EvidenceChunk>::with_capacity(true_count.min(100_000));
        while chunks.len() < true_count {
            if deadline_expired(deadline) {
                warn!(
                    collection = %collection,
                    examined = chunks.len(),
                    true_count,
                    "deadline expired mid-scan"
                );
                scan.status = ScanStatus::TimedOut;
                break;
            }

            let requested = page_size.min(true_count - chunks.len());
            let request = SearchRequest {
                collection,
                query_vector,
                offset: chunks.len(),
                limit: requested,
                min_score: 0.0,
            };
            let page = match self.store.search(&request) {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        collection = %collection,
                        offset = request.offset,
                        error = %err,
                        "search failed; skipping collection"
                    );
                    scan.status = ScanStatus::Failed;
                    scan.error = Some(err.to_string());
                    return (scan, Vec::new());
                }
            };
            scan.pages += 1;

            let received = page.len().min(requested);
            chunks.extend(page.into_iter().take(requested));
            if received < requested {
                debug!(
                    collection = %collection,
                    received,
                    requested,
                    "store returned a short page"
                );
                break;
            }
        }

        scan.items_examined = chunks.len() as u64;
        if scan.status == ScanStatus::Complete && chunks.len() < true_count {
            scan.status = ScanStatus::Short;
        }

        debug!(
            collection = %collection,
            true_count,
            examined = scan.items_examined,
            pages = scan.pages,
            "collection scanned"
        );
        (scan, chunks)
    }
}
