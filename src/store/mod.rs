mod sqlite;

pub use sqlite::{
    INDEX_SCHEMA_VERSION, SqliteCatalog, SqliteVectorStore, StoredItem, count_items, open_index,
    register_catalog_collection, register_store_collection, upsert_item,
};

use crate::engine::errors::StoreError;
use crate::model::{CollectionDescriptor, CollectionStats, EvidenceChunk};

#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    pub collection: &'a str,
    pub query_vector: &'a [f32],
    pub offset: usize,
    pub limit: usize,
    pub min_score: f64,
}

/// Live vector store. Counts and page sizes are always read fresh from here.
pub trait VectorStore: Send + Sync {
    fn describe(&self, collection: &str) -> Result<CollectionStats, StoreError>;

    /// Ranked slice `[offset, offset + limit)` of the collection's items for the
    /// query vector, best first.
    fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<EvidenceChunk>, StoreError>;

    /// Hard cap on items returned by one `search` call, if the store has one.
    fn max_page_size(&self) -> Option<usize> {
        None
    }
}

pub trait MetadataCatalog: Send + Sync {
    fn list_collections(&self) -> Result<Vec<CollectionDescriptor>, StoreError>;
}
