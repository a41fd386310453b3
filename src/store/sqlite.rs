use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::engine::errors::StoreError;
use crate::model::{CollectionDescriptor, CollectionStats, EvidenceChunk};
use crate::semantic::{cosine_similarity, decode_embedding_blob, encode_embedding_blob};

use super::{MetadataCatalog, SearchRequest, VectorStore};

pub const INDEX_SCHEMA_VERSION: &str = "0.1.0";

#[derive(Debug, Clone)]
pub struct StoredItem {
    pub item_id: String,
    pub source_id: String,
    pub content: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub embedding: Vec<f32>,
    pub text_hash: String,
}

/// Opens the index database for writing, creating the schema when missing.
pub fn open_index(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open index database: {}", db_path.display()))?;

    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    ensure_schema(&connection)?;

    Ok(connection)
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata(
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS catalog_collections(
              name TEXT PRIMARY KEY,
              model_id TEXT NOT NULL,
              provider TEXT NOT NULL,
              declared_item_count INTEGER NOT NULL DEFAULT 0,
              verified_present INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vector_collections(
              name TEXT PRIMARY KEY,
              dimensions INTEGER NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vector_items(
              collection TEXT NOT NULL,
              item_id TEXT NOT NULL,
              source_id TEXT NOT NULL,
              content TEXT NOT NULL,
              metadata_json TEXT,
              embedding BLOB NOT NULL,
              embedding_dim INTEGER NOT NULL,
              text_hash TEXT NOT NULL,
              PRIMARY KEY(collection, item_id)
            );
            ",
        )
        .context("failed to create index schema")?;

    connection.execute(
        "
        INSERT INTO metadata(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value=excluded.value
        ",
        [INDEX_SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn register_store_collection(
    connection: &Connection,
    name: &str,
    dimensions: usize,
    created_at: &str,
) -> Result<()> {
    connection
        .execute(
            "
            INSERT INTO vector_collections(name, dimensions, created_at)
            VALUES(?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET dimensions=excluded.dimensions
            ",
            params![name, dimensions as i64, created_at],
        )
        .with_context(|| format!("failed to register store collection '{name}'"))?;
    Ok(())
}

pub fn register_catalog_collection(
    connection: &Connection,
    descriptor: &CollectionDescriptor,
) -> Result<()> {
    connection
        .execute(
            "
            INSERT INTO catalog_collections(name, model_id, provider, declared_item_count, verified_present, created_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name) DO UPDATE SET
              model_id=excluded.model_id,
              provider=excluded.provider,
              declared_item_count=excluded.declared_item_count,
              verified_present=excluded.verified_present
            ",
            params![
                descriptor.name,
                descriptor.model_id,
                descriptor.provider,
                descriptor.declared_item_count as i64,
                descriptor.verified_present,
                descriptor.created_at,
            ],
        )
        .with_context(|| format!("failed to register catalog entry '{}'", descriptor.name))?;
    Ok(())
}

/// Inserts or refreshes one item. Returns `false` when the stored text hash
/// already matched and nothing was written.
pub fn upsert_item(connection: &Connection, collection: &str, item: &StoredItem) -> Result<bool> {
    let existing_hash = connection
        .query_row(
            "SELECT text_hash FROM vector_items WHERE collection = ?1 AND item_id = ?2",
            params![collection, item.item_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    if existing_hash.as_deref() == Some(item.text_hash.as_str()) {
        return Ok(false);
    }

    let metadata_json = serde_json::to_string(&item.metadata)
        .with_context(|| format!("failed to serialize metadata for '{}'", item.item_id))?;

    connection.execute(
        "
        INSERT INTO vector_items(collection, item_id, source_id, content, metadata_json, embedding, embedding_dim, text_hash)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(collection, item_id) DO UPDATE SET
          source_id=excluded.source_id,
          content=excluded.content,
          metadata_json=excluded.metadata_json,
          embedding=excluded.embedding,
          embedding_dim=excluded.embedding_dim,
          text_hash=excluded.text_hash
        ",
        params![
            collection,
            item.item_id,
            item.source_id,
            item.content,
            metadata_json,
            encode_embedding_blob(&item.embedding),
            item.embedding.len() as i64,
            item.text_hash,
        ],
    )?;

    Ok(true)
}

pub fn count_items(connection: &Connection, collection: &str) -> Result<u64> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM vector_items WHERE collection = ?1",
        [collection],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn open_read_only(db_path: &Path) -> Result<Connection, StoreError> {
    Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| {
        StoreError::Backend(format!(
            "failed to open {} read-only: {err}",
            db_path.display()
        ))
    })
}

/// Vector store backed by the `vector_collections`/`vector_items` tables.
///
/// Every call opens its own read-only connection so searches can run on
/// several worker threads at once. A scan is scored once, on its first page;
/// later pages of the same scan reuse that ranking.
#[derive(Debug, Clone)]
pub struct SqliteVectorStore {
    db_path: PathBuf,
    page_cap: Option<usize>,
    rankings: Arc<Mutex<HashMap<String, CollectionRanking>>>,
}

/// Scores of one collection against one query vector, best first.
#[derive(Debug)]
struct CollectionRanking {
    query_vector: Vec<f32>,
    scores: Arc<Vec<(i64, f64)>>,
}

impl SqliteVectorStore {
    pub fn new(db_path: impl Into<PathBuf>, page_cap: Option<usize>) -> Self {
        Self {
            db_path: db_path.into(),
            page_cap: page_cap.filter(|cap| *cap > 0),
            rankings: Arc::default(),
        }
    }

    /// Reuses the ranking of an ongoing scan; offset 0 always rescores.
    fn ranking(
        &self,
        connection: &Connection,
        request: &SearchRequest<'_>,
        dimensions: usize,
    ) -> Result<Arc<Vec<(i64, f64)>>, StoreError> {
        if request.offset > 0
            && let Some(cached) = self
                .rankings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(request.collection)
            && cached.query_vector == request.query_vector
        {
            return Ok(Arc::clone(&cached.scores));
        }

        let mut statement = connection.prepare(
            "
            SELECT rowid, embedding, embedding_dim
            FROM vector_items
            WHERE collection = ?1
            ORDER BY rowid ASC
            ",
        )?;
        let mut rows = statement.query([request.collection])?;

        let mut scores = Vec::<(i64, f64)>::new();
        while let Some(row) = rows.next()? {
            let rowid = row.get::<_, i64>(0)?;
            let embedding_blob = row.get::<_, Vec<u8>>(1)?;
            let row_dim = row.get::<_, i64>(2)?.max(0) as usize;

            // Undecodable rows are still part of the collection and score zero.
            let similarity = if row_dim == dimensions {
                decode_embedding_blob(&embedding_blob, dimensions)
                    .map(|embedding| cosine_similarity(request.query_vector, &embedding))
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            scores.push((rowid, similarity));
        }
        scores.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));

        let scores = Arc::new(scores);
        self.rankings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                request.collection.to_string(),
                CollectionRanking {
                    query_vector: request.query_vector.to_vec(),
                    scores: Arc::clone(&scores),
                },
            );
        Ok(scores)
    }
}

fn collection_dimensions(connection: &Connection, collection: &str) -> Result<usize, StoreError> {
    connection
        .query_row(
            "SELECT dimensions FROM vector_collections WHERE name = ?1",
            [collection],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(|dimensions| dimensions.max(0) as usize)
        .ok_or_else(|| StoreError::NotFound(collection.to_string()))
}

impl VectorStore for SqliteVectorStore {
    fn describe(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        let connection = open_read_only(&self.db_path)?;
        let dimensions = collection_dimensions(&connection, collection)?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM vector_items WHERE collection = ?1",
            [collection],
            |row| row.get(0),
        )?;

        Ok(CollectionStats {
            true_item_count: count.max(0) as u64,
            dimensions,
        })
    }

    fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<EvidenceChunk>, StoreError> {
        let connection = open_read_only(&self.db_path)?;
        let dimensions = collection_dimensions(&connection, request.collection)?;
        let scores = self.ranking(&connection, request, dimensions)?;

        let qualified = scores.partition_point(|(_, similarity)| *similarity >= request.min_score);
        let limit = self
            .page_cap
            .map_or(request.limit, |cap| request.limit.min(cap));
        let start = request.offset.min(qualified);
        let end = start.saturating_add(limit).min(qualified);

        let mut statement = connection.prepare(
            "SELECT item_id, source_id, content, metadata_json FROM vector_items WHERE rowid = ?1",
        )?;
        let mut page = Vec::<EvidenceChunk>::with_capacity(end - start);
        for &(rowid, similarity) in &scores[start..end] {
            let chunk = statement.query_row([rowid], |row| {
                let item_id = row.get::<_, String>(0)?;
                let mut metadata = row
                    .get::<_, Option<String>>(3)?
                    .and_then(|raw| {
                        serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&raw).ok()
                    })
                    .unwrap_or_default();
                metadata.insert("item_id".to_string(), serde_json::Value::String(item_id));

                Ok(EvidenceChunk {
                    collection: request.collection.to_string(),
                    source_id: row.get(1)?,
                    text: row.get(2)?,
                    similarity,
                    metadata,
                })
            })?;
            page.push(chunk);
        }

        Ok(page)
    }

    fn max_page_size(&self) -> Option<usize> {
        self.page_cap
    }
}

impl SqliteVectorStore {
    /// Names of every collection physically present in the store.
    pub fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let connection = open_read_only(&self.db_path)?;
        let mut statement =
            connection.prepare("SELECT name FROM vector_collections ORDER BY name ASC")?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, rusqlite::Error>>()?;
        Ok(names)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    db_path: PathBuf,
}

impl SqliteCatalog {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl MetadataCatalog for SqliteCatalog {
    fn list_collections(&self) -> Result<Vec<CollectionDescriptor>, StoreError> {
        let connection = open_read_only(&self.db_path)?;
        let mut statement = connection.prepare(
            "
            SELECT name, model_id, provider, declared_item_count, verified_present, created_at
            FROM catalog_collections
            ORDER BY name ASC
            ",
        )?;
        let mut rows = statement.query([])?;

        let mut out = Vec::<CollectionDescriptor>::new();
        while let Some(row) = rows.next()? {
            out.push(CollectionDescriptor {
                name: row.get(0)?,
                model_id: row.get(1)?,
                provider: row.get(2)?,
                declared_item_count: row.get::<_, i64>(3)?.max(0) as u64,
                verified_present: row.get(4)?,
                created_at: row.get(5)?,
            });
        }

        Ok(out)
    }
}
