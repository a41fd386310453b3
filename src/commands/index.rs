use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cli::IndexArgs;
use crate::config::AppConfig;
use crate::model::{CollectionDescriptor, EmbeddingModelProfile};
use crate::semantic::{Embedder, LocalHashEmbedder, embedding_text_hash, normalize_whitespace};
use crate::store::{
    INDEX_SCHEMA_VERSION, SqliteVectorStore, StoredItem, VectorStore, count_items, open_index,
    register_catalog_collection, register_store_collection, upsert_item,
};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

/// One line of the JSONL input.
#[derive(Debug, Deserialize)]
struct InputItem {
    id: String,
    text: String,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct IndexRunManifest {
    manifest_version: u32,
    run_id: String,
    generated_at: String,
    db_schema_version: String,
    collection: String,
    model_id: String,
    provider: String,
    dimensions: usize,
    input_path: String,
    input_lines: usize,
    skipped_empty: usize,
    written_items: usize,
    unchanged_items: usize,
    collection_items: u64,
    catalog_registered: bool,
    verified_present: bool,
    duration_ms: u128,
    warnings: Vec<String>,
}

pub fn run(args: IndexArgs, config: &AppConfig) -> Result<()> {
    let profile = config.models.find(&args.model_id).ok_or_else(|| {
        anyhow!(
            "unknown embedding model '{}' (known: {})",
            args.model_id,
            config.models.known_ids().join(", ")
        )
    })?;
    let collection = args.collection.trim();
    if collection.is_empty() {
        bail!("--collection must not be empty");
    }
    let batch_size = args.batch_size.max(1);

    if let Some(parent) = args.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_directory(parent)?;
    }
    let mut connection = open_index(&args.db_path)?;
    ensure_compatible_dimensions(&args.db_path, collection, profile)?;

    let started_at = now_utc_string();
    let started = Instant::now();
    register_store_collection(&connection, collection, profile.dimensions, &started_at)?;

    let embedder = LocalHashEmbedder;
    let reader = BufReader::new(
        File::open(&args.input)
            .with_context(|| format!("failed to open input {}", args.input.display()))?,
    );

    let mut input_lines = 0usize;
    let mut skipped_empty = 0usize;
    let mut written_items = 0usize;
    let mut unchanged_items = 0usize;
    let mut pending = Vec::<StoredItem>::with_capacity(batch_size);
    let mut warnings = Vec::<String>::new();

    for (line_index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} of {}", line_index + 1, args.input.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }
        input_lines += 1;

        let item: InputItem = serde_json::from_str(&line).with_context(|| {
            format!("invalid item on line {} of {}", line_index + 1, args.input.display())
        })?;
        let content = normalize_whitespace(&item.text);
        if content.is_empty() {
            skipped_empty += 1;
            continue;
        }

        let embedding = embedder
            .embed(profile, &content)
            .with_context(|| format!("failed to embed item '{}'", item.id))?;
        pending.push(StoredItem {
            source_id: item.source_id.unwrap_or_else(|| item.id.clone()),
            text_hash: embedding_text_hash(&format!("{}\n{content}", profile.model_id)),
            item_id: item.id,
            content,
            metadata: item.metadata,
            embedding,
        });

        if pending.len() >= batch_size {
            let (written, unchanged) = flush_batch(&mut connection, collection, &mut pending)?;
            written_items += written;
            unchanged_items += unchanged;
            info!(collection = %collection, written_items, unchanged_items, "index batch committed");
        }
    }

    if !pending.is_empty() {
        let (written, unchanged) = flush_batch(&mut connection, collection, &mut pending)?;
        written_items += written;
        unchanged_items += unchanged;
    }

    if input_lines == 0 {
        warnings.push("input contained no items".to_string());
    }
    if skipped_empty > 0 {
        warn!(collection = %collection, skipped_empty, "skipped items with empty text");
    }

    let collection_items = count_items(&connection, collection)?;
    let verified_present = !args.unverified;
    if !args.skip_catalog {
        register_catalog_collection(
            &connection,
            &CollectionDescriptor {
                name: collection.to_string(),
                model_id: profile.model_id.clone(),
                provider: profile.provider.clone(),
                declared_item_count: collection_items,
                verified_present,
                created_at: started_at.clone(),
            },
        )?;
    }

    let manifest = IndexRunManifest {
        manifest_version: 1,
        run_id: format!("index-{}", utc_compact_string(Utc::now())),
        generated_at: started_at,
        db_schema_version: INDEX_SCHEMA_VERSION.to_string(),
        collection: collection.to_string(),
        model_id: profile.model_id.clone(),
        provider: profile.provider.clone(),
        dimensions: profile.dimensions,
        input_path: args.input.display().to_string(),
        input_lines,
        skipped_empty,
        written_items,
        unchanged_items,
        collection_items,
        catalog_registered: !args.skip_catalog,
        verified_present: verified_present && !args.skip_catalog,
        duration_ms: started.elapsed().as_millis(),
        warnings,
    };
    let manifest_path = manifest_path(&args.db_path, &manifest.run_id);
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        collection = %collection,
        model_id = %profile.model_id,
        written_items,
        unchanged_items,
        collection_items,
        "index run completed"
    );
    Ok(())
}

fn ensure_compatible_dimensions(
    db_path: &Path,
    collection: &str,
    profile: &EmbeddingModelProfile,
) -> Result<()> {
    let store = SqliteVectorStore::new(db_path, None);
    if let Ok(stats) = store.describe(collection)
        && stats.true_item_count > 0
        && stats.dimensions != profile.dimensions
    {
        bail!(
            "collection '{collection}' holds {}-dimension vectors; model '{}' produces {}",
            stats.dimensions,
            profile.model_id,
            profile.dimensions
        );
    }
    Ok(())
}

fn flush_batch(
    connection: &mut Connection,
    collection: &str,
    pending: &mut Vec<StoredItem>,
) -> Result<(usize, usize)> {
    let transaction = connection
        .transaction()
        .context("failed to start index transaction")?;
    let mut written = 0usize;
    let mut unchanged = 0usize;
    for item in pending.drain(..) {
        if upsert_item(&transaction, collection, &item)? {
            written += 1;
        } else {
            unchanged += 1;
        }
    }
    transaction
        .commit()
        .context("failed to commit index transaction")?;
    Ok((written, unchanged))
}

fn manifest_path(db_path: &Path, run_id: &str) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("runs")
        .join(format!("{run_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::store::{MetadataCatalog, SqliteCatalog};

    fn write_input(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("items.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[test]
    fn index_loads_items_and_registers_catalog_entry() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            &[
                r#"{"id": "a", "text": "Jane Doe is a cardiologist", "metadata": {"page": 3}}"#,
                "",
                r#"{"id": "b", "text": "   "}"#,
                r#"{"id": "c", "text": "The cafeteria opens at noon", "source_id": "handbook.md"}"#,
            ],
        );
        let db_path = dir.path().join("index.sqlite");
        let config = AppConfig::default();

        let args = IndexArgs {
            db_path: db_path.clone(),
            input,
            collection: "handbook".to_string(),
            model_id: crate::config::DEFAULT_MODEL_ID.to_string(),
            unverified: true,
            skip_catalog: false,
            batch_size: 1,
        };
        run(args.clone(), &config).unwrap();

        let store = SqliteVectorStore::new(&db_path, None);
        let stats = store.describe("handbook").unwrap();
        assert_eq!(stats.true_item_count, 2);
        assert_eq!(stats.dimensions, 384);

        let catalog = SqliteCatalog::new(&db_path).list_collections().unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(!catalog[0].verified_present);
        assert_eq!(catalog[0].declared_item_count, 2);
        assert!(dir.path().join("runs").is_dir());

        // Re-running with identical input writes nothing new.
        run(args, &config).unwrap();
        assert_eq!(store.describe("handbook").unwrap().true_item_count, 2);
    }

    #[test]
    fn index_rejects_models_without_a_local_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &[r#"{"id": "a", "text": "hello"}"#]);
        let args = IndexArgs {
            db_path: dir.path().join("index.sqlite"),
            input,
            collection: "handbook".to_string(),
            model_id: "openai".to_string(),
            unverified: false,
            skip_catalog: false,
            batch_size: 8,
        };

        let err = run(args, &AppConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("no embedding backend"));
    }
}
