use std::collections::BTreeSet;
use std::io::{self, Write};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::info;

use crate::cli::CollectionsArgs;
use crate::config::AppConfig;
use crate::engine::errors::StoreError;
use crate::engine::resolver::{CollectionResolver, declared_for_model};
use crate::model::{CollectionDescriptor, EmbeddingModelProfile};
use crate::store::{MetadataCatalog, SqliteCatalog, SqliteVectorStore, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum StoreState {
    Present,
    Missing,
    Unreachable,
    /// In the store with no catalog entry.
    Uncatalogued,
}

#[derive(Debug, Serialize)]
struct CollectionRow {
    name: String,
    model_id: Option<String>,
    provider: Option<String>,
    declared_items: Option<u64>,
    verified_present: bool,
    live_items: Option<u64>,
    dimensions: Option<usize>,
    state: StoreState,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CollectionsView {
    model_id: Option<String>,
    catalog_entries: usize,
    store_collections: usize,
    rows: Vec<CollectionRow>,
}

pub fn run(args: CollectionsArgs, config: &AppConfig) -> Result<()> {
    let catalog = SqliteCatalog::new(&args.db_path);
    let store = SqliteVectorStore::new(&args.db_path, config.retrieval.store_page_cap);

    let profile = match &args.model_id {
        Some(model_id) => Some(config.models.find(model_id).ok_or_else(|| {
            anyhow!(
                "unknown embedding model '{model_id}' (known: {})",
                config.models.known_ids().join(", ")
            )
        })?),
        None => None,
    };

    let descriptors = catalog
        .list_collections()
        .with_context(|| format!("failed to read catalog in {}", args.db_path.display()))?;
    let store_names = store
        .collection_names()
        .with_context(|| format!("failed to list store collections in {}", args.db_path.display()))?;
    let resolved = match profile {
        Some(profile) => Some(
            CollectionResolver::new(&catalog, &store, config.retrieval.probe_retries)
                .resolve(profile)?
                .into_iter()
                .map(|collection| collection.descriptor.name)
                .collect::<BTreeSet<String>>(),
        ),
        None => None,
    };

    let view = build_view(&store, descriptors, &store_names, profile, resolved.as_ref());
    info!(
        db_path = %args.db_path.display(),
        catalog_entries = view.catalog_entries,
        store_collections = view.store_collections,
        rows = view.rows.len(),
        "collections reconciled"
    );

    write_view(&view, args.json)
}

fn build_view(
    store: &dyn VectorStore,
    descriptors: Vec<CollectionDescriptor>,
    store_names: &[String],
    profile: Option<&EmbeddingModelProfile>,
    resolved: Option<&BTreeSet<String>>,
) -> CollectionsView {
    let catalog_entries = descriptors.len();
    let catalogued = descriptors
        .iter()
        .map(|descriptor| descriptor.name.clone())
        .collect::<BTreeSet<String>>();

    let mut rows = Vec::<CollectionRow>::new();
    for descriptor in descriptors {
        if profile.is_some_and(|profile| !declared_for_model(&descriptor, profile)) {
            continue;
        }

        let (state, live_items, dimensions) = match store.describe(&descriptor.name) {
            Ok(stats) => (
                StoreState::Present,
                Some(stats.true_item_count),
                Some(stats.dimensions),
            ),
            Err(StoreError::NotFound(_)) => (StoreState::Missing, None, None),
            Err(_) => (StoreState::Unreachable, None, None),
        };
        rows.push(CollectionRow {
            resolved: resolved.map(|names| names.contains(&descriptor.name)),
            name: descriptor.name,
            model_id: Some(descriptor.model_id),
            provider: Some(descriptor.provider),
            declared_items: Some(descriptor.declared_item_count),
            verified_present: descriptor.verified_present,
            live_items,
            dimensions,
            state,
        });
    }

    if profile.is_none() {
        for name in store_names.iter().filter(|name| !catalogued.contains(*name)) {
            let stats = store.describe(name).ok();
            rows.push(CollectionRow {
                name: name.clone(),
                model_id: None,
                provider: None,
                declared_items: None,
                verified_present: false,
                live_items: stats.map(|stats| stats.true_item_count),
                dimensions: stats.map(|stats| stats.dimensions),
                state: StoreState::Uncatalogued,
                resolved: None,
            });
        }
    }

    CollectionsView {
        model_id: profile.map(|profile| profile.model_id.clone()),
        catalog_entries,
        store_collections: store_names.len(),
        rows,
    }
}

fn write_view(view: &CollectionsView, json: bool) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    if json {
        serde_json::to_writer_pretty(&mut output, view)
            .context("failed to serialize collections json")?;
        writeln!(output)?;
        output.flush()?;
        return Ok(());
    }

    writeln!(
        output,
        "Catalog entries: {}  Store collections: {}{}",
        view.catalog_entries,
        view.store_collections,
        view.model_id
            .as_deref()
            .map(|model_id| format!("  Model: {model_id}"))
            .unwrap_or_default()
    )?;
    for row in &view.rows {
        writeln!(
            output,
            "{}\tmodel={}\tdeclared={}\tlive={}\tdims={}\tverified={}\tstate={:?}{}",
            row.name,
            row.model_id.as_deref().unwrap_or("-"),
            optional(row.declared_items),
            optional(row.live_items),
            optional(row.dimensions),
            row.verified_present,
            row.state,
            row.resolved
                .map(|resolved| format!("\tresolved={resolved}"))
                .unwrap_or_default()
        )?;
    }

    output.flush()?;
    Ok(())
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeStore, descriptor, profile};

    #[test]
    fn view_flags_missing_and_uncatalogued_collections() {
        let store = FakeStore::new()
            .with_uniform_collection("handbook", 4, 0.1)
            .with_uniform_collection("scratch", 2, 0.1);
        let view = build_view(
            &store,
            vec![
                descriptor("handbook", "local", true),
                descriptor("stale", "local", false),
            ],
            &["handbook".to_string(), "scratch".to_string()],
            None,
            None,
        );

        let states = view
            .rows
            .iter()
            .map(|row| (row.name.as_str(), row.state))
            .collect::<Vec<(&str, StoreState)>>();
        assert_eq!(
            states,
            vec![
                ("handbook", StoreState::Present),
                ("stale", StoreState::Missing),
                ("scratch", StoreState::Uncatalogued),
            ]
        );
        assert_eq!(view.rows[0].live_items, Some(4));
    }

    #[test]
    fn model_filter_keeps_declared_collections_only() {
        let store = FakeStore::new().with_uniform_collection("handbook", 4, 0.1);
        let resolved = BTreeSet::from(["handbook".to_string()]);
        let model = profile("local");
        let view = build_view(
            &store,
            vec![
                descriptor("handbook", "local", true),
                descriptor("elsewhere", "gemini", true),
            ],
            &["handbook".to_string()],
            Some(&model),
            Some(&resolved),
        );

        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].resolved, Some(true));
        assert_eq!(view.model_id.as_deref(), Some("local"));
    }
}
