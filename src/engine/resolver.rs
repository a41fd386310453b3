use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::model::{CollectionDescriptor, CollectionStats, EmbeddingModelProfile, ResolvedCollection};
use crate::store::{MetadataCatalog, VectorStore};

use super::errors::{EngineError, StoreError};

/// Reconciles the catalog's declared collections with what the store holds.
pub struct CollectionResolver<'a> {
    catalog: &'a dyn MetadataCatalog,
    store: &'a dyn VectorStore,
    probe_retries: usize,
}

enum ProbeOutcome {
    Present(CollectionStats),
    Missing,
    Unreachable(StoreError),
}

impl<'a> CollectionResolver<'a> {
    pub fn new(
        catalog: &'a dyn MetadataCatalog,
        store: &'a dyn VectorStore,
        probe_retries: usize,
    ) -> Self {
        Self {
            catalog,
            store,
            probe_retries,
        }
    }

    pub fn resolve(
        &self,
        profile: &EmbeddingModelProfile,
    ) -> Result<Vec<ResolvedCollection>, EngineError> {
        let descriptors = self
            .catalog
            .list_collections()
            .map_err(|err| EngineError::CatalogUnavailable {
                reason: err.to_string(),
            })?;

        let mut resolved = BTreeMap::<String, ResolvedCollection>::new();
        for descriptor in descriptors {
            if !declared_for_model(&descriptor, profile) || resolved.contains_key(&descriptor.name)
            {
                continue;
            }

            let probe = self.probe(&descriptor.name);
            let candidate = match (descriptor.verified_present, probe) {
                (_, ProbeOutcome::Present(stats)) => ResolvedCollection {
                    verified_by_probe: !descriptor.verified_present,
                    descriptor,
                    stats: Some(stats),
                },
                (true, ProbeOutcome::Missing | ProbeOutcome::Unreachable(_)) => {
                    warn!(
                        collection = %descriptor.name,
                        "catalog marks collection present but the store could not describe it"
                    );
                    ResolvedCollection {
                        descriptor,
                        stats: None,
                        verified_by_probe: false,
                    }
                }
                (false, ProbeOutcome::Missing) => {
                    debug!(collection = %descriptor.name, "unverified collection absent from store");
                    continue;
                }
                (false, ProbeOutcome::Unreachable(err)) => {
                    warn!(
                        collection = %descriptor.name,
                        error = %err,
                        "probe retries exhausted; excluding unverified collection"
                    );
                    continue;
                }
            };

            if let Some(stats) = candidate.stats
                && stats.dimensions != profile.dimensions
            {
                warn!(
                    collection = %candidate.name(),
                    store_dimensions = stats.dimensions,
                    model_dimensions = profile.dimensions,
                    "collection dimensionality does not match the model; excluding"
                );
                continue;
            }

            resolved.insert(candidate.descriptor.name.clone(), candidate);
        }

        let resolved = resolved.into_values().collect::<Vec<ResolvedCollection>>();
        info!(
            model_id = %profile.model_id,
            collections = resolved.len(),
            probed = resolved.iter().filter(|collection| collection.verified_by_probe).count(),
            "resolved collections"
        );
        Ok(resolved)
    }

    fn probe(&self, name: &str) -> ProbeOutcome {
        let mut attempt = 0usize;
        loop {
            match self.store.describe(name) {
                Ok(stats) => return ProbeOutcome::Present(stats),
                Err(StoreError::NotFound(_)) => return ProbeOutcome::Missing,
                Err(err) if attempt >= self.probe_retries => {
                    return ProbeOutcome::Unreachable(err);
                }
                Err(err) => {
                    attempt += 1;
                    debug!(collection = %name, attempt, error = %err, "retrying collection probe");
                }
            }
        }
    }
}

pub fn declared_for_model(descriptor: &CollectionDescriptor, profile: &EmbeddingModelProfile) -> bool {
    descriptor.model_id == profile.model_id || descriptor.provider == profile.model_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeCatalog, FakeStore, descriptor, profile};

    #[test]
    fn verified_and_probed_collections_are_both_resolved() {
        let catalog = FakeCatalog::new(vec![
            descriptor("handbook", "local", true),
            descriptor("policies", "local", false),
        ]);
        let store = FakeStore::new()
            .with_uniform_collection("handbook", 600, 0.3)
            .with_uniform_collection("policies", 300, 0.3);

        let resolved = CollectionResolver::new(&catalog, &store, 2)
            .resolve(&profile("local"))
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].name(), "handbook");
        assert!(!resolved[0].verified_by_probe);
        assert_eq!(resolved[0].stats.unwrap().true_item_count, 600);
        assert_eq!(resolved[1].name(), "policies");
        assert!(resolved[1].verified_by_probe);
        assert_eq!(resolved[1].stats.unwrap().true_item_count, 300);
    }

    #[test]
    fn unverified_collections_missing_from_store_are_dropped() {
        let catalog = FakeCatalog::new(vec![
            descriptor("handbook", "local", true),
            descriptor("stale", "local", false),
        ]);
        let store = FakeStore::new().with_uniform_collection("handbook", 10, 0.3);

        let resolved = CollectionResolver::new(&catalog, &store, 2)
            .resolve(&profile("local"))
            .unwrap();
        let names = resolved.iter().map(ResolvedCollection::name).collect::<Vec<&str>>();
        assert_eq!(names, vec!["handbook"]);
    }

    #[test]
    fn verified_collection_stays_resolved_when_describe_fails() {
        let catalog = FakeCatalog::new(vec![descriptor("handbook", "local", true)]);
        let store = FakeStore::new();

        let resolved = CollectionResolver::new(&catalog, &store, 1)
            .resolve(&profile("local"))
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].stats.is_none());
    }

    #[test]
    fn transient_probe_errors_are_retried_within_budget() {
        let catalog = FakeCatalog::new(vec![descriptor("policies", "local", false)]);
        let store = FakeStore::new()
            .with_uniform_collection("policies", 5, 0.3)
            .with_transient_describe_failures("policies", 2);

        let resolved = CollectionResolver::new(&catalog, &store, 2)
            .resolve(&profile("local"))
            .unwrap();
        assert_eq!(resolved.len(), 1);

        let store = FakeStore::new()
            .with_uniform_collection("policies", 5, 0.3)
            .with_transient_describe_failures("policies", 3);
        let resolved = CollectionResolver::new(&catalog, &store, 2)
            .resolve(&profile("local"))
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn collections_for_other_models_or_dimensions_are_excluded() {
        let mut provider_match = descriptor("by-provider", "something-else", true);
        provider_match.provider = "local".to_string();
        let catalog = FakeCatalog::new(vec![
            descriptor("other-model", "gemini", true),
            provider_match,
            descriptor("wrong-dims", "local", true),
        ]);
        let store = FakeStore::new()
            .with_uniform_collection("other-model", 5, 0.3)
            .with_uniform_collection("by-provider", 5, 0.3)
            .with_collection_dimensions("wrong-dims", 7, 5);

        let resolved = CollectionResolver::new(&catalog, &store, 0)
            .resolve(&profile("local"))
            .unwrap();
        let names = resolved.iter().map(ResolvedCollection::name).collect::<Vec<&str>>();
        assert_eq!(names, vec!["by-provider"]);
    }

    #[test]
    fn same_provider_different_model_is_excluded() {
        let mut requested = profile("openai-3-small");
        requested.provider = "openai".to_string();
        let mut ada = descriptor("ada-docs", "openai-ada-002", true);
        ada.provider = "openai".to_string();
        let mut small = descriptor("small-docs", "openai-3-small", true);
        small.provider = "openai".to_string();
        let catalog = FakeCatalog::new(vec![ada, small]);
        let store = FakeStore::new()
            .with_uniform_collection("ada-docs", 5, 0.3)
            .with_uniform_collection("small-docs", 5, 0.3);

        let resolved = CollectionResolver::new(&catalog, &store, 0)
            .resolve(&requested)
            .unwrap();
        let names = resolved.iter().map(ResolvedCollection::name).collect::<Vec<&str>>();
        assert_eq!(names, vec!["small-docs"]);
    }

    #[test]
    fn duplicate_catalog_rows_are_deduplicated() {
        let catalog = FakeCatalog::new(vec![
            descriptor("handbook", "local", true),
            descriptor("handbook", "local", false),
        ]);
        let store = FakeStore::new().with_uniform_collection("handbook", 3, 0.3);

        let resolved = CollectionResolver::new(&catalog, &store, 0)
            .resolve(&profile("local"))
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn unreadable_catalog_is_an_error() {
        let catalog = FakeCatalog::failing();
        let store = FakeStore::new();
        let err = CollectionResolver::new(&catalog, &store, 0)
            .resolve(&profile("local"))
            .unwrap_err();
        assert!(matches!(err, EngineError::CatalogUnavailable { .. }));
    }
}
