use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::config::AppConfig;

pub fn run(args: StatusArgs, config: &AppConfig) -> Result<()> {
    let db_path = &args.db_path;

    for profile in &config.models.0 {
        info!(
            model_id = %profile.model_id,
            provider = %profile.provider,
            dimensions = profile.dimensions,
            "embedding model"
        );
    }
    info!(
        rules = config.classifier.rules.len(),
        default_class = %config.classifier.default_class,
        default_threshold = config.classifier.default_threshold,
        negative_markers = config.gate.negative_markers.len(),
        "gate configuration"
    );
    info!(
        primary = %config
            .generation
            .primary
            .as_ref()
            .map(|primary| primary.id.as_str())
            .unwrap_or("none"),
        fallbacks = config.generation.fallbacks.len(),
        history_turns = config.generation.history_turns,
        "generation configuration"
    );

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let schema_version = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .unwrap_or(None)
        .unwrap_or_default();
    let catalog_count = query_count(&conn, "SELECT COUNT(*) FROM catalog_collections").unwrap_or(0);
    let verified_count = query_count(
        &conn,
        "SELECT COUNT(*) FROM catalog_collections WHERE verified_present = 1",
    )
    .unwrap_or(0);
    let store_count = query_count(&conn, "SELECT COUNT(*) FROM vector_collections").unwrap_or(0);
    let items_count = query_count(&conn, "SELECT COUNT(*) FROM vector_items").unwrap_or(0);

    info!(
        path = %db_path.display(),
        schema_version = %schema_version,
        catalog_collections = catalog_count,
        verified = verified_count,
        store_collections = store_count,
        items = items_count,
        "database status"
    );

    Ok(())
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    let count = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
