use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::AskArgs;
use crate::config::AppConfig;
use crate::engine::{AskRequest, GroundingEngine};
use crate::model::{ConversationTurn, GateOutcome, OutcomeStatus, RetrievalReport};

pub fn run(args: AskArgs, config: &AppConfig) -> Result<()> {
    let history = match &args.history_path {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };

    let engine = GroundingEngine::open_local(config, &args.db_path)?;
    let request = AskRequest {
        query: args.query.clone(),
        model_id: args.model_id.clone(),
        session_id: args.session_id.clone(),
        history,
        timeout_ms: args.timeout_ms,
        min_threshold: args.min_threshold,
    };

    info!(
        db_path = %args.db_path.display(),
        model_id = %request.model_id,
        "ask requested"
    );

    let outcome = match engine.ask(&request) {
        Ok(outcome) => outcome,
        Err(err) => {
            let outcome = GateOutcome::errored(
                request.query.trim(),
                RetrievalReport::unavailable(request.model_id.trim()),
                err.to_string(),
            );
            write_outcome(&outcome, args.json)?;
            let code = err.code();
            return Err(err).with_context(|| format!("query failed ({code})"));
        }
    };

    write_outcome(&outcome, args.json)?;
    if outcome.status == OutcomeStatus::Error {
        bail!(
            "query could not be answered: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn load_history(path: &Path) -> Result<Vec<ConversationTurn>> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read history {}", path.display()))?;
    serde_json::from_slice::<Vec<ConversationTurn>>(&raw)
        .with_context(|| format!("failed to parse history {}", path.display()))
}

fn write_outcome(outcome: &GateOutcome, json: bool) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    if json {
        serde_json::to_writer_pretty(&mut output, outcome)
            .context("failed to serialize outcome json")?;
        writeln!(output)?;
        output.flush()?;
        return Ok(());
    }

    let report = &outcome.report;
    writeln!(output, "Query: {}", outcome.query)?;
    writeln!(
        output,
        "Status: {:?}{}",
        outcome.status,
        outcome
            .reason
            .map(|reason| format!(" ({})", reason.as_str()))
            .unwrap_or_default()
    )?;
    writeln!(
        output,
        "Retrieval: model={} class={} threshold={:.2} highest={} complete={} duration_ms={:.3}",
        report.model_id,
        if report.sensitivity_class.is_empty() {
            "-"
        } else {
            &report.sensitivity_class
        },
        report.threshold_applied,
        report
            .highest_similarity
            .map(|value| format!("{value:.4}"))
            .unwrap_or_else(|| "-".to_string()),
        report.complete,
        report.duration_ms,
    )?;
    writeln!(
        output,
        "Collections: resolved={} searched={} items examined={}/{} qualified={}",
        report.collections_resolved,
        report.collections_searched,
        report.total_items_examined,
        report.expected_items,
        report.qualified_items,
    )?;
    for scan in &report.scans {
        writeln!(
            output,
            "\t{}\t{:?}\texamined={}\tpages={}{}",
            scan.collection,
            scan.status,
            scan.items_examined,
            scan.pages,
            scan.error
                .as_deref()
                .map(|error| format!("\terror={error}"))
                .unwrap_or_default()
        )?;
    }

    if let Some(answer) = &outcome.answer {
        writeln!(
            output,
            "Answer ({}):",
            outcome.backend_id.as_deref().unwrap_or("unknown backend")
        )?;
        writeln!(output, "{answer}")?;
    }
    if let Some(evidence) = &outcome.evidence {
        writeln!(output, "Evidence: {}", evidence.len())?;
        for (index, chunk) in evidence.iter().enumerate() {
            writeln!(
                output,
                "[{}]\t{}\t{}\tsimilarity={:.4}",
                index + 1,
                chunk.collection,
                chunk.source_id,
                chunk.similarity
            )?;
        }
    }
    if let Some(error) = &outcome.error {
        writeln!(output, "Error: {error}")?;
    }

    output.flush()?;
    Ok(())
}
