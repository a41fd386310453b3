use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::DEFAULT_MODEL_ID;

#[derive(Parser, Debug)]
#[command(
    name = "groundgate",
    version,
    about = "Model-scoped semantic retrieval with a grounding gate"
)]
pub struct Cli {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ask(AskArgs),
    Collections(CollectionsArgs),
    Index(IndexArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    #[arg(long, default_value = ".cache/groundgate/index.sqlite")]
    pub db_path: PathBuf,

    #[arg(long)]
    pub query: String,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long)]
    pub session_id: Option<String>,

    /// JSON array of prior `{role, content}` turns.
    #[arg(long)]
    pub history_path: Option<PathBuf>,

    /// Query budget in milliseconds; 0 disables it. Defaults to `retrieval.timeout_ms`.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub min_threshold: Option<f64>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CollectionsArgs {
    #[arg(long, default_value = ".cache/groundgate/index.sqlite")]
    pub db_path: PathBuf,

    /// Restrict the view to collections resolvable for this model.
    #[arg(long)]
    pub model_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    #[arg(long, default_value = ".cache/groundgate/index.sqlite")]
    pub db_path: PathBuf,

    /// JSON lines with `id`, `text`, optional `source_id` and `metadata`.
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub collection: String,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Register the collection in the catalog without marking it verified.
    #[arg(long, default_value_t = false)]
    pub unverified: bool,

    /// Store the items without any catalog entry.
    #[arg(long, default_value_t = false)]
    pub skip_catalog: bool,

    #[arg(long, default_value_t = 256)]
    pub batch_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/groundgate/index.sqlite")]
    pub db_path: PathBuf,
}
