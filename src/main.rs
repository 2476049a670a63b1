//! # docqa CLI
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create the SQLite database and run schema migrations |
//! | `docqa serve` | Start the webhook server and queue worker |
//! | `docqa process --bucket B --name N` | Process one stored object synchronously |
//! | `docqa materialize` | Rewrite the dataset artifact |
//! | `docqa stats` | Record and queue counts |
//! | `docqa search "<query>"` | Nearest pages in the local vector index |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docqa::process::{self, ProcessOptions};
use docqa::{config, logging, migrate, search, server, stats};

/// docqa: turn uploaded documents into question/answer datasets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docqa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "Turn uploaded documents into question/answer fine-tuning datasets",
    version,
    long_about = "docqa receives storage upload notifications, extracts document text, \
    generates question/answer pairs per page with a language model, and maintains a \
    JSONL training dataset in object storage."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the records, jobs and
    /// page_vectors tables. Safe to run repeatedly.
    Init,

    /// Start the webhook server and queue worker.
    ///
    /// Binds to `[server].bind`. Stops gracefully on Ctrl-C.
    Serve,

    /// Run the pipeline for one stored object and wait for the result.
    Process {
        /// Bucket holding the object.
        #[arg(long)]
        bucket: String,

        /// Object name within the bucket.
        #[arg(long)]
        name: String,

        /// MIME type; inferred from the file extension when omitted.
        #[arg(long)]
        mime_type: Option<String>,

        /// Event id to record the run under. Reusing an id makes the run
        /// subject to duplicate detection.
        #[arg(long)]
        event_id: Option<String>,

        /// Re-process even if the event id already completed.
        #[arg(long)]
        force: bool,
    },

    /// Rewrite the dataset artifact from the current store contents.
    Materialize,

    /// Show record, vector and queue counts.
    Stats,

    /// Find the pages nearest to a query in the local vector index.
    ///
    /// Requires an embedding provider and the `sqlite` vector index.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Process {
            bucket,
            name,
            mime_type,
            event_id,
            force,
        } => {
            process::run_process(
                &cfg,
                ProcessOptions {
                    bucket,
                    name,
                    mime_type,
                    event_id,
                    force,
                },
            )
            .await?;
        }
        Commands::Materialize => {
            process::run_materialize(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
    }

    Ok(())
}
