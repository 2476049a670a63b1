//! One-shot CLI commands that drive the pipeline without the server.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::db;
use crate::materialize::Materializer;
use crate::migrate;
use crate::models::UploadEvent;
use crate::pipeline::{Outcome, Pipeline};
use crate::retry::RetryPolicy;
use crate::storage::{self, ObjectLocator};
use crate::store::SqliteStore;

/// Options for `docqa process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub bucket: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub event_id: Option<String>,
    pub force: bool,
}

/// Run the pipeline synchronously for one stored object and print the
/// outcome. Without `--event-id` a fresh id is generated, so every run
/// re-processes the object.
pub async fn run_process(config: &Config, opts: ProcessOptions) -> Result<()> {
    let mut config = config.clone();
    if opts.force {
        config.pipeline.force_reprocess = true;
    }

    let pool = db::connect(&config).await?;
    migrate::apply_schema(&pool).await?;
    let pipeline = Pipeline::from_config(&config, pool.clone())?;

    let event = UploadEvent {
        event_id: opts
            .event_id
            .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4())),
        bucket: opts.bucket,
        object_name: opts.name,
        mime_type: opts.mime_type.unwrap_or_default(),
        uploaded_at: Utc::now(),
    };

    let outcome = pipeline.handle(&event).await;
    pool.close().await;

    match outcome? {
        Outcome::Ignored { reason } => println!("ignored: {}", reason),
        Outcome::Duplicate { status } => {
            println!("duplicate: event {} is {:?}", event.event_id, status)
        }
        Outcome::Completed {
            pages,
            entries,
            dataset_size,
        } => {
            println!("event:        {}", event.event_id);
            println!("pages:        {}", pages);
            println!("entries:      {}", entries);
            println!("dataset size: {}", dataset_size);
        }
        Outcome::Failed { error } => println!("failed: {}", error),
    }
    Ok(())
}

/// Rewrite the dataset artifact from the current store contents.
pub async fn run_materialize(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let objects = storage::from_config(&config.storage, RetryPolicy::from_config(&config.retry))?;
    let materializer = Materializer::new(
        Arc::new(SqliteStore::new(pool.clone())),
        objects,
        config.dataset.format.parse()?,
    );
    let output = ObjectLocator::new(
        config.dataset.bucket.clone(),
        config.dataset.object_name.clone(),
    );
    let report = materializer.materialize(&output).await?;
    pool.close().await;

    println!("output:  {}", output);
    println!("written: {}", report.written);
    println!("skipped: {}", report.skipped);
    Ok(())
}
