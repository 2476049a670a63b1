//! Per-event orchestration.
//!
//! For each upload event the pipeline:
//!
//! 1. ignores objects outside the include/exclude globs (the dataset
//!    artifact itself is always excluded);
//! 2. skips duplicate deliveries: an event already `completed`, or still
//!    `processing` and younger than `stale_after_secs`;
//! 3. records the event as `processing` and upserts document metadata;
//! 4. extracts the text and merges the page list into the document;
//! 5. fans out one generation call per page on a bounded task group while
//!    the optional embed + index branch runs alongside;
//! 6. fans in every pair as a dataset entry keyed by its question;
//! 7. rewrites the dataset artifact;
//! 8. marks the event `completed` (or `failed` with the error chain).
//!
//! All writes are upserts, so a redelivered or re-executed event converges
//! on the same store contents.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::extract::{self, infer_mime_type, ExtractRequest, TextExtractor};
use crate::generate::{self, QuestionGenerator};
use crate::index::{self, IndexPoint, VectorIndex};
use crate::materialize::{DatasetFormat, Materializer};
use crate::models::{
    page_id, DatasetEntry, EventRecord, EventStatus, QaPair, UploadEvent, DATASET, DOCUMENTS,
    EVENTS,
};
use crate::retry::RetryPolicy;
use crate::storage::{self, ObjectLocator, ObjectStore};
use crate::store::{RecordStore, RecordStoreExt, SqliteStore};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Filtered out before any work.
    Ignored { reason: String },
    /// Already handled (or being handled) under the same event id.
    Duplicate { status: EventStatus },
    Completed {
        pages: usize,
        entries: usize,
        dataset_size: usize,
    },
    /// Only produced by [`Pipeline::handle_event`].
    Failed { error: String },
}

/// Behavior knobs, separated from the collaborators so tests can build a
/// pipeline without a config file.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_concurrency: usize,
    pub include: GlobSet,
    pub exclude: GlobSet,
    pub force_reprocess: bool,
    pub stale_after: chrono::Duration,
    pub segment_max_tokens: Option<usize>,
    /// Bucket for batch OCR output; enables batch mode when set.
    pub temp_bucket: Option<String>,
    pub dataset_output: ObjectLocator,
    pub dataset_format: DatasetFormat,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            max_concurrency: config.pipeline.max_concurrency,
            include: build_globset(&config.pipeline.include_globs)?,
            exclude: build_globset(&config.pipeline.exclude_globs)?,
            force_reprocess: config.pipeline.force_reprocess,
            stale_after: chrono::Duration::seconds(config.pipeline.stale_after_secs),
            segment_max_tokens: config.pipeline.segment_max_tokens,
            temp_bucket: config.ocr.temp_bucket.clone(),
            dataset_output: ObjectLocator::new(
                config.dataset.bucket.clone(),
                config.dataset.object_name.clone(),
            ),
            dataset_format: config.dataset.format.parse()?,
        })
    }

    /// Defaults matching an empty config, writing the dataset to `output`.
    pub fn with_output(output: ObjectLocator) -> Self {
        Self {
            max_concurrency: 16,
            include: build_globset(&["**".to_string()]).unwrap_or_else(|_| GlobSet::empty()),
            exclude: GlobSet::empty(),
            force_reprocess: false,
            stale_after: chrono::Duration::hours(1),
            segment_max_tokens: None,
            temp_bucket: None,
            dataset_output: output,
            dataset_format: DatasetFormat::Chat,
        }
    }

    fn skip_reason(&self, event: &UploadEvent) -> Option<String> {
        let name = event.object_name.as_str();
        if name.is_empty() || name.ends_with('/') {
            return Some("not a file object".to_string());
        }
        if event.bucket == self.dataset_output.bucket && name == self.dataset_output.name {
            return Some("dataset artifact".to_string());
        }
        if self.exclude.is_match(name) {
            return Some("matches exclude_globs".to_string());
        }
        if !self.include.is_match(name) {
            return Some("does not match include_globs".to_string());
        }
        None
    }
}

/// The collaborators a pipeline drives.
pub struct PipelineParts {
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub generator: Arc<dyn QuestionGenerator>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub index: Option<Arc<dyn VectorIndex>>,
}

pub struct Pipeline {
    records: Arc<dyn RecordStore>,
    extractor: Arc<dyn TextExtractor>,
    generator: Arc<dyn QuestionGenerator>,
    embedder: Option<Arc<dyn Embedder>>,
    index: Option<Arc<dyn VectorIndex>>,
    materializer: Materializer,
    settings: PipelineSettings,
}

struct RunStats {
    pages: usize,
    entries: usize,
    dataset_size: usize,
}

impl Pipeline {
    pub fn new(parts: PipelineParts, settings: PipelineSettings) -> Self {
        let materializer = Materializer::new(
            parts.records.clone(),
            parts.objects,
            settings.dataset_format,
        );
        Self {
            records: parts.records,
            extractor: parts.extractor,
            generator: parts.generator,
            embedder: parts.embedder,
            index: parts.index,
            materializer,
            settings,
        }
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    /// Wire every production component from configuration.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        let objects = storage::from_config(&config.storage, retry.clone())?;
        let records: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(pool.clone()));
        let extractor = extract::from_config(&config.ocr, objects.clone(), retry.clone())?;
        let generator = generate::from_config(&config.generation, retry.clone())?;
        let embedder = embedding::from_config(&config.embedding, retry.clone())?;
        let index = if embedder.is_some() {
            Some(index::from_config(&config.vector_index, pool, retry)?)
        } else {
            None
        };

        Ok(Self::new(
            PipelineParts {
                records,
                objects,
                extractor,
                generator,
                embedder,
                index,
            },
            PipelineSettings::from_config(config)?,
        ))
    }

    /// Top-level entry point for triggers: never fails. Errors are logged
    /// with their full cause chain and reported as [`Outcome::Failed`].
    pub async fn handle_event(&self, event: &UploadEvent) -> Outcome {
        match self.handle(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(event_id = %event.event_id, error = ?e, "event processing failed");
                Outcome::Failed {
                    error: format!("{:#}", e),
                }
            }
        }
    }

    pub async fn handle(&self, event: &UploadEvent) -> Result<Outcome> {
        self.handle_inner(event, false).await
    }

    /// Handle an event for a claimed queue job on its `attempt`-th try.
    ///
    /// A retried job may find the event still `processing` from its own
    /// earlier attempt, which the queue has already declared dead. That run
    /// is taken over instead of being reported as a duplicate.
    pub async fn handle_job(&self, event: &UploadEvent, attempt: i64) -> Result<Outcome> {
        self.handle_inner(event, attempt > 1).await
    }

    async fn handle_inner(&self, event: &UploadEvent, take_over: bool) -> Result<Outcome> {
        if let Some(reason) = self.settings.skip_reason(event) {
            tracing::info!(
                event_id = %event.event_id,
                object = %event.object_name,
                reason = %reason,
                "ignoring event"
            );
            return Ok(Outcome::Ignored { reason });
        }

        let now = Utc::now();
        if let Some(existing) = self
            .records
            .fetch::<EventRecord>(EVENTS, &event.event_id)
            .await?
        {
            if self.is_duplicate(&existing, now, take_over) {
                tracing::info!(
                    event_id = %event.event_id,
                    status = ?existing.status,
                    "duplicate delivery, skipping"
                );
                return Ok(Outcome::Duplicate {
                    status: existing.status,
                });
            }
            tracing::info!(
                event_id = %event.event_id,
                status = ?existing.status,
                "re-executing event"
            );
        }

        self.records
            .put(EVENTS, &event.event_id, &EventRecord::started(event, now))
            .await?;

        match self.run(event).await {
            Ok(stats) => {
                self.records
                    .upsert(
                        EVENTS,
                        &event.event_id,
                        json!({
                            "status": EventStatus::Completed,
                            "finished_at": Utc::now(),
                            "error": null,
                            "dataset_size": stats.dataset_size,
                        }),
                    )
                    .await?;
                tracing::info!(
                    event_id = %event.event_id,
                    pages = stats.pages,
                    entries = stats.entries,
                    dataset_size = stats.dataset_size,
                    "event completed"
                );
                Ok(Outcome::Completed {
                    pages: stats.pages,
                    entries: stats.entries,
                    dataset_size: stats.dataset_size,
                })
            }
            Err(e) => {
                let marked = self
                    .records
                    .upsert(
                        EVENTS,
                        &event.event_id,
                        json!({
                            "status": EventStatus::Failed,
                            "finished_at": Utc::now(),
                            "error": format!("{:#}", e),
                        }),
                    )
                    .await;
                if let Err(mark_err) = marked {
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %mark_err,
                        "could not mark event failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn is_duplicate(
        &self,
        record: &EventRecord,
        now: chrono::DateTime<Utc>,
        take_over: bool,
    ) -> bool {
        if self.settings.force_reprocess {
            return false;
        }
        match record.status {
            EventStatus::Completed => true,
            EventStatus::Processing => {
                !take_over && now - record.started_at < self.settings.stale_after
            }
            EventStatus::Failed => false,
        }
    }

    async fn run(&self, event: &UploadEvent) -> Result<RunStats> {
        let mime_type = if event.mime_type.is_empty() {
            infer_mime_type(&event.object_name)?.to_string()
        } else {
            event.mime_type.clone()
        };
        let filename = event.object_name.clone();
        let doc_key = event.document_key();

        self.records
            .upsert(
                DOCUMENTS,
                &doc_key,
                json!({
                    "filename": filename,
                    "bucket": event.bucket,
                    "mime_type": mime_type,
                    "event_id": event.event_id,
                    "uploaded_at": event.uploaded_at,
                }),
            )
            .await?;

        let request = ExtractRequest {
            locator: ObjectLocator::new(event.bucket.clone(), filename.clone()),
            mime_type,
            temp: self.settings.temp_bucket.as_ref().map(|bucket| {
                ObjectLocator::new(
                    bucket.clone(),
                    format!("ocr/{}/{}", event.bucket, event.object_name),
                )
            }),
        };
        let pages = self
            .extractor
            .extract(&request)
            .await
            .with_context(|| format!("text extraction failed for {}", request.locator))?
            .into_pages(self.settings.segment_max_tokens);

        self.records
            .upsert(
                DOCUMENTS,
                &doc_key,
                json!({"pages": pages, "page_count": pages.len()}),
            )
            .await?;
        tracing::info!(event_id = %event.event_id, pages = pages.len(), "text extracted");

        let (indexed, generated) =
            tokio::join!(self.index_pages(&filename, &pages), self.fan_out(&pages));
        if let Err(e) = indexed {
            tracing::warn!(event_id = %event.event_id, error = ?e, "page indexing failed");
        }

        // Pairs repeating a question share one entry; count distinct keys.
        let mut keys = BTreeSet::new();
        for (page_number, pairs) in generated {
            for pair in pairs {
                let entry = DatasetEntry {
                    question: pair.question,
                    answer: pair.answer,
                    filename: filename.clone(),
                    page_number,
                    event_id: event.event_id.clone(),
                };
                let key = entry.key();
                self.records.put(DATASET, &key, &entry).await?;
                keys.insert(key);
            }
        }

        let report = self
            .materializer
            .materialize(&self.settings.dataset_output)
            .await?;

        Ok(RunStats {
            pages: pages.len(),
            entries: keys.len(),
            dataset_size: report.written,
        })
    }

    /// One generation call per page, at most `max_concurrency` at a time.
    /// Returns every page number in order; a failed page maps to no pairs.
    async fn fan_out(&self, pages: &[String]) -> BTreeMap<usize, Vec<QaPair>> {
        let mut results: BTreeMap<usize, Vec<QaPair>> =
            (0..pages.len()).map(|n| (n, Vec::new())).collect();
        if pages.is_empty() {
            return results;
        }

        let permits = Arc::new(Semaphore::new(
            pages.len().min(self.settings.max_concurrency.max(1)),
        ));
        let mut tasks = JoinSet::new();
        for (page_number, text) in pages.iter().enumerate() {
            let generator = self.generator.clone();
            let permits = permits.clone();
            let text = text.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (page_number, generator.generate(&text).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page_number, Ok(pairs))) => {
                    tracing::debug!(page = page_number, pairs = pairs.len(), "page generated");
                    results.insert(page_number, pairs);
                }
                Ok((page_number, Err(e))) => {
                    tracing::warn!(page = page_number, error = ?e, "page generation failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "page generation task panicked");
                }
            }
        }
        results
    }

    async fn index_pages(&self, filename: &str, pages: &[String]) -> Result<()> {
        let (Some(embedder), Some(index)) = (&self.embedder, &self.index) else {
            return Ok(());
        };
        if pages.is_empty() {
            return Ok(());
        }
        let vectors = embedding::embed_texts(embedder.as_ref(), pages).await?;
        let points: Vec<IndexPoint> = vectors
            .into_iter()
            .enumerate()
            .map(|(n, vector)| IndexPoint {
                id: page_id(filename, n),
                vector,
            })
            .collect();
        index.upsert(&points).await?;
        tracing::info!(
            filename = %filename,
            points = points.len(),
            model = embedder.model_name(),
            "pages indexed"
        );
        Ok(())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
