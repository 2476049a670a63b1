//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` has defaults, so a minimal config only needs
//! a database path and a place to write the dataset:
//!
//! ```toml
//! [db]
//! path = "./data/docqa.sqlite"
//!
//! [storage]
//! backend = "local"
//! root = "./data/buckets"
//!
//! [dataset]
//! bucket = "output"
//! ```
//!
//! Credentials never live in the file; they are read from the environment by
//! the client that needs them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `local` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Root directory for the local backend; each bucket is a subdirectory.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root: default_storage_root(),
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_storage_backend() -> String {
    "local".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/buckets")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// `local` (in-process extraction) or `docai`.
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
    #[serde(default = "default_ocr_endpoint")]
    pub endpoint: String,
    /// Full processor resource name,
    /// e.g. `projects/p/locations/us/processors/abc123`.
    #[serde(default)]
    pub processor: Option<String>,
    /// When set, documents are processed in batch mode with intermediate
    /// output written under `{temp_bucket}/ocr/`.
    #[serde(default)]
    pub temp_bucket: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_ocr_provider(),
            endpoint: default_ocr_endpoint(),
            processor: None,
            temp_bucket: None,
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_ocr_provider() -> String {
    "local".to_string()
}
fn default_ocr_endpoint() -> String {
    "https://us-documentai.googleapis.com".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_ocr_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `gemini` or `openai`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Overrides the provider's public API base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_question_count")]
    pub question_count: usize,
    /// Ask for schema-constrained JSON instead of the `Q:`/`A:` text format.
    #[serde(default = "default_true")]
    pub structured_output: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            endpoint: None,
            question_count: default_question_count(),
            structured_output: true,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "gemini".to_string()
}
fn default_generation_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_question_count() -> usize {
    20
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai` or `gemini`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            endpoint: None,
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    /// `sqlite` (vectors kept in the local database) or `vertex`.
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Full index resource name for the `vertex` provider.
    #[serde(default)]
    pub index: Option<String>,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            endpoint: None,
            index: None,
        }
    }
}

fn default_vector_provider() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    32_000
}
fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Upper bound on concurrent page generations per document.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Re-run events that were already completed.
    #[serde(default)]
    pub force_reprocess: bool,
    /// A `processing` event older than this is assumed to have crashed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Split single-text extractions into segments of roughly this many
    /// tokens. `None` keeps the whole document as one page.
    #[serde(default)]
    pub segment_max_tokens: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            force_reprocess: false,
            stale_after_secs: default_stale_after_secs(),
            segment_max_tokens: None,
        }
    }
}

fn default_max_concurrency() -> usize {
    16
}
fn default_include_globs() -> Vec<String> {
    vec!["**".to_string()]
}
fn default_stale_after_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset_bucket")]
    pub bucket: String,
    #[serde(default = "default_dataset_object")]
    pub object_name: String,
    /// `text` (`input_text`/`output_text`) or `chat` (`contents` form).
    #[serde(default = "default_dataset_format")]
    pub format: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            bucket: default_dataset_bucket(),
            object_name: default_dataset_object(),
            format: default_dataset_format(),
        }
    }
}

fn default_dataset_bucket() -> String {
    "output".to_string()
}
fn default_dataset_object() -> String {
    "dataset.jsonl".to_string()
}
fn default_dataset_format() -> String {
    "chat".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before a failed job is retried; doubles per attempt.
    #[serde(default = "default_queue_backoff_secs")]
    pub backoff_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_queue_poll_ms(),
            max_attempts: default_queue_max_attempts(),
            backoff_secs: default_queue_backoff_secs(),
        }
    }
}

fn default_queue_poll_ms() -> u64 {
    500
}
fn default_queue_max_attempts() -> u32 {
    3
}
fn default_queue_backoff_secs() -> i64 {
    30
}

impl Config {
    /// A config with every default and the given database path. Used by
    /// tests and by callers that build configuration programmatically.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            ocr: OcrConfig::default(),
            generation: GenerationConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_index: VectorIndexConfig::default(),
            retry: RetryConfig::default(),
            pipeline: PipelineConfig::default(),
            dataset: DatasetConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.storage.backend.as_str() {
        "local" | "s3" => {}
        other => bail!("Unknown storage backend: '{}'. Must be local or s3.", other),
    }

    match config.ocr.provider.as_str() {
        "local" => {}
        "docai" => {
            if config.ocr.processor.is_none() {
                bail!("ocr.processor must be set when provider is 'docai'");
            }
        }
        other => bail!("Unknown OCR provider: '{}'. Must be local or docai.", other),
    }

    match config.generation.provider.as_str() {
        "gemini" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be gemini or openai.",
            other
        ),
    }
    if config.generation.question_count == 0 {
        bail!("generation.question_count must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "gemini" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or gemini.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    match config.vector_index.provider.as_str() {
        "sqlite" => {}
        "vertex" => {
            if config.vector_index.endpoint.is_none() || config.vector_index.index.is_none() {
                bail!("vector_index.endpoint and vector_index.index must be set for 'vertex'");
            }
        }
        other => bail!(
            "Unknown vector index provider: '{}'. Must be sqlite or vertex.",
            other
        ),
    }

    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if !config.retry.multiplier.is_finite() || config.retry.multiplier < 1.0 {
        bail!("retry.multiplier must be a finite number >= 1.0");
    }

    if config.pipeline.max_concurrency == 0 {
        bail!("pipeline.max_concurrency must be > 0");
    }
    if config.pipeline.segment_max_tokens == Some(0) {
        bail!("pipeline.segment_max_tokens must be > 0 when set");
    }

    match config.dataset.format.as_str() {
        "text" | "chat" => {}
        other => bail!("Unknown dataset format: '{}'. Must be text or chat.", other),
    }
    if config.dataset.object_name.is_empty() {
        bail!("dataset.object_name must not be empty");
    }

    if config.queue.max_attempts == 0 {
        bail!("queue.max_attempts must be >= 1");
    }

    Ok(())
}
