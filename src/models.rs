//! Core data models used throughout docqa.
//!
//! These types represent the upload events, stored records, and generated
//! question/answer pairs that flow through the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Record store collection holding processed-event markers.
pub const EVENTS: &str = "events";
/// Record store collection holding per-document metadata and pages.
pub const DOCUMENTS: &str = "documents";
/// Record store collection holding generated question/answer entries.
pub const DATASET: &str = "dataset";

/// A storage-upload notification, as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub event_id: String,
    pub bucket: String,
    pub object_name: String,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadEvent {
    /// Record store key for the document this event refers to.
    pub fn document_key(&self) -> String {
        document_key(&self.object_name)
    }
}

/// Processing state of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Processing,
    Completed,
    Failed,
}

/// Marker for an event the pipeline has started (or finished) handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub bucket: String,
    pub object_name: String,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dataset_size: Option<usize>,
}

impl EventRecord {
    pub fn started(event: &UploadEvent, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id.clone(),
            bucket: event.bucket.clone(),
            object_name: event.object_name.clone(),
            mime_type: event.mime_type.clone(),
            uploaded_at: event.uploaded_at,
            status: EventStatus::Processing,
            started_at: now,
            finished_at: None,
            error: None,
            dataset_size: None,
        }
    }
}

/// Per-document metadata. Pages are merged in after extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub filename: String,
    pub bucket: String,
    pub mime_type: String,
    pub event_id: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub page_count: usize,
}

/// One generated question/answer pair tied to its source page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub question: String,
    pub answer: String,
    pub filename: String,
    pub page_number: usize,
    pub event_id: String,
}

impl DatasetEntry {
    pub fn key(&self) -> String {
        question_key(&self.question)
    }
}

/// A question/answer pair as returned by the question generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

impl QaPair {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Record store key for a document: path separators are not allowed in keys.
pub fn document_key(object_name: &str) -> String {
    object_name.replace('/', "-")
}

/// Record store key for a dataset entry.
///
/// SHA-256 over the question after trimming, collapsing inner whitespace and
/// lowercasing, so trivially different spellings of the same question merge.
pub fn question_key(question: &str) -> String {
    let normalized = question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Vector index datapoint id for one page of a document.
pub fn page_id(filename: &str, page_number: usize) -> String {
    format!("{}:{}", filename, page_number)
}
