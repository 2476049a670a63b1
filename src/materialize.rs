//! Dataset materialization.
//!
//! Joins every dataset entry with the page text it was generated from and
//! rewrites the JSONL training artifact in a single object put. Lines are
//! emitted in dataset-key order, so unchanged store contents always produce
//! a byte-identical artifact.
//!
//! Entries whose document or page cannot be found are skipped and counted,
//! never fatal.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::models::{DatasetEntry, DocumentRecord, DATASET, DOCUMENTS};
use crate::storage::{ObjectLocator, ObjectStore};
use crate::store::{RecordStore, RecordStoreExt};

pub const CHAT_SYSTEM_INSTRUCTION: &str = "Answer the question based on the following text";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// `{"input_text", "output_text"}` lines.
    Text,
    /// `{"systemInstruction", "contents"}` chat lines.
    Chat,
}

impl FromStr for DatasetFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(DatasetFormat::Text),
            "chat" => Ok(DatasetFormat::Chat),
            other => bail!("Unknown dataset format: '{}'", other),
        }
    }
}

impl DatasetFormat {
    pub fn line(&self, context: &str, question: &str, answer: &str) -> Value {
        match self {
            DatasetFormat::Text => json!({
                "input_text": format!("Text: {}\n\nQuestion: {}", context, question),
                "output_text": answer,
            }),
            DatasetFormat::Chat => json!({
                "systemInstruction": {"parts": [{"text": CHAT_SYSTEM_INSTRUCTION}]},
                "contents": [
                    {
                        "role": "user",
                        "parts": [{"text": format!("Text: {}", context)}, {"text": question}],
                    },
                    {"role": "model", "parts": [{"text": answer}]},
                ],
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub written: usize,
    pub skipped: usize,
}

pub struct Materializer {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    format: DatasetFormat,
}

impl Materializer {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        format: DatasetFormat,
    ) -> Self {
        Self {
            records,
            objects,
            format,
        }
    }

    /// Render the whole artifact without writing it.
    pub async fn render(&self) -> Result<(Vec<u8>, MaterializeReport)> {
        let documents: Vec<(String, DocumentRecord)> = self.records.fetch_all(DOCUMENTS).await?;
        let pages: HashMap<String, Vec<String>> = documents
            .into_iter()
            .map(|(_, doc)| (doc.filename, doc.pages))
            .collect();

        let mut out = Vec::new();
        let mut report = MaterializeReport::default();

        for (key, raw) in self.records.list(DATASET).await? {
            let entry: DatasetEntry = match serde_json::from_value(raw) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping malformed dataset entry");
                    report.skipped += 1;
                    continue;
                }
            };

            let Some(context) = pages
                .get(&entry.filename)
                .and_then(|p| p.get(entry.page_number))
            else {
                tracing::warn!(
                    key = %key,
                    filename = %entry.filename,
                    page = entry.page_number,
                    "skipping dataset entry without source page"
                );
                report.skipped += 1;
                continue;
            };

            let line = self.format.line(context, &entry.question, &entry.answer);
            serde_json::to_writer(&mut out, &line)?;
            out.push(b'\n');
            report.written += 1;
        }

        Ok((out, report))
    }

    /// Overwrite `output` with the full artifact.
    pub async fn materialize(&self, output: &ObjectLocator) -> Result<MaterializeReport> {
        let (body, report) = self.render().await?;
        self.objects
            .put(output, body, "application/jsonl")
            .await
            .with_context(|| format!("Failed to write dataset to {}", output))?;
        tracing::info!(
            output = %output,
            written = report.written,
            skipped = report.skipped,
            "dataset materialized"
        );
        Ok(report)
    }
}
