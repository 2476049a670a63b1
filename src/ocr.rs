//! Document-AI style OCR over REST.
//!
//! Two modes, chosen per request:
//!
//! - **online**: `POST {endpoint}/v1/{processor}:process`. Remote objects are
//!   referenced by URI (`gcsDocument`); objects only present in a local
//!   store are sent inline as base64 (`rawDocument`).
//! - **batch**: used when the request carries a temp locator.
//!   `POST {endpoint}/v1/{processor}:batchProcess` writes JSON output under
//!   the temp prefix; the long-running operation is polled until done, then
//!   every output object of that operation is parsed and the pages
//!   concatenated in listing order.
//!
//! The bearer token is read from `DOCQA_OCR_TOKEN`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use crate::config::OcrConfig;
use crate::error::{self, ServiceError};
use crate::extract::{ExtractRequest, ExtractedText, TextExtractor};
use crate::retry::RetryPolicy;
use crate::storage::{ObjectLocator, ObjectStore};

const SERVICE: &str = "ocr";

pub struct DocAiExtractor {
    endpoint: String,
    processor: String,
    token: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
    store: Arc<dyn ObjectStore>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl DocAiExtractor {
    pub fn from_config(
        config: &OcrConfig,
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let processor = config
            .processor
            .clone()
            .context("ocr.processor must be set for the docai provider")?;
        let token = std::env::var("DOCQA_OCR_TOKEN").ok();
        if token.is_none() {
            tracing::warn!("DOCQA_OCR_TOKEN not set; OCR requests are unauthenticated");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            processor,
            token,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            store,
            client,
            retry,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json(&self, label: &str, url: &str, body: &Value) -> Result<Value> {
        self.retry
            .run(label, || async {
                let req = self.authorized(self.client.post(url)).json(body);
                let resp = error::send_checked(SERVICE, req).await?;
                Ok::<_, anyhow::Error>(error::read_json(SERVICE, resp).await?)
            })
            .await
    }

    async fn get_json(&self, label: &str, url: &str) -> Result<Value> {
        self.retry
            .run(label, || async {
                let req = self.authorized(self.client.get(url));
                let resp = error::send_checked(SERVICE, req).await?;
                Ok::<_, anyhow::Error>(error::read_json(SERVICE, resp).await?)
            })
            .await
    }

    async fn process_online(&self, request: &ExtractRequest) -> Result<ExtractedText> {
        let body = match self.store.remote_uri(&request.locator) {
            Some(uri) => json!({
                "gcsDocument": {"gcsUri": uri, "mimeType": request.mime_type},
            }),
            None => {
                let bytes = self.store.get(&request.locator).await?;
                json!({
                    "rawDocument": {
                        "content": base64::engine::general_purpose::STANDARD.encode(bytes),
                        "mimeType": request.mime_type,
                    },
                })
            }
        };

        let url = format!("{}/v1/{}:process", self.endpoint, self.processor);
        let reply = self.post_json("ocr.process", &url, &body).await?;
        let document = reply
            .get("document")
            .ok_or_else(|| ServiceError::parse(SERVICE, "response has no 'document'"))?;
        Ok(document_text(document))
    }

    async fn process_batch(
        &self,
        request: &ExtractRequest,
        temp: &ObjectLocator,
    ) -> Result<ExtractedText> {
        let (Some(input_uri), Some(output_uri)) = (
            self.store.remote_uri(&request.locator),
            self.store.remote_uri(temp),
        ) else {
            bail!("batch OCR requires a remote object store");
        };

        let body = json!({
            "inputDocuments": {
                "gcsDocuments": {
                    "documents": [{"gcsUri": input_uri, "mimeType": request.mime_type}],
                },
            },
            "documentOutputConfig": {
                "gcsOutputConfig": {"gcsUri": format!("{}/", output_uri.trim_end_matches('/'))},
            },
        });

        let url = format!("{}/v1/{}:batchProcess", self.endpoint, self.processor);
        let operation = self.post_json("ocr.batch", &url, &body).await?;
        let name = operation
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::parse(SERVICE, "operation has no 'name'"))?
            .to_string();

        tracing::info!(operation = %name, document = %request.locator, "batch OCR started");
        let finished = self.wait_for_operation(&name).await?;

        let output = operation_output(&finished, &name, temp);
        let outputs = self.store.list(&output.bucket, &output.name).await?;
        let mut pages = Vec::new();
        for object in outputs
            .iter()
            .filter(|n| n.starts_with(&output.name) && n.ends_with(".json"))
        {
            let locator = ObjectLocator::new(output.bucket.clone(), object.clone());
            let raw = self.store.get(&locator).await?;
            let document: Value = serde_json::from_slice(&raw)
                .with_context(|| format!("Malformed OCR output {}", locator))?;
            match document_text(&document) {
                ExtractedText::Pages(p) => pages.extend(p),
                ExtractedText::Full(text) => pages.push(text),
            }
        }

        if pages.is_empty() {
            bail!("batch OCR produced no output under {}", output);
        }
        Ok(ExtractedText::Pages(pages))
    }

    /// Poll until the operation is done and return its final state.
    async fn wait_for_operation(&self, name: &str) -> Result<Value> {
        let url = format!("{}/v1/{}", self.endpoint, name);
        let started = Instant::now();
        loop {
            let op = self.get_json("ocr.poll", &url).await?;
            if op.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                if let Some(err) = op.get("error") {
                    bail!("batch OCR operation {} failed: {}", name, err);
                }
                return Ok(op);
            }
            if started.elapsed() >= self.timeout {
                return Err(ServiceError::Timeout {
                    service: SERVICE,
                    secs: self.timeout.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl TextExtractor for DocAiExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractedText> {
        match request.temp {
            Some(ref temp) => self.process_batch(request, temp).await,
            None => self.process_online(request).await,
        }
    }
}

/// Where one batch operation wrote its output, as a listing prefix.
///
/// The temp prefix is shared by every run for the same object, so only the
/// operation's own destination is read. The service reports it in
/// `metadata.individualProcessStatuses[0].outputGcsDestination`; without
/// it, output lives under a subdirectory named after the operation id.
pub fn operation_output(operation: &Value, name: &str, temp: &ObjectLocator) -> ObjectLocator {
    let reported = operation
        .pointer("/metadata/individualProcessStatuses/0/outputGcsDestination")
        .and_then(|v| v.as_str())
        .and_then(split_uri);
    if let Some((bucket, path)) = reported {
        return ObjectLocator::new(bucket, format!("{}/", path.trim_end_matches('/')));
    }
    let operation_id = name.rsplit('/').next().unwrap_or(name);
    ObjectLocator::new(
        temp.bucket.clone(),
        format!("{}/{}/", temp.name.trim_end_matches('/'), operation_id),
    )
}

/// `scheme://bucket/path` into `(bucket, path)`.
fn split_uri(uri: &str) -> Option<(String, String)> {
    let (_, rest) = uri.split_once("://")?;
    let (bucket, path) = rest.split_once('/')?;
    (!bucket.is_empty() && !path.is_empty()).then(|| (bucket.to_string(), path.to_string()))
}

/// Page texts of an OCR document, or the whole text when it has no pages.
pub fn document_text(document: &Value) -> ExtractedText {
    let text = document
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let pages = match document.get("pages").and_then(|v| v.as_array()) {
        Some(pages) if !pages.is_empty() => pages,
        _ => return ExtractedText::Full(text.to_string()),
    };

    let chars: Vec<char> = text.chars().collect();
    let page_texts = pages
        .iter()
        .map(|page| {
            page.pointer("/layout/textAnchor/textSegments")
                .and_then(|v| v.as_array())
                .map(|segments| {
                    segments
                        .iter()
                        .map(|seg| {
                            let start = index_field(seg, "startIndex").min(chars.len());
                            let end = index_field(seg, "endIndex").clamp(start, chars.len());
                            chars[start..end].iter().collect::<String>()
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default()
        })
        .collect();
    ExtractedText::Pages(page_texts)
}

/// int64 fields arrive as JSON strings; an absent index means 0.
fn index_field(segment: &Value, field: &str) -> usize {
    match segment.get(field) {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        _ => 0,
    }
}
