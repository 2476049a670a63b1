//! Document text extraction.
//!
//! A [`TextExtractor`] turns a stored document into either one block of
//! text or an ordered list of page texts ([`ExtractedText`]). The remote
//! OCR backend lives in [`crate::ocr`]; this module holds the trait, MIME
//! inference, and the in-process [`LocalExtractor`] for plain text, PDF,
//! DOCX and PPTX.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::chunk;
use crate::config::OcrConfig;
use crate::ocr::DocAiExtractor;
use crate::retry::RetryPolicy;
use crate::storage::{ObjectLocator, ObjectStore};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Page separator used by plain-text and PDF sources.
const FORM_FEED: char = '\x0c';

/// Map a file extension to the MIME type sent to the extractor.
pub fn infer_mime_type(object_name: &str) -> Result<&'static str> {
    let ext = Path::new(object_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "pdf" => MIME_PDF,
        "gif" => "image/gif",
        "tiff" | "tif" => "image/tiff",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        "" => bail!("cannot infer MIME type for '{}': no file extension", object_name),
        other => bail!("file format .{} is not supported", other),
    };
    Ok(mime)
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub locator: ObjectLocator,
    pub mime_type: String,
    /// Where a batch OCR job may write intermediate output.
    pub temp: Option<ObjectLocator>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedText {
    Full(String),
    Pages(Vec<String>),
}

impl ExtractedText {
    /// Page texts for generation. A full text becomes one page, or several
    /// paragraph-aligned segments when `segment_max_tokens` is set.
    pub fn into_pages(self, segment_max_tokens: Option<usize>) -> Vec<String> {
        match (self, segment_max_tokens) {
            (ExtractedText::Pages(pages), _) => pages,
            (ExtractedText::Full(text), Some(max_tokens)) => chunk::segment_text(&text, max_tokens),
            (ExtractedText::Full(text), None) => vec![text],
        }
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractedText>;
}

/// Build the configured extractor.
pub fn from_config(
    config: &OcrConfig,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
) -> Result<Arc<dyn TextExtractor>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalExtractor::new(store))),
        "docai" => Ok(Arc::new(DocAiExtractor::from_config(config, store, retry)?)),
        other => bail!("Unknown OCR provider: '{}'", other),
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type for local extraction: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// In-process extraction; no network calls.
pub struct LocalExtractor {
    store: Arc<dyn ObjectStore>,
}

impl LocalExtractor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TextExtractor for LocalExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractedText> {
        let bytes = self.store.get(&request.locator).await?;
        let mime = request.mime_type.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_bytes(&bytes, &mime))
            .await
            .context("extraction task panicked")??;
        Ok(extracted)
    }
}

/// Extract text from raw document bytes.
pub fn extract_bytes(bytes: &[u8], mime_type: &str) -> Result<ExtractedText, ExtractError> {
    match mime_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes).map(ExtractedText::Full),
        MIME_PPTX => extract_pptx(bytes).map(ExtractedText::Pages),
        t if t.starts_with("text/") => Ok(split_form_feeds(&String::from_utf8_lossy(bytes))),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn split_form_feeds(text: &str) -> ExtractedText {
    if text.contains(FORM_FEED) {
        let mut pages: Vec<String> = text
            .split(FORM_FEED)
            .map(|p| p.trim().to_string())
            .collect();
        // A trailing form feed leaves an empty last page.
        if pages.len() > 1 && pages.last().is_some_and(|p| p.is_empty()) {
            pages.pop();
        }
        ExtractedText::Pages(pages)
    } else {
        ExtractedText::Full(text.to_string())
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(split_form_feeds(&text))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_paragraph_text(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut slides = Vec::with_capacity(slide_names.len());
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        slides.push(collect_paragraph_text(&xml)?);
    }
    Ok(slides)
}

/// Concatenate `<*:t>` runs, one line per `<*:p>` paragraph. Works for both
/// WordprocessingML (`w:`) and DrawingML (`a:`) since only local names are
/// compared.
fn collect_paragraph_text(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
