use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;

use docqa::embedding::Embedder;
use docqa::extract::{ExtractRequest, ExtractedText, LocalExtractor, TextExtractor};
use docqa::generate::QuestionGenerator;
use docqa::index::{SqliteVectorIndex, VectorIndex};
use docqa::materialize::DatasetFormat;
use docqa::models::{
    DatasetEntry, DocumentRecord, EventRecord, EventStatus, QaPair, UploadEvent, DATASET,
    DOCUMENTS, EVENTS,
};
use docqa::pipeline::{Outcome, Pipeline, PipelineParts, PipelineSettings};
use docqa::storage::{LocalObjectStore, ObjectLocator, ObjectStore};
use docqa::store::{InMemoryStore, RecordStore, RecordStoreExt};

// ============ Fakes ============

struct FakeExtractor {
    pages: Vec<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExtractRequest>>,
}

impl FakeExtractor {
    fn new(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| p.to_string()).collect(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<ExtractedText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        Ok(ExtractedText::Pages(self.pages.clone()))
    }
}

/// Answers by page text; texts listed in `failing` always error.
struct FakeGenerator {
    replies: HashMap<String, Vec<QaPair>>,
    failing: Vec<String>,
    calls: AtomicUsize,
}

impl FakeGenerator {
    fn new(replies: Vec<(&str, Vec<(&str, &str)>)>) -> Self {
        Self {
            replies: replies
                .into_iter()
                .map(|(text, pairs)| {
                    (
                        text.to_string(),
                        pairs.into_iter().map(|(q, a)| QaPair::new(q, a)).collect(),
                    )
                })
                .collect(),
            failing: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_on(mut self, text: &str) -> Self {
        self.failing.push(text.to_string());
        self
    }
}

#[async_trait]
impl QuestionGenerator for FakeGenerator {
    async fn generate(&self, text: &str) -> Result<Vec<QaPair>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|t| t == text) {
            bail!("model unavailable");
        }
        Ok(self.replies.get(text).cloned().unwrap_or_default())
    }
}

struct LengthEmbedder;

#[async_trait]
impl Embedder for LengthEmbedder {
    fn model_name(&self) -> &str {
        "length"
    }

    fn batch_size(&self) -> usize {
        2
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0])
            .collect())
    }
}

// ============ Harness ============

struct Harness {
    _tmp: TempDir,
    records: Arc<InMemoryStore>,
    objects: Arc<LocalObjectStore>,
    output: ObjectLocator,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let objects = Arc::new(LocalObjectStore::new(tmp.path()));
        Self {
            _tmp: tmp,
            records: Arc::new(InMemoryStore::new()),
            objects,
            output: ObjectLocator::new("output", "dataset.jsonl"),
        }
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings::with_output(self.output.clone())
    }

    fn pipeline(
        &self,
        extractor: Arc<dyn TextExtractor>,
        generator: Arc<dyn QuestionGenerator>,
        settings: PipelineSettings,
    ) -> Pipeline {
        Pipeline::new(
            PipelineParts {
                records: self.records.clone(),
                objects: self.objects.clone(),
                extractor,
                generator,
                embedder: None,
                index: None,
            },
            settings,
        )
    }

    async fn dataset_lines(&self) -> Vec<Value> {
        let bytes = self.objects.get(&self.output).await.unwrap();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

fn event(id: &str, name: &str) -> UploadEvent {
    UploadEvent {
        event_id: id.to_string(),
        bucket: "uploads".to_string(),
        object_name: name.to_string(),
        mime_type: "application/pdf".to_string(),
        uploaded_at: Utc::now(),
    }
}

const PARIS: &str = "Paris is the capital of France.";
const CAPITAL_Q: &str = "What is the capital of France?";

// ============ Scenarios ============

#[tokio::test]
async fn test_single_page_event_produces_one_entry_and_line() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let mut settings = h.settings();
    settings.dataset_format = DatasetFormat::Text;
    let pipeline = h.pipeline(extractor.clone(), generator.clone(), settings);

    let outcome = pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Completed {
            pages: 1,
            entries: 1,
            dataset_size: 1
        }
    );

    let entries: Vec<(String, DatasetEntry)> = h.records.fetch_all(DATASET).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0].1;
    assert_eq!(entry.question, CAPITAL_Q);
    assert_eq!(entry.answer, "Paris");
    assert_eq!(entry.filename, "france.pdf");
    assert_eq!(entry.page_number, 0);
    assert_eq!(entry.event_id, "evt-1");

    let lines = h.dataset_lines().await;
    assert_eq!(lines.len(), 1);
    assert_eq!(
        lines[0]["input_text"],
        format!("Text: {}\n\nQuestion: {}", PARIS, CAPITAL_Q)
    );
    assert_eq!(lines[0]["output_text"], "Paris");

    let record: EventRecord = h.records.fetch(EVENTS, "evt-1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Completed);
    assert_eq!(record.dataset_size, Some(1));
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn test_redelivered_event_is_a_duplicate_without_external_calls() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor.clone(), generator.clone(), h.settings());

    pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();
    let second = pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();

    assert_eq!(
        second,
        Outcome::Duplicate {
            status: EventStatus::Completed
        }
    );
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.records.count(DATASET).await.unwrap(), 1);
}

#[tokio::test]
async fn test_new_event_for_same_document_converges() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor, generator.clone(), h.settings());

    pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();
    pipeline.handle(&event("evt-2", "france.pdf")).await.unwrap();

    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.records.count(DATASET).await.unwrap(), 1);
    assert_eq!(h.records.count(DOCUMENTS).await.unwrap(), 1);
    assert_eq!(h.dataset_lines().await.len(), 1);
}

#[tokio::test]
async fn test_force_reprocess_overrides_duplicate_check() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let mut settings = h.settings();
    settings.force_reprocess = true;
    let pipeline = h.pipeline(extractor.clone(), generator, settings);

    pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();
    let again = pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();

    assert!(matches!(again, Outcome::Completed { .. }));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fresh_processing_record_is_duplicate_but_stale_one_reruns() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor.clone(), generator, h.settings());
    let evt = event("evt-1", "france.pdf");

    h.records
        .put(EVENTS, "evt-1", &EventRecord::started(&evt, Utc::now()))
        .await
        .unwrap();
    let outcome = pipeline.handle(&evt).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Duplicate {
            status: EventStatus::Processing
        }
    );
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

    let crashed = Utc::now() - chrono::Duration::hours(2);
    h.records
        .put(EVENTS, "evt-1", &EventRecord::started(&evt, crashed))
        .await
        .unwrap();
    let outcome = pipeline.handle(&evt).await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fan_out_calls_once_per_page_and_survives_a_failing_page() {
    let h = Harness::new();
    let pages = ["page zero", "page one", "page two"];
    let extractor = Arc::new(FakeExtractor::new(&pages));
    let generator = Arc::new(
        FakeGenerator::new(vec![
            ("page zero", vec![("Q0?", "A0")]),
            ("page one", vec![("Q1?", "A1")]),
            ("page two", vec![("Q2a?", "A2a"), ("Q2b?", "A2b")]),
        ])
        .failing_on("page one"),
    );
    let mut settings = h.settings();
    settings.max_concurrency = 2;
    let pipeline = h.pipeline(extractor, generator.clone(), settings);

    let outcome = pipeline.handle(&event("evt-3", "three.pdf")).await.unwrap();

    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        outcome,
        Outcome::Completed {
            pages: 3,
            entries: 3,
            dataset_size: 3
        }
    );
    let entries: Vec<(String, DatasetEntry)> = h.records.fetch_all(DATASET).await.unwrap();
    let mut pages_seen: Vec<usize> = entries.iter().map(|(_, e)| e.page_number).collect();
    pages_seen.sort();
    assert_eq!(pages_seen, vec![0, 2, 2]);
}

#[tokio::test]
async fn test_same_question_on_two_pages_is_one_entry() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&["first page", "second page"]));
    let generator = Arc::new(FakeGenerator::new(vec![
        ("first page", vec![(CAPITAL_Q, "Paris"), ("Q0?", "A0")]),
        ("second page", vec![("  what is the CAPITAL of France? ", "Paris, France")]),
    ]));
    let pipeline = h.pipeline(extractor, generator, h.settings());

    let outcome = pipeline.handle(&event("evt-6", "two.pdf")).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Completed {
            pages: 2,
            entries: 2,
            dataset_size: 2
        }
    );

    // Fan-in runs in page order, so the later page's pair wins.
    let entries: Vec<(String, DatasetEntry)> = h.records.fetch_all(DATASET).await.unwrap();
    assert_eq!(entries.len(), 2);
    let capital = entries
        .iter()
        .map(|(_, e)| e)
        .find(|e| e.answer.starts_with("Paris"))
        .unwrap();
    assert_eq!(capital.page_number, 1);
    assert_eq!(capital.answer, "Paris, France");
}

#[tokio::test]
async fn test_same_question_from_two_documents_keeps_the_latest() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor, generator, h.settings());

    pipeline.handle(&event("evt-a", "atlas.pdf")).await.unwrap();
    let outcome = pipeline.handle(&event("evt-b", "guide.pdf")).await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { entries: 1, dataset_size: 1, .. }));

    let entries: Vec<(String, DatasetEntry)> = h.records.fetch_all(DATASET).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.filename, "guide.pdf");
    assert_eq!(entries[0].1.event_id, "evt-b");
    assert_eq!(h.records.count(DOCUMENTS).await.unwrap(), 2);
    assert_eq!(h.dataset_lines().await.len(), 1);
}

#[tokio::test]
async fn test_retried_job_takes_over_its_own_processing_record() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor.clone(), generator, h.settings());
    let evt = event("evt-1", "france.pdf");

    h.records
        .put(EVENTS, "evt-1", &EventRecord::started(&evt, Utc::now()))
        .await
        .unwrap();

    let first_try = pipeline.handle_job(&evt, 1).await.unwrap();
    assert_eq!(
        first_try,
        Outcome::Duplicate {
            status: EventStatus::Processing
        }
    );

    let retry = pipeline.handle_job(&evt, 2).await.unwrap();
    assert!(matches!(retry, Outcome::Completed { entries: 1, .. }));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

    // A completed event stays a duplicate for any attempt.
    let again = pipeline.handle_job(&evt, 3).await.unwrap();
    assert_eq!(
        again,
        Outcome::Duplicate {
            status: EventStatus::Completed
        }
    );
}

#[tokio::test]
async fn test_ignored_objects_do_no_work() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![]));
    let pipeline = h.pipeline(extractor.clone(), generator, h.settings());

    let mut artifact = event("evt-out", "dataset.jsonl");
    artifact.bucket = "output".to_string();
    let outcome = pipeline.handle(&artifact).await.unwrap();

    assert!(matches!(outcome, Outcome::Ignored { .. }));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.records.count(EVENTS).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unsupported_extension_marks_event_failed() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![]));
    let pipeline = h.pipeline(extractor.clone(), generator, h.settings());

    let mut evt = event("evt-bin", "archive.bin");
    evt.mime_type = String::new();

    let outcome = pipeline.handle_event(&evt).await;
    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

    let record: EventRecord = h.records.fetch(EVENTS, "evt-bin").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Failed);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn test_failed_event_is_retried_on_redelivery() {
    struct FlakyExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextExtractor for FlakyExtractor {
        async fn extract(&self, _request: &ExtractRequest) -> Result<ExtractedText> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                bail!("ocr unavailable");
            }
            Ok(ExtractedText::Full(PARIS.to_string()))
        }
    }

    let h = Harness::new();
    let extractor = Arc::new(FlakyExtractor {
        calls: AtomicUsize::new(0),
    });
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor, generator, h.settings());
    let evt = event("evt-1", "france.pdf");

    let first = pipeline.handle_event(&evt).await;
    match first {
        Outcome::Failed { error } => assert!(error.contains("ocr unavailable")),
        other => panic!("expected failure, got {:?}", other),
    }

    let second = pipeline.handle_event(&evt).await;
    assert!(matches!(second, Outcome::Completed { entries: 1, .. }));
    let record: EventRecord = h.records.fetch(EVENTS, "evt-1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Completed);
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn test_document_record_keeps_metadata_and_pages() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&["one", "two"]));
    let generator = Arc::new(FakeGenerator::new(vec![]));
    let pipeline = h.pipeline(extractor, generator, h.settings());

    pipeline
        .handle(&event("evt-4", "reports/q1.pdf"))
        .await
        .unwrap();

    let doc: DocumentRecord = h
        .records
        .fetch(DOCUMENTS, "reports-q1.pdf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.filename, "reports/q1.pdf");
    assert_eq!(doc.bucket, "uploads");
    assert_eq!(doc.mime_type, "application/pdf");
    assert_eq!(doc.pages, vec!["one", "two"]);
    assert_eq!(doc.page_count, 2);
}

#[tokio::test]
async fn test_temp_bucket_enables_batch_output_locator() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![]));
    let mut settings = h.settings();
    settings.temp_bucket = Some("scratch".to_string());
    let pipeline = h.pipeline(extractor.clone(), generator, settings);

    pipeline.handle(&event("evt-5", "a/b.pdf")).await.unwrap();

    let requests = extractor.requests.lock().unwrap();
    assert_eq!(
        requests[0].temp,
        Some(ObjectLocator::new("scratch", "ocr/uploads/a/b.pdf"))
    );
    assert_eq!(requests[0].locator, ObjectLocator::new("uploads", "a/b.pdf"));
}

#[tokio::test]
async fn test_local_text_extraction_end_to_end() {
    let h = Harness::new();
    let source = ObjectLocator::new("uploads", "notes.txt");
    h.objects
        .put(&source, b"first page\x0csecond page".to_vec(), "text/plain")
        .await
        .unwrap();

    let extractor = Arc::new(LocalExtractor::new(h.objects.clone()));
    let generator = Arc::new(FakeGenerator::new(vec![
        ("first page", vec![("What comes first?", "The first page")]),
        ("second page", vec![("What comes second?", "The second page")]),
    ]));
    let pipeline = h.pipeline(extractor, generator, h.settings());

    let mut evt = event("evt-6", "notes.txt");
    evt.mime_type = String::new();
    let outcome = pipeline.handle(&evt).await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { pages: 2, entries: 2, .. }));

    let lines = h.dataset_lines().await;
    assert_eq!(lines.len(), 2);
    for line in &lines {
        assert_eq!(line["contents"][0]["role"], "user");
        assert_eq!(line["contents"][1]["role"], "model");
    }
}

#[tokio::test]
async fn test_pages_are_embedded_and_indexed() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    docqa::migrate::apply_schema(&pool).await.unwrap();
    let index = Arc::new(SqliteVectorIndex::new(pool));

    let h = Harness::new();
    let pipeline = Pipeline::new(
        PipelineParts {
            records: h.records.clone(),
            objects: h.objects.clone(),
            extractor: Arc::new(FakeExtractor::new(&["a", "bb", "ccc"])),
            generator: Arc::new(FakeGenerator::new(vec![])),
            embedder: Some(Arc::new(LengthEmbedder)),
            index: Some(index.clone() as Arc<dyn VectorIndex>),
        },
        h.settings(),
    );

    pipeline.handle(&event("evt-7", "doc.pdf")).await.unwrap();

    assert_eq!(index.count().await.unwrap(), 3);
    let top = index.query(&[3.0, 1.0], 1).await.unwrap();
    assert_eq!(top[0].id, "doc.pdf:2");
}

#[tokio::test]
async fn test_materialize_skips_entries_without_pages() {
    let h = Harness::new();
    let extractor = Arc::new(FakeExtractor::new(&[PARIS]));
    let generator = Arc::new(FakeGenerator::new(vec![(PARIS, vec![(CAPITAL_Q, "Paris")])]));
    let pipeline = h.pipeline(extractor, generator, h.settings());
    pipeline.handle(&event("evt-1", "france.pdf")).await.unwrap();

    let orphan = DatasetEntry {
        question: "Orphan?".to_string(),
        answer: "Yes".to_string(),
        filename: "missing.pdf".to_string(),
        page_number: 0,
        event_id: "evt-x".to_string(),
    };
    h.records.put(DATASET, &orphan.key(), &orphan).await.unwrap();
    let out_of_range = DatasetEntry {
        question: "Page nine?".to_string(),
        page_number: 9,
        filename: "france.pdf".to_string(),
        ..orphan.clone()
    };
    h.records
        .put(DATASET, &out_of_range.key(), &out_of_range)
        .await
        .unwrap();

    let report = pipeline
        .materializer()
        .materialize(&h.output)
        .await
        .unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(h.dataset_lines().await.len(), report.written);

    // Identical store contents give a byte-identical artifact.
    let first = h.objects.get(&h.output).await.unwrap();
    pipeline
        .materializer()
        .materialize(&h.output)
        .await
        .unwrap();
    assert_eq!(h.objects.get(&h.output).await.unwrap(), first);
}
