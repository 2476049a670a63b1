use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use docqa::config::Config;
use docqa::queue::{JobStatus, WorkQueue};
use docqa::store::{RecordStore, SqliteStore};
use docqa::{db, migrate, server};

struct TestServer {
    _tmp: TempDir,
    base: String,
    queue: Arc<WorkQueue>,
}

/// Serve the webhook router on a free port. No worker runs, so queued jobs
/// stay pending.
async fn start() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("docqa.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();

    let queue = Arc::new(WorkQueue::from_config(&config.queue, pool.clone()));
    let records: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(pool));
    let app = server::app(queue.clone(), records);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        base: format!("http://{}", addr),
        queue,
    }
}

fn cloud_event(id: &str) -> Value {
    json!({
        "id": id,
        "source": "//storage.googleapis.com/projects/_/buckets/uploads",
        "type": "google.cloud.storage.object.v1.finalized",
        "data": {
            "bucket": "uploads",
            "name": "reports/q1.pdf",
            "contentType": "application/pdf",
            "timeCreated": "2024-05-01T12:00:00Z"
        }
    })
}

#[tokio::test]
async fn test_health() {
    let srv = start().await;
    let resp = reqwest::get(format!("{}/health", srv.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_post_event_enqueues_and_acknowledges() {
    let srv = start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/events", srv.base))
        .json(&cloud_event("evt-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "accepted");

    let job = srv.queue.get("evt-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.event.bucket, "uploads");
    assert_eq!(job.event.object_name, "reports/q1.pdf");
    assert_eq!(job.event.mime_type, "application/pdf");
}

#[tokio::test]
async fn test_redelivery_is_acknowledged_as_duplicate() {
    let srv = start().await;
    let client = reqwest::Client::new();
    let url = format!("{}/events", srv.base);

    client.post(&url).json(&cloud_event("evt-1")).send().await.unwrap();
    let resp = client
        .post(&url)
        .json(&cloud_event("evt-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "duplicate");
    assert_eq!(srv.queue.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_bare_payload_with_ce_id_header() {
    let srv = start().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/events", srv.base))
        .header("ce-id", "hdr-7")
        .json(&json!({"bucket": "uploads", "name": "notes.txt"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert!(srv.queue.get("hdr-7").await.unwrap().is_some());
}

#[tokio::test]
async fn test_malformed_payloads_are_acknowledged_not_rejected() {
    let srv = start().await;
    let client = reqwest::Client::new();
    let url = format!("{}/events", srv.base);

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ignored");
    assert!(body["reason"].as_str().unwrap().contains("invalid JSON"));

    let resp = client
        .post(&url)
        .json(&json!({"id": "x", "data": {"name": "no-bucket.pdf"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ignored");
    assert_eq!(srv.queue.counts().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_get_event_status() {
    let srv = start().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/events", srv.base))
        .json(&cloud_event("evt-9"))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{}/events/evt-9", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["event_id"], "evt-9");
    assert_eq!(body["job"]["status"], "pending");
    assert!(body["event"].is_null());

    let resp = client
        .get(format!("{}/events/unknown", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}
