use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn docqa_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docqa");
    path
}

/// Lay out a config, a bucket root and one uploaded text file. The
/// generation endpoint is only contacted by `process`.
fn setup_test_env(generation_endpoint: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let uploads = root.join("buckets/uploads/notes");
    fs::create_dir_all(&uploads).unwrap();
    fs::write(
        uploads.join("france.txt"),
        "Paris is the capital of France. The Seine flows through it.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docqa.sqlite"

[logging]
level = "warn"

[storage]
backend = "local"
root = "{root}/buckets"

[generation]
provider = "gemini"
endpoint = "{endpoint}"
question_count = 2

[retry]
max_attempts = 1
initial_backoff_ms = 1

[dataset]
bucket = "output"
object_name = "dataset.jsonl"
format = "text"
"#,
        root = root.display(),
        endpoint = generation_endpoint,
    );

    let config_path = config_dir.join("docqa.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docqa(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docqa_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("GEMINI_API_KEY", "test-key")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docqa binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// The mock server lives on the test runtime, so the blocking child
/// process runs off it.
async fn run_docqa_async(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let config_path = config_path.to_path_buf();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_docqa(&config_path, &refs)
    })
    .await
    .unwrap()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (stdout, stderr, success) = run_docqa(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docqa.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (_, _, first) = run_docqa(&config, &["init"]);
    let (_, stderr, second) = run_docqa(&config, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    run_docqa(&config, &["init"]);
    let (stdout, stderr, success) = run_docqa(&config, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Events:"));
    assert!(stdout.contains("Entries:"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    let mut content = fs::read_to_string(&config).unwrap();
    content = content.replace("provider = \"gemini\"", "provider = \"palm\"");
    fs::write(&config, content).unwrap();

    let (_, stderr, success) = run_docqa(&config, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Unknown generation provider"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_then_materialize() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text":
                r#"[{"question": "What is the capital of France?", "answer": "Paris"},
                    {"question": "Which river flows through Paris?", "answer": "The Seine"}]"#
            }]}}]
        })))
        .mount(&server)
        .await;

    let (tmp, config) = setup_test_env(&server.uri());
    let (_, stderr, success) = run_docqa_async(&config, &["init"]).await;
    assert!(success, "init failed: {}", stderr);

    let (stdout, stderr, success) = run_docqa_async(
        &config,
        &[
            "process",
            "--bucket",
            "uploads",
            "--name",
            "notes/france.txt",
            "--event-id",
            "evt-cli",
        ],
    )
    .await;
    assert!(success, "process failed: {}", stderr);
    assert!(stdout.contains("pages:        1"), "stdout: {}", stdout);
    assert!(stdout.contains("entries:      2"), "stdout: {}", stdout);

    let dataset_path = tmp.path().join("buckets/output/dataset.jsonl");
    let first = fs::read_to_string(&dataset_path).unwrap();
    let lines: Vec<Value> = first
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|l| l["output_text"] == "Paris"));

    // Same event id again: acknowledged without another model call.
    let (stdout, _, success) = run_docqa_async(
        &config,
        &[
            "process",
            "--bucket",
            "uploads",
            "--name",
            "notes/france.txt",
            "--event-id",
            "evt-cli",
        ],
    )
    .await;
    assert!(success);
    assert!(stdout.starts_with("duplicate"), "stdout: {}", stdout);

    let (stdout, stderr, success) = run_docqa_async(&config, &["materialize"]).await;
    assert!(success, "materialize failed: {}", stderr);
    assert!(stdout.contains("written: 2"));
    assert_eq!(fs::read_to_string(&dataset_path).unwrap(), first);

    let (stdout, _, success) = run_docqa_async(&config, &["stats"]).await;
    assert!(success);
    assert!(stdout.contains("evt-cli"));
}
