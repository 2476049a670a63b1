//! Object storage backends.
//!
//! Documents are read from, and the dataset artifact is written to, an
//! [`ObjectStore`] addressed by [`ObjectLocator`] (`bucket` + object `name`).
//!
//! Two backends are provided:
//!
//! - [`LocalObjectStore`]: a directory tree where each bucket is a
//!   subdirectory of the configured root. Used for development and tests.
//! - [`S3ObjectStore`]: the S3 REST API with AWS Signature V4, signed with
//!   pure-Rust `hmac` + `sha2`. Custom endpoints (MinIO, LocalStack) use
//!   path-style addressing.
//!
//! # Environment Variables
//!
//! The S3 backend reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
//! optionally `AWS_SESSION_TOKEN`.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;
use crate::error::{self, ServiceError};
use crate::retry::RetryPolicy;

/// Address of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub bucket: String,
    pub name: String,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    /// Locator for `name` nested under `prefix` in the same bucket.
    pub fn child(&self, name: &str) -> Self {
        let base = self.name.trim_end_matches('/');
        if base.is_empty() {
            Self::new(self.bucket.clone(), name)
        } else {
            Self::new(self.bucket.clone(), format!("{}/{}", base, name))
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, locator: &ObjectLocator) -> Result<Vec<u8>>;

    /// Write the whole object, replacing any previous content.
    async fn put(&self, locator: &ObjectLocator, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Names of all objects in `bucket` starting with `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// A URI a remote service can read the object from, or `None` when the
    /// object only exists on this machine.
    fn remote_uri(&self, locator: &ObjectLocator) -> Option<String>;
}

/// Build the configured backend.
pub fn from_config(config: &StorageConfig, retry: RetryPolicy) -> Result<Arc<dyn ObjectStore>> {
    match config.backend.as_str() {
        "local" => Ok(Arc::new(LocalObjectStore::new(&config.root))),
        "s3" => Ok(Arc::new(S3ObjectStore::from_config(config, retry)?)),
        other => bail!("Unknown storage backend: '{}'", other),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Local filesystem
// ═══════════════════════════════════════════════════════════════════════

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, locator: &ObjectLocator) -> Result<PathBuf> {
        let bucket = Path::new(&locator.bucket);
        let name = Path::new(&locator.name);
        for part in bucket.components().chain(name.components()) {
            if !matches!(part, Component::Normal(_)) {
                bail!("Invalid object locator: {}", locator);
            }
        }
        Ok(self.root.join(bucket).join(name))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, locator: &ObjectLocator) -> Result<Vec<u8>> {
        let path = self.path_for(locator)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {}", locator))
    }

    async fn put(&self, locator: &ObjectLocator, body: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers never observe a half-written artifact.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write object {}", locator))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace object {}", locator))?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_root = self.root.join(bucket);
        if !bucket_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in walkdir::WalkDir::new(&bucket_root).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&bucket_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if rel.starts_with(prefix) {
                names.push(rel);
            }
        }
        names.sort();
        Ok(names)
    }

    fn remote_uri(&self, _locator: &ObjectLocator) -> Option<String> {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════
// S3
// ═══════════════════════════════════════════════════════════════════════

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3ObjectStore {
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
    retry: RetryPolicy,
}

/// A signed request ready to send.
struct SignedRequest {
    url: String,
    headers: Vec<(String, String)>,
}

impl S3ObjectStore {
    pub fn from_config(config: &StorageConfig, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
            retry,
        })
    }

    /// `(scheme, host, path prefix)` for a bucket.
    ///
    /// The default endpoint uses virtual-hosted addressing; a custom
    /// endpoint uses path-style addressing.
    fn addressing(&self, bucket: &str) -> (String, String, String) {
        match self.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host, format!("/{}", uri_encode(bucket)))
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", bucket, self.region),
                String::new(),
            ),
        }
    }

    fn sign(
        &self,
        method: &str,
        bucket: &str,
        key: Option<&str>,
        query: &[(String, String)],
        payload: &[u8],
    ) -> SignedRequest {
        let (scheme, host, base_path) = self.addressing(bucket);
        let canonical_uri = match key {
            Some(key) => {
                let encoded = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
                format!("{}/{}", base_path, encoded)
            }
            None => format!("{}/", base_path),
        };

        let mut sorted_params = query.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut out_headers: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out_headers.push(("authorization".to_string(), authorization));

        SignedRequest {
            url,
            headers: out_headers,
        }
    }

    fn request(&self, method: reqwest::Method, signed: &SignedRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, &signed.url);
        for (k, v) in &signed.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        builder
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, locator: &ObjectLocator) -> Result<Vec<u8>> {
        let bytes = self
            .retry
            .run("s3.get", || async {
                let signed = self.sign("GET", &locator.bucket, Some(&locator.name), &[], b"");
                let resp =
                    error::send_checked(SERVICE, self.request(reqwest::Method::GET, &signed))
                        .await?;
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::transport(SERVICE, e))?;
                Ok::<_, anyhow::Error>(bytes.to_vec())
            })
            .await
            .with_context(|| format!("S3 GetObject failed for s3://{}", locator))?;
        Ok(bytes)
    }

    async fn put(&self, locator: &ObjectLocator, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.retry
            .run("s3.put", || async {
                let signed = self.sign("PUT", &locator.bucket, Some(&locator.name), &[], &body);
                let req = self
                    .request(reqwest::Method::PUT, &signed)
                    .header("content-type", content_type)
                    .body(body.clone());
                error::send_checked(SERVICE, req).await?;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .with_context(|| format!("S3 PutObject failed for s3://{}", locator))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let xml_body = self
                .retry
                .run("s3.list", || async {
                    let signed = self.sign("GET", bucket, None, &query, b"");
                    let resp =
                        error::send_checked(SERVICE, self.request(reqwest::Method::GET, &signed))
                            .await?;
                    let text = resp
                        .text()
                        .await
                        .map_err(|e| ServiceError::transport(SERVICE, e))?;
                    Ok::<_, anyhow::Error>(text)
                })
                .await
                .with_context(|| format!("S3 ListObjectsV2 failed for s3://{}/{}", bucket, prefix))?;

            let page = parse_list_objects_response(&xml_body);
            names.extend(page.keys);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn remote_uri(&self, locator: &ObjectLocator) -> Option<String> {
        Some(format!("s3://{}/{}", locator.bucket, locator.name))
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ ListObjectsV2 parsing ============

struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_list_objects_response(xml: &str) -> ListPage {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            // Directory placeholders
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(unescape_xml(&key));
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    ListPage {
        keys,
        is_truncated,
        next_token,
    }
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c~"), "a%20b%2Fc~");
        assert_eq!(uri_encode("file.pdf"), "file.pdf");
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        // Reference values from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_parse_list_objects_response() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <NextContinuationToken>tok</NextContinuationToken>
            <Contents><Key>ocr/a/0.json</Key><Size>10</Size></Contents>
            <Contents><Key>ocr/</Key><Size>0</Size></Contents>
            <Contents><Key>ocr/a&amp;b.json</Key><Size>3</Size></Contents>
        </ListBucketResult>"#;
        let page = parse_list_objects_response(xml);
        assert_eq!(page.keys, vec!["ocr/a/0.json", "ocr/a&b.json"]);
        assert!(page.is_truncated);
        assert_eq!(page.next_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_locator_child() {
        let loc = ObjectLocator::new("tmp", "ocr/");
        assert_eq!(loc.child("in/doc.pdf").name, "ocr/in/doc.pdf");
        let root = ObjectLocator::new("tmp", "");
        assert_eq!(root.child("x").name, "x");
    }

    #[test]
    fn test_local_rejects_traversal() {
        let store = LocalObjectStore::new("/tmp/root");
        assert!(store.path_for(&ObjectLocator::new("b", "../etc/passwd")).is_err());
        assert!(store.path_for(&ObjectLocator::new("b", "/abs")).is_err());
        assert!(store.path_for(&ObjectLocator::new("b", "ok/name.pdf")).is_ok());
    }

    #[tokio::test]
    async fn test_local_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let loc = ObjectLocator::new("out", "nested/data.jsonl");
        store.put(&loc, b"one".to_vec(), "application/jsonl").await.unwrap();
        store.put(&loc, b"two".to_vec(), "application/jsonl").await.unwrap();
        assert_eq!(store.get(&loc).await.unwrap(), b"two");

        store
            .put(&ObjectLocator::new("out", "other.txt"), b"x".to_vec(), "text/plain")
            .await
            .unwrap();
        assert_eq!(
            store.list("out", "").await.unwrap(),
            vec!["nested/data.jsonl", "other.txt"]
        );
        assert_eq!(store.list("out", "nested/").await.unwrap(), vec!["nested/data.jsonl"]);
        assert!(store.list("missing", "").await.unwrap().is_empty());
    }
}
