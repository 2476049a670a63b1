//! Failure classification for calls to external services.
//!
//! Call sites return `anyhow::Result` like everything else; a
//! [`ServiceError`] sits at the root of the chain when the failure came from
//! a remote service, so the retry policy can decide whether another attempt
//! is worthwhile.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service answered with a non-success HTTP status.
    #[error("{service} returned HTTP {status}: {body}")]
    Http {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The request never produced a response (connect, TLS, reset...).
    #[error("{service} request failed: {message}")]
    Transport {
        service: &'static str,
        message: String,
    },

    /// The service answered, but the reply could not be understood.
    #[error("{service} response could not be parsed: {message}")]
    Parse {
        service: &'static str,
        message: String,
    },

    #[error("{service} did not finish within {secs}s")]
    Timeout { service: &'static str, secs: u64 },
}

impl ServiceError {
    /// Rate limits, server errors, transport failures, unparseable replies
    /// and timeouts are worth another attempt; other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Http { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Transport { .. } => true,
            ServiceError::Parse { .. } => true,
            ServiceError::Timeout { .. } => true,
        }
    }

    pub fn http(service: &'static str, status: reqwest::StatusCode, body: String) -> Self {
        ServiceError::Http {
            service,
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        }
    }

    pub fn transport(service: &'static str, err: reqwest::Error) -> Self {
        ServiceError::Transport {
            service,
            message: err.to_string(),
        }
    }

    pub fn parse(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Parse {
            service,
            message: message.into(),
        }
    }
}

/// Whether an error chain is worth retrying.
///
/// Errors without a [`ServiceError`] anywhere in the chain (I/O on local
/// files, serialization bugs) are not retried.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|e| e.downcast_ref::<ServiceError>())
        .map(ServiceError::is_retryable)
        .unwrap_or(false)
}

/// Send a prepared request, mapping transport failures and non-success
/// statuses to [`ServiceError`].
pub async fn send_checked(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ServiceError> {
    let response = request
        .send()
        .await
        .map_err(|e| ServiceError::transport(service, e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::http(service, status, body))
}

/// Read a JSON body, mapping decode failures to [`ServiceError::Parse`].
pub async fn read_json(
    service: &'static str,
    response: reqwest::Response,
) -> Result<serde_json::Value, ServiceError> {
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ServiceError::parse(service, e.to_string()))
}
