//! Extraction service boundary.
//!
//! The pipeline sends a batch of queued items and gets back findings plus
//! per-message attributions. How findings are produced is the service's
//! business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::QueuedItem;
use crate::config::ExtractionConfig;
use crate::error::ExtractionError;

/// One derived insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: String,
    pub summary: String,
    /// Messages this finding was derived from.
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Per-message verdict from the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribution {
    pub message_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of one `analyze` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub attributions: Vec<Attribution>,
}

impl Analysis {
    pub fn attribution_for(&self, message_id: &str) -> Option<&Attribution> {
        self.attributions.iter().find(|a| a.message_id == message_id)
    }

    /// Whether the service reported this message as failed. Messages
    /// without an attribution count as successful.
    pub fn failed(&self, message_id: &str) -> bool {
        self.attribution_for(message_id).is_some_and(|a| !a.success)
    }

    /// Number of findings derived from a message.
    pub fn insights_for(&self, message_id: &str) -> usize {
        self.findings
            .iter()
            .filter(|f| f.message_ids.iter().any(|id| id == message_id))
            .count()
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Analyze a batch of items belonging to one tenant.
    async fn analyze(
        &self,
        tenant_id: &str,
        items: &[QueuedItem],
    ) -> Result<Analysis, ExtractionError>;
}

// ── HTTP client ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    tenant_id: &'a str,
    messages: Vec<AnalyzeMessage<'a>>,
}

#[derive(Serialize)]
struct AnalyzeMessage<'a> {
    message_id: &'a str,
    subject: &'a str,
    body: &'a str,
    submitter: &'a str,
    received_at: DateTime<Utc>,
    priority: &'static str,
}

/// JSON-over-HTTP extractor.
pub struct HttpExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExtractionError::RequestFailed {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn error_from_response(response: reqwest::Response) -> ExtractionError {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExtractionError::AuthFailed,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(std::time::Duration::from_secs);
                ExtractionError::RateLimited { retry_after }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                ExtractionError::Status {
                    status: status.as_u16(),
                    body: body.chars().take(500).collect(),
                }
            }
        }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn analyze(
        &self,
        tenant_id: &str,
        items: &[QueuedItem],
    ) -> Result<Analysis, ExtractionError> {
        let url = format!("{}/analyze", self.base_url);
        let body = AnalyzeRequest {
            tenant_id,
            messages: items
                .iter()
                .map(|item| AnalyzeMessage {
                    message_id: &item.message_id,
                    subject: &item.subject,
                    body: &item.body,
                    submitter: &item.submitter,
                    received_at: item.received_at,
                    priority: item.priority.as_str(),
                })
                .collect(),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout
            } else {
                ExtractionError::RequestFailed {
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let analysis: Analysis = response
            .json()
            .await
            .map_err(|e| ExtractionError::InvalidResponse(e.to_string()))?;

        debug!(
            tenant_id,
            batch_size = items.len(),
            findings = analysis.findings.len(),
            "Extraction call completed"
        );
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::batch::test_item;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn extractor(url: String, key: Option<&str>) -> HttpExtractor {
        HttpExtractor::new(&ExtractionConfig {
            url,
            api_key: key.map(|k| SecretString::from(k.to_string())),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn analysis_attribution_helpers() {
        let analysis: Analysis = serde_json::from_str(
            r#"{
                "findings": [
                    {"kind": "trend", "summary": "costs up", "message_ids": ["a", "b"]},
                    {"kind": "risk", "summary": "churn", "message_ids": ["a"]}
                ],
                "attributions": [
                    {"message_id": "a", "success": true},
                    {"message_id": "b", "success": false, "error": "too short"}
                ]
            }"#,
        )
        .unwrap();
        assert!(!analysis.failed("a"));
        assert!(analysis.failed("b"));
        assert!(!analysis.failed("unlisted"));
        assert_eq!(analysis.insights_for("a"), 2);
        assert_eq!(analysis.insights_for("b"), 1);
        assert_eq!(analysis.insights_for("c"), 0);
    }

    #[test]
    fn empty_response_deserializes() {
        let analysis: Analysis = serde_json::from_str("{}").unwrap();
        assert!(analysis.findings.is_empty());
        assert!(analysis.attributions.is_empty());
    }

    #[tokio::test]
    async fn posts_batch_with_bearer_token() {
        let body = r#"{"findings":[{"kind":"k","summary":"s","message_ids":["m1"]}],"attributions":[]}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (url, server) = serve_once(response).await;
        let ex = extractor(url, Some("sekret"));

        let analysis = ex.analyze("acme", &[test_item("acme", "m1")]).await.unwrap();
        assert_eq!(analysis.insights_for("m1"), 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /analyze"));
        assert!(request.to_lowercase().contains("authorization: bearer sekret"));
        assert!(request.contains("\"tenant_id\":\"acme\""));
        assert!(request.contains("\"message_id\":\"m1\""));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_failed() {
        let (url, _server) = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let err = extractor(url, None)
            .analyze("acme", &[test_item("acme", "m1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::AuthFailed));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let (url, _server) = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let err = extractor(url, None)
            .analyze("acme", &[test_item("acme", "m1")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(7)
        ));
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let (url, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 8\r\nConnection: close\r\n\r\noverload",
        )
        .await;
        let err = extractor(url, None)
            .analyze("acme", &[test_item("acme", "m1")])
            .await
            .unwrap_err();
        match err {
            ExtractionError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overload");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_response() {
        let (url, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 5\r\nConnection: close\r\n\r\nnope!",
        )
        .await;
        let err = extractor(url, None)
            .analyze("acme", &[test_item("acme", "m1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_request_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = extractor(format!("http://{addr}"), None)
            .analyze("acme", &[test_item("acme", "m1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::RequestFailed { .. }));
    }
}
