//! Alert delivery over the webhook transport.
//!
//! Retries transient failures (5xx, 429) with exponential backoff and
//! honors Retry-After; permanent failures (malformed payload 4xx) are
//! logged with request/response snippets and surfaced as failed. The
//! per-channel minimum interval is enforced here; the per-cycle cap is
//! the orchestrator's.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::embed::attachments_consistent;
use crate::models::AlertArtifact;

#[derive(Debug)]
pub enum DeliveryError {
    /// 5xx, 429 or transport-level failure; worth retrying.
    Retryable {
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: String,
    },
    /// Well-formed request rejected (4xx): do not retry.
    Permanent { status: u16, body_snippet: String },
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(
        &self,
        payload_json: &Value,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Multipart webhook transport: one `payload_json` part plus one file
/// part per attachment, positionally aligned with the declared ids.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("catalyst-bot/0.1 (alerts)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertTransport for WebhookTransport {
    async fn deliver(
        &self,
        payload_json: &Value,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut form = reqwest::multipart::Form::new().text(
            "payload_json",
            serde_json::to_string(payload_json).unwrap_or_default(),
        );
        for (idx, (filename, bytes)) in files.into_iter().enumerate() {
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(filename)
                .mime_str("image/png")
                .map_err(|e| DeliveryError::Retryable {
                    status: None,
                    retry_after: None,
                    message: e.to_string(),
                })?;
            form = form.part(format!("files[{idx}]"), part);
        }

        let resp = self
            .client
            .post(&self.url)
            .query(&[("wait", "true")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                status: None,
                retry_after: None,
                message: e.to_string(),
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64);
        let body = resp.text().await.unwrap_or_default();

        if status.is_success() {
            let message_id = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .map(|id| match id {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            return Ok(DeliveryReceipt { message_id });
        }

        let snippet: String = body.chars().take(500).collect();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(DeliveryError::Retryable {
                status: Some(status.as_u16()),
                retry_after,
                message: snippet,
            })
        } else {
            Err(DeliveryError::Permanent {
                status: status.as_u16(),
                body_snippet: snippet,
            })
        }
    }
}

/// Dry-run transport: logs the payload instead of posting. Used when no
/// webhook is configured so the rest of the pipeline stays exercised.
pub struct LoggingTransport;

#[async_trait]
impl AlertTransport for LoggingTransport {
    async fn deliver(
        &self,
        payload_json: &Value,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        info!(
            files = files.len(),
            payload = %payload_json,
            "Alert (dry-run, no webhook configured)"
        );
        Ok(DeliveryReceipt { message_id: None })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Delivered { message_id: Option<String> },
    /// Retries exhausted on transient failures; retry next cycle.
    FailedTransient,
    /// Non-retryable; the item is terminally failed.
    FailedPermanent,
}

pub struct Dispatcher {
    transport: std::sync::Arc<dyn AlertTransport>,
    last_sent: Mutex<Option<Instant>>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl Dispatcher {
    pub fn new(transport: std::sync::Arc<dyn AlertTransport>) -> Self {
        Self {
            transport,
            last_sent: Mutex::new(None),
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, base: Duration, max_attempts: u32) -> Self {
        self.backoff_base = base;
        self.max_attempts = max_attempts;
        self
    }

    /// Deliver one artifact, waiting out the per-channel interval first.
    pub async fn dispatch(&self, artifact: &AlertArtifact, min_interval_ms: u64) -> DispatchStatus {
        if !attachments_consistent(artifact) {
            // A mismatched declaration would post fine and silently drop
            // files; treat it as a builder bug, not a delivery problem.
            error!(key = %artifact.idempotency_key, "Attachment declaration mismatch");
            return DispatchStatus::FailedPermanent;
        }

        self.wait_for_slot(Duration::from_millis(min_interval_ms))
            .await;

        let files = match self.read_files(artifact) {
            Ok(files) => files,
            Err(e) => {
                error!(key = %artifact.idempotency_key, error = %e, "Attachment file unreadable");
                return DispatchStatus::FailedPermanent;
            }
        };
        let payload = artifact.payload_json();

        let mut backoff = self.backoff_base;
        for attempt in 1..=self.max_attempts {
            match self.transport.deliver(&payload, files.clone()).await {
                Ok(receipt) => {
                    *self.last_sent.lock() = Some(Instant::now());
                    info!(
                        key = %artifact.idempotency_key,
                        message_id = receipt.message_id.as_deref().unwrap_or("-"),
                        attempt,
                        "Alert delivered"
                    );
                    return DispatchStatus::Delivered {
                        message_id: receipt.message_id,
                    };
                }
                Err(DeliveryError::Permanent {
                    status,
                    body_snippet,
                }) => {
                    error!(
                        key = %artifact.idempotency_key,
                        status,
                        body = %body_snippet,
                        payload = %payload,
                        "Alert rejected permanently"
                    );
                    return DispatchStatus::FailedPermanent;
                }
                Err(DeliveryError::Retryable {
                    status,
                    retry_after,
                    message,
                }) => {
                    warn!(
                        key = %artifact.idempotency_key,
                        status = status.unwrap_or(0),
                        attempt,
                        error = %message,
                        "Alert delivery failed; will retry"
                    );
                    if attempt == self.max_attempts {
                        break;
                    }
                    let wait = retry_after.unwrap_or(backoff);
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                }
            }
        }
        DispatchStatus::FailedTransient
    }

    async fn wait_for_slot(&self, min_interval: Duration) {
        if min_interval.is_zero() {
            return;
        }
        let wait = {
            let last = self.last_sent.lock();
            last.map(|at| min_interval.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Honoring alert interval");
            tokio::time::sleep(wait).await;
        }
    }

    fn read_files(&self, artifact: &AlertArtifact) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::with_capacity(artifact.files.len());
        for (decl, path) in artifact.attachments.iter().zip(&artifact.files) {
            anyhow::ensure!(
                path.is_absolute(),
                "attachment path not absolute: {}",
                path.display()
            );
            let bytes = std::fs::read(path)?;
            files.push((decl.filename.clone(), bytes));
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachmentDecl;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    struct ScriptedTransport {
        // Pop-front script of responses.
        script: PlMutex<Vec<Result<DeliveryReceipt, DeliveryError>>>,
        calls: PlMutex<Vec<Value>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<DeliveryReceipt, DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                script: PlMutex::new(script),
                calls: PlMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AlertTransport for ScriptedTransport {
        async fn deliver(
            &self,
            payload_json: &Value,
            _files: Vec<(String, Vec<u8>)>,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            self.calls.lock().push(payload_json.clone());
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(DeliveryReceipt { message_id: None })
            } else {
                script.remove(0)
            }
        }
    }

    fn artifact_with_file(dir: &std::path::Path) -> AlertArtifact {
        let chart = dir.join("chart.png");
        std::fs::write(&chart, b"png").unwrap();
        AlertArtifact {
            embed: serde_json::json!({
                "title": "x",
                "image": {"url": "attachment://chart.png"}
            }),
            attachments: vec![AttachmentDecl {
                id: 0,
                filename: "chart.png".to_string(),
                description: "Chart".to_string(),
            }],
            files: vec![chart],
            components: None,
            idempotency_key: "k1".to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_and_reports_message_id() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![Ok(DeliveryReceipt {
            message_id: Some("123".to_string()),
        })]);
        let dispatcher = Dispatcher::new(transport.clone());
        let status = dispatcher.dispatch(&artifact_with_file(dir.path()), 0).await;
        assert_eq!(
            status,
            DispatchStatus::Delivered {
                message_id: Some("123".to_string())
            }
        );
        // Payload carried the attachments declaration.
        let payload = &transport.calls.lock()[0];
        assert_eq!(payload["attachments"][0]["filename"], "chart.png");
    }

    #[tokio::test]
    async fn retries_on_transient_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            Err(DeliveryError::Retryable {
                status: Some(503),
                retry_after: None,
                message: "unavailable".to_string(),
            }),
            Err(DeliveryError::Retryable {
                status: Some(429),
                retry_after: Some(Duration::from_millis(5)),
                message: "limited".to_string(),
            }),
            Ok(DeliveryReceipt { message_id: None }),
        ]);
        let dispatcher =
            Dispatcher::new(transport.clone()).with_backoff(Duration::from_millis(1), 4);
        let status = dispatcher.dispatch(&artifact_with_file(dir.path()), 0).await;
        assert!(matches!(status, DispatchStatus::Delivered { .. }));
        assert_eq!(transport.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![Err(DeliveryError::Permanent {
            status: 400,
            body_snippet: "bad payload".to_string(),
        })]);
        let dispatcher =
            Dispatcher::new(transport.clone()).with_backoff(Duration::from_millis(1), 4);
        let status = dispatcher.dispatch(&artifact_with_file(dir.path()), 0).await;
        assert_eq!(status, DispatchStatus::FailedPermanent);
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let always_down = || {
            Err(DeliveryError::Retryable {
                status: Some(500),
                retry_after: None,
                message: "down".to_string(),
            })
        };
        let transport =
            ScriptedTransport::new(vec![always_down(), always_down(), always_down()]);
        let dispatcher =
            Dispatcher::new(transport.clone()).with_backoff(Duration::from_millis(1), 3);
        let status = dispatcher.dispatch(&artifact_with_file(dir.path()), 0).await;
        assert_eq!(status, DispatchStatus::FailedTransient);
        assert_eq!(transport.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn relative_attachment_path_is_rejected() {
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = Dispatcher::new(transport.clone());
        let mut artifact = AlertArtifact {
            embed: serde_json::json!({"image": {"url": "attachment://c.png"}}),
            attachments: vec![AttachmentDecl {
                id: 0,
                filename: "c.png".to_string(),
                description: "Chart".to_string(),
            }],
            files: vec![std::path::PathBuf::from("relative/c.png")],
            components: None,
            idempotency_key: "k2".to_string(),
        };
        let status = dispatcher.dispatch(&artifact, 0).await;
        assert_eq!(status, DispatchStatus::FailedPermanent);
        assert!(transport.calls.lock().is_empty());
        // And an undeclared reference is caught before any delivery.
        artifact.attachments.clear();
        artifact.files.clear();
        let status = dispatcher.dispatch(&artifact, 0).await;
        assert_eq!(status, DispatchStatus::FailedPermanent);
    }
}
