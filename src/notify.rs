//! Outbound notification of completed jobs.
//!
//! One POST per completed job, single attempt, short timeout. Failures are
//! reported to the caller, which only logs them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::NotifyError;
use crate::pipeline::types::LeadContext;

/// Body sent to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub lead_id: Option<String>,
    pub phone: Option<String>,
    pub response: String,
}

impl NotificationPayload {
    pub fn new(context: &LeadContext, response: impl Into<String>) -> Self {
        Self {
            lead_id: context.lead_id().map(str::to_string),
            phone: context.phone(),
            response: response.into(),
        }
    }
}

/// Receiver of completed-job notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// JSON webhook notifier.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
            });
        }
        debug!(url = %self.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    /// Accept one HTTP request, reply with `status`, and hand back the body.
    async fn serve_once(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= split + 4 + length {
                        let _ = tx.send(text[split + 4..].to_string());
                        break;
                    }
                }
            }
            let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
        });

        (format!("http://{addr}/hook"), rx)
    }

    #[test]
    fn payload_shape() {
        let context = LeadContext::new("12").with_attr("phone", "+34600111222");
        let payload = NotificationPayload::new(&context, "Hi there");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"lead_id": "12", "phone": "+34600111222", "response": "Hi there"})
        );
    }

    #[test]
    fn payload_without_context_keeps_nulls() {
        let payload = NotificationPayload::new(&LeadContext::default(), "Hi");
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["lead_id"].is_null());
        assert!(json["phone"].is_null());
    }

    #[tokio::test]
    async fn posts_json_body() {
        let (url, body) = serve_once("200 OK").await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        let payload = NotificationPayload::new(&LeadContext::new("5"), "See you Tuesday");

        notifier.notify(&payload).await.unwrap();
        let received: serde_json::Value = serde_json::from_str(&body.await.unwrap()).unwrap();
        assert_eq!(received["lead_id"], "5");
        assert_eq!(received["response"], "See you Tuesday");
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let (url, _body) = serve_once("500 Internal Server Error").await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        let err = notifier
            .notify(&NotificationPayload::new(&LeadContext::default(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Status { status: 500 }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_error() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_secs(2)).unwrap();
        let err = notifier
            .notify(&NotificationPayload::new(&LeadContext::default(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)));
    }
}
