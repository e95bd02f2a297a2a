//! Operator notifications.
//!
//! Delivery is fire-and-forget from the worker's point of view: a failed
//! message is logged and never undoes a trading decision already made.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::error::{Result, RotatorError};

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Send and swallow any failure.
pub async fn notify(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.send(text).await {
        warn!(error = %e, "Notification not delivered");
    }
}

/// Pick the sink from configuration: Telegram when fully configured, logs otherwise.
pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            match TelegramNotifier::new(token, chat_id, Duration::from_secs(config.timeout_secs)) {
                Ok(notifier) => {
                    info!("Telegram notifications enabled");
                    Arc::new(notifier)
                }
                Err(e) => {
                    warn!(error = %e, "Telegram notifier unavailable, logging messages instead");
                    Arc::new(LogNotifier)
                }
            }
        }
        _ => {
            debug!("Telegram not configured, logging messages instead");
            Arc::new(LogNotifier)
        }
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API `sendMessage`.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API_URL, token, chat_id, timeout)
    }

    pub fn with_base_url(base_url: &str, token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RotatorError::Notification(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let message = SendMessage {
            chat_id: &self.chat_id,
            text,
        };

        let resp = self
            .client
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| RotatorError::Notification(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RotatorError::Notification(format!("HTTP {status}: {body}")));
        }

        debug!("Telegram message sent");
        Ok(())
    }
}

/// Writes messages to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        info!(message = text, "Notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_telegram_posts_chat_and_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_json(serde_json::json!({ "chat_id": "42", "text": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            TelegramNotifier::with_base_url(&server.uri(), "TOKEN", "42", Duration::from_secs(5)).unwrap();
        notifier.send("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_telegram_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let notifier =
            TelegramNotifier::with_base_url(&server.uri(), "BAD", "42", Duration::from_secs(5)).unwrap();
        let err = notifier.send("hello").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_notify_swallows_failures() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Err(RotatorError::Notification("down".into())));

        // Must not panic or propagate
        notify(&mock, "trade done").await;
    }

    #[test]
    fn test_unconfigured_falls_back_to_log() {
        let config = NotifyConfig {
            telegram_token: Some("token".into()),
            telegram_chat_id: None,
            timeout_secs: 5,
        };
        // LogNotifier always succeeds
        let notifier = from_config(&config);
        let rt = tokio::runtime::Runtime::new().unwrap();
        assert!(rt.block_on(notifier.send("x")).is_ok());
    }
}
