//! Operator notifications
//!
//! Telegram delivery, fire-and-forget: failures are logged and never
//! block trading logic. With no credentials configured the notifier
//! degrades to log-only.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Fire-and-forget operator channel
pub struct Notifier {
    client: Client,
    credentials: Option<(String, String)>,
}

impl Notifier {
    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`; missing
    /// variables disable delivery rather than erroring.
    pub fn from_env() -> Self {
        let credentials = match (
            std::env::var("TELEGRAM_BOT_TOKEN"),
            std::env::var("TELEGRAM_CHAT_ID"),
        ) {
            (Ok(token), Ok(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some((token, chat_id))
            }
            _ => {
                info!("telegram credentials not set, notifications are log-only");
                None
            }
        };
        Self::new(credentials)
    }

    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            credentials,
        }
    }

    /// Deliver `message` to the operator. Never fails the caller.
    pub async fn notify(&self, message: &str) {
        info!(message, "operator notification");

        let Some((token, chat_id)) = &self.credentials else {
            return;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = json!({ "chat_id": chat_id, "text": message });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "telegram rejected notification");
            }
            Err(e) => warn!(error = %e, "failed to deliver notification"),
            Ok(_) => {}
        }
    }

    /// Critical escalation: same channel, louder prefix. Used for states
    /// that require manual intervention (unprotected position, failed
    /// close).
    pub async fn alert(&self, message: &str) {
        self.notify(&format!("CRITICAL: {message}")).await;
    }
}
