// =============================================================================
// Telegram Notifier — fire-and-forget alert delivery
// =============================================================================
//
// Sends via the Bot API when a token is configured, otherwise logs the
// message. Delivery failures are logged and never propagated; alerting is
// best-effort by design.
// =============================================================================

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

#[derive(Clone)]
pub struct TelegramNotifier {
    token: Option<String>,
    http: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// Send `message` to the user's chat without blocking the caller.
    ///
    /// The chat id is the user id here; the identity layer owns the mapping
    /// from users to Telegram chats.
    pub fn notify(&self, user_id: i64, message: String) {
        let Some(token) = self.token.clone() else {
            info!(user_id, message = %message, "telegram notification (no token, log only)");
            return;
        };

        let http = self.http.clone();
        tokio::spawn(async move {
            let url = format!("https://api.telegram.org/bot{token}/sendMessage");
            let body = json!({ "chat_id": user_id, "text": message });
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(user_id, "telegram notification sent");
                }
                Ok(resp) => {
                    warn!(user_id, status = %resp.status(), "telegram API rejected notification");
                }
                Err(e) => {
                    warn!(user_id, error = %e, "telegram notification failed");
                }
            }
        });
    }
}
