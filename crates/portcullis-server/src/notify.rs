//! Session-start notification fan-out.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

/// A configured notification endpoint. One tagged variant per provider.
pub enum NotificationEndpoint {
    Discord(DiscordWebhook),
}

impl NotificationEndpoint {
    pub async fn notify_session_start(
        &self,
        username: &str,
        session_id: Uuid,
        destination: &str,
        remote_addr: &str,
    ) {
        match self {
            NotificationEndpoint::Discord(hook) => {
                if let Err(err) = hook
                    .notify_session_start(username, session_id, destination, remote_addr)
                    .await
                {
                    warn!(error = %err, "discord webhook delivery failed");
                }
            }
        }
    }
}

/// Posts session-start events to a Discord-compatible webhook URL.
pub struct DiscordWebhook {
    url: String,
    client: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    async fn notify_session_start(
        &self,
        username: &str,
        session_id: Uuid,
        destination: &str,
        remote_addr: &str,
    ) -> Result<(), reqwest::Error> {
        let content = format!(
            ":door: `{username}` opened a connection to `{destination}` (session `{session_id}`, from `{remote_addr}`)"
        );
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?
            .error_for_status()?;
        debug!(%session_id, "session-start notification delivered");
        Ok(())
    }
}

/// Broadcast a session-start event to every configured endpoint. Delivery is
/// fire-and-forget; a failing endpoint never affects the session.
pub fn notify_session_start(
    endpoints: Arc<Vec<NotificationEndpoint>>,
    username: String,
    session_id: Uuid,
    destination: String,
    remote_addr: String,
) {
    if endpoints.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for endpoint in endpoints.iter() {
            endpoint
                .notify_session_start(&username, session_id, &destination, &remote_addr)
                .await;
        }
    });
}
