//! Webhook alert delivery.

use std::time::Duration;

use async_trait::async_trait;

use cisindex_core::error::IndexerError;
use cisindex_core::notify::{Alert, Notifier};

/// POSTs every alert as JSON to a fixed URL. Delivery failures are logged
/// and otherwise ignored.
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| IndexerError::Config(format!("webhook client: {e}")))?;
        Ok(Self { url: url.into(), http })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: Alert) {
        tracing::error!(stage = %alert.stage, height = ?alert.height, "{}", alert.message);
        match self.http.post(&self.url).json(&alert).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(url = %self.url, status = resp.status().as_u16(), "webhook rejected alert");
            }
            Err(e) => tracing::warn!(url = %self.url, error = %e, "webhook delivery failed"),
        }
    }
}
