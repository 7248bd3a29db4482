//! Alerting boundary. Fire-and-forget; never required for correctness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Height;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

/// A single alert message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    /// Pipeline stage raising the alert.
    pub stage: String,
    pub height: Option<Height>,
    pub message: String,
}

impl Alert {
    pub fn fatal(stage: impl Into<String>, height: Option<Height>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            stage: stage.into(),
            height,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert. Implementations swallow their own errors.
    async fn notify(&self, alert: Alert);
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: Alert) {
        match alert.severity {
            Severity::Fatal => tracing::error!(
                stage = %alert.stage,
                height = ?alert.height,
                "{}",
                alert.message
            ),
            Severity::Warning => tracing::warn!(
                stage = %alert.stage,
                height = ?alert.height,
                "{}",
                alert.message
            ),
        }
    }
}
