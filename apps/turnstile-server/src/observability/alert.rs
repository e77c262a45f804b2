//! Alerting layer for tracing.
//!
//! Forwards ERROR events and IP block events (logged under
//! [`SECURITY_TARGET`]) to a console or webhook sender.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{Event, Subscriber};
use tracing_subscriber::{Layer, layer::Context};
use turnstile_core::services::SECURITY_TARGET;

/// Alert message containing event details.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub kind: AlertKind,
    pub level: String,
    pub message: String,
    pub target: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Error,
    IpBlocked,
}

impl AlertKind {
    /// Which alert, if any, an event with this level and target raises.
    pub fn classify(level: &tracing::Level, target: &str) -> Option<Self> {
        if target == SECURITY_TARGET {
            Some(AlertKind::IpBlocked)
        } else if *level == tracing::Level::ERROR {
            Some(AlertKind::Error)
        } else {
            None
        }
    }

    fn title(&self) -> &'static str {
        match self {
            AlertKind::Error => "ERROR",
            AlertKind::IpBlocked => "IP BLOCKED",
        }
    }
}

impl AlertMessage {
    /// `IP BLOCKED (WARN)`, `ERROR (ERROR)`.
    fn headline(&self) -> String {
        format!("{} ({})", self.kind.title(), self.level)
    }

    fn field_summary(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Trait for alert senders - implement this for different backends.
#[async_trait::async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, alert: AlertMessage) -> Result<(), AlertError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Failed to send alert: {0}")]
    SendError(String),
}

/// Console alert sender - writes alerts to stderr (for development).
pub struct ConsoleAlertSender;

#[async_trait::async_trait]
impl AlertSender for ConsoleAlertSender {
    async fn send(&self, alert: AlertMessage) -> Result<(), AlertError> {
        eprintln!(
            "\n[ALERT: {}]\n\
             Target: {}\n\
             Message: {}\n\
             Fields: {}\n\
             Time: {}\n",
            alert.headline(),
            alert.target,
            alert.message,
            alert.field_summary(),
            alert.timestamp
        );
        Ok(())
    }
}

/// Webhook alert sender - posts alerts to a webhook URL (Slack, Discord, etc.).
pub struct WebhookAlertSender {
    url: String,
    client: reqwest::Client,
}

impl WebhookAlertSender {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl AlertSender for WebhookAlertSender {
    async fn send(&self, alert: AlertMessage) -> Result<(), AlertError> {
        let payload = serde_json::json!({
            "text": format!(
                "*{}*\n*Target:* {}\n*Message:* {}\n*Details:* {}\n*Time:* {}",
                alert.headline(),
                alert.target,
                alert.message,
                alert.field_summary(),
                alert.timestamp
            )
        });

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|e| AlertError::SendError(e.to_string()))?;

        Ok(())
    }
}

/// Tracing layer that queues alerts for a background sender.
pub struct AlertLayer {
    sender: mpsc::Sender<AlertMessage>,
}

impl AlertLayer {
    pub fn new(alert_sender: Arc<dyn AlertSender>) -> Self {
        let (tx, mut rx) = mpsc::channel::<AlertMessage>(100);

        tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                if let Err(e) = alert_sender.send(alert).await {
                    // Logging here would feed the layer its own failure.
                    eprintln!("Failed to send alert: {}", e);
                }
            }
        });

        Self { sender: tx }
    }

    pub fn console() -> Self {
        Self::new(Arc::new(ConsoleAlertSender))
    }

    pub fn webhook(url: String) -> Self {
        Self::new(Arc::new(WebhookAlertSender::new(url)))
    }
}

/// Visitor to extract fields from events.
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let Some(kind) = AlertKind::classify(metadata.level(), metadata.target()) else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let alert = AlertMessage {
            kind,
            level: metadata.level().to_string(),
            message: visitor.message,
            target: metadata.target().to_string(),
            timestamp: chrono::Utc::now(),
            fields: visitor.fields,
        };

        // Dropped when the queue is full.
        let _ = self.sender.try_send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_events_and_errors_raise_alerts() {
        assert_eq!(
            AlertKind::classify(&tracing::Level::WARN, SECURITY_TARGET),
            Some(AlertKind::IpBlocked)
        );
        assert_eq!(
            AlertKind::classify(&tracing::Level::ERROR, "turnstile_infra::window"),
            Some(AlertKind::Error)
        );
        assert_eq!(
            AlertKind::classify(&tracing::Level::WARN, "turnstile_core::services"),
            None
        );
    }

    #[test]
    fn headline_carries_the_event_level() {
        let alert = AlertMessage {
            kind: AlertKind::IpBlocked,
            level: tracing::Level::WARN.to_string(),
            message: "IP blocked".to_string(),
            target: SECURITY_TARGET.to_string(),
            timestamp: chrono::Utc::now(),
            fields: vec![("ip".to_string(), "10.0.0.9".to_string())],
        };
        assert_eq!(alert.headline(), "IP BLOCKED (WARN)");
        assert_eq!(alert.field_summary(), "ip=10.0.0.9");
    }
}
