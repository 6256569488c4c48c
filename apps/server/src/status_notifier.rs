//! Status notifier for monitor lifecycle events.
//!
//! Sends Telegram notifications to an optional status chat:
//! - Monitor start and stop
//! - Connection loss and endpoint rotation
//! - Reconnection after a failure

use kolwatch_alerts::{escape_html, ChatSender, DeliveryError};
use kolwatch_core::RetryPolicy;
use kolwatch_feeds::MonitorEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Status event types for notification.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Monitor started watching `addresses` wallets
    Started { addresses: usize },
    /// Connection lifecycle event from the subscription manager
    Monitor(MonitorEvent),
    /// Shutdown requested
    Stopping,
}

/// Configuration for status notifications.
#[derive(Debug, Clone)]
pub struct StatusNotifierConfig {
    /// Telegram chat ID to send notifications to
    pub chat_id: String,
    /// Whether to send notifications for the first connection
    pub notify_on_connect: bool,
    /// Whether to send notifications on rotation events
    pub notify_on_rotation: bool,
    /// Send attempts per notification (front door rotates between attempts)
    pub retry: RetryPolicy,
}

impl StatusNotifierConfig {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            notify_on_connect: false, // Usually too noisy
            notify_on_rotation: true,
            retry: RetryPolicy::fixed(3, Duration::from_secs(2)),
        }
    }
}

/// Status notifier that sends Telegram messages for lifecycle events.
pub struct StatusNotifier {
    config: StatusNotifierConfig,
    chat: Arc<dyn ChatSender>,
    hostname: String,
}

impl StatusNotifier {
    /// Create a new status notifier.
    pub fn new(config: StatusNotifierConfig, chat: Arc<dyn ChatSender>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            config,
            chat,
            hostname,
        }
    }

    /// Message body for `event`, or `None` if it is filtered out.
    pub fn message(&self, event: &StatusEvent) -> Option<String> {
        let message = match event {
            StatusEvent::Started { addresses } => {
                format!("🚀 KOL monitor started\nWatching <b>{}</b> wallets", addresses)
            }
            StatusEvent::Stopping => "👋 KOL monitor stopping".to_string(),
            StatusEvent::Monitor(MonitorEvent::Connected { endpoint, subscribed }) => {
                if !self.config.notify_on_connect {
                    return None;
                }
                format!(
                    "✅ Connected to <b>{}</b>\n{} subscriptions",
                    escape_html(endpoint),
                    subscribed
                )
            }
            StatusEvent::Monitor(MonitorEvent::ConnectionLost { endpoint, reason }) => format!(
                "⚠️ Connection to <b>{}</b> lost\n{}",
                escape_html(endpoint),
                escape_html(reason)
            ),
            StatusEvent::Monitor(MonitorEvent::Rotated { endpoint, wrapped }) => {
                if !self.config.notify_on_rotation {
                    return None;
                }
                if *wrapped {
                    format!(
                        "🔁 All endpoints tried, back to preferred <b>{}</b>",
                        escape_html(endpoint)
                    )
                } else {
                    format!("🔀 Switched to <b>{}</b>", escape_html(endpoint))
                }
            }
            StatusEvent::Monitor(MonitorEvent::Reconnected { endpoint, subscribed }) => format!(
                "🔄 Reconnected to <b>{}</b>\n{} subscriptions restored",
                escape_html(endpoint),
                subscribed
            ),
        };

        // Add hostname and timestamp
        let now = chrono::Utc::now();
        Some(format!(
            "<b>{}</b>\n{}\n\n⏰ {}",
            escape_html(&self.hostname),
            message,
            now.format("%Y-%m-%d %H:%M:%S UTC")
        ))
    }

    /// Send a status notification.
    pub async fn notify(&self, event: &StatusEvent) {
        let Some(message) = self.message(event) else {
            return;
        };

        if let Err(e) = self.send(&message).await {
            error!(error = %e, "Failed to send status notification");
        }
    }

    async fn send(&self, message: &str) -> Result<String, DeliveryError> {
        let doors = self.chat.front_doors().max(1);
        let chat_id = self.config.chat_id.as_str();
        self.config
            .retry
            .run(
                |attempt| {
                    let door = (attempt as usize - 1) % doors;
                    self.chat.send_message(door, chat_id, message)
                },
                DeliveryError::is_transient,
            )
            .await
            .result
    }
}

/// Shared status notifier handle for sending events from multiple tasks.
#[derive(Clone)]
pub struct StatusNotifierHandle {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusNotifierHandle {
    /// Send a status event.
    pub async fn send(&self, event: StatusEvent) {
        if let Err(e) = self.tx.send(event).await {
            warn!(error = %e, "Failed to send status event");
        }
    }

    /// Forward monitor events until the sender side closes.
    pub fn forward(&self, mut events: mpsc::Receiver<MonitorEvent>) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handle.send(StatusEvent::Monitor(event)).await;
            }
        })
    }
}

/// Start the status notifier background task.
/// Returns a handle that can be cloned and used to send events.
pub fn start_status_notifier(
    config: StatusNotifierConfig,
    chat: Arc<dyn ChatSender>,
) -> StatusNotifierHandle {
    let (tx, mut rx) = mpsc::channel::<StatusEvent>(100);

    let notifier = Arc::new(StatusNotifier::new(config, chat));

    tokio::spawn(async move {
        info!("Status notifier started");

        while let Some(event) = rx.recv().await {
            notifier.notify(&event).await;
        }

        info!("Status notifier stopped");
    });

    StatusNotifierHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolwatch_alerts::MockChatSender;
    use pretty_assertions::assert_eq;

    fn notifier(chat: Arc<MockChatSender>) -> StatusNotifier {
        let mut config = StatusNotifierConfig::new("-100999");
        config.retry = RetryPolicy::immediate(3);
        StatusNotifier::new(config, chat)
    }

    #[test]
    fn test_connect_filtered_by_default() {
        let notifier = notifier(Arc::new(MockChatSender::new(3)));
        let event = StatusEvent::Monitor(MonitorEvent::Connected {
            endpoint: "https://rpc.example.com".to_string(),
            subscribed: 4,
        });
        assert!(notifier.message(&event).is_none());
    }

    #[test]
    fn test_message_has_hostname_and_time() {
        let notifier = notifier(Arc::new(MockChatSender::new(3)));
        let message = notifier
            .message(&StatusEvent::Monitor(MonitorEvent::Rotated {
                endpoint: "https://b.example.com".to_string(),
                wrapped: false,
            }))
            .unwrap();

        assert!(message.contains("Switched to <b>https://b.example.com</b>"));
        assert!(message.contains(" UTC"));
        assert!(message.starts_with("<b>"));
    }

    #[tokio::test]
    async fn test_notify_rotates_front_doors() {
        let chat = Arc::new(MockChatSender::new(3).fail_first("-100999", 1));
        let notifier = notifier(chat.clone());

        notifier.notify(&StatusEvent::Started { addresses: 3 }).await;

        let doors: Vec<usize> = chat.calls().iter().map(|(door, _)| *door).collect();
        assert_eq!(doors, vec![0, 1]);
    }
}
