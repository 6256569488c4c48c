//! Trade alert delivery across chat and mail channels.

use crate::channel::{ChannelEndpoint, ChannelKind};
use crate::format::AlertMessage;
use crate::mail::{MailMessage, MailSender};
use crate::market::MarketLookup;
use crate::telegram::ChatSender;
use crate::DeliveryError;
use kolwatch_core::{RetryPolicy, TradeEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Chat ids that receive every alert
    pub chat_ids: Vec<String>,
    /// Mail recipients
    pub mail_to: Vec<String>,
    /// Retry policy per chat id (front door rotates between attempts)
    pub chat_retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            chat_ids: Vec::new(),
            mail_to: Vec::new(),
            chat_retry: RetryPolicy::fixed(3, Duration::from_secs(5)),
        }
    }
}

/// Result of one endpoint's delivery.
#[derive(Debug, Clone)]
pub struct EndpointOutcome {
    pub kind: ChannelKind,
    pub address: String,
    pub attempts: u32,
    /// Message id on success, last error otherwise
    pub result: Result<String, DeliveryError>,
}

impl EndpointOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-endpoint outcomes of one `deliver` call.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub signature: String,
    pub outcomes: Vec<EndpointOutcome>,
}

impl DeliveryReport {
    fn delivered(&self, kind: ChannelKind) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.kind == kind && o.is_delivered())
    }

    /// At least one chat id received the alert.
    pub fn chat_delivered(&self) -> bool {
        self.delivered(ChannelKind::Chat)
    }

    /// One mail sender succeeded.
    pub fn mail_delivered(&self) -> bool {
        self.delivered(ChannelKind::Mail)
    }

    pub fn any_delivered(&self) -> bool {
        self.outcomes.iter().any(EndpointOutcome::is_delivered)
    }

    pub fn outcomes_for(&self, kind: ChannelKind) -> impl Iterator<Item = &EndpointOutcome> {
        self.outcomes.iter().filter(move |o| o.kind == kind)
    }
}

/// Formats trade events and delivers them with retry and failover.
///
/// Chat: every chat id is tried independently under the chat retry policy,
/// rotating front doors between attempts and starting from the last one that
/// worked. Mail: senders are tried in rotation from the last successful one
/// until one succeeds. Mail is attempted whatever the chat outcome.
pub struct NotificationRouter {
    config: RouterConfig,
    chat: Option<Arc<dyn ChatSender>>,
    mail_senders: Vec<Arc<dyn MailSender>>,
    market: Option<MarketLookup>,
    chat_endpoints: Mutex<Vec<ChannelEndpoint>>,
    mail_endpoints: Mutex<Vec<ChannelEndpoint>>,
    /// Last front door that delivered
    front_door: AtomicUsize,
    /// Last mail sender that delivered
    mail_start: AtomicUsize,
}

impl NotificationRouter {
    pub fn new(config: RouterConfig) -> Self {
        let chat_endpoints = config
            .chat_ids
            .iter()
            .map(ChannelEndpoint::chat)
            .collect();
        Self {
            config,
            chat: None,
            mail_senders: Vec::new(),
            market: None,
            chat_endpoints: Mutex::new(chat_endpoints),
            mail_endpoints: Mutex::new(Vec::new()),
            front_door: AtomicUsize::new(0),
            mail_start: AtomicUsize::new(0),
        }
    }

    pub fn with_chat(mut self, sender: Arc<dyn ChatSender>) -> Self {
        self.chat = Some(sender);
        self
    }

    pub fn with_mail_sender(mut self, sender: Arc<dyn MailSender>) -> Self {
        if let Ok(mut endpoints) = self.mail_endpoints.lock() {
            endpoints.push(ChannelEndpoint::mail(sender.account()));
        }
        self.mail_senders.push(sender);
        self
    }

    pub fn with_market_data(mut self, market: MarketLookup) -> Self {
        self.market = Some(market);
        self
    }

    pub fn has_chat(&self) -> bool {
        self.chat.is_some() && !self.config.chat_ids.is_empty()
    }

    pub fn has_mail(&self) -> bool {
        !self.mail_senders.is_empty() && !self.config.mail_to.is_empty()
    }

    /// Snapshot of every endpoint's health.
    pub fn endpoints(&self) -> Vec<ChannelEndpoint> {
        let mut all = self
            .chat_endpoints
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default();
        all.extend(
            self.mail_endpoints
                .lock()
                .map(|e| e.clone())
                .unwrap_or_default(),
        );
        all
    }

    pub fn preferred_front_door(&self) -> usize {
        self.front_door.load(Ordering::Relaxed)
    }

    pub fn preferred_mail_sender(&self) -> usize {
        self.mail_start.load(Ordering::Relaxed)
    }

    /// Render the alert for `event`, with market data when available.
    pub async fn render(&self, event: &TradeEvent) -> AlertMessage {
        let market = match &self.market {
            Some(lookup) => lookup.lookup(&event.target_asset).await,
            None => None,
        };
        AlertMessage::render(event, market.as_ref())
    }

    /// Deliver one alert for `event` to every configured channel.
    pub async fn deliver(&self, event: &TradeEvent) -> DeliveryReport {
        let message = self.render(event).await;
        let mut report = DeliveryReport {
            signature: event.signature.clone(),
            outcomes: Vec::new(),
        };

        if let Some(chat) = &self.chat {
            for chat_id in &self.config.chat_ids {
                let outcome = self.deliver_chat(chat.as_ref(), chat_id, &message.chat_html).await;
                self.record(&self.chat_endpoints, chat_id, outcome.is_delivered());
                report.outcomes.push(outcome);
            }
        }

        if self.has_mail() {
            report.outcomes.extend(self.deliver_mail(&message).await);
        }

        if report.any_delivered() {
            info!(
                signature = %event.signature,
                signer = %event.signer_name,
                chat = report.chat_delivered(),
                mail = report.mail_delivered(),
                "Alert delivered"
            );
        } else {
            error!(
                signature = %event.signature,
                signer = %event.signer_name,
                endpoints = report.outcomes.len(),
                "Alert delivery failed on every channel"
            );
        }

        report
    }

    async fn deliver_chat(&self, chat: &dyn ChatSender, chat_id: &str, html: &str) -> EndpointOutcome {
        let doors = chat.front_doors().max(1);
        let start = self.front_door.load(Ordering::Relaxed) % doors;

        let outcome = self
            .config
            .chat_retry
            .run(
                |attempt| {
                    let door = (start + attempt as usize - 1) % doors;
                    async move {
                        let result = chat.send_message(door, chat_id, html).await;
                        if let Err(e) = &result {
                            warn!(chat_id, front_door = door, attempt, error = %e, "Chat send failed");
                        }
                        result
                    }
                },
                DeliveryError::is_transient,
            )
            .await;

        if outcome.result.is_ok() {
            let door = (start + outcome.attempts as usize - 1) % doors;
            self.front_door.store(door, Ordering::Relaxed);
            debug!(chat_id, front_door = door, attempts = outcome.attempts, "Chat message sent");
        }

        EndpointOutcome {
            kind: ChannelKind::Chat,
            address: chat_id.to_string(),
            attempts: outcome.attempts,
            result: outcome.result,
        }
    }

    async fn deliver_mail(&self, message: &AlertMessage) -> Vec<EndpointOutcome> {
        let count = self.mail_senders.len();
        let start = self.mail_start.load(Ordering::Relaxed) % count;
        let mut outcomes = Vec::new();

        for offset in 0..count {
            let index = (start + offset) % count;
            let sender = &self.mail_senders[index];
            let mail = MailMessage {
                from: sender.account().to_string(),
                to: self.config.mail_to.clone(),
                subject: message.subject.clone(),
                text: message.text.clone(),
                html: message.mail_html.clone(),
            };

            let result = sender.send_mail(&mail).await;
            let delivered = result.is_ok();
            self.record(&self.mail_endpoints, sender.account(), delivered);
            match &result {
                Ok(_) => debug!(account = sender.account(), "Mail sent"),
                Err(e) => warn!(account = sender.account(), error = %e, "Mail send failed"),
            }
            outcomes.push(EndpointOutcome {
                kind: ChannelKind::Mail,
                address: sender.account().to_string(),
                attempts: 1,
                result,
            });

            if delivered {
                self.mail_start.store(index, Ordering::Relaxed);
                break;
            }
        }

        outcomes
    }

    fn record(&self, endpoints: &Mutex<Vec<ChannelEndpoint>>, address: &str, delivered: bool) {
        let Ok(mut endpoints) = endpoints.lock() else {
            return;
        };
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.address == address) {
            if delivered {
                endpoint.record_success();
            } else {
                endpoint.record_failure();
            }
        }
    }
}
