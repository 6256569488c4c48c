//! Telegram chat delivery.

use crate::DeliveryError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, Recipient};
use tracing::debug;

/// Equivalent Bot API hosts, tried in order when one is unreachable.
pub const TELEGRAM_FRONT_DOORS: &[&str] = &[
    "https://api.telegram.org",
    "https://api1.telegram.org",
    "https://api2.telegram.org",
    "https://api3.telegram.org",
    "https://api4.telegram.org",
    "https://api5.telegram.org",
    "https://api6.telegram.org",
    "https://api7.telegram.org",
    "https://api8.telegram.org",
];

/// Sends chat messages through one of several equivalent front doors.
#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Number of front doors available.
    fn front_doors(&self) -> usize;

    /// Send `text` (HTML) to `chat_id` via front door `front_door`.
    /// Returns the message id.
    async fn send_message(
        &self,
        front_door: usize,
        chat_id: &str,
        text: &str,
    ) -> Result<String, DeliveryError>;
}

/// `ChatSender` backed by the Telegram Bot API.
pub struct TelegramChatSender {
    bots: Vec<(String, Bot)>,
}

impl TelegramChatSender {
    /// Sender using every default front door.
    pub fn new(token: &str) -> Result<Self, DeliveryError> {
        Self::with_front_doors(token, TELEGRAM_FRONT_DOORS.iter().copied())
    }

    pub fn with_front_doors<'a>(
        token: &str,
        front_doors: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, DeliveryError> {
        let mut bots = Vec::new();
        for door in front_doors {
            let url = url::Url::parse(door)
                .map_err(|e| DeliveryError::Rejected(format!("invalid front door {door}: {e}")))?;
            bots.push((door.to_string(), Bot::new(token).set_api_url(url)));
        }
        if bots.is_empty() {
            return Err(DeliveryError::NotConfigured("telegram front doors"));
        }
        Ok(Self { bots })
    }

    /// Check the token against the first front door.
    pub async fn verify(&self) -> Result<String, DeliveryError> {
        let (_, bot) = &self.bots[0];
        let me = bot.get_me().await?;
        Ok(me.username().to_string())
    }
}

/// Numeric ids address chats directly; anything else is a `@channel` name.
fn recipient(chat_id: &str) -> Recipient {
    match chat_id.trim().parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(chat_id.trim().to_string()),
    }
}

#[async_trait]
impl ChatSender for TelegramChatSender {
    fn front_doors(&self) -> usize {
        self.bots.len()
    }

    async fn send_message(
        &self,
        front_door: usize,
        chat_id: &str,
        text: &str,
    ) -> Result<String, DeliveryError> {
        let (door, bot) = &self.bots[front_door % self.bots.len()];
        debug!(front_door = %door, chat_id, "Sending chat message");
        let message = bot
            .send_message(recipient(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(message.id.0.to_string())
    }
}

/// In-memory `ChatSender` with scripted failures.
#[derive(Debug, Default)]
pub struct MockChatSender {
    doors: usize,
    /// chat id -> number of leading attempts that fail
    fail_first: HashMap<String, u32>,
    always_fail: Vec<String>,
    rejected: Vec<String>,
    calls: Mutex<Vec<(usize, String)>>,
    next_id: AtomicU32,
}

impl MockChatSender {
    pub fn new(front_doors: usize) -> Self {
        Self {
            doors: front_doors.max(1),
            ..Default::default()
        }
    }

    /// Fail the first `attempts` sends to `chat_id` with a transport error.
    pub fn fail_first(mut self, chat_id: &str, attempts: u32) -> Self {
        self.fail_first.insert(chat_id.to_string(), attempts);
        self
    }

    /// Fail every send to `chat_id` with a transport error.
    pub fn always_fail(mut self, chat_id: &str) -> Self {
        self.always_fail.push(chat_id.to_string());
        self
    }

    /// Reject every send to `chat_id` with a permanent error.
    pub fn reject(mut self, chat_id: &str) -> Self {
        self.rejected.push(chat_id.to_string());
        self
    }

    /// (front door, chat id) of every attempt, in order.
    pub fn calls(&self) -> Vec<(usize, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn attempts_for(&self, chat_id: &str) -> usize {
        self.calls().iter().filter(|(_, c)| c == chat_id).count()
    }
}

#[async_trait]
impl ChatSender for MockChatSender {
    fn front_doors(&self) -> usize {
        self.doors
    }

    async fn send_message(
        &self,
        front_door: usize,
        chat_id: &str,
        _text: &str,
    ) -> Result<String, DeliveryError> {
        let previous = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| DeliveryError::Transport("mock poisoned".to_string()))?;
            let previous = calls.iter().filter(|(_, c)| c == chat_id).count() as u32;
            calls.push((front_door, chat_id.to_string()));
            previous
        };

        if self.rejected.iter().any(|c| c == chat_id) {
            return Err(DeliveryError::Rejected("Bad Request: chat not found".to_string()));
        }
        if self.always_fail.iter().any(|c| c == chat_id) {
            return Err(DeliveryError::Transport("connection reset".to_string()));
        }
        if previous < self.fail_first.get(chat_id).copied().unwrap_or(0) {
            return Err(DeliveryError::Transport("connection reset".to_string()));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_recipient_parsing() {
        assert_eq!(recipient("-1001234567890"), Recipient::Id(ChatId(-1001234567890)));
        assert_eq!(
            recipient("@kol_alerts"),
            Recipient::ChannelUsername("@kol_alerts".to_string())
        );
    }

    #[test]
    fn test_sender_builds_one_bot_per_front_door() {
        let sender = TelegramChatSender::new("123456:TEST").unwrap();
        assert_eq!(sender.front_doors(), TELEGRAM_FRONT_DOORS.len());

        let err = TelegramChatSender::with_front_doors("123456:TEST", []).err();
        assert!(matches!(err, Some(DeliveryError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_mock_fail_first() {
        let sender = MockChatSender::new(3).fail_first("42", 2);

        assert!(sender.send_message(0, "42", "hi").await.is_err());
        assert!(sender.send_message(1, "42", "hi").await.is_err());
        assert!(sender.send_message(2, "42", "hi").await.is_ok());
        assert_eq!(sender.attempts_for("42"), 3);
    }
}
