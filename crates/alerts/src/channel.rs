//! Delivery endpoints and their advisory health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Chat,
    Mail,
}

/// Health is advisory: it orders endpoints, it never excludes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A chat id or a mail sender account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    pub kind: ChannelKind,
    pub address: String,
    pub health: ChannelHealth,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl ChannelEndpoint {
    pub fn chat(chat_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Chat, chat_id)
    }

    pub fn mail(account: impl Into<String>) -> Self {
        Self::new(ChannelKind::Mail, account)
    }

    fn new(kind: ChannelKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            health: ChannelHealth::Unknown,
            last_attempt: None,
        }
    }

    pub fn record_success(&mut self) {
        self.health = ChannelHealth::Healthy;
        self.last_attempt = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.health = ChannelHealth::Unhealthy;
        self.last_attempt = Some(Utc::now());
    }
}
