//! Application configuration loaded from the environment.

use kolwatch_alerts::DEFAULT_SMTP_HOST;
use kolwatch_core::{AddressBook, AddressError};
use kolwatch_feeds::RpcEndpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Maximum number of numbered mail accounts (`EMAIL_USER_1..N`).
pub const MAX_MAIL_ACCOUNTS: usize = 3;

/// Fatal configuration problems. The process exits before subscribing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No valid watched addresses in KOL_ADDRESSES")]
    NoAddresses,

    #[error("No delivery channel configured (set TELEGRAM_BOT_TOKEN + TELEGRAM_CHAT_IDS or EMAIL_USER_1 + EMAIL_TO)")]
    NoChannels,

    #[error("No RPC endpoint configured")]
    NoRpcEndpoint,

    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Telegram alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: String,
    /// Chat ids that receive alerts
    pub chat_ids: Vec<String>,
    /// Chat id for status notifications (optional)
    pub status_chat_id: Option<String>,
}

/// One SMTP account.
#[derive(Clone, Serialize, Deserialize)]
pub struct MailAccount {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for MailAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailAccount")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Mail alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSettings {
    pub smtp_host: String,
    /// Sender accounts in failover order
    pub accounts: Vec<MailAccount>,
    pub recipients: Vec<String>,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            smtp_host: DEFAULT_SMTP_HOST.to_string(),
            accounts: Vec::new(),
            recipients: Vec::new(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Watched wallets
    pub address_book: AddressBook,
    /// RPC endpoints, preferred first
    pub rpc_endpoints: Vec<RpcEndpoint>,
    pub telegram: Option<TelegramSettings>,
    pub mail: Option<MailSettings>,
}

impl AppConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for each key. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let raw_addresses = get("KOL_ADDRESSES").unwrap_or_default();
        let (address_book, errors) = AddressBook::parse_list(&raw_addresses);
        for error in &errors {
            match error {
                AddressError::MalformedEntry(entry) => {
                    warn!(entry = %entry, "Skipping malformed KOL_ADDRESSES entry")
                }
                AddressError::InvalidPublicKey(key) => {
                    warn!(key = %key, "Skipping watched address with invalid public key")
                }
            }
        }
        if address_book.is_empty() {
            return Err(ConfigError::NoAddresses);
        }

        let rpc_endpoints = rpc_endpoints(&get);
        if rpc_endpoints.is_empty() {
            return Err(ConfigError::NoRpcEndpoint);
        }

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_IDS")) {
            (Some(bot_token), chat_ids) => Some(TelegramSettings {
                bot_token,
                chat_ids: split_list(chat_ids.as_deref().unwrap_or_default()),
                status_chat_id: get("TELEGRAM_STATUS_CHAT_ID"),
            }),
            (None, Some(_)) => {
                warn!("TELEGRAM_CHAT_IDS set without TELEGRAM_BOT_TOKEN, chat delivery disabled");
                None
            }
            (None, None) => None,
        };

        let accounts: Vec<MailAccount> = (1..=MAX_MAIL_ACCOUNTS)
            .filter_map(|n| {
                let user = get(&format!("EMAIL_USER_{n}"))?;
                match get(&format!("EMAIL_PASS_{n}")) {
                    Some(password) => Some(MailAccount { user, password }),
                    None => {
                        warn!(account = %user, "Mail account has no password, skipping");
                        None
                    }
                }
            })
            .collect();
        let mail = if accounts.is_empty() {
            None
        } else {
            Some(MailSettings {
                smtp_host: get("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
                accounts,
                recipients: split_list(&get("EMAIL_TO").unwrap_or_default()),
            })
        };

        let config = Self {
            address_book,
            rpc_endpoints,
            telegram,
            mail,
        };
        if !config.has_chat() && !config.has_mail() {
            return Err(ConfigError::NoChannels);
        }
        Ok(config)
    }

    pub fn has_chat(&self) -> bool {
        self.telegram
            .as_ref()
            .map_or(false, |t| !t.chat_ids.is_empty())
    }

    pub fn has_mail(&self) -> bool {
        self.mail
            .as_ref()
            .map_or(false, |m| !m.accounts.is_empty() && !m.recipients.is_empty())
    }
}

/// Preferred pair, then `RPC_FALLBACKS`, then the public mainnet node.
fn rpc_endpoints(get: &impl Fn(&str) -> Option<String>) -> Vec<RpcEndpoint> {
    let mut endpoints = Vec::new();
    if let Some(http) = get("RPC_ENDPOINT") {
        endpoints.push(match get("WS_ENDPOINT") {
            Some(ws) => RpcEndpoint::new(http, ws),
            None => RpcEndpoint::from_http(&http),
        });
    }
    if let Some(fallbacks) = get("RPC_FALLBACKS") {
        endpoints.extend(split_list(&fallbacks).iter().map(|e| RpcEndpoint::parse(e)));
    }
    endpoints.push(RpcEndpoint::public_mainnet());
    endpoints
}

/// Split a comma-separated list, dropping empty items.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
