//! SMTP mail delivery.

use crate::DeliveryError;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 465;

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// One authenticated mail account.
#[async_trait]
pub trait MailSender: Send + Sync {
    /// Account the sender authenticates as.
    fn account(&self) -> &str;

    /// Send a message. Returns the server's response.
    async fn send_mail(&self, message: &MailMessage) -> Result<String, DeliveryError>;
}

/// `MailSender` over implicit-TLS SMTP.
pub struct SmtpMailSender {
    account: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailSender {
    pub fn new(host: &str, user: &str, password: &str) -> Result<Self, DeliveryError> {
        Self::with_port(host, DEFAULT_SMTP_PORT, user, password)
    }

    pub fn with_port(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Self, DeliveryError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
            .port(port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .timeout(Some(Duration::from_secs(30)))
            .build();
        Ok(Self {
            account: user.to_string(),
            transport,
        })
    }

    /// Check that the server accepts a connection.
    pub async fn verify(&self) -> Result<bool, DeliveryError> {
        Ok(self.transport.test_connection().await?)
    }
}

fn build_message(message: &MailMessage) -> Result<Message, DeliveryError> {
    if message.to.is_empty() {
        return Err(DeliveryError::NotConfigured("mail recipients"));
    }
    let mut builder = Message::builder()
        .from(message.from.parse::<Mailbox>()?)
        .subject(message.subject.clone());
    for to in &message.to {
        builder = builder.to(to.parse::<Mailbox>()?);
    }
    Ok(builder.multipart(MultiPart::alternative_plain_html(
        message.text.clone(),
        message.html.clone(),
    ))?)
}

#[async_trait]
impl MailSender for SmtpMailSender {
    fn account(&self) -> &str {
        &self.account
    }

    async fn send_mail(&self, message: &MailMessage) -> Result<String, DeliveryError> {
        let email = build_message(message)?;
        debug!(account = %self.account, recipients = message.to.len(), "Sending mail");
        let response = self.transport.send(email).await?;
        Ok(response.message().collect::<Vec<_>>().join(" "))
    }
}

/// In-memory `MailSender`.
#[derive(Debug)]
pub struct MockMailSender {
    account: String,
    fail: bool,
    sent: Mutex<Vec<MailMessage>>,
    attempts: Mutex<u32>,
}

impl MockMailSender {
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            fail: false,
            sent: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
        }
    }

    /// Every send fails with a transient SMTP error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.lock().map(|a| *a).unwrap_or_default()
    }
}

#[async_trait]
impl MailSender for MockMailSender {
    fn account(&self) -> &str {
        &self.account
    }

    async fn send_mail(&self, message: &MailMessage) -> Result<String, DeliveryError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts += 1;
        }
        if self.fail {
            return Err(DeliveryError::Mail {
                message: "421 service not available".to_string(),
                transient: true,
            });
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| DeliveryError::Transport("mock poisoned".to_string()))?;
        sent.push(message.clone());
        Ok(format!("250 OK {}", sent.len()))
    }
}
