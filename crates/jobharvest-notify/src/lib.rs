//! Best-effort run notifications delivered to a fixed recipient list.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobharvest-notify";

/// Delivers a subject/body message. Implementations never fail the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn notify(&self, subject: &str, body: &str) {
        (**self).notify(subject, body).await
    }
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, subject: &str, _body: &str) {
        info!(subject, "notifications disabled; skipping");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

/// Keeps every message in memory; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Notification {
                subject: subject.to_string(),
                body: body.to_string(),
            });
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no recipients configured")]
    NoRecipients,
    #[error("mail relay request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail relay returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct MailRelayOptions {
    pub endpoint: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

/// JSON body accepted by the mail relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage<'a> {
    pub from: &'a str,
    pub to: &'a [String],
    pub subject: &'a str,
    pub text: &'a str,
}

/// Sends plain-text mail through an HTTP relay endpoint.
#[derive(Debug, Clone)]
pub struct MailRelayNotifier {
    options: MailRelayOptions,
    client: reqwest::Client,
}

impl MailRelayNotifier {
    pub fn new(options: MailRelayOptions) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;
        Ok(Self { options, client })
    }

    pub fn message<'a>(&'a self, subject: &'a str, body: &'a str) -> MailMessage<'a> {
        MailMessage {
            from: &self.options.sender,
            to: &self.options.recipients,
            subject,
            text: body,
        }
    }

    pub async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        if self.options.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }

        let mut request = self
            .client
            .post(&self.options.endpoint)
            .json(&self.message(subject, body));
        if let Some(token) = &self.options.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MailRelayNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        match self.send(subject, body).await {
            Ok(()) => info!(
                subject,
                recipients = %self.options.recipients.join(", "),
                "notification sent"
            ),
            Err(NotifyError::NoRecipients) => {
                warn!(subject, "notification skipped: no recipients configured")
            }
            Err(err) => error!(subject, error = %err, "failed to send notification"),
        }
    }
}
