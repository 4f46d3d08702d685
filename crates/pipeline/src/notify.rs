//! Completion notifications.
//!
//! Notifications are fire-and-forget: a failed webhook is logged and never
//! changes the outcome of a pack.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Sender name shown in the channel
pub const WEBHOOK_USERNAME: &str = "Gallery preprocessor";

/// Discord rejects embed descriptions longer than this
pub const MAX_DESCRIPTION_CHARS: usize = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, description: &str) -> Result<(), NotifyError>;
}

/// Does nothing; used when no webhook is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, title: &str, _description: &str) -> Result<(), NotifyError> {
        debug!(title, "no webhook configured, notification dropped");
        Ok(())
    }
}

/// Posts a single embed to a Discord webhook
pub struct DiscordWebhook {
    url: String,
    client: reqwest::blocking::Client,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// `{"embeds": [{"title", "description"}], "username"}`
    pub fn payload(title: &str, description: &str) -> Value {
        json!({
            "embeds": [{
                "title": title,
                "description": truncate_chars(description, MAX_DESCRIPTION_CHARS),
            }],
            "username": WEBHOOK_USERNAME,
        })
    }
}

impl Notifier for DiscordWebhook {
    fn notify(&self, title: &str, description: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(title, description))
            .send()?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}

/// Webhook notifier for a non-empty URL, [`NoopNotifier`] otherwise
pub fn notifier_for(webhook: &str) -> Box<dyn Notifier> {
    let webhook = webhook.trim();
    if webhook.is_empty() {
        return Box::new(NoopNotifier);
    }
    match DiscordWebhook::new(webhook) {
        Ok(notifier) => Box::new(notifier),
        Err(e) => {
            warn!(error = %e, "could not set up webhook client, notifications disabled");
            Box::new(NoopNotifier)
        }
    }
}

/// Send a notification, logging instead of returning any failure
pub fn notify_best_effort(notifier: &dyn Notifier, title: &str, description: &str) {
    if let Err(e) = notifier.notify(title, description) {
        warn!(error = %e, title, "notification failed");
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
