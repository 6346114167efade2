//! Outbound message delivery.
//!
//! Two seams, one per channel:
//! - [`MessageTransport`]: email to one or many addresses ([`SmtpTransport`]).
//! - [`DirectMessenger`]: a direct note to the operator ([`WebhookMessenger`]).
//!
//! Both are used by the notification dispatcher and the operator alerter
//! through `Arc<dyn ...>` so tests can swap in recording doubles.

mod smtp;
mod webhook;

pub use smtp::SmtpTransport;
pub use webhook::WebhookMessenger;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("webhook request failed: {0}")]
    Webhook(#[from] reqwest::Error),

    #[error("message has no recipients")]
    NoRecipients,

    #[error("{0}")]
    Other(String),
}

/// Sends one message to a set of recipients.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &BTreeSet<String>,
    ) -> Result<(), TransportError>;
}

/// Sends a short direct message to the operator.
#[async_trait]
pub trait DirectMessenger: Send + Sync {
    /// Whether messages actually go anywhere.
    fn is_enabled(&self) -> bool;

    async fn message(&self, subject: &str, body: &str) -> Result<(), TransportError>;
}
