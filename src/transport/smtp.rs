//! Email delivery over implicit-TLS SMTP.

use std::collections::BTreeSet;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::{MessageTransport, TransportError};
use crate::config::EmailConfig;

/// SMTP-backed [`MessageTransport`].
///
/// Every recipient is a blind copy, so subscribers never see each other's
/// addresses.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &EmailConfig) -> Result<Self, TransportError> {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self {
            mailer,
            from: parse_mailbox(&config.from)?,
        })
    }

    fn build_message(
        &self,
        subject: &str,
        body: &str,
        recipients: &BTreeSet<String>,
    ) -> Result<Message, TransportError> {
        build_message(&self.from, subject, body, recipients)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address.parse().map_err(|source| TransportError::Address {
        address: address.to_string(),
        source,
    })
}

fn build_message(
    from: &Mailbox,
    subject: &str,
    body: &str,
    recipients: &BTreeSet<String>,
) -> Result<Message, TransportError> {
    if recipients.is_empty() {
        return Err(TransportError::NoRecipients);
    }

    let mut builder = Message::builder()
        .from(from.clone())
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for recipient in recipients {
        builder = builder.bcc(parse_mailbox(recipient)?);
    }
    Ok(builder.body(body.to_string())?)
}

#[async_trait]
impl MessageTransport for SmtpTransport {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &BTreeSet<String>,
    ) -> Result<(), TransportError> {
        let message = self.build_message(subject, body, recipients)?;
        self.mailer.send(message).await?;
        debug!(recipients = recipients.len(), subject, "email sent");
        Ok(())
    }
}
