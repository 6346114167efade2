//! Best-effort operator alerts.
//!
//! Alerts go out on two independent channels, email to the operator and a
//! direct message. A failure on either is logged and dropped; the alerting
//! path never returns an error to its caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::transport::{DirectMessenger, MessageTransport};

pub struct Alerter {
    transport: Arc<dyn MessageTransport>,
    messenger: Arc<dyn DirectMessenger>,
    operator: BTreeSet<String>,
}

impl Alerter {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        messenger: Arc<dyn DirectMessenger>,
        operator_email: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            messenger,
            operator: BTreeSet::from([operator_email.into()]),
        }
    }

    /// Tell the operator. Never fails.
    pub async fn alert(&self, subject: &str, body: &str) {
        warn!(subject, body, "alerting operator");

        if let Err(e) = self.transport.send(subject, body, &self.operator).await {
            error!(error = %e, subject, "failed to email operator alert");
        }
        if self.messenger.is_enabled() {
            if let Err(e) = self.messenger.message(subject, body).await {
                error!(error = %e, subject, "failed to send operator direct message");
            }
        }
    }
}

/// Alert-once-per-episode latch.
///
/// The first [`fire`](AlertOnce::fire) in an episode alerts; repeats are only
/// logged until [`reset`](AlertOnce::reset) ends the episode.
#[derive(Debug, Default)]
pub struct AlertOnce {
    sent: bool,
}

impl AlertOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call sent the alert.
    pub async fn fire(&mut self, alerter: &Alerter, subject: &str, body: &str) -> bool {
        if self.sent {
            info!(subject, "alert already sent for this episode");
            return false;
        }
        self.sent = true;
        alerter.alert(subject, body).await;
        true
    }

    pub fn reset(&mut self) {
        self.sent = false;
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }
}
