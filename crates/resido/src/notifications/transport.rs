use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::ids::NotificationId;

use super::domain::NotificationEntry;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{transport} could not deliver: {message}")]
pub struct TransportError {
    pub transport: &'static str,
    pub message: String,
}

/// Delivers one notification. Implementations de-duplicate on
/// [`NotificationEntry::id`], since the queue may hand the same row over
/// more than once.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, entry: &NotificationEntry) -> Result<(), TransportError>;
}

/// Writes notifications to the log. Used when no provider is configured.
#[derive(Debug, Default)]
pub struct LoggingTransport;

#[async_trait]
impl NotificationTransport for LoggingTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, entry: &NotificationEntry) -> Result<(), TransportError> {
        tracing::info!(
            notification_id = %entry.id,
            channel = ?entry.channel,
            recipient = %entry.recipient,
            subject = %entry.subject,
            "notification delivered to log"
        );
        Ok(())
    }
}

/// Scripted transport that records deliveries and fails on demand.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<NotificationId>>,
    failures: Mutex<VecDeque<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` sends fail with `message`.
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.extend(std::iter::repeat(message.to_string()).take(count));
    }

    pub fn sent(&self) -> Vec<NotificationId> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, entry: &NotificationEntry) -> Result<(), TransportError> {
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(message) = failure {
            return Err(TransportError {
                transport: "recording",
                message,
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.id);
        Ok(())
    }
}
