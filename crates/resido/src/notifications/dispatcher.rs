use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::auth::RequestContext;
use crate::clock::SharedClock;
use crate::config::NotificationConfig;
use crate::dispatch::{AsyncProcessor, ProcessorError, RunOutcome};
use crate::events::{DomainEvent, EventBus};
use crate::ids::NotificationId;
use crate::process::{Process, ProcessType};
use crate::tenancy::TenantContext;

use super::domain::{NewNotification, NotificationEntry, NotificationError, NotificationStatus};
use super::store::NotificationStore;
use super::transport::NotificationTransport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub examined: usize,
    pub sent: usize,
    /// Left Pending because the send window is closed.
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed by another drain first.
    pub skipped: usize,
}

pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn NotificationTransport>,
    events: Arc<EventBus>,
    clock: SharedClock,
    max_attempts: u32,
    backoff_base: Duration,
    batch_size: usize,
    claim_lease: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn NotificationTransport>,
        events: Arc<EventBus>,
        clock: SharedClock,
        config: &NotificationConfig,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            clock,
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
            batch_size: config.batch_size.max(1),
            claim_lease: config.claim_lease,
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn enqueue(&self, ctx: &TenantContext, new: NewNotification) -> Result<NotificationEntry, NotificationError> {
        if !(NewNotification::MIN_PRIORITY..=NewNotification::MAX_PRIORITY).contains(&new.priority) {
            return Err(NotificationError::InvalidPriority(new.priority));
        }
        if new.recipient.trim().is_empty() {
            return Err(NotificationError::MissingRecipient);
        }
        let now = self.clock.now();
        let entry = self.store.insert(
            ctx,
            NotificationEntry {
                id: NotificationId::new(),
                channel: new.channel,
                recipient: new.recipient,
                subject: new.subject,
                body: new.body,
                priority: new.priority,
                status: NotificationStatus::Pending,
                attempt_count: 0,
                next_attempt_at: now,
                last_error: None,
                send_window: new.send_window,
                payload: new.payload,
                resident_id: new.resident_id,
                created_at: now,
                updated_at: now,
                sent_at: None,
                version: 0,
            },
        )?;
        tracing::debug!(tenant = %ctx.schema(), notification_id = %entry.id, channel = ?entry.channel, "notification queued");
        Ok(entry)
    }

    /// Sends up to `batch_size` due rows whose send window is open, most
    /// urgent first. Rows left Queued past the claim lease by an interrupted
    /// drain are sent again.
    pub async fn drain(&self, ctx: &TenantContext) -> Result<DrainReport, NotificationError> {
        let now = self.clock.now();
        let (sendable, closed): (Vec<_>, Vec<_>) = self
            .store
            .due(ctx, now, now - self.claim_lease)?
            .into_iter()
            .partition(|entry| entry.send_window.map_or(true, |window| window.contains(now)));
        let mut report = DrainReport {
            deferred: closed.len(),
            ..DrainReport::default()
        };

        for entry in sendable.into_iter().take(self.batch_size) {
            report.examined += 1;
            if entry.status == NotificationStatus::Queued {
                tracing::warn!(
                    tenant = %ctx.schema(),
                    notification_id = %entry.id,
                    claimed_at = %entry.updated_at,
                    "reclaiming notification left queued"
                );
            }

            let mut claimed = entry;
            claimed.status = NotificationStatus::Queued;
            claimed.updated_at = now;
            let mut claimed = match self.store.update(ctx, claimed) {
                Ok(claimed) => claimed,
                Err(NotificationError::VersionConflict(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let result = self.transport.send(&claimed).await;
            let now = self.clock.now();
            claimed.attempt_count += 1;
            claimed.updated_at = now;

            match result {
                Ok(()) => {
                    claimed.status = NotificationStatus::Sent;
                    claimed.sent_at = Some(now);
                    claimed.last_error = None;
                    let entry = self.store.update(ctx, claimed)?;
                    report.sent += 1;
                    self.events.publish(
                        ctx,
                        DomainEvent::NotificationDelivered {
                            notification_id: entry.id,
                            channel: entry.channel,
                            attempts: entry.attempt_count,
                        },
                    );
                }
                Err(err) => {
                    claimed.last_error = Some(err.to_string());
                    if claimed.attempt_count >= self.max_attempts {
                        claimed.status = NotificationStatus::Failed;
                        let entry = self.store.update(ctx, claimed)?;
                        report.failed += 1;
                        tracing::warn!(
                            tenant = %ctx.schema(),
                            notification_id = %entry.id,
                            attempts = entry.attempt_count,
                            error = %err,
                            "notification delivery exhausted"
                        );
                        self.events.publish(
                            ctx,
                            DomainEvent::NotificationFailed {
                                notification_id: entry.id,
                                channel: entry.channel,
                                attempts: entry.attempt_count,
                                error: err.to_string(),
                            },
                        );
                    } else {
                        claimed.status = NotificationStatus::Pending;
                        claimed.next_attempt_at = self.next_attempt(now, claimed.attempt_count);
                        self.store.update(ctx, claimed)?;
                        report.retried += 1;
                    }
                }
            }
        }

        if report.examined > 0 || report.deferred > 0 {
            tracing::info!(
                tenant = %ctx.schema(),
                sent = report.sent,
                deferred = report.deferred,
                retried = report.retried,
                failed = report.failed,
                "notification drain finished"
            );
        }
        Ok(report)
    }

    /// `base * 2^(attempts - 1)` after the last attempt.
    fn next_attempt(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let exponent = attempts.saturating_sub(1).min(16);
        now + self.backoff_base * 2i32.pow(exponent)
    }
}

pub struct NotificationDeliveryProcessor {
    dispatcher: Arc<NotificationDispatcher>,
}

impl NotificationDeliveryProcessor {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl AsyncProcessor for NotificationDeliveryProcessor {
    fn process_type(&self) -> ProcessType {
        ProcessType::NotificationDelivery
    }

    async fn run(&self, ctx: &RequestContext, _process: &Process, _payload: &Value) -> Result<RunOutcome, ProcessorError> {
        let report = self.dispatcher.drain(ctx.tenant()?).await?;
        Ok(RunOutcome::completed(RunOutcome::report_value(&report)?))
    }
}
