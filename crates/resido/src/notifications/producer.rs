use std::sync::Arc;

use serde_json::json;

use crate::auth::UserLookup;
use crate::events::{DomainEvent, EventError, EventSubscriber};
use crate::payments::RefundRequestStatus;
use crate::tenancy::TenantContext;

use super::dispatcher::NotificationDispatcher;
use super::domain::NewNotification;

/// Queues an email to the resident once a refund request settles.
pub struct RefundNotificationProducer {
    dispatcher: Arc<NotificationDispatcher>,
    users: Arc<dyn UserLookup>,
}

impl RefundNotificationProducer {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, users: Arc<dyn UserLookup>) -> Self {
        Self { dispatcher, users }
    }
}

fn fail(message: impl ToString) -> EventError {
    EventError {
        subscriber: "refund_notification_producer",
        message: message.to_string(),
    }
}

impl EventSubscriber for RefundNotificationProducer {
    fn name(&self) -> &'static str {
        "refund_notification_producer"
    }

    fn handle(&self, ctx: &TenantContext, event: &DomainEvent) -> Result<(), EventError> {
        let DomainEvent::RefundRequestSettled {
            refund_request_id,
            resident_id,
            status,
            total_refund_processed,
            currency,
            ..
        } = event
        else {
            return Ok(());
        };

        let Some(resident) = self.users.resident_by_id(ctx, *resident_id).map_err(fail)? else {
            tracing::debug!(resident_id = %resident_id, "no resident account to notify");
            return Ok(());
        };

        let amount = format!("{}.{:02} {}", total_refund_processed / 100, total_refund_processed % 100, currency);
        let (subject, body, priority) = match status {
            RefundRequestStatus::Completed => (
                "Your refund has been processed",
                format!("A refund of {amount} has been issued."),
                2,
            ),
            RefundRequestStatus::PartialSuccess => (
                "Your refund was partially processed",
                format!("{amount} was refunded. Some lines could not be refunded; our team will follow up."),
                1,
            ),
            RefundRequestStatus::Failed => (
                "Your refund could not be processed",
                "We were unable to process your refund. Our team will contact you.".to_string(),
                1,
            ),
            RefundRequestStatus::Pending => return Ok(()),
        };

        self.dispatcher
            .enqueue(
                ctx,
                NewNotification::email(resident.email, subject, body)
                    .with_priority(priority)
                    .for_resident(*resident_id)
                    .with_payload(json!({
                        "refund_request_id": refund_request_id,
                        "status": status,
                        "total_refund_processed": total_refund_processed,
                    })),
            )
            .map_err(fail)?;
        Ok(())
    }
}
