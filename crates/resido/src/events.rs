//! Explicit domain events emitted at the boundary of service operations.
//!
//! Subscribers are registered on the [`EventBus`] at startup. A failing
//! subscriber is logged and never fails the operation that emitted the event.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::ids::{BillId, NotificationId, ProcessId, RefundRequestId, RequestId, ResidentId, TransactionId};
use crate::notifications::Channel;
use crate::payments::{RefundRequestStatus, TransactionStatus};
use crate::process::{ProcessStatus, ProcessType};
use crate::tenancy::TenantContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    ProcessTransitioned {
        process_id: ProcessId,
        process_type: ProcessType,
        /// Id of the record the process works on, when it has one.
        object_id: Option<String>,
        from: ProcessStatus,
        to: ProcessStatus,
        request_id: RequestId,
    },
    RefundRequestSettled {
        refund_request_id: RefundRequestId,
        bill_id: BillId,
        resident_id: ResidentId,
        status: RefundRequestStatus,
        total_refund_processed: i64,
        currency: String,
    },
    TransactionReconciled {
        transaction_id: TransactionId,
        bill_id: BillId,
        gateway_status: String,
        status: TransactionStatus,
        changed: bool,
    },
    NotificationDelivered {
        notification_id: NotificationId,
        channel: Channel,
        attempts: u32,
    },
    NotificationFailed {
        notification_id: NotificationId,
        channel: Channel,
        attempts: u32,
        error: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessTransitioned { .. } => "process_transitioned",
            Self::RefundRequestSettled { .. } => "refund_request_settled",
            Self::TransactionReconciled { .. } => "transaction_reconciled",
            Self::NotificationDelivered { .. } => "notification_delivered",
            Self::NotificationFailed { .. } => "notification_failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{subscriber} failed to handle event: {message}")]
pub struct EventError {
    pub subscriber: &'static str,
    pub message: String,
}

pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;
    fn handle(&self, ctx: &TenantContext, event: &DomainEvent) -> Result<(), EventError>;
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn publish(&self, ctx: &TenantContext, event: DomainEvent) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            if let Err(err) = subscriber.handle(ctx, &event) {
                tracing::warn!(
                    tenant = %ctx.schema(),
                    event = event.name(),
                    error = %err,
                    "event subscriber failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::tenancy::{NewTenant, TenantDirectory, TenantState};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl EventSubscriber for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn handle(&self, _ctx: &TenantContext, event: &DomainEvent) -> Result<(), EventError> {
            self.0.lock().expect("recorder mutex").push(event.name());
            Ok(())
        }
    }

    struct Failing;

    impl EventSubscriber for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn handle(&self, _ctx: &TenantContext, _event: &DomainEvent) -> Result<(), EventError> {
            Err(EventError {
                subscriber: "failing",
                message: "boom".into(),
            })
        }
    }

    #[test]
    fn failing_subscribers_do_not_block_others() {
        let directory = TenantDirectory::new("admin.resido.test", clock::system());
        let tenant = directory
            .provision(NewTenant {
                schema: "acme".into(),
                domain: "acme.resido.test".into(),
                name: "Acme".into(),
                state: TenantState::Active,
            })
            .expect("acme provisions");
        let scope = directory.bind(tenant);

        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(recorder.clone());

        bus.publish(
            scope.context(),
            DomainEvent::NotificationDelivered {
                notification_id: NotificationId::new(),
                channel: Channel::Email,
                attempts: 1,
            },
        );

        assert_eq!(*recorder.0.lock().expect("recorder mutex"), vec!["notification_delivered"]);
    }
}
