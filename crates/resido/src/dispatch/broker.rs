use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{Classify, ErrorKind};
use crate::ids::{ProcessId, RequestId, TenantId};
use crate::process::{Process, ProcessType};

/// Message placed on the broker for one execution of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub tenant_id: TenantId,
    pub process_id: ProcessId,
    pub process_type: ProcessType,
    pub request_id: RequestId,
    pub payload: Value,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

impl TaskMessage {
    pub fn for_process(tenant_id: TenantId, process: &Process) -> Self {
        Self {
            task_id: process.id.as_uuid(),
            tenant_id,
            process_id: process.id,
            process_type: process.process_type,
            request_id: process.request_id,
            payload: process.raw_payload.clone().unwrap_or(Value::Null),
            attempt: 1,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("task broker unavailable: {0}")]
    Unavailable(String),
}

impl Classify for BrokerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Unavailable
    }

    fn code(&self) -> &'static str {
        "broker_unavailable"
    }
}

/// At-least-once delivery queue. Exactly-once execution is the worker's job.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Makes `message` visible to workers after `countdown`.
    async fn enqueue(&self, message: TaskMessage, countdown: Duration) -> Result<(), BrokerError>;

    /// Next visible message, if any. The message stays in flight until
    /// completed.
    async fn dequeue(&self) -> Result<Option<TaskMessage>, BrokerError>;

    async fn complete(&self, task_id: Uuid) -> Result<(), BrokerError>;
}

#[derive(Debug)]
struct Scheduled {
    visible_at: DateTime<Utc>,
    message: TaskMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    scheduled: Vec<Scheduled>,
    in_flight: HashMap<Uuid, TaskMessage>,
}

/// Process-local broker. Visibility is decided against the shared clock, so
/// tests drive countdowns with a manual clock.
pub struct InMemoryBroker {
    clock: SharedClock,
    state: Mutex<BrokerState>,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(BrokerState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn scheduled_len(&self) -> usize {
        self.lock().scheduled.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Messages waiting for delivery, in visibility order.
    pub fn scheduled(&self) -> Vec<TaskMessage> {
        let state = self.lock();
        let mut entries: Vec<_> = state.scheduled.iter().collect();
        entries.sort_by_key(|entry| entry.visible_at);
        entries.into_iter().map(|entry| entry.message.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".into()))
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, message: TaskMessage, countdown: Duration) -> Result<(), BrokerError> {
        self.ensure_available()?;
        let delay = chrono::Duration::from_std(countdown)
            .map_err(|err| BrokerError::Unavailable(format!("invalid countdown: {err}")))?;
        let visible_at = self.clock.now() + delay;
        tracing::debug!(
            task_id = %message.task_id,
            process_id = %message.process_id,
            attempt = message.attempt,
            %visible_at,
            "task enqueued"
        );
        self.lock().scheduled.push(Scheduled { visible_at, message });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<TaskMessage>, BrokerError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let next = state
            .scheduled
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.visible_at <= now)
            .min_by_key(|(_, entry)| entry.visible_at)
            .map(|(index, _)| index);

        Ok(next.map(|index| {
            let entry = state.scheduled.swap_remove(index);
            state
                .in_flight
                .insert(entry.message.task_id, entry.message.clone());
            entry.message
        }))
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), BrokerError> {
        self.lock().in_flight.remove(&task_id);
        Ok(())
    }
}
