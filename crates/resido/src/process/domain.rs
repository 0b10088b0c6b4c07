use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::access::{AccessError, RowScoped};
use crate::error::{Classify, ErrorKind};
use crate::ids::{PeriodicBindingId, ProcessId, RequestId};

pub const PROCESS_TERMINATED_BY_SYSTEM: &str = "process_terminated_by_system";

/// Error body written onto processes failed by the stale-process sweep.
pub fn long_running_error_body() -> Value {
    json!({
        "status": false,
        "errors": [{
            "code": PROCESS_TERMINATED_BY_SYSTEM,
            "message": "The process was found to be long running and thus was terminated by the system",
        }],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessType {
    ProcessBillRefundRequest,
    TransactionsReconciliation,
    VisitTypeAssignment,
    NotificationDelivery,
    StaleProcessSweep,
}

impl ProcessType {
    pub const ALL: [ProcessType; 5] = [
        Self::ProcessBillRefundRequest,
        Self::TransactionsReconciliation,
        Self::VisitTypeAssignment,
        Self::NotificationDelivery,
        Self::StaleProcessSweep,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProcessBillRefundRequest => "PROCESS_BILL_REFUND_REQUEST",
            Self::TransactionsReconciliation => "TRANSACTIONS_RECONCILIATION",
            Self::VisitTypeAssignment => "VISIT_TYPE_ASSIGNMENT",
            Self::NotificationDelivery => "NOTIFICATION_DELIVERY",
            Self::StaleProcessSweep => "STALE_PROCESS_SWEEP",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = ProcessError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ProcessError::UnknownValue {
                field: "process_type",
                value: raw.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    AdhocViaApi,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Retrying,
    TimedOut,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 7] = [
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Canceled,
        Self::Retrying,
        Self::TimedOut,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Retrying => "RETRYING",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// Edges of the process state machine. Self-loops are handled by callers
    /// as no-ops and are not edges.
    pub const fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, TimedOut)
                | (Queued, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Canceled)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Retrying, TimedOut)
                | (Retrying, Canceled)
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = ProcessError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ProcessError::UnknownValue {
                field: "status",
                value: raw.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub request_id: RequestId,
    pub task_id: Option<Uuid>,
    pub object_id: Option<String>,
    pub object_name: Option<String>,
    pub process_type: ProcessType,
    pub trigger: Trigger,
    pub status: ProcessStatus,
    pub raw_payload: Option<Value>,
    pub report: Option<Value>,
    pub error_code: Option<String>,
    /// HTTP-style status recorded alongside `error_code`.
    pub error_status: Option<u16>,
    pub error_body: Option<Value>,
    pub periodic_binding: Option<PeriodicBindingId>,
    pub active: bool,
    pub attempts: u32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub version: u64,
}

// Processes carry no location or resident path, so only unrestricted
// callers see them through the row filter.
impl RowScoped for Process {}

impl Process {
    pub fn view(&self) -> ProcessView {
        ProcessView {
            id: self.id,
            request_id: self.request_id,
            task_id: self.task_id,
            object_id: self.object_id.clone(),
            object_name: self.object_name.clone(),
            process_type: self.process_type,
            trigger: self.trigger,
            status: self.status,
            raw_payload: if self.status == ProcessStatus::Completed {
                None
            } else {
                self.raw_payload.clone()
            },
            report: self.report.clone(),
            error_code: self.error_code.clone(),
            error_status: self.error_status,
            error_body: self.error_body.clone(),
            active: self.active,
            attempts: self.attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// API-facing projection of a process. `raw_payload` is withheld once the
/// process has completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessView {
    pub id: ProcessId,
    pub request_id: RequestId,
    pub task_id: Option<Uuid>,
    pub object_id: Option<String>,
    pub object_name: Option<String>,
    pub process_type: ProcessType,
    pub trigger: Trigger,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<Value>,
    pub report: Option<Value>,
    pub error_code: Option<String>,
    pub error_status: Option<u16>,
    pub error_body: Option<Value>,
    pub active: bool,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProcess {
    pub process_type: ProcessType,
    pub request_id: RequestId,
    pub object_id: Option<String>,
    pub object_name: Option<String>,
    pub trigger: Trigger,
    pub raw_payload: Option<Value>,
    pub periodic_binding: Option<PeriodicBindingId>,
    pub created_by: Option<String>,
}

impl NewProcess {
    pub fn adhoc(process_type: ProcessType, request_id: RequestId) -> Self {
        Self {
            process_type,
            request_id,
            object_id: None,
            object_name: None,
            trigger: Trigger::AdhocViaApi,
            raw_payload: None,
            periodic_binding: None,
            created_by: None,
        }
    }

    pub fn for_object(mut self, object_id: impl Into<String>, object_name: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self.object_name = Some(object_name.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.raw_payload = Some(payload);
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }
}

/// Optional fields written together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct ProcessUpdate {
    pub error_code: Option<String>,
    pub error_status: Option<u16>,
    pub error_body: Option<Value>,
    pub report: Option<Value>,
}

impl ProcessUpdate {
    pub fn report(report: Value) -> Self {
        Self {
            report: Some(report),
            ..Self::default()
        }
    }

    pub fn error(code: impl Into<String>, status: u16, body: Value) -> Self {
        Self {
            error_code: Some(code.into()),
            error_status: Some(status),
            error_body: Some(body),
            report: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessFilter {
    pub id: Option<ProcessId>,
    pub object_id: Option<String>,
    pub request_id: Option<RequestId>,
    pub process_type: Option<ProcessType>,
    pub status: Option<ProcessStatus>,
    pub active: Option<bool>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl ProcessFilter {
    pub fn matches(&self, process: &Process) -> bool {
        !process.deleted
            && self.id.map_or(true, |id| process.id == id)
            && self
                .object_id
                .as_ref()
                .map_or(true, |object_id| process.object_id.as_ref() == Some(object_id))
            && self
                .request_id
                .map_or(true, |request_id| process.request_id == request_id)
            && self
                .process_type
                .map_or(true, |kind| process.process_type == kind)
            && self.status.map_or(true, |status| process.status == status)
            && self.active.map_or(true, |active| process.active == active)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("a process already exists for request {0}")]
    DuplicateRequest(RequestId),
    #[error("task id {0} is already attached to another process")]
    DuplicateTaskId(Uuid),
    #[error("process {0} already has a different task id")]
    TaskIdAlreadySet(ProcessId),
    #[error("a {process_type} process is already in flight for object {object_id}")]
    NonTerminalExists {
        object_id: String,
        process_type: ProcessType,
    },
    #[error("cannot move process from {from} to {to}")]
    InvalidTransition {
        from: ProcessStatus,
        to: ProcessStatus,
    },
    #[error("process {id} is already {status}")]
    AlreadyTerminal { id: ProcessId, status: ProcessStatus },
    #[error("process {0} not found")]
    NotFound(ProcessId),
    #[error("process {0} was modified concurrently")]
    VersionConflict(ProcessId),
    #[error("unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl Classify for ProcessError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateRequest(_)
            | Self::DuplicateTaskId(_)
            | Self::TaskIdAlreadySet(_)
            | Self::NonTerminalExists { .. }
            | Self::InvalidTransition { .. }
            | Self::AlreadyTerminal { .. }
            | Self::VersionConflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::UnknownValue { .. } => ErrorKind::Validation,
            Self::Access(err) => err.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::DuplicateTaskId(_) => "duplicate_task_id",
            Self::TaskIdAlreadySet(_) => "task_id_already_set",
            Self::NonTerminalExists { .. } => "process_already_in_flight",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyTerminal { .. } => "process_already_terminal",
            Self::NotFound(_) => "process_not_found",
            Self::VersionConflict(_) => "version_conflict",
            Self::UnknownValue { .. } => "invalid_value",
            Self::Access(err) => err.code(),
        }
    }
}
