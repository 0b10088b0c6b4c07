//! Durable records of asynchronous operations.

pub mod domain;
pub mod registry;
pub mod repository;
pub mod sweep;

pub use domain::{
    long_running_error_body, NewProcess, Process, ProcessError, ProcessFilter, ProcessStatus,
    ProcessType, ProcessUpdate, ProcessView, Trigger, PROCESS_TERMINATED_BY_SYSTEM,
};
pub use registry::{ProcessPage, ProcessRegistry};
pub use repository::{InMemoryProcessRepository, ProcessRepository};
pub use sweep::StaleSweepProcessor;
