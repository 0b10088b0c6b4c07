//! Asynchronous execution of processes: broker seam, processors, the
//! dispatcher that enqueues work, the worker pool and the periodic scheduler.

pub mod broker;
pub mod dispatcher;
pub mod processor;
pub mod scheduler;
pub mod worker;

pub use broker::{Broker, BrokerError, InMemoryBroker, TaskMessage};
pub use dispatcher::{DispatchError, TaskDispatcher};
pub use processor::{AsyncProcessor, ProcessorError, ProcessorRegistry, RunOutcome};
pub use scheduler::{
    PeriodicBinding, PeriodicTable, ScheduleIntervals, Scheduler, TaskCode, TickReport,
};
pub use worker::{TaskWorker, WorkerContext, WorkerPool};
