//! Bill refund requests: synchronous validation and recording, then an
//! asynchronous orchestration that executes each refund line in order.

mod orchestrator;
mod request;
mod watcher;

pub use orchestrator::{BillRefundProcessor, RefundOrchestrator, RefundReport};
pub use request::{
    NewRefundLine, NewRefundRequest, RefundRequestDetail, RefundRequestService, RefundSubmission,
};
pub use watcher::RefundProcessWatcher;
