//! Tenant-scoped process and payment workflow engine.
//!
//! Every tenant owns an isolated schema. Long-running work is recorded as a
//! [`process::Process`], executed by the [`dispatch`] worker pool, and drives
//! the refund and reconciliation pipelines in [`payments`].

pub mod access;
pub mod api;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod ids;
pub mod notifications;
pub mod payments;
pub mod process;
pub mod telemetry;
pub mod tenancy;

pub use engine::{Engine, EngineParts};
