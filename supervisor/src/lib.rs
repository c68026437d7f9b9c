//! Supervision of named child processes: start/stop/restart with readiness gating,
//! graceful-then-forced termination, per-service log capture, and reconciliation of
//! the supervised set against a live-editable definition file.

pub mod backoff;
pub mod controller;
pub mod definition;
pub mod error;
pub mod logs;
mod metrics;
pub mod probe;
pub mod process;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod supervisor;

pub use controller::{Controller, DefinitionResult, OperationResult, ServiceInfo};
pub use definition::{ConfigSnapshot, ServiceDefinition};
pub use error::{ProbeError, StoreError, SupervisorError};
pub use logs::{LogSink, LogTail, Stream};
pub use registry::{RuntimeState, ServiceStatus};
pub use store::{DefinitionStore, JsonFileStore};
pub use supervisor::{StatusEvent, Supervisor};
