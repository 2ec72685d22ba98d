// Conduit
//
// Pipelines of worker pools connected by shared queues. Every instance is its
// own process and polls one shared exit signal; shutdown requests exit,
// drains queues from sink to source, then joins the pools.

pub mod config;
pub mod error;
mod link;
pub mod logging;
pub mod orchestrator;
pub mod pool;
mod process;
pub mod queue;
pub mod signal;
pub mod spec;
pub mod wire;
pub mod worker;

// Re-export key types for easier usage
pub use config::{LogSettings, OrchestratorConfig, PipelineConfig};
pub use error::{
    ConfigError, InstanceCrash, OrchestratorError, PoolError, QueueError, QueueErrorKind, SpecError,
    WorkerError,
};
pub use orchestrator::{Orchestrator, RunOutcome, ShutdownReport, StopReason};
pub use pool::{JoinReport, PoolState, WorkerPool};
pub use queue::{Drain, QueueItem, SharedQueue};
pub use signal::ExitSignal;
pub use spec::{Entry, WorkerContext, WorkerSpec, WorkerSpecBuilder};
pub use worker::{consume_loop, produce_loop, LoopStats};
