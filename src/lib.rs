//! offload - a worker pool for isolated task execution.
//!
//! Offloads named method invocations to isolated workers and hands back
//! cancellable futures. Workers are separate OS processes or OS threads;
//! user code that crashes, hangs, or loops does not take down the
//! controller.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Controller    │
//!                     │  Pool + queue   │
//!                     └────────┬────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process  │  │ (process  │  │ (process  │
//!         │or thread) │  │or thread) │  │or thread) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Each worker handle speaks a JSON-line protocol with its endpoint:
//! request envelopes go down, result/error/event envelopes come back, and
//! two reserved control messages drive cleanup and termination.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//!
//! # async fn demo() -> offload::Result<()> {
//! let mut registry = offload::Registry::new();
//! registry.register_sync("add", |params| {
//!     let a = params[0].as_i64().unwrap_or(0);
//!     let b = params[1].as_i64().unwrap_or(0);
//!     Ok(json!(a + b))
//! });
//!
//! let pool = offload::Pool::new(
//!     offload::PoolConfig::new()
//!         .with_registry(registry)
//!         .with_max_workers(4),
//! )?;
//!
//! let sum = pool.exec("add", vec![json!(2), json!(3)])?.await?;
//! assert_eq!(sum, json!(5));
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Isolation**: a worker that crashes, hangs, or loops is destroyed and
//!   replaced; only the tasks in flight on that worker are rejected.
//! - **Cooperative cancellation**: cancelling (or timing out) a task gives
//!   the worker a bounded chance to run its abort listeners; workers that
//!   cannot clean up in time are destroyed and replaced.
//! - **Sizing policy**: `min_workers` kept alive with crash replacement,
//!   on-demand growth up to `max_workers`, strict FIFO queueing.

mod config;
mod endpoint;
mod environment;
mod error;
mod future;
mod handle;
mod pool;
mod ports;
mod protocol;
mod signals;
pub mod worker;

pub use config::{
    DEFAULT_DEBUG_PORT_START, DEFAULT_WORKER_TERMINATE_TIMEOUT, MinWorkers, PoolConfig,
    SpawnOptions, WorkerInfo, WorkerKind,
};
pub use environment::{
    DEBUG_PORT_ENV, WORKER_ENV, cpu_count, default_pool_size, is_main_process,
    is_worker_process, platform,
};
pub use error::{CrashReport, PoolError, Result};
pub use future::{EventHandler, ExecOptions, TaskFuture, TaskHandle, TaskOutcome};
pub use pool::{Pool, PoolStats, Proxy};
pub use protocol::{
    CLEANUP_METHOD_ID, READY_SIGNAL, RemoteError, Reply, Request, TERMINATE_METHOD_ID, Transfer,
    WorkerMessage,
};
pub use signals::TerminationReason;
pub use worker::{DEFAULT_ABORT_LISTENER_TIMEOUT, Registry, TaskContext};
