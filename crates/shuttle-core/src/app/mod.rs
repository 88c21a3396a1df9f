//! App: the worker runtime built on the ports.
//!
//! - **WorkerBuilder**: wiring and fail-fast validation
//! - **Worker**: per-topic claim loops, execution, reporting, shutdown

pub mod backoff;
pub mod builder;
mod context;
mod executor;
pub mod inflight;
mod reporter;
pub mod worker_loop;


pub use self::builder::{BuildError, WorkerBuilder};
pub use self::worker_loop::{Worker, WorkerHandle, WorkerReport};
