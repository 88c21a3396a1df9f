//! Impls: `EngineClient` implementations.
//!
//! - **RestEngineClient**: the engine's REST API over reqwest
//! - **InMemoryEngine**: a local engine for tests and demo runs

pub mod inmem_engine;
pub mod rest;

pub use self::inmem_engine::{CallRecord, EngineCall, InMemoryEngine, NewTask, TaskSnapshot, TaskStatus};
pub use self::rest::{RestClientConfig, RestEngineClient};
