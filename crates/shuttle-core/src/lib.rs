//! shuttle-core
//!
//! External task worker for a BPMN workflow engine: claims tasks of the
//! registered topics, runs their handlers, and reports each outcome back.
//!
//! # Modules
//! - **domain**: ids, typed variables, the claimed task, execution results, retry accounting
//! - **ports**: `EngineClient` and `Clock`
//! - **handlers**: handler trait, typed inputs, the topic registry
//! - **app**: builder, claim loops, execution, reporting, shutdown
//! - **impls**: REST client and in-memory engine
//! - **config**: TOML file + environment configuration
//! - **observability**: worker counters

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod impls;
pub mod observability;
pub mod ports;

pub use self::app::{BuildError, Worker, WorkerBuilder, WorkerHandle, WorkerReport};
pub use self::config::{ConfigError, WorkerConfig};
pub use self::domain::{ExecutionResult, ExternalTask, RetryPolicy, TaskId, Topic, WorkerId};
pub use self::error::WorkerError;
pub use self::handlers::{ExternalTaskHandler, HandlerRegistry, TaskInput, TopicConfig, TypedHandler, handler_fn};
pub use self::ports::{ClientError, EngineClient};
