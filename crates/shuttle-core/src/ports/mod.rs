//! Ports: abstractions over what lives outside the worker process.
//!
//! - `EngineClient`: the remote workflow engine (fetch-and-lock, reports, locks)
//! - `Clock`: wall-clock time, comparable with engine lock expiry

pub mod clock;
pub mod engine;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::engine::{ClientError, EngineClient, FetchRequest, TopicRequest};
