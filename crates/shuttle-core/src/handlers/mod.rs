//! Handlers: the pluggable domain logic and the registry that routes topics to it.

pub mod handler;
pub mod input;
pub mod registry;

pub use self::handler::{ExternalTaskHandler, FnHandler, handler_fn};
pub use self::input::{TaskInput, Typed, TypedHandler};
pub use self::registry::{HandlerRegistry, Registration, RegistryError, TopicConfig};
