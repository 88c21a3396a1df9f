//! Typed handler input.
//!
//! Ties a topic name to an input struct decoded from the task variables, so a
//! handler works with `PaymentRequest { amount, customer_id }` instead of raw
//! variable lookups.
//!
//! # Two layers
//! - typed surface: `TaskInput` + `TypedHandler<T>`
//! - erased inside the registry: `Typed<T, H>` implements `ExternalTaskHandler`

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::handler::ExternalTaskHandler;
use crate::domain::{ExecutionResult, ExternalTask, variables_to_json};

/// An input struct bound to the topic it is delivered on.
///
/// ```ignore
/// #[derive(Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct PaymentRequest { amount: f64, customer_id: String }
///
/// impl TaskInput for PaymentRequest {
///     const TOPIC: &'static str = "process-payment";
/// }
/// ```
pub trait TaskInput: DeserializeOwned + Send + Sync + 'static {
    const TOPIC: &'static str;
}

#[async_trait]
pub trait TypedHandler<T: TaskInput>: Send + Sync {
    async fn handle(
        &self,
        input: T,
        task: &ExternalTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult>;
}

pub struct Typed<T: TaskInput, H: TypedHandler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: TaskInput, H: TypedHandler<T>> Typed<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskInput, H: TypedHandler<T>> ExternalTaskHandler for Typed<T, H> {
    async fn handle(
        &self,
        task: &ExternalTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        let input: T = match serde_json::from_value(variables_to_json(&task.variables)) {
            Ok(input) => input,
            Err(e) => {
                // the same variables will never decode, retrying only delays the incident
                warn!(task_id = %task.id, topic = T::TOPIC, error = %e, "task input does not decode");
                return Ok(ExecutionResult::failure(
                    format!("invalid input for topic {}", T::TOPIC),
                    Some(e.to_string()),
                    0,
                    Duration::ZERO,
                ));
            }
        };
        self.handler.handle(input, task, cancel).await
    }
}
