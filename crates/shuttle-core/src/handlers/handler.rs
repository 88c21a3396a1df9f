//! Handler trait: the single capability a unit of domain logic provides.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{ExecutionResult, ExternalTask};

/// Consumes one claimed task and decides its outcome.
///
/// `Ok` carries the handler's decision (complete, business error, or a
/// failure it already accounted for). `Err` is an unexpected technical error:
/// the worker turns it into a `Failure` using the retry policy. A panic is
/// treated the same way.
///
/// `cancel` fires on shutdown and when the task's lock expires; long-running
/// handlers should watch it and return promptly.
///
/// # Example
/// ```ignore
/// struct Hello;
///
/// #[async_trait]
/// impl ExternalTaskHandler for Hello {
///     async fn handle(&self, task: &ExternalTask, _cancel: CancellationToken)
///         -> anyhow::Result<ExecutionResult>
///     {
///         let name: String = task.require("name")?;
///         Ok(ExecutionResult::complete().with_variable("greeting", format!("hello {name}")))
///     }
/// }
/// ```
#[async_trait]
pub trait ExternalTaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &ExternalTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Handler backed by a closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure as a handler. The closure gets its own copy of the task.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ExternalTask, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ExecutionResult>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ExternalTaskHandler for FnHandler<F>
where
    F: Fn(ExternalTask, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ExecutionResult>> + Send,
{
    async fn handle(
        &self,
        task: &ExternalTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        (self.f)(task.clone(), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, Topic, WorkerId};
    use chrono::Utc;

    #[tokio::test]
    async fn closure_handler_sees_the_task() {
        let handler = handler_fn(|task: ExternalTask, _cancel| async move {
            Ok(ExecutionResult::complete().with_variable("echo", task.id.to_string()))
        });

        let task = ExternalTask::new(
            TaskId::new("t-9"),
            Topic::new("echo"),
            WorkerId::new("w"),
            Utc::now(),
        );
        let result = handler
            .handle(&task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::complete().with_variable("echo", "t-9"));
    }
}
