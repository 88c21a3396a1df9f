//! EngineClient port - リモートエンジンとの境界
//!
//! # 操作
//! - `fetch_and_lock`: 未ロックのタスクを最大 `max_tasks` 件 claim する。
//!   何もなければ long poll の後に空のリストを返す（エラーではない）
//! - `complete` / `handle_bpmn_error` / `handle_failure`: 結果の報告
//! - `extend_lock` / `unlock`: lock の延長と解放
//! - `health_check`: 起動時の疎通確認
//!
//! # 共有
//! 実装は `Arc<dyn EngineClient>` として claim ループと全実行で共有されるため、
//! 並行呼び出しに対して安全でなければならない。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ExecutionResult, ExternalTask, TaskId, Topic, Variables, WorkerId};

/// Per-topic part of a fetch-and-lock call.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRequest {
    pub topic: Topic,
    pub lock_duration: Duration,
    /// Only fetch these variables; `None` fetches all.
    pub variables: Option<Vec<String>>,
    /// Only fetch variables local to the activity.
    pub local_variables: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub worker_id: WorkerId,
    pub max_tasks: usize,
    pub use_priority: bool,
    /// Long-poll timeout; `None` returns immediately when nothing is available.
    pub async_response_timeout: Option<Duration>,
    pub topics: Vec<TopicRequest>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// The lock expired or is held by another worker; ownership has moved on.
    #[error("lock on task {task_id} lost: {message}")]
    LockLost { task_id: TaskId, message: String },

    #[error("task {task_id} not found")]
    NotFound { task_id: TaskId },

    #[error("engine rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid engine response: {0}")]
    Decode(String),
}

impl ClientError {
    /// The task is no longer ours; reporting again cannot succeed.
    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self,
            ClientError::LockLost { .. } | ClientError::NotFound { .. }
        )
    }

    /// Worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Timeout => true,
            ClientError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Claim up to `max_tasks` unlocked tasks of the requested topics.
    ///
    /// Waits up to the long-poll timeout when nothing is available and then
    /// returns an empty list; "nothing to do" is never an error.
    async fn fetch_and_lock(&self, request: &FetchRequest)
    -> Result<Vec<ExternalTask>, ClientError>;

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        variables: &Variables,
        local_variables: &Variables,
    ) -> Result<(), ClientError>;

    async fn handle_bpmn_error(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        error_code: &str,
        message: &str,
        variables: &Variables,
    ) -> Result<(), ClientError>;

    async fn handle_failure(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        message: &str,
        details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> Result<(), ClientError>;

    /// Push the lock expiry to `now + new_duration`.
    async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        new_duration: Duration,
    ) -> Result<(), ClientError>;

    /// Release the lock so another worker can pick the task up right away.
    async fn unlock(&self, task_id: &TaskId) -> Result<(), ClientError>;

    /// Cheap call used at startup to fail fast on an unreachable engine.
    async fn health_check(&self) -> Result<(), ClientError>;

    /// Send the report call matching `result`.
    async fn report(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        result: &ExecutionResult,
    ) -> Result<(), ClientError> {
        match result {
            ExecutionResult::Completed {
                variables,
                local_variables,
            } => {
                self.complete(task_id, worker_id, variables, local_variables)
                    .await
            }
            ExecutionResult::BpmnError {
                error_code,
                message,
                variables,
            } => {
                self.handle_bpmn_error(task_id, worker_id, error_code, message, variables)
                    .await
            }
            ExecutionResult::Failure {
                message,
                details,
                retries,
                retry_timeout,
            } => {
                self.handle_failure(
                    task_id,
                    worker_id,
                    message,
                    details.as_deref(),
                    *retries,
                    *retry_timeout,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ClientError::Transport("reset".into()), true, false)]
    #[case(ClientError::Timeout, true, false)]
    #[case(ClientError::Rejected { status: 503, message: "busy".into() }, true, false)]
    #[case(ClientError::Rejected { status: 400, message: "bad".into() }, false, false)]
    #[case(ClientError::NotFound { task_id: TaskId::new("t") }, false, true)]
    #[case(ClientError::LockLost { task_id: TaskId::new("t"), message: "other worker".into() }, false, true)]
    #[case(ClientError::Decode("eof".into()), false, false)]
    fn classification(#[case] err: ClientError, #[case] retryable: bool, #[case] lock_lost: bool) {
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.is_lock_lost(), lock_lost);
    }
}
