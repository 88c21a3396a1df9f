//! Reporter - 実行結果をエンジンへ届ける
//!
//! # 報告
//! 実行したタスクごとに報告はちょうど 1 回です。
//!
//! | エラー | 扱い |
//! |---|---|
//! | Transport / Timeout / 5xx | `report_attempts` 回までバックオフして再送 |
//! | LockLost / NotFound | warn を出して破棄（タスクは既に他へ移っている） |
//! | その他 | error を出して破棄 |
//!
//! # release
//! 結果なしでタスクを返す（unlock）。失敗しても lock の期限切れで戻るので best effort。

use tracing::{debug, error, info, warn};

use super::context::WorkerContext;
use crate::domain::{ExecutionResult, ExternalTask, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    LockLost,
    Dropped,
}

pub async fn report(
    ctx: &WorkerContext,
    task: &ExternalTask,
    result: &ExecutionResult,
) -> ReportOutcome {
    let attempts = ctx.settings.report_attempts.max(1);
    let mut backoff = ctx.settings.backoff();

    for attempt in 1..=attempts {
        match ctx.client.report(&task.id, &ctx.worker_id, result).await {
            Ok(()) => {
                ctx.stats
                    .record_reported(result.kind(), result.is_incident());
                log_delivered(task, result);
                return ReportOutcome::Delivered;
            }
            Err(e) if e.is_lock_lost() => {
                ctx.stats.record_lock_lost();
                warn!(task_id = %task.id, topic = %task.topic, error = %e, "lock lost, report discarded");
                return ReportOutcome::LockLost;
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff.next_delay();
                debug!(task_id = %task.id, attempt, ?delay, error = %e, "report failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                ctx.stats.record_report_dropped();
                error!(task_id = %task.id, topic = %task.topic, attempt, error = %e, "report dropped");
                return ReportOutcome::Dropped;
            }
        }
    }
    ReportOutcome::Dropped
}

fn log_delivered(task: &ExternalTask, result: &ExecutionResult) {
    match result {
        ExecutionResult::Completed { .. } => {
            info!(task_id = %task.id, topic = %task.topic, "task completed");
        }
        ExecutionResult::BpmnError {
            error_code,
            message,
            ..
        } => {
            info!(task_id = %task.id, topic = %task.topic, %error_code, %message, "business error reported");
        }
        ExecutionResult::Failure {
            message,
            retries: 0,
            ..
        } => {
            error!(task_id = %task.id, topic = %task.topic, %message, "retries exhausted, incident raised");
        }
        ExecutionResult::Failure {
            message,
            retries,
            retry_timeout,
            ..
        } => {
            warn!(task_id = %task.id, topic = %task.topic, %message, retries, ?retry_timeout, "failure reported");
        }
    }
}

/// Hand a task back to the engine without an outcome. Best effort.
pub async fn release(ctx: &WorkerContext, task_id: &TaskId) {
    match ctx.client.unlock(task_id).await {
        Ok(()) => {
            ctx.stats.record_released();
            debug!(%task_id, "task unlocked");
        }
        Err(e) => debug!(%task_id, error = %e, "unlock failed"),
    }
}
