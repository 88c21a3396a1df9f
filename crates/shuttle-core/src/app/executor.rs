//! Executor - 1 件のタスクの実行と結果への変換
//!
//! # フロー
//! 1. トピックから handler を解決（未登録なら retries 0 の Failure）
//! 2. handler を別タスクで実行し、lock の期限を監視する
//! 3. handler の戻り値を `ExecutionResult` に変換して報告する
//!
//! # キャンセル
//! handler に渡す token は shutdown token の子で、次のときにキャンセルされる
//! - shutdown
//! - lock の期限切れ
//! - lock 延長が lock lost で拒否されたとき
//!
//! # 変換規則
//! | handler の結果 | 報告 |
//! |---|---|
//! | `Ok(result)` | `RetryPolicy::normalize` を通した result |
//! | `Err(e)` | `RetryPolicy::failure_for`（shutdown 中でも同じ） |
//! | panic | `RetryPolicy::failure_for`（"handler panicked: .."） |

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::context::WorkerContext;
use super::inflight::InFlightGuard;
use super::reporter::report;
use crate::domain::{ExecutionResult, ExternalTask};
use crate::handlers::Registration;

/// How the handler call ended when it did not produce a result.
#[derive(Debug)]
enum HandlerError {
    Failed(anyhow::Error),
    Panicked(String),
}

/// Aborts the handler task if the execution is dropped (e.g. after the grace period).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Execute `task` and report its outcome. The permit and in-flight entry are
/// held until the report has been sent.
#[instrument(
    name = "execute",
    skip_all,
    fields(task_id = %task.id, topic = %task.topic, retries = ?task.retries)
)]
pub async fn execute(
    ctx: Arc<WorkerContext>,
    task: ExternalTask,
    _permit: OwnedSemaphorePermit,
    _guard: InFlightGuard,
) {
    let registration = match ctx.registry.resolve(&task.topic) {
        Ok(r) => r,
        Err(e) => {
            // retrying on this worker cannot help; let an operator look at it
            error!(error = %e, "no handler for claimed task");
            let result = ExecutionResult::failure(e.to_string(), None, 0, Duration::ZERO);
            report(&ctx, &task, &result).await;
            return;
        }
    };

    let cancel = ctx.shutdown.child_token();
    let result = match supervise(&ctx, registration, &task, &cancel).await {
        Ok(result) => ctx.retry.normalize(result),
        Err(HandlerError::Failed(e)) => {
            // an interruption by shutdown counts against the retry budget too
            warn!(error = %e, shutting_down = ctx.shutdown.is_cancelled(), "handler failed");
            ctx.retry
                .failure_for(&task, e.to_string(), Some(format!("{e:?}")))
        }
        Err(HandlerError::Panicked(msg)) => {
            error!(panic = %msg, "handler panicked");
            ctx.retry
                .failure_for(&task, format!("handler panicked: {msg}"), None)
        }
    };

    report(&ctx, &task, &result).await;
}

/// Run the handler on its own task and watch its lock until it returns.
async fn supervise(
    ctx: &WorkerContext,
    registration: &Registration,
    task: &ExternalTask,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, HandlerError> {
    let handler = Arc::clone(&registration.handler);
    let owned = task.clone();
    let token = cancel.clone();
    let mut join = AbortOnDrop(tokio::spawn(async move {
        handler.handle(&owned, token).await
    }));

    let lock_duration = registration.config.lock_duration;
    let auto_extend = registration.config.auto_extend_lock;
    let mut lock_deadline = Instant::now() + task.lock_remaining(ctx.clock.now());
    let mut lock_held = true;

    let extend_every = (lock_duration * 2 / 3).max(Duration::from_millis(1));
    let mut extend_tick = tokio::time::interval_at(Instant::now() + extend_every, extend_every);
    extend_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            joined = &mut join.0 => {
                return match joined {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => Err(HandlerError::Failed(e)),
                    Err(e) if e.is_panic() => {
                        Err(HandlerError::Panicked(panic_message(e.into_panic())))
                    }
                    Err(e) => Err(HandlerError::Failed(anyhow!("handler task cancelled: {e}"))),
                };
            }
            _ = tokio::time::sleep_until(lock_deadline), if lock_held => {
                lock_held = false;
                warn!("lock expired while the handler was running, cancelling it");
                cancel.cancel();
            }
            _ = extend_tick.tick(), if auto_extend && lock_held => {
                match ctx.client.extend_lock(&task.id, &ctx.worker_id, lock_duration).await {
                    Ok(()) => {
                        lock_deadline = Instant::now() + lock_duration;
                        debug!(?lock_duration, "lock extended");
                    }
                    Err(e) if e.is_lock_lost() => {
                        ctx.stats.record_lock_lost();
                        lock_held = false;
                        warn!(error = %e, "lock lost while extending, cancelling handler");
                        cancel.cancel();
                    }
                    Err(e) => warn!(error = %e, "lock extension failed"),
                }
            }
        }
    }
}
