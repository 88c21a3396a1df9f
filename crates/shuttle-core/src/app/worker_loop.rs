//! Worker - トピックごとの claim ループと実行
//!
//! # 構成
//! ```text
//! claim loop (topic A) --fetch_and_lock--> engine
//!        |  タスクごとに permit + in-flight guard
//!        v
//!   execution task --handler--> result --report--> engine
//! ```
//!
//! # claim ループ
//! - トピックごとに 1 本のループと `Semaphore`（サイズ = `max_concurrent`）を持つ
//! - fetch は空き permit の数（最大 `max_tasks`）だけ要求する
//! - 遅いトピックは自分の permit を使い切るだけで、他トピックの取得は止まらない
//! - fetch エラーは jitter 付き指数バックオフで再試行する
//! - long poll が無効なら、空の応答の後に `poll_interval` 待つ
//!
//! # 停止（graceful shutdown）
//! 1. shutdown token がキャンセルされると新規 claim をやめる
//! 2. 停止後に届いたタスクは実行せず unlock する
//! 3. 実行中のタスクは `shutdown_grace` まで待つ
//! 4. 猶予を過ぎた実行は abort し、そのタスクを unlock する（best effort）
//!
//! # 不変条件
//! - 同じ task id の実行は同時に 1 つまで（`InFlight`）
//! - 実行したタスクには結果の報告がちょうど 1 回行われる

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::context::WorkerContext;
use super::executor::execute;
use super::reporter::release;
use crate::domain::{TaskId, Topic, WorkerId};
use crate::error::WorkerError;
use crate::handlers::Registration;
use crate::observability::{StatsSnapshot, WorkerStats};
use crate::ports::FetchRequest;

/// Summary returned when a worker has stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub stats: StatsSnapshot,
    /// Executions still running when the grace period ran out.
    pub aborted: usize,
}

/// A fully wired worker, see [`super::WorkerBuilder`].
pub struct Worker {
    pub(crate) ctx: WorkerContext,
}

impl Worker {
    pub fn worker_id(&self) -> &WorkerId {
        &self.ctx.worker_id
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.ctx.registry.topics()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Fail fast when the engine cannot be reached.
    pub async fn check_engine(&self) -> Result<(), WorkerError> {
        self.ctx.client.health_check().await?;
        Ok(())
    }

    /// Claim and execute tasks until `shutdown` is cancelled, then drain.
    pub async fn run(mut self, shutdown: CancellationToken) -> WorkerReport {
        self.ctx.shutdown = shutdown;
        let ctx = Arc::new(self.ctx);
        let started_at = ctx.clock.now();
        info!(
            worker_id = %ctx.worker_id,
            topics = ?ctx.registry.topics(),
            "worker started"
        );

        let mut loops = JoinSet::new();
        for topic in ctx.registry.topics() {
            loops.spawn(claim_loop(Arc::clone(&ctx), topic));
        }

        let mut aborted = 0;
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(n) => aborted += n,
                Err(e) => warn!(error = %e, "claim loop ended abnormally"),
            }
        }

        let report = WorkerReport {
            worker_id: ctx.worker_id.clone(),
            started_at,
            stopped_at: ctx.clock.now(),
            stats: ctx.stats.snapshot(),
            aborted,
        };
        info!(worker_id = %report.worker_id, stats = ?report.stats, aborted, "worker stopped");
        report
    }

    /// Run on a background task.
    pub fn start(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats();
        let join = tokio::spawn(self.run(shutdown.clone()));
        WorkerHandle {
            shutdown,
            stats,
            join,
        }
    }
}

/// Handle to a worker started with [`Worker::start`].
pub struct WorkerHandle {
    shutdown: CancellationToken,
    stats: Arc<WorkerStats>,
    join: tokio::task::JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    /// Stop claiming; in-flight tasks keep running for the grace period.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn shutdown_and_join(self) -> Result<WorkerReport, WorkerError> {
        self.request_shutdown();
        self.join
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))
    }
}

/// Claim tasks of one topic until shutdown. Returns how many executions had
/// to be aborted at the end of the grace period.
#[instrument(name = "claim_loop", skip(ctx), fields(worker_id = %ctx.worker_id))]
async fn claim_loop(ctx: Arc<WorkerContext>, topic: Topic) -> usize {
    let Ok(registration) = ctx.registry.resolve(&topic) else {
        return 0;
    };
    let slots = Arc::new(Semaphore::new(registration.config.max_concurrent));
    let batch = ctx
        .settings
        .max_tasks
        .min(registration.config.max_concurrent)
        .max(1);
    let mut backoff = ctx.settings.backoff();
    let mut executions: JoinSet<()> = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, TaskId> = HashMap::new();

    loop {
        reap(&mut executions, &mut running);

        // wait for a free slot, then take whatever else is free
        let first = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let mut permits = vec![first];
        while permits.len() < batch {
            match Arc::clone(&slots).try_acquire_owned() {
                Ok(p) => permits.push(p),
                Err(_) => break,
            }
        }

        let request = fetch_request(&ctx, registration, permits.len());
        let fetched = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            r = ctx.client.fetch_and_lock(&request) => r,
        };

        let tasks = match fetched {
            Ok(tasks) => {
                backoff.reset();
                tasks
            }
            Err(e) => {
                ctx.stats.record_claim_error();
                let delay = backoff.next_delay();
                warn!(error = %e, ?delay, "fetch and lock failed, backing off");
                drop(permits);
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if tasks.is_empty() {
            drop(permits);
            if ctx.settings.async_response_timeout.is_none() {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.settings.poll_interval) => {}
                }
            }
            continue;
        }

        ctx.stats.record_claimed(tasks.len());
        debug!(count = tasks.len(), "tasks claimed");

        if ctx.shutdown.is_cancelled() {
            for task in &tasks {
                release(&ctx, &task.id).await;
            }
            break;
        }

        for task in tasks {
            let Some(permit) = permits.pop() else {
                warn!(task_id = %task.id, "engine returned more tasks than requested, releasing");
                release(&ctx, &task.id).await;
                continue;
            };
            let Some(guard) = ctx.inflight.try_acquire(&task.id) else {
                ctx.stats.record_duplicate_skipped();
                debug!(task_id = %task.id, "task already in flight, skipped");
                continue;
            };
            let task_id = task.id.clone();
            let handle = executions.spawn(execute(Arc::clone(&ctx), task, permit, guard));
            running.insert(handle.id(), task_id);
        }
    }

    drain(&ctx, executions, running).await
}

fn fetch_request(ctx: &WorkerContext, registration: &Registration, max_tasks: usize) -> FetchRequest {
    FetchRequest {
        worker_id: ctx.worker_id.clone(),
        max_tasks,
        use_priority: ctx.settings.use_priority,
        async_response_timeout: ctx.settings.async_response_timeout,
        topics: vec![registration.topic_request()],
    }
}

fn reap(executions: &mut JoinSet<()>, running: &mut HashMap<tokio::task::Id, TaskId>) {
    while let Some(joined) = executions.try_join_next_with_id() {
        let id = match joined {
            Ok((id, ())) => id,
            Err(e) => {
                warn!(error = %e, "execution ended abnormally");
                e.id()
            }
        };
        running.remove(&id);
    }
}

/// Let running executions finish within the grace period; abort and unlock
/// the rest. Returns the number aborted.
async fn drain(
    ctx: &WorkerContext,
    mut executions: JoinSet<()>,
    mut running: HashMap<tokio::task::Id, TaskId>,
) -> usize {
    if !running.is_empty() {
        info!(in_flight = running.len(), grace = ?ctx.settings.shutdown_grace, "waiting for running tasks");
    }

    let grace = tokio::time::sleep(ctx.settings.shutdown_grace);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            joined = executions.join_next_with_id() => match joined {
                None => return 0,
                Some(Ok((id, ()))) => { running.remove(&id); }
                Some(Err(e)) => { running.remove(&e.id()); }
            },
            _ = &mut grace => break,
        }
    }

    let stuck: Vec<TaskId> = running.into_values().collect();
    warn!(count = stuck.len(), "grace period over, aborting running tasks");
    executions.abort_all();
    while executions.join_next().await.is_some() {}
    for task_id in &stuck {
        release(ctx, task_id).await;
    }
    stuck.len()
}
