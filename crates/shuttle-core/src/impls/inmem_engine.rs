//! InMemoryEngine - テスト / デモ用のエンジン
//!
//! # 再現する契約
//! - 期限付きの排他 lock（期限切れ後は再 claim 可能）
//! - エンジン側のリトライカウンタと、失敗後の `retry_timeout` による再提示の遅延
//! - retries 0 の Failure でインシデント
//! - lock を持たないワーカーからの報告は LockLost で拒否
//!
//! # テスト用の機能
//! - long poll（`Notify` + タイムアウト）
//! - fetch / report への障害注入
//! - 報告履歴（`history`, `reports_for`）と `snapshot`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{
    ExecutionResult, ExternalTask, TaskContext, TaskId, Topic, VariableValue, Variables, WorkerId,
};
use crate::ports::{Clock, ClientError, EngineClient, FetchRequest, SystemClock, TopicRequest};

/// Engine-side lifecycle of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    Completed,
    BpmnError { error_code: String },
    /// Retries exhausted; waits for an operator.
    Incident,
}

/// A task to create, see [`InMemoryEngine::add`].
#[derive(Debug, Clone)]
pub struct NewTask {
    topic: Topic,
    variables: Variables,
    retries: Option<u32>,
    priority: i64,
    business_key: Option<String>,
}

impl NewTask {
    pub fn new(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            variables: Variables::new(),
            retries: None,
            priority: 0,
            business_key: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }
}

/// An accepted call, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Report(ExecutionResult),
    ExtendLock(Duration),
    Unlock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub call: EngineCall,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub retries: Option<u32>,
    pub locked_by: Option<WorkerId>,
    pub claims: u32,
    pub variables: Variables,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
struct Lock {
    worker_id: WorkerId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredTask {
    id: TaskId,
    seq: u64,
    topic: Topic,
    variables: Variables,
    retries: Option<u32>,
    context: TaskContext,
    status: TaskStatus,
    lock: Option<Lock>,
    available_at: DateTime<Utc>,
    claims: u32,
}

impl StoredTask {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Open
            && self.available_at <= now
            && self.lock.as_ref().is_none_or(|l| l.expires_at <= now)
    }
}

#[derive(Default)]
struct EngineState {
    tasks: HashMap<TaskId, StoredTask>,
    next_seq: u64,
    history: Vec<CallRecord>,
    rejected: Vec<(TaskId, ClientError)>,
    fetch_faults: VecDeque<ClientError>,
    report_faults: VecDeque<ClientError>,
    fetch_calls: usize,
}

/// `now + d`, saturating at the end of time.
fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl EngineState {
    fn claim(&mut self, request: &FetchRequest, now: DateTime<Utc>) -> Vec<ExternalTask> {
        let wanted: HashMap<&Topic, &TopicRequest> =
            request.topics.iter().map(|t| (&t.topic, t)).collect();

        let mut candidates: Vec<(i64, u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| wanted.contains_key(&t.topic) && t.is_claimable(now))
            .map(|t| (t.context.priority, t.seq, t.id.clone()))
            .collect();
        if request.use_priority {
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        } else {
            candidates.sort_by_key(|c| c.1);
        }

        let mut claimed = Vec::new();
        for (_, _, id) in candidates.into_iter().take(request.max_tasks) {
            let Some(stored) = self.tasks.get_mut(&id) else {
                continue;
            };
            let Some(topic) = wanted.get(&stored.topic) else {
                continue;
            };
            let expires_at = after(now, topic.lock_duration);
            stored.lock = Some(Lock {
                worker_id: request.worker_id.clone(),
                expires_at,
            });
            stored.claims += 1;

            let variables = match &topic.variables {
                Some(names) => stored
                    .variables
                    .iter()
                    .filter(|(k, _)| names.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => stored.variables.clone(),
            };

            let mut task = ExternalTask::new(
                stored.id.clone(),
                stored.topic.clone(),
                request.worker_id.clone(),
                expires_at,
            )
            .with_variables(variables)
            .with_retries(stored.retries);
            task.context = stored.context.clone();
            claimed.push(task);
        }
        claimed
    }

    /// Earliest future instant at which a requested task may become claimable.
    fn next_change(&self, topics: &[TopicRequest], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open && topics.iter().any(|r| r.topic == t.topic))
            .filter_map(|t| {
                let lock_free = t.lock.as_ref().map_or(now, |l| l.expires_at);
                let at = lock_free.max(t.available_at);
                (at > now).then_some(at)
            })
            .min()
    }

    fn check_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let stored = self
            .tasks
            .get(task_id)
            .filter(|t| t.status == TaskStatus::Open)
            .ok_or_else(|| ClientError::NotFound {
                task_id: task_id.clone(),
            })?;

        let lost = |message: String| ClientError::LockLost {
            task_id: task_id.clone(),
            message,
        };
        match &stored.lock {
            None => Err(lost(format!("task {task_id} is not locked"))),
            Some(lock) if &lock.worker_id != worker_id => Err(lost(format!(
                "task {task_id} is locked by worker '{}'",
                lock.worker_id
            ))),
            Some(lock) if lock.expires_at <= now => {
                Err(lost(format!("lock on task {task_id} has expired")))
            }
            Some(_) => Ok(()),
        }
    }

    /// Validate a report against injected faults and lock ownership.
    fn admit(
        &mut self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        if let Some(fault) = self.report_faults.pop_front() {
            return Err(fault);
        }
        if let Err(e) = self.check_lock(task_id, worker_id, now) {
            self.rejected.push((task_id.clone(), e.clone()));
            return Err(e);
        }
        Ok(())
    }

    fn record(
        &mut self,
        task_id: &TaskId,
        worker_id: Option<&WorkerId>,
        call: EngineCall,
        at: DateTime<Utc>,
    ) {
        self.history.push(CallRecord {
            task_id: task_id.clone(),
            worker_id: worker_id.cloned(),
            call,
            at,
        });
    }
}

pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            notify: Notify::new(),
            clock,
        }
    }

    /// Create a task; it is claimable immediately.
    pub async fn add(&self, new: NewTask) -> TaskId {
        let id = TaskId::generate();
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                id.clone(),
                StoredTask {
                    id: id.clone(),
                    seq,
                    topic: new.topic,
                    variables: new.variables,
                    retries: new.retries,
                    context: TaskContext {
                        priority: new.priority,
                        business_key: new.business_key,
                        ..TaskContext::default()
                    },
                    status: TaskStatus::Open,
                    lock: None,
                    available_at: self.clock.now(),
                    claims: 0,
                },
            );
        }
        self.notify.notify_waiters();
        id
    }

    pub async fn snapshot(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        let state = self.state.lock().await;
        state.tasks.get(task_id).map(|t| TaskSnapshot {
            status: t.status.clone(),
            retries: t.retries,
            locked_by: t.lock.as_ref().map(|l| l.worker_id.clone()),
            claims: t.claims,
            variables: t.variables.clone(),
            error_message: t.context.error_message.clone(),
        })
    }

    /// Every accepted call, in arrival order.
    pub async fn history(&self) -> Vec<CallRecord> {
        self.state.lock().await.history.clone()
    }

    /// Accepted reports for one task.
    pub async fn reports_for(&self, task_id: &TaskId) -> Vec<ExecutionResult> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|r| &r.task_id == task_id)
            .filter_map(|r| match &r.call {
                EngineCall::Report(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// Reports refused because of lock ownership.
    pub async fn rejected(&self) -> Vec<(TaskId, ClientError)> {
        self.state.lock().await.rejected.clone()
    }

    pub async fn incidents(&self) -> Vec<TaskId> {
        let state = self.state.lock().await;
        let mut ids: Vec<&StoredTask> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Incident)
            .collect();
        ids.sort_by_key(|t| t.seq);
        ids.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Tasks neither completed, escalated nor in incident.
    pub async fn open_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open)
            .count()
    }

    pub async fn fetch_calls(&self) -> usize {
        self.state.lock().await.fetch_calls
    }

    /// Void the current lock as if its duration had passed.
    pub async fn expire_lock(&self, task_id: &TaskId) {
        {
            let mut state = self.state.lock().await;
            if let Some(t) = state.tasks.get_mut(task_id) {
                t.lock = None;
            }
        }
        self.notify.notify_waiters();
    }

    /// The next fetch fails with `error`.
    pub async fn fail_next_fetch(&self, error: ClientError) {
        self.state.lock().await.fetch_faults.push_back(error);
    }

    /// The next report call fails with `error` without being applied.
    pub async fn fail_next_report(&self, error: ClientError) {
        self.state.lock().await.report_faults.push_back(error);
    }

    /// Wake long-polling fetches, e.g. after moving a test clock.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Poll until no task is open. Returns `false` on timeout.
    pub async fn wait_until_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.open_count().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EngineClient for InMemoryEngine {
    async fn fetch_and_lock(
        &self,
        request: &FetchRequest,
    ) -> Result<Vec<ExternalTask>, ClientError> {
        let deadline = request.async_response_timeout.map(|t| Instant::now() + t);
        {
            let mut state = self.state.lock().await;
            state.fetch_calls += 1;
            if let Some(fault) = state.fetch_faults.pop_front() {
                return Err(fault);
            }
        }

        loop {
            // registered before inspecting state so a concurrent change is not missed
            let notified = self.notify.notified();

            let now = self.clock.now();
            let wake_in = {
                let mut state = self.state.lock().await;
                let claimed = state.claim(request, now);
                if !claimed.is_empty() {
                    debug!(worker_id = %request.worker_id, count = claimed.len(), "tasks locked");
                    return Ok(claimed);
                }
                state
                    .next_change(&request.topics, now)
                    .and_then(|at| (at - now).to_std().ok())
            };

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = match wake_in {
                Some(d) => deadline.min(Instant::now() + d),
                None => deadline,
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        variables: &Variables,
        local_variables: &Variables,
    ) -> Result<(), ClientError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.admit(task_id, worker_id, now)?;
        if let Some(t) = state.tasks.get_mut(task_id) {
            t.status = TaskStatus::Completed;
            t.lock = None;
            t.variables
                .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        state.record(
            task_id,
            Some(worker_id),
            EngineCall::Report(ExecutionResult::Completed {
                variables: variables.clone(),
                local_variables: local_variables.clone(),
            }),
            now,
        );
        Ok(())
    }

    async fn handle_bpmn_error(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        error_code: &str,
        message: &str,
        variables: &Variables,
    ) -> Result<(), ClientError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.admit(task_id, worker_id, now)?;
        if let Some(t) = state.tasks.get_mut(task_id) {
            t.status = TaskStatus::BpmnError {
                error_code: error_code.to_string(),
            };
            t.lock = None;
            t.variables
                .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        state.record(
            task_id,
            Some(worker_id),
            EngineCall::Report(ExecutionResult::BpmnError {
                error_code: error_code.to_string(),
                message: message.to_string(),
                variables: variables.clone(),
            }),
            now,
        );
        Ok(())
    }

    async fn handle_failure(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        message: &str,
        details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> Result<(), ClientError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            state.admit(task_id, worker_id, now)?;
            if let Some(t) = state.tasks.get_mut(task_id) {
                t.retries = Some(retries);
                t.lock = None;
                t.context.error_message = Some(message.to_string());
                t.context.error_details = details.map(str::to_string);
                if retries == 0 {
                    t.status = TaskStatus::Incident;
                } else {
                    t.available_at = after(now, retry_timeout);
                }
            }
            state.record(
                task_id,
                Some(worker_id),
                EngineCall::Report(ExecutionResult::Failure {
                    message: message.to_string(),
                    details: details.map(str::to_string),
                    retries,
                    retry_timeout,
                }),
                now,
            );
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        new_duration: Duration,
    ) -> Result<(), ClientError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Err(e) = state.check_lock(task_id, worker_id, now) {
            state.rejected.push((task_id.clone(), e.clone()));
            return Err(e);
        }
        if let Some(lock) = state.tasks.get_mut(task_id).and_then(|t| t.lock.as_mut()) {
            lock.expires_at = after(now, new_duration);
        }
        state.record(task_id, Some(worker_id), EngineCall::ExtendLock(new_duration), now);
        Ok(())
    }

    async fn unlock(&self, task_id: &TaskId) -> Result<(), ClientError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            let stored = state
                .tasks
                .get_mut(task_id)
                .filter(|t| t.status == TaskStatus::Open)
                .ok_or_else(|| ClientError::NotFound {
                    task_id: task_id.clone(),
                })?;
            stored.lock = None;
            state.record(task_id, None, EngineCall::Unlock, now);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        Ok(())
    }
}
