//! State shared by the claim loops and every execution of one worker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::inflight::InFlight;
use crate::domain::{RetryPolicy, WorkerId};
use crate::handlers::HandlerRegistry;
use crate::observability::WorkerStats;
use crate::ports::{Clock, EngineClient};

/// Loop timing and limits, resolved from the config at build time.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_tasks: usize,
    pub use_priority: bool,
    pub async_response_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub report_attempts: u32,
    pub shutdown_grace: Duration,
}

impl LoopSettings {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max)
    }
}

pub struct WorkerContext {
    pub worker_id: WorkerId,
    pub client: Arc<dyn EngineClient>,
    pub clock: Arc<dyn Clock>,
    pub registry: HandlerRegistry,
    pub retry: RetryPolicy,
    pub settings: LoopSettings,
    pub stats: Arc<WorkerStats>,
    pub inflight: InFlight,
    pub shutdown: CancellationToken,
}
