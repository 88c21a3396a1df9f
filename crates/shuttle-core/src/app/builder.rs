//! WorkerBuilder: wiring and startup validation.
//!
//! Everything that can be checked before the first fetch is checked in
//! `build()`, so a misconfigured worker never starts claiming tasks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::context::{LoopSettings, WorkerContext};
use super::inflight::InFlight;
use super::worker_loop::Worker;
use crate::config::{ConfigError, WorkerConfig};
use crate::domain::Topic;
use crate::error::WorkerError;
use crate::handlers::{
    ExternalTaskHandler, HandlerRegistry, RegistryError, TaskInput, TopicConfig, TypedHandler,
};
use crate::impls::{RestClientConfig, RestEngineClient};
use crate::observability::WorkerStats;
use crate::ports::{Clock, EngineClient, SystemClock};

/// ```ignore
/// let worker = WorkerBuilder::new(config)
///     .client(Arc::new(engine))
///     .register("process-payment", Arc::new(PaymentHandler), topic_config)
///     .expect_topics(&["process-payment"])
///     .build()?;
/// ```
pub struct WorkerBuilder {
    config: WorkerConfig,
    client: Option<Arc<dyn EngineClient>>,
    clock: Arc<dyn Clock>,
    registry: HandlerRegistry,
    // first registration error; reported by build()
    registry_error: Option<RegistryError>,
    expected_topics: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no engine client configured")]
    MissingClient,

    #[error("no handlers registered")]
    NoHandlers,

    #[error("expected topics are not registered: {0:?}")]
    MissingTopics(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            client: None,
            clock: Arc::new(SystemClock),
            registry: HandlerRegistry::new(),
            registry_error: None,
            expected_topics: None,
        }
    }

    /// Builder with a REST client for `config.base_url`.
    pub fn connect(config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;
        let client = RestEngineClient::new(RestClientConfig {
            base_url: config.base_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            http_timeout: config.http_timeout(),
        })?;
        Ok(Self::new(config).client(Arc::new(client)))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn client(mut self, client: Arc<dyn EngineClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn keep_first_error(&mut self, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            self.registry_error.get_or_insert(e);
        }
    }

    pub fn register(
        mut self,
        topic: impl Into<Topic>,
        handler: Arc<dyn ExternalTaskHandler>,
        config: TopicConfig,
    ) -> Self {
        let result = self.registry.register(topic, handler, config);
        self.keep_first_error(result);
        self
    }

    /// Register `handler` with the topic settings from the worker config.
    pub fn register_configured(
        self,
        topic: impl Into<Topic>,
        handler: Arc<dyn ExternalTaskHandler>,
    ) -> Self {
        let topic = topic.into();
        let config = self.config.topic_config(topic.as_str());
        self.register(topic, handler, config)
    }

    pub fn register_typed<T: TaskInput, H: TypedHandler<T> + 'static>(
        mut self,
        handler: H,
        config: TopicConfig,
    ) -> Self {
        let result = self.registry.register_typed::<T, H>(handler, config);
        self.keep_first_error(result);
        self
    }

    /// Topics that must have a handler for `build()` to succeed.
    pub fn expect_topics(mut self, topics: &[&str]) -> Self {
        self.expected_topics = Some(topics.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        if let Some(e) = self.registry_error {
            return Err(e.into());
        }
        self.config.validate()?;
        let client = self.client.ok_or(BuildError::MissingClient)?;
        if self.registry.is_empty() {
            return Err(BuildError::NoHandlers);
        }
        if let Some(expected) = &self.expected_topics {
            let registered = self.registry.topics();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.iter().any(|r| r.as_str() == t.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTopics(missing));
            }
        }

        let (backoff_initial, backoff_max) = self.config.claim_backoff();
        let settings = LoopSettings {
            max_tasks: self.config.max_tasks,
            use_priority: self.config.use_priority,
            async_response_timeout: self.config.async_response_timeout(),
            poll_interval: self.config.poll_interval(),
            backoff_initial,
            backoff_max,
            report_attempts: self.config.report_attempts,
            shutdown_grace: self.config.shutdown_grace(),
        };

        Ok(Worker {
            ctx: WorkerContext {
                worker_id: self.config.resolve_worker_id(),
                client,
                clock: self.clock,
                registry: self.registry,
                retry: self.config.retry_policy(),
                settings,
                stats: Arc::new(WorkerStats::new()),
                inflight: InFlight::new(),
                shutdown: CancellationToken::new(),
            },
        })
    }
}
