//! HandlerRegistry - topic -> handler + トピックごとの claim 設定
//!
//! # ライフサイクル
//! 1. 起動時に `WorkerBuilder` 経由で登録する（重複や不正な設定はここでエラー）
//! 2. `build()` で `WorkerContext` に移り、以後は読み取り専用
//!
//! `WorkerContext` は `Arc` で claim ループと全実行に共有されるので、
//! `resolve` にロックは要らない。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::handler::ExternalTaskHandler;
use super::input::{TaskInput, Typed, TypedHandler};
use crate::domain::Topic;
use crate::ports::TopicRequest;

/// How tasks of one topic are claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicConfig {
    /// How long a claim is held before it must be extended or becomes reclaimable.
    pub lock_duration: Duration,

    /// Upper bound on tasks of this topic held by this worker at once.
    pub max_concurrent: usize,

    /// Restrict fetched variables; `None` fetches all.
    pub variables: Option<Vec<String>>,

    pub local_variables: bool,

    /// Keep extending the lock while the handler runs.
    pub auto_extend_lock: bool,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_concurrent: 4,
            variables: None,
            local_variables: false,
            auto_extend_lock: false,
        }
    }
}

impl TopicConfig {
    pub fn new(lock_duration: Duration) -> Self {
        Self {
            lock_duration,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_local_variables(mut self, local: bool) -> Self {
        self.local_variables = local;
        self
    }

    pub fn with_auto_extend_lock(mut self, enabled: bool) -> Self {
        self.auto_extend_lock = enabled;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.lock_duration.is_zero() {
            return Err("lock_duration must be positive".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A registered handler and its settings.
pub struct Registration {
    pub topic: Topic,
    pub handler: Arc<dyn ExternalTaskHandler>,
    pub config: TopicConfig,
}

impl Registration {
    pub fn topic_request(&self) -> TopicRequest {
        TopicRequest {
            topic: self.topic.clone(),
            lock_duration: self.config.lock_duration,
            variables: self.config.variables.clone(),
            local_variables: self.config.local_variables,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for topic '{0}' is already registered")]
    AlreadyRegistered(Topic),

    #[error("no handler registered for topic '{0}'")]
    NotFound(Topic),

    #[error("invalid settings for topic '{topic}': {reason}")]
    InvalidConfig { topic: Topic, reason: String },
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Topic, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `topic`. A topic can only be registered once.
    pub fn register(
        &mut self,
        topic: impl Into<Topic>,
        handler: Arc<dyn ExternalTaskHandler>,
        config: TopicConfig,
    ) -> Result<(), RegistryError> {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            return Err(RegistryError::AlreadyRegistered(topic));
        }
        config
            .validate()
            .map_err(|reason| RegistryError::InvalidConfig {
                topic: topic.clone(),
                reason,
            })?;
        self.handlers.insert(
            topic.clone(),
            Registration {
                topic,
                handler,
                config,
            },
        );
        Ok(())
    }

    /// Register a typed handler under `T::TOPIC`.
    pub fn register_typed<T: TaskInput, H: TypedHandler<T> + 'static>(
        &mut self,
        handler: H,
        config: TopicConfig,
    ) -> Result<(), RegistryError> {
        self.register(T::TOPIC, Arc::new(Typed::<T, H>::new(handler)), config)
    }

    pub fn resolve(&self, topic: &Topic) -> Result<&Registration, RegistryError> {
        self.handlers
            .get(topic)
            .ok_or_else(|| RegistryError::NotFound(topic.clone()))
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionResult;
    use crate::handlers::handler::handler_fn;
    use crate::handlers::input::tests::{Greeting, GreetingHandler};

    fn ok_handler() -> Arc<dyn ExternalTaskHandler> {
        Arc::new(handler_fn(|_task, _cancel| async {
            Ok(ExecutionResult::complete())
        }))
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("process-payment", ok_handler(), TopicConfig::default())
            .unwrap();

        let reg = registry.resolve(&Topic::new("process-payment")).unwrap();
        assert_eq!(reg.topic.as_str(), "process-payment");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("process-payment", ok_handler(), TopicConfig::default())
            .unwrap();
        let err = registry
            .register("process-payment", ok_handler(), TopicConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyRegistered(Topic::new("process-payment"))
        );
    }

    #[test]
    fn unknown_topic_is_not_found() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.resolve(&Topic::new("nope")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(
                "a",
                ok_handler(),
                TopicConfig::default().with_max_concurrent(0),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn typed_registration_uses_the_input_topic() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_typed::<Greeting, _>(GreetingHandler, TopicConfig::default())
            .unwrap();
        registry
            .register("another", ok_handler(), TopicConfig::default())
            .unwrap();

        assert_eq!(
            registry.topics(),
            vec![Topic::new("another"), Topic::new("greet")]
        );
    }

    #[test]
    fn topic_request_reflects_config() {
        let mut registry = HandlerRegistry::new();
        let config = TopicConfig::new(Duration::from_secs(60))
            .with_variables(["amount", "customerId"])
            .with_local_variables(true);
        registry.register("pay", ok_handler(), config).unwrap();

        let req = registry
            .resolve(&Topic::new("pay"))
            .unwrap()
            .topic_request();
        assert_eq!(req.lock_duration, Duration::from_secs(60));
        assert_eq!(
            req.variables,
            Some(vec!["amount".to_string(), "customerId".to_string()])
        );
        assert!(req.local_variables);
    }
}
