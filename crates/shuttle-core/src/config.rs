//! Worker configuration.
//!
//! Sources, lowest to highest priority:
//! 1. defaults
//! 2. TOML file (`[worker]` table plus `[topics.<name>]` tables)
//! 3. `SHUTTLE_*` environment variables
//! 4. command-line flags (applied by the binary)
//!
//! All durations are in milliseconds.
//!
//! ```toml
//! [worker]
//! base_url = "http://localhost:8080/engine-rest"
//! worker_id = "payments-1"
//! max_tasks = 10
//! async_response_timeout_ms = 10000
//!
//! [topics.process-payment]
//! lock_duration_ms = 60000
//! max_concurrent = 4
//! variables = ["amount", "customerId"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::domain::{RetryPolicy, WorkerId};
use crate::handlers::TopicConfig;

pub const ENV_PREFIX: &str = "SHUTTLE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(String),

    #[error("invalid value '{value}' for {var}")]
    Env { var: String, value: String },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Per-topic overrides of the worker-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicOverrides {
    pub lock_duration_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub auto_extend_lock: Option<bool>,
    pub variables: Option<Vec<String>>,
    pub local_variables: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Generated (`worker-<ulid>`) when absent.
    pub worker_id: Option<String>,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Upper bound on tasks requested by one fetch; also the default
    /// per-topic concurrency.
    pub max_tasks: usize,
    pub use_priority: bool,

    /// Long-poll timeout; 0 disables long polling.
    pub async_response_timeout_ms: u64,
    /// Pause after an empty fetch when long polling is disabled.
    pub poll_interval_ms: u64,
    pub lock_duration_ms: u64,

    pub default_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,

    /// Attempts per report before it is dropped.
    pub report_attempts: u32,
    pub claim_backoff_initial_ms: u64,
    pub claim_backoff_max_ms: u64,
    pub shutdown_grace_ms: u64,
    pub http_timeout_ms: u64,

    pub topics: BTreeMap<String, TopicOverrides>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            base_url: "http://localhost:8080/engine-rest".to_string(),
            username: None,
            password: None,
            max_tasks: 10,
            use_priority: true,
            async_response_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            lock_duration_ms: 30_000,
            default_retries: 3,
            retry_delay_ms: 5_000,
            retry_backoff_multiplier: 1.0,
            max_retry_delay_ms: 300_000,
            report_attempts: 3,
            claim_backoff_initial_ms: 500,
            claim_backoff_max_ms: 30_000,
            shutdown_grace_ms: 10_000,
            http_timeout_ms: 30_000,
            topics: BTreeMap::new(),
        }
    }
}

fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    let var = format!("{ENV_PREFIX}{key}");
    if let Some(value) = lookup(&var) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value })?;
    }
    Ok(())
}

fn override_opt(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut Option<String>,
) {
    if let Some(value) = lookup(&format!("{ENV_PREFIX}{key}")) {
        *target = Some(value);
    }
}

impl WorkerConfig {
    /// Defaults or the given file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct FileConfig {
            #[serde(default)]
            worker: WorkerConfig,
            #[serde(default)]
            topics: BTreeMap<String, TopicOverrides>,
        }

        let file: FileConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = file.worker;
        config.topics.extend(file.topics);
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `SHUTTLE_*` overrides read through `lookup`.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        override_opt(&lookup, "WORKER_ID", &mut self.worker_id);
        override_from(&lookup, "BASE_URL", &mut self.base_url)?;
        override_opt(&lookup, "USERNAME", &mut self.username);
        override_opt(&lookup, "PASSWORD", &mut self.password);
        override_from(&lookup, "MAX_TASKS", &mut self.max_tasks)?;
        override_from(&lookup, "USE_PRIORITY", &mut self.use_priority)?;
        override_from(
            &lookup,
            "ASYNC_RESPONSE_TIMEOUT_MS",
            &mut self.async_response_timeout_ms,
        )?;
        override_from(&lookup, "POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        override_from(&lookup, "LOCK_DURATION_MS", &mut self.lock_duration_ms)?;
        override_from(&lookup, "DEFAULT_RETRIES", &mut self.default_retries)?;
        override_from(&lookup, "RETRY_DELAY_MS", &mut self.retry_delay_ms)?;
        override_from(
            &lookup,
            "RETRY_BACKOFF_MULTIPLIER",
            &mut self.retry_backoff_multiplier,
        )?;
        override_from(&lookup, "MAX_RETRY_DELAY_MS", &mut self.max_retry_delay_ms)?;
        override_from(&lookup, "REPORT_ATTEMPTS", &mut self.report_attempts)?;
        override_from(
            &lookup,
            "CLAIM_BACKOFF_INITIAL_MS",
            &mut self.claim_backoff_initial_ms,
        )?;
        override_from(&lookup, "CLAIM_BACKOFF_MAX_MS", &mut self.claim_backoff_max_ms)?;
        override_from(&lookup, "SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms)?;
        override_from(&lookup, "HTTP_TIMEOUT_MS", &mut self.http_timeout_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(invalid("worker_id", "must not be empty"));
        }

        let url = Url::parse(&self.base_url).map_err(|e| invalid("base_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("base_url", "scheme must be http or https"));
        }

        let positive = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("lock_duration_ms", self.lock_duration_ms),
            ("retry_delay_ms", self.retry_delay_ms),
            ("max_retry_delay_ms", self.max_retry_delay_ms),
            ("claim_backoff_initial_ms", self.claim_backoff_initial_ms),
            ("claim_backoff_max_ms", self.claim_backoff_max_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
            ("http_timeout_ms", self.http_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }
        if self.max_tasks == 0 {
            return Err(invalid("max_tasks", "must be at least 1"));
        }
        if self.report_attempts == 0 {
            return Err(invalid("report_attempts", "must be at least 1"));
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(invalid("retry_backoff_multiplier", "must be >= 1.0"));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(invalid("max_retry_delay_ms", "must be >= retry_delay_ms"));
        }
        if self.claim_backoff_max_ms < self.claim_backoff_initial_ms {
            return Err(invalid(
                "claim_backoff_max_ms",
                "must be >= claim_backoff_initial_ms",
            ));
        }
        if self.http_timeout_ms <= self.async_response_timeout_ms {
            return Err(invalid(
                "http_timeout_ms",
                "must be longer than async_response_timeout_ms",
            ));
        }

        for (topic, o) in &self.topics {
            if o.lock_duration_ms == Some(0) {
                return Err(invalid(
                    format!("topics.{topic}.lock_duration_ms"),
                    "must be greater than 0",
                ));
            }
            if o.max_concurrent == Some(0) {
                return Err(invalid(
                    format!("topics.{topic}.max_concurrent"),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }

    /// Configured id, or a freshly generated one.
    pub fn resolve_worker_id(&self) -> WorkerId {
        match &self.worker_id {
            Some(id) => WorkerId::new(id.clone()),
            None => WorkerId::generate(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            default_retries: self.default_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            multiplier: self.retry_backoff_multiplier,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    /// Claim settings for `topic`, worker-wide defaults overlaid with `[topics.<topic>]`.
    pub fn topic_config(&self, topic: &str) -> TopicConfig {
        let base = TopicConfig::new(Duration::from_millis(self.lock_duration_ms))
            .with_max_concurrent(self.max_tasks);
        let Some(o) = self.topics.get(topic) else {
            return base;
        };
        TopicConfig {
            lock_duration: o
                .lock_duration_ms
                .map(Duration::from_millis)
                .unwrap_or(base.lock_duration),
            max_concurrent: o.max_concurrent.unwrap_or(base.max_concurrent),
            variables: o.variables.clone(),
            local_variables: o.local_variables.unwrap_or(false),
            auto_extend_lock: o.auto_extend_lock.unwrap_or(false),
        }
    }

    pub fn async_response_timeout(&self) -> Option<Duration> {
        (self.async_response_timeout_ms > 0)
            .then(|| Duration::from_millis(self.async_response_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.claim_backoff_initial_ms),
            Duration::from_millis(self.claim_backoff_max_ms),
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_worker_and_topic_tables() {
        let config = WorkerConfig::from_toml(
            r#"
            [worker]
            base_url = "http://engine:8080/engine-rest"
            worker_id = "payments-1"
            max_tasks = 5

            [topics.process-payment]
            lock_duration_ms = 60000
            max_concurrent = 2
            variables = ["amount", "customerId"]
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_id.as_deref(), Some("payments-1"));
        assert_eq!(config.max_tasks, 5);
        assert_eq!(config.retry_delay_ms, 5_000);

        let topic = config.topic_config("process-payment");
        assert_eq!(topic.lock_duration, Duration::from_secs(60));
        assert_eq!(topic.max_concurrent, 2);
        assert_eq!(
            topic.variables,
            Some(vec!["amount".to_string(), "customerId".to_string()])
        );

        let other = config.topic_config("unlisted");
        assert_eq!(other.lock_duration, Duration::from_secs(30));
        assert_eq!(other.max_concurrent, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = WorkerConfig::from_toml("[worker]\nmax_taks = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = WorkerConfig::from_toml("[worker]\nmax_tasks = 5\n").unwrap();
        config
            .apply_overrides_from(env(&[
                ("SHUTTLE_MAX_TASKS", "7"),
                ("SHUTTLE_WORKER_ID", "from-env"),
                ("SHUTTLE_USE_PRIORITY", "false"),
            ]))
            .unwrap();

        assert_eq!(config.max_tasks, 7);
        assert_eq!(config.worker_id.as_deref(), Some("from-env"));
        assert!(!config.use_priority);
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_overrides_from(env(&[("SHUTTLE_RETRY_DELAY_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var, .. } if var == "SHUTTLE_RETRY_DELAY_MS"));
    }

    #[rstest]
    #[case::zero_lock(|c: &mut WorkerConfig| c.lock_duration_ms = 0, "lock_duration_ms")]
    #[case::zero_batch(|c: &mut WorkerConfig| c.max_tasks = 0, "max_tasks")]
    #[case::zero_retry_delay(|c: &mut WorkerConfig| c.retry_delay_ms = 0, "retry_delay_ms")]
    #[case::bad_url(|c: &mut WorkerConfig| c.base_url = "not a url".into(), "base_url")]
    #[case::ftp_url(|c: &mut WorkerConfig| c.base_url = "ftp://engine".into(), "base_url")]
    #[case::http_shorter_than_poll(
        |c: &mut WorkerConfig| c.http_timeout_ms = c.async_response_timeout_ms,
        "http_timeout_ms"
    )]
    #[case::shrinking_backoff(|c: &mut WorkerConfig| c.retry_backoff_multiplier = 0.5, "retry_backoff_multiplier")]
    #[case::empty_worker_id(|c: &mut WorkerConfig| c.worker_id = Some(" ".into()), "worker_id")]
    #[case::zero_topic_concurrency(
        |c: &mut WorkerConfig| {
            c.topics.insert(
                "t".into(),
                TopicOverrides { max_concurrent: Some(0), ..Default::default() },
            );
        },
        "topics.t.max_concurrent"
    )]
    fn invalid_settings_are_rejected(#[case] mutate: fn(&mut WorkerConfig), #[case] field: &str) {
        let mut config = WorkerConfig::default();
        mutate(&mut config);
        match config.validate() {
            Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected invalid {field}, got {other:?}"),
        }
    }

    #[test]
    fn retry_policy_mirrors_settings() {
        let config = WorkerConfig {
            default_retries: 5,
            retry_delay_ms: 1_000,
            retry_backoff_multiplier: 2.0,
            max_retry_delay_ms: 8_000,
            ..WorkerConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.default_retries, 5);
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn zero_long_poll_disables_it() {
        let config = WorkerConfig {
            async_response_timeout_ms: 0,
            ..WorkerConfig::default()
        };
        assert_eq!(config.async_response_timeout(), None);
    }
}
