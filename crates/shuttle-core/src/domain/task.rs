use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, Topic, WorkerId};
use super::variables::{FromVariable, VariableError, VariableValue, Variables};

/// One claimed unit of work.
///
/// Built from the fetch-and-lock response and never mutated afterwards;
/// outcomes are reported as separate messages through the engine client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTask {
    pub id: TaskId,
    pub topic: Topic,
    pub worker_id: WorkerId,

    #[serde(default)]
    pub variables: Variables,

    /// `None` until the first failure has been reported for this task.
    pub retries: Option<u32>,

    /// After this instant the claim is void and another worker may take the task.
    pub lock_expiration_time: DateTime<Utc>,

    #[serde(default)]
    pub context: TaskContext,
}

/// Engine-side context of a task (where in which process it came from).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub activity_id: Option<String>,
    pub activity_instance_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    /// Message of the last reported failure, if any.
    pub error_message: Option<String>,
    pub error_details: Option<String>,
}

impl ExternalTask {
    pub fn new(
        id: TaskId,
        topic: Topic,
        worker_id: WorkerId,
        lock_expiration_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            topic,
            worker_id,
            variables: Variables::new(),
            retries: None,
            lock_expiration_time,
            context: TaskContext::default(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_retries(mut self, retries: Option<u32>) -> Self {
        self.retries = retries;
        self
    }

    pub fn raw_variable(&self, name: &str) -> Option<&VariableValue> {
        self.variables.get(name)
    }

    /// Read a typed variable.
    ///
    /// Absent and `Null` both read as `Ok(None)`; a value of another type is an error.
    pub fn variable<T: FromVariable>(&self, name: &str) -> Result<Option<T>, VariableError> {
        match self.variables.get(name) {
            None | Some(VariableValue::Null) => Ok(None),
            Some(value) => T::from_variable(value).map(Some).ok_or_else(|| {
                VariableError::TypeMismatch {
                    name: name.to_string(),
                    expected: T::EXPECTED,
                    found: value.type_name(),
                }
            }),
        }
    }

    /// Read a typed variable that must be present.
    pub fn require<T: FromVariable>(&self, name: &str) -> Result<T, VariableError> {
        self.variable(name)?
            .ok_or_else(|| VariableError::Missing(name.to_string()))
    }

    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lock_expiration_time
    }

    /// Time left on the lock; zero once it has expired.
    pub fn lock_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.lock_expiration_time - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::variables::variables;
    use chrono::TimeZone;

    fn task() -> ExternalTask {
        let lock = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        ExternalTask::new(
            TaskId::new("t-1"),
            Topic::new("process-payment"),
            WorkerId::new("worker-a"),
            lock,
        )
        .with_variables(variables([
            ("amount", VariableValue::from(42.0)),
            ("customerId", VariableValue::from("c-7")),
            ("note", VariableValue::Null),
        ]))
    }

    #[test]
    fn typed_reads() {
        let t = task();
        assert_eq!(t.variable::<f64>("amount").unwrap(), Some(42.0));
        assert_eq!(t.require::<String>("customerId").unwrap(), "c-7");
        assert_eq!(t.variable::<String>("note").unwrap(), None);
        assert_eq!(t.variable::<String>("absent").unwrap(), None);
    }

    #[test]
    fn wrong_type_is_reported_with_both_types() {
        let err = task().variable::<bool>("amount").unwrap_err();
        assert_eq!(
            err,
            VariableError::TypeMismatch {
                name: "amount".into(),
                expected: "Boolean",
                found: "Double",
            }
        );
    }

    #[test]
    fn require_reports_missing() {
        let err = task().require::<String>("absent").unwrap_err();
        assert_eq!(err, VariableError::Missing("absent".into()));
    }

    #[test]
    fn lock_expiry() {
        let t = task();
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();

        assert!(!t.is_lock_expired(before));
        assert_eq!(t.lock_remaining(before), Duration::from_secs(30));
        assert!(t.is_lock_expired(after));
        assert_eq!(t.lock_remaining(after), Duration::ZERO);
    }
}
