//! Execution result: what a handler decided for one claimed task.
//!
//! Exactly one result is produced per claimed task and it maps 1:1 to a
//! report call on the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::variables::{VariableValue, Variables};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResult {
    /// Work is done; the process moves on.
    Completed {
        #[serde(default)]
        variables: Variables,
        #[serde(default)]
        local_variables: Variables,
    },

    /// A modelled business failure, routed to an error boundary event.
    /// Never retried.
    BpmnError {
        error_code: String,
        message: String,
        #[serde(default)]
        variables: Variables,
    },

    /// A technical failure. The engine stores `retries` and makes the task
    /// fetchable again after `retry_timeout`; at zero retries it raises an incident.
    Failure {
        message: String,
        details: Option<String>,
        retries: u32,
        #[serde(with = "duration_ms")]
        retry_timeout: Duration,
    },
}

/// Variant discriminator, for stats and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultKind {
    Completed,
    BpmnError,
    Failure,
}

impl ExecutionResult {
    pub fn complete() -> Self {
        ExecutionResult::Completed {
            variables: Variables::new(),
            local_variables: Variables::new(),
        }
    }

    pub fn complete_with(variables: Variables) -> Self {
        ExecutionResult::Completed {
            variables,
            local_variables: Variables::new(),
        }
    }

    pub fn bpmn_error(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutionResult::BpmnError {
            error_code: error_code.into(),
            message: message.into(),
            variables: Variables::new(),
        }
    }

    pub fn failure(
        message: impl Into<String>,
        details: Option<String>,
        retries: u32,
        retry_timeout: Duration,
    ) -> Self {
        ExecutionResult::Failure {
            message: message.into(),
            details,
            retries,
            retry_timeout,
        }
    }

    /// Add a process variable (Completed / BpmnError only; ignored for Failure).
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        match &mut self {
            ExecutionResult::Completed { variables, .. }
            | ExecutionResult::BpmnError { variables, .. } => {
                variables.insert(name.into(), value.into());
            }
            ExecutionResult::Failure { .. } => {}
        }
        self
    }

    /// Add a variable local to the activity (Completed only).
    pub fn with_local_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<VariableValue>,
    ) -> Self {
        if let ExecutionResult::Completed {
            local_variables, ..
        } = &mut self
        {
            local_variables.insert(name.into(), value.into());
        }
        self
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            ExecutionResult::Completed { .. } => ResultKind::Completed,
            ExecutionResult::BpmnError { .. } => ResultKind::BpmnError,
            ExecutionResult::Failure { .. } => ResultKind::Failure,
        }
    }

    /// A failure with no retries left; the engine turns it into an incident.
    pub fn is_incident(&self) -> bool {
        matches!(self, ExecutionResult::Failure { retries: 0, .. })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
