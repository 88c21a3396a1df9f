//! Wire shapes of the engine's external-task REST API (camelCase JSON).

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ExternalTask, TaskContext, TaskId, Topic, VariableValue, Variables, WorkerId};
use crate::ports::{ClientError, FetchRequest};

/// Date layout the engine reads and writes, e.g. `2024-03-01T10:15:00.000+0000`.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub fn format_date(d: &DateTime<Utc>) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_str(s, DATE_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("invalid date '{s}': {e}"))
}

/// `{ "value": ..., "type": "String", "valueInfo": {...} }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDto {
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_info: Option<Value>,
}

impl VariableDto {
    fn typed(type_name: &str, value: Value) -> Self {
        Self {
            value,
            type_name: Some(type_name.to_string()),
            value_info: None,
        }
    }

    pub fn encode(value: &VariableValue) -> Self {
        let type_name = value.type_name();
        match value {
            VariableValue::Null => Self::typed(type_name, Value::Null),
            VariableValue::String(s) => Self::typed(type_name, Value::String(s.clone())),
            VariableValue::Integer(i) => Self::typed(type_name, Value::from(*i)),
            VariableValue::Long(l) => Self::typed(type_name, Value::from(*l)),
            VariableValue::Double(d) => Self::typed(type_name, Value::from(*d)),
            VariableValue::Boolean(b) => Self::typed(type_name, Value::Bool(*b)),
            VariableValue::Date(d) => Self::typed(type_name, Value::String(format_date(d))),
            VariableValue::Bytes(b) => Self::typed(type_name, Value::String(BASE64.encode(b))),
            // the engine stores JSON variables as their serialized text
            VariableValue::Json(v) => Self::typed(type_name, Value::String(v.to_string())),
            VariableValue::Object {
                value,
                object_type_name,
                serialization_format,
            } => {
                let mut info = Map::new();
                if let Some(name) = object_type_name {
                    info.insert("objectTypeName".into(), Value::String(name.clone()));
                }
                if let Some(format) = serialization_format {
                    info.insert(
                        "serializationDataFormat".into(),
                        Value::String(format.clone()),
                    );
                }
                let value = match value {
                    Value::String(_) => value.clone(),
                    other => Value::String(other.to_string()),
                };
                Self {
                    value,
                    type_name: Some(type_name.to_string()),
                    value_info: Some(Value::Object(info)),
                }
            }
        }
    }

    pub fn decode(self) -> Result<VariableValue, String> {
        let type_name = self
            .type_name
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        if self.value.is_null() && type_name != "json" && type_name != "object" {
            return Ok(VariableValue::Null);
        }

        let value = self.value;
        let mismatch = |expected: &str, v: &Value| format!("expected {expected}, got {v}");

        match type_name.as_str() {
            "null" => Ok(VariableValue::Null),
            "string" => match value {
                Value::String(s) => Ok(VariableValue::String(s)),
                other => Ok(VariableValue::String(other.to_string())),
            },
            "integer" | "short" => value
                .as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .map(VariableValue::Integer)
                .ok_or_else(|| mismatch("an integer", &value)),
            "long" => value
                .as_i64()
                .map(VariableValue::Long)
                .ok_or_else(|| mismatch("a long", &value)),
            "double" => value
                .as_f64()
                .map(VariableValue::Double)
                .ok_or_else(|| mismatch("a double", &value)),
            "boolean" => value
                .as_bool()
                .map(VariableValue::Boolean)
                .ok_or_else(|| mismatch("a boolean", &value)),
            "date" => value
                .as_str()
                .ok_or_else(|| mismatch("a date string", &value))
                .and_then(parse_date)
                .map(VariableValue::Date),
            "bytes" | "file" => value
                .as_str()
                .ok_or_else(|| mismatch("base64 text", &value))
                .and_then(|s| BASE64.decode(s).map_err(|e| e.to_string()))
                .map(VariableValue::Bytes),
            "json" => Ok(VariableValue::Json(parse_embedded_json(value))),
            "object" => {
                let info = self.value_info.unwrap_or(Value::Null);
                let serialization_format = info
                    .get("serializationDataFormat")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let is_json = serialization_format
                    .as_deref()
                    .is_some_and(|f| f.contains("json"));
                Ok(VariableValue::Object {
                    value: if is_json {
                        parse_embedded_json(value)
                    } else {
                        value
                    },
                    object_type_name: info
                        .get("objectTypeName")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    serialization_format,
                })
            }
            // untyped or unknown: keep the raw JSON
            _ => Ok(VariableValue::Json(value)),
        }
    }
}

fn parse_embedded_json(value: Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    }
}

pub fn encode_variables(vars: &Variables) -> HashMap<&str, VariableDto> {
    vars.iter()
        .map(|(k, v)| (k.as_str(), VariableDto::encode(v)))
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicBody<'a> {
    pub topic_name: &'a str,
    pub lock_duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<&'a [String]>,
    pub local_variables: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAndLockBody<'a> {
    pub worker_id: &'a str,
    pub max_tasks: usize,
    pub use_priority: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_response_timeout: Option<u64>,
    pub topics: Vec<TopicBody<'a>>,
}

impl<'a> From<&'a FetchRequest> for FetchAndLockBody<'a> {
    fn from(req: &'a FetchRequest) -> Self {
        Self {
            worker_id: req.worker_id.as_str(),
            max_tasks: req.max_tasks,
            use_priority: req.use_priority,
            async_response_timeout: req.async_response_timeout.map(millis),
            topics: req
                .topics
                .iter()
                .map(|t| TopicBody {
                    topic_name: t.topic.as_str(),
                    lock_duration: millis(t.lock_duration),
                    variables: t.variables.as_deref(),
                    local_variables: t.local_variables,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBody<'a> {
    pub worker_id: &'a str,
    pub variables: HashMap<&'a str, VariableDto>,
    pub local_variables: HashMap<&'a str, VariableDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BpmnErrorBody<'a> {
    pub worker_id: &'a str,
    pub error_code: &'a str,
    pub error_message: &'a str,
    pub variables: HashMap<&'a str, VariableDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureBody<'a> {
    pub worker_id: &'a str,
    pub error_message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<&'a str>,
    pub retries: u32,
    pub retry_timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendLockBody<'a> {
    pub worker_id: &'a str,
    pub new_duration: u64,
}

/// Error body the engine sends with non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct EngineErrorDto {
    #[serde(default)]
    pub message: Option<String>,
}

/// One entry of a fetch-and-lock response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedTaskDto {
    pub id: String,
    pub topic_name: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub lock_expiration_time: Option<String>,
    #[serde(default)]
    pub retries: Option<i64>,
    #[serde(default)]
    pub variables: HashMap<String, VariableDto>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub activity_instance_id: Option<String>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub process_definition_key: Option<String>,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
}

impl LockedTaskDto {
    /// `fallback_worker` and `fallback_expiry` fill in fields older engines omit.
    pub fn into_task(
        self,
        fallback_worker: &WorkerId,
        fallback_expiry: DateTime<Utc>,
    ) -> Result<ExternalTask, ClientError> {
        let lock_expiration_time = match self.lock_expiration_time.as_deref() {
            Some(s) => parse_date(s).map_err(ClientError::Decode)?,
            None => fallback_expiry,
        };

        let mut variables = Variables::with_capacity(self.variables.len());
        for (name, dto) in self.variables {
            let value = dto
                .decode()
                .map_err(|e| ClientError::Decode(format!("variable '{name}': {e}")))?;
            variables.insert(name, value);
        }

        let worker_id = self
            .worker_id
            .map(WorkerId::from)
            .unwrap_or_else(|| fallback_worker.clone());

        let mut task = ExternalTask::new(
            TaskId::from(self.id),
            Topic::from(self.topic_name),
            worker_id,
            lock_expiration_time,
        )
        .with_variables(variables)
        .with_retries(self.retries.map(|r| u32::try_from(r.max(0)).unwrap_or(u32::MAX)));

        task.context = TaskContext {
            activity_id: self.activity_id,
            activity_instance_id: self.activity_instance_id,
            process_instance_id: self.process_instance_id,
            process_definition_key: self.process_definition_key,
            business_key: self.business_key,
            tenant_id: self.tenant_id,
            priority: self.priority,
            error_message: self.error_message,
            error_details: self.error_details,
        };
        Ok(task)
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionDto {
    pub version: String,
}
