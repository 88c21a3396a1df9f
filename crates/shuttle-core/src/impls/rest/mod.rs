//! `EngineClient` over the engine's REST API.

mod dto;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use tracing::{debug, trace, warn};
use url::Url;

use self::dto::{
    BpmnErrorBody, CompleteBody, EngineErrorDto, ExtendLockBody, FailureBody, FetchAndLockBody,
    LockedTaskDto, VersionDto, encode_variables, millis,
};
use crate::domain::{ExternalTask, TaskId, Variables, WorkerId};
use crate::ports::{ClientError, EngineClient, FetchRequest};

pub use self::dto::{DATE_FORMAT, VariableDto};

/// Connection settings for [`RestEngineClient`].
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// e.g. `http://localhost:8080/engine-rest`
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout; must exceed the long-poll timeout.
    pub http_timeout: Duration,
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: None,
            password: None,
            http_timeout: Duration::from_secs(60),
        }
    }
}

pub struct RestEngineClient {
    base_url: Url,
    http: reqwest::Client,
    credentials: Option<(String, Option<String>)>,
}

impl RestEngineClient {
    pub fn new(config: RestClientConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::Transport(format!("invalid base url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Transport(format!(
                "invalid base url: {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            base_url,
            http,
            credentials: config.username.map(|u| (u, config.password)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/seg/seg/...`; each segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Transport(format!("invalid base url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn task_endpoint(&self, task_id: &TaskId, action: &str) -> Result<Url, ClientError> {
        self.endpoint(&["external-task", task_id.as_str(), action])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        trace!(%method, %url, "engine request");
        let req = self.http.request(method, url);
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, password.as_ref()),
            None => req,
        }
    }

    async fn send(
        &self,
        req: RequestBuilder,
        task_id: Option<&TaskId>,
    ) -> Result<Response, ClientError> {
        let resp = req.send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<EngineErrorDto>(&text)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or(text);
        debug!(status = status.as_u16(), %message, "engine rejected request");
        Err(classify(status.as_u16(), message, task_id))
    }
}

impl RestEngineClient {
    /// A locked task we cannot read can never succeed here; fail it with no
    /// retries so the engine raises an incident instead of re-offering it.
    async fn fail_undecodable(
        &self,
        task_id: Option<TaskId>,
        worker_id: &WorkerId,
        error: ClientError,
    ) {
        let Some(task_id) = task_id else {
            warn!(error = %error, "locked task without an id, left for its lock to expire");
            return;
        };
        warn!(%task_id, error = %error, "cannot decode locked task, failing it without retries");
        let details = error.to_string();
        if let Err(e) = self
            .handle_failure(
                &task_id,
                worker_id,
                "cannot decode external task",
                Some(&details),
                0,
                Duration::ZERO,
            )
            .await
        {
            warn!(%task_id, error = %e, "failure report for undecodable task was not accepted");
        }
    }
}

/// Expiry used when the engine omits `lockExpirationTime`.
fn fallback_expiry(request: &FetchRequest, topic: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let lock = request
        .topics
        .iter()
        .find(|t| t.topic.as_str() == topic)
        .map(|t| t.lock_duration)
        .unwrap_or_default();
    chrono::Duration::from_std(lock)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

fn from_reqwest(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else if e.is_decode() {
        ClientError::Decode(e.to_string())
    } else {
        ClientError::Transport(e.to_string())
    }
}

/// Map an error response to a `ClientError`. Only task-scoped calls can lose a lock.
fn classify(status: u16, message: String, task_id: Option<&TaskId>) -> ClientError {
    match task_id {
        Some(id) if status == 404 => ClientError::NotFound {
            task_id: id.clone(),
        },
        Some(id) if mentions_lost_lock(&message) => ClientError::LockLost {
            task_id: id.clone(),
            message,
        },
        _ => ClientError::Rejected { status, message },
    }
}

fn mentions_lost_lock(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("locked by")
        || m.contains("not locked")
        || (m.contains("lock") && m.contains("expired"))
}

#[async_trait]
impl EngineClient for RestEngineClient {
    async fn fetch_and_lock(
        &self,
        request: &FetchRequest,
    ) -> Result<Vec<ExternalTask>, ClientError> {
        let url = self.endpoint(&["external-task", "fetchAndLock"])?;
        let body = FetchAndLockBody::from(request);
        let resp = self
            .send(self.request(Method::POST, url).json(&body), None)
            .await?;
        // decoded per entry: the engine has locked every task in the batch
        let locked: Vec<serde_json::Value> = resp.json().await.map_err(from_reqwest)?;

        let now = Utc::now();
        let mut tasks = Vec::with_capacity(locked.len());
        for entry in locked {
            let task_id = entry.get("id").and_then(|v| v.as_str()).map(TaskId::new);
            let decoded = serde_json::from_value::<LockedTaskDto>(entry)
                .map_err(|e| ClientError::Decode(e.to_string()))
                .and_then(|dto| {
                    let expiry = fallback_expiry(request, &dto.topic_name, now);
                    dto.into_task(&request.worker_id, expiry)
                });
            match decoded {
                Ok(task) => tasks.push(task),
                Err(e) => self.fail_undecodable(task_id, &request.worker_id, e).await,
            }
        }
        Ok(tasks)
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        variables: &Variables,
        local_variables: &Variables,
    ) -> Result<(), ClientError> {
        let url = self.task_endpoint(task_id, "complete")?;
        let body = CompleteBody {
            worker_id: worker_id.as_str(),
            variables: encode_variables(variables),
            local_variables: encode_variables(local_variables),
        };
        self.send(self.request(Method::POST, url).json(&body), Some(task_id))
            .await?;
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
        let url = self.task_endpoint(task_id, "bpmnError")?;
        let body = BpmnErrorBody {
            worker_id: worker_id.as_str(),
            error_code,
            error_message: message,
            variables: encode_variables(variables),
        };
        self.send(self.request(Method::POST, url).json(&body), Some(task_id))
            .await?;
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
        let url = self.task_endpoint(task_id, "failure")?;
        let body = FailureBody {
            worker_id: worker_id.as_str(),
            error_message: message,
            error_details: details,
            retries,
            retry_timeout: millis(retry_timeout),
        };
        self.send(self.request(Method::POST, url).json(&body), Some(task_id))
            .await?;
        Ok(())
    }

    async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        new_duration: Duration,
    ) -> Result<(), ClientError> {
        let url = self.task_endpoint(task_id, "extendLock")?;
        let body = ExtendLockBody {
            worker_id: worker_id.as_str(),
            new_duration: millis(new_duration),
        };
        self.send(self.request(Method::POST, url).json(&body), Some(task_id))
            .await?;
        Ok(())
    }

    async fn unlock(&self, task_id: &TaskId) -> Result<(), ClientError> {
        let url = self.task_endpoint(task_id, "unlock")?;
        self.send(self.request(Method::POST, url), Some(task_id))
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        let url = self.endpoint(&["version"])?;
        let resp = self.send(self.request(Method::GET, url), None).await?;
        let version: VersionDto = resp.json().await.map_err(from_reqwest)?;
        debug!(version = %version.version, "engine reachable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionResult, Topic, VariableValue};
    use crate::ports::TopicRequest;
    use mockito::{Matcher, Server};
    use rstest::rstest;
    use serde_json::json;

    fn client(server: &Server) -> RestEngineClient {
        RestEngineClient::new(RestClientConfig {
            base_url: format!("{}/engine-rest", server.url()),
            username: Some("demo".into()),
            password: Some("demo".into()),
            http_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn fetch_request() -> FetchRequest {
        FetchRequest {
            worker_id: WorkerId::new("w1"),
            max_tasks: 2,
            use_priority: false,
            async_response_timeout: None,
            topics: vec![TopicRequest {
                topic: Topic::new("process-payment"),
                lock_duration: Duration::from_secs(60),
                variables: None,
                local_variables: false,
            }],
        }
    }

    #[tokio::test]
    async fn fetch_and_lock_decodes_tasks() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/engine-rest/external-task/fetchAndLock")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_body(Matcher::PartialJson(json!({
                "workerId": "w1",
                "maxTasks": 2,
                "topics": [{"topicName": "process-payment", "lockDuration": 60000}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([{
                    "id": "t-1",
                    "topicName": "process-payment",
                    "workerId": "w1",
                    "lockExpirationTime": "2030-01-01T00:00:00.000+0000",
                    "retries": 2,
                    "variables": {"amount": {"value": 10, "type": "Integer"}}
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let tasks = client(&server)
            .fetch_and_lock(&fetch_request())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].retries, Some(2));
        assert_eq!(
            tasks[0].raw_variable("amount"),
            Some(&VariableValue::Integer(10))
        );
    }

    #[tokio::test]
    async fn undecodable_task_is_failed_without_retries_and_the_rest_kept() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/engine-rest/external-task/fetchAndLock")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {
                        "id": "good",
                        "topicName": "process-payment",
                        "variables": {"amount": {"value": 10.0, "type": "Double"}}
                    },
                    {
                        "id": "bad",
                        "topicName": "process-payment",
                        "variables": {"due": {"value": "01/02/2024", "type": "Date"}}
                    },
                    {"topicName": "process-payment"}
                ])
                .to_string(),
            )
            .create_async()
            .await;
        let failed = server
            .mock("POST", "/engine-rest/external-task/bad/failure")
            .match_body(Matcher::PartialJson(json!({
                "workerId": "w1",
                "errorMessage": "cannot decode external task",
                "retries": 0,
                "retryTimeout": 0
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let tasks = client(&server)
            .fetch_and_lock(&fetch_request())
            .await
            .unwrap();

        failed.assert_async().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, TaskId::new("good"));
        assert_eq!(
            tasks[0].raw_variable("amount"),
            Some(&VariableValue::Double(10.0))
        );
    }

    #[tokio::test]
    async fn rejected_failure_for_undecodable_task_does_not_fail_the_fetch() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/engine-rest/external-task/fetchAndLock")
            .with_status(200)
            .with_body(
                json!([{
                    "id": "bad",
                    "topicName": "process-payment",
                    "lockExpirationTime": "yesterday"
                }])
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("POST", "/engine-rest/external-task/bad/failure")
            .with_status(500)
            .with_body(json!({"message": "database unavailable"}).to_string())
            .create_async()
            .await;

        let tasks = client(&server)
            .fetch_and_lock(&fetch_request())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn empty_fetch_is_not_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/engine-rest/external-task/fetchAndLock")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let tasks = client(&server)
            .fetch_and_lock(&fetch_request())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn report_sends_failure_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/engine-rest/external-task/t-1/failure")
            .match_body(Matcher::Json(json!({
                "workerId": "w1",
                "errorMessage": "boom",
                "retries": 2,
                "retryTimeout": 5000
            })))
            .with_status(204)
            .create_async()
            .await;

        let result = ExecutionResult::failure("boom", None, 2, Duration::from_secs(5));
        client(&server)
            .report(&TaskId::new("t-1"), &WorkerId::new("w1"), &result)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn complete_sends_typed_variables() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/engine-rest/external-task/t-1/complete")
            .match_body(Matcher::PartialJson(json!({
                "workerId": "w1",
                "variables": {"paymentStatus": {"value": "completed", "type": "String"}}
            })))
            .with_status(204)
            .create_async()
            .await;

        let result = ExecutionResult::complete().with_variable("paymentStatus", "completed");
        client(&server)
            .report(&TaskId::new("t-1"), &WorkerId::new("w1"), &result)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn task_ids_are_path_encoded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/engine-rest/external-task/a%2Fb/unlock")
            .with_status(204)
            .create_async()
            .await;

        client(&server).unlock(&TaskId::new("a/b")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn lock_held_elsewhere_is_lock_lost() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/engine-rest/external-task/t-1/complete")
            .with_status(500)
            .with_body(
                json!({
                    "type": "BadUserRequestException",
                    "message": "External Task t-1 cannot be completed by worker 'w1'. It is locked by worker 'w2'."
                })
                .to_string(),
            )
            .create_async()
            .await;

        let err = client(&server)
            .complete(
                &TaskId::new("t-1"),
                &WorkerId::new("w1"),
                &Variables::new(),
                &Variables::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_lock_lost(), "{err:?}");
    }

    #[tokio::test]
    async fn health_check_reads_version() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/engine-rest/version")
            .with_status(200)
            .with_body(r#"{"version":"7.21.0"}"#)
            .create_async()
            .await;

        client(&server).health_check().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_engine_is_transport_error() {
        let client = RestEngineClient::new(RestClientConfig {
            http_timeout: Duration::from_secs(2),
            ..RestClientConfig::new("http://127.0.0.1:1/engine-rest")
        })
        .unwrap();

        let err = client.health_check().await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[rstest]
    #[case(404, "gone", true)]
    #[case(400, "Task is not locked", true)]
    #[case(500, "It is locked by worker 'other'", true)]
    #[case(500, "database down", false)]
    #[case(400, "bad variable", false)]
    fn classifies_task_errors(#[case] status: u16, #[case] message: &str, #[case] lost: bool) {
        let err = classify(status, message.to_string(), Some(&TaskId::new("t")));
        assert_eq!(err.is_lock_lost(), lost);
    }

    #[test]
    fn fetch_errors_never_mean_lock_lost() {
        let err = classify(404, "not found".into(), None);
        assert_eq!(
            err,
            ClientError::Rejected {
                status: 404,
                message: "not found".into()
            }
        );
    }

    #[test]
    fn rejects_non_base_url() {
        assert!(RestEngineClient::new(RestClientConfig::new("mailto:ops@example.com")).is_err());
    }
}
