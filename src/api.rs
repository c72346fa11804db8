//! Task Management service client.
//!
//! Four logical endpoints: create-execution, heartbeat, update, finalize.
//! Each call runs a bounded retry loop with its own deadline budget;
//! responses are classified into success, retryable, and terminal outcomes.
//! When a phase's budget is exhausted the client pauses and refuses further
//! requests until the resume delay has elapsed.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ApiSettings;
use crate::error::{Error, Result};

/// Which deadline budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Task Execution creation (may see conflicts)
    Creation,
    /// Heartbeats and partial updates
    Update,
    /// The single terminal update
    FinalUpdate,
}

/// Classification of one HTTP exchange.
#[derive(Debug)]
enum Outcome {
    Ok(Value),
    Retryable {
        cause: String,
        retry_after: Option<Duration>,
        conflict: bool,
    },
    Terminal {
        status: Option<StatusCode>,
        cause: String,
    },
}

/// Result of a successful creation call.
#[derive(Debug, Clone, Default)]
pub struct CreationResponse {
    pub task_execution_uuid: Option<String>,
    pub task_uuid: Option<String>,
    pub task_name: Option<String>,
}

/// Server instructions carried on a heartbeat/update response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerDirectives {
    pub stop_requested: bool,
    pub marked_done: bool,
}

impl ServerDirectives {
    fn from_body(body: &Value) -> Self {
        let status = body.get("status").and_then(Value::as_str);
        let stop_requested = body
            .get("stop_requested")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || matches!(status, Some("STOPPING") | Some("STOPPED"));
        let marked_done = body
            .get("marked_done")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || matches!(status, Some("MARKED_DONE"));
        Self {
            stop_requested,
            marked_done,
        }
    }
}

/// Client for the Task Management service.
pub struct ApiClient {
    http: reqwest::Client,
    settings: ApiSettings,
    /// Requests are suspended until the resume delay passes
    retries_exhausted: bool,
    last_request_failed_at: Option<Instant>,
    /// A creation conflict was observed and never resolved
    pub was_conflict: bool,
}

impl ApiClient {
    pub fn new(settings: ApiSettings) -> Result<ApiClient> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Api(format!("failed to create HTTP client: {e}")))?;
        Ok(ApiClient {
            http,
            settings,
            retries_exhausted: false,
            last_request_failed_at: None,
            was_conflict: false,
        })
    }

    /// Swap in refreshed settings (API key and timeouts may change between
    /// attempts).
    pub fn update_settings(&mut self, settings: ApiSettings) {
        self.settings = settings;
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries_exhausted
    }

    fn executions_url(&self, uuid: Option<&str>) -> String {
        let base = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or("")
            .trim_end_matches('/');
        match uuid {
            Some(uuid) => format!("{base}/api/v1/task_executions/{uuid}/"),
            None => format!("{base}/api/v1/task_executions/"),
        }
    }

    /// Register a Task Execution. Attaching to a known execution PATCHes it;
    /// otherwise a new one is POSTed.
    ///
    /// Returns `Ok(None)` when the request failed non-fatally and execution
    /// is allowed to continue unreported.
    pub async fn create_execution(
        &mut self,
        body: &Value,
        existing_uuid: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<CreationResponse>> {
        let method = if existing_uuid.is_some() {
            Method::PATCH
        } else {
            Method::POST
        };
        let url = self.executions_url(existing_uuid);

        let response = self
            .send_with_retries(method, &url, body, RequestPhase::Creation, cancel)
            .await?;

        Ok(response.map(|value| CreationResponse {
            task_execution_uuid: value
                .get("uuid")
                .and_then(Value::as_str)
                .map(String::from),
            task_uuid: value
                .get("task")
                .and_then(|t| t.get("uuid"))
                .and_then(Value::as_str)
                .map(String::from),
            task_name: value
                .get("task")
                .and_then(|t| t.get("name"))
                .and_then(Value::as_str)
                .map(String::from),
        }))
    }

    /// Send a keep-alive carrying counters and the last status message. The
    /// wire shape is a partial update; the server may reply with directives.
    pub async fn heartbeat(
        &mut self,
        execution_uuid: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<Option<ServerDirectives>> {
        self.update(execution_uuid, body, cancel).await
    }

    /// Send a partial update (heartbeats use the same endpoint). Returns the
    /// server's directives when the update was delivered.
    pub async fn update(
        &mut self,
        execution_uuid: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<Option<ServerDirectives>> {
        let url = self.executions_url(Some(execution_uuid));
        let response = self
            .send_with_retries(Method::PATCH, &url, body, RequestPhase::Update, cancel)
            .await?;
        Ok(response.map(|value| ServerDirectives::from_body(&value)))
    }

    /// Send the terminal update, drawing from the final-update budget.
    pub async fn finalize(
        &mut self,
        execution_uuid: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let url = self.executions_url(Some(execution_uuid));
        let response = self
            .send_with_retries(Method::PATCH, &url, body, RequestPhase::FinalUpdate, cancel)
            .await?;
        Ok(response.is_some())
    }

    fn phase_timeout(&self, phase: RequestPhase, for_conflict: bool) -> Option<Duration> {
        let seconds = match phase {
            RequestPhase::Creation if for_conflict => self.settings.creation_conflict_timeout,
            RequestPhase::Creation => self.settings.creation_error_timeout,
            RequestPhase::Update => self.settings.error_timeout,
            RequestPhase::FinalUpdate => self.settings.final_update_timeout,
        };
        seconds.map(Duration::from_secs)
    }

    /// Re-enable requests once the resume delay has passed since the last
    /// failure. A None resume delay pauses the client permanently.
    fn refresh_retries_exhausted(&mut self) -> bool {
        if !self.retries_exhausted {
            return false;
        }

        if let (Some(failed_at), Some(resume_delay)) =
            (self.last_request_failed_at, self.settings.resume_delay)
        {
            if failed_at.elapsed() >= Duration::from_secs(resume_delay) {
                info!("Resuming API requests after the resume delay");
                self.retries_exhausted = false;
            }
        }

        self.retries_exhausted
    }

    async fn send_with_retries(
        &mut self,
        method: Method,
        url: &str,
        body: &Value,
        phase: RequestPhase,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        if self.refresh_retries_exhausted() {
            debug!("Not sending API request, retries are exhausted");
            return Ok(None);
        }

        let is_creation = phase == RequestPhase::Creation;
        let first_attempt_at = Instant::now();
        let mut deadline = self.phase_timeout(phase, false).map(|t| first_attempt_at + t);
        let mut conflict_deadline_applied = false;
        let mut attempt = 0u32;
        let mut last_status: Option<StatusCode> = None;

        loop {
            if cancel.is_cancelled() {
                debug!("API request cancelled");
                return Ok(None);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            attempt += 1;
            debug!("Sending {method} {url} (attempt {attempt})");

            match self.send_once(method.clone(), url, body).await {
                Outcome::Ok(value) => {
                    self.last_request_failed_at = None;
                    if is_creation {
                        self.was_conflict = false;
                    }
                    return Ok(Some(value));
                }
                Outcome::Retryable {
                    cause,
                    retry_after,
                    conflict,
                } => {
                    last_status = if conflict {
                        Some(StatusCode::CONFLICT)
                    } else {
                        last_status
                    };

                    let mut retry_delay = Duration::from_secs(self.settings.retry_delay);

                    if conflict && is_creation {
                        info!("Task Execution creation conflicted: {cause}");
                        if !conflict_deadline_applied {
                            self.was_conflict = true;
                            conflict_deadline_applied = true;
                            deadline = self
                                .phase_timeout(phase, true)
                                .map(|t| first_attempt_at + t);
                        }
                        retry_delay = Duration::from_secs(
                            self.settings.creation_conflict_retry_delay.unwrap_or(0),
                        );
                    } else {
                        warn!("Retryable API failure: {cause}");
                        self.last_request_failed_at = Some(Instant::now());
                    }

                    if let Some(after) = retry_after {
                        retry_delay = after;
                    }

                    let past_deadline = deadline
                        .map(|d| Instant::now() + retry_delay >= d)
                        .unwrap_or(false);
                    if past_deadline {
                        break;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("API retry loop cancelled");
                            return Ok(None);
                        }
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
                Outcome::Terminal { status, cause } => {
                    self.last_request_failed_at = Some(Instant::now());
                    error!("Terminal API failure: {cause}");

                    if status == Some(StatusCode::CONFLICT) {
                        // Conflicts outside creation mean another supervisor
                        // took over; stop reporting.
                        self.was_conflict = true;
                        return Err(Error::Conflict(cause));
                    }

                    if self.settings.prevent_offline_execution {
                        return Err(terminal_error(status, cause));
                    }

                    warn!("Continuing unreported since offline execution is allowed");
                    return Ok(None);
                }
            }
        }

        self.retries_exhausted = true;
        self.last_request_failed_at = Some(Instant::now());
        error!("Exhausted the retry budget for {method} {url}");

        if is_creation && (self.settings.prevent_offline_execution || self.was_conflict) {
            if self.was_conflict {
                return Err(Error::Conflict(
                    "Task Execution creation conflict persisted past its timeout".to_string(),
                ));
            }
            return Err(terminal_error(
                last_status,
                "Task Execution creation timed out and offline execution is prevented"
                    .to_string(),
            ));
        }

        Ok(None)
    }

    /// One HTTP exchange, classified.
    async fn send_once(&self, method: Method, url: &str, body: &Value) -> Outcome {
        let mut request = self
            .http
            .request(method, url)
            .header("Accept", "application/json")
            .json(body);

        if let Some(key) = &self.settings.api_key {
            request = request.header("Authorization", format!("Token {key}"));
        }
        if let Some(timeout) = self.settings.request_timeout {
            request = request.timeout(Duration::from_secs(timeout));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Outcome::Retryable {
                    cause: format!("transport error: {e}"),
                    retry_after: None,
                    conflict: false,
                }
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after(&response);

        if status.is_success() {
            let value = response.json::<Value>().await.unwrap_or(Value::Null);
            return Outcome::Ok(value);
        }

        let body_text = response.text().await.unwrap_or_default();

        match status {
            StatusCode::CONFLICT => Outcome::Retryable {
                cause: format!("409 conflict: {body_text}"),
                retry_after,
                conflict: true,
            },
            StatusCode::TOO_MANY_REQUESTS => Outcome::Retryable {
                cause: "429 too many requests".to_string(),
                retry_after,
                conflict: false,
            },
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Outcome::Retryable {
                cause: format!("{} from service", status.as_u16()),
                retry_after,
                conflict: false,
            },
            // 500 marks a server-side bug; retrying it is not useful
            _ => Outcome::Terminal {
                status: Some(status),
                cause: format!("{} response: {body_text}", status.as_u16()),
            },
        }
    }
}

fn terminal_error(status: Option<StatusCode>, cause: String) -> Error {
    match status {
        Some(StatusCode::CONFLICT) => Error::Conflict(cause),
        Some(StatusCode::FORBIDDEN) => Error::PermissionDenied(cause),
        _ => Error::Api(cause),
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
