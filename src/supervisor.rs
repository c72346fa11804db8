//! The supervising state machine.
//!
//! One Supervisor instance owns one invocation end to end: resolve
//! configuration, register the Task Execution, run the child through the
//! attempt loop with heartbeats and server directives, and report exactly
//! one terminal outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, CreationResponse, ServerDirectives};
use crate::config::Config;
use crate::error::{Error, Result, EXIT_CODE_GENERIC_ERROR, EXIT_CODE_TIMEOUT};
use crate::logtail::{LogTail, TailOutcome};
use crate::process::{ChildHandle, ProcessExecutor, WaitOutcome};
use crate::resolve::format::{parse_value, stringify_env_value, ValueFormat};
use crate::resolve::providers::SourceRegistry;
use crate::resolve::{ConfigResolver, ResolvedConfig};
use crate::runtime::{
    ContainerState, DefaultRuntimeMetadataFetcher, RuntimeMetadata, RuntimeMetadataFetcher,
};
use crate::status::{StatusListener, StatusTracker};
use crate::task::{ExecutionStatus, TaskExecution};

/// Why the current attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Exited(i32),
    TimedOut,
    /// Stop requested by the server or an OS signal
    Stopped,
}

/// Terminal result of one invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub result_value: Option<Value>,
    /// Attempts actually made
    pub attempt_count: u64,
}

impl RunOutcome {
    fn from_error(error: &Error) -> Self {
        Self {
            status: ExecutionStatus::Abandoned,
            exit_code: error.exit_code(),
            result_value: None,
            attempt_count: 0,
        }
    }
}

/// Orchestrates one supervised invocation.
pub struct Supervisor {
    config: Config,
    resolver: ConfigResolver,
    api: Option<ApiClient>,
    runtime_fetcher: Arc<dyn RuntimeMetadataFetcher>,
    tracker: StatusTracker,
    execution: TaskExecution,
    resolved: ResolvedConfig,
    runtime_metadata: Option<RuntimeMetadata>,
    runtime_metadata_fetched_at: Option<Instant>,
    /// Registration gate, drawn once per invocation
    managed: bool,
    marked_done: bool,
    stopped_by_signal: bool,
    /// Global stop: OS signal or server stop request
    cancel: CancellationToken,
    /// Second OS signal: skip the termination grace period
    hurry: CancellationToken,
    /// Files this invocation created and may need to delete
    cleanup_files: Vec<String>,
    /// Tail buffers from the last attempt, attached at finalize time
    tail: Option<LogTail>,
    finalized: bool,
}

impl Supervisor {
    /// Build a supervisor from a bootstrap configuration. The configuration
    /// is re-validated after resolution inside [Supervisor::run].
    pub fn new(config: Config) -> Result<Supervisor> {
        Self::with_registry(config, SourceRegistry::with_defaults())
    }

    /// Build with a custom secret source registry (remote store adapters,
    /// in-memory sources for tests).
    pub fn with_registry(config: Config, registry: SourceRegistry) -> Result<Supervisor> {
        let process_env: HashMap<String, String> = std::env::vars().collect();
        Self::with_registry_and_env(config, registry, process_env)
    }

    /// Fully explicit constructor; the environment snapshot is injectable so
    /// tests control what the resolver and probes see.
    pub fn with_registry_and_env(
        config: Config,
        registry: SourceRegistry,
        process_env: HashMap<String, String>,
    ) -> Result<Supervisor> {
        let resolver = ConfigResolver::new(
            config.resolver.clone(),
            registry,
            process_env.clone(),
        );
        let runtime_fetcher: Arc<dyn RuntimeMetadataFetcher> =
            Arc::new(DefaultRuntimeMetadataFetcher::new(process_env));

        Ok(Supervisor {
            config,
            resolver,
            api: None,
            runtime_fetcher,
            tracker: StatusTracker::new(),
            execution: TaskExecution::default(),
            resolved: ResolvedConfig::default(),
            runtime_metadata: None,
            runtime_metadata_fetched_at: None,
            managed: false,
            marked_done: false,
            stopped_by_signal: false,
            cancel: CancellationToken::new(),
            hurry: CancellationToken::new(),
            cleanup_files: Vec::new(),
            tail: None,
            finalized: false,
        })
    }

    /// Substitute the runtime metadata probe.
    pub fn with_runtime_fetcher(mut self, fetcher: Arc<dyn RuntimeMetadataFetcher>) -> Self {
        self.runtime_fetcher = fetcher;
        self
    }

    /// A clone of the cancellation token, for embedding callers that manage
    /// their own signals.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the configured command to completion and report the outcome.
    pub async fn run(mut self) -> RunOutcome {
        match self.run_inner().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Supervisor failed: {e}");
                self.cleanup().await;
                RunOutcome::from_error(&e)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<RunOutcome> {
        self.bootstrap().await?;

        if self.config.exit_after_writing_variables {
            info!("Variables written, exiting as requested");
            return Ok(RunOutcome {
                status: ExecutionStatus::Succeeded,
                exit_code: 0,
                result_value: None,
                attempt_count: 0,
            });
        }

        self.install_signal_handlers();
        self.draw_managed_sample();
        self.register().await?;

        let outcome = self.attempt_loop().await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Spawn and supervision failures still get reported once
                self.execution.status = ExecutionStatus::Failed;
                self.execution.exit_code = Some(e.exit_code());
                self.finalize(TailOutcome::Failure).await;
                self.cleanup().await;
                return Err(e);
            }
        };

        self.cleanup().await;
        Ok(outcome)
    }

    /// Resolve configuration, re-apply settings sourced from it, validate,
    /// and load the input value.
    async fn bootstrap(&mut self) -> Result<()> {
        self.resolved = self.resolver.resolve(Value::Null).await?;

        if !self.resolved.failed_env_names.is_empty()
            || !self.resolved.failed_config_names.is_empty()
        {
            warn!(
                "Continuing with unresolved keys: env {:?}, config {:?}",
                self.resolved.failed_env_names, self.resolved.failed_config_names
            );
        }

        // Settings may have been delivered through resolved env or config
        self.config.apply_env(&self.resolved.env, false);
        self.config
            .apply_config_overrides(&self.resolved.config, false);
        self.config.validate()?;

        let written = self.resolver.write_output_files(&self.resolved).await?;
        self.cleanup_files.extend(written);

        self.load_input_value().await?;

        if self.config.api.send_hostname {
            self.execution.hostname = hostname::get()
                .ok()
                .and_then(|h| h.to_str().map(String::from));
        }

        Ok(())
    }

    async fn load_input_value(&mut self) -> Result<()> {
        let format = self.config.io.input_value_format.or_else(|| {
            self.config
                .io
                .input_filename
                .as_deref()
                .and_then(ValueFormat::guess_from_location)
        });
        let format = format.unwrap_or(ValueFormat::Text);

        let raw = if let Some(value) = &self.config.io.input_value {
            Some(value.clone())
        } else if let Some(var) = &self.config.io.input_env_var_name {
            self.resolved.env.get(var).cloned()
        } else if let Some(filename) = &self.config.io.input_filename {
            match tokio::fs::read_to_string(filename).await {
                Ok(contents) => Some(contents),
                Err(e) => {
                    debug!("No input file at {filename}: {e}");
                    None
                }
            }
        } else {
            None
        };

        if let Some(raw) = raw {
            let value = parse_value(&raw, format)?;
            if self.config.io.log_input_value {
                info!("Input value: {value}");
            }

            // An inline or env-sourced input is materialized to the input
            // file so the child can read it there.
            if let Some(filename) = &self.config.io.input_filename {
                if self.config.io.input_value.is_some()
                    || self.config.io.input_env_var_name.is_some()
                {
                    tokio::fs::write(filename, &raw).await?;
                    if self.config.io.cleanup_input_file.unwrap_or(true) {
                        self.cleanup_files.push(filename.clone());
                    }
                }
            }

            self.execution.input_value = Some(value);
        }

        Ok(())
    }

    fn install_signal_handlers(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let cancel = self.cancel.clone();
        let hurry = self.hurry.clone();

        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Can't install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Can't install SIGINT handler: {e}");
                    return;
                }
            };

            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            warn!("Caught a termination signal, stopping");
            cancel.cancel();

            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            warn!("Caught a second signal, killing the child immediately");
            hurry.cancel();
        });
    }

    /// The registration gate is sampled once per invocation.
    fn draw_managed_sample(&mut self) {
        if self.config.api.offline_mode {
            self.managed = false;
            return;
        }
        if self.config.task_execution_uuid.is_some() {
            self.managed = true;
            return;
        }

        let draw: f64 = rand::thread_rng().gen();
        self.managed = draw < self.config.api.managed_probability;
        if !self.managed {
            info!(
                "Sampled out of service management ({draw:.3} >= {:.3}), running unreported",
                self.config.api.managed_probability
            );
        }
    }

    async fn fetch_runtime_metadata(&mut self) {
        if !self.config.api.send_runtime_metadata {
            return;
        }

        let refresh_due = match (
            self.runtime_metadata_fetched_at,
            self.config.api.runtime_metadata_refresh_interval,
        ) {
            (None, _) => true,
            (Some(at), Some(interval)) => {
                !self.runtime_fetcher.is_static()
                    && at.elapsed() >= Duration::from_secs(interval)
            }
            (Some(_), None) => false,
        };
        if !refresh_due {
            return;
        }

        match self.runtime_fetcher.fetch().await {
            Ok(metadata) => {
                self.runtime_metadata = metadata;
                self.runtime_metadata_fetched_at = Some(Instant::now());
            }
            Err(e) => warn!("Runtime metadata probe failed: {e}"),
        }
    }

    /// Create the Task Execution at the service, honouring conflicts and the
    /// offline-execution policy.
    async fn register(&mut self) -> Result<()> {
        if self.config.api.offline_mode {
            info!("Starting in offline mode");
            return Ok(());
        }
        if !self.managed {
            return Ok(());
        }

        self.fetch_runtime_metadata().await;

        let mut api = ApiClient::new(self.config.api.clone())?;
        let body = self.build_creation_body();
        let existing = self.config.task_execution_uuid.clone();

        let response = api
            .create_execution(&body, existing.as_deref(), &self.cancel.clone())
            .await?;

        match response {
            Some(response) => self.record_creation_response(response, existing),
            None => {
                warn!("Task Execution registration failed non-fatally, continuing");
                self.execution.uuid = existing;
            }
        }

        self.api = Some(api);
        Ok(())
    }

    fn record_creation_response(
        &mut self,
        response: CreationResponse,
        existing: Option<String>,
    ) {
        self.execution.uuid = existing.or(response.task_execution_uuid);
        if self.config.task.uuid.is_none() {
            self.config.task.uuid = response.task_uuid;
        }
        if self.config.task.name.is_none() {
            self.config.task.name = response.task_name;
        }
        info!(
            "Created Task Execution {}",
            self.execution.uuid.as_deref().unwrap_or("[unreported]")
        );
    }

    fn build_creation_body(&self) -> Value {
        let config = &self.config;
        let mut body = Map::new();

        body.insert("status".to_string(), json!(ExecutionStatus::Running));

        body.insert("is_service".to_string(), json!(config.task.is_service));
        if let Some(schedule) = &config.task.schedule {
            body.insert("schedule".to_string(), json!(schedule));
        }
        body.insert(
            "heartbeat_interval_seconds".to_string(),
            json!(encode_opt(config.api.heartbeat_interval)),
        );
        body.insert(
            "process_timeout_seconds".to_string(),
            json!(encode_opt(config.process.timeout)),
        );
        body.insert(
            "process_max_retries".to_string(),
            json!(config
                .process
                .max_retries
                .map(i64::from)
                .unwrap_or(-1)),
        );
        body.insert(
            "process_retry_delay_seconds".to_string(),
            json!(config.process.retry_delay),
        );
        body.insert(
            "process_termination_grace_period_seconds".to_string(),
            json!(config.process.termination_grace_period),
        );
        body.insert(
            "task_max_concurrency".to_string(),
            json!(config.task.max_concurrency),
        );
        body.insert(
            "max_conflicting_age_seconds".to_string(),
            json!(config.max_conflicting_age),
        );
        body.insert(
            "prevent_offline_execution".to_string(),
            json!(config.api.prevent_offline_execution),
        );
        body.insert(
            "wrapper_version".to_string(),
            json!(env!("CARGO_PKG_VERSION")),
        );
        body.insert("embedded_mode".to_string(), json!(config.embedded_mode));

        if let Some(n) = config.task.version_number {
            body.insert("task_version_number".to_string(), json!(n));
        }
        if let Some(text) = &config.task.version_text {
            body.insert("task_version_text".to_string(), json!(text));
        }
        if let Some(sig) = &config.task.version_signature {
            body.insert("task_version_signature".to_string(), json!(sig));
        }
        if let Some(uuid) = &config.task.build_task_execution_uuid {
            body.insert("build_task_execution_uuid".to_string(), json!(uuid));
        }
        if let Some(uuid) = &config.task.deployment_task_execution_uuid {
            body.insert("deployment_task_execution_uuid".to_string(), json!(uuid));
        }

        if config.updates.enable_status_update_listener {
            body.insert(
                "status_update_port".to_string(),
                json!(config.updates.status_update_socket_port),
            );
            body.insert(
                "status_update_message_max_bytes".to_string(),
                json!(config.updates.status_update_message_max_bytes),
            );
        }

        if !config.process.command.is_empty() {
            body.insert(
                "process_command".to_string(),
                json!(config.process.command.join(" ")),
            );
        } else if let Some(line) = &config.process.command_line {
            body.insert("process_command".to_string(), json!(line));
        }

        if config.api.send_hostname {
            if let Some(hostname) = &self.execution.hostname {
                body.insert("hostname".to_string(), json!(hostname));
            }
        }

        if let Some(metadata) = &config.task.instance_metadata {
            body.insert("other_instance_metadata".to_string(), json!(metadata));
        }

        if config.io.send_input_value {
            if let Some(input) = &self.execution.input_value {
                body.insert("input_value".to_string(), input.clone());
            }
        }

        if config.api.send_runtime_metadata {
            if let Some(metadata) = &self.runtime_metadata {
                body.insert(
                    "execution_method".to_string(),
                    metadata.execution_method.clone(),
                );
                body.insert(
                    "execution_method_type".to_string(),
                    json!(metadata.execution_method_type),
                );
            }
        }

        // When attaching to an existing execution the Task is already known
        if config.task_execution_uuid.is_none() {
            let mut task = Map::new();
            if let Some(uuid) = &config.task.uuid {
                task.insert("uuid".to_string(), json!(uuid));
            } else if let Some(name) = &config.task.name {
                task.insert("name".to_string(), json!(name));
            }
            task.insert(
                "max_concurrency".to_string(),
                json!(config.task.max_concurrency.unwrap_or(-1)),
            );
            task.insert(
                "was_auto_created".to_string(),
                json!(config.task.auto_create),
            );
            task.insert("passive".to_string(), json!(config.task.is_passive));

            if config.task.auto_create {
                let mut run_environment = Map::new();
                if let Some(name) = &config.task.run_environment_name {
                    run_environment.insert("name".to_string(), json!(name));
                }
                if let Some(uuid) = &config.task.run_environment_uuid {
                    run_environment.insert("uuid".to_string(), json!(uuid));
                }
                task.insert(
                    "run_environment".to_string(),
                    Value::Object(run_environment),
                );

                let mut capability = self
                    .runtime_metadata
                    .as_ref()
                    .map(|m| m.execution_method_capability.clone())
                    .unwrap_or_else(|| json!({"type": "unknown"}));
                if let Some(props) = &config.task.auto_create_props {
                    if let Some(override_capability) = props.get("execution_method_capability")
                    {
                        if let (Some(base), Some(overlay)) =
                            (capability.as_object_mut(), override_capability.as_object())
                        {
                            for (k, v) in overlay {
                                base.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
                task.insert("execution_method_capability".to_string(), capability);
            }

            if let Some(props) = &config.task.auto_create_props {
                if let Some(props) = props.as_object() {
                    for (k, v) in props {
                        if k != "execution_method_capability" {
                            task.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                }
            }

            body.insert("task".to_string(), Value::Object(task));
        }

        Value::Object(body)
    }

    /// The environment the child runs with.
    fn build_child_env(&self) -> HashMap<String, String> {
        let mut env = self.resolved.env.clone();
        self.config.populate_child_env(&mut env);

        if let Some(var) = &self.config.io.input_env_var_name {
            if let Some(input) = &self.execution.input_value {
                env.insert(var.clone(), stringify_env_value(input));
            }
        }

        env
    }

    /// Run attempts until success, exhaustion, timeout, or stop.
    async fn attempt_loop(&mut self) -> Result<RunOutcome> {
        let max_attempts = self.config.process.max_attempts();
        let mut attempt: u64 = 0;

        self.execution.status = ExecutionStatus::Running;
        self.execution.started_at = Some(Utc::now());

        loop {
            attempt += 1;
            let attempts_label = max_attempts
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unlimited".to_string());
            info!(
                "Running {} (attempt {attempt}/{attempts_label})",
                self.config.task.label()
            );

            if attempt > 1 {
                self.refresh_between_attempts().await?;
            }

            let outcome = if self.config.process.is_sidecar() {
                self.run_sidecar_attempt().await?
            } else {
                self.run_child_attempt().await?
            };

            match outcome {
                AttemptOutcome::Exited(0) => {
                    self.execution.exit_code = Some(0);
                    let status = if self.marked_done {
                        ExecutionStatus::ExitedAfterMarkedDone
                    } else {
                        ExecutionStatus::Succeeded
                    };
                    self.execution.status = status;
                    self.read_result_value().await?;
                    self.finalize(TailOutcome::Success).await;
                    return Ok(RunOutcome {
                        status,
                        exit_code: 0,
                        result_value: self.execution.result_value.clone(),
                        attempt_count: attempt,
                    });
                }
                AttemptOutcome::Exited(code) => {
                    info!("Child exited with code {code}");
                    self.execution.exit_code = Some(code);
                    self.execution.failed_attempts += 1;

                    if self.marked_done {
                        self.execution.status = ExecutionStatus::ExitedAfterMarkedDone;
                        self.finalize(TailOutcome::Failure).await;
                        return Ok(RunOutcome {
                            status: ExecutionStatus::ExitedAfterMarkedDone,
                            exit_code: code,
                            result_value: None,
                            attempt_count: attempt,
                        });
                    }

                    if self.attempts_remain(attempt, max_attempts) {
                        self.send_progress_update().await;
                        if !self.delay_before_retry().await {
                            // Stop arrived mid-delay
                            self.execution.status = ExecutionStatus::Stopped;
                            self.finalize(TailOutcome::Failure).await;
                            return Ok(RunOutcome {
                                status: ExecutionStatus::Stopped,
                                exit_code: code,
                                result_value: None,
                                attempt_count: attempt,
                            });
                        }
                        continue;
                    }

                    self.execution.status = ExecutionStatus::Failed;
                    self.finalize(TailOutcome::Failure).await;
                    return Ok(RunOutcome {
                        status: ExecutionStatus::Failed,
                        exit_code: code,
                        result_value: None,
                        attempt_count: attempt,
                    });
                }
                AttemptOutcome::TimedOut => {
                    warn!(
                        "Process timed out after {:?} seconds",
                        self.config.process.timeout
                    );
                    self.execution.timed_out_attempts += 1;

                    if self.attempts_remain(attempt, max_attempts) && !self.marked_done {
                        self.send_progress_update().await;
                        if !self.delay_before_retry().await {
                            self.execution.status = ExecutionStatus::Stopped;
                            self.finalize(TailOutcome::Timeout).await;
                            return Ok(RunOutcome {
                                status: ExecutionStatus::Stopped,
                                exit_code: EXIT_CODE_TIMEOUT,
                                result_value: None,
                                attempt_count: attempt,
                            });
                        }
                        continue;
                    }

                    self.execution.status = ExecutionStatus::TerminatedAfterTimeOut;
                    self.execution.exit_code = Some(EXIT_CODE_TIMEOUT);
                    self.finalize(TailOutcome::Timeout).await;
                    return Ok(RunOutcome {
                        status: ExecutionStatus::TerminatedAfterTimeOut,
                        exit_code: EXIT_CODE_TIMEOUT,
                        result_value: None,
                        attempt_count: attempt,
                    });
                }
                AttemptOutcome::Stopped => {
                    let status = ExecutionStatus::Stopped;
                    self.execution.status = status;
                    let exit_code = self.execution.exit_code.unwrap_or(EXIT_CODE_GENERIC_ERROR);
                    self.finalize(TailOutcome::Failure).await;
                    return Ok(RunOutcome {
                        status,
                        exit_code,
                        result_value: None,
                        attempt_count: attempt,
                    });
                }
            }
        }
    }

    fn attempts_remain(&self, attempt: u64, max_attempts: Option<u64>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    /// Sleep the retry delay; false when a stop interrupted it.
    async fn delay_before_retry(&self) -> bool {
        let delay = Duration::from_secs(self.config.process.retry_delay);
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        debug!("Sleeping {delay:?} before the next attempt");
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Re-resolve secrets when the TTL has lapsed, and pick up refreshed
    /// mutable settings (API keys rotate).
    async fn refresh_between_attempts(&mut self) -> Result<()> {
        if self.resolver.settings().config_ttl.is_none() {
            return Ok(());
        }

        self.resolver.expire_stale().await;
        match self.resolver.resolve(Value::Null).await {
            Ok(resolved) => {
                self.resolved = resolved;
                self.config.apply_env(&self.resolved.env, true);
                self.config
                    .apply_config_overrides(&self.resolved.config, true);
                if let Some(api) = &mut self.api {
                    api.update_settings(self.config.api.clone());
                }
            }
            Err(e) => {
                warn!("Re-resolution between attempts failed: {e}");
                if self.config.resolver.fail_fast_resolution {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// One spawn-supervise-reap cycle.
    async fn run_child_attempt(&mut self) -> Result<AttemptOutcome> {
        let tail = LogTail::new(&self.config.log);
        let executor = ProcessExecutor::new(self.config.process.clone(), tail.wants_capture());

        // The listener is bound to the child's lifetime: up before spawn,
        // down after reap.
        let listener_cancel = CancellationToken::new();
        let mut listener_handle = None;
        if self.config.updates.enable_status_update_listener && !self.config.embedded_mode {
            match StatusListener::bind(
                self.config.updates.status_update_socket_port,
                self.config.updates.status_update_message_max_bytes,
                self.tracker.clone(),
            )
            .await
            {
                Ok(listener) => {
                    listener_handle = Some(listener.spawn(listener_cancel.clone()));
                }
                Err(e) => warn!("Can't bind the status update socket: {e}"),
            }
        }

        let env = self.build_child_env();
        let mut handle = match executor.spawn(&env) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Spawn failed: {e}");
                listener_cancel.cancel();
                if let Some(listener) = listener_handle {
                    let _ = listener.await;
                }
                return Ok(AttemptOutcome::Exited(EXIT_CODE_GENERIC_ERROR));
            }
        };

        self.execution.pid = Some(handle.pid());

        let mut reader_handles = Vec::new();
        if tail.wants_capture() {
            if let Some(stdout) = handle.take_stdout() {
                reader_handles.push(tail.spawn_stdout_reader(stdout));
            }
            if let Some(stderr) = handle.take_stderr() {
                reader_handles.push(tail.spawn_stderr_reader(stderr));
            }
        }

        if self.config.api.send_pid {
            let body = json!({
                "status": ExecutionStatus::Running,
                "pid": handle.pid(),
            });
            self.send_update_body(body).await;
        }

        let outcome = self.supervise_child(&mut handle).await;

        // The listener's lifecycle is bound to the child
        listener_cancel.cancel();
        if let Some(listener) = listener_handle {
            let _ = listener.await;
        }
        for reader in reader_handles {
            let _ = reader.await;
        }

        self.execution.pid = None;
        self.tail = Some(tail);
        outcome
    }

    /// Watch the running child: exit, timeout, heartbeats, status pushes,
    /// server directives, and stop signals.
    async fn supervise_child(&mut self, handle: &mut ChildHandle) -> Result<AttemptOutcome> {
        let check_interval = Duration::from_secs(self.config.process.check_interval.max(1));
        let deadline = self
            .config
            .process
            .timeout
            .map(|t| Instant::now() + Duration::from_secs(t));

        let heartbeat_interval = self.heartbeat_interval();
        let mut next_heartbeat = heartbeat_interval.map(|i| Instant::now() + i);

        loop {
            if self.cancel.is_cancelled() {
                self.stopped_by_signal = true;
                self.execution.status = ExecutionStatus::Stopping;
                let code = self.terminate_child(handle).await?;
                self.execution.exit_code = code;
                return Ok(AttemptOutcome::Stopped);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let _ = self.terminate_child(handle).await?;
                    return Ok(AttemptOutcome::TimedOut);
                }
            }

            if let Some(at) = next_heartbeat {
                if Instant::now() >= at {
                    let directives = self.send_heartbeat().await;
                    next_heartbeat =
                        heartbeat_interval.map(|i| Instant::now() + i);
                    if let Some(directives) = directives {
                        if let Some(outcome) =
                            self.apply_directives(directives, handle).await?
                        {
                            return Ok(outcome);
                        }
                    }
                }
            }

            if self.status_push_due().await {
                self.send_progress_update().await;
            }

            // Sleep until the nearest of: check tick, heartbeat, deadline
            let mut wait = check_interval;
            if let Some(at) = next_heartbeat {
                wait = wait.min(at.saturating_duration_since(Instant::now()));
            }
            if let Some(at) = deadline {
                wait = wait.min(at.saturating_duration_since(Instant::now()));
            }
            let wait = wait.max(Duration::from_millis(10));

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                outcome = handle.wait(wait) => {
                    if let WaitOutcome::Exited(code) = outcome? {
                        return Ok(AttemptOutcome::Exited(code));
                    }
                }
            }
        }
    }

    /// Observe a peer container instead of a spawned child.
    async fn run_sidecar_attempt(&mut self) -> Result<AttemptOutcome> {
        let container = self
            .config
            .process
            .main_container_name
            .clone()
            .ok_or_else(|| {
                Error::Configuration("sidecar mode needs a main container name".to_string())
            })?;

        info!("Monitoring peer container '{container}'");

        let check_interval = Duration::from_secs(self.config.process.check_interval.max(1));
        let deadline = self
            .config
            .process
            .timeout
            .map(|t| Instant::now() + Duration::from_secs(t));
        let heartbeat_interval = self.heartbeat_interval();
        let mut next_heartbeat = heartbeat_interval.map(|i| Instant::now() + i);

        loop {
            if self.cancel.is_cancelled() {
                self.stopped_by_signal = true;
                return Ok(AttemptOutcome::Stopped);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(AttemptOutcome::TimedOut);
                }
            }

            match self.runtime_fetcher.poll_container(&container).await {
                Ok(ContainerState::Exited(code)) => {
                    return Ok(AttemptOutcome::Exited(code));
                }
                Ok(ContainerState::Running) => {}
                Ok(ContainerState::Unknown) => {
                    warn!("Peer container '{container}' not found");
                }
                Err(e) => warn!("Peer container poll failed: {e}"),
            }

            if let Some(at) = next_heartbeat {
                if Instant::now() >= at {
                    let _ = self.send_heartbeat().await;
                    next_heartbeat = heartbeat_interval.map(|i| Instant::now() + i);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = sleep(check_interval) => {}
            }
        }
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        if self.config.api.offline_mode || !self.managed {
            return None;
        }
        self.config
            .api
            .heartbeat_interval
            .map(Duration::from_secs)
    }

    async fn terminate_child(&mut self, handle: &mut ChildHandle) -> Result<Option<i32>> {
        let executor =
            ProcessExecutor::new(self.config.process.clone(), false);
        executor.terminate(handle, Some(&self.hurry)).await
    }

    /// React to server instructions from a heartbeat response.
    async fn apply_directives(
        &mut self,
        directives: ServerDirectives,
        handle: &mut ChildHandle,
    ) -> Result<Option<AttemptOutcome>> {
        if directives.stop_requested {
            info!("Server requested a stop");
            self.execution.status = ExecutionStatus::Stopping;
            self.cancel.cancel();
            let code = self.terminate_child(handle).await?;
            self.execution.exit_code = code;
            return Ok(Some(AttemptOutcome::Stopped));
        }

        if directives.marked_done && !self.marked_done {
            // Keep observing the current child; heartbeats continue
            info!("Server marked the execution done");
            self.marked_done = true;
            self.execution.status = ExecutionStatus::MarkedDone;
        }

        Ok(None)
    }

    async fn status_push_due(&self) -> bool {
        let Some(interval) = self.config.updates.status_update_interval else {
            return false;
        };
        let snapshot = self.tracker.snapshot().await;
        if !snapshot.dirty {
            return false;
        }
        match self.execution.last_heartbeat_at {
            Some(sent_at) => {
                let elapsed = Utc::now().signed_duration_since(sent_at);
                elapsed.num_seconds() >= interval as i64
            }
            None => true,
        }
    }

    async fn send_heartbeat(&mut self) -> Option<ServerDirectives> {
        let body = self.build_status_body(None).await;
        self.send_update_body(body).await
    }

    async fn send_progress_update(&mut self) {
        let body = self.build_status_body(None).await;
        self.send_update_body(body).await;
    }

    /// Heartbeats never advance status; they always carry RUNNING (or
    /// MARKED_DONE once the server set it).
    async fn build_status_body(&mut self, status: Option<ExecutionStatus>) -> Value {
        let snapshot = self.tracker.snapshot().await;
        self.execution.counters = snapshot.counters;
        if snapshot.last_status_message.is_some() {
            self.execution.last_status_message = snapshot.last_status_message.clone();
        }
        self.execution.last_app_heartbeat_at = snapshot.last_app_heartbeat_at;

        let status = status.unwrap_or(if self.marked_done {
            ExecutionStatus::MarkedDone
        } else {
            ExecutionStatus::Running
        });

        let mut body = Map::new();
        body.insert("status".to_string(), json!(status));

        let counters = &self.execution.counters;
        if let Some(v) = counters.success_count {
            body.insert("success_count".to_string(), json!(v));
        }
        if let Some(v) = counters.error_count {
            body.insert("error_count".to_string(), json!(v));
        }
        if let Some(v) = counters.skipped_count {
            body.insert("skipped_count".to_string(), json!(v));
        }
        if let Some(v) = counters.expected_count {
            body.insert("expected_count".to_string(), json!(v));
        }
        if let Some(message) = &self.execution.last_status_message {
            body.insert("last_status_message".to_string(), json!(message));
        }
        if !snapshot.extra_props.is_empty() {
            body.insert(
                "other_runtime_metadata".to_string(),
                json!(snapshot.extra_props),
            );
        }
        if let Some(at) = self.execution.last_app_heartbeat_at {
            body.insert("last_app_heartbeat_at".to_string(), json!(at));
        }
        if self.execution.failed_attempts > 0 {
            body.insert(
                "failed_attempts".to_string(),
                json!(self.execution.failed_attempts),
            );
        }
        if self.execution.timed_out_attempts > 0 {
            body.insert(
                "timed_out_attempts".to_string(),
                json!(self.execution.timed_out_attempts),
            );
        }

        Value::Object(body)
    }

    async fn send_update_body(&mut self, body: Value) -> Option<ServerDirectives> {
        if self.config.api.offline_mode || !self.managed {
            return None;
        }
        let Some(uuid) = self.execution.uuid.clone() else {
            debug!("No execution UUID, skipping update");
            return None;
        };
        let Some(api) = &mut self.api else {
            return None;
        };

        match api.update(&uuid, &body, &self.cancel.clone()).await {
            Ok(Some(directives)) => {
                self.execution.last_heartbeat_at = Some(Utc::now());
                self.tracker.mark_sent().await;
                Some(directives)
            }
            Ok(None) => None,
            Err(e) => {
                // Transient reporting failures never kill the child
                warn!("Update failed: {e}");
                None
            }
        }
    }

    async fn read_result_value(&mut self) -> Result<()> {
        let Some(filename) = self.config.io.result_filename.clone() else {
            return Ok(());
        };

        let format = self
            .config
            .io
            .result_value_format
            .or_else(|| ValueFormat::guess_from_location(&filename))
            .unwrap_or(ValueFormat::Json);

        match tokio::fs::read_to_string(&filename).await {
            Ok(raw) => {
                let value = parse_value(&raw, format)?;
                if self.config.io.log_result_value {
                    info!("Result value: {value}");
                }
                self.execution.result_value = Some(value);
                if self.config.io.cleanup_result_file {
                    self.cleanup_files.push(filename);
                }
            }
            Err(e) => {
                debug!("No result file at {filename}: {e}");
            }
        }

        Ok(())
    }

    /// Send the single terminal update. Sampled-out runs may late-register
    /// here when the outcome is a failure or timeout.
    async fn finalize(&mut self, tail_outcome: TailOutcome) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.execution.finished_at = Some(Utc::now());

        if self.stopped_by_signal && self.execution.status == ExecutionStatus::Stopping {
            self.execution.status = ExecutionStatus::Stopped;
        }

        if self.config.api.offline_mode {
            return;
        }

        if !self.managed {
            if !self.try_late_registration(tail_outcome).await {
                return;
            }
        }

        let Some(uuid) = self.execution.uuid.clone() else {
            return;
        };

        match &self.api {
            None => return,
            Some(api) if api.was_conflict => {
                // Another supervisor owns the record now; the server already
                // knows the outcome.
                debug!("Skipping the final update after a conflict");
                return;
            }
            Some(_) => {}
        }

        let mut body = match self.build_status_body(Some(self.execution.status)).await {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        if let Some(code) = self.execution.exit_code {
            body.insert("exit_code".to_string(), json!(code));
        }
        if let Some(at) = self.execution.finished_at {
            body.insert("finished_at".to_string(), json!(at));
        }
        if let Some(result) = &self.execution.result_value {
            body.insert("result_value".to_string(), result.clone());
        }
        if let Some(tail) = &self.tail {
            if let Some(lines) = tail.tail_for(tail_outcome).await {
                body.insert("log_tail".to_string(), json!(lines.join("\n")));
            }
        }

        if let Some(api) = &mut self.api {
            match api
                .finalize(&uuid, &Value::Object(body), &CancellationToken::new())
                .await
            {
                Ok(true) => info!("Final update sent"),
                Ok(false) => warn!("Final update could not be delivered"),
                Err(e) => warn!("Final update failed: {e}"),
            }
        }
    }

    /// Failure/timeout outcomes of sampled-out runs re-sample against the
    /// matching report probability and register late when they pass.
    async fn try_late_registration(&mut self, tail_outcome: TailOutcome) -> bool {
        let probability = match tail_outcome {
            TailOutcome::Failure => self.config.api.failure_report_probability,
            TailOutcome::Timeout => self.config.api.timeout_report_probability,
            TailOutcome::Success => return false,
        };

        let draw: f64 = rand::thread_rng().gen();
        if draw >= probability {
            debug!("Sampled out of late reporting ({draw:.3} >= {probability:.3})");
            return false;
        }

        info!("Late-registering a sampled-out run to report its outcome");
        self.fetch_runtime_metadata().await;

        let mut api = match ApiClient::new(self.config.api.clone()) {
            Ok(api) => api,
            Err(e) => {
                warn!("Late registration failed: {e}");
                return false;
            }
        };
        let body = self.build_creation_body();
        match api
            .create_execution(&body, None, &CancellationToken::new())
            .await
        {
            Ok(Some(response)) => {
                self.record_creation_response(response, None);
                self.api = Some(api);
                self.managed = true;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Late registration failed: {e}");
                false
            }
        }
    }

    /// The status tracker, so embedded callbacks can report progress without
    /// the UDP hop.
    pub fn tracker(&self) -> StatusTracker {
        self.tracker.clone()
    }

    /// Run an in-process callback under supervision instead of a child
    /// command. The callback receives the status tracker and is retried the
    /// same way a child would be.
    pub async fn run_embedded<T, F, Fut>(mut self, work: F) -> (RunOutcome, Option<T>)
    where
        F: Fn(StatusTracker) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.config.embedded_mode = true;

        if let Err(e) = self.bootstrap().await {
            error!("Supervisor failed: {e}");
            return (RunOutcome::from_error(&e), None);
        }

        self.draw_managed_sample();
        if let Err(e) = self.register().await {
            error!("Registration failed: {e}");
            self.cleanup().await;
            return (RunOutcome::from_error(&e), None);
        }

        let max_attempts = self.config.process.max_attempts();
        let mut attempt: u64 = 0;
        self.execution.status = ExecutionStatus::Running;
        self.execution.started_at = Some(Utc::now());

        loop {
            attempt += 1;
            info!("Calling managed function (attempt {attempt})");

            match work(self.tracker.clone()).await {
                Ok(value) => {
                    self.execution.status = ExecutionStatus::Succeeded;
                    self.execution.exit_code = Some(0);
                    self.finalize(TailOutcome::Success).await;
                    self.cleanup().await;
                    return (
                        RunOutcome {
                            status: ExecutionStatus::Succeeded,
                            exit_code: 0,
                            result_value: None,
                            attempt_count: attempt,
                        },
                        Some(value),
                    );
                }
                Err(e) => {
                    warn!("Managed function failed: {e}");
                    self.execution.failed_attempts += 1;

                    if self.attempts_remain(attempt, max_attempts) {
                        self.send_progress_update().await;
                        if self.delay_before_retry().await {
                            if let Err(e) = self.refresh_between_attempts().await {
                                warn!("Refresh between attempts failed: {e}");
                            }
                            continue;
                        }
                    }

                    self.execution.status = ExecutionStatus::Failed;
                    self.execution.exit_code = Some(EXIT_CODE_GENERIC_ERROR);
                    self.finalize(TailOutcome::Failure).await;
                    self.cleanup().await;
                    return (
                        RunOutcome {
                            status: ExecutionStatus::Failed,
                            exit_code: EXIT_CODE_GENERIC_ERROR,
                            result_value: None,
                            attempt_count: attempt,
                        },
                        None,
                    );
                }
            }
        }
    }

    /// Delete input/result/output files this invocation is responsible for.
    async fn cleanup(&mut self) {
        if self.config.io.cleanup_input_file.unwrap_or(false) {
            if let Some(filename) = &self.config.io.input_filename {
                self.cleanup_files.push(filename.clone());
            }
        }

        for filename in std::mem::take(&mut self.cleanup_files) {
            match tokio::fs::remove_file(&filename).await {
                Ok(()) => debug!("Removed {filename}"),
                Err(e) => debug!("Could not remove {filename}: {e}"),
            }
        }
    }
}

fn encode_opt(value: Option<u64>) -> i64 {
    value.map(|v| v as i64).unwrap_or(-1)
}
