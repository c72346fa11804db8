//! Configuration for taskwarden.
//!
//! Settings arrive from three places, in increasing precedence for
//! secret-sourced values: CLI options, `TASKWARDEN_*` environment variables,
//! and the resolved configuration (under the `taskwarden_params` property).
//! Mutable settings (API key, timeouts, process knobs) can be re-applied
//! between attempts after a TTL-driven re-resolution; immutable ones are
//! locked in at bootstrap.

use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::resolve::format::ValueFormat;
use crate::resolve::ResolverSettings;
use crate::task::TaskIdentity;

/// Prefix shared by every environment variable counterpart of a CLI option.
pub const ENV_PREFIX: &str = "TASKWARDEN_";

/// Config property that may carry supervisor settings in resolved config.
pub const PARAMS_CONFIG_PROPERTY: &str = "taskwarden_params";

pub const DEFAULT_API_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_API_ERROR_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_API_RETRY_DELAY_SECONDS: u64 = 120;
pub const DEFAULT_API_RESUME_DELAY_SECONDS: u64 = 600;
pub const DEFAULT_API_CREATION_ERROR_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_API_CREATION_CONFLICT_RETRY_DELAY_SECONDS: u64 = 120;
pub const DEFAULT_LIMITED_SERVICE_CREATION_CONFLICT_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_LIMITED_SERVICE_CREATION_CONFLICT_RETRY_DELAY_SECONDS: u64 = 60;
pub const DEFAULT_API_HEARTBEAT_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_LIMITED_SERVICE_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_API_FINAL_UPDATE_TIMEOUT_SECONDS: u64 = 1800;

/// Grace added to the heartbeat interval when deriving the default maximum
/// conflicting-execution age for services.
pub const HEARTBEAT_DELAY_TOLERANCE_SECONDS: u64 = 60;

pub const DEFAULT_STATUS_UPDATE_SOCKET_PORT: u16 = 2373;
pub const DEFAULT_STATUS_UPDATE_MESSAGE_MAX_BYTES: usize = 64 * 1024;

pub const DEFAULT_PROCESS_CHECK_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_PROCESS_RETRY_DELAY_SECONDS: u64 = 60;
pub const DEFAULT_PROCESS_TERMINATION_GRACE_PERIOD_SECONDS: u64 = 30;

pub const DEFAULT_MAX_LOG_LINE_LENGTH: usize = 1000;

/// How the child command is run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellMode {
    /// Use a shell when the command carries shell meta-characters
    #[default]
    Auto,
    /// Always run through a shell
    Enable,
    /// Never use a shell; the command is parsed into an argument list
    Disable,
}

impl ShellMode {
    pub fn from_name(name: &str) -> Option<ShellMode> {
        match name.trim().to_lowercase().as_str() {
            "auto" => Some(ShellMode::Auto),
            "enable" => Some(ShellMode::Enable),
            "disable" => Some(ShellMode::Disable),
            _ => None,
        }
    }
}

/// API client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// None disables heartbeats
    pub heartbeat_interval: Option<u64>,
    /// None retries indefinitely
    pub error_timeout: Option<u64>,
    pub retry_delay: u64,
    /// None means the client never resumes after exhaustion
    pub resume_delay: Option<u64>,
    pub creation_error_timeout: Option<u64>,
    pub creation_conflict_timeout: Option<u64>,
    pub creation_conflict_retry_delay: Option<u64>,
    pub request_timeout: Option<u64>,
    pub final_update_timeout: Option<u64>,
    pub offline_mode: bool,
    pub prevent_offline_execution: bool,
    /// Probability this run is registered with the service at all
    pub managed_probability: f64,
    /// Probability an unregistered failed run is reported after the fact
    pub failure_report_probability: f64,
    /// Probability an unregistered timed-out run is reported after the fact
    pub timeout_report_probability: f64,
    pub send_pid: bool,
    pub send_hostname: bool,
    pub send_runtime_metadata: bool,
    pub runtime_metadata_refresh_interval: Option<u64>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            heartbeat_interval: None,
            error_timeout: Some(DEFAULT_API_ERROR_TIMEOUT_SECONDS),
            retry_delay: DEFAULT_API_RETRY_DELAY_SECONDS,
            resume_delay: Some(DEFAULT_API_RESUME_DELAY_SECONDS),
            creation_error_timeout: Some(DEFAULT_API_CREATION_ERROR_TIMEOUT_SECONDS),
            creation_conflict_timeout: None,
            creation_conflict_retry_delay: None,
            request_timeout: Some(DEFAULT_API_REQUEST_TIMEOUT_SECONDS),
            final_update_timeout: Some(DEFAULT_API_FINAL_UPDATE_TIMEOUT_SECONDS),
            offline_mode: false,
            prevent_offline_execution: false,
            managed_probability: 1.0,
            failure_report_probability: 1.0,
            timeout_report_probability: 1.0,
            send_pid: false,
            send_hostname: false,
            send_runtime_metadata: true,
            runtime_metadata_refresh_interval: None,
        }
    }
}

/// Child process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Positional command and arguments (after `--`)
    pub command: Vec<String>,
    /// Alternative single-string command line
    pub command_line: Option<String>,
    pub work_dir: String,
    pub shell_mode: ShellMode,
    /// Unwrap a leading `sh -c "..."` before deciding shell mode
    pub strip_shell_wrapping: bool,
    /// Signal the whole process group rather than the leader only
    pub process_group_termination: bool,
    /// None means no timeout
    pub timeout: Option<u64>,
    /// None means retry forever
    pub max_retries: Option<u32>,
    pub retry_delay: u64,
    pub check_interval: u64,
    pub termination_grace_period: u64,
    /// Container this supervisor runs in, when it differs from the workload
    pub monitor_container_name: Option<String>,
    /// The workload container observed in sidecar mode
    pub main_container_name: Option<String>,
    pub sidecar_container_mode: Option<bool>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            command_line: None,
            work_dir: ".".to_string(),
            shell_mode: ShellMode::default(),
            strip_shell_wrapping: true,
            process_group_termination: true,
            timeout: None,
            max_retries: Some(0),
            retry_delay: DEFAULT_PROCESS_RETRY_DELAY_SECONDS,
            check_interval: DEFAULT_PROCESS_CHECK_INTERVAL_SECONDS,
            termination_grace_period: DEFAULT_PROCESS_TERMINATION_GRACE_PERIOD_SECONDS,
            monitor_container_name: None,
            main_container_name: None,
            sidecar_container_mode: None,
        }
    }
}

impl ProcessSettings {
    /// Total attempts allowed; None means unbounded.
    pub fn max_attempts(&self) -> Option<u64> {
        self.max_retries.map(|r| u64::from(r) + 1)
    }

    pub fn is_sidecar(&self) -> bool {
        self.sidecar_container_mode.unwrap_or(false)
    }
}

/// Input/result plumbing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    /// Inline input value from the CLI
    pub input_value: Option<String>,
    /// Env var the child reads the input value from
    pub input_env_var_name: Option<String>,
    /// File the input value is read from (and optionally written to)
    pub input_filename: Option<String>,
    pub input_value_format: Option<ValueFormat>,
    pub cleanup_input_file: Option<bool>,
    pub send_input_value: bool,
    /// File the child writes its result value to
    pub result_filename: Option<String>,
    pub result_value_format: Option<ValueFormat>,
    pub cleanup_result_file: bool,
    pub log_input_value: bool,
    pub log_result_value: bool,
}

/// Logging and log-tail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub log_secrets: bool,
    pub include_timestamps: bool,
    pub num_log_lines_sent_on_failure: usize,
    pub num_log_lines_sent_on_timeout: usize,
    pub num_log_lines_sent_on_success: usize,
    pub max_log_line_length: usize,
    pub merge_stdout_and_stderr_logs: bool,
    pub ignore_stdout: bool,
    pub ignore_stderr: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_secrets: false,
            include_timestamps: true,
            num_log_lines_sent_on_failure: 0,
            num_log_lines_sent_on_timeout: 0,
            num_log_lines_sent_on_success: 0,
            max_log_line_length: DEFAULT_MAX_LOG_LINE_LENGTH,
            merge_stdout_and_stderr_logs: true,
            ignore_stdout: false,
            ignore_stderr: false,
        }
    }
}

impl LogSettings {
    /// Lines the tail buffers must hold to satisfy every outcome.
    pub fn log_buffer_size(&self) -> usize {
        if self.max_log_line_length == 0 || (self.ignore_stdout && self.ignore_stderr) {
            return 0;
        }
        self.num_log_lines_sent_on_failure
            .max(self.num_log_lines_sent_on_timeout)
            .max(self.num_log_lines_sent_on_success)
    }
}

/// Status update listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub enable_status_update_listener: bool,
    pub status_update_socket_port: u16,
    pub status_update_message_max_bytes: usize,
    /// Minimum seconds between pushing merged status to the service; None
    /// sends merged status only with heartbeats
    pub status_update_interval: Option<u64>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            enable_status_update_listener: false,
            status_update_socket_port: DEFAULT_STATUS_UPDATE_SOCKET_PORT,
            status_update_message_max_bytes: DEFAULT_STATUS_UPDATE_MESSAGE_MAX_BYTES,
            status_update_interval: None,
        }
    }
}

/// The full supervisor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Running as a library wrapping a callback instead of a child command
    pub embedded_mode: bool,
    /// Resolve, write output files, and exit without running anything
    pub exit_after_writing_variables: bool,
    /// Deployment name (production, staging, ...)
    pub deployment: Option<String>,
    pub task: TaskIdentity,
    /// Attach to an execution the service already created
    pub task_execution_uuid: Option<String>,
    /// Maximum age of conflicting executions considered at registration
    pub max_conflicting_age: Option<u64>,
    pub api: ApiSettings,
    pub process: ProcessSettings,
    pub io: IoSettings,
    pub log: LogSettings,
    pub updates: UpdateSettings,
    pub resolver: ResolverSettings,
}

impl Config {
    /// Overlay `TASKWARDEN_*` environment variables. With `mutable_only`,
    /// only the settings that may change between attempts are touched.
    pub fn apply_env(&mut self, env: &HashMap<String, String>, mutable_only: bool) {
        if !mutable_only {
            self.apply_immutable_env(env);
        }
        self.apply_mutable_env(env);
    }

    fn apply_immutable_env(&mut self, env: &HashMap<String, String>) {
        let get = |name: &str| env.get(&format!("{ENV_PREFIX}{name}"));

        apply_bool(get("OFFLINE_MODE"), &mut self.api.offline_mode);
        apply_bool(
            get("PREVENT_OFFLINE_EXECUTION"),
            &mut self.api.prevent_offline_execution,
        );
        apply_string_opt(get("DEPLOYMENT"), &mut self.deployment);

        apply_string_opt(get("TASK_NAME"), &mut self.task.name);
        apply_string_opt(get("TASK_UUID"), &mut self.task.uuid);
        apply_string_opt(get("TASK_EXECUTION_UUID"), &mut self.task_execution_uuid);
        apply_string_opt(get("SCHEDULE"), &mut self.task.schedule);
        apply_bool(get("TASK_IS_SERVICE"), &mut self.task.is_service);
        apply_bool(get("TASK_IS_PASSIVE"), &mut self.task.is_passive);
        apply_bool(get("AUTO_CREATE_TASK"), &mut self.task.auto_create);
        apply_string_opt(
            get("AUTO_CREATE_TASK_RUN_ENVIRONMENT_NAME"),
            &mut self.task.run_environment_name,
        );
        apply_string_opt(
            get("AUTO_CREATE_TASK_RUN_ENVIRONMENT_UUID"),
            &mut self.task.run_environment_uuid,
        );
        apply_string_opt(
            get("BUILD_TASK_EXECUTION_UUID"),
            &mut self.task.build_task_execution_uuid,
        );
        apply_string_opt(
            get("DEPLOYMENT_TASK_EXECUTION_UUID"),
            &mut self.task.deployment_task_execution_uuid,
        );

        if let Some(v) = parse_int(get("TASK_VERSION_NUMBER")) {
            self.task.version_number = Some(v);
        }
        apply_string_opt(get("TASK_VERSION_TEXT"), &mut self.task.version_text);
        apply_string_opt(
            get("TASK_VERSION_SIGNATURE"),
            &mut self.task.version_signature,
        );

        if let Some(v) = parse_int(get("TASK_MAX_CONCURRENCY")) {
            self.task.max_concurrency = if v < 0 { None } else { Some(v) };
        }
        if let Some(v) = parse_int(get("MAX_CONFLICTING_AGE_SECONDS")) {
            self.max_conflicting_age = if v < 0 { None } else { Some(v as u64) };
        }

        if let Some(raw) = get("TASK_INSTANCE_METADATA") {
            match serde_json::from_str(raw) {
                Ok(map) => self.task.instance_metadata = Some(map),
                Err(e) => warn!("Failed to parse instance metadata: {e}"),
            }
        }
        if let Some(raw) = get("AUTO_CREATE_TASK_PROPS") {
            match serde_json::from_str(raw) {
                Ok(value) => {
                    self.task.auto_create_props = Some(value);
                    self.task.auto_create = true;
                }
                Err(e) => warn!("Failed to parse auto-create task props: {e}"),
            }
        }

        apply_f64(get("API_MANAGED_PROBABILITY"), &mut self.api.managed_probability);
        apply_f64(
            get("API_FAILURE_REPORT_PROBABILITY"),
            &mut self.api.failure_report_probability,
        );
        apply_f64(
            get("API_TIMEOUT_REPORT_PROBABILITY"),
            &mut self.api.timeout_report_probability,
        );

        apply_bool(get("INCLUDE_TIMESTAMPS_IN_LOG"), &mut self.log.include_timestamps);
        apply_string(get("LOG_LEVEL"), &mut self.log.level);
        apply_bool(get("LOG_SECRETS"), &mut self.log.log_secrets);
        apply_usize(
            get("NUM_LOG_LINES_SENT_ON_FAILURE"),
            &mut self.log.num_log_lines_sent_on_failure,
        );
        apply_usize(
            get("NUM_LOG_LINES_SENT_ON_TIMEOUT"),
            &mut self.log.num_log_lines_sent_on_timeout,
        );
        apply_usize(
            get("NUM_LOG_LINES_SENT_ON_SUCCESS"),
            &mut self.log.num_log_lines_sent_on_success,
        );
        apply_usize(get("MAX_LOG_LINE_LENGTH"), &mut self.log.max_log_line_length);
        apply_bool(
            get("MERGE_STDOUT_AND_STDERR_LOGS"),
            &mut self.log.merge_stdout_and_stderr_logs,
        );
        apply_bool(get("IGNORE_STDOUT"), &mut self.log.ignore_stdout);
        apply_bool(get("IGNORE_STDERR"), &mut self.log.ignore_stderr);

        apply_string_opt(get("INPUT_ENV_VAR_NAME"), &mut self.io.input_env_var_name);
        apply_string_opt(get("INPUT_FILENAME"), &mut self.io.input_filename);
        if let Some(f) = get("INPUT_VALUE_FORMAT").and_then(|s| ValueFormat::from_name(s)) {
            self.io.input_value_format = Some(f);
        }
        if let Some(b) = parse_bool(get("CLEANUP_INPUT_FILE")) {
            self.io.cleanup_input_file = Some(b);
        }
        apply_bool(get("SEND_INPUT_VALUE"), &mut self.io.send_input_value);
        apply_bool(get("LOG_INPUT_VALUE"), &mut self.io.log_input_value);
        apply_string_opt(get("RESULT_FILENAME"), &mut self.io.result_filename);
        if let Some(f) = get("RESULT_VALUE_FORMAT").and_then(|s| ValueFormat::from_name(s)) {
            self.io.result_value_format = Some(f);
        }
        apply_bool(get("CLEANUP_RESULT_FILE"), &mut self.io.cleanup_result_file);
        apply_bool(get("LOG_RESULT_VALUE"), &mut self.io.log_result_value);

        apply_bool(
            get("ENABLE_STATUS_UPDATE_LISTENER"),
            &mut self.updates.enable_status_update_listener,
        );
        if let Some(v) = parse_int(get("STATUS_UPDATE_SOCKET_PORT")) {
            if v > 0 && v <= i64::from(u16::MAX) {
                self.updates.status_update_socket_port = v as u16;
            }
        }
        if let Some(v) = parse_int(get("STATUS_UPDATE_MESSAGE_MAX_BYTES")) {
            if v > 0 {
                self.updates.status_update_message_max_bytes = v as usize;
            }
        }
        if let Some(v) = parse_int(get("STATUS_UPDATE_INTERVAL_SECONDS")) {
            self.updates.status_update_interval = if v < 0 { None } else { Some(v as u64) };
        }

        apply_bool(
            get("EXIT_AFTER_WRITING_VARIABLES"),
            &mut self.exit_after_writing_variables,
        );

        apply_string_opt(
            get("MAIN_CONTAINER_NAME"),
            &mut self.process.main_container_name,
        );
        apply_string_opt(
            get("MONITOR_CONTAINER_NAME"),
            &mut self.process.monitor_container_name,
        );
        if let Some(b) = parse_bool(get("SIDECAR_CONTAINER_MODE")) {
            self.process.sidecar_container_mode = Some(b);
        }

        self.apply_resolver_env(env);
    }

    /// Overlay resolver settings from the environment. Also called with the
    /// merged environment after env locations are fetched, so fetched env
    /// files can point at config locations.
    pub fn apply_resolver_env(&mut self, env: &HashMap<String, String>) {
        let get = |name: &str| env.get(&format!("{ENV_PREFIX}{name}"));

        apply_bool(get("LOG_SECRETS"), &mut self.resolver.log_secrets);

        if let Some(raw) = get("ENV_LOCATIONS") {
            self.resolver.env_locations = split_location_string(raw);
        }
        if let Some(raw) = get("CONFIG_LOCATIONS") {
            self.resolver.config_locations = split_location_string(raw);
        }
        if let Some(strategy) = get("CONFIG_MERGE_STRATEGY")
            .and_then(|s| crate::resolve::merge::MergeStrategy::from_name(s))
        {
            self.resolver.merge_strategy = strategy;
        }
        apply_bool(
            get("OVERWRITE_ENV_WITH_SECRETS"),
            &mut self.resolver.overwrite_env_during_resolution,
        );

        if let Some(enabled) = parse_bool(get("RESOLVE_SECRETS")) {
            if !enabled {
                self.resolver.max_resolution_depth = 0;
                self.resolver.max_resolution_iterations = 0;
            }
        }
        if let Some(v) = parse_int(get("MAX_CONFIG_RESOLUTION_DEPTH")) {
            self.resolver.max_resolution_depth = v.max(0) as u32;
        }
        if let Some(v) = parse_int(get("MAX_CONFIG_RESOLUTION_ITERATIONS")) {
            self.resolver.max_resolution_iterations = v.max(0) as u32;
        }
        if let Some(v) = parse_int(get("CONFIG_TTL_SECONDS")) {
            self.resolver.config_ttl = if v < 0 { None } else { Some(v as u64) };
        }
        apply_bool(
            get("FAIL_FAST_CONFIG_RESOLUTION"),
            &mut self.resolver.fail_fast_resolution,
        );

        if let Some(v) = get("RESOLVABLE_ENV_VAR_NAME_PREFIX") {
            self.resolver.env_var_name_prefix = v.clone();
        }
        if let Some(v) = get("RESOLVABLE_ENV_VAR_NAME_SUFFIX") {
            self.resolver.env_var_name_suffix = v.clone();
        }
        if let Some(v) = get("RESOLVABLE_CONFIG_PROPERTY_NAME_PREFIX") {
            self.resolver.config_property_name_prefix = v.clone();
        }
        if let Some(v) = get("RESOLVABLE_CONFIG_PROPERTY_NAME_SUFFIX") {
            self.resolver.config_property_name_suffix = v.clone();
        }
        if let Some(v) = get("ENV_VAR_NAME_FOR_CONFIG") {
            self.resolver.env_var_name_for_config =
                if v.is_empty() { None } else { Some(v.clone()) };
        }
        if let Some(v) = get("CONFIG_PROPERTY_NAME_FOR_ENV") {
            self.resolver.config_property_name_for_env =
                if v.is_empty() { None } else { Some(v.clone()) };
        }
        apply_string_opt(
            get("ENV_OUTPUT_FILENAME"),
            &mut self.resolver.env_output_filename,
        );
        if let Some(f) = get("ENV_OUTPUT_FORMAT").and_then(|s| ValueFormat::from_name(s)) {
            self.resolver.env_output_format = Some(f);
        }
        apply_string_opt(
            get("CONFIG_OUTPUT_FILENAME"),
            &mut self.resolver.config_output_filename,
        );
        if let Some(f) = get("CONFIG_OUTPUT_FORMAT").and_then(|s| ValueFormat::from_name(s)) {
            self.resolver.config_output_format = Some(f);
        }
    }

    fn apply_mutable_env(&mut self, env: &HashMap<String, String>) {
        let get = |name: &str| env.get(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = parse_int(get("PROCESS_TIMEOUT_SECONDS")) {
            self.process.timeout = if v <= 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get("PROCESS_MAX_RETRIES")) {
            self.process.max_retries = if v < 0 { None } else { Some(v as u32) };
        }
        if let Some(v) = parse_int(get("PROCESS_RETRY_DELAY_SECONDS")) {
            self.process.retry_delay = v.max(0) as u64;
        }
        if let Some(v) = parse_int(get("PROCESS_CHECK_INTERVAL_SECONDS")) {
            if v > 0 {
                self.process.check_interval = v as u64;
            }
        }
        if let Some(v) = parse_int(get("PROCESS_TERMINATION_GRACE_PERIOD_SECONDS")) {
            self.process.termination_grace_period = v.max(0) as u64;
        }

        apply_string_opt(get("TASK_COMMAND"), &mut self.process.command_line);
        if let Some(mode) = get("SHELL_MODE").and_then(|s| ShellMode::from_name(s)) {
            self.process.shell_mode = mode;
        }
        apply_bool(
            get("STRIP_SHELL_WRAPPING"),
            &mut self.process.strip_shell_wrapping,
        );
        apply_bool(
            get("TERMINATE_PROCESS_GROUP"),
            &mut self.process.process_group_termination,
        );
        apply_string(get("WORK_DIR"), &mut self.process.work_dir);

        apply_string_opt(get("API_BASE_URL"), &mut self.api.base_url);
        apply_string_opt(get("API_KEY"), &mut self.api.api_key);
        if let Some(v) = parse_int(get("API_HEARTBEAT_INTERVAL_SECONDS")) {
            self.api.heartbeat_interval = if v < 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get("API_ERROR_TIMEOUT_SECONDS")) {
            self.api.error_timeout = if v < 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get("API_RETRY_DELAY_SECONDS")) {
            self.api.retry_delay = v.max(0) as u64;
        }
        if let Some(v) = parse_int(get("API_RESUME_DELAY_SECONDS")) {
            self.api.resume_delay = if v < 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get("API_TASK_EXECUTION_CREATION_ERROR_TIMEOUT_SECONDS")) {
            self.api.creation_error_timeout = if v < 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get("API_TASK_EXECUTION_CREATION_CONFLICT_TIMEOUT_SECONDS")) {
            self.api.creation_conflict_timeout = if v < 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get(
            "API_TASK_EXECUTION_CREATION_CONFLICT_RETRY_DELAY_SECONDS",
        )) {
            self.api.creation_conflict_retry_delay = Some(v.max(0) as u64);
        }
        if let Some(v) = parse_int(get("API_REQUEST_TIMEOUT_SECONDS")) {
            self.api.request_timeout = if v < 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = parse_int(get("API_FINAL_UPDATE_TIMEOUT_SECONDS")) {
            self.api.final_update_timeout = if v < 0 { None } else { Some(v as u64) };
        }

        apply_bool(get("SEND_PID"), &mut self.api.send_pid);
        apply_bool(get("SEND_HOSTNAME"), &mut self.api.send_hostname);
        apply_bool(get("SEND_RUNTIME_METADATA"), &mut self.api.send_runtime_metadata);
        if let Some(v) = parse_int(get("RUNTIME_METADATA_REFRESH_INTERVAL_SECONDS")) {
            self.api.runtime_metadata_refresh_interval =
                if v <= 0 { None } else { Some(v as u64) };
        }
    }

    /// Overlay settings from the `taskwarden_params` property of the
    /// resolved configuration.
    pub fn apply_config_overrides(&mut self, config: &Value, mutable_only: bool) {
        let Some(params) = config.get(PARAMS_CONFIG_PROPERTY).and_then(Value::as_object) else {
            return;
        };

        let get_u64 = |name: &str| params.get(name).and_then(Value::as_u64);
        let get_bool = |name: &str| params.get(name).and_then(Value::as_bool);
        let get_str = |name: &str| params.get(name).and_then(Value::as_str);

        if !mutable_only {
            if let Some(v) = get_bool("offline_mode") {
                self.api.offline_mode = v;
            }
            if let Some(v) = get_bool("prevent_offline_execution") {
                self.api.prevent_offline_execution = v;
            }
            if let Some(v) = get_str("schedule") {
                self.task.schedule = Some(v.to_string());
            }
            if let Some(v) = params.get("max_concurrency").and_then(Value::as_i64) {
                self.task.max_concurrency = Some(v);
            }
            if let Some(v) = get_bool("service") {
                self.task.is_service = v;
            }
            if let Some(v) = get_str("deployment") {
                self.deployment = Some(v.to_string());
            }
            if let Some(v) = get_u64("status_update_interval") {
                self.updates.status_update_interval = Some(v);
            }
            if let Some(v) = get_str("log_level") {
                self.log.level = v.to_string();
            }
        }

        if let Some(v) = get_str("api_key") {
            self.api.api_key = Some(v.to_string());
        }
        if let Some(v) = get_str("api_base_url") {
            self.api.base_url = Some(v.to_string());
        }
        if let Some(v) = get_u64("api_request_timeout") {
            self.api.request_timeout = Some(v);
        }
        if let Some(v) = get_u64("api_error_timeout") {
            self.api.error_timeout = Some(v);
        }
        if let Some(v) = get_u64("api_retry_delay") {
            self.api.retry_delay = v;
        }
        if let Some(v) = get_u64("api_resume_delay") {
            self.api.resume_delay = Some(v);
        }
        if let Some(v) = get_u64("api_heartbeat_interval") {
            self.api.heartbeat_interval = Some(v);
        }
        if let Some(v) = get_u64("process_timeout") {
            self.process.timeout = Some(v);
        }
        if let Some(v) = get_u64("process_max_retries") {
            self.process.max_retries = Some(v as u32);
        }
        if let Some(v) = get_u64("process_retry_delay") {
            self.process.retry_delay = v;
        }
        if let Some(v) = get_u64("process_termination_grace_period") {
            self.process.termination_grace_period = v;
        }
        if let Some(v) = get_str("work_dir") {
            self.process.work_dir = v.to_string();
        }
        if let Some(v) = get_str("command_line") {
            self.process.command_line = Some(v.to_string());
        }
        if let Some(v) = get_str("shell_mode").and_then(ShellMode::from_name) {
            self.process.shell_mode = v;
        }
        if let Some(v) = get_bool("strip_shell_wrapping") {
            self.process.strip_shell_wrapping = v;
        }
        if let Some(v) = get_bool("process_group_termination") {
            self.process.process_group_termination = v;
        }
        if let Some(v) = get_bool("send_pid") {
            self.api.send_pid = v;
        }
        if let Some(v) = get_bool("send_hostname") {
            self.api.send_hostname = v;
        }
        if let Some(v) = get_bool("send_runtime_metadata") {
            self.api.send_runtime_metadata = v;
        }
    }

    /// Apply derived defaults and reject contradictory settings. Called once
    /// at bootstrap after all overlays.
    pub fn validate(&mut self) -> Result<()> {
        // Sidecar mode is implied by distinct main/monitor container names
        if self.process.sidecar_container_mode.is_none()
            && self.process.main_container_name.is_some()
            && self.process.monitor_container_name.is_some()
            && self.process.main_container_name != self.process.monitor_container_name
        {
            self.process.sidecar_container_mode = Some(true);
        }

        if self.exit_after_writing_variables {
            return Ok(());
        }

        if self.embedded_mode {
            if !self.process.command.is_empty() || self.process.command_line.is_some() {
                return Err(Error::Configuration(
                    "a command cannot be supplied in embedded mode".to_string(),
                ));
            }
            if self.process.is_sidecar() {
                return Err(Error::Configuration(
                    "sidecar container mode is not supported in embedded mode".to_string(),
                ));
            }
        } else if self.process.command.is_empty()
            && self.process.command_line.is_none()
            && !self.process.is_sidecar()
        {
            return Err(Error::Configuration(
                "a command is required in wrapped mode".to_string(),
            ));
        }

        if self.process.is_sidecar() && self.process.max_retries != Some(0) {
            warn!("Forcing process retries to 0 while monitoring an external process");
            self.process.max_retries = Some(0);
        }

        if self.task.is_service && self.process.timeout.is_some() {
            warn!("Ignoring process timeout because the Task is a service");
            self.process.timeout = None;
        }

        if self.task_execution_uuid.is_some() && self.api.managed_probability < 1.0 {
            warn!("Forcing managed probability to 1.0 because an execution UUID was provided");
            self.api.managed_probability = 1.0;
        }

        if !self.api.offline_mode
            && self.api.managed_probability <= 0.0
            && self.api.failure_report_probability <= 0.0
            && self.api.timeout_report_probability <= 0.0
        {
            warn!("All report probabilities are 0, enabling offline mode");
            self.api.offline_mode = true;
        }

        if self.api.offline_mode {
            if self.api.prevent_offline_execution {
                return Err(Error::Configuration(
                    "offline mode and offline execution prevention cannot both be enabled"
                        .to_string(),
                ));
            }
            return Ok(());
        }

        for (p, name) in [
            (self.api.managed_probability, "api-managed-probability"),
            (
                self.api.failure_report_probability,
                "api-failure-report-probability",
            ),
            (
                self.api.timeout_report_probability,
                "api-timeout-report-probability",
            ),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Configuration(format!(
                    "{name} must be between 0.0 and 1.0"
                )));
            }
        }

        if self.api.prevent_offline_execution && self.api.managed_probability < 1.0 {
            return Err(Error::Configuration(
                "managed probability must be 1.0 when preventing offline execution".to_string(),
            ));
        }

        if self.task.name.is_none() && self.task.uuid.is_none() {
            return Err(Error::Configuration(
                "either the Task name or the Task UUID must be specified".to_string(),
            ));
        }
        if self.api.api_key.is_none() {
            return Err(Error::Configuration("no API key specified".to_string()));
        }
        if self.api.base_url.is_none() {
            return Err(Error::Configuration("no API base URL specified".to_string()));
        }

        if self.task.auto_create {
            if self.task.run_environment_name.is_none()
                && self.task.run_environment_uuid.is_none()
            {
                match &self.deployment {
                    Some(deployment) => {
                        self.task.run_environment_name = Some(deployment.clone());
                    }
                    None => {
                        return Err(Error::Configuration(
                            "auto-created Tasks need a Run Environment name or UUID".to_string(),
                        ));
                    }
                }
            }
        }

        // Derived defaults for concurrency-limited services
        let limited = self.task.is_concurrency_limited_service();

        if self.api.heartbeat_interval.is_none() {
            self.api.heartbeat_interval = Some(if limited {
                DEFAULT_LIMITED_SERVICE_HEARTBEAT_INTERVAL_SECONDS
            } else {
                DEFAULT_API_HEARTBEAT_INTERVAL_SECONDS
            });
        }
        if self.api.creation_conflict_timeout.is_none() {
            self.api.creation_conflict_timeout = Some(if limited {
                DEFAULT_LIMITED_SERVICE_CREATION_CONFLICT_TIMEOUT_SECONDS
            } else {
                0
            });
        }
        if self.api.creation_conflict_retry_delay.is_none() {
            self.api.creation_conflict_retry_delay = Some(if limited {
                DEFAULT_LIMITED_SERVICE_CREATION_CONFLICT_RETRY_DELAY_SECONDS
            } else {
                DEFAULT_API_CREATION_CONFLICT_RETRY_DELAY_SECONDS
            });
        }
        if self.max_conflicting_age.is_none() && self.task.is_service {
            if let Some(interval) = self.api.heartbeat_interval {
                self.max_conflicting_age = Some(interval + HEARTBEAT_DELAY_TOLERANCE_SECONDS);
            }
        }

        Ok(())
    }

    /// Variables exposed to the child describing the supervisor's own
    /// settings, so nested tooling can coordinate with it.
    pub fn populate_child_env(&self, env: &mut HashMap<String, String>) {
        let set = |env: &mut HashMap<String, String>, name: &str, value: String| {
            env.insert(format!("{ENV_PREFIX}{name}"), value);
        };

        if let Some(deployment) = &self.deployment {
            set(env, "DEPLOYMENT", deployment.clone());
        }

        set(
            env,
            "OFFLINE_MODE",
            bool_env_value(self.api.offline_mode),
        );

        if !self.api.offline_mode {
            if let Some(url) = &self.api.base_url {
                set(env, "API_BASE_URL", url.clone());
            }
            if let Some(key) = &self.api.api_key {
                set(env, "API_KEY", key.clone());
            }
            set(
                env,
                "API_ERROR_TIMEOUT_SECONDS",
                encode_opt_seconds(self.api.error_timeout),
            );
            set(
                env,
                "API_RETRY_DELAY_SECONDS",
                self.api.retry_delay.to_string(),
            );
            set(
                env,
                "API_RESUME_DELAY_SECONDS",
                encode_opt_seconds(self.api.resume_delay),
            );
            set(
                env,
                "API_REQUEST_TIMEOUT_SECONDS",
                encode_opt_seconds(self.api.request_timeout),
            );
            set(
                env,
                "API_MANAGED_PROBABILITY",
                self.api.managed_probability.to_string(),
            );

            set(
                env,
                "ENABLE_STATUS_UPDATE_LISTENER",
                bool_env_value(self.updates.enable_status_update_listener),
            );
            if self.updates.enable_status_update_listener {
                set(
                    env,
                    "STATUS_UPDATE_SOCKET_PORT",
                    self.updates.status_update_socket_port.to_string(),
                );
                set(
                    env,
                    "STATUS_UPDATE_MESSAGE_MAX_BYTES",
                    self.updates.status_update_message_max_bytes.to_string(),
                );
            }

            if let Some(uuid) = &self.task_execution_uuid {
                set(env, "TASK_EXECUTION_UUID", uuid.clone());
            }
            if let Some(uuid) = &self.task.uuid {
                set(env, "TASK_UUID", uuid.clone());
            }
            if let Some(name) = &self.task.name {
                set(env, "TASK_NAME", name.clone());
            }
        }

        if let Some(n) = self.task.version_number {
            set(env, "TASK_VERSION_NUMBER", n.to_string());
        }
        if let Some(text) = &self.task.version_text {
            set(env, "TASK_VERSION_TEXT", text.clone());
        }
        if let Some(sig) = &self.task.version_signature {
            set(env, "TASK_VERSION_SIGNATURE", sig.clone());
        }
        if let Some(metadata) = &self.task.instance_metadata {
            if let Ok(encoded) = serde_json::to_string(metadata) {
                set(env, "TASK_INSTANCE_METADATA", encoded);
            }
        }

        if let Some(name) = &self.io.input_env_var_name {
            set(env, "INPUT_ENV_VAR_NAME", name.clone());
        }
        if let Some(name) = &self.io.input_filename {
            set(env, "INPUT_FILENAME", name.clone());
        }
        if let Some(format) = self.io.input_value_format {
            set(env, "INPUT_VALUE_FORMAT", format.name().to_string());
        }
        if let Some(name) = &self.io.result_filename {
            set(env, "RESULT_FILENAME", name.clone());
        }
        if let Some(format) = self.io.result_value_format {
            set(env, "RESULT_VALUE_FORMAT", format.name().to_string());
        }

        set(
            env,
            "PROCESS_TIMEOUT_SECONDS",
            encode_opt_seconds(self.process.timeout),
        );
        set(
            env,
            "PROCESS_TERMINATION_GRACE_PERIOD_SECONDS",
            self.process.termination_grace_period.to_string(),
        );
        set(
            env,
            "MAX_CONCURRENCY",
            self.task
                .max_concurrency
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-1".to_string()),
        );
        set(
            env,
            "PREVENT_OFFLINE_EXECUTION",
            bool_env_value(self.api.prevent_offline_execution),
        );
    }
}

/// Split a location list on `,` or `;`, honouring backslash escapes.
pub fn split_location_string(raw: &str) -> Vec<String> {
    let mut locations = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in raw.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' || c == ';' {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                locations.push(trimmed.to_string());
            }
            current.clear();
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        locations.push(trimmed.to_string());
    }

    locations
}

fn bool_env_value(b: bool) -> String {
    if b { "TRUE" } else { "FALSE" }.to_string()
}

fn encode_opt_seconds(value: Option<u64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-1".to_string())
}

/// `TRUE` (any case) is true, anything else false; empty/missing leaves the
/// current value.
fn parse_bool(raw: Option<&String>) -> Option<bool> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(raw.eq_ignore_ascii_case("true"))
}

fn parse_int(raw: Option<&String>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable integer value '{raw}'");
            None
        }
    }
}

fn parse_f64(raw: Option<&String>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable number '{raw}'");
            None
        }
    }
}

fn apply_bool(raw: Option<&String>, target: &mut bool) {
    if let Some(v) = parse_bool(raw) {
        *target = v;
    }
}

fn apply_f64(raw: Option<&String>, target: &mut f64) {
    if let Some(v) = parse_f64(raw) {
        *target = v;
    }
}

fn apply_usize(raw: Option<&String>, target: &mut usize) {
    if let Some(v) = parse_int(raw) {
        *target = v.max(0) as usize;
    }
}

fn apply_string(raw: Option<&String>, target: &mut String) {
    if let Some(v) = raw {
        if !v.trim().is_empty() {
            *target = v.clone();
        }
    }
}

fn apply_string_opt(raw: Option<&String>, target: &mut Option<String>) {
    if let Some(v) = raw {
        if !v.trim().is_empty() {
            *target = Some(v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn offline_config() -> Config {
        Config {
            api: ApiSettings {
                offline_mode: true,
                ..Default::default()
            },
            process: ProcessSettings {
                command: vec!["/bin/true".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env = env_of(&[
            ("TASKWARDEN_TASK_NAME", "etl"),
            ("TASKWARDEN_OFFLINE_MODE", "TRUE"),
            ("TASKWARDEN_PROCESS_MAX_RETRIES", "3"),
            ("TASKWARDEN_API_HEARTBEAT_INTERVAL_SECONDS", "-1"),
            ("TASKWARDEN_PROCESS_TIMEOUT_SECONDS", "120"),
        ]);
        config.apply_env(&env, false);

        assert_eq!(config.task.name.as_deref(), Some("etl"));
        assert!(config.api.offline_mode);
        assert_eq!(config.process.max_retries, Some(3));
        assert_eq!(config.api.heartbeat_interval, None);
        assert_eq!(config.process.timeout, Some(120));
    }

    #[test]
    fn test_mutable_only_skips_immutable() {
        let mut config = Config::default();
        let env = env_of(&[
            ("TASKWARDEN_TASK_NAME", "etl"),
            ("TASKWARDEN_API_KEY", "k2"),
        ]);
        config.apply_env(&env, true);

        assert_eq!(config.task.name, None);
        assert_eq!(config.api.api_key.as_deref(), Some("k2"));
    }

    #[test]
    fn test_negative_retries_means_forever() {
        let mut config = Config::default();
        let env = env_of(&[("TASKWARDEN_PROCESS_MAX_RETRIES", "-1")]);
        config.apply_env(&env, false);
        assert_eq!(config.process.max_retries, None);
        assert_eq!(config.process.max_attempts(), None);
    }

    #[test]
    fn test_validate_requires_command_in_wrapped_mode() {
        let mut config = Config {
            api: ApiSettings {
                offline_mode: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_offline_happy_path() {
        let mut config = offline_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_offline_prevention_conflict() {
        let mut config = offline_config();
        config.api.prevent_offline_execution = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_online_requires_identity_and_key() {
        let mut config = Config {
            process: ProcessSettings {
                command: vec!["/bin/true".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.task.name = Some("t".to_string());
        assert!(config.validate().is_err());

        config.api.api_key = Some("key".to_string());
        config.api.base_url = Some("http://localhost:9000".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_derives_limited_service_defaults() {
        let mut config = Config {
            task: TaskIdentity {
                name: Some("svc".to_string()),
                is_service: true,
                max_concurrency: Some(1),
                ..Default::default()
            },
            api: ApiSettings {
                api_key: Some("k".to_string()),
                base_url: Some("http://localhost:9000".to_string()),
                ..Default::default()
            },
            process: ProcessSettings {
                command: vec!["/bin/true".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();

        assert_eq!(
            config.api.heartbeat_interval,
            Some(DEFAULT_LIMITED_SERVICE_HEARTBEAT_INTERVAL_SECONDS)
        );
        assert_eq!(
            config.api.creation_conflict_timeout,
            Some(DEFAULT_LIMITED_SERVICE_CREATION_CONFLICT_TIMEOUT_SECONDS)
        );
        assert_eq!(
            config.max_conflicting_age,
            Some(
                DEFAULT_LIMITED_SERVICE_HEARTBEAT_INTERVAL_SECONDS
                    + HEARTBEAT_DELAY_TOLERANCE_SECONDS
            )
        );
    }

    #[test]
    fn test_validate_service_clears_timeout() {
        let mut config = offline_config();
        config.task.is_service = true;
        config.process.timeout = Some(60);
        config.validate().unwrap();
        assert_eq!(config.process.timeout, None);
    }

    #[test]
    fn test_all_zero_probabilities_forces_offline() {
        let mut config = Config {
            task: TaskIdentity {
                name: Some("t".to_string()),
                ..Default::default()
            },
            api: ApiSettings {
                managed_probability: 0.0,
                failure_report_probability: 0.0,
                timeout_report_probability: 0.0,
                ..Default::default()
            },
            process: ProcessSettings {
                command: vec!["/bin/true".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.api.offline_mode);
    }

    #[test]
    fn test_execution_uuid_forces_managed() {
        let mut config = offline_config();
        config.api.offline_mode = false;
        config.api.managed_probability = 0.2;
        config.task.name = Some("t".to_string());
        config.api.api_key = Some("k".to_string());
        config.api.base_url = Some("http://localhost:9000".to_string());
        config.task_execution_uuid = Some("u-1".to_string());
        config.validate().unwrap();
        assert_eq!(config.api.managed_probability, 1.0);
    }

    #[test]
    fn test_sidecar_implied_by_container_names() {
        let mut config = offline_config();
        config.process.command.clear();
        config.process.main_container_name = Some("app".to_string());
        config.process.monitor_container_name = Some("warden".to_string());
        config.process.max_retries = Some(2);
        config.validate().unwrap();
        assert!(config.process.is_sidecar());
        // External processes are not retried
        assert_eq!(config.process.max_retries, Some(0));
    }

    #[test]
    fn test_config_overrides() {
        let mut config = offline_config();
        let overrides = json!({
            PARAMS_CONFIG_PROPERTY: {
                "api_retry_delay": 5,
                "process_retry_delay": 7,
                "work_dir": "/srv",
                "offline_mode": false,
            }
        });
        config.apply_config_overrides(&overrides, false);
        assert_eq!(config.api.retry_delay, 5);
        assert_eq!(config.process.retry_delay, 7);
        assert_eq!(config.process.work_dir, "/srv");
        assert!(!config.api.offline_mode);

        let mut config = offline_config();
        config.apply_config_overrides(&overrides, true);
        // Immutable settings are untouched on a mutable-only pass
        assert!(config.api.offline_mode);
        assert_eq!(config.api.retry_delay, 5);
    }

    #[test]
    fn test_populate_child_env() {
        let mut config = offline_config();
        config.task.version_text = Some("1.2.3".to_string());
        config.process.timeout = Some(90);

        let mut env = HashMap::new();
        config.populate_child_env(&mut env);

        assert_eq!(env.get("TASKWARDEN_OFFLINE_MODE").unwrap(), "TRUE");
        assert_eq!(env.get("TASKWARDEN_TASK_VERSION_TEXT").unwrap(), "1.2.3");
        assert_eq!(env.get("TASKWARDEN_PROCESS_TIMEOUT_SECONDS").unwrap(), "90");
        assert_eq!(env.get("TASKWARDEN_MAX_CONCURRENCY").unwrap(), "-1");
        // No API settings leak in offline mode
        assert!(!env.contains_key("TASKWARDEN_API_KEY"));
    }

    #[test]
    fn test_split_location_string() {
        assert_eq!(
            split_location_string("a.json, b.yml ;c.env"),
            vec!["a.json", "b.yml", "c.env"]
        );
        assert_eq!(
            split_location_string("with\\,comma,plain"),
            vec!["with,comma", "plain"]
        );
        assert!(split_location_string("  ").is_empty());
    }

    #[test]
    fn test_resolver_env_overrides() {
        let mut config = Config::default();
        let env = env_of(&[
            ("TASKWARDEN_ENV_LOCATIONS", "a.env,b.env"),
            ("TASKWARDEN_CONFIG_MERGE_STRATEGY", "SHALLOW"),
            ("TASKWARDEN_RESOLVE_SECRETS", "FALSE"),
            ("TASKWARDEN_CONFIG_TTL_SECONDS", "300"),
        ]);
        config.apply_resolver_env(&env);

        assert_eq!(config.resolver.env_locations, vec!["a.env", "b.env"]);
        assert_eq!(
            config.resolver.merge_strategy,
            crate::resolve::merge::MergeStrategy::Shallow
        );
        assert_eq!(config.resolver.max_resolution_depth, 0);
        assert_eq!(config.resolver.config_ttl, Some(300));
    }

    #[test]
    fn test_log_buffer_size() {
        let log = LogSettings {
            num_log_lines_sent_on_failure: 10,
            num_log_lines_sent_on_timeout: 25,
            num_log_lines_sent_on_success: 5,
            ..Default::default()
        };
        assert_eq!(log.log_buffer_size(), 25);

        let log = LogSettings {
            num_log_lines_sent_on_failure: 10,
            ignore_stdout: true,
            ignore_stderr: true,
            ..Default::default()
        };
        assert_eq!(log.log_buffer_size(), 0);
    }
}
