//! CLI argument parsing for taskwarden.
//!
//! Every option has a `TASKWARDEN_*` environment variable counterpart;
//! environment values win over CLI values so that settings can arrive
//! through resolved secrets.

use clap::{ArgAction, Args, Parser};
use taskwarden::config::{Config, ShellMode};
use taskwarden::resolve::format::ValueFormat;
use taskwarden::resolve::merge::MergeStrategy;

/// Wraps the execution of a command so that a Task Management service is
/// informed of its progress, with retries, timeouts, heartbeats, and secret
/// injection into the environment.
#[derive(Parser, Debug)]
#[command(name = "taskwarden", version, about)]
pub struct Cli {
    /// The command to wrap, after `--`
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,

    #[command(flatten)]
    pub task: TaskArgs,

    #[command(flatten)]
    pub api: ApiArgs,

    #[command(flatten)]
    pub process: ProcessArgs,

    #[command(flatten)]
    pub io: IoArgs,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub updates: UpdateArgs,

    #[command(flatten)]
    pub configuration: ConfigurationArgs,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Task settings")]
pub struct TaskArgs {
    /// Name of the Task (this or the Task UUID must be specified)
    #[arg(short = 'n', long)]
    pub task_name: Option<String>,

    /// UUID of the Task
    #[arg(long)]
    pub task_uuid: Option<String>,

    /// Create the Task at the service if it is not known there
    #[arg(short = 'a', long, action = ArgAction::SetTrue)]
    pub auto_create_task: bool,

    /// Run Environment name used when auto-creating (defaults to the
    /// deployment name)
    #[arg(long)]
    pub auto_create_task_run_environment_name: Option<String>,

    /// Run Environment UUID used when auto-creating
    #[arg(long)]
    pub auto_create_task_run_environment_uuid: Option<String>,

    /// Additional properties of the auto-created Task, as JSON
    #[arg(long)]
    pub auto_create_task_props: Option<String>,

    /// Let the service schedule and manage the auto-created Task instead of
    /// marking it passive
    #[arg(long, action = ArgAction::SetTrue)]
    pub force_task_active: bool,

    /// UUID of a Task Execution to attach to
    #[arg(long)]
    pub task_execution_uuid: Option<String>,

    /// Numeric version of the Task's source code
    #[arg(long)]
    pub task_version_number: Option<i64>,

    /// Human readable version of the Task's source code
    #[arg(long)]
    pub task_version_text: Option<String>,

    /// Version signature of the Task's source code, such as a commit hash
    #[arg(long)]
    pub task_version_signature: Option<String>,

    /// UUID of the Task Execution that built this source code
    #[arg(long)]
    pub build_task_execution_uuid: Option<String>,

    /// UUID of the Task Execution that deployed this Task
    #[arg(long)]
    pub deployment_task_execution_uuid: Option<String>,

    /// The Task runs indefinitely
    #[arg(short = 's', long, action = ArgAction::SetTrue)]
    pub service: bool,

    /// Execution schedule reported to the service
    #[arg(long)]
    pub schedule: Option<String>,

    /// Maximum concurrent executions of the same Task
    #[arg(long)]
    pub max_concurrency: Option<i64>,

    /// Maximum age of conflicting executions considered, in seconds
    /// (-1 means no limit)
    #[arg(long, allow_hyphen_values = true)]
    pub max_conflicting_age: Option<i64>,

    /// Additional metadata about this Task instance, as JSON
    #[arg(long)]
    pub task_instance_metadata: Option<String>,

    /// Deployment name (production, staging, ...)
    #[arg(short = 'd', long)]
    pub deployment: Option<String>,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "API client settings")]
pub struct ApiArgs {
    /// Base URL of the Task Management service
    #[arg(long)]
    pub api_base_url: Option<String>,

    /// API key for the Task Management service
    #[arg(short = 'k', long)]
    pub api_key: Option<String>,

    /// Seconds between heartbeats (-1 disables heartbeats)
    #[arg(long, allow_hyphen_values = true)]
    pub api_heartbeat_interval: Option<i64>,

    /// Seconds to keep retrying recoverable API errors
    #[arg(long)]
    pub api_error_timeout: Option<i64>,

    /// Seconds to wait between API request retries
    #[arg(long)]
    pub api_retry_delay: Option<i64>,

    /// Seconds before resuming API requests after retries are exhausted
    /// (-1 means never resume)
    #[arg(long, allow_hyphen_values = true)]
    pub api_resume_delay: Option<i64>,

    /// Seconds to keep retrying Task Execution creation on errors
    #[arg(long)]
    pub api_task_execution_creation_error_timeout: Option<i64>,

    /// Seconds to keep retrying Task Execution creation on conflicts
    #[arg(long)]
    pub api_task_execution_creation_conflict_timeout: Option<i64>,

    /// Seconds between creation retries after a conflict
    #[arg(long)]
    pub api_task_execution_creation_conflict_retry_delay: Option<i64>,

    /// Timeout for a single API request, in seconds
    #[arg(long)]
    pub api_request_timeout: Option<i64>,

    /// Retry budget for the final update, in seconds
    #[arg(long)]
    pub api_final_update_timeout: Option<i64>,

    /// Do not communicate with the Task Management service
    #[arg(short = 'o', long, action = ArgAction::SetTrue)]
    pub offline_mode: bool,

    /// Refuse to start the command when the service is unavailable
    #[arg(short = 'p', long, action = ArgAction::SetTrue)]
    pub prevent_offline_execution: bool,

    /// Probability this run is registered with the service at all
    #[arg(long)]
    pub api_managed_probability: Option<f64>,

    /// Probability an unregistered failed run is reported after the fact
    #[arg(long)]
    pub api_failure_report_probability: Option<f64>,

    /// Probability an unregistered timed-out run is reported after the fact
    #[arg(long)]
    pub api_timeout_report_probability: Option<f64>,

    /// Report the child's process id to the service
    #[arg(long, action = ArgAction::SetTrue)]
    pub send_pid: bool,

    /// Report the hostname to the service
    #[arg(long, action = ArgAction::SetTrue)]
    pub send_hostname: bool,

    /// Do not report runtime environment metadata
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_send_runtime_metadata: bool,

    /// Seconds between runtime metadata refreshes, for live sources
    #[arg(long)]
    pub runtime_metadata_refresh_interval: Option<i64>,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Process settings")]
pub struct ProcessArgs {
    /// Working directory for the command
    #[arg(short = 'w', long)]
    pub work_dir: Option<String>,

    /// The command as a single string, instead of the positional tail
    #[arg(short = 'c', long)]
    pub command_line: Option<String>,

    /// When to run the command through a shell
    #[arg(long, value_parser = ["auto", "enable", "disable"])]
    pub shell_mode: Option<String>,

    /// Keep a leading `sh -c "..."` wrapper instead of stripping it
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_strip_shell_wrapping: bool,

    /// Signal only the child process instead of its whole process group
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_process_group_termination: bool,

    /// Timeout for the command, in seconds (-1 means none)
    #[arg(short = 't', long, allow_hyphen_values = true)]
    pub process_timeout: Option<i64>,

    /// Times to retry a failed command (-1 retries forever)
    #[arg(short = 'r', long, allow_hyphen_values = true)]
    pub process_max_retries: Option<i64>,

    /// Seconds to wait before retrying the command
    #[arg(long)]
    pub process_retry_delay: Option<i64>,

    /// Seconds between checks on the command's status
    #[arg(long)]
    pub process_check_interval: Option<i64>,

    /// Seconds between the terminate signal and the kill signal
    #[arg(long)]
    pub process_termination_grace_period: Option<i64>,

    /// Name of the workload container observed in sidecar mode
    #[arg(long)]
    pub main_container_name: Option<String>,

    /// Name of the container this supervisor runs in
    #[arg(long)]
    pub monitor_container_name: Option<String>,

    /// Observe the main container instead of spawning a command
    #[arg(long, action = ArgAction::SetTrue)]
    pub sidecar_container_mode: bool,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Input and result settings")]
pub struct IoArgs {
    /// Inline input value for the wrapped command
    #[arg(long)]
    pub input_value: Option<String>,

    /// Environment variable the command reads the input value from
    #[arg(long)]
    pub input_env_var_name: Option<String>,

    /// File the input value is read from
    #[arg(long)]
    pub input_filename: Option<String>,

    /// Format of the input value
    #[arg(long, value_parser = ["text", "json", "yaml"])]
    pub input_value_format: Option<String>,

    /// Delete the input file after the run
    #[arg(long, action = ArgAction::SetTrue)]
    pub cleanup_input_file: bool,

    /// Send the input value to the service at registration
    #[arg(long, action = ArgAction::SetTrue)]
    pub send_input_value: bool,

    /// File the command writes its result value to
    #[arg(long)]
    pub result_filename: Option<String>,

    /// Format of the result value
    #[arg(long, value_parser = ["text", "json", "yaml"])]
    pub result_value_format: Option<String>,

    /// Keep the result file after the run
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_cleanup_result_file: bool,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Logging settings")]
pub struct LogArgs {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Log sensitive information
    #[arg(long, action = ArgAction::SetTrue)]
    pub log_secrets: bool,

    /// Log the input value
    #[arg(long, action = ArgAction::SetTrue)]
    pub log_input_value: bool,

    /// Log the result value
    #[arg(long, action = ArgAction::SetTrue)]
    pub log_result_value: bool,

    /// Omit timestamps from log output
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_include_timestamps_in_log: bool,

    /// Tail lines attached to the final update when the run fails
    #[arg(long)]
    pub num_log_lines_sent_on_failure: Option<usize>,

    /// Tail lines attached when the run times out
    #[arg(long)]
    pub num_log_lines_sent_on_timeout: Option<usize>,

    /// Tail lines attached when the run succeeds
    #[arg(long)]
    pub num_log_lines_sent_on_success: Option<usize>,

    /// Captured lines longer than this are truncated
    #[arg(long)]
    pub max_log_line_length: Option<usize>,

    /// Keep separate stdout and stderr tails instead of one merged tail
    #[arg(long, action = ArgAction::SetTrue)]
    pub separate_stdout_and_stderr_logs: bool,

    /// Do not capture stdout into the tail
    #[arg(long, action = ArgAction::SetTrue)]
    pub ignore_stdout: bool,

    /// Do not capture stderr into the tail
    #[arg(long, action = ArgAction::SetTrue)]
    pub ignore_stderr: bool,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Status update settings")]
pub struct UpdateArgs {
    /// Listen for status updates from the command on a local UDP port
    #[arg(long, action = ArgAction::SetTrue)]
    pub enable_status_update_listener: bool,

    /// Port for status update datagrams
    #[arg(long)]
    pub status_update_socket_port: Option<u16>,

    /// Maximum size of one status update datagram, in bytes
    #[arg(long)]
    pub status_update_message_max_bytes: Option<usize>,

    /// Minimum seconds between pushing merged status to the service
    /// (-1 sends status only with heartbeats)
    #[arg(long, allow_hyphen_values = true)]
    pub status_update_interval: Option<i64>,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Configuration resolution settings")]
pub struct ConfigurationArgs {
    /// Locations fetched and merged into the environment
    #[arg(long, short = 'e', num_args = 1.., action = ArgAction::Append)]
    pub env_locations: Vec<String>,

    /// Locations fetched and merged into the configuration
    #[arg(long, num_args = 1.., action = ArgAction::Append)]
    pub config_locations: Vec<String>,

    /// Strategy for merging fetched dictionaries
    #[arg(long, value_parser = [
        "DEEP", "SHALLOW", "REPLACE", "ADDITIVE", "TYPESAFE_REPLACE", "TYPESAFE_ADDITIVE",
    ])]
    pub config_merge_strategy: Option<String>,

    /// Let resolution overwrite variables already in the environment
    #[arg(long, action = ArgAction::SetTrue)]
    pub overwrite_env_during_resolution: bool,

    /// Seconds a fetched secret stays cached (-1 caches for the whole run)
    #[arg(long, allow_hyphen_values = true)]
    pub config_ttl: Option<i64>,

    /// Fail on the first resolution error instead of retaining the key
    #[arg(long, action = ArgAction::SetTrue)]
    pub fail_fast_config_resolution: bool,

    /// Keep going past resolution errors, retaining unresolved keys
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "fail_fast_config_resolution")]
    pub no_fail_fast_config_resolution: bool,

    /// Maximum nesting depth walked during resolution
    #[arg(long)]
    pub max_config_resolution_depth: Option<u32>,

    /// Maximum resolution passes before giving up on a fixed point
    #[arg(long)]
    pub max_config_resolution_iterations: Option<u32>,

    /// Marker prefix on resolvable environment variable names
    #[arg(long)]
    pub resolved_env_var_name_prefix: Option<String>,

    /// Marker suffix on resolvable environment variable names
    #[arg(long)]
    pub resolved_env_var_name_suffix: Option<String>,

    /// Marker prefix on resolvable config property names
    #[arg(long)]
    pub resolved_config_property_name_prefix: Option<String>,

    /// Marker suffix on resolvable config property names
    #[arg(long)]
    pub resolved_config_property_name_suffix: Option<String>,

    /// Environment variable that receives the resolved config as JSON
    #[arg(long)]
    pub env_var_name_for_config: Option<String>,

    /// Config property that receives the resolved environment
    #[arg(long)]
    pub config_property_name_for_env: Option<String>,

    /// File the resolved environment is written to
    #[arg(long)]
    pub env_output_filename: Option<String>,

    /// Format of the resolved environment file
    #[arg(long, value_parser = ["dotenv", "json", "yaml"])]
    pub env_output_format: Option<String>,

    /// File the resolved configuration is written to
    #[arg(long)]
    pub config_output_filename: Option<String>,

    /// Format of the resolved configuration file
    #[arg(long, value_parser = ["dotenv", "json", "yaml"])]
    pub config_output_format: Option<String>,

    /// Resolve configuration, write the output files, and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub exit_after_writing_variables: bool,
}

impl Cli {
    /// Convert parsed arguments into the bootstrap configuration.
    pub fn into_config(self) -> Config {
        let mut config = Config::default();

        config.process.command = self.command;

        let task = self.task;
        config.deployment = task.deployment;
        config.task.name = task.task_name;
        config.task.uuid = task.task_uuid;
        config.task.auto_create = task.auto_create_task;
        config.task.run_environment_name = task.auto_create_task_run_environment_name;
        config.task.run_environment_uuid = task.auto_create_task_run_environment_uuid;
        config.task.is_service = task.service;
        config.task.schedule = task.schedule;
        config.task.version_number = task.task_version_number;
        config.task.version_text = task.task_version_text;
        config.task.version_signature = task.task_version_signature;
        config.task.build_task_execution_uuid = task.build_task_execution_uuid;
        config.task.deployment_task_execution_uuid = task.deployment_task_execution_uuid;
        config.task_execution_uuid = task.task_execution_uuid;
        config.task.max_concurrency = task.max_concurrency;
        config.max_conflicting_age = task.max_conflicting_age.and_then(|v| {
            if v < 0 {
                None
            } else {
                Some(v as u64)
            }
        });

        if let Some(raw) = task.auto_create_task_props {
            match serde_json::from_str(&raw) {
                Ok(props) => {
                    config.task.auto_create_props = Some(props);
                    config.task.auto_create = true;
                }
                Err(e) => log::warn!("Ignoring unparseable auto-create task props: {e}"),
            }
        }
        if let Some(raw) = task.task_instance_metadata {
            match serde_json::from_str(&raw) {
                Ok(metadata) => config.task.instance_metadata = Some(metadata),
                Err(e) => log::warn!("Ignoring unparseable task instance metadata: {e}"),
            }
        }

        // Auto-created Tasks default to passive unless forced active
        config.task.is_passive = if config.task.auto_create {
            !task.force_task_active
        } else {
            false
        };

        let api = self.api;
        config.api.base_url = api.api_base_url;
        config.api.api_key = api.api_key;
        apply_opt_seconds(api.api_heartbeat_interval, &mut config.api.heartbeat_interval);
        apply_opt_seconds(api.api_error_timeout, &mut config.api.error_timeout);
        if let Some(v) = api.api_retry_delay {
            config.api.retry_delay = v.max(0) as u64;
        }
        apply_opt_seconds(api.api_resume_delay, &mut config.api.resume_delay);
        apply_opt_seconds(
            api.api_task_execution_creation_error_timeout,
            &mut config.api.creation_error_timeout,
        );
        apply_opt_seconds(
            api.api_task_execution_creation_conflict_timeout,
            &mut config.api.creation_conflict_timeout,
        );
        if let Some(v) = api.api_task_execution_creation_conflict_retry_delay {
            config.api.creation_conflict_retry_delay = Some(v.max(0) as u64);
        }
        apply_opt_seconds(api.api_request_timeout, &mut config.api.request_timeout);
        apply_opt_seconds(
            api.api_final_update_timeout,
            &mut config.api.final_update_timeout,
        );
        config.api.offline_mode = api.offline_mode;
        config.api.prevent_offline_execution = api.prevent_offline_execution;
        if let Some(p) = api.api_managed_probability {
            config.api.managed_probability = p;
        }
        if let Some(p) = api.api_failure_report_probability {
            config.api.failure_report_probability = p;
        }
        if let Some(p) = api.api_timeout_report_probability {
            config.api.timeout_report_probability = p;
        }
        config.api.send_pid = api.send_pid;
        config.api.send_hostname = api.send_hostname;
        config.api.send_runtime_metadata = !api.no_send_runtime_metadata;
        if let Some(v) = api.runtime_metadata_refresh_interval {
            config.api.runtime_metadata_refresh_interval =
                if v <= 0 { None } else { Some(v as u64) };
        }

        let process = self.process;
        if let Some(dir) = process.work_dir {
            config.process.work_dir = dir;
        }
        config.process.command_line = process.command_line;
        if let Some(mode) = process.shell_mode.as_deref().and_then(ShellMode::from_name) {
            config.process.shell_mode = mode;
        }
        config.process.strip_shell_wrapping = !process.no_strip_shell_wrapping;
        config.process.process_group_termination = !process.no_process_group_termination;
        if let Some(v) = process.process_timeout {
            config.process.timeout = if v <= 0 { None } else { Some(v as u64) };
        }
        if let Some(v) = process.process_max_retries {
            config.process.max_retries = if v < 0 { None } else { Some(v as u32) };
        }
        if let Some(v) = process.process_retry_delay {
            config.process.retry_delay = v.max(0) as u64;
        }
        if let Some(v) = process.process_check_interval {
            if v > 0 {
                config.process.check_interval = v as u64;
            }
        }
        if let Some(v) = process.process_termination_grace_period {
            config.process.termination_grace_period = v.max(0) as u64;
        }
        config.process.main_container_name = process.main_container_name;
        config.process.monitor_container_name = process.monitor_container_name;
        if process.sidecar_container_mode {
            config.process.sidecar_container_mode = Some(true);
        }

        let io = self.io;
        config.io.input_value = io.input_value;
        config.io.input_env_var_name = io.input_env_var_name;
        config.io.input_filename = io.input_filename;
        config.io.input_value_format =
            io.input_value_format.as_deref().and_then(ValueFormat::from_name);
        if io.cleanup_input_file {
            config.io.cleanup_input_file = Some(true);
        }
        config.io.send_input_value = io.send_input_value;
        config.io.result_filename = io.result_filename;
        config.io.result_value_format = io
            .result_value_format
            .as_deref()
            .and_then(ValueFormat::from_name);
        config.io.cleanup_result_file = !io.no_cleanup_result_file;

        let log = self.log;
        if let Some(level) = log.log_level {
            config.log.level = level;
        }
        config.log.log_secrets = log.log_secrets;
        config.log.include_timestamps = !log.no_include_timestamps_in_log;
        config.io.log_input_value = log.log_input_value;
        config.io.log_result_value = log.log_result_value;
        if let Some(v) = log.num_log_lines_sent_on_failure {
            config.log.num_log_lines_sent_on_failure = v;
        }
        if let Some(v) = log.num_log_lines_sent_on_timeout {
            config.log.num_log_lines_sent_on_timeout = v;
        }
        if let Some(v) = log.num_log_lines_sent_on_success {
            config.log.num_log_lines_sent_on_success = v;
        }
        if let Some(v) = log.max_log_line_length {
            config.log.max_log_line_length = v;
        }
        config.log.merge_stdout_and_stderr_logs = !log.separate_stdout_and_stderr_logs;
        config.log.ignore_stdout = log.ignore_stdout;
        config.log.ignore_stderr = log.ignore_stderr;

        let updates = self.updates;
        config.updates.enable_status_update_listener = updates.enable_status_update_listener;
        if let Some(port) = updates.status_update_socket_port {
            config.updates.status_update_socket_port = port;
        }
        if let Some(bytes) = updates.status_update_message_max_bytes {
            config.updates.status_update_message_max_bytes = bytes;
        }
        if let Some(v) = updates.status_update_interval {
            config.updates.status_update_interval = if v < 0 { None } else { Some(v as u64) };
        }

        let configuration = self.configuration;
        if !configuration.env_locations.is_empty() {
            config.resolver.env_locations = configuration.env_locations;
        }
        if !configuration.config_locations.is_empty() {
            config.resolver.config_locations = configuration.config_locations;
        }
        if let Some(strategy) = configuration
            .config_merge_strategy
            .as_deref()
            .and_then(MergeStrategy::from_name)
        {
            config.resolver.merge_strategy = strategy;
        }
        config.resolver.overwrite_env_during_resolution =
            configuration.overwrite_env_during_resolution;
        if let Some(v) = configuration.config_ttl {
            config.resolver.config_ttl = if v < 0 { None } else { Some(v as u64) };
        }
        if configuration.no_fail_fast_config_resolution {
            config.resolver.fail_fast_resolution = false;
        } else if configuration.fail_fast_config_resolution {
            config.resolver.fail_fast_resolution = true;
        }
        if let Some(v) = configuration.max_config_resolution_depth {
            config.resolver.max_resolution_depth = v;
        }
        if let Some(v) = configuration.max_config_resolution_iterations {
            config.resolver.max_resolution_iterations = v;
        }
        if let Some(v) = configuration.resolved_env_var_name_prefix {
            config.resolver.env_var_name_prefix = v;
        }
        if let Some(v) = configuration.resolved_env_var_name_suffix {
            config.resolver.env_var_name_suffix = v;
        }
        if let Some(v) = configuration.resolved_config_property_name_prefix {
            config.resolver.config_property_name_prefix = v;
        }
        if let Some(v) = configuration.resolved_config_property_name_suffix {
            config.resolver.config_property_name_suffix = v;
        }
        if let Some(v) = configuration.env_var_name_for_config {
            config.resolver.env_var_name_for_config =
                if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = configuration.config_property_name_for_env {
            config.resolver.config_property_name_for_env =
                if v.is_empty() { None } else { Some(v) };
        }
        config.resolver.env_output_filename = configuration.env_output_filename;
        config.resolver.env_output_format = configuration
            .env_output_format
            .as_deref()
            .and_then(ValueFormat::from_name);
        config.resolver.config_output_filename = configuration.config_output_filename;
        config.resolver.config_output_format = configuration
            .config_output_format
            .as_deref()
            .and_then(ValueFormat::from_name);
        config.exit_after_writing_variables = configuration.exit_after_writing_variables;

        // The resolver needs to know whether values may be logged
        config.resolver.log_secrets = config.log.log_secrets;

        config
    }
}

fn apply_opt_seconds(raw: Option<i64>, target: &mut Option<u64>) {
    if let Some(v) = raw {
        *target = if v < 0 { None } else { Some(v as u64) };
    }
}
