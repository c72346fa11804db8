//! End-to-end offline scenarios.
//!
//! These run real child processes with no Task Management service in the
//! picture: success, retry exhaustion, timeout termination, UDP status
//! updates, and secret resolution into the child environment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskwarden::config::{ApiSettings, Config, ProcessSettings, ShellMode};
use taskwarden::resolve::location::SecretProviderKind;
use taskwarden::resolve::providers::MemorySource;
use taskwarden::resolve::ResolverSettings;
use taskwarden::{ExecutionStatus, SourceRegistry, Supervisor};
use tokio::net::UdpSocket;

fn offline_config(command: &[&str]) -> Config {
    Config {
        api: ApiSettings {
            offline_mode: true,
            ..Default::default()
        },
        process: ProcessSettings {
            command: command.iter().map(|s| s.to_string()).collect(),
            retry_delay: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn supervisor_with_env(config: Config, env: &[(&str, &str)]) -> Supervisor {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Supervisor::with_registry_and_env(config, SourceRegistry::with_defaults(), env).unwrap()
}

#[tokio::test]
async fn test_happy_path() {
    let mut config = offline_config(&["/bin/true"]);
    config.task.name = Some("t1".to_string());

    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.attempt_count, 1);
}

#[tokio::test]
async fn test_child_exit_code_propagates() {
    let config = offline_config(&["/bin/false"]);
    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.exit_code, 1);
}

#[tokio::test]
async fn test_retry_exhaustion() {
    let mut config = offline_config(&["/bin/false"]);
    config.process.max_retries = Some(1);

    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.attempt_count, 2);
}

#[tokio::test]
async fn test_retry_delay_respected() {
    let mut config = offline_config(&["/bin/false"]);
    config.process.max_retries = Some(2);
    config.process.retry_delay = 1;

    let started = Instant::now();
    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.attempt_count, 3);
    // Two delays of one second elapse between the three attempts
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_timeout_terminates_child() {
    let mut config = offline_config(&["/bin/sleep", "5"]);
    config.process.timeout = Some(1);
    config.process.termination_grace_period = 1;
    config.process.check_interval = 1;

    let started = Instant::now();
    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.status, ExecutionStatus::TerminatedAfterTimeOut);
    assert_ne!(outcome.exit_code, 0);
    // Terminated at ~1s, killed at ~2s at the latest
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_spawn_failure_is_a_failed_attempt() {
    let mut config = offline_config(&["/no/such/binary-here"]);
    config.process.max_retries = Some(1);

    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.attempt_count, 2);
}

#[tokio::test]
async fn test_status_updates_merge_into_final_snapshot() {
    let mut config = offline_config(&["/bin/sleep", "1"]);
    config.embedded_mode = false;
    config.updates.enable_status_update_listener = true;
    config.updates.status_update_socket_port = 23730;
    config.process.check_interval = 1;

    let supervisor = supervisor_with_env(config, &[]);
    let tracker = supervisor.tracker();

    let run = tokio::spawn(supervisor.run());

    // Let the listener bind before sending
    tokio::time::sleep(Duration::from_millis(300)).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for message in [
        "{\"success_count\": 1}",
        "{\"success_count\": 3}",
        "{\"last_status_message\": \"done\"}",
    ] {
        sender
            .send_to(message.as_bytes(), ("127.0.0.1", 23730))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let outcome = run.await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);

    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.counters.success_count, Some(3));
    assert_eq!(snapshot.last_status_message.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_secret_resolution_reaches_child_env() {
    let mut config = offline_config(&[]);
    config.process.command_line =
        Some("test \"$MYU\" = 1 -a -z \"$MYU_FOR_PROC_WRAPPER_TO_RESOLVE\"".to_string());
    config.process.shell_mode = ShellMode::Enable;

    let outcome = supervisor_with_env(
        config,
        &[(
            "MYU_FOR_PROC_WRAPPER_TO_RESOLVE",
            "PLAIN:{\"v\":1}!json|JP:$.v",
        )],
    )
    .run()
    .await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.exit_code, 0);
}

#[tokio::test]
async fn test_config_location_reference_feeds_child() {
    let memory = Arc::new(MemorySource::new());
    memory
        .insert("app-env", "{\"db\":{\"user\":\"pg\",\"pw\":\"x\"}}")
        .await;

    let mut registry = SourceRegistry::with_defaults();
    registry.register(SecretProviderKind::RemoteSecretStore, memory);

    let mut config = offline_config(&[]);
    config.process.command_line = Some("test \"$DB_USER\" = pg".to_string());
    config.process.shell_mode = ShellMode::Enable;
    config.resolver = ResolverSettings {
        config_locations: vec!["REMOTE_SECRET_STORE:app-env!json".to_string()],
        ..Default::default()
    };

    let env: HashMap<String, String> = [(
        "DB_USER_FOR_PROC_WRAPPER_TO_RESOLVE".to_string(),
        "CONFIG:$.db.user".to_string(),
    )]
    .into_iter()
    .collect();

    let supervisor = Supervisor::with_registry_and_env(config, registry, env).unwrap();
    let outcome = supervisor.run().await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_exit_after_writing_variables() {
    let dir = tempfile::tempdir().unwrap();
    let env_path = dir.path().join("resolved.env");

    let mut config = offline_config(&[]);
    config.exit_after_writing_variables = true;
    config.resolver.env_output_filename = Some(env_path.display().to_string());

    let outcome = supervisor_with_env(config, &[("KEEP_ME", "around")])
        .run()
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.attempt_count, 0);

    let written = std::fs::read_to_string(&env_path).unwrap();
    assert!(written.contains("KEEP_ME=around"));
}

#[tokio::test]
async fn test_result_value_read_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let result_path = dir.path().join("result.json");

    let mut config = offline_config(&[]);
    config.process.command_line = Some(format!(
        "echo '{{\"rows\": 42}}' > {}",
        result_path.display()
    ));
    config.process.shell_mode = ShellMode::Enable;
    config.io.result_filename = Some(result_path.display().to_string());

    let outcome = supervisor_with_env(config, &[]).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    let result = outcome.result_value.unwrap();
    assert_eq!(result["rows"], serde_json::json!(42));
    // The result file is cleaned up by default
    assert!(!result_path.exists());
}

#[tokio::test]
async fn test_input_value_env_var() {
    let mut config = offline_config(&[]);
    config.process.command_line = Some("test \"$JOB_INPUT\" = '{\"n\":7}'".to_string());
    config.process.shell_mode = ShellMode::Enable;
    config.io.input_value = Some("{\"n\":7}".to_string());
    config.io.input_env_var_name = Some("JOB_INPUT".to_string());
    config.io.input_value_format = Some(taskwarden::ValueFormat::Json);

    let outcome = supervisor_with_env(config, &[]).run().await;
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_embedded_callback_success_and_retry() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let mut config = offline_config(&[]);
    config.embedded_mode = true;
    config.process.max_retries = Some(2);

    let supervisor = supervisor_with_env(config, &[]);
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_work = Arc::clone(&calls);

    let (outcome, value) = supervisor
        .run_embedded(move |_tracker| {
            let calls = Arc::clone(&calls_in_work);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(taskwarden::Error::Internal("first try fails".to_string()))
                } else {
                    Ok(99)
                }
            }
        })
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(value, Some(99));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
