//! Online lifecycle scenarios against a canned local HTTP listener.
//!
//! The pack has no HTTP-mocking dev dependency, so a tiny scripted server
//! answers each request in order and records what it saw: enough to exercise
//! registration, conflict backoff, heartbeat-free happy paths, and the
//! finalize-once invariant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskwarden::config::{ApiSettings, Config, ProcessSettings};
use taskwarden::{ExecutionStatus, SourceRegistry, Supervisor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// One recorded HTTP exchange.
#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    path: String,
    body: serde_json::Value,
}

/// A response the scripted server will give, in order. The last entry
/// repeats for any further requests.
#[derive(Debug, Clone)]
struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CannedResponse {
    fn ok(body: &str) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn conflict_with_retry_after(seconds: u64) -> Self {
        Self {
            status: 409,
            headers: vec![("Retry-After".to_string(), seconds.to_string())],
            body: "{}".to_string(),
        }
    }
}

struct ScriptedServer {
    address: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedServer {
    async fn start(responses: Vec<CannedResponse>) -> ScriptedServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut index = 0usize;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };

                let Some(request) = read_http_request(&mut stream).await else {
                    continue;
                };
                recorded.lock().await.push(request);

                let response = responses
                    .get(index)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or_else(|| CannedResponse::ok("{}"));
                index += 1;

                let mut raw = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                    response.status,
                    response.body.len()
                );
                for (name, value) in &response.headers {
                    raw.push_str(&format!("{name}: {value}\r\n"));
                }
                raw.push_str("\r\n");
                raw.push_str(&response.body);

                let _ = stream.write_all(raw.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        ScriptedServer { address, requests }
    }

    async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .next()
        .unwrap_or(0);

    let mut body_bytes = buf[header_end + 4..].to_vec();
    while body_bytes.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body_bytes.extend_from_slice(&chunk[..n]);
    }

    let body = serde_json::from_slice(&body_bytes).unwrap_or(serde_json::Value::Null);
    Some(RecordedRequest { method, path, body })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn online_config(base_url: &str, command: &[&str]) -> Config {
    Config {
        task: taskwarden::TaskIdentity {
            name: Some("t1".to_string()),
            ..Default::default()
        },
        api: ApiSettings {
            base_url: Some(base_url.to_string()),
            api_key: Some("test-key".to_string()),
            retry_delay: 0,
            creation_conflict_retry_delay: Some(0),
            creation_conflict_timeout: Some(30),
            request_timeout: Some(5),
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

fn supervisor(config: Config) -> Supervisor {
    Supervisor::with_registry_and_env(config, SourceRegistry::with_defaults(), HashMap::new())
        .unwrap()
}

const CREATED_BODY: &str =
    "{\"uuid\": \"exec-1\", \"task\": {\"uuid\": \"task-1\", \"name\": \"t1\"}}";

#[tokio::test]
async fn test_registration_then_single_finalize() {
    let server = ScriptedServer::start(vec![
        CannedResponse::ok(CREATED_BODY),
        CannedResponse::ok("{}"),
    ])
    .await;

    let outcome = supervisor(online_config(&server.address, &["/bin/true"]))
        .run()
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.exit_code, 0);

    let requests = server.requests().await;
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/api/v1/task_executions/");
    assert_eq!(requests[0].body["status"], serde_json::json!("RUNNING"));
    assert_eq!(requests[0].body["task"]["name"], serde_json::json!("t1"));

    // Exactly one terminal update follows registration
    let finalizes: Vec<_> = requests
        .iter()
        .filter(|r| {
            r.method == "PATCH"
                && r.path == "/api/v1/task_executions/exec-1/"
                && r.body["status"] == serde_json::json!("SUCCEEDED")
        })
        .collect();
    assert_eq!(finalizes.len(), 1);
    assert_eq!(finalizes[0].body["exit_code"], serde_json::json!(0));
}

#[tokio::test]
async fn test_conflict_backoff_honours_retry_after() {
    let server = ScriptedServer::start(vec![
        CannedResponse::conflict_with_retry_after(1),
        CannedResponse::conflict_with_retry_after(1),
        CannedResponse::ok(CREATED_BODY),
        CannedResponse::ok("{}"),
    ])
    .await;

    let started = Instant::now();
    let outcome = supervisor(online_config(&server.address, &["/bin/true"]))
        .run()
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    // Two Retry-After waits of one second each before the third attempt
    assert!(started.elapsed() >= Duration::from_secs(2));

    let requests = server.requests().await;
    let creations = requests
        .iter()
        .filter(|r| r.method == "POST" && r.path == "/api/v1/task_executions/")
        .count();
    assert_eq!(creations, 3);
}

#[tokio::test]
async fn test_conflict_timeout_aborts_without_starting_child() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let server =
        ScriptedServer::start(vec![CannedResponse::conflict_with_retry_after(1)]).await;

    let mut config = online_config(
        &server.address,
        &["/usr/bin/touch", marker.to_str().unwrap()],
    );
    config.api.creation_conflict_timeout = Some(2);

    let outcome = supervisor(config).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Abandoned);
    assert_eq!(outcome.exit_code, 75);
    assert!(!marker.exists(), "the child must not start after a conflict");
}

#[tokio::test]
async fn test_terminal_error_without_prevention_runs_unreported() {
    let server = ScriptedServer::start(vec![CannedResponse {
        status: 400,
        headers: Vec::new(),
        body: "{\"error\": \"bad request\"}".to_string(),
    }])
    .await;

    let outcome = supervisor(online_config(&server.address, &["/bin/true"]))
        .run()
        .await;

    // The child still runs; the outcome just goes unreported
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.exit_code, 0);
}

#[tokio::test]
async fn test_prevent_offline_execution_blocks_on_terminal_error() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let server = ScriptedServer::start(vec![CannedResponse {
        status: 403,
        headers: Vec::new(),
        body: "{}".to_string(),
    }])
    .await;

    let mut config = online_config(
        &server.address,
        &["/usr/bin/touch", marker.to_str().unwrap()],
    );
    config.api.prevent_offline_execution = true;

    let outcome = supervisor(config).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Abandoned);
    assert_eq!(outcome.exit_code, 77);
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_offline_mode_makes_no_remote_calls() {
    let server = ScriptedServer::start(vec![CannedResponse::ok("{}")]).await;

    let mut config = online_config(&server.address, &["/bin/true"]);
    config.api.offline_mode = true;
    config.api.api_key = None;

    let outcome = supervisor(config).run().await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(server.requests().await.is_empty());
}

#[tokio::test]
async fn test_failed_run_reports_failure_status() {
    let server = ScriptedServer::start(vec![
        CannedResponse::ok(CREATED_BODY),
        CannedResponse::ok("{}"),
    ])
    .await;

    let outcome = supervisor(online_config(&server.address, &["/bin/false"]))
        .run()
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);

    let requests = server.requests().await;
    let finalize = requests
        .iter()
        .find(|r| r.body["status"] == serde_json::json!("FAILED"))
        .expect("a FAILED final update");
    assert_eq!(finalize.body["exit_code"], serde_json::json!(1));
}

#[tokio::test]
async fn test_log_tail_attached_on_failure() {
    let server = ScriptedServer::start(vec![
        CannedResponse::ok(CREATED_BODY),
        CannedResponse::ok("{}"),
    ])
    .await;

    let mut config = online_config(&server.address, &[]);
    config.process.command_line =
        Some("echo stage one; echo stage two; exit 3".to_string());
    config.process.shell_mode = taskwarden::ShellMode::Enable;
    config.log.num_log_lines_sent_on_failure = 10;

    let outcome = supervisor(config).run().await;
    assert_eq!(outcome.exit_code, 3);

    let requests = server.requests().await;
    let finalize = requests
        .iter()
        .find(|r| r.body["status"] == serde_json::json!("FAILED"))
        .expect("a FAILED final update");
    let tail = finalize.body["log_tail"].as_str().unwrap();
    assert!(tail.contains("stage one"));
    assert!(tail.contains("stage two"));
}
