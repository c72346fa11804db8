//! Status update listener.
//!
//! The wrapped application can push progress over a local UDP socket: each
//! datagram is one JSON object carrying counters, a status message, or extra
//! properties. The listener merges datagrams into the shared status the
//! heartbeat sender snapshots. Delivery is best-effort; oversized or
//! malformed datagrams are dropped and counted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::task::StatusCounters;

/// A consistent snapshot of the merged status.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub counters: StatusCounters,
    pub last_status_message: Option<String>,
    pub extra_props: HashMap<String, Value>,
    pub last_app_heartbeat_at: Option<DateTime<Utc>>,
    pub dropped_messages: u64,
    /// Something changed since the last `mark_sent`
    pub dirty: bool,
}

#[derive(Debug, Default)]
struct StatusState {
    counters: StatusCounters,
    last_status_message: Option<String>,
    extra_props: HashMap<String, Value>,
    last_app_heartbeat_at: Option<DateTime<Utc>>,
    dropped_messages: u64,
    dirty: bool,
}

/// Shared, mutex-protected status merged from UDP updates.
#[derive(Clone, Default)]
pub struct StatusTracker {
    state: Arc<Mutex<StatusState>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one decoded status message. Counters keep their maximum since
    /// they are monotone; scalars are last-wins.
    pub async fn merge(&self, message: &Value) {
        let Some(obj) = message.as_object() else {
            self.count_dropped().await;
            return;
        };

        let mut state = self.state.lock().await;

        let incoming = StatusCounters {
            success_count: obj.get("success_count").and_then(Value::as_i64),
            error_count: obj.get("error_count").and_then(Value::as_i64),
            skipped_count: obj.get("skipped_count").and_then(Value::as_i64),
            expected_count: obj.get("expected_count").and_then(Value::as_i64),
        };
        state.counters.merge_max(&incoming);

        if let Some(message) = obj.get("last_status_message").and_then(Value::as_str) {
            state.last_status_message = Some(message.to_string());
        }

        if let Some(extra) = obj.get("extra_props").and_then(Value::as_object) {
            for (k, v) in extra {
                state.extra_props.insert(k.clone(), v.clone());
            }
        }

        state.last_app_heartbeat_at = Some(Utc::now());
        state.dirty = true;
    }

    pub async fn count_dropped(&self) {
        let mut state = self.state.lock().await;
        state.dropped_messages += 1;
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        StatusSnapshot {
            counters: state.counters,
            last_status_message: state.last_status_message.clone(),
            extra_props: state.extra_props.clone(),
            last_app_heartbeat_at: state.last_app_heartbeat_at,
            dropped_messages: state.dropped_messages,
            dirty: state.dirty,
        }
    }

    /// Clear the dirty flag after the snapshot reached the service.
    pub async fn mark_sent(&self) {
        let mut state = self.state.lock().await;
        state.dirty = false;
    }
}

/// UDP receiver bound to the lifetime of the current child.
pub struct StatusListener {
    socket: UdpSocket,
    tracker: StatusTracker,
    max_message_bytes: usize,
}

impl StatusListener {
    /// Bind the listener on localhost at the configured port.
    pub async fn bind(
        port: u16,
        max_message_bytes: usize,
        tracker: StatusTracker,
    ) -> Result<StatusListener> {
        let socket = UdpSocket::bind(("127.0.0.1", port)).await?;
        info!("Status update listener bound on port {port}");
        Ok(StatusListener {
            socket,
            tracker,
            max_message_bytes,
        })
    }

    /// Run the receive loop until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // One extra byte so an over-limit datagram is detectable
            let mut buf = vec![0u8; self.max_message_bytes + 1];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Status listener stopping");
                        break;
                    }
                    received = self.socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, _addr)) => {
                                self.handle_datagram(&buf[..len]).await;
                            }
                            Err(e) => {
                                warn!("Status socket receive failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        if datagram.len() > self.max_message_bytes {
            warn!(
                "Dropping status message of {} bytes (limit {})",
                datagram.len(),
                self.max_message_bytes
            );
            self.tracker.count_dropped().await;
            return;
        }

        match serde_json::from_slice::<Value>(datagram) {
            Ok(message) if message.is_object() => {
                debug!("Merging status message: {message}");
                self.tracker.merge(&message).await;
            }
            _ => {
                debug!("Dropping malformed status message");
                self.tracker.count_dropped().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_merge_counters_keep_max() {
        let tracker = StatusTracker::new();
        tracker.merge(&json!({"success_count": 3})).await;
        tracker.merge(&json!({"success_count": 1, "error_count": 2})).await;

        let snap = tracker.snapshot().await;
        assert_eq!(snap.counters.success_count, Some(3));
        assert_eq!(snap.counters.error_count, Some(2));
        assert!(snap.dirty);
        assert!(snap.last_app_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_merge_message_last_wins() {
        let tracker = StatusTracker::new();
        tracker
            .merge(&json!({"last_status_message": "step 1"}))
            .await;
        tracker
            .merge(&json!({"last_status_message": "done"}))
            .await;

        let snap = tracker.snapshot().await;
        assert_eq!(snap.last_status_message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_mark_sent_clears_dirty() {
        let tracker = StatusTracker::new();
        tracker.merge(&json!({"success_count": 1})).await;
        tracker.mark_sent().await;
        assert!(!tracker.snapshot().await.dirty);
    }

    #[tokio::test]
    async fn test_listener_end_to_end() {
        let tracker = StatusTracker::new();
        let listener = StatusListener::bind(0, 1024, tracker.clone())
            .await
            .unwrap();
        let port = listener.socket.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let handle = listener.spawn(cancel.clone());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"{\"success_count\": 1}", ("127.0.0.1", port))
            .await
            .unwrap();
        sender
            .send_to(b"{\"success_count\": 3}", ("127.0.0.1", port))
            .await
            .unwrap();
        sender
            .send_to(b"{\"last_status_message\": \"done\"}", ("127.0.0.1", port))
            .await
            .unwrap();
        sender
            .send_to(b"not json", ("127.0.0.1", port))
            .await
            .unwrap();

        // Datagrams are local, but give the loop a moment to drain
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let snap = tracker.snapshot().await;
            if snap.dropped_messages >= 1 && snap.last_status_message.is_some() {
                break;
            }
        }

        let snap = tracker.snapshot().await;
        assert_eq!(snap.counters.success_count, Some(3));
        assert_eq!(snap.last_status_message.as_deref(), Some("done"));
        assert_eq!(snap.dropped_messages, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped() {
        let tracker = StatusTracker::new();
        let listener = StatusListener::bind(0, 16, tracker.clone()).await.unwrap();
        let port = listener.socket.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let handle = listener.spawn(cancel.clone());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // 17 bytes: one over the limit
        sender
            .send_to(b"{\"error_count\":9}", ("127.0.0.1", port))
            .await
            .unwrap();

        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if tracker.snapshot().await.dropped_messages > 0 {
                break;
            }
        }

        let snap = tracker.snapshot().await;
        assert_eq!(snap.dropped_messages, 1);
        assert_eq!(snap.counters.error_count, None);

        cancel.cancel();
        handle.await.unwrap();
    }
}
