//! Log tail capture.
//!
//! Ring buffers over the child's stdout and stderr (one shared buffer when
//! merging is on). Captured lines are echoed through to the supervisor's own
//! streams so wrapping does not swallow child output; on a terminal event the
//! tail for the matching outcome is attached to the final update.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::LogSettings;

/// Terminal outcomes that can carry a log tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    Failure,
    Timeout,
    Success,
}

/// Fixed-capacity line buffer; old lines fall off the front.
#[derive(Debug)]
struct RingBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    max_line_length: usize,
}

impl RingBuffer {
    fn new(capacity: usize, max_line_length: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            max_line_length,
        }
    }

    fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.len() > self.max_line_length {
            line.truncate(
                line.char_indices()
                    .map(|(i, _)| i)
                    .take_while(|i| *i <= self.max_line_length)
                    .last()
                    .unwrap_or(0),
            );
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Captures child output into per-stream (or merged) ring buffers.
pub struct LogTail {
    settings: LogSettings,
    stdout: Arc<Mutex<RingBuffer>>,
    /// Same buffer as stdout when merging is enabled
    stderr: Arc<Mutex<RingBuffer>>,
}

impl LogTail {
    pub fn new(settings: &LogSettings) -> Self {
        let capacity = settings.log_buffer_size();
        let stdout = Arc::new(Mutex::new(RingBuffer::new(
            capacity,
            settings.max_log_line_length,
        )));
        let stderr = if settings.merge_stdout_and_stderr_logs {
            Arc::clone(&stdout)
        } else {
            Arc::new(Mutex::new(RingBuffer::new(
                capacity,
                settings.max_log_line_length,
            )))
        };
        Self {
            settings: settings.clone(),
            stdout,
            stderr,
        }
    }

    /// Whether the child's streams need to be piped at all.
    pub fn wants_capture(&self) -> bool {
        self.settings.log_buffer_size() > 0
    }

    /// Start the reader task for the child's stdout.
    pub fn spawn_stdout_reader<R>(&self, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::clone(&self.stdout);
        let ignore = self.settings.ignore_stdout;
        tokio::spawn(async move {
            read_lines(stream, buffer, ignore, false).await;
        })
    }

    /// Start the reader task for the child's stderr.
    pub fn spawn_stderr_reader<R>(&self, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::clone(&self.stderr);
        let ignore = self.settings.ignore_stderr;
        tokio::spawn(async move {
            read_lines(stream, buffer, ignore, true).await;
        })
    }

    /// The tail to attach for the given outcome, newest last. Returns None
    /// when no lines are configured for that outcome.
    pub async fn tail_for(&self, outcome: TailOutcome) -> Option<Vec<String>> {
        let count = match outcome {
            TailOutcome::Failure => self.settings.num_log_lines_sent_on_failure,
            TailOutcome::Timeout => self.settings.num_log_lines_sent_on_timeout,
            TailOutcome::Success => self.settings.num_log_lines_sent_on_success,
        };
        if count == 0 {
            return None;
        }

        let mut lines = self.stdout.lock().await.tail(count);
        if !self.settings.merge_stdout_and_stderr_logs {
            let err_lines = self.stderr.lock().await.tail(count);
            if lines.is_empty() {
                lines = err_lines;
            } else if !err_lines.is_empty() {
                lines.extend(err_lines);
                let skip = lines.len().saturating_sub(count);
                lines.drain(..skip);
            }
        }

        if lines.is_empty() {
            None
        } else {
            Some(lines)
        }
    }
}

async fn read_lines<R>(
    stream: R,
    buffer: Arc<Mutex<RingBuffer>>,
    ignore: bool,
    is_stderr: bool,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            // Stream closed; a partial last line was already delivered
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if is_stderr {
                    eprintln!("{trimmed}");
                } else {
                    println!("{trimmed}");
                }
                if !ignore {
                    buffer.lock().await.push(trimmed);
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(failure: usize, timeout: usize, success: usize) -> LogSettings {
        LogSettings {
            num_log_lines_sent_on_failure: failure,
            num_log_lines_sent_on_timeout: timeout,
            num_log_lines_sent_on_success: success,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_keeps_newest() {
        let tail = LogTail::new(&settings(3, 0, 0));
        let reader = tail.spawn_stdout_reader("one\ntwo\nthree\nfour\n".as_bytes());
        reader.await.unwrap();

        let lines = tail.tail_for(TailOutcome::Failure).await.unwrap();
        assert_eq!(lines, vec!["two", "three", "four"]);
        assert!(tail.tail_for(TailOutcome::Timeout).await.is_none());
    }

    #[tokio::test]
    async fn test_partial_last_line_flushed() {
        let tail = LogTail::new(&settings(5, 0, 0));
        let reader = tail.spawn_stdout_reader("done\npartial".as_bytes());
        reader.await.unwrap();

        let lines = tail.tail_for(TailOutcome::Failure).await.unwrap();
        assert_eq!(lines, vec!["done", "partial"]);
    }

    #[tokio::test]
    async fn test_cr_lf_stripped_and_lines_truncated() {
        let mut s = settings(2, 0, 0);
        s.max_log_line_length = 5;
        let tail = LogTail::new(&s);
        let reader = tail.spawn_stdout_reader("exactly-too-long\r\nok\r\n".as_bytes());
        reader.await.unwrap();

        let lines = tail.tail_for(TailOutcome::Failure).await.unwrap();
        assert_eq!(lines, vec!["exact", "ok"]);
    }

    #[tokio::test]
    async fn test_merged_streams_share_buffer() {
        let tail = LogTail::new(&settings(4, 0, 0));
        let out = tail.spawn_stdout_reader("out1\n".as_bytes());
        out.await.unwrap();
        let err = tail.spawn_stderr_reader("err1\n".as_bytes());
        err.await.unwrap();

        let lines = tail.tail_for(TailOutcome::Failure).await.unwrap();
        assert_eq!(lines, vec!["out1", "err1"]);
    }

    #[tokio::test]
    async fn test_separate_streams() {
        let mut s = settings(0, 0, 2);
        s.merge_stdout_and_stderr_logs = false;
        let tail = LogTail::new(&s);
        tail.spawn_stdout_reader("out\n".as_bytes()).await.unwrap();
        tail.spawn_stderr_reader("err\n".as_bytes()).await.unwrap();

        let lines = tail.tail_for(TailOutcome::Success).await.unwrap();
        assert_eq!(lines, vec!["out", "err"]);
    }

    #[tokio::test]
    async fn test_ignored_stream_not_captured() {
        let mut s = settings(3, 0, 0);
        s.ignore_stdout = true;
        let tail = LogTail::new(&s);
        tail.spawn_stdout_reader("hidden\n".as_bytes())
            .await
            .unwrap();
        tail.spawn_stderr_reader("visible\n".as_bytes())
            .await
            .unwrap();

        let lines = tail.tail_for(TailOutcome::Failure).await.unwrap();
        assert_eq!(lines, vec!["visible"]);
    }
}
