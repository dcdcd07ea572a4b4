//! JSON-RPC over stdio transport.
//!
//! Wires one child's streams into the framer and the correlator:
//! - Writing JSON-RPC requests to stdin, one line each, serialised by a mutex
//!   so the child sees them in send order
//! - A reader task framing stdout and handing each message to the correlator
//! - A stderr task forwarding diagnostic lines to the sink
//!
//! When stdout reaches EOF every pending request is rejected with
//! `ProcessCrashed` and the `closed()` future resolves.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::correlator::RpcCorrelator;
use super::errors::SupervisorError;
use super::framer::{frames, Frame};
use super::lifecycle::{BoxedReader, BoxedWriter};
use super::observer::{DiagnosticSink, DiagnosticSource};
use super::types::{JsonRpcNotification, JsonRpcRequest, RpcMessage};

/// Cap on the stderr text retained for failure messages.
const STDERR_TAIL_CHARS: usize = 2000;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    label: String,
    writer: Mutex<Option<BoxedWriter>>,
    correlator: Arc<RpcCorrelator>,
    /// `None` while stdout is open; `Some(n)` once it closed, with the number
    /// of requests rejected at that moment.
    closed: watch::Receiver<Option<usize>>,
    stderr_capture: Arc<StdMutex<String>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Take ownership of the child's streams and start the pump tasks.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        label: &str,
        stdin: BoxedWriter,
        stdout: BoxedReader,
        stderr: Option<BoxedReader>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Arc<Self> {
        let correlator = Arc::new(RpcCorrelator::new());
        let (closed_tx, closed_rx) = watch::channel(None);
        let stderr_capture = Arc::new(StdMutex::new(String::new()));

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(read_stdout(
            label.to_string(),
            stdout,
            correlator.clone(),
            sink.clone(),
            closed_tx,
        )));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(read_stderr(
                stderr,
                stderr_capture.clone(),
                sink,
            )));
        }

        Arc::new(Self {
            label: label.to_string(),
            writer: Mutex::new(Some(stdin)),
            correlator,
            closed: closed_rx,
            stderr_capture,
            tasks: StdMutex::new(tasks),
        })
    }

    /// Send a request and wait for the matching response or the deadline.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, SupervisorError> {
        let ticket = self.correlator.register(method, timeout)?;
        let request = JsonRpcRequest::new(ticket.id, method, params);

        let json = serde_json::to_string(&request).map_err(|e| {
            SupervisorError::transport(format!("failed to serialize request: {e}"))
        });
        let written = match json {
            Ok(line) => self.write_line(line).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.correlator.forget(ticket.id);
            return Err(e);
        }

        tracing::trace!(transport = %self.label, id = ticket.id, method, "request sent");
        self.correlator.wait(ticket).await
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), SupervisorError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notification).map_err(|e| {
            SupervisorError::transport(format!("failed to serialize notification: {e}"))
        })?;
        self.write_line(line).await
    }

    async fn write_line(&self, mut line: String) -> Result<(), SupervisorError> {
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| SupervisorError::transport("stdin already closed"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SupervisorError::transport(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| SupervisorError::transport(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Close the child's stdin. Well-behaved stdio servers exit on EOF.
    pub async fn close_stdin(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Reject every pending request and refuse new ones.
    pub fn fail_pending(&self, err: SupervisorError) -> usize {
        self.correlator.fail_all(err)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Resolves once stdout has closed. Returns how many requests were
    /// rejected because of it.
    pub async fn closed(&self) -> usize {
        let mut rx = self.closed.clone();
        let rejected = match rx.wait_for(|state| state.is_some()).await {
            Ok(state) => state.unwrap_or(0),
            // Reader task gone without reporting (aborted): treat as closed.
            Err(_) => 0,
        };
        rejected
    }

    /// Whether stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some() || self.closed.has_changed().is_err()
    }

    /// The first stderr output captured from the child.
    pub fn stderr_tail(&self) -> String {
        self.stderr_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the pump tasks.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Pump Tasks ──────────────────────────────────────────────────────────────

async fn read_stdout(
    label: String,
    stdout: BoxedReader,
    correlator: Arc<RpcCorrelator>,
    sink: Arc<dyn DiagnosticSink>,
    closed_tx: watch::Sender<Option<usize>>,
) {
    let mut stream = Box::pin(frames(stdout));

    while let Some(frame) = stream.next().await {
        match frame {
            Frame::Message(value) => {
                if correlator.on_message(&value) {
                    continue;
                }
                match RpcMessage::from_value(&value) {
                    Some(RpcMessage::Request { method, .. }) => {
                        tracing::debug!(transport = %label, method = %method, "ignoring request from child");
                    }
                    Some(RpcMessage::Notification { method, .. }) => {
                        tracing::trace!(transport = %label, method = %method, "notification from child");
                    }
                    _ => {
                        sink.on_diagnostic(DiagnosticSource::Stdout, &value.to_string());
                    }
                }
            }
            Frame::Noise(line) => {
                sink.on_diagnostic(DiagnosticSource::Stdout, &line);
            }
        }
    }

    let rejected = correlator.fail_all(SupervisorError::ProcessCrashed {
        reason: "stdout closed (process exited)".into(),
    });
    if rejected > 0 {
        tracing::warn!(transport = %label, rejected, "stdout closed with requests in flight");
    } else {
        tracing::debug!(transport = %label, "stdout closed");
    }
    let _ = closed_tx.send(Some(rejected));
}

async fn read_stderr(
    stderr: BoxedReader,
    capture: Arc<StdMutex<String>>,
    sink: Arc<dyn DiagnosticSink>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                append_capped(
                    &mut capture.lock().unwrap_or_else(PoisonError::into_inner),
                    &line,
                );
                sink.on_diagnostic(DiagnosticSource::Stderr, &line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Append a line to the capture buffer, keeping at most `STDERR_TAIL_CHARS`.
fn append_capped(buf: &mut String, line: &str) {
    let used = buf.chars().count();
    if used >= STDERR_TAIL_CHARS {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    let room = STDERR_TAIL_CHARS.saturating_sub(used);
    if line.chars().count() > room {
        buf.extend(line.chars().take(room));
        buf.push_str("...(truncated)");
    } else {
        buf.push_str(line);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
