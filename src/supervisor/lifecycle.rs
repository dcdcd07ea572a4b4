//! Child process ownership and the initialize handshake.
//!
//! A [`ProcessHandle`] is the single owner of one running child: its stdio
//! streams (until handed to the transport) and a [`ProcessControl`] used to
//! signal, kill, and reap it. Graceful shutdown closes stdin, sends SIGTERM,
//! waits a bounded grace period, then kills.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use super::errors::SupervisorError;
use super::transport::StdioTransport;
use super::types::{ClientInfo, InitializeParams, InitializeResult};

/// Owned, type-erased child stdin.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Owned, type-erased child stdout/stderr.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Process Control ─────────────────────────────────────────────────────────

/// Signal/kill/wait operations on a running process.
#[async_trait]
pub trait ProcessControl: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kill the process.
    async fn kill(&mut self) -> io::Result<()>;

    /// Wait for exit; returns the exit code when there is one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// [`ProcessControl`] for a real `tokio::process::Child`.
pub struct ChildControl {
    child: Child,
}

impl ChildControl {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                return Ok(()); // already reaped
            };
            // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }
}

// ─── Process Handle ──────────────────────────────────────────────────────────

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited within the grace window.
    Graceful,
    /// Had to be killed.
    Forced,
}

/// A launch script written to disk; removed when dropped.
#[derive(Debug)]
pub struct StagedScript {
    path: PathBuf,
}

impl StagedScript {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedScript {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove launch script");
            }
        }
    }
}

/// Exclusive handle on one live child process.
pub struct ProcessHandle {
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    control: Box<dyn ProcessControl>,
    staged_script: Option<StagedScript>,
}

impl ProcessHandle {
    /// Build a handle from raw streams and a control.
    pub fn new(
        stdin: BoxedWriter,
        stdout: BoxedReader,
        stderr: Option<BoxedReader>,
        control: Box<dyn ProcessControl>,
    ) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr,
            control,
            staged_script: None,
        }
    }

    /// Wrap a freshly spawned child with piped stdio.
    pub fn from_child(mut child: Child) -> Result<Self, String> {
        let stdin = child.stdin.take().ok_or("failed to capture stdin")?;
        let stdout = child.stdout.take().ok_or("failed to capture stdout")?;
        let stderr = child.stderr.take();

        Ok(Self::new(
            Box::new(stdin),
            Box::new(stdout),
            stderr.map(|s| Box::new(s) as BoxedReader),
            Box::new(ChildControl::new(child)),
        ))
    }

    /// Tie a staged launch script's lifetime to this process.
    pub fn with_staged_script(mut self, script: StagedScript) -> Self {
        self.staged_script = Some(script);
        self
    }

    pub fn staged_script(&self) -> Option<&Path> {
        self.staged_script.as_ref().map(StagedScript::path)
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.id()
    }

    /// Hand the stdio streams to a transport. Returns `None` if already taken.
    pub fn take_stdio(&mut self) -> Option<(BoxedWriter, BoxedReader, Option<BoxedReader>)> {
        let stdin = self.stdin.take()?;
        let stdout = self.stdout.take()?;
        Some((stdin, stdout, self.stderr.take()))
    }

    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.control.is_alive()
    }

    /// SIGTERM, wait up to `grace`, then kill.
    ///
    /// Always reaps the process. The caller should close stdin first.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownOutcome {
        let pid = self.pid();
        if let Err(e) = self.control.terminate() {
            tracing::debug!(pid, error = %e, "terminate signal failed");
        }

        match tokio::time::timeout(grace, self.control.wait()).await {
            Ok(Ok(code)) => {
                tracing::info!(pid, code, "process exited after terminate");
                ShutdownOutcome::Graceful
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "wait failed after terminate; killing");
                self.force_kill().await;
                ShutdownOutcome::Forced
            }
            Err(_) => {
                tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored terminate; killing");
                self.force_kill().await;
                ShutdownOutcome::Forced
            }
        }
    }

    /// Kill and reap without a grace period.
    pub async fn force_kill(&mut self) {
        let pid = self.pid();
        if let Err(e) = self.control.kill().await {
            tracing::debug!(pid, error = %e, "kill failed (process may have exited)");
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), self.control.wait()).await;
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Parameters for the `initialize` exchange.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    /// Bound on the whole exchange.
    pub window: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            protocol_version: "2024-11-05".to_string(),
            client_name: "toolhost".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            window: Duration::from_secs(15),
        }
    }
}

/// Perform the initialize handshake on a freshly wired transport.
///
/// Sends `initialize`, waits for the result within the window, then sends
/// `notifications/initialized`.
pub async fn handshake(
    transport: &StdioTransport,
    options: &HandshakeOptions,
) -> Result<InitializeResult, String> {
    let params = InitializeParams {
        protocol_version: options.protocol_version.clone(),
        capabilities: serde_json::json!({}),
        client_info: ClientInfo {
            name: options.client_name.clone(),
            version: options.client_version.clone(),
        },
    };
    let params = serde_json::to_value(params).map_err(|e| e.to_string())?;

    let result = transport
        .request("initialize", Some(params), options.window)
        .await
        .map_err(|e| match e {
            SupervisorError::Timeout { timeout_ms, .. } => {
                format!("initialization timed out after {timeout_ms}ms")
            }
            other => other.to_string(),
        })?;

    let init: InitializeResult = if result.is_null() {
        InitializeResult::default()
    } else {
        serde_json::from_value(result)
            .map_err(|e| format!("failed to parse initialize response: {e}"))?
    };

    transport
        .notify("notifications/initialized", None)
        .await
        .map_err(|e| e.to_string())?;

    Ok(init)
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
