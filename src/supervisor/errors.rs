//! Supervisor error types.
//!
//! Every variant carries owned strings so the error is `Clone`: the outcome of
//! a single-flight `start()` is shared between all waiting callers.

use thiserror::Error;

/// Broad classification of a [`SupervisorError`].
///
/// Callers branch on this rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A strategy could not spawn or handshake (or all of them failed).
    LaunchFailure,
    /// A line of child output was not valid JSON.
    ProtocolParse,
    /// No matching response arrived within the deadline.
    RequestTimeout,
    /// The child answered with a JSON-RPC error object or reported a tool error.
    RemoteError,
    /// Missing required variables, bad config, or an echoed-argument response.
    Configuration,
    /// The child exited unexpectedly while requests were in flight.
    ProcessCrash,
    /// The supervisor is stopping or restarting.
    Stopping,
    /// I/O failure writing to or reading from the child.
    Transport,
    /// The supervisor has no ready process.
    NotReady,
}

/// Errors that can occur while supervising the wrapped tool.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The child process could not be spawned.
    #[error("strategy '{strategy}' failed to spawn: {reason}")]
    SpawnFailed {
        strategy: String,
        reason: String,
    },

    /// The child spawned but did not complete the initialize handshake.
    #[error("strategy '{strategy}' handshake failed: {reason}")]
    HandshakeFailed {
        strategy: String,
        reason: String,
    },

    /// Every launch strategy in the chain failed.
    #[error("all launch strategies failed ({})", attempts.join("; "))]
    AllStrategiesFailed {
        attempts: Vec<String>,
    },

    /// A line of output could not be decoded.
    #[error("protocol parse error: {reason}")]
    ProtocolParse {
        reason: String,
    },

    /// A request timed out.
    #[error("request '{method}' (id {id}) timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        id: u64,
        timeout_ms: u64,
    },

    /// The child returned a JSON-RPC error response.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran but reported failure (`isError: true`).
    #[error("tool '{tool}' reported an error: {message}")]
    ToolFailed {
        tool: String,
        message: String,
    },

    /// Required configuration is missing or invalid.
    #[error("configuration error: {reason}")]
    Config {
        reason: String,
    },

    /// The response looked like the tool echoing its own input.
    #[error("tool '{tool}' returned its own arguments ({check}); the wrapped process is likely misconfigured or unauthenticated")]
    EchoedResponse {
        tool: String,
        check: String,
    },

    /// The child process exited while it was serving requests.
    #[error("process crashed: {reason}")]
    ProcessCrashed {
        reason: String,
    },

    /// The supervisor is shutting the process down.
    #[error("supervisor stopping: {reason}")]
    Stopping {
        reason: String,
    },

    /// Writing to or reading from the child failed.
    #[error("transport error: {reason}")]
    Transport {
        reason: String,
    },

    /// No process is ready to accept requests.
    #[error("supervisor is not ready (state: {state})")]
    NotReady {
        state: String,
    },
}

impl SupervisorError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::SpawnFailed { .. }
            | SupervisorError::HandshakeFailed { .. }
            | SupervisorError::AllStrategiesFailed { .. } => ErrorKind::LaunchFailure,
            SupervisorError::ProtocolParse { .. } => ErrorKind::ProtocolParse,
            SupervisorError::Timeout { .. } => ErrorKind::RequestTimeout,
            SupervisorError::Remote { .. } | SupervisorError::ToolFailed { .. } => {
                ErrorKind::RemoteError
            }
            SupervisorError::Config { .. } | SupervisorError::EchoedResponse { .. } => {
                ErrorKind::Configuration
            }
            SupervisorError::ProcessCrashed { .. } => ErrorKind::ProcessCrash,
            SupervisorError::Stopping { .. } => ErrorKind::Stopping,
            SupervisorError::Transport { .. } => ErrorKind::Transport,
            SupervisorError::NotReady { .. } => ErrorKind::NotReady,
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        SupervisorError::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand for a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        SupervisorError::Transport {
            reason: reason.into(),
        }
    }
}
