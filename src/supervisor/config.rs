//! Supervisor configuration loading and validation.
//!
//! Reads a YAML file and resolves `${VAR}` / `${VAR:-default}` references
//! against the host environment before parsing. Everything except `command`
//! has a default, so a minimal file is a single line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::environment::EnvironmentPolicy;
use super::errors::SupervisorError;
use super::facade::ToolAlias;
use super::lifecycle::HandshakeOptions;
use super::types::ClientTier;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLHOST_CONFIG";

/// File name looked up in the platform config directory.
const CONFIG_FILE_NAME: &str = "toolhost.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Time bounds for the supervisor.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Window for spawn + initialize handshake, per strategy.
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    /// Default deadline for `tools/call` and other requests.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_handshake_secs() -> u64 {
    15
}
fn default_request_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            request_secs: default_request_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Fallback identity for the enhanced-access tier.
///
/// Supplied by the host application; the supervisor only layers these
/// variables onto the bundle for that one strategy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnhancedIdentity {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Everything needed to supervise one wrapped tool.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Label used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Executable to launch.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Launch strategies in priority order.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<ClientTier>,
    #[serde(default)]
    pub enhanced_identity: Option<EnhancedIdentity>,
    #[serde(default)]
    pub environment: EnvironmentPolicy,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Generic tool names mapped onto the wrapped tool's own names.
    #[serde(default)]
    pub aliases: BTreeMap<String, ToolAlias>,
    /// Reject results that echo the call arguments.
    #[serde(default = "default_true")]
    pub echo_detection: bool,
    /// Where the script strategy stages its launch files.
    #[serde(default)]
    pub script_dir: Option<String>,
}

fn default_name() -> String {
    "tool".to_string()
}
fn default_strategies() -> Vec<ClientTier> {
    vec![
        ClientTier::Persistent,
        ClientTier::Managed,
        ClientTier::EnhancedGraphAccess,
        ClientTier::Legacy,
    ]
}
fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}
fn default_client_name() -> String {
    "toolhost".to_string()
}
fn default_true() -> bool {
    true
}

impl SupervisorConfig {
    /// A config with defaults for everything but the command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            strategies: default_strategies(),
            enhanced_identity: None,
            environment: EnvironmentPolicy::default(),
            timeouts: TimeoutConfig::default(),
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            aliases: BTreeMap::new(),
            echo_detection: true,
            script_dir: None,
        }
    }

    /// Handshake parameters derived from this config.
    pub fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            protocol_version: self.protocol_version.clone(),
            client_name: self.client_name.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            window: self.timeouts.handshake(),
        }
    }

    /// Directory for staged launch scripts.
    pub fn script_dir(&self) -> PathBuf {
        self.script_dir
            .as_deref()
            .map(|d| PathBuf::from(expand_tilde(d)))
            .unwrap_or_else(|| std::env::temp_dir().join("toolhost"))
    }

    /// Reject configurations that cannot possibly launch.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.command.trim().is_empty() {
            return Err(SupervisorError::config("command must not be empty"));
        }
        if !self.strategies.iter().any(|t| *t != ClientTier::None) {
            return Err(SupervisorError::config("no launch strategies configured"));
        }
        if self.timeouts.handshake_secs == 0 || self.timeouts.request_secs == 0 {
            return Err(SupervisorError::config("timeouts must be greater than zero"));
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: the explicit path, `TOOLHOST_CONFIG`, then
/// `<platform config dir>/toolhost/toolhost.yaml`.
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(SupervisorError::config(format!(
                "config file not found: {}",
                path.display()
            )))
        };
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("toolhost").join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(SupervisorError::config(format!(
        "could not find {CONFIG_FILE_NAME} (set {CONFIG_ENV_VAR} or pass a path)"
    )))
}

/// Load, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<SupervisorConfig, SupervisorError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SupervisorError::config(format!("failed to read {}: {e}", path.display()))
    })?;
    parse_config(&raw)
}

/// Parse config text (after env-var interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<SupervisorConfig, SupervisorError> {
    let interpolated = interpolate_env_vars(raw);
    let config: SupervisorConfig = serde_yaml::from_str(&interpolated)
        .map_err(|e| SupervisorError::config(format!("failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
///
/// An empty variable falls back to the default, same as the shell.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        match std::env::var(var_name) {
            Ok(v) if !v.is_empty() => v,
            _ => expand_tilde(default),
        }
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
