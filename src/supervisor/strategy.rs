//! Launch strategies and the fallback chain.
//!
//! Some runtime contexts fail to start the wrapped tool in surprising ways:
//! packaged apps inherit a minimal `PATH`, some launchers drop environment
//! variables, some hosts have no usable shell. Each [`LaunchStrategy`] is one
//! way of starting the executable; the [`LaunchChain`] tries them in priority
//! order and keeps the first whose process completes the handshake.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::config::SupervisorConfig;
use super::environment::{resolve_executable, EnvironmentBundle};
use super::errors::SupervisorError;
use super::lifecycle::{self, HandshakeOptions, ProcessHandle, StagedScript};
use super::observer::{DiagnosticSink, SupervisorEvent};
use super::transport::StdioTransport;
use super::types::{ClientTier, InitializeResult};

// ─── Strategy Interface ──────────────────────────────────────────────────────

/// One way of starting the wrapped executable.
#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    /// The tier this strategy provides when it wins.
    fn tier(&self) -> ClientTier;

    /// Short label for logs and error messages.
    fn label(&self) -> String;

    /// Spawn the process. The handshake is run by the chain.
    async fn spawn(&self, bundle: &EnvironmentBundle) -> Result<ProcessHandle, SupervisorError>;
}

/// How an [`ExecStrategy`] invokes the executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Exec directly, resolving the command via the bundle's `PATH`.
    Direct,
    /// Exec through the platform shell.
    Shell,
    /// Stage a script that sets every variable textually, then run it.
    Script,
}

impl ExecMode {
    fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Direct => "direct",
            ExecMode::Shell => "shell",
            ExecMode::Script => "script",
        }
    }
}

/// Process-spawning strategy parameterised by [`ExecMode`].
#[derive(Debug, Clone)]
pub struct ExecStrategy {
    pub tier: ClientTier,
    pub mode: ExecMode,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Variables layered on top of the bundle for this strategy only.
    pub extra_env: BTreeMap<String, String>,
    pub script_dir: PathBuf,
}

impl ExecStrategy {
    pub fn new(tier: ClientTier, mode: ExecMode, command: &str, args: &[String]) -> Self {
        Self {
            tier,
            mode,
            command: command.to_string(),
            args: args.to_vec(),
            cwd: None,
            extra_env: BTreeMap::new(),
            script_dir: std::env::temp_dir().join("toolhost"),
        }
    }

    /// The configured strategy for one tier, or `None` when the tier is
    /// not launchable with this config.
    pub fn for_tier(config: &SupervisorConfig, tier: ClientTier) -> Option<Self> {
        let mode = match tier {
            ClientTier::Persistent | ClientTier::EnhancedGraphAccess => ExecMode::Direct,
            ClientTier::Managed => ExecMode::Shell,
            ClientTier::Legacy => ExecMode::Script,
            ClientTier::None => {
                tracing::warn!("ignoring 'none' in strategy list");
                return None;
            }
        };

        let mut strategy = Self::new(tier, mode, &config.command, &config.args);
        strategy.cwd = config.cwd.as_ref().map(PathBuf::from);
        strategy.script_dir = config.script_dir();

        if tier == ClientTier::EnhancedGraphAccess {
            let Some(identity) = config.enhanced_identity.as_ref().filter(|id| !id.env.is_empty())
            else {
                tracing::debug!("no enhanced identity configured; skipping tier");
                return None;
            };
            let mut env = identity.env.clone();
            config.environment.sanitize(&mut env);
            strategy.extra_env = env;
        }

        Some(strategy)
    }

    fn base_command(&self, program: &str, bundle: &EnvironmentBundle) -> Command {
        let mut cmd = Command::new(program);
        cmd.env_clear();
        cmd.envs(bundle.iter());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn direct_command(&self, bundle: &EnvironmentBundle) -> Command {
        let program = match resolve_executable(&self.command, bundle) {
            Some(path) => path.to_string_lossy().into_owned(),
            None => {
                tracing::debug!(command = %self.command, "not found on bundle PATH; relying on OS lookup");
                self.command.clone()
            }
        };
        let mut cmd = self.base_command(&program, bundle);
        cmd.args(&self.args);
        cmd
    }

    fn shell_command(&self, bundle: &EnvironmentBundle) -> Command {
        if cfg!(windows) {
            let shell = bundle
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("COMSPEC"))
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| "cmd.exe".to_string());
            let mut cmd = self.base_command(&shell, bundle);
            cmd.args(["/D", "/S", "/C", &self.command]);
            cmd.args(&self.args);
            cmd
        } else {
            let mut cmd = self.base_command(unix_shell(), bundle);
            // "$0" is the tool, "$@" its arguments: nothing is re-parsed.
            cmd.args(["-c", "exec \"$0\" \"$@\"", &self.command]);
            cmd.args(&self.args);
            cmd
        }
    }

    fn script_command(
        &self,
        bundle: &EnvironmentBundle,
    ) -> Result<(Command, StagedScript), SupervisorError> {
        std::fs::create_dir_all(&self.script_dir).map_err(|e| SupervisorError::SpawnFailed {
            strategy: self.label(),
            reason: format!("cannot create script dir {}: {e}", self.script_dir.display()),
        })?;

        let ext = if cfg!(windows) { "bat" } else { "sh" };
        let path = self
            .script_dir
            .join(format!("launch-{}.{ext}", uuid::Uuid::new_v4()));
        let body = if cfg!(windows) {
            render_batch_script(bundle, &self.command, &self.args)
        } else {
            render_shell_script(bundle, &self.command, &self.args)
        };
        write_private_file(&path, &body).map_err(|e| SupervisorError::SpawnFailed {
            strategy: self.label(),
            reason: format!("cannot write launch script {}: {e}", path.display()),
        })?;
        let staged = StagedScript::new(path.clone());

        let cmd = if cfg!(windows) {
            let mut cmd = self.base_command("cmd.exe", bundle);
            cmd.arg("/D").arg("/C").arg(&path);
            cmd
        } else {
            let mut cmd = self.base_command(unix_shell(), bundle);
            cmd.arg(&path);
            cmd
        };
        Ok((cmd, staged))
    }
}

#[async_trait]
impl LaunchStrategy for ExecStrategy {
    fn tier(&self) -> ClientTier {
        self.tier
    }

    fn label(&self) -> String {
        format!("{}/{}", self.tier, self.mode.as_str())
    }

    async fn spawn(&self, bundle: &EnvironmentBundle) -> Result<ProcessHandle, SupervisorError> {
        let bundle = bundle.layered(&self.extra_env);

        let (mut cmd, staged) = match self.mode {
            ExecMode::Direct => (self.direct_command(&bundle), None),
            ExecMode::Shell => (self.shell_command(&bundle), None),
            ExecMode::Script => {
                let (cmd, staged) = self.script_command(&bundle)?;
                (cmd, Some(staged))
            }
        };

        let child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            strategy: self.label(),
            reason: e.to_string(),
        })?;

        let handle = ProcessHandle::from_child(child).map_err(|reason| {
            SupervisorError::SpawnFailed {
                strategy: self.label(),
                reason,
            }
        })?;

        Ok(match staged {
            Some(script) => handle.with_staged_script(script),
            None => handle,
        })
    }
}

fn unix_shell() -> &'static str {
    if std::path::Path::new("/bin/sh").exists() {
        "/bin/sh"
    } else {
        "sh"
    }
}

/// Quote for POSIX sh: wrap in single quotes, escaping embedded ones.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn render_shell_script(bundle: &EnvironmentBundle, command: &str, args: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for (key, value) in bundle.iter() {
        if !is_valid_var_name(key) {
            continue;
        }
        script.push_str(&format!("export {key}={}\n", sh_quote(value)));
    }
    script.push_str("exec ");
    script.push_str(&sh_quote(command));
    for arg in args {
        script.push(' ');
        script.push_str(&sh_quote(arg));
    }
    script.push_str(" \"$@\"\n");
    script
}

fn render_batch_script(bundle: &EnvironmentBundle, command: &str, args: &[String]) -> String {
    let escape = |v: &str| v.replace('%', "%%");
    let mut script = String::from("@echo off\r\n");
    for (key, value) in bundle.iter() {
        if key.contains('=') || key.is_empty() {
            continue;
        }
        script.push_str(&format!("set \"{key}={}\"\r\n", escape(value)));
    }
    script.push_str(&format!("\"{}\"", escape(command)));
    for arg in args {
        script.push_str(&format!(" \"{}\"", escape(arg)));
    }
    script.push_str(" %*\r\n");
    script
}

/// Write a file readable only by the current user (it may contain tokens).
fn write_private_file(path: &std::path::Path, body: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o700);
    }
    let mut file = options.open(path)?;
    file.write_all(body.as_bytes())?;
    file.flush()
}

// ─── Chain ───────────────────────────────────────────────────────────────────

/// A process that completed the handshake.
pub struct LaunchOutcome {
    pub tier: ClientTier,
    pub strategy: String,
    pub handle: ProcessHandle,
    pub transport: Arc<StdioTransport>,
    pub server: InitializeResult,
}

/// Ordered list of strategies, tried until one handshakes.
pub struct LaunchChain {
    strategies: Vec<Arc<dyn LaunchStrategy>>,
    handshake: HandshakeOptions,
}

impl LaunchChain {
    pub fn new(strategies: Vec<Arc<dyn LaunchStrategy>>, handshake: HandshakeOptions) -> Self {
        Self {
            strategies,
            handshake,
        }
    }

    /// Build the standard chain from configuration.
    ///
    /// Tier mapping: persistent = direct exec, managed = shell exec,
    /// enhanced_graph_access = direct exec with the caller's fallback
    /// identity (skipped when none is configured), legacy = script exec.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        let strategies = config
            .strategies
            .iter()
            .filter_map(|tier| ExecStrategy::for_tier(config, *tier))
            .map(|strategy| Arc::new(strategy) as Arc<dyn LaunchStrategy>)
            .collect();
        Self::new(strategies, config.handshake_options())
    }

    /// Tiers in the order they will be attempted.
    pub fn tiers(&self) -> Vec<ClientTier> {
        self.strategies.iter().map(|s| s.tier()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try each strategy in order; return the first that handshakes.
    pub async fn launch(
        &self,
        bundle: &EnvironmentBundle,
        sink: &Arc<dyn DiagnosticSink>,
    ) -> Result<LaunchOutcome, SupervisorError> {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let tier = strategy.tier();
            sink.on_event(&SupervisorEvent::StrategyAttempt {
                tier,
                strategy: strategy.label(),
            });

            match self.attempt(strategy.as_ref(), bundle, sink).await {
                Ok(outcome) => {
                    tracing::info!(
                        tier = %tier,
                        strategy = %outcome.strategy,
                        pid = outcome.handle.pid(),
                        server = outcome.server.server_info.as_ref().and_then(|s| s.name.as_deref()),
                        "launch strategy succeeded"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    tracing::warn!(tier = %tier, strategy = %strategy.label(), error = %e, "launch strategy failed");
                    sink.on_event(&SupervisorEvent::StrategyFailed {
                        tier,
                        reason: e.to_string(),
                    });
                    attempts.push(format!("{}: {e}", strategy.label()));
                }
            }
        }

        if attempts.is_empty() {
            attempts.push("no launch strategies available".to_string());
        }
        Err(SupervisorError::AllStrategiesFailed { attempts })
    }

    async fn attempt(
        &self,
        strategy: &dyn LaunchStrategy,
        bundle: &EnvironmentBundle,
        sink: &Arc<dyn DiagnosticSink>,
    ) -> Result<LaunchOutcome, SupervisorError> {
        let label = strategy.label();
        let mut handle = strategy.spawn(bundle).await?;

        let Some((stdin, stdout, stderr)) = handle.take_stdio() else {
            handle.force_kill().await;
            return Err(SupervisorError::SpawnFailed {
                strategy: label,
                reason: "process stdio unavailable".into(),
            });
        };
        let transport = StdioTransport::start(&label, stdin, stdout, stderr, sink.clone());

        let handshake = tokio::time::timeout(
            self.handshake.window,
            lifecycle::handshake(&transport, &self.handshake),
        )
        .await
        .unwrap_or_else(|_| {
            Err(format!(
                "initialization timed out after {}ms",
                self.handshake.window.as_millis()
            ))
        });

        match handshake {
            Ok(server) => Ok(LaunchOutcome {
                tier: strategy.tier(),
                strategy: label,
                handle,
                transport,
                server,
            }),
            Err(reason) => {
                transport.fail_pending(SupervisorError::Stopping {
                    reason: "handshake abandoned".into(),
                });
                handle.force_kill().await;
                let stderr_ctx = transport.stderr_tail();
                transport.shutdown();
                if !stderr_ctx.is_empty() {
                    tracing::warn!(strategy = %label, stderr = %stderr_ctx, "stderr captured on handshake failure");
                }
                Err(SupervisorError::HandshakeFailed {
                    strategy: label,
                    reason: format!("{reason}{}", lifecycle::format_stderr_suffix(&stderr_ctx)),
                })
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
