//! `toolhost`: run one wrapped tool under supervision from the command line.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use toolhost::supervisor::config::{find_config_path, load_config};
use toolhost::{EnvOverrides, Supervisor, ToolFacade};

#[derive(Parser, Debug)]
#[command(name = "toolhost", version, about = "Supervise a stdio JSON-RPC tool")]
struct Cli {
    /// Config file (defaults to $TOOLHOST_CONFIG, then the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment override for the child, repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", global = true)]
    env: Vec<String>,

    /// Log directory (default: `<data dir>/toolhost/logs`).
    #[arg(long, global = true, conflicts_with = "log_stderr")]
    log_dir: Option<PathBuf>,

    /// Log to stderr instead of a file.
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the wrapped tool's tool list as JSON.
    ListTools,
    /// Call one tool and print its result as JSON.
    Call {
        name: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn parse_env_overrides(pairs: &[String]) -> Result<EnvOverrides> {
    let mut overrides = EnvOverrides::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --env '{pair}': expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("invalid --env '{pair}': empty key");
        }
        overrides = overrides.set(key, value);
    }
    Ok(overrides)
}

fn log_dir(cli: &Cli) -> Option<PathBuf> {
    if cli.log_stderr {
        return None;
    }
    Some(
        cli.log_dir
            .clone()
            .unwrap_or_else(|| toolhost::data_dir().join("logs")),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    toolhost::init_tracing(log_dir(&cli).as_deref());

    let path = find_config_path(cli.config.as_deref())?;
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    let overrides = parse_env_overrides(&cli.env)?;

    let supervisor = Supervisor::from_config(config.clone());
    supervisor.set_overrides(overrides);
    let facade = ToolFacade::new(supervisor.clone(), &config);

    let outcome = run(&cli.command, &facade).await;
    supervisor.stop().await;

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run(command: &Command, facade: &ToolFacade) -> Result<serde_json::Value> {
    match command {
        Command::ListTools => {
            let tools = facade.list_tools().await?;
            Ok(serde_json::to_value(tools)?)
        }
        Command::Call { name, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(args).context("--args must be valid JSON")?;
            let result = facade.call_tool(name, arguments).await?;
            tracing::info!(
                tool = %result.tool_name,
                resolved = %result.resolved_name,
                elapsed_ms = result.execution_time_ms,
                "call finished"
            );
            Ok(result.result)
        }
    }
}
