//! Tool invocation façade: `list_tools` and `call_tool`.
//!
//! The stable surface collaborators use. Generic tool names are mapped onto
//! the wrapped tool's own names (with argument reshaping), results pass
//! through the configured [`ResponseCheck`]s, and the supervisor is started
//! on demand.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::Mutex;

use super::config::SupervisorConfig;
use super::errors::SupervisorError;
use super::sanity::{result_text, EchoedArgumentsCheck, ResponseCheck};
use super::supervisor::Supervisor;
use super::types::{ListToolsResult, ToolCallResult, ToolDescriptor};

/// Safety cap on `tools/list` pagination.
const MAX_LIST_PAGES: usize = 32;

// ─── Aliases ─────────────────────────────────────────────────────────────────

/// How to rewrite arguments for an aliased tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentReshape {
    /// Pass arguments through untouched.
    #[default]
    None,
    /// Generic HTTP-style query → wrapped tool's request shape:
    /// `endpoint`→`path`, `method` lower-cased (default `get`),
    /// `query`→`queryParams`, everything else unchanged.
    HttpQuery,
}

/// A generic tool name mapped to a wrapped-tool name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolAlias {
    pub tool: String,
    #[serde(default)]
    pub reshape: ArgumentReshape,
}

impl ArgumentReshape {
    pub fn apply(&self, arguments: &serde_json::Value) -> serde_json::Value {
        match self {
            ArgumentReshape::None => arguments.clone(),
            ArgumentReshape::HttpQuery => reshape_http_query(arguments),
        }
    }
}

fn reshape_http_query(arguments: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = arguments.as_object() else {
        return arguments.clone();
    };

    let mut out = serde_json::Map::new();
    for (key, value) in obj {
        match key.as_str() {
            "endpoint" => {
                if !obj.contains_key("path") {
                    out.insert("path".into(), value.clone());
                }
            }
            "method" => {
                let method = value
                    .as_str()
                    .map(|m| serde_json::Value::String(m.to_ascii_lowercase()))
                    .unwrap_or_else(|| value.clone());
                out.insert("method".into(), method);
            }
            "query" | "query_params" => {
                if !obj.contains_key("queryParams") {
                    out.insert("queryParams".into(), value.clone());
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out.entry("method")
        .or_insert_with(|| serde_json::Value::String("get".into()));
    serde_json::Value::Object(out)
}

// ─── Façade ──────────────────────────────────────────────────────────────────

/// Tool list cached per process generation.
struct ToolCache {
    generation: u64,
    tools: Vec<ToolDescriptor>,
}

/// Collaborator-facing tool API over one supervisor.
pub struct ToolFacade {
    supervisor: Supervisor,
    aliases: BTreeMap<String, ToolAlias>,
    checks: Vec<Box<dyn ResponseCheck>>,
    cache: Mutex<Option<ToolCache>>,
}

impl ToolFacade {
    /// Build a façade using the config's aliases and echo-detection setting.
    pub fn new(supervisor: Supervisor, config: &SupervisorConfig) -> Self {
        let mut checks: Vec<Box<dyn ResponseCheck>> = Vec::new();
        if config.echo_detection {
            checks.push(Box::new(EchoedArgumentsCheck));
        }
        Self {
            supervisor,
            aliases: config.aliases.clone(),
            checks,
            cache: Mutex::new(None),
        }
    }

    /// Add another result check.
    pub fn with_check(mut self, check: Box<dyn ResponseCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Map a generic call onto the wrapped tool's name and argument shape.
    pub fn resolve(&self, name: &str, arguments: &serde_json::Value) -> (String, serde_json::Value) {
        match self.aliases.get(name) {
            Some(alias) => (alias.tool.clone(), alias.reshape.apply(arguments)),
            None => (name.to_string(), arguments.clone()),
        }
    }

    /// List the child's tools, cached until the process is replaced.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, SupervisorError> {
        self.supervisor.start().await?;
        let generation = self.supervisor.generation();

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref().filter(|c| c.generation == generation) {
            return Ok(cached.tools.clone());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let value = self.supervisor.request("tools/list", params, None).await?;

            let next = value
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .map(str::to_string);
            let page: ListToolsResult = serde_json::from_value(value).map_err(|e| {
                SupervisorError::ProtocolParse {
                    reason: format!("invalid tools/list result: {e}"),
                }
            })?;
            tools.extend(page.tools);

            match next {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        tracing::info!(count = tools.len(), generation, "tool list loaded");
        *cache = Some(ToolCache {
            generation,
            tools: tools.clone(),
        });
        Ok(tools)
    }

    /// Invoke a tool by (possibly generic) name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, SupervisorError> {
        let start = Instant::now();
        self.supervisor.start().await?;

        let (resolved, shaped) = self.resolve(name, &arguments);
        let params = serde_json::json!({
            "name": resolved,
            "arguments": shaped,
        });

        let result = self
            .supervisor
            .request("tools/call", Some(params), None)
            .await?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(SupervisorError::ToolFailed {
                tool: name.to_string(),
                message: result_text(&result),
            });
        }

        let shapes = [&arguments, &shaped];
        for check in &self.checks {
            if let Some(reason) = check.inspect(name, &shapes, &result) {
                tracing::error!(
                    tool = name,
                    resolved = %resolved,
                    check = check.name(),
                    reason = %reason,
                    "rejecting tool result"
                );
                return Err(SupervisorError::EchoedResponse {
                    tool: name.to_string(),
                    check: format!("{}: {reason}", check.name()),
                });
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        tracing::debug!(tool = name, resolved = %resolved, elapsed_ms = elapsed, "tool call complete");

        Ok(ToolCallResult {
            tool_name: name.to_string(),
            resolved_name: resolved,
            result,
            execution_time_ms: elapsed,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
