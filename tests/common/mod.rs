//! In-memory fake tool for driving the supervisor without real processes.
//!
//! `FakeStrategy::spawn` wires a task speaking line-delimited JSON-RPC over
//! `tokio::io::duplex` pipes. `tools/call` behaviour is chosen by tool name:
//!
//! | name           | response                                        |
//! |----------------|-------------------------------------------------|
//! | `echo`         | text = the serialized arguments                 |
//! | `fail`         | `isError: true` result                          |
//! | `remote_error` | JSON-RPC error `-32602`                         |
//! | `hang`         | never answers                                   |
//! | `slow`         | answers after `arguments.ms` milliseconds       |
//! | `crash`        | the fake exits, closing stdout                  |
//! | anything else  | `ok:<name>` text                                |

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use toolhost::supervisor::environment::EnvironmentBundle;
use toolhost::supervisor::lifecycle::{HandshakeOptions, ProcessControl, ProcessHandle};
use toolhost::supervisor::{
    ClientTier, DiagnosticSink, DiagnosticSource, LaunchChain, LaunchStrategy, Supervisor,
    SupervisorConfig, SupervisorError, SupervisorEvent,
};

// ─── Behaviour ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Answer `initialize`. When false the handshake times out.
    pub handshake: bool,
    /// Keep running after SIGTERM and stdin EOF; only kill stops it.
    pub ignore_terminate: bool,
    /// Delay before the process is "spawned".
    pub spawn_delay: Duration,
    /// Fail the spawn itself.
    pub spawn_error: bool,
    pub tools: Vec<Value>,
    /// Split `tools/list` into pages of this size.
    pub page_size: Option<usize>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            handshake: true,
            ignore_terminate: false,
            spawn_delay: Duration::ZERO,
            spawn_error: false,
            tools: vec![
                json!({"name": "graph-request", "description": "Call the API", "inputSchema": {"type": "object"}}),
                json!({"name": "echo", "description": "Echo", "inputSchema": {}}),
                json!({"name": "slow", "description": "Slow", "inputSchema": {}}),
            ],
            page_size: None,
        }
    }
}

/// Counters shared between a strategy, its fake processes, and the test.
#[derive(Default)]
pub struct FakeStats {
    pub spawns: AtomicUsize,
    pub terminations: AtomicUsize,
    pub kills: AtomicUsize,
    /// Every method received, in order, across all spawned processes.
    pub received: StdMutex<Vec<String>>,
    /// The bundle each spawn was given.
    pub bundles: StdMutex<Vec<EnvironmentBundle>>,
}

impl FakeStats {
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.received().iter().filter(|m| *m == method).count()
    }
}

// ─── Strategy ────────────────────────────────────────────────────────────────

pub struct FakeStrategy {
    pub tier: ClientTier,
    pub behavior: FakeBehavior,
    pub stats: Arc<FakeStats>,
}

impl FakeStrategy {
    pub fn new(tier: ClientTier, behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            tier,
            behavior,
            stats: Arc::new(FakeStats::default()),
        })
    }

    pub fn healthy(tier: ClientTier) -> Arc<Self> {
        Self::new(tier, FakeBehavior::default())
    }
}

#[async_trait]
impl LaunchStrategy for FakeStrategy {
    fn tier(&self) -> ClientTier {
        self.tier
    }

    fn label(&self) -> String {
        format!("{}/fake", self.tier)
    }

    async fn spawn(&self, bundle: &EnvironmentBundle) -> Result<ProcessHandle, SupervisorError> {
        self.stats.spawns.fetch_add(1, Ordering::SeqCst);
        self.stats.bundles.lock().unwrap().push(bundle.clone());
        if !self.behavior.spawn_delay.is_zero() {
            tokio::time::sleep(self.behavior.spawn_delay).await;
        }
        if self.behavior.spawn_error {
            return Err(SupervisorError::SpawnFailed {
                strategy: self.label(),
                reason: "No such file or directory (os error 2)".into(),
            });
        }

        let (client_stdin, tool_stdin) = tokio::io::duplex(64 * 1024);
        let (tool_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
        let (mut tool_stderr, client_stderr) = tokio::io::duplex(4 * 1024);

        let _ = tool_stderr.write_all(b"fake tool: starting\n").await;
        let task = tokio::spawn(serve(
            tool_stdin,
            tool_stdout,
            tool_stderr,
            self.behavior.clone(),
            self.stats.clone(),
        ));

        Ok(ProcessHandle::new(
            Box::new(client_stdin),
            Box::new(client_stdout),
            Some(Box::new(client_stderr)),
            Box::new(FakeControl {
                task: Some(task),
                ignore_terminate: self.behavior.ignore_terminate,
                stats: self.stats.clone(),
            }),
        ))
    }
}

struct FakeControl {
    task: Option<JoinHandle<()>>,
    ignore_terminate: bool,
    stats: Arc<FakeStats>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn id(&self) -> Option<u32> {
        self.task.as_ref().map(|_| 10_000)
    }

    fn is_alive(&mut self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.stats.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            if let Some(task) = &self.task {
                task.abort();
            }
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.stats.kills.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
        Ok(Some(0))
    }
}

// ─── Fake Tool ───────────────────────────────────────────────────────────────

type SharedOut = Arc<Mutex<DuplexStream>>;

async fn send(out: &SharedOut, value: Value) {
    let mut line = value.to_string();
    line.push('\n');
    let _ = out.lock().await.write_all(line.as_bytes()).await;
}

async fn serve(
    stdin: DuplexStream,
    stdout: DuplexStream,
    _stderr: DuplexStream,
    behavior: FakeBehavior,
    stats: Arc<FakeStats>,
) {
    let out: SharedOut = Arc::new(Mutex::new(stdout));
    // Non-JSON startup chatter on stdout.
    let _ = out.lock().await.write_all(b"fake tool v0 listening on stdio\n").await;

    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        stats.received.lock().unwrap().push(method.clone());
        let Some(id) = msg.get("id").cloned() else {
            continue; // notification
        };

        match method.as_str() {
            "initialize" => {
                if behavior.handshake {
                    send(
                        &out,
                        json!({"jsonrpc": "2.0", "id": id, "result": {
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "fake-tool", "version": "0.0.1"}
                        }}),
                    )
                    .await;
                }
            }
            "tools/list" => {
                let result = list_page(&behavior, msg["params"]["cursor"].as_str());
                send(&out, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
            }
            "tools/call" => {
                let name = msg["params"]["name"].as_str().unwrap_or_default();
                let args = msg["params"]["arguments"].clone();
                match name {
                    "hang" => {}
                    "crash" => return,
                    "slow" => {
                        let out = out.clone();
                        let ms = args["ms"].as_u64().unwrap_or(0);
                        let tag = args["tag"].as_str().unwrap_or_default().to_string();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                            send(
                                &out,
                                json!({"jsonrpc": "2.0", "id": id, "result": {
                                    "content": [{"type": "text", "text": format!("slow:{tag}")}]
                                }}),
                            )
                            .await;
                        });
                    }
                    "remote_error" => {
                        send(
                            &out,
                            json!({"jsonrpc": "2.0", "id": id, "error": {
                                "code": -32602, "message": "missing argument 'path'"
                            }}),
                        )
                        .await;
                    }
                    "fail" => {
                        send(
                            &out,
                            json!({"jsonrpc": "2.0", "id": id, "result": {
                                "isError": true,
                                "content": [{"type": "text", "text": "upstream returned 403"}]
                            }}),
                        )
                        .await;
                    }
                    "echo" => {
                        send(
                            &out,
                            json!({"jsonrpc": "2.0", "id": id, "result": {
                                "content": [{"type": "text", "text": args.to_string()}]
                            }}),
                        )
                        .await;
                    }
                    other => {
                        send(
                            &out,
                            json!({"jsonrpc": "2.0", "id": id, "result": {
                                "content": [{"type": "text", "text": format!("ok:{other}")}]
                            }}),
                        )
                        .await;
                    }
                }
            }
            _ => {
                send(
                    &out,
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "method not found"}}),
                )
                .await;
            }
        }
    }

    if behavior.ignore_terminate {
        // Hold stdout open until killed.
        futures::future::pending::<()>().await;
    }
}

fn list_page(behavior: &FakeBehavior, cursor: Option<&str>) -> Value {
    let Some(size) = behavior.page_size else {
        return json!({"tools": behavior.tools});
    };
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + size).min(behavior.tools.len());
    let page = &behavior.tools[start..end];
    if end < behavior.tools.len() {
        json!({"tools": page, "nextCursor": end.to_string()})
    } else {
        json!({"tools": page})
    }
}

// ─── Sink & Builders ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub lines: StdMutex<Vec<(DiagnosticSource, String)>>,
    pub events: StdMutex<Vec<SupervisorEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<(DiagnosticSource, String)> {
        self.lines.lock().unwrap().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn on_diagnostic(&self, source: DiagnosticSource, line: &str) {
        self.lines.lock().unwrap().push((source, line.to_string()));
    }

    fn on_event(&self, event: &SupervisorEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Config suitable for fakes: no PATH augmentation, short timeouts.
pub fn test_config() -> SupervisorConfig {
    let mut config = SupervisorConfig::new("fake-tool");
    config.name = "fake".into();
    config.environment.augment_path = false;
    config.timeouts.request_secs = 5;
    config.timeouts.shutdown_grace_secs = 1;
    config
}

/// Supervisor over the given fakes, with a short handshake window.
pub fn supervisor_with(
    config: SupervisorConfig,
    strategies: &[Arc<FakeStrategy>],
) -> (Supervisor, Arc<RecordingSink>) {
    let chain = LaunchChain::new(
        strategies
            .iter()
            .map(|s| s.clone() as Arc<dyn LaunchStrategy>)
            .collect(),
        HandshakeOptions {
            window: Duration::from_millis(300),
            ..HandshakeOptions::default()
        },
    );
    let sink = Arc::new(RecordingSink::default());
    let supervisor = Supervisor::new(config, chain, sink.clone());
    (supervisor, sink)
}

/// Poll `cond` until true or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
