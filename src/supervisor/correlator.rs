//! Request/response correlation by JSON-RPC id.
//!
//! Each outbound request registers a `PendingRequest` holding a oneshot
//! sender and a deadline. The entry leaves the table exactly once: when a
//! matching response arrives, when its deadline passes, when the caller gives
//! up, or when the whole table is failed (stop, restart, crash). Because the
//! sender is moved out on removal, a second settlement is impossible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::errors::SupervisorError;
use super::types::{error_codes, RpcMessage};

type Outcome = Result<serde_json::Value, SupervisorError>;

/// An outstanding request.
struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    /// Set once by `fail_all`; later registrations fail with this error.
    closed: Option<SupervisorError>,
}

/// Handle returned by [`RpcCorrelator::register`]; redeemed with
/// [`RpcCorrelator::wait`].
#[derive(Debug)]
pub struct Ticket {
    pub id: u64,
    method: String,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Outcome>,
}

/// Tracks outstanding requests for one process instance.
pub struct RpcCorrelator {
    next_id: AtomicU64,
    table: Mutex<PendingTable>,
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(PendingTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and register a pending entry for it.
    pub fn register(&self, method: &str, timeout: Duration) -> Result<Ticket, SupervisorError> {
        let mut table = self.table();
        if let Some(err) = &table.closed {
            return Err(err.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        Ok(Ticket {
            id,
            method: method.to_string(),
            deadline: Instant::now() + timeout,
            timeout,
            rx,
        })
    }

    /// Drop a pending entry without settling it. Returns `true` if it was
    /// still pending.
    pub fn forget(&self, id: u64) -> bool {
        self.table().entries.remove(&id).is_some()
    }

    /// Wait for the ticket's response or its deadline, whichever comes first.
    ///
    /// Cancel-safe: if this future is dropped the entry is removed.
    pub async fn wait(&self, mut ticket: Ticket) -> Result<serde_json::Value, SupervisorError> {
        let _guard = PendingGuard {
            correlator: self,
            id: ticket.id,
        };

        match tokio::time::timeout_at(ticket.deadline, &mut ticket.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SupervisorError::transport(format!(
                "request {} abandoned before completion",
                ticket.id
            ))),
            Err(_) => {
                if self.forget(ticket.id) {
                    tracing::warn!(
                        id = ticket.id,
                        method = %ticket.method,
                        timeout_ms = ticket.timeout.as_millis() as u64,
                        "request timed out"
                    );
                    return Err(SupervisorError::Timeout {
                        method: ticket.method.clone(),
                        id: ticket.id,
                        timeout_ms: ticket.timeout.as_millis() as u64,
                    });
                }
                // Settled between the deadline firing and us taking the lock.
                match ticket.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SupervisorError::Timeout {
                        method: ticket.method.clone(),
                        id: ticket.id,
                        timeout_ms: ticket.timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// Deliver a framed message. Returns `true` if it settled a pending entry.
    ///
    /// Only responses are considered; requests and notifications from the
    /// child, and responses with unknown ids, are ignored.
    pub fn on_message(&self, value: &serde_json::Value) -> bool {
        let Some(RpcMessage::Response(response)) = RpcMessage::from_value(value) else {
            return false;
        };

        let Some(entry) = self.table().entries.remove(&response.id) else {
            tracing::debug!(id = response.id, "response for unknown or already-settled request");
            return false;
        };

        let outcome = match response.error {
            Some(err) => Err(SupervisorError::Remote {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => extract_result(value),
        };

        if entry.tx.send(outcome).is_err() {
            tracing::debug!(
                id = response.id,
                method = %entry.method,
                "caller went away before the response arrived"
            );
        }
        true
    }

    /// Reject every pending entry with `err` and refuse new registrations.
    ///
    /// Returns how many entries were rejected.
    pub fn fail_all(&self, err: SupervisorError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.table();
            if table.closed.is_none() {
                table.closed = Some(err.clone());
            }
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            if entry.tx.send(Err(err.clone())).is_err() {
                tracing::debug!(id, method = %entry.method, "caller went away before rejection");
            }
        }
        count
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    /// Whether `fail_all` has been called.
    pub fn is_closed(&self) -> bool {
        self.table().closed.is_some()
    }
}

/// Removes the entry if the waiting future is dropped early.
struct PendingGuard<'a> {
    correlator: &'a RpcCorrelator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

/// Pull the `result` member out of a success response.
///
/// An explicit `"result": null` is a valid (empty) result; a response with
/// neither `result` nor `error` is a protocol violation.
pub fn extract_result(value: &serde_json::Value) -> Result<serde_json::Value, SupervisorError> {
    value
        .get("result")
        .cloned()
        .ok_or(SupervisorError::Remote {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".into(),
            data: None,
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
