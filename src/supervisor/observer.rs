//! Optional observer for diagnostics and lifecycle events.
//!
//! The host application injects a [`DiagnosticSink`] to mirror child output
//! and state changes into its own UI or logs. Without one, everything goes to
//! `tracing`.

use super::types::ClientTier;

/// Where a diagnostic line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    /// A line on the child's stderr.
    Stderr,
    /// A non-JSON line on the child's stdout.
    Stdout,
}

/// Lifecycle events emitted by one supervisor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged { from: &'static str, to: &'static str },
    StrategyAttempt { tier: ClientTier, strategy: String },
    StrategyFailed { tier: ClientTier, reason: String },
    TierActivated { tier: ClientTier, pid: Option<u32> },
    ProcessExited { tier: ClientTier, pending_rejected: usize },
}

/// Receives diagnostics from one supervisor instance.
pub trait DiagnosticSink: Send + Sync {
    /// Called for every stderr line and every non-JSON stdout line.
    fn on_diagnostic(&self, source: DiagnosticSource, line: &str);

    /// Called on lifecycle transitions. Default: ignore.
    fn on_event(&self, _event: &SupervisorEvent) {}
}

/// Default sink: forward to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn on_diagnostic(&self, source: DiagnosticSource, line: &str) {
        tracing::debug!(source = ?source, line, "child output");
    }

    fn on_event(&self, event: &SupervisorEvent) {
        tracing::debug!(event = ?event, "supervisor event");
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! Sink that records everything, for assertions in tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingSink {
        pub lines: Mutex<Vec<(DiagnosticSource, String)>>,
        pub events: Mutex<Vec<SupervisorEvent>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn on_diagnostic(&self, source: DiagnosticSource, line: &str) {
            self.lines.lock().unwrap().push((source, line.to_string()));
        }

        fn on_event(&self, event: &SupervisorEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
