//! Supervisor for an external tool process that speaks line-delimited
//! JSON-RPC over stdio.
//!
//! This module handles:
//! - Resolving the child's environment (credentials, defaults, PATH)
//! - Launching through a tiered fallback chain of strategies
//! - Framing stdout into JSON messages and correlating responses by id
//! - Lifecycle: single-flight start, stop, credential-refresh restart
//! - Rejecting results that merely echo the call arguments
//!
//! Collaborators normally go through [`ToolFacade`]; the [`Supervisor`] is
//! exposed for hosts that need direct lifecycle control.

pub mod config;
pub mod correlator;
pub mod environment;
pub mod errors;
pub mod facade;
pub mod framer;
pub mod lifecycle;
pub mod observer;
pub mod sanity;
pub mod strategy;
#[allow(clippy::module_inception)]
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{load_config, parse_config, SupervisorConfig};
pub use environment::{EnvOverrides, EnvironmentBundle, EnvironmentPolicy};
pub use errors::{ErrorKind, SupervisorError};
pub use facade::{ArgumentReshape, ToolAlias, ToolFacade};
pub use observer::{DiagnosticSink, DiagnosticSource, SupervisorEvent, TracingSink};
pub use sanity::{EchoedArgumentsCheck, ResponseCheck};
pub use strategy::{ExecMode, ExecStrategy, LaunchChain, LaunchStrategy};
pub use supervisor::{Supervisor, SupervisorState};
pub use types::{ClientTier, ToolCallResult, ToolDescriptor};
