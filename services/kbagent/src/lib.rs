//! kbagent library
//!
//! The agent runs as a sidecar next to a database engine and performs
//! lifecycle actions on behalf of the cluster controller.
//!
//! ## Architecture
//!
//! ```text
//! HTTP server ──┐
//! Streaming ────┼──> ActionService ──> ActionExecutor ──> exec | http | grpc
//! Probes ───────┤        (registry)
//! Tasks ────────┘
//! ```
//!
//! ## Modules
//!
//! - `executor`: runs one action over its transport with a deadline
//! - `action`: action registry, retries and non-blocking calls
//! - `probe`: periodic probes debounced into events
//! - `event`: event sinks (Kubernetes Events, log)
//! - `streaming`: handshake-then-raw-bytes data pipe
//! - `task`: replica bootstrap over the data pipe
//! - `server`: `POST /v1.0/action`

pub mod action;
pub mod config;
pub mod event;
pub mod executor;
pub mod probe;
pub mod server;
pub mod streaming;
pub mod task;

pub use action::ActionService;
pub use event::{ClusterEventSender, EventSender, LogEventSender, PodIdentity};
pub use executor::{ActionExecutor, ActionHandle, ActionIo, OutputBuffer, RpcInvoker};
pub use probe::ProbeService;
pub use streaming::StreamingService;
pub use task::TaskService;
