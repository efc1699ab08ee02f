//! # frameflow-server
//!
//! WebSocket server that runs live video frames through named inference
//! pipelines, one session per connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws://host/?pipeline_id=..  ┌──────────────────────────┐
//! │  client  │────────────────────────────►│       StreamServer       │
//! │          │   binary JPEG frames        │                          │
//! │          │◄────────────────────────────│  ┌────────────────────┐  │
//! └──────────┘   JSON result / dropped /   │  │ ConnectionHandler  │  │
//!                warning / error           │  │  FrameValidator    │  │
//!                                          │  │  backpressure      │  │
//!                                          │  │  Session           │──┼──► PipelineExecutor
//!                                          │  └────────────────────┘  │
//!                                          │  SessionMonitor          │
//!                                          └──────────────────────────┘
//! ```
//!
//! Every frame is validated, then either dropped or run through the
//! executor, and answered with exactly one message. A session never queues
//! frames: when the pipeline falls behind, frames are shed and the client is
//! asked to slow down.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use frameflow_server::{builtin_registry, ServerConfig, StreamServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), frameflow_server::ServerError> {
//!     let config = ServerConfig::default().with_max_sessions(4);
//!     let server = StreamServer::with_registry(config, builtin_registry());
//!     server.run().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backpressure;
pub mod config;
pub mod error;
pub mod handler;
pub mod monitor;
pub mod pipeline;
pub mod pipelines;
pub mod server;
pub mod session;
pub mod validator;

// Re-export main types
pub use backpressure::{Decision, DropCause};
pub use config::{
    ServerConfig, SessionConfig, DEFAULT_DROP_THRESHOLD, DEFAULT_MAX_FRAME_SIZE_BYTES,
    DEFAULT_SLOWDOWN_THRESHOLD,
};
pub use error::{ServerError, ServerResult};
pub use handler::{run_session, SessionContext, SessionSummary};
pub use monitor::{MonitorHandle, MonitorSnapshot, SessionMonitor};
pub use pipeline::{
    BoxFuture, Pipeline, PipelineCatalog, PipelineError, PipelineExecutor, PipelineOutput,
    PipelineRegistry,
};
pub use pipelines::builtin_registry;
pub use server::{StreamServer, PIPELINE_QUERY_PARAM};
pub use session::{CloseReason, Session, SessionState, SessionStats};
pub use validator::{FrameError, FrameValidator};
