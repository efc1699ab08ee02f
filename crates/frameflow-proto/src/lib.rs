//! # frameflow-proto
//!
//! Wire definitions for frameflow streaming inference sessions.
//!
//! Clients send raw encoded frames as binary WebSocket messages. Everything
//! the server sends back is a JSON text message described by
//! [`ServerMessage`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;

pub use error::ProtoError;
pub use messages::{ErrorCategory, ErrorCode, ServerMessage, Warning};
