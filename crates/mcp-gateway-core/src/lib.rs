//! Core types for mcp-gateway.
//!
//! This crate holds the pieces shared by every bridge and free of any
//! transport: JSON-RPC envelope types, the incremental stdout framer, and
//! process logging setup.

pub mod envelope;
pub mod framing;
pub mod logging;

pub use envelope::{Envelope, EnvelopeError, ErrorCode, ErrorObject, RequestId};
pub use framing::{FrameError, LocalReader, MessageFramer, write_newline_delimited};
