//! mcp-gateway library crate.
//!
//! Child process management, the session reapers, the bridges and the CLI
//! types behind the `mcp-gateway` binary. Exposed as a library for
//! integration testing and embedding.

pub mod bridge;
pub mod child;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod handshake;
pub mod http;
pub mod pool;
pub mod remote;
pub mod session;

#[doc(inline)]
pub use child::{ChildCommand, ChildHandle, ChildSpawner, CommandSpawner, MemorySpawner};
pub use error::GatewayError;
