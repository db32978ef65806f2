//! Configuration for mcp-gateway.
//!
//! The entry point is [`resolve_config`]; see [`resolve`] for the priority
//! chain and [`types`] for the fields.

mod resolve;
mod types;

pub use resolve::{CONFIG_ENV, resolve_config};
pub use types::{GatewayConfig, PoolConfig, RouteConfig, add_header_line};
