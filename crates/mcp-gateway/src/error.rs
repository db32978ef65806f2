//! Error type shared by the gateway's process, pool and bridge layers.

use std::time::Duration;

use mcp_gateway_core::ErrorCode;

/// Errors produced below the command layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The child command could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child process has already exited.
    #[error("child process {id} has exited")]
    ChildGone { id: u64 },

    /// The stdin writer for the child is no longer accepting input.
    #[error("stdin of child process {id} is closed")]
    StdinClosed { id: u64 },

    /// A queued pool acquire waited longer than the configured limit.
    #[error("no child process became available within {0:?}")]
    AcquireTimeout(Duration),

    /// The pool was shut down while the caller waited.
    #[error("child process pool is shut down")]
    PoolClosed,

    /// A request to the remote endpoint failed.
    #[error("{message}")]
    Remote { code: Option<i64>, message: String },

    /// The remote event stream ended.
    #[error("remote connection closed")]
    RemoteClosed,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            code: None,
            message: message.into(),
        }
    }

    /// JSON-RPC code to report when this error answers a client request.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Remote { code: Some(code), .. } => *code,
            _ => ErrorCode::ServerError.code(),
        }
    }
}
