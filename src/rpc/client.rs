//! Plugin host reached over JSON-RPC.
//!
//! Each plugin call opens a connection, sends one newline-delimited request
//! and reads one response line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::protocol::{Request, Response, RpcError};
use crate::core::plugin::{PluginArgs, PluginHost};

/// Method the plugin service exposes for plugin invocation.
pub const CALL_PLUGIN_METHOD: &str = "host.call_plugin";

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to plugin service: {0}")]
    Connect(#[source] std::io::Error),
    #[error("Communication error: {0}")]
    Io(#[source] std::io::Error),
    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Connection closed before a response was received")]
    Closed,
    #[error("Response id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: Value },
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

/// [`PluginHost`] backed by a remote plugin service.
#[derive(Debug)]
pub struct RpcPluginHost {
    addr: SocketAddr,
    host: String,
    next_id: AtomicU64,
}

impl RpcPluginHost {
    /// `host` identifies the host the plugin runs on and is passed through
    /// unchanged with every call.
    pub fn new(addr: SocketAddr, host: impl Into<String>) -> Self {
        Self {
            addr,
            host: host.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn call(&self, params: Value) -> Result<String, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(CALL_PLUGIN_METHOD, params, id);
        let mut request_json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        request_json.push('\n');

        stream
            .write_all(request_json.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader
            .read_line(&mut response_line)
            .await
            .map_err(ClientError::Io)?;
        if read == 0 {
            return Err(ClientError::Closed);
        }

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;

        if !response.answers(id) {
            return Err(ClientError::IdMismatch {
                expected: id,
                got: response.id,
            });
        }
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(ClientError::Parse)
    }
}

#[async_trait]
impl PluginHost for RpcPluginHost {
    async fn call_plugin(
        &self,
        plugin: &str,
        function: &str,
        args: &PluginArgs,
    ) -> anyhow::Result<String> {
        debug!(addr = %self.addr, plugin, function, "Calling host plugin");

        let params = json!({
            "host": self.host,
            "plugin": plugin,
            "fn": function,
            "args": args,
        });

        Ok(self.call(params).await?)
    }
}
