//! JSON-RPC access to the host plugin service.
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `client`: [`PluginHost`](crate::core::plugin::PluginHost) over TCP with
//!   newline-delimited JSON framing

pub mod client;
pub mod protocol;

pub use client::{CALL_PLUGIN_METHOD, ClientError, RpcPluginHost};
pub use protocol::{Request, Response, RpcError};
