//! Boundary to the remote host plugin that exposes disks for transfer.
//!
//! The plugin is invoked as `transfer.<function>(args)` and answers with an
//! opaque string. Arguments are an ordered string map, matching the remote
//! protocol, and are checked for required keys before anything is sent.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::core::network::NetworkConfig;
use crate::error::{Result, TransferError};

/// Name of the host plugin that manages transfer endpoints.
pub const TRANSFER_PLUGIN: &str = "transfer";

pub type PluginArgs = BTreeMap<String, String>;

/// A host plugin endpoint reached through an authenticated session.
///
/// Implementations carry whatever authentication and host addressing they
/// need; the session manager only ever issues calls through this trait.
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn call_plugin(
        &self,
        plugin: &str,
        function: &str,
        args: &PluginArgs,
    ) -> anyhow::Result<String>;
}

#[async_trait]
impl<T: PluginHost + ?Sized> PluginHost for Box<T> {
    async fn call_plugin(
        &self,
        plugin: &str,
        function: &str,
        args: &PluginArgs,
    ) -> anyhow::Result<String> {
        (**self).call_plugin(plugin, function, args).await
    }
}

/// Functions offered by the transfer plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginFunction {
    /// Expose a disk and return a record handle.
    Expose,
    /// Fetch the XML record for a handle.
    GetRecord,
    /// Release an exposed disk.
    Unexpose,
}

impl PluginFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expose => "expose",
            Self::GetRecord => "get_record",
            Self::Unexpose => "unexpose",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "expose" => Some(Self::Expose),
            "get_record" => Some(Self::GetRecord),
            "unexpose" => Some(Self::Unexpose),
            _ => None,
        }
    }

    fn required_args(&self) -> &'static [&'static str] {
        match self {
            Self::Expose => &["vdi_uuid", "transfer_mode", "read_only"],
            Self::GetRecord | Self::Unexpose => &["record_handle"],
        }
    }
}

/// A validated call to the transfer plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCall {
    function: PluginFunction,
    args: PluginArgs,
}

impl PluginCall {
    /// Build a call, rejecting it if a required argument is missing or blank.
    pub fn new(function: PluginFunction, args: PluginArgs) -> Result<Self> {
        for key in function.required_args() {
            match args.get(*key) {
                Some(value) if !value.trim().is_empty() => {}
                _ => {
                    return Err(TransferError::InvalidPluginArgs {
                        function: function.as_str(),
                        key: *key,
                    });
                }
            }
        }
        Ok(Self { function, args })
    }

    /// `expose` for a disk over iSCSI, with any network settings appended.
    pub fn expose(vdi_uuid: &str, read_only: bool, network: Option<&NetworkConfig>) -> Result<Self> {
        let mut args = PluginArgs::new();
        args.insert("vdi_uuid".to_string(), vdi_uuid.to_string());
        args.insert("transfer_mode".to_string(), "ISCSI".to_string());
        args.insert("read_only".to_string(), read_only.to_string());
        if let Some(network) = network {
            args.extend(network.to_args());
        }
        Self::new(PluginFunction::Expose, args)
    }

    pub fn get_record(record_handle: &str) -> Result<Self> {
        Self::with_handle(PluginFunction::GetRecord, record_handle)
    }

    pub fn unexpose(record_handle: &str) -> Result<Self> {
        Self::with_handle(PluginFunction::Unexpose, record_handle)
    }

    fn with_handle(function: PluginFunction, record_handle: &str) -> Result<Self> {
        let mut args = PluginArgs::new();
        args.insert("record_handle".to_string(), record_handle.to_string());
        Self::new(function, args)
    }

    pub fn function(&self) -> PluginFunction {
        self.function
    }

    pub fn args(&self) -> &PluginArgs {
        &self.args
    }

    /// Send the call through `host`.
    pub async fn send<H: PluginHost + ?Sized>(&self, host: &H) -> anyhow::Result<String> {
        host.call_plugin(TRANSFER_PLUGIN, self.function.as_str(), &self.args)
            .await
    }
}
