use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the transfer endpoint obtains its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetworkMode {
    Static {
        ip: String,
        mask: String,
        gateway: String,
    },
    Dhcp,
}

/// Network settings for the transfer endpoint, passed through to `expose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: String,
    #[serde(flatten)]
    pub mode: NetworkMode,
}

impl NetworkConfig {
    pub fn dhcp(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            mode: NetworkMode::Dhcp,
        }
    }

    pub fn static_ip(
        network_id: impl Into<String>,
        ip: impl Into<String>,
        mask: impl Into<String>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            mode: NetworkMode::Static {
                ip: ip.into(),
                mask: mask.into(),
                gateway: gateway.into(),
            },
        }
    }

    /// Provisioning arguments for this configuration.
    ///
    /// `network_config` stays at the plugin's "auto" default, so no port or
    /// MAC arguments are sent.
    pub fn to_args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        args.insert("network_uuid".to_string(), self.network_id.clone());

        match &self.mode {
            NetworkMode::Static { ip, mask, gateway } => {
                args.insert("network_mode".to_string(), "manual".to_string());
                args.insert("network_ip".to_string(), ip.clone());
                args.insert("network_mask".to_string(), mask.clone());
                args.insert("network_gateway".to_string(), gateway.clone());
            }
            NetworkMode::Dhcp => {
                args.insert("network_mode".to_string(), "dhcp".to_string());
            }
        }

        args
    }
}
