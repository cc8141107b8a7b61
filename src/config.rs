use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::session::{DEFAULT_CONNECT_RETRY, DEFAULT_RETRY_DELAY, SessionSettings};

/// Config file read when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "vdxfer.toml";

/// Prefix for environment overrides, e.g. `VDXFER_CONNECT_RETRY=5`.
pub const ENV_PREFIX: &str = "VDXFER_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Connect attempts before giving up.
    pub connect_retry: u32,
    pub retry_delay_secs: u64,
    /// Re-read the disk after an upload and compare digests.
    pub verify: bool,
    /// Directory holding the `<vdi>.img` files behind simulated LUNs.
    pub simulation_dir: PathBuf,
    /// JSON-RPC endpoint of the host plugin service. The simulated host is
    /// used when unset.
    pub plugin_endpoint: Option<SocketAddr>,
    /// Host reference passed along with every plugin call.
    pub plugin_host: String,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connect_retry: DEFAULT_CONNECT_RETRY,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            verify: false,
            simulation_dir: PathBuf::from("."),
            plugin_endpoint: None,
            plugin_host: "localhost".to_string(),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `VDXFER_*` variables and finally any
    /// CLI arguments, later layers winning.
    ///
    /// A missing config file is not an error.
    pub fn new<T: Serialize>(config_file: Option<&Path>, cli_args: Option<&T>) -> anyhow::Result<Self> {
        let path = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", path.display()))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_retry: self.connect_retry,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        connect_retry: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verify: Option<bool>,
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            AppConfig::new(Some(&dir.path().join("absent.toml")), None::<&Overrides>).unwrap();

        assert_eq!(config.connect_retry, 3);
        assert_eq!(config.retry_delay_secs, 5);
        assert_eq!(config.plugin_endpoint, None);
        assert_eq!(config.session_settings(), SessionSettings::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
connect_retry = 7
plugin_endpoint = "127.0.0.1:9400"
simulation_dir = "/var/lib/vdxfer"
"#,
        );
        let config = AppConfig::new(Some(file.path()), None::<&Overrides>).unwrap();

        assert_eq!(config.connect_retry, 7);
        assert_eq!(config.plugin_endpoint, Some("127.0.0.1:9400".parse().unwrap()));
        assert_eq!(config.simulation_dir, PathBuf::from("/var/lib/vdxfer"));
        assert!(!config.verify);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config("connect_retry = 7\nverify = false\n");
        let args = Overrides {
            connect_retry: None,
            verify: Some(true),
        };
        let config = AppConfig::new(Some(file.path()), Some(&args)).unwrap();

        assert_eq!(config.connect_retry, 7);
        assert!(config.verify);
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let file = write_config("connect_retry = \"many\"\n");
        assert!(AppConfig::new(Some(file.path()), None::<&Overrides>).is_err());
    }
}
