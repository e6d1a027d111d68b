use crate::core::address::BridgeNetwork;
use crate::core::error::{Error, Result};
use crate::elevation::{DEFAULT_IPTABLES, iptables_program};
use crate::utils::{discover_interface, get_config_dir};
use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where Docker keeps its per-container directories
pub const DEFAULT_STATE_DIR: &str = "/var/lib/docker/containers";

/// dockfw configuration, read from `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the per-container state (`<state_dir>/<id>/extraRules.json`, ...)
    pub state_dir: PathBuf,
    pub iptables: String,
    /// Unix socket of the Docker daemon; local defaults when unset
    pub docker_socket: Option<String>,
    pub docker_timeout_secs: u64,
    pub bridge_interface: String,
    /// Discovered from `bridge_interface` when unset
    pub bridge_gateway: Option<Ipv4Addr>,
    /// Discovered from `bridge_interface` when unset
    pub bridge_subnet: Option<Ipv4Network>,
    pub audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            iptables: DEFAULT_IPTABLES.to_string(),
            docker_socket: None,
            docker_timeout_secs: crate::docker::DEFAULT_TIMEOUT_SECS,
            bridge_interface: "docker0".to_string(),
            bridge_gateway: None,
            bridge_subnet: None,
            audit_log: true,
        }
    }
}

impl AppConfig {
    fn validate(&self) -> Result<()> {
        validators::validate_interface(&self.bridge_interface)
            .map_err(|message| Error::validation("bridge_interface", message))?;
        if self.docker_timeout_secs == 0 {
            return Err(Error::validation(
                "docker_timeout_secs",
                "timeout must be at least one second",
            ));
        }
        Ok(())
    }

    /// iptables binary, with `DOCKFW_IPTABLES_COMMAND` taking precedence
    pub fn iptables_program(&self) -> String {
        iptables_program(&self.iptables)
    }

    /// Bridge parameters: configured values first, then what the interface
    /// reports, then Docker's historical defaults.
    pub fn bridge_network(&self) -> BridgeNetwork {
        let fallback = BridgeNetwork::default();
        let discovered = if self.bridge_gateway.is_none() || self.bridge_subnet.is_none() {
            discover_interface(&self.bridge_interface)
        } else {
            None
        };
        debug!("{} reports {:?}", self.bridge_interface, discovered);

        BridgeNetwork {
            interface: self.bridge_interface.clone(),
            gateway: self
                .bridge_gateway
                .or(discovered.map(|d| d.address))
                .unwrap_or(fallback.gateway),
            subnet: self
                .bridge_subnet
                .or(discovered.and_then(|d| d.subnet))
                .unwrap_or(fallback.subnet),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the configuration.
///
/// An explicit `path` must exist. Without one, the default location is
/// tried and a missing file means defaults.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or parsed, or holds invalid
/// values.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(AppConfig::default()),
        },
    };

    let config = match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            debug!("No config at {}, using defaults", path.display());
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    config.validate()?;
    Ok(config)
}
