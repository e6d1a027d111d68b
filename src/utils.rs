//! Directory management and host network discovery
//!
//! # Directory Structure
//!
//! - Config: `~/.config/dockfw/config.json`
//! - State: `~/.local/state/dockfw/` - audit log
//!
//! Per-container state lives next to Docker's own container directories and
//! is configured separately (see [`crate::config::AppConfig::state_dir`]).

use directories::ProjectDirs;
use ipnetwork::Ipv4Network;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::debug;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "dockfw", "dockfw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Creates the state directory (mode 0700) so the audit log can be written.
pub fn ensure_dirs() -> std::io::Result<()> {
    let Some(dir) = get_state_dir() else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;

        std::fs::DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(dir)?;
    }

    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;

    Ok(())
}

/// IPv4 address and subnet of a host interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: Ipv4Addr,
    pub subnet: Option<Ipv4Network>,
}

/// Network containing `address` under `netmask`
pub fn subnet_of(address: Ipv4Addr, netmask: Ipv4Addr) -> Option<Ipv4Network> {
    let network = Ipv4Network::with_netmask(address, netmask).ok()?;
    Ipv4Network::new(network.network(), network.prefix()).ok()
}

/// First IPv4 address of interface `name`, if the interface exists.
pub fn discover_interface(name: &str) -> Option<InterfaceAddress> {
    let interfaces = match NetworkInterface::show() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!("Listing network interfaces failed: {}", e);
            return None;
        }
    };

    interfaces
        .iter()
        .filter(|iface| iface.name == name)
        .flat_map(|iface| iface.addr.iter())
        .find_map(|addr| match addr {
            Addr::V4(v4) => Some(InterfaceAddress {
                address: v4.ip,
                subnet: v4.netmask.and_then(|mask| subnet_of(v4.ip, mask)),
            }),
            Addr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_of() {
        assert_eq!(
            subnet_of(Ipv4Addr::new(172, 17, 0, 1), Ipv4Addr::new(255, 255, 0, 0)),
            Some("172.17.0.0/16".parse().unwrap())
        );
        assert_eq!(
            subnet_of(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Some("10.0.0.0/8".parse().unwrap())
        );
        // Non-contiguous masks are not networks
        assert_eq!(
            subnet_of(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 255, 0)),
            None
        );
    }

    #[test]
    fn test_discover_missing_interface() {
        assert_eq!(discover_interface("dockfw-nonexistent0"), None);
    }
}
