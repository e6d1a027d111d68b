//! Container descriptors and the container runtime seam
//!
//! [`ContainerRef`] is the snapshot of one container as reported by the
//! runtime. [`LaunchConfig`] is the subset of Docker's `HostConfig` that
//! dockfw persists and replays when starting containers; unknown keys are
//! carried through untouched so a saved snapshot round-trips.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Docker's restart policy name when none is set
pub const DEFAULT_RESTART_POLICY: &str = "no";

/// Published ports keyed by `"<port>/<proto>"`, as in `NetworkSettings.Ports`
pub type PortMap = BTreeMap<String, Option<Vec<PortBinding>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_retry_count: Option<i64>,
}

/// Host-side launch configuration of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes_from: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<PortMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl LaunchConfig {
    pub fn links(&self) -> &[String] {
        self.links.as_deref().unwrap_or_default()
    }

    pub fn volumes_from(&self) -> &[String] {
        self.volumes_from.as_deref().unwrap_or_default()
    }

    /// Restart policy name, with an empty or missing policy reported as `"no"`
    pub fn restart_policy_name(&self) -> &str {
        self.restart_policy
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_RESTART_POLICY)
    }

    /// Whether `current` still describes the same container setup as `self`.
    ///
    /// Only the fields dockfw replays on start are compared.
    pub fn is_compatible_with(&self, current: &LaunchConfig) -> bool {
        fn ports(map: Option<&PortMap>) -> PortMap {
            map.map(|m| {
                m.iter()
                    .filter(|(_, bindings)| bindings.as_ref().is_some_and(|b| !b.is_empty()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
        }

        self.links() == current.links()
            && self.volumes_from() == current.volumes_from()
            && ports(self.port_bindings.as_ref()) == ports(current.port_bindings.as_ref())
            && self.restart_policy_name() == current.restart_policy_name()
    }

    /// Rewrites a saved snapshot into a form the runtime accepts on start.
    ///
    /// Docker reports links as `/<dep>:/<name>/<alias>` but only accepts
    /// `<dep>:<alias>` when creating or starting.
    pub fn prepared_for_start(&self, container_name: &str) -> Result<LaunchConfig> {
        let mut config = self.clone();

        if let Some(links) = &self.links {
            config.links = Some(
                links
                    .iter()
                    .map(|raw| Link::parse(raw, container_name).map(|l| l.to_start_form()))
                    .collect::<Result<Vec<_>>>()?,
            );
        }

        let policy = config.restart_policy.get_or_insert_with(RestartPolicy::default);
        if policy.name.as_deref().is_none_or(str::is_empty) {
            policy.name = Some(DEFAULT_RESTART_POLICY.to_string());
        }

        Ok(config)
    }
}

/// A runtime-reported container link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub dependency: String,
    pub alias: String,
}

impl Link {
    /// Parses `/<dep>:/<owner>/<alias>` as reported by `docker inspect`.
    pub fn parse(raw: &str, owner_name: &str) -> Result<Self> {
        let malformed = || Error::MalformedLink(raw.to_string());

        let (source, target) = raw.split_once(':').ok_or_else(malformed)?;
        let dependency = source.strip_prefix('/').ok_or_else(malformed)?;
        let owner_prefix = format!("/{owner_name}/");
        let alias = target.strip_prefix(owner_prefix.as_str()).ok_or_else(malformed)?;

        if dependency.is_empty() || alias.is_empty() || alias.contains(':') {
            return Err(malformed());
        }

        Ok(Self {
            dependency: dependency.to_string(),
            alias: alias.to_string(),
        })
    }

    pub fn to_start_form(&self) -> String {
        format!("{}:{}", self.dependency, self.alias)
    }
}

/// Container name referenced by a `VolumesFrom` entry (`name[:ro|:rw]`)
pub fn volume_source(entry: &str) -> &str {
    entry.split_once(':').map_or(entry, |(name, _)| name)
}

/// Snapshot of one container as reported by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRef {
    pub id: String,
    /// Display name without Docker's leading slash
    pub name: String,
    /// Primary bridge address; `None` while the container is offline
    pub ipv4: Option<Ipv4Addr>,
    pub running: bool,
    pub paused: bool,
    pub launch_config: LaunchConfig,
    /// Live port mapping (`NetworkSettings.Ports`)
    pub network_ports: PortMap,
}

impl ContainerRef {
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    pub fn links(&self) -> &[String] {
        self.launch_config.links()
    }

    pub fn volumes_from(&self) -> &[String] {
        self.launch_config.volumes_from()
    }

    pub fn online_ipv4(&self) -> Result<Ipv4Addr> {
        self.ipv4
            .ok_or_else(|| Error::ContainerOffline(self.name.clone()))
    }
}

/// Output of a command executed inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Container runtime operations consumed by dockfw.
///
/// Calls are awaited one at a time; implementations need not be `Sync`.
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    /// Checks that the runtime answers.
    async fn ping(&self) -> Result<()>;

    /// Fails with [`Error::ContainerNotFound`] for unknown ids and names.
    async fn inspect(&self, id: &str) -> Result<ContainerRef>;

    /// Every container known to the runtime, running or not.
    async fn list_all(&self) -> Result<Vec<ContainerRef>>;

    /// Starts a stopped container.
    ///
    /// The Docker Engine runtime only applies the restart policy from
    /// `config`. Links and port bindings are fixed when the container is
    /// created, so the saved values are advisory there.
    async fn start(&self, id: &str, config: &LaunchConfig) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn unpause(&self, id: &str) -> Result<()>;

    /// Runs `argv` inside the container and captures its output.
    async fn exec_capture(&self, id: &str, argv: &[String]) -> Result<ExecOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_parse() {
        let link = Link::parse("/db:/web/db", "web").unwrap();
        assert_eq!(link.dependency, "db");
        assert_eq!(link.alias, "db");
        assert_eq!(link.to_start_form(), "db:db");

        let link = Link::parse("/postgres-1:/web/database", "web").unwrap();
        assert_eq!(link.to_start_form(), "postgres-1:database");
    }

    #[test]
    fn test_link_parse_rejects_unexpected_format() {
        assert!(matches!(
            Link::parse("db:db", "web"),
            Err(Error::MalformedLink(_))
        ));
        assert!(matches!(
            Link::parse("/db:/other/db", "web"),
            Err(Error::MalformedLink(_))
        ));
        assert!(matches!(Link::parse("/db", "web"), Err(Error::MalformedLink(_))));
    }

    #[test]
    fn test_volume_source_strips_mode() {
        assert_eq!(volume_source("data"), "data");
        assert_eq!(volume_source("data:ro"), "data");
        assert_eq!(volume_source("data:rw"), "data");
    }

    #[test]
    fn test_restart_policy_defaults_to_no() {
        let mut config = LaunchConfig::default();
        assert_eq!(config.restart_policy_name(), "no");

        config.restart_policy = Some(RestartPolicy {
            name: Some(String::new()),
            maximum_retry_count: None,
        });
        assert_eq!(config.restart_policy_name(), "no");

        config.restart_policy = Some(RestartPolicy {
            name: Some("always".into()),
            maximum_retry_count: Some(0),
        });
        assert_eq!(config.restart_policy_name(), "always");
    }

    #[test]
    fn test_prepared_for_start() {
        let config = LaunchConfig {
            links: Some(vec!["/db:/web/db".into(), "/cache:/web/redis".into()]),
            ..Default::default()
        };
        let prepared = config.prepared_for_start("web").unwrap();
        assert_eq!(prepared.links(), ["db:db", "cache:redis"]);
        assert_eq!(prepared.restart_policy_name(), "no");
        assert_eq!(
            prepared.restart_policy.unwrap().name.as_deref(),
            Some("no")
        );
    }

    #[test]
    fn test_compatibility_ignores_unpublished_ports() {
        let mut saved = PortMap::new();
        saved.insert(
            "80/tcp".into(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("8080".into()),
            }]),
        );
        let mut current = saved.clone();
        current.insert("443/tcp".into(), None);

        let a = LaunchConfig {
            port_bindings: Some(saved),
            ..Default::default()
        };
        let b = LaunchConfig {
            port_bindings: Some(current),
            restart_policy: Some(RestartPolicy {
                name: Some(String::new()),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        assert!(a.is_compatible_with(&b));

        let c = LaunchConfig {
            links: Some(vec!["/db:/web/db".into()]),
            ..Default::default()
        };
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn test_launch_config_preserves_unknown_keys() {
        let json = r#"{"Links":null,"Binds":["/srv:/srv"],"NetworkMode":"default"}"#;
        let config: LaunchConfig = serde_json::from_str(json).unwrap();
        assert!(config.links.is_none());
        assert_eq!(config.other["NetworkMode"], "default");

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["Binds"][0], "/srv:/srv");
        assert!(back.get("Links").is_none());
    }
}
