//! Docker Engine implementation of the container runtime
//!
//! Talks to the daemon through `bollard`. Inspect responses are mapped onto
//! [`ContainerRef`]; the host config goes through `serde_json` so keys
//! dockfw does not model survive a save/start cycle.

use crate::core::container::{ContainerRef, ContainerRuntime, ExecOutput, LaunchConfig, PortMap};
use crate::core::error::{Error, Result};
use bollard::Docker;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StartContainerOptions, UpdateContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerInspectResponse;
use futures_util::stream::StreamExt;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Default connect/request timeout, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
}

fn api_error(context: &str, id: &str, e: bollard::errors::Error) -> Error {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::ContainerNotFound(id.to_string()),
        e => Error::Runtime(format!("{context} {id} failed: {e}")),
    }
}

/// Primary IPv4 address: the default bridge address, else the first network
/// that has one.
fn primary_ipv4(details: &ContainerInspectResponse) -> Option<Ipv4Addr> {
    let settings = details.network_settings.as_ref()?;

    let default = settings.ip_address.as_deref().filter(|ip| !ip.is_empty());
    let from_networks = || {
        let networks = settings.networks.as_ref()?;
        let mut names: Vec<&String> = networks.keys().collect();
        names.sort();
        names.into_iter().find_map(|name| {
            networks[name]
                .ip_address
                .as_deref()
                .filter(|ip| !ip.is_empty())
        })
    };

    default.or_else(from_networks)?.parse().ok()
}

fn to_container_ref(details: ContainerInspectResponse) -> Result<ContainerRef> {
    let ipv4 = primary_ipv4(&details);

    let id = details
        .id
        .ok_or_else(|| Error::Runtime("inspect response without container id".into()))?;
    let name = details
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let (running, paused) = details
        .state
        .map(|s| (s.running.unwrap_or(false), s.paused.unwrap_or(false)))
        .unwrap_or_default();

    let launch_config: LaunchConfig = match details.host_config {
        Some(host_config) => serde_json::from_value(serde_json::to_value(host_config)?)?,
        None => LaunchConfig::default(),
    };
    let network_ports: PortMap = match details.network_settings.and_then(|s| s.ports) {
        Some(ports) => serde_json::from_value(serde_json::to_value(ports)?)?,
        None => PortMap::new(),
    };

    Ok(ContainerRef {
        id,
        name,
        ipv4: if running { ipv4 } else { None },
        running,
        paused,
        launch_config,
        network_ports,
    })
}

impl DockerRuntime {
    /// Connects to `socket`, or to the local defaults (`DOCKER_HOST` or the
    /// unix socket) when none is given.
    ///
    /// # Errors
    ///
    /// Returns `Error::Runtime` if the client cannot be set up.
    pub fn connect(socket: Option<&str>, timeout_secs: u64) -> Result<Self> {
        let docker = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults()
                .map(|d| d.with_timeout(std::time::Duration::from_secs(timeout_secs))),
        }
        .map_err(|e| Error::Runtime(format!("failed to connect to docker: {e}")))?;

        Ok(Self { docker })
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::Runtime(format!("Cannot connect to the Docker daemon: {e}")))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRef> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| api_error("inspect", id, e))?;
        to_container_ref(details)
    }

    async fn list_all(&self) -> Result<Vec<ContainerRef>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Runtime(format!("list containers failed: {e}")))?;

        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            match self.inspect(&id).await {
                Ok(container) => containers.push(container),
                // Removed between listing and inspecting
                Err(Error::ContainerNotFound(_)) => debug!("{} vanished during listing", id),
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    async fn start(&self, id: &str, config: &LaunchConfig) -> Result<()> {
        if let Some(policy) = &config.restart_policy {
            let restart_policy = serde_json::from_value(serde_json::to_value(policy)?)?;
            self.docker
                .update_container(
                    id,
                    UpdateContainerOptions::<String> {
                        restart_policy: Some(restart_policy),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| api_error("update", id, e))?;
        }

        if !config.links().is_empty() || config.port_bindings.is_some() {
            debug!("Links and port bindings of {} come from its creation", id);
        }

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| api_error("start", id, e))?;
        info!("Container {} started", id);
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| api_error("pause", id, e))
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| api_error("unpause", id, e))
    }

    async fn exec_capture(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| api_error("exec in", id, e))?;

        let mut output = ExecOutput::default();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| api_error("exec in", id, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(|e| api_error("exec in", id, e))? {
                        bollard::container::LogOutput::StdOut { message } => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                warn!("exec in {} unexpectedly detached", id);
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| api_error("exec in", id, e))?;
        output.exit_code = inspected.exit_code.unwrap_or(-1);
        Ok(output)
    }
}
