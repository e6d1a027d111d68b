//! Dependency-ordered container start
//!
//! Links and volumes-from edges reported by the runtime decide the order.
//! Stopped containers are started from their saved launch configuration,
//! then host configs are re-checked, hosts overlays re-applied and the
//! recorded rules replayed.

use crate::audit::EventType;
use crate::core::backend::FirewallBackend;
use crate::core::container::{ContainerRef, ContainerRuntime, Link, volume_source};
use crate::core::error::{Error, Result};
use crate::core::graph::DependencyGraph;
use crate::core::replay::ReplayReport;
use crate::core::session::Session;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Container names in start order, dependencies included
    pub order: Vec<String>,
    /// Containers that were not running and got started
    pub started: Vec<String>,
    pub replay: ReplayReport,
}

#[derive(Debug, Default, Clone, Copy)]
struct Driven {
    started: bool,
    paused: bool,
}

/// Names of the containers `container` links to or takes volumes from
fn dependencies_of(container: &ContainerRef) -> Result<Vec<String>> {
    let mut dependencies = Vec::new();
    for raw in container.links() {
        dependencies.push(Link::parse(raw, &container.name)?.dependency);
    }
    for entry in container.volumes_from() {
        dependencies.push(volume_source(entry).to_string());
    }
    Ok(dependencies)
}

impl<R: ContainerRuntime, F: FirewallBackend> Session<R, F> {
    /// `start`: starts `ids` and their dependencies in dependency order.
    ///
    /// Dependencies outside `ids` are [`Error::MissingDependency`] unless
    /// `pull_dependencies` is set. In dry-run only the order is computed.
    pub async fn start_containers(
        &mut self,
        ids: &[String],
        paused: bool,
        pull_dependencies: bool,
        dry_run: bool,
    ) -> Result<StartReport> {
        let mut graph = DependencyGraph::new();
        let mut normalized = Vec::with_capacity(ids.len());
        for id in ids {
            let container = self.cache.lookup(id, false).await?;
            graph.add_node(&container.id);
            normalized.push(container.id.clone());
        }

        let mut pending: VecDeque<String> = normalized.iter().cloned().collect();
        let mut visited = HashSet::new();
        while let Some(id) = pending.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }

            let container = self.cache.lookup(&id, false).await?;
            for name in dependencies_of(&container)? {
                let dependency = self.cache.lookup(&name, false).await?;
                if !graph.contains(&dependency.id) {
                    if !pull_dependencies {
                        return Err(Error::MissingDependency {
                            dependent: container.name.clone(),
                            dependency: dependency.name.clone(),
                        });
                    }
                    info!("Pulling in {} (needed by {})", dependency.name, container.name);
                    pending.push_back(dependency.id.clone());
                }
                graph.add_edge(&dependency.id, &container.id);
            }
        }

        let order = graph.sorted()?;
        let mut report = StartReport::default();
        for id in &order {
            report.order.push(self.cache.lookup(id, false).await?.name.clone());
        }

        if dry_run {
            return Ok(report);
        }

        for (id, name) in order.iter().zip(&report.order) {
            let driven = self.drive(id, paused).await?;
            if driven.started {
                report.started.push(name.clone());
            }
            if driven.started || driven.paused {
                let container = self.cache.refresh(id).await?;
                debug!(
                    "{} is now running={} paused={}",
                    container.name, container.running, container.paused
                );
            }
        }

        self.backup_host_config(&normalized, true, true).await?;
        for id in &normalized {
            self.reapply_custom_hosts(id).await?;
        }
        for id in &normalized {
            let replayed = self.replay(std::slice::from_ref(id), false).await?;
            report.replay.changed |= replayed.changed;
            report.replay.operations.extend(replayed.operations);
            report.replay.diffs.extend(replayed.diffs);
        }

        Ok(report)
    }

    /// Starts and/or pauses one container.
    async fn drive(&mut self, id: &str, paused: bool) -> Result<Driven> {
        let container = self.cache.lookup(id, false).await?;
        let mut driven = Driven::default();

        if !container.running {
            let saved = self
                .store
                .load_host_config(&container.id)
                .await?
                .ok_or_else(|| Error::MissingLaunchConfig(container.name.clone()))?;
            let config = saved.prepared_for_start(&container.name)?;

            let result = self.cache.runtime().start(&container.id, &config).await;
            self.audit(
                EventType::StartContainer,
                serde_json::json!({ "container": container.name }),
                &result,
            )
            .await;
            result?;

            info!("Started {}", container.name);
            driven.started = true;
        }

        if paused && !container.paused {
            let result = self.cache.runtime().pause(&container.id).await;
            self.audit(
                EventType::PauseContainer,
                serde_json::json!({ "container": container.name }),
                &result,
            )
            .await;
            result?;

            info!("Paused {}", container.name);
            driven.paused = true;
        }

        Ok(driven)
    }
}
