//! Replay of recorded rules
//!
//! Aliased endpoints are re-resolved against the current container state,
//! stale rule texts are removed and missing ones applied. Deleting a stale
//! rule is advisory: the existence check that follows decides what gets
//! applied, so a failed delete never fails the replay.

use crate::core::address::Resolver;
use crate::core::backend::FirewallBackend;
use crate::core::container::{ContainerRef, ContainerRuntime};
use crate::core::error::Result;
use crate::core::rule::{ActiveRule, Endpoint, Placement};
use crate::core::session::Session;
use std::fmt;
use tracing::{debug, info, warn};

/// A backend mutation replay performs, or would perform in dry-run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOperation {
    /// Chain-prefixed text of a stale rule
    Delete(String),
    Apply(ActiveRule),
}

impl fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete(text) => write!(f, "-D {text}"),
            Self::Apply(rule) => match rule.kind.placement() {
                Placement::Insert(position) => {
                    write!(f, "-I {} {position} {}", rule.chain(), rule.spec())
                }
                Placement::Append => write!(f, "-A {} {}", rule.chain(), rule.spec()),
            },
        }
    }
}

/// Rule lines of one container before and after re-resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDiff {
    pub container: String,
    pub unified: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// At least one delete, insert or append was (or would be) issued
    pub changed: bool,
    pub operations: Vec<PlannedOperation>,
    /// Only containers whose recorded addresses moved
    pub diffs: Vec<RuleDiff>,
}

impl ReplayReport {
    fn plan(&mut self, operation: PlannedOperation) {
        self.changed = true;
        self.operations.push(operation);
    }
}

fn unified_diff(container: &str, before: &str, after: &str) -> String {
    similar::TextDiff::from_lines(before, after)
        .unified_diff()
        .header(
            &format!("{container} (recorded)"),
            &format!("{container} (current)"),
        )
        .to_string()
}

impl<R: ContainerRuntime, F: FirewallBackend> Session<R, F> {
    /// `replay`: brings the backend in line with the recorded rules of `ids`.
    ///
    /// In dry-run nothing is mutated and nothing is saved; the report lists
    /// what a live run would do.
    pub async fn replay(&mut self, ids: &[String], dry_run: bool) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for id in ids {
            self.replay_container(id, dry_run, &mut report).await?;
        }
        Ok(report)
    }

    async fn replay_container(
        &mut self,
        id: &str,
        dry_run: bool,
        report: &mut ReplayReport,
    ) -> Result<()> {
        let container = self.cache.lookup(id, false).await?;
        let mut collection = self.store.load_rules(&container.id).await?;
        if collection.is_empty() {
            debug!("No rules recorded for {}", container.name);
            return Ok(());
        }
        container.online_ipv4()?;

        let before = collection.to_text();
        let mut addresses_changed = false;

        for index in 0..collection.len() {
            let recorded = collection.rules()[index].clone();
            let current = self.reresolve(&recorded, &container).await?;
            let moved = current != recorded;

            if moved {
                addresses_changed = true;
                collection.rules_mut()[index] = current.clone();

                let stale = recorded.format();
                if self.backend.exists(&stale).await? {
                    report.plan(PlannedOperation::Delete(stale.clone()));
                    if !dry_run && let Err(e) = self.delete(&stale, true).await {
                        warn!("Could not remove stale rule {}: {}", stale, e);
                    }
                }
            }

            if !self.backend.exists(&current.format()).await? {
                report.plan(PlannedOperation::Apply(current.clone()));
                if !dry_run {
                    self.apply(&current).await?;
                }
            }
        }

        if addresses_changed {
            report.diffs.push(RuleDiff {
                container: container.name.clone(),
                unified: unified_diff(&container.name, &before, &collection.to_text()),
            });
            if !dry_run {
                self.store.save_rules(&collection).await?;
                info!("Updated recorded addresses of {}", container.name);
            }
        }
        Ok(())
    }

    /// `rule` with every aliased endpoint moved to its current address.
    async fn reresolve(&mut self, rule: &ActiveRule, owner: &ContainerRef) -> Result<ActiveRule> {
        let mut current = rule.clone();
        current.rule.source = self.reresolve_endpoint(&rule.rule.source, owner).await?;
        current.rule.destination = self
            .reresolve_endpoint(&rule.rule.destination, owner)
            .await?;
        Ok(current)
    }

    async fn reresolve_endpoint(
        &mut self,
        endpoint: &Endpoint,
        owner: &ContainerRef,
    ) -> Result<Endpoint> {
        let Some(alias) = endpoint.alias.as_deref() else {
            return Ok(endpoint.clone());
        };

        let bridge = self.bridge.clone();
        let resolved = Resolver::new(&bridge)
            .resolve_alias(&mut self.cache, alias, owner)
            .await?;

        Ok(Endpoint {
            address: resolved.address,
            alias: endpoint.alias.clone(),
        })
    }
}
