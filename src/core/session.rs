//! Action surface
//!
//! A [`Session`] bundles the container cache, the firewall backend and the
//! state store for one invocation. Actions are methods on it; replay, start
//! and the hosts overlay live in their own modules as further `impl` blocks.

use crate::audit::{AuditLog, EventType};
use crate::core::address::{BridgeNetwork, EndpointSpec, Resolver};
use crate::core::backend::FirewallBackend;
use crate::core::cache::ContainerCache;
use crate::core::container::{ContainerRef, ContainerRuntime};
use crate::core::error::{Error, Result};
use crate::core::rule::{ActiveRule, Endpoint, Placement, Protocol, Rule, RuleKind, SELF_MARKER};
use crate::core::store::{AppendOutcome, RuleCollection, StateStore};
use crate::validators;
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// User input for one `add*` action, before resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRequest {
    pub source: String,
    /// 0 when unspecified
    pub source_port: u16,
    pub destination: String,
    /// 0 when unspecified
    pub destination_port: u16,
    pub protocol: Protocol,
    pub filter: String,
    /// Allow bridge `/32` literals, resolved back to their container
    pub reverse_lookup: bool,
}

impl RuleRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_destination_port(mut self, port: u16) -> Self {
        self.destination_port = port;
        self
    }

    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    fn validate(&self, destination_port_required: bool) -> Result<()> {
        validators::validate_endpoint_spec(&self.source).map_err(invalid("source"))?;
        validators::validate_endpoint_spec(&self.destination).map_err(invalid("dest"))?;
        validators::validate_filter(&self.filter).map_err(invalid("filter"))?;

        if destination_port_required && self.destination_port == 0 {
            return Err(Error::validation(
                "dport",
                "--dport is mandatory for this action",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str) -> impl Fn(String) -> Error {
    move |message| Error::validation(field, message)
}

/// Result of recording one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub rule: ActiveRule,
    /// The backend did not have the rule and it was installed now
    pub installed: bool,
    pub tracked: AppendOutcome,
}

impl AddOutcome {
    pub fn already_tracked(&self) -> bool {
        self.tracked == AppendOutcome::AlreadyTracked
    }
}

/// Rules recorded for one container, for listing
#[derive(Debug, Clone)]
pub struct ContainerRules {
    pub container: Arc<ContainerRef>,
    pub rules: RuleCollection,
}

impl ContainerRules {
    /// Command lines that recreate the rules
    pub fn command_lines(&self) -> Vec<String> {
        self.rules
            .rules()
            .iter()
            .map(|r| r.command_line(&self.container.name))
            .collect()
    }
}

pub struct Session<R, F> {
    pub(crate) cache: ContainerCache<R>,
    pub(crate) backend: F,
    pub(crate) store: StateStore,
    pub(crate) bridge: BridgeNetwork,
    pub(crate) audit: Option<AuditLog>,
}

impl<R: ContainerRuntime, F: FirewallBackend> Session<R, F> {
    pub fn new(runtime: R, backend: F, store: StateStore, bridge: BridgeNetwork) -> Self {
        Self {
            cache: ContainerCache::new(runtime),
            backend,
            store,
            bridge,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn cache(&self) -> &ContainerCache<R> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ContainerCache<R> {
        &mut self.cache
    }

    pub fn backend(&self) -> &F {
        &self.backend
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn bridge(&self) -> &BridgeNetwork {
        &self.bridge
    }

    pub(crate) async fn audit<T>(
        &self,
        event_type: EventType,
        details: serde_json::Value,
        result: &Result<T>,
    ) {
        if let Some(audit) = &self.audit {
            audit.record(event_type, details, result).await;
        }
    }

    /// Drops Docker's catch-all `FORWARD -o <bridge> -j DOCKER` rule so the
    /// per-container FORWARD rules decide. Returns whether it was present.
    pub async fn initialize_firewall(&mut self) -> Result<bool> {
        self.cache.runtime().ping().await?;

        let rule = format!("FORWARD -o {} -j DOCKER", self.bridge.interface);
        if !self.backend.exists(&rule).await? {
            debug!("{} not present", rule);
            return Ok(false);
        }

        let result = self.backend.delete(&rule, false).await;
        self.audit(
            EventType::InitializeFirewall,
            serde_json::json!({ "removed": rule }),
            &result,
        )
        .await;
        result?;

        info!("Removed {}", rule);
        Ok(true)
    }

    /// Resolves both endpoints of `request` for a rule owned by `owner`.
    pub async fn build_rule(&mut self, owner: &ContainerRef, request: &RuleRequest) -> Result<Rule> {
        let bridge = self.bridge.clone();
        let resolver = Resolver::new(&bridge);

        let source: EndpointSpec = request.source.parse()?;
        let destination: EndpointSpec = request.destination.parse()?;

        let source = resolver
            .resolve(&mut self.cache, &source, owner, request.reverse_lookup)
            .await?;
        let destination = resolver
            .resolve(&mut self.cache, &destination, owner, request.reverse_lookup)
            .await?;

        let rule = Rule {
            source,
            source_port: request.source_port,
            destination,
            destination_port: request.destination_port,
            protocol: request.protocol,
            filter: request.filter.trim().to_string(),
        };
        rule.check_endpoints()?;
        Ok(rule)
    }

    /// `add`, `add-input` and `add-internal`.
    pub async fn add_rule(
        &mut self,
        container: &str,
        request: &RuleRequest,
        kind: RuleKind,
    ) -> Result<AddOutcome> {
        validators::validate_container_id(container).map_err(invalid("container"))?;
        request.validate(kind != RuleKind::Forward)?;

        let owner = self.cache.lookup(container, true).await?;
        let rule = self.build_rule(&owner, request).await?;

        if kind == RuleKind::Forward
            && self.bridge.contains(rule.source.address)
            && self.bridge.contains(rule.destination.address)
        {
            return Err(Error::validation(
                "source",
                "Trying to add an external firewall rule for internal Docker traffic",
            ));
        }

        self.record_rule(&owner, ActiveRule::new(rule, kind)).await
    }

    /// `add-two-ways`: an internal rule plus `/etc/hosts` entries in both
    /// containers so each can reach the other by name.
    pub async fn add_two_way_sync(
        &mut self,
        container: &str,
        request: &RuleRequest,
    ) -> Result<AddOutcome> {
        validators::validate_container_id(container).map_err(invalid("container"))?;
        request.validate(true)?;

        let owner = self.cache.lookup(container, true).await?;
        let rule = self.build_rule(&owner, request).await?;

        let peer = if rule.source.is_self() {
            &rule.destination
        } else {
            &rule.source
        };
        let peer = match peer.alias.as_deref() {
            Some(name) if name != SELF_MARKER && name != crate::core::rule::HOST_MARKER => {
                name.to_string()
            }
            _ => {
                return Err(Error::validation(
                    "source",
                    "add-two-ways needs a container on the other side of the rule",
                ));
            }
        };

        let outcome = self
            .record_rule(&owner, ActiveRule::new(rule, RuleKind::Internal))
            .await?;

        self.update_custom_hosts(&owner.id, &peer).await?;
        self.update_custom_hosts(&peer, &owner.id).await?;
        Ok(outcome)
    }

    /// `allow`: lets whitelisted external addresses reach every port the
    /// container publishes on 0.0.0.0.
    pub async fn allow_external(
        &mut self,
        container: &str,
        whitelist: &[String],
    ) -> Result<Vec<AddOutcome>> {
        validators::validate_container_id(container).map_err(invalid("container"))?;
        if whitelist.is_empty() {
            return Err(Error::validation("whitelist", "no whitelist addresses specified"));
        }

        let sources = whitelist
            .iter()
            .map(|entry| match entry.parse::<EndpointSpec>()? {
                EndpointSpec::Literal(network) => Ok(network),
                _ => Err(Error::validation(
                    "whitelist",
                    format!("{entry} is not an IPv4 address"),
                )),
            })
            .collect::<Result<Vec<Ipv4Network>>>()?;

        let owner = self.cache.lookup(container, true).await?;
        let destination = Ipv4Network::from(owner.online_ipv4()?);
        let ports = published_ports(&owner)?;
        if ports.is_empty() {
            warn!("Container {} publishes no ports", owner.name);
        }

        let filter = format!("! -i {0} -o {0}", self.bridge.interface);
        let mut outcomes = Vec::new();
        for (port, protocol) in ports {
            for source in &sources {
                let rule = Rule {
                    source: Endpoint::literal(*source),
                    source_port: 0,
                    destination: Endpoint::aliased(destination, SELF_MARKER),
                    destination_port: port,
                    protocol,
                    filter: filter.clone(),
                };
                outcomes.push(
                    self.record_rule(&owner, ActiveRule::new(rule, RuleKind::Forward))
                        .await?,
                );
            }
        }
        Ok(outcomes)
    }

    /// Installs `rule` if missing, then tracks it for the owner.
    ///
    /// The rule file is only written after the backend accepted the rule.
    async fn record_rule(&mut self, owner: &ContainerRef, rule: ActiveRule) -> Result<AddOutcome> {
        let installed = self.ensure_applied(&rule).await?;

        let mut collection = self.store.load_rules(&owner.id).await?;
        let tracked = collection.append(rule.clone());
        match tracked {
            AppendOutcome::Added => self.store.save_rules(&collection).await?,
            AppendOutcome::AlreadyTracked => {
                info!("Rule already tracked for {}: {}", owner.name, rule);
            }
        }

        Ok(AddOutcome {
            rule,
            installed,
            tracked,
        })
    }

    /// Applies `rule` unless the backend already has it. Returns whether it
    /// was applied.
    pub(crate) async fn ensure_applied(&self, rule: &ActiveRule) -> Result<bool> {
        if self.backend.exists(&rule.format()).await? {
            debug!("Already present: {}", rule);
            return Ok(false);
        }
        self.apply(rule).await?;
        Ok(true)
    }

    /// Insert or append according to the rule's kind.
    pub(crate) async fn apply(&self, rule: &ActiveRule) -> Result<()> {
        let spec = rule.spec();
        let (event, result) = match rule.kind.placement() {
            Placement::Insert(position) => (
                EventType::InsertRule,
                self.backend.insert(rule.chain(), position, &spec).await,
            ),
            Placement::Append => (
                EventType::AppendRule,
                self.backend.append(rule.chain(), &spec).await,
            ),
        };
        self.audit(event, serde_json::json!({ "rule": rule.format() }), &result)
            .await;
        result
    }

    /// Deletes `rule_text` from the backend, recording the attempt.
    pub(crate) async fn delete(&self, rule_text: &str, quiet: bool) -> Result<()> {
        let result = self.backend.delete(rule_text, quiet).await;
        self.audit(
            EventType::DeleteRule,
            serde_json::json!({ "rule": rule_text }),
            &result,
        )
        .await;
        result
    }

    /// `ls`: recorded rules of the given containers, or of every container.
    pub async fn list_rules(&mut self, ids: &[String]) -> Result<Vec<ContainerRules>> {
        let containers = if ids.is_empty() {
            self.cache.load_all().await?;
            self.cache.containers()
        } else {
            let mut containers = Vec::with_capacity(ids.len());
            for id in ids {
                containers.push(self.cache.lookup(id, false).await?);
            }
            containers
        };

        let mut listing = Vec::new();
        for container in containers {
            let rules = self.store.load_rules(&container.id).await?;
            if ids.is_empty() && rules.is_empty() {
                continue;
            }
            listing.push(ContainerRules { container, rules });
        }
        Ok(listing)
    }

    /// `drop`: removes every recorded rule from the backend and forgets them.
    ///
    /// Backend deletes are best effort; the rule file is removed even when
    /// some of them fail. Containers without recorded rules are skipped and
    /// keep their files.
    pub async fn drop_rules(&mut self, ids: &[String]) -> Result<usize> {
        let mut dropped = 0;

        for id in ids {
            let container = self.cache.lookup(id, false).await?;
            let collection = self.store.load_rules(&container.id).await?;
            if collection.is_empty() {
                debug!("No rules recorded for {}", container.name);
                continue;
            }

            for rule in collection.rules() {
                let text = rule.format();
                if let Err(e) = self.delete(&text, true).await {
                    warn!("Could not remove {}: {}", text, e);
                }
            }

            let result = self.store.remove_rules(&container.id).await;
            self.audit(
                EventType::DropRules,
                serde_json::json!({ "container": container.name, "count": collection.len() }),
                &result,
            )
            .await;
            result?;

            dropped += collection.len();
            info!("Dropped {} rules of {}", collection.len(), container.name);
        }

        Ok(dropped)
    }

    /// `save-hostconfig`: snapshots the launch configuration of running
    /// containers.
    ///
    /// With `merge_network_settings` the live port mapping replaces the
    /// configured bindings, so a restart gets the same host ports. With
    /// `fail_on_change` an existing snapshot that no longer matches is
    /// [`Error::HostConfigDrift`].
    pub async fn backup_host_config(
        &mut self,
        ids: &[String],
        merge_network_settings: bool,
        fail_on_change: bool,
    ) -> Result<()> {
        for id in ids {
            let container = self.cache.lookup(id, false).await?;
            if !container.running {
                return Err(Error::ContainerNotRunning(container.name.clone()));
            }

            let mut snapshot = container.launch_config.clone();
            if merge_network_settings {
                snapshot.port_bindings = Some(container.network_ports.clone());
            }

            if fail_on_change
                && let Some(saved) = self.store.load_host_config(&container.id).await?
                && !saved.is_compatible_with(&snapshot)
            {
                return Err(Error::HostConfigDrift(container.name.clone()));
            }

            let result = self.store.save_host_config(&container.id, &snapshot).await;
            self.audit(
                EventType::SaveHostConfig,
                serde_json::json!({ "container": container.name }),
                &result,
            )
            .await;
            result?;
        }
        Ok(())
    }
}

/// Published `(private port, protocol)` pairs bound on all host addresses
fn published_ports(container: &ContainerRef) -> Result<Vec<(u16, Protocol)>> {
    let mut ports = BTreeSet::new();

    for (key, bindings) in &container.network_ports {
        let Some(bindings) = bindings.as_ref().filter(|b| !b.is_empty()) else {
            continue;
        };

        let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Runtime(format!("unexpected port key {key} on {}", container.name)))?;
        let protocol: Protocol = proto.parse().map_err(|_| {
            Error::validation(
                "allow",
                format!(
                    "Unrecognized protocol '{proto}' for port {port} of container {}",
                    container.name
                ),
            )
        })?;

        for binding in bindings {
            match binding.host_ip.as_deref().unwrap_or_default() {
                "" | "0.0.0.0" => {
                    ports.insert((port, protocol));
                }
                "::" => {}
                other => {
                    return Err(Error::validation(
                        "allow",
                        format!(
                            "Unrecognized host ip '{other}' for binding of port {port} (container {})",
                            container.name
                        ),
                    ));
                }
            }
        }
    }

    Ok(ports.into_iter().collect())
}
