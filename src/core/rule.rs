//! Rule model and canonical text form
//!
//! A [`Rule`] is the match part of an iptables rule between two resolved
//! endpoints. An [`ActiveRule`] adds the target chain and verdict through a
//! [`RuleKind`]. The canonical text produced by [`Rule::format`] is passed
//! to iptables verbatim and doubles as the identity used for deduplication.

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// Endpoint spec meaning "the container the rule belongs to"
pub const SELF_MARKER: &str = ".";

/// Endpoint spec meaning "the Docker host (bridge gateway)"
pub const HOST_MARKER: &str = "/";

/// Docker's filter sub-chain for container traffic
pub const DOCKER_CHAIN: &str = "DOCKER";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Where a new rule goes in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// `iptables -I <chain> <position>`
    Insert(u32),
    /// `iptables -A <chain>`, keeping Docker's own DOCKER chain tail intact
    Append,
}

/// Action kind of a rule: fixes chain, verdict and placement.
///
/// This table is the only place chain/jump pairs are spelled out. Listing
/// persisted rules maps the stored pair back to its kind with
/// [`RuleKind::from_target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RuleKind {
    /// Traffic routed to a container from outside or from another container
    #[strum(serialize = "add")]
    Forward,
    /// Traffic from a container to the host itself
    #[strum(serialize = "add-input")]
    Input,
    /// Container to container traffic on the bridge
    #[strum(serialize = "add-internal")]
    Internal,
}

impl RuleKind {
    pub const ALL: [RuleKind; 3] = [Self::Forward, Self::Input, Self::Internal];

    pub const fn chain(self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Input => "INPUT",
            Self::Internal => DOCKER_CHAIN,
        }
    }

    pub const fn jump(self) -> &'static str {
        match self {
            Self::Forward => DOCKER_CHAIN,
            Self::Input => "ACCEPT",
            Self::Internal => "ACCEPT",
        }
    }

    pub const fn placement(self) -> Placement {
        match self {
            Self::Forward => Placement::Insert(1),
            Self::Input => Placement::Insert(1),
            Self::Internal => Placement::Append,
        }
    }

    /// CLI action that creates rules of this kind
    pub const fn action(self) -> &'static str {
        match self {
            Self::Forward => "add",
            Self::Input => "add-input",
            Self::Internal => "add-internal",
        }
    }

    pub fn from_target(chain: &str, jump: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.chain() == chain && kind.jump() == jump)
    }
}

/// A resolved endpoint: address plus the alias it was derived from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: Ipv4Network,
    /// [`SELF_MARKER`], [`HOST_MARKER`] or a container name; `None` for literals
    pub alias: Option<String>,
}

impl Endpoint {
    pub fn literal(address: Ipv4Network) -> Self {
        Self {
            address,
            alias: None,
        }
    }

    pub fn aliased(address: Ipv4Network, alias: impl Into<String>) -> Self {
        Self {
            address,
            alias: Some(alias.into()),
        }
    }

    pub fn is_self(&self) -> bool {
        self.alias.as_deref() == Some(SELF_MARKER)
    }

    /// Text used to recreate the endpoint on the command line
    pub fn spec(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub source: Endpoint,
    /// 0 when unspecified
    pub source_port: u16,
    pub destination: Endpoint,
    /// 0 when unspecified
    pub destination_port: u16,
    pub protocol: Protocol,
    /// Extra iptables match expression, may be empty
    pub filter: String,
}

impl Rule {
    /// Canonical text: `-s <src> -d <dst> [<filter>] -p <proto> -m <proto> [--dport N] [--sport N]`
    pub fn format(&self) -> String {
        let mut text = format!("-s {} -d {}", self.source.address, self.destination.address);

        let filter = self.filter.trim();
        if !filter.is_empty() {
            text.push(' ');
            text.push_str(filter);
        }

        let proto = self.protocol.as_str();
        text.push_str(&format!(" -p {proto} -m {proto}"));

        if self.destination_port != 0 {
            text.push_str(&format!(" --dport {}", self.destination_port));
        }
        if self.source_port != 0 {
            text.push_str(&format!(" --sport {}", self.source_port));
        }
        text
    }

    /// Alias annotation, part of a rule's identity next to [`Rule::format`]
    pub fn aliases(&self) -> String {
        format!(
            "{}={}\n{}={}\n",
            self.destination.alias.as_deref().unwrap_or_default(),
            self.destination.address,
            self.source.alias.as_deref().unwrap_or_default(),
            self.source.address,
        )
    }

    /// Invariants for rules created directly against a container.
    pub fn check_endpoints(&self) -> Result<()> {
        if self.source.address == self.destination.address {
            return Err(Error::validation(
                "destination",
                "Cannot add rule with same source and destination",
            ));
        }

        match (self.source.is_self(), self.destination.is_self()) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err(Error::validation(
                "source",
                "source and destination cannot both refer to the container itself",
            )),
            (false, false) => Err(Error::validation(
                "destination",
                "either source or destination must be the container itself ('.')",
            )),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// A rule bound to its chain and verdict
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ActiveRuleRecord", into = "ActiveRuleRecord")]
pub struct ActiveRule {
    pub rule: Rule,
    pub kind: RuleKind,
}

impl ActiveRule {
    pub fn new(rule: Rule, kind: RuleKind) -> Self {
        Self { rule, kind }
    }

    pub fn chain(&self) -> &'static str {
        self.kind.chain()
    }

    pub fn jump(&self) -> &'static str {
        self.kind.jump()
    }

    /// Rule body with verdict, without the chain: `<rule> -j <jump>`
    pub fn spec(&self) -> String {
        format!("{} -j {}", self.rule.format(), self.jump())
    }

    /// Chain-prefixed canonical text: `<chain> <rule> -j <jump>`
    pub fn format(&self) -> String {
        format!("{} {}", self.chain(), self.spec())
    }

    /// Same canonical form and same alias annotations
    pub fn is_same_rule(&self, other: &ActiveRule) -> bool {
        self.format() == other.format() && self.rule.aliases() == other.rule.aliases()
    }

    /// Command line that recreates this rule
    pub fn command_line(&self, container: &str) -> String {
        let rule = &self.rule;
        let mut line = format!(
            "{} {} --source={} --dest={}",
            self.kind.action(),
            container,
            rule.source.spec(),
            rule.destination.spec()
        );
        if rule.source_port != 0 {
            line.push_str(&format!(" --sport={}", rule.source_port));
        }
        if rule.destination_port != 0 {
            line.push_str(&format!(" --dport={}", rule.destination_port));
        }
        if rule.protocol != Protocol::Tcp {
            line.push_str(&format!(" --protocol={}", rule.protocol));
        }
        if !rule.filter.trim().is_empty() {
            line.push_str(&format!(" --filter=\"{}\"", rule.filter.trim()));
        }
        line
    }
}

impl fmt::Display for ActiveRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// On-disk shape of an [`ActiveRule`] (flat, docker-fw compatible)
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ActiveRuleRecord {
    source: Ipv4Network,
    #[serde(default)]
    source_alias: String,
    #[serde(default)]
    source_port: u16,
    destination: Ipv4Network,
    #[serde(default)]
    destination_alias: String,
    #[serde(default)]
    destination_port: u16,
    #[serde(default)]
    protocol: Protocol,
    #[serde(default)]
    filter: String,
    chain: String,
    jump_to: String,
}

fn alias_from_record(alias: String) -> Option<String> {
    (!alias.is_empty()).then_some(alias)
}

impl TryFrom<ActiveRuleRecord> for ActiveRule {
    type Error = String;

    fn try_from(record: ActiveRuleRecord) -> std::result::Result<Self, Self::Error> {
        let kind = RuleKind::from_target(&record.chain, &record.jump_to).ok_or_else(|| {
            format!(
                "unrecognized chain/jump pair {}/{}",
                record.chain, record.jump_to
            )
        })?;

        Ok(Self {
            rule: Rule {
                source: Endpoint {
                    address: record.source,
                    alias: alias_from_record(record.source_alias),
                },
                source_port: record.source_port,
                destination: Endpoint {
                    address: record.destination,
                    alias: alias_from_record(record.destination_alias),
                },
                destination_port: record.destination_port,
                protocol: record.protocol,
                filter: record.filter,
            },
            kind,
        })
    }
}

impl From<ActiveRule> for ActiveRuleRecord {
    fn from(active: ActiveRule) -> Self {
        let rule = active.rule;
        Self {
            source: rule.source.address,
            source_alias: rule.source.alias.unwrap_or_default(),
            source_port: rule.source_port,
            destination: rule.destination.address,
            destination_alias: rule.destination.alias.unwrap_or_default(),
            destination_port: rule.destination_port,
            protocol: rule.protocol,
            filter: rule.filter,
            chain: active.kind.chain().to_string(),
            jump_to: active.kind.jump().to_string(),
        }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    prop_compose! {
        fn arb_endpoint()(
            octets in any::<[u8; 4]>(),
            prefix in 8u8..=32,
            alias in proptest::option::of("[a-z][a-z0-9_-]{0,12}"),
        ) -> Endpoint {
            let address = Ipv4Network::new(Ipv4Addr::from(octets), prefix)
                .expect("prefix in range");
            Endpoint { address, alias }
        }
    }

    prop_compose! {
        fn arb_active_rule()(
            source in arb_endpoint(),
            destination in arb_endpoint(),
            source_port in any::<u16>(),
            destination_port in any::<u16>(),
            protocol in prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)],
            filter in prop_oneof![Just(String::new()), Just("! -i docker0 -o docker0".to_string())],
            kind in prop_oneof![
                Just(RuleKind::Forward),
                Just(RuleKind::Input),
                Just(RuleKind::Internal),
            ],
        ) -> ActiveRule {
            ActiveRule::new(
                Rule { source, source_port, destination, destination_port, protocol, filter },
                kind,
            )
        }
    }

    proptest! {
        #[test]
        fn test_format_is_deterministic(rule in arb_active_rule()) {
            let copy = rule.clone();
            prop_assert_eq!(rule.format(), rule.format());
            prop_assert_eq!(rule.format(), copy.format());
            prop_assert!(rule.is_same_rule(&copy));
        }

        #[test]
        fn test_format_has_chain_and_verdict(rule in arb_active_rule()) {
            let text = rule.format();
            let chain_prefix = format!("{} -s ", rule.chain());
            let jump_suffix = format!(" -j {}", rule.jump());
            prop_assert!(text.starts_with(&chain_prefix));
            prop_assert!(text.ends_with(&jump_suffix));
            prop_assert!(!text.contains("  "));
        }

        #[test]
        fn test_record_roundtrip_preserves_identity(rule in arb_active_rule()) {
            let json = serde_json::to_string(&rule).unwrap();
            let back: ActiveRule = serde_json::from_str(&json).unwrap();
            prop_assert!(rule.is_same_rule(&back));
        }
    }
}
