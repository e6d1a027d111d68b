//! Endpoint resolution
//!
//! Turns what the user typed for `--source`/`--destination` into an address
//! plus an alias. Containers other than the owner are remembered by name and
//! the owner itself by [`SELF_MARKER`], so that replay can re-resolve them
//! after addresses change.

use crate::core::cache::ContainerCache;
use crate::core::container::{ContainerRef, ContainerRuntime};
use crate::core::error::{Error, Result};
use crate::core::rule::{Endpoint, HOST_MARKER, SELF_MARKER};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Docker bridge parameters used for resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeNetwork {
    pub interface: String,
    /// Address the host marker resolves to
    pub gateway: Ipv4Addr,
    /// Addresses Docker hands out to containers
    pub subnet: Ipv4Network,
}

impl Default for BridgeNetwork {
    fn default() -> Self {
        Self {
            interface: "docker0".to_string(),
            gateway: Ipv4Addr::new(172, 17, 42, 1),
            subnet: Ipv4Network::new(Ipv4Addr::new(172, 16, 0, 0), 12)
                .unwrap_or_else(|_| unreachable!("/12 is a valid prefix")),
        }
    }
}

impl BridgeNetwork {
    pub fn contains(&self, address: Ipv4Network) -> bool {
        self.subnet.contains(address.ip())
    }
}

/// What the user wrote for one side of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSpec {
    SelfRef,
    Host,
    Literal(Ipv4Network),
    Container(String),
}

impl FromStr for EndpointSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "" => Err(Error::validation("endpoint", "empty address")),
            SELF_MARKER => Ok(Self::SelfRef),
            HOST_MARKER => Ok(Self::Host),
            _ if looks_like_ipv4(s) => Ipv4Network::from_str(s)
                .map(Self::Literal)
                .map_err(|e| Error::Address(format!("invalid IPv4 address {s}: {e}"))),
            _ => Ok(Self::Container(s.to_string())),
        }
    }
}

/// `a.b.c.d` with an optional `/nn`; anything else is a container reference
fn looks_like_ipv4(s: &str) -> bool {
    let (ip, prefix) = s.split_once('/').unwrap_or((s, ""));
    let octets: Vec<&str> = ip.split('.').collect();

    octets.len() == 4
        && octets
            .iter()
            .all(|o| !o.is_empty() && o.len() <= 3 && o.bytes().all(|b| b.is_ascii_digit()))
        && prefix.len() <= 2
        && prefix.bytes().all(|b| b.is_ascii_digit())
        && !(s.contains('/') && prefix.is_empty())
}

/// Alias for `found` as seen from `owner`
pub fn self_reduce(found: &ContainerRef, owner: &ContainerRef) -> String {
    if found.id == owner.id {
        SELF_MARKER.to_string()
    } else {
        found.name.clone()
    }
}

fn host_network(address: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(address)
}

/// Resolves endpoint specs against the container cache.
pub struct Resolver<'a> {
    pub bridge: &'a BridgeNetwork,
}

impl<'a> Resolver<'a> {
    pub fn new(bridge: &'a BridgeNetwork) -> Self {
        Self { bridge }
    }

    /// Resolves `spec` for a rule owned by `owner`.
    ///
    /// Bridge addresses typed as `/32` literals are refused unless
    /// `allow_reverse_lookup` is set, in which case they must belong to a
    /// known container.
    pub async fn resolve<R: ContainerRuntime>(
        &self,
        cache: &mut ContainerCache<R>,
        spec: &EndpointSpec,
        owner: &ContainerRef,
        allow_reverse_lookup: bool,
    ) -> Result<Endpoint> {
        match spec {
            EndpointSpec::SelfRef => Ok(Endpoint::aliased(
                host_network(owner.online_ipv4()?),
                SELF_MARKER,
            )),
            EndpointSpec::Host => Ok(Endpoint::aliased(
                host_network(self.bridge.gateway),
                HOST_MARKER,
            )),
            EndpointSpec::Literal(network) => {
                if network.prefix() != 32 || !self.bridge.contains(*network) {
                    return Ok(Endpoint::literal(*network));
                }

                if !allow_reverse_lookup {
                    return Err(Error::Address(format!(
                        "{network} is a Docker bridge address: refer to the container by name \
                         (or '.' for itself), or pass --rev-lookup"
                    )));
                }

                cache.load_all().await?;
                let found = cache.find_by_address(network.ip())?;
                Ok(Endpoint::aliased(*network, self_reduce(&found, owner)))
            }
            EndpointSpec::Container(name) => {
                let found = cache.lookup(name, true).await?;
                Ok(Endpoint::aliased(
                    host_network(found.online_ipv4()?),
                    self_reduce(&found, owner),
                ))
            }
        }
    }

    /// Re-resolves a stored alias against the current cache.
    pub async fn resolve_alias<R: ContainerRuntime>(
        &self,
        cache: &mut ContainerCache<R>,
        alias: &str,
        owner: &ContainerRef,
    ) -> Result<Endpoint> {
        let spec = EndpointSpec::from_str(alias)?;
        self.resolve(cache, &spec, owner, false).await
    }
}
