//! Packet-filter backend seam
//!
//! Rule texts passed here are the canonical forms produced by
//! [`ActiveRule`](crate::core::rule::ActiveRule): `exists` and `delete` take the
//! chain-prefixed form, `insert` and `append` take the chain separately.

use crate::core::error::Result;

/// Packet-filter operations consumed by dockfw.
///
/// Non-zero exit statuses surface as [`Error::Firewall`](crate::Error::Firewall).
#[allow(async_fn_in_trait)]
pub trait FirewallBackend {
    /// `iptables -C`: whether the rule is currently installed.
    async fn exists(&self, rule: &str) -> Result<bool>;

    /// `iptables -I <chain> <position>`.
    async fn insert(&self, chain: &str, position: u32, rule: &str) -> Result<()>;

    /// `iptables -A <chain>`.
    async fn append(&self, chain: &str, rule: &str) -> Result<()>;

    /// `iptables -D`. `quiet` suppresses logging of a failure.
    async fn delete(&self, rule: &str, quiet: bool) -> Result<()>;
}
