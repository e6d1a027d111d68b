//! Core container firewall logic
//!
//! - [`container`]: container model and the [`container::ContainerRuntime`] seam
//! - [`backend`]: the [`backend::FirewallBackend`] seam
//! - [`rule`]: rule model and its canonical text form
//! - [`cache`]: per-invocation container metadata cache
//! - [`address`]: endpoint resolution
//! - [`store`]: per-container state files
//! - [`session`]: the action surface
//! - [`replay`]: reconciliation after address changes
//! - [`graph`] and [`start`]: dependency-ordered start
//! - [`hosts`]: `/etc/hosts` overlay inside containers

pub mod address;
pub mod backend;
pub mod cache;
pub mod container;
pub mod error;
pub mod graph;
pub mod hosts;
pub mod replay;
pub mod rule;
pub mod session;
pub mod start;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
