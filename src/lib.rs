//! dockfw - persistent firewall rules for Docker containers
//!
//! Rules are written against container names. dockfw resolves them to the
//! containers' current addresses, installs them with iptables and keeps
//! them next to Docker's own container state so they can be replayed when
//! addresses change.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, resolution, persistence, replay and ordered start
//! - [`docker`] - Docker Engine implementation of the container runtime
//! - [`iptables`] - iptables implementation of the firewall backend
//! - [`elevation`] - Privilege escalation for iptables
//! - [`audit`] - Audit log of every firewall and container mutation
//! - [`validators`] - Input validation
//! - [`config`] - Configuration loading
//! - [`utils`] - XDG directories and interface discovery

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod docker;
pub mod elevation;
pub mod iptables;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::replay::ReplayReport;
pub use core::rule::{ActiveRule, Protocol, Rule, RuleKind};
pub use core::session::{RuleRequest, Session};
pub use core::start::StartReport;
