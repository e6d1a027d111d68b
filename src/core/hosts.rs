//! Custom `/etc/hosts` overlay
//!
//! Containers connected with `add-two-ways` learn each other's current
//! address through their `/etc/hosts`. The list of injected names is
//! persisted per container and re-applied after every start, since Docker
//! regenerates the file.

use crate::audit::EventType;
use crate::core::backend::FirewallBackend;
use crate::core::container::{ContainerRef, ContainerRuntime};
use crate::core::error::{Error, Result};
use crate::core::session::Session;
use std::net::Ipv4Addr;
use tracing::{debug, info};

const HOSTS_PATH: &str = "/etc/hosts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: Ipv4Addr,
    pub name: String,
}

/// Brings `current` in line with `entries`.
///
/// Names listed with a different address are removed from their line (and
/// the line dropped once only the address is left); missing entries are
/// appended. Returns `None` when nothing changes.
pub fn rewrite_hosts(current: &str, entries: &[HostEntry]) -> Option<String> {
    let mut present = vec![false; entries.len()];
    let mut changed = false;
    let mut lines = Vec::new();

    for line in current.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let Some(address) = fields.next() else {
            continue;
        };

        let mut kept = Vec::new();
        let mut stale = false;
        for name in fields {
            match entries.iter().position(|e| e.name == name) {
                Some(i) if entries[i].address.to_string() == address => {
                    present[i] = true;
                    kept.push(name);
                }
                Some(_) => stale = true,
                None => kept.push(name),
            }
        }

        if !stale {
            lines.push(line.to_string());
            continue;
        }

        changed = true;
        if !kept.is_empty() {
            lines.push(format!("{address}\t{}", kept.join("\t")));
        }
    }

    for (entry, present) in entries.iter().zip(present) {
        if !present {
            lines.push(format!("{}\t{}", entry.address, entry.name));
            changed = true;
        }
    }

    changed.then(|| {
        let mut text = lines.join("\n");
        text.push('\n');
        text
    })
}

/// Single-quotes `s` for `sh -c`
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl<R: ContainerRuntime, F: FirewallBackend> Session<R, F> {
    /// Makes `other` resolvable by name inside `target`, and remembers it.
    pub async fn update_custom_hosts(&mut self, target: &str, other: &str) -> Result<()> {
        let target = self.cache.lookup(target, true).await?;
        let other = self.cache.lookup(other, true).await?;

        let mut names = self.store.load_custom_hosts(&target.id).await?;
        let known = names.contains(&other.name);
        if !known {
            names.push(other.name.clone());
        }

        self.write_hosts(&target, &names).await?;

        if !known {
            self.store.save_custom_hosts(&target.id, &names).await?;
        }
        Ok(())
    }

    /// Re-injects the recorded overlay of `target`, if any.
    pub async fn reapply_custom_hosts(&mut self, target: &str) -> Result<()> {
        let target = self.cache.lookup(target, false).await?;
        let names = self.store.load_custom_hosts(&target.id).await?;
        if names.is_empty() {
            return Ok(());
        }
        target.online_ipv4()?;
        self.write_hosts(&target, &names).await
    }

    /// Rewrites `/etc/hosts` of `container`, unpausing it for the duration.
    async fn write_hosts(&mut self, container: &ContainerRef, names: &[String]) -> Result<()> {
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let peer = self.cache.lookup(name, true).await?;
            entries.push(HostEntry {
                address: peer.online_ipv4()?,
                name: name.clone(),
            });
        }

        let runtime = self.cache.runtime();
        if container.paused {
            runtime.unpause(&container.id).await?;
        }

        let result = self.inject_hosts(container, &entries).await;

        if container.paused
            && let Err(pause_err) = runtime.pause(&container.id).await
        {
            return Err(match result {
                Ok(()) => pause_err,
                Err(original) => Error::Runtime(format!(
                    "{original}; additionally, re-pausing {} failed: {pause_err}",
                    container.name
                )),
            });
        }
        result
    }

    async fn inject_hosts(&self, container: &ContainerRef, entries: &[HostEntry]) -> Result<()> {
        let runtime = self.cache.runtime();

        let read = runtime
            .exec_capture(&container.id, &["cat".to_string(), HOSTS_PATH.to_string()])
            .await?;
        if read.exit_code != 0 {
            return Err(Error::Runtime(format!(
                "reading {HOSTS_PATH} of {} failed: {}",
                container.name,
                read.stderr.trim()
            )));
        }

        let Some(updated) = rewrite_hosts(&read.stdout, entries) else {
            debug!("{HOSTS_PATH} of {} is up to date", container.name);
            return Ok(());
        };

        let script = format!("printf '%s' {} > {HOSTS_PATH}", shell_quote(&updated));
        let write = runtime
            .exec_capture(&container.id, &["sh".to_string(), "-c".to_string(), script])
            .await;
        let result = match write {
            Ok(output) if output.exit_code == 0 => Ok(()),
            Ok(output) => Err(Error::Runtime(format!(
                "writing {HOSTS_PATH} of {} failed: {}",
                container.name,
                output.stderr.trim()
            ))),
            Err(e) => Err(e),
        };

        self.audit(
            EventType::UpdateHosts,
            serde_json::json!({
                "container": container.name,
                "hosts": entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            }),
            &result,
        )
        .await;

        if result.is_ok() {
            info!("Updated {HOSTS_PATH} of {}", container.name);
        }
        result
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_entries()(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<[u8; 4]>(), 0..6)
        ) -> Vec<HostEntry> {
            entries
                .into_iter()
                .map(|(name, octets)| HostEntry { address: Ipv4Addr::from(octets), name })
                .collect()
        }
    }

    proptest! {
        #[test]
        fn test_rewrite_reaches_fixed_point(
            stale in arb_entries(),
            wanted in arb_entries(),
        ) {
            let initial = rewrite_hosts("127.0.0.1\tlocalhost\n", &stale)
                .unwrap_or_else(|| "127.0.0.1\tlocalhost\n".to_string());
            let updated = rewrite_hosts(&initial, &wanted).unwrap_or(initial);

            prop_assert_eq!(rewrite_hosts(&updated, &wanted), None);
            for entry in &wanted {
                let line = format!("{}\t{}", entry.address, entry.name);
                prop_assert!(updated.lines().any(|l| l == line));
            }
        }
    }
}
