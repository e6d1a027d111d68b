//! Container metadata cache
//!
//! One record per container, keyed by full id. Every other key (name, short
//! id, whatever the caller asked for) lives in the alias index and points at
//! a full id, so refreshing a record never leaves an alias behind on stale
//! data. The address index is only kept once [`ContainerCache::load_all`]
//! has run, because only then is it exhaustive enough to answer reverse
//! lookups.

use crate::core::container::{ContainerRef, ContainerRuntime};
use crate::core::error::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

pub struct ContainerCache<R> {
    runtime: R,
    records: HashMap<String, Arc<ContainerRef>>,
    aliases: HashMap<String, String>,
    by_address: HashMap<Ipv4Addr, String>,
    loaded_all: bool,
}

impl<R: ContainerRuntime> ContainerCache<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            records: HashMap::new(),
            aliases: HashMap::new(),
            by_address: HashMap::new(),
            loaded_all: false,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn is_loaded_all(&self) -> bool {
        self.loaded_all
    }

    /// Looks up a container by full id, short id or name.
    ///
    /// A miss fetches the container from the runtime, unless [`load_all`]
    /// already ran, in which case it is an authoritative
    /// [`Error::ContainerNotFound`]. With `must_be_online`, a record without
    /// an address fails with [`Error::ContainerOffline`], cached or not.
    ///
    /// [`load_all`]: ContainerCache::load_all
    pub async fn lookup(&mut self, key: &str, must_be_online: bool) -> Result<Arc<ContainerRef>> {
        let key = normalize_key(key);

        let record = if let Some(record) = self.cached(key) {
            record
        } else if self.loaded_all {
            return Err(Error::ContainerNotFound(key.to_string()));
        } else {
            self.fetch(key).await?
        };

        if must_be_online && record.ipv4.is_none() {
            return Err(Error::ContainerOffline(record.name.clone()));
        }
        Ok(record)
    }

    /// Re-fetches one container and re-points every key at the new record.
    pub async fn refresh(&mut self, key: &str) -> Result<Arc<ContainerRef>> {
        let key = normalize_key(key);
        let key = self.aliases.get(key).cloned().unwrap_or_else(|| key.to_string());
        self.fetch(&key).await
    }

    /// Populates the cache from the runtime listing. Runs once per cache.
    pub async fn load_all(&mut self) -> Result<()> {
        if self.loaded_all {
            return Ok(());
        }

        let containers = self.runtime.list_all().await?;
        debug!("Loaded {} containers from runtime", containers.len());

        self.loaded_all = true;
        for container in containers {
            self.remap(container, None);
        }
        Ok(())
    }

    /// Reverse lookup by primary address; requires [`ContainerCache::load_all`].
    pub fn find_by_address(&self, address: Ipv4Addr) -> Result<Arc<ContainerRef>> {
        if !self.loaded_all {
            return Err(Error::Internal(
                "reverse address lookup before loading all containers".into(),
            ));
        }

        self.by_address
            .get(&address)
            .and_then(|id| self.records.get(id))
            .cloned()
            .ok_or_else(|| Error::Address(format!("no container has address {address}")))
    }

    /// All cached containers, ordered by name.
    pub fn containers(&self) -> Vec<Arc<ContainerRef>> {
        let mut all: Vec<_> = self.records.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn cached(&self, key: &str) -> Option<Arc<ContainerRef>> {
        self.aliases
            .get(key)
            .and_then(|id| self.records.get(id))
            .cloned()
    }

    async fn fetch(&mut self, key: &str) -> Result<Arc<ContainerRef>> {
        debug!("Inspecting container {}", key);
        let container = self.runtime.inspect(key).await?;
        Ok(self.remap(container, Some(key)))
    }

    /// Single entry point for storing a record and its index keys.
    fn remap(&mut self, container: ContainerRef, requested: Option<&str>) -> Arc<ContainerRef> {
        let id = container.id.clone();
        let record = Arc::new(container);

        if let Some(previous) = self.records.insert(id.clone(), Arc::clone(&record)) {
            if previous.name != record.name && self.aliases.get(&previous.name) == Some(&id) {
                self.aliases.remove(&previous.name);
            }
            if let Some(old) = previous.ipv4
                && previous.ipv4 != record.ipv4
                && self.by_address.get(&old) == Some(&id)
            {
                self.by_address.remove(&old);
            }
        }

        let mut keys = vec![
            id.clone(),
            record.name.clone(),
            record.short_id().to_string(),
        ];
        if let Some(requested) = requested {
            keys.push(requested.to_string());
        }
        for key in keys {
            self.aliases.insert(key, id.clone());
        }

        if self.loaded_all
            && let Some(address) = record.ipv4
        {
            self.by_address.insert(address, id);
        }

        record
    }
}

/// Docker reports names with a leading slash; accept both spellings.
fn normalize_key(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}
