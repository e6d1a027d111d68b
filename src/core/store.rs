//! Per-container persisted state
//!
//! Three independent JSON files live in each container's state directory
//! (`<state_dir>/<full id>/`):
//!
//! - `extraRules.json`: the container's [`RuleCollection`]
//! - `backupHostConfig.json`: the last saved [`LaunchConfig`]
//! - `customHosts.json`: names of containers injected into its `/etc/hosts`
//!
//! A missing file means nothing was recorded yet. Every save rewrites the
//! whole file through a temp file and an atomic rename.

use crate::core::container::LaunchConfig;
use crate::core::error::{Error, Result};
use crate::core::rule::ActiveRule;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RULES_FILE: &str = "extraRules.json";
pub const HOST_CONFIG_FILE: &str = "backupHostConfig.json";
pub const CUSTOM_HOSTS_FILE: &str = "customHosts.json";

/// Outcome of [`RuleCollection::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Added,
    AlreadyTracked,
}

/// Ordered rules owned by one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCollection {
    #[serde(skip)]
    pub container_id: String,
    #[serde(rename = "Rules", default)]
    rules: Vec<ActiveRule>,
}

impl RuleCollection {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            rules: Vec::new(),
        }
    }

    /// Adds `rule` unless an identical rule (text and aliases) is present.
    pub fn append(&mut self, rule: ActiveRule) -> AppendOutcome {
        if self.rules.iter().any(|r| r.is_same_rule(&rule)) {
            return AppendOutcome::AlreadyTracked;
        }
        self.rules.push(rule);
        AppendOutcome::Added
    }

    pub fn rules(&self) -> &[ActiveRule] {
        &self.rules
    }

    pub(crate) fn rules_mut(&mut self) -> &mut [ActiveRule] {
        &mut self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// One canonical rule per line, as used in dry-run diffs
    pub fn to_text(&self) -> String {
        self.rules
            .iter()
            .map(|r| format!("{}\n", r.format()))
            .collect()
    }
}

/// File-backed state root
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return Err(Error::Internal(format!(
                "refusing to use {id:?} as a state directory name"
            )));
        }
        Ok(self.root.join(id))
    }

    pub async fn load_rules(&self, id: &str) -> Result<RuleCollection> {
        let mut collection: RuleCollection = self
            .read_json(id, RULES_FILE)
            .await?
            .unwrap_or_default();
        collection.container_id = id.to_string();
        Ok(collection)
    }

    pub async fn save_rules(&self, collection: &RuleCollection) -> Result<()> {
        self.write_json(&collection.container_id, RULES_FILE, collection)
            .await
    }

    /// Deletes the rule file. A file that is already gone is an error.
    pub async fn remove_rules(&self, id: &str) -> Result<()> {
        let path = self.container_dir(id)?.join(RULES_FILE);
        tokio::fs::remove_file(&path).await?;
        debug!("Removed {}", path.display());
        Ok(())
    }

    pub async fn load_host_config(&self, id: &str) -> Result<Option<LaunchConfig>> {
        self.read_json(id, HOST_CONFIG_FILE).await
    }

    pub async fn save_host_config(&self, id: &str, config: &LaunchConfig) -> Result<()> {
        self.write_json(id, HOST_CONFIG_FILE, config).await
    }

    pub async fn load_custom_hosts(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .read_json(id, CUSTOM_HOSTS_FILE)
            .await?
            .unwrap_or_default())
    }

    pub async fn save_custom_hosts(&self, id: &str, names: &[String]) -> Result<()> {
        self.write_json(id, CUSTOM_HOSTS_FILE, &names).await
    }

    async fn read_json<T: DeserializeOwned>(&self, id: &str, file: &str) -> Result<Option<T>> {
        let path = self.container_dir(id)?.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic write: temp file with 0o600, fsync, rename over the target.
    async fn write_json<T: Serialize + ?Sized>(&self, id: &str, file: &str, value: &T) -> Result<()> {
        let dir = self.container_dir(id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_string_pretty(value)?;
        let path = dir.join(file);
        let temp_path = dir.join(format!("{file}.tmp"));

        {
            use tokio::io::AsyncWriteExt;

            let mut options = tokio::fs::OpenOptions::new();
            options.create(true).write(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut handle = options.open(&temp_path).await?;
            handle.write_all(json.as_bytes()).await?;
            handle.sync_all().await?;
        }

        tokio::fs::rename(&temp_path, &path).await.map_err(|e| {
            if e.kind() == ErrorKind::StorageFull {
                std::io::Error::new(
                    ErrorKind::StorageFull,
                    format!("Disk full: cannot save {}", path.display()),
                )
            } else {
                e
            }
        })?;

        debug!("Saved {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::container::RestartPolicy;
    use crate::core::rule::RuleKind;
    use crate::core::test_helpers::{CONTAINER_ID, forward_rule};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_files_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        let rules = store.load_rules(CONTAINER_ID).await.unwrap();
        assert!(rules.is_empty());
        assert_eq!(rules.container_id, CONTAINER_ID);
        assert!(store.load_host_config(CONTAINER_ID).await.unwrap().is_none());
        assert!(store.load_custom_hosts(CONTAINER_ID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rules_save_load_roundtrip_keeps_order() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        let mut rules = RuleCollection::new(CONTAINER_ID);
        rules.append(forward_rule("10.0.0.9", Some("db"), "10.0.0.5", 8080));
        rules.append(forward_rule("8.8.8.8", None, "10.0.0.5", 53));
        let mut internal = forward_rule("10.0.0.7", Some("cache"), "10.0.0.5", 6379);
        internal.kind = RuleKind::Internal;
        rules.append(internal);

        store.save_rules(&rules).await.unwrap();
        let loaded = store.load_rules(CONTAINER_ID).await.unwrap();
        assert_eq!(loaded, rules);

        let raw = std::fs::read_to_string(dir.path().join(CONTAINER_ID).join(RULES_FILE)).unwrap();
        assert!(raw.contains("\"Rules\""));
    }

    #[tokio::test]
    async fn test_saved_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store
            .save_custom_hosts(CONTAINER_ID, &["db".to_string()])
            .await
            .unwrap();

        let meta =
            std::fs::metadata(dir.path().join(CONTAINER_ID).join(CUSTOM_HOSTS_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert!(!dir.path().join(CONTAINER_ID).join("customHosts.json.tmp").exists());
    }

    #[test]
    fn test_append_dedup() {
        let mut rules = RuleCollection::new(CONTAINER_ID);
        let rule = forward_rule("10.0.0.9", Some("db"), "10.0.0.5", 8080);

        assert_eq!(rules.append(rule.clone()), AppendOutcome::Added);
        assert_eq!(rules.append(rule), AppendOutcome::AlreadyTracked);
        assert_eq!(rules.len(), 1);

        // Same text, different alias: a distinct rule
        let renamed = forward_rule("10.0.0.9", Some("db2"), "10.0.0.5", 8080);
        assert_eq!(rules.append(renamed), AppendOutcome::Added);
        assert_eq!(rules.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut rules = RuleCollection::new(CONTAINER_ID);
        rules.append(forward_rule("10.0.0.9", Some("db"), "10.0.0.5", 8080));
        store.save_rules(&rules).await.unwrap();

        store.remove_rules(CONTAINER_ID).await.unwrap();
        assert!(store.load_rules(CONTAINER_ID).await.unwrap().is_empty());

        // Removing an absent file does not silently succeed
        assert!(store.remove_rules(CONTAINER_ID).await.is_err());
    }

    #[tokio::test]
    async fn test_host_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut config = LaunchConfig {
            links: Some(vec!["/db:/web/db".into()]),
            restart_policy: Some(RestartPolicy {
                name: Some("always".into()),
                maximum_retry_count: Some(0),
            }),
            ..Default::default()
        };
        config
            .other
            .insert("Privileged".into(), serde_json::Value::Bool(false));

        store.save_host_config(CONTAINER_ID, &config).await.unwrap();
        assert_eq!(
            store.load_host_config(CONTAINER_ID).await.unwrap(),
            Some(config)
        );
    }

    #[test]
    fn test_container_dir_rejects_traversal() {
        let store = StateStore::new("/var/lib/docker/containers");
        assert!(store.container_dir("../etc").is_err());
        assert!(store.container_dir("").is_err());
        assert!(store.container_dir("abc/def").is_err());
        assert_eq!(
            store.container_dir("abc123").unwrap(),
            PathBuf::from("/var/lib/docker/containers/abc123")
        );
    }

    #[tokio::test]
    async fn test_reads_docker_fw_rule_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONTAINER_ID);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join(RULES_FILE),
            r#"{"Rules":[{"Source":"10.0.0.9/32","SourceAlias":"db","SourcePort":0,
                "Destination":"10.0.0.5/32","DestinationAlias":".","DestinationPort":5432,
                "Protocol":"tcp","Filter":"","Chain":"DOCKER","JumpTo":"ACCEPT"}]}"#,
        )
        .unwrap();

        let store = StateStore::new(dir.path());
        let rules = store.load_rules(CONTAINER_ID).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules()[0].kind, RuleKind::Internal);
    }
}
