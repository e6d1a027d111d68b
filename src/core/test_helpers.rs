//! Shared test utilities for core module tests
//!
//! In-memory container runtime and firewall backend, plus builders for the
//! values most tests need. This module is only compiled in test mode.

use crate::core::address::BridgeNetwork;
use crate::core::backend::FirewallBackend;
use crate::core::container::{ContainerRef, ContainerRuntime, ExecOutput, LaunchConfig};
use crate::core::error::{Error, Result};
use crate::core::rule::{ActiveRule, Endpoint, Protocol, Rule, RuleKind, SELF_MARKER};
use crate::core::session::Session;
use crate::core::store::StateStore;
use ipnetwork::Ipv4Network;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;

/// Mutex for tests that need exclusive access to environment variables.
///
/// For tests that just need the mock iptables, use `setup_mock_iptables()`
/// instead; it doesn't require holding a guard.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("DOCKFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("DOCKFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static MOCK_IPTABLES_INIT: Once = Once::new();

/// Points `DOCKFW_IPTABLES_COMMAND` at `tests/mock_iptables.sh` and disables
/// elevation. Safe to call from every test; initialization happens once.
pub fn setup_mock_iptables() {
    MOCK_IPTABLES_INIT.call_once(|| {
        let mock_path = format!("{}/tests/mock_iptables.sh", env!("CARGO_MANIFEST_DIR"));
        // SAFETY: This is only called once due to Once, and only in test code.
        unsafe {
            std::env::set_var("DOCKFW_IPTABLES_COMMAND", &mock_path);
            std::env::set_var("DOCKFW_TEST_NO_ELEVATION", "1");
        }
    });
}

/// A valid container id for store tests
pub const CONTAINER_ID: &str = "4b1f0c2d9e8a7b6c5d4e3f2a1b0c9d8e7f6a5b4c3d2e1f0a9b8c7d6e5f4a3b2c";

pub fn addr(s: &str) -> Ipv4Network {
    s.parse().unwrap()
}

/// FORWARD rule from `source` to the owning container at `destination`
pub fn forward_rule(
    source: &str,
    source_alias: Option<&str>,
    destination: &str,
    destination_port: u16,
) -> ActiveRule {
    let source = match source_alias {
        Some(alias) => Endpoint::aliased(addr(source), alias),
        None => Endpoint::literal(addr(source)),
    };
    ActiveRule::new(
        Rule {
            source,
            source_port: 0,
            destination: Endpoint::aliased(addr(destination), SELF_MARKER),
            destination_port,
            protocol: Protocol::Tcp,
            filter: String::new(),
        },
        RuleKind::Forward,
    )
}

/// A container with an id derived from its name. Containers with an address
/// are running.
pub fn container(name: &str, ipv4: Option<&str>) -> ContainerRef {
    let mut id: String = name.bytes().map(|b| format!("{b:02x}")).collect();
    id.truncate(64);
    while id.len() < 64 {
        id.push('0');
    }

    ContainerRef {
        id,
        name: name.to_string(),
        ipv4: ipv4.map(|ip| ip.parse().unwrap()),
        running: ipv4.is_some(),
        paused: false,
        launch_config: LaunchConfig::default(),
        network_ports: Default::default(),
    }
}

pub fn test_session(
    runtime: MockRuntime,
    firewall: MockFirewall,
) -> (Session<MockRuntime, MockFirewall>, TempDir) {
    let dir = TempDir::new().unwrap();
    let session = Session::new(
        runtime,
        firewall,
        StateStore::new(dir.path()),
        BridgeNetwork::default(),
    );
    (session, dir)
}

const DEFAULT_HOSTS: &str = "127.0.0.1\tlocalhost\n";

#[derive(Default)]
struct RuntimeState {
    containers: Vec<ContainerRef>,
    hosts: HashMap<String, String>,
    events: Vec<(String, &'static str)>,
    started: Vec<(String, LaunchConfig)>,
    inspect_count: usize,
    list_count: usize,
    next_address: u8,
    unreachable: bool,
    failing_exec: HashSet<String>,
    failing_pause: HashSet<String>,
    failing_start: HashSet<String>,
}

impl RuntimeState {
    fn position(&self, key: &str) -> Result<usize> {
        let key = key.trim_start_matches('/');
        self.containers
            .iter()
            .position(|c| c.name == key || c.id == key || (key.len() >= 12 && c.id.starts_with(key)))
            .ok_or_else(|| Error::ContainerNotFound(key.to_string()))
    }

    fn record(&mut self, key: &str, event: &'static str) -> Result<usize> {
        let i = self.position(key)?;
        let name = self.containers[i].name.clone();
        self.events.push((name, event));
        Ok(i)
    }
}

/// In-memory container runtime. Clones share state.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, container: ContainerRef) -> Self {
        self.add(container);
        self
    }

    pub fn with_hosts_file(self, name: &str, content: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .hosts
            .insert(name.to_string(), content.to_string());
        self
    }

    /// `ping` fails as if the daemon was down
    pub fn unreachable(self) -> Self {
        self.state.lock().unwrap().unreachable = true;
        self
    }

    pub fn fail_exec(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_exec.insert(name.to_string());
        self
    }

    pub fn fail_pause(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_pause.insert(name.to_string());
        self
    }

    pub fn fail_start(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_start.insert(name.to_string());
        self
    }

    pub fn add(&self, container: ContainerRef) {
        self.state.lock().unwrap().containers.push(container);
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut ContainerRef)) {
        let mut state = self.state.lock().unwrap();
        let i = state.position(name).unwrap();
        f(&mut state.containers[i]);
    }

    pub fn set_address(&self, name: &str, ipv4: Option<&str>) {
        self.update(name, |c| {
            c.ipv4 = ipv4.map(|ip| ip.parse().unwrap());
            c.running = ipv4.is_some();
        });
    }

    pub fn inspect_count(&self) -> usize {
        self.state.lock().unwrap().inspect_count
    }

    pub fn list_count(&self) -> usize {
        self.state.lock().unwrap().list_count
    }

    pub fn hosts_file(&self, name: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .hosts
            .get(name)
            .cloned()
            .unwrap_or_else(|| DEFAULT_HOSTS.to_string())
    }

    /// Runtime operations on `name`, in call order
    pub fn events(&self, name: &str) -> Vec<&'static str> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, e)| *e)
            .collect()
    }

    pub fn exec_count(&self, name: &str) -> usize {
        self.events(name).iter().filter(|e| **e == "exec").count()
    }

    /// Names of started containers with the configuration they got, in order
    pub fn started(&self) -> Vec<(String, LaunchConfig)> {
        self.state.lock().unwrap().started.clone()
    }
}

impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(Error::Runtime("Cannot connect to the Docker daemon".into()));
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRef> {
        let mut state = self.state.lock().unwrap();
        state.inspect_count += 1;
        let i = state.position(id)?;
        Ok(state.containers[i].clone())
    }

    async fn list_all(&self) -> Result<Vec<ContainerRef>> {
        let mut state = self.state.lock().unwrap();
        state.list_count += 1;
        Ok(state.containers.clone())
    }

    async fn start(&self, id: &str, config: &LaunchConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let i = state.record(id, "start")?;
        let name = state.containers[i].name.clone();
        if state.failing_start.contains(&name) {
            return Err(Error::Runtime(format!("start of {name} failed")));
        }

        state.next_address += 1;
        let address = Ipv4Addr::new(172, 17, 1, state.next_address);
        let container = &mut state.containers[i];
        container.running = true;
        container.ipv4.get_or_insert(address);
        state.started.push((name, config.clone()));
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let i = state.record(id, "pause")?;
        let name = state.containers[i].name.clone();
        if state.failing_pause.contains(&name) {
            return Err(Error::Runtime(format!("pause of {name} failed")));
        }
        state.containers[i].paused = true;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let i = state.record(id, "unpause")?;
        state.containers[i].paused = false;
        Ok(())
    }

    async fn exec_capture(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        let i = state.record(id, "exec")?;
        let name = state.containers[i].name.clone();
        if state.failing_exec.contains(&name) {
            return Err(Error::Runtime(format!("exec failed in {name}")));
        }

        match argv {
            [cat, path] if cat == "cat" && path == "/etc/hosts" => Ok(ExecOutput {
                stdout: state
                    .hosts
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_HOSTS.to_string()),
                ..Default::default()
            }),
            [sh, flag, script] if sh == "sh" && flag == "-c" => {
                let content = script
                    .strip_prefix("printf '%s' ")
                    .and_then(|s| s.strip_suffix(" > /etc/hosts"))
                    .and_then(|s| s.strip_prefix('\''))
                    .and_then(|s| s.strip_suffix('\''))
                    .map(|s| s.replace(r"'\''", "'"));
                match content {
                    Some(content) => {
                        state.hosts.insert(name, content);
                        Ok(ExecOutput::default())
                    }
                    None => Ok(ExecOutput {
                        stderr: format!("unexpected script: {script}"),
                        exit_code: 2,
                        ..Default::default()
                    }),
                }
            }
            _ => Ok(ExecOutput {
                stderr: format!("{}: not found", argv.join(" ")),
                exit_code: 127,
                ..Default::default()
            }),
        }
    }
}

#[derive(Default)]
struct FirewallState {
    installed: Vec<String>,
    calls: Vec<String>,
    fail_inserts: bool,
    fail_deletes: bool,
}

/// In-memory firewall backend. Clones share state.
///
/// Calls are logged in iptables flag form: `-C <rule>`, `-I <chain> <pos>
/// <spec>`, `-A <chain> <spec>`, `-D <rule>`.
#[derive(Clone, Default)]
pub struct MockFirewall {
    state: Arc<Mutex<FirewallState>>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-installs a chain-prefixed rule
    pub fn with_rule(self, rule: &str) -> Self {
        self.state.lock().unwrap().installed.push(rule.to_string());
        self
    }

    pub fn fail_inserts(self) -> Self {
        self.state.lock().unwrap().fail_inserts = true;
        self
    }

    pub fn fail_deletes(self) -> Self {
        self.state.lock().unwrap().fail_deletes = true;
        self
    }

    pub fn installed(&self) -> Vec<String> {
        self.state.lock().unwrap().installed.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls other than `-C`
    pub fn mutation_count(&self) -> usize {
        self.calls().iter().filter(|c| !c.starts_with("-C ")).count()
    }
}

fn firewall_error(operation: &'static str, rule: String) -> Error {
    Error::Firewall {
        operation,
        rule,
        exit_code: Some(1),
        stderr: "iptables: Bad rule (does a matching rule exist in that chain?).".into(),
    }
}

impl FirewallBackend for MockFirewall {
    async fn exists(&self, rule: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("-C {rule}"));
        Ok(state.installed.iter().any(|r| r == rule))
    }

    async fn insert(&self, chain: &str, position: u32, rule: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("-I {chain} {position} {rule}"));
        let text = format!("{chain} {rule}");
        if state.fail_inserts {
            return Err(firewall_error("insert", text));
        }
        state.installed.insert(0, text);
        Ok(())
    }

    async fn append(&self, chain: &str, rule: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("-A {chain} {rule}"));
        state.installed.push(format!("{chain} {rule}"));
        Ok(())
    }

    async fn delete(&self, rule: &str, _quiet: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("-D {rule}"));
        if state.fail_deletes {
            return Err(firewall_error("delete", rule.to_string()));
        }
        match state.installed.iter().position(|r| r == rule) {
            Some(i) => {
                state.installed.remove(i);
                Ok(())
            }
            None => Err(firewall_error("delete", rule.to_string())),
        }
    }
}
