//! iptables implementation of the firewall backend
//!
//! Each operation is one `iptables --wait ...` process run through
//! [`crate::elevation`]. Rule texts are split on whitespace into argv; the
//! validators make sure nothing in them needs quoting.

use crate::core::backend::FirewallBackend;
use crate::core::error::{Error, Result};
use crate::elevation::create_elevated_iptables_command;
use std::process::Stdio;
use tracing::{debug, error, warn};

/// Exit status of `iptables -C` for a rule that is not installed
const EXIT_NO_MATCH: i32 = 1;

#[derive(Debug, Clone)]
pub struct IptablesBackend {
    program: String,
}

struct Outcome {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl Outcome {
    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// `--wait <flag> [chain position] <rule...>`
fn build_args<'a>(flag: &'a str, prefix: &[&'a str], rule: &'a str) -> Vec<&'a str> {
    let mut args = vec!["--wait", flag];
    args.extend_from_slice(prefix);
    args.extend(rule.split_whitespace());
    args
}

impl IptablesBackend {
    /// `program` is the iptables binary, usually from
    /// [`crate::elevation::iptables_program`].
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[&str]) -> Result<Outcome> {
        debug!("{} {}", self.program, args.join(" "));

        let output = create_elevated_iptables_command(&self.program, args)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Internal(format!("Failed to spawn {}: {e}", self.program))
            })?;

        Ok(Outcome {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn mutate(&self, operation: &'static str, args: &[&str], rule: String) -> Result<()> {
        let outcome = self.run(args).await?;
        if outcome.success() {
            return Ok(());
        }
        Err(Error::Firewall {
            operation,
            rule,
            exit_code: outcome.code,
            stderr: outcome.stderr.trim().to_string(),
        })
    }

    /// First line of `iptables --version`, e.g. `iptables v1.8.10 (nf_tables)`.
    pub async fn version(&self) -> Result<String> {
        let outcome = self.run(&["--version"]).await?;
        if !outcome.success() {
            return Err(Error::Firewall {
                operation: "version",
                rule: String::new(),
                exit_code: outcome.code,
                stderr: outcome.stderr.trim().to_string(),
            });
        }
        Ok(outcome.stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl FirewallBackend for IptablesBackend {
    async fn exists(&self, rule: &str) -> Result<bool> {
        let outcome = self.run(&build_args("-C", &[], rule)).await?;
        match outcome.code {
            Some(0) => Ok(true),
            Some(EXIT_NO_MATCH) => Ok(false),
            code => Err(Error::Firewall {
                operation: "check",
                rule: rule.to_string(),
                exit_code: code,
                stderr: outcome.stderr.trim().to_string(),
            }),
        }
    }

    async fn insert(&self, chain: &str, position: u32, rule: &str) -> Result<()> {
        let position = position.to_string();
        let args = build_args("-I", &[chain, &position], rule);
        self.mutate("insert", &args, format!("{chain} {rule}")).await
    }

    async fn append(&self, chain: &str, rule: &str) -> Result<()> {
        let args = build_args("-A", &[chain], rule);
        self.mutate("append", &args, format!("{chain} {rule}")).await
    }

    async fn delete(&self, rule: &str, quiet: bool) -> Result<()> {
        let result = self
            .mutate("delete", &build_args("-D", &[], rule), rule.to_string())
            .await;
        if !quiet && let Err(e) = &result {
            warn!("{}", e);
        }
        result
    }
}
