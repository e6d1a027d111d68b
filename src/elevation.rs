//! Privilege elevation for iptables
//!
//! dockfw may run as an unprivileged user (with access to the Docker socket)
//! and only elevates to run `iptables`.
//!
//! # Elevation Strategy
//!
//! - Already root: run directly
//! - Preferred: `run0` when available (systemd v256+, no SUID)
//! - Terminal fallback: `sudo`
//! - Non-interactive fallback: `pkexec`
//!
//! # Environment Variables
//!
//! - `DOCKFW_ELEVATION_METHOD`: force `sudo`, `run0` or `pkexec`. Useful with
//!   sudoers NOPASSWD rules, e.g. `DOCKFW_ELEVATION_METHOD=sudo dockfw replay web`
//! - `DOCKFW_TEST_NO_ELEVATION`: bypass elevation entirely (testing only)
//! - `DOCKFW_IPTABLES_COMMAND`: iptables binary to run instead of the default
//!
//! Arguments are passed as an argv vector, never through a shell.

use std::io;
use std::str::FromStr;
use strum::{Display, EnumString};
use tokio::process::Command;

/// iptables binary used when nothing overrides it; packagers can bake in
/// an absolute path with `DOCKFW_SYSTEM_IPTABLES_PATH` at build time.
pub const DEFAULT_IPTABLES: &str = match option_env!("DOCKFW_SYSTEM_IPTABLES_PATH") {
    Some(path) => path,
    None => "iptables",
};

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("pkexec not found - please install PolicyKit or run as root")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(ElevationMethod),

    #[error("Invalid DOCKFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    Sudo,
    Run0,
    Pkexec,
}

impl ElevationMethod {
    fn binary(self) -> &'static str {
        match self {
            Self::Sudo => "sudo",
            Self::Run0 => "run0",
            Self::Pkexec => "pkexec",
        }
    }

    /// Method forced through `DOCKFW_ELEVATION_METHOD`, if any
    fn from_env() -> Result<Option<Self>, ElevationError> {
        match std::env::var("DOCKFW_ELEVATION_METHOD") {
            Ok(method) if !method.is_empty() => Self::from_str(&method)
                .map(Some)
                .map_err(|_| ElevationError::InvalidMethod(method)),
            _ => Ok(None),
        }
    }
}

fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
    })
}

/// The iptables binary to run, honoring `DOCKFW_IPTABLES_COMMAND`.
pub fn iptables_program(configured: &str) -> String {
    std::env::var("DOCKFW_IPTABLES_COMMAND")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| configured.to_string())
}

fn wrapped(launcher: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(launcher);
    cmd.arg(program).args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let direct = || {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    };

    if std::env::var("DOCKFW_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct());
    }

    // A bad override is reported even when it would not be needed
    let forced = ElevationMethod::from_env()?;

    if nix::unistd::getuid().is_root() {
        return Ok(direct());
    }

    if let Some(method) = forced {
        if !binary_exists(method.binary()) {
            return Err(ElevationError::MethodNotAvailable(method));
        }
        return Ok(wrapped(method.binary(), program, args));
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        return Ok(wrapped("sudo", program, args));
    }

    if !binary_exists("pkexec") {
        return Err(ElevationError::PkexecNotFound);
    }
    Ok(wrapped("pkexec", program, args))
}

/// Creates an elevated iptables command.
///
/// # Example
///
/// ```no_run
/// use dockfw::elevation::create_elevated_iptables_command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_elevated_iptables_command("iptables", &["--wait", "-C", "INPUT", "-j", "ACCEPT"])?;
/// let status = cmd.status().await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns `Err` if the forced or fallback elevation method is unavailable.
pub fn create_elevated_iptables_command(
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}
