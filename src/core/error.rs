use thiserror::Error;

/// Core error types for dockfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed rule or action request
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// No container with this id or name
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Container exists but has no primary IPv4 address
    #[error("Container {0} is not online")]
    ContainerOffline(String),

    /// Container must be running for this action
    #[error("Container {0} is not running")]
    ContainerNotRunning(String),

    /// Endpoint could not be turned into an address
    #[error("Address error: {0}")]
    Address(String),

    /// iptables returned a non-zero exit status
    #[error("iptables {operation} failed (exit code {exit_code:?}): {rule}")]
    Firewall {
        operation: &'static str,
        rule: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Docker Engine API call failed
    #[error("Docker error: {0}")]
    Runtime(String),

    /// Saved host configuration no longer matches the container
    #[error("Host configuration of {0} changed since it was saved")]
    HostConfigDrift(String),

    /// Container dependencies form a cycle
    #[error("Dependency cycle detected: sorted {sorted} of {total} containers")]
    DependencyCycle { sorted: usize, total: usize },

    /// Dependency not part of the requested start set
    #[error("Container {dependent} depends on {dependency}, which was not requested")]
    MissingDependency {
        dependent: String,
        dependency: String,
    },

    /// Docker reported a link in an unexpected format
    #[error("Unexpected link format: {0}")]
    MalformedLink(String),

    /// Start requested without a saved host configuration
    #[error("No saved HostConfig found for container {0}")]
    MissingLaunchConfig(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Consistency failures: drift, cycles and runtime model mismatches.
    ///
    /// These are never retried or worked around automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HostConfigDrift(_) | Self::DependencyCycle { .. } | Self::MalformedLink(_)
        )
    }

    /// One-paragraph message for the terminal, hints included.
    pub fn user_message(&self) -> String {
        let translation = self.translate();
        let mut message = translation.user_message;
        for suggestion in translation.suggestions {
            message.push_str("\n  hint: ");
            message.push_str(&suggestion);
        }
        message
    }

    /// Translated, user-facing description with hints.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Self::Firewall { stderr, .. } if !stderr.is_empty() => {
                IptablesErrorPattern::match_error(stderr)
            }
            Self::Runtime(msg) => DockerErrorPattern::match_error(msg),
            Self::HostConfigDrift(_) => ErrorTranslation::new(self.to_string())
                .with_suggestion("Inspect the container and re-run save-hostconfig if the change is intended"),
            Self::DependencyCycle { .. } => ErrorTranslation::new(self.to_string())
                .with_suggestion("Check --link and --volumes-from of the requested containers"),
            _ => ErrorTranslation::new(self.to_string()),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables stderr patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or set DOCKFW_ELEVATION_METHOD=sudo")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Another firewall tool (or dockerd) is modifying rules")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Firewall chain or match module not found")
                .with_suggestion("Ensure the Docker daemon is running so the DOCKER chain exists")
                .with_suggestion("Check the extra filter for unknown match modules");
        }

        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("Rule is not present in the firewall")
                .with_suggestion("List rules with: iptables -S");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or set \"iptables\" in the dockfw config file");
        }

        if lower.contains("invalid") || lower.contains("bad argument") || lower.contains("unknown option") {
            return ErrorTranslation::new("Invalid rule syntax")
                .with_suggestion("Check the --filter expression for typos")
                .with_suggestion("Verify port numbers are between 1 and 65535");
        }

        ErrorTranslation::new(format!("Firewall error: {}", msg.trim()))
            .with_suggestion("Verify iptables is working: sudo iptables -S FORWARD")
    }
}

/// Known Docker client error patterns and their translations
pub struct DockerErrorPattern;

impl DockerErrorPattern {
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") {
            return ErrorTranslation::new("Cannot access the Docker socket")
                .with_suggestion("Run as root or add your user to the docker group");
        }

        if lower.contains("connection refused")
            || lower.contains("no such file")
            || lower.contains("error trying to connect")
        {
            return ErrorTranslation::new("Docker daemon is not reachable")
                .with_suggestion("Check the daemon: systemctl status docker")
                .with_suggestion("Or set \"docker_socket\" in the dockfw config file");
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("Docker daemon did not answer in time")
                .with_suggestion("Raise \"docker_timeout_secs\" in the dockfw config file");
        }

        ErrorTranslation::new(format!("Docker error: {msg}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_permission_denied() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("DOCKFW_ELEVATION_METHOD"))
        );
    }

    #[test]
    fn test_iptables_missing_chain() {
        let translation = IptablesErrorPattern::match_error(
            "iptables: No chain/target/match by that name.",
        );
        assert!(translation.user_message.contains("chain"));
    }

    #[test]
    fn test_iptables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock.",
        );
        assert!(translation.user_message.contains("lock"));
    }

    #[test]
    fn test_docker_unreachable() {
        let translation = DockerErrorPattern::match_error(
            "error trying to connect: No such file or directory (os error 2)",
        );
        assert!(translation.user_message.contains("not reachable"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::DependencyCycle { sorted: 1, total: 3 }.is_fatal());
        assert!(Error::HostConfigDrift("web".into()).is_fatal());
        assert!(Error::MalformedLink("db".into()).is_fatal());
        assert!(!Error::ContainerNotFound("web".into()).is_fatal());
        assert!(!Error::validation("source", "missing").is_fatal());
    }

    #[test]
    fn test_firewall_error_uses_stderr_translation() {
        let err = Error::Firewall {
            operation: "insert",
            rule: "FORWARD -s 1.2.3.4/32".into(),
            exit_code: Some(1),
            stderr: "iptables: No chain/target/match by that name.".into(),
        };
        assert!(err.translate().user_message.contains("chain"));
        assert!(err.to_string().contains("insert"));
    }

    #[test]
    fn test_user_message_includes_hints() {
        let message = Error::DependencyCycle { sorted: 0, total: 2 }.user_message();
        assert!(message.contains("\n  hint: Check --link"));
        assert_eq!(Error::ContainerNotFound("web".into()).user_message().lines().count(), 1);
    }
}
