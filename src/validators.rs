//! Input validation for dockfw
//!
//! Everything here ends up either in an iptables argv or in a path under the
//! state root, so the checks are strict and ASCII-only.

/// Validates a container id or name as accepted on the command line.
///
/// Must match `^/?[a-zA-Z0-9][a-zA-Z0-9_.-]+$`.
///
/// # Examples
///
/// ```
/// use dockfw::validators::validate_container_id;
///
/// assert!(validate_container_id("web-1").is_ok());
/// assert!(validate_container_id("/web").is_ok());
/// assert!(validate_container_id("-web").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_container_id(id: &str) -> Result<&str, String> {
    let name = id.strip_prefix('/').unwrap_or(id);

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("Container name is empty".to_string());
    };
    if !first.is_ascii_alphanumeric() {
        return Err(format!(
            "Container name '{id}' must start with a letter or digit"
        ));
    }
    if name.len() < 2 {
        return Err(format!("Container name '{id}' is too short"));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(format!("Container name '{id}' contains invalid characters"));
    }

    Ok(id)
}

/// Validates that an endpoint (`--source`/`--dest`) was given.
///
/// # Errors
///
/// Returns `Err` if the spec is empty or contains whitespace.
pub fn validate_endpoint_spec(spec: &str) -> Result<&str, String> {
    if spec.is_empty() {
        return Err("Endpoint is mandatory".to_string());
    }
    if spec.chars().any(char::is_whitespace) {
        return Err(format!("Endpoint '{spec}' contains whitespace"));
    }
    Ok(spec)
}

/// Validates an extra iptables filter.
///
/// The filter is split on whitespace into separate iptables arguments, so
/// quoting cannot work and shell metacharacters have no business there.
///
/// # Errors
///
/// Returns `Err` if the filter contains quotes, shell metacharacters or
/// control characters.
pub fn validate_filter(filter: &str) -> Result<&str, String> {
    if let Some(c) = filter.chars().find(|c| {
        matches!(
            c,
            '\'' | '"' | ';' | '|' | '&' | '$' | '`' | '<' | '>' | '\\'
        ) || c.is_control()
    }) {
        return Err(format!("Filter contains forbidden character {c:?}"));
    }
    Ok(filter)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name constraints:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name)
}
