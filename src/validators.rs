//! Input validation for iptctl
//!
//! Everything that ends up as an iptables argument is checked here before any
//! command is issued, so malformed input never reaches the host.

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN - 1`)
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Longest table name the kernel accepts (`XT_TABLE_MAXNAMELEN - 1`)
pub const MAX_TABLE_NAME_LEN: usize = 31;

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

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a chain name.
///
/// iptables rules for chain names:
/// - 1 to 28 characters
/// - No whitespace or quotes
/// - Cannot start with `-` or `!` (would parse as an option or negation)
///
/// # Errors
///
/// Returns `Err` if the name violates any of these constraints.
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if name.starts_with('-') || name.starts_with('!') {
        return Err("Chain name cannot start with '-' or '!'".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\'' | '\\'))
    {
        return Err("Chain name contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates a table name.
///
/// Table names are lowercase identifiers like `nat` or `filter`.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or not `[a-z0-9_]`.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Table name cannot be empty".to_string());
    }

    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(format!(
            "Table name too long (max {MAX_TABLE_NAME_LEN} characters)"
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err("Table name must be lowercase letters, digits or '_'".to_string());
    }

    Ok(())
}

/// Validates a rule description before it is wrapped into a comment tag.
///
/// Quotes and backslashes are escaped by `iptables -S`, which would keep the
/// description from reading back unchanged, so they are rejected along with
/// control characters.
///
/// # Errors
///
/// Returns `Err` if the description is empty or contains forbidden characters.
pub fn validate_description(description: &str) -> Result<(), String> {
    if description.is_empty() {
        return Err("Description cannot be empty".to_string());
    }

    if let Some(c) = description
        .chars()
        .find(|c| c.is_control() || matches!(c, '"' | '\\'))
    {
        return Err(format!(
            "Description contains invalid character {c:?}"
        ));
    }

    Ok(())
}
