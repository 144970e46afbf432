//! Leaf validation for document values
//!
//! Every value that ends up in an iptables argument or in an identifier
//! comment passes through one of these functions first. They are pure and
//! return the normalised value, or a message suitable for a
//! [`ValidationError`](crate::core::error::ValidationError).

use ipnetwork::Ipv4Network;

/// Longest custom chain name iptables accepts.
pub const MAX_CHAIN_NAME_LEN: usize = 29;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_INTERFACE_LEN: usize = 15;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if the port is outside 1-65535.
///
/// # Examples
///
/// ```
/// use iptables_compose::validators::validate_port;
///
/// assert_eq!(validate_port(22), Ok(22));
/// assert!(validate_port(0).is_err());
/// assert!(validate_port(70000).is_err());
/// ```
pub fn validate_port(port: u32) -> Result<u16, String> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(format!("Invalid port {port}: must be between 1 and 65535")),
    }
}

/// Validates a `start-end` port range string.
///
/// Both endpoints must be valid ports and `start` must be strictly less than `end`.
///
/// # Errors
///
/// Returns `Err` if the string is not of the form `start-end` or the bounds are invalid.
///
/// # Examples
///
/// ```
/// use iptables_compose::validators::validate_port_range;
///
/// assert_eq!(validate_port_range("1000-2000"), Ok((1000, 2000)));
/// assert!(validate_port_range("2000-1000").is_err());
/// assert!(validate_port_range("80").is_err());
/// ```
pub fn validate_port_range(range: &str) -> Result<(u16, u16), String> {
    let format_error = || {
        format!(
            "Invalid port range format: {range} (expected format: 'start-end', e.g., '1000-2000')"
        )
    };

    let (start, end) = range.split_once('-').ok_or_else(format_error)?;
    let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !is_number(start) || !is_number(end) {
        return Err(format_error());
    }

    let start: u32 = start.parse().map_err(|_| format_error())?;
    let end: u32 = end.parse().map_err(|_| format_error())?;

    if start == 0 || end > 65_535 || start >= end {
        return Err(format!(
            "Invalid port range: {range} (ports must be between 1 and 65535 and start < end)"
        ));
    }

    // Bounds checked above, so both fit in u16
    Ok((start as u16, end as u16))
}

/// Validates a MAC address in `XX:XX:XX:XX:XX:XX` or `XX-XX-XX-XX-XX-XX` form.
///
/// The address is returned exactly as written so identifiers stay stable.
///
/// # Errors
///
/// Returns `Err` if the address is not six hex octets separated by `:` or `-`.
///
/// # Examples
///
/// ```
/// use iptables_compose::validators::validate_mac;
///
/// assert!(validate_mac("aa:bb:cc:dd:ee:ff").is_ok());
/// assert!(validate_mac("AA-BB-CC-DD-EE-FF").is_ok());
/// assert!(validate_mac("aa:bb:cc:dd:ee").is_err());
/// ```
pub fn validate_mac(mac: &str) -> Result<String, String> {
    let bytes = mac.as_bytes();
    let well_formed = bytes.len() == 17
        && bytes.iter().enumerate().all(|(i, b)| {
            if i % 3 == 2 {
                matches!(b, b':' | b'-')
            } else {
                b.is_ascii_hexdigit()
            }
        });

    if well_formed {
        Ok(mac.to_string())
    } else {
        Err(
            "Invalid MAC address format: expected format XX:XX:XX:XX:XX:XX or XX-XX-XX-XX-XX-XX"
                .to_string(),
        )
    }
}

/// Validates an IPv4 CIDR block. A bare address implies `/32`.
///
/// Host bits are allowed; containment checks mask them away.
///
/// # Errors
///
/// Returns `Err` if the address is not a dotted quad or the prefix exceeds 32.
///
/// # Examples
///
/// ```
/// use iptables_compose::validators::validate_cidr;
///
/// assert_eq!(validate_cidr("10.0.0.0/8").unwrap().prefix(), 8);
/// assert_eq!(validate_cidr("192.168.1.5").unwrap().prefix(), 32);
/// assert!(validate_cidr("10.0.0.0/33").is_err());
/// ```
pub fn validate_cidr(cidr: &str) -> Result<Ipv4Network, String> {
    let error = || format!("Invalid subnet '{cidr}': expected A.B.C.D or A.B.C.D/N (0-32)");

    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };

    // Reject shorthand forms like "10.1/16" that the network parser tolerates
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4
        || octets
            .iter()
            .any(|o| o.is_empty() || o.len() > 3 || !o.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(error());
    }

    let addr = addr.parse().map_err(|_| error())?;
    let prefix = match prefix {
        Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
            p.parse::<u8>().map_err(|_| error())?
        }
        Some(_) => return Err(error()),
        None => 32,
    };

    Ipv4Network::new(addr, prefix).map_err(|_| error())
}

/// Validates a custom chain name.
///
/// iptables rules:
/// - 1 to 29 characters
/// - ASCII alphanumeric, dot, dash, underscore only
/// - Cannot start with `-` (would be parsed as an option)
///
/// # Errors
///
/// Returns `Err` if the name violates any of the rules above.
pub fn validate_chain_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name '{name}' too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if name.starts_with('-') {
        return Err(format!("Chain name '{name}' cannot start with '-'"));
    }

    if !is_identifier_charset(name) {
        return Err(format!("Chain name '{name}' contains invalid characters"));
    }

    Ok(name.to_string())
}

/// Validates a section or group name.
///
/// Section names are embedded in `:`-separated identifier comments, so they
/// share the chain name character set but have no length cap of their own.
///
/// # Errors
///
/// Returns `Err` if the name is empty or contains characters outside `[A-Za-z0-9_.-]`.
pub fn validate_section_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Section name cannot be empty".to_string());
    }

    if !is_identifier_charset(name) {
        return Err(format!(
            "Section name '{name}' contains invalid characters (allowed: letters, digits, '_', '.', '-')"
        ));
    }

    Ok(name.to_string())
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > MAX_INTERFACE_LEN {
        return Err(format!(
            "Interface name '{name}' too long (max {MAX_INTERFACE_LEN} characters)"
        ));
    }

    if name == "." || name == ".." {
        return Err(format!("Invalid interface name '{name}'"));
    }

    if !is_identifier_charset(name) {
        return Err(format!("Interface name '{name}' contains invalid characters"));
    }

    Ok(name.to_string())
}

fn is_identifier_charset(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
