//! Input validation and sanitization functions for drnet
//!
//! Network descriptions are operator input that ends up in shell scripts and
//! firewall configuration running as root. Everything read from them passes
//! through one of these checks first.

use std::net::Ipv4Addr;

/// Sanitizes text for safe use in iptables comments and log prefixes.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use drnet::validators::sanitize_label;
///
/// let safe = sanitize_label("Allow web1 ingress");
/// assert_eq!(safe, "Allow web1 ingress");
///
/// let unsafe_label = "Test\nNewline\"Quote";
/// let safe = sanitize_label(unsafe_label);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: Use ASCII-only to prevent Unicode bypasses and multi-byte issues
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':')
        })
        .take(64)
        .collect()
}

/// Validates a machine label.
///
/// Labels become hostnames, script function prefixes and chain names, so they
/// must be non-empty ASCII alphanumerics, dash or underscore, at most 63 chars.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_machine_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("Machine label cannot be empty".to_string());
    }

    if label.len() > 63 {
        return Err("Machine label too long (max 63 characters)".to_string());
    }

    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err("Machine label contains invalid characters (use a-z, 0-9, -, _)".to_string());
    }

    Ok(())
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

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    // Check for valid characters (ASCII alphanumeric only, plus dot, dash, underscore)
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Parses a dotted-quad IPv4 address.
///
/// # Errors
///
/// Returns `Err` if the text is not an IPv4 address.
pub fn parse_ipv4(value: &str) -> Result<Ipv4Addr, String> {
    value
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|e| format!("'{value}' is not an IPv4 address: {e}"))
}

/// Validates and normalizes a MAC address to lowercase colon form.
///
/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabbccddeeff`.
///
/// # Errors
///
/// Returns `Err` if the value is not six hex octets.
///
/// # Examples
///
/// ```
/// use drnet::validators::validate_mac;
///
/// assert_eq!(validate_mac("08-00-27-AB-CD-EF").unwrap(), "08:00:27:ab:cd:ef");
/// assert!(validate_mac("08:00:27").is_err());
/// ```
pub fn validate_mac(value: &str) -> Result<String, String> {
    let hex: String = value
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .collect::<String>()
        .to_ascii_lowercase();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{value}' is not a MAC address"));
    }

    let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Ok(octets.join(":"))
}

/// Validates a DNS hostname (RFC 1123 labels, dot separated).
///
/// # Errors
///
/// Returns `Err` if any label is empty, longer than 63 characters, or uses
/// characters other than alphanumerics and inner dashes.
pub fn validate_hostname(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 253 {
        return Err(format!("'{name}' is not a valid hostname length"));
    }

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("'{name}' has an empty or oversized label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("'{name}' has a label starting or ending with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("'{name}' contains invalid characters"));
        }
    }

    Ok(())
}

/// Validates an email address as `local@domain`.
///
/// # Errors
///
/// Returns `Err` if there is not exactly one `@`, the local part is empty or
/// contains whitespace/quotes, or the domain is not a dotted hostname.
///
/// # Examples
///
/// ```
/// use drnet::validators::validate_email;
///
/// assert!(validate_email("ops@example.org").is_ok());
/// assert!(validate_email("ops@localhost").is_err());
/// assert!(validate_email("not-an-address").is_err());
/// ```
pub fn validate_email(address: &str) -> Result<(), String> {
    let (local, domain) = address
        .split_once('@')
        .ok_or_else(|| format!("'{address}' has no '@'"))?;

    if local.is_empty()
        || local.len() > 64
        || local
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '@' | '`' | '$'))
    {
        return Err(format!("'{address}' has an invalid local part"));
    }

    if !domain.contains('.') {
        return Err(format!("'{address}' has no domain suffix"));
    }

    validate_hostname(domain)
}

/// Checks if a port is well-known and returns informational message.
///
/// This is informational only and does not block compilation.
pub fn check_well_known_port(port: u16) -> Option<String> {
    if port <= 1024 {
        let name = match port {
            22 => "SSH",
            80 => "HTTP",
            443 => "HTTPS",
            53 => "DNS",
            25 => "SMTP",
            21 => "FTP",
            _ => return Some(format!("Privileged port {} (requires admin)", port)),
        };
        Some(format!("Port {}: {}", port, name))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label_normal() {
        assert_eq!(sanitize_label("Normal Label"), "Normal Label");
        assert_eq!(sanitize_label("web1_ingress"), "web1_ingress");
    }

    #[test]
    fn test_sanitize_label_removes_shell_metacharacters() {
        assert_eq!(sanitize_label("Test$Dollar"), "TestDollar");
        assert_eq!(sanitize_label("Test`Backtick"), "TestBacktick");
        assert_eq!(sanitize_label("Test;Semicolon"), "TestSemicolon");
        assert_eq!(sanitize_label("Test\"Quote"), "TestQuote");
    }

    #[test]
    fn test_sanitize_label_length_limit() {
        let long_label = "a".repeat(100);
        assert_eq!(sanitize_label(&long_label).len(), 64);
    }

    #[test]
    fn test_validate_machine_label() {
        assert!(validate_machine_label("web1").is_ok());
        assert!(validate_machine_label("db-primary_2").is_ok());
        assert!(validate_machine_label("").is_err());
        assert!(validate_machine_label("web 1").is_err());
        assert!(validate_machine_label("web.example").is_err());
        assert!(validate_machine_label(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_interface_valid() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("enp0s3").is_ok());
        assert!(validate_interface("br-lan.10").is_ok());
    }

    #[test]
    fn test_validate_interface_invalid() {
        assert!(validate_interface("").is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("eth0;rm").is_err());
        assert!(validate_interface("averyveryverylongname").is_err());
    }

    #[test]
    fn test_validate_interface_max_length() {
        assert!(validate_interface(&"a".repeat(15)).is_ok());
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4(" 10.0.0.1 ").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(parse_ipv4("10.0.0.256").is_err());
        assert!(parse_ipv4("::1").is_err());
    }

    #[test]
    fn test_validate_mac() {
        assert_eq!(validate_mac("080027abcdef").unwrap(), "08:00:27:ab:cd:ef");
        assert!(validate_mac("zz:00:27:ab:cd:ef").is_err());
        assert!(validate_mac("08:00:27:ab:cd:ef:01").is_err());
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("api.example.com").is_ok());
        assert!(validate_hostname("localhost").is_ok());
        assert!(validate_hostname("-bad.example").is_err());
        assert!(validate_hostname("bad..example").is_err());
        assert!(validate_hostname("under_score.example").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("alice@example.org").is_ok());
        assert!(validate_email("alice@@example.org").is_err());
        assert!(validate_email("@example.org").is_err());
        assert!(validate_email("al ice@example.org").is_err());
        assert!(validate_email("alice@example").is_err());
    }

    #[test]
    fn test_check_well_known_port() {
        assert!(check_well_known_port(22).unwrap().contains("SSH"));
        assert!(check_well_known_port(999).unwrap().contains("Privileged"));
        assert!(check_well_known_port(8080).is_none());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_sanitize_label_never_exceeds_64_chars(input in "\\PC*") {
            let sanitized = sanitize_label(&input);
            prop_assert!(sanitized.len() <= 64);
        }

        #[test]
        fn test_sanitize_label_no_dangerous_chars(input in "\\PC*") {
            let sanitized = sanitize_label(&input);
            prop_assert!(!sanitized.contains('"'));
            prop_assert!(!sanitized.contains('\''));
            prop_assert!(!sanitized.contains('$'));
            prop_assert!(!sanitized.contains('`'));
            prop_assert!(!sanitized.contains('|'));
            prop_assert!(!sanitized.contains(';'));
        }

        #[test]
        fn test_validate_mac_roundtrip(octets in proptest::array::uniform6(any::<u8>())) {
            let text = octets.iter().map(|o| format!("{o:02X}")).collect::<Vec<_>>().join("-");
            let normalized = validate_mac(&text).unwrap();
            prop_assert_eq!(normalized.len(), 17);
            prop_assert_eq!(normalized, text.to_ascii_lowercase().replace('-', ":"));
        }

        #[test]
        fn test_validate_interface_char_constraint(
            valid_prefix in "[a-zA-Z0-9._-]{1,10}",
            invalid_char in "[^a-zA-Z0-9._-]"
        ) {
            let invalid_name = format!("{valid_prefix}{invalid_char}");
            prop_assert!(validate_interface(&invalid_name).is_err());
        }
    }
}
