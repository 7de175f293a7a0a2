// Input validation shared by every resource manager. Anything that ends up
// in a config file, a SQL statement or a command line passes through here.

use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use crate::sys::secrets::Credential;
use crate::sys::traits::{DnsRecordSpec, RecordType};

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex"));
static DB_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("static regex"));
static LOCAL_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._+-]{1,64}$").expect("static regex"));
static ON_CALENDAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9*:/,.~ -]{1,64}$").expect("static regex"));
static UNIT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@._-]{1,128}$").expect("static regex"));

/// Validates and normalizes (lowercase, no trailing dot) a host name.
pub fn domain_name(input: &str) -> Result<String, String> {
    let name = input.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(format!("Path traversal detected in domain: '{}'", input));
    }
    if name.len() > 253 {
        return Err(format!("Domain is longer than 253 characters: '{}'", input));
    }
    if !name.contains('.') {
        return Err(format!("Domain must contain at least one dot: '{}'", input));
    }
    if !name.split('.').all(|label| LABEL.is_match(label)) {
        return Err(format!("Invalid characters in domain name: '{}'", input));
    }
    Ok(name)
}

/// MySQL schema and account names: plain identifiers only, so they can be
/// interpolated between backticks without escaping.
pub fn db_identifier(input: &str, max_len: usize) -> Result<(), String> {
    if !DB_IDENT.is_match(input) {
        return Err(format!("Invalid identifier '{}': use letters, digits and '_'", input));
    }
    if input.len() > max_len {
        return Err(format!("Identifier '{}' exceeds {} characters", input, max_len));
    }
    Ok(())
}

/// Returns the normalized address and its domain part.
pub fn email(input: &str) -> Result<(String, String), String> {
    let trimmed = input.trim();
    let (local, domain) = trimmed
        .rsplit_once('@')
        .ok_or_else(|| format!("Invalid email address '{}'", input))?;

    if !LOCAL_PART.is_match(local) || local.starts_with('.') || local.ends_with('.') {
        return Err(format!("Invalid mailbox name '{}'", local));
    }
    let domain = domain_name(domain)?;
    Ok((format!("{}@{}", local.to_ascii_lowercase(), domain), domain))
}

pub fn password(cred: &Credential) -> Result<(), String> {
    let len = cred.use_str(|s| s.chars().count());
    if !(8..=128).contains(&len) {
        return Err("Password must be between 8 and 128 characters".to_string());
    }
    if cred.use_str(|s| s.chars().any(char::is_control)) {
        return Err("Password must not contain control characters".to_string());
    }
    Ok(())
}

pub fn on_calendar(input: &str) -> Result<(), String> {
    if ON_CALENDAR.is_match(input.trim()) {
        Ok(())
    } else {
        Err(format!("Invalid OnCalendar expression '{}'", input))
    }
}

pub fn unit_name(input: &str) -> Result<(), String> {
    if UNIT_NAME.is_match(input) && !input.starts_with('-') {
        Ok(())
    } else {
        Err(format!("Invalid unit name '{}'", input))
    }
}

/// Checks a record against the zone it is being written to and returns a
/// copy with a fully-qualified name.
pub fn dns_record(spec: &DnsRecordSpec, zone: &str) -> Result<DnsRecordSpec, String> {
    let zone = domain_name(zone)?;
    let raw_name = spec.name.trim().trim_end_matches('.').to_ascii_lowercase();

    let name = if raw_name.is_empty() || raw_name == "@" {
        zone.clone()
    } else if raw_name == zone || raw_name.ends_with(&format!(".{}", zone)) {
        raw_name
    } else {
        format!("{}.{}", raw_name, zone)
    };

    // Wildcards are allowed as the leftmost label only.
    let checked = name.strip_prefix("*.").unwrap_or(&name);
    if checked != zone {
        domain_name(checked)?;
    }

    let content = spec.content.trim().to_string();
    match spec.record_type {
        RecordType::A => {
            content
                .parse::<Ipv4Addr>()
                .map_err(|_| format!("'{}' is not an IPv4 address", content))?;
        }
        RecordType::Aaaa => {
            content
                .parse::<Ipv6Addr>()
                .map_err(|_| format!("'{}' is not an IPv6 address", content))?;
        }
        RecordType::Cname | RecordType::Mx => {
            domain_name(&content)?;
        }
        RecordType::Txt => {
            if content.is_empty() || content.len() > 2048 {
                return Err("TXT content must be 1 to 2048 characters".to_string());
            }
        }
    }

    if spec.record_type == RecordType::Mx && spec.priority.is_none() {
        return Err("MX records require a priority".to_string());
    }
    if spec.ttl != 1 && !(60..=86400).contains(&spec.ttl) {
        return Err(format!("TTL {} must be 1 (auto) or between 60 and 86400", spec.ttl));
    }
    if spec.proxied && !matches!(spec.record_type, RecordType::A | RecordType::Aaaa | RecordType::Cname) {
        return Err(format!("{} records cannot be proxied", spec.record_type));
    }

    Ok(DnsRecordSpec {
        record_type: spec.record_type,
        name,
        content,
        ttl: spec.ttl,
        priority: spec.priority,
        proxied: spec.proxied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(record_type: RecordType, name: &str, content: &str) -> DnsRecordSpec {
        DnsRecordSpec {
            record_type,
            name: name.to_string(),
            content: content.to_string(),
            ttl: 1,
            priority: None,
            proxied: false,
        }
    }

    #[test]
    fn test_domain_name_valid() {
        assert_eq!(domain_name("example.com").unwrap(), "example.com");
        assert_eq!(domain_name("Sub.Example.COM.").unwrap(), "sub.example.com");
        assert!(domain_name("my-site.co.th").is_ok());
        assert!(domain_name("123.com").is_ok());
    }

    #[test]
    fn test_domain_name_invalid() {
        // Injection attempts
        assert!(domain_name("example.com;").is_err());
        assert!(domain_name("example.com{").is_err());
        assert!(domain_name("example .com").is_err());
        assert!(domain_name("exa\nmple.com").is_err());
        assert!(domain_name("under_score.com").is_err());
        assert!(domain_name("-leading.com").is_err());

        // Path traversal
        assert!(domain_name("../foo").is_err());
        assert!(domain_name("foo/bar.com").is_err());
        assert!(domain_name("foo\\bar.com").is_err());

        // Shape
        assert!(domain_name("").is_err());
        assert!(domain_name("localhost").is_err());
        assert!(domain_name(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn db_identifiers_reject_quotes_and_length() {
        assert!(db_identifier("shop_prod", 64).is_ok());
        assert!(db_identifier("shop`; DROP", 64).is_err());
        assert!(db_identifier("o'brien", 64).is_err());
        assert!(db_identifier("", 64).is_err());
        assert!(db_identifier(&"u".repeat(33), 32).is_err());
    }

    #[test]
    fn email_is_normalized() {
        let (addr, domain) = email(" Info@Example.com ").unwrap();
        assert_eq!(addr, "info@example.com");
        assert_eq!(domain, "example.com");

        assert!(email("no-at-sign").is_err());
        assert!(email(".dot@example.com").is_err());
        assert!(email("a b@example.com").is_err());
        assert!(email("user@localhost").is_err());
    }

    #[test]
    fn password_length_and_control_chars() {
        assert!(password(&Credential::from("correct-horse".to_string())).is_ok());
        assert!(password(&Credential::from("short".to_string())).is_err());
        assert!(password(&Credential::from("line\nbreak-pass".to_string())).is_err());
    }

    #[test]
    fn dns_names_are_qualified_against_zone() {
        let apex = dns_record(&record(RecordType::A, "@", "203.0.113.7"), "example.com").unwrap();
        assert_eq!(apex.name, "example.com");

        let relative = dns_record(&record(RecordType::Cname, "www", "example.com"), "example.com").unwrap();
        assert_eq!(relative.name, "www.example.com");

        let full = dns_record(&record(RecordType::A, "api.example.com", "203.0.113.7"), "example.com").unwrap();
        assert_eq!(full.name, "api.example.com");

        let wildcard = dns_record(&record(RecordType::A, "*", "203.0.113.7"), "example.com").unwrap();
        assert_eq!(wildcard.name, "*.example.com");
    }

    #[test]
    fn dns_content_checked_per_type() {
        assert!(dns_record(&record(RecordType::A, "@", "2001:db8::1"), "example.com").is_err());
        assert!(dns_record(&record(RecordType::Aaaa, "@", "2001:db8::1"), "example.com").is_ok());
        assert!(dns_record(&record(RecordType::Mx, "@", "mail.example.com"), "example.com").is_err());

        let mut mx = record(RecordType::Mx, "@", "mail.example.com");
        mx.priority = Some(10);
        assert!(dns_record(&mx, "example.com").is_ok());

        let mut txt = record(RecordType::Txt, "@", "v=spf1 mx -all");
        txt.proxied = true;
        assert!(dns_record(&txt, "example.com").is_err());

        let mut ttl = record(RecordType::A, "@", "203.0.113.7");
        ttl.ttl = 30;
        assert!(dns_record(&ttl, "example.com").is_err());
    }

    #[test]
    fn calendar_and_unit_names() {
        assert!(on_calendar("*-*-* 03:00:00").is_ok());
        assert!(on_calendar("daily").is_ok());
        assert!(on_calendar("daily; rm -rf /").is_err());
        assert!(unit_name("nginx").is_ok());
        assert!(unit_name("docker.service").is_ok());
        assert!(unit_name("--now").is_err());
        assert!(unit_name("a b").is_err());
    }
}
