//! Address and identity resolution.
//!
//! Turns address-like tokens from a profile into literals usable in an
//! nftables match, or marks them as domain names that can only be checked
//! in userspace once the device's DNS traffic has been observed:
//!
//! - `self` resolves to the device's own address for the requested family
//! - well-known aliases (`gateway`, `local`, `mdns`, ...) resolve to literals
//! - IP addresses, CIDR networks and MAC addresses are kept as-is
//! - anything else is assumed to be a domain name

use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

use crate::config::DeviceInfo;

/// Address family a token is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    Mac,
    Ipv4,
    Ipv6,
}

impl AddrFamily {
    /// Key used for this family in profiles and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddrFamily::Mac => "mac",
            AddrFamily::Ipv4 => "ipv4",
            AddrFamily::Ipv6 => "ipv6",
        }
    }

    /// Well-known aliases for this family.
    fn aliases(&self) -> &'static [(&'static str, &'static [&'static str])] {
        match self {
            AddrFamily::Mac => MAC_ALIASES,
            AddrFamily::Ipv4 => IPV4_ALIASES,
            AddrFamily::Ipv6 => IPV6_ALIASES,
        }
    }
}

const MAC_ALIASES: &[(&str, &[&str])] = &[("broadcast", &["ff:ff:ff:ff:ff:ff"])];

const IPV4_ALIASES: &[(&str, &[&str])] = &[
    ("local", &["192.168.0.0/16"]),
    ("gateway", &["192.168.1.1"]),
    ("external", &["!= 192.168.0.0/16"]),
    ("broadcast", &["255.255.255.255"]),
    ("udp-broadcast", &["192.168.1.255"]),
    ("igmpv3", &["224.0.0.22"]),
    ("mdns", &["224.0.0.251"]),
    ("ssdp", &["239.255.255.250"]),
];

const IPV6_ALIASES: &[(&str, &[&str])] = &[
    ("local", &["fe80::/10"]),
    ("gateway", &["fddd:ed18:f05b::1"]),
    ("mdns", &["ff02::fb"]),
    ("ssdp", &["ff02::c"]),
];

/// Resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("device has no {} address to substitute for 'self'", .0.as_str())]
    MissingSelfAddress(AddrFamily),
}

/// Result of resolving one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// One or more literals usable in a kernel match
    Literal(Vec<String>),
    /// A name that must be resolved at runtime
    DomainName(String),
}

/// Resolve a single address token.
pub fn resolve(token: &str, device: &DeviceInfo, family: AddrFamily) -> Result<Resolved, ResolveError> {
    if token == "self" {
        let own = match family {
            AddrFamily::Mac => Some(&device.mac).filter(|mac| !mac.is_empty()),
            AddrFamily::Ipv4 => device.ipv4.as_ref(),
            AddrFamily::Ipv6 => device.ipv6.as_ref(),
        };
        return own
            .map(|addr| Resolved::Literal(vec![addr.clone()]))
            .ok_or(ResolveError::MissingSelfAddress(family));
    }

    if let Some((_, literals)) = family.aliases().iter().find(|(alias, _)| *alias == token) {
        return Ok(Resolved::Literal(literals.iter().map(|l| l.to_string()).collect()));
    }

    if is_literal(token) {
        return Ok(Resolved::Literal(vec![token.to_string()]));
    }

    debug!(token, family = family.as_str(), "treating address token as domain name");
    Ok(Resolved::DomainName(token.to_string()))
}

/// Resolve every element of a list, keeping literals and domain names apart.
///
/// Returns `(literals, domain_names)`, each in input order.
pub fn resolve_all<'a, I>(
    tokens: I,
    device: &DeviceInfo,
    family: AddrFamily,
) -> Result<(Vec<String>, Vec<String>), ResolveError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut literals = Vec::new();
    let mut domains = Vec::new();
    for token in tokens {
        match resolve(token, device, family)? {
            Resolved::Literal(values) => literals.extend(values),
            Resolved::DomainName(name) => domains.push(name),
        }
    }
    Ok((literals, domains))
}

/// Check whether a token is a syntactically valid address literal.
pub fn is_literal(token: &str) -> bool {
    token.parse::<IpAddr>().is_ok() || token.parse::<ipnet::IpNet>().is_ok() || is_mac(token)
}

fn is_mac(token: &str) -> bool {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| {
        // One separator throughout
        Regex::new(r"^[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}$|^[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5}$")
            .expect("MAC address pattern is valid")
    })
    .is_match(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceInfo {
        DeviceInfo::new("cam", "78:8b:2a:b2:20:ea", "192.168.1.161").with_ipv6("fe80::7a8b:2aff:feb2:20ea")
    }

    #[test]
    fn test_self_per_family() {
        let d = device();
        assert_eq!(
            resolve("self", &d, AddrFamily::Ipv4).unwrap(),
            Resolved::Literal(vec!["192.168.1.161".into()])
        );
        assert_eq!(
            resolve("self", &d, AddrFamily::Ipv6).unwrap(),
            Resolved::Literal(vec!["fe80::7a8b:2aff:feb2:20ea".into()])
        );
        assert_eq!(
            resolve("self", &d, AddrFamily::Mac).unwrap(),
            Resolved::Literal(vec!["78:8b:2a:b2:20:ea".into()])
        );
    }

    #[test]
    fn test_self_without_address() {
        let d = DeviceInfo::new("cam", "78:8b:2a:b2:20:ea", "192.168.1.161");
        assert_eq!(
            resolve("self", &d, AddrFamily::Ipv6),
            Err(ResolveError::MissingSelfAddress(AddrFamily::Ipv6))
        );
    }

    #[test]
    fn test_aliases_are_family_bound() {
        let d = device();
        assert_eq!(
            resolve("mdns", &d, AddrFamily::Ipv4).unwrap(),
            Resolved::Literal(vec!["224.0.0.251".into()])
        );
        assert_eq!(
            resolve("mdns", &d, AddrFamily::Ipv6).unwrap(),
            Resolved::Literal(vec!["ff02::fb".into()])
        );
        // No IPv6 broadcast: falls through to the domain-name heuristic
        assert_eq!(
            resolve("broadcast", &d, AddrFamily::Ipv6).unwrap(),
            Resolved::DomainName("broadcast".into())
        );
    }

    #[test]
    fn test_literals_pass_through() {
        let d = device();
        for token in ["8.8.8.8", "192.168.1.0/24", "2001:db8::1", "2001:db8::/32", "aa:bb:cc:dd:ee:ff"] {
            assert_eq!(
                resolve(token, &d, AddrFamily::Ipv4).unwrap(),
                Resolved::Literal(vec![token.to_string()]),
                "{token}"
            );
        }
    }

    #[test]
    fn test_domain_names() {
        let d = device();
        assert_eq!(
            resolve("business.smartcamera.api.io.mi.com", &d, AddrFamily::Ipv4).unwrap(),
            Resolved::DomainName("business.smartcamera.api.io.mi.com".into())
        );
        // A typo is indistinguishable from a hostname
        assert_eq!(
            resolve("8.8.8.888", &d, AddrFamily::Ipv4).unwrap(),
            Resolved::DomainName("8.8.8.888".into())
        );
    }

    #[test]
    fn test_resolve_all_splits_groups() {
        let d = device();
        let (literals, domains) =
            resolve_all(["self", "example.com", "gateway", "api.example.org"], &d, AddrFamily::Ipv4).unwrap();
        assert_eq!(literals, vec!["192.168.1.161", "192.168.1.1"]);
        assert_eq!(domains, vec!["example.com", "api.example.org"]);
    }

    #[test]
    fn test_mac_literal_shapes() {
        assert!(is_mac("78:8b:2a:b2:20:ea"));
        assert!(is_mac("78-8B-2A-B2-20-EA"));
        assert!(!is_mac("78:8b:2a:b2:20"));
        assert!(!is_mac("gateway"));
    }

    #[test]
    fn test_mac_mixed_separators_rejected() {
        assert!(!is_mac("78:8b-2a:b2:20:ea"));
        assert!(!is_mac("78-8b-2a-b2-20:ea"));
        assert!(!is_literal("78:8b-2a:b2:20:ea"));
    }
}
