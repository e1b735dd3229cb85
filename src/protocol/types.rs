//! Rule and field types shared by all protocols.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::resolver::{AddrFamily, ResolveError};

/// Placeholder substituted by [`Condition::render`].
pub const PLACEHOLDER: &str = "{}";

/// One matchable condition: a template and the value to substitute into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub template: String,
    #[serde(rename = "match")]
    pub value: String,
}

impl Condition {
    pub fn new(template: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            value: value.into(),
        }
    }

    /// Substitute the value into the template.
    pub fn render(&self) -> String {
        self.template.replacen(PLACEHOLDER, &self.value, 1)
    }
}

/// A field condition for the described flow and, optionally, its mirrored leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRule {
    pub forward: Condition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backward: Option<Condition>,
}

/// Rules produced by one protocol.
///
/// `nft` entries are ANDed into one kernel match line, `nfq` entries into one
/// userspace boolean expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    pub nft: Vec<FieldRule>,
    pub nfq: Vec<FieldRule>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.nft.is_empty() && self.nfq.is_empty()
    }

    pub(crate) fn target_mut(&mut self, target: Target) -> &mut Vec<FieldRule> {
        match target {
            Target::Nft => &mut self.nft,
            Target::Nfq => &mut self.nfq,
        }
    }
}

/// Where a field rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Kernel header match
    Nft,
    /// Userspace match on a parsed message
    Nfq,
}

/// Value transformation applied before substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// Upper-case, spaces and dashes to underscores (C enum identifiers)
    UpperUnderscore,
    /// Address resolution for the given family
    Resolve(AddrFamily),
}

impl Transform {
    /// Normalize a token into a C enum identifier.
    pub fn upper_underscore(token: &str) -> String {
        token.to_uppercase().replace([' ', '-'], "_")
    }
}

/// Swap `request` and `reply` inside a message type token.
///
/// Used for the mirrored leg of ARP and ICMP rules. Both words are swapped
/// in one pass, so the flip is an involution.
pub fn flip_type(token: &str) -> String {
    token
        .split("request")
        .map(|part| part.replace("reply", "request"))
        .collect::<Vec<_>>()
        .join("reply")
}

/// Static description of how one field is rendered in both directions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub name: &'static str,
    pub forward: &'static str,
    pub backward: Option<&'static str>,
    pub transform: Transform,
    pub flip: bool,
}

impl FieldSpec {
    /// Field without a meaningful mirrored form.
    pub const fn oneway(name: &'static str, forward: &'static str, transform: Transform) -> Self {
        Self {
            name,
            forward,
            backward: None,
            transform,
            flip: false,
        }
    }

    pub const fn mirrored(
        name: &'static str,
        forward: &'static str,
        backward: &'static str,
        transform: Transform,
    ) -> Self {
        Self {
            name,
            forward,
            backward: Some(backward),
            transform,
            flip: false,
        }
    }

    /// Flip the message type on the mirrored leg.
    pub const fn flipped(mut self) -> Self {
        self.flip = true;
        self
    }
}

/// Endpoint that opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    Src,
    Dst,
}

impl FromStr for Initiator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "src" => Ok(Initiator::Src),
            "dst" => Ok(Initiator::Dst),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::Src => write!(f, "src"),
            Initiator::Dst => write!(f, "dst"),
        }
    }
}

/// Protocol parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{protocol}.{field}: {source}")]
    Resolve {
        protocol: &'static str,
        field: &'static str,
        #[source]
        source: ResolveError,
    },

    #[error("{protocol}.{field}: {reason}")]
    InvalidValue {
        protocol: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("{protocol}: protocol data must be a mapping")]
    InvalidData { protocol: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_once() {
        let cond = Condition::new("ip saddr {}", "192.168.1.161");
        assert_eq!(cond.render(), "ip saddr 192.168.1.161");

        let cond = Condition::new("{}message.is_request", "!");
        assert_eq!(cond.render(), "!message.is_request");
    }

    #[test]
    fn test_render_keeps_c_braces() {
        let cond = Condition::new(
            "dns_entry_contains(dns_map_get(dns_map, \"{}\"), (ip_addr_t) {.version = 4})",
            "example.com",
        );
        assert_eq!(
            cond.render(),
            "dns_entry_contains(dns_map_get(dns_map, \"example.com\"), (ip_addr_t) {.version = 4})"
        );
    }

    #[test]
    fn test_flip_is_involution() {
        for token in ["request", "reply", "echo-request", "echo-reply", "destination-unreachable", "ANY"] {
            assert_eq!(flip_type(&flip_type(token)), token, "{token}");
        }
        assert_eq!(flip_type("request"), "reply");
        assert_eq!(flip_type("echo-reply"), "echo-request");
    }

    #[test]
    fn test_flip_swaps_both_words() {
        assert_eq!(flip_type("request-reply"), "reply-request");
        assert_eq!(flip_type("reply-request"), "request-reply");
        assert_eq!(flip_type(&flip_type("request-reply")), "request-reply");
    }

    #[test]
    fn test_upper_underscore() {
        assert_eq!(Transform::upper_underscore("m-search"), "M_SEARCH");
        assert_eq!(Transform::upper_underscore("membership report"), "MEMBERSHIP_REPORT");
        assert_eq!(Transform::upper_underscore("get"), "GET");
    }

    #[test]
    fn test_initiator_from_str() {
        assert_eq!("src".parse::<Initiator>(), Ok(Initiator::Src));
        assert_eq!("dst".parse::<Initiator>(), Ok(Initiator::Dst));
        assert_eq!("both".parse::<Initiator>(), Err("both".to_string()));
    }
}
