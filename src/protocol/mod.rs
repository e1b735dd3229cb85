//! Protocol catalogue.
//!
//! Every protocol a profile may reference is described by a static
//! [`ProtocolSpec`] and dispatched through one registry. Protocols turn their
//! section of a policy into a [`RuleSet`]:
//!
//! - layer 3 (`arp`, `icmp`, `icmpv6`, `ipv4`, `ipv6`) and layer 4 (`tcp`,
//!   `udp`) fields become nftables header matches
//! - `igmp` and the layer 7 protocols (`dns`, `mdns`, `http`, `coap`, `dhcp`,
//!   `ssdp`) need a userspace parser, so all their fields become nfqueue
//!   conditions
//!
//! # Example
//!
//! ```yaml
//! protocols:
//!   ipv4:
//!     src: self
//!     dst: 8.8.8.8
//!   udp:
//!     dst-port: 53
//!   dns:
//!     type: A
//!     domain-name: example.com
//! ```

mod application;
mod network;
mod transport;
mod types;

pub use types::*;

use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

use crate::config::DeviceInfo;
use crate::resolver::ResolveError;

use application::AppProtocol;
use network::IpVersion;
use transport::TransportKind;

/// Implementation selected for a protocol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolKind {
    Arp,
    Icmp,
    Icmpv6,
    Igmp,
    Ip(IpVersion),
    Transport(TransportKind),
    Application(AppProtocol),
}

/// Static protocol metadata.
#[derive(Debug)]
pub struct ProtocolSpec {
    /// Protocol token, as used in profiles and by the renderer
    pub name: &'static str,
    /// OSI layer
    pub layer: u8,
    /// Whether matching needs a userspace parser
    pub requires_custom_parser: bool,
    /// Field names read from the profile
    pub fields: &'static [&'static str],
    kind: ProtocolKind,
}

static CATALOGUE: &[ProtocolSpec] = &[
    ProtocolSpec {
        name: "arp",
        layer: 3,
        requires_custom_parser: false,
        fields: &["type", "sha", "tha", "spa", "tpa"],
        kind: ProtocolKind::Arp,
    },
    ProtocolSpec {
        name: "icmp",
        layer: 3,
        requires_custom_parser: false,
        fields: &["type"],
        kind: ProtocolKind::Icmp,
    },
    ProtocolSpec {
        name: "icmpv6",
        layer: 3,
        requires_custom_parser: false,
        fields: &["type"],
        kind: ProtocolKind::Icmpv6,
    },
    ProtocolSpec {
        name: "igmp",
        layer: 3,
        requires_custom_parser: true,
        fields: &["version", "type", "group"],
        kind: ProtocolKind::Igmp,
    },
    ProtocolSpec {
        name: "ipv4",
        layer: 3,
        requires_custom_parser: false,
        fields: &["src", "dst"],
        kind: ProtocolKind::Ip(IpVersion::V4),
    },
    ProtocolSpec {
        name: "ipv6",
        layer: 3,
        requires_custom_parser: false,
        fields: &["src", "dst"],
        kind: ProtocolKind::Ip(IpVersion::V6),
    },
    ProtocolSpec {
        name: "tcp",
        layer: 4,
        requires_custom_parser: false,
        fields: &["src-port", "dst-port"],
        kind: ProtocolKind::Transport(TransportKind::Tcp),
    },
    ProtocolSpec {
        name: "udp",
        layer: 4,
        requires_custom_parser: false,
        fields: &["src-port", "dst-port"],
        kind: ProtocolKind::Transport(TransportKind::Udp),
    },
    ProtocolSpec {
        name: "dns",
        layer: 7,
        requires_custom_parser: true,
        fields: &["response", "type", "domain-name"],
        kind: ProtocolKind::Application(AppProtocol::Dns),
    },
    ProtocolSpec {
        name: "mdns",
        layer: 7,
        requires_custom_parser: true,
        fields: &["response", "type", "domain-name"],
        kind: ProtocolKind::Application(AppProtocol::Mdns),
    },
    ProtocolSpec {
        name: "http",
        layer: 7,
        requires_custom_parser: true,
        fields: &["response", "method", "uri"],
        kind: ProtocolKind::Application(AppProtocol::Http),
    },
    ProtocolSpec {
        name: "coap",
        layer: 7,
        requires_custom_parser: true,
        fields: &["response", "type", "method", "uri"],
        kind: ProtocolKind::Application(AppProtocol::Coap),
    },
    ProtocolSpec {
        name: "dhcp",
        layer: 7,
        requires_custom_parser: true,
        fields: &["response", "type", "client-mac"],
        kind: ProtocolKind::Application(AppProtocol::Dhcp),
    },
    ProtocolSpec {
        name: "ssdp",
        layer: 7,
        requires_custom_parser: true,
        fields: &["response", "method", "location"],
        kind: ProtocolKind::Application(AppProtocol::Ssdp),
    },
];

/// Look up a protocol by name.
pub fn lookup(name: &str) -> Option<&'static ProtocolSpec> {
    static REGISTRY: OnceLock<HashMap<&'static str, &'static ProtocolSpec>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| CATALOGUE.iter().map(|spec| (spec.name, spec)).collect())
        .get(name)
        .copied()
}

/// All known protocols, in catalogue order.
pub fn catalogue() -> &'static [ProtocolSpec] {
    CATALOGUE
}

impl ProtocolSpec {
    /// Parse this protocol's section of a policy.
    ///
    /// `data` is the value under the protocol key; `null` is treated as an
    /// empty section.
    pub fn parse(
        &'static self,
        data: &Value,
        device: &DeviceInfo,
        is_backward: bool,
        initiator: Option<Initiator>,
    ) -> Result<RuleSet, ProtocolError> {
        let empty = Mapping::new();
        let data = match data {
            Value::Null => &empty,
            Value::Mapping(map) => map,
            _ => return Err(ProtocolError::InvalidData { protocol: self.name }),
        };

        for key in data.keys() {
            let known = key.as_str().map(|k| self.fields.contains(&k)).unwrap_or(false);
            if !known {
                debug!(protocol = self.name, field = ?key, "ignoring unsupported field");
            }
        }

        let mut ctx = ParseContext {
            spec: self,
            data,
            device,
            is_backward,
            rules: RuleSet::default(),
        };

        match self.kind {
            ProtocolKind::Arp => network::parse_arp(&mut ctx)?,
            ProtocolKind::Icmp => network::parse_icmp(&mut ctx, network::ICMP_FIELDS)?,
            ProtocolKind::Icmpv6 => network::parse_icmp(&mut ctx, network::ICMPV6_FIELDS)?,
            ProtocolKind::Igmp => network::parse_igmp(&mut ctx)?,
            ProtocolKind::Ip(version) => network::parse_ip(&mut ctx, version, initiator)?,
            ProtocolKind::Transport(kind) => transport::parse_ports(&mut ctx, kind, initiator)?,
            ProtocolKind::Application(app) => application::parse_message(&mut ctx, app)?,
        }

        Ok(ctx.rules)
    }
}

/// Parsing state for one protocol instance.
pub(crate) struct ParseContext<'a> {
    spec: &'static ProtocolSpec,
    data: &'a Mapping,
    device: &'a DeviceInfo,
    is_backward: bool,
    rules: RuleSet,
}

impl<'a> ParseContext<'a> {
    fn value(&self, field: &str) -> Option<&'a Value> {
        debug_assert!(self.spec.fields.contains(&field), "{} is not declared", field);
        self.data.get(field)
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::InvalidValue {
            protocol: self.spec.name,
            field,
            reason: reason.into(),
        }
    }

    fn resolve_error(&self, field: &'static str, source: ResolveError) -> ProtocolError {
        ProtocolError::Resolve {
            protocol: self.spec.name,
            field,
            source,
        }
    }

    /// Read a field as a list of scalar tokens.
    ///
    /// Returns `None` if the field is absent, and whether it was a list.
    /// An empty list has nothing to match and is rejected.
    fn tokens(&self, field: &'static str) -> Result<Option<(Vec<String>, bool)>, ProtocolError> {
        let Some(value) = self.value(field) else {
            return Ok(None);
        };
        match value {
            Value::Sequence(items) if items.is_empty() => Err(self.invalid(field, "list must not be empty")),
            Value::Sequence(items) => {
                let tokens = items
                    .iter()
                    .map(|item| scalar(item).ok_or_else(|| self.invalid(field, "list items must be scalars")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some((tokens, true)))
            }
            other => {
                let token = scalar(other).ok_or_else(|| self.invalid(field, "expected a scalar or a list"))?;
                Ok(Some((vec![token], false)))
            }
        }
    }

    /// Read an optional boolean field.
    fn flag(&self, field: &'static str) -> Result<bool, ProtocolError> {
        match self.value(field) {
            None => Ok(false),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| self.invalid(field, "expected a boolean")),
        }
    }

    fn apply(&self, field: &'static str, transform: Transform, token: &str) -> Result<Vec<String>, ProtocolError> {
        match transform {
            Transform::Identity => Ok(vec![token.to_string()]),
            Transform::UpperUnderscore => Ok(vec![Transform::upper_underscore(token)]),
            Transform::Resolve(family) => {
                match crate::resolver::resolve(token, self.device, family)
                    .map_err(|e| self.resolve_error(field, e))?
                {
                    crate::resolver::Resolved::Literal(values) => Ok(values),
                    // Only IP fields can defer a name to userspace
                    crate::resolver::Resolved::DomainName(name) => Ok(vec![name]),
                }
            }
        }
    }

    /// Add a field described by a static spec.
    fn add_field(&mut self, target: Target, spec: &FieldSpec) -> Result<(), ProtocolError> {
        self.add_templated(target, spec.name, spec.forward, spec.backward, spec.transform, spec.flip)
    }

    /// Add a field rule if the field is present.
    fn add_templated(
        &mut self,
        target: Target,
        field: &'static str,
        forward: &str,
        backward: Option<&str>,
        transform: Transform,
        flip: bool,
    ) -> Result<(), ProtocolError> {
        let Some((tokens, is_list)) = self.tokens(field)? else {
            return Ok(());
        };

        let mut values = Vec::with_capacity(tokens.len());
        for token in &tokens {
            values.extend(self.apply(field, transform, token)?);
        }
        let mirrored: Vec<String> = if flip {
            values.iter().map(|v| flip_type(v)).collect()
        } else {
            values.clone()
        };

        debug!(protocol = self.spec.name, field, values = ?values, "adding field rule");

        let forward = Condition::new(forward, render_values(&values, is_list));
        let backward = backward.map(|template| Condition::new(template, render_values(&mirrored, is_list)));
        self.push(target, forward, backward);
        Ok(())
    }

    /// Record a rule, mirroring it when the policy describes the backward leg.
    fn push(&mut self, target: Target, forward: Condition, backward: Option<Condition>) {
        let rule = if self.is_backward {
            match backward {
                Some(mirrored) => FieldRule {
                    forward: mirrored,
                    backward: Some(forward),
                },
                None => return,
            }
        } else {
            FieldRule { forward, backward }
        };
        self.rules.target_mut(target).push(rule);
    }
}

/// Render a scalar YAML value as a token.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Render values as a single token or an nftables anonymous set.
fn render_values(values: &[String], is_list: bool) -> String {
    if !is_list && values.len() == 1 {
        values[0].clone()
    } else {
        format!("{{ {} }}", values.join(", "))
    }
}
