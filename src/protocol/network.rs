//! Layer 3 protocols: ARP, ICMP, ICMPv6, IGMP, IPv4 and IPv6.

use super::types::{Condition, FieldSpec, Initiator, ProtocolError, Target, Transform};
use super::ParseContext;
use crate::resolver::{resolve_all, AddrFamily};

const ARP_FIELDS: &[FieldSpec] = &[
    FieldSpec::mirrored("type", "arp operation {}", "arp operation {}", Transform::Identity).flipped(),
    FieldSpec::mirrored("sha", "arp saddr ether {}", "arp daddr ether {}", Transform::Resolve(AddrFamily::Mac)),
    FieldSpec::mirrored("tha", "arp daddr ether {}", "arp saddr ether {}", Transform::Resolve(AddrFamily::Mac)),
    FieldSpec::mirrored("spa", "arp saddr ip {}", "arp daddr ip {}", Transform::Resolve(AddrFamily::Ipv4)),
    FieldSpec::mirrored("tpa", "arp daddr ip {}", "arp saddr ip {}", Transform::Resolve(AddrFamily::Ipv4)),
];

pub(super) const ICMP_FIELDS: &[FieldSpec] =
    &[FieldSpec::mirrored("type", "icmp type {}", "icmp type {}", Transform::Identity).flipped()];

pub(super) const ICMPV6_FIELDS: &[FieldSpec] =
    &[FieldSpec::mirrored("type", "icmpv6 type {}", "icmpv6 type {}", Transform::Identity).flipped()];

const IGMP_GROUP: FieldSpec = FieldSpec::oneway(
    "group",
    "strcmp(ipv4_net_to_str(message.body.v2_message.group_address), \"{}\") == 0",
    Transform::Resolve(AddrFamily::Ipv4),
);

const IGMP_DEFAULT_VERSION: u64 = 2;

pub(super) fn parse_arp(ctx: &mut ParseContext<'_>) -> Result<(), ProtocolError> {
    for field in ARP_FIELDS {
        ctx.add_field(Target::Nft, field)?;
    }
    Ok(())
}

pub(super) fn parse_icmp(ctx: &mut ParseContext<'_>, fields: &[FieldSpec]) -> Result<(), ProtocolError> {
    for field in fields {
        ctx.add_field(Target::Nft, field)?;
    }
    Ok(())
}

pub(super) fn parse_igmp(ctx: &mut ParseContext<'_>) -> Result<(), ProtocolError> {
    let version = match ctx.value("version") {
        None => IGMP_DEFAULT_VERSION,
        Some(value) => value
            .as_u64()
            .filter(|v| (1..=3).contains(v))
            .ok_or_else(|| ctx.invalid("version", "expected 1, 2 or 3"))?,
    };

    // Message types are versioned enum members in the generated parser
    let template = format!("message.type == V{}_{{}}", version);
    ctx.add_templated(Target::Nfq, "type", &template, None, Transform::UpperUnderscore, false)?;
    ctx.add_field(Target::Nfq, &IGMP_GROUP)
}

/// IP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    fn family(&self) -> AddrFamily {
        match self {
            IpVersion::V4 => AddrFamily::Ipv4,
            IpVersion::V6 => AddrFamily::Ipv6,
        }
    }

    /// nftables payload expression prefix.
    fn nft_prefix(&self) -> &'static str {
        match self {
            IpVersion::V4 => "ip",
            IpVersion::V6 => "ip6",
        }
    }

    fn number(&self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

/// Physical header side of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dst,
}

impl Side {
    fn opposite(self) -> Self {
        match self {
            Side::Src => Side::Dst,
            Side::Dst => Side::Src,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Side::Src => "src",
            Side::Dst => "dst",
        }
    }
}

/// How source/destination fields relate to the connection's original tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TupleMapping {
    /// No initiator: raw header fields
    Header,
    /// The packet source is the endpoint that opened the connection
    OriginatorIsSource,
    /// The packet destination is the endpoint that opened the connection
    OriginatorIsDestination,
}

/// Select the template mapping for an `(initiator, is_backward)` pair.
pub(crate) fn tuple_mapping(initiator: Option<Initiator>, is_backward: bool) -> TupleMapping {
    match (initiator, is_backward) {
        (None, _) => TupleMapping::Header,
        (Some(Initiator::Src), false) | (Some(Initiator::Dst), true) => TupleMapping::OriginatorIsSource,
        (Some(Initiator::Src), true) | (Some(Initiator::Dst), false) => {
            TupleMapping::OriginatorIsDestination
        }
    }
}

/// Forward and backward templates of one endpoint field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mirror {
    pub forward: String,
    pub backward: String,
}

impl Mirror {
    fn new(forward: &str, backward: &str) -> Self {
        Self {
            forward: forward.to_string(),
            backward: backward.to_string(),
        }
    }
}

/// Templates for the (source, destination) endpoint fields.
///
/// `header` and `tracked` are the (source, destination) templates on raw
/// headers and on the conntrack original tuple.
pub(crate) fn endpoint_templates(
    mapping: TupleMapping,
    header: (&str, &str),
    tracked: (&str, &str),
) -> (Mirror, Mirror) {
    match mapping {
        TupleMapping::Header => (Mirror::new(header.0, header.1), Mirror::new(header.1, header.0)),
        TupleMapping::OriginatorIsSource => {
            (Mirror::new(tracked.0, tracked.1), Mirror::new(tracked.1, tracked.0))
        }
        TupleMapping::OriginatorIsDestination => {
            (Mirror::new(tracked.1, tracked.0), Mirror::new(tracked.0, tracked.1))
        }
    }
}

pub(super) fn parse_ip(
    ctx: &mut ParseContext<'_>,
    version: IpVersion,
    initiator: Option<Initiator>,
) -> Result<(), ProtocolError> {
    let prefix = version.nft_prefix();
    let header = (format!("{} saddr {{}}", prefix), format!("{} daddr {{}}", prefix));
    let tracked = (
        format!("ct original {} saddr {{}}", prefix),
        format!("ct original {} daddr {{}}", prefix),
    );
    let (src, dst) = endpoint_templates(
        tuple_mapping(initiator, ctx.is_backward),
        (&header.0, &header.1),
        (&tracked.0, &tracked.1),
    );

    for (field, templates, side) in [("src", src, Side::Src), ("dst", dst, Side::Dst)] {
        let Some((tokens, is_list)) = ctx.tokens(field)? else {
            continue;
        };
        let (literals, domains) = resolve_all(tokens.iter().map(String::as_str), ctx.device, version.family())
            .map_err(|e| ctx.resolve_error(field, e))?;

        if !literals.is_empty() {
            let value = super::render_values(&literals, is_list);
            ctx.push(
                Target::Nft,
                Condition::new(&templates.forward, &value),
                Some(Condition::new(&templates.backward, &value)),
            );
        }

        if !domains.is_empty() {
            let forward = domain_condition(version, side, &domains);
            let backward = domain_condition(version, side.opposite(), &domains);
            ctx.push(Target::Nfq, forward, Some(backward));
        }
    }
    Ok(())
}

/// Userspace check that a packet address belongs to a resolved domain name.
fn domain_template(version: IpVersion, side: Side) -> String {
    let n = version.number();
    format!(
        "dns_entry_contains(dns_map_get(dns_map, \"{{}}\"), (ip_addr_t) {{.version = {n}, .value.ipv{n} = get_ipv{n}_{}_addr(payload)}})",
        side.as_str()
    )
}

fn domain_condition(version: IpVersion, side: Side, domains: &[String]) -> Condition {
    let template = domain_template(version, side);
    match domains {
        [single] => Condition::new(template, single),
        _ => {
            let alternatives: Vec<String> = domains
                .iter()
                .map(|name| Condition::new(template.as_str(), name).render())
                .collect();
            Condition::new("({})", alternatives.join(" || "))
        }
    }
}
