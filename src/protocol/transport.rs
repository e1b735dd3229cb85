//! Layer 4 protocols sharing the port-matching behavior.

use super::network::{endpoint_templates, tuple_mapping};
use super::types::{Initiator, ProtocolError, Target, Transform};
use super::ParseContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    Tcp,
    Udp,
}

impl TransportKind {
    fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        }
    }
}

pub(super) fn parse_ports(
    ctx: &mut ParseContext<'_>,
    kind: TransportKind,
    initiator: Option<Initiator>,
) -> Result<(), ProtocolError> {
    let proto = kind.as_str();
    let header = (format!("{} sport {{}}", proto), format!("{} dport {{}}", proto));
    let (src, dst) = endpoint_templates(
        tuple_mapping(initiator, ctx.is_backward),
        (&header.0, &header.1),
        ("ct original proto-src {}", "ct original proto-dst {}"),
    );

    ctx.add_templated(Target::Nft, "src-port", &src.forward, Some(src.backward.as_str()), Transform::Identity, false)?;
    ctx.add_templated(Target::Nft, "dst-port", &dst.forward, Some(dst.backward.as_str()), Transform::Identity, false)
}
