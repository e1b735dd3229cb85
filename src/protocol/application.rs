//! Layer 7 protocols matched by generated userspace parsers.
//!
//! Every rule lands in the nfqueue list. Each message starts with a framing
//! rule telling requests (or queries) from responses; a profile describes
//! requests unless it sets `response: true`, and the mirrored leg expects the
//! opposite role.

use super::types::{Condition, FieldSpec, ProtocolError, Target, Transform};
use super::ParseContext;
use crate::resolver::AddrFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppProtocol {
    Dns,
    Mdns,
    Http,
    Coap,
    Dhcp,
    Ssdp,
}

/// Request/response discriminator of a parsed message.
struct Framing {
    template: &'static str,
    request: &'static str,
    response: &'static str,
}

const DNS_FRAMING: Framing = Framing {
    template: "message.header.qr == {}",
    request: "0",
    response: "1",
};

const IS_REQUEST_FRAMING: Framing = Framing {
    template: "{}message.is_request",
    request: "",
    response: "!",
};

const DHCP_FRAMING: Framing = Framing {
    template: "message.op == {}",
    request: "1",
    response: "2",
};

// An answer still carries its question section
const DNS_FIELDS: &[FieldSpec] = &[
    FieldSpec::mirrored(
        "type",
        "message.questions->qtype == {}",
        "message.questions->qtype == {}",
        Transform::UpperUnderscore,
    ),
    FieldSpec::mirrored(
        "domain-name",
        "dns_contains_full_domain_name(message.questions, message.header.qdcount, \"{}\")",
        "dns_contains_full_domain_name(message.questions, message.header.qdcount, \"{}\")",
        Transform::Identity,
    ),
];

const HTTP_FIELDS: &[FieldSpec] = &[
    FieldSpec::oneway("method", "message.method == {}", Transform::UpperUnderscore),
    FieldSpec::oneway("uri", "strcmp(message.uri, \"{}\") == 0", Transform::Identity),
];

const COAP_FIELDS: &[FieldSpec] = &[
    FieldSpec::oneway("type", "message.type == {}", Transform::UpperUnderscore),
    FieldSpec::oneway("method", "message.method == {}", Transform::UpperUnderscore),
    FieldSpec::oneway("uri", "strcmp(message.uri, \"{}\") == 0", Transform::Identity),
];

const DHCP_FIELDS: &[FieldSpec] = &[
    FieldSpec::oneway("type", "message.options.message_type == {}", Transform::UpperUnderscore),
    FieldSpec::oneway(
        "client-mac",
        "strcmp(mac_hex_to_str(message.chaddr), \"{}\") == 0",
        Transform::Resolve(AddrFamily::Mac),
    ),
];

const SSDP_FIELDS: &[FieldSpec] = &[
    FieldSpec::oneway("method", "message.method == {}", Transform::UpperUnderscore),
    FieldSpec::oneway("location", "strcmp(message.location, \"{}\") == 0", Transform::Identity),
];

impl AppProtocol {
    fn framing(&self) -> &'static Framing {
        match self {
            AppProtocol::Dns | AppProtocol::Mdns => &DNS_FRAMING,
            AppProtocol::Http | AppProtocol::Coap | AppProtocol::Ssdp => &IS_REQUEST_FRAMING,
            AppProtocol::Dhcp => &DHCP_FRAMING,
        }
    }

    fn fields(&self) -> &'static [FieldSpec] {
        match self {
            AppProtocol::Dns | AppProtocol::Mdns => DNS_FIELDS,
            AppProtocol::Http => HTTP_FIELDS,
            AppProtocol::Coap => COAP_FIELDS,
            AppProtocol::Dhcp => DHCP_FIELDS,
            AppProtocol::Ssdp => SSDP_FIELDS,
        }
    }
}

pub(super) fn parse_message(ctx: &mut ParseContext<'_>, app: AppProtocol) -> Result<(), ProtocolError> {
    let framing = app.framing();
    let (described, mirrored) = if ctx.flag("response")? {
        (framing.response, framing.request)
    } else {
        (framing.request, framing.response)
    };
    ctx.push(
        Target::Nfq,
        Condition::new(framing.template, described),
        Some(Condition::new(framing.template, mirrored)),
    );

    for field in app.fields() {
        ctx.add_field(Target::Nfq, field)?;
    }
    Ok(())
}
