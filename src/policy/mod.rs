//! Policy compiler.
//!
//! A policy is one entry of a device profile: an ordered list of protocols,
//! optional traffic statistics, and the direction it applies to. Compiling it
//! yields one nftables rule (plus its mirrored form for bidirectional flows)
//! and the ordered list of userspace conditions evaluated on queued packets.
//!
//! ```yaml
//! dns-google:
//!   protocols:
//!     ipv4: {src: self, dst: 8.8.8.8}
//!     udp: {dst-port: 53}
//!     dns: {type: A, domain-name: example.com}
//!   direction: both
//!   stats:
//!     rate: 5/minute
//! ```

mod stats;

pub use stats::{CounterTarget, StatFragment, StatKind, StatRules};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DeviceInfo;
use crate::protocol::{self, FieldRule, Initiator, ProtocolError};

/// Traffic direction, relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Both,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "both" => Ok(Direction::Both),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Both => write!(f, "both"),
        }
    }
}

/// Policy errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("missing `protocols`")]
    MissingProtocols,

    #[error("missing `direction`")]
    MissingDirection,

    #[error("invalid direction {0:?} (expected in, out or both)")]
    InvalidDirection(String),

    #[error("invalid initiator {0:?} (expected src or dst)")]
    InvalidInitiator(String),

    #[error("invalid policy body: {0}")]
    InvalidBody(String),

    #[error("invalid {stat} value: {reason}")]
    InvalidStat { stat: &'static str, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Policy body as written in a profile.
#[derive(Debug, Deserialize)]
struct PolicyBody {
    #[serde(default)]
    protocols: Option<Mapping>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    backward: bool,
    #[serde(default)]
    initiator: Option<String>,
    #[serde(default)]
    stats: Option<Mapping>,
}

/// Kernel rule text for both legs of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NftRule {
    pub forward: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backward: Option<String>,
}

/// One compiled profile entry.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    protocols: Mapping,
    stats: Mapping,
    device: DeviceInfo,
    direction: Option<Direction>,
    is_backward: bool,
    initiator: Option<Initiator>,
    periodic: bool,
    transient: bool,
    nft: Vec<FieldRule>,
    nfq: Vec<FieldRule>,
    stat_rules: StatRules,
    custom_parser: Option<String>,
}

impl Policy {
    /// Read a policy body. Protocols are not parsed until [`Policy::parse`].
    pub fn new(name: impl Into<String>, body: &Value, device: &DeviceInfo) -> Result<Self, PolicyError> {
        let name = name.into();
        if !body.is_mapping() {
            return Err(PolicyError::InvalidBody("expected a mapping".into()));
        }
        let body: PolicyBody =
            serde_yaml::from_value(body.clone()).map_err(|e| PolicyError::InvalidBody(e.to_string()))?;

        let protocols = body.protocols.ok_or(PolicyError::MissingProtocols)?;
        let direction = body
            .direction
            .map(|d| d.parse::<Direction>().map_err(PolicyError::InvalidDirection))
            .transpose()?;
        let initiator = body
            .initiator
            .map(|i| i.parse::<Initiator>().map_err(PolicyError::InvalidInitiator))
            .transpose()?;
        let stats = body.stats.unwrap_or_default();

        let declares = |stat: StatKind| {
            stats
                .keys()
                .any(|k| k.as_str().and_then(StatKind::from_key) == Some(stat))
        };
        let transient = declares(StatKind::Duration) || declares(StatKind::PacketCount);
        let periodic = declares(StatKind::Rate) && !transient;

        Ok(Self {
            name,
            protocols,
            stats,
            device: device.clone(),
            direction,
            is_backward: body.backward,
            initiator,
            periodic,
            transient,
            nft: Vec::new(),
            nfq: Vec::new(),
            stat_rules: StatRules::default(),
            custom_parser: None,
        })
    }

    /// Compile protocols and stats. Previous output is discarded, so parsing
    /// again yields the same result.
    pub fn parse(&mut self) -> Result<(), PolicyError> {
        let mut nft = Vec::new();
        let mut nfq = Vec::new();
        let mut custom_parser: Option<String> = None;
        let mut last_layer = 0u8;

        for (key, data) in &self.protocols {
            let Some(name) = key.as_str() else {
                return Err(PolicyError::InvalidBody(format!("protocol name {:?} is not a string", key)));
            };
            let Some(spec) = protocol::lookup(name) else {
                warn!(policy = %self.name, protocol = name, "skipping unsupported protocol");
                continue;
            };

            if spec.layer < last_layer {
                warn!(
                    policy = %self.name,
                    protocol = name,
                    layer = spec.layer,
                    previous = last_layer,
                    "protocols are not declared in layer order"
                );
            }
            last_layer = last_layer.max(spec.layer);

            let rules = spec.parse(data, &self.device, self.is_backward, self.initiator)?;
            debug!(
                policy = %self.name,
                protocol = name,
                nft = rules.nft.len(),
                nfq = rules.nfq.len(),
                "parsed protocol"
            );

            if spec.requires_custom_parser {
                if let Some(previous) = &custom_parser {
                    warn!(
                        policy = %self.name,
                        previous = %previous,
                        protocol = name,
                        "several protocols need a custom parser, keeping the last one"
                    );
                }
                custom_parser = Some(name.to_string());
            }

            nft.extend(rules.nft);
            nfq.extend(rules.nfq);
        }

        // A backward leaf describes the opposite leg of its direction
        let inbound_forward = (self.direction == Some(Direction::In)) != self.is_backward;
        self.stat_rules = StatRules::compile(&self.name, &self.stats, inbound_forward)?;
        self.nft = nft;
        self.nfq = nfq;
        self.custom_parser = custom_parser;
        Ok(())
    }

    /// Assemble the kernel rule, ending in `queue num N` when `queue` is set
    /// and `accept` otherwise.
    pub fn build_nft_rule(&self, queue: Option<u16>) -> Result<NftRule, PolicyError> {
        let direction = self.direction.ok_or(PolicyError::MissingDirection)?;
        let verdict = match queue {
            Some(num) => format!("queue num {}", num),
            None => "accept".to_string(),
        };

        let mut forward: Vec<String> = self.nft.iter().map(|r| r.forward.render()).collect();
        forward.extend(self.stat_rules.matches.iter().filter_map(|f| f.forward.clone()));
        forward.extend(self.stat_rules.actions.iter().filter_map(|f| f.forward.clone()));
        forward.push(verdict.clone());

        let backward = if direction == Direction::Both {
            let mut parts: Vec<String> = self
                .nft
                .iter()
                .filter_map(|r| r.backward.as_ref().map(|b| b.render()))
                .collect();
            parts.extend(self.stat_rules.matches.iter().filter_map(|f| f.backward.clone()));
            parts.extend(self.stat_rules.actions.iter().filter_map(|f| f.backward.clone()));
            if parts.is_empty() {
                None
            } else {
                parts.push(verdict);
                Some(parts.join(" "))
            }
        } else {
            None
        };

        Ok(NftRule {
            forward: forward.join(" "),
            backward,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn is_backward(&self) -> bool {
        self.is_backward
    }

    pub fn initiator(&self) -> Option<Initiator> {
        self.initiator
    }

    /// Steady rate cap with no per-flow tracking.
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// Bounded by a duration or a packet count.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn nft_rules(&self) -> &[FieldRule] {
        &self.nft
    }

    pub fn nfq_rules(&self) -> &[FieldRule] {
        &self.nfq
    }

    pub fn stat_rules(&self) -> &StatRules {
        &self.stat_rules
    }

    pub fn counters(&self) -> &BTreeMap<String, CounterTarget> {
        &self.stat_rules.counters
    }

    pub fn custom_parser(&self) -> Option<&str> {
        self.custom_parser.as_deref()
    }
}
