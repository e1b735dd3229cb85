//! Traffic statistics attached to a policy.
//!
//! | key            | kernel fragment      | class  | counter |
//! |----------------|----------------------|--------|---------|
//! | `rate`         | `limit rate {}`      | match  | no      |
//! | `packet-size`  | `meta length {}`     | match  | no      |
//! | `packet-count` | `counter name {}`    | action | yes     |
//! | `duration`     | none                 |        | yes     |
//!
//! A scalar value applies to both directions. A `{out, in}` mapping gives
//! each direction its own value, and its own counter. The forward rule takes
//! the `out` value unless it matches inbound traffic.

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use tracing::debug;

use super::PolicyError;

/// Recognized statistics keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Rate,
    PacketSize,
    PacketCount,
    Duration,
}

/// Where a stat fragment is placed in the kernel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatClass {
    Match,
    Action,
}

impl StatKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "rate" => Some(StatKind::Rate),
            "packet-size" => Some(StatKind::PacketSize),
            "packet-count" => Some(StatKind::PacketCount),
            "duration" => Some(StatKind::Duration),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Rate => "rate",
            StatKind::PacketSize => "packet-size",
            StatKind::PacketCount => "packet-count",
            StatKind::Duration => "duration",
        }
    }

    fn template(&self) -> Option<(&'static str, StatClass)> {
        match self {
            StatKind::Rate => Some(("limit rate {}", StatClass::Match)),
            StatKind::PacketSize => Some(("meta length {}", StatClass::Match)),
            StatKind::PacketCount => Some(("counter name {}", StatClass::Action)),
            StatKind::Duration => None,
        }
    }

    fn is_counter(&self) -> bool {
        matches!(self, StatKind::PacketCount | StatKind::Duration)
    }
}

/// Per-direction counter bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<u64>,
    #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
    pub inbound: Option<u64>,
}

impl CounterTarget {
    pub fn both(value: u64) -> Self {
        Self {
            default: Some(value),
            ..Self::default()
        }
    }

    pub fn split(out: Option<u64>, inbound: Option<u64>) -> Self {
        Self {
            default: None,
            out,
            inbound,
        }
    }
}

fn add(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.saturating_add(b)),
        (a, b) => a.or(b),
    }
}

impl AddAssign for CounterTarget {
    fn add_assign(&mut self, other: Self) {
        self.default = add(self.default, other.default);
        self.out = add(self.out, other.out);
        self.inbound = add(self.inbound, other.inbound);
    }
}

/// A kernel fragment for each direction. Either side may be absent when a
/// split stat only sets one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFragment {
    pub forward: Option<String>,
    pub backward: Option<String>,
}

/// Compiled stats of one policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatRules {
    pub matches: Vec<StatFragment>,
    pub actions: Vec<StatFragment>,
    pub counters: BTreeMap<String, CounterTarget>,
}

/// A stat value, before rendering.
enum StatValue {
    Both(String),
    Split { out: Option<String>, inbound: Option<String> },
}

impl StatRules {
    /// Compile a policy's `stats` mapping, in declaration order.
    ///
    /// `inbound_forward` is set when the forward rule matches traffic towards
    /// the device, so split values put `in` on the forward rule.
    pub fn compile(policy: &str, stats: &Mapping, inbound_forward: bool) -> Result<Self, PolicyError> {
        let mut rules = Self::default();

        for (key, value) in stats {
            let Some(kind) = key.as_str().and_then(StatKind::from_key) else {
                debug!(policy, stat = ?key, "ignoring unsupported stat");
                continue;
            };
            rules.add(policy, kind, value, inbound_forward)?;
        }

        Ok(rules)
    }

    fn add(&mut self, policy: &str, kind: StatKind, value: &Value, inbound_forward: bool) -> Result<(), PolicyError> {
        let value = stat_value(kind, value)?;

        if kind.is_counter() {
            let counter = match &value {
                StatValue::Both(v) => CounterTarget::both(counter_value(kind, v)?),
                StatValue::Split { out, inbound } => CounterTarget::split(
                    out.as_deref().map(|v| counter_value(kind, v)).transpose()?,
                    inbound.as_deref().map(|v| counter_value(kind, v)).transpose()?,
                ),
            };
            self.counters.insert(kind.as_str().to_string(), counter);
        }

        let Some((template, class)) = kind.template() else {
            return Ok(());
        };

        let rendered = if kind.is_counter() {
            // Counters are referenced by name, not by bound
            match value {
                StatValue::Both(_) => StatValue::Both(format!("\"{}\"", policy)),
                StatValue::Split { out, inbound } => StatValue::Split {
                    out: out.map(|_| format!("\"{}-out\"", policy)),
                    inbound: inbound.map(|_| format!("\"{}-in\"", policy)),
                },
            }
        } else {
            value
        };

        let fragment = match rendered {
            StatValue::Both(v) => {
                let text = template.replacen("{}", &v, 1);
                StatFragment {
                    forward: Some(text.clone()),
                    backward: Some(text),
                }
            }
            StatValue::Split { out, inbound } => {
                let (forward, backward) = if inbound_forward { (inbound, out) } else { (out, inbound) };
                StatFragment {
                    forward: forward.map(|v| template.replacen("{}", &v, 1)),
                    backward: backward.map(|v| template.replacen("{}", &v, 1)),
                }
            }
        };

        debug!(policy, stat = kind.as_str(), ?fragment, "adding stat fragment");
        match class {
            StatClass::Match => self.matches.push(fragment),
            StatClass::Action => self.actions.push(fragment),
        }
        Ok(())
    }

    pub fn has_backward(&self) -> bool {
        self.matches.iter().chain(&self.actions).any(|f| f.backward.is_some())
    }
}

fn invalid(kind: StatKind, reason: impl Into<String>) -> PolicyError {
    PolicyError::InvalidStat {
        stat: kind.as_str(),
        reason: reason.into(),
    }
}

fn stat_scalar(kind: StatKind, value: &Value) -> Result<String, PolicyError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(invalid(kind, "expected a scalar")),
    }
}

fn stat_value(kind: StatKind, value: &Value) -> Result<StatValue, PolicyError> {
    let Value::Mapping(map) = value else {
        return Ok(StatValue::Both(stat_scalar(kind, value)?));
    };

    let mut out = None;
    let mut inbound = None;
    for (key, v) in map {
        match key.as_str() {
            Some("out") => out = Some(stat_scalar(kind, v)?),
            Some("in") => inbound = Some(stat_scalar(kind, v)?),
            _ => return Err(invalid(kind, format!("unexpected direction key {:?}", key))),
        }
    }
    if out.is_none() && inbound.is_none() {
        return Err(invalid(kind, "expected `out` and/or `in`"));
    }
    Ok(StatValue::Split { out, inbound })
}

/// Parse a counter bound. Durations also accept humantime strings and are
/// stored in seconds.
fn counter_value(kind: StatKind, raw: &str) -> Result<u64, PolicyError> {
    if let Ok(n) = raw.trim().parse::<u64>() {
        return Ok(n);
    }
    match kind {
        StatKind::Duration => humantime::parse_duration(raw.trim())
            .map(|d| d.as_secs())
            .map_err(|e| invalid(kind, e.to_string())),
        _ => Err(invalid(kind, format!("{:?} is not an unsigned integer", raw))),
    }
}
