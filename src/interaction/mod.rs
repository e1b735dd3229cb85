//! Profile compiler.
//!
//! Every top-level policy becomes a linear state machine. Individual policies
//! are single-leaf machines; interaction policies are nested name -> body
//! maps, flattened depth-first into an ordered list of leaves:
//!
//! ```yaml
//! interaction-policies:
//!   cloud-login:
//!     dns-query:
//!       protocols: {udp: {dst-port: 53}, dns: {domain-name: api.example.com}}
//!       direction: out
//!     session:
//!       https:
//!         protocols: {tcp: {dst-port: 443}}
//!         direction: out
//!         initiator: src
//! ```
//!
//! Entry `k`, counting individual policies first, owns the queue ids
//! `k * NFQ_ID_STRIDE .. (k + 1) * NFQ_ID_STRIDE`.

mod accumulator;

pub use accumulator::InteractionAccumulator;

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::info;

use crate::config::{DeviceInfo, PolicyKind, Profile};
use crate::policy::{CounterTarget, NftRule, PolicyError};
use crate::protocol::FieldRule;

/// Queue ids reserved for each top-level policy.
pub const NFQ_ID_STRIDE: u16 = 10;

/// Profile compilation errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("policy '{entry}', leaf '{leaf}': {source}")]
    Policy {
        entry: String,
        leaf: String,
        #[source]
        source: PolicyError,
    },

    #[error("policy '{entry}' needs more than {limit} queue ids")]
    QueueIdsExhausted { entry: String, limit: u16 },

    #[error("policy name {0:?} is not a string")]
    InvalidName(String),

    #[error("policy '{entry}': leaf name '{leaf}' is already used")]
    DuplicateLeaf { entry: String, leaf: String },

    #[error("too many policies for the queue id space")]
    TooManyPolicies,
}

/// One compiled leaf of a top-level policy.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledLeaf {
    pub name: String,
    pub rule: NftRule,
    /// Userspace conditions, in evaluation order
    pub nfq: Vec<FieldRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<u16>,
    /// Index of the state this leaf is matched in
    pub state: usize,
    pub periodic: bool,
    pub transient: bool,
    pub backward: bool,
    pub threaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_parser: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterTarget>,
}

/// One compiled top-level policy.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledPolicy {
    pub name: String,
    pub kind: PolicyKind,
    pub nfq_id_base: u16,
    pub rules: Vec<NftRule>,
    pub leaves: Vec<CompiledLeaf>,
    pub custom_parsers: BTreeSet<String>,
    pub counters: BTreeMap<String, CounterTarget>,
    pub states: Vec<String>,
    pub max_threads: usize,
}

/// Compiler output for a whole profile.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledProfile {
    pub device: DeviceInfo,
    pub policies: Vec<CompiledPolicy>,
}

impl CompiledProfile {
    pub fn policy(&self, name: &str) -> Option<&CompiledPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }
}

/// Keys that only appear in a leaf body.
const LEAF_KEYS: &[&str] = &["protocols", "direction", "backward", "initiator", "stats"];

fn is_group(body: &Value) -> bool {
    match body {
        Value::Mapping(map) => {
            !map.is_empty()
                && !LEAF_KEYS.iter().any(|key| map.contains_key(*key))
                && map.values().all(Value::is_mapping)
        }
        _ => false,
    }
}

/// Flatten nested groups into their leaves, depth-first in declaration order.
///
/// A mapping holding any leaf key (`protocols`, `direction`, `backward`,
/// `initiator`, `stats`) is a leaf. Any other mapping whose values are all
/// mappings is a group; anything else is a leaf, which then fails for the
/// missing `protocols`. Leaf names name counters, so they must be unique
/// within the entry.
pub fn flatten<'a>(name: &'a str, body: &'a Value) -> Result<Vec<(&'a str, &'a Value)>, CompileError> {
    let mut leaves = Vec::new();
    flatten_into(name, body, &mut leaves)?;

    let mut seen = HashSet::new();
    for (leaf, _) in &leaves {
        if !seen.insert(*leaf) {
            return Err(CompileError::DuplicateLeaf {
                entry: name.to_string(),
                leaf: leaf.to_string(),
            });
        }
    }
    Ok(leaves)
}

fn flatten_into<'a>(
    name: &'a str,
    body: &'a Value,
    leaves: &mut Vec<(&'a str, &'a Value)>,
) -> Result<(), CompileError> {
    match body {
        Value::Mapping(children) if is_group(body) => {
            for (key, child) in children {
                flatten_into(entry_name(key)?, child, leaves)?;
            }
        }
        _ => leaves.push((name, body)),
    }
    Ok(())
}

fn entry_name(key: &Value) -> Result<&str, CompileError> {
    key.as_str().ok_or_else(|| CompileError::InvalidName(format!("{:?}", key)))
}

fn compile_entry(
    name: &str,
    body: &Value,
    kind: PolicyKind,
    nfq_id_base: u16,
    device: &DeviceInfo,
) -> Result<CompiledPolicy, CompileError> {
    let leaves = match kind {
        PolicyKind::Individual => vec![(name, body)],
        PolicyKind::Interaction => flatten(name, body)?,
    };

    let mut acc = InteractionAccumulator::new(name, nfq_id_base, leaves.len());
    for (leaf, leaf_body) in leaves {
        acc.add_leaf(leaf, leaf_body, device)?;
    }
    Ok(acc.finish(kind))
}

/// Compile every policy of a profile, individual policies first.
pub fn compile_profile(profile: &Profile) -> Result<CompiledProfile, CompileError> {
    let sections: [(&Mapping, PolicyKind); 2] = [
        (&profile.individual_policies, PolicyKind::Individual),
        (&profile.interaction_policies, PolicyKind::Interaction),
    ];

    let mut policies: Vec<CompiledPolicy> = Vec::new();
    // Counters are named after leaves and share one nftables table
    let mut leaf_names = HashSet::new();
    for (map, kind) in sections {
        for (key, body) in map {
            let nfq_id_base = u16::try_from(policies.len())
                .ok()
                .and_then(|k| k.checked_mul(NFQ_ID_STRIDE))
                .ok_or(CompileError::TooManyPolicies)?;
            let compiled = compile_entry(entry_name(key)?, body, kind, nfq_id_base, &profile.device)?;
            for leaf in &compiled.leaves {
                if !leaf_names.insert(leaf.name.clone()) {
                    return Err(CompileError::DuplicateLeaf {
                        entry: compiled.name.clone(),
                        leaf: leaf.name.clone(),
                    });
                }
            }
            policies.push(compiled);
        }
    }

    info!(
        device = %profile.device.name,
        policies = policies.len(),
        leaves = policies.iter().map(|p| p.leaves.len()).sum::<usize>(),
        "compiled profile"
    );

    Ok(CompiledProfile {
        device: profile.device.clone(),
        policies,
    })
}
