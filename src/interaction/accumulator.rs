//! Sequencing of the leaves of one top-level policy.

use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{CompileError, CompiledLeaf, CompiledPolicy, NFQ_ID_STRIDE};
use crate::config::{DeviceInfo, PolicyKind};
use crate::policy::{CounterTarget, Policy, PolicyError};

/// Mutable state while compiling the leaves of one entry.
///
/// Leaves are added in order; each one may advance the state machine, take
/// a queue id, and need a thread in the generated runtime.
#[derive(Debug)]
pub struct InteractionAccumulator {
    entry: String,
    leaf_count: usize,
    index: usize,
    current_state: usize,
    states: Vec<String>,
    nfq_id_base: u16,
    next_nfq_id: u16,
    nfq_id_limit: u16,
    max_threads: usize,
    counters: BTreeMap<String, CounterTarget>,
    custom_parsers: BTreeSet<String>,
    leaves: Vec<CompiledLeaf>,
}

fn state_name(index: usize) -> String {
    format!("STATE_{}", index)
}

impl InteractionAccumulator {
    /// `nfq_id_base` is the first queue id this entry may use.
    pub fn new(entry: impl Into<String>, nfq_id_base: u16, leaf_count: usize) -> Self {
        Self {
            entry: entry.into(),
            leaf_count,
            index: 0,
            current_state: 0,
            states: Vec::new(),
            nfq_id_base,
            next_nfq_id: nfq_id_base,
            nfq_id_limit: nfq_id_base.saturating_add(NFQ_ID_STRIDE),
            max_threads: 0,
            counters: BTreeMap::new(),
            custom_parsers: BTreeSet::new(),
            leaves: Vec::with_capacity(leaf_count),
        }
    }

    fn policy_error(&self, leaf: &str, source: PolicyError) -> CompileError {
        CompileError::Policy {
            entry: self.entry.clone(),
            leaf: leaf.to_string(),
            source,
        }
    }

    fn take_queue_id(&mut self) -> Result<u16, CompileError> {
        if self.next_nfq_id >= self.nfq_id_limit {
            return Err(CompileError::QueueIdsExhausted {
                entry: self.entry.clone(),
                limit: NFQ_ID_STRIDE,
            });
        }
        let id = self.next_nfq_id;
        self.next_nfq_id += 1;
        Ok(id)
    }

    /// Compile the next leaf.
    pub fn add_leaf(&mut self, name: &str, body: &Value, device: &DeviceInfo) -> Result<(), CompileError> {
        let mut policy = Policy::new(name, body, device).map_err(|e| self.policy_error(name, e))?;
        policy.parse().map_err(|e| self.policy_error(name, e))?;

        let is_last = self.index + 1 >= self.leaf_count;
        let periodic = policy.is_periodic();
        let transient = policy.is_transient();
        let backward = policy.is_backward();
        let has_nfq = !policy.nfq_rules().is_empty();
        let has_counters = !policy.counters().is_empty();

        let queue_id = if (backward && !periodic) || has_nfq || has_counters {
            Some(self.take_queue_id()?)
        } else {
            None
        };
        let rule = policy
            .build_nft_rule(queue_id)
            .map_err(|e| self.policy_error(name, e))?;

        let threaded = !periodic && (self.leaf_count > 1 || has_nfq || has_counters);
        if threaded {
            self.max_threads += 1;
        }

        if let Some(parser) = policy.custom_parser() {
            self.custom_parsers.insert(parser.to_string());
        }
        for (stat, target) in policy.counters() {
            *self.counters.entry(stat.clone()).or_default() += *target;
        }

        // A settling last leaf stays in its predecessor's state
        let settles = is_last && (periodic || (transient && !backward));
        let state = if settles && !self.states.is_empty() {
            self.current_state - 1
        } else {
            self.states.push(state_name(self.current_state));
            self.current_state += 1;
            self.current_state - 1
        };

        debug!(
            entry = %self.entry,
            leaf = name,
            state,
            queue_id = ?queue_id,
            threaded,
            "compiled leaf"
        );

        self.leaves.push(CompiledLeaf {
            name: name.to_string(),
            rule,
            nfq: policy.nfq_rules().to_vec(),
            queue_id,
            state,
            periodic,
            transient,
            backward,
            threaded,
            custom_parser: policy.custom_parser().map(str::to_string),
            counters: policy.counters().clone(),
        });
        self.index += 1;
        Ok(())
    }

    pub fn finish(self, kind: PolicyKind) -> CompiledPolicy {
        CompiledPolicy {
            name: self.entry,
            kind,
            nfq_id_base: self.nfq_id_base,
            rules: self.leaves.iter().map(|leaf| leaf.rule.clone()).collect(),
            leaves: self.leaves,
            custom_parsers: self.custom_parsers,
            counters: self.counters,
            states: self.states,
            max_threads: self.max_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_support::{device, yaml};

    const QUERY: &str = "{protocols: {udp: {dst-port: 53}, dns: {domain-name: example.com}}, direction: out}";
    const ANSWER: &str =
        "{protocols: {udp: {dst-port: 53}, dns: {domain-name: example.com}}, direction: in, backward: true}";
    const PLAIN: &str = "{protocols: {tcp: {dst-port: 443}}, direction: out}";

    fn run(base: u16, leaves: &[(&str, &str)]) -> Result<CompiledPolicy, CompileError> {
        let mut acc = InteractionAccumulator::new("entry", base, leaves.len());
        for (name, body) in leaves {
            acc.add_leaf(name, &yaml(body), &device())?;
        }
        Ok(acc.finish(PolicyKind::Interaction))
    }

    #[test]
    fn test_single_plain_leaf() {
        let compiled = run(0, &[("https", PLAIN)]).unwrap();
        let leaf = &compiled.leaves[0];
        assert_eq!(leaf.queue_id, None);
        assert!(!leaf.threaded);
        assert_eq!(leaf.state, 0);
        assert_eq!(compiled.states, vec!["STATE_0"]);
        assert_eq!(compiled.max_threads, 0);
        assert_eq!(compiled.rules[0].forward, "tcp dport 443 accept");
    }

    #[test]
    fn test_queue_ids_start_at_base() {
        let compiled = run(20, &[("query", QUERY), ("answer", ANSWER)]).unwrap();
        let ids: Vec<_> = compiled.leaves.iter().map(|l| l.queue_id).collect();
        assert_eq!(ids, vec![Some(20), Some(21)]);
        assert_eq!(compiled.rules[1].forward, "udp sport 53 queue num 21");
        assert_eq!(compiled.custom_parsers.iter().collect::<Vec<_>>(), vec!["dns"]);
    }

    #[test]
    fn test_backward_leaf_takes_queue_id() {
        let answer = "{protocols: {udp: {dst-port: 53}}, direction: in, backward: true}";
        let compiled = run(0, &[("answer", answer)]).unwrap();
        assert_eq!(compiled.leaves[0].queue_id, Some(0));
    }

    #[test]
    fn test_periodic_last_leaf_settles() {
        let heartbeat = "{protocols: {tcp: {dst-port: 443}}, direction: out, stats: {rate: 1/second}}";
        let compiled = run(0, &[("login", QUERY), ("heartbeat", heartbeat)]).unwrap();
        assert_eq!(compiled.states, vec!["STATE_0"]);
        assert_eq!(compiled.leaves[0].state, 0);
        assert_eq!(compiled.leaves[1].state, 0);
        assert!(!compiled.leaves[1].threaded);
        assert_eq!(compiled.leaves[1].queue_id, None);
        assert_eq!(compiled.max_threads, 1);
    }

    #[test]
    fn test_transient_last_leaf_settles_unless_backward() {
        let burst = "{protocols: {tcp: {dst-port: 443}}, direction: out, stats: {packet-count: 10}}";
        let compiled = run(0, &[("query", QUERY), ("burst", burst)]).unwrap();
        assert_eq!(compiled.states, vec!["STATE_0"]);
        assert_eq!(compiled.leaves[1].state, 0);

        let reply = "{protocols: {tcp: {dst-port: 443}}, direction: in, backward: true, stats: {duration: 30s}}";
        let compiled = run(0, &[("query", QUERY), ("reply", reply)]).unwrap();
        assert_eq!(compiled.states, vec!["STATE_0", "STATE_1"]);
        assert_eq!(compiled.leaves[1].state, 1);
    }

    #[test]
    fn test_single_settling_leaf_has_a_state() {
        let heartbeat = "{protocols: {tcp: {dst-port: 443}}, direction: out, stats: {rate: 1/second}}";
        let compiled = run(0, &[("heartbeat", heartbeat)]).unwrap();
        assert_eq!(compiled.states, vec!["STATE_0"]);
        assert_eq!(compiled.leaves[0].state, 0);
    }

    #[test]
    fn test_one_state_per_advancing_leaf() {
        let step = "{protocols: {tcp: {dst-port: 80}, http: {method: get}}, direction: out}";
        let compiled = run(0, &[("first", step), ("second", step), ("third", step)]).unwrap();
        assert_eq!(compiled.states, vec!["STATE_0", "STATE_1", "STATE_2"]);
        let states: Vec<_> = compiled.leaves.iter().map(|l| l.state).collect();
        assert_eq!(states, vec![0, 1, 2]);
        let ids: Vec<_> = compiled.leaves.iter().map(|l| l.queue_id).collect();
        assert_eq!(ids, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(compiled.max_threads, 3);
    }

    #[test]
    fn test_counters_summed() {
        let a = "{protocols: {}, direction: out, stats: {packet-count: {out: 100, in: 50}}}";
        let b = "{protocols: {}, direction: out, stats: {packet-count: {out: 10}, duration: 5}}";
        let compiled = run(0, &[("a", a), ("b", b)]).unwrap();
        assert_eq!(compiled.counters["packet-count"], CounterTarget::split(Some(110), Some(50)));
        assert_eq!(compiled.counters["duration"], CounterTarget::both(5));
    }

    #[test]
    fn test_queue_ids_exhausted() {
        let leaves: Vec<_> = (0..11).map(|_| ("query", QUERY)).collect();
        let err = run(0, &leaves).unwrap_err();
        assert!(matches!(err, CompileError::QueueIdsExhausted { limit: 10, .. }));
    }

    #[test]
    fn test_policy_error_names_leaf() {
        let err = run(0, &[("ok", PLAIN), ("broken", "{direction: out}")]).unwrap_err();
        match err {
            CompileError::Policy { entry, leaf, source } => {
                assert_eq!(entry, "entry");
                assert_eq!(leaf, "broken");
                assert_eq!(source, PolicyError::MissingProtocols);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
