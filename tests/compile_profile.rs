//! End-to-end compilation of YAML device profiles.
//!
//! Run with: cargo test --test compile_profile

use std::io::Write;
use std::path::Path;

use iotfw::config::Profile;
use iotfw::interaction::{compile_profile, CompileError, CompiledProfile};
use iotfw::policy::{CounterTarget, PolicyError};
use tempfile::NamedTempFile;

fn fixture() -> CompiledProfile {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/xiaomi-cam.yaml");
    let profile = Profile::load(path).unwrap();
    compile_profile(&profile).unwrap()
}

fn compile_str(yaml: &str) -> Result<CompiledProfile, CompileError> {
    let profile = Profile::from_yaml(yaml).unwrap();
    compile_profile(&profile)
}

#[test]
fn test_policy_order_and_queue_bases() {
    let compiled = fixture();
    let names: Vec<_> = compiled.policies.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["dns-google", "arp-gateway", "mdns-announce", "cloud-session"]);
    let bases: Vec<_> = compiled.policies.iter().map(|p| p.nfq_id_base).collect();
    assert_eq!(bases, vec![0, 10, 20, 30]);
}

#[test]
fn test_header_only_policy() {
    let compiled = fixture();
    let policy = compiled.policy("dns-google").unwrap();
    assert_eq!(policy.rules.len(), 1);
    assert_eq!(
        policy.rules[0].forward,
        "ip saddr 192.168.1.161 ip daddr 8.8.8.8 udp dport 53 accept"
    );
    assert_eq!(policy.rules[0].backward, None);
    assert!(policy.custom_parsers.is_empty());
    assert_eq!(policy.max_threads, 0);
}

#[test]
fn test_arp_reply_is_mirrored() {
    let compiled = fixture();
    let rule = &compiled.policy("arp-gateway").unwrap().rules[0];
    assert_eq!(
        rule.forward,
        "arp operation request arp saddr ether 78:8b:2a:b2:20:ea arp saddr ip 192.168.1.161 arp daddr ip 192.168.1.1 accept"
    );
    assert_eq!(
        rule.backward.as_deref(),
        Some("arp operation reply arp daddr ether 78:8b:2a:b2:20:ea arp daddr ip 192.168.1.161 arp saddr ip 192.168.1.1 accept")
    );
}

#[test]
fn test_periodic_custom_parser_policy() {
    let compiled = fixture();
    let policy = compiled.policy("mdns-announce").unwrap();
    let leaf = &policy.leaves[0];
    assert!(leaf.periodic);
    assert!(!leaf.threaded);
    assert_eq!(leaf.queue_id, Some(20));
    assert_eq!(
        policy.rules[0].forward,
        "ip saddr 192.168.1.161 ip daddr 224.0.0.251 udp dport 5353 limit rate 1/minute queue num 20"
    );
    assert_eq!(leaf.nfq[0].forward.render(), "message.header.qr == 1");
    assert_eq!(policy.states, vec!["STATE_0"]);
}

#[test]
fn test_interaction_sequence() {
    let compiled = fixture();
    let policy = compiled.policy("cloud-session").unwrap();

    let leaves: Vec<_> = policy.leaves.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(leaves, vec!["query", "answer", "https"]);

    let ids: Vec<_> = policy.leaves.iter().map(|l| l.queue_id).collect();
    assert_eq!(ids, vec![Some(30), Some(31), Some(32)]);

    // The last leaf is transient and describes the outgoing leg
    assert_eq!(policy.states, vec!["STATE_0", "STATE_1"]);
    let states: Vec<_> = policy.leaves.iter().map(|l| l.state).collect();
    assert_eq!(states, vec![0, 1, 1]);
    assert_eq!(policy.max_threads, 3);
    assert_eq!(policy.custom_parsers.iter().collect::<Vec<_>>(), vec!["dns"]);
    assert_eq!(policy.counters["packet-count"], CounterTarget::split(Some(100), Some(50)));

    assert_eq!(
        policy.rules[1].forward,
        "ip daddr 192.168.1.161 ip saddr 192.168.1.1 udp sport 53 queue num 31"
    );
}

#[test]
fn test_domain_destination_goes_to_userspace() {
    let compiled = fixture();
    let https = &compiled.policy("cloud-session").unwrap().leaves[2];

    assert_eq!(
        https.rule.forward,
        "ct original ip saddr 192.168.1.161 ct original proto-dst 443 counter name \"https-out\" queue num 32"
    );
    assert_eq!(
        https.rule.backward.as_deref(),
        Some("ct original ip daddr 192.168.1.161 ct original proto-src 443 counter name \"https-in\" queue num 32")
    );
    assert_eq!(
        https.nfq[0].forward.render(),
        "dns_entry_contains(dns_map_get(dns_map, \"de.api.io.mi.com\"), (ip_addr_t) {.version = 4, .value.ipv4 = get_ipv4_dst_addr(payload)})"
    );
}

#[test]
fn test_output_serializes() {
    let json = serde_json::to_value(fixture()).unwrap();
    assert_eq!(json["device"]["name"], "xiaomi-cam");
    let first = &json["policies"][0];
    assert_eq!(first["kind"], "individual");
    assert!(first["rules"][0].get("backward").is_none());

    let session = &json["policies"][3];
    assert_eq!(session["counters"]["packet-count"], serde_json::json!({"out": 100, "in": 50}));
    let condition = &session["leaves"][0]["nfq"][0]["forward"];
    assert_eq!(condition["template"], "message.header.qr == {}");
    assert_eq!(condition["match"], "0");
}

#[test]
fn test_missing_direction_names_leaf() {
    let err = compile_str(
        r#"
device-info: {name: cam, mac-address: "78:8b:2a:b2:20:ea", ipv4-address: 192.168.1.161}
interaction-policies:
  session:
    first: {protocols: {tcp: {dst-port: 443}}, direction: out}
    second: {protocols: {tcp: {dst-port: 80}}}
"#,
    )
    .unwrap_err();

    match err {
        CompileError::Policy { entry, leaf, source } => {
            assert_eq!(entry, "session");
            assert_eq!(leaf, "second");
            assert_eq!(source, PolicyError::MissingDirection);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_ipv6_self_address() {
    let err = compile_str(
        r#"
device-info: {name: cam, mac-address: "78:8b:2a:b2:20:ea", ipv4-address: 192.168.1.161}
individual-policies:
  v6: {protocols: {ipv6: {src: self}}, direction: out}
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("v6"), "{err}");
}

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
device-info:
  device-name: plug
  mac-address: "50:02:91:10:09:8f"
  ip-address: 192.168.1.135
individual-policies:
  ssdp:
    protocols:
      ipv4: {{src: self, dst: ssdp}}
      udp: {{dst-port: 1900}}
      ssdp: {{method: m-search}}
    direction: out
"#
    )
    .unwrap();

    let profile = Profile::load(file.path()).unwrap();
    let compiled = compile_profile(&profile).unwrap();
    let leaf = &compiled.policies[0].leaves[0];
    assert_eq!(leaf.custom_parser.as_deref(), Some("ssdp"));
    assert_eq!(leaf.nfq[1].forward.render(), "message.method == M_SEARCH");
    assert_eq!(
        leaf.rule.forward,
        "ip saddr 192.168.1.135 ip daddr 239.255.255.250 udp dport 1900 queue num 0"
    );
}
