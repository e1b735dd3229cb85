//! iotfw - compiles IoT device profiles into packet-filter policies.
//!
//! A profile lists the traffic a device is allowed to produce. Each policy is
//! compiled into an nftables rule, plus the conditions a generated nfqueue
//! program checks on packets the kernel cannot classify on its own
//! (application-layer fields, domain names, multi-step interactions).
//!
//! ```no_run
//! use iotfw::config::Profile;
//! use iotfw::interaction::compile_profile;
//!
//! let profile = Profile::load("profiles/xiaomi-cam.yaml")?;
//! let compiled = compile_profile(&profile)?;
//! for policy in &compiled.policies {
//!     for rule in &policy.rules {
//!         println!("{}", rule.forward);
//!     }
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod interaction;
pub mod policy;
pub mod protocol;
pub mod resolver;
pub mod telemetry;

pub use config::{DeviceInfo, PolicyKind, Profile};
pub use interaction::{compile_profile, CompileError, CompiledLeaf, CompiledPolicy, CompiledProfile};
pub use policy::{Direction, NftRule, Policy, PolicyError};
