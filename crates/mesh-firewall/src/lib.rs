//! Packet-filtering core for an openmesh node.
//!
//! Every decapsulated inbound packet and every about-to-be-encapsulated
//! outbound packet passes through [`Firewall::decide`] before it may cross
//! the tunnel boundary. The core compiles a flat rule list into per-port,
//! per-CA lookup structures, tracks established flows in a mutex-guarded
//! conntrack paired with a coarse expiry wheel, and opportunistically
//! samples TCP round-trip times.
//!
//! ```text
//! decide(packet)
//!   ├─ conntrack fast path (call-local cache → locked map, refresh expiry)
//!   ├─ remote IP ⊂ peer certificate claims
//!   ├─ local IP ⊂ node-owned addresses
//!   ├─ rule match: proto-any port map, then per-proto port map
//!   │    └─ port slot → CA scope → leaf predicate
//!   └─ install conntrack entry
//! ```
//!
//! Tunnel crypto, certificate parsing, and the raw I/O path live in their
//! own crates; this one only decides.

pub mod config;
pub mod conntrack;
pub mod error;
pub mod firewall;
mod rtt;
pub mod rule;
pub mod ruleset;
pub mod table;
pub mod wheel;

pub use config::{load_rules, ConntrackConfig, FirewallConfig};
pub use conntrack::{Conntrack, ConntrackCache};
pub use error::{ConfigError, FirewallError, RuleError};
pub use firewall::{Firewall, FirewallStats};
pub use rule::Rule;
pub use ruleset::{Protocol, RuleSink, Ruleset};
pub use table::{CaScope, PortMap, RuleTable};
pub use wheel::TimerWheel;
