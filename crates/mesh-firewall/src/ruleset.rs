//! Rule ingestion, canonical rule text, and ruleset digests.

use crate::error::RuleError;
use crate::table::RuleTable;
use ipnetwork::Ipv4Network;
use mesh_common::proto;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

/// Protocols a rule can name. Packets carry raw protocol numbers; this
/// enum exists only on the ingestion side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Matches every protocol.
    Any,
    /// ICMP; port rules address the ICMP code.
    Icmp,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Wire protocol number, with 0 standing in for "any".
    pub fn number(self) -> u8 {
        match self {
            Protocol::Any => proto::ANY,
            Protocol::Icmp => proto::ICMP,
            Protocol::Tcp => proto::TCP,
            Protocol::Udp => proto::UDP,
        }
    }
}

impl FromStr for Protocol {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, RuleError> {
        match s {
            "any" => Ok(Protocol::Any),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(RuleError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Sink for rules produced by the config loader. Implemented by
/// [`Ruleset`], by [`Firewall`](crate::Firewall), and by recording mocks
/// in tests.
pub trait RuleSink {
    /// Install one rule into the given direction table.
    #[allow(clippy::too_many_arguments)]
    fn add_rule(
        &mut self,
        incoming: bool,
        proto: Protocol,
        start_port: i32,
        end_port: i32,
        groups: &[String],
        host: &str,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
        ca_name: &str,
        ca_sha: &str,
    ) -> Result<(), RuleError>;
}

/// A complete inbound+outbound rule compilation plus the canonical text
/// the ruleset digests are computed over.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    inbound: RuleTable,
    outbound: RuleTable,
    text: String,
}

impl Ruleset {
    /// An empty ruleset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbound rule table.
    pub fn inbound(&self) -> &RuleTable {
        &self.inbound
    }

    /// Outbound rule table.
    pub fn outbound(&self) -> &RuleTable {
        &self.outbound
    }

    pub(crate) fn table(&self, incoming: bool) -> &RuleTable {
        if incoming {
            &self.inbound
        } else {
            &self.outbound
        }
    }

    /// Install one rule. The canonical line is appended to the accumulating
    /// text before the rule lands in its table; digests of that text are
    /// compared across nodes and reloads, so the line format never changes.
    #[allow(clippy::too_many_arguments)]
    pub fn add_rule(
        &mut self,
        incoming: bool,
        proto: Protocol,
        start_port: i32,
        end_port: i32,
        groups: &[String],
        host: &str,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
        ca_name: &str,
        ca_sha: &str,
    ) -> Result<(), RuleError> {
        let ip = cidr.map(net_string).unwrap_or_default();
        let local_ip = local_cidr.map(net_string).unwrap_or_default();

        let _ = writeln!(
            self.text,
            "incoming: {}, proto: {}, startPort: {}, endPort: {}, groups: {}, host: {}, ip: {}, localIp: {}, caName: {}, caSha: {}",
            incoming,
            proto.number(),
            start_port,
            end_port,
            GroupsDisplay(groups),
            host,
            ip,
            local_ip,
            ca_name,
            ca_sha,
        );

        tracing::info!(
            direction = if incoming { "incoming" } else { "outgoing" },
            proto = proto.number(),
            start_port,
            end_port,
            ?groups,
            host,
            ip = %ip,
            local_ip = %local_ip,
            ca_name,
            ca_sha,
            "firewall rule added"
        );

        let table = if incoming {
            &mut self.inbound
        } else {
            &mut self.outbound
        };
        let map = match proto {
            Protocol::Tcp => &mut table.tcp,
            Protocol::Udp => &mut table.udp,
            Protocol::Icmp => &mut table.icmp,
            Protocol::Any => &mut table.any_proto,
        };

        map.add(
            start_port, end_port, groups, host, cidr, local_cidr, ca_name, ca_sha,
        )
    }

    /// Hex SHA-256 digest of the canonical rules text.
    pub fn sha256_hex(&self) -> String {
        let digest = Sha256::digest(self.text.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// FNV-1a 32-bit digest of the canonical rules text, for use as a
    /// metric value.
    pub fn fnv32(&self) -> u32 {
        const FNV_OFFSET: u32 = 0x811c9dc5;
        const FNV_PRIME: u32 = 16_777_619;

        let mut h = FNV_OFFSET;
        for byte in self.text.as_bytes() {
            h ^= u32::from(*byte);
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    /// Both digests in one string, suitable for logging.
    pub fn hashes(&self) -> String {
        format!("SHA:{},FNV:{}", self.sha256_hex(), self.fnv32())
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }
}

impl RuleSink for Ruleset {
    fn add_rule(
        &mut self,
        incoming: bool,
        proto: Protocol,
        start_port: i32,
        end_port: i32,
        groups: &[String],
        host: &str,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
        ca_name: &str,
        ca_sha: &str,
    ) -> Result<(), RuleError> {
        Ruleset::add_rule(
            self, incoming, proto, start_port, end_port, groups, host, cidr, local_cidr, ca_name,
            ca_sha,
        )
    }
}

/// The masked network in `a.b.c.d/len` form, host bits stripped.
fn net_string(net: Ipv4Network) -> String {
    format!("{}/{}", net.network(), net.prefix())
}

/// Renders a group list the way the accumulated text has always rendered
/// it: `[a b]`. The digests depend on it.
struct GroupsDisplay<'a>(&'a [String]);

impl fmt::Display for GroupsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, group) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(group)?;
        }
        f.write_str("]")
    }
}
