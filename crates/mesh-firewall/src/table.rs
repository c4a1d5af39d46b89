//! Rule compilation structures: CA scopes, port maps, protocol tables.
//!
//! A flat rule list compiles into `RuleTable → PortMap → CaScope → Rule`
//! so a packet resolves in a handful of hash lookups.

use crate::error::RuleError;
use crate::rule::Rule;
use ipnetwork::Ipv4Network;
use mesh_common::{proto, CaPool, Certificate, FlowKey, PORT_ANY, PORT_FRAGMENT};
use std::collections::HashMap;

/// Partition of one port slot's rules by how the issuing CA is pinned:
/// not at all, by certificate fingerprint, or by CA subject name.
#[derive(Debug, Clone, Default)]
pub struct CaScope {
    any: Option<Rule>,
    by_name: HashMap<String, Rule>,
    by_fingerprint: HashMap<String, Rule>,
}

impl CaScope {
    /// Route a predicate to the right leaf. A rule naming both a
    /// fingerprint and a name lands in both scopes.
    pub fn add(
        &mut self,
        groups: &[String],
        host: &str,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
        ca_name: &str,
        ca_sha: &str,
    ) {
        if ca_sha.is_empty() && ca_name.is_empty() {
            self.any
                .get_or_insert_with(Rule::new)
                .add(groups, host, cidr, local_cidr);
            return;
        }

        if !ca_sha.is_empty() {
            self.by_fingerprint
                .entry(ca_sha.to_string())
                .or_default()
                .add(groups, host, cidr, local_cidr);
        }

        if !ca_name.is_empty() {
            self.by_name
                .entry(ca_name.to_string())
                .or_default()
                .add(groups, host, cidr, local_cidr);
        }
    }

    /// Unpinned leaf first, then the fingerprint scope, then the name scope
    /// (which needs the CA pool to resolve the issuer).
    pub fn matches(&self, p: &FlowKey, cert: &Certificate, cas: &CaPool) -> bool {
        if let Some(rule) = &self.any {
            if rule.matches(p, cert) {
                return true;
            }
        }

        if let Some(rule) = self.by_fingerprint.get(cert.issuer_fingerprint()) {
            if rule.matches(p, cert) {
                return true;
            }
        }

        let Some(ca) = cas.ca_for_cert(cert) else {
            return false;
        };
        self.by_name
            .get(ca.name())
            .is_some_and(|rule| rule.matches(p, cert))
    }
}

/// Port-indexed rule slots. Keyed as `i32` so [`PORT_ANY`] and
/// [`PORT_FRAGMENT`] sit alongside the numeric ports.
#[derive(Debug, Clone, Default)]
pub struct PortMap {
    slots: HashMap<i32, CaScope>,
}

impl PortMap {
    /// Install a predicate across an inclusive port range, materializing a
    /// scope per port. Ranges are small in practice.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        start: i32,
        end: i32,
        groups: &[String],
        host: &str,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
        ca_name: &str,
        ca_sha: &str,
    ) -> Result<(), RuleError> {
        if start > end {
            return Err(RuleError::InvertedPortRange);
        }

        for port in start..=end {
            self.slots
                .entry(port)
                .or_default()
                .add(groups, host, cidr, local_cidr, ca_name, ca_sha);
        }

        Ok(())
    }

    /// Probe the slot for the packet's port (local for inbound, remote for
    /// outbound, the fragment sentinel for fragments), then the any-port
    /// slot.
    pub fn matches(&self, p: &FlowKey, incoming: bool, cert: &Certificate, cas: &CaPool) -> bool {
        let port = if p.fragment {
            PORT_FRAGMENT
        } else if incoming {
            i32::from(p.local_port)
        } else {
            i32::from(p.remote_port)
        };

        if self
            .slots
            .get(&port)
            .is_some_and(|scope| scope.matches(p, cert, cas))
        {
            return true;
        }

        self.slots
            .get(&PORT_ANY)
            .is_some_and(|scope| scope.matches(p, cert, cas))
    }
}

/// Four port maps keyed by protocol. Matching consults the
/// protocol-agnostic map first, then the per-protocol map; protocols
/// outside tcp/udp/icmp only ever match through the agnostic map.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    pub(crate) tcp: PortMap,
    pub(crate) udp: PortMap,
    pub(crate) icmp: PortMap,
    pub(crate) any_proto: PortMap,
}

impl RuleTable {
    /// True if any rule in the table authorizes the packet.
    pub fn matches(&self, p: &FlowKey, incoming: bool, cert: &Certificate, cas: &CaPool) -> bool {
        if self.any_proto.matches(p, incoming, cert, cas) {
            return true;
        }

        match p.protocol {
            proto::TCP => self.tcp.matches(p, incoming, cert, cas),
            proto::UDP => self.udp.matches(p, incoming, cert, cas),
            proto::ICMP => self.icmp.matches(p, incoming, cert, cas),
            _ => false,
        }
    }
}
