//! Leaf rule predicates.

use ipnetwork::Ipv4Network;
use mesh_common::{Certificate, FlowKey, Ipv4Tree};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// The most specific rule predicate, evaluated against one packet and the
/// peer certificate. Sub-predicates are alternatives: any one match allows
/// the packet.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Universal match; makes the sub-predicates irrelevant.
    any: bool,
    hosts: HashSet<String>,
    /// Outer list is disjunctive, each inner group set conjunctive.
    groups: Vec<Vec<String>>,
    cidr: Ipv4Tree<()>,
    local_cidr: Ipv4Tree<()>,
}

impl Rule {
    /// An empty leaf that matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one predicate into the leaf. A universal predicate collapses
    /// the leaf to `any` and drops the accumulated sub-predicates; anything
    /// merged afterwards is a no-op.
    pub fn add(
        &mut self,
        groups: &[String],
        host: &str,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
    ) {
        if self.any {
            return;
        }

        if is_universal(groups, host, cidr, local_cidr) {
            self.any = true;
            self.hosts = HashSet::new();
            self.groups = Vec::new();
            self.cidr = Ipv4Tree::new();
            self.local_cidr = Ipv4Tree::new();
            return;
        }

        if !groups.is_empty() {
            self.groups.push(groups.to_vec());
        }
        if !host.is_empty() {
            self.hosts.insert(host.to_string());
        }
        if let Some(net) = cidr {
            self.cidr.add(net, ());
        }
        if let Some(net) = local_cidr {
            self.local_cidr.add(net, ());
        }
    }

    /// True once the leaf has collapsed to a universal match.
    pub fn is_any(&self) -> bool {
        self.any
    }

    /// True if the packet and peer certificate satisfy any sub-predicate.
    pub fn matches(&self, p: &FlowKey, cert: &Certificate) -> bool {
        if self.any {
            return true;
        }

        // Groups first; set containment is cheap and group-scoped rules are
        // the common deployment shape.
        for set in &self.groups {
            if !set.is_empty() && set.iter().all(|g| cert.has_group(g)) {
                return true;
            }
        }

        if self.hosts.contains(cert.name()) {
            return true;
        }

        if self.cidr.contains(p.remote_ip) {
            return true;
        }

        if self.local_cidr.contains(p.local_ip) {
            return true;
        }

        false
    }
}

/// A predicate is universal when it constrains nothing: empty in every
/// dimension, an `any` group or host token, or a CIDR covering 0.0.0.0.
fn is_universal(
    groups: &[String],
    host: &str,
    cidr: Option<Ipv4Network>,
    local_cidr: Option<Ipv4Network>,
) -> bool {
    if groups.is_empty() && host.is_empty() && cidr.is_none() && local_cidr.is_none() {
        return true;
    }

    if groups.iter().any(|g| g == "any") {
        return true;
    }

    if host == "any" {
        return true;
    }

    if let Some(net) = cidr {
        if net.contains(Ipv4Addr::UNSPECIFIED) {
            return true;
        }
    }

    if let Some(net) = local_cidr {
        if net.contains(Ipv4Addr::UNSPECIFIED) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_common::proto;

    fn key() -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            55000,
            443,
            proto::TCP,
        )
    }

    fn cert() -> Certificate {
        Certificate::new("alice", "ca").with_groups(["ops", "db"])
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_predicate_collapses_to_any() {
        let mut rule = Rule::new();
        rule.add(&[], "", None, None);
        assert!(rule.is_any());
        assert!(rule.matches(&key(), &cert()));
    }

    #[test]
    fn test_any_tokens_collapse() {
        let mut rule = Rule::new();
        rule.add(&groups(&["any"]), "", None, None);
        assert!(rule.is_any());

        let mut rule = Rule::new();
        rule.add(&[], "any", None, None);
        assert!(rule.is_any());

        let mut rule = Rule::new();
        rule.add(&[], "", Some("0.0.0.0/0".parse().unwrap()), None);
        assert!(rule.is_any());
    }

    #[test]
    fn test_add_after_collapse_is_noop() {
        let mut rule = Rule::new();
        rule.add(&[], "any", None, None);
        rule.add(&groups(&["nobody"]), "nobody", None, None);
        assert!(rule.is_any());
        assert!(rule.matches(&key(), &Certificate::new("stranger", "ca")));
    }

    #[test]
    fn test_group_set_is_conjunctive() {
        let mut rule = Rule::new();
        rule.add(&groups(&["ops", "db"]), "", None, None);
        assert!(rule.matches(&key(), &cert()));

        // Missing one member of the set.
        let partial = Certificate::new("carol", "ca").with_groups(["ops"]);
        assert!(!rule.matches(&key(), &partial));
    }

    #[test]
    fn test_group_sets_are_disjunctive() {
        let mut rule = Rule::new();
        rule.add(&groups(&["ops", "web"]), "", None, None);
        rule.add(&groups(&["db"]), "", None, None);

        // Fails the first set, passes the second.
        assert!(rule.matches(&key(), &cert()));
    }

    #[test]
    fn test_host_match() {
        let mut rule = Rule::new();
        rule.add(&[], "alice", None, None);
        assert!(rule.matches(&key(), &cert()));
        assert!(!rule.matches(&key(), &Certificate::new("bob", "ca")));
    }

    #[test]
    fn test_cidr_matches_remote_ip() {
        let mut rule = Rule::new();
        rule.add(&[], "", Some("10.0.0.0/24".parse().unwrap()), None);
        assert!(rule.matches(&key(), &Certificate::new("anyone", "ca")));

        let mut far = key();
        far.remote_ip = Ipv4Addr::new(172, 16, 0, 1);
        assert!(!rule.matches(&far, &Certificate::new("anyone", "ca")));
    }

    #[test]
    fn test_local_cidr_matches_local_ip() {
        let mut rule = Rule::new();
        rule.add(&[], "", None, Some("10.0.0.0/24".parse().unwrap()));
        assert!(rule.matches(&key(), &Certificate::new("anyone", "ca")));

        let mut elsewhere = key();
        elsewhere.local_ip = Ipv4Addr::new(172, 16, 0, 1);
        assert!(!rule.matches(&elsewhere, &Certificate::new("anyone", "ca")));
    }
}
