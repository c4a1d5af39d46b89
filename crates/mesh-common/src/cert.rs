//! Decoded certificate and CA pool model.
//!
//! The filter core never parses or verifies certificates. The tunnel layer
//! hands it this already-verified view of the peer's identity.

use crate::cidr::Ipv4Tree;
use ipnetwork::Ipv4Network;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// A certificate after signature verification: the subject name, the
/// fingerprint of the issuing CA, the group claims, the addresses the
/// certificate binds, and any routable subnets it claims.
#[derive(Debug, Clone)]
pub struct Certificate {
    name: String,
    issuer_fingerprint: String,
    groups: HashSet<String>,
    ips: Vec<Ipv4Network>,
    subnets: Vec<Ipv4Network>,
}

impl Certificate {
    /// A certificate with the given subject, issued by the CA with the
    /// given fingerprint.
    pub fn new(name: impl Into<String>, issuer_fingerprint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            issuer_fingerprint: issuer_fingerprint.into(),
            groups: HashSet::new(),
            ips: Vec::new(),
            subnets: Vec::new(),
        }
    }

    /// Attach group claims.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Attach bound addresses (address + the network it was assigned from).
    pub fn with_ips(mut self, ips: impl IntoIterator<Item = Ipv4Network>) -> Self {
        self.ips = ips.into_iter().collect();
        self
    }

    /// Attach claimed routable subnets.
    pub fn with_subnets(mut self, subnets: impl IntoIterator<Item = Ipv4Network>) -> Self {
        self.subnets = subnets.into_iter().collect();
        self
    }

    /// Subject name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fingerprint of the issuing CA.
    pub fn issuer_fingerprint(&self) -> &str {
        &self.issuer_fingerprint
    }

    /// Group claims.
    pub fn groups(&self) -> &HashSet<String> {
        &self.groups
    }

    /// True if the certificate claims the group.
    #[inline]
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Bound addresses.
    pub fn ips(&self) -> &[Ipv4Network] {
        &self.ips
    }

    /// Claimed routable subnets.
    pub fn subnets(&self) -> &[Ipv4Network] {
        &self.subnets
    }
}

/// The set of trusted CAs, keyed by certificate fingerprint.
#[derive(Debug, Clone, Default)]
pub struct CaPool {
    cas: HashMap<String, Arc<Certificate>>,
}

impl CaPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a CA certificate under its own fingerprint.
    pub fn add_ca(&mut self, fingerprint: impl Into<String>, ca: Certificate) {
        self.cas.insert(fingerprint.into(), Arc::new(ca));
    }

    /// Resolve the CA that issued the given certificate, if trusted.
    pub fn ca_for_cert(&self, cert: &Certificate) -> Option<&Arc<Certificate>> {
        self.cas.get(cert.issuer_fingerprint())
    }
}

/// Per-tunnel peer handle handed to the filter with each packet.
#[derive(Debug, Clone)]
pub struct Peer {
    cert: Arc<Certificate>,
    vpn_ip: Ipv4Addr,
    remote_tree: Option<Ipv4Tree<()>>,
}

impl Peer {
    /// Build the handle from a verified certificate. When the certificate
    /// claims subnets beyond its address, remote-address validation walks a
    /// prefix tree over address + subnets; otherwise the cheaper
    /// single-address equality check applies.
    pub fn new(cert: Certificate) -> Self {
        let vpn_ip = cert
            .ips()
            .first()
            .map(|net| net.ip())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let remote_tree = if cert.subnets().is_empty() {
            None
        } else {
            let mut tree = Ipv4Tree::new();
            for net in cert.ips() {
                tree.add(Ipv4Network::from(net.ip()), ());
            }
            for net in cert.subnets() {
                tree.add(*net, ());
            }
            Some(tree)
        };

        Self {
            cert: Arc::new(cert),
            vpn_ip,
            remote_tree,
        }
    }

    /// The peer's certificate.
    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    /// The peer's tunnel address.
    pub fn vpn_ip(&self) -> Ipv4Addr {
        self.vpn_ip
    }

    /// Claimed-address tree, present only for subnet-bearing certificates.
    pub fn remote_tree(&self) -> Option<&Ipv4Tree<()>> {
        self.remote_tree.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_ca_lookup_by_issuer() {
        let mut pool = CaPool::new();
        pool.add_ca("abc123", Certificate::new("prod ca", ""));

        let cert = Certificate::new("alice", "abc123");
        let ca = pool.ca_for_cert(&cert).unwrap();
        assert_eq!(ca.name(), "prod ca");

        let stranger = Certificate::new("bob", "fingerprint-nobody-knows");
        assert!(pool.ca_for_cert(&stranger).is_none());
    }

    #[test]
    fn test_peer_without_subnets_has_no_tree() {
        let cert = Certificate::new("alice", "ca").with_ips([net("10.0.0.5/24")]);
        let peer = Peer::new(cert);

        assert_eq!(peer.vpn_ip(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(peer.remote_tree().is_none());
    }

    #[test]
    fn test_peer_tree_covers_ip_and_subnets() {
        let cert = Certificate::new("gateway", "ca")
            .with_ips([net("10.0.0.5/24")])
            .with_subnets([net("192.168.50.0/24")]);
        let peer = Peer::new(cert);

        let tree = peer.remote_tree().unwrap();
        assert!(tree.contains(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(tree.contains(Ipv4Addr::new(192, 168, 50, 77)));
        // The /32 from the bound address, not the whole assignment network.
        assert!(!tree.contains(Ipv4Addr::new(10, 0, 0, 6)));
    }
}
