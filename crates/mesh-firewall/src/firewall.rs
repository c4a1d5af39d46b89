//! The firewall facade: published rule tables, conntrack, and the
//! per-packet decision.

use crate::conntrack::{Conn, Conntrack, ConntrackCache, ConntrackState};
use crate::error::{FirewallError, RuleError};
use crate::rtt;
use crate::ruleset::{Protocol, RuleSink, Ruleset};
use arc_swap::ArcSwap;
use ipnetwork::Ipv4Network;
use mesh_common::{proto, CaPool, Certificate, Counter, FlowKey, Ipv4Tree, Peer, RttHistogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-direction drop counters.
#[derive(Debug, Default)]
struct DropCounters {
    local_ip: Counter,
    remote_ip: Counter,
    no_rule: Counter,
}

/// The packet filter for one node. Constructed once from the node's own
/// certificate; rules load before the first packet and are replaced
/// wholesale on reload.
pub struct Firewall {
    conntrack: Conntrack,
    ruleset: ArcSwap<Ruleset>,
    rules_version: AtomicU16,

    local_ips: Ipv4Tree<()>,

    tcp_timeout: Duration,
    udp_timeout: Duration,
    default_timeout: Duration,

    pub(crate) in_send_reject: bool,
    pub(crate) out_send_reject: bool,

    incoming_drops: DropCounters,
    outgoing_drops: DropCounters,
    tcp_rtt: RttHistogram,
}

impl Firewall {
    /// Build a firewall for the node owning `cert`. The certificate's
    /// addresses (as /32) and subnets become the local-IP ownership set;
    /// the expiry wheel is sized from the extreme timeouts.
    pub fn new(
        cert: &Certificate,
        tcp_timeout: Duration,
        udp_timeout: Duration,
        default_timeout: Duration,
    ) -> Self {
        let min = tcp_timeout.min(udp_timeout).min(default_timeout);
        let max = tcp_timeout.max(udp_timeout).max(default_timeout);

        let mut local_ips = Ipv4Tree::new();
        for net in cert.ips() {
            local_ips.add(Ipv4Network::from(net.ip()), ());
        }
        for net in cert.subnets() {
            local_ips.add(*net, ());
        }

        Self {
            conntrack: Conntrack::new(min, max),
            ruleset: ArcSwap::from_pointee(Ruleset::new()),
            rules_version: AtomicU16::new(0),
            local_ips,
            tcp_timeout,
            udp_timeout,
            default_timeout,
            in_send_reject: false,
            out_send_reject: false,
            incoming_drops: DropCounters::default(),
            outgoing_drops: DropCounters::default(),
            tcp_rtt: RttHistogram::new(),
        }
    }

    /// Current rules version; bumped on every published reload.
    pub fn rules_version(&self) -> u16 {
        self.rules_version.load(Ordering::Acquire)
    }

    /// Whether refused packets in the given direction should be actively
    /// rejected rather than silently dropped.
    pub fn send_reject(&self, incoming: bool) -> bool {
        if incoming {
            self.in_send_reject
        } else {
            self.out_send_reject
        }
    }

    /// Connection tracker.
    pub fn conntrack(&self) -> &Conntrack {
        &self.conntrack
    }

    /// TCP round-trip-time histogram.
    pub fn tcp_rtt(&self) -> &RttHistogram {
        &self.tcp_rtt
    }

    /// Install one rule into the published ruleset. This is the load-time
    /// path: the updated set is republished without a version bump.
    #[allow(clippy::too_many_arguments)]
    pub fn add_rule(
        &self,
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
        let mut next = (**self.ruleset.load()).clone();
        next.add_rule(
            incoming, proto, start_port, end_port, groups, host, cidr, local_cidr, ca_name, ca_sha,
        )?;
        self.ruleset.store(Arc::new(next));
        Ok(())
    }

    /// Publish a freshly built ruleset and bump the rules version. Tracked
    /// flows authorized under the previous version are re-validated lazily
    /// on their next packet.
    pub fn reload(&self, ruleset: Ruleset) {
        self.ruleset.store(Arc::new(ruleset));
        self.rules_version.fetch_add(1, Ordering::AcqRel);
        tracing::info!(
            version = self.rules_version(),
            hashes = %self.rule_hashes(),
            "firewall ruleset replaced"
        );
    }

    /// Hex SHA-256 digest of the canonical rules text.
    pub fn rule_hash_sha256(&self) -> String {
        self.ruleset.load().sha256_hex()
    }

    /// FNV-1a 32-bit digest of the canonical rules text.
    pub fn rule_hash_fnv32(&self) -> u32 {
        self.ruleset.load().fnv32()
    }

    /// Both digests in one string, suitable for logging.
    pub fn rule_hashes(&self) -> String {
        self.ruleset.load().hashes()
    }

    /// Filter one packet. `Ok(())` means the packet may cross the tunnel
    /// boundary; the error names the reason it may not. Exactly one drop
    /// counter is incremented per refused packet, none on allow.
    pub fn decide(
        &self,
        packet: &[u8],
        key: &FlowKey,
        incoming: bool,
        peer: &Peer,
        cas: &CaPool,
        cache: Option<&mut ConntrackCache>,
    ) -> Result<(), FirewallError> {
        // Established flows skip validation entirely: the flow was
        // authorized when installed and a refresh is cheaper than a match.
        if self.lookup_and_refresh(packet, key, incoming, peer, cas, cache) {
            return Ok(());
        }

        // The remote address must be one the peer's certificate authorizes.
        match peer.remote_tree() {
            Some(tree) => {
                if !tree.contains(key.remote_ip) {
                    self.drops(incoming).remote_ip.inc();
                    return Err(FirewallError::InvalidRemoteIp);
                }
            }
            None => {
                // Single-address certificate: exact match required.
                if key.remote_ip != peer.vpn_ip() {
                    self.drops(incoming).remote_ip.inc();
                    return Err(FirewallError::InvalidRemoteIp);
                }
            }
        }

        // And we must own the local address.
        if !self.local_ips.contains(key.local_ip) {
            self.drops(incoming).local_ip.inc();
            return Err(FirewallError::InvalidLocalIp);
        }

        let ruleset = self.ruleset.load();
        if !ruleset.table(incoming).matches(key, incoming, peer.cert(), cas) {
            self.drops(incoming).no_rule.inc();
            return Err(FirewallError::NoMatchingRule);
        }

        // Conntrack the allowed flow so the rest of it takes the fast path.
        self.install(packet, *key, incoming);
        Ok(())
    }

    fn drops(&self, incoming: bool) -> &DropCounters {
        if incoming {
            &self.incoming_drops
        } else {
            &self.outgoing_drops
        }
    }

    // ========================================================================
    // Conntrack operations
    // ========================================================================

    /// Fast path for established flows: confirm the fingerprint, refresh
    /// its expiry, and feed the RTT sampler. Returns false on miss or when
    /// a stale-version entry no longer passes the current ruleset.
    fn lookup_and_refresh(
        &self,
        packet: &[u8],
        key: &FlowKey,
        incoming: bool,
        peer: &Peer,
        cas: &CaPool,
        cache: Option<&mut ConntrackCache>,
    ) -> bool {
        if let Some(cache) = &cache {
            if cache.contains(key) {
                return true;
            }
        }

        let mut state = self.conntrack.lock();

        // Retire at most one fired ticket per call; amortized over packets
        // this keeps the wheel drained without a sweeper thread.
        if let Some(expired) = state.wheel.purge() {
            Self::evict_locked(&mut state, expired);
        }

        let current_version = self.rules_version();
        let Some(conn) = state.conns.get_mut(key) else {
            return false;
        };

        if conn.rules_version != current_version {
            // Entry predates the current ruleset; re-check it under the
            // table that originally admitted it.
            let conn_incoming = conn.incoming;
            let old_version = conn.rules_version;
            let ruleset = self.ruleset.load();
            if !ruleset
                .table(conn_incoming)
                .matches(key, conn_incoming, peer.cert(), cas)
            {
                tracing::debug!(
                    ?key,
                    incoming = conn_incoming,
                    version = current_version,
                    old_version,
                    "dropping conntrack entry, does not match new ruleset"
                );
                state.conns.remove(key);
                return false;
            }

            tracing::debug!(
                ?key,
                incoming = conn_incoming,
                version = current_version,
                old_version,
                "keeping conntrack entry, matches new ruleset"
            );
            conn.rules_version = current_version;
        }

        let now = Instant::now();
        match key.protocol {
            proto::TCP => {
                conn.expires_at = now + self.tcp_timeout;
                if incoming {
                    rtt::check(conn, packet, &self.tcp_rtt, now);
                } else {
                    rtt::arm(conn, packet, now);
                }
            }
            proto::UDP => conn.expires_at = now + self.udp_timeout,
            _ => conn.expires_at = now + self.default_timeout,
        }

        drop(state);

        if let Some(cache) = cache {
            cache.insert(*key);
        }

        true
    }

    /// Track a newly allowed flow. Called for fresh allows only.
    fn install(&self, packet: &[u8], key: FlowKey, incoming: bool) {
        let now = Instant::now();
        let timeout = self.timeout_for(key.protocol);

        let mut conn = Conn {
            expires_at: now + timeout,
            sent_at: None,
            seq: 0,
            incoming,
            rules_version: self.rules_version(),
        };

        if key.protocol == proto::TCP && !incoming {
            rtt::arm(&mut conn, packet, now);
        }

        let mut state = self.conntrack.lock();
        if !state.conns.contains_key(&key) {
            state.wheel.advance(now);
            state.wheel.add(key, timeout);
        }
        // Overwrite unconditionally; a stale ticket for the old entry
        // resolves through evict.
        state.conns.insert(key, conn);
    }

    fn timeout_for(&self, protocol: u8) -> Duration {
        match protocol {
            proto::TCP => self.tcp_timeout,
            proto::UDP => self.udp_timeout,
            _ => self.default_timeout,
        }
    }

    /// Resolve one fired wheel ticket: drop the entry if its expiry really
    /// passed, otherwise re-schedule for the remaining lifetime. Caller
    /// holds the conntrack lock.
    fn evict_locked(state: &mut ConntrackState, key: FlowKey) {
        let Some(conn) = state.conns.get(&key) else {
            return;
        };

        let now = Instant::now();
        let remaining = conn.expires_at.saturating_duration_since(now);

        if remaining > Duration::ZERO {
            // Refreshed since the ticket was cut; push it out again.
            state.wheel.advance(now);
            state.wheel.add(key, remaining);
            return;
        }

        state.conns.remove(&key);
    }

    // ========================================================================
    // Stats
    // ========================================================================

    /// Point-in-time gauges and counters.
    pub fn stats(&self) -> FirewallStats {
        FirewallStats {
            conntrack_count: self.conntrack.len(),
            rules_version: self.rules_version(),
            rules_hash_fnv: self.rule_hash_fnv32(),
            incoming_dropped_local_ip: self.incoming_drops.local_ip.get(),
            incoming_dropped_remote_ip: self.incoming_drops.remote_ip.get(),
            incoming_dropped_no_rule: self.incoming_drops.no_rule.get(),
            outgoing_dropped_local_ip: self.outgoing_drops.local_ip.get(),
            outgoing_dropped_remote_ip: self.outgoing_drops.remote_ip.get(),
            outgoing_dropped_no_rule: self.outgoing_drops.no_rule.get(),
            tcp_rtt_samples: self.tcp_rtt.count(),
        }
    }

    /// Log the exported gauge values under their metric names.
    pub fn emit_stats(&self) {
        let s = self.stats();
        tracing::info!(
            firewall.conntrack.count = s.conntrack_count,
            firewall.rules.version = s.rules_version,
            firewall.rules.hash = s.rules_hash_fnv,
            network.tcp.rtt.count = s.tcp_rtt_samples,
            "firewall stats"
        );
    }
}

impl RuleSink for Firewall {
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
        Firewall::add_rule(
            self, incoming, proto, start_port, end_port, groups, host, cidr, local_cidr, ca_name,
            ca_sha,
        )
    }
}

/// Point-in-time firewall gauges and counters.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStats {
    /// Tracked flows.
    pub conntrack_count: usize,
    /// Current rules version.
    pub rules_version: u16,
    /// FNV-1a digest of the canonical rules text.
    pub rules_hash_fnv: u32,
    /// Inbound packets dropped for an unowned local address.
    pub incoming_dropped_local_ip: u64,
    /// Inbound packets dropped for an unauthorized remote address.
    pub incoming_dropped_remote_ip: u64,
    /// Inbound packets dropped with no matching rule.
    pub incoming_dropped_no_rule: u64,
    /// Outbound packets dropped for an unowned local address.
    pub outgoing_dropped_local_ip: u64,
    /// Outbound packets dropped for an unauthorized remote address.
    pub outgoing_dropped_remote_ip: u64,
    /// Outbound packets dropped with no matching rule.
    pub outgoing_dropped_no_rule: u64,
    /// TCP RTT samples recorded.
    pub tcp_rtt_samples: u64,
}
