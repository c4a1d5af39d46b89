//! Stateful connection tracking shared by the packet hot path.

use crate::wheel::TimerWheel;
use mesh_common::FlowKey;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// One tracked flow.
#[derive(Debug, Clone)]
pub(crate) struct Conn {
    /// Absolute expiry; pushed out on every allowed packet.
    pub expires_at: Instant,
    /// When the RTT probe sequence number was recorded.
    pub sent_at: Option<Instant>,
    /// Sequence number we want to see acknowledged. Zero means the sampler
    /// is disarmed or has already fired for this flow.
    pub seq: u32,
    /// Direction of the packet that created the entry; sticky, used to pick
    /// the table for re-validation after a ruleset swap.
    pub incoming: bool,
    /// Ruleset version that last authorized this flow.
    pub rules_version: u16,
}

pub(crate) struct ConntrackState {
    pub conns: HashMap<FlowKey, Conn>,
    pub wheel: TimerWheel<FlowKey>,
}

/// The conntrack map and its expiry wheel under one mutex. They share a
/// critical section so a refresh and a wheel drain for the same fingerprint
/// are always sequenced.
pub struct Conntrack {
    state: Mutex<ConntrackState>,
}

impl Conntrack {
    pub(crate) fn new(min_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ConntrackState {
                conns: HashMap::new(),
                wheel: TimerWheel::new(min_timeout, max_timeout),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConntrackState> {
        self.state.lock()
    }

    /// Number of tracked flows.
    pub fn len(&self) -> usize {
        self.state.lock().conns.len()
    }

    /// True when no flows are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Call-local set of fingerprints already confirmed against conntrack in
/// this batch. Lets repeated packets of one flow skip the lock entirely; a
/// caller may reuse one cache across a batch from the same tunnel.
#[derive(Debug, Default)]
pub struct ConntrackCache(HashSet<FlowKey>);

impl ConntrackCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the fingerprint was confirmed earlier in this batch.
    #[inline]
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.0.contains(key)
    }

    /// Remember a confirmed fingerprint.
    #[inline]
    pub fn insert(&mut self, key: FlowKey) {
        self.0.insert(key);
    }

    /// Number of cached fingerprints.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
