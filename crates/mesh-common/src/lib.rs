//! Shared types for the openmesh node.
//!
//! Leaf building blocks used by the packet filter and the tunnel layer:
//! - flow identity keys and protocol constants
//! - an IPv4 longest-prefix-match tree
//! - the decoded certificate / CA pool model
//! - lock-free metric primitives

#![warn(missing_docs)]

pub mod cert;
pub mod cidr;
pub mod flow;
pub mod metrics;

pub use cert::{CaPool, Certificate, Peer};
pub use cidr::Ipv4Tree;
pub use flow::{proto, FlowKey, PORT_ANY, PORT_FRAGMENT};
pub use metrics::{Counter, RttHistogram};
