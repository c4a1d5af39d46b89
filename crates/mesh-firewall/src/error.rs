//! Error types for the filtering core.

use thiserror::Error;

/// Why a packet was refused. Per-packet and non-fatal; the caller turns
/// these into a silent drop or an active reject depending on the
/// per-direction action.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FirewallError {
    /// The peer's certificate does not authorize the packet's remote
    /// address.
    #[error("remote IP is not in remote certificate subnets")]
    InvalidRemoteIp,

    /// This node does not own the packet's local address.
    #[error("local IP is not in list of handled local IPs")]
    InvalidLocalIp,

    /// The packet passed validation but no rule authorizes it.
    #[error("no matching rule in firewall table")]
    NoMatchingRule,
}

/// Rule ingestion failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Port range with start above end.
    #[error("start port was lower than end port")]
    InvertedPortRange,

    /// Protocol name outside tcp/udp/icmp/any.
    #[error("proto was not understood; `{0}`")]
    UnknownProtocol(String),

    /// Port text contained a `-` but was not a usable range.
    #[error("appears to be a range but could not be parsed; `{0}`")]
    BadPortRange(String),

    /// Range start was not numeric.
    #[error("beginning range was not a number; `{0}`")]
    BadRangeStart(String),

    /// Range end was not numeric.
    #[error("ending range was not a number; `{0}`")]
    BadRangeEnd(String),

    /// Single port was not numeric.
    #[error("was not a number; `{0}`")]
    BadPort(String),

    /// Rule carried both `port` and `code`.
    #[error("only one of port or code should be provided")]
    PortAndCode,

    /// Rule carried no predicate at all.
    #[error("at least one of host, group, cidr, local_cidr, ca_name, or ca_sha must be provided")]
    MissingMatcher,

    /// Rule carried both `group` and `groups`.
    #[error("only one of group or groups should be defined, both provided")]
    GroupAndGroups,

    /// `group` was an array with more than one entry.
    #[error("group should contain a single value, an array with more than one entry was provided")]
    GroupArray,

    /// `cidr` did not parse.
    #[error("cidr did not parse; {0}")]
    BadCidr(String),

    /// `local_cidr` did not parse.
    #[error("local_cidr did not parse; {0}")]
    BadLocalCidr(String),

    /// Rule value was not a dictionary.
    #[error("could not parse rule")]
    MalformedRule,
}

/// Rule-loading failure, pointing at the offending table entry. Loading
/// stops at the first failure; a partially loaded ruleset is never
/// published.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A rule failed validation or installation.
    #[error("{table} rule #{index}; {source}")]
    Rule {
        /// Config table the rule came from.
        table: &'static str,
        /// Zero-based rule index within the table.
        index: usize,
        /// Underlying failure.
        source: RuleError,
    },

    /// A rule's port or code field failed to parse.
    #[error("{table} rule #{index}; {field} {source}")]
    Port {
        /// Config table the rule came from.
        table: &'static str,
        /// Zero-based rule index within the table.
        index: usize,
        /// Which key held the bad value, `port` or `code`.
        field: &'static str,
        /// Underlying failure.
        source: RuleError,
    },
}
