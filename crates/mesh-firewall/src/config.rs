//! Config-driven construction and rule loading.
//!
//! Rule dictionaries are dynamically shaped: `group` may arrive as a
//! scalar or a one-element array, `groups` as a scalar or an array, ports
//! as numbers or strings. This module resolves those shapes into the typed
//! [`RuleSink::add_rule`] signature so the core never observes them.

use crate::error::{ConfigError, RuleError};
use crate::firewall::Firewall;
use crate::ruleset::{Protocol, RuleSink};
use ipnetwork::Ipv4Network;
use mesh_common::{Certificate, PORT_ANY, PORT_FRAGMENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Conntrack timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConntrackConfig {
    /// Expiry for TCP flows.
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
    /// Expiry for UDP flows.
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,
    /// Expiry for everything else.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_tcp_timeout_secs() -> u64 {
    720
}

fn default_udp_timeout_secs() -> u64 {
    180
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: default_tcp_timeout_secs(),
            udp_timeout_secs: default_udp_timeout_secs(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Firewall section of the node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Conntrack timeouts.
    #[serde(default)]
    pub conntrack: ConntrackConfig,
    /// `drop` or `reject`; unknown values fall back to drop with a warning.
    #[serde(default = "default_action")]
    pub inbound_action: String,
    /// `drop` or `reject`; unknown values fall back to drop with a warning.
    #[serde(default = "default_action")]
    pub outbound_action: String,
    /// Inbound rule dictionaries; shapes are validated at load time.
    #[serde(default)]
    pub inbound: Vec<Value>,
    /// Outbound rule dictionaries.
    #[serde(default)]
    pub outbound: Vec<Value>,
}

fn default_action() -> String {
    "drop".to_string()
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            conntrack: ConntrackConfig::default(),
            inbound_action: default_action(),
            outbound_action: default_action(),
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }
}

impl Firewall {
    /// Build a firewall from configuration: timeouts, per-direction refuse
    /// actions, and both rule tables. Loading stops at the first bad rule
    /// and the caller discards the partially loaded instance, so a broken
    /// ruleset never filters packets.
    pub fn from_config(cert: &Certificate, config: &FirewallConfig) -> Result<Self, ConfigError> {
        let mut fw = Firewall::new(
            cert,
            Duration::from_secs(config.conntrack.tcp_timeout_secs),
            Duration::from_secs(config.conntrack.udp_timeout_secs),
            Duration::from_secs(config.conntrack.default_timeout_secs),
        );

        fw.in_send_reject = parse_action("inbound_action", &config.inbound_action);
        fw.out_send_reject = parse_action("outbound_action", &config.outbound_action);

        load_rules(&mut fw, false, &config.outbound)?;
        load_rules(&mut fw, true, &config.inbound)?;

        Ok(fw)
    }
}

fn parse_action(field: &str, value: &str) -> bool {
    match value {
        "reject" => true,
        "drop" => false,
        other => {
            tracing::warn!(field, action = other, "invalid firewall action, defaulting to `drop`");
            false
        }
    }
}

/// Load one direction's rule list into a sink.
pub fn load_rules<S: RuleSink>(
    sink: &mut S,
    incoming: bool,
    rules: &[Value],
) -> Result<(), ConfigError> {
    let table = if incoming {
        "firewall.inbound"
    } else {
        "firewall.outbound"
    };

    for (index, value) in rules.iter().enumerate() {
        load_rule(sink, incoming, table, index, value)?;
    }

    Ok(())
}

fn load_rule<S: RuleSink>(
    sink: &mut S,
    incoming: bool,
    table: &'static str,
    index: usize,
    value: &Value,
) -> Result<(), ConfigError> {
    let rule_err = |source| ConfigError::Rule {
        table,
        index,
        source,
    };

    let raw = convert_rule(table, index, value).map_err(rule_err)?;

    if !raw.code.is_empty() && !raw.port.is_empty() {
        return Err(rule_err(RuleError::PortAndCode));
    }

    if raw.host.is_empty()
        && raw.groups.is_empty()
        && raw.group.is_empty()
        && raw.cidr.is_empty()
        && raw.local_cidr.is_empty()
        && raw.ca_name.is_empty()
        && raw.ca_sha.is_empty()
    {
        return Err(rule_err(RuleError::MissingMatcher));
    }

    let mut groups = raw.groups;
    if !raw.group.is_empty() {
        if !groups.is_empty() {
            return Err(rule_err(RuleError::GroupAndGroups));
        }
        groups = vec![raw.group];
    }

    let (field, port_text) = if !raw.code.is_empty() {
        ("code", raw.code.as_str())
    } else {
        ("port", raw.port.as_str())
    };
    let (start_port, end_port) = parse_port(port_text).map_err(|source| ConfigError::Port {
        table,
        index,
        field,
        source,
    })?;

    let proto: Protocol = raw.proto.parse().map_err(rule_err)?;

    let cidr = parse_cidr(&raw.cidr)
        .map_err(|e| rule_err(RuleError::BadCidr(e.to_string())))?;
    let local_cidr = parse_cidr(&raw.local_cidr)
        .map_err(|e| rule_err(RuleError::BadLocalCidr(e.to_string())))?;

    sink.add_rule(
        incoming,
        proto,
        start_port,
        end_port,
        &groups,
        &raw.host,
        cidr,
        local_cidr,
        &raw.ca_name,
        &raw.ca_sha,
    )
    .map_err(rule_err)
}

/// A rule dictionary with every field flattened to text, before
/// validation.
#[derive(Debug, Default)]
struct RawRule {
    port: String,
    code: String,
    proto: String,
    host: String,
    group: String,
    groups: Vec<String>,
    cidr: String,
    local_cidr: String,
    ca_name: String,
    ca_sha: String,
}

fn convert_rule(table: &str, index: usize, value: &Value) -> Result<RawRule, RuleError> {
    let map = value.as_object().ok_or(RuleError::MalformedRule)?;

    let text = |key: &str| map.get(key).map(value_to_string).unwrap_or_default();

    let mut raw = RawRule {
        port: text("port"),
        code: text("code"),
        proto: text("proto"),
        host: text("host"),
        cidr: text("cidr"),
        local_cidr: text("local_cidr"),
        ca_name: text("ca_name"),
        ca_sha: text("ca_sha"),
        ..RawRule::default()
    };

    // `group` must be a scalar; tolerate a one-element array.
    match map.get("group") {
        Some(Value::Array(items)) => {
            if items.len() > 1 {
                return Err(RuleError::GroupArray);
            }
            tracing::warn!(
                table,
                rule = index,
                "group was an array with a single value, converting to simple value"
            );
            raw.group = items.first().map(value_to_string).unwrap_or_default();
        }
        _ => raw.group = text("group"),
    }

    // `groups` accepts a scalar as a one-element sequence.
    if let Some(value) = map.get("groups") {
        raw.groups = match value {
            Value::Array(items) => items.iter().map(value_to_string).collect(),
            scalar => vec![value_to_string(scalar)],
        };
    }

    Ok(raw)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_cidr(text: &str) -> Result<Option<Ipv4Network>, ipnetwork::IpNetworkError> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some)
}

/// Port grammar: `any`, `fragment`, `N`, or `N-M` (whitespace-tolerant,
/// inclusive). A range starting at the any sentinel collapses to any.
pub fn parse_port(s: &str) -> Result<(i32, i32), RuleError> {
    if s == "any" {
        return Ok((PORT_ANY, PORT_ANY));
    }
    if s == "fragment" {
        return Ok((PORT_FRAGMENT, PORT_FRAGMENT));
    }

    if let Some((start_text, end_text)) = s.split_once('-') {
        let start_text = start_text.trim();
        let end_text = end_text.trim();
        if start_text.is_empty() || end_text.is_empty() {
            return Err(RuleError::BadPortRange(s.to_string()));
        }

        let start: i32 = start_text
            .parse()
            .map_err(|_| RuleError::BadRangeStart(start_text.to_string()))?;
        let end: i32 = end_text
            .parse()
            .map_err(|_| RuleError::BadRangeEnd(end_text.to_string()))?;

        if start == PORT_ANY {
            return Ok((PORT_ANY, PORT_ANY));
        }
        return Ok((start, end));
    }

    let port: i32 = s.parse().map_err(|_| RuleError::BadPort(s.to_string()))?;
    Ok((port, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Records every rule it is handed.
    #[derive(Default)]
    struct Recorder {
        rules: Vec<RecordedRule>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct RecordedRule {
        incoming: bool,
        proto: Protocol,
        start_port: i32,
        end_port: i32,
        groups: Vec<String>,
        host: String,
        cidr: Option<Ipv4Network>,
        local_cidr: Option<Ipv4Network>,
        ca_name: String,
        ca_sha: String,
    }

    impl RuleSink for Recorder {
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
            self.rules.push(RecordedRule {
                incoming,
                proto,
                start_port,
                end_port,
                groups: groups.to_vec(),
                host: host.to_string(),
                cidr,
                local_cidr,
                ca_name: ca_name.to_string(),
                ca_sha: ca_sha.to_string(),
            });
            Ok(())
        }
    }

    #[test]
    fn test_parse_port_grammar() {
        assert_eq!(parse_port("any").unwrap(), (PORT_ANY, PORT_ANY));
        assert_eq!(parse_port("fragment").unwrap(), (PORT_FRAGMENT, PORT_FRAGMENT));
        assert_eq!(parse_port("443").unwrap(), (443, 443));
        assert_eq!(parse_port("80-90").unwrap(), (80, 90));
        assert_eq!(parse_port(" 80 - 90 ").unwrap(), (80, 90));
        // A range starting at the any sentinel collapses.
        assert_eq!(parse_port("0-90").unwrap(), (PORT_ANY, PORT_ANY));

        assert!(matches!(parse_port("http"), Err(RuleError::BadPort(_))));
        assert!(matches!(parse_port("a-90"), Err(RuleError::BadRangeStart(_))));
        assert!(matches!(parse_port("80-b"), Err(RuleError::BadRangeEnd(_))));
        assert!(matches!(parse_port("80-"), Err(RuleError::BadPortRange(_))));
        assert!(matches!(parse_port(""), Err(RuleError::BadPort(_))));
    }

    #[test]
    fn test_load_basic_rule() {
        let mut rec = Recorder::default();
        load_rules(
            &mut rec,
            true,
            &[json!({"port": "80-90", "proto": "tcp", "host": "web"})],
        )
        .unwrap();

        assert_eq!(rec.rules.len(), 1);
        let rule = &rec.rules[0];
        assert!(rule.incoming);
        assert_eq!(rule.proto, Protocol::Tcp);
        assert_eq!((rule.start_port, rule.end_port), (80, 90));
        assert_eq!(rule.host, "web");
        assert!(rule.groups.is_empty());
    }

    #[test]
    fn test_numeric_port_accepted() {
        let mut rec = Recorder::default();
        load_rules(
            &mut rec,
            true,
            &[json!({"port": 443, "proto": "tcp", "host": "web"})],
        )
        .unwrap();
        assert_eq!((rec.rules[0].start_port, rec.rules[0].end_port), (443, 443));
    }

    #[test]
    fn test_icmp_code_field() {
        let mut rec = Recorder::default();
        load_rules(
            &mut rec,
            true,
            &[json!({"code": "8", "proto": "icmp", "host": "any"})],
        )
        .unwrap();
        assert_eq!(rec.rules[0].proto, Protocol::Icmp);
        assert_eq!((rec.rules[0].start_port, rec.rules[0].end_port), (8, 8));
    }

    #[test]
    fn test_port_and_code_conflict() {
        let mut rec = Recorder::default();
        let err = load_rules(
            &mut rec,
            true,
            &[json!({"port": "80", "code": "8", "proto": "tcp", "host": "a"})],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rule { index: 0, source: RuleError::PortAndCode, .. }
        ));
    }

    #[test]
    fn test_missing_matcher_rejected() {
        let mut rec = Recorder::default();
        let err = load_rules(&mut rec, true, &[json!({"port": "80", "proto": "tcp"})])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rule { source: RuleError::MissingMatcher, .. }
        ));
    }

    #[test]
    fn test_group_and_groups_conflict() {
        let mut rec = Recorder::default();
        let err = load_rules(
            &mut rec,
            true,
            &[json!({"port": "80", "proto": "tcp", "group": "a", "groups": ["b"]})],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rule { source: RuleError::GroupAndGroups, .. }
        ));
    }

    #[test]
    fn test_scalar_groups_becomes_sequence() {
        let mut rec = Recorder::default();
        load_rules(
            &mut rec,
            true,
            &[json!({"port": "80", "proto": "tcp", "groups": "ops"})],
        )
        .unwrap();
        assert_eq!(rec.rules[0].groups, vec!["ops".to_string()]);
    }

    #[test]
    fn test_single_element_group_array_tolerated() {
        let mut rec = Recorder::default();
        load_rules(
            &mut rec,
            true,
            &[json!({"port": "80", "proto": "tcp", "group": ["ops"]})],
        )
        .unwrap();
        assert_eq!(rec.rules[0].groups, vec!["ops".to_string()]);

        let err = load_rules(
            &mut rec,
            true,
            &[json!({"port": "80", "proto": "tcp", "group": ["ops", "db"]})],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rule { source: RuleError::GroupArray, .. }
        ));
    }

    #[test]
    fn test_bad_proto_and_cidr() {
        let mut rec = Recorder::default();
        let err = load_rules(
            &mut rec,
            true,
            &[json!({"port": "80", "proto": "gre", "host": "a"})],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rule { source: RuleError::UnknownProtocol(_), .. }
        ));

        let err = load_rules(
            &mut rec,
            false,
            &[json!({"port": "80", "proto": "tcp", "cidr": "10.0.0.0/40"})],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rule { table: "firewall.outbound", source: RuleError::BadCidr(_), .. }
        ));
    }

    #[test]
    fn test_error_message_carries_context() {
        let mut rec = Recorder::default();
        let err = load_rules(&mut rec, true, &[json!({"port": "x", "proto": "tcp", "host": "a"})])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "firewall.inbound rule #0; port was not a number; `x`"
        );
    }

    #[test]
    fn test_from_config_defaults_and_actions() {
        let config: FirewallConfig = serde_json::from_value(json!({
            "inbound_action": "reject",
            "outbound_action": "nonsense",
            "inbound": [
                {"port": "any", "proto": "any", "host": "any"}
            ]
        }))
        .unwrap();

        assert_eq!(config.conntrack.tcp_timeout_secs, 720);
        assert_eq!(config.conntrack.udp_timeout_secs, 180);
        assert_eq!(config.conntrack.default_timeout_secs, 600);

        let cert = Certificate::new("node", "ca")
            .with_ips(["10.0.0.1/24".parse().unwrap()]);
        let fw = Firewall::from_config(&cert, &config).unwrap();

        assert!(fw.send_reject(true));
        // Unknown action string falls back to drop.
        assert!(!fw.send_reject(false));
    }

    #[test]
    fn test_from_config_aborts_on_bad_rule() {
        let config: FirewallConfig = serde_json::from_value(json!({
            "inbound": [
                {"port": "any", "proto": "any", "host": "any"},
                {"port": "80", "proto": "bogus", "host": "a"}
            ]
        }))
        .unwrap();

        let cert = Certificate::new("node", "ca")
            .with_ips(["10.0.0.1/24".parse().unwrap()]);
        assert!(Firewall::from_config(&cert, &config).is_err());
    }
}
