//! Security-group rule model.

use accessd_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Direction a rule applies to, relative to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Traffic toward the endpoint.
    In,
    /// Traffic from the endpoint.
    Out,
    /// Both directions.
    Bidirectional,
}

impl Direction {
    /// Returns true if the rule applies to ingress traffic.
    pub fn applies_in(&self) -> bool {
        matches!(self, Direction::In | Direction::Bidirectional)
    }

    /// Returns true if the rule applies to egress traffic.
    pub fn applies_out(&self) -> bool {
        matches!(self, Direction::Out | Direction::Bidirectional)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

/// Connection-tracking mode of an allow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnTrackMode {
    /// Stateless: match forward traffic only.
    #[default]
    Normal,
    /// Stateful: additionally admit reply traffic of tracked connections.
    Reflexive,
}

/// TCP flag bits as carried by the policy model. `ESTABLISHED` is a
/// pseudo-flag that expands to separate ACK and RST matches.
pub mod tcp_flags {
    pub const UNSPECIFIED: u32 = 0;
    pub const ESTABLISHED: u32 = 0x01;
    pub const FIN: u32 = 0x02;
    pub const SYN: u32 = 0x04;
    pub const RST: u32 = 0x08;
    pub const ACK: u32 = 0x10;
}

/// Converts policy-model TCP flag bits to the wire bit layout.
pub fn tcp_flags_to_wire(flags: u32) -> u16 {
    let mut wire = 0u16;
    if flags & tcp_flags::FIN != 0 {
        wire |= 0x01;
    }
    if flags & tcp_flags::SYN != 0 {
        wire |= 0x02;
    }
    if flags & tcp_flags::RST != 0 {
        wire |= 0x04;
    }
    if flags & tcp_flags::ACK != 0 {
        wire |= 0x10;
    }
    wire
}

/// L2/L3/L4 packet classifier of a rule. Unset fields do not constrain the
/// match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4Classifier {
    /// Ethernet frame type.
    pub eth_type: Option<u16>,
    /// ARP opcode; matched through the protocol field for ARP frames.
    pub arp_opc: Option<u8>,
    /// IP protocol number.
    pub proto: Option<u8>,
    /// ICMP type (requires `proto` = ICMP).
    pub icmp_type: Option<u8>,
    /// ICMP code (requires `proto` = ICMP).
    pub icmp_code: Option<u8>,
    /// Inclusive source port range.
    pub sport: Option<(u16, u16)>,
    /// Inclusive destination port range.
    pub dport: Option<(u16, u16)>,
    /// TCP flags ([`tcp_flags`] bits); `UNSPECIFIED` means no flag match.
    pub tcp_flags: u32,
}

impl L4Classifier {
    /// Returns true when the ICMP type/code special case applies.
    pub fn is_icmp_typed(&self) -> bool {
        self.proto == Some(crate::flow::ip_proto::ICMP)
            && (self.icmp_type.is_some() || self.icmp_code.is_some())
    }
}

/// A named service port: a resolved address, optionally with an L4 port
/// that overrides the classifier's destination port range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub address: IpAddr,
    /// Prefix length; 0 means a host match.
    pub prefix_len: u8,
    /// IP protocol for the port match; ignored when `port` is 0.
    pub proto: u8,
    /// Destination L4 port; 0 means address-only.
    pub port: u16,
}

impl ServicePort {
    /// A service port that matches an address or subnet only.
    pub fn address_only(address: IpAddr, prefix_len: u8) -> Self {
        ServicePort {
            address,
            prefix_len,
            proto: 0,
            port: 0,
        }
    }

    /// Effective prefix length: an explicit length, or the family's full
    /// length for host entries.
    pub fn effective_prefix_len(&self) -> u8 {
        if self.prefix_len != 0 {
            self.prefix_len
        } else if self.address.is_ipv4() {
            32
        } else {
            128
        }
    }
}

impl From<IpPrefix> for ServicePort {
    fn from(prefix: IpPrefix) -> Self {
        ServicePort::address_only(prefix.addr(), prefix.prefix_len())
    }
}

/// One rule of a security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// URI of the rule's classifier; keys the per-rule cookie namespace.
    pub uri: String,
    pub direction: Direction,
    pub allow: bool,
    pub log: bool,
    pub priority: u16,
    pub conn_track: ConnTrackMode,
    pub classifier: L4Classifier,
    /// Remote subnets the rule is scoped to; empty means any.
    pub remote_subnets: BTreeSet<IpPrefix>,
    /// Named service ports resolved for the rule.
    pub named_ports: Vec<ServicePort>,
}

impl PolicyRule {
    /// Creates an allow rule with an empty classifier.
    pub fn allow(uri: impl Into<String>, direction: Direction, priority: u16) -> Self {
        PolicyRule {
            uri: uri.into(),
            direction,
            allow: true,
            log: false,
            priority,
            conn_track: ConnTrackMode::Normal,
            classifier: L4Classifier::default(),
            remote_subnets: BTreeSet::new(),
            named_ports: Vec::new(),
        }
    }

    /// Creates a deny rule with an empty classifier.
    pub fn deny(uri: impl Into<String>, direction: Direction, priority: u16) -> Self {
        PolicyRule {
            allow: false,
            ..Self::allow(uri, direction, priority)
        }
    }

    pub fn with_classifier(mut self, classifier: L4Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_conn_track(mut self, mode: ConnTrackMode) -> Self {
        self.conn_track = mode;
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn with_remote_subnet(mut self, subnet: IpPrefix) -> Self {
        self.remote_subnets.insert(subnet);
        self
    }

    pub fn with_named_port(mut self, port: ServicePort) -> Self {
        self.named_ports.push(port);
        self
    }

    /// Returns true when the rule carries no remote scope at all.
    pub fn has_no_remote_scope(&self) -> bool {
        self.remote_subnets.is_empty() && self.named_ports.is_empty()
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PolicyRule({}, {} {} prio={} ct={:?})",
            self.uri,
            if self.allow { "allow" } else { "deny" },
            self.direction,
            self.priority,
            self.conn_track
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_direction_applies() {
        assert!(Direction::In.applies_in());
        assert!(!Direction::In.applies_out());
        assert!(Direction::Out.applies_out());
        assert!(Direction::Bidirectional.applies_in());
        assert!(Direction::Bidirectional.applies_out());
    }

    #[test]
    fn test_tcp_flags_to_wire() {
        assert_eq!(tcp_flags_to_wire(tcp_flags::FIN), 0x01);
        assert_eq!(tcp_flags_to_wire(tcp_flags::SYN), 0x02);
        assert_eq!(tcp_flags_to_wire(tcp_flags::RST), 0x04);
        assert_eq!(tcp_flags_to_wire(tcp_flags::ACK), 0x10);
        assert_eq!(
            tcp_flags_to_wire(tcp_flags::SYN | tcp_flags::ACK),
            0x12
        );
        assert_eq!(tcp_flags_to_wire(tcp_flags::UNSPECIFIED), 0);
    }

    #[test]
    fn test_icmp_typed() {
        let mut cls = L4Classifier {
            proto: Some(1),
            icmp_type: Some(8),
            ..Default::default()
        };
        assert!(cls.is_icmp_typed());
        cls.proto = Some(6);
        assert!(!cls.is_icmp_typed());
        cls.proto = Some(1);
        cls.icmp_type = None;
        assert!(!cls.is_icmp_typed());
    }

    #[test]
    fn test_service_port_prefix_len() {
        let host = ServicePort {
            address: "10.0.0.1".parse().unwrap(),
            prefix_len: 0,
            proto: 6,
            port: 443,
        };
        assert_eq!(host.effective_prefix_len(), 32);

        let v6 = ServicePort::address_only("fd00::1".parse().unwrap(), 0);
        assert_eq!(v6.effective_prefix_len(), 128);

        let subnet = ServicePort::address_only("10.0.0.0".parse().unwrap(), 24);
        assert_eq!(subnet.effective_prefix_len(), 24);
    }

    #[test]
    fn test_rule_builders() {
        let rule = PolicyRule::allow("/rule/1", Direction::In, 100)
            .with_conn_track(ConnTrackMode::Reflexive)
            .with_remote_subnet("10.0.0.0/8".parse().unwrap());
        assert!(rule.allow);
        assert!(!rule.has_no_remote_scope());
        assert_eq!(rule.conn_track, ConnTrackMode::Reflexive);

        let deny = PolicyRule::deny("/rule/2", Direction::Out, 50);
        assert!(!deny.allow);
        assert!(deny.has_no_remote_scope());
    }
}
