//! Endpoint model.

use accessd_types::{IpPrefix, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// A mapping from an endpoint-local address to a floating address.
///
/// Traffic to or from the floating address bypasses conntrack and policy
/// on the access bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpMapping {
    /// The endpoint-local address being mapped.
    pub mapped: IpAddr,
    /// The externally visible address, when assigned.
    pub floating: Option<IpAddr>,
}

impl IpMapping {
    /// Returns true when both addresses are present, share a family, and
    /// the floating address is specified.
    pub fn is_programmable(&self) -> bool {
        match self.floating {
            Some(floating) => {
                floating.is_ipv4() == self.mapped.is_ipv4() && !floating.is_unspecified()
            }
            None => false,
        }
    }
}

/// An endpoint attached to the access bridge.
///
/// Endpoints are owned by the external endpoint store; the flow programmer
/// only ever sees immutable snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Opaque unique identifier.
    pub uuid: String,
    /// Interface facing the workload.
    pub access_iface: Option<String>,
    /// Interface facing the integration bridge.
    pub uplink_iface: Option<String>,
    /// VLAN tag on the access interface.
    pub access_vlan: Option<VlanId>,
    /// Accept untagged frames in addition to the access VLAN.
    pub allow_untagged: bool,
    /// Addresses assigned to the endpoint.
    pub ips: BTreeSet<IpPrefix>,
    /// Service addresses the endpoint is a backend for.
    pub service_ips: BTreeSet<IpAddr>,
    /// Floating-IP mappings.
    pub ip_mappings: Vec<IpMapping>,
    /// Virtual DHCPv4 is configured for the endpoint.
    pub dhcp_v4: bool,
    /// Virtual DHCPv6 is configured for the endpoint.
    pub dhcp_v6: bool,
    /// Underlying interface name, used to look up trunked VLAN ranges.
    pub iface_name: Option<String>,
    /// URIs of the security groups applied to the endpoint.
    pub security_groups: BTreeSet<String>,
}

impl Endpoint {
    /// Creates an endpoint with the given UUID.
    pub fn new(uuid: impl Into<String>) -> Self {
        Endpoint {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn with_access_iface(mut self, iface: impl Into<String>) -> Self {
        self.access_iface = Some(iface.into());
        self
    }

    pub fn with_uplink_iface(mut self, iface: impl Into<String>) -> Self {
        self.uplink_iface = Some(iface.into());
        self
    }

    pub fn with_access_vlan(mut self, vlan: VlanId) -> Self {
        self.access_vlan = Some(vlan);
        self
    }

    pub fn with_allow_untagged(mut self, allow: bool) -> Self {
        self.allow_untagged = allow;
        self
    }

    pub fn with_ip(mut self, prefix: IpPrefix) -> Self {
        self.ips.insert(prefix);
        self
    }

    pub fn with_service_ip(mut self, addr: IpAddr) -> Self {
        self.service_ips.insert(addr);
        self
    }

    pub fn with_ip_mapping(mut self, mapping: IpMapping) -> Self {
        self.ip_mappings.push(mapping);
        self
    }

    pub fn with_dhcp_v4(mut self, enabled: bool) -> Self {
        self.dhcp_v4 = enabled;
        self
    }

    pub fn with_dhcp_v6(mut self, enabled: bool) -> Self {
        self.dhcp_v6 = enabled;
        self
    }

    pub fn with_iface_name(mut self, name: impl Into<String>) -> Self {
        self.iface_name = Some(name.into());
        self
    }

    pub fn with_security_group(mut self, uri: impl Into<String>) -> Self {
        self.security_groups.insert(uri.into());
        self
    }

    /// Canonical id string of the endpoint's security-group set: the
    /// sorted URIs joined with `","`. The empty set's id is the empty
    /// string.
    pub fn sec_group_set_id(&self) -> String {
        sec_group_set_id(&self.security_groups)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Endpoint({}, access={:?}, uplink={:?}, groups={})",
            self.uuid,
            self.access_iface,
            self.uplink_iface,
            self.security_groups.len()
        )
    }
}

/// Canonical id string for an arbitrary security-group set.
pub fn sec_group_set_id(groups: &BTreeSet<String>) -> String {
    let mut id = String::new();
    for (i, uri) in groups.iter().enumerate() {
        if i > 0 {
            id.push(',');
        }
        id.push_str(uri);
    }
    id
}

/// Parses a canonical set-id string back into the set of group URIs.
pub fn sec_group_set_from_id(id: &str) -> BTreeSet<String> {
    id.split(',')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
