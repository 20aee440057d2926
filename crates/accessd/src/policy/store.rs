//! External store contracts.
//!
//! The endpoint and policy models are owned by other subsystems; the flow
//! programmer reads consistent point-in-time snapshots through these traits
//! and never writes back. The in-memory implementations serve tests and
//! standalone operation.

use super::config::{DropFlowSpec, DropLogConfig};
use super::endpoint::Endpoint;
use super::rule::PolicyRule;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Read-only view of the endpoint inventory.
pub trait EndpointStore: Send + Sync {
    /// Snapshot of an endpoint; `None` means the endpoint is gone.
    fn endpoint(&self, uuid: &str) -> Option<Arc<Endpoint>>;

    /// UUIDs of endpoints whose access interface is `iface`.
    fn endpoints_by_access_iface(&self, iface: &str) -> Vec<String>;

    /// UUIDs of endpoints whose uplink interface is `iface`.
    fn endpoints_by_uplink_iface(&self, iface: &str) -> Vec<String>;

    /// UUIDs of endpoints whose underlying interface name is `iface`.
    fn endpoints_by_iface(&self, iface: &str) -> Vec<String>;

    /// True when no endpoint references exactly this security-group set.
    fn sec_group_set_unused(&self, groups: &BTreeSet<String>) -> bool;

    /// Every distinct security-group set that contains `uri`.
    fn sets_containing_group(&self, uri: &str) -> Vec<BTreeSet<String>>;

    /// Trunked VLAN ranges configured on learning-bridge interfaces bound
    /// to `iface`.
    fn trunk_vlans(&self, iface: &str) -> Vec<(u16, u16)>;

    /// Interface name of a learning-bridge interface object.
    fn learning_bridge_iface(&self, uuid: &str) -> Option<String>;
}

/// Read-only view of the policy model.
pub trait PolicyStore: Send + Sync {
    /// Rules of a security group, in model order. Unknown groups yield an
    /// empty list.
    fn sec_group_rules(&self, uri: &str) -> Vec<Arc<PolicyRule>>;

    /// True while the group still exists in the model.
    fn sec_group_exists(&self, uri: &str) -> bool;

    /// Drop-log enablement object, when present.
    fn drop_log_config(&self, uri: &str) -> Option<DropLogConfig>;

    /// Drop-flow filter object, when present.
    fn drop_flow_config(&self, uri: &str) -> Option<DropFlowSpec>;
}

/// In-memory endpoint store.
#[derive(Default)]
pub struct MemoryEndpointStore {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    lb_ifaces: RwLock<HashMap<String, String>>,
    trunks: RwLock<HashMap<String, Vec<(u16, u16)>>>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an endpoint snapshot.
    pub fn put(&self, endpoint: Endpoint) {
        self.endpoints
            .write()
            .unwrap()
            .insert(endpoint.uuid.clone(), Arc::new(endpoint));
    }

    /// Removes an endpoint.
    pub fn remove(&self, uuid: &str) {
        self.endpoints.write().unwrap().remove(uuid);
    }

    /// Registers a learning-bridge interface object.
    pub fn put_lb_iface(&self, uuid: &str, iface: &str) {
        self.lb_ifaces
            .write()
            .unwrap()
            .insert(uuid.to_string(), iface.to_string());
    }

    /// Sets the trunked VLAN ranges for an interface name.
    pub fn set_trunk_vlans(&self, iface: &str, ranges: Vec<(u16, u16)>) {
        self.trunks
            .write()
            .unwrap()
            .insert(iface.to_string(), ranges);
    }
}

impl EndpointStore for MemoryEndpointStore {
    fn endpoint(&self, uuid: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().unwrap().get(uuid).cloned()
    }

    fn endpoints_by_access_iface(&self, iface: &str) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap()
            .values()
            .filter(|ep| ep.access_iface.as_deref() == Some(iface))
            .map(|ep| ep.uuid.clone())
            .collect()
    }

    fn endpoints_by_uplink_iface(&self, iface: &str) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap()
            .values()
            .filter(|ep| ep.uplink_iface.as_deref() == Some(iface))
            .map(|ep| ep.uuid.clone())
            .collect()
    }

    fn endpoints_by_iface(&self, iface: &str) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap()
            .values()
            .filter(|ep| ep.iface_name.as_deref() == Some(iface))
            .map(|ep| ep.uuid.clone())
            .collect()
    }

    fn sec_group_set_unused(&self, groups: &BTreeSet<String>) -> bool {
        !self
            .endpoints
            .read()
            .unwrap()
            .values()
            .any(|ep| ep.security_groups == *groups)
    }

    fn sets_containing_group(&self, uri: &str) -> Vec<BTreeSet<String>> {
        let endpoints = self.endpoints.read().unwrap();
        let mut sets: Vec<BTreeSet<String>> = Vec::new();
        for ep in endpoints.values() {
            if ep.security_groups.contains(uri) && !sets.contains(&ep.security_groups) {
                sets.push(ep.security_groups.clone());
            }
        }
        sets
    }

    fn trunk_vlans(&self, iface: &str) -> Vec<(u16, u16)> {
        self.trunks
            .read()
            .unwrap()
            .get(iface)
            .cloned()
            .unwrap_or_default()
    }

    fn learning_bridge_iface(&self, uuid: &str) -> Option<String> {
        self.lb_ifaces.read().unwrap().get(uuid).cloned()
    }
}

/// In-memory policy store.
#[derive(Default)]
pub struct MemoryPolicyStore {
    groups: RwLock<HashMap<String, Vec<Arc<PolicyRule>>>>,
    drop_log: RwLock<HashMap<String, DropLogConfig>>,
    drop_flows: RwLock<HashMap<String, DropFlowSpec>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a security group's rule list.
    pub fn put_group(&self, uri: &str, rules: Vec<PolicyRule>) {
        self.groups
            .write()
            .unwrap()
            .insert(uri.to_string(), rules.into_iter().map(Arc::new).collect());
    }

    /// Removes a security group.
    pub fn remove_group(&self, uri: &str) {
        self.groups.write().unwrap().remove(uri);
    }

    /// Inserts or replaces a drop-log config object.
    pub fn put_drop_log_config(&self, uri: &str, config: DropLogConfig) {
        self.drop_log
            .write()
            .unwrap()
            .insert(uri.to_string(), config);
    }

    /// Removes a drop-log config object.
    pub fn remove_drop_log_config(&self, uri: &str) {
        self.drop_log.write().unwrap().remove(uri);
    }

    /// Inserts or replaces a drop-flow filter object.
    pub fn put_drop_flow_config(&self, uri: &str, spec: DropFlowSpec) {
        self.drop_flows
            .write()
            .unwrap()
            .insert(uri.to_string(), spec);
    }

    /// Removes a drop-flow filter object.
    pub fn remove_drop_flow_config(&self, uri: &str) {
        self.drop_flows.write().unwrap().remove(uri);
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn sec_group_rules(&self, uri: &str) -> Vec<Arc<PolicyRule>> {
        self.groups
            .read()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    fn sec_group_exists(&self, uri: &str) -> bool {
        self.groups.read().unwrap().contains_key(uri)
    }

    fn drop_log_config(&self, uri: &str) -> Option<DropLogConfig> {
        self.drop_log.read().unwrap().get(uri).copied()
    }

    fn drop_flow_config(&self, uri: &str) -> Option<DropFlowSpec> {
        self.drop_flows.read().unwrap().get(uri).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rule::Direction;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_endpoint_lookup_and_removal() {
        let store = MemoryEndpointStore::new();
        store.put(Endpoint::new("ep-1").with_access_iface("veth0"));

        assert!(store.endpoint("ep-1").is_some());
        assert_eq!(store.endpoints_by_access_iface("veth0"), vec!["ep-1"]);
        assert!(store.endpoints_by_access_iface("veth9").is_empty());

        store.remove("ep-1");
        assert!(store.endpoint("ep-1").is_none());
    }

    #[test]
    fn test_sec_group_set_queries() {
        let store = MemoryEndpointStore::new();
        store.put(
            Endpoint::new("ep-1")
                .with_security_group("/policy/a")
                .with_security_group("/policy/b"),
        );
        store.put(Endpoint::new("ep-2").with_security_group("/policy/a"));

        let sets = store.sets_containing_group("/policy/a");
        assert_eq!(sets.len(), 2);
        assert_eq!(store.sets_containing_group("/policy/x").len(), 0);

        let mut used: BTreeSet<String> = BTreeSet::new();
        used.insert("/policy/a".to_string());
        assert!(!store.sec_group_set_unused(&used));

        used.insert("/policy/z".to_string());
        assert!(store.sec_group_set_unused(&used));
    }

    #[test]
    fn test_policy_store_rules() {
        let store = MemoryPolicyStore::new();
        assert!(store.sec_group_rules("/policy/a").is_empty());
        assert!(!store.sec_group_exists("/policy/a"));

        store.put_group(
            "/policy/a",
            vec![PolicyRule::allow("/rule/1", Direction::In, 10)],
        );
        assert_eq!(store.sec_group_rules("/policy/a").len(), 1);
        assert!(store.sec_group_exists("/policy/a"));

        store.remove_group("/policy/a");
        assert!(!store.sec_group_exists("/policy/a"));
    }

    #[test]
    fn test_trunk_vlans() {
        let store = MemoryEndpointStore::new();
        store.put_lb_iface("lbi-1", "eth0");
        store.set_trunk_vlans("eth0", vec![(100, 103)]);

        assert_eq!(store.learning_bridge_iface("lbi-1").as_deref(), Some("eth0"));
        assert_eq!(store.trunk_vlans("eth0"), vec![(100, 103)]);
        assert!(store.trunk_vlans("eth1").is_empty());
    }
}
