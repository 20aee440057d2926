//! AccessFlowOrch - access-bridge flow orchestration.
//!
//! The orchestrator subscribes to endpoint, security-group, port, and
//! drop-log configuration updates, serializes them per logical key, and
//! rewrites the affected flow-set cells so the reconciler can converge the
//! datapath. Every handler rebuilds its cells from scratch; nothing is
//! patched in place, which is what makes replays idempotent.

use crate::access::classifier::{
    add_classifier_entries, add_l2_classifier_entries, match_dhcp_req, ClassAction,
    ClassifierFlowSpec,
};
use crate::access::static_flows::create_static_flows;
use crate::ctzone::CtZoneAllocator;
use crate::flow::{
    cookie, eth, flags, meta, range, table, FlowBuilder, FlowEntry, Reg,
};
use crate::policy::{
    sec_group_set_from_id, ConnTrackMode, DropLogMode, Endpoint, EndpointStore, PolicyStore,
};
use crate::ports::PortIndex;
use crate::switch::FlowProgrammer;
use accessd_common::{IdAllocator, IdError, TaskQueue};
use accessd_types::IpPrefix;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// Id namespace for individual security groups.
const NS_SECGROUP: &str = "secGroup";
/// Id namespace for security-group sets; matched in reg0.
const NS_SECGROUP_SET: &str = "secGroupSet";
/// Id namespace for per-rule cookies.
const NS_CLASSIFIER_RULE: &str = "l24classifierRule";

const SYSTEM_SEC_GROUP_SUFFIX: &str = "_SystemSecurityGroup";
/// Number of `/`-separated components in a controller domain path that
/// carries a domain token.
const VMM_DOMAIN_DN_PARTS: usize = 4;

/// Error type for AccessFlowOrch operations.
#[derive(Debug, Clone)]
pub enum AccessOrchError {
    /// Id allocation failed.
    Id(IdError),
    /// A drop-log destination could not be parsed.
    InvalidDropLogDest(String),
    /// IPv6 drop-log destinations are not supported by the datapath
    /// encapsulation in use.
    UnsupportedDropLogDest(String),
}

impl fmt::Display for AccessOrchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(e) => write!(f, "id allocation failed: {}", e),
            Self::InvalidDropLogDest(ip) => {
                write!(f, "invalid drop-log tunnel destination IP: {}", ip)
            }
            Self::UnsupportedDropLogDest(ip) => {
                write!(f, "IPv6 drop-log tunnel destinations are not supported: {}", ip)
            }
        }
    }
}

impl std::error::Error for AccessOrchError {}

impl From<IdError> for AccessOrchError {
    fn from(e: IdError) -> Self {
        Self::Id(e)
    }
}

/// Configuration for AccessFlowOrch.
#[derive(Debug, Clone, Default)]
pub struct AccessOrchConfig {
    /// Assign per-endpoint conntrack zones and honor reflexive rules.
    pub conntrack_enabled: bool,
    /// Emit L3/L4 entries even for rules with no remote scope.
    pub add_l34_flows_without_subnet: bool,
    /// Controller domain path; shapes the system-security-group name.
    pub controller_domain: String,
}

/// Counters for orchestrator activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessOrchStats {
    pub endpoint_updates: u64,
    pub sec_group_set_updates: u64,
    pub port_status_updates: u64,
    pub dropped_events: u64,
}

#[derive(Debug, Default)]
struct DropLogState {
    iface: String,
    dst: Option<Ipv4Addr>,
    remote_port: u16,
}

/// The access-bridge flow orchestrator.
///
/// Construct with [`AccessFlowOrch::new`] inside a tokio runtime, call
/// [`start`](AccessFlowOrch::start) once, then feed it events from the
/// store listeners. All event entry points are safe to call from any
/// thread; handlers for the same key never run concurrently.
pub struct AccessFlowOrch {
    config: AccessOrchConfig,
    endpoints: Arc<dyn EndpointStore>,
    policy: Arc<dyn PolicyStore>,
    ports: Arc<PortIndex>,
    ids: Arc<IdAllocator>,
    ct_zones: Arc<CtZoneAllocator>,
    programmer: Arc<FlowProgrammer>,
    queue: TaskQueue,
    stopping: AtomicBool,
    drop_log: Mutex<DropLogState>,
    /// Handle to self for handlers dispatched onto the queue.
    self_ref: Weak<AccessFlowOrch>,
    endpoint_updates: AtomicU64,
    set_updates: AtomicU64,
    port_updates: AtomicU64,
    dropped_events: AtomicU64,
}

impl AccessFlowOrch {
    /// Creates the orchestrator. Must run inside a tokio runtime; the
    /// dispatch queue binds to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AccessOrchConfig,
        endpoints: Arc<dyn EndpointStore>,
        policy: Arc<dyn PolicyStore>,
        ports: Arc<PortIndex>,
        ids: Arc<IdAllocator>,
        ct_zones: Arc<CtZoneAllocator>,
        programmer: Arc<FlowProgrammer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| AccessFlowOrch {
            config,
            endpoints,
            policy,
            ports,
            ids,
            ct_zones,
            programmer,
            queue: TaskQueue::new(),
            stopping: AtomicBool::new(false),
            drop_log: Mutex::new(DropLogState::default()),
            self_ref: self_ref.clone(),
            endpoint_updates: AtomicU64::new(0),
            set_updates: AtomicU64::new(0),
            port_updates: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        })
    }

    /// Strong handle for dispatching handler closures.
    fn handle(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    /// Initializes id namespaces and writes the static pipeline flows.
    pub fn start(&self) -> Result<(), AccessOrchError> {
        for ns in [NS_SECGROUP, NS_SECGROUP_SET, NS_CLASSIFIER_RULE] {
            self.ids.init_namespace(ns);
        }
        let empty_set_id = self.ids.get_id(NS_SECGROUP_SET, "")?;
        create_static_flows(&self.programmer, empty_set_id);
        self.handle_drop_log_port_update();
        info!("access flow orchestration started");
        Ok(())
    }

    /// Stops event intake. Queued work may still drain; the reconciler
    /// converges on next start either way.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.queue.stop();
        info!("access flow orchestration stopped");
    }

    /// Waits until all dispatched handlers have completed.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Activity counters.
    pub fn stats(&self) -> AccessOrchStats {
        AccessOrchStats {
            endpoint_updates: self.endpoint_updates.load(Ordering::Relaxed),
            sec_group_set_updates: self.set_updates.load(Ordering::Relaxed),
            port_status_updates: self.port_updates.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }

    fn is_stopping(&self) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    // ============ Event entry points ============

    /// An endpoint was created, changed, or destroyed.
    pub fn endpoint_updated(&self, uuid: &str) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let uuid = uuid.to_string();
        self.queue
            .dispatch(uuid.clone(), move || this.handle_endpoint_update(&uuid));
    }

    /// A security-group set's membership or rules changed.
    pub fn sec_group_set_updated(&self, groups: &BTreeSet<String>) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let id = crate::policy::sec_group_set_id(groups);
        let groups = groups.clone();
        self.queue.dispatch(format!("set:{}", id), move || {
            this.handle_sec_grp_set_update(&groups, &id)
        });
    }

    /// A single security group changed; fans out to every set using it.
    pub fn sec_group_updated(&self, uri: &str) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let uri = uri.to_string();
        self.queue
            .dispatch(format!("secgrp:{}", uri), move || {
                this.handle_sec_grp_update(&uri)
            });
    }

    /// A switch port appeared, moved, or disappeared.
    pub fn port_status_update(&self, name: &str, port_no: u32) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let name = name.to_string();
        self.queue.dispatch(name.clone(), move || {
            this.handle_port_status_update(&name, port_no)
        });
    }

    /// DSCP marking configuration changed for an interface.
    pub fn dscp_qos_updated(&self, iface: &str, dscp: u8) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let iface = iface.to_string();
        self.queue.dispatch(iface.clone(), move || {
            this.handle_dscp_qos_update(&iface, dscp)
        });
    }

    /// The agent configuration became ready; let the reconciler sync.
    pub fn config_updated(&self) {
        if self.is_stopping() {
            return;
        }
        self.programmer.enable_sync();
    }

    /// The drop-log enablement object changed.
    pub fn packet_drop_log_config_updated(&self, uri: &str) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let uri = uri.to_string();
        self.queue.dispatch(uri.clone(), move || {
            this.handle_drop_log_config_update(&uri)
        });
    }

    /// A drop-flow filter object changed.
    pub fn packet_drop_flow_config_updated(&self, uri: &str) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let uri = uri.to_string();
        self.queue.dispatch(uri.clone(), move || {
            this.handle_drop_flow_config_update(&uri)
        });
    }

    /// A learning-bridge interface changed.
    pub fn lb_iface_updated(&self, uuid: &str) {
        if self.is_stopping() {
            return;
        }
        let Some(this) = self.handle() else { return };
        let uuid = uuid.to_string();
        self.queue
            .dispatch(uuid.clone(), move || this.handle_lb_iface_update(&uuid));
    }

    /// Routing-domain configuration changes do not affect the access
    /// pipeline.
    pub fn rd_config_updated(&self, _uri: &str) {}

    /// Configures the drop-log tunnel destination.
    ///
    /// The interface and remote port are always recorded; an unparsable or
    /// IPv6 destination leaves the previous destination untouched.
    pub fn set_drop_log(
        &self,
        iface: &str,
        remote_ip: &str,
        remote_port: u16,
    ) -> Result<(), AccessOrchError> {
        let mut state = self.drop_log.lock().unwrap();
        state.iface = iface.to_string();
        state.remote_port = remote_port;
        match remote_ip.parse::<IpAddr>() {
            Err(_) => {
                error!(remote_ip, "invalid drop-log tunnel destination IP");
                Err(AccessOrchError::InvalidDropLogDest(remote_ip.to_string()))
            }
            Ok(IpAddr::V6(_)) => {
                error!(remote_ip, "IPv6 drop-log tunnel destinations are not supported");
                Err(AccessOrchError::UnsupportedDropLogDest(remote_ip.to_string()))
            }
            Ok(IpAddr::V4(dst)) => {
                state.dst = Some(dst);
                info!(iface, remote_ip, remote_port, "drop-log destination set");
                Ok(())
            }
        }
    }

    /// Releases ids whose backing objects are gone.
    pub fn cleanup(&self) {
        let policy = Arc::clone(&self.policy);
        self.ids
            .collect_garbage(NS_SECGROUP, |uri| policy.sec_group_exists(uri));

        let endpoints = Arc::clone(&self.endpoints);
        self.ids.collect_garbage(NS_SECGROUP_SET, |key| {
            let groups = sec_group_set_from_id(key);
            if groups.is_empty() {
                // The reserved empty-set id lives for the process lifetime.
                return true;
            }
            !endpoints.sec_group_set_unused(&groups)
        });
    }

    // ============ Endpoint handling ============

    fn handle_endpoint_update(&self, uuid: &str) {
        self.endpoint_updates.fetch_add(1, Ordering::Relaxed);
        debug!(uuid, "updating endpoint");

        let Some(ep) = self.endpoints.endpoint(uuid) else {
            self.programmer.clear(uuid, table::GROUP_MAP);
            self.programmer.clear(uuid, table::SERVICE_BYPASS);
            if self.config.conntrack_enabled {
                self.ct_zones.erase(uuid);
            }
            return;
        };

        let access_port = ep
            .access_iface
            .as_deref()
            .and_then(|iface| self.ports.find(iface));
        let uplink_port = ep
            .uplink_iface
            .as_deref()
            .and_then(|iface| self.ports.find(iface));

        let set_id = match self.ids.get_id(NS_SECGROUP_SET, &ep.sec_group_set_id()) {
            Ok(id) => id,
            Err(e) => {
                error!(uuid, error = %e, "could not allocate security-group-set id");
                return;
            }
        };

        let zone = if self.config.conntrack_enabled {
            match self.ct_zones.get(uuid) {
                Ok(zone) => Some(zone),
                Err(e) => {
                    error!(uuid, error = %e, "could not allocate connection tracking zone");
                    None
                }
            }
        } else {
            None
        };

        let mut trunk_masks: Vec<range::Mask> = Vec::new();
        if let Some(iface) = ep.iface_name.as_deref() {
            for (lo, hi) in self.endpoints.trunk_vlans(iface) {
                trunk_masks.extend(range::range_masks(lo, hi));
            }
        }

        let mut group_map = Vec::new();
        let mut service_bypass = Vec::new();

        if let (Some(access), Some(uplink)) = (access_port, uplink_port) {
            group_map.push(access_classifier_flow(&ep, access, uplink, set_id, zone));

            // An endpoint reaching its own service address skips
            // security-group checks entirely.
            flow_bypass_service_ip(&mut service_bypass, access, uplink, &ep);

            if ep.allow_untagged && ep.access_vlan.is_some() {
                group_map.push(untagged_classifier_flow(&ep, access, uplink, set_id, zone));
            }

            if ep.dhcp_v4 {
                flow_bypass_dhcp_request(&mut group_map, true, false, access, uplink, &ep);
                if ep.allow_untagged && ep.access_vlan.is_some() {
                    flow_bypass_dhcp_request(&mut group_map, true, true, access, uplink, &ep);
                }
            }
            if ep.dhcp_v6 {
                flow_bypass_dhcp_request(&mut group_map, false, false, access, uplink, &ep);
                if ep.allow_untagged && ep.access_vlan.is_some() {
                    flow_bypass_dhcp_request(&mut group_map, false, true, access, uplink, &ep);
                }
            }

            group_map.push(uplink_classifier_flow(&ep, access, uplink, set_id, zone));

            // Frames on trunked VLANs pass straight between the ports; the
            // learning bridge owns them.
            for mask in &trunk_masks {
                let tci = 0x1000 | mask.value;
                let tci_mask = 0x1000 | (0x0fff & mask.mask);
                group_map.push(
                    FlowBuilder::new()
                        .priority(500)
                        .in_port(access)
                        .tci(tci, tci_mask)
                        .output(uplink)
                        .build(),
                );
                group_map.push(
                    FlowBuilder::new()
                        .priority(500)
                        .in_port(uplink)
                        .tci(tci, tci_mask)
                        .output(access)
                        .build(),
                );
            }

            for mapping in &ep.ip_mappings {
                if !mapping.is_programmable() {
                    continue;
                }
                let floating = mapping.floating.unwrap();
                flow_bypass_floating_ip(&mut group_map, access, uplink, false, false, floating, &ep);
                flow_bypass_floating_ip(&mut group_map, uplink, access, true, false, floating, &ep);
                if ep.allow_untagged && ep.access_vlan.is_some() {
                    flow_bypass_floating_ip(
                        &mut group_map, access, uplink, false, true, floating, &ep,
                    );
                    flow_bypass_floating_ip(
                        &mut group_map, uplink, access, true, true, floating, &ep,
                    );
                }
            }
        }

        self.programmer.write(uuid, table::GROUP_MAP, group_map);
        self.programmer
            .write(uuid, table::SERVICE_BYPASS, service_bypass);
    }

    // ============ Security-group handling ============

    fn handle_sec_grp_update(&self, uri: &str) {
        for set in self.endpoints.sets_containing_group(uri) {
            self.sec_group_set_updated(&set);
        }
    }

    /// Returns true for security groups whose rules apply across all
    /// group sets. The marker name carries a domain token when the
    /// controller domain path has one.
    fn is_system_sec_group(&self, uri: &str) -> bool {
        let mut marker = SYSTEM_SEC_GROUP_SUFFIX.to_string();
        let parts: Vec<&str> = self.config.controller_domain.split('/').collect();
        if parts.len() == VMM_DOMAIN_DN_PARTS {
            let ctrl_parts: Vec<&str> = parts[2].split('-').collect();
            if ctrl_parts.len() == 3 {
                marker = format!("{}{}", ctrl_parts[2], SYSTEM_SEC_GROUP_SUFFIX);
            }
        }
        uri.contains(&marker)
    }

    fn handle_sec_grp_set_update(&self, groups: &BTreeSet<String>, id_str: &str) {
        self.set_updates.fetch_add(1, Ordering::Relaxed);
        debug!(set = id_str, "updating security group set");

        if self.endpoints.sec_group_set_unused(groups) {
            self.programmer.clear(id_str, table::SEC_GROUP_IN);
            self.programmer.clear(id_str, table::SEC_GROUP_OUT);
            self.programmer.clear(id_str, table::SYS_SEC_GRP_IN);
            self.programmer.clear(id_str, table::SYS_SEC_GRP_OUT);
            return;
        }

        let set_id = match self.ids.get_id(NS_SECGROUP_SET, id_str) {
            Ok(id) => id,
            Err(e) => {
                error!(set = id_str, error = %e, "could not allocate security-group-set id");
                return;
            }
        };

        let mut sec_in: Vec<FlowEntry> = Vec::new();
        let mut sec_out: Vec<FlowEntry> = Vec::new();
        let mut sys_in: Vec<FlowEntry> = Vec::new();
        let mut sys_out: Vec<FlowEntry> = Vec::new();
        let mut any_system_rule = false;

        for uri in groups {
            let system = self.is_system_sec_group(uri);
            let (ingress_table, egress_table, after_in, after_out) = if system {
                (
                    table::SYS_SEC_GRP_IN,
                    table::SYS_SEC_GRP_OUT,
                    table::SEC_GROUP_IN,
                    table::SEC_GROUP_OUT,
                )
            } else {
                (
                    table::SEC_GROUP_IN,
                    table::SEC_GROUP_OUT,
                    table::TAP,
                    table::TAP,
                )
            };

            for rule in self.policy.sec_group_rules(uri) {
                if system {
                    any_system_rule = true;
                }

                let rule_cookie = match self.ids.get_id(NS_CLASSIFIER_RULE, &rule.uri) {
                    Ok(id) => id as u64,
                    Err(e) => {
                        error!(rule = rule.uri.as_str(), error = %e, "could not allocate rule cookie");
                        continue;
                    }
                };

                let scoped = !rule.remote_subnets.is_empty() || !rule.named_ports.is_empty();
                let remote_subs = scoped.then_some(&rule.remote_subnets);
                let named_ports = scoped.then_some(rule.named_ports.as_slice());
                let skip_l34 = !scoped && !self.config.add_l34_flows_without_subnet;

                let act = if rule.allow {
                    if rule.conn_track == ConnTrackMode::Reflexive {
                        ClassAction::ReflexFwd
                    } else {
                        ClassAction::Allow
                    }
                } else {
                    ClassAction::Deny
                };

                let spec = |next_table: u8, current_table: u8, cookie: u64| ClassifierFlowSpec {
                    next_table,
                    current_table,
                    drop_table: table::EXP_DROP,
                    priority: rule.priority,
                    flags: flags::SEND_FLOW_REM,
                    cookie,
                    group_id: set_id,
                    log: rule.log,
                    system_rule: system,
                };

                let (in_list, out_list) = if system {
                    (&mut sys_in, &mut sys_out)
                } else {
                    (&mut sec_in, &mut sec_out)
                };

                if skip_l34 {
                    debug!(rule = rule.uri.as_str(), "no remote scope, emitting L2 entries only");
                    if rule.direction.applies_in() {
                        let next = if act == ClassAction::Deny {
                            table::EXP_DROP
                        } else {
                            after_in
                        };
                        add_l2_classifier_entries(
                            &rule.classifier,
                            act,
                            &spec(next, ingress_table, rule_cookie),
                            in_list,
                        );
                    }
                    if rule.direction.applies_out() {
                        let next = if act == ClassAction::Deny {
                            table::EXP_DROP
                        } else {
                            after_out
                        };
                        add_l2_classifier_entries(
                            &rule.classifier,
                            act,
                            &spec(next, egress_table, rule_cookie),
                            out_list,
                        );
                    }
                    continue;
                }

                if rule.direction.applies_in() {
                    let next = if act == ClassAction::Deny {
                        table::EXP_DROP
                    } else {
                        after_in
                    };
                    add_classifier_entries(
                        &rule.classifier,
                        act,
                        remote_subs,
                        None,
                        None,
                        &spec(next, ingress_table, rule_cookie),
                        in_list,
                    );
                    if act == ClassAction::ReflexFwd {
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexFwdTrack,
                            remote_subs,
                            None,
                            None,
                            &spec(ingress_table, ingress_table, rule_cookie),
                            in_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexFwdEst,
                            remote_subs,
                            None,
                            None,
                            &spec(after_in, ingress_table, rule_cookie),
                            in_list,
                        );
                        // Reverse entries admit the reply half of the
                        // connection on the egress side.
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexRevTrack,
                            None,
                            remote_subs,
                            named_ports,
                            &spec(table::GROUP_MAP, egress_table, 0),
                            out_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexRevAllow,
                            None,
                            remote_subs,
                            named_ports,
                            &spec(after_out, egress_table, rule_cookie),
                            out_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexRevRelated,
                            None,
                            remote_subs,
                            named_ports,
                            &spec(after_out, egress_table, rule_cookie),
                            out_list,
                        );
                    }
                }

                if rule.direction.applies_out() {
                    let next = if act == ClassAction::Deny {
                        table::EXP_DROP
                    } else {
                        after_out
                    };
                    add_classifier_entries(
                        &rule.classifier,
                        act,
                        None,
                        remote_subs,
                        named_ports,
                        &spec(next, egress_table, rule_cookie),
                        out_list,
                    );
                    if act == ClassAction::ReflexFwd {
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexFwdTrack,
                            None,
                            remote_subs,
                            named_ports,
                            &spec(egress_table, egress_table, rule_cookie),
                            out_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexFwdEst,
                            None,
                            remote_subs,
                            named_ports,
                            &spec(after_out, egress_table, rule_cookie),
                            out_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexRevTrack,
                            remote_subs,
                            None,
                            None,
                            &spec(table::GROUP_MAP, ingress_table, 0),
                            in_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexRevAllow,
                            remote_subs,
                            None,
                            None,
                            &spec(after_in, ingress_table, rule_cookie),
                            in_list,
                        );
                        add_classifier_entries(
                            &rule.classifier,
                            ClassAction::ReflexRevRelated,
                            remote_subs,
                            None,
                            None,
                            &spec(after_in, ingress_table, rule_cookie),
                            in_list,
                        );
                    }
                }
            }
        }

        self.programmer.write(id_str, table::SEC_GROUP_IN, sec_in);
        self.programmer.write(id_str, table::SEC_GROUP_OUT, sec_out);

        if any_system_rule {
            // Packets not admitted by any system rule are dropped here
            // rather than falling through to the user tables.
            for sys_table in [table::SYS_SEC_GRP_IN, table::SYS_SEC_GRP_OUT] {
                self.programmer.write(
                    "SystemDropLogFlow",
                    sys_table,
                    vec![FlowBuilder::new()
                        .priority(2)
                        .cookie(cookie::TABLE_DROP_FLOW)
                        .flags(flags::SEND_FLOW_REM)
                        .drop_log(sys_table)
                        .go(table::EXP_DROP)
                        .build()],
                );
            }
            self.programmer.write(id_str, table::SYS_SEC_GRP_IN, sys_in);
            self.programmer
                .write(id_str, table::SYS_SEC_GRP_OUT, sys_out);
        } else {
            self.programmer.clear(id_str, table::SYS_SEC_GRP_IN);
            self.programmer.clear(id_str, table::SYS_SEC_GRP_OUT);
            self.programmer.clear("SystemDropLogFlow", table::SYS_SEC_GRP_IN);
            self.programmer
                .clear("SystemDropLogFlow", table::SYS_SEC_GRP_OUT);
        }
    }

    // ============ Port, QoS, and drop-log handling ============

    fn handle_port_status_update(&self, name: &str, port_no: u32) {
        self.port_updates.fetch_add(1, Ordering::Relaxed);
        debug!(name, port_no, "port status update");

        let mut affected: BTreeSet<String> = BTreeSet::new();
        affected.extend(self.endpoints.endpoints_by_access_iface(name));
        affected.extend(self.endpoints.endpoints_by_uplink_iface(name));
        for uuid in affected {
            self.endpoint_updated(&uuid);
        }

        let is_drop_log_iface = self.drop_log.lock().unwrap().iface == name;
        if is_drop_log_iface {
            self.handle_drop_log_port_update();
        }
    }

    fn handle_dscp_qos_update(&self, iface: &str, dscp: u8) {
        let owner_v4 = format!("{}ipv4", iface);
        let owner_v6 = format!("{}ipv6", iface);
        self.programmer.clear(&owner_v4, table::DROP_LOG);
        self.programmer.clear(&owner_v6, table::DROP_LOG);

        if dscp == 0 {
            return;
        }

        let Some(port) = self.ports.find(iface) else {
            debug!(iface, "dscp interface has no port yet");
            return;
        };

        debug!(iface, dscp, "installing dscp marking flows");
        for (owner, eth_type) in [(owner_v4, eth::IP), (owner_v6, eth::IPV6)] {
            self.programmer.write(
                &owner,
                table::DROP_LOG,
                vec![FlowBuilder::new()
                    .priority(65535)
                    .eth_type(eth_type)
                    .in_port(port)
                    .set_dscp(dscp)
                    .resubmit(port, table::SERVICE_BYPASS)
                    .build()],
            );
        }
    }

    fn handle_drop_log_port_update(&self) {
        let (iface, dst, remote_port) = {
            let state = self.drop_log.lock().unwrap();
            (state.iface.clone(), state.dst, state.remote_port)
        };

        let Some(dst) = dst.filter(|_| !iface.is_empty()) else {
            self.programmer.clear("static", table::EXP_DROP);
            warn!(iface = iface.as_str(), "drop-log destination not configured, ignoring");
            return;
        };

        if let Some(port) = self.ports.find(&iface) {
            debug!(iface = iface.as_str(), port, dst = %dst, remote_port, "programming drop-log output");
            self.programmer.write(
                "static",
                table::EXP_DROP,
                vec![FlowBuilder::new()
                    .priority(0)
                    .metadata(meta::DROP_LOG, meta::DROP_LOG)
                    .load(Reg::TunnelDst, u64::from(u32::from(dst)))
                    .output(port)
                    .build()],
            );
        }
    }

    fn handle_drop_log_config_update(&self, uri: &str) {
        let passthrough = FlowBuilder::new()
            .priority(2)
            .go(table::SERVICE_BYPASS)
            .build();

        match self.policy.drop_log_config(uri) {
            None => {
                self.programmer
                    .write("DropLogConfig", table::DROP_LOG, vec![passthrough]);
                info!("defaulting to drop-log disabled");
            }
            Some(cfg) if cfg.enabled => match cfg.mode {
                DropLogMode::Unfiltered => {
                    self.programmer.write(
                        "DropLogConfig",
                        table::DROP_LOG,
                        vec![FlowBuilder::new()
                            .priority(2)
                            .write_metadata(meta::DROP_LOG, meta::DROP_LOG)
                            .go(table::SERVICE_BYPASS)
                            .build()],
                    );
                    info!("drop-log mode set to unfiltered");
                }
                DropLogMode::Filtered => {
                    self.programmer.clear("DropLogConfig", table::DROP_LOG);
                    info!("drop-log mode set to filtered");
                }
            },
            Some(_) => {
                self.programmer
                    .write("DropLogConfig", table::DROP_LOG, vec![passthrough]);
                info!("drop-log disabled");
            }
        }
    }

    fn handle_drop_flow_config_update(&self, uri: &str) {
        let Some(spec) = self.policy.drop_flow_config(uri) else {
            self.programmer.clear(uri, table::DROP_LOG);
            return;
        };

        let mut fb = FlowBuilder::new().priority(1);
        if let Some(eth_type) = spec.eth_type {
            fb = fb.eth_type(eth_type);
        }
        if let Some(addr) = spec.inner_src {
            fb = fb.ip_src(IpPrefix::host(addr));
        }
        if let Some(addr) = spec.inner_dst {
            fb = fb.ip_dst(IpPrefix::host(addr));
        }
        if let Some(addr) = spec.outer_src {
            fb = fb.outer_ip_src(addr);
        }
        if let Some(addr) = spec.outer_dst {
            fb = fb.outer_ip_dst(addr);
        }
        if let Some(tun_id) = spec.tunnel_id {
            fb = fb.tun_id(tun_id);
        }
        if let Some(proto) = spec.ip_proto {
            fb = fb.proto(proto);
        }
        if let Some(port) = spec.src_port {
            fb = fb.tp_src(port);
        }
        if let Some(port) = spec.dst_port {
            fb = fb.tp_dst(port);
        }
        let flow = fb
            .write_metadata(meta::DROP_LOG, meta::DROP_LOG)
            .go(table::SERVICE_BYPASS)
            .build();
        self.programmer.write(uri, table::DROP_LOG, vec![flow]);
    }

    fn handle_lb_iface_update(&self, uuid: &str) {
        debug!(uuid, "updating learning bridge interface");
        let Some(iface) = self.endpoints.learning_bridge_iface(uuid) else {
            return;
        };
        for ep_uuid in self.endpoints.endpoints_by_iface(&iface) {
            self.endpoint_updated(&ep_uuid);
        }
    }
}

// ============ Per-endpoint flow construction ============

fn push_vlan_meta(ep: &Endpoint) -> u64 {
    if ep.allow_untagged {
        meta::access_out::UNTAGGED_AND_PUSH_VLAN
    } else {
        meta::access_out::PUSH_VLAN
    }
}

/// Classifier for frames arriving from the access port (egress direction).
fn access_classifier_flow(
    ep: &Endpoint,
    access: u32,
    uplink: u32,
    set_id: u32,
    zone: Option<u16>,
) -> FlowEntry {
    let mut fb = FlowBuilder::new().priority(100).in_port(access);
    if let Some(zone) = zone {
        fb = fb.load(Reg::R6, zone.into());
    }
    fb = fb.load(Reg::R0, set_id.into()).load(Reg::R7, uplink.into());
    if let Some(vlan) = ep.access_vlan {
        fb = fb.vlan(vlan.as_u16()).write_metadata(
            meta::access_out::POP_VLAN | meta::access_meta::EGRESS_DIR,
            meta::ACCESS_MASK,
        );
    } else {
        fb = fb
            .tci(0, 0x1fff)
            .write_metadata(meta::access_meta::EGRESS_DIR, meta::access_meta::MASK);
    }
    fb.go(table::SYS_SEC_GRP_OUT).build()
}

/// Lower-priority untagged variant of the access classifier, for
/// endpoints that accept untagged frames alongside their VLAN.
fn untagged_classifier_flow(
    ep: &Endpoint,
    access: u32,
    uplink: u32,
    set_id: u32,
    zone: Option<u16>,
) -> FlowEntry {
    debug_assert!(ep.allow_untagged && ep.access_vlan.is_some());
    let mut fb = FlowBuilder::new().priority(99).in_port(access).tci(0, 0x1fff);
    if let Some(zone) = zone {
        fb = fb.load(Reg::R6, zone.into());
    }
    fb.load(Reg::R0, set_id.into())
        .load(Reg::R7, uplink.into())
        .write_metadata(meta::access_meta::EGRESS_DIR, meta::access_meta::MASK)
        .go(table::SYS_SEC_GRP_OUT)
        .build()
}

/// Classifier for frames arriving from the uplink port (ingress
/// direction).
fn uplink_classifier_flow(
    ep: &Endpoint,
    access: u32,
    uplink: u32,
    set_id: u32,
    zone: Option<u16>,
) -> FlowEntry {
    let mut fb = FlowBuilder::new().priority(100).in_port(uplink);
    if let Some(zone) = zone {
        fb = fb.load(Reg::R6, zone.into());
    }
    fb = fb.load(Reg::R0, set_id.into()).load(Reg::R7, access.into());
    if let Some(vlan) = ep.access_vlan {
        fb = fb.load(Reg::R5, vlan.as_u16().into()).write_metadata(
            push_vlan_meta(ep) | meta::access_meta::INGRESS_DIR,
            meta::ACCESS_MASK,
        );
    } else {
        fb = fb.write_metadata(meta::access_meta::INGRESS_DIR, meta::access_meta::MASK);
    }
    fb.go(table::SYS_SEC_GRP_IN).build()
}

/// DHCP requests bypass policy when virtual DHCP serves the endpoint.
fn flow_bypass_dhcp_request(
    entries: &mut Vec<FlowEntry>,
    v4: bool,
    skip_pop_vlan: bool,
    in_port: u32,
    out_port: u32,
    ep: &Endpoint,
) {
    let tagged = ep.access_vlan.is_some() && !skip_pop_vlan;
    let fb = FlowBuilder::new()
        .priority(if tagged { 201 } else { 200 })
        .in_port(in_port);
    let mut fb = match_dhcp_req(fb, v4).load(Reg::R7, out_port.into());

    if tagged {
        fb = fb.vlan(ep.access_vlan.unwrap().as_u16()).write_metadata(
            meta::access_out::POP_VLAN | meta::access_meta::EGRESS_DIR,
            meta::ACCESS_MASK,
        );
    }
    if ep.access_vlan.is_none() && !skip_pop_vlan {
        fb = fb.write_metadata(meta::access_meta::EGRESS_DIR, meta::access_meta::MASK);
    }
    if skip_pop_vlan {
        fb = fb
            .tci(0, 0x1fff)
            .write_metadata(meta::access_meta::EGRESS_DIR, meta::access_meta::MASK);
    }

    entries.push(fb.go(table::TAP).build());
}

/// Traffic to or from a floating address bypasses conntrack and policy.
fn flow_bypass_floating_ip(
    entries: &mut Vec<FlowEntry>,
    in_port: u32,
    out_port: u32,
    ingress: bool,
    skip_pop_vlan: bool,
    floating: IpAddr,
    ep: &Endpoint,
) {
    let tagged = ep.access_vlan.is_some() && !skip_pop_vlan;
    let mut fb = FlowBuilder::new()
        .priority(if tagged { 201 } else { 200 })
        .in_port(in_port)
        .eth_type(if floating.is_ipv4() { eth::IP } else { eth::IPV6 });

    fb = if ingress {
        fb.ip_src(IpPrefix::host(floating))
    } else {
        fb.ip_dst(IpPrefix::host(floating))
    };
    fb = fb.load(Reg::R7, out_port.into());

    if tagged {
        let vlan = ep.access_vlan.unwrap().as_u16();
        if ingress {
            fb = fb.load(Reg::R5, vlan.into()).write_metadata(
                push_vlan_meta(ep) | meta::access_meta::INGRESS_DIR,
                meta::ACCESS_MASK,
            );
        } else {
            fb = fb.vlan(vlan).write_metadata(
                meta::access_out::POP_VLAN | meta::access_meta::EGRESS_DIR,
                meta::ACCESS_MASK,
            );
        }
    }

    let dir = if ingress {
        meta::access_meta::INGRESS_DIR
    } else {
        meta::access_meta::EGRESS_DIR
    };
    if ep.access_vlan.is_none() && !skip_pop_vlan {
        fb = fb.write_metadata(dir, meta::access_meta::MASK);
    }
    if skip_pop_vlan {
        if !ingress {
            fb = fb.tci(0, 0x1fff);
        }
        fb = fb.write_metadata(dir, meta::access_meta::MASK);
    }

    entries.push(fb.go(table::TAP).build());
}

/// Traffic between an endpoint and its own service addresses skips
/// security-group checks in both directions.
fn flow_bypass_service_ip(
    entries: &mut Vec<FlowEntry>,
    access: u32,
    uplink: u32,
    ep: &Endpoint,
) {
    for ep_ip in &ep.ips {
        for service_ip in &ep.service_ips {
            if service_ip.is_ipv4() != ep_ip.is_ipv4() {
                continue;
            }
            let eth_type = if service_ip.is_ipv4() { eth::IP } else { eth::IPV6 };

            let mut ingress = FlowBuilder::new()
                .priority(10)
                .eth_type(eth_type)
                .in_port(uplink)
                .ip_src(IpPrefix::host(*service_ip))
                .ip_dst(*ep_ip)
                .load(Reg::R7, access.into());
            if let Some(vlan) = ep.access_vlan {
                ingress = ingress.load(Reg::R5, vlan.as_u16().into()).write_metadata(
                    meta::access_out::PUSH_VLAN | meta::access_meta::INGRESS_DIR,
                    meta::ACCESS_MASK,
                );
            } else {
                ingress = ingress
                    .write_metadata(meta::access_meta::INGRESS_DIR, meta::access_meta::MASK);
            }
            entries.push(ingress.go(table::TAP).build());

            let mut egress = FlowBuilder::new()
                .priority(10)
                .eth_type(eth_type)
                .in_port(access)
                .ip_src(*ep_ip)
                .ip_dst(IpPrefix::host(*service_ip))
                .load(Reg::R7, uplink.into());
            if let Some(vlan) = ep.access_vlan {
                egress = egress.vlan(vlan.as_u16()).write_metadata(
                    meta::access_out::POP_VLAN | meta::access_meta::EGRESS_DIR,
                    meta::ACCESS_MASK,
                );
            } else {
                egress = egress
                    .tci(0, 0x1fff)
                    .write_metadata(meta::access_meta::EGRESS_DIR, meta::access_meta::MASK);
            }
            entries.push(egress.go(table::TAP).build());
        }
    }
}
