//! Expansion of policy-rule classifiers into flow entries.
//!
//! A single declarative rule can produce many concrete entries: one per
//! combination of source subnet, destination service port, source and
//! destination port mask, and TCP-flag word — and, for reflexive rules, a
//! family of cooperating conntrack entries. This module owns that
//! expansion; the per-group/per-direction loop lives in the orchestrator.

use crate::flow::{
    ct_flags, ct_state, eth, ip_proto, meta, range, FlowBuilder, FlowEntry, Reg,
};
use crate::policy::{tcp_flags, tcp_flags_to_wire, L4Classifier, ServicePort};
use accessd_types::IpPrefix;
use std::collections::BTreeSet;

/// What the emitted entries do with a matching packet.
///
/// A reflexive allow rule is not one entry but a family: the forward side
/// tracks, commits, and passes established traffic; the reverse side tracks
/// and passes replies and related flows. The datapath itself evaluates the
/// pattern; the compiler only enumerates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassAction {
    /// Stateless allow.
    Allow,
    /// Drop, routed through the drop-log table.
    Deny,
    /// Untracked forward traffic: send through conntrack and re-enter.
    ReflexFwdTrack,
    /// New tracked connection: commit and pass.
    ReflexFwd,
    /// Established tracked connection: pass.
    ReflexFwdEst,
    /// Untracked reverse traffic: send through conntrack and re-enter.
    ReflexRevTrack,
    /// Tracked established reply: pass.
    ReflexRevAllow,
    /// Tracked related reply (ICMP errors): pass, protocol-level match only.
    ReflexRevRelated,
}

impl ClassAction {
    /// Entries that carry the full L3/L4 match set. The reverse-direction
    /// entries match on connection state instead.
    fn takes_l34_matches(&self) -> bool {
        matches!(
            self,
            ClassAction::Allow
                | ClassAction::Deny
                | ClassAction::ReflexFwdTrack
                | ClassAction::ReflexFwd
                | ClassAction::ReflexFwdEst
        )
    }
}

/// Per-rule parameters shared by every entry the rule expands to.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierFlowSpec {
    /// Table entered on a pass; the conntrack recirculation target for the
    /// `*Track` actions; the drop table for deny.
    pub next_table: u8,
    /// Table the entries are installed into.
    pub current_table: u8,
    /// Drop-log sink table.
    pub drop_table: u8,
    pub priority: u16,
    pub flags: u32,
    pub cookie: u64,
    /// Security-group-set id matched in reg0; zeroed for system rules.
    pub group_id: u32,
    pub log: bool,
    /// System rules apply to every group set and never commit connections.
    pub system_rule: bool,
}

impl ClassifierFlowSpec {
    fn effective_group_id(&self) -> u32 {
        if self.system_rule {
            0
        } else {
            self.group_id
        }
    }
}

fn match_group(fb: FlowBuilder, spec: &ClassifierFlowSpec) -> FlowBuilder {
    let fb = fb.priority(spec.priority);
    let group = spec.effective_group_id();
    if group != 0 {
        fb.reg(Reg::R0, group)
    } else {
        fb
    }
}

/// Applies the classifier's L2/L3 protocol matches and returns the
/// ethertype in effect (0 when unspecified).
fn match_protocol(mut fb: FlowBuilder, cls: &L4Classifier) -> (FlowBuilder, u16) {
    if let Some(opc) = cls.arp_opc {
        fb = fb.proto(opc);
    }
    let eth_type = cls.eth_type.unwrap_or(0);
    if eth_type != 0 {
        fb = fb.eth_type(eth_type);
    }
    if let Some(proto) = cls.proto {
        fb = fb.proto(proto);
    }
    (fb, eth_type)
}

/// Address families must agree with the frame type or the combination is
/// unmatchable and skipped.
fn family_matches(addr_is_v4: bool, eth_type: u16) -> bool {
    if addr_is_v4 {
        eth_type == eth::ARP || eth_type == eth::IP
    } else {
        eth_type == eth::IPV6
    }
}

fn apply_src_subnet(fb: FlowBuilder, subnet: &IpPrefix, eth_type: u16) -> Option<FlowBuilder> {
    if !family_matches(subnet.is_ipv4(), eth_type) {
        return None;
    }
    Some(fb.ip_src(*subnet))
}

fn apply_service_port(fb: FlowBuilder, port: &ServicePort, eth_type: u16) -> Option<FlowBuilder> {
    if !family_matches(port.address.is_ipv4(), eth_type) {
        return None;
    }
    let prefix = IpPrefix::new(port.address, port.effective_prefix_len()).ok()?;
    let fb = fb.ip_dst(prefix);
    if port.port == 0 {
        return Some(fb);
    }
    Some(fb.proto(port.proto).tp_dst(port.port))
}

/// Source/destination port mask lists for a classifier.
///
/// ICMP typed rules carry the type in the source list and the code in the
/// destination list, full mask, no expansion. Empty lists get a single
/// wildcard so the product loops always run.
fn port_masks(cls: &L4Classifier) -> (Vec<range::Mask>, Vec<range::Mask>) {
    let mut src = Vec::new();
    let mut dst = Vec::new();
    if cls.is_icmp_typed() {
        if let Some(icmp_type) = cls.icmp_type {
            src.push(range::Mask {
                value: icmp_type as u16,
                mask: 0xffff,
            });
        }
        if let Some(icmp_code) = cls.icmp_code {
            dst.push(range::Mask {
                value: icmp_code as u16,
                mask: 0xffff,
            });
        }
    } else {
        if let Some((lo, hi)) = cls.sport {
            src = range::range_masks(lo, hi);
        }
        if let Some((lo, hi)) = cls.dport {
            dst = range::range_masks(lo, hi);
        }
    }
    if src.is_empty() {
        src.push(range::Mask { value: 0, mask: 0 });
    }
    if dst.is_empty() {
        dst.push(range::Mask { value: 0, mask: 0 });
    }
    (src, dst)
}

/// TCP-flag words the rule expands to. `ESTABLISHED` means "part of an
/// established conversation" and becomes two words, ACK and RST.
fn tcp_flag_words(cls: &L4Classifier) -> Vec<u32> {
    if cls.tcp_flags & tcp_flags::ESTABLISHED != 0 {
        vec![tcp_flags::ACK, tcp_flags::RST]
    } else {
        vec![cls.tcp_flags]
    }
}

fn append_terminal_actions(
    mut fb: FlowBuilder,
    act: ClassAction,
    spec: &ClassifierFlowSpec,
) -> FlowBuilder {
    match act {
        ClassAction::ReflexFwdTrack | ClassAction::ReflexRevTrack => {
            fb.conntrack(0, Reg::R6, Some(spec.next_table))
        }
        ClassAction::ReflexFwd => {
            if !spec.system_rule {
                fb = fb.conntrack(ct_flags::COMMIT, Reg::R6, None);
                if spec.log {
                    fb = fb.permit_log(spec.current_table, spec.drop_table, spec.cookie);
                }
            }
            fb.go(spec.next_table)
        }
        ClassAction::ReflexFwdEst | ClassAction::Allow | ClassAction::ReflexRevAllow => {
            if spec.log {
                fb = fb.permit_log(spec.current_table, spec.drop_table, spec.cookie);
            }
            fb.go(spec.next_table)
        }
        ClassAction::Deny => {
            if spec.log {
                fb.drop_log_deny(spec.current_table, spec.cookie).go(spec.next_table)
            } else {
                // Clear the drop-log marker: intentional denies are not
                // reported as pipeline drops.
                fb.write_metadata(0, meta::DROP_LOG).go(spec.next_table)
            }
        }
        ClassAction::ReflexRevRelated => fb.go(spec.next_table),
    }
}

fn ct_state_matches(fb: FlowBuilder, act: ClassAction) -> FlowBuilder {
    match act {
        ClassAction::ReflexFwdTrack | ClassAction::ReflexRevTrack => {
            fb.ct_state(0, ct_state::TRACKED)
        }
        ClassAction::ReflexFwd => fb.ct_state(
            ct_state::TRACKED | ct_state::NEW,
            ct_state::TRACKED | ct_state::NEW,
        ),
        ClassAction::ReflexFwdEst => fb.ct_state(
            ct_state::TRACKED | ct_state::ESTABLISHED,
            ct_state::TRACKED | ct_state::ESTABLISHED,
        ),
        ClassAction::ReflexRevAllow => fb.ct_state(
            ct_state::TRACKED | ct_state::ESTABLISHED | ct_state::REPLY,
            ct_state::TRACKED
                | ct_state::ESTABLISHED
                | ct_state::REPLY
                | ct_state::INVALID
                | ct_state::NEW
                | ct_state::RELATED,
        ),
        _ => fb,
    }
}

/// Emits the L2-only entries for a rule with no remote scope.
///
/// Skipped entirely when the classifier constrains an IP protocol; those
/// rules only make sense with L3 context.
pub fn add_l2_classifier_entries(
    cls: &L4Classifier,
    act: ClassAction,
    spec: &ClassifierFlowSpec,
    entries: &mut Vec<FlowEntry>,
) {
    if cls.proto.is_some() {
        return;
    }

    let fb = FlowBuilder::new().cookie(spec.cookie).flags(spec.flags);
    let fb = match_group(fb, spec);
    let (fb, _eth) = match_protocol(fb, cls);
    let fb = append_terminal_actions(fb, act, spec);
    entries.push(fb.build());
}

/// Emits the L3/L4 entries for one rule action.
///
/// `src_subnets` constrains the source side; `dst_subnets` and `dst_named`
/// together form the destination service-port list. `None` means the side
/// is unconstrained; `Some` with an empty collection means the rule is
/// scoped but nothing applies in this direction, producing no entries.
pub fn add_classifier_entries(
    cls: &L4Classifier,
    act: ClassAction,
    src_subnets: Option<&BTreeSet<IpPrefix>>,
    dst_subnets: Option<&BTreeSet<IpPrefix>>,
    dst_named: Option<&[ServicePort]>,
    spec: &ClassifierFlowSpec,
    entries: &mut Vec<FlowEntry>,
) {
    // Related-reply entries carry no L3/L4 detail at all; one entry per
    // rule, IP ethertypes only.
    if act == ClassAction::ReflexRevRelated {
        let eth_type = cls.eth_type.unwrap_or(0);
        if eth_type != eth::IP && eth_type != eth::IPV6 {
            return;
        }
        let fb = FlowBuilder::new()
            .cookie(spec.cookie)
            .flags(spec.flags)
            .eth_type(eth_type)
            .ct_state(
                ct_state::TRACKED | ct_state::RELATED | ct_state::REPLY,
                ct_state::TRACKED
                    | ct_state::RELATED
                    | ct_state::REPLY
                    | ct_state::ESTABLISHED
                    | ct_state::INVALID
                    | ct_state::NEW,
            );
        let fb = match_group(fb, spec);
        entries.push(fb.go(spec.next_table).build());
        return;
    }

    // Reverse-direction entries match connection state rather than the
    // rule's L3/L4 detail, so the combination loops would only produce
    // copies of one entry.
    if !act.takes_l34_matches() {
        let fb = FlowBuilder::new().cookie(spec.cookie).flags(spec.flags);
        let fb = ct_state_matches(fb, act);
        let fb = match_group(fb, spec);
        let (fb, _eth) = match_protocol(fb, cls);
        let fb = append_terminal_actions(fb, act, spec);
        entries.push(fb.build());
        return;
    }

    let eff_src: Vec<Option<&IpPrefix>> = match src_subnets {
        Some(subnets) => subnets.iter().map(Some).collect(),
        None => vec![None],
    };

    let mut eff_dst: Vec<Option<ServicePort>> = Vec::new();
    if dst_subnets.is_none() && dst_named.is_none() {
        eff_dst.push(None);
    } else {
        if let Some(subnets) = dst_subnets {
            eff_dst.extend(subnets.iter().map(|s| Some(ServicePort::from(*s))));
        }
        if let Some(named) = dst_named {
            eff_dst.extend(named.iter().cloned().map(Some));
        }
    }

    let (src_ports, dst_ports) = port_masks(cls);
    let flag_words = tcp_flag_words(cls);

    for src in &eff_src {
        for dst in &eff_dst {
            for sm in &src_ports {
                for dm in &dst_ports {
                    for &flag_word in &flag_words {
                        let fb = FlowBuilder::new().cookie(spec.cookie).flags(spec.flags);
                        let fb = ct_state_matches(fb, act);
                        let fb = match_group(fb, spec);
                        let (mut fb, eth_type) = match_protocol(fb, cls);

                        if cls.tcp_flags != tcp_flags::UNSPECIFIED {
                            let wire = tcp_flags_to_wire(flag_word);
                            fb = fb.tcp_flags(wire, wire);
                        }
                        if let Some(subnet) = src {
                            match apply_src_subnet(fb, subnet, eth_type) {
                                Some(applied) => fb = applied,
                                None => continue,
                            }
                        }
                        if let Some(port) = dst {
                            match apply_service_port(fb, port, eth_type) {
                                Some(applied) => fb = applied,
                                None => continue,
                            }
                        }
                        if sm.mask != 0 {
                            fb = fb.tp_src_masked(sm.value, sm.mask);
                        }
                        // A port resolved from the service entry takes
                        // precedence over the classifier's range.
                        if dm.mask != 0 && !fb.has_tp_dst() {
                            fb = fb.tp_dst_masked(dm.value, dm.mask);
                        }

                        let fb = append_terminal_actions(fb, act, spec);
                        entries.push(fb.build());
                    }
                }
            }
        }
    }
}

/// Matches a DHCP request: v4 is UDP 68→67, v6 is UDP 546→547.
pub fn match_dhcp_req(fb: FlowBuilder, v4: bool) -> FlowBuilder {
    let fb = fb.proto(ip_proto::UDP);
    if v4 {
        fb.eth_type(eth::IP).tp_src(68).tp_dst(67)
    } else {
        fb.eth_type(eth::IPV6).tp_src(546).tp_dst(547)
    }
}
