//! Flow entry construction.

use super::entry::{CaptureReason, FlowAction, FlowEntry, MatchField, Reg, TlvEntry};
use accessd_types::IpPrefix;
use std::net::IpAddr;

/// Consuming builder for a single [`FlowEntry`].
///
/// Match methods (`in_port`, `reg`, `metadata`, ...) add predicates; action
/// methods (`load`, `write_metadata`, `go`, ...) append to the action list
/// in call order. Matches and actions are recorded in the order given so
/// that identical construction sequences produce structurally equal entries.
///
/// ```
/// use accessd::flow::{FlowBuilder, Reg, table};
///
/// let flow = FlowBuilder::new()
///     .priority(100)
///     .in_port(5)
///     .load(Reg::R7, 6)
///     .go(table::SYS_SEC_GRP_OUT)
///     .build();
/// assert_eq!(flow.priority, 100);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlowBuilder {
    priority: u16,
    cookie: u64,
    flags: u32,
    matches: Vec<MatchField>,
    actions: Vec<FlowAction>,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    // ============ Match predicates ============

    pub fn in_port(mut self, port: u32) -> Self {
        self.matches.push(MatchField::InPort(port));
        self
    }

    pub fn reg(mut self, reg: Reg, value: u32) -> Self {
        self.matches.push(MatchField::Reg(reg, value));
        self
    }

    pub fn metadata(mut self, value: u64, mask: u64) -> Self {
        self.matches.push(MatchField::Metadata { value, mask });
        self
    }

    pub fn eth_type(mut self, eth_type: u16) -> Self {
        self.matches.push(MatchField::EthType(eth_type));
        self
    }

    pub fn proto(mut self, proto: u8) -> Self {
        self.matches.push(MatchField::Proto(proto));
        self
    }

    pub fn ip_src(mut self, prefix: IpPrefix) -> Self {
        self.matches.push(MatchField::IpSrc(prefix));
        self
    }

    pub fn ip_dst(mut self, prefix: IpPrefix) -> Self {
        self.matches.push(MatchField::IpDst(prefix));
        self
    }

    pub fn outer_ip_src(mut self, addr: IpAddr) -> Self {
        self.matches.push(MatchField::OuterIpSrc(addr));
        self
    }

    pub fn outer_ip_dst(mut self, addr: IpAddr) -> Self {
        self.matches.push(MatchField::OuterIpDst(addr));
        self
    }

    pub fn tp_src(self, port: u16) -> Self {
        self.tp_src_masked(port, 0xffff)
    }

    pub fn tp_src_masked(mut self, value: u16, mask: u16) -> Self {
        self.matches.push(MatchField::TpSrc { value, mask });
        self
    }

    pub fn tp_dst(self, port: u16) -> Self {
        self.tp_dst_masked(port, 0xffff)
    }

    pub fn tp_dst_masked(mut self, value: u16, mask: u16) -> Self {
        self.matches.push(MatchField::TpDst { value, mask });
        self
    }

    /// Returns true if a destination L4 port match is already present.
    /// Lets a resolved service port take precedence over the classifier's
    /// port range.
    pub fn has_tp_dst(&self) -> bool {
        self.matches
            .iter()
            .any(|m| matches!(m, MatchField::TpDst { .. }))
    }

    pub fn tci(mut self, value: u16, mask: u16) -> Self {
        self.matches.push(MatchField::Tci { value, mask });
        self
    }

    pub fn vlan(mut self, vid: u16) -> Self {
        self.matches.push(MatchField::Vlan(vid));
        self
    }

    pub fn tcp_flags(mut self, value: u16, mask: u16) -> Self {
        self.matches.push(MatchField::TcpFlags { value, mask });
        self
    }

    pub fn ct_state(mut self, value: u32, mask: u32) -> Self {
        self.matches.push(MatchField::CtState { value, mask });
        self
    }

    pub fn tun_id(mut self, id: u64) -> Self {
        self.matches.push(MatchField::TunId(id));
        self
    }

    // ============ Actions ============

    pub fn load(mut self, reg: Reg, value: u64) -> Self {
        self.actions.push(FlowAction::Load { reg, value });
        self
    }

    pub fn write_metadata(mut self, value: u64, mask: u64) -> Self {
        self.actions.push(FlowAction::Metadata { value, mask });
        self
    }

    pub fn push_vlan(mut self) -> Self {
        self.actions.push(FlowAction::PushVlan);
        self
    }

    pub fn pop_vlan(mut self) -> Self {
        self.actions.push(FlowAction::PopVlan);
        self
    }

    pub fn reg_move(mut self, src: Reg, dst: Reg) -> Self {
        self.actions.push(FlowAction::RegMove { src, dst });
        self
    }

    pub fn output_reg(mut self, reg: Reg) -> Self {
        self.actions.push(FlowAction::OutputReg(reg));
        self
    }

    pub fn output(mut self, port: u32) -> Self {
        self.actions.push(FlowAction::Output(port));
        self
    }

    pub fn set_dscp(mut self, dscp: u8) -> Self {
        self.actions.push(FlowAction::SetDscp(dscp));
        self
    }

    pub fn resubmit(mut self, in_port: u32, table: u8) -> Self {
        self.actions.push(FlowAction::Resubmit { in_port, table });
        self
    }

    pub fn controller(mut self) -> Self {
        self.actions.push(FlowAction::Controller);
        self
    }

    pub fn conntrack(mut self, flags: u32, zone: Reg, recirc_table: Option<u8>) -> Self {
        self.actions.push(FlowAction::Conntrack {
            flags,
            zone,
            recirc_table,
        });
        self
    }

    /// Records a table-drop log event.
    pub fn drop_log(mut self, table: u8) -> Self {
        self.actions.push(FlowAction::DropLog {
            table,
            reason: CaptureReason::TableDrop,
            cookie: 0,
        });
        self
    }

    /// Records a policy-deny log event attributed to `cookie`.
    pub fn drop_log_deny(mut self, table: u8, cookie: u64) -> Self {
        self.actions.push(FlowAction::DropLog {
            table,
            reason: CaptureReason::PolicyDeny,
            cookie,
        });
        self
    }

    pub fn permit_log(mut self, table: u8, drop_table: u8, cookie: u64) -> Self {
        self.actions.push(FlowAction::PermitLog {
            table,
            drop_table,
            cookie,
        });
        self
    }

    pub fn go(mut self, table: u8) -> Self {
        self.actions.push(FlowAction::Go(table));
        self
    }

    /// Builds the immutable entry.
    pub fn build(self) -> FlowEntry {
        FlowEntry {
            priority: self.priority,
            cookie: self.cookie,
            flags: self.flags,
            matches: self.matches,
            actions: self.actions,
        }
    }
}

/// Builds a tunnel-metadata TLV registration.
pub fn tlv(class: u16, tlv_type: u8, length: u8, index: u8) -> TlvEntry {
    TlvEntry {
        class,
        tlv_type,
        length,
        index,
    }
}
