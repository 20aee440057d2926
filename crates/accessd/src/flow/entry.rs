//! Flow entry value model.
//!
//! A [`FlowEntry`] is an immutable record of match predicates, actions,
//! priority, cookie, and flags. Equality is structural; the reconciler
//! decides what to add or remove by comparing entries, so two entries built
//! from the same inputs must compare equal.

use accessd_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Connection-tracking state bits as exposed by the datapath.
pub mod ct_state {
    pub const NEW: u32 = 0x01;
    pub const ESTABLISHED: u32 = 0x02;
    pub const RELATED: u32 = 0x04;
    pub const REPLY: u32 = 0x08;
    pub const INVALID: u32 = 0x10;
    pub const TRACKED: u32 = 0x20;
}

/// Connection-tracking action flags.
pub mod ct_flags {
    /// Commit the connection to the tracker.
    pub const COMMIT: u32 = 0x01;
}

/// A register the pipeline reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reg {
    /// Security-group-set id.
    R0,
    R1,
    R2,
    R3,
    R4,
    /// Access VLAN for push on output.
    R5,
    /// Conntrack zone.
    R6,
    /// Output port.
    R7,
    /// Tunnel destination address.
    TunnelDst,
    /// VLAN VID header field (reg-move destination).
    VlanVid,
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::R0 => write!(f, "reg0"),
            Reg::R1 => write!(f, "reg1"),
            Reg::R2 => write!(f, "reg2"),
            Reg::R3 => write!(f, "reg3"),
            Reg::R4 => write!(f, "reg4"),
            Reg::R5 => write!(f, "reg5"),
            Reg::R6 => write!(f, "reg6"),
            Reg::R7 => write!(f, "reg7"),
            Reg::TunnelDst => write!(f, "tun_dst"),
            Reg::VlanVid => write!(f, "vlan_vid"),
        }
    }
}

/// Reason recorded by a drop-log action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureReason {
    /// Packet fell through a table without matching.
    TableDrop,
    /// Packet matched an explicit policy deny.
    PolicyDeny,
}

/// A single match predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchField {
    InPort(u32),
    Reg(Reg, u32),
    Metadata { value: u64, mask: u64 },
    EthType(u16),
    Proto(u8),
    IpSrc(IpPrefix),
    IpDst(IpPrefix),
    OuterIpSrc(IpAddr),
    OuterIpDst(IpAddr),
    TpSrc { value: u16, mask: u16 },
    TpDst { value: u16, mask: u16 },
    Tci { value: u16, mask: u16 },
    Vlan(u16),
    TcpFlags { value: u16, mask: u16 },
    CtState { value: u32, mask: u32 },
    TunId(u64),
}

/// A single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    /// Load an immediate value into a register.
    Load { reg: Reg, value: u64 },
    /// Write metadata bits under a field mask.
    Metadata { value: u64, mask: u64 },
    PushVlan,
    PopVlan,
    /// Move one register's value into another.
    RegMove { src: Reg, dst: Reg },
    /// Output to the port number held in a register.
    OutputReg(Reg),
    /// Output to a literal port.
    Output(u32),
    SetDscp(u8),
    /// Re-enter the pipeline at a table with a substituted in_port.
    Resubmit { in_port: u32, table: u8 },
    /// Punt a copy to the controller.
    Controller,
    /// Send the packet through connection tracking.
    Conntrack {
        flags: u32,
        zone: Reg,
        recirc_table: Option<u8>,
    },
    /// Record a drop with its origin table and reason.
    DropLog {
        table: u8,
        reason: CaptureReason,
        cookie: u64,
    },
    /// Record a permit with its origin table.
    PermitLog {
        table: u8,
        drop_table: u8,
        cookie: u64,
    },
    /// Continue at a later table.
    Go(u8),
}

/// An immutable flow entry. Build with [`FlowBuilder`](super::FlowBuilder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub priority: u16,
    pub cookie: u64,
    pub flags: u32,
    pub matches: Vec<MatchField>,
    pub actions: Vec<FlowAction>,
}

impl FlowEntry {
    /// Returns the first match of a given shape, if present.
    pub fn find_match<F>(&self, pred: F) -> Option<&MatchField>
    where
        F: Fn(&MatchField) -> bool,
    {
        self.matches.iter().find(|m| pred(m))
    }

    /// Returns true if any action satisfies the predicate.
    pub fn has_action<F>(&self, pred: F) -> bool
    where
        F: Fn(&FlowAction) -> bool,
    {
        self.actions.iter().any(|a| pred(a))
    }

    /// Returns the goto target, if the entry ends in one.
    pub fn goto_table(&self) -> Option<u8> {
        self.actions.iter().rev().find_map(|a| match a {
            FlowAction::Go(t) => Some(*t),
            _ => None,
        })
    }
}

/// A tunnel-metadata TLV registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlvEntry {
    /// TLV class (0xffff for tunnel option metadata).
    pub class: u16,
    /// Option type.
    pub tlv_type: u8,
    /// Option length in bytes.
    pub length: u8,
    /// Mapping index.
    pub index: u8,
}
