//! Observer configuration objects for packet-drop logging.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Scope of drop logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DropLogMode {
    /// Log every dropped packet.
    #[default]
    Unfiltered,
    /// Log only packets matching installed drop-flow filters.
    Filtered,
}

/// Drop-log enablement published by the observer model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DropLogConfig {
    pub enabled: bool,
    pub mode: DropLogMode,
}

/// One drop-flow filter: packets matching every set field are tagged for
/// drop logging. Unset fields do not constrain the match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropFlowSpec {
    pub eth_type: Option<u16>,
    pub inner_src: Option<IpAddr>,
    pub inner_dst: Option<IpAddr>,
    pub outer_src: Option<IpAddr>,
    pub outer_dst: Option<IpAddr>,
    pub tunnel_id: Option<u64>,
    pub ip_proto: Option<u8>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}
