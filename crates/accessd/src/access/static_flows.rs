//! The invariant pipeline skeleton.
//!
//! These flows are written once at startup and never vary with policy:
//! table defaults, drop-log catchers, DNS punts, the output-action
//! dispatcher, tunnel-metadata TLV registrations, and the reserved allow
//! flow for endpoints with no security groups.

use crate::flow::{
    cookie, eth, flags, ip_proto, meta, table, tlv, FlowBuilder, FlowEntry, Reg, TlvEntry,
    MAX_POLICY_RULE_PRIORITY,
};
use crate::switch::FlowProgrammer;
use tracing::debug;

const DNS_PORT: u16 = 53;

/// Unconditional allow for the reserved empty security-group set.
pub fn flow_empty_sec_group(empty_set_id: u32) -> FlowEntry {
    FlowBuilder::new()
        .priority(MAX_POLICY_RULE_PRIORITY)
        .reg(Reg::R0, empty_set_id)
        .go(table::TAP)
        .build()
}

fn out_table_flows() -> Vec<FlowEntry> {
    let mut flows = Vec::new();
    flows.push(
        FlowBuilder::new()
            .priority(1)
            .metadata(meta::access_out::POP_VLAN, meta::OUT_MASK)
            .tci(0x1000, 0x1000)
            .pop_vlan()
            .output_reg(Reg::R7)
            .build(),
    );
    flows.push(
        FlowBuilder::new()
            .priority(1)
            .metadata(meta::access_out::PUSH_VLAN, meta::OUT_MASK)
            .push_vlan()
            .reg_move(Reg::R5, Reg::VlanVid)
            .output_reg(Reg::R7)
            .build(),
    );
    // The frame is emitted twice, untagged then tagged. Needed for guests
    // that bootstrap before their VLAN interface exists.
    flows.push(
        FlowBuilder::new()
            .priority(1)
            .metadata(meta::access_out::UNTAGGED_AND_PUSH_VLAN, meta::OUT_MASK)
            .output_reg(Reg::R7)
            .push_vlan()
            .reg_move(Reg::R5, Reg::VlanVid)
            .output_reg(Reg::R7)
            .build(),
    );
    flows.push(
        FlowBuilder::new()
            .priority(1)
            .metadata(0, meta::OUT_MASK)
            .output_reg(Reg::R7)
            .build(),
    );
    flows
}

fn drop_log_tlvs() -> Vec<TlvEntry> {
    let mut tlvs = Vec::new();
    for id in 0..=10 {
        tlvs.push(tlv(0xffff, id, 4, id));
    }
    tlvs.push(tlv(0xffff, 11, 16, 11));
    tlvs.push(tlv(0xffff, 12, 4, 12));
    tlvs.push(tlv(0xffff, 13, 4, 13));
    tlvs.push(tlv(0xffff, 14, 8, 14));
    tlvs
}

fn dns_punt_flow(eth_type: u16, proto: u8, flow_cookie: u64) -> FlowEntry {
    FlowBuilder::new()
        .priority(2)
        .cookie(flow_cookie)
        .eth_type(eth_type)
        .proto(proto)
        .tp_src(DNS_PORT)
        .metadata(meta::access_meta::INGRESS_DIR, meta::access_meta::MASK)
        .controller()
        .go(table::OUT)
        .build()
}

fn tap_table_flows() -> Vec<FlowEntry> {
    vec![
        dns_punt_flow(eth::IP, ip_proto::TCP, cookie::DNS_RESPONSE_V4),
        dns_punt_flow(eth::IPV6, ip_proto::TCP, cookie::DNS_RESPONSE_V6),
        dns_punt_flow(eth::IP, ip_proto::UDP, cookie::DNS_RESPONSE_V4),
        dns_punt_flow(eth::IPV6, ip_proto::UDP, cookie::DNS_RESPONSE_V6),
        FlowBuilder::new().priority(1).go(table::OUT).build(),
    ]
}

/// Writes every invariant flow and TLV registration.
pub fn create_static_flows(programmer: &FlowProgrammer, empty_set_id: u32) {
    debug!("writing static flows");

    programmer.write("static", table::OUT, out_table_flows());
    programmer.write_tlv("DropLogStatic", drop_log_tlvs());

    programmer.write(
        "static",
        table::DROP_LOG,
        vec![FlowBuilder::new()
            .priority(0)
            .go(table::SERVICE_BYPASS)
            .build()],
    );

    // Every table between the entry and the drop sink gets a lowest
    // priority catcher that records the drop and diverts the packet for
    // optional logging.
    for table_id in table::SERVICE_BYPASS..table::EXP_DROP {
        programmer.write(
            "DropLogFlow",
            table_id,
            vec![FlowBuilder::new()
                .priority(0)
                .cookie(cookie::TABLE_DROP_FLOW)
                .flags(flags::SEND_FLOW_REM)
                .drop_log(table_id)
                .go(table::EXP_DROP)
                .build()],
        );
    }

    programmer.write(
        "static",
        table::SERVICE_BYPASS,
        vec![FlowBuilder::new()
            .priority(1)
            .go(table::GROUP_MAP)
            .build()],
    );

    programmer.write("static", table::TAP, tap_table_flows());

    programmer.write(
        "static",
        table::SYS_SEC_GRP_IN,
        vec![FlowBuilder::new()
            .priority(1)
            .go(table::SEC_GROUP_IN)
            .build()],
    );
    programmer.write(
        "static",
        table::SYS_SEC_GRP_OUT,
        vec![FlowBuilder::new()
            .priority(1)
            .go(table::SEC_GROUP_OUT)
            .build()],
    );

    // Everything is allowed for endpoints with no security-group set.
    programmer.write(
        "static",
        table::SEC_GROUP_OUT,
        vec![flow_empty_sec_group(empty_set_id)],
    );
    programmer.write(
        "static",
        table::SEC_GROUP_IN,
        vec![flow_empty_sec_group(empty_set_id)],
    );
}
