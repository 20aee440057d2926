//! End-to-end pipeline tests.
//!
//! These drive the orchestrator through its public event interface, wait
//! for the per-key queue to drain, and assert on the flow sets the
//! programmer owns afterwards.

use accessd::access::{AccessFlowOrch, AccessOrchConfig};
use accessd::ctzone::CtZoneAllocator;
use accessd::flow::{
    ct_flags, ct_state, eth, ip_proto, meta, range, table, FlowAction, FlowEntry, MatchField, Reg,
    MAX_POLICY_RULE_PRIORITY,
};
use accessd::policy::{
    ConnTrackMode, Direction, DropLogConfig, DropLogMode, Endpoint, EndpointStore, L4Classifier,
    MemoryEndpointStore, MemoryPolicyStore, PolicyRule, PolicyStore,
};
use accessd::ports::PortIndex;
use accessd::switch::{FlowProgrammer, RecordingSink};
use accessd_common::IdAllocator;
use accessd_types::VlanId;
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Harness {
    endpoints: Arc<MemoryEndpointStore>,
    policy: Arc<MemoryPolicyStore>,
    ports: Arc<PortIndex>,
    ids: Arc<IdAllocator>,
    ct_zones: Arc<CtZoneAllocator>,
    programmer: Arc<FlowProgrammer>,
    orch: Arc<AccessFlowOrch>,
}

fn harness(config: AccessOrchConfig) -> Harness {
    let endpoints = Arc::new(MemoryEndpointStore::new());
    let policy = Arc::new(MemoryPolicyStore::new());
    let ports = Arc::new(PortIndex::new());
    let ids = Arc::new(IdAllocator::new());
    let ct_zones = Arc::new(CtZoneAllocator::new());
    let programmer = Arc::new(FlowProgrammer::new(Box::new(RecordingSink::new())));

    let orch = AccessFlowOrch::new(
        config,
        Arc::clone(&endpoints) as Arc<dyn EndpointStore>,
        Arc::clone(&policy) as Arc<dyn PolicyStore>,
        Arc::clone(&ports),
        Arc::clone(&ids),
        Arc::clone(&ct_zones),
        Arc::clone(&programmer),
    );
    orch.start().expect("orchestration start");

    Harness {
        endpoints,
        policy,
        ports,
        ids,
        ct_zones,
        programmer,
        orch,
    }
}

fn basic_endpoint(uuid: &str) -> Endpoint {
    Endpoint::new(uuid)
        .with_access_iface("veth0")
        .with_uplink_iface("veth0-up")
}

fn wire_basic_ports(h: &Harness) {
    h.ports.set("veth0", 5);
    h.ports.set("veth0-up", 6);
}

fn empty_set_id(h: &Harness) -> u32 {
    h.ids.lookup("secGroupSet", "").expect("reserved empty set id")
}

fn loads_reg(flow: &FlowEntry, reg: Reg, value: u64) -> bool {
    flow.has_action(|a| matches!(a, FlowAction::Load { reg: r, value: v } if *r == reg && *v == value))
}

fn writes_metadata(flow: &FlowEntry, value: u64, mask: u64) -> bool {
    flow.has_action(
        |a| matches!(a, FlowAction::Metadata { value: v, mask: m } if *v == value && *m == mask),
    )
}

fn has_ct_state(flow: &FlowEntry, value: u32, mask: u32) -> bool {
    flow.matches
        .contains(&MatchField::CtState { value, mask })
}

// ============ S1: endpoint with no security groups ============

#[tokio::test]
async fn s1_empty_endpoint_classifiers() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    h.endpoints.put(basic_endpoint("ep-1"));

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    let flows = h.programmer.flows("ep-1", table::GROUP_MAP);
    assert_eq!(flows.len(), 2);
    let empty_id = empty_set_id(&h) as u64;

    let ingress = flows
        .iter()
        .find(|f| f.matches.contains(&MatchField::InPort(5)))
        .expect("access-side classifier");
    assert_eq!(ingress.priority, 100);
    assert!(ingress.matches.contains(&MatchField::Tci {
        value: 0,
        mask: 0x1fff
    }));
    assert!(loads_reg(ingress, Reg::R0, empty_id));
    assert!(loads_reg(ingress, Reg::R7, 6));
    assert!(writes_metadata(
        ingress,
        meta::access_meta::EGRESS_DIR,
        meta::access_meta::MASK
    ));
    assert_eq!(ingress.goto_table(), Some(table::SYS_SEC_GRP_OUT));

    let uplink = flows
        .iter()
        .find(|f| f.matches.contains(&MatchField::InPort(6)))
        .expect("uplink-side classifier");
    assert_eq!(uplink.priority, 100);
    assert!(loads_reg(uplink, Reg::R0, empty_id));
    assert!(loads_reg(uplink, Reg::R7, 5));
    assert!(writes_metadata(
        uplink,
        meta::access_meta::INGRESS_DIR,
        meta::access_meta::MASK
    ));
    assert_eq!(uplink.goto_table(), Some(table::SYS_SEC_GRP_IN));
}

// ============ S2: VLAN with untagged allowed ============

#[tokio::test]
async fn s2_vlan_untagged_variants() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_access_vlan(VlanId::new(100).unwrap())
            .with_allow_untagged(true),
    );

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    let flows = h.programmer.flows("ep-1", table::GROUP_MAP);
    assert_eq!(flows.len(), 3);

    let tagged = flows
        .iter()
        .find(|f| f.priority == 100 && f.matches.contains(&MatchField::InPort(5)))
        .expect("tagged access classifier");
    assert!(tagged.matches.contains(&MatchField::Vlan(100)));
    assert!(writes_metadata(
        tagged,
        meta::access_out::POP_VLAN | meta::access_meta::EGRESS_DIR,
        meta::ACCESS_MASK
    ));

    let untagged = flows
        .iter()
        .find(|f| f.priority == 99)
        .expect("untagged access variant");
    assert!(untagged.matches.contains(&MatchField::InPort(5)));
    assert!(untagged.matches.contains(&MatchField::Tci {
        value: 0,
        mask: 0x1fff
    }));

    let uplink = flows
        .iter()
        .find(|f| f.matches.contains(&MatchField::InPort(6)))
        .expect("uplink classifier");
    assert!(loads_reg(uplink, Reg::R5, 100));
    assert!(writes_metadata(
        uplink,
        meta::access_out::UNTAGGED_AND_PUSH_VLAN | meta::access_meta::INGRESS_DIR,
        meta::ACCESS_MASK
    ));
}

// ============ S3: reflexive TCP allow ============

#[tokio::test]
async fn s3_reflexive_tcp_allow_quintet() {
    let h = harness(AccessOrchConfig {
        conntrack_enabled: true,
        add_l34_flows_without_subnet: true,
        ..Default::default()
    });
    wire_basic_ports(&h);

    let group = "/sg/web";
    h.policy.put_group(
        group,
        vec![PolicyRule::allow("/rule/http", Direction::In, 100)
            .with_conn_track(ConnTrackMode::Reflexive)
            .with_classifier(L4Classifier {
                eth_type: Some(eth::IP),
                proto: Some(ip_proto::TCP),
                dport: Some((80, 80)),
                ..Default::default()
            })],
    );
    h.endpoints
        .put(basic_endpoint("ep-1").with_security_group(group));

    let ep = h.endpoints.endpoint("ep-1").unwrap();
    h.orch.sec_group_set_updated(&ep.security_groups);
    h.orch.wait_idle().await;

    let sec_in = h.programmer.flows(group, table::SEC_GROUP_IN);
    assert_eq!(sec_in.len(), 3);

    let fwd = sec_in
        .iter()
        .find(|f| {
            has_ct_state(
                f,
                ct_state::TRACKED | ct_state::NEW,
                ct_state::TRACKED | ct_state::NEW,
            )
        })
        .expect("FWD entry");
    assert!(fwd.has_action(|a| matches!(
        a,
        FlowAction::Conntrack {
            flags: f,
            zone: Reg::R6,
            recirc_table: None
        } if *f == ct_flags::COMMIT
    )));
    assert_eq!(fwd.goto_table(), Some(table::TAP));

    let fwd_track = sec_in
        .iter()
        .find(|f| has_ct_state(f, 0, ct_state::TRACKED))
        .expect("FWD_TRACK entry");
    assert!(fwd_track.has_action(|a| matches!(
        a,
        FlowAction::Conntrack {
            flags: 0,
            zone: Reg::R6,
            recirc_table: Some(t)
        } if *t == table::SEC_GROUP_IN
    )));

    let fwd_est = sec_in
        .iter()
        .find(|f| {
            has_ct_state(
                f,
                ct_state::TRACKED | ct_state::ESTABLISHED,
                ct_state::TRACKED | ct_state::ESTABLISHED,
            )
        })
        .expect("FWD_EST entry");
    assert_eq!(fwd_est.goto_table(), Some(table::TAP));

    // All forward entries match the destination port.
    for entry in [fwd, fwd_track, fwd_est] {
        assert!(
            entry.matches.contains(&MatchField::TpDst {
                value: 80,
                mask: 0xffff
            }),
            "missing tpDst=80 in {:?}",
            entry
        );
    }

    let sec_out = h.programmer.flows(group, table::SEC_GROUP_OUT);
    assert_eq!(sec_out.len(), 3);

    let rev_track = sec_out
        .iter()
        .find(|f| has_ct_state(f, 0, ct_state::TRACKED))
        .expect("REV_TRACK entry");
    assert_eq!(rev_track.cookie, 0);
    assert!(rev_track.has_action(|a| matches!(
        a,
        FlowAction::Conntrack {
            flags: 0,
            zone: Reg::R6,
            recirc_table: Some(t)
        } if *t == table::GROUP_MAP
    )));

    let rev_allow = sec_out
        .iter()
        .find(|f| {
            has_ct_state(
                f,
                ct_state::TRACKED | ct_state::ESTABLISHED | ct_state::REPLY,
                ct_state::TRACKED
                    | ct_state::ESTABLISHED
                    | ct_state::REPLY
                    | ct_state::INVALID
                    | ct_state::NEW
                    | ct_state::RELATED,
            )
        })
        .expect("REV_ALLOW entry");
    assert_eq!(rev_allow.goto_table(), Some(table::TAP));

    let rev_related = sec_out
        .iter()
        .find(|f| {
            has_ct_state(
                f,
                ct_state::TRACKED | ct_state::RELATED | ct_state::REPLY,
                ct_state::TRACKED
                    | ct_state::RELATED
                    | ct_state::REPLY
                    | ct_state::ESTABLISHED
                    | ct_state::INVALID
                    | ct_state::NEW,
            )
        })
        .expect("REV_RELATED entry");
    assert!(rev_related.matches.contains(&MatchField::EthType(eth::IP)));
    // Related entries match the frame type only, never L4.
    assert!(!rev_related
        .matches
        .iter()
        .any(|m| matches!(m, MatchField::Proto(_) | MatchField::TpDst { .. })));

    // Same cookie everywhere except the REV_TRACK sentinel.
    assert_eq!(fwd.cookie, fwd_track.cookie);
    assert_eq!(fwd.cookie, fwd_est.cookie);
    assert_eq!(fwd.cookie, rev_allow.cookie);
    assert_eq!(fwd.cookie, rev_related.cookie);
    assert_ne!(fwd.cookie, 0);
}

// ============ S4: port range expansion ============

#[test]
fn s4_port_range_cover_is_exact() {
    let masks = range::range_masks(1000, 1100);
    for port in 0..=u16::MAX {
        let covered = masks.iter().any(|m| m.covers(port));
        assert_eq!(covered, (1000..=1100).contains(&port), "port {}", port);
    }
}

// ============ S5: unfiltered drop-log config ============

#[tokio::test]
async fn s5_drop_log_unfiltered() {
    let h = harness(AccessOrchConfig::default());
    let uri = "/observer/droplog";
    h.policy.put_drop_log_config(
        uri,
        DropLogConfig {
            enabled: true,
            mode: DropLogMode::Unfiltered,
        },
    );

    h.orch.packet_drop_log_config_updated(uri);
    h.orch.wait_idle().await;

    let flows = h.programmer.flows("DropLogConfig", table::DROP_LOG);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].priority, 2);
    assert!(writes_metadata(&flows[0], meta::DROP_LOG, meta::DROP_LOG));
    assert_eq!(flows[0].goto_table(), Some(table::SERVICE_BYPASS));

    // Filtered mode clears the unconditional override.
    h.policy.put_drop_log_config(
        uri,
        DropLogConfig {
            enabled: true,
            mode: DropLogMode::Filtered,
        },
    );
    h.orch.packet_drop_log_config_updated(uri);
    h.orch.wait_idle().await;
    assert!(h.programmer.flows("DropLogConfig", table::DROP_LOG).is_empty());
}

// ============ S6: endpoint deletion ============

#[tokio::test]
async fn s6_endpoint_deletion_releases_everything() {
    let h = harness(AccessOrchConfig {
        conntrack_enabled: true,
        ..Default::default()
    });
    wire_basic_ports(&h);
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_ip("10.0.0.8/32".parse().unwrap())
            .with_service_ip("10.96.0.1".parse().unwrap()),
    );

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;
    assert!(!h.programmer.flows("ep-1", table::GROUP_MAP).is_empty());
    assert!(!h.programmer.flows("ep-1", table::SERVICE_BYPASS).is_empty());
    assert!(h.ct_zones.lookup("ep-1").is_some());

    h.endpoints.remove("ep-1");
    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    for t in 0..table::NUM_TABLES {
        assert!(
            h.programmer.flows("ep-1", t).is_empty(),
            "stale flows in table {}",
            t
        );
    }
    assert!(h.ct_zones.lookup("ep-1").is_none());
}

// ============ Universal invariants ============

#[tokio::test]
async fn replay_is_idempotent() {
    let h = harness(AccessOrchConfig {
        conntrack_enabled: true,
        add_l34_flows_without_subnet: true,
        ..Default::default()
    });
    wire_basic_ports(&h);

    let group = "/sg/app";
    h.policy.put_group(
        group,
        vec![
            PolicyRule::allow("/rule/https", Direction::Bidirectional, 200)
                .with_classifier(L4Classifier {
                    eth_type: Some(eth::IP),
                    proto: Some(ip_proto::TCP),
                    dport: Some((443, 443)),
                    ..Default::default()
                })
                .with_remote_subnet("10.0.0.0/8".parse().unwrap()),
            PolicyRule::deny("/rule/telnet", Direction::In, 10).with_classifier(L4Classifier {
                eth_type: Some(eth::IP),
                proto: Some(ip_proto::TCP),
                dport: Some((23, 23)),
                ..Default::default()
            }),
        ],
    );
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_access_vlan(VlanId::new(4).unwrap())
            .with_security_group(group),
    );

    let drive = |h: &Harness| {
        let ep = h.endpoints.endpoint("ep-1").unwrap();
        h.orch.endpoint_updated("ep-1");
        h.orch.sec_group_set_updated(&ep.security_groups);
    };

    drive(&h);
    h.orch.wait_idle().await;
    let first: Vec<Vec<FlowEntry>> = (0..table::NUM_TABLES)
        .flat_map(|t| {
            let prog = &h.programmer;
            prog.owners_in_table(t)
                .into_iter()
                .map(move |owner| prog.flows(&owner, t))
        })
        .collect();

    drive(&h);
    drive(&h);
    h.orch.wait_idle().await;
    let second: Vec<Vec<FlowEntry>> = (0..table::NUM_TABLES)
        .flat_map(|t| {
            let prog = &h.programmer;
            prog.owners_in_table(t)
                .into_iter()
                .map(move |owner| prog.flows(&owner, t))
        })
        .collect();

    assert_eq!(first, second);
}

#[tokio::test]
async fn reserved_empty_set_survives_churn() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    let empty_id = empty_set_id(&h);

    for round in 0..3 {
        let uuid = format!("ep-{}", round);
        h.endpoints.put(basic_endpoint(&uuid));
        h.orch.endpoint_updated(&uuid);
        h.orch.wait_idle().await;
        h.endpoints.remove(&uuid);
        h.orch.endpoint_updated(&uuid);
        h.orch.wait_idle().await;
    }
    h.orch.cleanup();

    assert_eq!(h.ids.lookup("secGroupSet", ""), Some(empty_id));
    for t in [table::SEC_GROUP_IN, table::SEC_GROUP_OUT] {
        let flows = h.programmer.flows("static", t);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].priority, MAX_POLICY_RULE_PRIORITY);
        assert!(flows[0]
            .matches
            .contains(&MatchField::Reg(Reg::R0, empty_id)));
    }
}

#[tokio::test]
async fn bidirectional_rule_mirrors_directions() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);

    let group = "/sg/mirror";
    h.policy.put_group(
        group,
        vec![PolicyRule::allow("/rule/dns", Direction::Bidirectional, 50)
            .with_classifier(L4Classifier {
                eth_type: Some(eth::IP),
                proto: Some(ip_proto::UDP),
                dport: Some((53, 53)),
                ..Default::default()
            })
            .with_remote_subnet("192.0.2.0/24".parse().unwrap())],
    );
    h.endpoints
        .put(basic_endpoint("ep-1").with_security_group(group));

    let ep = h.endpoints.endpoint("ep-1").unwrap();
    h.orch.sec_group_set_updated(&ep.security_groups);
    h.orch.wait_idle().await;

    let sec_in = h.programmer.flows(group, table::SEC_GROUP_IN);
    let sec_out = h.programmer.flows(group, table::SEC_GROUP_OUT);
    assert_eq!(sec_in.len(), 1);
    assert_eq!(sec_out.len(), 1);

    // Ingress constrains the remote as source, egress as destination.
    let subnet = "192.0.2.0/24".parse().unwrap();
    assert!(sec_in[0].matches.contains(&MatchField::IpSrc(subnet)));
    assert!(sec_out[0].matches.contains(&MatchField::IpDst(subnet)));
    assert_eq!(sec_in[0].priority, sec_out[0].priority);
    assert_eq!(sec_in[0].cookie, sec_out[0].cookie);
    assert_eq!(sec_in[0].goto_table(), Some(table::TAP));
    assert_eq!(sec_out[0].goto_table(), Some(table::TAP));
}

#[tokio::test]
async fn metadata_writes_preserve_other_fields() {
    let h = harness(AccessOrchConfig {
        conntrack_enabled: true,
        add_l34_flows_without_subnet: true,
        ..Default::default()
    });
    wire_basic_ports(&h);

    let group = "/sg/any";
    h.policy.put_group(
        group,
        vec![
            PolicyRule::deny("/rule/block", Direction::Bidirectional, 5).with_classifier(
                L4Classifier {
                    eth_type: Some(eth::IP),
                    proto: Some(ip_proto::TCP),
                    ..Default::default()
                },
            ),
        ],
    );
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_access_vlan(VlanId::new(7).unwrap())
            .with_allow_untagged(true)
            .with_dhcp_v4(true)
            .with_security_group(group),
    );
    let ep = h.endpoints.endpoint("ep-1").unwrap();
    h.orch.endpoint_updated("ep-1");
    h.orch.sec_group_set_updated(&ep.security_groups);
    h.orch.wait_idle().await;

    for t in 0..table::NUM_TABLES {
        for owner in h.programmer.owners_in_table(t) {
            for flow in h.programmer.flows(&owner, t) {
                for action in &flow.actions {
                    if let FlowAction::Metadata { value, mask } = action {
                        assert_ne!(*mask, 0, "unmasked metadata write in {:?}", flow);
                        assert_eq!(
                            value & !mask,
                            0,
                            "metadata write outside field in {:?}",
                            flow
                        );
                    }
                }
            }
        }
    }
}

// ============ Endpoint bypass detail ============

#[tokio::test]
async fn service_bypass_pairs_by_family() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_ip("10.0.0.8/32".parse().unwrap())
            .with_ip("fd00::8/128".parse().unwrap())
            .with_service_ip("10.96.0.1".parse().unwrap()),
    );

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    // Only the v4 prefix pairs with the v4 service address.
    let flows = h.programmer.flows("ep-1", table::SERVICE_BYPASS);
    assert_eq!(flows.len(), 2);
    for flow in &flows {
        assert_eq!(flow.priority, 10);
        assert!(flow.matches.contains(&MatchField::EthType(eth::IP)));
        assert_eq!(flow.goto_table(), Some(table::TAP));
    }

    let ingress = flows
        .iter()
        .find(|f| f.matches.contains(&MatchField::InPort(6)))
        .unwrap();
    assert!(ingress
        .matches
        .contains(&MatchField::IpSrc("10.96.0.1/32".parse().unwrap())));
    assert!(ingress
        .matches
        .contains(&MatchField::IpDst("10.0.0.8/32".parse().unwrap())));
}

#[tokio::test]
async fn dhcp_bypass_tagged_and_untagged() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_access_vlan(VlanId::new(100).unwrap())
            .with_allow_untagged(true)
            .with_dhcp_v4(true),
    );

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    let flows = h.programmer.flows("ep-1", table::GROUP_MAP);
    let dhcp: Vec<_> = flows
        .iter()
        .filter(|f| {
            f.matches.contains(&MatchField::TpDst {
                value: 67,
                mask: 0xffff,
            })
        })
        .collect();
    assert_eq!(dhcp.len(), 2);

    let tagged = dhcp.iter().find(|f| f.priority == 201).expect("tagged");
    assert!(tagged.matches.contains(&MatchField::Vlan(100)));

    let untagged = dhcp.iter().find(|f| f.priority == 200).expect("untagged");
    assert!(untagged.matches.contains(&MatchField::Tci {
        value: 0,
        mask: 0x1fff
    }));

    for flow in dhcp {
        assert!(loads_reg(flow, Reg::R7, 6));
        assert_eq!(flow.goto_table(), Some(table::TAP));
    }
}

#[tokio::test]
async fn floating_ip_bypass_skips_bad_mappings() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    h.endpoints.put(
        basic_endpoint("ep-1")
            .with_ip_mapping(accessd::policy::IpMapping {
                mapped: "10.0.0.8".parse().unwrap(),
                floating: Some("198.51.100.7".parse().unwrap()),
            })
            // Family mismatch: skipped entirely.
            .with_ip_mapping(accessd::policy::IpMapping {
                mapped: "10.0.0.9".parse().unwrap(),
                floating: Some("fd00::9".parse().unwrap()),
            })
            // No floating address: skipped.
            .with_ip_mapping(accessd::policy::IpMapping {
                mapped: "10.0.0.10".parse().unwrap(),
                floating: None,
            }),
    );

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    let flows = h.programmer.flows("ep-1", table::GROUP_MAP);
    let floating: Vec<_> = flows
        .iter()
        .filter(|f| {
            f.matches.iter().any(|m| {
                matches!(m, MatchField::IpSrc(p) | MatchField::IpDst(p)
                         if p.addr() == "198.51.100.7".parse::<std::net::IpAddr>().unwrap())
            })
        })
        .collect();
    // One egress and one ingress bypass for the single valid mapping.
    assert_eq!(floating.len(), 2);
    for flow in floating {
        assert_eq!(flow.priority, 200);
        assert_eq!(flow.goto_table(), Some(table::TAP));
    }
}

#[tokio::test]
async fn unresolved_ports_remove_flows() {
    let h = harness(AccessOrchConfig::default());
    // Only the access port resolves.
    h.ports.set("veth0", 5);
    h.endpoints.put(basic_endpoint("ep-1"));

    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;
    assert!(h.programmer.flows("ep-1", table::GROUP_MAP).is_empty());

    // Once the uplink appears, a port-status update re-drives programming.
    h.ports.set("veth0-up", 6);
    h.orch.port_status_update("veth0-up", 6);
    h.orch.wait_idle().await;
    assert_eq!(h.programmer.flows("ep-1", table::GROUP_MAP).len(), 2);
}

// ============ System security groups ============

#[tokio::test]
async fn system_group_rules_and_catchers() {
    let h = harness(AccessOrchConfig {
        add_l34_flows_without_subnet: true,
        ..Default::default()
    });
    wire_basic_ports(&h);

    let sys_group = "/sg/_SystemSecurityGroup/infra";
    h.policy.put_group(
        sys_group,
        vec![PolicyRule::allow("/rule/ssh", Direction::In, 300).with_classifier(
            L4Classifier {
                eth_type: Some(eth::IP),
                proto: Some(ip_proto::TCP),
                dport: Some((22, 22)),
                ..Default::default()
            },
        )],
    );
    h.endpoints
        .put(basic_endpoint("ep-1").with_security_group(sys_group));

    let ep = h.endpoints.endpoint("ep-1").unwrap();
    h.orch.sec_group_set_updated(&ep.security_groups);
    h.orch.wait_idle().await;

    // System rules land in the SYS tables and chain to the user tables.
    let sys_in = h.programmer.flows(sys_group, table::SYS_SEC_GRP_IN);
    assert_eq!(sys_in.len(), 1);
    assert_eq!(sys_in[0].goto_table(), Some(table::SEC_GROUP_IN));
    // The group register match is zeroed out for system rules.
    assert!(!sys_in[0]
        .matches
        .iter()
        .any(|m| matches!(m, MatchField::Reg(Reg::R0, _))));
    assert!(h.programmer.flows(sys_group, table::SEC_GROUP_IN).is_empty());

    // Explicit drop catchers at priority 2 guard both SYS tables.
    for t in [table::SYS_SEC_GRP_IN, table::SYS_SEC_GRP_OUT] {
        let catchers = h.programmer.flows("SystemDropLogFlow", t);
        assert_eq!(catchers.len(), 1);
        assert_eq!(catchers[0].priority, 2);
        assert_eq!(catchers[0].goto_table(), Some(table::EXP_DROP));
    }

    // Replacing the group with a user group clears the SYS state.
    h.policy.remove_group(sys_group);
    h.endpoints.put(basic_endpoint("ep-1").with_security_group("/sg/user"));
    h.policy.put_group("/sg/user", vec![]);
    let ep = h.endpoints.endpoint("ep-1").unwrap();
    h.orch.sec_group_set_updated(&ep.security_groups);
    h.orch.wait_idle().await;
    for t in [table::SYS_SEC_GRP_IN, table::SYS_SEC_GRP_OUT] {
        assert!(h.programmer.flows("SystemDropLogFlow", t).is_empty());
    }
}

// ============ Group fan-out and garbage collection ============

#[tokio::test]
async fn group_update_fans_out_to_sets() {
    let h = harness(AccessOrchConfig {
        add_l34_flows_without_subnet: true,
        ..Default::default()
    });
    wire_basic_ports(&h);

    let group = "/sg/web";
    h.policy.put_group(
        group,
        vec![PolicyRule::allow("/rule/http", Direction::In, 100).with_classifier(
            L4Classifier {
                eth_type: Some(eth::IP),
                proto: Some(ip_proto::TCP),
                dport: Some((80, 80)),
                ..Default::default()
            },
        )],
    );
    h.endpoints
        .put(basic_endpoint("ep-1").with_security_group(group));

    // The group-level event discovers the affected set itself.
    h.orch.sec_group_updated(group);
    h.orch.wait_idle().await;

    assert_eq!(h.programmer.flows(group, table::SEC_GROUP_IN).len(), 1);
}

#[tokio::test]
async fn orphaned_set_is_cleared_and_collected() {
    let h = harness(AccessOrchConfig {
        add_l34_flows_without_subnet: true,
        ..Default::default()
    });
    wire_basic_ports(&h);

    let group = "/sg/tmp";
    h.policy.put_group(
        group,
        vec![PolicyRule::allow("/rule/x", Direction::In, 1).with_classifier(L4Classifier {
            eth_type: Some(eth::IP),
            proto: Some(ip_proto::TCP),
            ..Default::default()
        })],
    );
    h.endpoints
        .put(basic_endpoint("ep-1").with_security_group(group));
    let ep = h.endpoints.endpoint("ep-1").unwrap();
    let groups = ep.security_groups.clone();
    h.orch.sec_group_set_updated(&groups);
    h.orch.wait_idle().await;
    assert!(!h.programmer.flows(group, table::SEC_GROUP_IN).is_empty());
    assert!(h.ids.lookup("secGroupSet", group).is_some());

    // Last endpoint leaves the set.
    h.endpoints.remove("ep-1");
    h.orch.sec_group_set_updated(&groups);
    h.orch.wait_idle().await;
    for t in [
        table::SEC_GROUP_IN,
        table::SEC_GROUP_OUT,
        table::SYS_SEC_GRP_IN,
        table::SYS_SEC_GRP_OUT,
    ] {
        assert!(h.programmer.flows(group, t).is_empty());
    }

    h.policy.remove_group(group);
    h.orch.cleanup();
    assert!(h.ids.lookup("secGroupSet", group).is_none());
    assert!(h.ids.lookup("secGroup", group).is_none());
}

// ============ Drop-log destination ============

#[tokio::test]
async fn drop_log_destination_programs_exp_drop() {
    let h = harness(AccessOrchConfig::default());

    h.orch.set_drop_log("geneve0", "192.0.2.10", 6081).unwrap();
    // Port not discovered yet: nothing to program.
    assert!(h.programmer.flows("static", table::EXP_DROP).is_empty());

    h.ports.set("geneve0", 17);
    h.orch.port_status_update("geneve0", 17);
    h.orch.wait_idle().await;

    let flows = h.programmer.flows("static", table::EXP_DROP);
    assert_eq!(flows.len(), 1);
    assert!(flows[0].matches.contains(&MatchField::Metadata {
        value: meta::DROP_LOG,
        mask: meta::DROP_LOG
    }));
    let dst = u32::from("192.0.2.10".parse::<std::net::Ipv4Addr>().unwrap());
    assert!(loads_reg(&flows[0], Reg::TunnelDst, u64::from(dst)));
    assert!(flows[0].has_action(|a| matches!(a, FlowAction::Output(17))));
}

// ============ DSCP QoS ============

#[tokio::test]
async fn dscp_flows_installed_and_cleared() {
    let h = harness(AccessOrchConfig::default());
    h.ports.set("eth2", 9);

    h.orch.dscp_qos_updated("eth2", 46);
    h.orch.wait_idle().await;

    for owner in ["eth2ipv4", "eth2ipv6"] {
        let flows = h.programmer.flows(owner, table::DROP_LOG);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].priority, 65535);
        assert!(flows[0].matches.contains(&MatchField::InPort(9)));
        assert!(flows[0].has_action(|a| matches!(a, FlowAction::SetDscp(46))));
        assert!(flows[0].has_action(|a| matches!(
            a,
            FlowAction::Resubmit { in_port: 9, table: t } if *t == table::SERVICE_BYPASS
        )));
    }

    h.orch.dscp_qos_updated("eth2", 0);
    h.orch.wait_idle().await;
    assert!(h.programmer.flows("eth2ipv4", table::DROP_LOG).is_empty());
    assert!(h.programmer.flows("eth2ipv6", table::DROP_LOG).is_empty());
}

// ============ Shutdown behavior ============

#[tokio::test]
async fn events_after_stop_are_dropped() {
    let h = harness(AccessOrchConfig::default());
    wire_basic_ports(&h);
    h.endpoints.put(basic_endpoint("ep-1"));

    h.orch.stop();
    h.orch.endpoint_updated("ep-1");
    h.orch.wait_idle().await;

    assert!(h.programmer.flows("ep-1", table::GROUP_MAP).is_empty());
    assert!(h.orch.stats().dropped_events > 0);
}
