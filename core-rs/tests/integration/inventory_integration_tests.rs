//! Peer Inventory Integration Tests
//!
//! Loads a network description from YAML (the same format `pnp simulate`
//! consumes) and checks what discovery and collection make of it.
//!
//! Uses tempfile for isolation - NO /tmp pollution

use pnp_core::register::PNP_COOKIE_REGISTER;
use pnp_core::{
    AddressSpace, Allocator, AllocationStore, AllocatorConfig, CookieState, MemoryBus, NodeId,
    NodeIdRange, PeerInventory, PortRole, Value,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const NETWORK: &str = r#"
nodes:
  - id: 10
    registers:
      udral.pnp.cookie: ""
      uavcan.sub.servo.setpoint.id: 65535
      uavcan.sub.servo.setpoint.type: reg.udral.physics.dynamics.rotation.Planar.0.1
      uavcan.pub.servo.feedback.id: 65535
      uavcan.pub.servo.feedback.type: reg.udral.service.actuator.common.Feedback.0.1
      uavcan.node.description: "esc"
  - id: 11
    readOnly: [uavcan.pub.gnss.id]
    registers:
      udral.pnp.cookie: reject
      uavcan.pub.gnss.id: 42
      uavcan.pub.gnss.type: reg.udral.physics.kinematics.geodetic.Point.0.1
      uavcan.pub.broken.id: "not a number"
      uavcan.pub.broken.type: reg.Broken.0.1
  - id: 12
    registers:
      uavcan.sub.gnss.id: 65535
      uavcan.sub.gnss.type: reg.udral.physics.kinematics.geodetic.Point.0.1
  - id: 13
    offline: true
    registers:
      udral.pnp.cookie: ""
"#;

fn write_network(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("network.yaml");
    fs::write(&path, NETWORK).unwrap();
    path
}

fn test_config(temp: &TempDir) -> AllocatorConfig {
    AllocatorConfig {
        local_node_id: 0,
        node_id_range: NodeIdRange { start: 0, end: 20 },
        request_timeout_ms: 50,
        retries: 1,
        fan_out: 3,
        store_path: temp.path().join("store.json"),
        ..AllocatorConfig::default()
    }
}

#[tokio::test]
async fn test_discover_and_collect_network_file() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::load(write_network(temp.path())).unwrap());
    let inventory = PeerInventory::from_bus(bus, &test_config(&temp), "autoconfigured 00");

    let nodes = inventory.discover().await;
    assert_eq!(nodes, BTreeSet::from([NodeId(10), NodeId(11), NodeId(12)]));

    let snapshot = inventory.snapshot(&nodes).await;
    assert!(snapshot.unreachable.is_empty());
    assert_eq!(snapshot.cookie(NodeId(10)), Some(&CookieState::Pending(String::new())));
    assert_eq!(snapshot.cookie(NodeId(11)), Some(&CookieState::Manual));
    assert_eq!(snapshot.cookie(NodeId(12)), Some(&CookieState::NotCapable));

    let esc = &snapshot.peers[&NodeId(10)];
    let ports: Vec<(PortRole, &str)> = esc
        .requirements
        .iter()
        .map(|r| (r.role, r.name.as_str()))
        .collect();
    assert_eq!(
        ports,
        vec![
            (PortRole::Publisher, "servo.feedback"),
            (PortRole::Subscriber, "servo.setpoint"),
        ]
    );

    // "not a number" is reported, the rest of node 11 still counts
    assert_eq!(snapshot.malformed_count(), 1);
    assert_eq!(snapshot.peers[&NodeId(11)].requirements.len(), 1);
    assert!(snapshot
        .observed_busy()
        .contains(&(AddressSpace::Subject, 42)));
}

#[tokio::test]
async fn test_only_pnp_nodes_are_written() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::load(write_network(temp.path())).unwrap());
    let config = test_config(&temp);
    let store = AllocationStore::open(&config.store_path).unwrap();
    let mut allocator = Allocator::new(config, bus.clone(), store).unwrap();

    let report = allocator.run_cycle().await.unwrap();
    assert_eq!(report.peers, 3);
    assert_eq!(report.malformed, 1);

    // Node 12 has no cookie register: observed, never written
    assert_eq!(bus.write_count(NodeId(12)), 0);
    assert_eq!(
        bus.register(NodeId(12), "uavcan.sub.gnss.id"),
        Some(Value::natural16(u16::MAX))
    );
    // Manual node keeps its hand-set ID
    assert_eq!(
        bus.register(NodeId(11), "uavcan.pub.gnss.id"),
        Some(Value::natural16(42))
    );
    assert_eq!(bus.write_count(NodeId(11)), 0);

    // PnP node got both ports, avoiding the busy ID 42, and the cookie
    assert_eq!(
        bus.register(NodeId(10), "uavcan.pub.servo.feedback.id"),
        Some(Value::natural16(0))
    );
    assert_eq!(
        bus.register(NodeId(10), "uavcan.sub.servo.setpoint.id"),
        Some(Value::natural16(1))
    );
    assert_eq!(
        bus.register(NodeId(10), PNP_COOKIE_REGISTER),
        Some(Value::string(allocator.expected_cookie()))
    );
}

#[tokio::test]
async fn test_node_dropping_out_mid_collection() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::load(write_network(temp.path())).unwrap());
    let inventory = PeerInventory::from_bus(bus.clone(), &test_config(&temp), "autoconfigured 00");

    let nodes = inventory.discover().await;
    // Gone between discovery and collection
    bus.set_offline(NodeId(10), true);

    let snapshot = inventory.snapshot(&nodes).await;
    assert_eq!(snapshot.unreachable, BTreeSet::from([NodeId(10)]));
    assert_eq!(snapshot.peers.len(), 2);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::load(write_network(temp.path())).unwrap());
    let inventory = PeerInventory::from_bus(bus.clone(), &test_config(&temp), "autoconfigured 00");

    // One lost request is absorbed by the single retry
    bus.fail_next(NodeId(12), 1);
    let report = inventory.fetch_requirements(NodeId(12)).await.unwrap();
    assert_eq!(report.requirements.len(), 1);
}
