//! Allocation Scenario Integration Tests
//!
//! Drives the full cycle (discover, collect, plan, resolve, apply, persist)
//! against an in-process bus of simulated nodes.
//!
//! **Pattern: Direct API Testing**
//! Uses `Allocator` over `MemoryBus` instead of a live CAN bus for:
//! - Deterministic node behaviour (offline, silent on writes, read-only)
//! - Direct register inspection after every cycle
//!
//! Uses tempfile for isolation of the allocation store

use pnp_core::register::{NodeCommand, PNP_COOKIE_REGISTER};
use pnp_core::{
    AddressSpace, Allocator, AllocationStore, AllocatorConfig, ApplyOutcome, GroupKey, MemoryBus,
    NodeId, NodeIdRange, PnpError, PortRole, SimNode, SpaceBounds, Value,
};
use std::sync::Arc;
use tempfile::TempDir;

const PLANAR: &str = "reg.udral.physics.dynamics.rotation.Planar.0.1";
const STATUS: &str = "reg.udral.service.common.Heartbeat.0.1";
const ACCESS: &str = "uavcan.register.Access.1.0";

/// Helper: fast timeouts, small scan range, store inside `temp`
fn test_config(temp: &TempDir) -> AllocatorConfig {
    AllocatorConfig {
        local_node_id: 0,
        node_id_range: NodeIdRange { start: 0, end: 15 },
        request_timeout_ms: 50,
        retries: 0,
        store_path: temp.path().join("pnp-allocations.json"),
        ..AllocatorConfig::default()
    }
}

fn start(config: AllocatorConfig, bus: Arc<MemoryBus>) -> Allocator {
    let store = AllocationStore::open(&config.store_path).unwrap();
    Allocator::new(config, bus, store).unwrap()
}

fn id_of(bus: &MemoryBus, node: u16, register: &str) -> Option<u64> {
    bus.register(NodeId(node), register)
        .and_then(|v| v.as_integer())
        .map(|v| v as u64)
}

/// Scenario A: two fresh nodes declare the same subscriber port
#[tokio::test]
async fn test_fresh_nodes_share_new_id() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    for node in [3, 4] {
        bus.insert_node(
            NodeId(node),
            SimNode::new()
                .with_cookie("")
                .with_port(PortRole::Subscriber, "setpoint", PLANAR, None),
        );
    }
    let mut allocator = start(test_config(&temp), bus.clone());

    let report = allocator.run_cycle().await.unwrap();

    let a = id_of(&bus, 3, "uavcan.sub.setpoint.id").unwrap();
    let b = id_of(&bus, 4, "uavcan.sub.setpoint.id").unwrap();
    assert_eq!(a, b, "Both subscribers must land on one channel");
    assert_ne!(a, u64::from(u16::MAX), "Sentinel must be replaced");

    assert_eq!(report.newly_assigned, 1);
    assert_eq!(report.committed, 2);
    assert!(report.unreachable.is_empty());

    // Nodes are stamped and restarted
    for node in [3, 4] {
        assert_eq!(
            bus.register(NodeId(node), PNP_COOKIE_REGISTER),
            Some(Value::string(allocator.expected_cookie()))
        );
        assert_eq!(
            bus.commands(NodeId(node)),
            vec![NodeCommand::StorePersistentStates, NodeCommand::Restart]
        );
    }

    let key = GroupKey::new(AddressSpace::Subject, "setpoint", PLANAR);
    let record = allocator.store().get(&key).unwrap();
    assert_eq!(u64::from(record.port_id), a);
    assert_eq!(record.owners.len(), 2);
}

/// Scenario B: a new node joins a channel that is already configured
#[tokio::test]
async fn test_joining_node_reuses_live_id() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(
        NodeId(1),
        SimNode::new()
            .with_cookie("reject")
            .with_port(PortRole::Publisher, "telemetry", STATUS, Some(100)),
    );
    bus.insert_node(
        NodeId(2),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Subscriber, "telemetry", STATUS, None),
    );
    let mut allocator = start(test_config(&temp), bus.clone());

    let report = allocator.run_cycle().await.unwrap();

    assert_eq!(id_of(&bus, 2, "uavcan.sub.telemetry.id"), Some(100));
    assert_eq!(report.reused, 1);
    assert_eq!(report.newly_assigned, 0);
    // The manually configured node is never written
    assert_eq!(bus.write_count(NodeId(1)), 0);

    // No fresh ID was consumed: the next new group still gets the lowest one
    bus.insert_node(
        NodeId(5),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Publisher, "odometry", PLANAR, None),
    );
    allocator.run_cycle().await.unwrap();
    assert_eq!(id_of(&bus, 5, "uavcan.pub.odometry.id"), Some(0));
}

/// Scenario C: a node goes silent during Applying
#[tokio::test]
async fn test_silent_node_is_deferred_then_retried() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(
        NodeId(6),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Publisher, "setpoint", PLANAR, None),
    );
    bus.insert_node(
        NodeId(7),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Subscriber, "setpoint", PLANAR, None)
            .dropping_writes(),
    );
    let mut allocator = start(test_config(&temp), bus.clone());

    let first = allocator.run_cycle().await.unwrap();
    assert_eq!(first.outcome(NodeId(6), "setpoint"), Some(&ApplyOutcome::Committed));
    assert_eq!(first.outcome(NodeId(7), "setpoint"), Some(&ApplyOutcome::Unreachable));
    assert!(first.unreachable.contains(&NodeId(7)));
    assert_eq!(id_of(&bus, 7, "uavcan.sub.setpoint.id"), Some(u64::from(u16::MAX)));

    let key = GroupKey::new(AddressSpace::Subject, "setpoint", PLANAR);
    let committed = allocator.store().get(&key).unwrap().clone();

    // Node recovers
    bus.set_dropping_writes(NodeId(7), false);
    let second = allocator.run_cycle().await.unwrap();

    assert_eq!(second.outcome(NodeId(7), "setpoint"), Some(&ApplyOutcome::Committed));
    assert_eq!(second.reused, 1);
    assert_eq!(second.newly_assigned, 0);
    assert_eq!(
        id_of(&bus, 7, "uavcan.sub.setpoint.id"),
        Some(u64::from(committed.port_id))
    );

    // Same decision, same version: no re-planning of the committed group
    let record = allocator.store().get(&key).unwrap();
    assert_eq!(record.port_id, committed.port_id);
    assert_eq!(record.version, committed.version);
}

/// Scenario D: the service space is full
#[tokio::test]
async fn test_exhausted_service_space_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(
        NodeId(1),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Server, "config", ACCESS, Some(0))
            .with_port(PortRole::Server, "calibrate", "reg.Calibrate.0.1", Some(1)),
    );
    bus.insert_node(
        NodeId(2),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Client, "telemetry_fetch", "reg.Fetch.0.1", None),
    );
    bus.insert_node(
        NodeId(3),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Publisher, "status", STATUS, None),
    );

    let config = AllocatorConfig {
        service_space: SpaceBounds {
            min: 0,
            max: 1,
            sentinel: u16::MAX,
        },
        ..test_config(&temp)
    };
    let mut allocator = start(config, bus.clone());

    let report = allocator.run_cycle().await.unwrap();

    assert!(report.exhausted.contains(&AddressSpace::Service));
    let errors = allocator.exhaustion_errors(&report);
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        PnpError::AddressSpaceExhausted {
            space: AddressSpace::Service,
            min: 0,
            max: 1
        }
    ));

    // Nothing at all went to the starved node
    assert_eq!(bus.write_count(NodeId(2)), 0);
    assert_eq!(
        id_of(&bus, 2, "uavcan.cln.telemetry_fetch.id"),
        Some(u64::from(u16::MAX))
    );

    // Subject space is unaffected, and existing service IDs stay put
    assert_eq!(id_of(&bus, 3, "uavcan.pub.status.id"), Some(0));
    assert_eq!(id_of(&bus, 1, "uavcan.srv.config.id"), Some(0));
    assert_eq!(id_of(&bus, 1, "uavcan.srv.calibrate.id"), Some(1));
}

#[tokio::test]
async fn test_offline_node_does_not_block_cycle() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(
        NodeId(8),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Subscriber, "setpoint", PLANAR, None)
            .offline(),
    );
    bus.insert_node(
        NodeId(9),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Subscriber, "setpoint", PLANAR, None),
    );
    let mut allocator = start(test_config(&temp), bus.clone());

    let report = allocator.run_cycle().await.unwrap();
    assert_eq!(report.peers, 1);
    assert_eq!(id_of(&bus, 9, "uavcan.sub.setpoint.id"), Some(0));

    // Comes back: joins the committed channel
    bus.set_offline(NodeId(8), false);
    let report = allocator.run_cycle().await.unwrap();
    assert_eq!(report.peers, 2);
    assert_eq!(id_of(&bus, 8, "uavcan.sub.setpoint.id"), Some(0));
}

#[tokio::test]
async fn test_pub_sub_and_services_in_separate_spaces() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(
        NodeId(10),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Publisher, "servo.feedback", PLANAR, None)
            .with_port(PortRole::Server, "servo.config", ACCESS, None),
    );
    bus.insert_node(
        NodeId(11),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Subscriber, "servo.feedback", PLANAR, None)
            .with_port(PortRole::Client, "servo.config", ACCESS, None),
    );
    let mut allocator = start(test_config(&temp), bus.clone());

    allocator.run_cycle().await.unwrap();

    assert_eq!(id_of(&bus, 10, "uavcan.pub.servo.feedback.id"), Some(0));
    assert_eq!(id_of(&bus, 11, "uavcan.sub.servo.feedback.id"), Some(0));
    assert_eq!(id_of(&bus, 10, "uavcan.srv.servo.config.id"), Some(0));
    assert_eq!(id_of(&bus, 11, "uavcan.cln.servo.config.id"), Some(0));
}

#[tokio::test]
async fn test_distinct_types_get_distinct_ids() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(
        NodeId(1),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Publisher, "setpoint", PLANAR, None),
    );
    bus.insert_node(
        NodeId(2),
        SimNode::new()
            .with_cookie("")
            .with_port(PortRole::Subscriber, "setpoint", "reg.udral.physics.kinematics.rotation.Planar.0.1", None),
    );
    let mut allocator = start(test_config(&temp), bus.clone());

    allocator.run_cycle().await.unwrap();

    assert_ne!(
        id_of(&bus, 1, "uavcan.pub.setpoint.id"),
        id_of(&bus, 2, "uavcan.sub.setpoint.id")
    );
}
