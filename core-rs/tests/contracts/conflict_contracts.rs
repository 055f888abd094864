// Conflict Resolution Contract Tests
//
// These tests verify INVARIANTS that MUST NEVER BREAK regardless of implementation.
// Each one documents WHY the behaviour exists and what a change would break.
//
// **Problem**: Collisions look rare in a lab and get "handled" by overwriting
// whichever node was read last
// **Solution**: Contract tests that pin down who keeps a contested ID and who moves

use chrono::Utc;
use pnp_core::{
    AddressSpace, AllocationRecord, Allocator, AllocationStore, AllocatorConfig, CollisionPolicy,
    ConflictKind, ConflictResolver, GroupKey, MemoryBus, NodeId, NodeIdRange, Plan, PortId,
    PortRequirement, PortRole, RecordStatus, SimNode, Value,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

const PLANAR: &str = "reg.udral.physics.dynamics.rotation.Planar.0.1";

fn config(temp: &TempDir) -> AllocatorConfig {
    AllocatorConfig {
        local_node_id: 0,
        node_id_range: NodeIdRange { start: 0, end: 10 },
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

fn node(cookie: &str, role: PortRole, name: &str, id: Option<u16>) -> SimNode {
    SimNode::new().with_cookie(cookie).with_port(role, name, PLANAR, id)
}

fn requirement(node: u16, name: &str, current: Option<PortId>, writable: bool) -> PortRequirement {
    PortRequirement {
        node: NodeId(node),
        role: PortRole::Publisher,
        name: name.to_string(),
        data_type: PLANAR.to_string(),
        current,
        writable,
    }
}

fn record(name: &str, port_id: PortId, version: u64) -> AllocationRecord {
    AllocationRecord {
        space: AddressSpace::Subject,
        name: name.to_string(),
        data_type: PLANAR.to_string(),
        port_id,
        version,
        committed_at: Utc::now(),
        last_seen: Utc::now(),
        owners: BTreeSet::new(),
        status: RecordStatus::Active,
        rejections: Vec::new(),
    }
}

/// WHY: Two writable groups found on one ID: exactly one moves
/// REASON: Hand-configured nodes carried over from another vehicle can clash
/// BREAKS: Cross-talk persists until an operator notices
/// SACRIFICES: If this fails, collisions on the bus are never repaired
#[tokio::test]
async fn shared_id_is_split_onto_free_id() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(NodeId(1), node("", PortRole::Publisher, "a", Some(5)));
    bus.insert_node(NodeId(2), node("", PortRole::Publisher, "b", Some(5)));
    bus.insert_node(NodeId(3), node("", PortRole::Publisher, "c", Some(0)));
    let mut allocator = start(config(&temp), bus.clone());

    let report = allocator.run_cycle().await.unwrap();

    assert_eq!(report.conflicts, 1);
    // Lowest node keeps the ID when nothing was committed yet
    assert_eq!(bus.register(NodeId(1), "uavcan.pub.a.id"), Some(Value::natural16(5)));
    // The loser lands on the lowest ID nobody on the bus uses
    assert_eq!(bus.register(NodeId(2), "uavcan.pub.b.id"), Some(Value::natural16(1)));
    assert_eq!(bus.register(NodeId(3), "uavcan.pub.c.id"), Some(Value::natural16(0)));
    assert_eq!(bus.write_count(NodeId(1)), 0);
    assert_eq!(bus.write_count(NodeId(3)), 0);

    // Next cycle is clean
    let report = allocator.run_cycle().await.unwrap();
    assert_eq!(report.conflicts, 0);
}

/// WHY: A group the allocator may not write always keeps its ID
/// REASON: Nodes with cookie "reject" belong to the operator; moving the
///         writable side is the only repair that converges
/// BREAKS: Endless rewrite attempts against a node that refuses them
#[tokio::test]
async fn pinned_group_wins_over_writable_group() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    // Writable group has the lower node ID and still loses
    bus.insert_node(NodeId(1), node("", PortRole::Publisher, "b", Some(5)));
    bus.insert_node(NodeId(2), node("reject", PortRole::Publisher, "a", Some(5)));
    let mut allocator = start(config(&temp), bus.clone());

    allocator.run_cycle().await.unwrap();

    assert_eq!(bus.register(NodeId(2), "uavcan.pub.a.id"), Some(Value::natural16(5)));
    assert_eq!(bus.register(NodeId(1), "uavcan.pub.b.id"), Some(Value::natural16(0)));
    assert_eq!(bus.write_count(NodeId(2)), 0);
}

/// WHY: Two pinned groups on one ID are reported, never "fixed"
/// REASON: Neither side may be written; touching them violates the operator's choice
/// BREAKS: Manual configuration silently overwritten
#[test]
fn two_pinned_groups_are_irreconcilable() {
    tokio_test::block_on(async {
        let temp = TempDir::new().unwrap();
        let bus = Arc::new(MemoryBus::new());
        bus.insert_node(NodeId(1), node("reject", PortRole::Publisher, "a", Some(9)));
        bus.insert_node(NodeId(2), node("reject", PortRole::Publisher, "b", Some(9)));
        let mut allocator = start(config(&temp), bus.clone());

        let report = allocator.run_cycle().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.committed, 0);
        assert_eq!(bus.write_count(NodeId(1)), 0);
        assert_eq!(bus.write_count(NodeId(2)), 0);
    });

    let requirements = vec![
        requirement(1, "a", Some(9), false),
        requirement(2, "b", Some(9), false),
    ];
    let resolution = ConflictResolver::new(CollisionPolicy::OldestCommit).resolve(
        &requirements,
        &[],
        &Plan::default(),
    );
    assert_eq!(resolution.irreconcilable, vec![(AddressSpace::Subject, 9)]);
    assert!(resolution.evicted.is_empty());
}

/// WHY: Under oldest-commit, the earlier committed group keeps the ID
/// REASON: Its members were configured first and may already be deployed
/// BREAKS: A newcomer evicts an established channel
/// SACRIFICES: If this fails, node numbering decides instead of history
#[test]
fn oldest_commit_beats_lower_node() {
    let requirements = vec![
        requirement(9, "established", Some(7), true),
        requirement(1, "newcomer", Some(7), true),
    ];
    let committed = vec![record("established", 7, 3)];

    let resolution = ConflictResolver::new(CollisionPolicy::OldestCommit).resolve(
        &requirements,
        &committed,
        &Plan::default(),
    );
    assert_eq!(resolution.conflicts.len(), 1);
    let conflict = &resolution.conflicts[0];
    assert_eq!(
        conflict.kept,
        Some(GroupKey::new(AddressSpace::Subject, "established", PLANAR))
    );
    assert_eq!(conflict.nodes, BTreeSet::from([NodeId(1)]));
    assert!(resolution.revoked.is_empty());

    // Same bus under lowest-node: the record holder moves and loses its record
    let resolution = ConflictResolver::new(CollisionPolicy::LowestNode).resolve(
        &requirements,
        &committed,
        &Plan::default(),
    );
    assert_eq!(
        resolution.conflicts[0].kept,
        Some(GroupKey::new(AddressSpace::Subject, "newcomer", PLANAR))
    );
    assert!(resolution
        .revoked
        .contains(&GroupKey::new(AddressSpace::Subject, "established", PLANAR)));
}

/// WHY: Members of one group that disagree are brought back together
/// REASON: A group is one channel; members on different IDs never hear each other
/// BREAKS: Publisher and subscriber both "configured", yet no data flows
#[tokio::test]
async fn divergent_members_are_realigned() {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.insert_node(NodeId(1), node("", PortRole::Publisher, "g", Some(3)));
    bus.insert_node(NodeId(2), node("", PortRole::Subscriber, "g", Some(8)));
    let mut allocator = start(config(&temp), bus.clone());

    let report = allocator.run_cycle().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(bus.register(NodeId(2), "uavcan.sub.g.id"), Some(Value::natural16(3)));
    assert_eq!(bus.write_count(NodeId(1)), 0);

    let requirements = vec![
        requirement(1, "g", Some(3), true),
        requirement(2, "g", Some(8), true),
    ];
    let resolution = ConflictResolver::new(CollisionPolicy::OldestCommit).resolve(
        &requirements,
        &[],
        &Plan::default(),
    );
    assert_eq!(resolution.conflicts[0].kind, ConflictKind::Divergent);
    assert_eq!(resolution.conflicts[0].port_id, 3);
}
