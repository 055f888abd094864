//! In-process bus of simulated nodes
//!
//! Backs the unit and integration tests and the `pnp simulate` command.
//! Each simulated node answers register access, register list and command
//! requests the way a real node does: writes to unknown registers answer
//! `Empty`, writes to read-only registers or with a different value type are
//! ignored and answer the unchanged value.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::bus::{CommandStatus, NodeCommand, RegisterBus, TransportError};
use super::Value;
use crate::errors::{PnpError, Result};
use crate::port::naming::{id_register, type_register};
use crate::port::{NodeId, PortRole};

/// Register namespace used by `SimNode::with_port`
pub const DEFAULT_PREFIX: &str = "uavcan";

/// One simulated node
#[derive(Debug, Clone, Default)]
pub struct SimNode {
    registers: Vec<(String, Value)>,
    read_only: BTreeSet<String>,
    offline: bool,
    drop_writes: bool,
    latency: Option<Duration>,
    fail_next: u32,
    commands: Vec<NodeCommand>,
    writes: u32,
}

impl SimNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_register(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Declare a port: `.id` register (sentinel when `id` is `None`) plus `.type`
    pub fn with_port(self, role: PortRole, name: &str, data_type: &str, id: Option<u16>) -> Self {
        self.with_register(
            &id_register(DEFAULT_PREFIX, role, name),
            Value::natural16(id.unwrap_or(u16::MAX)),
        )
        .with_register(
            &type_register(DEFAULT_PREFIX, role, name),
            Value::string(data_type),
        )
    }

    pub fn with_cookie(self, cookie: &str) -> Self {
        self.with_register(super::PNP_COOKIE_REGISTER, Value::string(cookie))
    }

    pub fn read_only(mut self, name: &str) -> Self {
        self.read_only.insert(name.to_string());
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Answer reads but never answer writes
    pub fn dropping_writes(mut self) -> Self {
        self.drop_writes = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.registers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn set(&mut self, name: &str, value: Value) {
        match self.registers.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.registers.push((name.to_string(), value)),
        }
    }

    fn apply_write(&mut self, name: &str, value: Value) -> Value {
        self.writes += 1;
        let read_only = self.read_only.contains(name);
        match self.registers.iter_mut().find(|(n, _)| n == name) {
            None => Value::Empty,
            Some((_, current)) if read_only || !current.same_kind(&value) => current.clone(),
            Some((_, current)) => {
                *current = value;
                current.clone()
            }
        }
    }
}

/// Simulated bus: a set of nodes addressed by node ID
#[derive(Debug, Default)]
pub struct MemoryBus {
    nodes: Mutex<BTreeMap<NodeId, SimNode>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<NodeId, SimNode>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_node(&self, id: NodeId, node: SimNode) {
        self.nodes().insert(id, node);
    }

    pub fn remove_node(&self, id: NodeId) -> Option<SimNode> {
        self.nodes().remove(&id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().keys().copied().collect()
    }

    pub fn set_offline(&self, id: NodeId, offline: bool) {
        if let Some(node) = self.nodes().get_mut(&id) {
            node.offline = offline;
        }
    }

    pub fn set_dropping_writes(&self, id: NodeId, drop_writes: bool) {
        if let Some(node) = self.nodes().get_mut(&id) {
            node.drop_writes = drop_writes;
        }
    }

    /// Make the next `count` requests to a node go unanswered
    pub fn fail_next(&self, id: NodeId, count: u32) {
        if let Some(node) = self.nodes().get_mut(&id) {
            node.fail_next = count;
        }
    }

    pub fn register(&self, id: NodeId, name: &str) -> Option<Value> {
        self.nodes().get(&id).and_then(|n| n.get(name).cloned())
    }

    pub fn set_register(&self, id: NodeId, name: &str, value: Value) {
        if let Some(node) = self.nodes().get_mut(&id) {
            node.set(name, value);
        }
    }

    pub fn commands(&self, id: NodeId) -> Vec<NodeCommand> {
        self.nodes()
            .get(&id)
            .map(|n| n.commands.clone())
            .unwrap_or_default()
    }

    /// Number of write requests a node has answered
    pub fn write_count(&self, id: NodeId) -> u32 {
        self.nodes().get(&id).map(|n| n.writes).unwrap_or(0)
    }

    /// Common pre-flight for every request; returns the node's latency
    fn admit(&self, id: NodeId, is_write: bool) -> std::result::Result<Option<Duration>, TransportError> {
        let mut nodes = self.nodes();
        let node = nodes.get_mut(&id).ok_or(TransportError::Timeout)?;
        if node.offline || (is_write && node.drop_writes) {
            return Err(TransportError::Timeout);
        }
        if node.fail_next > 0 {
            node.fail_next -= 1;
            return Err(TransportError::Timeout);
        }
        Ok(node.latency)
    }

    /// Build a bus from a network description
    pub fn from_network(network: NetworkFile) -> Self {
        let bus = MemoryBus::new();
        for entry in network.nodes {
            let mut node = SimNode::new();
            for (name, literal) in entry.registers {
                node.set(&name, literal.into_value());
            }
            for name in entry.read_only {
                node = node.read_only(&name);
            }
            node.offline = entry.offline;
            node.drop_writes = entry.drop_writes;
            bus.insert_node(NodeId(entry.id), node);
        }
        bus
    }

    /// Load a network description from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PnpError::Config(format!("Failed to read network file {}: {}", path.display(), e))
        })?;
        let network: NetworkFile = serde_yaml::from_str(&content)?;
        Ok(Self::from_network(network))
    }
}

#[async_trait]
impl RegisterBus for MemoryBus {
    async fn access(
        &self,
        node: NodeId,
        name: &str,
        value: Option<Value>,
    ) -> std::result::Result<Value, TransportError> {
        if let Some(latency) = self.admit(node, value.is_some())? {
            tokio::time::sleep(latency).await;
        }

        let mut nodes = self.nodes();
        let sim = nodes.get_mut(&node).ok_or(TransportError::Timeout)?;
        Ok(match value {
            None => sim.get(name).cloned().unwrap_or(Value::Empty),
            Some(value) => sim.apply_write(name, value),
        })
    }

    async fn list(&self, node: NodeId, index: u16) -> std::result::Result<String, TransportError> {
        if let Some(latency) = self.admit(node, false)? {
            tokio::time::sleep(latency).await;
        }

        let nodes = self.nodes();
        let sim = nodes.get(&node).ok_or(TransportError::Timeout)?;
        Ok(sim
            .registers
            .get(usize::from(index))
            .map(|(n, _)| n.clone())
            .unwrap_or_default())
    }

    async fn execute_command(
        &self,
        node: NodeId,
        command: NodeCommand,
    ) -> std::result::Result<CommandStatus, TransportError> {
        self.admit(node, false)?;

        let mut nodes = self.nodes();
        let sim = nodes.get_mut(&node).ok_or(TransportError::Timeout)?;
        sim.commands.push(command);
        Ok(CommandStatus::Success)
    }
}

/// YAML network description consumed by `MemoryBus::load`
///
/// ```yaml
/// nodes:
///   - id: 10
///     registers:
///       udral.pnp.cookie: ""
///       uavcan.sub.setpoint.id: 65535
///       uavcan.sub.setpoint.type: reg.udral.physics.dynamics.rotation.Planar.0.1
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFile {
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub id: u16,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub drop_writes: bool,
    #[serde(default)]
    pub read_only: Vec<String>,
    #[serde(default)]
    pub registers: BTreeMap<String, Literal>,
}

/// Register literal in a network file
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Integer(i64),
    Real(f64),
    Text(String),
    List(Vec<i64>),
}

impl Literal {
    pub fn into_value(self) -> Value {
        match self {
            Literal::Integer(i) => match u16::try_from(i) {
                Ok(n) => Value::natural16(n),
                Err(_) => Value::Integer64(vec![i]),
            },
            Literal::Real(r) => Value::Real64(vec![r]),
            Literal::Text(s) => Value::String(s),
            Literal::List(items) => {
                let naturals: std::result::Result<Vec<u16>, _> =
                    items.iter().map(|i| u16::try_from(*i)).collect();
                match naturals {
                    Ok(n) => Value::Natural16(n),
                    Err(_) => Value::Integer64(items),
                }
            }
        }
    }
}
