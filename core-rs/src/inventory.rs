/**
 * inventory.rs
 * Peer Inventory - who is on the bus and which ports they declare
 *
 * Two passes per cycle:
 * - discover: bounded concurrent presence probe over the node-ID range
 * - snapshot: per responding node, read the PnP cookie, enumerate registers,
 *   parse every port ID/type pair into a PortRequirement
 *
 * A node that stops answering mid-fetch is dropped from this cycle only.
 * A register that does not parse is reported as malformed and skipped;
 * the rest of the node's ports are still collected.
 */

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AllocatorConfig;
use crate::errors::{PnpError, Result};
use crate::fanout::for_each_node;
use crate::port::naming::type_register;
use crate::port::{
    detect_service_instances, parse_port_id, parse_register_name, AddressSpace, NodeId, PortId,
    PortRequirement, PortRole, RegisterName, SpaceBounds,
};
use crate::register::{RegisterBus, RegisterClient, Value, PNP_COOKIE_REGISTER};

/// Plug-and-play state of a peer, derived from its cookie register
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieState {
    /// No string cookie register: the node does not take part in PnP
    NotCapable,
    /// Cookie is `reject`: the operator configures this node by hand
    Manual,
    /// Cookie matches the network's: configured by this allocator before
    Configured,
    /// Any other cookie, including empty: waiting for configuration
    Pending(String),
}

impl CookieState {
    pub fn classify(value: &Value, expected: &str) -> Self {
        let Some(cookie) = value.as_str() else {
            return CookieState::NotCapable;
        };
        let cookie = cookie.trim().to_lowercase();

        if cookie == "reject" {
            CookieState::Manual
        } else if cookie == expected {
            CookieState::Configured
        } else {
            CookieState::Pending(cookie)
        }
    }

    /// Whether the allocator may write this node's port registers
    pub fn writable(&self) -> bool {
        matches!(self, CookieState::Configured | CookieState::Pending(_))
    }
}

/// A port register skipped this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    pub node: NodeId,
    pub register: String,
    pub reason: String,
}

impl From<MalformedEntry> for PnpError {
    fn from(entry: MalformedEntry) -> Self {
        PnpError::Malformed {
            node: entry.node,
            register: entry.register,
            reason: entry.reason,
        }
    }
}

/// Everything learned from one peer in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReport {
    pub node: NodeId,
    pub cookie: CookieState,
    /// Sorted by (role, name)
    pub requirements: Vec<PortRequirement>,
    pub malformed: Vec<MalformedEntry>,
    /// Valid IDs held by ports that were otherwise malformed
    pub foreign: Vec<(AddressSpace, PortId)>,
}

/// Result of one collection pass
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub peers: BTreeMap<NodeId, PeerReport>,
    pub unreachable: BTreeSet<NodeId>,
}

impl Snapshot {
    /// All requirements, ordered by node then role then name
    pub fn requirements(&self) -> Vec<PortRequirement> {
        self.peers
            .values()
            .flat_map(|p| p.requirements.iter().cloned())
            .collect()
    }

    /// Every ID seen configured on the bus this cycle
    pub fn observed_busy(&self) -> BTreeSet<(AddressSpace, PortId)> {
        let mut busy = BTreeSet::new();
        for peer in self.peers.values() {
            for req in &peer.requirements {
                if let Some(id) = req.current {
                    busy.insert((req.role.space(), id));
                }
            }
            busy.extend(peer.foreign.iter().copied());
        }
        busy
    }

    pub fn malformed_count(&self) -> usize {
        self.peers.values().map(|p| p.malformed.len()).sum()
    }

    pub fn cookie(&self, node: NodeId) -> Option<&CookieState> {
        self.peers.get(&node).map(|p| &p.cookie)
    }
}

/// Peer Inventory
#[derive(Clone)]
pub struct PeerInventory {
    client: RegisterClient,
    prefix: String,
    subject: SpaceBounds,
    service: SpaceBounds,
    fan_out: usize,
    targets: Vec<NodeId>,
    expected_cookie: String,
}

impl PeerInventory {
    pub fn new(client: RegisterClient, config: &AllocatorConfig, expected_cookie: &str) -> Self {
        PeerInventory {
            client,
            prefix: config.register_prefix.clone(),
            subject: config.subject_space,
            service: config.service_space,
            fan_out: config.fan_out,
            targets: config.scan_targets().collect(),
            expected_cookie: expected_cookie.trim().to_lowercase(),
        }
    }

    pub fn from_bus(bus: Arc<dyn RegisterBus>, config: &AllocatorConfig, expected_cookie: &str) -> Self {
        Self::new(RegisterClient::from_config(bus, config), config, expected_cookie)
    }

    fn bounds(&self, space: AddressSpace) -> &SpaceBounds {
        match space {
            AddressSpace::Subject => &self.subject,
            AddressSpace::Service => &self.service,
        }
    }

    /// Probe the configured node-ID range; returns the nodes that answered
    pub async fn discover(&self) -> BTreeSet<NodeId> {
        let client = self.client.clone();
        let results = for_each_node(self.targets.iter().copied(), self.fan_out, move |node| {
            let client = client.clone();
            async move { client.probe(node).await }
        })
        .await;

        let found: BTreeSet<NodeId> = results
            .into_iter()
            .filter_map(|(node, probed)| probed.ok().map(|_| node))
            .collect();

        info!(
            scanned = self.targets.len(),
            found = found.len(),
            nodes = ?found,
            "Discovery complete"
        );
        found
    }

    /// Collect the port requirements of every given node, concurrently
    pub async fn snapshot(&self, nodes: &BTreeSet<NodeId>) -> Snapshot {
        let inventory = self.clone();
        let results = for_each_node(nodes.iter().copied(), self.fan_out, move |node| {
            let inventory = inventory.clone();
            async move { inventory.fetch_requirements(node).await }
        })
        .await;

        let mut snapshot = Snapshot::default();
        for (node, fetched) in results {
            match fetched {
                Ok(report) => {
                    snapshot.peers.insert(node, report);
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Peer dropped from this cycle");
                    snapshot.unreachable.insert(node);
                }
            }
        }
        snapshot
    }

    /// Read one node's PnP cookie and declared ports
    ///
    /// # Errors
    /// `PnpError::Unreachable` when the node stops answering; everything
    /// register-specific is reported inside the `PeerReport` instead.
    pub async fn fetch_requirements(&self, node: NodeId) -> Result<PeerReport> {
        let cookie_value = self.client.read(node, PNP_COOKIE_REGISTER).await?;
        let cookie = CookieState::classify(&cookie_value, &self.expected_cookie);
        let writable = cookie.writable();

        let names = self.client.list_all(node).await?;
        let listed: BTreeSet<&str> = names.iter().map(String::as_str).collect();

        let mut report = PeerReport {
            node,
            cookie,
            requirements: Vec::new(),
            malformed: Vec::new(),
            foreign: Vec::new(),
        };

        let mut id_registers: BTreeMap<(PortRole, String), String> = BTreeMap::new();
        for register in &names {
            match parse_register_name(&self.prefix, register) {
                Ok(RegisterName::PortId { role, name }) => {
                    id_registers.insert((role, name), register.clone());
                }
                Ok(RegisterName::PortType { .. }) | Ok(RegisterName::Other) => {}
                Err(reason) => report.malformed.push(MalformedEntry {
                    node,
                    register: register.clone(),
                    reason,
                }),
            }
        }

        for ((role, name), register) in id_registers {
            let space = role.space();
            let id_value = self.client.read(node, &register).await?;
            let current = match parse_port_id(&id_value, space, self.bounds(space)) {
                Ok(current) => current,
                Err(reason) => {
                    report.malformed.push(MalformedEntry {
                        node,
                        register,
                        reason,
                    });
                    continue;
                }
            };

            let type_name = type_register(&self.prefix, role, &name);
            let data_type = if listed.contains(type_name.as_str()) {
                let value = self.client.read(node, &type_name).await?;
                match value.as_str().map(str::trim) {
                    Some(t) if !t.is_empty() => Ok(t.to_string()),
                    _ => Err(format!("type register holds {}, expected a string", value)),
                }
            } else {
                Err("no paired .type register".to_string())
            };

            match data_type {
                Ok(data_type) => report.requirements.push(PortRequirement {
                    node,
                    role,
                    name,
                    data_type,
                    current,
                    writable,
                }),
                Err(reason) => {
                    if let Some(id) = current {
                        report.foreign.push((space, id));
                    }
                    report.malformed.push(MalformedEntry {
                        node,
                        register: type_name,
                        reason,
                    });
                }
            }
        }

        for entry in &report.malformed {
            warn!(error = %PnpError::from(entry.clone()), "Skipping malformed port register");
        }

        let services =
            detect_service_instances(report.requirements.iter().map(|r| (r.role, r.name.as_str())));
        for service in &services {
            debug!(
                node = %node,
                service = %service.service,
                instance = %service.instance,
                "Detected service instance"
            );
        }

        debug!(
            node = %node,
            cookie = ?report.cookie,
            ports = report.requirements.len(),
            malformed = report.malformed.len(),
            "Collected port requirements"
        );
        Ok(report)
    }
}
