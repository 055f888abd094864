/**
 * port module
 * Port model shared by inventory, planner, resolver and applier
 *
 * A port is identified on the wire by a numeric ID drawn from one of two
 * address spaces:
 * - Subject space: publishers and subscribers
 * - Service space: clients and servers
 *
 * Ports with the same semantic name and data type form one group and share
 * one ID network-wide.
 */

pub mod naming;
pub mod services;

pub use naming::{parse_port_id, parse_register_name, RegisterName};
pub use services::{detect_service, detect_service_instances, PortSuffixMapping};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric port identifier as carried in `natural16` registers
pub type PortId = u16;

/// Stable numeric address of a bus participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for NodeId {
    fn from(id: u16) -> Self {
        NodeId(id)
    }
}

/// ID space a port lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSpace {
    Subject,
    Service,
}

impl AddressSpace {
    pub const ALL: [AddressSpace; 2] = [AddressSpace::Subject, AddressSpace::Service];

    /// Largest ID the protocol allows in this space
    pub fn protocol_max(&self) -> PortId {
        match self {
            AddressSpace::Subject => 8191,
            AddressSpace::Service => 511,
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Subject => write!(f, "subject"),
            AddressSpace::Service => write!(f, "service"),
        }
    }
}

/// Role of a port on its owning node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortRole {
    Publisher,
    Subscriber,
    Client,
    Server,
}

impl PortRole {
    pub const ALL: [PortRole; 4] = [
        PortRole::Publisher,
        PortRole::Subscriber,
        PortRole::Client,
        PortRole::Server,
    ];

    /// Register-name token for this role
    pub fn token(&self) -> &'static str {
        match self {
            PortRole::Publisher => "pub",
            PortRole::Subscriber => "sub",
            PortRole::Client => "cln",
            PortRole::Server => "srv",
        }
    }

    pub fn from_token(token: &str) -> Option<PortRole> {
        match token {
            "pub" => Some(PortRole::Publisher),
            "sub" => Some(PortRole::Subscriber),
            "cln" => Some(PortRole::Client),
            "srv" => Some(PortRole::Server),
            _ => None,
        }
    }

    pub fn space(&self) -> AddressSpace {
        match self {
            PortRole::Publisher | PortRole::Subscriber => AddressSpace::Subject,
            PortRole::Client | PortRole::Server => AddressSpace::Service,
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Managed range and "unconfigured" sentinel of one address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceBounds {
    pub min: PortId,
    pub max: PortId,
    pub sentinel: PortId,
}

impl SpaceBounds {
    pub fn contains(&self, id: PortId) -> bool {
        id >= self.min && id <= self.max
    }

    pub fn subject_default() -> Self {
        SpaceBounds {
            min: 0,
            max: 6143,
            sentinel: u16::MAX,
        }
    }

    pub fn service_default() -> Self {
        SpaceBounds {
            min: 0,
            max: 255,
            sentinel: u16::MAX,
        }
    }
}

/// Identity of a communication channel: ports sharing a key share an ID
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKey {
    pub space: AddressSpace,
    pub name: String,
    pub data_type: String,
}

impl GroupKey {
    pub fn new(space: AddressSpace, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        GroupKey {
            space,
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}[{}]", self.space, self.name, self.data_type)
    }
}

/// One port declared by one node, as read from its registers this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequirement {
    pub node: NodeId,
    pub role: PortRole,
    pub name: String,
    pub data_type: String,
    /// `None` when the register holds the sentinel
    pub current: Option<PortId>,
    /// False for nodes that are not plug-and-play managed
    pub writable: bool,
}

impl PortRequirement {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.role.space(), self.name.clone(), self.data_type.clone())
    }

    pub fn is_configured(&self) -> bool {
        self.current.is_some()
    }

    /// `<prefix>.<role>.<name>.id`
    pub fn id_register(&self, prefix: &str) -> String {
        naming::id_register(prefix, self.role, &self.name)
    }

    /// Identity of the requirement itself, independent of its current value
    pub fn slot(&self) -> PortSlot {
        PortSlot {
            node: self.node,
            role: self.role,
            name: self.name.clone(),
        }
    }
}

/// (node, role, name): addresses one port register on one node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortSlot {
    pub node: NodeId,
    pub role: PortRole,
    pub name: String,
}

impl fmt::Display for PortSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} {}.{}", self.node, self.role, self.name)
    }
}

/// Where a planned ID came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    /// Reused from a persisted allocation record
    Committed,
    /// Reused from a member already configured on the bus
    Live,
    /// Lowest free ID in the managed range
    Fresh,
    /// Taken back from an archived record because the range was otherwise full
    Reclaimed,
}

impl AssignmentSource {
    pub fn is_reuse(&self) -> bool {
        matches!(self, AssignmentSource::Committed | AssignmentSource::Live)
    }
}

/// Resolved ID for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub key: GroupKey,
    pub port_id: PortId,
    pub source: AssignmentSource,
}
