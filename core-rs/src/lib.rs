//! # UDRAL PnP - automatic port ID allocation
//!
//! Assigns subject and service IDs to the ports that nodes on a Cyphal bus
//! declare through their registers, so that nodes sharing a semantic port
//! name and data type end up on the same ID and nobody else does.
//!
//! ## Core Principle
//!
//! **Registers ARE the interface**: every node advertises its ports as
//! `uavcan.<role>.<name>.id` / `.type` register pairs. The allocator reads
//! them, decides, writes the IDs back and remembers what it decided.
//!
//! ## Cycle
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐   ┌─────────┐
//! │ Discover  │──▶│ Collect   │──▶│  Plan   │──▶│ Resolve  │──▶│  Apply  │
//! │  (scan)   │   │(inventory)│   │(planner)│   │(resolver)│   │(applier)│
//! └───────────┘   └───────────┘   └─────────┘   └──────────┘   └────┬────┘
//!       ▲                              ▲                            │
//!       │                        ┌─────┴─────┐                      │
//!       └────── next cycle ──────│   Store   │◀──── verify/persist ─┘
//!                                └───────────┘
//! ```

pub mod applier;
pub mod config;
pub mod engine;
pub mod errors;
mod fanout;
pub mod inventory;
pub mod planner;
pub mod port;
pub mod register;
pub mod resolver;
pub mod store;

pub use applier::{Applier, ApplyOutcome, TargetOutcome, WriteTarget};
pub use config::{AllocatorConfig, CollisionPolicy, NodeIdRange};
pub use engine::{Allocator, CycleReport, CycleState, TopologyEvent};
pub use errors::{PnpError, Result};
pub use inventory::{CookieState, MalformedEntry, PeerInventory, PeerReport, Snapshot};
pub use planner::{Plan, Planner};
pub use port::{
    AddressSpace, AssignmentSource, GroupKey, NodeId, PortAssignment, PortId, PortRequirement,
    PortRole, PortSlot, SpaceBounds,
};
pub use register::{MemoryBus, RegisterBus, RegisterClient, SimNode, Value};
pub use resolver::{Conflict, ConflictKind, ConflictResolver, Resolution};
pub use store::{AllocationRecord, AllocationStore, RecordStatus, UpsertOutcome};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "pnp.yaml";
