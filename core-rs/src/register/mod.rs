//! Register access: value model, transport seam, timeout/retry client and
//! an in-process simulated bus

pub mod bus;
pub mod client;
pub mod memory;
pub mod value;

pub use bus::{BusFuture, CommandStatus, NodeCommand, RegisterBus, TransportError};
pub use client::RegisterClient;
pub use memory::{MemoryBus, NetworkFile, SimNode};
pub use value::Value;

/// String register holding the plug-and-play cookie
pub const PNP_COOKIE_REGISTER: &str = "udral.pnp.cookie";
