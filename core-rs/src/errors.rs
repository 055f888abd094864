//! Error types for the allocation engine

use thiserror::Error;

use crate::port::{AddressSpace, NodeId, PortId};

#[derive(Error, Debug)]
pub enum PnpError {
    #[error("Node {node} unreachable: no response to {register}")]
    Unreachable { node: NodeId, register: String },

    #[error("Malformed register {register} on node {node}: {reason}")]
    Malformed {
        node: NodeId,
        register: String,
        reason: String,
    },

    #[error("Port ID collision: {0}")]
    Collision(String),

    #[error("Node {node} rejected write to {register}: {reason}")]
    WriteRejected {
        node: NodeId,
        register: String,
        reason: String,
    },

    #[error("Address space exhausted: {space} [{min}, {max}] has no free port ID")]
    AddressSpaceExhausted {
        space: AddressSpace,
        min: PortId,
        max: PortId,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl PnpError {
    /// True for the conditions that end a cycle instead of narrowing it
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            PnpError::AddressSpaceExhausted { .. }
                | PnpError::Store(_)
                | PnpError::Io(_)
                | PnpError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PnpError>;
