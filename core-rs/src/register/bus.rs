//! Transport seam
//!
//! The bus itself (CAN driver, transfer layer, serialization) lives outside
//! this crate. Anything that can carry a register access, a register list
//! request and a node command addressed by node ID can drive the allocator.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use super::Value;
use crate::port::NodeId;

/// Failure of one request/response exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no response")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

/// Future returned by every bus exchange
pub type BusFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, TransportError>> + Send + 'a>>;

/// Commands understood by remote nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Restart,
    StorePersistentStates,
}

impl NodeCommand {
    pub fn code(&self) -> u16 {
        match self {
            NodeCommand::Restart => 65535,
            NodeCommand::StorePersistentStates => 65530,
        }
    }
}

/// Status carried in a command response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failure,
    NotAuthorized,
    BadCommand,
    BadParameter,
    BadState,
    InternalError,
}

impl CommandStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => CommandStatus::Success,
            2 => CommandStatus::NotAuthorized,
            3 => CommandStatus::BadCommand,
            4 => CommandStatus::BadParameter,
            5 => CommandStatus::BadState,
            6 => CommandStatus::InternalError,
            _ => CommandStatus::Failure,
        }
    }
}

/// Request/response primitives addressed by node ID
///
/// Implementations do not need to apply timeouts or retries; `RegisterClient`
/// wraps every call with both.
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Read (`value == None`) or write a register; the response carries the
    /// register's value after the request was handled. A register that does
    /// not exist answers `Value::Empty`.
    async fn access(
        &self,
        node: NodeId,
        name: &str,
        value: Option<Value>,
    ) -> std::result::Result<Value, TransportError>;

    /// Name of the register at `index`; an empty name ends the list
    async fn list(&self, node: NodeId, index: u16) -> std::result::Result<String, TransportError>;

    async fn execute_command(
        &self,
        node: NodeId,
        command: NodeCommand,
    ) -> std::result::Result<CommandStatus, TransportError>;
}
