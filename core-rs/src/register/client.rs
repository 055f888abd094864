//! Register access with timeout and retry
//!
//! Every exchange gets its own deadline. A node that stays silent for
//! `1 + retries` attempts is reported as `PnpError::Unreachable`; nothing
//! here ever blocks other nodes' exchanges.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::bus::{BusFuture, CommandStatus, NodeCommand, RegisterBus};
use super::Value;
use crate::config::AllocatorConfig;
use crate::errors::{PnpError, Result};
use crate::port::NodeId;

/// Cheap-to-clone handle issuing register requests to remote nodes
#[derive(Clone)]
pub struct RegisterClient {
    bus: Arc<dyn RegisterBus>,
    timeout: Duration,
    retries: u32,
}

impl RegisterClient {
    pub fn new(bus: Arc<dyn RegisterBus>, timeout: Duration, retries: u32) -> Self {
        RegisterClient {
            bus,
            timeout,
            retries,
        }
    }

    pub fn from_config(bus: Arc<dyn RegisterBus>, config: &AllocatorConfig) -> Self {
        Self::new(bus, config.request_timeout(), config.retries)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange<'a, T>(
        &'a self,
        node: NodeId,
        what: &str,
        mut call: impl FnMut() -> BusFuture<'a, T>,
    ) -> Result<T> {
        for attempt in 0..=self.retries {
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => {
                    debug!(node = %node, register = what, attempt, error = %e, "Request failed");
                }
                Err(_) => {
                    debug!(node = %node, register = what, attempt, "Request timed out");
                }
            }
        }

        Err(PnpError::Unreachable {
            node,
            register: what.to_string(),
        })
    }

    /// Read a register's current value
    pub async fn read(&self, node: NodeId, name: &str) -> Result<Value> {
        let value = self
            .exchange(node, name, || self.bus.access(node, name, None))
            .await?;
        trace!(node = %node, register = name, value = %value, "Register read");
        Ok(value)
    }

    /// Write a register; returns the value the node reports afterwards
    pub async fn write(&self, node: NodeId, name: &str, value: Value) -> Result<Value> {
        let response = self
            .exchange(node, name, || self.bus.access(node, name, Some(value.clone())))
            .await?;
        trace!(node = %node, register = name, written = %value, response = %response, "Register write");
        Ok(response)
    }

    /// Enumerate every register name exposed by a node
    pub async fn list_all(&self, node: NodeId) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for index in 0..u16::MAX {
            let name = self
                .exchange(node, "register list", || self.bus.list(node, index))
                .await?;
            if name.is_empty() {
                break;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Lightweight presence check: asks for the first register name
    pub async fn probe(&self, node: NodeId) -> Result<()> {
        self.exchange(node, "presence probe", || self.bus.list(node, 0))
            .await
            .map(|_| ())
    }

    pub async fn command(&self, node: NodeId, command: NodeCommand) -> Result<CommandStatus> {
        let what = format!("command {}", command.code());
        self.exchange(node, &what, || self.bus.execute_command(node, command))
            .await
    }
}
