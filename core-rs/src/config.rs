/**
 * config.rs
 * Parser for pnp.yaml allocator configuration (YAML format)
 *
 * Format:
 * ```yaml
 * localNodeId: 127
 * nodeIdRange: { start: 0, end: 125 }
 * requestTimeoutMs: 1000
 * retries: 2
 * fanOut: 8
 * cycleIntervalMs: 5000
 * storePath: pnp-allocations.json
 * subjectSpace: { min: 0, max: 6143, sentinel: 65535 }
 * serviceSpace: { min: 0, max: 255, sentinel: 65535 }
 * collisionPolicy: oldest-commit
 * ```
 *
 * Every key is optional; missing keys take the defaults below.
 */

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{PnpError, Result};
use crate::port::{AddressSpace, NodeId, SpaceBounds};

/// Inclusive node-ID scan range
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeIdRange {
    pub start: u16,
    pub end: u16,
}

impl NodeIdRange {
    pub fn iter(&self) -> impl Iterator<Item = NodeId> {
        (self.start..=self.end).map(NodeId)
    }
}

/// Who keeps a contested port ID
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Oldest committed record wins; uncommitted groups fall back to lowest node ID
    #[default]
    OldestCommit,
    /// Group with the numerically lowest member node ID wins
    LowestNode,
}

/// pnp.yaml file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatorConfig {
    pub local_node_id: u16,
    pub node_id_range: NodeIdRange,
    pub request_timeout_ms: u64,
    pub retries: u32,
    pub fan_out: usize,
    pub cycle_interval_ms: u64,
    pub archive_after_secs: u64,
    pub reject_backoff_cycles: u64,
    pub store_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnp_cookie: Option<String>,
    pub restart_after_apply: bool,
    pub register_prefix: String,
    pub subject_space: SpaceBounds,
    pub service_space: SpaceBounds,
    pub collision_policy: CollisionPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            local_node_id: 127,
            node_id_range: NodeIdRange { start: 0, end: 125 },
            request_timeout_ms: 1000,
            retries: 2,
            fan_out: 8,
            cycle_interval_ms: 5000,
            archive_after_secs: 86_400,
            reject_backoff_cycles: 4,
            store_path: PathBuf::from("pnp-allocations.json"),
            pnp_cookie: None,
            restart_after_apply: true,
            register_prefix: "uavcan".to_string(),
            subject_space: SpaceBounds::subject_default(),
            service_space: SpaceBounds::service_default(),
            collision_policy: CollisionPolicy::OldestCommit,
        }
    }
}

impl AllocatorConfig {
    /// Load pnp.yaml from specified path
    ///
    /// # Example
    /// ```no_run
    /// let config = pnp_core::AllocatorConfig::load("pnp.yaml")?;
    /// # Ok::<(), pnp_core::PnpError>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).map_err(|e| {
            PnpError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: AllocatorConfig = serde_yaml::from_str(&content)
            .map_err(|e| PnpError::Config(format!("Invalid {} YAML: {}", path.display(), e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load pnp.yaml if present, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path.as_ref(), yaml)?;
        Ok(())
    }

    /// Validate ranges and limits
    ///
    /// Ensures:
    /// - node ID range is not inverted
    /// - each space has min <= max within the protocol limit
    /// - the sentinel lies outside the managed range
    /// - timeouts and fan-out are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.node_id_range.start > self.node_id_range.end {
            return Err(PnpError::Config(format!(
                "nodeIdRange start {} is after end {}",
                self.node_id_range.start, self.node_id_range.end
            )));
        }

        for space in AddressSpace::ALL {
            let bounds = self.bounds(space);
            if bounds.min > bounds.max {
                return Err(PnpError::Config(format!(
                    "{} space min {} is above max {}",
                    space, bounds.min, bounds.max
                )));
            }
            if bounds.max > space.protocol_max() {
                return Err(PnpError::Config(format!(
                    "{} space max {} exceeds protocol limit {}",
                    space,
                    bounds.max,
                    space.protocol_max()
                )));
            }
            if bounds.contains(bounds.sentinel) {
                return Err(PnpError::Config(format!(
                    "{} space sentinel {} lies inside the managed range",
                    space, bounds.sentinel
                )));
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(PnpError::Config("requestTimeoutMs cannot be 0".to_string()));
        }
        if self.fan_out == 0 {
            return Err(PnpError::Config("fanOut cannot be 0".to_string()));
        }
        if self.register_prefix.is_empty() {
            return Err(PnpError::Config("registerPrefix cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn bounds(&self, space: AddressSpace) -> SpaceBounds {
        match space {
            AddressSpace::Subject => self.subject_space,
            AddressSpace::Service => self.service_space,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn archive_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.archive_after_secs).unwrap_or(i64::MAX))
    }

    /// Node IDs to scan, without the allocator itself
    pub fn scan_targets(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_id_range
            .iter()
            .filter(move |id| id.0 != self.local_node_id)
    }
}
