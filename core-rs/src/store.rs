/**
 * store.rs
 * Durable allocation records
 *
 * Maps (space, semantic name, data type) -> assigned port ID, plus the
 * bookkeeping needed to keep IDs stable across restarts:
 * - version: monotonic commit counter, older commits have lower versions
 * - owners / lastSeen: which nodes declared the group, and when
 * - status: active, or archived after the group stayed unseen too long
 * - rejections: per-node write refusals with their retry cycle
 *
 * Mutations stay in memory until `flush`, which replaces the file
 * atomically (write to `<path>.tmp`, then rename). One flush per cycle makes
 * the cycle a single transaction.
 */

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{PnpError, Result};
use crate::port::{AddressSpace, GroupKey, NodeId, PortId};

const FORMAT_VERSION: u32 = 1;

/// Upper bound for the rejection backoff, in cycles
const MAX_BACKOFF_CYCLES: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    #[serde(rename_all = "camelCase")]
    Archived { archived_at: DateTime<Utc> },
}

/// A node that refused to accept a record's ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub node: NodeId,
    pub attempts: u32,
    pub retry_after_cycle: u64,
    pub reason: String,
}

/// Persisted allocation of one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    pub space: AddressSpace,
    pub name: String,
    pub data_type: String,
    pub port_id: PortId,
    pub version: u64,
    pub committed_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub owners: BTreeSet<NodeId>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<Rejection>,
}

impl AllocationRecord {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.space, self.name.clone(), self.data_type.clone())
    }

    pub fn matches(&self, key: &GroupKey) -> bool {
        self.space == key.space && self.name == key.name && self.data_type == key.data_type
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }

    pub fn rejection(&self, node: NodeId) -> Option<&Rejection> {
        self.rejections.iter().find(|r| r.node == node)
    }
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Unchanged,
    Reassigned { previous: PortId },
}

/// On-disk file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    format_version: u32,
    next_version: u64,
    cycle: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookie: Option<String>,
    records: Vec<AllocationRecord>,
}

impl Default for StoreFile {
    fn default() -> Self {
        StoreFile {
            format_version: FORMAT_VERSION,
            next_version: 1,
            cycle: 0,
            cookie: None,
            records: Vec::new(),
        }
    }
}

/// Allocation Store - owns the allocation file for the lifetime of the process
pub struct AllocationStore {
    path: PathBuf,
    file: StoreFile,
    dirty: bool,
}

impl AllocationStore {
    /// Open the store at `path`
    ///
    /// A missing file yields an empty store; nothing is written until the
    /// first `flush`. A file that exists but does not parse is an error,
    /// never a silent reset.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::load_file(&path)?;

        debug!(path = %path.display(), records = file.records.len(), "Opened allocation store");

        Ok(AllocationStore {
            path,
            file,
            dirty: false,
        })
    }

    fn load_file(path: &Path) -> Result<StoreFile> {
        if !path.exists() {
            return Ok(StoreFile::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            PnpError::Store(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let file: StoreFile = serde_json::from_str(&content).map_err(|e| {
            PnpError::Store(format!("Invalid allocation file {}: {}", path.display(), e))
        })?;

        if file.format_version != FORMAT_VERSION {
            return Err(PnpError::Store(format!(
                "Unsupported allocation file format {} in {}",
                file.format_version,
                path.display()
            )));
        }

        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[AllocationRecord] {
        &self.file.records
    }

    pub fn get(&self, key: &GroupKey) -> Option<&AllocationRecord> {
        self.file.records.iter().find(|r| r.matches(key))
    }

    fn get_mut(&mut self, key: &GroupKey) -> Option<&mut AllocationRecord> {
        self.file.records.iter_mut().find(|r| r.matches(key))
    }

    /// Last completed cycle number
    pub fn cycle(&self) -> u64 {
        self.file.cycle
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        if self.file.cycle != cycle {
            self.file.cycle = cycle;
            self.dirty = true;
        }
    }

    pub fn cookie(&self) -> Option<&str> {
        self.file.cookie.as_deref()
    }

    /// Expected PnP cookie: the configured one, else the persisted one, else
    /// a newly generated `autoconfigured <hex>` value that is then persisted
    pub fn ensure_cookie(&mut self, configured: Option<&str>) -> String {
        if let Some(cookie) = configured {
            return cookie.trim().to_lowercase();
        }
        if let Some(cookie) = &self.file.cookie {
            return cookie.clone();
        }

        let bytes: [u8; 8] = rand::thread_rng().gen();
        let cookie = format!("autoconfigured {}", hex::encode(bytes));
        info!(cookie = %cookie, "Generated network PnP cookie");
        self.file.cookie = Some(cookie.clone());
        self.dirty = true;
        cookie
    }

    /// Record `port_id` for a group
    ///
    /// A fresh version is assigned only when the record is new or its ID
    /// changes, so an unchanged commit keeps its age.
    pub fn upsert(
        &mut self,
        key: &GroupKey,
        port_id: PortId,
        owners: &BTreeSet<NodeId>,
        now: DateTime<Utc>,
    ) -> UpsertOutcome {
        let version = self.file.next_version;

        let outcome = match self.get_mut(key) {
            Some(record) if record.port_id == port_id => {
                record.owners.extend(owners.iter().copied());
                record.last_seen = now;
                record.status = RecordStatus::Active;
                UpsertOutcome::Unchanged
            }
            Some(record) => {
                let previous = record.port_id;
                record.port_id = port_id;
                record.version = version;
                record.committed_at = now;
                record.last_seen = now;
                record.owners.extend(owners.iter().copied());
                record.status = RecordStatus::Active;
                record.rejections.clear();
                warn!(group = %key, previous, port_id, "Allocation record reassigned");
                UpsertOutcome::Reassigned { previous }
            }
            None => {
                self.file.records.push(AllocationRecord {
                    space: key.space,
                    name: key.name.clone(),
                    data_type: key.data_type.clone(),
                    port_id,
                    version,
                    committed_at: now,
                    last_seen: now,
                    owners: owners.clone(),
                    status: RecordStatus::Active,
                    rejections: Vec::new(),
                });
                self.file.records.sort_by_key(|r| r.key());
                UpsertOutcome::Created
            }
        };

        if outcome != UpsertOutcome::Unchanged {
            self.file.next_version += 1;
        }
        self.dirty = true;
        outcome
    }

    /// Refresh owners and last-seen time of an observed group
    ///
    /// Reactivates archived records. Returns false when no record exists.
    pub fn touch(&mut self, key: &GroupKey, owners: &BTreeSet<NodeId>, now: DateTime<Utc>) -> bool {
        let Some(record) = self.get_mut(key) else {
            return false;
        };

        if !record.is_active() {
            info!(group = %key, port_id = record.port_id, "Archived allocation reactivated");
            record.status = RecordStatus::Active;
        }
        record.owners = owners.clone();
        record.last_seen = now;
        self.dirty = true;
        true
    }

    /// Archive active records unseen for longer than `grace`
    pub fn archive_stale(&mut self, now: DateTime<Utc>, grace: chrono::Duration) -> Vec<GroupKey> {
        let mut archived = Vec::new();
        for record in self.file.records.iter_mut() {
            if record.is_active() && now.signed_duration_since(record.last_seen) > grace {
                record.status = RecordStatus::Archived { archived_at: now };
                archived.push(record.key());
            }
        }

        if !archived.is_empty() {
            for key in &archived {
                info!(group = %key, "Allocation archived after grace period");
            }
            self.dirty = true;
        }
        archived
    }

    /// Drop the archived record holding `port_id`, if any
    pub fn remove_archived_holding(&mut self, space: AddressSpace, port_id: PortId) -> Option<AllocationRecord> {
        let pos = self
            .file
            .records
            .iter()
            .position(|r| r.space == space && r.port_id == port_id && !r.is_active())?;
        self.dirty = true;
        Some(self.file.records.remove(pos))
    }

    /// Note that `node` refused the record's ID
    ///
    /// Backoff doubles with every repeated refusal, starting at
    /// `base_backoff` cycles. Returns the cycle after which a retry is due.
    pub fn mark_rejected(
        &mut self,
        key: &GroupKey,
        node: NodeId,
        cycle: u64,
        reason: &str,
        base_backoff: u64,
    ) -> Option<u64> {
        let record = self.get_mut(key)?;

        let attempts = record.rejection(node).map(|r| r.attempts).unwrap_or(0) + 1;
        let backoff = base_backoff
            .max(1)
            .saturating_mul(1u64 << (attempts - 1).min(16))
            .min(MAX_BACKOFF_CYCLES);
        let retry_after_cycle = cycle + backoff;

        record.rejections.retain(|r| r.node != node);
        record.rejections.push(Rejection {
            node,
            attempts,
            retry_after_cycle,
            reason: reason.to_string(),
        });
        record.rejections.sort_by_key(|r| r.node);
        self.dirty = true;

        Some(retry_after_cycle)
    }

    pub fn clear_rejection(&mut self, key: &GroupKey, node: NodeId) {
        if let Some(record) = self.get_mut(key) {
            let before = record.rejections.len();
            record.rejections.retain(|r| r.node != node);
            if record.rejections.len() != before {
                self.dirty = true;
            }
        }
    }

    /// True while a refused write to `node` is waiting out its backoff
    pub fn is_backing_off(&self, key: &GroupKey, node: NodeId, cycle: u64) -> bool {
        self.get(key)
            .and_then(|r| r.rejection(node))
            .map(|r| cycle < r.retry_after_cycle)
            .unwrap_or(false)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Durably write pending changes
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let json = serde_json::to_string_pretty(&self.file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    PnpError::Store(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, json).map_err(|e| {
            PnpError::Store(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            PnpError::Store(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), records = self.file.records.len(), "Allocation store flushed");
        self.dirty = false;
        Ok(())
    }

    /// Flush and release the store
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}
