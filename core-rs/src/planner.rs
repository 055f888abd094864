/**
 * planner.rs
 * Allocation Planner - deterministic port ID assignment
 *
 * For every group (space, name, data type) with at least one unconfigured
 * member, pick one ID:
 * 1. the group's persisted record, if any (stability)
 * 2. else the lowest ID a member already carries on the bus (join an
 *    existing channel instead of opening a second one)
 * 3. else the lowest free ID of the space's managed range
 * 4. else the lowest ID held only by an archived record
 * 5. else the space is exhausted and the group gets nothing
 *
 * "Free" excludes every configured ID seen on the bus, every reserved ID
 * handed in by the caller, every persisted record (active or archived) and
 * every ID already chosen earlier in the same plan.
 *
 * Groups are visited in key order and members are reduced with `min`, so the
 * result depends only on the requirement set and the records, never on the
 * order peers were discovered in.
 */

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

use crate::config::AllocatorConfig;
use crate::errors::PnpError;
use crate::port::{
    AddressSpace, AssignmentSource, GroupKey, PortAssignment, PortId, PortRequirement, SpaceBounds,
};
use crate::store::AllocationRecord;

/// Proposed assignments for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// One entry per planned group, sorted by key
    pub assignments: Vec<PortAssignment>,
    /// Groups that could not get an ID
    pub exhausted: Vec<GroupKey>,
}

impl Plan {
    pub fn get(&self, key: &GroupKey) -> Option<&PortAssignment> {
        self.assignments
            .binary_search_by(|a| a.key.cmp(key))
            .ok()
            .map(|i| &self.assignments[i])
    }

    pub fn exhausted_spaces(&self) -> BTreeSet<AddressSpace> {
        self.exhausted.iter().map(|k| k.space).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.exhausted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Planner {
    subject: SpaceBounds,
    service: SpaceBounds,
}

impl Planner {
    pub fn new(subject: SpaceBounds, service: SpaceBounds) -> Self {
        Planner { subject, service }
    }

    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self::new(config.subject_space, config.service_space)
    }

    pub fn bounds(&self, space: AddressSpace) -> &SpaceBounds {
        match space {
            AddressSpace::Subject => &self.subject,
            AddressSpace::Service => &self.service,
        }
    }

    /// Error reported for a space with no assignable ID left
    pub fn exhaustion_error(&self, space: AddressSpace) -> PnpError {
        let bounds = self.bounds(space);
        PnpError::AddressSpaceExhausted {
            space,
            min: bounds.min,
            max: bounds.max,
        }
    }

    pub fn plan(&self, requirements: &[PortRequirement], committed: &[AllocationRecord]) -> Plan {
        self.plan_with_reserved(requirements, committed, &BTreeSet::new())
    }

    /// Plan while also keeping `reserved` IDs out of fresh picks
    pub fn plan_with_reserved(
        &self,
        requirements: &[PortRequirement],
        committed: &[AllocationRecord],
        reserved: &BTreeSet<(AddressSpace, PortId)>,
    ) -> Plan {
        self.plan_excluding(requirements, committed, reserved, &BTreeMap::new())
    }

    /// Re-plan after conflict resolution: a group never gets an ID listed
    /// for it in `barred`, whatever its record or live members say
    pub fn plan_excluding(
        &self,
        requirements: &[PortRequirement],
        committed: &[AllocationRecord],
        reserved: &BTreeSet<(AddressSpace, PortId)>,
        barred: &BTreeMap<GroupKey, BTreeSet<PortId>>,
    ) -> Plan {
        // Group membership, plus the lowest live ID per group
        let mut groups: BTreeMap<GroupKey, Option<PortId>> = BTreeMap::new();
        let mut pending: BTreeSet<GroupKey> = BTreeSet::new();
        let mut busy: BTreeSet<(AddressSpace, PortId)> = reserved.clone();

        for req in requirements {
            let key = req.key();
            match req.current {
                Some(id) => {
                    busy.insert((key.space, id));
                    let lowest = groups.entry(key).or_insert(None);
                    *lowest = Some(lowest.map_or(id, |l| l.min(id)));
                }
                None => {
                    groups.entry(key.clone()).or_insert(None);
                    pending.insert(key);
                }
            }
        }

        let mut archived_only: BTreeSet<(AddressSpace, PortId)> = BTreeSet::new();
        for record in committed {
            busy.insert((record.space, record.port_id));
            if !record.is_active() {
                archived_only.insert((record.space, record.port_id));
            }
        }
        for record in committed.iter().filter(|r| r.is_active()) {
            archived_only.remove(&(record.space, record.port_id));
        }
        // An archived group with members on the bus again still owns its ID
        for record in committed.iter().filter(|r| !r.is_active()) {
            if groups.contains_key(&record.key()) {
                archived_only.remove(&(record.space, record.port_id));
            }
        }
        // Archived IDs someone still uses on the bus cannot be reclaimed
        let live: BTreeSet<(AddressSpace, PortId)> = requirements
            .iter()
            .filter_map(|r| r.current.map(|id| (r.role.space(), id)))
            .chain(reserved.iter().copied())
            .collect();
        archived_only.retain(|entry| !live.contains(entry));

        let mut plan = Plan::default();

        for key in pending {
            let live_id = groups.get(&key).copied().flatten();
            let record = committed.iter().find(|r| r.matches(&key));
            let excluded = barred.get(&key);
            let allowed = |id: PortId| excluded.map_or(true, |ids| !ids.contains(&id));

            let choice = if let Some(record) = record.filter(|r| allowed(r.port_id)) {
                Some((record.port_id, AssignmentSource::Committed))
            } else if let Some(id) = live_id.filter(|id| allowed(*id)) {
                Some((id, AssignmentSource::Live))
            } else if let Some(id) = self.lowest_free(key.space, &busy, allowed) {
                Some((id, AssignmentSource::Fresh))
            } else if let Some(id) = Self::lowest_archived(key.space, &archived_only, allowed) {
                archived_only.remove(&(key.space, id));
                warn!(group = %key, port_id = id, "Reclaiming ID of an archived allocation");
                Some((id, AssignmentSource::Reclaimed))
            } else {
                None
            };

            match choice {
                Some((port_id, source)) => {
                    busy.insert((key.space, port_id));
                    debug!(group = %key, port_id, source = ?source, "Planned assignment");
                    plan.assignments.push(PortAssignment {
                        key,
                        port_id,
                        source,
                    });
                }
                None => {
                    error!(group = %key, error = %self.exhaustion_error(key.space), "No ID available");
                    plan.exhausted.push(key);
                }
            }
        }

        plan
    }

    fn lowest_free(
        &self,
        space: AddressSpace,
        busy: &BTreeSet<(AddressSpace, PortId)>,
        allowed: impl Fn(PortId) -> bool,
    ) -> Option<PortId> {
        let bounds = self.bounds(space);
        (bounds.min..=bounds.max).find(|id| !busy.contains(&(space, *id)) && allowed(*id))
    }

    fn lowest_archived(
        space: AddressSpace,
        archived_only: &BTreeSet<(AddressSpace, PortId)>,
        allowed: impl Fn(PortId) -> bool,
    ) -> Option<PortId> {
        archived_only
            .range((space, PortId::MIN)..=(space, PortId::MAX))
            .map(|(_, id)| *id)
            .find(|id| allowed(*id))
    }
}
