/**
 * resolver.rs
 * Conflict Resolver - one ID, one group, per space
 *
 * Claims on a (space, ID) pair come from three places: members configured
 * with it on the bus, active persisted records, and the fresh plan. When more
 * than one group claims the same pair, exactly one keeps it:
 * - a group pinned by a member the allocator may not write beats any other
 * - then, under `oldest-commit`, the group whose record holds the ID with the
 *   lowest version; groups without such a record come after
 * - then the group with the numerically lowest member node
 *
 * Losers have their writable members holding the ID evicted (treated as
 * unconfigured for re-planning), their record for that ID revoked, and the ID
 * barred for them when re-planned. Two pinned groups on one ID cannot be
 * fixed from here and are reported.
 *
 * A group whose members disagree among themselves is realigned on its
 * record's ID, or the lowest ID a member holds when it has none.
 */

use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

use crate::config::{AllocatorConfig, CollisionPolicy};
use crate::errors::PnpError;
use crate::planner::Plan;
use crate::port::{AddressSpace, GroupKey, NodeId, PortId, PortRequirement, PortSlot};
use crate::store::AllocationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConflictKind {
    /// Two groups configured on the same ID
    SharedId,
    /// A persisted ID found in use by a different group
    StaleCommit,
    /// Members of one group configured with different IDs
    Divergent,
}

/// One detected conflict and how it was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub space: AddressSpace,
    pub port_id: PortId,
    /// Group keeping the ID; `None` for divergent groups
    pub kept: Option<GroupKey>,
    pub evicted: GroupKey,
    /// Nodes whose registers will be rewritten
    pub nodes: BTreeSet<NodeId>,
}

impl Conflict {
    fn describe(&self) -> String {
        match &self.kept {
            Some(kept) => format!(
                "{} ID {} kept by {}, {} evicted",
                self.space, self.port_id, kept, self.evicted
            ),
            None => format!(
                "{} members disagree, realigning on {} ID {}",
                self.evicted, self.space, self.port_id
            ),
        }
    }
}

/// Outcome of a resolution pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub conflicts: Vec<Conflict>,
    /// Ports to be treated as unconfigured when re-planning
    pub evicted: BTreeSet<PortSlot>,
    /// Groups whose persisted ID must not be reused
    pub revoked: BTreeSet<GroupKey>,
    /// Contested IDs held by groups that cannot be rewritten
    pub irreconcilable: Vec<(AddressSpace, PortId)>,
    /// IDs each losing group may not take when re-planned
    pub barred: BTreeMap<GroupKey, BTreeSet<PortId>>,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.irreconcilable.is_empty()
    }

    /// Whether the plan the resolution was run against must be redone
    pub fn needs_replan(&self) -> bool {
        !self.evicted.is_empty() || !self.revoked.is_empty() || !self.barred.is_empty()
    }

    /// Requirements with every evicted port reset to unconfigured
    pub fn apply(&self, requirements: &[PortRequirement]) -> Vec<PortRequirement> {
        requirements
            .iter()
            .map(|req| {
                let mut req = req.clone();
                if self.evicted.contains(&req.slot()) {
                    req.current = None;
                }
                req
            })
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Claim {
    live: bool,
    recorded: bool,
    planned: bool,
}

pub struct ConflictResolver {
    policy: CollisionPolicy,
}

impl ConflictResolver {
    pub fn new(policy: CollisionPolicy) -> Self {
        ConflictResolver { policy }
    }

    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self::new(config.collision_policy)
    }

    pub fn resolve(
        &self,
        requirements: &[PortRequirement],
        committed: &[AllocationRecord],
        plan: &Plan,
    ) -> Resolution {
        let mut members: BTreeMap<GroupKey, Vec<&PortRequirement>> = BTreeMap::new();
        for req in requirements {
            members.entry(req.key()).or_default().push(req);
        }
        let record_of = |key: &GroupKey| committed.iter().find(|r| r.matches(key));

        let mut contests: BTreeMap<(AddressSpace, PortId), BTreeMap<GroupKey, Claim>> =
            BTreeMap::new();
        for req in requirements {
            if let Some(id) = req.current {
                let claim = contests
                    .entry((req.role.space(), id))
                    .or_default()
                    .entry(req.key())
                    .or_default();
                claim.live = true;
            }
        }
        for record in committed.iter().filter(|r| r.is_active()) {
            let claim = contests
                .entry((record.space, record.port_id))
                .or_default()
                .entry(record.key())
                .or_default();
            claim.recorded = true;
        }
        for assignment in &plan.assignments {
            let claim = contests
                .entry((assignment.key.space, assignment.port_id))
                .or_default()
                .entry(assignment.key.clone())
                .or_default();
            claim.planned = true;
        }

        let mut resolution = Resolution::default();
        let no_members: Vec<&PortRequirement> = Vec::new();

        for ((space, id), claims) in contests.into_iter().filter(|(_, c)| c.len() > 1) {
            let mut ranked: Vec<(GroupKey, Claim)> = claims.into_iter().collect();
            ranked.sort_by_cached_key(|(key, _)| {
                let group = members.get(key).unwrap_or(&no_members);
                (self.rank(group, record_of(key), id), key.clone())
            });

            let mut contenders = ranked.into_iter();
            let Some((winner, winner_claim)) = contenders.next() else {
                continue;
            };

            for (loser, loser_claim) in contenders {
                let group = members.get(&loser).unwrap_or(&no_members);
                let stale = (winner_claim.recorded && !winner_claim.live && loser_claim.live)
                    || (loser_claim.recorded && !loser_claim.live && winner_claim.live);
                let kind = if stale {
                    ConflictKind::StaleCommit
                } else {
                    ConflictKind::SharedId
                };

                if Self::is_pinned(group, id) {
                    error!(
                        space = %space,
                        port_id = id,
                        kept = %winner,
                        contender = %loser,
                        "Irreconcilable collision: both groups are pinned by nodes outside plug-and-play control"
                    );
                    resolution.irreconcilable.push((space, id));
                    continue;
                }

                let mut nodes = BTreeSet::new();
                for member in group.iter().filter(|m| m.current == Some(id) && m.writable) {
                    resolution.evicted.insert(member.slot());
                    nodes.insert(member.node);
                }
                if record_of(&loser).is_some_and(|r| r.port_id == id) {
                    resolution.revoked.insert(loser.clone());
                }
                resolution.barred.entry(loser.clone()).or_default().insert(id);

                let conflict = Conflict {
                    kind,
                    space,
                    port_id: id,
                    kept: Some(winner.clone()),
                    evicted: loser,
                    nodes,
                };
                warn!(
                    kind = ?conflict.kind,
                    nodes = ?conflict.nodes,
                    planned = loser_claim.planned,
                    error = %PnpError::Collision(conflict.describe()),
                    "Collision resolved"
                );
                resolution.conflicts.push(conflict);
            }
        }

        for (key, group) in &members {
            self.realign(key, group, record_of(key), &mut resolution);
        }

        if !resolution.is_clean() {
            info!(
                conflicts = resolution.conflicts.len(),
                evicted = resolution.evicted.len(),
                revoked = resolution.revoked.len(),
                irreconcilable = resolution.irreconcilable.len(),
                "Conflict resolution complete"
            );
        }
        resolution
    }

    /// Lower sorts first, lowest wins
    fn rank(&self, group: &[&PortRequirement], record: Option<&AllocationRecord>, id: PortId) -> (u8, u8, u64, NodeId) {
        let pinned = u8::from(!Self::is_pinned(group, id));
        let lowest_node = group
            .iter()
            .map(|m| m.node)
            .min()
            .unwrap_or(NodeId(u16::MAX));

        match self.policy {
            CollisionPolicy::OldestCommit => {
                let version = record.filter(|r| r.port_id == id).map(|r| r.version);
                (pinned, u8::from(version.is_none()), version.unwrap_or(0), lowest_node)
            }
            CollisionPolicy::LowestNode => (pinned, 0, 0, lowest_node),
        }
    }

    fn is_pinned(group: &[&PortRequirement], id: PortId) -> bool {
        group
            .iter()
            .any(|m| m.current == Some(id) && !m.writable)
    }

    fn realign(
        &self,
        key: &GroupKey,
        group: &[&PortRequirement],
        record: Option<&AllocationRecord>,
        resolution: &mut Resolution,
    ) {
        let standing: Vec<&&PortRequirement> = group
            .iter()
            .filter(|m| m.current.is_some() && !resolution.evicted.contains(&m.slot()))
            .collect();

        let canonical = record
            .filter(|_| !resolution.revoked.contains(key))
            .map(|r| r.port_id)
            .or_else(|| standing.iter().filter_map(|m| m.current).min());
        let Some(canonical) = canonical else {
            return;
        };

        let mut nodes = BTreeSet::new();
        for member in standing.iter().filter(|m| m.current != Some(canonical)) {
            if member.writable {
                resolution.evicted.insert(member.slot());
                nodes.insert(member.node);
            } else {
                warn!(
                    group = %key,
                    node = %member.node,
                    held = ?member.current,
                    port_id = canonical,
                    "Member outside plug-and-play control disagrees with its group"
                );
            }
        }

        if nodes.is_empty() {
            return;
        }

        let conflict = Conflict {
            kind: ConflictKind::Divergent,
            space: key.space,
            port_id: canonical,
            kept: None,
            evicted: key.clone(),
            nodes,
        };
        warn!(
            kind = ?conflict.kind,
            nodes = ?conflict.nodes,
            error = %PnpError::Collision(conflict.describe()),
            "Collision resolved"
        );
        resolution.conflicts.push(conflict);
    }
}
