/**
 * engine.rs
 * Allocation cycle state machine
 *
 * Idle -> Discovering -> Collecting -> Planning -> Resolving -> Applying
 *      -> Verifying -> Idle
 *
 * A silent peer or a refused write narrows the cycle, it never aborts it.
 * An exhausted address space stops new allocations in that space only.
 * The store is flushed once at the end of every cycle; a flush failure is
 * the one error that ends `run`.
 */

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::applier::{Applier, ApplyOutcome, TargetOutcome};
use crate::config::AllocatorConfig;
use crate::errors::{PnpError, Result};
use crate::inventory::{CookieState, PeerInventory};
use crate::planner::Planner;
use crate::port::{AddressSpace, AssignmentSource, GroupKey, NodeId};
use crate::register::{RegisterBus, RegisterClient};
use crate::resolver::ConflictResolver;
use crate::store::{AllocationRecord, AllocationStore};

/// Longest stretch the run loop sleeps without checking for shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleState {
    Idle,
    Discovering,
    Collecting,
    Planning,
    Resolving,
    Applying,
    Verifying,
}

/// Change on the bus that warrants an early cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    NodeOnline(NodeId),
    NodeOffline(NodeId),
}

/// Per-cycle summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle: u64,
    pub peers: usize,
    /// Groups that received a fresh or reclaimed ID this cycle
    pub newly_assigned: usize,
    /// Groups whose existing ID was written to new members
    pub reused: usize,
    pub committed: usize,
    pub rejected: usize,
    pub unreachable: BTreeSet<NodeId>,
    /// Writes skipped while a rejection backs off
    pub deferred: usize,
    pub conflicts: usize,
    pub malformed: usize,
    pub exhausted: BTreeSet<AddressSpace>,
    #[serde(skip)]
    pub outcomes: Vec<TargetOutcome>,
}

impl CycleReport {
    pub fn outcome(&self, node: NodeId, name: &str) -> Option<&ApplyOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.target.node == node && o.target.name == name)
            .map(|o| &o.outcome)
    }
}

/// The allocation engine: owns its collaborators and the store
pub struct Allocator {
    config: AllocatorConfig,
    inventory: PeerInventory,
    planner: Planner,
    resolver: ConflictResolver,
    applier: Applier,
    store: AllocationStore,
    expected_cookie: String,
    state: CycleState,
    known: BTreeSet<NodeId>,
}

impl Allocator {
    pub fn new(config: AllocatorConfig, bus: Arc<dyn RegisterBus>, mut store: AllocationStore) -> Result<Self> {
        config.validate()?;

        let expected_cookie = store.ensure_cookie(config.pnp_cookie.as_deref());
        store.flush()?;

        let client = RegisterClient::from_config(bus, &config);
        Ok(Allocator {
            inventory: PeerInventory::new(client.clone(), &config, &expected_cookie),
            planner: Planner::from_config(&config),
            resolver: ConflictResolver::from_config(&config),
            applier: Applier::new(client, &config),
            store,
            expected_cookie,
            state: CycleState::Idle,
            known: BTreeSet::new(),
            config,
        })
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn expected_cookie(&self) -> &str {
        &self.expected_cookie
    }

    /// Flush and hand the store back
    pub fn into_store(mut self) -> Result<AllocationStore> {
        self.store.flush()?;
        Ok(self.store)
    }

    /// Operator-facing errors for the spaces a report found exhausted
    pub fn exhaustion_errors(&self, report: &CycleReport) -> Vec<PnpError> {
        report
            .exhausted
            .iter()
            .map(|space| self.planner.exhaustion_error(*space))
            .collect()
    }

    fn transition(&mut self, state: CycleState) {
        debug!(from = ?self.state, to = ?state, "Cycle state");
        self.state = state;
    }

    /// Run one full cycle
    ///
    /// # Errors
    /// Only store failures; everything peer-related is in the report.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let cycle = self.store.cycle() + 1;
        let span = info_span!("allocation_cycle", cycle, cycle_id = %Uuid::new_v4());

        let result = self.execute_cycle(cycle).instrument(span).await;
        self.transition(CycleState::Idle);
        result
    }

    async fn execute_cycle(&mut self, cycle: u64) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        self.transition(CycleState::Discovering);
        let nodes = self.inventory.discover().await;
        for node in nodes.difference(&self.known) {
            info!(node = %node, "Node joined");
        }
        for node in self.known.difference(&nodes) {
            info!(node = %node, "Node left");
        }
        self.known = nodes.clone();

        self.transition(CycleState::Collecting);
        let snapshot = self.inventory.snapshot(&nodes).await;
        report.peers = snapshot.peers.len();
        report.malformed = snapshot.malformed_count();
        report.unreachable = snapshot.unreachable.clone();

        self.transition(CycleState::Planning);
        let requirements = snapshot.requirements();
        let committed: Vec<AllocationRecord> = self.store.records().to_vec();
        let reserved = snapshot.observed_busy();
        let proposal = self
            .planner
            .plan_with_reserved(&requirements, &committed, &reserved);

        self.transition(CycleState::Resolving);
        let resolution = self.resolver.resolve(&requirements, &committed, &proposal);
        report.conflicts = resolution.conflicts.len() + resolution.irreconcilable.len();
        let (requirements, plan) = if !resolution.needs_replan() {
            (requirements, proposal)
        } else {
            let requirements = resolution.apply(&requirements);
            let committed: Vec<AllocationRecord> = committed
                .into_iter()
                .filter(|r| !resolution.revoked.contains(&r.key()))
                .collect();
            let plan = self
                .planner
                .plan_excluding(&requirements, &committed, &reserved, &resolution.barred);
            (requirements, plan)
        };

        report.exhausted = plan.exhausted_spaces();
        for err in self.exhaustion_errors(&report) {
            error!(error = %err, "New allocations halted for this space");
        }

        self.transition(CycleState::Applying);
        let (targets, deferred): (Vec<_>, Vec<_>) = self
            .applier
            .targets(&plan, &requirements)
            .into_iter()
            .partition(|t| !self.store.is_backing_off(&t.key, t.node, cycle));
        for target in &deferred {
            debug!(node = %target.node, group = %target.key, "Write deferred while rejection backs off");
        }
        report.deferred = deferred.len();

        let cookies: BTreeMap<NodeId, CookieState> = snapshot
            .peers
            .iter()
            .map(|(node, peer)| (*node, peer.cookie.clone()))
            .collect();
        let outcomes = self
            .applier
            .apply(targets, &cookies, &self.expected_cookie)
            .await;

        self.transition(CycleState::Verifying);
        let now = Utc::now();

        let mut written: BTreeMap<GroupKey, bool> = BTreeMap::new();
        for outcome in &outcomes {
            let entry = written.entry(outcome.target.key.clone()).or_insert(false);
            *entry |= outcome.outcome == ApplyOutcome::Committed;
        }

        for assignment in &plan.assignments {
            if assignment.source == AssignmentSource::Reclaimed && written.contains_key(&assignment.key) {
                if let Some(old) = self
                    .store
                    .remove_archived_holding(assignment.key.space, assignment.port_id)
                {
                    warn!(
                        group = %assignment.key,
                        previous_owner = %old.key(),
                        port_id = assignment.port_id,
                        "Archived allocation dropped, ID reclaimed"
                    );
                }
            }
            if written.get(&assignment.key).copied().unwrap_or(false) {
                if assignment.source.is_reuse() {
                    report.reused += 1;
                } else {
                    report.newly_assigned += 1;
                }
            }
        }

        for outcome in &outcomes {
            let target = &outcome.target;
            let owner = BTreeSet::from([target.node]);
            match &outcome.outcome {
                ApplyOutcome::Committed => {
                    self.store.upsert(&target.key, target.port_id, &owner, now);
                    self.store.clear_rejection(&target.key, target.node);
                    report.committed += 1;
                }
                ApplyOutcome::Rejected(reason) => {
                    if self.store.get(&target.key).is_none() {
                        self.store.upsert(&target.key, target.port_id, &owner, now);
                    }
                    if let Some(retry) = self.store.mark_rejected(
                        &target.key,
                        target.node,
                        cycle,
                        reason,
                        self.config.reject_backoff_cycles,
                    ) {
                        warn!(
                            node = %target.node,
                            group = %target.key,
                            retry_after_cycle = retry,
                            "Write marked unappliable until backoff expires"
                        );
                    }
                    report.rejected += 1;
                }
                ApplyOutcome::Unreachable => {
                    report.unreachable.insert(target.node);
                }
            }
        }

        let mut owners: BTreeMap<GroupKey, BTreeSet<NodeId>> = BTreeMap::new();
        for req in &requirements {
            owners.entry(req.key()).or_default().insert(req.node);
        }
        for (key, nodes) in &owners {
            self.store.touch(key, nodes, now);
        }
        self.store.archive_stale(now, self.config.archive_after());

        self.store.set_cycle(cycle);
        report.outcomes = outcomes;
        self.store.flush().map_err(|e| {
            error!(error = %e, "Failed to persist allocation cycle");
            e
        })?;

        info!(
            peers = report.peers,
            newly_assigned = report.newly_assigned,
            reused = report.reused,
            committed = report.committed,
            rejected = report.rejected,
            unreachable = report.unreachable.len(),
            deferred = report.deferred,
            conflicts = report.conflicts,
            malformed = report.malformed,
            exhausted = ?report.exhausted,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Repeat cycles until `shutdown` is set
    ///
    /// A topology event cuts the inter-cycle delay short.
    pub async fn run(
        &mut self,
        shutdown: Arc<AtomicBool>,
        mut events: Option<mpsc::Receiver<TopologyEvent>>,
    ) -> Result<()> {
        info!(
            interval_ms = self.config.cycle_interval_ms,
            store = %self.store.path().display(),
            "Allocator started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(_) => {}
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Cycle failed"),
            }
            self.wait_next(&shutdown, &mut events).await;
        }

        self.store.flush()?;
        info!("Shutdown signal received, allocator stopped");
        Ok(())
    }

    async fn wait_next(&self, shutdown: &AtomicBool, events: &mut Option<mpsc::Receiver<TopologyEvent>>) {
        let deadline = Instant::now() + self.config.cycle_interval();

        loop {
            let now = Instant::now();
            if shutdown.load(Ordering::SeqCst) || now >= deadline {
                return;
            }
            let tick = (deadline - now).min(SHUTDOWN_POLL);

            let closed = match events.as_mut() {
                Some(rx) => tokio::select! {
                    _ = tokio::time::sleep(tick) => false,
                    event = rx.recv() => match event {
                        Some(event) => {
                            info!(event = ?event, "Topology change, starting next cycle early");
                            return;
                        }
                        None => true,
                    },
                },
                None => {
                    tokio::time::sleep(tick).await;
                    false
                }
            };

            if closed {
                debug!("Topology event channel closed");
                *events = None;
            }
        }
    }
}
