//! Applier - write planned IDs back to peers and verify them
//!
//! Nodes are handled concurrently (bounded by the fan-out limit); writes to
//! one node go out one at a time, each followed by a read-back. Once a node
//! stops answering, its remaining writes are deferred instead of being
//! attempted against a silent peer.
//!
//! When every write to a node commits, the node is stamped with the network
//! PnP cookie and, if anything changed, asked to persist and restart so the
//! new IDs take effect.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AllocatorConfig;
use crate::errors::PnpError;
use crate::fanout::for_each_node;
use crate::inventory::CookieState;
use crate::planner::Plan;
use crate::port::{GroupKey, NodeId, PortId, PortRequirement, PortRole};
use crate::register::{NodeCommand, RegisterClient, Value, PNP_COOKIE_REGISTER};

/// Result of one register write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed,
    Rejected(String),
    Unreachable,
}

/// One register to rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub node: NodeId,
    pub role: PortRole,
    pub name: String,
    pub key: GroupKey,
    pub register: String,
    pub port_id: PortId,
    pub previous: Option<PortId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: WriteTarget,
    pub outcome: ApplyOutcome,
}

#[derive(Clone)]
pub struct Applier {
    client: RegisterClient,
    fan_out: usize,
    restart_after_apply: bool,
    prefix: String,
}

impl Applier {
    pub fn new(client: RegisterClient, config: &AllocatorConfig) -> Self {
        Applier {
            client,
            fan_out: config.fan_out,
            restart_after_apply: config.restart_after_apply,
            prefix: config.register_prefix.clone(),
        }
    }

    /// Writable ports whose register differs from their group's planned ID
    pub fn targets(&self, plan: &Plan, requirements: &[PortRequirement]) -> Vec<WriteTarget> {
        let mut targets: Vec<WriteTarget> = requirements
            .iter()
            .filter(|req| req.writable)
            .filter_map(|req| {
                let key = req.key();
                let assignment = plan.get(&key)?;
                if req.current == Some(assignment.port_id) {
                    return None;
                }
                Some(WriteTarget {
                    node: req.node,
                    role: req.role,
                    name: req.name.clone(),
                    register: req.id_register(&self.prefix),
                    port_id: assignment.port_id,
                    previous: req.current,
                    key,
                })
            })
            .collect();

        targets.sort_by(|a, b| (a.node, a.role, &a.name).cmp(&(b.node, b.role, &b.name)));
        targets
    }

    /// Apply every target; outcomes come back ordered by node
    pub async fn apply(
        &self,
        targets: Vec<WriteTarget>,
        cookies: &BTreeMap<NodeId, CookieState>,
        expected_cookie: &str,
    ) -> Vec<TargetOutcome> {
        let mut per_node: BTreeMap<NodeId, Vec<WriteTarget>> = BTreeMap::new();
        for target in targets {
            per_node.entry(target.node).or_default().push(target);
        }

        let nodes: Vec<NodeId> = per_node.keys().copied().collect();
        let jobs: Arc<BTreeMap<NodeId, (Vec<WriteTarget>, CookieState)>> = Arc::new(
            per_node
                .into_iter()
                .map(|(node, targets)| {
                    let cookie = cookies
                        .get(&node)
                        .cloned()
                        .unwrap_or_else(|| CookieState::Pending(String::new()));
                    (node, (targets, cookie))
                })
                .collect(),
        );

        let applier = self.clone();
        let expected = expected_cookie.to_string();
        let results = for_each_node(nodes, self.fan_out, move |node| {
            let applier = applier.clone();
            let expected = expected.clone();
            let job = jobs.get(&node).cloned();
            async move {
                match job {
                    Some((targets, cookie)) => {
                        applier.apply_node(node, targets, cookie, &expected).await
                    }
                    None => Vec::new(),
                }
            }
        })
        .await;

        results.into_iter().flat_map(|(_, outcomes)| outcomes).collect()
    }

    async fn apply_node(
        &self,
        node: NodeId,
        targets: Vec<WriteTarget>,
        cookie: CookieState,
        expected_cookie: &str,
    ) -> Vec<TargetOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        let mut pending = targets.into_iter();

        while let Some(target) = pending.next() {
            let outcome = self.write_verified(&target).await;
            let silent = outcome == ApplyOutcome::Unreachable;
            outcomes.push(TargetOutcome { target, outcome });

            if silent {
                for target in pending.by_ref() {
                    outcomes.push(TargetOutcome {
                        target,
                        outcome: ApplyOutcome::Unreachable,
                    });
                }
                warn!(node = %node, deferred = outcomes.len(), "Node went silent, writes deferred");
                break;
            }
        }

        let all_committed = outcomes
            .iter()
            .all(|o| o.outcome == ApplyOutcome::Committed);
        if all_committed && !outcomes.is_empty() {
            self.finish_node(node, &cookie, expected_cookie).await;
        }
        outcomes
    }

    async fn write_verified(&self, target: &WriteTarget) -> ApplyOutcome {
        let node = target.node;
        let register = target.register.as_str();

        let response = match self
            .client
            .write(node, register, Value::natural16(target.port_id))
            .await
        {
            Ok(response) => response,
            Err(PnpError::Unreachable { .. }) => return ApplyOutcome::Unreachable,
            Err(e) => return self.rejected(target, e.to_string()),
        };
        if response.is_empty() {
            return self.rejected(target, "register does not exist".to_string());
        }

        let readback = match self.client.read(node, register).await {
            Ok(value) => value,
            Err(PnpError::Unreachable { .. }) => return ApplyOutcome::Unreachable,
            Err(e) => return self.rejected(target, e.to_string()),
        };

        if readback.as_integer() == Some(i64::from(target.port_id)) {
            info!(
                node = %node,
                register,
                port_id = target.port_id,
                previous = ?target.previous,
                "Port ID committed"
            );
            ApplyOutcome::Committed
        } else {
            self.rejected(target, format!("node kept {}", readback))
        }
    }

    fn rejected(&self, target: &WriteTarget, reason: String) -> ApplyOutcome {
        let err = PnpError::WriteRejected {
            node: target.node,
            register: target.register.clone(),
            reason: reason.clone(),
        };
        error!(group = %target.key, port_id = target.port_id, error = %err, "Write rejected");
        ApplyOutcome::Rejected(reason)
    }

    /// Cookie stamp and restart after a fully committed node
    async fn finish_node(&self, node: NodeId, cookie: &CookieState, expected: &str) {
        if *cookie != CookieState::Configured {
            match self
                .client
                .write(node, PNP_COOKIE_REGISTER, Value::string(expected))
                .await
            {
                Ok(_) => info!(node = %node, cookie = expected, "PnP cookie written"),
                Err(e) => warn!(node = %node, error = %e, "Failed to write PnP cookie"),
            }
        }

        if !self.restart_after_apply {
            return;
        }

        for command in [NodeCommand::StorePersistentStates, NodeCommand::Restart] {
            match self.client.command(node, command).await {
                Ok(status) => info!(node = %node, command = ?command, status = ?status, "Node command sent"),
                Err(e) => {
                    warn!(node = %node, command = ?command, error = %e, "Node command failed");
                    return;
                }
            }
        }
    }
}
