//! Bounded concurrent per-node exchanges
//!
//! Every node gets its own task; a semaphore caps how many talk to the bus at
//! once. Results come back keyed by node and sorted by node ID, so callers
//! never depend on completion order.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::port::NodeId;

pub(crate) async fn for_each_node<I, F, Fut, T>(nodes: I, limit: usize, f: F) -> Vec<(NodeId, T)>
where
    I: IntoIterator<Item = NodeId>,
    F: Fn(NodeId) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    // Semaphore for limiting concurrent peer exchanges
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks: JoinSet<(NodeId, T)> = JoinSet::new();

    for node in nodes {
        let semaphore = Arc::clone(&semaphore);
        let exchange = f(node);
        tasks.spawn(async move {
            // Backpressure; the semaphore is never closed
            let _permit = semaphore.acquire().await.ok();
            (node, exchange.await)
        });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "Peer exchange task failed"),
        }
    }

    results.sort_by_key(|(node, _)| *node);
    results
}
