//! Fan-out of one call per node channel, fan-in of every outcome.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::NodeChannel;
use crate::error::NodeError;
use crate::types::NodeIndex;

/// Spawns `call` once per channel and waits until every call has finished.
/// Outcomes are returned in completion order. A call whose task died without
/// reporting is recorded as a transport failure of its node.
pub(crate) async fn fan_out<T, F, Fut>(
    channels: &[Arc<dyn NodeChannel>],
    call: F,
) -> Vec<(NodeIndex, Result<T, NodeError>)>
where
    T: Send + 'static,
    F: Fn(Arc<dyn NodeChannel>) -> Fut,
    Fut: Future<Output = Result<T, NodeError>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    for channel in channels {
        let node = channel.node();
        let task = call(Arc::clone(channel));
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            let _ = tx.send((node, outcome));
        });
    }
    drop(tx);

    let mut completed = Vec::with_capacity(channels.len());
    while let Some(done) = rx.recv().await {
        completed.push(done);
    }

    for channel in channels {
        let node = channel.node();
        if !completed.iter().any(|(n, _)| *n == node) {
            completed.push((node, Err(NodeError::Transport("node call aborted".into()))));
        }
    }
    completed
}

/// Reduces fan-in outcomes to full success or the first error observed.
pub(crate) fn all_or_first_error<T>(
    completed: Vec<(NodeIndex, Result<T, NodeError>)>,
) -> Result<Vec<(NodeIndex, T)>, (NodeIndex, NodeError)> {
    let mut successes = Vec::with_capacity(completed.len());
    let mut first_error = None;
    for (node, outcome) in completed {
        match outcome {
            Ok(value) => successes.push((node, value)),
            Err(e) => {
                tracing::warn!(node = node.0, error = %e, "node call failed");
                if first_error.is_none() {
                    first_error = Some((node, e));
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(successes),
    }
}
