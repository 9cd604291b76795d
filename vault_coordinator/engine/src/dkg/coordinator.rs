use std::sync::Arc;

use crate::channel::{ensure_channels_match, NodeChannel};
use crate::error::{CoordinatorError, Result};
use crate::fanout::{all_or_first_error, fan_out};
use crate::session::SessionDescriptor;
use crate::types::{MasterKeyHandle, NodeIndex};

/// Parameters shared verbatim by every node of one key generation run.
#[derive(Debug, Clone)]
pub struct KeyGenParams {
    /// Quorum size: any `threshold` participants can sign together.
    pub threshold: u32,
    pub curve: String,
    pub key_label: String,
}

impl KeyGenParams {
    pub fn new(threshold: u32, curve: impl Into<String>) -> Self {
        KeyGenParams {
            threshold,
            curve: curve.into(),
            key_label: String::new(),
        }
    }

    pub fn with_label(mut self, key_label: impl Into<String>) -> Self {
        self.key_label = key_label.into();
        self
    }
}

/// Runs distributed key generation on all `channels` concurrently and returns
/// the key id every node agreed on.
///
/// Any node failure fails the run; the ids returned by the other nodes are
/// discarded. Diverging ids fail with [`CoordinatorError::KeyConsistency`].
pub async fn generate_key(
    channels: &[Arc<dyn NodeChannel>],
    session: &SessionDescriptor,
    params: &KeyGenParams,
) -> Result<MasterKeyHandle> {
    ensure_channels_match(channels, session)?;
    let participants = session.participants().len();
    if params.threshold == 0 || params.threshold as usize > participants {
        return Err(CoordinatorError::InvalidParticipantSet(format!(
            "threshold {} outside 1..={participants}",
            params.threshold
        )));
    }

    tracing::info!(
        session_id = session.session_id(),
        threshold = params.threshold,
        curve = %params.curve,
        nodes = participants,
        "starting key generation"
    );

    let session = Arc::new(session.clone());
    let params = Arc::new(params.clone());
    let completed = fan_out(channels, |channel| {
        let session = Arc::clone(&session);
        let params = Arc::clone(&params);
        async move {
            channel
                .generate_key(&session, params.threshold, &params.curve, &params.key_label)
                .await
        }
    })
    .await;

    let key_ids = all_or_first_error(completed)
        .map_err(|(node, source)| CoordinatorError::KeyGeneration { node, source })?;

    let key = agreed_key_id(key_ids)?;
    tracing::info!(session_id = session.session_id(), key_id = %key, "key generation complete");
    Ok(key)
}

/// All nodes must report the same id, byte for byte.
pub fn agreed_key_id(mut key_ids: Vec<(NodeIndex, MasterKeyHandle)>) -> Result<MasterKeyHandle> {
    key_ids.sort_by_key(|(node, _)| *node);
    let mut key_ids = key_ids.into_iter();
    let (_, expected) = key_ids.next().ok_or_else(|| {
        CoordinatorError::InvalidParticipantSet("no key ids to compare".into())
    })?;

    for (node, found) in key_ids {
        if found.as_str().as_bytes() != expected.as_str().as_bytes() {
            tracing::error!(node = node.0, %expected, %found, "nodes diverged on key id");
            return Err(CoordinatorError::KeyConsistency {
                node,
                expected,
                found,
            });
        }
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn agreeing_ids_yield_the_key() {
        let ids = (0..3)
            .map(|i| (NodeIndex(i), MasterKeyHandle::new("abc")))
            .collect();
        assert_eq!(agreed_key_id(ids).unwrap(), MasterKeyHandle::new("abc"));
    }

    #[test]
    fn diverging_id_is_reported_against_the_lowest_node() {
        let ids = vec![
            (NodeIndex(2), MasterKeyHandle::new("abc")),
            (NodeIndex(1), MasterKeyHandle::new("abd")),
            (NodeIndex(0), MasterKeyHandle::new("abc")),
        ];
        assert_matches!(
            agreed_key_id(ids),
            Err(CoordinatorError::KeyConsistency { node: NodeIndex(1), .. })
        );
    }
}
