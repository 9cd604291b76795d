use std::sync::Arc;

use crate::channel::{ensure_channels_match, NodeChannel};
use crate::error::{CoordinatorError, Result};
use crate::fanout::{all_or_first_error, fan_out};
use crate::mpc::aggregate::{finalize_signature, FinalSignature};
use crate::session::SessionDescriptor;
use crate::types::{DerivationPath, MasterKeyHandle, MessageDigest, PartialSignature};

/// Drives one threshold signing run: every participant signs `digest` under the
/// key derived from `key` along `path`, and the partials are aggregated.
///
/// All dispatched calls must succeed. The first failure observed is reported
/// once every call has returned; partials already collected are discarded.
pub async fn sign(
    channels: &[Arc<dyn NodeChannel>],
    session: &SessionDescriptor,
    key: &MasterKeyHandle,
    path: &DerivationPath,
    digest: &MessageDigest,
) -> Result<FinalSignature> {
    ensure_channels_match(channels, session)?;
    tracing::info!(
        session_id = session.session_id(),
        key_id = %key,
        path = %path,
        nodes = channels.len(),
        "starting signing"
    );

    let shared = Arc::new((session.clone(), key.clone(), path.clone(), *digest));
    let completed = fan_out(channels, |channel| {
        let shared = Arc::clone(&shared);
        async move {
            let (session, key, path, digest) = &*shared;
            let partial = channel.sign(session, key, path, digest).await?;
            tracing::debug!(node = channel.node().0, "partial signature received");
            Ok(partial)
        }
    })
    .await;

    let partials: Vec<PartialSignature> = all_or_first_error(completed)
        .map_err(|(node, source)| CoordinatorError::PartialSign { node, source })?
        .into_iter()
        .map(|(_, partial)| partial)
        .collect();

    if partials.len() != channels.len() {
        return Err(CoordinatorError::Aggregation(format!(
            "collected {} partial signatures from {} nodes",
            partials.len(),
            channels.len()
        )));
    }

    let signature = finalize_signature(digest, &partials)?;
    tracing::info!(
        session_id = session.session_id(),
        recovery_id = signature.recovery_id,
        "signature aggregated"
    );
    Ok(signature)
}
