//! Child public keys of a master key, as reported by the nodes.

use std::sync::Arc;

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::DecodePublicKey;
use k256::PublicKey;

use crate::channel::NodeChannel;
use crate::error::{CoordinatorError, Result};
use crate::fanout::fan_out;
use crate::types::{DerivationPath, MasterKeyHandle, NodeIndex};

/// A derived public key in the SubjectPublicKeyInfo DER form the nodes return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPublicKey {
    spki_der: Vec<u8>,
    key: PublicKey,
}

impl DerivedPublicKey {
    pub fn from_spki_der(spki_der: Vec<u8>) -> Result<Self, String> {
        let key = PublicKey::from_public_key_der(&spki_der)
            .map_err(|e| format!("not a secp256k1 public key: {e}"))?;
        Ok(DerivedPublicKey { spki_der, key })
    }

    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key
    }

    /// 33-byte SEC1 point.
    pub fn compressed(&self) -> Vec<u8> {
        self.key.to_encoded_point(true).as_bytes().to_vec()
    }

    /// 65-byte SEC1 point.
    pub fn uncompressed(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }
}

/// Asks one node for the key derived from `key` along `path`.
pub async fn public_key(
    channel: &dyn NodeChannel,
    key: &MasterKeyHandle,
    path: &DerivationPath,
) -> Result<DerivedPublicKey> {
    let node = channel.node();
    tracing::debug!(node = node.0, key_id = %key, path = %path, "requesting derived public key");
    let spki_der = channel
        .public_key(key, path)
        .await
        .map_err(|e| CoordinatorError::Derivation {
            node,
            reason: e.to_string(),
        })?;
    DerivedPublicKey::from_spki_der(spki_der)
        .map_err(|reason| CoordinatorError::Derivation { node, reason })
}

/// Asks every channel concurrently; results are ordered by node.
pub async fn public_keys(
    channels: &[Arc<dyn NodeChannel>],
    key: &MasterKeyHandle,
    path: &DerivationPath,
) -> Result<Vec<(NodeIndex, DerivedPublicKey)>> {
    let request = Arc::new((key.clone(), path.clone()));
    let mut completed = fan_out(channels, |channel| {
        let request = Arc::clone(&request);
        async move {
            let (key, path) = &*request;
            channel.public_key(key, path).await
        }
    })
    .await;
    completed.sort_by_key(|(node, _)| *node);

    completed
        .into_iter()
        .map(|(node, outcome)| {
            let spki_der = outcome.map_err(|e| CoordinatorError::Derivation {
                node,
                reason: e.to_string(),
            })?;
            let derived = DerivedPublicKey::from_spki_der(spki_der)
                .map_err(|reason| CoordinatorError::Derivation { node, reason })?;
            Ok((node, derived))
        })
        .collect()
}

/// Like [`public_keys`], but all nodes must return the identical key.
pub async fn public_key_agreed(
    channels: &[Arc<dyn NodeChannel>],
    key: &MasterKeyHandle,
    path: &DerivationPath,
) -> Result<DerivedPublicKey> {
    let mut keys = public_keys(channels, key, path).await?.into_iter();
    let (_, expected) = keys.next().ok_or_else(|| {
        CoordinatorError::InvalidParticipantSet("no channels to derive from".into())
    })?;
    for (node, found) in keys {
        if found.spki_der() != expected.spki_der() {
            return Err(CoordinatorError::Derivation {
                node,
                reason: format!("node disagrees on the public key for {path}"),
            });
        }
    }
    Ok(expected)
}
