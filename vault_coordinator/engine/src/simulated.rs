//! In-memory signing nodes for tests and demos.
//!
//! The network deals a Shamir-shared secp256k1 key per key generation session:
//! a polynomial of degree `threshold - 1` seeded from the network seed and the
//! session id, with node `i` holding `f(i + 1)`. Child keys are additive tweaks
//! of the master key, and each node answers a signing request with
//! `k^-1 (z + r * y_i)` for a nonce `k` derived from the session. Nothing here
//! is secure; the network sees every share.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use k256::elliptic_curve::bigint::U256;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::pkcs8::EncodePublicKey;
use k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::channel::NodeChannel;
use crate::config::SUPPORTED_CURVE;
use crate::error::NodeError;
use crate::mpc::aggregate::{nonce_scalar, PartialSignatureShare};
use crate::session::SessionDescriptor;
use crate::types::{DerivationPath, MasterKeyHandle, MessageDigest, NodeIndex, PartialSignature};

/// Misbehaviour injected into one simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Key generation fails with an internal error.
    FailKeyGen,
    /// Key generation succeeds but reports a key id no other node has.
    DivergentKeyId,
    /// Signing fails with an internal error.
    FailSign,
    /// Signing returns a well-formed partial with a wrong share.
    CorruptPartial,
}

struct SimulatedKey {
    master: ProjectivePoint,
    shares: BTreeMap<NodeIndex, Zeroizing<[u8; 32]>>,
}

/// Shared state of a set of simulated nodes.
pub struct SimulatedNetwork {
    seed: Zeroizing<[u8; 32]>,
    node_count: u32,
    keys: RwLock<HashMap<String, SimulatedKey>>,
}

impl SimulatedNetwork {
    /// Deterministic network: the same seed deals the same keys and signatures.
    pub fn new(seed: [u8; 32], node_count: u32) -> Arc<Self> {
        Arc::new(SimulatedNetwork {
            seed: Zeroizing::new(seed),
            node_count,
            keys: RwLock::new(HashMap::new()),
        })
    }

    pub fn random(node_count: u32) -> Arc<Self> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::new(seed, node_count)
    }

    pub fn node(self: &Arc<Self>, index: NodeIndex) -> SimulatedNode {
        SimulatedNode {
            index,
            network: Arc::clone(self),
            fault: None,
        }
    }

    /// One well-behaved node per index.
    pub fn nodes(self: &Arc<Self>) -> Vec<Arc<dyn NodeChannel>> {
        self.nodes_with_faults(&[])
    }

    pub fn nodes_with_faults(self: &Arc<Self>, faults: &[(NodeIndex, Fault)]) -> Vec<Arc<dyn NodeChannel>> {
        (0..self.node_count)
            .map(|i| {
                let index = NodeIndex(i);
                let mut node = self.node(index);
                if let Some((_, fault)) = faults.iter().find(|(n, _)| *n == index) {
                    node = node.with_fault(*fault);
                }
                Arc::new(node) as Arc<dyn NodeChannel>
            })
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().map(|keys| keys.len()).unwrap_or_default()
    }

    fn master_key(&self, key: &MasterKeyHandle) -> Result<ProjectivePoint, NodeError> {
        let keys = self.keys.read().map_err(|_| internal("key store lock poisoned"))?;
        keys.get(key.as_str())
            .map(|k| k.master)
            .ok_or_else(|| NodeError::UnknownKey(key.to_string()))
    }

    fn share(&self, key: &MasterKeyHandle, node: NodeIndex) -> Result<Scalar, NodeError> {
        let keys = self.keys.read().map_err(|_| internal("key store lock poisoned"))?;
        let bytes = keys
            .get(key.as_str())
            .and_then(|k| k.shares.get(&node))
            .ok_or_else(|| NodeError::UnknownKey(format!("{key} has no share on node {node}")))?;
        Option::from(Scalar::from_repr(FieldBytes::from(**bytes)))
            .ok_or_else(|| internal("stored share is corrupt"))
    }
}

/// One node of a [`SimulatedNetwork`].
pub struct SimulatedNode {
    index: NodeIndex,
    network: Arc<SimulatedNetwork>,
    fault: Option<Fault>,
}

impl SimulatedNode {
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn ensure_participant(&self, session: &SessionDescriptor) -> Result<(), NodeError> {
        if !session.participants().contains(&self.index) {
            return Err(NodeError::Rejected(format!(
                "node {} is not a participant of session {}",
                self.index,
                session.session_id()
            )));
        }
        if session.public_key(self.index).is_none() {
            return Err(NodeError::Rejected("session has no encryption key for this node".into()));
        }
        Ok(())
    }
}

fn internal(message: &str) -> NodeError {
    NodeError::Status {
        code: tonic::Code::Internal,
        message: message.to_string(),
    }
}

/// SHA-256 over length-prefixed domain and parts.
fn tagged_hash(domain: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in std::iter::once(domain.as_bytes()).chain(parts.iter().copied()) {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hash_to_scalar(domain: &str, parts: &[&[u8]]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(tagged_hash(domain, parts)))
}

fn compressed(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Additive tweak of the child key at `path`; zero for the master key itself.
fn derivation_tweak(master: &ProjectivePoint, path: &DerivationPath) -> Result<Scalar, NodeError> {
    if let Some(c) = path.as_slice().iter().find(|c| **c >= DerivationPath::HARDENED) {
        return Err(NodeError::Rejected(format!(
            "hardened component {c} cannot be derived from a shared key"
        )));
    }
    if path.is_empty() {
        return Ok(Scalar::ZERO);
    }
    Ok(hash_to_scalar(
        "vault-sim/derive",
        &[&compressed(master), &path.to_be_bytes()],
    ))
}

fn to_public_key(point: ProjectivePoint) -> Result<PublicKey, NodeError> {
    PublicKey::from_affine(point.to_affine()).map_err(|_| internal("derived key is the identity"))
}

#[tonic::async_trait]
impl NodeChannel for SimulatedNode {
    fn node(&self) -> NodeIndex {
        self.index
    }

    async fn generate_key(
        &self,
        session: &SessionDescriptor,
        threshold: u32,
        curve: &str,
        _key_label: &str,
    ) -> Result<MasterKeyHandle, NodeError> {
        if self.fault == Some(Fault::FailKeyGen) {
            return Err(internal("injected key generation failure"));
        }
        if curve != SUPPORTED_CURVE {
            return Err(NodeError::Rejected(format!("unsupported curve '{curve}'")));
        }
        self.ensure_participant(session)?;
        if threshold == 0 || threshold as usize > session.participants().len() {
            return Err(NodeError::Rejected(format!(
                "threshold {threshold} does not fit {} participants",
                session.participants().len()
            )));
        }

        let seed = self.network.seed.as_slice();
        let sid = session.session_id().as_bytes();
        let coefficients: Vec<Scalar> = (0..threshold)
            .map(|j| hash_to_scalar("vault-sim/keygen", &[seed, sid, &j.to_be_bytes()]))
            .collect();
        if bool::from(coefficients[0].is_zero()) {
            return Err(internal("degenerate key"));
        }

        let x = Scalar::from(u64::from(self.index.0) + 1);
        let share = coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, a| acc * x + a);
        let key_id = hex::encode(&tagged_hash("vault-sim/key-id", &[seed, sid])[..16]);

        {
            let mut keys = self
                .network
                .keys
                .write()
                .map_err(|_| internal("key store lock poisoned"))?;
            let entry = keys.entry(key_id.clone()).or_insert_with(|| SimulatedKey {
                master: ProjectivePoint::GENERATOR * coefficients[0],
                shares: BTreeMap::new(),
            });
            entry
                .shares
                .insert(self.index, Zeroizing::new(share.to_bytes().into()));
        }
        tracing::debug!(node = self.index.0, key_id = %key_id, "simulated key share stored");

        if self.fault == Some(Fault::DivergentKeyId) {
            return Ok(MasterKeyHandle::new(format!("{key_id}-{}", self.index)));
        }
        Ok(MasterKeyHandle::new(key_id))
    }

    async fn public_key(
        &self,
        key: &MasterKeyHandle,
        path: &DerivationPath,
    ) -> Result<Vec<u8>, NodeError> {
        let master = self.network.master_key(key)?;
        let tweak = derivation_tweak(&master, path)?;
        let derived = to_public_key(master + ProjectivePoint::GENERATOR * tweak)?;
        derived
            .to_public_key_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|e| internal(&format!("cannot encode public key: {e}")))
    }

    async fn sign(
        &self,
        session: &SessionDescriptor,
        key: &MasterKeyHandle,
        path: &DerivationPath,
        digest: &MessageDigest,
    ) -> Result<PartialSignature, NodeError> {
        if self.fault == Some(Fault::FailSign) {
            return Err(internal("injected signing failure"));
        }
        self.ensure_participant(session)?;

        let master = self.network.master_key(key)?;
        let share = self.network.share(key, self.index)?;
        let tweak = derivation_tweak(&master, path)?;
        let public_key = to_public_key(master + ProjectivePoint::GENERATOR * tweak)?;

        let nonce = hash_to_scalar(
            "vault-sim/nonce",
            &[
                self.network.seed.as_slice(),
                session.session_id().as_bytes(),
                key.as_str().as_bytes(),
                &path.to_be_bytes(),
                digest.as_bytes(),
            ],
        );
        let nonce_inverse =
            Option::<Scalar>::from(nonce.invert()).ok_or_else(|| internal("degenerate nonce"))?;
        let nonce_point = (ProjectivePoint::GENERATOR * nonce).to_affine();
        let r = nonce_scalar(&nonce_point);
        let z = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*digest.as_bytes()));

        let mut partial = nonce_inverse * (z + r * (share + tweak));
        if self.fault == Some(Fault::CorruptPartial) {
            partial += Scalar::ONE;
        }

        tracing::debug!(node = self.index.0, key_id = %key, "simulated partial signature");
        Ok(PartialSignatureShare {
            player: self.index,
            nonce_point,
            public_key,
            share: partial,
        }
        .encode())
    }
}
