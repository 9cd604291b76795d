//! Process-level entry point tying the node pool, session construction, key
//! generation, derivation and signing together, with an audit trail.

use std::collections::BTreeMap;

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::config::CoordinatorConfig;
use crate::derive::{self, DerivedPublicKey};
use crate::dkg::{self, KeyGenParams};
use crate::error::{CoordinatorError, Result};
use crate::channel::NodePool;
use crate::mpc::{self, FinalSignature};
use crate::session::{SessionDescriptor, SessionDescriptorBuilder};
use crate::types::{DerivationPath, MasterKeyHandle, MessageDigest, NodeIndex};

pub struct ThresholdCoordinator {
    pool: NodePool,
    sessions: SessionDescriptorBuilder,
    player_keys: BTreeMap<NodeIndex, Vec<u8>>,
    params: KeyGenParams,
    audit: AuditTracker,
}

impl ThresholdCoordinator {
    pub fn new(
        pool: NodePool,
        player_keys: BTreeMap<NodeIndex, Vec<u8>>,
        params: KeyGenParams,
    ) -> Result<Self> {
        if params.threshold == 0 || params.threshold as usize > pool.len() {
            return Err(CoordinatorError::Config(format!(
                "threshold {} does not fit a pool of {} nodes",
                params.threshold,
                pool.len()
            )));
        }
        let sessions = SessionDescriptorBuilder::new(pool.len() as u32);
        Ok(ThresholdCoordinator {
            pool,
            sessions,
            player_keys,
            params,
            audit: AuditTracker::default(),
        })
    }

    pub fn from_config(config: &CoordinatorConfig, pool: NodePool) -> Result<Self> {
        config.validate()?;
        let params = KeyGenParams::new(config.threshold, config.curve.clone())
            .with_label(config.key_label.clone());
        Self::new(pool, config.player_keys(), params)
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn threshold(&self) -> u32 {
        self.params.threshold
    }

    pub fn audit(&self) -> &AuditTracker {
        &self.audit
    }

    /// Fresh session over `participants`.
    pub fn new_session(&self, participants: &[NodeIndex]) -> Result<SessionDescriptor> {
        self.sessions.build(participants, &self.player_keys)
    }

    /// Generates a key on every node of the pool.
    pub async fn generate_key(&self) -> Result<MasterKeyHandle> {
        let session = self.new_session(&self.pool.nodes())?;
        self.generate_key_with(&session).await
    }

    pub async fn generate_key_with(&self, session: &SessionDescriptor) -> Result<MasterKeyHandle> {
        let channels = self.pool.select(session)?;
        let result = dkg::generate_key(&channels, session, &self.params).await;
        self.record(AuditEventType::KeyGen, session.session_id(), &result, |key| {
            format!("generated key {key} with threshold {}", self.params.threshold)
        });
        result
    }

    /// Derived public key as reported by the lowest-indexed node.
    pub async fn public_key(
        &self,
        key: &MasterKeyHandle,
        path: &DerivationPath,
    ) -> Result<DerivedPublicKey> {
        let channel = self
            .pool
            .all()
            .first()
            .ok_or_else(|| CoordinatorError::Config("node pool is empty".into()))?;
        let result = derive::public_key(channel.as_ref(), key, path).await;
        self.record(AuditEventType::Derivation, key.as_str(), &result, |derived| {
            format!("derived {} at {path}", hex::encode(derived.compressed()))
        });
        result
    }

    /// Derived public key, cross-checked across every node.
    pub async fn public_key_agreed(
        &self,
        key: &MasterKeyHandle,
        path: &DerivationPath,
    ) -> Result<DerivedPublicKey> {
        let result = derive::public_key_agreed(self.pool.all(), key, path).await;
        self.record(AuditEventType::Derivation, key.as_str(), &result, |derived| {
            format!("all nodes agree on {} at {path}", hex::encode(derived.compressed()))
        });
        result
    }

    /// Signs with every node of the pool in a fresh session.
    pub async fn sign(
        &self,
        key: &MasterKeyHandle,
        path: &DerivationPath,
        digest: &MessageDigest,
    ) -> Result<FinalSignature> {
        let session = self.new_session(&self.pool.nodes())?;
        self.sign_with(&session, key, path, digest).await
    }

    pub async fn sign_with(
        &self,
        session: &SessionDescriptor,
        key: &MasterKeyHandle,
        path: &DerivationPath,
        digest: &MessageDigest,
    ) -> Result<FinalSignature> {
        if session.participants().len() < self.params.threshold as usize {
            return Err(CoordinatorError::InvalidParticipantSet(format!(
                "{} signers cannot meet threshold {}",
                session.participants().len(),
                self.params.threshold
            )));
        }
        let channels = self.pool.select(session)?;
        let result = mpc::sign(&channels, session, key, path, digest).await;
        if result.is_ok() {
            self.audit.log(AuditRecord::new(
                AuditEventType::Aggregation,
                session.session_id(),
                format!("aggregated {} partial signatures", channels.len()),
            ));
        }
        self.record(AuditEventType::Signing, session.session_id(), &result, |signature| {
            format!("signed {digest} with {key} at {path}, v={}", signature.recovery_id)
        });
        result
    }

    fn record<T>(
        &self,
        event_type: AuditEventType,
        session_id: &str,
        result: &Result<T>,
        describe: impl FnOnce(&T) -> String,
    ) {
        let record = match result {
            Ok(value) => AuditRecord::new(event_type, session_id, describe(value)),
            Err(e) => {
                tracing::error!(session_id, error = %e, "coordination failed");
                let record = AuditRecord::new(AuditEventType::Error, session_id, e.to_string());
                match e.node() {
                    Some(node) => record.with_node(node),
                    None => record,
                }
            }
        };
        self.audit.log(record);
    }
}
