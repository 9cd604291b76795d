//! Authenticated channels to the signing nodes.
//!
//! [`NodeChannel`] is the seam to the opaque MPC engine running on each node.
//! [`ChannelFactory`] builds one pinned, mutually authenticated gRPC channel per
//! configured [`NodeIdentity`]; [`NodePool`] holds the channels for the lifetime of
//! the process and hands out the subset a protocol run needs.

pub mod grpc;
pub mod pinning;
pub mod proto;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::mpsc;

use crate::error::{CoordinatorError, NodeError, Result};
use crate::session::SessionDescriptor;
use crate::types::{DerivationPath, MasterKeyHandle, MessageDigest, NodeIndex, PartialSignature};

pub use grpc::GrpcNodeChannel;

/// Remote capabilities of one signing node.
#[tonic::async_trait]
pub trait NodeChannel: Send + Sync {
    fn node(&self) -> NodeIndex;

    /// Joins a key generation run and returns the node's view of the new key id.
    async fn generate_key(
        &self,
        session: &SessionDescriptor,
        threshold: u32,
        curve: &str,
        key_label: &str,
    ) -> Result<MasterKeyHandle, NodeError>;

    /// DER SubjectPublicKeyInfo of the key derived from `key` along `path`.
    async fn public_key(
        &self,
        key: &MasterKeyHandle,
        path: &DerivationPath,
    ) -> Result<Vec<u8>, NodeError>;

    /// Joins a signing run and returns this node's partial signature.
    async fn sign(
        &self,
        session: &SessionDescriptor,
        key: &MasterKeyHandle,
        path: &DerivationPath,
        digest: &MessageDigest,
    ) -> Result<PartialSignature, NodeError>;
}

/// Where a node lives and which server key it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub index: NodeIndex,
    pub url: String,
    pub server_public_key_pem: String,
}

impl NodeIdentity {
    /// Canonical DER of the pinned server key.
    pub fn pinned_key(&self) -> Result<Vec<u8>> {
        pinning::canonical_public_key_der(&self.server_public_key_pem).map_err(|reason| {
            CoordinatorError::MalformedIdentity {
                node: self.index,
                reason,
            }
        })
    }
}

/// Client certificate chain and private key presented to every node.
pub struct ClientCredential {
    certificates: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl ClientCredential {
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, String> {
        let certificates = CertificateDer::pem_slice_iter(certificate_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("cannot read client certificate: {e}"))?;
        if certificates.is_empty() {
            return Err("no certificate in client certificate file".into());
        }
        let private_key = PrivateKeyDer::from_pem_slice(private_key_pem)
            .map_err(|e| format!("cannot read client key: {e}"))?;

        Ok(ClientCredential {
            certificates,
            private_key,
        })
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("certificates", &self.certificates.len())
            .finish_non_exhaustive()
    }
}

/// Builds one pinned channel per node identity.
pub struct ChannelFactory {
    identities: Vec<NodeIdentity>,
    credential: ClientCredential,
    request_timeout: Duration,
}

impl ChannelFactory {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(identities: Vec<NodeIdentity>, credential: ClientCredential) -> Self {
        ChannelFactory {
            identities,
            credential,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Decodes every pinned key up front so that no channel is opened for a
    /// deployment with a single malformed identity.
    fn pinned_keys(&self) -> Result<Vec<(&NodeIdentity, Vec<u8>)>> {
        if self.identities.is_empty() {
            return Err(CoordinatorError::Config("no node identities configured".into()));
        }
        self.identities
            .iter()
            .map(|identity| identity.pinned_key().map(|key| (identity, key)))
            .collect()
    }

    /// Channels whose TLS handshake is deferred to the first call.
    pub fn connect_lazy(&self) -> Result<NodePool> {
        let channels = self
            .pinned_keys()?
            .into_iter()
            .map(|(identity, key)| {
                GrpcNodeChannel::connect_lazy(
                    identity.index,
                    &identity.url,
                    key,
                    &self.credential,
                    self.request_timeout,
                )
                .map(|channel| Arc::new(channel) as Arc<dyn NodeChannel>)
            })
            .collect::<Result<Vec<_>>>()?;
        NodePool::new(channels)
    }

    /// Opens all channels concurrently and completes every handshake.
    pub async fn connect_all(&self) -> Result<NodePool> {
        let pinned = self.pinned_keys()?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut pending = Vec::with_capacity(pinned.len());
        for (identity, key) in pinned {
            // every spawned task owns its inputs; the credential is cheap to re-read
            let node = identity.index;
            let url = identity.url.clone();
            let credential = ClientCredential {
                certificates: self.credential.certificates.clone(),
                private_key: self.credential.private_key(),
            };
            let timeout = self.request_timeout;
            let tx = tx.clone();
            pending.push(node);
            tokio::spawn(async move {
                let result = GrpcNodeChannel::connect(node, &url, key, &credential, timeout).await;
                let _ = tx.send((node, result));
            });
        }
        drop(tx);

        let mut channels: Vec<Arc<dyn NodeChannel>> = Vec::with_capacity(pending.len());
        let mut first_error = None;
        while let Some((node, result)) = rx.recv().await {
            pending.retain(|n| *n != node);
            match result {
                Ok(channel) => channels.push(Arc::new(channel)),
                Err(e) => {
                    tracing::error!(node = node.0, error = %e, "channel setup failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if let Some(node) = pending.first() {
            return Err(CoordinatorError::ChannelSetup {
                node: *node,
                reason: "connection task aborted".into(),
            });
        }

        tracing::info!(nodes = channels.len(), "all node channels established");
        NodePool::new(channels)
    }
}

/// Long-lived channels, one per configured node, ordered by node index.
#[derive(Clone)]
pub struct NodePool {
    channels: Vec<Arc<dyn NodeChannel>>,
}

impl fmt::Debug for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool").field("nodes", &self.nodes()).finish()
    }
}

impl NodePool {
    pub fn new(mut channels: Vec<Arc<dyn NodeChannel>>) -> Result<Self> {
        if channels.is_empty() {
            return Err(CoordinatorError::Config("node pool is empty".into()));
        }
        channels.sort_by_key(|c| c.node());
        let mut seen = BTreeSet::new();
        for channel in &channels {
            if !seen.insert(channel.node()) {
                return Err(CoordinatorError::Config(format!(
                    "two channels for node {}",
                    channel.node()
                )));
            }
        }
        // sessions address nodes by position in 0..len
        for (position, channel) in channels.iter().enumerate() {
            if channel.node().0 as usize != position {
                return Err(CoordinatorError::Config(format!(
                    "node indices must be contiguous from 0, found node {} at position {position}",
                    channel.node()
                )));
            }
        }
        Ok(NodePool { channels })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn nodes(&self) -> Vec<NodeIndex> {
        self.channels.iter().map(|c| c.node()).collect()
    }

    pub fn all(&self) -> &[Arc<dyn NodeChannel>] {
        &self.channels
    }

    pub fn get(&self, node: NodeIndex) -> Option<&Arc<dyn NodeChannel>> {
        self.channels.iter().find(|c| c.node() == node)
    }

    /// Channels of the session's participants, in participant order.
    pub fn select(&self, session: &SessionDescriptor) -> Result<Vec<Arc<dyn NodeChannel>>> {
        session
            .participants()
            .iter()
            .map(|node| {
                self.get(*node).cloned().ok_or_else(|| {
                    CoordinatorError::InvalidParticipantSet(format!("no channel for node {node}"))
                })
            })
            .collect()
    }
}

/// Checks that `channels` are exactly the participants of `session`.
pub(crate) fn ensure_channels_match(
    channels: &[Arc<dyn NodeChannel>],
    session: &SessionDescriptor,
) -> Result<()> {
    let mut nodes: Vec<NodeIndex> = channels.iter().map(|c| c.node()).collect();
    nodes.sort();
    if nodes.as_slice() != session.participants() {
        return Err(CoordinatorError::InvalidParticipantSet(format!(
            "channels {nodes:?} do not match session participants {:?}",
            session.participants()
        )));
    }
    Ok(())
}
