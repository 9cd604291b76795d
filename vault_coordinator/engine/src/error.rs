//! Centralized coordinator error types.

use thiserror::Error;

use crate::types::{MasterKeyHandle, NodeIndex};

/// Failure of a single call against one signing node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The node could not be reached or the TLS session broke.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The node answered with a gRPC error status.
    #[error("node returned {code:?}: {message}")]
    Status { code: tonic::Code, message: String },
    /// The node does not know the requested master key.
    #[error("unknown key: {0}")]
    UnknownKey(String),
    /// The node refused the request parameters.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The node answered, but the answer could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl From<tonic::Status> for NodeError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => NodeError::UnknownKey(status.message().to_string()),
            tonic::Code::InvalidArgument => NodeError::Rejected(status.message().to_string()),
            tonic::Code::Unavailable => NodeError::Transport(status.message().to_string()),
            code => NodeError::Status {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A pinned server key could not be decoded into a public key.
    #[error("malformed identity for node {node}: {reason}")]
    MalformedIdentity { node: NodeIndex, reason: String },
    /// Credential loading or the TLS handshake failed.
    #[error("channel setup for node {node} failed: {reason}")]
    ChannelSetup { node: NodeIndex, reason: String },
    #[error("invalid participant set: {0}")]
    InvalidParticipantSet(String),
    #[error("key generation failed on node {node}: {source}")]
    KeyGeneration {
        node: NodeIndex,
        #[source]
        source: NodeError,
    },
    /// Nodes finished key generation but disagree on the key identity.
    #[error("node {node} returned key {found}, expected {expected}")]
    KeyConsistency {
        node: NodeIndex,
        expected: MasterKeyHandle,
        found: MasterKeyHandle,
    },
    #[error("key derivation failed on node {node}: {reason}")]
    Derivation { node: NodeIndex, reason: String },
    #[error("partial signing failed on node {node}: {source}")]
    PartialSign {
        node: NodeIndex,
        #[source]
        source: NodeError,
    },
    #[error("signature aggregation failed: {0}")]
    Aggregation(String),
    #[error("configuration error: {0}")]
    Config(String),
    /// Input validation error (digests, paths, hex strings).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Blockchain service request failed.
    #[error("blockchain service error: {0}")]
    Chain(String),
}

impl CoordinatorError {
    /// The node a failure is attributed to, if any.
    pub fn node(&self) -> Option<NodeIndex> {
        match self {
            CoordinatorError::MalformedIdentity { node, .. }
            | CoordinatorError::ChannelSetup { node, .. }
            | CoordinatorError::KeyGeneration { node, .. }
            | CoordinatorError::KeyConsistency { node, .. }
            | CoordinatorError::Derivation { node, .. }
            | CoordinatorError::PartialSign { node, .. } => Some(*node),
            _ => None,
        }
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
