//! Session descriptors: the per-run metadata every participating node must receive
//! identically to join the same protocol execution.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoordinatorError, Result};
use crate::types::NodeIndex;

/// Fresh, globally unique session identifier.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// {session id, participants, participant public encryption keys} for one run.
///
/// Participants are kept sorted so that two descriptors built from the same input
/// encode to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    session_id: String,
    participants: Vec<NodeIndex>,
    public_keys: BTreeMap<NodeIndex, Vec<u8>>,
}

impl SessionDescriptor {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participants(&self) -> &[NodeIndex] {
        &self.participants
    }

    pub fn public_keys(&self) -> &BTreeMap<NodeIndex, Vec<u8>> {
        &self.public_keys
    }

    pub fn public_key(&self, node: NodeIndex) -> Option<&[u8]> {
        self.public_keys.get(&node).map(Vec::as_slice)
    }
}

/// Stateless builder bound to the size of the configured node set.
#[derive(Debug, Clone, Copy)]
pub struct SessionDescriptorBuilder {
    node_count: u32,
}

impl SessionDescriptorBuilder {
    pub fn new(node_count: u32) -> Self {
        SessionDescriptorBuilder { node_count }
    }

    /// Builds a descriptor with a freshly generated session id.
    pub fn build(
        &self,
        participants: &[NodeIndex],
        public_keys: &BTreeMap<NodeIndex, Vec<u8>>,
    ) -> Result<SessionDescriptor> {
        self.build_with_id(generate_session_id(), participants, public_keys)
    }

    /// Builds a descriptor with a caller-chosen session id. The caller is then
    /// responsible for never reusing the id across runs.
    pub fn build_with_id(
        &self,
        session_id: impl Into<String>,
        participants: &[NodeIndex],
        public_keys: &BTreeMap<NodeIndex, Vec<u8>>,
    ) -> Result<SessionDescriptor> {
        let session_id = session_id.into();
        if session_id.is_empty() {
            return Err(CoordinatorError::InvalidParticipantSet(
                "session id must not be empty".into(),
            ));
        }
        if participants.is_empty() {
            return Err(CoordinatorError::InvalidParticipantSet(
                "no participants".into(),
            ));
        }

        let mut unique = BTreeSet::new();
        for &node in participants {
            if node.0 >= self.node_count {
                return Err(CoordinatorError::InvalidParticipantSet(format!(
                    "node {node} is not among the {} configured nodes",
                    self.node_count
                )));
            }
            if !unique.insert(node) {
                return Err(CoordinatorError::InvalidParticipantSet(format!(
                    "node {node} listed twice"
                )));
            }
        }

        let mut keys = BTreeMap::new();
        for &node in &unique {
            match public_keys.get(&node) {
                Some(key) if !key.is_empty() => {
                    keys.insert(node, key.clone());
                }
                _ => {
                    return Err(CoordinatorError::InvalidParticipantSet(format!(
                        "no public encryption key for node {node}"
                    )))
                }
            }
        }

        Ok(SessionDescriptor {
            session_id,
            participants: unique.into_iter().collect(),
            public_keys: keys,
        })
    }
}
