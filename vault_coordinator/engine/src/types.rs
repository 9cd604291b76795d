//! Shared data types for the coordinator: node indices, key handles, derivation
//! paths, digests and partial signatures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;

/// Index of a signing node (0..N-1), also its player id in protocol runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub u32);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a distributed master key, as returned by the nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterKeyHandle(String);

impl MasterKeyHandle {
    pub fn new(id: impl Into<String>) -> Self {
        MasterKeyHandle(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MasterKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hierarchical derivation path relative to a master key, e.g. `m/44/60/0/0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    /// First index of the hardened range.
    pub const HARDENED: u32 = 0x8000_0000;

    pub fn new(components: Vec<u32>) -> Self {
        DerivationPath(components)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Components encoded as consecutive big-endian u32 values.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|c| c.to_be_bytes()).collect()
    }
}

impl From<&[u32]> for DerivationPath {
    fn from(components: &[u32]) -> Self {
        DerivationPath(components.to_vec())
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for c in &self.0 {
            if *c >= Self::HARDENED {
                write!(f, "/{}'", c - Self::HARDENED)?;
            } else {
                write!(f, "/{c}")?;
            }
        }
        Ok(())
    }
}

/// Accepts `m/44/60/0/0`, `44/60/0/0` and `44,60,0,0`. A trailing `'` or `h`
/// marks a hardened component.
impl FromStr for DerivationPath {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix("m/")
            .or_else(|| (s == "m").then_some(""))
            .unwrap_or(s);
        if s.is_empty() {
            return Ok(DerivationPath::default());
        }

        s.split(['/', ','])
            .map(|part| {
                let part = part.trim();
                let (digits, hardened) = match part.strip_suffix(['\'', 'h']) {
                    Some(digits) => (digits, true),
                    None => (part, false),
                };
                let index: u32 = digits.parse().map_err(|_| {
                    CoordinatorError::InvalidInput(format!("bad path component '{part}'"))
                })?;
                if index >= Self::HARDENED {
                    return Err(CoordinatorError::InvalidInput(format!(
                        "path component {index} out of range"
                    )));
                }
                Ok(if hardened { index + Self::HARDENED } else { index })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(DerivationPath)
    }
}

/// Fixed-length (32 byte) message digest to be signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageDigest([u8; 32]);

impl MessageDigest {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        MessageDigest(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoordinatorError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CoordinatorError::InvalidInput(format!(
                "digest must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(MessageDigest(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CoordinatorError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)
            .map_err(|e| CoordinatorError::InvalidInput(format!("digest is not hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One node's opaque contribution to a signature. Only meaningful until aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignature(Vec<u8>);

impl PartialSignature {
    pub fn new(bytes: Vec<u8>) -> Self {
        PartialSignature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_path_notations() {
        let expected = DerivationPath::new(vec![44, 60, 0, 0]);
        assert_eq!("m/44/60/0/0".parse::<DerivationPath>().unwrap(), expected);
        assert_eq!("44/60/0/0".parse::<DerivationPath>().unwrap(), expected);
        assert_eq!("44, 60, 0, 0".parse::<DerivationPath>().unwrap(), expected);
        assert!("m".parse::<DerivationPath>().unwrap().is_empty());
    }

    #[test]
    fn hardened_components_round_trip_through_display() {
        let path: DerivationPath = "m/44'/60h/0".parse().unwrap();
        assert_eq!(
            path.as_slice(),
            &[44 + DerivationPath::HARDENED, 60 + DerivationPath::HARDENED, 0]
        );
        assert_eq!(path.to_string(), "m/44'/60'/0");
    }

    #[test]
    fn rejects_garbage_path() {
        assert_matches!(
            "m/44/x/0".parse::<DerivationPath>(),
            Err(CoordinatorError::InvalidInput(_))
        );
        assert_matches!(
            "m/2147483648".parse::<DerivationPath>(),
            Err(CoordinatorError::InvalidInput(_))
        );
    }

    #[test]
    fn digest_requires_32_bytes() {
        let hex32 = "11".repeat(32);
        let digest = MessageDigest::from_hex(&format!("0x{hex32}")).unwrap();
        assert_eq!(digest.as_bytes(), &[0x11; 32]);
        assert_eq!(digest.to_string(), hex32);

        assert_matches!(
            MessageDigest::from_hex("abcd"),
            Err(CoordinatorError::InvalidInput(_))
        );
        assert_matches!(
            MessageDigest::from_hex("zz"),
            Err(CoordinatorError::InvalidInput(_))
        );
    }
}
