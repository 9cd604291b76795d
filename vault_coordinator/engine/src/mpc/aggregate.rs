//! Combination of partial ECDSA signatures into one recoverable signature.

use std::collections::BTreeSet;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::bigint::U256;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, EncodedPoint, FieldBytes, PublicKey, Scalar};

use crate::error::{CoordinatorError, Result};
use crate::types::{MessageDigest, NodeIndex, PartialSignature};

const SHARE_VERSION: u8 = 0x01;
const POINT_LEN: usize = 33;
const SCALAR_LEN: usize = 32;

/// Decoded partial signature as produced by one node.
///
/// Layout: version (1) | player (u32 BE) | R (33, compressed) |
/// public key (33, compressed) | share (32, BE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignatureShare {
    pub player: NodeIndex,
    pub nonce_point: AffinePoint,
    pub public_key: PublicKey,
    pub share: Scalar,
}

impl PartialSignatureShare {
    pub const ENCODED_LEN: usize = 1 + 4 + POINT_LEN + POINT_LEN + SCALAR_LEN;

    pub fn encode(&self) -> PartialSignature {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.push(SHARE_VERSION);
        out.extend_from_slice(&self.player.0.to_be_bytes());
        out.extend_from_slice(self.nonce_point.to_encoded_point(true).as_bytes());
        out.extend_from_slice(self.public_key.to_encoded_point(true).as_bytes());
        out.extend_from_slice(&self.share.to_bytes());
        PartialSignature::new(out)
    }

    pub fn decode(partial: &PartialSignature) -> Result<Self> {
        let bytes = partial.as_bytes();
        if bytes.len() != Self::ENCODED_LEN {
            return Err(aggregation(format!(
                "partial signature is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        if bytes[0] != SHARE_VERSION {
            return Err(aggregation(format!(
                "unsupported partial signature version {}",
                bytes[0]
            )));
        }

        let (player, rest) = bytes[1..].split_at(4);
        let (nonce_point, rest) = rest.split_at(POINT_LEN);
        let (public_key, share) = rest.split_at(POINT_LEN);

        let mut player_bytes = [0u8; 4];
        player_bytes.copy_from_slice(player);
        let nonce_point = decode_point(nonce_point)
            .ok_or_else(|| aggregation("nonce point is not on the curve".into()))?;
        let public_key = PublicKey::from_sec1_bytes(public_key)
            .map_err(|_| aggregation("public key is not on the curve".into()))?;
        let share = <[u8; SCALAR_LEN]>::try_from(share)
            .map_err(|_| aggregation("share scalar has the wrong length".into()))?;
        let share = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(share)))
            .ok_or_else(|| aggregation("share scalar out of range".into()))?;

        Ok(PartialSignatureShare {
            player: NodeIndex(u32::from_be_bytes(player_bytes)),
            nonce_point,
            public_key,
            share,
        })
    }
}

fn decode_point(bytes: &[u8]) -> Option<AffinePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    Option::from(AffinePoint::from_encoded_point(&encoded))
}

fn aggregation(reason: String) -> CoordinatorError {
    CoordinatorError::Aggregation(reason)
}

/// `r` of a signature with nonce point `nonce_point`.
pub fn nonce_scalar(nonce_point: &AffinePoint) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&nonce_point.x())
}

/// Lagrange coefficient at zero of `player` within `players`, over x = index + 1.
pub fn lagrange_coefficient(player: NodeIndex, players: &[NodeIndex]) -> Option<Scalar> {
    let xi = Scalar::from(u64::from(player.0) + 1);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for other in players.iter().filter(|p| **p != player) {
        let xj = Scalar::from(u64::from(other.0) + 1);
        numerator *= xj;
        denominator *= xj - xi;
    }
    Option::<Scalar>::from(denominator.invert()).map(|inv| numerator * inv)
}

/// A complete, standalone ECDSA signature with its recovery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl FinalSignature {
    /// `r || s || v`, 65 bytes.
    pub fn to_rsv_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.recovery_id;
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_rsv_bytes())
    }

    pub fn from_rsv_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(CoordinatorError::InvalidInput(format!(
                "signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(FinalSignature {
            r,
            s,
            recovery_id: bytes[64],
        })
    }

    fn signature(&self) -> Result<Signature> {
        Signature::from_scalars(self.r, self.s)
            .map_err(|e| CoordinatorError::InvalidInput(format!("invalid signature scalars: {e}")))
    }

    /// The key that produced this signature over `digest`.
    pub fn recover_public_key(&self, digest: &MessageDigest) -> Result<PublicKey> {
        let recovery_id = RecoveryId::from_byte(self.recovery_id).ok_or_else(|| {
            CoordinatorError::InvalidInput(format!("bad recovery id {}", self.recovery_id))
        })?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &self.signature()?, recovery_id)
            .map_err(|e| CoordinatorError::InvalidInput(format!("recovery failed: {e}")))?;
        Ok(PublicKey::from(&key))
    }
}

/// Combines the partial signatures of one signing run over `digest`.
///
/// All partials must agree on the nonce point and the derived public key and come
/// from distinct players. The result is low-S normalized and verified before the
/// recovery id is determined.
pub fn finalize_signature(
    digest: &MessageDigest,
    partials: &[PartialSignature],
) -> Result<FinalSignature> {
    let shares = partials
        .iter()
        .map(PartialSignatureShare::decode)
        .collect::<Result<Vec<_>>>()?;
    let first = shares
        .first()
        .ok_or_else(|| aggregation("no partial signatures".into()))?;

    let mut players = BTreeSet::new();
    for share in &shares {
        if share.nonce_point != first.nonce_point {
            return Err(aggregation(format!(
                "player {} used a different nonce",
                share.player
            )));
        }
        if share.public_key != first.public_key {
            return Err(aggregation(format!(
                "player {} signed for a different key",
                share.player
            )));
        }
        if !players.insert(share.player) {
            return Err(aggregation(format!("duplicate partial from player {}", share.player)));
        }
    }
    let players: Vec<NodeIndex> = players.into_iter().collect();

    let mut s = Scalar::ZERO;
    for share in &shares {
        let lambda = lagrange_coefficient(share.player, &players)
            .ok_or_else(|| aggregation("degenerate player set".into()))?;
        s += lambda * share.share;
    }

    let r = nonce_scalar(&first.nonce_point);
    let signature = Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|_| aggregation("combined signature has a zero scalar".into()))?;
    let signature = signature.normalize_s().unwrap_or(signature);

    let verifying_key = VerifyingKey::from(&first.public_key);
    verifying_key
        .verify_prehash(digest.as_bytes(), &signature)
        .map_err(|_| aggregation("combined signature does not verify".into()))?;
    let recovery_id =
        RecoveryId::trial_recovery_from_prehash(&verifying_key, digest.as_bytes(), &signature)
            .map_err(|_| aggregation("no recovery id reproduces the key".into()))?;

    let (r, s) = signature.split_bytes();
    Ok(FinalSignature {
        r: r.into(),
        s: s.into(),
        recovery_id: recovery_id.to_byte(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k256::ProjectivePoint;

    // secret x shared with f(X) = x + 5X; nonce k
    fn fixture(players: &[u32]) -> (MessageDigest, PublicKey, Vec<PartialSignature>) {
        let x = Scalar::from(0x1234_5678u64);
        let a1 = Scalar::from(5u64);
        let k = Scalar::from(0xdead_beefu64);
        let digest = MessageDigest::new([0x42; 32]);

        let public_key = PublicKey::from_affine((ProjectivePoint::GENERATOR * x).to_affine()).unwrap();
        let nonce_point = (ProjectivePoint::GENERATOR * k).to_affine();
        let r = nonce_scalar(&nonce_point);
        let z = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*digest.as_bytes()));
        let k_inv = k.invert().unwrap();

        let partials = players
            .iter()
            .map(|&i| {
                let share = x + a1 * Scalar::from(u64::from(i) + 1);
                PartialSignatureShare {
                    player: NodeIndex(i),
                    nonce_point,
                    public_key,
                    share: k_inv * (z + r * share),
                }
                .encode()
            })
            .collect();
        (digest, public_key, partials)
    }

    #[test]
    fn any_quorum_recovers_the_signing_key() {
        for players in [&[0, 1][..], &[1, 2], &[0, 2], &[0, 1, 2]] {
            let (digest, public_key, partials) = fixture(players);
            let signature = finalize_signature(&digest, &partials).unwrap();
            assert_eq!(signature.recover_public_key(&digest).unwrap(), public_key);
        }
    }

    #[test]
    fn result_is_low_s() {
        let (digest, _, partials) = fixture(&[0, 1, 2]);
        let signature = finalize_signature(&digest, &partials).unwrap();
        let parsed = Signature::from_scalars(signature.r, signature.s).unwrap();
        assert!(parsed.normalize_s().is_none());
    }

    #[test]
    fn rsv_layout() {
        let (digest, _, partials) = fixture(&[0, 1]);
        let signature = finalize_signature(&digest, &partials).unwrap();
        let rsv = signature.to_rsv_bytes();
        assert_eq!(&rsv[..32], &signature.r);
        assert_eq!(&rsv[32..64], &signature.s);
        assert!(rsv[64] <= 1);
        assert_eq!(FinalSignature::from_rsv_bytes(&rsv).unwrap(), signature);
        assert_eq!(signature.to_hex().len(), 130);
    }

    #[test]
    fn single_share_is_not_a_quorum() {
        let (digest, _, partials) = fixture(&[1]);
        assert_matches!(
            finalize_signature(&digest, &partials),
            Err(CoordinatorError::Aggregation(_))
        );
    }

    #[test]
    fn corrupted_share_fails_verification() {
        let (digest, _, mut partials) = fixture(&[0, 1]);
        let mut share = PartialSignatureShare::decode(&partials[1]).unwrap();
        share.share += Scalar::ONE;
        partials[1] = share.encode();

        assert_matches!(
            finalize_signature(&digest, &partials),
            Err(CoordinatorError::Aggregation(_))
        );
    }

    #[test]
    fn mixed_nonces_and_duplicates_are_rejected() {
        let (digest, _, partials) = fixture(&[0, 1]);

        let duplicated = vec![partials[0].clone(), partials[0].clone()];
        assert_matches!(
            finalize_signature(&digest, &duplicated),
            Err(CoordinatorError::Aggregation(_))
        );

        let mut other = PartialSignatureShare::decode(&partials[1]).unwrap();
        other.nonce_point = (ProjectivePoint::GENERATOR * Scalar::from(7u64)).to_affine();
        let mixed = vec![partials[0].clone(), other.encode()];
        assert_matches!(
            finalize_signature(&digest, &mixed),
            Err(CoordinatorError::Aggregation(_))
        );
    }

    #[test]
    fn malformed_partials_are_rejected() {
        let digest = MessageDigest::new([1; 32]);
        assert_matches!(
            finalize_signature(&digest, &[]),
            Err(CoordinatorError::Aggregation(_))
        );
        assert_matches!(
            finalize_signature(&digest, &[PartialSignature::new(vec![1, 2, 3])]),
            Err(CoordinatorError::Aggregation(_))
        );

        let (_, _, partials) = fixture(&[0]);
        let mut bytes = partials[0].as_bytes().to_vec();
        bytes[0] = 0x02;
        assert_matches!(
            finalize_signature(&digest, &[PartialSignature::new(bytes)]),
            Err(CoordinatorError::Aggregation(_))
        );
    }

    #[test]
    fn share_scalar_must_be_below_the_group_order() {
        let (_, _, partials) = fixture(&[0]);
        assert!(PartialSignatureShare::decode(&partials[0]).is_ok());

        let mut bytes = partials[0].as_bytes().to_vec();
        let len = bytes.len();
        bytes[len - SCALAR_LEN..].fill(0xff);
        assert_matches!(
            PartialSignatureShare::decode(&PartialSignature::new(bytes)),
            Err(CoordinatorError::Aggregation(msg)) if msg.contains("out of range")
        );
    }

    #[test]
    fn lagrange_coefficients_sum_to_one() {
        let players = [NodeIndex(0), NodeIndex(2), NodeIndex(5)];
        let sum = players
            .iter()
            .map(|p| lagrange_coefficient(*p, &players).unwrap())
            .fold(Scalar::ZERO, |acc, l| acc + l);
        assert_eq!(sum, Scalar::ONE);
    }
}
