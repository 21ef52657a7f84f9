//! BLS12-381 signing primitives: operator keys, signature aggregation and
//! threshold recovery.
//!
//! Public keys live in G1 (48 bytes compressed), signatures in G2 (96 bytes
//! compressed). All hash-to-curve operations use the fixed ciphersuite DST;
//! distinct signature uses separate their message spaces with the label
//! constants below.

use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Prepared, G2Projective, Scalar};
use ferrox_shared_types::Hash;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::hash::HashWriter;
use crate::CryptoError;

pub const BLS_SECRET_KEY_SIZE: usize = 32;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SIGNATURE_SIZE: usize = 96;

/// Hash-to-G2 ciphersuite domain-separation tag.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// HKDF salt for seed-derived secret keys.
const KEYGEN_SALT: &[u8] = b"FERROX-BLS-KEYGEN-SALT";

/// Message labels keeping the signature uses disjoint.
pub const LABEL_OPERATOR_KEY: &str = "FERROX_BLS_operator_v1";
pub const LABEL_INSTANTSEND: &str = "FERROX_BLS_islock_v1";
pub const LABEL_CHAINLOCK: &str = "FERROX_BLS_clsig_v1";
pub const LABEL_QUORUM: &str = "FERROX_BLS_quorum_v1";

fn hash_to_g2(msg: &Hash) -> G2Projective {
    <G2Projective as HashToCurve<ExpandMsgXmd<Sha256>>>::hash_to_curve(&msg[..], DST)
}

fn scalar_from_wide(bytes: &[u8; 64]) -> Scalar {
    Scalar::from_bytes_wide(bytes)
}

/// Participant identifier for threshold schemes: a scalar derived from a
/// 32-byte hash (in practice the member's proTxHash).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlsId(Scalar);

impl BlsId {
    pub fn from_hash(hash: &Hash) -> Self {
        let mut wide = [0u8; 64];
        let mut reader = blake3::Hasher::new_derive_key("FERROX_BLS_id_v1")
            .update(hash)
            .finalize_xof();
        reader.fill(&mut wide);
        BlsId(scalar_from_wide(&wide))
    }

    fn scalar(&self) -> Scalar {
        self.0
    }
}

/// BLS secret key. Not clonable; the scalar is scrubbed on drop.
pub struct BlsSecretKey {
    scalar: Scalar,
}

impl Zeroize for BlsSecretKey {
    fn zeroize(&mut self) {
        self.scalar = Scalar::zero();
    }
}

impl Drop for BlsSecretKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl BlsSecretKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        loop {
            let mut wide = [0u8; 64];
            csprng.fill_bytes(&mut wide);
            let scalar = scalar_from_wide(&wide);
            wide.zeroize();
            if scalar != Scalar::zero() {
                return BlsSecretKey { scalar };
            }
        }
    }

    /// Derive a key from a 32-byte seed. HKDF-SHA256 expands the seed to 64
    /// bytes which are reduced mod the curve order, so the result is always a
    /// valid scalar.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(KEYGEN_SALT), seed);
        let mut counter = 0u8;
        loop {
            let mut okm = [0u8; 64];
            hk.expand(&[b'k', counter], &mut okm)
                .expect("64 bytes is a valid HKDF output length");
            let scalar = scalar_from_wide(&okm);
            okm.zeroize();
            if scalar != Scalar::zero() {
                return BlsSecretKey { scalar };
            }
            counter = counter.wrapping_add(1);
        }
    }

    pub fn from_bytes(bytes: &[u8; BLS_SECRET_KEY_SIZE]) -> Result<Self, CryptoError> {
        let scalar = Option::<Scalar>::from(Scalar::from_bytes(bytes))
            .ok_or(CryptoError::InvalidSecretKey)?;
        if scalar == Scalar::zero() {
            return Err(CryptoError::InvalidSecretKey);
        }
        Ok(BlsSecretKey { scalar })
    }

    pub fn to_bytes(&self) -> [u8; BLS_SECRET_KEY_SIZE] {
        self.scalar.to_bytes()
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(G1Affine::from(G1Projective::generator() * self.scalar))
    }

    /// Sign a 32-byte message hash: hash-to-G2 then scalar multiply.
    pub fn sign(&self, msg: &Hash) -> BlsSignature {
        BlsSignature(G2Affine::from(hash_to_g2(msg) * self.scalar))
    }

    /// Self-signature over the public key bytes, binding the key against
    /// rogue-key attacks during aggregation.
    pub fn sign_proof_of_possession(&self) -> BlsSignature {
        self.sign(&proof_of_possession_message(&self.public_key()))
    }

    /// Sum of secret keys, matching public-key aggregation.
    pub fn aggregate(keys: &[BlsSecretKey]) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::EmptyAggregation);
        }
        let scalar = keys
            .iter()
            .fold(Scalar::zero(), |acc, key| acc + key.scalar);
        Ok(BlsSecretKey { scalar })
    }
}

fn proof_of_possession_message(pk: &BlsPublicKey) -> Hash {
    let mut writer = HashWriter::tagged(LABEL_OPERATOR_KEY);
    writer.write(&pk.to_bytes());
    writer.finalize()
}

/// Verify an operator key's proof of possession.
pub fn verify_proof_of_possession(pk: &BlsPublicKey, sig: &BlsSignature) -> bool {
    sig.verify_insecure(pk, &proof_of_possession_message(pk))
}

/// BLS public key: a non-identity G1 element, 48 bytes compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlsPublicKey(G1Affine);

impl BlsPublicKey {
    /// Parse a compressed G1 point; subgroup membership is checked by the
    /// deserialization, the identity is rejected here.
    pub fn from_bytes(bytes: &[u8; BLS_PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        let point = Option::<G1Affine>::from(G1Affine::from_compressed(bytes))
            .ok_or(CryptoError::InvalidPublicKey)?;
        if bool::from(point.is_identity()) {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(BlsPublicKey(point))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; BLS_PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&arr)
    }

    pub fn to_bytes(&self) -> [u8; BLS_PUBLIC_KEY_SIZE] {
        self.0.to_compressed()
    }

    /// Group addition in G1 over the whole set.
    pub fn aggregate(keys: &[BlsPublicKey]) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::EmptyAggregation);
        }
        let sum = keys
            .iter()
            .fold(G1Projective::identity(), |acc, key| acc + G1Projective::from(key.0));
        Ok(BlsPublicKey(G1Affine::from(sum)))
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().to_vec().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        BlsPublicKey::from_slice(&bytes).map_err(D::Error::custom)
    }
}

/// BLS signature: a G2 element, 96 bytes compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(G2Affine);

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8; BLS_SIGNATURE_SIZE]) -> Result<Self, CryptoError> {
        let point = Option::<G2Affine>::from(G2Affine::from_compressed(bytes))
            .ok_or(CryptoError::InvalidSignature)?;
        Ok(BlsSignature(point))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; BLS_SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Self::from_bytes(&arr)
    }

    pub fn to_bytes(&self) -> [u8; BLS_SIGNATURE_SIZE] {
        self.0.to_compressed()
    }

    /// Core pairing check: e(pk, H(msg)) == e(g1, sig). "Insecure" because it
    /// does not bind a proof of possession; callers aggregate only
    /// possession-proven keys.
    pub fn verify_insecure(&self, pk: &BlsPublicKey, msg: &Hash) -> bool {
        if bool::from(pk.0.is_identity()) {
            return false;
        }
        let hm = G2Affine::from(hash_to_g2(msg));
        pairing(&pk.0, &hm) == pairing(&G1Affine::generator(), &self.0)
    }

    /// Group addition in G2 over the whole set.
    pub fn aggregate_signatures(sigs: &[BlsSignature]) -> Result<Self, CryptoError> {
        if sigs.is_empty() {
            return Err(CryptoError::EmptyAggregation);
        }
        let sum = sigs
            .iter()
            .fold(G2Projective::identity(), |acc, sig| acc + G2Projective::from(sig.0));
        Ok(BlsSignature(G2Affine::from(sum)))
    }

    /// Verify an aggregated signature over per-signer messages via a
    /// multi-Miller loop: e(g1, sig) == prod e(pk_i, H(m_i)).
    pub fn verify_aggregate(&self, pairs: &[(BlsPublicKey, Hash)]) -> bool {
        if pairs.is_empty() {
            return false;
        }
        if pairs.iter().any(|(pk, _)| bool::from(pk.0.is_identity())) {
            return false;
        }
        let prepared: Vec<(G1Affine, G2Prepared)> = pairs
            .iter()
            .map(|(pk, msg)| (pk.0, G2Prepared::from(G2Affine::from(hash_to_g2(msg)))))
            .collect();
        let terms: Vec<(&G1Affine, &G2Prepared)> =
            prepared.iter().map(|(pk, hm)| (pk, hm)).collect();
        let lhs = bls12_381::multi_miller_loop(&terms).final_exponentiation();
        lhs == pairing(&G1Affine::generator(), &self.0)
    }

    /// Verify an aggregated signature where every signer signed `msg`.
    pub fn verify_same_message(&self, pks: &[BlsPublicKey], msg: &Hash) -> bool {
        match BlsPublicKey::aggregate(pks) {
            Ok(agg) => self.verify_insecure(&agg, msg),
            Err(_) => false,
        }
    }

    /// Batch verification of independent (signature, key, message) triples.
    /// Each triple is weighted by a random scalar before combining, so a set
    /// of individually invalid signatures cannot cancel out; one pairing
    /// product replaces 2n pairings.
    pub fn batch_verify(triples: &[(BlsSignature, BlsPublicKey, Hash)]) -> bool {
        if triples.is_empty() {
            return true;
        }
        if triples.iter().any(|(_, pk, _)| bool::from(pk.0.is_identity())) {
            return false;
        }

        let mut csprng = OsRng;
        let mut combined_sig = G2Projective::identity();
        let mut weighted: Vec<(G1Affine, G2Prepared)> = Vec::with_capacity(triples.len());
        for (sig, pk, msg) in triples {
            let mut wide = [0u8; 64];
            csprng.fill_bytes(&mut wide[..16]);
            let weight = scalar_from_wide(&wide);
            combined_sig += G2Projective::from(sig.0) * weight;
            let weighted_pk = G1Affine::from(G1Projective::from(pk.0) * weight);
            weighted.push((weighted_pk, G2Prepared::from(G2Affine::from(hash_to_g2(msg)))));
        }

        let terms: Vec<(&G1Affine, &G2Prepared)> =
            weighted.iter().map(|(pk, hm)| (pk, hm)).collect();
        let rhs = bls12_381::multi_miller_loop(&terms).final_exponentiation();
        pairing(&G1Affine::generator(), &G2Affine::from(combined_sig)) == rhs
    }

    /// Recover a threshold signature from shares by Lagrange interpolation at
    /// x = 0 over the BLS scalar field. Shares must come from distinct ids;
    /// exactly the first `threshold` shares are consumed, so recovery is
    /// deterministic given the share ordering.
    pub fn recover_threshold_signature(
        shares: &[(BlsId, BlsSignature)],
        threshold: usize,
    ) -> Result<BlsSignature, CryptoError> {
        if threshold == 0 {
            return Err(CryptoError::RecoveryFailed("zero threshold".into()));
        }
        if shares.len() < threshold {
            return Err(CryptoError::ThresholdNotMet { have: shares.len(), need: threshold });
        }
        let shares = &shares[..threshold];
        for (i, (id, _)) in shares.iter().enumerate() {
            if shares[..i].iter().any(|(other, _)| other == id) {
                return Err(CryptoError::DuplicateId);
            }
        }

        let mut recovered = G2Projective::identity();
        for (j, (id_j, sig_j)) in shares.iter().enumerate() {
            let xj = id_j.scalar();
            let mut lambda = Scalar::one();
            for (m, (id_m, _)) in shares.iter().enumerate() {
                if m == j {
                    continue;
                }
                let xm = id_m.scalar();
                let denom = Option::<Scalar>::from((xm - xj).invert())
                    .ok_or(CryptoError::DuplicateId)?;
                lambda *= xm * denom;
            }
            recovered += G2Projective::from(sig_j.0) * lambda;
        }
        Ok(BlsSignature(G2Affine::from(recovered)))
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().to_vec().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        BlsSignature::from_slice(&bytes).map_err(D::Error::custom)
    }
}

/// Deal Shamir shares of `secret` for the given participant ids: a random
/// polynomial of degree `threshold - 1` with constant term `secret`,
/// evaluated at each id. The DKG layer and tests use this to produce share
/// sets whose recovery matches the group key.
pub fn deal_secret_shares(
    secret: &BlsSecretKey,
    ids: &[BlsId],
    threshold: usize,
) -> Result<Vec<BlsSecretKey>, CryptoError> {
    if threshold == 0 || threshold > ids.len() {
        return Err(CryptoError::RecoveryFailed("threshold out of range".into()));
    }
    let mut csprng = OsRng;
    let mut coefficients = vec![secret.scalar];
    for _ in 1..threshold {
        let mut wide = [0u8; 64];
        csprng.fill_bytes(&mut wide);
        coefficients.push(scalar_from_wide(&wide));
    }

    let shares = ids
        .iter()
        .map(|id| {
            let x = id.scalar();
            let mut value = Scalar::zero();
            let mut x_power = Scalar::one();
            for coeff in &coefficients {
                value += coeff * x_power;
                x_power *= x;
            }
            BlsSecretKey { scalar: value }
        })
        .collect();
    for coeff in coefficients.iter_mut() {
        *coeff = Scalar::zero();
    }
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: u8) -> Hash {
        let mut m = [0u8; 32];
        m[0] = n;
        m
    }

    #[test]
    fn sign_and_verify() {
        let sk = BlsSecretKey::generate();
        let pk = sk.public_key();
        let sig = sk.sign(&msg(1));
        assert!(sig.verify_insecure(&pk, &msg(1)));
        assert!(!sig.verify_insecure(&pk, &msg(2)));

        let other = BlsSecretKey::generate().public_key();
        assert!(!sig.verify_insecure(&other, &msg(1)));
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let seed = [42u8; 32];
        let a = BlsSecretKey::from_seed(&seed);
        let b = BlsSecretKey::from_seed(&seed);
        assert_eq!(a.to_bytes(), b.to_bytes());

        let c = BlsSecretKey::from_seed(&[43u8; 32]);
        assert_ne!(a.to_bytes(), c.to_bytes());
    }

    #[test]
    fn secret_key_roundtrip() {
        let sk = BlsSecretKey::generate();
        let restored = BlsSecretKey::from_bytes(&sk.to_bytes()).unwrap();
        assert_eq!(sk.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_bad_bytes_rejected() {
        // Compression flag bit unset: cannot be a valid compressed point.
        let mut bytes = [0u8; BLS_PUBLIC_KEY_SIZE];
        bytes[0] = 0x01;
        assert!(BlsPublicKey::from_bytes(&bytes).is_err());
    }

    #[test]
    fn proof_of_possession() {
        let sk = BlsSecretKey::generate();
        let pop = sk.sign_proof_of_possession();
        assert!(verify_proof_of_possession(&sk.public_key(), &pop));

        let other = BlsSecretKey::generate();
        assert!(!verify_proof_of_possession(&other.public_key(), &pop));
    }

    #[test]
    fn threshold_recovery_matches_group_key() {
        let group = BlsSecretKey::generate();
        let group_pk = group.public_key();
        let ids: Vec<BlsId> = (0u8..5).map(|i| BlsId::from_hash(&msg(i + 1))).collect();
        let shares = deal_secret_shares(&group, &ids, 3).unwrap();

        let message = msg(0xEE);
        let sig_shares: Vec<(BlsId, BlsSignature)> = ids
            .iter()
            .zip(shares.iter())
            .map(|(id, share)| (*id, share.sign(&message)))
            .collect();

        // Any three shares recover a signature valid under the group key.
        let recovered =
            BlsSignature::recover_threshold_signature(&sig_shares[..3], 3).unwrap();
        assert!(recovered.verify_insecure(&group_pk, &message));

        let recovered_tail =
            BlsSignature::recover_threshold_signature(&sig_shares[2..], 3).unwrap();
        assert!(recovered_tail.verify_insecure(&group_pk, &message));

        // Two shares are not enough.
        assert!(matches!(
            BlsSignature::recover_threshold_signature(&sig_shares[..2], 3),
            Err(CryptoError::ThresholdNotMet { have: 2, need: 3 })
        ));
    }

    #[test]
    fn duplicate_share_ids_rejected() {
        let sk = BlsSecretKey::generate();
        let sig = sk.sign(&msg(1));
        let id = BlsId::from_hash(&msg(9));
        let shares = vec![(id, sig), (id, sig)];
        assert!(matches!(
            BlsSignature::recover_threshold_signature(&shares, 2),
            Err(CryptoError::DuplicateId)
        ));
    }
}
