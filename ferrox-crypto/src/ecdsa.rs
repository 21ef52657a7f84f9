//! Compact recoverable ECDSA over secp256k1, used for owner-key signatures
//! on provider payloads. A signature is 65 bytes: one recovery header byte
//! followed by r and s. Verification recovers the public key and compares
//! its 20-byte key id against the expected owner key id.

use ferrox_shared_types::{Hash, KeyId};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::hash::hash160;
use crate::CryptoError;

pub const COMPACT_SIGNATURE_SIZE: usize = 65;

/// 20-byte identifier of a secp256k1 public key.
pub fn key_id(pk: &PublicKey) -> KeyId {
    hash160(&pk.serialize())
}

/// Sign a 32-byte digest, producing the 65-byte compact recoverable form.
pub fn sign_compact(sk: &SecretKey, digest: &Hash) -> [u8; COMPACT_SIGNATURE_SIZE] {
    let secp = Secp256k1::new();
    let message = Message::from_digest(*digest);
    let (rec_id, compact) = secp
        .sign_ecdsa_recoverable(&message, sk)
        .serialize_compact();
    let mut out = [0u8; COMPACT_SIGNATURE_SIZE];
    out[0] = 27 + rec_id.to_i32() as u8;
    out[1..].copy_from_slice(&compact);
    out
}

/// Recover the signing public key from a compact signature.
pub fn recover_compact(digest: &Hash, signature: &[u8]) -> Result<PublicKey, CryptoError> {
    if signature.len() != COMPACT_SIGNATURE_SIZE {
        return Err(CryptoError::InvalidSignature);
    }
    let header = signature[0];
    if !(27..27 + 8).contains(&header) {
        return Err(CryptoError::InvalidSignature);
    }
    let rec_id = RecoveryId::from_i32(((header - 27) & 0x03) as i32)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let rec_sig = RecoverableSignature::from_compact(&signature[1..], rec_id)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let secp = Secp256k1::new();
    let message = Message::from_digest(*digest);
    secp.recover_ecdsa(&message, &rec_sig)
        .map_err(|_| CryptoError::RecoveryFailed("pubkey recovery failed".into()))
}

/// Check that a compact signature over `digest` recovers to `expected`.
pub fn check_compact_signature(digest: &Hash, signature: &[u8], expected: &KeyId) -> bool {
    match recover_compact(digest, signature) {
        Ok(pk) => key_id(&pk) == *expected,
        Err(_) => false,
    }
}
