pub mod bls;
pub mod ecdsa;
pub mod hash;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("empty input to aggregation")]
    EmptyAggregation,
    #[error("duplicate participant id in threshold recovery")]
    DuplicateId,
    #[error("not enough signature shares: have {have}, need {need}")]
    ThresholdNotMet { have: usize, need: usize },
    #[error("signature recovery failed: {0}")]
    RecoveryFailed(String),
}
