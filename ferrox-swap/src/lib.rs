pub mod htlc;
pub mod orderbook;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("offer already exists: {0}")]
    DuplicateOffer(String),
    #[error("offer not found: {0}")]
    OfferNotFound(String),
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("invalid HTLC: {0}")]
    InvalidHtlc(String),
    #[error("invalid swap transition: {0}")]
    InvalidSwap(String),
}

impl From<Box<bincode::ErrorKind>> for SwapError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        SwapError::Serialization(err.to_string())
    }
}
