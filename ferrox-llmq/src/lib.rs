pub mod chainlocks;
pub mod context;
pub mod instantsend;
pub mod quorums;
pub mod signing;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmqError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<Box<bincode::ErrorKind>> for LlmqError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LlmqError::Serialization(err.to_string())
    }
}
