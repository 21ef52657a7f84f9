pub mod deterministicmns;
pub mod evodb;
pub mod providertx;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvoError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("duplicate unique property for masternode {0}")]
    DuplicateUniqueProperty(String),
    #[error("masternode not found: {0}")]
    MasternodeNotFound(String),
}

impl From<Box<bincode::ErrorKind>> for EvoError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        EvoError::Serialization(err.to_string())
    }
}
