use pyrite_common::transaction::TransactionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: u64, have: u64 },

    #[error("Cannot set the starting block of an existing blockchain")]
    GenesisAlreadySet,

    #[error("No genesis block has been installed")]
    MissingGenesis,

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Key generation failed: {0}")]
    Keys(#[from] rsa::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
