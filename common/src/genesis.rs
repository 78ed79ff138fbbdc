use crate::{
    block::Block,
    config::{default_target, COINBASE_AMT_ALLOWED},
    crypto::Address,
};
use indexmap::IndexMap;
use primitive_types::U256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("Starting balances cannot be empty")]
    EmptyBalances,
}

/// Build the unique genesis block from the initial balance assignment.
///
/// Construction is deterministic: peers given the same balance map in the
/// same order produce byte-identical genesis blocks, and therefore agree
/// on the chain they are extending. Genesis has no winner, so no reward
/// is ever credited for it.
pub fn make_genesis(starting_balances: IndexMap<Address, u64>) -> Result<Block, GenesisError> {
    make_genesis_with_target(starting_balances, default_target())
}

/// Same as [`make_genesis`] with an explicit proof-of-work target, which
/// is what every block of the chain will carry.
pub fn make_genesis_with_target(
    starting_balances: IndexMap<Address, u64>,
    target: U256,
) -> Result<Block, GenesisError> {
    if starting_balances.is_empty() {
        return Err(GenesisError::EmptyBalances);
    }
    Ok(Block::new_genesis(
        target,
        COINBASE_AMT_ALLOWED,
        starting_balances,
    ))
}
