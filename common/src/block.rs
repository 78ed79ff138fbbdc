use crate::{
    crypto::{canonical_json, hash, Address, Hash, Hashable},
    time::{get_current_time_in_millis, TimestampMillis},
    transaction::Transaction,
};
use indexmap::IndexMap;
use log::debug;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error as FmtError, Formatter};
use thiserror::Error;

// Why a transaction was refused by a block. The receive path logs these
// and drops the offending object; none of them are fatal.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Duplicate transaction {0}")]
    DuplicateTransaction(Hash),

    #[error("Unsigned transaction {0}")]
    UnsignedTransaction(Hash),

    #[error("Invalid signature for transaction {0}")]
    InvalidSignature(Hash),

    #[error("Insufficient funds for transaction {id}: need {need}, have {have}")]
    InsufficientFunds { id: Hash, need: u64, have: u64 },

    #[error("Replayed transaction {id}: nonce {got}, expected {expected}")]
    ReplayedNonce { id: Hash, expected: u64, got: u64 },

    #[error("Out of order transaction {id}: nonce {got}, expected {expected}")]
    NonceGap { id: Hash, expected: u64, got: u64 },
}

// A transaction together with its content-addressed id, in block order
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct BlockTx {
    pub id: Hash,
    pub tx: Transaction,
}

/// A block of ordered transactions linked to its parent by hash.
///
/// `balances` and `next_nonce` are derived state: a pure function of the
/// parent's state, the parent's reward credit and the ordered replay of
/// this block's transactions. They travel on the wire for convenience but
/// are suppressed from the hash preimage and recomputed on receive.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    prev_block_hash: Option<Hash>,
    target: U256,
    proof: u32,
    transactions: Vec<BlockTx>,
    chain_length: u64,
    timestamp: TimestampMillis,
    reward_addr: Option<Address>,
    coinbase_reward: u64,
    #[serde(default)]
    balances: IndexMap<Address, u64>,
    #[serde(default)]
    next_nonce: IndexMap<Address, u64>,
}

// The hash preimage: the canonical fields in canonical order, nothing
// else. Keeping this an explicit struct means the mutable replay state
// cannot accidentally leak into block identity.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CanonicalBlock<'a> {
    prev_block_hash: &'a Option<Hash>,
    target: &'a U256,
    proof: u32,
    transactions: &'a [BlockTx],
    chain_length: u64,
    timestamp: TimestampMillis,
    reward_addr: &'a Option<Address>,
    coinbase_reward: u64,
}

impl Block {
    /// Build an empty block on top of `parent`, carrying over its derived
    /// state and crediting the parent's winner. The reward lands in the
    /// child so that a reward attached to a yet-unsealed block has no
    /// effect on anyone's balance.
    pub fn new(
        reward_addr: Option<Address>,
        parent: Option<&Block>,
        target: U256,
        coinbase_reward: u64,
    ) -> Self {
        let mut block = Block {
            prev_block_hash: parent.map(|p| p.hash()),
            target,
            proof: 0,
            transactions: Vec::new(),
            chain_length: parent.map_or(0, |p| p.chain_length + 1),
            timestamp: get_current_time_in_millis(),
            reward_addr,
            coinbase_reward,
            balances: parent.map(|p| p.balances.clone()).unwrap_or_default(),
            next_nonce: parent.map(|p| p.next_nonce.clone()).unwrap_or_default(),
        };

        if let Some(parent) = parent {
            block.credit_parent_reward(parent);
        }
        block
    }

    // Genesis carries starting balances and a fixed timestamp so that
    // every peer constructs the exact same bytes from the same input.
    pub(crate) fn new_genesis(
        target: U256,
        coinbase_reward: u64,
        balances: IndexMap<Address, u64>,
    ) -> Self {
        Block {
            prev_block_hash: None,
            target,
            proof: 0,
            transactions: Vec::new(),
            chain_length: 0,
            timestamp: 0,
            reward_addr: None,
            coinbase_reward,
            balances,
            next_nonce: IndexMap::new(),
        }
    }

    // Pay the parent's winner: fixed reward plus the fees of every
    // transaction the parent included. Genesis has no winner.
    fn credit_parent_reward(&mut self, parent: &Block) {
        if let Some(winner) = &parent.reward_addr {
            *self.balances.entry(winner.clone()).or_insert(0) += parent.total_rewards();
        }
    }

    /// Validate and apply a transaction, keeping balances and per-sender
    /// nonces consistent. Checks run in a fixed order so that rejection
    /// causes are stable across peers.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), BlockError> {
        let id = tx.hash();
        if self.contains(&id) {
            return Err(BlockError::DuplicateTransaction(id));
        }
        if !tx.is_signed() {
            return Err(BlockError::UnsignedTransaction(id));
        }
        if !tx.valid_signature() {
            return Err(BlockError::InvalidSignature(id));
        }

        let need = tx.total_output();
        let have = self.balance_of(tx.get_from());
        if need > have {
            return Err(BlockError::InsufficientFunds { id, need, have });
        }

        let expected = self.next_nonce_of(tx.get_from());
        if tx.get_nonce() < expected {
            return Err(BlockError::ReplayedNonce {
                id,
                expected,
                got: tx.get_nonce(),
            });
        }
        if tx.get_nonce() > expected {
            return Err(BlockError::NonceGap {
                id,
                expected,
                got: tx.get_nonce(),
            });
        }
        self.next_nonce.insert(tx.get_from().clone(), expected + 1);

        *self.balances.entry(tx.get_from().clone()).or_insert(0) -= need;
        for output in tx.get_outputs() {
            *self.balances.entry(output.address.clone()).or_insert(0) += output.amount;
        }

        self.transactions.push(BlockTx { id, tx });
        Ok(())
    }

    /// Recompute the derived state by replaying this block's transactions
    /// on top of `parent`. Any replay failure means the block lies about
    /// its contents and must be rejected.
    pub fn rerun(&mut self, parent: &Block) -> Result<(), BlockError> {
        self.balances = parent.balances.clone();
        self.next_nonce = parent.next_nonce.clone();
        self.credit_parent_reward(parent);

        let replay = std::mem::take(&mut self.transactions);
        for entry in replay {
            if let Err(err) = self.add_transaction(entry.tx) {
                debug!("replay failed: {}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Proof-of-work predicate: the canonical hash, read as a big-endian
    /// unsigned integer, must fall strictly below the target.
    pub fn has_valid_proof(&self) -> bool {
        let value = U256::from_big_endian(self.hash().as_bytes());
        value < self.target
    }

    pub fn is_genesis(&self) -> bool {
        self.chain_length == 0
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn next_nonce_of(&self, address: &Address) -> u64 {
        self.next_nonce.get(address).copied().unwrap_or(0)
    }

    /// The total paid to this block's winner once the block is built
    /// upon: the coinbase reward plus all transaction fees.
    pub fn total_rewards(&self) -> u64 {
        self.coinbase_reward + self.transactions.iter().map(|e| e.tx.get_fee()).sum::<u64>()
    }

    /// Whether the transaction id is in this very block. Ancestors are
    /// not consulted.
    pub fn contains(&self, id: &Hash) -> bool {
        self.transactions.iter().any(|e| &e.id == id)
    }

    pub fn get_prev_block_hash(&self) -> Option<&Hash> {
        self.prev_block_hash.as_ref()
    }

    pub fn get_target(&self) -> &U256 {
        &self.target
    }

    pub fn get_proof(&self) -> u32 {
        self.proof
    }

    pub fn set_proof(&mut self, proof: u32) {
        self.proof = proof;
    }

    pub fn get_chain_length(&self) -> u64 {
        self.chain_length
    }

    pub fn get_timestamp(&self) -> TimestampMillis {
        self.timestamp
    }

    pub fn get_reward_addr(&self) -> Option<&Address> {
        self.reward_addr.as_ref()
    }

    pub fn get_coinbase_reward(&self) -> u64 {
        self.coinbase_reward
    }

    pub fn get_transactions(&self) -> &[BlockTx] {
        &self.transactions
    }

    pub fn get_balances(&self) -> &IndexMap<Address, u64> {
        &self.balances
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash {
        hash(&canonical_json(&CanonicalBlock {
            prev_block_hash: &self.prev_block_hash,
            target: &self.target,
            proof: self.proof,
            transactions: &self.transactions,
            chain_length: self.chain_length,
            timestamp: self.timestamp,
            reward_addr: &self.reward_addr,
            coinbase_reward: self.coinbase_reward,
        }))
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Block[height: {}, txs: {}, proof: {}, prev: {}]",
            self.chain_length,
            self.transactions.len(),
            self.proof,
            match &self.prev_block_hash {
                Some(hash) => hash.to_hex(),
                None => "genesis".to_owned(),
            }
        )
    }
}
