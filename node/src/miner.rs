//! The mining loop.
//!
//! A miner is a peer plus a cooperative proof search. The search runs in
//! batches of `mining_rounds` attempts; between batches the miner posts
//! the START_MINING signal back to itself through the bus, which yields
//! to any queued message handlers. When the tip moves to a chain at
//! least as long as the block being mined, the miner cuts over: it
//! revives every transaction of its abandoned branch that the new branch
//! does not carry, and starts a fresh search on the new tip.
//!
//! Lock order: `mining` before the peer state, never the reverse.

use crate::{
    bus::{Bus, BusHandler, Topic},
    error::NodeError,
    peer::{dispatch, Participant, Peer, PeerState},
};
use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, info, warn};
use pyrite_common::{
    block::Block,
    config::{default_target, COINBASE_AMT_ALLOWED, NUM_ROUNDS_MINING},
    crypto::{canonical_json, Address, Hash, Hashable, KeyPair},
    transaction::Transaction,
};
use primitive_types::U256;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct MinerConfig {
    // Proof attempts per batch before yielding to the bus
    pub mining_rounds: u32,
    // Upper bound a winning block hash must fall below
    pub target: U256,
    // Reward attached to each block this miner seals
    pub coinbase_reward: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            mining_rounds: NUM_ROUNDS_MINING,
            target: default_target(),
            coinbase_reward: COINBASE_AMT_ALLOWED,
        }
    }
}

pub struct Miner {
    peer: Peer,
    config: MinerConfig,
    mining: Mutex<MiningState>,
}

#[derive(Default)]
struct MiningState {
    // The block whose proof is being searched. None until initialized.
    current_block: Option<Block>,
    // Transactions queued for the next search, keyed by id
    queue: IndexMap<Hash, Transaction>,
}

impl Miner {
    /// Create a miner with a freshly generated keypair.
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn Bus>,
        genesis: Option<Block>,
        config: MinerConfig,
    ) -> Result<Self, NodeError> {
        let keys = KeyPair::new()?;
        Ok(Self::with_keys(name, bus, genesis, keys, config))
    }

    /// Create a miner around an existing keypair.
    pub fn with_keys(
        name: impl Into<String>,
        bus: Arc<dyn Bus>,
        genesis: Option<Block>,
        keys: KeyPair,
        config: MinerConfig,
    ) -> Self {
        Miner {
            peer: Peer::with_keys(name, bus, genesis, keys),
            config,
            mining: Mutex::new(MiningState::default()),
        }
    }

    /// Set up the first search and post the mining signal. The miner
    /// must already be registered on the bus.
    pub async fn initialize(&self) {
        self.start_new_search(Vec::new()).await;
        self.post_start_mining(false);
    }

    fn post_start_mining(&self, one_shot: bool) {
        self.peer.bus().send_message(
            self.peer.get_address(),
            Topic::StartMining,
            canonical_json(&one_shot),
        );
    }

    /// Begin mining a fresh block on the current tip. `revived`
    /// transactions (survivors of a reorg) are merged into the queue;
    /// everything queued is then offered to the new block, and whatever
    /// the block refuses (stale nonces, spent funds) is dropped for this
    /// search.
    pub async fn start_new_search(&self, revived: Vec<Transaction>) {
        let mut mining = self.mining.lock().await;
        let state = self.peer.state.lock().await;
        self.start_search_locked(&mut mining, &state, revived);
    }

    fn start_search_locked(
        &self,
        mining: &mut MiningState,
        state: &PeerState,
        revived: Vec<Transaction>,
    ) {
        let Some(parent) = state.last_block.clone() else {
            warn!(
                "{}: cannot mine without a starting block",
                self.peer.get_name()
            );
            return;
        };

        let mut block = Block::new(
            Some(self.peer.get_address().clone()),
            Some(parent.as_ref()),
            self.config.target,
            self.config.coinbase_reward,
        );

        for tx in revived {
            mining.queue.entry(tx.hash()).or_insert(tx);
        }
        for (id, tx) in mining.queue.drain(..) {
            if let Err(err) = block.add_transaction(tx) {
                debug!(
                    "{}: leaving transaction {} out of this search: {}",
                    self.peer.get_name(),
                    id,
                    err
                );
            }
        }

        block.set_proof(0);
        mining.current_block = Some(block);
    }

    /// Try up to `mining_rounds` proofs, then yield. On success the
    /// sealed block is announced and fed through our own receive path,
    /// which stores it and kicks off the next search. Unless `one_shot`
    /// (a testing hook), the mining signal is re-posted at the end.
    pub async fn find_proof(&self, one_shot: bool) {
        let sealed = {
            let mut mining = self.mining.lock().await;
            let Some(block) = mining.current_block.as_mut() else {
                // Nothing to mine; do not re-post the signal either
                return;
            };
            let mut sealed = None;
            let mut rounds = 0;
            while rounds < self.config.mining_rounds {
                if block.has_valid_proof() {
                    info!(
                        "{}: found proof for block {}: {}",
                        self.peer.get_name(),
                        block.get_chain_length(),
                        block.get_proof()
                    );
                    sealed = Some(block.clone());
                    break;
                }
                block.set_proof(block.get_proof().wrapping_add(1));
                rounds += 1;
            }
            sealed
        };

        if let Some(block) = sealed {
            self.announce_proof(&block);
            self.receive_block(block).await;
        }

        if !one_shot {
            self.post_start_mining(false);
        }
    }

    /// Broadcast the sealed block, proof included.
    pub fn announce_proof(&self, block: &Block) {
        self.peer
            .bus()
            .broadcast(Topic::ProofFound, canonical_json(block));
    }

    /// Queue a transaction for a future search.
    pub async fn enqueue_transaction(&self, tx: Transaction) {
        let mut mining = self.mining.lock().await;
        mining.queue.entry(tx.hash()).or_insert(tx);
    }

    pub async fn current_block(&self) -> Option<Block> {
        self.mining.lock().await.current_block.clone()
    }

    pub async fn queued_transaction_count(&self) -> usize {
        self.mining.lock().await.queue.len()
    }

    // The transactions of the abandoned branch that the adopted branch
    // does not contain. Walks both branches back to their common
    // ancestor: the new branch is first dropped to the candidate's
    // height, then both step parents in lockstep until their ids match
    // (or genesis is reached).
    fn revived_transactions(
        &self,
        current: &Block,
        new_tip: &Arc<Block>,
        state: &PeerState,
    ) -> Vec<Transaction> {
        let mut kept: IndexMap<Hash, Transaction> = IndexMap::new();
        let mut adopted: HashSet<Hash> = HashSet::new();

        let mut new_cursor = Some(new_tip.clone());
        while let Some(block) = new_cursor.clone() {
            if block.get_chain_length() <= current.get_chain_length() {
                break;
            }
            for entry in block.get_transactions() {
                adopted.insert(entry.id.clone());
            }
            new_cursor = state.parent_of(&block);
        }
        let Some(mut new_block) = new_cursor else {
            return Vec::new();
        };

        let mut old_block = current.clone();
        while old_block.hash() != new_block.hash() {
            for entry in old_block.get_transactions() {
                kept.insert(entry.id.clone(), entry.tx.clone());
            }
            for entry in new_block.get_transactions() {
                adopted.insert(entry.id.clone());
            }
            match (state.parent_of(&old_block), state.parent_of(&new_block)) {
                (Some(old_parent), Some(new_parent)) => {
                    old_block = (*old_parent).clone();
                    new_block = new_parent;
                }
                _ => break,
            }
        }

        kept.into_iter()
            .filter(|(id, _)| !adopted.contains(id))
            .map(|(_, tx)| tx)
            .collect()
    }
}

#[async_trait]
impl Participant for Miner {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    async fn on_transaction(&self, tx: Transaction) {
        debug!(
            "{}: queueing transaction {}",
            self.peer.get_name(),
            tx.hash()
        );
        self.enqueue_transaction(tx).await;
    }

    async fn on_start_mining(self: Arc<Self>, one_shot: bool) {
        self.find_proof(one_shot).await;
    }

    // Cut over whenever an accepted block reaches the height of the
    // block being mined: revive what the new branch dropped, then mine
    // on the new tip.
    async fn after_accept(&self, block: &Arc<Block>) {
        self.cut_over(block).await;
    }
}

#[async_trait]
impl BusHandler for Miner {
    fn address(&self) -> Address {
        self.peer.get_address().clone()
    }

    async fn deliver(self: Arc<Self>, topic: Topic, payload: Vec<u8>) {
        dispatch(self, topic, payload).await;
    }
}

impl Miner {
    async fn cut_over(&self, block: &Arc<Block>) {
        let mut mining = self.mining.lock().await;
        let Some(current) = mining.current_block.take() else {
            return;
        };
        if block.get_chain_length() < current.get_chain_length() {
            mining.current_block = Some(current);
            return;
        }

        info!("{}: cutting over to new chain", self.peer.get_name());
        let state = self.peer.state.lock().await;
        let revived = self.revived_transactions(&current, block, &state);
        self.start_search_locked(&mut mining, &state, revived);
    }
}
