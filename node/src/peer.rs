//! Network participants and their chain state.
//!
//! A [`Peer`] owns a keypair, an address and a single coarse lock over
//! all of its mutable state: the block store, the orphan index, pending
//! outgoing transactions and the chain tips. Message handlers run to
//! completion under that lock; concurrency exists only across peers.
//!
//! The [`Participant`] trait carries the receive path shared by plain
//! peers and miners: a miner is a peer plus a mining loop, and both graft
//! received blocks through the exact same code.

use crate::{
    bus::{Bus, BusHandler, Topic},
    error::NodeError,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, info, warn};
use pyrite_common::{
    block::Block,
    config::CONFIRMED_DEPTH,
    crypto::{canonical_json, Address, Hash, Hashable, KeyPair},
    transaction::{Output, Transaction},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::Mutex;

// Broadcast by a peer that received a block it cannot connect yet.
// Whoever holds the missing block answers with a targeted PROOF_FOUND.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct MissingBlockRequest {
    pub address: Address,
    pub prev_block_hash: Hash,
}

pub struct Peer {
    name: String,
    keys: KeyPair,
    address: Address,
    bus: Arc<dyn Bus>,
    pub(crate) state: Mutex<PeerState>,
}

pub(crate) struct PeerState {
    // Every accepted block, by id. Blocks are immutable once in here.
    pub(crate) blocks: HashMap<Hash, Arc<Block>>,
    // Orphans waiting for an ancestor, keyed by the missing parent id
    pub(crate) pending_blocks: HashMap<Hash, Vec<Block>>,
    // Spends of ours not yet confirmed; their value counts as unavailable
    pub(crate) pending_outgoing: IndexMap<Hash, Transaction>,
    // Tip of the locally preferred chain
    pub(crate) last_block: Option<Arc<Block>>,
    // Ancestor of the tip at CONFIRMED_DEPTH, genesis if shallower
    pub(crate) last_confirmed_block: Option<Arc<Block>>,
    // Next nonce for transactions posted by this peer
    pub(crate) nonce: u64,
}

impl PeerState {
    fn new(genesis: Option<Block>) -> Self {
        let mut state = PeerState {
            blocks: HashMap::new(),
            pending_blocks: HashMap::new(),
            pending_outgoing: IndexMap::new(),
            last_block: None,
            last_confirmed_block: None,
            nonce: 0,
        };
        if let Some(genesis) = genesis {
            state.install_genesis(genesis);
        }
        state
    }

    fn install_genesis(&mut self, genesis: Block) {
        let genesis = Arc::new(genesis);
        self.blocks.insert(genesis.hash(), genesis.clone());
        self.last_block = Some(genesis.clone());
        self.last_confirmed_block = Some(genesis);
    }

    fn confirmed(&self) -> Result<&Arc<Block>, NodeError> {
        self.last_confirmed_block
            .as_ref()
            .ok_or(NodeError::MissingGenesis)
    }

    // Gold in the confirmed block minus everything promised away in
    // still-pending transactions, floored at zero.
    fn available_gold(&self, address: &Address) -> Result<u64, NodeError> {
        let confirmed = self.confirmed()?.balance_of(address);
        let pending_spent: u64 = self
            .pending_outgoing
            .values()
            .map(|tx| tx.total_output())
            .sum();
        Ok(confirmed.saturating_sub(pending_spent))
    }

    // Recompute the confirmed block after the tip advanced, then drop
    // pending outgoing transactions contained anywhere in the confirmed
    // prefix.
    fn set_last_confirmed(&mut self) {
        let Some(tip) = self.last_block.clone() else {
            return;
        };
        let confirmed_height = tip.get_chain_length().saturating_sub(CONFIRMED_DEPTH);
        let mut block = tip;
        while block.get_chain_length() > confirmed_height {
            match self.parent_of(&block) {
                Some(parent) => block = parent,
                None => break,
            }
        }
        self.last_confirmed_block = Some(block.clone());

        if self.pending_outgoing.is_empty() {
            return;
        }
        let mut cursor = Some(block);
        while let Some(block) = cursor {
            self.pending_outgoing.retain(|id, _| !block.contains(id));
            cursor = self.parent_of(&block);
        }
    }

    pub(crate) fn parent_of(&self, block: &Block) -> Option<Arc<Block>> {
        block
            .get_prev_block_hash()
            .and_then(|hash| self.blocks.get(hash))
            .cloned()
    }
}

impl Peer {
    /// Create a peer with a freshly generated keypair.
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn Bus>,
        genesis: Option<Block>,
    ) -> Result<Self, NodeError> {
        let keys = KeyPair::new()?;
        Ok(Self::with_keys(name, bus, genesis, keys))
    }

    /// Create a peer around an existing keypair.
    pub fn with_keys(
        name: impl Into<String>,
        bus: Arc<dyn Bus>,
        genesis: Option<Block>,
        keys: KeyPair,
    ) -> Self {
        Peer {
            name: name.into(),
            address: keys.address(),
            keys,
            bus,
            state: Mutex::new(PeerState::new(genesis)),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Install the starting block. Refused once a chain exists.
    pub async fn set_genesis(&self, genesis: Block) -> Result<(), NodeError> {
        let mut state = self.state.lock().await;
        if state.last_block.is_some() {
            return Err(NodeError::GenesisAlreadySet);
        }
        state.install_genesis(genesis);
        Ok(())
    }

    /// Validate a received block and connect it to the chain store.
    ///
    /// Returns the accepted block and any orphans that were waiting for
    /// it, so the caller can feed them back through the receive path.
    /// `None` means the block was already known, discarded, or stashed
    /// pending a missing ancestor.
    pub(crate) async fn graft(&self, block: Block) -> Option<(Arc<Block>, Vec<Block>)> {
        let mut state = self.state.lock().await;

        let id = block.hash();
        if state.blocks.contains_key(&id) {
            return None;
        }
        if !block.is_genesis() && !block.has_valid_proof() {
            warn!("{}: block {} does not have a valid proof", self.name, id);
            return None;
        }

        let mut block = block;
        if !block.is_genesis() {
            let Some(prev_hash) = block.get_prev_block_hash().cloned() else {
                warn!("{}: block {} is missing its parent hash", self.name, id);
                return None;
            };
            let Some(parent) = state.blocks.get(&prev_hash).cloned() else {
                // Stash the orphan; ask the network once per missing parent
                match state.pending_blocks.entry(prev_hash.clone()) {
                    Entry::Vacant(waiters) => {
                        waiters.insert(vec![block]);
                        self.request_missing_block(&prev_hash);
                    }
                    Entry::Occupied(mut waiters) => {
                        if !waiters.get().iter().any(|waiting| waiting.hash() == id) {
                            waiters.get_mut().push(block);
                        }
                    }
                }
                return None;
            };
            if let Err(err) = block.rerun(&parent) {
                warn!("{}: dropping block {}: {}", self.name, id, err);
                return None;
            }
        }

        let block = Arc::new(block);
        state.blocks.insert(id.clone(), block.clone());

        // Strictly longer chains displace the tip; ties keep the first
        // block seen, biasing each peer toward its own view.
        let extended = state
            .last_block
            .as_ref()
            .map_or(true, |tip| block.get_chain_length() > tip.get_chain_length());
        if extended {
            state.last_block = Some(block.clone());
            state.set_last_confirmed();
        }

        let unstuck = state.pending_blocks.remove(&id).unwrap_or_default();
        info!(
            "{}: block {} accepted at height {}",
            self.name,
            id,
            block.get_chain_length()
        );
        Some((block, unstuck))
    }

    fn request_missing_block(&self, prev_block_hash: &Hash) {
        info!("{}: asking for missing block {}", self.name, prev_block_hash);
        let request = MissingBlockRequest {
            address: self.address.clone(),
            prev_block_hash: prev_block_hash.clone(),
        };
        self.bus
            .broadcast(Topic::MissingBlock, canonical_json(&request));
    }

    /// Answer a missing-block request if we hold the block, with a
    /// targeted reply on the PROOF_FOUND topic.
    pub async fn provide_missing_block(&self, request: MissingBlockRequest) {
        let state = self.state.lock().await;
        if let Some(block) = state.blocks.get(&request.prev_block_hash) {
            info!(
                "{}: providing missing block {}",
                self.name, request.prev_block_hash
            );
            let payload = canonical_json(block.as_ref());
            self.bus
                .send_message(&request.address, Topic::ProofFound, payload);
        }
    }

    /// Build, sign and broadcast a transfer to the given outputs.
    ///
    /// Fails without broadcasting anything when the total (fee included)
    /// exceeds the gold this peer can currently spend.
    pub async fn post_transaction(
        &self,
        outputs: Vec<Output>,
        fee: u64,
    ) -> Result<Transaction, NodeError> {
        let mut state = self.state.lock().await;

        let total = fee + outputs.iter().map(|o| o.amount).sum::<u64>();
        let available = state.available_gold(&self.address)?;
        if total > available {
            return Err(NodeError::InsufficientBalance {
                need: total,
                have: available,
            });
        }

        let mut tx = Transaction::new(
            self.address.clone(),
            state.nonce,
            self.keys.get_public_key().clone(),
            fee,
            outputs,
            Vec::new(),
        )?;
        tx.sign(&self.keys)?;

        state.pending_outgoing.insert(tx.hash(), tx.clone());
        state.nonce += 1;

        self.bus
            .broadcast(Topic::PostTransaction, serde_json::to_vec(&tx)?);
        Ok(tx)
    }

    /// Rebroadcast every pending outgoing transaction.
    pub async fn resend_pending_transactions(&self) -> Result<(), NodeError> {
        let state = self.state.lock().await;
        for tx in state.pending_outgoing.values() {
            self.bus
                .broadcast(Topic::PostTransaction, serde_json::to_vec(tx)?);
        }
        Ok(())
    }

    /// Gold of ours in the last confirmed block.
    pub async fn confirmed_balance(&self) -> Result<u64, NodeError> {
        let state = self.state.lock().await;
        Ok(state.confirmed()?.balance_of(&self.address))
    }

    /// Confirmed gold minus the value tied up in pending transactions.
    pub async fn available_gold(&self) -> Result<u64, NodeError> {
        let state = self.state.lock().await;
        state.available_gold(&self.address)
    }

    /// All confirmed balances, for display and diagnostics.
    pub async fn confirmed_balances(&self) -> Result<IndexMap<Address, u64>, NodeError> {
        let state = self.state.lock().await;
        Ok(state.confirmed()?.get_balances().clone())
    }

    pub async fn last_block(&self) -> Option<Arc<Block>> {
        self.state.lock().await.last_block.clone()
    }

    pub async fn last_confirmed_block(&self) -> Option<Arc<Block>> {
        self.state.lock().await.last_confirmed_block.clone()
    }

    /// Block ids from the tip back to genesis.
    pub async fn blockchain_ids(&self) -> Vec<Hash> {
        let state = self.state.lock().await;
        let mut ids = Vec::new();
        let mut cursor = state.last_block.clone();
        while let Some(block) = cursor {
            ids.push(block.hash());
            cursor = state.parent_of(&block);
        }
        ids
    }

    pub async fn known_block_count(&self) -> usize {
        self.state.lock().await.blocks.len()
    }

    pub async fn pending_outgoing_count(&self) -> usize {
        self.state.lock().await.pending_outgoing.len()
    }
}

/// A party on the network: a peer, or a miner wrapping one.
///
/// The default `receive_block` is the single receive path both use; the
/// hooks let a miner react to queued transactions, mining signals and
/// accepted blocks without duplicating any of it.
#[async_trait]
pub trait Participant: Send + Sync + Sized + 'static {
    fn peer(&self) -> &Peer;

    /// A transaction was posted on the network. Plain peers ignore it.
    async fn on_transaction(&self, tx: Transaction) {
        debug!(
            "{}: ignoring posted transaction {}",
            self.peer().get_name(),
            tx.hash()
        );
    }

    /// The self-directed mining signal. Plain peers ignore it.
    async fn on_start_mining(self: Arc<Self>, _one_shot: bool) {}

    /// Called after each block lands in the chain store.
    async fn after_accept(&self, _block: &Arc<Block>) {}

    /// Graft a block, then drain any orphans it unstuck through the same
    /// path. Re-delivery of a known block is a no-op.
    async fn receive_block(&self, block: Block) {
        let mut queue = VecDeque::new();
        queue.push_back(block);
        while let Some(next) = queue.pop_front() {
            if let Some((accepted, unstuck)) = self.peer().graft(next).await {
                for waiting in unstuck {
                    debug!(
                        "{}: processing unstuck block {}",
                        self.peer().get_name(),
                        waiting.hash()
                    );
                    queue.push_back(waiting);
                }
                self.after_accept(&accepted).await;
            }
        }
    }
}

#[async_trait]
impl Participant for Peer {
    fn peer(&self) -> &Peer {
        self
    }
}

// Decode a bus payload and route it to the right participant hook.
// Malformed payloads are logged and dropped, never fatal.
pub(crate) async fn dispatch<P: Participant>(participant: Arc<P>, topic: Topic, payload: Vec<u8>) {
    match topic {
        Topic::ProofFound => match serde_json::from_slice::<Block>(&payload) {
            Ok(block) => participant.receive_block(block).await,
            Err(err) => warn!(
                "{}: dropping malformed block on {}: {}",
                participant.peer().get_name(),
                topic,
                err
            ),
        },
        Topic::PostTransaction => match serde_json::from_slice::<Transaction>(&payload) {
            Ok(tx) => participant.on_transaction(tx).await,
            Err(err) => warn!(
                "{}: dropping malformed transaction on {}: {}",
                participant.peer().get_name(),
                topic,
                err
            ),
        },
        Topic::MissingBlock => match serde_json::from_slice::<MissingBlockRequest>(&payload) {
            Ok(request) => participant.peer().provide_missing_block(request).await,
            Err(err) => warn!(
                "{}: dropping malformed request on {}: {}",
                participant.peer().get_name(),
                topic,
                err
            ),
        },
        Topic::StartMining => match serde_json::from_slice::<bool>(&payload) {
            Ok(one_shot) => participant.on_start_mining(one_shot).await,
            Err(err) => warn!(
                "{}: dropping malformed signal on {}: {}",
                participant.peer().get_name(),
                topic,
                err
            ),
        },
    }
}

#[async_trait]
impl BusHandler for Peer {
    fn address(&self) -> Address {
        self.address.clone()
    }

    async fn deliver(self: Arc<Self>, topic: Topic, payload: Vec<u8>) {
        dispatch(self, topic, payload).await;
    }
}
