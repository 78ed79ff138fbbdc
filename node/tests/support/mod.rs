//! Shared helpers for the end-to-end tests: short RSA keys and easy
//! proof-of-work targets keep the scenarios fast, and the polling waits
//! absorb the bus's task-spawned delivery.

#![allow(dead_code)]

use indexmap::IndexMap;
use pyrite_common::{
    block::Block,
    config::calc_target,
    crypto::{Hash, Hashable, KeyPair},
    genesis::make_genesis_with_target,
};
use pyrite_node::{
    miner::{Miner, MinerConfig},
    peer::{Participant, Peer},
};
use std::{sync::Once, time::Duration};

// 512-bit keys are cryptographically weak but orders of magnitude
// faster to generate, which is all that matters here.
pub const TEST_KEY_BITS: usize = 512;

// One winning hash in 16: a couple of attempts per block
pub const TEST_TARGET_BITS: u32 = 4;

const WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = pyrite_node::logger::init(log::LevelFilter::Warn);
    });
}

pub fn test_keys() -> KeyPair {
    KeyPair::with_bits(TEST_KEY_BITS).unwrap()
}

pub fn easy_config() -> MinerConfig {
    MinerConfig {
        mining_rounds: 200,
        target: calc_target(TEST_TARGET_BITS),
        ..MinerConfig::default()
    }
}

pub fn genesis_for(balances: &[(&KeyPair, u64)]) -> Block {
    let mut map = IndexMap::new();
    for (keys, amount) in balances {
        map.insert(keys.address(), *amount);
    }
    make_genesis_with_target(map, calc_target(TEST_TARGET_BITS)).unwrap()
}

/// Search the proof in-place. Only sensible with an easy target.
pub fn mine(block: &mut Block) {
    while !block.has_valid_proof() {
        block.set_proof(block.get_proof() + 1);
    }
}

/// Drive a miner's one-shot search until its chain reaches `height`.
pub async fn mine_until_height(miner: &Miner, height: u64) {
    for _ in 0..1_000 {
        miner.find_proof(true).await;
        let reached = miner
            .peer()
            .last_block()
            .await
            .map_or(false, |tip| tip.get_chain_length() >= height);
        if reached {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("miner never reached height {}", height);
}

pub async fn wait_for_height(peer: &Peer, height: u64) {
    wait(&format!("height {}", height), move || async move {
        peer.last_block()
            .await
            .map_or(false, |tip| tip.get_chain_length() >= height)
    })
    .await;
}

pub async fn wait_for_tip(peer: &Peer, id: &Hash) {
    wait(&format!("tip {}", id), move || async move {
        peer.last_block().await.map_or(false, |tip| &tip.hash() == id)
    })
    .await;
}

pub async fn wait_for_known_blocks(peer: &Peer, count: usize) {
    wait(&format!("{} known blocks", count), move || async move {
        peer.known_block_count().await >= count
    })
    .await;
}

pub async fn wait_for_queued(miner: &Miner, count: usize) {
    wait(&format!("{} queued transactions", count), move || async move {
        miner.queued_transaction_count().await >= count
    })
    .await;
}

async fn wait<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
