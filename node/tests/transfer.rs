mod support;

use pyrite_common::{
    config::DEFAULT_TX_FEE,
    crypto::Hashable,
    transaction::Output,
};
use pyrite_node::{
    bus::{Bus, LocalBus},
    error::NodeError,
    miner::Miner,
    peer::{Participant, Peer},
};
use std::sync::Arc;
use support::*;

#[tokio::test(flavor = "multi_thread")]
async fn genesis_balances_visible_to_every_peer() {
    init_logger();
    let alice_keys = test_keys();
    let bob_keys = test_keys();
    let cindy_keys = test_keys();
    let minnie_keys = test_keys();
    let mickey_keys = test_keys();
    let genesis = genesis_for(&[
        (&alice_keys, 233),
        (&bob_keys, 99),
        (&cindy_keys, 67),
        (&minnie_keys, 400),
        (&mickey_keys, 300),
    ]);
    let alice_addr = alice_keys.address();

    let bus = LocalBus::new();
    let alice = Arc::new(Peer::with_keys(
        "Alice",
        bus.clone(),
        Some(genesis.clone()),
        alice_keys,
    ));

    // A peer with no starting block grafts genesis through the normal
    // receive path and sees the same balances immediately.
    let late = Arc::new(Peer::with_keys("Late", bus.clone(), None, test_keys()));
    late.receive_block(genesis.clone()).await;

    // Installing it explicitly works exactly once
    let configured = Arc::new(Peer::with_keys("Configured", bus.clone(), None, test_keys()));
    configured.set_genesis(genesis.clone()).await.unwrap();
    assert!(matches!(
        configured.set_genesis(genesis.clone()).await,
        Err(NodeError::GenesisAlreadySet)
    ));

    for peer in [&alice, &late, &configured] {
        let tip = peer.last_block().await.unwrap();
        assert_eq!(tip.hash(), genesis.hash());
        assert_eq!(tip.balance_of(&alice_addr), 233);
        assert_eq!(tip.balance_of(&bob_keys.address()), 99);
        assert_eq!(tip.balance_of(&cindy_keys.address()), 67);
        assert_eq!(tip.balance_of(&minnie_keys.address()), 400);
        assert_eq!(tip.balance_of(&mickey_keys.address()), 300);
    }
    assert_eq!(alice.confirmed_balance().await.unwrap(), 233);
}

#[tokio::test(flavor = "multi_thread")]
async fn simple_transfer_confirms_with_fees_to_the_miner() -> anyhow::Result<()> {
    init_logger();
    let alice_keys = test_keys();
    let bob_keys = test_keys();
    let minnie_keys = test_keys();
    let genesis = genesis_for(&[(&alice_keys, 233), (&bob_keys, 99), (&minnie_keys, 400)]);
    let bob_addr = bob_keys.address();

    let bus = LocalBus::new();
    let alice = Arc::new(Peer::with_keys(
        "Alice",
        bus.clone(),
        Some(genesis.clone()),
        alice_keys,
    ));
    let bob = Arc::new(Peer::with_keys(
        "Bob",
        bus.clone(),
        Some(genesis.clone()),
        bob_keys,
    ));
    let minnie = Arc::new(Miner::with_keys(
        "Minnie",
        bus.clone(),
        Some(genesis.clone()),
        minnie_keys,
        easy_config(),
    ));
    bus.register(alice.clone());
    bus.register(bob.clone());
    bus.register(minnie.clone());

    let tx = alice
        .post_transaction(
            vec![Output {
                address: bob_addr.clone(),
                amount: 40,
            }],
            DEFAULT_TX_FEE,
        )
        .await?;
    assert_eq!(alice.pending_outgoing_count().await, 1);
    wait_for_queued(&minnie, 1).await;

    // The first block carries the transfer...
    minnie.start_new_search(Vec::new()).await;
    let candidate = minnie.current_block().await.unwrap();
    assert!(candidate.contains(&tx.hash()));

    // ...and six blocks on top of it confirm it
    mine_until_height(&minnie, 8).await;
    wait_for_height(&alice, 8).await;
    wait_for_height(&bob, 8).await;

    assert_eq!(alice.confirmed_balance().await?, 192);
    assert_eq!(bob.confirmed_balance().await?, 139);
    assert_eq!(minnie.peer().confirmed_balance().await?, 426);

    // The confirmed block sits six behind the tip, with the transfer in
    // its prefix
    let confirmed = alice.last_confirmed_block().await.unwrap();
    assert_eq!(confirmed.get_chain_length(), 2);
    let balances = alice.confirmed_balances().await?;
    assert_eq!(balances.get(&bob_addr).copied(), Some(139));

    // Confirmation released the pending spend
    assert_eq!(alice.pending_outgoing_count().await, 0);
    assert_eq!(alice.available_gold().await?, 192);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_transaction_is_refused() {
    init_logger();
    let alice_keys = test_keys();
    let bob_keys = test_keys();
    let minnie_keys = test_keys();
    let genesis = genesis_for(&[(&alice_keys, 233), (&bob_keys, 99), (&minnie_keys, 400)]);
    let alice_addr = alice_keys.address();
    let bob_addr = bob_keys.address();

    let bus = LocalBus::new();
    let alice = Arc::new(Peer::with_keys(
        "Alice",
        bus.clone(),
        Some(genesis.clone()),
        alice_keys,
    ));
    let minnie = Arc::new(Miner::with_keys(
        "Minnie",
        bus.clone(),
        Some(genesis.clone()),
        minnie_keys,
        easy_config(),
    ));
    bus.register(alice.clone());
    bus.register(minnie.clone());

    let tx = alice
        .post_transaction(
            vec![Output {
                address: bob_addr.clone(),
                amount: 40,
            }],
            DEFAULT_TX_FEE,
        )
        .await
        .unwrap();
    wait_for_queued(&minnie, 1).await;
    minnie.start_new_search(Vec::new()).await;
    mine_until_height(&minnie, 1).await;

    let spent = minnie.peer().last_block().await.unwrap();
    assert!(spent.contains(&tx.hash()));
    assert_eq!(spent.balance_of(&alice_addr), 192);

    // The exact same signed transaction comes back around: it is still
    // in Alice's pending set, so a resend rebroadcasts it verbatim.
    alice.resend_pending_transactions().await.unwrap();
    wait_for_queued(&minnie, 1).await;
    minnie.start_new_search(Vec::new()).await;

    // The replay does not make it into the next block
    let candidate = minnie.current_block().await.unwrap();
    assert!(candidate.get_transactions().is_empty());

    mine_until_height(&minnie, 2).await;
    let tip = minnie.peer().last_block().await.unwrap();
    assert_eq!(tip.balance_of(&alice_addr), 192);
    assert_eq!(tip.balance_of(&bob_addr), 139);
}

#[tokio::test(flavor = "multi_thread")]
async fn overspend_fails_before_any_broadcast() {
    init_logger();
    let alice_keys = test_keys();
    let minnie_keys = test_keys();
    let genesis = genesis_for(&[(&alice_keys, 233), (&minnie_keys, 400)]);
    let minnie_addr = minnie_keys.address();

    let bus = LocalBus::new();
    let alice = Arc::new(Peer::with_keys(
        "Alice",
        bus.clone(),
        Some(genesis.clone()),
        alice_keys,
    ));
    let minnie = Arc::new(Miner::with_keys(
        "Minnie",
        bus.clone(),
        Some(genesis.clone()),
        minnie_keys,
        easy_config(),
    ));
    bus.register(alice.clone());
    bus.register(minnie.clone());

    let result = alice
        .post_transaction(
            vec![Output {
                address: minnie_addr,
                amount: 300,
            }],
            DEFAULT_TX_FEE,
        )
        .await;
    assert!(matches!(
        result,
        Err(NodeError::InsufficientBalance {
            need: 301,
            have: 233
        })
    ));

    // Nothing was recorded or sent
    assert_eq!(alice.pending_outgoing_count().await, 0);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(minnie.queued_transaction_count().await, 0);
}
