//! The message bus between peers.
//!
//! The bus is a named-topic publish/subscribe abstraction: any substrate
//! offering `broadcast` and a targeted `send_message` can carry a pyrite
//! network. [`LocalBus`] is the in-process implementation used by tests
//! and simulations. Delivery order across topics is not guaranteed, and
//! receivers must tolerate a block arriving before its ancestors.

use async_trait::async_trait;
use log::warn;
use pyrite_common::crypto::Address;
use std::{
    collections::HashMap,
    fmt::{Display, Error as FmtError, Formatter},
    sync::{Arc, RwLock},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Topic {
    PostTransaction,
    ProofFound,
    MissingBlock,
    StartMining,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PostTransaction => "POST_TRANSACTION",
            Topic::ProofFound => "PROOF_FOUND",
            Topic::MissingBlock => "MISSING_BLOCK",
            Topic::StartMining => "START_MINING",
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.as_str())
    }
}

/// A party reachable through the bus. Deliveries are dispatched as
/// independent tasks, so a handler only ever competes with itself for its
/// own internal locks.
#[async_trait]
pub trait BusHandler: Send + Sync + 'static {
    fn address(&self) -> Address;

    async fn deliver(self: Arc<Self>, topic: Topic, payload: Vec<u8>);
}

pub trait Bus: Send + Sync {
    fn register(&self, handler: Arc<dyn BusHandler>);

    /// Fan a message out to every registered handler, sender included.
    fn broadcast(&self, topic: Topic, payload: Vec<u8>);

    /// Deliver a message to one handler, identified by address.
    fn send_message(&self, to: &Address, topic: Topic, payload: Vec<u8>);
}

/// In-process bus: a registry of handlers, fan-out by task spawn.
#[derive(Default)]
pub struct LocalBus {
    handlers: RwLock<HashMap<Address, Arc<dyn BusHandler>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalBus::default())
    }
}

impl Bus for LocalBus {
    fn register(&self, handler: Arc<dyn BusHandler>) {
        let mut handlers = self.handlers.write().expect("bus registry lock poisoned");
        handlers.insert(handler.address(), handler);
    }

    fn broadcast(&self, topic: Topic, payload: Vec<u8>) {
        let handlers: Vec<Arc<dyn BusHandler>> = {
            let registry = self.handlers.read().expect("bus registry lock poisoned");
            registry.values().cloned().collect()
        };
        for handler in handlers {
            let payload = payload.clone();
            tokio::spawn(async move {
                handler.deliver(topic, payload).await;
            });
        }
    }

    fn send_message(&self, to: &Address, topic: Topic, payload: Vec<u8>) {
        let handler = {
            let registry = self.handlers.read().expect("bus registry lock poisoned");
            registry.get(to).cloned()
        };
        match handler {
            Some(handler) => {
                tokio::spawn(async move {
                    handler.deliver(topic, payload).await;
                });
            }
            None => warn!("no handler registered at {} for {}", to, topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrite_common::crypto::hash;
    use std::str::FromStr;
    use tokio::sync::mpsc;

    struct Probe {
        address: Address,
        inbox: mpsc::UnboundedSender<(Topic, Vec<u8>)>,
    }

    #[async_trait]
    impl BusHandler for Probe {
        fn address(&self) -> Address {
            self.address.clone()
        }

        async fn deliver(self: Arc<Self>, topic: Topic, payload: Vec<u8>) {
            let _ = self.inbox.send((topic, payload));
        }
    }

    fn probe(seed: &[u8]) -> (Arc<Probe>, mpsc::UnboundedReceiver<(Topic, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = Address::from_str(&hash(seed).to_hex()).unwrap();
        (Arc::new(Probe { address, inbox: tx }), rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_handler() {
        let bus = LocalBus::new();
        let (a, mut rx_a) = probe(b"a");
        let (b, mut rx_b) = probe(b"b");
        bus.register(a);
        bus.register(b);

        bus.broadcast(Topic::ProofFound, b"payload".to_vec());

        let (topic, payload) = rx_a.recv().await.unwrap();
        assert_eq!(topic, Topic::ProofFound);
        assert_eq!(payload, b"payload");
        let (topic, _) = rx_b.recv().await.unwrap();
        assert_eq!(topic, Topic::ProofFound);
    }

    #[tokio::test]
    async fn test_send_message_targets_one_handler() {
        let bus = LocalBus::new();
        let (a, mut rx_a) = probe(b"a");
        let (b, mut rx_b) = probe(b"b");
        let to = a.address();
        bus.register(a);
        bus.register(b);

        bus.send_message(&to, Topic::MissingBlock, b"request".to_vec());

        let (topic, _) = rx_a.recv().await.unwrap();
        assert_eq!(topic, Topic::MissingBlock);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_topic_wire_names() {
        assert_eq!(Topic::PostTransaction.as_str(), "POST_TRANSACTION");
        assert_eq!(Topic::ProofFound.as_str(), "PROOF_FOUND");
        assert_eq!(Topic::MissingBlock.as_str(), "MISSING_BLOCK");
        assert_eq!(Topic::StartMining.as_str(), "START_MINING");
    }
}
