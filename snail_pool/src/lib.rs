//! Snail pool: fruits waiting to be embedded in a mined snail block.
//!
//! Same actor shape as the transaction pool. Admission re-checks the PoW
//! seal, the freshness window against the current fast head, and that the
//! attested fast block is canonical and not already attested by a pool or
//! canonical fruit. A snail-chain reorg feeds reverted fruits back in
//! through [`SnailPool::readmit`].

use std::{collections::BTreeMap, sync::Arc};

use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    StreamExt as _,
};
use log::debug;
use minerva::Minerva;
use thiserror::Error;
use tokio::sync::broadcast;
use types::{params, BlockNumber, Fruit, H256};

const NEW_FRUIT_EVENT_CAPACITY: usize = 256;
const MAX_POOL_FRUITS: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum FruitPoolError {
    #[error("fruit is already known")]
    KnownFruit,
    #[error("fruit references a stale fast block")]
    NotFresh,
    #[error("fruit references an unknown or non-canonical fast block")]
    UnknownFastBlock,
    #[error("fast block is already attested by a canonical fruit")]
    AlreadyAttested,
    #[error("invalid fruit seal")]
    InvalidSeal,
    #[error("pool is full")]
    PoolFull,
}

/// Chain facts the pool needs, injected by the coordinator: the fast head
/// and canonical index for freshness, and the snail chain's fruit lookup
/// for duplicate detection.
pub trait ChainReader: Send + Sync {
    fn fast_head_number(&self) -> BlockNumber;
    fn canonical_fast_hash(&self, number: BlockNumber) -> Option<H256>;
    fn fruit_is_canonical(&self, fast_hash: H256) -> bool;
}

#[derive(Clone, Debug)]
pub struct NewFruitEvent {
    pub fruit: Fruit,
}

enum PoolMessage {
    Add(Box<Fruit>, Option<oneshot::Sender<Result<(), FruitPoolError>>>),
    Readmit(Vec<Fruit>),
    RemoveBatch(Vec<H256>),
    PendingFruits(oneshot::Sender<Vec<Fruit>>),
    Content(oneshot::Sender<BTreeMap<BlockNumber, Fruit>>),
    Inspect(oneshot::Sender<BTreeMap<BlockNumber, String>>),
    Stats(oneshot::Sender<usize>),
}

impl PoolMessage {
    fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("snail pool service has shut down");
        }
    }
}

#[derive(Clone)]
pub struct SnailPool {
    tx: UnboundedSender<PoolMessage>,
    new_fruit_events: broadcast::Sender<NewFruitEvent>,
}

impl SnailPool {
    #[must_use]
    pub fn new(engine: Arc<Minerva>, chain: Arc<dyn ChainReader>) -> (Self, Service) {
        let (tx, rx) = unbounded();
        let new_fruit_events = broadcast::channel(NEW_FRUIT_EVENT_CAPACITY).0;

        let pool = Self {
            tx,
            new_fruit_events: new_fruit_events.clone(),
        };

        let service = Service {
            engine,
            chain,
            fruits: BTreeMap::new(),
            rx,
            new_fruit_events,
        };

        (pool, service)
    }

    pub async fn add(&self, fruit: Fruit) -> Result<(), FruitPoolError> {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Add(Box::new(fruit), Some(sender)).send(&self.tx);
        receiver.await.unwrap_or(Err(FruitPoolError::PoolFull))
    }

    pub fn notify_add(&self, fruit: Fruit) {
        PoolMessage::Add(Box::new(fruit), None).send(&self.tx);
    }

    /// Re-admission path for fruits reverted by a snail reorg. Staleness is
    /// re-checked; anything no longer fresh is silently dropped.
    pub fn readmit(&self, fruits: Vec<Fruit>) {
        PoolMessage::Readmit(fruits).send(&self.tx);
    }

    pub fn remove_batch(&self, hashes: Vec<H256>) {
        PoolMessage::RemoveBatch(hashes).send(&self.tx);
    }

    /// Fruits ready for embedding, ascending by attested fast number.
    pub async fn pending_fruits(&self) -> Vec<Fruit> {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::PendingFruits(sender).send(&self.tx);
        receiver.await.unwrap_or_default()
    }

    pub async fn content(&self) -> BTreeMap<BlockNumber, Fruit> {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Content(sender).send(&self.tx);
        receiver.await.unwrap_or_default()
    }

    /// Human-readable pool summary, one line per pending fruit.
    pub async fn inspect(&self) -> BTreeMap<BlockNumber, String> {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Inspect(sender).send(&self.tx);
        receiver.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> usize {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Stats(sender).send(&self.tx);
        receiver.await.unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe_new(&self) -> broadcast::Receiver<NewFruitEvent> {
        self.new_fruit_events.subscribe()
    }
}

pub struct Service {
    engine: Arc<Minerva>,
    chain: Arc<dyn ChainReader>,
    /// Keyed by attested fast number; one fruit per fast block.
    fruits: BTreeMap<BlockNumber, Fruit>,
    rx: UnboundedReceiver<PoolMessage>,
    new_fruit_events: broadcast::Sender<NewFruitEvent>,
}

impl Service {
    pub async fn run(mut self) {
        while let Some(message) = self.rx.next().await {
            match message {
                PoolMessage::Add(fruit, sender) => {
                    let outcome = self.add_fruit(*fruit, true);
                    if let Err(error) = outcome {
                        debug!("fruit rejected: {error}");
                    }
                    if let Some(sender) = sender {
                        let _ = sender.send(outcome);
                    }
                }
                PoolMessage::Readmit(fruits) => {
                    for fruit in fruits {
                        let fast_number = fruit.fast_number();
                        if let Err(error) = self.add_fruit(fruit, false) {
                            debug!(
                                "reverted fruit not re-admitted \
                                 (fast: {fast_number}, reason: {error})",
                            );
                        }
                    }
                }
                PoolMessage::RemoveBatch(hashes) => {
                    self.fruits
                        .retain(|_, fruit| !hashes.contains(&fruit.hash()));
                }
                PoolMessage::PendingFruits(sender) => {
                    let fruits = self.fruits.values().cloned().collect();
                    let _ = sender.send(fruits);
                }
                PoolMessage::Content(sender) => {
                    let _ = sender.send(self.fruits.clone());
                }
                PoolMessage::Inspect(sender) => {
                    let summary = self
                        .fruits
                        .iter()
                        .map(|(number, fruit)| {
                            (
                                *number,
                                format!(
                                    "{} attests {} by {}",
                                    fruit.hash(),
                                    fruit.fast_hash(),
                                    fruit.header.coinbase,
                                ),
                            )
                        })
                        .collect();
                    let _ = sender.send(summary);
                }
                PoolMessage::Stats(sender) => {
                    let _ = sender.send(self.fruits.len());
                }
            }
        }
    }

    fn add_fruit(&mut self, fruit: Fruit, announce: bool) -> Result<(), FruitPoolError> {
        let fast_number = fruit.fast_number();

        if self
            .fruits
            .get(&fast_number)
            .is_some_and(|existing| existing.hash() == fruit.hash())
        {
            return Err(FruitPoolError::KnownFruit);
        }

        let head = self.chain.fast_head_number();
        if head.saturating_sub(fast_number) > params::FRESHNESS_WINDOW || fast_number > head {
            return Err(FruitPoolError::NotFresh);
        }

        if self.chain.canonical_fast_hash(fast_number) != Some(fruit.fast_hash()) {
            return Err(FruitPoolError::UnknownFastBlock);
        }

        if self.chain.fruit_is_canonical(fruit.fast_hash()) {
            return Err(FruitPoolError::AlreadyAttested);
        }

        self.engine
            .verify_seal(&fruit.header, true)
            .map_err(|_| FruitPoolError::InvalidSeal)?;

        if self.fruits.len() >= MAX_POOL_FRUITS {
            return Err(FruitPoolError::PoolFull);
        }

        debug!("fruit admitted (fast: {fast_number})");
        let _old = self.fruits.insert(fast_number, fruit.clone());
        if announce {
            let _ = self.new_fruit_events.send(NewFruitEvent { fruit });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use minerva::Mode;
    use types::{ChainConfig, SnailHeader, U256};

    use super::*;

    struct FakeChain {
        fast_head: BlockNumber,
        attested: Vec<H256>,
    }

    impl ChainReader for FakeChain {
        fn fast_head_number(&self) -> BlockNumber {
            self.fast_head
        }

        fn canonical_fast_hash(&self, number: BlockNumber) -> Option<H256> {
            (number <= self.fast_head).then(|| fast_hash(number))
        }

        fn fruit_is_canonical(&self, fast_hash: H256) -> bool {
            self.attested.contains(&fast_hash)
        }
    }

    fn fast_hash(number: BlockNumber) -> H256 {
        H256::from_low_u64_be(number + 0xfa57)
    }

    fn fruit(fast_number: BlockNumber) -> Fruit {
        Fruit {
            header: SnailHeader {
                fast_number,
                fast_hash: fast_hash(fast_number),
                fruit_difficulty: U256::from(100),
                ..SnailHeader::default()
            },
        }
    }

    fn service(fast_head: BlockNumber, attested: Vec<H256>) -> Service {
        let engine = Minerva::new(ChainConfig::singlenode(), Mode::Fake);
        let (_pool, service) = SnailPool::new(
            engine,
            Arc::new(FakeChain {
                fast_head,
                attested,
            }),
        );
        service
    }

    #[test]
    fn fresh_fruit_is_admitted_and_ordered() {
        let mut service = service(10, vec![]);

        service.add_fruit(fruit(7), true).expect("fruit is fresh");
        service.add_fruit(fruit(5), true).expect("fruit is fresh");

        let ordered = service
            .fruits
            .values()
            .map(Fruit::fast_number)
            .collect::<Vec<_>>();
        assert_eq!(ordered, vec![5, 7]);
    }

    #[test]
    fn stale_fruit_is_rejected() {
        let head = 1 + params::FRESHNESS_WINDOW + 1;
        let mut service = service(head, vec![]);

        assert_eq!(
            service.add_fruit(fruit(1), true),
            Err(FruitPoolError::NotFresh),
        );
    }

    #[test]
    fn future_fruit_is_rejected() {
        let mut service = service(10, vec![]);
        assert_eq!(
            service.add_fruit(fruit(11), true),
            Err(FruitPoolError::NotFresh),
        );
    }

    #[test]
    fn already_attested_fast_block_is_rejected() {
        let mut service = service(10, vec![fast_hash(5)]);
        assert_eq!(
            service.add_fruit(fruit(5), true),
            Err(FruitPoolError::AlreadyAttested),
        );
    }

    #[test]
    fn non_canonical_fast_reference_is_rejected() {
        let mut service = service(10, vec![]);
        let mut wrong = fruit(5);
        wrong.header.fast_hash = H256::repeat_byte(0x99);

        assert_eq!(
            service.add_fruit(wrong, true),
            Err(FruitPoolError::UnknownFastBlock),
        );
    }

    #[test]
    fn duplicate_fruit_is_known() {
        let mut service = service(10, vec![]);
        service.add_fruit(fruit(5), true).expect("fruit is fresh");

        assert_eq!(
            service.add_fruit(fruit(5), true),
            Err(FruitPoolError::KnownFruit),
        );
    }
}
