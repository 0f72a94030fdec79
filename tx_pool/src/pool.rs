use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    StreamExt as _,
};
use log::{debug, warn};
use state_store::State;
use thiserror::Error;
use tokio::sync::broadcast;
use types::{Address, Transaction, H256, U256};

const MAX_TX_SIZE: usize = 32 * 1024;
const NEW_TX_EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum TxPoolError {
    #[error("transaction is already known")]
    KnownTx,
    #[error("gas price below the pool floor")]
    Underpriced,
    #[error("replacement gas price below the required bump")]
    ReplaceUnderpriced,
    #[error("nonce below the account's state nonce")]
    NonceTooLow,
    #[error("sender cannot cover value plus maximum gas")]
    InsufficientFunds,
    #[error("transaction exceeds the size cap")]
    OversizedData,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("pool is full")]
    PoolFull,
}

/// State access the pool needs from the fast chain, injected by the
/// coordinator. Lock order is always pool state first, then a state
/// snapshot; the snapshot is taken once per operation and never held
/// across another lock.
pub trait ChainReader: Send + Sync {
    fn chain_id(&self) -> u64;
    fn head_state(&self) -> anyhow::Result<State>;
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub price_floor: U256,
    /// A same-nonce replacement must raise the gas price by this percentage.
    pub price_bump_percent: u64,
    pub global_cap: usize,
    pub per_account_queue_cap: usize,
    pub lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            price_floor: U256::one(),
            price_bump_percent: 10,
            global_cap: 4096,
            per_account_queue_cap: 64,
            lifetime: Duration::from_secs(3 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewTxEvent {
    pub transaction: Transaction,
}

enum PoolMessage {
    Add(Box<Transaction>, bool, Option<oneshot::Sender<Result<(), TxPoolError>>>),
    Pending(oneshot::Sender<BTreeMap<Address, Vec<Transaction>>>),
    RemoveBatch(Vec<H256>),
    NewHead,
    Stats(oneshot::Sender<(usize, usize)>),
}

impl PoolMessage {
    fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("transaction pool service has shut down");
        }
    }
}

/// Cheap handle to the pool actor.
#[derive(Clone)]
pub struct TxPool {
    tx: UnboundedSender<PoolMessage>,
    new_tx_events: broadcast::Sender<NewTxEvent>,
}

impl TxPool {
    #[must_use]
    pub fn new(config: PoolConfig, chain: Arc<dyn ChainReader>) -> (Self, Service) {
        let (tx, rx) = unbounded();
        let new_tx_events = broadcast::channel(NEW_TX_EVENT_CAPACITY).0;

        let pool = Self {
            tx,
            new_tx_events: new_tx_events.clone(),
        };

        let service = Service {
            config,
            chain,
            pending: BTreeMap::new(),
            queued: BTreeMap::new(),
            all: HashMap::new(),
            rx,
            new_tx_events,
        };

        (pool, service)
    }

    pub async fn add(&self, transaction: Transaction, local: bool) -> Result<(), TxPoolError> {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Add(Box::new(transaction), local, Some(sender)).send(&self.tx);
        receiver.await.unwrap_or(Err(TxPoolError::PoolFull))
    }

    /// Fire-and-forget variant for gossip ingestion.
    pub fn notify_add(&self, transaction: Transaction) {
        PoolMessage::Add(Box::new(transaction), false, None).send(&self.tx);
    }

    /// Snapshot of executable transactions, nonce-ordered per sender.
    pub async fn pending(&self) -> BTreeMap<Address, Vec<Transaction>> {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Pending(sender).send(&self.tx);
        receiver.await.unwrap_or_default()
    }

    pub fn remove_batch(&self, hashes: Vec<H256>) {
        PoolMessage::RemoveBatch(hashes).send(&self.tx);
    }

    /// Rebase against the current head state. The coordinator calls this for
    /// every `ChainHeadEvent`.
    pub fn on_new_head(&self) {
        PoolMessage::NewHead.send(&self.tx);
    }

    pub async fn stats(&self) -> (usize, usize) {
        let (sender, receiver) = oneshot::channel();
        PoolMessage::Stats(sender).send(&self.tx);
        receiver.await.unwrap_or((0, 0))
    }

    #[must_use]
    pub fn subscribe_new(&self) -> broadcast::Receiver<NewTxEvent> {
        self.new_tx_events.subscribe()
    }
}

struct PooledTx {
    transaction: Transaction,
    local: bool,
    added: Instant,
}

pub struct Service {
    config: PoolConfig,
    chain: Arc<dyn ChainReader>,
    /// Contiguous nonce runs starting at each sender's state nonce.
    pending: BTreeMap<Address, BTreeMap<u64, PooledTx>>,
    /// Future-nonce transactions awaiting a gap fill.
    queued: BTreeMap<Address, BTreeMap<u64, PooledTx>>,
    all: HashMap<H256, (Address, u64)>,
    rx: UnboundedReceiver<PoolMessage>,
    new_tx_events: broadcast::Sender<NewTxEvent>,
}

impl Service {
    pub async fn run(mut self) {
        while let Some(message) = self.rx.next().await {
            match message {
                PoolMessage::Add(transaction, local, sender) => {
                    let outcome = self.add_transaction(*transaction, local);
                    if let Err(error) = outcome {
                        debug!("transaction rejected: {error}");
                    }
                    if let Some(sender) = sender {
                        let _ = sender.send(outcome);
                    }
                }
                PoolMessage::Pending(sender) => {
                    let _ = sender.send(self.pending_snapshot());
                }
                PoolMessage::RemoveBatch(hashes) => self.remove_hashes(&hashes),
                PoolMessage::NewHead => self.reshuffle(),
                PoolMessage::Stats(sender) => {
                    let _ = sender.send(self.stats());
                }
            }
        }
    }

    fn stats(&self) -> (usize, usize) {
        let pending = self.pending.values().map(BTreeMap::len).sum();
        let queued = self.queued.values().map(BTreeMap::len).sum();
        (pending, queued)
    }

    fn total(&self) -> usize {
        self.all.len()
    }

    fn add_transaction(
        &mut self,
        transaction: Transaction,
        local: bool,
    ) -> Result<(), TxPoolError> {
        if transaction.size() > MAX_TX_SIZE {
            return Err(TxPoolError::OversizedData);
        }

        let hash = transaction.hash();
        if self.all.contains_key(&hash) {
            return Err(TxPoolError::KnownTx);
        }

        let sender = transaction
            .sender(self.chain.chain_id())
            .map_err(|_| TxPoolError::InvalidSignature)?;

        if !local && transaction.gas_price() < self.config.price_floor {
            return Err(TxPoolError::Underpriced);
        }

        let state = self
            .chain
            .head_state()
            .map_err(|_| TxPoolError::PoolFull)?;
        let state_nonce = state.nonce(sender);
        let nonce = transaction.nonce();

        if nonce < state_nonce {
            return Err(TxPoolError::NonceTooLow);
        }

        if state.balance(sender) < transaction.cost() {
            return Err(TxPoolError::InsufficientFunds);
        }

        // Same-nonce replacement must out-bid the old transaction.
        let replaced = self
            .pending
            .get(&sender)
            .and_then(|txs| txs.get(&nonce))
            .or_else(|| self.queued.get(&sender).and_then(|txs| txs.get(&nonce)));
        if let Some(old) = replaced {
            let bump = old.transaction.gas_price()
                * U256::from(100 + self.config.price_bump_percent)
                / U256::from(100);
            if transaction.gas_price() < bump {
                return Err(TxPoolError::ReplaceUnderpriced);
            }
            let old_hash = old.transaction.hash();
            self.drop_hash(old_hash);
        }

        if self.total() >= self.config.global_cap && !self.evict_cheaper_than(&transaction, local) {
            return Err(if local {
                TxPoolError::PoolFull
            } else {
                TxPoolError::Underpriced
            });
        }

        let next_pending = self.next_pending_nonce(sender, state_nonce);
        let entry = PooledTx {
            transaction: transaction.clone(),
            local,
            added: Instant::now(),
        };

        if nonce == next_pending {
            let _old = self.all.insert(hash, (sender, nonce));
            let _old = self
                .pending
                .entry(sender)
                .or_default()
                .insert(nonce, entry);
            self.promote(sender);
            let _ = self.new_tx_events.send(NewTxEvent { transaction });
        } else {
            let queue = self.queued.entry(sender).or_default();
            if queue.len() >= self.config.per_account_queue_cap {
                return Err(TxPoolError::PoolFull);
            }
            let _old = self.all.insert(hash, (sender, nonce));
            let _old = queue.insert(nonce, entry);
        }

        Ok(())
    }

    /// Moves queued transactions whose nonce now lines up into pending.
    fn promote(&mut self, sender: Address) {
        let Some(queue) = self.queued.get_mut(&sender) else {
            return;
        };

        let mut next = self
            .pending
            .get(&sender)
            .and_then(|txs| txs.last_key_value().map(|(nonce, _)| nonce + 1));

        while let Some(expected) = next {
            let Some(entry) = queue.remove(&expected) else {
                break;
            };
            let transaction = entry.transaction.clone();
            let _old = self
                .pending
                .entry(sender)
                .or_default()
                .insert(expected, entry);
            let _ = self.new_tx_events.send(NewTxEvent { transaction });
            next = Some(expected + 1);
        }

        if queue.is_empty() {
            let _removed = self.queued.remove(&sender);
        }
    }

    fn next_pending_nonce(&self, sender: Address, state_nonce: u64) -> u64 {
        self.pending
            .get(&sender)
            .and_then(|txs| txs.last_key_value().map(|(nonce, _)| nonce + 1))
            .unwrap_or(state_nonce)
    }

    /// Evicts the cheapest remote transaction if it is cheaper than the
    /// incoming one. Local transactions are never evicted for a remote.
    fn evict_cheaper_than(&mut self, incoming: &Transaction, incoming_local: bool) -> bool {
        let cheapest = self
            .pending
            .iter()
            .chain(self.queued.iter())
            .flat_map(|(_, txs)| txs.values())
            .filter(|entry| !entry.local)
            .min_by_key(|entry| entry.transaction.gas_price())
            .map(|entry| (entry.transaction.gas_price(), entry.transaction.hash()));

        match cheapest {
            Some((price, hash))
                if incoming_local || price < incoming.gas_price() =>
            {
                debug!("evicting cheapest transaction (hash: {hash}, price: {price})");
                self.drop_hash(hash);
                true
            }
            _ => false,
        }
    }

    fn pending_snapshot(&self) -> BTreeMap<Address, Vec<Transaction>> {
        self.pending
            .iter()
            .map(|(sender, txs)| {
                let transactions = txs
                    .values()
                    .map(|entry| entry.transaction.clone())
                    .collect();
                (*sender, transactions)
            })
            .collect()
    }

    fn remove_hashes(&mut self, hashes: &[H256]) {
        for hash in hashes {
            self.drop_hash(*hash);
        }
    }

    fn drop_hash(&mut self, hash: H256) {
        let Some((sender, nonce)) = self.all.remove(&hash) else {
            return;
        };

        if let Some(txs) = self.pending.get_mut(&sender) {
            // Everything behind a removed pending nonce loses its
            // contiguity and falls back to the queue.
            if txs.remove(&nonce).is_some() {
                let demoted = txs.split_off(&nonce);
                let queue = self.queued.entry(sender).or_default();
                for (demoted_nonce, entry) in demoted {
                    let _old = queue.insert(demoted_nonce, entry);
                }
            }
            if self.pending.get(&sender).is_some_and(BTreeMap::is_empty) {
                let _removed = self.pending.remove(&sender);
            }
        }

        if let Some(txs) = self.queued.get_mut(&sender) {
            let _removed = txs.remove(&nonce);
            if txs.is_empty() {
                let _removed = self.queued.remove(&sender);
            }
        }
    }

    /// Rebases every sender against the head state: drops included and
    /// expired transactions, demotes what no longer connects, promotes what
    /// now does. Reapplying the same head is a no-op.
    fn reshuffle(&mut self) {
        let Ok(state) = self.chain.head_state() else {
            warn!("transaction pool reshuffle skipped: head state unavailable");
            return;
        };

        let senders = self
            .pending
            .keys()
            .chain(self.queued.keys())
            .copied()
            .collect::<Vec<_>>();

        for sender in senders {
            let state_nonce = state.nonce(sender);
            let balance = state.balance(sender);

            let stale = self
                .sender_hashes(sender)
                .into_iter()
                .filter(|(_, entry_nonce, added, cost)| {
                    *entry_nonce < state_nonce
                        || added.elapsed() > self.config.lifetime
                        || *cost > balance
                })
                .map(|(hash, ..)| hash)
                .collect::<Vec<_>>();
            for hash in stale {
                self.drop_hash(hash);
            }

            // Demote a pending run that no longer starts at the state nonce.
            let connects = self
                .pending
                .get(&sender)
                .and_then(|txs| txs.first_key_value().map(|(nonce, _)| *nonce))
                .is_none_or(|first| first == state_nonce);
            if !connects {
                if let Some(txs) = self.pending.remove(&sender) {
                    let queue = self.queued.entry(sender).or_default();
                    for (nonce, entry) in txs {
                        let _old = queue.insert(nonce, entry);
                    }
                }
            }

            // Promote a queued run that now connects.
            if self.pending.get(&sender).is_none() {
                if let Some(queue) = self.queued.get_mut(&sender) {
                    if queue.first_key_value().map(|(nonce, _)| *nonce) == Some(state_nonce) {
                        let entry = queue.remove(&state_nonce).expect("first key exists");
                        let transaction = entry.transaction.clone();
                        let _old = self
                            .pending
                            .entry(sender)
                            .or_default()
                            .insert(state_nonce, entry);
                        let _ = self.new_tx_events.send(NewTxEvent { transaction });
                    }
                }
                self.promote(sender);
            }
        }
    }

    fn sender_hashes(&self, sender: Address) -> Vec<(H256, u64, Instant, U256)> {
        self.pending
            .get(&sender)
            .into_iter()
            .chain(self.queued.get(&sender))
            .flat_map(|txs| {
                txs.iter().map(|(nonce, entry)| {
                    (
                        entry.transaction.hash(),
                        *nonce,
                        entry.added,
                        entry.transaction.cost(),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use types::TransactionBody;

    use super::*;

    const CHAIN_ID: u64 = 400;

    struct FakeChain {
        state: Mutex<State>,
    }

    impl FakeChain {
        fn with_balance(address: Address, balance: u64) -> Arc<Self> {
            let mut state = State::new();
            state.add_balance(address, U256::from(balance));
            Arc::new(Self {
                state: Mutex::new(state),
            })
        }

        fn set_nonce(&self, address: Address, nonce: u64) {
            self.state
                .lock()
                .expect("state mutex is not poisoned")
                .set_nonce(address, nonce);
        }
    }

    impl ChainReader for FakeChain {
        fn chain_id(&self) -> u64 {
            CHAIN_ID
        }

        fn head_state(&self) -> anyhow::Result<State> {
            Ok(self
                .state
                .lock()
                .expect("state mutex is not poisoned")
                .clone())
        }
    }

    fn key() -> crypto::SecretKey {
        crypto::SecretKey::from_slice(&[0x51; 32]).expect("constant scalar is valid")
    }

    fn transaction(nonce: u64, gas_price: u64) -> Transaction {
        Transaction::sign(
            TransactionBody {
                nonce,
                gas_price: U256::from(gas_price),
                gas_limit: 21_000,
                to: Some(Address::repeat_byte(0xee)),
                value: U256::from(1),
                data: vec![],
            },
            &key(),
            CHAIN_ID,
        )
        .expect("signing succeeds")
    }

    fn service(chain: Arc<FakeChain>, config: PoolConfig) -> Service {
        let (_pool, service) = TxPool::new(config, chain);
        service
    }

    fn default_service() -> (Arc<FakeChain>, Service) {
        let chain = FakeChain::with_balance(key().address(), 100_000_000);
        let service = service(Arc::clone(&chain), PoolConfig::default());
        (chain, service)
    }

    #[test]
    fn pending_transactions_are_nonce_ordered() {
        let (_, mut service) = default_service();

        service
            .add_transaction(transaction(1, 2), false)
            .expect("future nonce goes to the queue");
        service
            .add_transaction(transaction(0, 2), false)
            .expect("state nonce goes to pending");

        let pending = service.pending_snapshot();
        let run = pending.get(&key().address()).expect("sender has pending");
        assert_eq!(
            run.iter().map(Transaction::nonce).collect::<Vec<_>>(),
            vec![0, 1],
        );
    }

    #[test]
    fn duplicate_is_rejected_as_known() {
        let (_, mut service) = default_service();
        let tx = transaction(0, 2);

        service
            .add_transaction(tx.clone(), false)
            .expect("first add succeeds");
        assert_eq!(
            service.add_transaction(tx, false),
            Err(TxPoolError::KnownTx),
        );
    }

    #[test]
    fn underpriced_remote_is_rejected_and_pool_unchanged() {
        let chain = FakeChain::with_balance(key().address(), 100_000_000);
        let config = PoolConfig {
            price_floor: U256::from(10),
            ..PoolConfig::default()
        };
        let mut service = service(chain, config);

        assert_eq!(
            service.add_transaction(transaction(0, 9), false),
            Err(TxPoolError::Underpriced),
        );
        assert_eq!(service.stats(), (0, 0));

        service
            .add_transaction(transaction(0, 9), true)
            .expect("local transactions bypass the floor");
    }

    #[test]
    fn nonce_below_state_is_rejected() {
        let (chain, mut service) = default_service();
        chain.set_nonce(key().address(), 5);

        assert_eq!(
            service.add_transaction(transaction(4, 2), false),
            Err(TxPoolError::NonceTooLow),
        );
    }

    #[test]
    fn insufficient_funds_is_rejected() {
        let chain = FakeChain::with_balance(key().address(), 10);
        let mut service = service(chain, PoolConfig::default());

        assert_eq!(
            service.add_transaction(transaction(0, 2), false),
            Err(TxPoolError::InsufficientFunds),
        );
    }

    #[test]
    fn replacement_requires_a_price_bump() {
        let (_, mut service) = default_service();

        service
            .add_transaction(transaction(0, 100), false)
            .expect("first add succeeds");
        assert_eq!(
            service.add_transaction(transaction(0, 105), false),
            Err(TxPoolError::ReplaceUnderpriced),
        );
        service
            .add_transaction(transaction(0, 110), false)
            .expect("10% bump suffices");

        let pending = service.pending_snapshot();
        let run = pending.get(&key().address()).expect("sender has pending");
        assert_eq!(run[0].gas_price(), U256::from(110));
        assert_eq!(service.stats(), (1, 0));
    }

    #[test]
    fn full_pool_evicts_the_cheapest_remote() {
        let other = crypto::SecretKey::from_slice(&[0x52; 32]).expect("constant scalar is valid");
        let chain = FakeChain::with_balance(key().address(), 100_000_000);
        chain
            .state
            .lock()
            .expect("state mutex is not poisoned")
            .add_balance(other.address(), U256::from(100_000_000));

        let config = PoolConfig {
            global_cap: 1,
            ..PoolConfig::default()
        };
        let mut service = service(chain, config);

        service
            .add_transaction(transaction(0, 2), false)
            .expect("first add succeeds");

        let expensive = Transaction::sign(
            TransactionBody {
                nonce: 0,
                gas_price: U256::from(50),
                gas_limit: 21_000,
                to: Some(Address::repeat_byte(0xee)),
                value: U256::from(1),
                data: vec![],
            },
            &other,
            CHAIN_ID,
        )
        .expect("signing succeeds");

        service
            .add_transaction(expensive.clone(), false)
            .expect("richer transaction evicts the cheap one");
        assert!(service.all.contains_key(&expensive.hash()));
        assert_eq!(service.total(), 1);
    }

    #[test]
    fn reshuffle_drops_included_and_promotes_queued() {
        let (chain, mut service) = default_service();

        service
            .add_transaction(transaction(0, 2), false)
            .expect("add succeeds");
        service
            .add_transaction(transaction(2, 2), false)
            .expect("gap goes to the queue");
        assert_eq!(service.stats(), (1, 1));

        // Nonces 0 and 1 are now on-chain.
        chain.set_nonce(key().address(), 2);
        service.reshuffle();

        let pending = service.pending_snapshot();
        let run = pending.get(&key().address()).expect("sender has pending");
        assert_eq!(
            run.iter().map(Transaction::nonce).collect::<Vec<_>>(),
            vec![2],
        );
        assert_eq!(service.stats(), (1, 0));
    }

    #[test]
    fn reshuffle_is_idempotent() {
        let (chain, mut service) = default_service();

        service
            .add_transaction(transaction(0, 2), false)
            .expect("add succeeds");
        service
            .add_transaction(transaction(1, 3), false)
            .expect("add succeeds");
        chain.set_nonce(key().address(), 1);

        service.reshuffle();
        let after_first = service.pending_snapshot();
        let stats_first = service.stats();

        service.reshuffle();
        assert_eq!(service.pending_snapshot(), after_first);
        assert_eq!(service.stats(), stats_first);
    }

    #[test]
    fn removing_a_middle_nonce_demotes_the_tail() {
        let (_, mut service) = default_service();

        for nonce in 0..3 {
            service
                .add_transaction(transaction(nonce, 2), false)
                .expect("add succeeds");
        }
        assert_eq!(service.stats(), (3, 0));

        service.remove_hashes(&[transaction(1, 2).hash()]);
        assert_eq!(service.stats(), (1, 1));
    }
}
