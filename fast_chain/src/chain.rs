use std::sync::Arc;

use anyhow::anyhow;
use database::Database;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rlp::RlpStream;
use state_store::State;
use types::{BlockNumber, ChainConfig, FastBlock, Log, PbftSign, Receipt, H256};

use crate::{error::ChainError, events::Events, keys};

/// Checks a finality witness against the committee of the block's epoch.
/// Implemented by the election bridge; injected by the coordinator so the
/// chain never holds a back-pointer to it.
pub trait FinalityVerifier: Send + Sync {
    fn verify_finality(
        &self,
        fast_number: BlockNumber,
        fast_hash: H256,
        signs: &[PbftSign],
    ) -> anyhow::Result<()>;
}

pub struct FastChain {
    database: Database,
    config: ChainConfig,
    verifier: Arc<dyn FinalityVerifier>,
    head: RwLock<FastBlock>,
    insert_lock: Mutex<()>,
    events: Events,
}

impl FastChain {
    /// Opens the chain over a database that already contains a genesis
    /// block (see the `genesis` crate).
    pub fn new(
        database: Database,
        config: ChainConfig,
        verifier: Arc<dyn FinalityVerifier>,
    ) -> anyhow::Result<Arc<Self>> {
        let head = load_head(&database)?;
        info!(
            "fast chain loaded (head: {}, hash: {})",
            head.number(),
            head.hash(),
        );

        Ok(Arc::new(Self {
            database,
            config,
            verifier,
            head: RwLock::new(head),
            insert_lock: Mutex::new(()),
            events: Events::default(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &Events {
        &self.events
    }

    #[must_use]
    pub fn current(&self) -> FastBlock {
        self.head.read().clone()
    }

    #[must_use]
    pub fn genesis_hash(&self) -> Option<H256> {
        self.canonical_hash(0)
    }

    #[must_use]
    pub fn canonical_hash(&self, number: BlockNumber) -> Option<H256> {
        self.database
            .get(keys::canonical(number))
            .ok()
            .flatten()
            .map(|bytes| H256::from_slice(&bytes))
    }

    #[must_use]
    pub fn get_by_number(&self, number: BlockNumber) -> Option<FastBlock> {
        let hash = self.canonical_hash(number)?;
        self.read_block(number, hash)
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: H256) -> Option<FastBlock> {
        let number = self.number_of(hash)?;
        self.read_block(number, hash)
    }

    #[must_use]
    pub fn get_receipts(&self, number: BlockNumber, hash: H256) -> Option<Vec<Receipt>> {
        let bytes = self.database.get(keys::receipts(number, hash)).ok()??;
        rlp::Rlp::new(&bytes).as_list().ok()
    }

    /// Locates a canonical transaction: `(block hash, index)`.
    #[must_use]
    pub fn get_transaction_location(&self, tx_hash: H256) -> Option<(H256, u64)> {
        let bytes = self.database.get(keys::tx_lookup(tx_hash)).ok()??;
        let rlp = rlp::Rlp::new(&bytes);
        Some((rlp.val_at(0).ok()?, rlp.val_at(1).ok()?))
    }

    pub fn state_at(&self, root: H256) -> Result<State, ChainError> {
        State::load(&self.database, root).map_err(|_| ChainError::MissingState { root })
    }

    pub fn head_state(&self) -> Result<State, ChainError> {
        self.state_at(self.head.read().header().root)
    }

    /// Finalization entry point for the BFT engine.
    pub fn insert_finalized(
        &self,
        block: FastBlock,
        signs: Vec<PbftSign>,
    ) -> Result<(), ChainError> {
        let (_, error) = self.insert_chain(vec![block.with_signs(signs)]);
        error.map_or(Ok(()), Err)
    }

    /// Inserts a run of blocks, stopping at the first failure. Returns how
    /// many were processed and the error that stopped the run, if any.
    pub fn insert_chain(&self, blocks: Vec<FastBlock>) -> (usize, Option<ChainError>) {
        let Some(_guard) = self.insert_lock.try_lock() else {
            return (0, Some(ChainError::ConcurrentInsert));
        };

        let mut processed = 0;
        for block in blocks {
            match self.insert_block(block) {
                Ok(()) => processed += 1,
                Err(ChainError::KnownBlock { hash }) => {
                    debug!("skipping known fast block (hash: {hash})");
                    processed += 1;
                }
                Err(error) => {
                    warn!("fast chain insertion stopped: {error}");
                    return (processed, Some(error));
                }
            }
        }

        (processed, None)
    }

    /// Rewinds the canonical pointer to `number`. Only used for
    /// genesis-compatibility rewinds; finalized history above the new head
    /// stays in the database but is no longer canonical.
    pub fn set_head(&self, number: BlockNumber) -> Result<(), ChainError> {
        let Some(_guard) = self.insert_lock.try_lock() else {
            return Err(ChainError::ConcurrentInsert);
        };

        let new_head = self
            .get_by_number(number)
            .ok_or(ChainError::MissingState { root: H256::zero() })?;
        let old_head_number = self.head.read().number();

        let mut removed_logs = vec![];
        for rewound in (number + 1)..=old_head_number {
            if let Some(hash) = self.canonical_hash(rewound) {
                if let Some(receipts) = self.get_receipts(rewound, hash) {
                    removed_logs.extend(receipts.into_iter().flat_map(|receipt| receipt.logs));
                }
            }
            self.database
                .delete(keys::canonical(rewound))
                .map_err(ChainError::Database)?;
        }

        self.database
            .put(keys::HEAD_KEY, new_head.hash().as_bytes())
            .map_err(ChainError::Database)?;
        *self.head.write() = new_head;

        info!("fast chain rewound (head: {number})");
        self.events.publish_removed_logs(removed_logs);
        Ok(())
    }

    fn insert_block(&self, block: FastBlock) -> Result<(), ChainError> {
        let parent = self.current();
        let number = block.number();
        let hash = block.hash();

        // A height at or below the finalized head either repeats the
        // canonical block (harmless) or contradicts finality (fatal).
        if number <= parent.number() {
            return match self.canonical_hash(number) {
                Some(canonical) if canonical == hash => Err(ChainError::KnownBlock { hash }),
                _ => Err(ChainError::DivergentFinalizedBlock { number }),
            };
        }

        self.verify_header(&parent, &block)?;

        if number > 0 {
            self.verifier
                .verify_finality(number, hash, block.signs())
                .map_err(ChainError::Finality)?;
        }

        let parent_state = self.state_at(parent.header().root)?;
        let outcome = execution::execute_block(
            &parent_state,
            block.transactions(),
            block.header().gas_limit,
            self.config.chain_id,
        )?;

        if outcome.gas_used != block.header().gas_used {
            return Err(ChainError::GasUsedMismatch {
                header: block.header().gas_used,
                computed: outcome.gas_used,
            });
        }

        let computed_root = outcome.state_root();
        if computed_root != block.header().root {
            return Err(ChainError::RootMismatch {
                header: block.header().root,
                computed: computed_root,
            });
        }

        let computed_receipts_root = outcome.receipts_root();
        if computed_receipts_root != block.header().receipts_root {
            return Err(ChainError::ReceiptsRootMismatch {
                header: block.header().receipts_root,
                computed: computed_receipts_root,
            });
        }

        let _root = outcome
            .state
            .commit(&self.database)
            .map_err(ChainError::Database)?;
        self.write_block(&block, &outcome.receipts)?;

        let logs = outcome
            .receipts
            .iter()
            .flat_map(|receipt| receipt.logs.clone())
            .collect::<Vec<Log>>();

        *self.head.write() = block.clone();
        debug!("fast block committed (number: {number}, hash: {hash})");
        self.events.publish_block(&block, logs);

        Ok(())
    }

    fn verify_header(&self, parent: &FastBlock, block: &FastBlock) -> Result<(), ChainError> {
        if block.number() != parent.number() + 1 {
            return Err(ChainError::NonSequential {
                head: parent.number(),
                got: block.number(),
            });
        }

        if block.parent_hash() != parent.hash() {
            return Err(ChainError::UnknownParent {
                number: block.number(),
                parent_hash: block.parent_hash(),
            });
        }

        if block.header().time < parent.header().time {
            return Err(ChainError::TimestampNotAdvancing);
        }

        if block.header().gas_used > block.header().gas_limit {
            return Err(ChainError::GasAboveLimit {
                used: block.header().gas_used,
                limit: block.header().gas_limit,
            });
        }

        let computed = FastBlock::transactions_root(block.transactions());
        if computed != block.header().txs_root {
            return Err(ChainError::TxsRootMismatch {
                header: block.header().txs_root,
                computed,
            });
        }

        Ok(())
    }

    fn write_block(&self, block: &FastBlock, receipts: &[Receipt]) -> Result<(), ChainError> {
        let number = block.number();
        let hash = block.hash();

        let mut receipts_stream = RlpStream::new_list(receipts.len());
        for receipt in receipts {
            receipts_stream.append(receipt);
        }

        let mut batch = vec![
            (
                keys::header(number, hash),
                rlp::encode(block.header()).to_vec(),
            ),
            (keys::body(number, hash), rlp::encode(block.body()).to_vec()),
            (
                keys::receipts(number, hash),
                receipts_stream.out().to_vec(),
            ),
            (keys::canonical(number), hash.as_bytes().to_vec()),
            (keys::number_of(hash), number.to_be_bytes().to_vec()),
            (keys::HEAD_KEY.to_vec(), hash.as_bytes().to_vec()),
        ];

        for (index, transaction) in block.transactions().iter().enumerate() {
            let mut lookup = RlpStream::new_list(2);
            lookup.append(&hash);
            lookup.append(&(index as u64));
            batch.push((keys::tx_lookup(transaction.hash()), lookup.out().to_vec()));
        }

        self.database.put_batch(batch).map_err(ChainError::Database)
    }

    fn number_of(&self, hash: H256) -> Option<BlockNumber> {
        let bytes = self.database.get(keys::number_of(hash)).ok()??;
        Some(BlockNumber::from_be_bytes(bytes.try_into().ok()?))
    }

    fn read_block(&self, number: BlockNumber, hash: H256) -> Option<FastBlock> {
        let header_bytes = self.database.get(keys::header(number, hash)).ok()??;
        let body_bytes = self.database.get(keys::body(number, hash)).ok()??;

        Some(FastBlock::new(
            rlp::decode(&header_bytes).ok()?,
            rlp::decode(&body_bytes).ok()?,
        ))
    }
}

fn load_head(database: &Database) -> anyhow::Result<FastBlock> {
    let head_hash = database
        .get(keys::HEAD_KEY)?
        .ok_or_else(|| anyhow!("database has no fast head; genesis setup must run first"))?;
    let head_hash = H256::from_slice(&head_hash);

    let number_bytes = database
        .get(keys::number_of(head_hash))?
        .ok_or_else(|| anyhow!("fast head {head_hash} has no number entry"))?;
    let number = BlockNumber::from_be_bytes(
        number_bytes
            .try_into()
            .map_err(|_| anyhow!("malformed number entry for fast head"))?,
    );

    let header_bytes = database
        .get(keys::header(number, head_hash))?
        .ok_or_else(|| anyhow!("fast head {head_hash} has no header"))?;
    let body_bytes = database
        .get(keys::body(number, head_hash))?
        .ok_or_else(|| anyhow!("fast head {head_hash} has no body"))?;

    Ok(FastBlock::new(
        rlp::decode(&header_bytes)?,
        rlp::decode(&body_bytes)?,
    ))
}

#[cfg(test)]
mod tests {
    use state_store::State;
    use types::{Address, FastBody, FastHeader, Transaction, TransactionBody, U256};

    use super::*;

    struct AcceptAll;

    impl FinalityVerifier for AcceptAll {
        fn verify_finality(&self, _: BlockNumber, _: H256, _: &[PbftSign]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct RejectAll;

    impl FinalityVerifier for RejectAll {
        fn verify_finality(&self, _: BlockNumber, _: H256, _: &[PbftSign]) -> anyhow::Result<()> {
            Err(anyhow!("no quorum"))
        }
    }

    fn funded_key() -> crypto::SecretKey {
        crypto::SecretKey::from_slice(&[0x31; 32]).expect("constant scalar is valid")
    }

    const CHAIN_ID: u64 = 400;
    const GAS_LIMIT: u64 = 30_000_000;

    fn write_genesis(database: &Database) -> FastBlock {
        let mut state = State::new();
        state.add_balance(funded_key().address(), U256::from(10).pow(U256::from(21)));
        let root = state.commit(database).expect("commit succeeds");

        let header = FastHeader {
            root,
            txs_root: FastBlock::transactions_root(&[]),
            receipts_root: types::ordered_root::<Receipt>([]),
            gas_limit: GAS_LIMIT,
            ..FastHeader::default()
        };
        let genesis = FastBlock::new(header, FastBody::default());

        database
            .put_batch([
                (
                    keys::header(0, genesis.hash()),
                    rlp::encode(genesis.header()).to_vec(),
                ),
                (
                    keys::body(0, genesis.hash()),
                    rlp::encode(genesis.body()).to_vec(),
                ),
                (keys::canonical(0), genesis.hash().as_bytes().to_vec()),
                (
                    keys::number_of(genesis.hash()),
                    0_u64.to_be_bytes().to_vec(),
                ),
                (keys::HEAD_KEY.to_vec(), genesis.hash().as_bytes().to_vec()),
            ])
            .expect("batch succeeds");

        genesis
    }

    fn chain_with_genesis() -> (Arc<FastChain>, FastBlock) {
        let database = Database::in_memory();
        let genesis = write_genesis(&database);
        let chain = FastChain::new(database, ChainConfig::singlenode(), Arc::new(AcceptAll))
            .expect("genesis is present");
        (chain, genesis)
    }

    fn build_child(chain: &FastChain, transactions: Vec<Transaction>) -> FastBlock {
        let parent = chain.current();
        let parent_state = chain.head_state().expect("head state exists");
        let outcome = execution::execute_block(&parent_state, &transactions, GAS_LIMIT, CHAIN_ID)
            .expect("transactions are valid");

        let header = FastHeader {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            time: parent.header().time + 1,
            root: outcome.state_root(),
            txs_root: FastBlock::transactions_root(&transactions),
            receipts_root: outcome.receipts_root(),
            gas_limit: GAS_LIMIT,
            gas_used: outcome.gas_used,
            extra: vec![],
        };

        FastBlock::new(
            header,
            FastBody {
                transactions,
                signs: vec![],
                switch_info: None,
            },
        )
    }

    fn transfer(nonce: u64) -> Transaction {
        Transaction::sign(
            TransactionBody {
                nonce,
                gas_price: U256::from(1),
                gas_limit: 21_000,
                to: Some(Address::repeat_byte(0xee)),
                value: U256::from(1),
                data: vec![],
            },
            &funded_key(),
            CHAIN_ID,
        )
        .expect("signing succeeds")
    }

    #[test]
    fn inserting_a_valid_block_advances_the_head() {
        let (chain, _) = chain_with_genesis();
        let block = build_child(&chain, vec![transfer(0)]);

        let (processed, error) = chain.insert_chain(vec![block.clone()]);
        assert_eq!(processed, 1);
        assert!(error.is_none(), "unexpected error: {error:?}");

        assert_eq!(chain.current().number(), 1);
        assert_eq!(chain.get_by_number(1), Some(block.clone()));
        assert_eq!(chain.get_by_hash(block.hash()), Some(block.clone()));
        assert_eq!(
            chain.get_transaction_location(block.transactions()[0].hash()),
            Some((block.hash(), 0)),
        );
    }

    #[test]
    fn state_root_mismatch_is_rejected() {
        let (chain, _) = chain_with_genesis();
        let mut block = build_child(&chain, vec![transfer(0)]);

        let mut header = block.header().clone();
        header.root = H256::repeat_byte(0xde);
        block = FastBlock::new(header, block.body().clone());

        let (processed, error) = chain.insert_chain(vec![block]);
        assert_eq!(processed, 0);
        assert!(matches!(error, Some(ChainError::RootMismatch { .. })));
        assert_eq!(chain.current().number(), 0);
    }

    #[test]
    fn finality_verification_gates_insertion() {
        let database = Database::in_memory();
        let _genesis = write_genesis(&database);
        let chain = FastChain::new(database, ChainConfig::singlenode(), Arc::new(RejectAll))
            .expect("genesis is present");

        let block = build_child(&chain, vec![]);
        let (_, error) = chain.insert_chain(vec![block]);
        assert!(matches!(error, Some(ChainError::Finality(_))));
    }

    #[test]
    fn divergent_block_at_finalized_height_is_fatal() {
        let (chain, _) = chain_with_genesis();
        let canonical = build_child(&chain, vec![]);
        let divergent = build_child(&chain, vec![transfer(0)]);

        let (_, error) = chain.insert_chain(vec![canonical]);
        assert!(error.is_none());

        let (_, error) = chain.insert_chain(vec![divergent]);
        assert!(matches!(
            error,
            Some(ChainError::DivergentFinalizedBlock { number: 1 }),
        ));
    }

    #[test]
    fn reinserting_the_canonical_block_is_harmless() {
        let (chain, _) = chain_with_genesis();
        let block = build_child(&chain, vec![]);

        let (_, error) = chain.insert_chain(vec![block.clone()]);
        assert!(error.is_none());

        let (processed, error) = chain.insert_chain(vec![block]);
        assert_eq!(processed, 1);
        assert!(error.is_none());
    }

    #[test]
    fn head_events_are_published_in_number_order() {
        let (chain, _) = chain_with_genesis();
        let mut head_events = chain.events().subscribe_head();

        let first = build_child(&chain, vec![transfer(0)]);
        let (_, error) = chain.insert_chain(vec![first]);
        assert!(error.is_none());

        let second = build_child(&chain, vec![transfer(1)]);
        let (_, error) = chain.insert_chain(vec![second]);
        assert!(error.is_none());

        assert_eq!(
            head_events.try_recv().expect("first event").block.number(),
            1,
        );
        assert_eq!(
            head_events.try_recv().expect("second event").block.number(),
            2,
        );
    }

    #[test]
    fn set_head_rewinds_the_canonical_index() {
        let (chain, genesis) = chain_with_genesis();
        let block = build_child(&chain, vec![]);
        let (_, error) = chain.insert_chain(vec![block]);
        assert!(error.is_none());

        chain.set_head(0).expect("genesis is canonical");
        assert_eq!(chain.current(), genesis);
        assert_eq!(chain.canonical_hash(1), None);
    }
}
