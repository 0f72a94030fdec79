use std::{collections::HashSet, sync::Arc};

use anyhow::anyhow;
use database::Database;
use log::{debug, info, warn};
use minerva::Minerva;
use parking_lot::{Mutex, RwLock};
use types::{params, BlockNumber, Fruit, SnailBlock, H256, U256};

use crate::{error::SnailChainError, events::SnailEvents, keys};

/// Read-only view of the fast chain, injected by the coordinator. Fruit
/// admission needs it to confirm that referenced fast blocks are canonical.
pub trait FastchainReader: Send + Sync {
    fn canonical_hash(&self, number: BlockNumber) -> Option<H256>;
    fn head_number(&self) -> BlockNumber;
}

pub struct SnailChain {
    database: Database,
    engine: Arc<Minerva>,
    fast: Arc<dyn FastchainReader>,
    head: RwLock<(SnailBlock, U256)>,
    insert_lock: Mutex<()>,
    events: SnailEvents,
}

impl SnailChain {
    pub fn new(
        database: Database,
        engine: Arc<Minerva>,
        fast: Arc<dyn FastchainReader>,
    ) -> anyhow::Result<Arc<Self>> {
        let head = load_head(&database)?;
        info!(
            "snail chain loaded (head: {}, td: {})",
            head.0.number(),
            head.1,
        );

        Ok(Arc::new(Self {
            database,
            engine,
            fast,
            head: RwLock::new(head),
            insert_lock: Mutex::new(()),
            events: SnailEvents::default(),
        }))
    }

    #[must_use]
    pub fn events(&self) -> &SnailEvents {
        &self.events
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Minerva> {
        &self.engine
    }

    #[must_use]
    pub fn current(&self) -> SnailBlock {
        self.head.read().0.clone()
    }

    #[must_use]
    pub fn head_total_difficulty(&self) -> U256 {
        self.head.read().1
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
    pub fn get_by_number(&self, number: BlockNumber) -> Option<SnailBlock> {
        let hash = self.canonical_hash(number)?;
        self.read_block(number, hash)
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: H256) -> Option<SnailBlock> {
        let number = self.number_of(hash)?;
        self.read_block(number, hash)
    }

    #[must_use]
    pub fn total_difficulty(&self, hash: H256) -> Option<U256> {
        let number = self.number_of(hash)?;
        let bytes = self
            .database
            .get(keys::total_difficulty(number, hash))
            .ok()??;
        Some(U256::from_big_endian(&bytes))
    }

    /// Locates the canonical snail block embedding the fruit that attests
    /// the given fast block.
    #[must_use]
    pub fn get_fruit(&self, fast_hash: H256) -> Option<SnailBlock> {
        let bytes = self.database.get(keys::fruit_lookup(fast_hash)).ok()??;
        self.get_by_hash(H256::from_slice(&bytes))
    }

    pub fn insert_chain(&self, blocks: Vec<SnailBlock>) -> (usize, Option<SnailChainError>) {
        let Some(_guard) = self.insert_lock.try_lock() else {
            return (0, Some(SnailChainError::ConcurrentInsert));
        };

        let mut processed = 0;
        for block in blocks {
            match self.insert_block(block) {
                Ok(()) => processed += 1,
                Err(SnailChainError::KnownBlock { hash }) => {
                    debug!("skipping known snail block (hash: {hash})");
                    processed += 1;
                }
                Err(error) => {
                    warn!("snail chain insertion stopped: {error}");
                    return (processed, Some(error));
                }
            }
        }

        (processed, None)
    }

    fn insert_block(&self, block: SnailBlock) -> Result<(), SnailChainError> {
        let hash = block.hash();
        if self.number_of(hash).is_some() {
            return Err(SnailChainError::KnownBlock { hash });
        }

        let parent =
            self.get_by_hash(block.parent_hash())
                .ok_or(SnailChainError::UnknownAncestor {
                    number: block.number(),
                    parent_hash: block.parent_hash(),
                })?;

        self.engine
            .verify_snail_header(parent.header(), block.header())?;
        self.verify_fruits(&block)?;

        let parent_td = self
            .total_difficulty(parent.hash())
            .ok_or_else(|| SnailChainError::Database(anyhow!("parent td missing")))?;
        let td = parent_td.saturating_add(block.contributed_difficulty());

        self.write_block(&block, td)?;

        let (head_hash, head_td) = {
            let head = self.head.read();
            (head.0.hash(), head.1)
        };

        // Heaviest chain wins; equal weight falls to the smaller hash.
        if td > head_td || (td == head_td && hash < head_hash) {
            self.canonicalize(&block, td)?;
        } else {
            debug!(
                "snail block stored as side fork (number: {}, hash: {hash}, td: {td})",
                block.number(),
            );
        }

        Ok(())
    }

    fn verify_fruits(&self, block: &SnailBlock) -> Result<(), SnailChainError> {
        let fruits = block.fruits();
        let header = block.header();

        let computed = SnailBlock::fruits_root(fruits);
        if computed != header.fruits_root {
            return Err(SnailChainError::FruitsRootMismatch {
                header: header.fruits_root,
                computed,
            });
        }

        let ascending = fruits
            .windows(2)
            .all(|pair| pair[0].fast_number() < pair[1].fast_number());
        if !ascending {
            return Err(SnailChainError::FruitsUnordered);
        }

        if let Some(newest) = fruits.last() {
            if header.fast_number != newest.fast_number() {
                return Err(SnailChainError::FastNumberMismatch {
                    header: header.fast_number,
                    computed: newest.fast_number(),
                });
            }
        }

        for fruit in fruits {
            self.engine.verify_seal(&fruit.header, true)?;

            if self.fast.canonical_hash(fruit.fast_number()) != Some(fruit.fast_hash()) {
                return Err(SnailChainError::UnknownFastBlock {
                    fast_number: fruit.fast_number(),
                    fast_hash: fruit.fast_hash(),
                });
            }

            if header.fast_number.saturating_sub(fruit.fast_number()) > params::FRESHNESS_WINDOW {
                return Err(SnailChainError::StaleFruit {
                    fast_number: fruit.fast_number(),
                });
            }
        }

        Ok(())
    }

    /// Makes `new_tip` the canonical head, re-indexing fruits collectively.
    /// The losing branch's fruits are announced for pool re-admission.
    fn canonicalize(&self, new_tip: &SnailBlock, td: U256) -> Result<(), SnailChainError> {
        let old_head_number = self.head.read().0.number();

        // Walk back until the branch rejoins the canonical index.
        let mut branch = vec![new_tip.clone()];
        loop {
            let earliest = branch.last().expect("branch starts with the new tip");
            if self.canonical_hash(earliest.number()) == Some(earliest.hash()) {
                let _rejoined = branch.pop();
                break;
            }
            if earliest.number() == 0 {
                break;
            }
            let parent = self.get_by_hash(earliest.parent_hash()).ok_or_else(|| {
                SnailChainError::Database(anyhow!("broken parent link during reorg"))
            })?;
            branch.push(parent);
        }
        branch.reverse();

        let ancestor_number = branch
            .first()
            .map_or(old_head_number, |block| block.number() - 1);

        // Blocks of the losing branch, for lookup removal and re-admission.
        let mut reverted_fruits = vec![];
        let mut reverted_lookups = HashSet::new();
        for number in (ancestor_number + 1)..=old_head_number {
            let Some(reverted) = self.get_by_number(number) else {
                continue;
            };
            for fruit in reverted.fruits() {
                let _inserted = reverted_lookups.insert(fruit.fast_hash());
                reverted_fruits.push(fruit.clone());
            }
        }

        // Fruit uniqueness across the would-be canonical chain: a fast
        // hash may not be attested twice outside the branch being reverted.
        let mut seen = HashSet::new();
        for block in &branch {
            for fruit in block.fruits() {
                let fast_hash = fruit.fast_hash();
                if !seen.insert(fast_hash) {
                    return Err(SnailChainError::DuplicateFruit { fast_hash });
                }

                let existing = self
                    .database
                    .get(keys::fruit_lookup(fast_hash))
                    .map_err(SnailChainError::Database)?;
                if existing.is_some() && !reverted_lookups.contains(&fast_hash) {
                    return Err(SnailChainError::DuplicateFruit { fast_hash });
                }
            }
        }

        // Stale canonical entries above the new tip.
        for number in (new_tip.number() + 1)..=old_head_number {
            self.database
                .delete(keys::canonical(number))
                .map_err(SnailChainError::Database)?;
        }
        for fast_hash in &reverted_lookups {
            self.database
                .delete(keys::fruit_lookup(*fast_hash))
                .map_err(SnailChainError::Database)?;
        }

        let mut batch = vec![(keys::HEAD_KEY.to_vec(), new_tip.hash().as_bytes().to_vec())];
        for block in &branch {
            batch.push((
                keys::canonical(block.number()),
                block.hash().as_bytes().to_vec(),
            ));
            for fruit in block.fruits() {
                batch.push((
                    keys::fruit_lookup(fruit.fast_hash()),
                    block.hash().as_bytes().to_vec(),
                ));
            }
        }
        self.database
            .put_batch(batch)
            .map_err(SnailChainError::Database)?;

        *self.head.write() = (new_tip.clone(), td);

        if !reverted_fruits.is_empty() {
            info!(
                "snail chain reorged (head: {}, reverted fruits: {})",
                new_tip.number(),
                reverted_fruits.len(),
            );
        }
        self.events.publish_head(new_tip);
        self.events.publish_reorg(reverted_fruits);

        Ok(())
    }

    fn write_block(&self, block: &SnailBlock, td: U256) -> Result<(), SnailChainError> {
        let number = block.number();
        let hash = block.hash();

        let mut td_bytes = [0; 32];
        td.to_big_endian(&mut td_bytes);

        self.database
            .put_batch([
                (keys::block(number, hash), rlp::encode(block).to_vec()),
                (keys::number_of(hash), number.to_be_bytes().to_vec()),
                (keys::total_difficulty(number, hash), td_bytes.to_vec()),
            ])
            .map_err(SnailChainError::Database)
    }

    fn number_of(&self, hash: H256) -> Option<BlockNumber> {
        let bytes = self.database.get(keys::number_of(hash)).ok()??;
        Some(BlockNumber::from_be_bytes(bytes.try_into().ok()?))
    }

    fn read_block(&self, number: BlockNumber, hash: H256) -> Option<SnailBlock> {
        let bytes = self.database.get(keys::block(number, hash)).ok()??;
        rlp::decode(&bytes).ok()
    }
}

fn load_head(database: &Database) -> anyhow::Result<(SnailBlock, U256)> {
    let head_hash = database
        .get(keys::HEAD_KEY)?
        .ok_or_else(|| anyhow!("database has no snail head; genesis setup must run first"))?;
    let head_hash = H256::from_slice(&head_hash);

    let number_bytes = database
        .get(keys::number_of(head_hash))?
        .ok_or_else(|| anyhow!("snail head {head_hash} has no number entry"))?;
    let number = BlockNumber::from_be_bytes(
        number_bytes
            .try_into()
            .map_err(|_| anyhow!("malformed number entry for snail head"))?,
    );

    let block_bytes = database
        .get(keys::block(number, head_hash))?
        .ok_or_else(|| anyhow!("snail head {head_hash} has no block"))?;
    let block: SnailBlock = rlp::decode(&block_bytes)?;

    let td_bytes = database
        .get(keys::total_difficulty(number, head_hash))?
        .ok_or_else(|| anyhow!("snail head {head_hash} has no total difficulty"))?;

    Ok((block, U256::from_big_endian(&td_bytes)))
}
