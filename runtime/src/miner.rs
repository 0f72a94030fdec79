use std::{sync::Arc, time::Duration};

use fast_chain::FastChain;
use log::{debug, warn};
use minerva::{Minerva, SealKind};
use snail_chain::SnailChain;
use snail_pool::SnailPool;
use tokio::sync::watch;
use types::{params, Address, Fruit, SnailBlock, SnailHeader};

use crate::handles::unix_now;

/// Mints fruits and snail blocks.
///
/// Each pass mines one fruit per unattested fast block inside the
/// freshness window, then tries to seal a snail block embedding the
/// pool's pending fruits. Sealing runs on the blocking pool and polls the
/// stop channel, so shutdown never waits on a nonce search.
pub struct Miner {
    pub engine: Arc<Minerva>,
    pub fast: Arc<FastChain>,
    pub snail: Arc<SnailChain>,
    pub pool: SnailPool,
    pub coinbase: Address,
    /// Published in mined fruit headers; this is how a miner becomes an
    /// election candidate.
    pub public_key: Vec<u8>,
    pub interval: Duration,
}

impl Miner {
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }

            self.mine_fruits(&stop).await;
            self.mine_block(&stop).await;

            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One fruit per fresh, unattested canonical fast block.
    async fn mine_fruits(&self, stop: &watch::Receiver<bool>) {
        let fast_head = self.fast.current().number();
        let pooled = self.pool.content().await;
        let window_start = fast_head.saturating_sub(params::FRESHNESS_WINDOW);

        for fast_number in window_start..=fast_head {
            if *stop.borrow() {
                return;
            }
            if fast_number == 0 || pooled.contains_key(&fast_number) {
                continue;
            }
            let Some(fast_hash) = self.fast.canonical_hash(fast_number) else {
                continue;
            };
            if self.snail.get_fruit(fast_hash).is_some() {
                continue;
            }

            let mut header = self.candidate_header();
            header.fast_number = fast_number;
            header.fast_hash = fast_hash;
            header.fruits_root = SnailBlock::fruits_root(&[]);

            // Any seal is enough for a fruit; the block target implies the
            // fruit target.
            if let Some((sealed, _)) = self.seal(header, stop).await {
                debug!("mined fruit (fast: {fast_number})");
                if let Err(error) = self.pool.add(Fruit { header: sealed }).await {
                    debug!("mined fruit not admitted: {error}");
                }
            }
        }
    }

    /// Seals a snail block over the pool's pending fruits.
    async fn mine_block(&self, stop: &watch::Receiver<bool>) {
        let fruits = self.pool.pending_fruits().await;
        let Some(newest) = fruits.last() else {
            return;
        };

        // Only fruits inside the freshness window of the newest one may be
        // embedded together.
        let newest_number = newest.fast_number();
        let newest_hash = newest.fast_hash();
        let fruits = fruits
            .iter()
            .filter(|fruit| newest_number - fruit.fast_number() <= params::FRESHNESS_WINDOW)
            .cloned()
            .collect::<Vec<_>>();

        let mut header = self.candidate_header();
        header.fast_number = newest_number;
        header.fast_hash = newest_hash;
        header.fruits_root = SnailBlock::fruits_root(&fruits);

        let Some((sealed, kind)) = self.seal(header, stop).await else {
            return;
        };
        if kind != SealKind::Block {
            return;
        }

        let block = SnailBlock::new(sealed, fruits.clone(), vec![]);
        let hash = block.hash();
        let (_, error) = self.snail.insert_chain(vec![block]);
        match error {
            None => {
                debug!("mined snail block (hash: {hash}, fruits: {})", fruits.len());
                self.pool
                    .remove_batch(fruits.iter().map(Fruit::hash).collect());
            }
            Some(error) => warn!("mined snail block rejected: {error}"),
        }
    }

    fn candidate_header(&self) -> SnailHeader {
        let parent = self.snail.current();
        let time = unix_now().max(parent.header().time + 1);
        let difficulty = self.engine.calc_difficulty(parent.header(), time);

        SnailHeader {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            time,
            difficulty,
            fruit_difficulty: minerva::fruit_difficulty(difficulty),
            coinbase: self.coinbase,
            extra: self.public_key.clone(),
            ..SnailHeader::default()
        }
    }

    async fn seal(
        &self,
        header: SnailHeader,
        stop: &watch::Receiver<bool>,
    ) -> Option<(SnailHeader, SealKind)> {
        let engine = Arc::clone(&self.engine);
        let stop = stop.clone();
        let start_nonce = header.time;

        tokio::task::spawn_blocking(move || engine.seal(header, start_nonce, &stop))
            .await
            .unwrap_or_else(|error| {
                warn!("sealing task panicked: {error}");
                None
            })
    }
}
