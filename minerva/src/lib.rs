//! Minerva proof-of-work engine.
//!
//! Ethash-shaped: a deterministic per-epoch dataset is derived from an
//! iterated seed, and a seal is valid when
//! `keccak(pow_hash || dataset[nonce % len])` interpreted as an integer is
//! at most `U256::MAX / difficulty`. Fruits use the same search with the
//! lower fruit difficulty, so one nonce stream mines both.

use std::{num::NonZeroUsize, sync::Arc};

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use types::{params, BlockNumber, ChainConfig, SnailHeader, H256, U256};

/// Nonces tried between checks of the stop channel.
const STOP_POLL_INTERVAL: u64 = 1024;

const NORMAL_DATASET_SIZE: usize = 16_384;
const TEST_DATASET_SIZE: usize = 64;
const CACHED_EPOCHS: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Full dataset, real verification.
    Normal,
    /// Tiny dataset for fast tests; verification is still real.
    Test,
    /// Accepts any seal and seals instantly.
    Fake,
}

#[derive(Debug, Error)]
pub enum PowError {
    #[error("seal does not meet the difficulty target")]
    InvalidSeal,
    #[error("mix digest does not match the dataset")]
    InvalidMixDigest,
    #[error("difficulty {got} does not match retarget {expected}")]
    WrongDifficulty { expected: U256, got: U256 },
    #[error("fruit difficulty {got} is not block difficulty / {ratio}")]
    WrongFruitDifficulty { ratio: u64, got: U256 },
    #[error("header number {got} does not follow parent {parent}")]
    WrongNumber { parent: BlockNumber, got: BlockNumber },
    #[error("timestamp does not advance past parent")]
    TimestampNotAdvancing,
    #[error("zero difficulty")]
    ZeroDifficulty,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SealKind {
    /// Meets the block target (and therefore the fruit target too).
    Block,
    /// Meets only the fruit target.
    Fruit,
}

pub struct Minerva {
    config: ChainConfig,
    mode: Mode,
    datasets: Mutex<LruCache<u64, Arc<Vec<H256>>>>,
}

impl Minerva {
    #[must_use]
    pub fn new(config: ChainConfig, mode: Mode) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(CACHED_EPOCHS).expect("cache capacity constant is nonzero");
        Arc::new(Self {
            config,
            mode,
            datasets: Mutex::new(LruCache::new(capacity)),
        })
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Chain-rule checks for a snail header against its parent. Fruits have
    /// no snail parent; their header checks live in pool and chain
    /// validation, which call [`Minerva::verify_seal`] directly.
    pub fn verify_snail_header(
        &self,
        parent: &SnailHeader,
        header: &SnailHeader,
    ) -> Result<(), PowError> {
        if header.number != parent.number + 1 {
            return Err(PowError::WrongNumber {
                parent: parent.number,
                got: header.number,
            });
        }

        if header.time <= parent.time {
            return Err(PowError::TimestampNotAdvancing);
        }

        let expected = self.calc_difficulty(parent, header.time);
        if header.difficulty != expected {
            return Err(PowError::WrongDifficulty {
                expected,
                got: header.difficulty,
            });
        }

        // Fruit-difficulty cross-validation is intentionally enforced here.
        let expected_fruit = fruit_difficulty(header.difficulty);
        if header.fruit_difficulty != expected_fruit {
            return Err(PowError::WrongFruitDifficulty {
                ratio: params::FRUIT_RATIO,
                got: header.fruit_difficulty,
            });
        }

        self.verify_seal(header, false)
    }

    /// Verifies the PoW seal. `is_fruit` selects which of the two targets in
    /// the header applies.
    pub fn verify_seal(&self, header: &SnailHeader, is_fruit: bool) -> Result<(), PowError> {
        if self.mode == Mode::Fake {
            return Ok(());
        }

        let difficulty = if is_fruit {
            header.fruit_difficulty
        } else {
            header.difficulty
        };
        if difficulty.is_zero() {
            return Err(PowError::ZeroDifficulty);
        }

        let dataset = self.dataset(dataset_epoch(header.fast_number));
        let mix = mix_digest(header.pow_hash(), &dataset, header.nonce);

        if mix != header.mix_digest {
            return Err(PowError::InvalidMixDigest);
        }

        if !meets_target(mix, difficulty) {
            return Err(PowError::InvalidSeal);
        }

        Ok(())
    }

    /// Difficulty retarget. The Tip9 fork tightens the target spacing.
    #[must_use]
    pub fn calc_difficulty(&self, parent: &SnailHeader, time: u64) -> U256 {
        let duration_limit = if self.config.is_tip9(parent.number + 1) {
            params::SNAIL_BLOCK_TIME / 2
        } else {
            params::SNAIL_BLOCK_TIME
        };

        let elapsed = time.saturating_sub(parent.time).max(1);
        let adjustment = parent.difficulty / U256::from(2048);

        let difficulty = if elapsed < duration_limit {
            parent.difficulty.saturating_add(adjustment)
        } else {
            // Slow block: back off one step per missed interval, at most 99.
            let steps = ((elapsed / duration_limit).min(100)).saturating_sub(1).max(1);
            parent
                .difficulty
                .saturating_sub(adjustment.saturating_mul(U256::from(steps)))
        };

        difficulty.max(minimum_difficulty())
    }

    /// Searches for a seal starting at `start_nonce`. Returns `None` when
    /// the stop channel fires before a solution is found. The stop channel
    /// is polled at least once every [`STOP_POLL_INTERVAL`] nonces.
    pub fn seal(
        &self,
        mut header: SnailHeader,
        start_nonce: u64,
        stop: &watch::Receiver<bool>,
    ) -> Option<(SnailHeader, SealKind)> {
        if self.mode == Mode::Fake {
            header.nonce = start_nonce;
            header.mix_digest = H256::zero();
            return Some((header, SealKind::Block));
        }

        let dataset = self.dataset(dataset_epoch(header.fast_number));
        let pow_hash = header.pow_hash();
        let mut nonce = start_nonce;

        loop {
            for _ in 0..STOP_POLL_INTERVAL {
                let mix = mix_digest(pow_hash, &dataset, nonce);

                let kind = if meets_target(mix, header.difficulty) {
                    Some(SealKind::Block)
                } else if meets_target(mix, header.fruit_difficulty) {
                    Some(SealKind::Fruit)
                } else {
                    None
                };

                if let Some(kind) = kind {
                    debug!("sealed header (number: {}, nonce: {nonce})", header.number);
                    header.nonce = nonce;
                    header.mix_digest = mix;
                    return Some((header, kind));
                }

                nonce = nonce.wrapping_add(1);
            }

            if *stop.borrow() {
                return None;
            }
        }
    }

    fn dataset(&self, epoch: u64) -> Arc<Vec<H256>> {
        if let Some(dataset) = self.datasets.lock().get(&epoch) {
            return Arc::clone(dataset);
        }

        // Generated outside the lock; a racing generation of the same epoch
        // produces an identical dataset.
        let size = match self.mode {
            Mode::Normal => NORMAL_DATASET_SIZE,
            Mode::Test | Mode::Fake => TEST_DATASET_SIZE,
        };
        let dataset = Arc::new(generate_dataset(epoch, size));

        let _evicted = self
            .datasets
            .lock()
            .push(epoch, Arc::clone(&dataset));
        dataset
    }
}

#[must_use]
pub fn fruit_difficulty(block_difficulty: U256) -> U256 {
    (block_difficulty / params::FRUIT_RATIO).max(U256::one())
}

#[must_use]
pub fn minimum_difficulty() -> U256 {
    U256::from(16)
}

#[must_use]
pub fn dataset_epoch(fast_number: BlockNumber) -> u64 {
    fast_number / params::DATASET_EPOCH_LENGTH
}

fn generate_dataset(epoch: u64, size: usize) -> Vec<H256> {
    let mut seed = crypto::keccak256(b"minerva");
    for _ in 0..=epoch {
        seed = crypto::keccak256(seed);
    }

    (0..size)
        .map(|index| crypto::keccak256_concat(seed, (index as u64).to_be_bytes()))
        .collect()
}

fn mix_digest(pow_hash: H256, dataset: &[H256], nonce: u64) -> H256 {
    let index = usize::try_from(nonce % dataset.len() as u64)
        .expect("dataset length fits in usize");
    crypto::keccak256_concat(pow_hash, dataset[index])
}

fn meets_target(mix: H256, difficulty: U256) -> bool {
    if difficulty.is_zero() {
        return false;
    }
    U256::from_big_endian(mix.as_bytes()) <= U256::MAX / difficulty
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(mode: Mode) -> Arc<Minerva> {
        Minerva::new(ChainConfig::singlenode(), mode)
    }

    fn header(difficulty: u64) -> SnailHeader {
        SnailHeader {
            number: 1,
            time: 1000,
            difficulty: U256::from(difficulty),
            fruit_difficulty: fruit_difficulty(U256::from(difficulty)),
            ..SnailHeader::default()
        }
    }

    fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn sealed_header_verifies() {
        let engine = engine(Mode::Test);
        let (_tx, stop) = stop_channel();

        let (sealed, kind) = engine
            .seal(header(4), 0, &stop)
            .expect("difficulty 4 is found quickly in test mode");

        let is_fruit = kind == SealKind::Fruit;
        engine
            .verify_seal(&sealed, is_fruit)
            .expect("seal was just mined");
    }

    #[test]
    fn tampered_nonce_fails_verification() {
        let engine = engine(Mode::Test);
        let (_tx, stop) = stop_channel();

        let (mut sealed, _) = engine
            .seal(header(4), 0, &stop)
            .expect("difficulty 4 is found quickly in test mode");
        sealed.nonce = sealed.nonce.wrapping_add(1);

        assert!(engine.verify_seal(&sealed, false).is_err());
    }

    #[test]
    fn fake_mode_accepts_anything() {
        let engine = engine(Mode::Fake);
        engine
            .verify_seal(&header(u64::MAX), false)
            .expect("fake mode accepts any seal");
    }

    #[test]
    fn stop_channel_aborts_the_search() {
        let engine = engine(Mode::Test);
        let (tx, stop) = stop_channel();
        tx.send(true).expect("receiver is alive");

        // An absurd difficulty would search forever without the stop.
        let mut impossible = header(4);
        impossible.difficulty = U256::MAX;
        impossible.fruit_difficulty = U256::MAX;

        assert!(engine.seal(impossible, 0, &stop).is_none());
    }

    #[test]
    fn retarget_raises_difficulty_for_fast_blocks() {
        let engine = engine(Mode::Test);
        let parent = SnailHeader {
            number: 10,
            time: 1000,
            difficulty: U256::from(100_000),
            ..SnailHeader::default()
        };

        let fast = engine.calc_difficulty(&parent, 1010);
        let slow = engine.calc_difficulty(&parent, 1000 + 10 * params::SNAIL_BLOCK_TIME);

        assert!(fast > parent.difficulty);
        assert!(slow < parent.difficulty);
    }

    #[test]
    fn difficulty_never_drops_below_minimum() {
        let engine = engine(Mode::Test);
        let parent = SnailHeader {
            number: 10,
            time: 1000,
            difficulty: U256::from(17),
            ..SnailHeader::default()
        };

        let retargeted = engine.calc_difficulty(&parent, 1_000_000);
        assert_eq!(retargeted, minimum_difficulty());
    }
}
