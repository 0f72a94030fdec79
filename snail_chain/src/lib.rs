//! Snail chain: the PoW+fruit chain that supervises fast finality.
//!
//! Unlike the fast chain this store keeps side forks. The canonical head is
//! the tip with the greatest cumulative difficulty, ties broken by the
//! lexicographically smaller hash. Canonicalizing a branch re-indexes its
//! fruits collectively and announces the fruits of the losing branch so the
//! snail pool can re-admit them.

pub use crate::{
    chain::{FastchainReader, SnailChain},
    error::SnailChainError,
    events::{FruitsReorgEvent, SnailEvents, SnailHeadEvent},
};

pub mod keys;

mod chain;
mod error;
mod events;
