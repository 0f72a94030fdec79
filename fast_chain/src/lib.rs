//! Finalized fast-block chain.
//!
//! Fast blocks are BFT-final, so this store has no fork choice: insertion
//! is strictly sequential, each block extends the head, and learning of a
//! *different* committed block at an already-finalized height is fatal.

pub use crate::{
    chain::{FastChain, FinalityVerifier},
    error::ChainError,
    events::{ChainEvent, ChainHeadEvent, Events, LogsEvent, RemovedLogsEvent},
};

pub mod keys;

mod chain;
mod error;
mod events;
