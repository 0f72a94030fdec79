//! Transaction pool.
//!
//! A single-writer actor owns all pool state; the [`TxPool`] handle is a
//! cheap clone that forwards operations over a channel. Per sender the pool
//! keeps a contiguous nonce-ordered `pending` queue starting at the account's
//! state nonce and a `queued` map for future nonces. On every new fast head
//! the pool rebases both against the new state.

pub use crate::pool::{ChainReader, NewTxEvent, PoolConfig, Service, TxPool, TxPoolError};

mod pool;
