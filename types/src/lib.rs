//! Shared data model for both TaiChain chains.
//!
//! The fast chain carries transactions and is finalized by committee
//! signatures. The snail chain is proof-of-work and embeds fruits, each of
//! which attests one fast block. Everything here is hashed and transmitted
//! in canonical RLP, so field order in the `rlp_append` implementations is
//! consensus-critical.

pub use crate::{
    committee::{CommitteeMember, MemberFlag, MemberType, PbftSign, SignError, SwitchInfo, VoteResult},
    config::{ChainConfig, ConfigCompatError},
    fast::{FastBlock, FastBody, FastHeader},
    primitives::{ordered_root, Address, BlockNumber, EpochId, Gas, NetworkId, H256, U256},
    receipt::{Log, Receipt, ReceiptStatus},
    snail::{Fruit, SnailBlock, SnailHeader},
    transaction::{SenderError, Transaction, TransactionBody},
};

pub mod params;

mod committee;
mod config;
mod fast;
mod primitives;
mod receipt;
mod snail;
mod transaction;
