//! Snail-chain key layout. Every key starts with `'s'` to keep the snail
//! key space disjoint from the fast chain sharing the same database.

use types::{BlockNumber, H256};

pub const HEAD_KEY: &[u8] = b"LastSnail";

#[must_use]
pub fn block(number: BlockNumber, hash: H256) -> Vec<u8> {
    num_hash_key(b'b', number, hash)
}

#[must_use]
pub fn total_difficulty(number: BlockNumber, hash: H256) -> Vec<u8> {
    num_hash_key(b't', number, hash)
}

#[must_use]
pub fn canonical(number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.extend_from_slice(b"sn");
    key.extend_from_slice(&number.to_be_bytes());
    key
}

#[must_use]
pub fn number_of(hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.extend_from_slice(b"sH");
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `'sf' + fast hash → canonical snail block hash` embedding the fruit that
/// attests the fast block.
#[must_use]
pub fn fruit_lookup(fast_hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.extend_from_slice(b"sf");
    key.extend_from_slice(fast_hash.as_bytes());
    key
}

fn num_hash_key(kind: u8, number: BlockNumber, hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(42);
    key.push(b's');
    key.push(kind);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}
