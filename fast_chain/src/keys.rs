//! Fast-chain key layout, byte-prefixed:
//! `'h' + num + hash → header`, `'b' + num + hash → body`,
//! `'r' + num + hash → receipts`, `'n' + num → canonical hash`,
//! `'L' + hash → tx lookup`, `'c' + hash → chain config`,
//! `"LastFast" → head hash`.

use types::{BlockNumber, H256};

pub const HEAD_KEY: &[u8] = b"LastFast";

#[must_use]
pub fn header(number: BlockNumber, hash: H256) -> Vec<u8> {
    num_hash_key(b'h', number, hash)
}

#[must_use]
pub fn body(number: BlockNumber, hash: H256) -> Vec<u8> {
    num_hash_key(b'b', number, hash)
}

#[must_use]
pub fn receipts(number: BlockNumber, hash: H256) -> Vec<u8> {
    num_hash_key(b'r', number, hash)
}

#[must_use]
pub fn canonical(number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'n');
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// `'H' + hash → number`, the reverse index for hash-keyed lookups.
#[must_use]
pub fn number_of(hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'H');
    key.extend_from_slice(hash.as_bytes());
    key
}

#[must_use]
pub fn tx_lookup(tx_hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'L');
    key.extend_from_slice(tx_hash.as_bytes());
    key
}

#[must_use]
pub fn chain_config(genesis_hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'c');
    key.extend_from_slice(genesis_hash.as_bytes());
    key
}

fn num_hash_key(prefix: u8, number: BlockNumber, hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}
