pub use ethereum_types::{H256, U256};

pub type Address = ethereum_types::H160;
pub type BlockNumber = u64;
pub type EpochId = u64;
pub type Gas = u64;
pub type NetworkId = u64;

/// Commitment over an ordered list of RLP-encodable items.
///
/// Stands in for a full Merkle-Patricia trie: pairs of item hashes are folded
/// upward until one root remains. An empty list commits to the empty hash.
#[must_use]
pub fn ordered_root<T: rlp::Encodable>(items: impl IntoIterator<Item = T>) -> H256 {
    let mut layer = items
        .into_iter()
        .map(|item| crypto::keccak256(rlp::encode(&item)))
        .collect::<Vec<_>>();

    if layer.is_empty() {
        return crypto::keccak256([]);
    }

    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match *pair {
                [left, right] => crypto::keccak256_concat(left, right),
                [odd] => crypto::keccak256_concat(odd, odd),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    layer[0]
}
