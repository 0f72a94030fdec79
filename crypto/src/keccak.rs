use ethereum_types::H256;
use sha3::{Digest as _, Keccak256};

#[must_use]
pub fn keccak256(bytes: impl AsRef<[u8]>) -> H256 {
    H256(Keccak256::digest(bytes.as_ref()).into())
}

#[must_use]
pub fn keccak256_concat(a: impl AsRef<[u8]>, b: impl AsRef<[u8]>) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(a.as_ref());
    hasher.update(b.as_ref());
    H256(hasher.finalize().into())
}
