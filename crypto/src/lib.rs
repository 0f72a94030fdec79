//! Hashing and recoverable ECDSA signatures.
//!
//! Everything that identifies an object on either chain goes through
//! [`keccak256`]. Signatures are secp256k1 with a recovery id so that the
//! signer's address can be computed from the signature alone.

pub use crate::{
    ecdsa::{recover, Error, PublicKey, SecretKey, Signature},
    keccak::{keccak256, keccak256_concat},
};

mod ecdsa;
mod keccak;
