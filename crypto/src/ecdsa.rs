use ethereum_types::{H160, H256};
use k256::{
    ecdsa::{RecoveryId, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint as _,
};
use thiserror::Error;

use crate::keccak::keccak256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid secret key scalar")]
    InvalidSecretKey,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] k256::ecdsa::Error),
    #[error("invalid recovery id: {v}")]
    InvalidRecoveryId { v: u8 },
}

/// A secp256k1 signature in `(r, s, v)` form.
///
/// `v` is the bare recovery id (0 or 1), not the legacy 27/28 encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature {
    pub r: H256,
    pub s: H256,
    pub v: u8,
}

impl Signature {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 65] {
        let mut bytes = [0; 65];
        bytes[..32].copy_from_slice(self.r.as_bytes());
        bytes[32..64].copy_from_slice(self.s.as_bytes());
        bytes[64] = self.v;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 65]) -> Result<Self, Error> {
        let v = bytes[64];
        if v > 1 {
            return Err(Error::InvalidRecoveryId { v });
        }
        Ok(Self {
            r: H256::from_slice(&bytes[..32]),
            s: H256::from_slice(&bytes[32..64]),
            v,
        })
    }
}

#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidSecretKey)
    }

    #[must_use]
    pub fn random(rng: &mut (impl rand::CryptoRng + rand::RngCore)) -> Self {
        Self(SigningKey::random(rng))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }

    #[must_use]
    pub fn address(&self) -> H160 {
        self.public_key().address()
    }

    pub fn sign(&self, message_hash: H256) -> Result<Signature, Error> {
        let (signature, recovery_id) = self.0.sign_prehash_recoverable(message_hash.as_bytes())?;
        let bytes = signature.to_bytes();
        Ok(Signature {
            r: H256::from_slice(&bytes[..32]),
            s: H256::from_slice(&bytes[32..]),
            v: recovery_id.to_byte(),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, Error> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidPublicKey)
    }

    /// Uncompressed SEC1 encoding: `0x04 || x || y`.
    #[must_use]
    pub fn to_uncompressed_bytes(self) -> [u8; 65] {
        let point = self.0.to_encoded_point(false);
        let mut bytes = [0; 65];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    #[must_use]
    pub fn address(self) -> H160 {
        let uncompressed = self.to_uncompressed_bytes();
        let hash = keccak256(&uncompressed[1..]);
        H160::from_slice(&hash.as_bytes()[12..])
    }
}

pub fn recover(message_hash: H256, signature: Signature) -> Result<PublicKey, Error> {
    let recovery_id =
        RecoveryId::from_byte(signature.v).ok_or(Error::InvalidRecoveryId { v: signature.v })?;

    let mut rs = [0; 64];
    rs[..32].copy_from_slice(signature.r.as_bytes());
    rs[32..].copy_from_slice(signature.s.as_bytes());
    let signature = k256::ecdsa::Signature::from_slice(&rs)?;

    VerifyingKey::recover_from_prehash(message_hash.as_bytes(), &signature, recovery_id)
        .map(PublicKey)
        .map_err(Into::into)
}
