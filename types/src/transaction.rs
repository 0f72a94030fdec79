use crypto::Signature;
use once_cell::sync::OnceCell;
use rlp::{DecoderError, Rlp, RlpStream};
use thiserror::Error;

use crate::primitives::{Address, Gas, H256, U256};

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("invalid transaction signature")]
    InvalidSignature,
}

/// The signed-over portion of a transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TransactionBody {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: Gas,
    /// `None` is contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
}

impl TransactionBody {
    /// Hash signed by the sender. The chain id is folded in for replay
    /// protection, so a signature is only valid on one network.
    #[must_use]
    pub fn sig_hash(&self, chain_id: u64) -> H256 {
        let mut stream = RlpStream::new_list(7);
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        append_optional_address(&mut stream, self.to);
        stream.append(&self.value);
        stream.append(&self.data);
        stream.append(&chain_id);
        crypto::keccak256(stream.out())
    }
}

#[derive(Clone, Debug)]
pub struct Transaction {
    body: TransactionBody,
    signature: Signature,
    hash: OnceCell<H256>,
    sender: OnceCell<Address>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body && self.signature == other.signature
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn sign(
        body: TransactionBody,
        secret_key: &crypto::SecretKey,
        chain_id: u64,
    ) -> Result<Self, crypto::Error> {
        let signature = secret_key.sign(body.sig_hash(chain_id))?;
        Ok(Self::new_signed(body, signature))
    }

    #[must_use]
    pub fn new_signed(body: TransactionBody, signature: Signature) -> Self {
        Self {
            body,
            signature,
            hash: OnceCell::new(),
            sender: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn body(&self) -> &TransactionBody {
        &self.body
    }

    #[must_use]
    pub fn signature(&self) -> Signature {
        self.signature
    }

    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.body.nonce
    }

    #[must_use]
    pub fn gas_price(&self) -> U256 {
        self.body.gas_price
    }

    #[must_use]
    pub fn gas_limit(&self) -> Gas {
        self.body.gas_limit
    }

    #[must_use]
    pub fn value(&self) -> U256 {
        self.body.value
    }

    /// Hash over the full signed encoding. Uniquely identifies the
    /// transaction everywhere: pools, lookup entries, gossip dedupe.
    #[must_use]
    pub fn hash(&self) -> H256 {
        *self
            .hash
            .get_or_init(|| crypto::keccak256(rlp::encode(self)))
    }

    /// Recovers the sender address. The result is cached, so repeated calls
    /// only pay for one elliptic curve operation.
    pub fn sender(&self, chain_id: u64) -> Result<Address, SenderError> {
        self.sender
            .get_or_try_init(|| {
                crypto::recover(self.body.sig_hash(chain_id), self.signature)
                    .map(crypto::PublicKey::address)
                    .map_err(|_| SenderError::InvalidSignature)
            })
            .copied()
    }

    /// Maximum wei the sender may spend: `value + gas_limit * gas_price`.
    #[must_use]
    pub fn cost(&self) -> U256 {
        self.body
            .value
            .saturating_add(U256::from(self.body.gas_limit).saturating_mul(self.body.gas_price))
    }

    #[must_use]
    pub fn size(&self) -> usize {
        rlp::encode(self).len()
    }
}

fn append_optional_address(stream: &mut RlpStream, address: Option<Address>) {
    match address {
        Some(address) => stream.append(&address),
        None => stream.append_empty_data(),
    };
}

impl rlp::Encodable for Transaction {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(9);
        stream.append(&self.body.nonce);
        stream.append(&self.body.gas_price);
        stream.append(&self.body.gas_limit);
        append_optional_address(stream, self.body.to);
        stream.append(&self.body.value);
        stream.append(&self.body.data);
        stream.append(&self.signature.v);
        stream.append(&U256::from_big_endian(self.signature.r.as_bytes()));
        stream.append(&U256::from_big_endian(self.signature.s.as_bytes()));
    }
}

impl rlp::Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let to = {
            let field = rlp.at(3)?;
            if field.is_empty() {
                None
            } else {
                Some(field.as_val::<Address>()?)
            }
        };

        let body = TransactionBody {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas_limit: rlp.val_at(2)?,
            to,
            value: rlp.val_at(4)?,
            data: rlp.val_at(5)?,
        };

        let v: u8 = rlp.val_at(6)?;
        if v > 1 {
            return Err(DecoderError::Custom("recovery id out of range"));
        }

        let signature = Signature {
            v,
            r: u256_to_h256(rlp.val_at(7)?),
            s: u256_to_h256(rlp.val_at(8)?),
        };

        Ok(Self::new_signed(body, signature))
    }
}

fn u256_to_h256(value: U256) -> H256 {
    let mut bytes = [0; 32];
    value.to_big_endian(&mut bytes);
    H256(bytes)
}
