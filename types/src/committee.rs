use rlp::{DecoderError, Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Address, BlockNumber, EpochId, H256};

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid committee signature")]
    InvalidSignature,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum MemberFlag {
    #[default]
    Unused = 0xa0,
    Used = 0xa1,
    Removed = 0xa3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum MemberType {
    #[default]
    Fixed = 0,
    Elected = 1,
}

/// One validator seat. `public_key` is the uncompressed SEC1 encoding;
/// committee ordering and leader selection are defined over it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub coinbase: Address,
    #[serde(rename = "publicKey", with = "public_key_hex")]
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub flag: MemberFlag,
    #[serde(default, rename = "type")]
    pub member_type: MemberType,
}

impl CommitteeMember {
    #[must_use]
    pub fn new_fixed(coinbase: Address, public_key: Vec<u8>) -> Self {
        Self {
            coinbase,
            public_key,
            flag: MemberFlag::Used,
            member_type: MemberType::Fixed,
        }
    }

    #[must_use]
    pub fn new_elected(coinbase: Address, public_key: Vec<u8>) -> Self {
        Self {
            coinbase,
            public_key,
            flag: MemberFlag::Used,
            member_type: MemberType::Elected,
        }
    }

    pub fn parsed_key(&self) -> Result<crypto::PublicKey, crypto::Error> {
        crypto::PublicKey::from_sec1_bytes(&self.public_key)
    }

    /// Address the member validates under, derived from the public key.
    /// May differ from `coinbase`, which only receives rewards.
    pub fn validator_address(&self) -> Result<Address, crypto::Error> {
        self.parsed_key().map(crypto::PublicKey::address)
    }
}

impl rlp::Encodable for CommitteeMember {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(4);
        stream.append(&self.coinbase);
        stream.append(&self.public_key);
        stream.append(&(self.flag as u8));
        stream.append(&(self.member_type as u8));
    }
}

impl rlp::Decodable for CommitteeMember {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let flag = match rlp.val_at::<u8>(2)? {
            0xa0 => MemberFlag::Unused,
            0xa1 => MemberFlag::Used,
            0xa3 => MemberFlag::Removed,
            _ => return Err(DecoderError::Custom("unknown committee member flag")),
        };
        let member_type = match rlp.val_at::<u8>(3)? {
            0 => MemberType::Fixed,
            1 => MemberType::Elected,
            _ => return Err(DecoderError::Custom("unknown committee member type")),
        };

        Ok(Self {
            coinbase: rlp.val_at(0)?,
            public_key: rlp.val_at(1)?,
            flag,
            member_type,
        })
    }
}

/// Committee-rotation record ratified inside the last fast block of an epoch.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SwitchInfo {
    pub epoch_id: EpochId,
    pub members: Vec<CommitteeMember>,
}

impl SwitchInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl rlp::Encodable for SwitchInfo {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(2);
        stream.append(&self.epoch_id);
        stream.append_list(&self.members);
    }
}

impl rlp::Decodable for SwitchInfo {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            epoch_id: rlp.val_at(0)?,
            members: rlp.list_at(1)?,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteResult {
    Agree = 1,
    Against = 2,
}

/// One committee member's finality vote over a fast block. A quorum of
/// these, assembled by the BFT engine, is what makes a fast block final.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PbftSign {
    pub fast_number: BlockNumber,
    pub fast_hash: H256,
    pub result: VoteResult,
    pub signature: crypto::Signature,
}

impl PbftSign {
    pub fn create(
        fast_number: BlockNumber,
        fast_hash: H256,
        result: VoteResult,
        secret_key: &crypto::SecretKey,
    ) -> Result<Self, crypto::Error> {
        let signature = secret_key.sign(sign_hash(fast_number, fast_hash, result))?;
        Ok(Self {
            fast_number,
            fast_hash,
            result,
            signature,
        })
    }

    pub fn signer(&self) -> Result<crypto::PublicKey, SignError> {
        crypto::recover(
            sign_hash(self.fast_number, self.fast_hash, self.result),
            self.signature,
        )
        .map_err(|_| SignError::InvalidSignature)
    }

    #[must_use]
    pub fn hash(&self) -> H256 {
        crypto::keccak256(rlp::encode(self))
    }
}

fn sign_hash(fast_number: BlockNumber, fast_hash: H256, result: VoteResult) -> H256 {
    let mut stream = RlpStream::new_list(3);
    stream.append(&fast_number);
    stream.append(&fast_hash);
    stream.append(&(result as u8));
    crypto::keccak256(stream.out())
}

impl rlp::Encodable for PbftSign {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(4);
        stream.append(&self.fast_number);
        stream.append(&self.fast_hash);
        stream.append(&(self.result as u8));
        stream.append(&self.signature.to_bytes().to_vec());
    }
}

impl rlp::Decodable for PbftSign {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let result = match rlp.val_at::<u8>(2)? {
            1 => VoteResult::Agree,
            2 => VoteResult::Against,
            _ => return Err(DecoderError::Custom("unknown vote result")),
        };

        let sign_bytes: Vec<u8> = rlp.val_at(3)?;
        let sign_bytes: [u8; 65] = sign_bytes
            .try_into()
            .map_err(|_| DecoderError::Custom("signature must be 65 bytes"))?;
        let signature = crypto::Signature::from_bytes(&sign_bytes)
            .map_err(|_| DecoderError::Custom("malformed signature"))?;

        Ok(Self {
            fast_number: rlp.val_at(0)?,
            fast_hash: rlp.val_at(1)?,
            result,
            signature,
        })
    }
}

mod public_key_hex {
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex_encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let string = String::deserialize(deserializer)?;
        let stripped = string.strip_prefix("0x").unwrap_or(&string);
        hex_decode(stripped).map_err(D::Error::custom)
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    fn hex_decode(string: &str) -> Result<Vec<u8>, String> {
        if string.len() % 2 != 0 {
            return Err("odd-length hex string".to_owned());
        }
        (0..string.len())
            .step_by(2)
            .map(|index| {
                u8::from_str_radix(&string[index..index + 2], 16)
                    .map_err(|error| error.to_string())
            })
            .collect()
    }
}
