use once_cell::sync::OnceCell;
use rlp::{DecoderError, Rlp, RlpStream};

use crate::{
    committee::PbftSign,
    primitives::{ordered_root, Address, BlockNumber, H256, U256},
};

/// Header shared by snail blocks and fruits.
///
/// For a snail block the `fast_*` fields are zero and `difficulty` is the
/// block target. For a fruit they reference the attested fast block and
/// `fruit_difficulty` is the (much lower) fruit target. Both targets are
/// carried so that a miner can satisfy either with the same header hash.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SnailHeader {
    pub parent_hash: H256,
    pub number: BlockNumber,
    pub time: u64,
    pub difficulty: U256,
    pub fruit_difficulty: U256,
    pub coinbase: Address,
    pub fast_number: BlockNumber,
    pub fast_hash: H256,
    pub fruits_root: H256,
    pub mix_digest: H256,
    pub nonce: u64,
    pub extra: Vec<u8>,
}

impl SnailHeader {
    #[must_use]
    pub fn hash(&self) -> H256 {
        crypto::keccak256(rlp::encode(self))
    }

    /// Hash of everything the seal commits to, i.e. the header without the
    /// `mix_digest` and `nonce` the miner is searching for.
    #[must_use]
    pub fn pow_hash(&self) -> H256 {
        let mut stream = RlpStream::new_list(10);
        stream.append(&self.parent_hash);
        stream.append(&self.number);
        stream.append(&self.time);
        stream.append(&self.difficulty);
        stream.append(&self.fruit_difficulty);
        stream.append(&self.coinbase);
        stream.append(&self.fast_number);
        stream.append(&self.fast_hash);
        stream.append(&self.fruits_root);
        stream.append(&self.extra);
        crypto::keccak256(stream.out())
    }
}

impl rlp::Encodable for SnailHeader {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(12);
        stream.append(&self.parent_hash);
        stream.append(&self.number);
        stream.append(&self.time);
        stream.append(&self.difficulty);
        stream.append(&self.fruit_difficulty);
        stream.append(&self.coinbase);
        stream.append(&self.fast_number);
        stream.append(&self.fast_hash);
        stream.append(&self.fruits_root);
        stream.append(&self.mix_digest);
        stream.append(&self.nonce);
        stream.append(&self.extra);
    }
}

impl rlp::Decodable for SnailHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            number: rlp.val_at(1)?,
            time: rlp.val_at(2)?,
            difficulty: rlp.val_at(3)?,
            fruit_difficulty: rlp.val_at(4)?,
            coinbase: rlp.val_at(5)?,
            fast_number: rlp.val_at(6)?,
            fast_hash: rlp.val_at(7)?,
            fruits_root: rlp.val_at(8)?,
            mix_digest: rlp.val_at(9)?,
            nonce: rlp.val_at(10)?,
            extra: rlp.val_at(11)?,
        })
    }
}

/// A PoW-valid attestation of one fast block. Not a block by itself; it only
/// counts once embedded in a snail block.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Fruit {
    pub header: SnailHeader,
}

impl Fruit {
    #[must_use]
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    #[must_use]
    pub fn fast_number(&self) -> BlockNumber {
        self.header.fast_number
    }

    #[must_use]
    pub fn fast_hash(&self) -> H256 {
        self.header.fast_hash
    }

    #[must_use]
    pub fn difficulty(&self) -> U256 {
        self.header.fruit_difficulty
    }
}

impl rlp::Encodable for Fruit {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.append(&self.header);
    }
}

impl rlp::Decodable for Fruit {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: SnailHeader::decode(rlp)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct SnailBlock {
    header: SnailHeader,
    fruits: Vec<Fruit>,
    signs: Vec<PbftSign>,
    hash: OnceCell<H256>,
}

impl PartialEq for SnailBlock {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.fruits == other.fruits && self.signs == other.signs
    }
}

impl Eq for SnailBlock {}

impl SnailBlock {
    #[must_use]
    pub fn new(header: SnailHeader, fruits: Vec<Fruit>, signs: Vec<PbftSign>) -> Self {
        Self {
            header,
            fruits,
            signs,
            hash: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &SnailHeader {
        &self.header
    }

    #[must_use]
    pub fn fruits(&self) -> &[Fruit] {
        &self.fruits
    }

    #[must_use]
    pub fn signs(&self) -> &[PbftSign] {
        &self.signs
    }

    #[must_use]
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    #[must_use]
    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    #[must_use]
    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }

    #[must_use]
    pub fn hash(&self) -> H256 {
        *self.hash.get_or_init(|| self.header.hash())
    }

    /// Difficulty this block contributes to the chain: its own plus that of
    /// every embedded fruit.
    #[must_use]
    pub fn contributed_difficulty(&self) -> U256 {
        self.fruits
            .iter()
            .fold(self.header.difficulty, |sum, fruit| {
                sum.saturating_add(fruit.difficulty())
            })
    }

    #[must_use]
    pub fn fruits_root(fruits: &[Fruit]) -> H256 {
        ordered_root(fruits.iter().cloned())
    }
}

impl rlp::Encodable for SnailBlock {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(3);
        stream.append(&self.header);
        stream.append_list(&self.fruits);
        stream.append_list(&self.signs);
    }
}

impl rlp::Decodable for SnailBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self::new(
            rlp.val_at(0)?,
            rlp.list_at(1)?,
            rlp.list_at(2)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fruit(fast_number: BlockNumber, fruit_difficulty: u64) -> Fruit {
        Fruit {
            header: SnailHeader {
                fast_number,
                fast_hash: H256::repeat_byte(u8::try_from(fast_number % 251).unwrap_or(1)),
                fruit_difficulty: U256::from(fruit_difficulty),
                ..SnailHeader::default()
            },
        }
    }

    #[test]
    fn contributed_difficulty_sums_block_and_fruits() {
        let header = SnailHeader {
            difficulty: U256::from(100),
            ..SnailHeader::default()
        };
        let block = SnailBlock::new(header, vec![fruit(1, 5), fruit(2, 7)], vec![]);

        assert_eq!(block.contributed_difficulty(), U256::from(112));
    }

    #[test]
    fn pow_hash_is_stable_under_sealing() {
        let mut header = SnailHeader {
            number: 3,
            difficulty: U256::from(1000),
            ..SnailHeader::default()
        };
        let before = header.pow_hash();

        header.nonce = 0xdead_beef;
        header.mix_digest = H256::repeat_byte(9);

        assert_eq!(header.pow_hash(), before);
        assert_ne!(header.hash(), before);
    }

    #[test]
    fn snail_block_round_trips() {
        let block = SnailBlock::new(
            SnailHeader {
                number: 2,
                difficulty: U256::from(64),
                ..SnailHeader::default()
            },
            vec![fruit(11, 1)],
            vec![],
        );

        let decoded: SnailBlock =
            rlp::decode(&rlp::encode(&block)).expect("encoding was produced by rlp_append");
        assert_eq!(decoded, block);
    }
}
