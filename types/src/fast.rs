use once_cell::sync::OnceCell;
use rlp::{DecoderError, Rlp, RlpStream};

use crate::{
    committee::{PbftSign, SwitchInfo},
    primitives::{ordered_root, BlockNumber, Gas, H256},
    transaction::Transaction,
};

/// Header of a BFT-finalized fast block.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FastHeader {
    pub parent_hash: H256,
    pub number: BlockNumber,
    pub time: u64,
    /// State commitment after executing this block.
    pub root: H256,
    pub txs_root: H256,
    pub receipts_root: H256,
    pub gas_limit: Gas,
    pub gas_used: Gas,
    pub extra: Vec<u8>,
}

impl FastHeader {
    #[must_use]
    pub fn hash(&self) -> H256 {
        crypto::keccak256(rlp::encode(self))
    }
}

impl rlp::Encodable for FastHeader {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(9);
        stream.append(&self.parent_hash);
        stream.append(&self.number);
        stream.append(&self.time);
        stream.append(&self.root);
        stream.append(&self.txs_root);
        stream.append(&self.receipts_root);
        stream.append(&self.gas_limit);
        stream.append(&self.gas_used);
        stream.append(&self.extra);
    }
}

impl rlp::Decodable for FastHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            number: rlp.val_at(1)?,
            time: rlp.val_at(2)?,
            root: rlp.val_at(3)?,
            txs_root: rlp.val_at(4)?,
            receipts_root: rlp.val_at(5)?,
            gas_limit: rlp.val_at(6)?,
            gas_used: rlp.val_at(7)?,
            extra: rlp.val_at(8)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FastBody {
    pub transactions: Vec<Transaction>,
    /// Finality witness: present on committed blocks, empty on proposals.
    pub signs: Vec<PbftSign>,
    /// Committee rotation ratified by this block, if it closes an epoch.
    pub switch_info: Option<SwitchInfo>,
}

impl rlp::Encodable for FastBody {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(3);
        stream.append_list(&self.transactions);
        stream.append_list(&self.signs);
        match &self.switch_info {
            Some(info) => stream.append_list(core::slice::from_ref(info)),
            None => stream.begin_list(0),
        };
    }
}

impl rlp::Decodable for FastBody {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let mut switches: Vec<SwitchInfo> = rlp.list_at(2)?;
        if switches.len() > 1 {
            return Err(DecoderError::Custom("at most one switch info per block"));
        }

        Ok(Self {
            transactions: rlp.list_at(0)?,
            signs: rlp.list_at(1)?,
            switch_info: switches.pop(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct FastBlock {
    header: FastHeader,
    body: FastBody,
    hash: OnceCell<H256>,
}

impl PartialEq for FastBlock {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body
    }
}

impl Eq for FastBlock {}

impl FastBlock {
    #[must_use]
    pub fn new(header: FastHeader, body: FastBody) -> Self {
        Self {
            header,
            body,
            hash: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &FastHeader {
        &self.header
    }

    #[must_use]
    pub fn body(&self) -> &FastBody {
        &self.body
    }

    #[must_use]
    pub fn transactions(&self) -> &[Transaction] {
        &self.body.transactions
    }

    #[must_use]
    pub fn signs(&self) -> &[PbftSign] {
        &self.body.signs
    }

    #[must_use]
    pub fn switch_info(&self) -> Option<&SwitchInfo> {
        self.body.switch_info.as_ref()
    }

    #[must_use]
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    #[must_use]
    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    /// Header hash. The finality witness is not part of the identity, so a
    /// proposal and its committed form hash the same.
    #[must_use]
    pub fn hash(&self) -> H256 {
        *self.hash.get_or_init(|| self.header.hash())
    }

    /// Returns the same block with the finality witness attached.
    #[must_use]
    pub fn with_signs(mut self, signs: Vec<PbftSign>) -> Self {
        self.body.signs = signs;
        self
    }

    #[must_use]
    pub fn transactions_root(transactions: &[Transaction]) -> H256 {
        ordered_root(transactions.iter().cloned())
    }
}

impl rlp::Encodable for FastBlock {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(2);
        stream.append(&self.header);
        stream.append(&self.body);
    }
}

impl rlp::Decodable for FastBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self::new(rlp.val_at(0)?, rlp.val_at(1)?))
    }
}

#[cfg(test)]
mod tests {
    use crate::committee::VoteResult;

    use super::*;

    #[test]
    fn block_hash_ignores_finality_witness() {
        let header = FastHeader {
            number: 5,
            ..FastHeader::default()
        };
        let block = FastBlock::new(header, FastBody::default());
        let unsigned_hash = block.hash();

        let key = crypto::SecretKey::from_slice(&[5; 32]).expect("constant scalar is valid");
        let sign = PbftSign::create(5, unsigned_hash, VoteResult::Agree, &key)
            .expect("signing succeeds");
        let committed = block.with_signs(vec![sign]);

        assert_eq!(committed.hash(), unsigned_hash);
    }

    #[test]
    fn block_round_trips_with_switch_info() {
        let body = FastBody {
            transactions: vec![],
            signs: vec![],
            switch_info: Some(SwitchInfo {
                epoch_id: 2,
                members: vec![],
            }),
        };
        let block = FastBlock::new(FastHeader::default(), body);

        let decoded: FastBlock =
            rlp::decode(&rlp::encode(&block)).expect("encoding was produced by rlp_append");
        assert_eq!(decoded, block);
        assert_eq!(decoded.switch_info().map(|info| info.epoch_id), Some(2));
    }
}
