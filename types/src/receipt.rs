use rlp::{DecoderError, Rlp, RlpStream};

use crate::primitives::{Address, Gas, H256};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReceiptStatus {
    Failed = 0,
    Success = 1,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

impl rlp::Encodable for Log {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(3);
        stream.append(&self.address);
        stream.append_list(&self.topics);
        stream.append(&self.data);
    }
}

impl rlp::Decodable for Log {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            address: rlp.val_at(0)?,
            topics: rlp.list_at(1)?,
            data: rlp.val_at(2)?,
        })
    }
}

/// Execution outcome of one transaction inside a fast block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Receipt {
    pub transaction_hash: H256,
    pub status: ReceiptStatus,
    pub gas_used: Gas,
    pub cumulative_gas_used: Gas,
    pub logs: Vec<Log>,
}

impl rlp::Encodable for Receipt {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(5);
        stream.append(&self.transaction_hash);
        stream.append(&(self.status as u8));
        stream.append(&self.gas_used);
        stream.append(&self.cumulative_gas_used);
        stream.append_list(&self.logs);
    }
}

impl rlp::Decodable for Receipt {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let status = match rlp.val_at::<u8>(1)? {
            0 => ReceiptStatus::Failed,
            1 => ReceiptStatus::Success,
            _ => return Err(DecoderError::Custom("unknown receipt status")),
        };

        Ok(Self {
            transaction_hash: rlp.val_at(0)?,
            status,
            gas_used: rlp.val_at(2)?,
            cumulative_gas_used: rlp.val_at(3)?,
            logs: rlp.list_at(4)?,
        })
    }
}
