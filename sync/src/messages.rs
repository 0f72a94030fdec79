use rlp::{DecoderError, Rlp, RlpStream};
use tbft::ConsensusMessage;
use types::{
    BlockNumber, FastBlock, FastBody, FastHeader, Fruit, NetworkId, Receipt, SnailBlock,
    SnailHeader, Transaction, H256, U256,
};

pub const PROTOCOL_VERSION: u32 = 63;

/// Handshake announcement exchanged on connect.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: NetworkId,
    pub fast_height: BlockNumber,
    pub fast_genesis_hash: H256,
    pub snail_total_difficulty: U256,
    pub snail_head_hash: H256,
    pub snail_genesis_hash: H256,
}

/// Range request for headers on either chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeaderQuery {
    pub request_id: u64,
    pub from: BlockNumber,
    pub amount: u64,
    /// Step between returned headers; 0 is contiguous. Skeleton requests
    /// use a large skip to pin down the chain shape cheaply.
    pub skip: u64,
    pub reverse: bool,
}

/// Wire protocol, one variant per message code.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Status(Status),
    NewFastBlockHashes(Vec<(H256, BlockNumber)>),
    NewFastBlock(Box<FastBlock>),
    Transactions(Vec<Transaction>),
    GetFastBlockHeaders(HeaderQuery),
    FastBlockHeaders(u64, Vec<FastHeader>),
    GetFastBlockBodies(u64, Vec<H256>),
    FastBlockBodies(u64, Vec<FastBody>),
    NewSnailBlockHashes(Vec<(H256, BlockNumber)>),
    NewSnailBlock(Box<SnailBlock>),
    GetSnailBlockHeaders(HeaderQuery),
    SnailBlockHeaders(u64, Vec<SnailHeader>),
    GetSnailBlockBodies(u64, Vec<H256>),
    SnailBlockBodies(u64, Vec<SnailBlock>),
    NewFruit(Vec<Fruit>),
    NodeData(u64, Vec<Vec<u8>>),
    Receipts(u64, Vec<Vec<Receipt>>),
    TbftNodeInfo(Box<ConsensusMessage>),
    TbftNodeInfoHash(H256),
    GetTbftNodeInfo(H256),
}

impl Message {
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Status(_) => 0x01,
            Self::NewFastBlockHashes(_) => 0x02,
            Self::NewFastBlock(_) => 0x03,
            Self::Transactions(_) => 0x04,
            Self::GetFastBlockHeaders(_) => 0x05,
            Self::FastBlockHeaders(..) => 0x06,
            Self::GetFastBlockBodies(..) => 0x07,
            Self::FastBlockBodies(..) => 0x08,
            Self::NewSnailBlockHashes(_) => 0x09,
            Self::NewSnailBlock(_) => 0x0a,
            Self::GetSnailBlockHeaders(_) => 0x0b,
            Self::SnailBlockHeaders(..) => 0x0c,
            Self::GetSnailBlockBodies(..) => 0x0d,
            Self::SnailBlockBodies(..) => 0x0e,
            Self::NewFruit(_) => 0x0f,
            Self::NodeData(..) => 0x10,
            Self::Receipts(..) => 0x11,
            Self::TbftNodeInfo(_) => 0x12,
            Self::TbftNodeInfoHash(_) => 0x13,
            Self::GetTbftNodeInfo(_) => 0x14,
        }
    }

    /// Canonical frame: the code byte followed by the RLP payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.code()];
        frame.extend_from_slice(&self.payload());
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecoderError> {
        let (code, payload) = frame
            .split_first()
            .ok_or(DecoderError::Custom("empty frame"))?;
        Self::decode_payload(*code, payload)
    }

    fn payload(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        match self {
            Self::Status(status) => {
                stream.begin_list(7);
                stream.append(&status.protocol_version);
                stream.append(&status.network_id);
                stream.append(&status.fast_height);
                stream.append(&status.fast_genesis_hash);
                stream.append(&status.snail_total_difficulty);
                stream.append(&status.snail_head_hash);
                stream.append(&status.snail_genesis_hash);
            }
            Self::NewFastBlockHashes(hashes) | Self::NewSnailBlockHashes(hashes) => {
                stream.begin_list(hashes.len());
                for (hash, number) in hashes {
                    stream.begin_list(2);
                    stream.append(hash);
                    stream.append(number);
                }
            }
            Self::NewFastBlock(block) => {
                stream.append(block.as_ref());
            }
            Self::NewSnailBlock(block) => {
                stream.append(block.as_ref());
            }
            Self::Transactions(transactions) => {
                stream.append_list(transactions);
            }
            Self::GetFastBlockHeaders(query) | Self::GetSnailBlockHeaders(query) => {
                stream.begin_list(5);
                stream.append(&query.request_id);
                stream.append(&query.from);
                stream.append(&query.amount);
                stream.append(&query.skip);
                stream.append(&u8::from(query.reverse));
            }
            Self::FastBlockHeaders(request_id, headers) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.append_list(headers);
            }
            Self::SnailBlockHeaders(request_id, headers) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.append_list(headers);
            }
            Self::GetFastBlockBodies(request_id, hashes)
            | Self::GetSnailBlockBodies(request_id, hashes) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.append_list(hashes);
            }
            Self::FastBlockBodies(request_id, bodies) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.append_list(bodies);
            }
            Self::SnailBlockBodies(request_id, blocks) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.append_list(blocks);
            }
            Self::NewFruit(fruits) => {
                stream.append_list(fruits);
            }
            Self::NodeData(request_id, items) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.begin_list(items.len());
                for item in items {
                    stream.append(item);
                }
            }
            Self::Receipts(request_id, receipt_lists) => {
                stream.begin_list(2);
                stream.append(request_id);
                stream.begin_list(receipt_lists.len());
                for receipts in receipt_lists {
                    stream.append_list(receipts);
                }
            }
            Self::TbftNodeInfo(message) => {
                stream.append(message.as_ref());
            }
            Self::TbftNodeInfoHash(hash) | Self::GetTbftNodeInfo(hash) => {
                stream.append(hash);
            }
        }
        stream.out().to_vec()
    }

    fn decode_payload(code: u8, payload: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(payload);

        let decode_hashes = |rlp: &Rlp| {
            rlp.iter()
                .map(|entry| Ok((entry.val_at(0)?, entry.val_at(1)?)))
                .collect::<Result<Vec<_>, DecoderError>>()
        };
        let decode_query = |rlp: &Rlp| {
            Ok::<_, DecoderError>(HeaderQuery {
                request_id: rlp.val_at(0)?,
                from: rlp.val_at(1)?,
                amount: rlp.val_at(2)?,
                skip: rlp.val_at(3)?,
                reverse: rlp.val_at::<u8>(4)? == 1,
            })
        };

        match code {
            0x01 => Ok(Self::Status(Status {
                protocol_version: rlp.val_at(0)?,
                network_id: rlp.val_at(1)?,
                fast_height: rlp.val_at(2)?,
                fast_genesis_hash: rlp.val_at(3)?,
                snail_total_difficulty: rlp.val_at(4)?,
                snail_head_hash: rlp.val_at(5)?,
                snail_genesis_hash: rlp.val_at(6)?,
            })),
            0x02 => Ok(Self::NewFastBlockHashes(decode_hashes(&rlp)?)),
            0x03 => Ok(Self::NewFastBlock(Box::new(rlp.as_val()?))),
            0x04 => Ok(Self::Transactions(rlp.as_list()?)),
            0x05 => Ok(Self::GetFastBlockHeaders(decode_query(&rlp)?)),
            0x06 => Ok(Self::FastBlockHeaders(rlp.val_at(0)?, rlp.list_at(1)?)),
            0x07 => Ok(Self::GetFastBlockBodies(rlp.val_at(0)?, rlp.list_at(1)?)),
            0x08 => Ok(Self::FastBlockBodies(rlp.val_at(0)?, rlp.list_at(1)?)),
            0x09 => Ok(Self::NewSnailBlockHashes(decode_hashes(&rlp)?)),
            0x0a => Ok(Self::NewSnailBlock(Box::new(rlp.as_val()?))),
            0x0b => Ok(Self::GetSnailBlockHeaders(decode_query(&rlp)?)),
            0x0c => Ok(Self::SnailBlockHeaders(rlp.val_at(0)?, rlp.list_at(1)?)),
            0x0d => Ok(Self::GetSnailBlockBodies(rlp.val_at(0)?, rlp.list_at(1)?)),
            0x0e => Ok(Self::SnailBlockBodies(rlp.val_at(0)?, rlp.list_at(1)?)),
            0x0f => Ok(Self::NewFruit(rlp.as_list()?)),
            0x10 => {
                let items = rlp
                    .at(1)?
                    .iter()
                    .map(|entry| entry.as_val())
                    .collect::<Result<Vec<Vec<u8>>, _>>()?;
                Ok(Self::NodeData(rlp.val_at(0)?, items))
            }
            0x11 => {
                let receipt_lists = rlp
                    .at(1)?
                    .iter()
                    .map(|entry| entry.as_list())
                    .collect::<Result<Vec<Vec<Receipt>>, _>>()?;
                Ok(Self::Receipts(rlp.val_at(0)?, receipt_lists))
            }
            0x12 => Ok(Self::TbftNodeInfo(Box::new(rlp.as_val()?))),
            0x13 => Ok(Self::TbftNodeInfoHash(rlp.as_val()?)),
            0x14 => Ok(Self::GetTbftNodeInfo(rlp.as_val()?)),
            _ => Err(DecoderError::Custom("unknown message code")),
        }
    }
}
