use rlp::{DecoderError, Rlp, RlpStream};
use types::{BlockNumber, FastBlock, PbftSign, VoteResult, H256};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VoteKind {
    Prevote = 1,
    Precommit = 2,
}

/// A leader's block proposal for `(height, round)`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Proposal {
    pub height: BlockNumber,
    pub round: u64,
    pub block: FastBlock,
    pub signature: crypto::Signature,
}

impl Proposal {
    pub fn create(
        height: BlockNumber,
        round: u64,
        block: FastBlock,
        key: &crypto::SecretKey,
    ) -> Result<Self, crypto::Error> {
        let signature = key.sign(proposal_digest(height, round, block.hash()))?;
        Ok(Self {
            height,
            round,
            block,
            signature,
        })
    }

    pub fn signer(&self) -> Result<crypto::PublicKey, crypto::Error> {
        crypto::recover(
            proposal_digest(self.height, self.round, self.block.hash()),
            self.signature,
        )
    }
}

/// One validator's vote for `(height, round)`. `block_hash` of `None` is a
/// nil vote. A non-nil precommit carries the [`PbftSign`] that will become
/// part of the block's finality witness on commit.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Vote {
    pub height: BlockNumber,
    pub round: u64,
    pub kind: VoteKind,
    pub block_hash: Option<H256>,
    pub signature: crypto::Signature,
    pub pbft_sign: Option<PbftSign>,
}

impl Vote {
    pub fn create(
        height: BlockNumber,
        round: u64,
        kind: VoteKind,
        block_hash: Option<H256>,
        key: &crypto::SecretKey,
    ) -> Result<Self, crypto::Error> {
        let signature = key.sign(vote_digest(height, round, kind, block_hash))?;

        let pbft_sign = match (kind, block_hash) {
            (VoteKind::Precommit, Some(hash)) => {
                Some(PbftSign::create(height, hash, VoteResult::Agree, key)?)
            }
            _ => None,
        };

        Ok(Self {
            height,
            round,
            kind,
            block_hash,
            signature,
            pbft_sign,
        })
    }

    pub fn signer(&self) -> Result<crypto::PublicKey, crypto::Error> {
        crypto::recover(
            vote_digest(self.height, self.round, self.kind, self.block_hash),
            self.signature,
        )
    }

    /// A vote is internally consistent when its embedded finality sign, if
    /// any, covers the same block by the same signer.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match (&self.pbft_sign, self.kind, self.block_hash) {
            (Some(sign), VoteKind::Precommit, Some(hash)) => {
                sign.fast_number == self.height
                    && sign.fast_hash == hash
                    && sign.result == VoteResult::Agree
                    && match (sign.signer(), self.signer()) {
                        (Ok(sign_signer), Ok(vote_signer)) => sign_signer == vote_signer,
                        _ => false,
                    }
            }
            (None, VoteKind::Precommit, Some(_)) => false,
            (None, _, _) => true,
            (Some(_), _, _) => false,
        }
    }
}

fn proposal_digest(height: BlockNumber, round: u64, block_hash: H256) -> H256 {
    let mut stream = RlpStream::new_list(4);
    stream.append(&b"proposal".to_vec());
    stream.append(&height);
    stream.append(&round);
    stream.append(&block_hash);
    crypto::keccak256(stream.out())
}

fn vote_digest(
    height: BlockNumber,
    round: u64,
    kind: VoteKind,
    block_hash: Option<H256>,
) -> H256 {
    let mut stream = RlpStream::new_list(5);
    stream.append(&height);
    stream.append(&round);
    stream.append(&(kind as u8));
    stream.append(&block_hash.unwrap_or_default());
    stream.append(&u8::from(block_hash.is_some()));
    crypto::keccak256(stream.out())
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ConsensusMessage {
    Proposal(Box<Proposal>),
    Vote(Box<Vote>),
}

impl rlp::Encodable for ConsensusMessage {
    fn rlp_append(&self, stream: &mut RlpStream) {
        match self {
            Self::Proposal(proposal) => {
                stream.begin_list(5);
                stream.append(&0_u8);
                stream.append(&proposal.height);
                stream.append(&proposal.round);
                stream.append(&proposal.block);
                stream.append(&proposal.signature.to_bytes().to_vec());
            }
            Self::Vote(vote) => {
                stream.begin_list(8);
                stream.append(&1_u8);
                stream.append(&vote.height);
                stream.append(&vote.round);
                stream.append(&(vote.kind as u8));
                stream.append(&vote.block_hash.unwrap_or_default());
                stream.append(&u8::from(vote.block_hash.is_some()));
                stream.append(&vote.signature.to_bytes().to_vec());
                match &vote.pbft_sign {
                    Some(sign) => stream.append_list(core::slice::from_ref(sign)),
                    None => stream.begin_list(0),
                };
            }
        }
    }
}

impl rlp::Decodable for ConsensusMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let decode_signature = |field: Vec<u8>| {
            let bytes: [u8; 65] = field
                .try_into()
                .map_err(|_| DecoderError::Custom("signature must be 65 bytes"))?;
            crypto::Signature::from_bytes(&bytes)
                .map_err(|_| DecoderError::Custom("malformed signature"))
        };

        match rlp.val_at::<u8>(0)? {
            0 => Ok(Self::Proposal(Box::new(Proposal {
                height: rlp.val_at(1)?,
                round: rlp.val_at(2)?,
                block: rlp.val_at(3)?,
                signature: decode_signature(rlp.val_at(4)?)?,
            }))),
            1 => {
                let kind = match rlp.val_at::<u8>(3)? {
                    1 => VoteKind::Prevote,
                    2 => VoteKind::Precommit,
                    _ => return Err(DecoderError::Custom("unknown vote kind")),
                };
                let hash: H256 = rlp.val_at(4)?;
                let block_hash = (rlp.val_at::<u8>(5)? == 1).then_some(hash);
                let mut signs: Vec<PbftSign> = rlp.list_at(7)?;
                if signs.len() > 1 {
                    return Err(DecoderError::Custom("at most one sign per vote"));
                }

                Ok(Self::Vote(Box::new(Vote {
                    height: rlp.val_at(1)?,
                    round: rlp.val_at(2)?,
                    kind,
                    block_hash,
                    signature: decode_signature(rlp.val_at(6)?)?,
                    pbft_sign: signs.pop(),
                })))
            }
            _ => Err(DecoderError::Custom("unknown consensus message")),
        }
    }
}

#[cfg(test)]
mod tests {
    use types::{FastBody, FastHeader};

    use super::*;

    fn key() -> crypto::SecretKey {
        crypto::SecretKey::from_slice(&[0x61; 32]).expect("constant scalar is valid")
    }

    #[test]
    fn vote_round_trips_and_recovers_signer() {
        let vote = Vote::create(7, 1, VoteKind::Precommit, Some(H256::repeat_byte(3)), &key())
            .expect("signing succeeds");
        assert!(vote.is_consistent());

        let message = ConsensusMessage::Vote(Box::new(vote.clone()));
        let decoded: ConsensusMessage =
            rlp::decode(&rlp::encode(&message)).expect("encoding was produced by rlp_append");

        assert_eq!(decoded, message);
        let ConsensusMessage::Vote(decoded_vote) = decoded else {
            panic!("decoded to the wrong variant");
        };
        assert_eq!(
            decoded_vote.signer().expect("signature is valid"),
            key().public_key(),
        );
    }

    #[test]
    fn nil_vote_is_distinct_from_zero_hash_vote() {
        let nil = Vote::create(7, 1, VoteKind::Prevote, None, &key())
            .expect("signing succeeds");
        let zero = Vote::create(7, 1, VoteKind::Prevote, Some(H256::zero()), &key())
            .expect("signing succeeds");

        assert_ne!(nil.signature, zero.signature);
    }

    #[test]
    fn proposal_round_trips() {
        let block = FastBlock::new(
            FastHeader {
                number: 7,
                ..FastHeader::default()
            },
            FastBody::default(),
        );
        let proposal = Proposal::create(7, 0, block, &key()).expect("signing succeeds");

        let message = ConsensusMessage::Proposal(Box::new(proposal));
        let decoded: ConsensusMessage =
            rlp::decode(&rlp::encode(&message)).expect("encoding was produced by rlp_append");
        assert_eq!(decoded, message);
    }

    #[test]
    fn precommit_without_embedded_sign_is_inconsistent() {
        let mut vote =
            Vote::create(7, 1, VoteKind::Precommit, Some(H256::repeat_byte(3)), &key())
                .expect("signing succeeds");
        vote.pbft_sign = None;
        assert!(!vote.is_consistent());
    }
}
