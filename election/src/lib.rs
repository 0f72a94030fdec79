//! Committee election: derives the BFT committee for each epoch from
//! snail-chain history and verifies finality witnesses against it.
//!
//! Epoch `e` covers snail heights `[e * EPOCH_LENGTH, (e + 1) * EPOCH_LENGTH)`.
//! Its committee is seeded by the hash of the snail block `ELECTION_SEED_OFFSET`
//! blocks before the epoch start and drawn from the fixed genesis seats plus
//! the miners of fruits embedded during the preceding epoch. Fruit miners
//! publish their public key in the fruit's `extra` field; a fruit without a
//! parseable key simply does not enter the candidate set.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, ensure, Result};
use itertools::Itertools as _;
use log::debug;
use parking_lot::RwLock;
use thiserror::Error;
use types::{
    params, BlockNumber, ChainConfig, CommitteeMember, EpochId, PbftSign, SnailBlock, SwitchInfo,
    VoteResult, H256,
};

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("sign by non-member at fast block {fast_number}")]
    NotAMember { fast_number: BlockNumber },
    #[error("invalid signature in finality witness")]
    InvalidSignature,
    #[error("only {got} of {quorum} required committee signs")]
    NoQuorum { got: usize, quorum: usize },
    #[error("switch info members do not match the elected committee")]
    SwitchInfoMismatch,
    #[error("switch info announces no members")]
    EmptySwitchInfo,
    #[error("snail block {number} not available for election")]
    MissingSnailBlock { number: BlockNumber },
}

/// Read-only view of the snail chain, injected by the coordinator so the
/// election never holds a back-pointer to the chain store.
pub trait SnailchainReader: Send + Sync {
    fn canonical_block(&self, number: BlockNumber) -> Option<SnailBlock>;
    fn head_number(&self) -> BlockNumber;
}

#[must_use]
pub const fn epoch_of_snail(number: BlockNumber) -> EpochId {
    number / params::EPOCH_LENGTH
}

#[must_use]
pub const fn epoch_start(epoch: EpochId) -> BlockNumber {
    epoch * params::EPOCH_LENGTH
}

/// Minimum distinct signers for finality: `⌈2N/3⌉`.
#[must_use]
pub const fn quorum(committee_size: usize) -> usize {
    (2 * committee_size).div_ceil(3)
}

pub struct Election {
    config: ChainConfig,
    genesis_committee: Vec<CommitteeMember>,
    snail: Arc<dyn SnailchainReader>,
    committees: RwLock<HashMap<EpochId, Arc<Vec<CommitteeMember>>>>,
    /// Fast heights at which a committed switch info rotated the committee,
    /// newest last. The committee for fast height `h` is the epoch of the
    /// last switch at or below `h - 1`.
    switches: RwLock<Vec<(BlockNumber, EpochId)>>,
}

impl Election {
    #[must_use]
    pub fn new(
        config: ChainConfig,
        genesis_committee: Vec<CommitteeMember>,
        snail: Arc<dyn SnailchainReader>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            genesis_committee,
            snail,
            committees: RwLock::new(HashMap::new()),
            switches: RwLock::new(vec![]),
        })
    }

    #[must_use]
    pub fn current_epoch(&self) -> EpochId {
        epoch_of_snail(self.snail.head_number())
    }

    /// Deterministic committee for an epoch. Cached; the cache is refreshed
    /// only when a new epoch is first requested.
    pub fn committee_by_epoch(&self, epoch: EpochId) -> Result<Arc<Vec<CommitteeMember>>> {
        if let Some(committee) = self.committees.read().get(&epoch) {
            return Ok(Arc::clone(committee));
        }

        let committee = Arc::new(self.elect(epoch)?);
        let _previous = self
            .committees
            .write()
            .insert(epoch, Arc::clone(&committee));
        Ok(committee)
    }

    /// Committee responsible for finalizing fast block `fast_number`.
    pub fn committee_for_fast(&self, fast_number: BlockNumber) -> Result<Arc<Vec<CommitteeMember>>> {
        let epoch = self
            .switches
            .read()
            .iter()
            .rev()
            .find(|(switch_fast, _)| *switch_fast < fast_number)
            .map_or(0, |(_, epoch)| *epoch);

        self.committee_by_epoch(epoch)
    }

    /// Records a committed switch info. Called by the coordinator for every
    /// finalized fast block that carries one. Replays of an already
    /// recorded epoch are ignored, so the sync and commit paths may both
    /// report the same block.
    pub fn record_switch(&self, fast_number: BlockNumber, info: &SwitchInfo) {
        let mut switches = self.switches.write();
        if switches
            .last()
            .is_some_and(|(_, epoch)| *epoch >= info.epoch_id)
            && info.epoch_id != 0
        {
            return;
        }
        debug!(
            "committee rotation committed (fast: {fast_number}, epoch: {})",
            info.epoch_id,
        );
        switches.push((fast_number, info.epoch_id));
    }

    /// The newest epoch a committed switch info has rotated to.
    #[must_use]
    pub fn latest_switch_epoch(&self) -> EpochId {
        self.switches
            .read()
            .last()
            .map_or(0, |(_, epoch)| *epoch)
    }

    /// Verifies an announced rotation against the locally derived committee.
    /// A rotation to an empty committee is never valid.
    pub fn verify_switch_info(&self, _fast_number: BlockNumber, info: &SwitchInfo) -> Result<()> {
        ensure!(!info.is_empty(), ElectionError::EmptySwitchInfo);

        let expected = self.committee_by_epoch(info.epoch_id)?;
        ensure!(
            *expected == info.members,
            ElectionError::SwitchInfoMismatch,
        );
        Ok(())
    }

    /// Verifies each sign in a finality witness individually. The per-sign
    /// results let callers distinguish one bad signature from a missing
    /// quorum, mirroring the shape callers actually branch on.
    pub fn verify_signs(
        &self,
        signs: &[PbftSign],
    ) -> (Vec<Option<CommitteeMember>>, Vec<Option<ElectionError>>) {
        let mut members = Vec::with_capacity(signs.len());
        let mut errors = Vec::with_capacity(signs.len());

        for sign in signs {
            match self.member_for_sign(sign) {
                Ok(member) => {
                    members.push(Some(member));
                    errors.push(None);
                }
                Err(error) => {
                    members.push(None);
                    errors.push(Some(error));
                }
            }
        }

        (members, errors)
    }

    /// Full finality check for a fast block: at least
    /// `⌈2N/3⌉` distinct committee members signed `Agree` over this hash.
    pub fn verify_finality(
        &self,
        fast_number: BlockNumber,
        fast_hash: H256,
        signs: &[PbftSign],
    ) -> Result<()> {
        let committee = self.committee_for_fast(fast_number)?;
        let quorum = quorum(committee.len());

        let agreeing = signs
            .iter()
            .filter(|sign| {
                sign.fast_number == fast_number
                    && sign.fast_hash == fast_hash
                    && sign.result == VoteResult::Agree
            })
            .filter_map(|sign| self.member_for_sign(sign).ok())
            .unique_by(|member| member.public_key.clone())
            .count();

        ensure!(
            agreeing >= quorum,
            ElectionError::NoQuorum {
                got: agreeing,
                quorum,
            },
        );
        Ok(())
    }

    fn member_for_sign(&self, sign: &PbftSign) -> Result<CommitteeMember, ElectionError> {
        let signer = sign
            .signer()
            .map_err(|_| ElectionError::InvalidSignature)?;
        let signer_bytes = signer.to_uncompressed_bytes();

        let committee = self
            .committee_for_fast(sign.fast_number)
            .map_err(|_| ElectionError::NotAMember {
                fast_number: sign.fast_number,
            })?;

        committee
            .iter()
            .find(|member| member.public_key == signer_bytes)
            .cloned()
            .ok_or(ElectionError::NotAMember {
                fast_number: sign.fast_number,
            })
    }

    fn elect(&self, epoch: EpochId) -> Result<Vec<CommitteeMember>> {
        // Singlenode networks skip election entirely: one fixed seat that
        // signs its own blocks.
        if self.config.is_singlenode() {
            let member = self
                .genesis_committee
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("singlenode genesis has no committee member"))?;
            return Ok(vec![member]);
        }

        if epoch == 0 {
            return Ok(self.genesis_committee.clone());
        }

        let seed = self.seed(epoch)?;
        let mut candidates = self.genesis_committee.clone();

        for member in self.fruit_miners(epoch - 1)? {
            if candidates
                .iter()
                .all(|existing| existing.public_key != member.public_key)
            {
                candidates.push(member);
            }
        }

        if candidates.len() > params::MAX_COMMITTEE_SIZE {
            candidates.sort_by_key(|member| {
                crypto::keccak256_concat(seed, &member.public_key)
            });
            candidates.truncate(params::MAX_COMMITTEE_SIZE);
        }

        // The fixed genesis seats guarantee the lower clamp on real
        // networks; refuse to form an undersized committee elsewhere.
        ensure!(
            candidates.len() >= params::MIN_COMMITTEE_SIZE,
            "candidate set smaller than the minimum committee size",
        );

        // Committee ordering is by validating public key.
        candidates.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(candidates)
    }

    fn seed(&self, epoch: EpochId) -> Result<H256> {
        let number = epoch_start(epoch).saturating_sub(params::ELECTION_SEED_OFFSET);
        let block = self
            .snail
            .canonical_block(number)
            .ok_or(ElectionError::MissingSnailBlock { number })?;
        Ok(block.hash())
    }

    fn fruit_miners(&self, epoch: EpochId) -> Result<Vec<CommitteeMember>> {
        let start = epoch_start(epoch);
        let end = epoch_start(epoch + 1).min(self.snail.head_number() + 1);

        let mut miners = vec![];
        for number in start..end {
            let block = self
                .snail
                .canonical_block(number)
                .ok_or(ElectionError::MissingSnailBlock { number })?;

            for fruit in block.fruits() {
                let Ok(key) = crypto::PublicKey::from_sec1_bytes(&fruit.header.extra) else {
                    continue;
                };
                miners.push(CommitteeMember::new_elected(
                    fruit.header.coinbase,
                    key.to_uncompressed_bytes().to_vec(),
                ));
            }
        }

        Ok(miners)
    }
}

#[cfg(test)]
mod tests {
    use types::{Address, Fruit, SnailHeader};

    use super::*;

    struct FakeSnail {
        blocks: Vec<SnailBlock>,
    }

    impl SnailchainReader for FakeSnail {
        fn canonical_block(&self, number: BlockNumber) -> Option<SnailBlock> {
            self.blocks.get(usize::try_from(number).ok()?).cloned()
        }

        fn head_number(&self) -> BlockNumber {
            (self.blocks.len() as BlockNumber).saturating_sub(1)
        }
    }

    fn member(seed: u8) -> (crypto::SecretKey, CommitteeMember) {
        let key = crypto::SecretKey::from_slice(&[seed; 32]).expect("constant scalar is valid");
        let member = CommitteeMember::new_fixed(
            Address::repeat_byte(seed),
            key.public_key().to_uncompressed_bytes().to_vec(),
        );
        (key, member)
    }

    fn genesis_committee() -> (Vec<crypto::SecretKey>, Vec<CommitteeMember>) {
        (1..=4).map(member).unzip()
    }

    fn election_with_blocks(blocks: Vec<SnailBlock>) -> (Vec<crypto::SecretKey>, Arc<Election>) {
        let (keys, committee) = genesis_committee();
        let election = Election::new(
            ChainConfig::testnet(),
            committee,
            Arc::new(FakeSnail { blocks }),
        );
        (keys, election)
    }

    fn empty_snail_chain(length: u64) -> Vec<SnailBlock> {
        (0..length)
            .map(|number| {
                SnailBlock::new(
                    SnailHeader {
                        number,
                        time: number * 600,
                        ..SnailHeader::default()
                    },
                    vec![],
                    vec![],
                )
            })
            .collect()
    }

    #[test]
    fn epoch_zero_committee_is_the_genesis_committee() {
        let (_, election) = election_with_blocks(empty_snail_chain(1));
        let committee = election
            .committee_by_epoch(0)
            .expect("epoch 0 needs no snail history");
        assert_eq!(committee.len(), 4);
    }

    #[test]
    fn finality_requires_two_thirds_of_the_committee() {
        let (keys, election) = election_with_blocks(empty_snail_chain(1));
        let hash = H256::repeat_byte(9);

        let signs = keys
            .iter()
            .take(2)
            .map(|key| {
                PbftSign::create(5, hash, VoteResult::Agree, key).expect("signing succeeds")
            })
            .collect_vec();

        // 2 of 4 is below the quorum of 3.
        assert!(election.verify_finality(5, hash, &signs).is_err());

        let signs = keys
            .iter()
            .take(3)
            .map(|key| {
                PbftSign::create(5, hash, VoteResult::Agree, key).expect("signing succeeds")
            })
            .collect_vec();
        election
            .verify_finality(5, hash, &signs)
            .expect("3 of 4 meets the quorum");
    }

    #[test]
    fn verify_signs_reports_members_and_errors_per_sign() {
        let (keys, election) = election_with_blocks(empty_snail_chain(1));
        let hash = H256::repeat_byte(4);

        let member_sign =
            PbftSign::create(3, hash, VoteResult::Agree, &keys[0]).expect("signing succeeds");
        let outsider = crypto::SecretKey::from_slice(&[0x99; 32])
            .expect("constant scalar is valid");
        let outsider_sign =
            PbftSign::create(3, hash, VoteResult::Agree, &outsider).expect("signing succeeds");

        let (members, errors) = election.verify_signs(&[member_sign, outsider_sign]);

        assert!(members[0].is_some());
        assert!(errors[0].is_none());
        assert!(members[1].is_none());
        assert!(matches!(
            errors[1],
            Some(ElectionError::NotAMember { fast_number: 3 }),
        ));
    }

    #[test]
    fn duplicate_signers_do_not_count_twice() {
        let (keys, election) = election_with_blocks(empty_snail_chain(1));
        let hash = H256::repeat_byte(9);

        let signs = (0..3)
            .map(|_| {
                PbftSign::create(5, hash, VoteResult::Agree, &keys[0])
                    .expect("signing succeeds")
            })
            .collect_vec();

        assert!(election.verify_finality(5, hash, &signs).is_err());
    }

    #[test]
    fn fruit_miners_join_the_next_committee() {
        let (miner_key, _) = member(9);
        let mut blocks = empty_snail_chain(params::EPOCH_LENGTH + 1);

        // Embed a fruit mined by a new key somewhere in epoch 0.
        blocks[3] = SnailBlock::new(
            blocks[3].header().clone(),
            vec![Fruit {
                header: SnailHeader {
                    coinbase: Address::repeat_byte(9),
                    extra: miner_key.public_key().to_uncompressed_bytes().to_vec(),
                    ..SnailHeader::default()
                },
            }],
            vec![],
        );

        let (_, election) = election_with_blocks(blocks);
        let committee = election
            .committee_by_epoch(1)
            .expect("epoch 1 history is available");

        assert_eq!(committee.len(), 5);
        assert!(committee.iter().any(|member| {
            member.public_key == miner_key.public_key().to_uncompressed_bytes().to_vec()
        }));
    }

    #[test]
    fn singlenode_committee_is_one_auto_signing_seat() {
        let (_, committee) = member(1);
        let election = Election::new(
            ChainConfig::singlenode(),
            vec![committee],
            Arc::new(FakeSnail {
                blocks: empty_snail_chain(1),
            }),
        );

        let elected = election
            .committee_by_epoch(7)
            .expect("singlenode bypasses election");
        assert_eq!(elected.len(), 1);
        assert_eq!(quorum(elected.len()), 1);
    }

    #[test]
    fn empty_switch_info_is_rejected() {
        let (_, election) = election_with_blocks(empty_snail_chain(1));
        let info = SwitchInfo {
            epoch_id: 0,
            members: vec![],
        };

        let error = election
            .verify_switch_info(10, &info)
            .expect_err("an empty rotation is never valid");
        assert!(matches!(
            error.downcast_ref::<ElectionError>(),
            Some(ElectionError::EmptySwitchInfo),
        ));
    }

    #[test]
    fn switch_points_route_fast_heights_to_epochs() {
        let (_, election) = election_with_blocks(empty_snail_chain(1));
        election.record_switch(
            100,
            &SwitchInfo {
                epoch_id: 0,
                members: vec![],
            },
        );

        // Before the switch takes effect the genesis epoch applies.
        let committee = election
            .committee_for_fast(100)
            .expect("epoch 0 is always available");
        assert_eq!(committee.len(), 4);
    }
}
