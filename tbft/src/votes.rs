use std::collections::HashMap;

use types::{CommitteeMember, PbftSign, H256};

use crate::{
    evidence::{DoubleSignEvidence, EvidencePool},
    messages::{Vote, VoteKind},
};

/// Minimum distinct voters for a two-thirds decision: `⌈2N/3⌉`.
#[must_use]
pub const fn quorum(committee_size: usize) -> usize {
    (2 * committee_size).div_ceil(3)
}

/// Votes of one kind for one `(height, round)`, keyed by signer.
///
/// Duplicates are dropped; a second vote by the same signer for a
/// *different* value is double-signing and goes to the evidence pool.
#[derive(Default)]
pub struct VoteSet {
    votes: HashMap<Vec<u8>, Vote>,
}

impl VoteSet {
    /// Returns whether the vote was newly added.
    pub fn add(
        &mut self,
        signer_key: Vec<u8>,
        vote: Vote,
        evidence: &EvidencePool,
    ) -> bool {
        match self.votes.get(&signer_key) {
            None => {
                let _previous = self.votes.insert(signer_key, vote);
                true
            }
            Some(existing) if existing.block_hash == vote.block_hash => false,
            Some(existing) => {
                evidence.record(DoubleSignEvidence {
                    first: existing.clone(),
                    second: vote,
                });
                false
            }
        }
    }

    #[must_use]
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// The value with a two-thirds majority, if any. `Some(None)` is a
    /// two-thirds majority for nil.
    #[must_use]
    pub fn two_thirds_value(&self, committee_size: usize) -> Option<Option<H256>> {
        let mut counts: HashMap<Option<H256>, usize> = HashMap::new();
        for vote in self.votes.values() {
            *counts.entry(vote.block_hash).or_insert(0) += 1;
        }

        counts
            .into_iter()
            .find(|(_, count)| *count >= quorum(committee_size))
            .map(|(value, _)| value)
    }

    /// Whether two thirds of the committee have voted at all, majority or
    /// not. Once this holds for a split set the engine stops waiting out
    /// the rest of the round timeout.
    #[must_use]
    pub fn has_two_thirds_any(&self, committee_size: usize) -> bool {
        self.vote_count() >= quorum(committee_size)
    }

    /// Finality witness assembled from non-nil precommits for `block_hash`.
    #[must_use]
    pub fn signs_for(&self, block_hash: H256) -> Vec<PbftSign> {
        self.votes
            .values()
            .filter(|vote| vote.block_hash == Some(block_hash))
            .filter_map(|vote| vote.pbft_sign.clone())
            .collect()
    }
}

/// All vote sets of one height, indexed by `(round, kind)`.
#[derive(Default)]
pub struct HeightVotes {
    sets: HashMap<(u64, VoteKind), VoteSet>,
}

impl HeightVotes {
    pub fn set_mut(&mut self, round: u64, kind: VoteKind) -> &mut VoteSet {
        self.sets.entry((round, kind)).or_default()
    }

    #[must_use]
    pub fn set(&self, round: u64, kind: VoteKind) -> Option<&VoteSet> {
        self.sets.get(&(round, kind))
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    /// Two-thirds prevote evidence for a specific value in any round newer
    /// than `after_round`. This is what releases a validator's lock.
    #[must_use]
    pub fn newer_prevote_majority(
        &self,
        after_round: u64,
        committee_size: usize,
    ) -> Option<(u64, H256)> {
        self.sets
            .iter()
            .filter(|((round, kind), _)| *kind == VoteKind::Prevote && *round > after_round)
            .filter_map(|((round, _), set)| {
                set.two_thirds_value(committee_size)
                    .flatten()
                    .map(|hash| (*round, hash))
            })
            .max_by_key(|(round, _)| *round)
    }
}

/// Committee lookup helpers shared by the engine.
#[must_use]
pub fn member_index(committee: &[CommitteeMember], public_key: &[u8]) -> Option<usize> {
    committee
        .iter()
        .position(|member| member.public_key == public_key)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn key(seed: u8) -> crypto::SecretKey {
        crypto::SecretKey::from_slice(&[seed; 32]).expect("constant scalar is valid")
    }

    fn vote(seed: u8, block_hash: Option<H256>) -> (Vec<u8>, Vote) {
        let key = key(seed);
        let vote = Vote::create(5, 0, VoteKind::Prevote, block_hash, &key)
            .expect("signing succeeds");
        (key.public_key().to_uncompressed_bytes().to_vec(), vote)
    }

    #[test_case(1, 1)]
    #[test_case(3, 2)]
    #[test_case(4, 3)]
    #[test_case(7, 5)]
    fn quorum_is_two_thirds_rounded_up(committee_size: usize, expected: usize) {
        assert_eq!(quorum(committee_size), expected);
    }

    #[test]
    fn majority_requires_quorum_for_one_value() {
        let evidence = EvidencePool::default();
        let mut set = VoteSet::default();
        let hash = H256::repeat_byte(1);

        for seed in 1..=2 {
            let (signer, vote) = vote(seed, Some(hash));
            assert!(set.add(signer, vote, &evidence));
        }
        assert_eq!(set.two_thirds_value(4), None);

        let (signer, third) = vote(3, Some(hash));
        assert!(set.add(signer, third, &evidence));
        assert_eq!(set.two_thirds_value(4), Some(Some(hash)));
    }

    #[test]
    fn duplicate_vote_is_dropped_silently() {
        let evidence = EvidencePool::default();
        let mut set = VoteSet::default();
        let (signer, ballot) = vote(1, Some(H256::repeat_byte(1)));

        assert!(set.add(signer.clone(), ballot.clone(), &evidence));
        assert!(!set.add(signer, ballot, &evidence));
        assert_eq!(set.vote_count(), 1);
        assert!(evidence.all().is_empty());
    }

    #[test]
    fn conflicting_vote_becomes_evidence() {
        let evidence = EvidencePool::default();
        let mut set = VoteSet::default();

        let (signer, first) = vote(1, Some(H256::repeat_byte(1)));
        let (_, second) = vote(1, Some(H256::repeat_byte(2)));

        assert!(set.add(signer.clone(), first, &evidence));
        assert!(!set.add(signer, second, &evidence));

        let collected = evidence.all();
        assert_eq!(collected.len(), 1);
        assert_ne!(
            collected[0].first.block_hash,
            collected[0].second.block_hash,
        );
    }

    #[test]
    fn split_votes_reach_two_thirds_any_without_a_majority() {
        let evidence = EvidencePool::default();
        let mut set = VoteSet::default();

        let (signer, ballot) = vote(1, Some(H256::repeat_byte(1)));
        assert!(set.add(signer, ballot, &evidence));
        for seed in 2..=3 {
            let (signer, ballot) = vote(seed, None);
            assert!(set.add(signer, ballot, &evidence));
        }

        assert!(set.has_two_thirds_any(4));
        assert_eq!(set.two_thirds_value(4), None);
    }

    #[test]
    fn nil_majority_is_reported_as_nil() {
        let evidence = EvidencePool::default();
        let mut set = VoteSet::default();

        for seed in 1..=3 {
            let (signer, ballot) = vote(seed, None);
            let _ = set.add(signer, ballot, &evidence);
        }

        assert_eq!(set.two_thirds_value(4), Some(None));
    }

    #[test]
    fn newer_prevote_majority_releases_locks() {
        let evidence = EvidencePool::default();
        let mut votes = HeightVotes::default();
        let hash = H256::repeat_byte(7);

        for seed in 1..=3 {
            let key = key(seed);
            let ballot = Vote::create(5, 2, VoteKind::Prevote, Some(hash), &key)
                .expect("signing succeeds");
            let _ = votes.set_mut(2, VoteKind::Prevote).add(
                key.public_key().to_uncompressed_bytes().to_vec(),
                ballot,
                &evidence,
            );
        }

        assert_eq!(votes.newer_prevote_majority(0, 4), Some((2, hash)));
        assert_eq!(votes.newer_prevote_majority(2, 4), None);
    }
}
