use std::{collections::HashSet, sync::Arc};

use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    StreamExt as _,
};
use log::{debug, info, warn};
use tokio::{
    sync::watch,
    time::{sleep_until, Duration, Instant},
};
use types::{BlockNumber, CommitteeMember, FastBlock, PbftSign, H256};

use crate::{
    evidence::EvidencePool,
    messages::{ConsensusMessage, Proposal, Vote, VoteKind},
    votes::{member_index, quorum, HeightVotes},
};

#[derive(Clone, Copy, Debug)]
pub struct TbftConfig {
    pub propose_timeout: Duration,
    pub prevote_timeout: Duration,
    pub precommit_timeout: Duration,
    /// Pause between committing a block and starting the next height.
    pub commit_timeout: Duration,
}

impl Default for TbftConfig {
    fn default() -> Self {
        Self {
            propose_timeout: Duration::from_secs(3),
            prevote_timeout: Duration::from_secs(1),
            precommit_timeout: Duration::from_secs(1),
            commit_timeout: Duration::from_millis(100),
        }
    }
}

/// Supplies the committee for a fast height. Backed by the election bridge.
pub trait CommitteeSource: Send + Sync {
    fn committee_for_height(&self, height: BlockNumber) -> anyhow::Result<Vec<CommitteeMember>>;
}

/// Builds proposals and reports the finalized head. Backed by the
/// transaction pool and fast chain through the coordinator.
pub trait ProposalAgent: Send + Sync {
    fn head_number(&self) -> BlockNumber;
    fn propose_block(&self, height: BlockNumber) -> anyhow::Result<FastBlock>;
}

/// Receives committed blocks. Backed by the fast chain.
pub trait CommitSink: Send + Sync {
    fn commit(&self, block: FastBlock, signs: Vec<PbftSign>) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Step {
    Propose,
    Prevote,
    Precommit,
    Commit,
}

/// Deterministic leader for `(height, round)` over a committee ordered by
/// public key.
#[must_use]
pub fn leader_index(height: BlockNumber, round: u64, committee_size: usize) -> usize {
    let mut stream = rlp::RlpStream::new_list(2);
    stream.append(&height);
    stream.append(&round);
    let hash = crypto::keccak256(stream.out());

    let mut word = [0; 8];
    word.copy_from_slice(&hash.as_bytes()[..8]);
    usize::try_from(u64::from_be_bytes(word) % committee_size as u64)
        .expect("index is below committee size")
}

pub struct Engine {
    config: TbftConfig,
    key: crypto::SecretKey,
    committees: Arc<dyn CommitteeSource>,
    agent: Arc<dyn ProposalAgent>,
    sink: Arc<dyn CommitSink>,
    outbound: UnboundedSender<ConsensusMessage>,
    inbound: UnboundedReceiver<ConsensusMessage>,
    evidence: EvidencePool,

    height: BlockNumber,
    round: u64,
    step: Step,
    deadline: Instant,
    committee: Vec<CommitteeMember>,
    proposal: Option<FastBlock>,
    locked: Option<(u64, FastBlock)>,
    votes: HeightVotes,
    /// `(round, kind)` pairs already voted this height; the guard that makes
    /// conflicting votes impossible.
    voted: HashSet<(u64, VoteKind)>,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: TbftConfig,
        key: crypto::SecretKey,
        committees: Arc<dyn CommitteeSource>,
        agent: Arc<dyn ProposalAgent>,
        sink: Arc<dyn CommitSink>,
        outbound: UnboundedSender<ConsensusMessage>,
        evidence: EvidencePool,
    ) -> (UnboundedSender<ConsensusMessage>, Self) {
        let (inbound_tx, inbound) = unbounded();

        let engine = Self {
            config,
            key,
            committees,
            agent,
            sink,
            outbound,
            inbound,
            evidence,
            height: 0,
            round: 0,
            step: Step::Propose,
            deadline: Instant::now(),
            committee: vec![],
            proposal: None,
            locked: None,
            votes: HeightVotes::default(),
            voted: HashSet::new(),
        };

        (inbound_tx, engine)
    }

    /// Single-threaded event loop: inbound messages and the step timer are
    /// the only wake-ups, and handlers never overlap.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        self.enter_new_height(self.agent.head_number() + 1);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("bft engine stopping (height: {})", self.height);
                        return;
                    }
                }
                message = self.inbound.next() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => return,
                    }
                }
                () = sleep_until(self.deadline) => self.handle_timeout(),
            }
        }
    }

    fn enter_new_height(&mut self, height: BlockNumber) {
        // The chain may have advanced past us through sync.
        let height = height.max(self.agent.head_number() + 1);
        debug!("entering height {height}");

        self.height = height;
        self.round = 0;
        self.proposal = None;
        self.locked = None;
        self.votes.clear();
        self.voted.clear();

        match self.committees.committee_for_height(height) {
            Ok(committee) => self.committee = committee,
            Err(error) => {
                warn!("no committee for height {height}: {error}");
                self.committee = vec![];
            }
        }

        self.enter_propose();
    }

    fn enter_propose(&mut self) {
        self.step = Step::Propose;
        self.proposal = None;
        self.deadline = Instant::now() + self.backoff(self.config.propose_timeout);

        if self.committee.is_empty() {
            return;
        }

        if self.leader_is_local() {
            let block = match &self.locked {
                Some((_, block)) => Ok(block.clone()),
                None => self.agent.propose_block(self.height),
            };

            match block {
                Ok(block) => match Proposal::create(self.height, self.round, block, &self.key) {
                    Ok(proposal) => {
                        debug!(
                            "proposing block (height: {}, round: {}, hash: {})",
                            self.height,
                            self.round,
                            proposal.block.hash(),
                        );
                        self.broadcast(ConsensusMessage::Proposal(Box::new(proposal.clone())));
                        self.on_proposal(proposal);
                    }
                    Err(error) => warn!("failed to sign proposal: {error}"),
                },
                Err(error) => warn!("failed to build proposal: {error}"),
            }
        }
    }

    fn enter_prevote(&mut self) {
        self.step = Step::Prevote;
        self.deadline = Instant::now() + self.backoff(self.config.prevote_timeout);

        let value = self.prevote_value();
        self.cast_vote(VoteKind::Prevote, value);
    }

    fn enter_precommit(&mut self, value: Option<H256>) {
        self.step = Step::Precommit;
        self.deadline = Instant::now() + self.backoff(self.config.precommit_timeout);

        self.cast_vote(VoteKind::Precommit, value);
    }

    fn enter_next_round(&mut self) {
        self.round += 1;
        debug!("advancing to round {} at height {}", self.round, self.height);
        self.enter_propose();
    }

    /// The locked-block rule: keep prevoting the locked value until two
    /// thirds prevoted something else in a strictly newer round.
    fn prevote_value(&mut self) -> Option<H256> {
        if let Some((locked_round, locked_block)) = self.locked.clone() {
            let newer = self
                .votes
                .newer_prevote_majority(locked_round, self.committee.len());
            match newer {
                Some((_, hash)) if hash != locked_block.hash() => {
                    debug!("lock released by newer prevote majority for {hash}");
                    self.locked = None;
                    self.proposal
                        .as_ref()
                        .map(FastBlock::hash)
                        .filter(|proposed| *proposed == hash)
                }
                _ => Some(locked_block.hash()),
            }
        } else {
            self.proposal.as_ref().map(FastBlock::hash)
        }
    }

    fn handle_message(&mut self, message: ConsensusMessage) {
        match message {
            ConsensusMessage::Proposal(proposal) => self.on_proposal(*proposal),
            ConsensusMessage::Vote(vote) => self.on_vote(*vote),
        }
    }

    fn on_proposal(&mut self, proposal: Proposal) {
        if proposal.height != self.height || proposal.round != self.round {
            return;
        }
        if self.proposal.is_some() {
            return;
        }
        if proposal.block.number() != self.height {
            debug!("proposal block number does not match its height");
            return;
        }

        let Ok(signer) = proposal.signer() else {
            debug!("proposal with unrecoverable signature");
            return;
        };
        let expected = leader_index(self.height, self.round, self.committee.len());
        if member_index(&self.committee, &signer.to_uncompressed_bytes())
            != Some(expected)
        {
            debug!("proposal from non-leader ignored");
            return;
        }

        self.proposal = Some(proposal.block);

        if self.step == Step::Propose {
            self.enter_prevote();
        }
    }

    fn on_vote(&mut self, vote: Vote) {
        if vote.height != self.height {
            return;
        }
        if !vote.is_consistent() {
            debug!("inconsistent vote ignored");
            return;
        }

        let Ok(signer) = vote.signer() else {
            debug!("vote with unrecoverable signature");
            return;
        };
        let signer_key = signer.to_uncompressed_bytes().to_vec();
        if member_index(&self.committee, &signer_key).is_none() {
            debug!("vote from non-member ignored");
            return;
        }

        let round = vote.round;
        let kind = vote.kind;
        let added = self
            .votes
            .set_mut(round, kind)
            .add(signer_key, vote, &self.evidence);

        if added {
            self.check_transitions(round);
        }
    }

    fn check_transitions(&mut self, round: u64) {
        if round != self.round {
            return;
        }
        let committee_size = self.committee.len();

        if self.step <= Step::Prevote {
            let (majority, all_spoken) = self.tally(VoteKind::Prevote, committee_size);

            match majority {
                Some(Some(hash)) => {
                    // Precommit only what we can actually commit later.
                    let have_block = self.block_with_hash(hash).is_some();
                    if have_block {
                        self.locked = Some((
                            self.round,
                            self.block_with_hash(hash)
                                .expect("block presence was just checked"),
                        ));
                        self.enter_precommit(Some(hash));
                    } else {
                        self.enter_precommit(None);
                    }
                }
                Some(None) => self.enter_precommit(None),
                // Two thirds prevoted without agreeing on a value; the
                // stragglers cannot be worth the rest of the timeout.
                None if all_spoken => self.deadline = Instant::now(),
                None => {}
            }
        }

        if self.step == Step::Precommit {
            let (majority, all_spoken) = self.tally(VoteKind::Precommit, committee_size);

            match majority {
                Some(Some(hash)) => {
                    if let Some(block) = self.block_with_hash(hash) {
                        self.do_commit(block, hash);
                    }
                }
                Some(None) => self.enter_next_round(),
                None if all_spoken => self.deadline = Instant::now(),
                None => {}
            }
        }
    }

    /// Current round's majority value and whether two thirds have voted at
    /// all for the given kind.
    fn tally(&self, kind: VoteKind, committee_size: usize) -> (Option<Option<H256>>, bool) {
        match self.votes.set(self.round, kind) {
            Some(set) => (
                set.two_thirds_value(committee_size),
                set.has_two_thirds_any(committee_size),
            ),
            None => (None, false),
        }
    }

    fn handle_timeout(&mut self) {
        match self.step {
            Step::Propose => self.enter_prevote(),
            Step::Prevote => self.enter_precommit(None),
            Step::Precommit => self.enter_next_round(),
            Step::Commit => self.enter_new_height(self.height + 1),
        }
    }

    fn do_commit(&mut self, block: FastBlock, hash: H256) {
        let signs = self
            .votes
            .set(self.round, VoteKind::Precommit)
            .map(|set| set.signs_for(hash))
            .unwrap_or_default();

        debug_assert!(signs.len() >= quorum(self.committee.len()));

        match self.sink.commit(block, signs) {
            Ok(()) => {
                info!("fast block committed (height: {}, hash: {hash})", self.height);
                self.step = Step::Commit;
                self.deadline = Instant::now() + self.config.commit_timeout;
            }
            Err(error) => {
                // A failed commit abandons the round, never the process.
                warn!("commit failed at height {}: {error}", self.height);
                self.enter_next_round();
            }
        }
    }

    fn cast_vote(&mut self, kind: VoteKind, block_hash: Option<H256>) {
        if !self.is_validator() {
            return;
        }
        // At most one vote per (round, kind); conflicting votes are
        // impossible by construction.
        if !self.voted.insert((self.round, kind)) {
            return;
        }

        match Vote::create(self.height, self.round, kind, block_hash, &self.key) {
            Ok(vote) => {
                let signer_key = self.key.public_key().to_uncompressed_bytes().to_vec();
                let round = vote.round;
                let added = self.votes.set_mut(round, kind).add(
                    signer_key,
                    vote.clone(),
                    &self.evidence,
                );
                self.broadcast(ConsensusMessage::Vote(Box::new(vote)));
                if added {
                    self.check_transitions(round);
                }
            }
            Err(error) => warn!("failed to sign vote: {error}"),
        }
    }

    fn broadcast(&self, message: ConsensusMessage) {
        if self.outbound.unbounded_send(message).is_err() {
            debug!("consensus gossip channel is closed");
        }
    }

    fn block_with_hash(&self, hash: H256) -> Option<FastBlock> {
        self.proposal
            .iter()
            .chain(self.locked.iter().map(|(_, block)| block))
            .find(|block| block.hash() == hash)
            .cloned()
    }

    fn leader_is_local(&self) -> bool {
        let index = leader_index(self.height, self.round, self.committee.len());
        member_index(
            &self.committee,
            &self.key.public_key().to_uncompressed_bytes(),
        ) == Some(index)
    }

    fn is_validator(&self) -> bool {
        member_index(
            &self.committee,
            &self.key.public_key().to_uncompressed_bytes(),
        )
        .is_some()
    }

    /// Exponential backoff per round, capped so late rounds stay bounded.
    fn backoff(&self, base: Duration) -> Duration {
        base * 2_u32.saturating_pow(u32::try_from(self.round.min(6)).expect("round is capped"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use types::{FastBody, FastHeader};

    use super::*;

    fn key(seed: u8) -> crypto::SecretKey {
        crypto::SecretKey::from_slice(&[seed; 32]).expect("constant scalar is valid")
    }

    fn committee_of(seeds: &[u8]) -> Vec<CommitteeMember> {
        let mut members = seeds
            .iter()
            .map(|seed| {
                CommitteeMember::new_fixed(
                    types::Address::repeat_byte(*seed),
                    key(*seed).public_key().to_uncompressed_bytes().to_vec(),
                )
            })
            .collect::<Vec<_>>();
        members.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        members
    }

    struct FixedCommittee(Vec<CommitteeMember>);

    impl CommitteeSource for FixedCommittee {
        fn committee_for_height(&self, _: BlockNumber) -> anyhow::Result<Vec<CommitteeMember>> {
            Ok(self.0.clone())
        }
    }

    struct CountingAgent {
        committed: Arc<Mutex<Vec<(FastBlock, Vec<PbftSign>)>>>,
    }

    impl ProposalAgent for CountingAgent {
        fn head_number(&self) -> BlockNumber {
            self.committed
                .lock()
                .expect("commit log mutex is not poisoned")
                .len() as BlockNumber
        }

        fn propose_block(&self, height: BlockNumber) -> anyhow::Result<FastBlock> {
            Ok(FastBlock::new(
                FastHeader {
                    number: height,
                    time: height,
                    ..FastHeader::default()
                },
                FastBody::default(),
            ))
        }
    }

    struct RecordingSink {
        committed: Arc<Mutex<Vec<(FastBlock, Vec<PbftSign>)>>>,
        fail: bool,
    }

    impl CommitSink for RecordingSink {
        fn commit(&self, block: FastBlock, signs: Vec<PbftSign>) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("sink rejects everything"));
            }
            self.committed
                .lock()
                .expect("commit log mutex is not poisoned")
                .push((block, signs));
            Ok(())
        }
    }

    fn test_config() -> TbftConfig {
        TbftConfig {
            propose_timeout: Duration::from_millis(500),
            prevote_timeout: Duration::from_millis(200),
            precommit_timeout: Duration::from_millis(200),
            commit_timeout: Duration::from_millis(10),
        }
    }

    struct Harness {
        inbound: UnboundedSender<ConsensusMessage>,
        outbound: UnboundedReceiver<ConsensusMessage>,
        committed: Arc<Mutex<Vec<(FastBlock, Vec<PbftSign>)>>>,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_engine(our_seed: u8, seeds: &[u8], fail_sink: bool) -> Harness {
        let committed = Arc::new(Mutex::new(vec![]));
        let (outbound_tx, outbound_rx) = unbounded();

        let (inbound, engine) = Engine::new(
            test_config(),
            key(our_seed),
            Arc::new(FixedCommittee(committee_of(seeds))),
            Arc::new(CountingAgent {
                committed: Arc::clone(&committed),
            }),
            Arc::new(RecordingSink {
                committed: Arc::clone(&committed),
                fail: fail_sink,
            }),
            outbound_tx,
            EvidencePool::default(),
        );

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        Harness {
            inbound,
            outbound: outbound_rx,
            committed,
            stop,
            task,
        }
    }

    async fn wait_for_commits(
        committed: &Arc<Mutex<Vec<(FastBlock, Vec<PbftSign>)>>>,
        count: usize,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if committed
                    .lock()
                    .expect("commit log mutex is not poisoned")
                    .len()
                    >= count
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("commits did not arrive in time");
    }

    #[tokio::test]
    async fn single_member_committee_commits_on_its_own() {
        let harness = spawn_engine(1, &[1], false);

        wait_for_commits(&harness.committed, 3).await;

        let committed = harness
            .committed
            .lock()
            .expect("commit log mutex is not poisoned")
            .clone();
        assert_eq!(committed[0].0.number(), 1);
        assert_eq!(committed[1].0.number(), 2);
        assert_eq!(committed[2].0.number(), 3);
        // One-member committee, quorum of one.
        assert_eq!(committed[0].1.len(), 1);

        harness.stop.send(true).expect("engine is running");
        harness.task.await.expect("engine task exits cleanly");
    }

    /// Runs one height of a four-member committee where the three remote
    /// validators are simulated by the test.
    #[tokio::test]
    async fn four_member_committee_commits_with_quorum() {
        let seeds = [1, 2, 3, 4];
        let committee = committee_of(&seeds);
        let mut harness = spawn_engine(1, &seeds, false);

        // Figure out the leader of (1, 0) and obtain the proposal, either
        // from our own engine's gossip or by playing the remote leader.
        let leader = leader_index(1, 0, committee.len());
        let leader_seed = seeds
            .iter()
            .copied()
            .find(|seed| {
                committee[leader].public_key
                    == key(*seed).public_key().to_uncompressed_bytes().to_vec()
            })
            .expect("leader is one of the seeds");

        let block = if leader_seed == 1 {
            let message = tokio::time::timeout(Duration::from_secs(5), harness.outbound.next())
                .await
                .expect("engine gossips its proposal")
                .expect("gossip channel is open");
            match message {
                ConsensusMessage::Proposal(proposal) => proposal.block,
                ConsensusMessage::Vote(_) => panic!("expected the proposal first"),
            }
        } else {
            let block = FastBlock::new(
                FastHeader {
                    number: 1,
                    time: 1,
                    ..FastHeader::default()
                },
                FastBody::default(),
            );
            let proposal = Proposal::create(1, 0, block.clone(), &key(leader_seed))
                .expect("signing succeeds");
            harness
                .inbound
                .unbounded_send(ConsensusMessage::Proposal(Box::new(proposal)))
                .expect("engine is running");
            block
        };

        // The three simulated validators prevote and precommit the block.
        for seed in [2, 3, 4] {
            let vote = Vote::create(1, 0, VoteKind::Prevote, Some(block.hash()), &key(seed))
                .expect("signing succeeds");
            harness
                .inbound
                .unbounded_send(ConsensusMessage::Vote(Box::new(vote)))
                .expect("engine is running");
        }
        for seed in [2, 3, 4] {
            let vote = Vote::create(1, 0, VoteKind::Precommit, Some(block.hash()), &key(seed))
                .expect("signing succeeds");
            harness
                .inbound
                .unbounded_send(ConsensusMessage::Vote(Box::new(vote)))
                .expect("engine is running");
        }

        wait_for_commits(&harness.committed, 1).await;

        let committed = harness
            .committed
            .lock()
            .expect("commit log mutex is not poisoned")
            .clone();
        assert_eq!(committed[0].0.hash(), block.hash());
        assert!(committed[0].1.len() >= quorum(4));

        harness.stop.send(true).expect("engine is running");
        harness.task.await.expect("engine task exits cleanly");
    }

    #[tokio::test]
    async fn locked_block_is_prevoted_until_newer_majority_appears() {
        let committed = Arc::new(Mutex::new(vec![]));
        let (outbound_tx, _outbound_rx) = unbounded();
        let (_inbound, mut engine) = Engine::new(
            test_config(),
            key(1),
            Arc::new(FixedCommittee(committee_of(&[1, 2, 3, 4]))),
            Arc::new(CountingAgent {
                committed: Arc::clone(&committed),
            }),
            Arc::new(RecordingSink {
                committed,
                fail: false,
            }),
            outbound_tx,
            EvidencePool::default(),
        );

        engine.height = 5;
        engine.committee = committee_of(&[1, 2, 3, 4]);

        let locked_block = FastBlock::new(
            FastHeader {
                number: 5,
                ..FastHeader::default()
            },
            FastBody::default(),
        );
        engine.locked = Some((0, locked_block.clone()));
        engine.round = 1;

        // Without newer evidence the lock dictates the prevote.
        assert_eq!(engine.prevote_value(), Some(locked_block.hash()));

        // Two thirds prevoted a different value in a newer round.
        let other_hash = H256::repeat_byte(0xcc);
        let evidence = EvidencePool::default();
        for seed in [2, 3, 4] {
            let vote = Vote::create(5, 2, VoteKind::Prevote, Some(other_hash), &key(seed))
                .expect("signing succeeds");
            let _ = engine.votes.set_mut(2, VoteKind::Prevote).add(
                key(seed).public_key().to_uncompressed_bytes().to_vec(),
                vote,
                &evidence,
            );
        }
        engine.round = 3;

        assert_eq!(engine.prevote_value(), None);
        assert!(engine.locked.is_none());
    }

    #[tokio::test]
    async fn split_prevote_quorum_cuts_the_round_timeout() {
        let committed = Arc::new(Mutex::new(vec![]));
        let (outbound_tx, _outbound_rx) = unbounded();
        let (_inbound, mut engine) = Engine::new(
            test_config(),
            key(1),
            Arc::new(FixedCommittee(committee_of(&[1, 2, 3, 4]))),
            Arc::new(CountingAgent {
                committed: Arc::clone(&committed),
            }),
            Arc::new(RecordingSink {
                committed,
                fail: false,
            }),
            outbound_tx,
            EvidencePool::default(),
        );

        engine.height = 5;
        engine.committee = committee_of(&[1, 2, 3, 4]);
        engine.step = Step::Prevote;
        engine.deadline = Instant::now() + Duration::from_secs(3600);

        // Two nil prevotes and one for a value: two thirds have spoken
        // with no majority in sight.
        let ballots = [
            (2, Some(H256::repeat_byte(0xab))),
            (3, None),
            (4, None),
        ];
        for (seed, value) in ballots {
            let vote = Vote::create(5, 0, VoteKind::Prevote, value, &key(seed))
                .expect("signing succeeds");
            engine.on_vote(vote);
        }

        assert!(engine.deadline <= Instant::now());
        assert_eq!(engine.step, Step::Prevote);
    }

    #[tokio::test]
    async fn failed_commit_abandons_the_round_not_the_process() {
        let harness = spawn_engine(1, &[1], true);

        // Give the engine time to fail a few commits.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(harness
            .committed
            .lock()
            .expect("commit log mutex is not poisoned")
            .is_empty());

        // Still alive and responsive to shutdown.
        harness.stop.send(true).expect("engine is running");
        harness.task.await.expect("engine task exits cleanly");
    }
}
