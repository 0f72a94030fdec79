//! BFT finality engine.
//!
//! A leader-driven three-phase protocol, Propose → Prevote → Precommit →
//! Commit, run once per fast-block height. Rounds within a height advance
//! on timeout with exponential backoff. The engine is a single-threaded
//! event loop: one inbound message queue, one timer, no two handlers ever
//! run concurrently on the same instance.
//!
//! Safety rests on three rules enforced here:
//! - a validator signs at most one prevote and one precommit per round;
//! - a precommit for a value requires having seen two thirds of prevotes
//!   for it in the same round;
//! - once locked on a precommitted value, a validator keeps prevoting it
//!   until newer two-thirds prevote evidence releases the lock.

pub use crate::{
    engine::{leader_index, CommitSink, CommitteeSource, Engine, ProposalAgent, TbftConfig},
    evidence::{DoubleSignEvidence, EvidencePool},
    messages::{ConsensusMessage, Proposal, Vote, VoteKind},
    votes::{quorum, HeightVotes, VoteSet},
};

mod engine;
mod evidence;
mod messages;
mod votes;
