//! Capability handles injected across subsystem boundaries.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, ensure, Result};
use election::Election;
use fast_chain::FastChain;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use snail_chain::SnailChain;
use state_store::State;
use types::{
    Address, BlockNumber, CommitteeMember, FastBlock, FastBody, FastHeader, PbftSign, SwitchInfo,
    Transaction, H256,
};

#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Breaks the construction cycle fast chain → election → snail chain →
/// fast chain: the fast chain gets this verifier first, the election is
/// bound once it exists. Only the genesis block can be inserted before
/// binding, and genesis skips finality verification.
#[derive(Default)]
pub struct LateBoundVerifier {
    election: OnceCell<Arc<Election>>,
}

impl LateBoundVerifier {
    pub fn bind(&self, election: Arc<Election>) {
        self.election
            .set(election)
            .map_err(|_| ())
            .expect("the verifier is bound exactly once at startup");
    }
}

impl fast_chain::FinalityVerifier for LateBoundVerifier {
    fn verify_finality(
        &self,
        fast_number: BlockNumber,
        fast_hash: H256,
        signs: &[PbftSign],
    ) -> Result<()> {
        let election = self
            .election
            .get()
            .ok_or_else(|| anyhow!("election bridge is not wired yet"))?;
        election.verify_finality(fast_number, fast_hash, signs)
    }
}

pub struct FastReader(pub Arc<FastChain>);

impl snail_chain::FastchainReader for FastReader {
    fn canonical_hash(&self, number: BlockNumber) -> Option<H256> {
        self.0.canonical_hash(number)
    }

    fn head_number(&self) -> BlockNumber {
        self.0.current().number()
    }
}

pub struct SnailReader(pub Arc<SnailChain>);

impl election::SnailchainReader for SnailReader {
    fn canonical_block(&self, number: BlockNumber) -> Option<types::SnailBlock> {
        self.0.get_by_number(number)
    }

    fn head_number(&self) -> BlockNumber {
        self.0.current().number()
    }
}

pub struct PoolStateReader(pub Arc<FastChain>);

impl tx_pool::ChainReader for PoolStateReader {
    fn chain_id(&self) -> u64 {
        self.0.config().chain_id
    }

    fn head_state(&self) -> Result<State> {
        self.0.head_state().map_err(Into::into)
    }
}

pub struct FruitPoolReader {
    pub fast: Arc<FastChain>,
    pub snail: Arc<SnailChain>,
}

impl snail_pool::ChainReader for FruitPoolReader {
    fn fast_head_number(&self) -> BlockNumber {
        self.fast.current().number()
    }

    fn canonical_fast_hash(&self, number: BlockNumber) -> Option<H256> {
        self.fast.canonical_hash(number)
    }

    fn fruit_is_canonical(&self, fast_hash: H256) -> bool {
        self.snail.get_fruit(fast_hash).is_some()
    }
}

/// Read projection of the transaction pool, refreshed by the event task.
/// The BFT engine borrows this snapshot when building a proposal.
pub type PendingView = Arc<RwLock<BTreeMap<Address, Vec<Transaction>>>>;

pub struct Committees(pub Arc<Election>);

impl tbft::CommitteeSource for Committees {
    fn committee_for_height(&self, height: BlockNumber) -> Result<Vec<CommitteeMember>> {
        self.0
            .committee_for_fast(height)
            .map(|committee| committee.as_ref().clone())
    }
}

/// Builds proposals from the fast head and the pending-transaction view.
pub struct Agent {
    pub fast: Arc<FastChain>,
    pub election: Arc<Election>,
    pub pending: PendingView,
}

impl tbft::ProposalAgent for Agent {
    fn head_number(&self) -> BlockNumber {
        self.fast.current().number()
    }

    fn propose_block(&self, height: BlockNumber) -> Result<FastBlock> {
        let parent = self.fast.current();
        ensure!(
            height == parent.number() + 1,
            "cannot propose height {height} on head {}",
            parent.number(),
        );

        let parent_state = self.fast.head_state()?;
        let gas_limit = parent.header().gas_limit;
        let chain_id = self.fast.config().chain_id;

        // Greedy packing: per-sender nonce runs, dropped at the first
        // transaction that no longer applies.
        let mut packed = vec![];
        let mut scratch = parent_state.clone();
        let mut gas_used = 0;
        let view = self.pending.read().clone();
        'senders: for run in view.into_values() {
            for transaction in run {
                if gas_used + execution::intrinsic_gas(&transaction) > gas_limit {
                    break 'senders;
                }
                match execution::apply_transaction(&mut scratch, &transaction, chain_id) {
                    Ok(receipt) => {
                        gas_used += receipt.gas_used;
                        packed.push(transaction);
                    }
                    Err(_) => continue 'senders,
                }
            }
        }

        let outcome = execution::execute_block(&parent_state, &packed, gas_limit, chain_id)?;

        // Announce a committee rotation in the last block before the
        // boundary so the outgoing committee ratifies its successor.
        let current_epoch = self.election.current_epoch();
        let switch_info = if current_epoch > self.election.latest_switch_epoch() {
            Some(SwitchInfo {
                epoch_id: current_epoch,
                members: self
                    .election
                    .committee_by_epoch(current_epoch)?
                    .as_ref()
                    .clone(),
            })
        } else {
            None
        };

        let header = FastHeader {
            parent_hash: parent.hash(),
            number: height,
            time: unix_now().max(parent.header().time),
            root: outcome.state_root(),
            txs_root: FastBlock::transactions_root(&packed),
            receipts_root: outcome.receipts_root(),
            gas_limit,
            gas_used: outcome.gas_used,
            extra: vec![],
        };

        Ok(FastBlock::new(
            header,
            FastBody {
                transactions: packed,
                signs: vec![],
                switch_info,
            },
        ))
    }
}

/// Lets the fetcher and downloader feed synced snail blocks into the
/// chain, translating chain errors into import outcomes.
pub struct SnailImportSink {
    pub snail: Arc<SnailChain>,
}

impl sync::ImportSink for SnailImportSink {
    fn import(&self, block: types::SnailBlock) -> Result<sync::ImportOutcome> {
        let (_, error) = self.snail.insert_chain(vec![block]);
        match error {
            None => Ok(sync::ImportOutcome::Imported),
            Some(snail_chain::SnailChainError::KnownBlock { .. }) => {
                Ok(sync::ImportOutcome::Known)
            }
            Some(snail_chain::SnailChainError::UnknownAncestor { .. }) => {
                Ok(sync::ImportOutcome::MissingParent)
            }
            Some(error) => Err(error.into()),
        }
    }

    fn has_block(&self, hash: H256) -> bool {
        self.snail.get_by_hash(hash).is_some()
    }

    fn head_number(&self) -> BlockNumber {
        self.snail.current().number()
    }
}

/// Commit path of the BFT engine: ratifies any embedded committee
/// rotation, then finalizes the block on the fast chain.
pub struct Commit {
    pub fast: Arc<FastChain>,
    pub election: Arc<Election>,
}

impl tbft::CommitSink for Commit {
    fn commit(&self, block: FastBlock, signs: Vec<PbftSign>) -> Result<()> {
        if let Some(info) = block.switch_info() {
            self.election.verify_switch_info(block.number(), info)?;
        }

        let number = block.number();
        let switch_info = block.switch_info().cloned();
        self.fast.insert_finalized(block, signs)?;

        if let Some(info) = switch_info {
            self.election.record_switch(number, &info);
        }

        Ok(())
    }
}
