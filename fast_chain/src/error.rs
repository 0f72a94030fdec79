use thiserror::Error;
use types::{BlockNumber, H256};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {hash} is already canonical")]
    KnownBlock { hash: H256 },
    #[error("parent {parent_hash} of block {number} is not the current head")]
    UnknownParent {
        number: BlockNumber,
        parent_hash: H256,
    },
    #[error("block number {got} does not follow head {head}")]
    NonSequential { head: BlockNumber, got: BlockNumber },
    #[error("timestamp does not advance past parent")]
    TimestampNotAdvancing,
    #[error("gas used {used} exceeds gas limit {limit}")]
    GasAboveLimit { used: u64, limit: u64 },
    #[error("gas used mismatch (header: {header}, computed: {computed})")]
    GasUsedMismatch { header: u64, computed: u64 },
    #[error("another insertion is in progress")]
    ConcurrentInsert,
    #[error("transactions root mismatch (header: {header}, computed: {computed})")]
    TxsRootMismatch { header: H256, computed: H256 },
    #[error("state root mismatch (header: {header}, computed: {computed})")]
    RootMismatch { header: H256, computed: H256 },
    #[error("receipts root mismatch (header: {header}, computed: {computed})")]
    ReceiptsRootMismatch { header: H256, computed: H256 },
    #[error("finality verification failed: {0}")]
    Finality(#[source] anyhow::Error),
    #[error("execution failed: {0}")]
    Execution(#[from] execution::ExecutionError),
    #[error("parent state for root {root} is missing")]
    MissingState { root: H256 },
    #[error(
        "a different block was finalized at height {number}; \
         local chain is divergent and requires a resync"
    )]
    DivergentFinalizedBlock { number: BlockNumber },
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}
