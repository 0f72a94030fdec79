use thiserror::Error;
use types::{BlockNumber, H256};

#[derive(Debug, Error)]
pub enum SnailChainError {
    #[error("snail block {hash} is already stored")]
    KnownBlock { hash: H256 },
    #[error("ancestor {parent_hash} of snail block {number} is unknown")]
    UnknownAncestor {
        number: BlockNumber,
        parent_hash: H256,
    },
    #[error(transparent)]
    Pow(#[from] minerva::PowError),
    #[error("fruit references unknown or non-canonical fast block {fast_hash} ({fast_number})")]
    UnknownFastBlock {
        fast_number: BlockNumber,
        fast_hash: H256,
    },
    #[error("fruit for fast block {fast_number} is outside the freshness window")]
    StaleFruit { fast_number: BlockNumber },
    #[error("duplicate fruit for fast block {fast_hash}")]
    DuplicateFruit { fast_hash: H256 },
    #[error("fruits are not in strictly ascending fast-number order")]
    FruitsUnordered,
    #[error("fruits root mismatch (header: {header}, computed: {computed})")]
    FruitsRootMismatch { header: H256, computed: H256 },
    #[error("header fast number {header} does not match newest fruit {computed}")]
    FastNumberMismatch {
        header: BlockNumber,
        computed: BlockNumber,
    },
    #[error("another insertion is in progress")]
    ConcurrentInsert,
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}
