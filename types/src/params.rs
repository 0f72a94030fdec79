//! Protocol constants shared by both chains.

use crate::primitives::{BlockNumber, NetworkId};

/// Snail blocks per committee epoch.
pub const EPOCH_LENGTH: BlockNumber = 180;

/// The election seed for epoch `e` is the hash of the snail block this many
/// blocks before the epoch start.
pub const ELECTION_SEED_OFFSET: BlockNumber = 12;

pub const MIN_COMMITTEE_SIZE: usize = 4;
pub const MAX_COMMITTEE_SIZE: usize = 31;

/// Maximum age, in snail blocks, of the fast block a fruit references.
pub const FRESHNESS_WINDOW: BlockNumber = 17;

/// `fruit_difficulty = snail_difficulty / FRUIT_RATIO`.
pub const FRUIT_RATIO: u64 = 64;

/// Fast blocks per Minerva dataset epoch.
pub const DATASET_EPOCH_LENGTH: BlockNumber = 12_000;

/// Target spacing between snail blocks, in seconds. Input to the
/// difficulty retarget.
pub const SNAIL_BLOCK_TIME: u64 = 600;

pub const MAINNET_NETWORK_ID: NetworkId = 20515;
pub const TESTNET_NETWORK_ID: NetworkId = 18928;
pub const SINGLENODE_NETWORK_ID: NetworkId = 400;

pub const JSON_RPC_PORT: u16 = 7545;
pub const WEBSOCKET_PORT: u16 = 9215;
pub const P2P_MAINNET_PORT: u16 = 30513;
pub const P2P_TESTNET_PORT: u16 = 30310;
pub const P2P_DEV_PORTS: [u16; 3] = [30311, 30313, 30314];

pub const MAINNET_BOOTNODES: &[&str] = &[
    "enode://0718753a5521862e5decb342e741ab5a649297229c812899dcdf2412c562e55174fd717dbc8005133273856455afa13054c79a69f7bf1b5701014b2ab6ff17b8@39.98.214.163:30513",
];

pub const TESTNET_BOOTNODES: &[&str] = &[
    "enode://a395d2799c1e63307b9a5ecc44729e9ba2fb8fa6d64e362e8498ce9aba85b7b405755ad28bd662a9a48d941bbbfe18d29e0ea46105258110e2318fd6faab8c09@39.108.212.229:30313",
];

pub const DEVNET_BOOTNODES: &[&str] = &[
    "enode://f1ce2725b0e5cf403293be25ce94c222d8f4e6e7e4e2881559382a8fbfb64934923467ca182985f8391c6f65d79a717c13df4fb2a53ccd8aba51e5638d6da6a7@39.98.202.190:30314",
];
