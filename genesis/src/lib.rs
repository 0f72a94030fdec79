//! Genesis specification and dual-chain bootstrap.
//!
//! A [`Genesis`] describes both chains at height zero: the fast genesis
//! block with the initial allocation and fixed committee, and the snail
//! genesis block embedding one genesis fruit that attests it.
//! [`setup_genesis`] resolves the four cases of (database empty × genesis
//! supplied) and checks chain-config compatibility against what is stored.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use hex_literal::hex;
use log::info;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use state_store::State;
use thiserror::Error;
use types::{
    params, Address, BlockNumber, ChainConfig, CommitteeMember, FastBlock, FastBody, FastHeader,
    Fruit, Receipt, SnailBlock, SnailHeader, SwitchInfo, H256, U256,
};

pub static MAINNET_GENESIS_HASH: Lazy<H256> =
    Lazy::new(|| Genesis::mainnet().to_fast_block().0.hash());
pub static MAINNET_SNAIL_GENESIS_HASH: Lazy<H256> =
    Lazy::new(|| Genesis::mainnet().to_snail_block().hash());
pub static TESTNET_GENESIS_HASH: Lazy<H256> =
    Lazy::new(|| Genesis::testnet().to_fast_block().0.hash());
pub static TESTNET_SNAIL_GENESIS_HASH: Lazy<H256> =
    Lazy::new(|| Genesis::testnet().to_snail_block().hash());

#[derive(Debug, Error)]
#[error("database already contains an incompatible genesis block (have {stored}, new {new})")]
pub struct GenesisMismatchError {
    pub stored: H256,
    pub new: H256,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisAccount {
    pub balance: U256,
    #[serde(default)]
    pub code: Vec<u8>,
    #[serde(default)]
    pub storage: BTreeMap<H256, H256>,
    #[serde(default)]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    pub config: ChainConfig,
    pub nonce: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub extra_data: Vec<u8>,
    pub gas_limit: u64,
    pub difficulty: U256,
    #[serde(default)]
    pub mix_hash: H256,
    #[serde(default)]
    pub coinbase: Address,
    pub alloc: BTreeMap<Address, GenesisAccount>,
    pub committee: Vec<CommitteeMember>,
    #[serde(default)]
    pub number: BlockNumber,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub parent_hash: H256,
}

impl Genesis {
    #[must_use]
    pub fn mainnet() -> Self {
        let balance_one = U256::from_dec_str("65750000000000000000000000")
            .expect("constant is a valid decimal");
        let balance_two = U256::from_dec_str("8250000000000000000000000")
            .expect("constant is a valid decimal");

        Self {
            config: ChainConfig::mainnet(),
            nonce: 330,
            timestamp: 0,
            // "TrueChain MainNet"
            extra_data: hex!("54727565436861696E204D61696E4E6574").to_vec(),
            gas_limit: 16_777_216,
            difficulty: U256::from(2_147_483_648_u64),
            mix_hash: H256::zero(),
            coinbase: Address::zero(),
            alloc: BTreeMap::from([
                (
                    address(hex!("0172479e14f038B7C825975927d5d8CcDF1670A2")),
                    GenesisAccount {
                        balance: balance_one,
                        ..GenesisAccount::default()
                    },
                ),
                (
                    address(hex!("58e96112Fd2727cFa4D09EC545CF6b6Bff4B4F62")),
                    GenesisAccount {
                        balance: balance_two,
                        ..GenesisAccount::default()
                    },
                ),
            ]),
            committee: vec![
                CommitteeMember::new_fixed(
                    address(hex!("0172479e14f038B7C825975927d5d8CcDF1670A2")),
                    hex!("042044fd0c38906242061f6978d7a3158b55fd373d3c56fe972390002f5c46484d404c6356280f3b73c14d7ec3a3bfa06e7899972991d4312f47d7c9224ebe2e69").to_vec(),
                ),
                CommitteeMember::new_fixed(
                    address(hex!("58e96112Fd2727cFa4D09EC545CF6b6Bff4B4F62")),
                    hex!("0474e42b6b7e03a3f624f367b9d4030a9fd3507916c2de018f8578d6fb3e0b283d9613a7508042d8963e71d7b4807a6cdb7dfee717d22f4498787566078374b6fc").to_vec(),
                ),
                CommitteeMember::new_fixed(
                    address(hex!("e4A05d9be5671045a4D7286A58863D06961842B2")),
                    hex!("04cdab5f2005e417a8fa357508b6ee1a71ddf96eb489a06194427e02f9c757fc376c2bf76b3b6afddb096284bf8d103e99316d559f4094beaceeda4752cca42b8a").to_vec(),
                ),
                CommitteeMember::new_fixed(
                    address(hex!("dcB9f89f272bB397D4870f40c9E925Aaf5553b73")),
                    hex!("04db067a3f83aee61df3aa8724857120b46f1e82036f18e14d6cf7358fd4138b79eb7e6961d99fb112986ef3c7b64ac8184f3eafabe559fe2358d07b7b46d94078").to_vec(),
                ),
            ],
            number: 0,
            gas_used: 0,
            parent_hash: H256::zero(),
        }
    }

    #[must_use]
    pub fn testnet() -> Self {
        let balance = U256::from_dec_str("24000000000000000000000000")
            .expect("constant is a valid decimal");

        let mut genesis = Self::mainnet();
        genesis.config = ChainConfig::testnet();
        genesis.nonce = 928;
        genesis.timestamp = 1_537_891_200;
        // "TrueChain TestNet 05"
        genesis.extra_data = hex!("54727565436861696E20546573744E6574203035").to_vec();
        genesis.gas_limit = 20_971_520;
        genesis.difficulty = U256::from(100_000);
        genesis.alloc = BTreeMap::from([(
            address(hex!("0172479e14f038B7C825975927d5d8CcDF1670A2")),
            GenesisAccount {
                balance,
                ..GenesisAccount::default()
            },
        )]);
        genesis
    }

    /// Degenerate single-member network (id 400). The committee seat is a
    /// well-known development key so the node can sign its own blocks.
    #[must_use]
    pub fn singlenode() -> Self {
        let key = singlenode_secret_key();
        let funded = key.address();

        Self {
            config: ChainConfig::singlenode(),
            nonce: 400,
            timestamp: 0,
            extra_data: vec![],
            gas_limit: 30_000_000,
            difficulty: U256::from(16),
            mix_hash: H256::zero(),
            coinbase: funded,
            alloc: BTreeMap::from([(
                funded,
                GenesisAccount {
                    balance: U256::from(10).pow(U256::from(26)),
                    ..GenesisAccount::default()
                },
            )]),
            committee: vec![CommitteeMember::new_fixed(
                funded,
                key.public_key().to_uncompressed_bytes().to_vec(),
            )],
            number: 0,
            gas_used: 0,
            parent_hash: H256::zero(),
        }
    }

    #[must_use]
    pub fn for_network(config: &ChainConfig) -> Self {
        match config.network_id {
            params::TESTNET_NETWORK_ID => Self::testnet(),
            params::SINGLENODE_NETWORK_ID => Self::singlenode(),
            _ => Self::mainnet(),
        }
    }

    /// The fast genesis block and the state it commits to.
    #[must_use]
    pub fn to_fast_block(&self) -> (FastBlock, State) {
        let mut state = State::new();
        for (account_address, account) in &self.alloc {
            state.set_balance(*account_address, account.balance);
            state.set_nonce(*account_address, account.nonce);
            if !account.code.is_empty() {
                state.set_code(*account_address, account.code.clone());
            }
            for (key, value) in &account.storage {
                state.set_storage(*account_address, *key, *value);
            }
        }

        let header = FastHeader {
            parent_hash: self.parent_hash,
            number: self.number,
            time: self.timestamp,
            root: state.root(),
            txs_root: FastBlock::transactions_root(&[]),
            receipts_root: types::ordered_root::<Receipt>([]),
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            extra: self.extra_data.clone(),
        };

        // The whole genesis committee is ratified by block zero.
        let body = FastBody {
            transactions: vec![],
            signs: vec![],
            switch_info: Some(SwitchInfo {
                epoch_id: 0,
                members: self.committee.clone(),
            }),
        };

        (FastBlock::new(header, body), state)
    }

    /// The snail genesis block, embedding one fruit that attests the fast
    /// genesis block.
    #[must_use]
    pub fn to_snail_block(&self) -> SnailBlock {
        let (fast_block, _) = self.to_fast_block();

        let fruit = Fruit {
            header: SnailHeader {
                parent_hash: self.parent_hash,
                number: self.number,
                time: self.timestamp,
                fruit_difficulty: minerva::fruit_difficulty(self.difficulty),
                coinbase: self.coinbase,
                fast_number: fast_block.number(),
                fast_hash: fast_block.hash(),
                nonce: self.nonce,
                ..SnailHeader::default()
            },
        };

        let fruits = vec![fruit];
        let header = SnailHeader {
            parent_hash: self.parent_hash,
            number: self.number,
            time: self.timestamp,
            difficulty: self.difficulty,
            fruit_difficulty: minerva::fruit_difficulty(self.difficulty),
            coinbase: self.coinbase,
            fast_number: fast_block.number(),
            fast_hash: fast_block.hash(),
            fruits_root: SnailBlock::fruits_root(&fruits),
            mix_digest: self.mix_hash,
            nonce: self.nonce,
            extra: self.extra_data.clone(),
        };

        SnailBlock::new(header, fruits, vec![])
    }

    /// Writes both genesis blocks as the canonical heads of an empty
    /// database.
    pub fn commit(&self, database: &database::Database) -> Result<(H256, H256)> {
        if self.number != 0 {
            return Err(anyhow!("cannot commit a genesis block with number > 0"));
        }

        let (fast_block, state) = self.to_fast_block();
        let fast_hash = fast_block.hash();
        let _root = state.commit(database)?;

        database.put_batch([
            (
                fast_chain::keys::header(0, fast_hash),
                rlp::encode(fast_block.header()).to_vec(),
            ),
            (
                fast_chain::keys::body(0, fast_hash),
                rlp::encode(fast_block.body()).to_vec(),
            ),
            (
                fast_chain::keys::receipts(0, fast_hash),
                rlp::encode_list::<Receipt, Receipt>(&[]).to_vec(),
            ),
            (
                fast_chain::keys::canonical(0),
                fast_hash.as_bytes().to_vec(),
            ),
            (
                fast_chain::keys::number_of(fast_hash),
                0_u64.to_be_bytes().to_vec(),
            ),
            (
                fast_chain::keys::HEAD_KEY.to_vec(),
                fast_hash.as_bytes().to_vec(),
            ),
            (
                fast_chain::keys::chain_config(fast_hash),
                serde_json::to_vec(&self.config)?,
            ),
        ])?;

        let snail_block = self.to_snail_block();
        let snail_hash = snail_block.hash();
        let mut td_bytes = [0; 32];
        snail_block
            .contributed_difficulty()
            .to_big_endian(&mut td_bytes);

        let mut batch = vec![
            (
                snail_chain::keys::block(0, snail_hash),
                rlp::encode(&snail_block).to_vec(),
            ),
            (
                snail_chain::keys::number_of(snail_hash),
                0_u64.to_be_bytes().to_vec(),
            ),
            (
                snail_chain::keys::total_difficulty(0, snail_hash),
                td_bytes.to_vec(),
            ),
            (
                snail_chain::keys::canonical(0),
                snail_hash.as_bytes().to_vec(),
            ),
            (
                snail_chain::keys::HEAD_KEY.to_vec(),
                snail_hash.as_bytes().to_vec(),
            ),
        ];
        for fruit in snail_block.fruits() {
            batch.push((
                snail_chain::keys::fruit_lookup(fruit.fast_hash()),
                snail_hash.as_bytes().to_vec(),
            ));
        }
        database.put_batch(batch)?;

        Ok((fast_hash, snail_hash))
    }
}

/// Well-known development key backing the singlenode committee seat.
#[must_use]
pub fn singlenode_secret_key() -> crypto::SecretKey {
    crypto::SecretKey::from_slice(&crypto::keccak256(b"taichain singlenode").0)
        .expect("the hash of a fixed string is a valid scalar")
}

/// Writes or validates the genesis block, resolving:
///
/// |                    | genesis == None    | genesis == Some      |
/// |--------------------|--------------------|----------------------|
/// | db has no genesis  | mainnet default    | the supplied genesis |
/// | db has genesis     | stored config      | must match stored    |
///
/// Returns the effective chain config and both genesis hashes. A stored
/// chain config incompatible with the supplied one surfaces as
/// [`types::ConfigCompatError`] via `anyhow`, carrying the rewind target.
pub fn setup_genesis(
    database: &database::Database,
    genesis: Option<Genesis>,
) -> Result<(ChainConfig, H256, H256)> {
    let stored_fast = database
        .get(fast_chain::keys::canonical(0))?
        .map(|bytes| H256::from_slice(&bytes));

    let Some(stored_fast) = stored_fast else {
        let genesis = genesis.unwrap_or_else(|| {
            info!("writing default main-net genesis block");
            Genesis::mainnet()
        });
        let (fast_hash, snail_hash) = genesis.commit(database)?;
        info!("genesis committed (fast: {fast_hash}, snail: {snail_hash})");
        return Ok((genesis.config, fast_hash, snail_hash));
    };

    let stored_snail = database
        .get(snail_chain::keys::canonical(0))?
        .map(|bytes| H256::from_slice(&bytes))
        .ok_or_else(|| anyhow!("database has a fast genesis but no snail genesis"))?;

    let stored_config: ChainConfig = database
        .get(fast_chain::keys::chain_config(stored_fast))?
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?
        .ok_or_else(|| anyhow!("stored genesis block has no chain config"))?;

    let Some(genesis) = genesis else {
        return Ok((stored_config, stored_fast, stored_snail));
    };

    let (fast_block, _) = genesis.to_fast_block();
    if fast_block.hash() != stored_fast {
        return Err(GenesisMismatchError {
            stored: stored_fast,
            new: fast_block.hash(),
        }
        .into());
    }

    // Fork-flag compatibility against the snail height already reached.
    let snail_head = snail_head_number(database)?;
    stored_config.check_compatible(&genesis.config, snail_head)?;
    database.put(
        fast_chain::keys::chain_config(stored_fast),
        serde_json::to_vec(&genesis.config)?,
    )?;

    Ok((genesis.config, stored_fast, stored_snail))
}

fn snail_head_number(database: &database::Database) -> Result<BlockNumber> {
    let Some(head_hash) = database.get(snail_chain::keys::HEAD_KEY)? else {
        return Ok(0);
    };
    let Some(bytes) = database.get(snail_chain::keys::number_of(H256::from_slice(&head_hash)))?
    else {
        return Ok(0);
    };
    Ok(BlockNumber::from_be_bytes(
        bytes
            .try_into()
            .map_err(|_| anyhow!("malformed snail head number"))?,
    ))
}

fn address(bytes: [u8; 20]) -> Address {
    Address::from_slice(&bytes)
}
