use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    params,
    primitives::{BlockNumber, NetworkId},
};

/// Chain configuration stored alongside the genesis block.
///
/// `tip9_block` is the snail height at which the revised difficulty
/// retarget activates. `None` means the fork is not scheduled.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub network_id: NetworkId,
    #[serde(default)]
    pub tip9_block: Option<BlockNumber>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error(
    "incompatible chain config: tip9 fork moved from {stored:?} to {new:?} \
     below local head {head}, rewind to {rewind_to} required"
)]
pub struct ConfigCompatError {
    pub stored: Option<BlockNumber>,
    pub new: Option<BlockNumber>,
    pub head: BlockNumber,
    pub rewind_to: BlockNumber,
}

impl ChainConfig {
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            chain_id: params::MAINNET_NETWORK_ID,
            network_id: params::MAINNET_NETWORK_ID,
            tip9_block: Some(1_500_000),
        }
    }

    #[must_use]
    pub fn testnet() -> Self {
        Self {
            chain_id: params::TESTNET_NETWORK_ID,
            network_id: params::TESTNET_NETWORK_ID,
            tip9_block: Some(450_000),
        }
    }

    #[must_use]
    pub fn singlenode() -> Self {
        Self {
            chain_id: params::SINGLENODE_NETWORK_ID,
            network_id: params::SINGLENODE_NETWORK_ID,
            tip9_block: Some(0),
        }
    }

    #[must_use]
    pub fn is_singlenode(&self) -> bool {
        self.network_id == params::SINGLENODE_NETWORK_ID
    }

    #[must_use]
    pub fn is_tip9(&self, snail_number: BlockNumber) -> bool {
        self.tip9_block
            .is_some_and(|fork| fork <= snail_number)
    }

    /// Checks that `new` may replace `self` on a database whose snail head is
    /// at `head`. Moving a fork flag below the head invalidates already
    /// processed blocks, so the caller must rewind first.
    pub fn check_compatible(
        &self,
        new: &Self,
        head: BlockNumber,
    ) -> Result<(), ConfigCompatError> {
        if self.tip9_block == new.tip9_block {
            return Ok(());
        }

        let lowest = [self.tip9_block, new.tip9_block]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(0);

        if lowest > head {
            return Ok(());
        }

        Err(ConfigCompatError {
            stored: self.tip9_block,
            new: new.tip9_block,
            head,
            rewind_to: lowest.saturating_sub(1),
        })
    }

    #[must_use]
    pub fn bootnodes(&self) -> &'static [&'static str] {
        match self.network_id {
            params::MAINNET_NETWORK_ID => params::MAINNET_BOOTNODES,
            params::TESTNET_NETWORK_ID => params::TESTNET_BOOTNODES,
            _ => params::DEVNET_BOOTNODES,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(ChainConfig::mainnet())]
    #[test_case(ChainConfig::testnet())]
    #[test_case(ChainConfig::singlenode())]
    fn configs_are_self_compatible(config: ChainConfig) {
        config
            .check_compatible(&config, 1_000_000)
            .expect("every config is compatible with itself");
    }

    #[test]
    fn moving_fork_below_head_requires_rewind() {
        let stored = ChainConfig::mainnet();
        let mut new = stored;
        new.tip9_block = Some(100);

        let error = stored
            .check_compatible(&new, 500)
            .expect_err("fork moved below head");
        assert_eq!(error.rewind_to, 99);
    }

    #[test]
    fn moving_fork_above_head_is_compatible() {
        let stored = ChainConfig::mainnet();
        let mut new = stored;
        new.tip9_block = Some(2_000_000);

        stored
            .check_compatible(&new, 500)
            .expect("both forks are in the future");
    }
}
