//! Versioned account state with a Merkle commitment.
//!
//! Accounts live in a persistent ordered map, so cloning a [`State`] is a
//! cheap snapshot. That is the whole versioning story: execution clones the
//! state before applying a transaction and discards the clone on failure.
//! The Merkle commitment folds the RLP of every account in address order.

use anyhow::{anyhow, Result};
use im::OrdMap;
use rlp::{DecoderError, Rlp, RlpStream};
use types::{ordered_root, Address, H256, U256};

const STATE_KEY_PREFIX: u8 = b'S';

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code: Vec<u8>,
    pub storage: OrdMap<H256, H256>,
}

impl Account {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code.is_empty()
    }
}

impl rlp::Encodable for Account {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(4);
        stream.append(&self.nonce);
        stream.append(&self.balance);
        stream.append(&self.code);
        stream.begin_list(self.storage.len());
        for (key, value) in &self.storage {
            stream.begin_list(2);
            stream.append(key);
            stream.append(value);
        }
    }
}

impl rlp::Decodable for Account {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let mut storage = OrdMap::new();
        for entry in rlp.at(3)?.iter() {
            let _previous = storage.insert(entry.val_at(0)?, entry.val_at(1)?);
        }

        Ok(Self {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            code: rlp.val_at(2)?,
            storage,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct State {
    accounts: OrdMap<Address, Account>,
}

impl State {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn nonce(&self, address: Address) -> u64 {
        self.accounts
            .get(&address)
            .map_or(0, |account| account.nonce)
    }

    #[must_use]
    pub fn balance(&self, address: Address) -> U256 {
        self.accounts
            .get(&address)
            .map_or_else(U256::zero, |account| account.balance)
    }

    #[must_use]
    pub fn code(&self, address: Address) -> &[u8] {
        self.accounts
            .get(&address)
            .map_or(&[], |account| account.code.as_slice())
    }

    #[must_use]
    pub fn storage(&self, address: Address, key: H256) -> H256 {
        self.accounts
            .get(&address)
            .and_then(|account| account.storage.get(&key).copied())
            .unwrap_or_default()
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.account_mut(address).nonce = nonce;
    }

    pub fn increment_nonce(&mut self, address: Address) {
        self.account_mut(address).nonce += 1;
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) {
        self.account_mut(address).balance = balance;
    }

    pub fn add_balance(&mut self, address: Address, amount: U256) {
        let account = self.account_mut(address);
        account.balance = account.balance.saturating_add(amount);
    }

    /// Fails instead of wrapping; an underflowing debit is a bug in the
    /// caller's balance check, not a state to persist.
    pub fn sub_balance(&mut self, address: Address, amount: U256) -> Result<()> {
        let account = self.account_mut(address);
        account.balance = account
            .balance
            .checked_sub(amount)
            .ok_or_else(|| anyhow!("balance underflow for {address}"))?;
        Ok(())
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) {
        self.account_mut(address).code = code;
    }

    pub fn set_storage(&mut self, address: Address, key: H256, value: H256) {
        let _previous = self.account_mut(address).storage.insert(key, value);
    }

    /// State commitment. Empty accounts do not contribute, so crediting and
    /// fully draining an account leaves the root unchanged.
    #[must_use]
    pub fn root(&self) -> H256 {
        ordered_root(
            self.accounts
                .iter()
                .filter(|(_, account)| !account.is_empty())
                .map(|(address, account)| AccountEntry(*address, account.clone())),
        )
    }

    /// Persists the full account set under its root. Returns the root.
    pub fn commit(&self, database: &database::Database) -> Result<H256> {
        let root = self.root();
        database.put(state_key(root), rlp::encode(self).as_ref())?;
        Ok(root)
    }

    /// Loads the state committed under `root`.
    pub fn load(database: &database::Database, root: H256) -> Result<Self> {
        let bytes = database
            .get(state_key(root))?
            .ok_or_else(|| anyhow!("no state stored for root {root}"))?;
        rlp::decode(&bytes).map_err(Into::into)
    }

    fn account_mut(&mut self, address: Address) -> &mut Account {
        if !self.accounts.contains_key(&address) {
            let _previous = self.accounts.insert(address, Account::default());
        }
        self.accounts
            .get_mut(&address)
            .expect("account was just inserted")
    }
}

struct AccountEntry(Address, Account);

impl rlp::Encodable for AccountEntry {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(2);
        stream.append(&self.0);
        stream.append(&self.1);
    }
}

impl rlp::Encodable for State {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(self.accounts.len());
        for (address, account) in &self.accounts {
            stream.begin_list(2);
            stream.append(address);
            stream.append(account);
        }
    }
}

impl rlp::Decodable for State {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let mut accounts = OrdMap::new();
        for entry in rlp.iter() {
            let _previous =
                accounts.insert(entry.val_at::<Address>(0)?, entry.val_at::<Account>(1)?);
        }
        Ok(Self { accounts })
    }
}

fn state_key(root: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(STATE_KEY_PREFIX);
    key.extend_from_slice(root.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn root_changes_with_balance_and_is_order_independent() {
        let mut one = State::new();
        one.add_balance(address(1), U256::from(10));
        one.add_balance(address(2), U256::from(20));

        let mut two = State::new();
        two.add_balance(address(2), U256::from(20));
        two.add_balance(address(1), U256::from(10));

        assert_eq!(one.root(), two.root());

        two.add_balance(address(1), U256::from(1));
        assert_ne!(one.root(), two.root());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_writes() {
        let mut state = State::new();
        state.add_balance(address(1), U256::from(5));

        let snapshot = state.clone();
        state.add_balance(address(1), U256::from(5));

        assert_eq!(snapshot.balance(address(1)), U256::from(5));
        assert_eq!(state.balance(address(1)), U256::from(10));
    }

    #[test]
    fn sub_balance_underflow_is_an_error() {
        let mut state = State::new();
        state.add_balance(address(1), U256::from(5));

        assert!(state.sub_balance(address(1), U256::from(6)).is_err());
        assert_eq!(state.balance(address(1)), U256::from(5));
    }

    #[test]
    fn commit_then_load_round_trips() {
        let database = database::Database::in_memory();

        let mut state = State::new();
        state.add_balance(address(7), U256::from(700));
        state.set_nonce(address(7), 3);
        state.set_storage(address(7), H256::repeat_byte(1), H256::repeat_byte(2));

        let root = state.commit(&database).expect("commit succeeds");
        let loaded = State::load(&database, root).expect("state was just committed");

        assert_eq!(loaded, state);
        assert_eq!(loaded.root(), root);
    }
}
