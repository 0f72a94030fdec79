//! Transaction execution: `apply(tx, state) → (state', receipt, gas_used)`.
//!
//! Contract execution proper is an external collaborator. What remains is
//! the part both chains agree on byte for byte: intrinsic gas, nonce and
//! balance accounting, and the receipt stream a block commits to.

use state_store::State;
use thiserror::Error;
use types::{ordered_root, Gas, Receipt, ReceiptStatus, Transaction, H256, U256};

pub const TX_GAS: Gas = 21_000;
pub const TX_DATA_GAS_PER_BYTE: Gas = 68;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error("wrong nonce: expected {expected}, got {got}")]
    WrongNonce { expected: u64, got: u64 },
    #[error("gas limit {limit} below intrinsic gas {intrinsic}")]
    GasLimitTooLow { limit: Gas, intrinsic: Gas },
    #[error("sender cannot cover the gas fee")]
    InsufficientFundsForGas,
    #[error("block gas limit {limit} exceeded at {used}")]
    BlockGasExceeded { limit: Gas, used: Gas },
}

#[must_use]
pub fn intrinsic_gas(transaction: &Transaction) -> Gas {
    let data_gas = transaction.body().data.len() as Gas * TX_DATA_GAS_PER_BYTE;
    TX_GAS + data_gas
}

/// Applies one transaction. Nonce and gas-fee failures poison the whole
/// block and surface as errors; a value transfer the sender cannot afford
/// merely produces a failed receipt, the way a reverted call would.
pub fn apply_transaction(
    state: &mut State,
    transaction: &Transaction,
    chain_id: u64,
) -> Result<Receipt, ExecutionError> {
    let sender = transaction
        .sender(chain_id)
        .map_err(|_| ExecutionError::InvalidSignature)?;

    let expected = state.nonce(sender);
    if transaction.nonce() != expected {
        return Err(ExecutionError::WrongNonce {
            expected,
            got: transaction.nonce(),
        });
    }

    let intrinsic = intrinsic_gas(transaction);
    if transaction.gas_limit() < intrinsic {
        return Err(ExecutionError::GasLimitTooLow {
            limit: transaction.gas_limit(),
            intrinsic,
        });
    }

    let gas_fee = U256::from(intrinsic) * transaction.gas_price();
    if state.balance(sender) < gas_fee {
        return Err(ExecutionError::InsufficientFundsForGas);
    }

    state.increment_nonce(sender);
    state
        .sub_balance(sender, gas_fee)
        .expect("balance was checked against the gas fee above");

    let status = if state.balance(sender) >= transaction.value() {
        state
            .sub_balance(sender, transaction.value())
            .expect("balance was checked against the value above");
        if let Some(recipient) = transaction.body().to {
            state.add_balance(recipient, transaction.value());
        }
        ReceiptStatus::Success
    } else {
        ReceiptStatus::Failed
    };

    Ok(Receipt {
        transaction_hash: transaction.hash(),
        status,
        gas_used: intrinsic,
        cumulative_gas_used: 0,
        logs: vec![],
    })
}

#[derive(Debug)]
pub struct Outcome {
    pub state: State,
    pub receipts: Vec<Receipt>,
    pub gas_used: Gas,
}

impl Outcome {
    #[must_use]
    pub fn state_root(&self) -> H256 {
        self.state.root()
    }

    #[must_use]
    pub fn receipts_root(&self) -> H256 {
        ordered_root(self.receipts.iter().cloned())
    }
}

/// Executes a block's transactions against the parent state.
pub fn execute_block(
    parent_state: &State,
    transactions: &[Transaction],
    block_gas_limit: Gas,
    chain_id: u64,
) -> Result<Outcome, ExecutionError> {
    let mut state = parent_state.clone();
    let mut receipts = Vec::with_capacity(transactions.len());
    let mut gas_used = 0;

    for transaction in transactions {
        let mut receipt = apply_transaction(&mut state, transaction, chain_id)?;

        gas_used += receipt.gas_used;
        if gas_used > block_gas_limit {
            return Err(ExecutionError::BlockGasExceeded {
                limit: block_gas_limit,
                used: gas_used,
            });
        }

        receipt.cumulative_gas_used = gas_used;
        receipts.push(receipt);
    }

    Ok(Outcome {
        state,
        receipts,
        gas_used,
    })
}

#[cfg(test)]
mod tests {
    use types::{Address, TransactionBody};

    use super::*;

    const CHAIN_ID: u64 = 400;

    fn key() -> crypto::SecretKey {
        crypto::SecretKey::from_slice(&[0x21; 32]).expect("constant scalar is valid")
    }

    fn transfer(nonce: u64, value: u64) -> Transaction {
        let body = TransactionBody {
            nonce,
            gas_price: U256::from(1),
            gas_limit: 21_000,
            to: Some(Address::repeat_byte(0xbb)),
            value: U256::from(value),
            data: vec![],
        };
        Transaction::sign(body, &key(), CHAIN_ID).expect("signing succeeds")
    }

    fn funded_state(balance: u64) -> State {
        let mut state = State::new();
        state.add_balance(key().address(), U256::from(balance));
        state
    }

    #[test]
    fn successful_transfer_moves_value_and_burns_fee() {
        let state = funded_state(1_000_000);
        let outcome = execute_block(&state, &[transfer(0, 100)], 30_000_000, CHAIN_ID)
            .expect("transaction is valid");

        assert_eq!(outcome.receipts.len(), 1);
        assert_eq!(outcome.receipts[0].status, ReceiptStatus::Success);
        assert_eq!(outcome.gas_used, TX_GAS);
        assert_eq!(
            outcome.state.balance(Address::repeat_byte(0xbb)),
            U256::from(100),
        );
        assert_eq!(
            outcome.state.balance(key().address()),
            U256::from(1_000_000 - 100 - 21_000),
        );
        assert_eq!(outcome.state.nonce(key().address()), 1);
    }

    #[test]
    fn unaffordable_value_yields_failed_receipt_but_charges_gas() {
        let state = funded_state(22_000);
        let outcome = execute_block(&state, &[transfer(0, 5_000)], 30_000_000, CHAIN_ID)
            .expect("gas is affordable, so the block is valid");

        assert_eq!(outcome.receipts[0].status, ReceiptStatus::Failed);
        assert_eq!(
            outcome.state.balance(key().address()),
            U256::from(22_000 - 21_000),
        );
        assert!(outcome
            .state
            .balance(Address::repeat_byte(0xbb))
            .is_zero());
    }

    #[test]
    fn wrong_nonce_poisons_the_block() {
        let state = funded_state(1_000_000);
        let error = execute_block(&state, &[transfer(1, 1)], 30_000_000, CHAIN_ID)
            .expect_err("nonce 1 does not match state nonce 0");

        assert!(matches!(
            error,
            ExecutionError::WrongNonce {
                expected: 0,
                got: 1,
            },
        ));
    }

    #[test]
    fn nonces_in_a_block_form_a_contiguous_sequence() {
        let state = funded_state(1_000_000);
        let transactions = vec![transfer(0, 1), transfer(1, 1), transfer(2, 1)];

        let outcome = execute_block(&state, &transactions, 30_000_000, CHAIN_ID)
            .expect("nonces are contiguous from the state nonce");
        assert_eq!(outcome.state.nonce(key().address()), 3);
        assert_eq!(outcome.receipts.last().map(|r| r.cumulative_gas_used), Some(3 * TX_GAS));
    }

    #[test]
    fn block_gas_limit_is_enforced() {
        let state = funded_state(1_000_000);
        let error = execute_block(
            &state,
            &[transfer(0, 1), transfer(1, 1)],
            30_000,
            CHAIN_ID,
        )
        .expect_err("two transfers exceed the 30k block gas limit");

        assert!(matches!(error, ExecutionError::BlockGasExceeded { .. }));
    }
}
