use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// What a descriptor does, which also picks its fallback gas limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxCategory {
    NativeTransfer,
    TokenTransfer,
    Approve,
    Swap,
    ContractCall,
}

/// An unsigned legacy transaction with every field resolved.
///
/// The nonce is drawn once when the descriptor is built. It is only reused if the
/// descriptor is abandoned before broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDescriptor {
    pub category: TxCategory,
    pub from: Address,
    /// `None` deploys a contract.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub nonce: u64,
    pub chain_id: u64,
}

impl TransactionDescriptor {
    /// Upper bound on native spend: `value + gas_limit * gas_price`.
    pub fn max_cost(&self) -> U256 {
        U256::from(self.gas_limit)
            .saturating_mul(self.gas_price)
            .saturating_add(self.value)
    }
}
