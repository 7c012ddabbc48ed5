//! Turns transfer, approval, swap and contract-call intents into unsigned descriptors.
//!
//! One batch fetches the pending nonce count, a gas estimate and the sender's balance.
//! Estimation and balance failures degrade to defaults; the nonce is drawn last, after
//! every check that can reject the request has passed.

use crate::config::GasLimitsConfig;
use crate::errors::EngineError;
use crate::gas::{GasPriceCoordinator, GasTier};
use crate::nonce::NonceTracker;
use crate::quote::{Quote, Token};
use crate::rpc::{BlockTag, CallRequest, RpcBatchClient, RpcCall, RpcResponse, RpcTransport};
use crate::tx::{TransactionDescriptor, TxCategory};
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall as _;
use std::sync::Arc;
use tracing::{debug, warn};

sol! {
    interface IERC20 {
        function transfer(address to, uint256 value) external returns (bool);
        function approve(address spender, uint256 value) external returns (bool);
    }

    interface ISwapProxy {
        function trade(
            address src,
            uint256 srcAmount,
            address dest,
            address destAddress,
            uint256 maxDestAmount,
            uint256 minConversionRate,
            address walletId
        ) external payable returns (uint256);
    }
}

const GAS_ESTIMATE_BUFFER_PERCENT: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasSelection {
    Tier(GasTier),
    /// Clamped to the coordinator's floor and ceiling before use.
    Custom(U256),
}

impl Default for GasSelection {
    fn default() -> Self {
        Self::Tier(GasTier::Standard)
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from: Address,
    pub token: Token,
    pub to: Address,
    /// Base units of `token`.
    pub amount: U256,
    pub gas: GasSelection,
}

#[derive(Debug, Clone)]
pub struct ApproveRequest {
    pub from: Address,
    pub token: Token,
    pub spender: Address,
    pub amount: U256,
    pub gas: GasSelection,
}

#[derive(Debug, Clone)]
pub struct ContractCallRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas: GasSelection,
    /// Skips estimation when set.
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub chain_id: u64,
    pub gas_limits: GasLimitsConfig,
    pub swap_proxy: Option<Address>,
    pub wallet_id: Address,
    pub check_balance: bool,
}

/// A request reduced to transaction fields, before gas and nonce are resolved.
#[derive(Debug)]
struct Draft {
    category: TxCategory,
    from: Address,
    to: Option<Address>,
    value: U256,
    data: Bytes,
    gas: GasSelection,
    gas_limit: Option<u64>,
}

#[derive(Debug)]
pub struct TransactionBuilder<T> {
    rpc: Arc<RpcBatchClient<T>>,
    nonces: Arc<NonceTracker>,
    gas: Arc<GasPriceCoordinator>,
    settings: BuilderSettings,
}

impl<T: RpcTransport> TransactionBuilder<T> {
    pub const fn new(
        rpc: Arc<RpcBatchClient<T>>,
        nonces: Arc<NonceTracker>,
        gas: Arc<GasPriceCoordinator>,
        settings: BuilderSettings,
    ) -> Self {
        Self {
            rpc,
            nonces,
            gas,
            settings,
        }
    }

    pub const fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    pub fn resolve_gas_price(&self, sel: GasSelection) -> U256 {
        match sel {
            GasSelection::Tier(t) => self.gas.price(t),
            GasSelection::Custom(p) => self.gas.clamp_custom(p),
        }
    }

    const fn default_gas_limit(&self, category: TxCategory) -> u64 {
        let l = &self.settings.gas_limits;
        match category {
            TxCategory::NativeTransfer => l.native_transfer,
            TxCategory::TokenTransfer => l.token_transfer,
            TxCategory::Approve => l.approve,
            TxCategory::Swap => l.swap,
            TxCategory::ContractCall => l.contract_call,
        }
    }

    pub async fn build_transfer(
        &self,
        req: &TransferRequest,
    ) -> Result<TransactionDescriptor, EngineError> {
        let draft = if req.token.is_native {
            Draft {
                category: TxCategory::NativeTransfer,
                from: req.from,
                to: Some(req.to),
                value: req.amount,
                data: Bytes::new(),
                gas: req.gas,
                gas_limit: None,
            }
        } else {
            let data = IERC20::transferCall {
                to: req.to,
                value: req.amount,
            }
            .abi_encode();
            Draft {
                category: TxCategory::TokenTransfer,
                from: req.from,
                to: Some(req.token.address),
                value: U256::ZERO,
                data: data.into(),
                gas: req.gas,
                gas_limit: None,
            }
        };
        self.assemble(draft).await
    }

    pub async fn build_approve(
        &self,
        req: &ApproveRequest,
    ) -> Result<TransactionDescriptor, EngineError> {
        if req.token.is_native {
            return Err(EngineError::InvalidInput(
                "native asset needs no approval".into(),
            ));
        }
        let data = IERC20::approveCall {
            spender: req.spender,
            value: req.amount,
        }
        .abi_encode();
        self.assemble(Draft {
            category: TxCategory::Approve,
            from: req.from,
            to: Some(req.token.address),
            value: U256::ZERO,
            data: data.into(),
            gas: req.gas,
            gas_limit: None,
        })
        .await
    }

    /// A swap through the configured proxy, paying out to `from`.
    ///
    /// ERC-20 sources must already be approved for the proxy.
    pub async fn build_swap(
        &self,
        from: Address,
        quote: &Quote,
        gas: GasSelection,
    ) -> Result<TransactionDescriptor, EngineError> {
        let proxy = self
            .settings
            .swap_proxy
            .ok_or_else(|| EngineError::InvalidInput("no swap proxy configured".into()))?;
        if quote.flags.rate_unavailable {
            return Err(EngineError::RateUnavailable);
        }
        if quote.src_amount.is_zero() {
            return Err(EngineError::InvalidInput("cannot swap a zero amount".into()));
        }
        if quote.flags.high_slippage_risk {
            warn!(expected = %quote.expected, "swap minimum rounds to zero");
        }

        let data = ISwapProxy::tradeCall {
            src: quote.src.address,
            srcAmount: quote.src_amount,
            dest: quote.dest.address,
            destAddress: from,
            maxDestAmount: U256::from(1_u8) << 255_usize,
            minConversionRate: quote.min_conversion_rate(),
            walletId: self.settings.wallet_id,
        }
        .abi_encode();
        let value = if quote.src.is_native {
            quote.src_amount
        } else {
            U256::ZERO
        };
        self.assemble(Draft {
            category: TxCategory::Swap,
            from,
            to: Some(proxy),
            value,
            data: data.into(),
            gas,
            gas_limit: None,
        })
        .await
    }

    pub async fn build_contract_call(
        &self,
        req: &ContractCallRequest,
    ) -> Result<TransactionDescriptor, EngineError> {
        self.assemble(Draft {
            category: TxCategory::ContractCall,
            from: req.from,
            to: req.to,
            value: req.value,
            data: req.data.clone(),
            gas: req.gas,
            gas_limit: req.gas_limit,
        })
        .await
    }

    /// Hand back the nonce of a descriptor that will never be broadcast.
    pub fn abandon(&self, d: &TransactionDescriptor) -> Result<bool, EngineError> {
        let rewound = self.nonces.release(d.from, d.nonce)?;
        debug!(from = %d.from, nonce = d.nonce, rewound, "descriptor abandoned");
        Ok(rewound)
    }

    async fn assemble(&self, draft: Draft) -> Result<TransactionDescriptor, EngineError> {
        let gas_price = self.resolve_gas_price(draft.gas);

        let mut calls = vec![RpcCall::GetTransactionCount {
            address: draft.from,
            block: BlockTag::Pending,
        }];
        if draft.gas_limit.is_none() {
            calls.push(RpcCall::EstimateGas(CallRequest {
                from: Some(draft.from),
                to: draft.to,
                value: draft.value,
                data: draft.data.clone(),
                gas_price: Some(gas_price),
            }));
        }
        if self.settings.check_balance {
            calls.push(RpcCall::GetBalance {
                address: draft.from,
                block: BlockTag::Latest,
            });
        }

        let mut count = None;
        let mut estimate = None;
        let mut balance = None;
        match self.rpc.batch(&calls).await {
            Ok(results) => {
                for (call, r) in calls.iter().zip(results) {
                    let v = Some(r.and_then(RpcResponse::into_quantity));
                    match call {
                        RpcCall::GetTransactionCount { .. } => count = v,
                        RpcCall::EstimateGas(_) => estimate = v,
                        RpcCall::GetBalance { .. } => balance = v,
                        _ => {}
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, from = %draft.from, "build batch failed; using local state");
                count = Some(Err(e));
            }
        }

        match count {
            Some(Ok(c)) => {
                let c = u64::try_from(c)
                    .map_err(|_e| EngineError::Decode(format!("nonce count overflows u64: {c}")))?;
                self.nonces.resync(draft.from, c)?;
            }
            Some(Err(e)) if !self.nonces.is_synced(draft.from)? => return Err(e),
            Some(Err(e)) => {
                warn!(
                    error = %e,
                    from = %draft.from,
                    "nonce count unavailable; using local counter"
                );
            }
            None => {}
        }

        let gas_limit = match (draft.gas_limit, estimate) {
            (Some(l), _) => l,
            (None, Some(Ok(est))) => match u64::try_from(est) {
                Ok(v) => v.saturating_mul(GAS_ESTIMATE_BUFFER_PERCENT) / 100,
                Err(_) => self.default_gas_limit(draft.category),
            },
            (None, Some(Err(e))) => {
                let fallback = self.default_gas_limit(draft.category);
                warn!(
                    error = %e,
                    category = ?draft.category,
                    fallback,
                    "gas estimate failed; using default limit"
                );
                fallback
            }
            (None, None) => self.default_gas_limit(draft.category),
        };

        let mut descriptor = TransactionDescriptor {
            category: draft.category,
            from: draft.from,
            to: draft.to,
            value: draft.value,
            data: draft.data,
            gas_price,
            gas_limit,
            nonce: 0,
            chain_id: self.settings.chain_id,
        };

        match balance {
            Some(Ok(bal)) if bal < descriptor.max_cost() => {
                return Err(EngineError::InsufficientBalance(format!(
                    "balance {bal} < required {}",
                    descriptor.max_cost()
                )));
            }
            Some(Err(e)) => warn!(error = %e, "balance check skipped"),
            _ => {}
        }

        descriptor.nonce = self.nonces.next_nonce(draft.from)?;
        debug!(
            from = %descriptor.from,
            nonce = descriptor.nonce,
            gas_limit,
            gas_price = %gas_price,
            category = ?descriptor.category,
            "descriptor built"
        );
        Ok(descriptor)
    }
}
