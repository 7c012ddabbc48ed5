use super::quantity::{parse_hash, parse_quantity, quantity_from_value, to_data, to_quantity};
use crate::errors::EngineError;
use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockTag {
    Latest,
    #[default]
    Pending,
}

impl BlockTag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Pending => "pending",
        }
    }
}

/// Call object used by `eth_estimateGas`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_price: Option<U256>,
}

impl CallRequest {
    fn to_json(&self) -> Value {
        let mut m = Map::new();
        if let Some(from) = self.from {
            m.insert("from".into(), json!(format!("{from:#x}")));
        }
        if let Some(to) = self.to {
            m.insert("to".into(), json!(format!("{to:#x}")));
        }
        m.insert("value".into(), json!(to_quantity(self.value)));
        if !self.data.is_empty() {
            m.insert("data".into(), json!(to_data(&self.data)));
        }
        if let Some(gp) = self.gas_price {
            m.insert("gasPrice".into(), json!(to_quantity(gp)));
        }
        Value::Object(m)
    }
}

/// One JSON-RPC call, one variant per method the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCall {
    GetTransactionCount { address: Address, block: BlockTag },
    GasPrice,
    EstimateGas(CallRequest),
    SendRawTransaction(Bytes),
    GetTransactionReceipt(B256),
    GetBalance { address: Address, block: BlockTag },
    BlockNumber,
}

impl RpcCall {
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetTransactionCount { .. } => "eth_getTransactionCount",
            Self::GasPrice => "eth_gasPrice",
            Self::EstimateGas(_) => "eth_estimateGas",
            Self::SendRawTransaction(_) => "eth_sendRawTransaction",
            Self::GetTransactionReceipt(_) => "eth_getTransactionReceipt",
            Self::GetBalance { .. } => "eth_getBalance",
            Self::BlockNumber => "eth_blockNumber",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Self::GetTransactionCount { address, block } | Self::GetBalance { address, block } => {
                json!([format!("{address:#x}"), block.as_str()])
            }
            Self::GasPrice | Self::BlockNumber => json!([]),
            Self::EstimateGas(req) => json!([req.to_json()]),
            Self::SendRawTransaction(raw) => json!([to_data(raw)]),
            Self::GetTransactionReceipt(hash) => json!([format!("{hash:#x}")]),
        }
    }

    /// Broadcast is the one call that must never be replayed.
    pub const fn is_idempotent(&self) -> bool {
        !matches!(self, Self::SendRawTransaction(_))
    }

    /// Decode a `result` member according to this call's method.
    pub fn decode(&self, result: &Value) -> Result<RpcResponse, EngineError> {
        Ok(match self {
            Self::GetTransactionCount { .. } => {
                RpcResponse::TransactionCount(quantity_from_value(result)?)
            }
            Self::GasPrice => RpcResponse::GasPrice(quantity_from_value(result)?),
            Self::EstimateGas(_) => RpcResponse::GasEstimate(quantity_from_value(result)?),
            Self::SendRawTransaction(_) => RpcResponse::TransactionHash(parse_hash(result)?),
            Self::GetTransactionReceipt(_) => {
                RpcResponse::Receipt(TxReceipt::from_json(result)?)
            }
            Self::GetBalance { .. } => RpcResponse::Balance(quantity_from_value(result)?),
            Self::BlockNumber => RpcResponse::BlockNumber(quantity_from_value(result)?),
        })
    }
}

/// Typed result of an [`RpcCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    TransactionCount(U256),
    GasPrice(U256),
    GasEstimate(U256),
    TransactionHash(B256),
    Receipt(Option<TxReceipt>),
    Balance(U256),
    BlockNumber(U256),
}

impl RpcResponse {
    pub fn into_quantity(self) -> Result<U256, EngineError> {
        match self {
            Self::TransactionCount(v)
            | Self::GasPrice(v)
            | Self::GasEstimate(v)
            | Self::Balance(v)
            | Self::BlockNumber(v) => Ok(v),
            other => Err(EngineError::Decode(format!(
                "expected quantity response, got {other:?}"
            ))),
        }
    }

    pub fn into_hash(self) -> Result<B256, EngineError> {
        match self {
            Self::TransactionHash(h) => Ok(h),
            other => Err(EngineError::Decode(format!(
                "expected transaction hash, got {other:?}"
            ))),
        }
    }

    pub fn into_receipt(self) -> Result<Option<TxReceipt>, EngineError> {
        match self {
            Self::Receipt(r) => Ok(r),
            other => Err(EngineError::Decode(format!(
                "expected receipt, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// The subset of a mined receipt the tracker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: U256,
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_gas_price: Option<U256>,
}

impl TxReceipt {
    /// `null`, or a receipt without a block number, means "not mined yet".
    pub fn from_json(v: &Value) -> Result<Option<Self>, EngineError> {
        if v.is_null() {
            return Ok(None);
        }
        let obj = v
            .as_object()
            .ok_or_else(|| EngineError::Decode(format!("receipt is not an object: {v}")))?;
        let Some(block_number) = obj.get("blockNumber").filter(|b| !b.is_null()) else {
            return Ok(None);
        };
        let block_number = quantity_from_value(block_number)?;
        let transaction_hash = parse_hash(obj.get("transactionHash").unwrap_or(&Value::Null))?;
        let opt_quantity = |key: &str| -> Result<Option<U256>, EngineError> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(parse_quantity)
                .transpose()
        };
        // Pre-Byzantium receipts carry `root` instead of `status` and cannot signal failure.
        let status = match opt_quantity("status")? {
            Some(s) if s.is_zero() => ReceiptStatus::Failure,
            _ => ReceiptStatus::Success,
        };
        Ok(Some(Self {
            transaction_hash,
            block_number,
            status,
            gas_used: opt_quantity("gasUsed")?,
            effective_gas_price: opt_quantity("effectiveGasPrice")?,
        }))
    }
}
