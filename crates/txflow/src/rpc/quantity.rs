//! Hex quantity codec for the JSON-RPC wire format.
//!
//! Quantities are decoded straight into `U256`; nothing passes through a fixed-width
//! or floating-point intermediate.

use crate::errors::EngineError;
use alloy::primitives::{Address, Bytes, B256, U256};
use serde_json::Value;
use std::str::FromStr as _;

pub fn parse_quantity(s: &str) -> Result<U256, EngineError> {
    let t = s.trim();
    let digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .ok_or_else(|| EngineError::Decode(format!("quantity missing 0x prefix: {t}")))?;
    if digits.is_empty() {
        return Err(EngineError::Decode("empty quantity".into()));
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::Decode(format!("invalid hex quantity: {t}")));
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| EngineError::Decode(format!("quantity out of range ({t}): {e}")))
}

pub fn quantity_from_value(v: &Value) -> Result<U256, EngineError> {
    v.as_str()
        .ok_or_else(|| EngineError::Decode(format!("expected hex string, got {v}")))
        .and_then(parse_quantity)
}

pub fn to_quantity(v: U256) -> String {
    format!("0x{v:x}")
}

pub fn to_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn parse_hash(v: &Value) -> Result<B256, EngineError> {
    let s = v
        .as_str()
        .ok_or_else(|| EngineError::Decode(format!("expected hash string, got {v}")))?;
    B256::from_str(s.trim()).map_err(|e| EngineError::Decode(format!("invalid hash {s}: {e}")))
}

pub fn parse_address(s: &str) -> Result<Address, EngineError> {
    let t = s.trim();
    let hex_part = t.strip_prefix("0x").unwrap_or(t);
    if hex_part.len() != 40 {
        return Err(EngineError::InvalidInput(format!(
            "expected 20-byte hex address: {t}"
        )));
    }
    let bytes = hex::decode(hex_part)
        .map_err(|e| EngineError::InvalidInput(format!("invalid address {t}: {e}")))?;
    Ok(Address::from_slice(&bytes))
}

pub fn parse_data(s: &str) -> Result<Bytes, EngineError> {
    let t = s.trim();
    let hex_part = t
        .strip_prefix("0x")
        .ok_or_else(|| EngineError::Decode(format!("data missing 0x prefix: {t}")))?;
    hex::decode(hex_part)
        .map(Bytes::from)
        .map_err(|e| EngineError::Decode(format!("invalid hex data: {e}")))
}
