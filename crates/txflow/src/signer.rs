//! Signing is an external capability; the engine only ever sees raw signed bytes.

use crate::errors::EngineError;
use crate::tx::TransactionDescriptor;
use alloy::{
    consensus::{SignableTransaction as _, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718 as _,
    primitives::{Bytes, TxKind, B256},
    signers::{local::PrivateKeySigner, SignerSync as _},
};
use std::future::Future;
use std::str::FromStr as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

pub trait TransactionSigner: Send + Sync {
    fn sign(
        &self,
        tx: &TransactionDescriptor,
    ) -> impl Future<Output = Result<SignedTransaction, EngineError>> + Send;
}

/// Signs EIP-155 legacy transactions with an in-process key.
#[derive(Debug, Clone)]
pub struct LocalKeySigner {
    key: PrivateKeySigner,
}

impl LocalKeySigner {
    pub const fn new(key: PrivateKeySigner) -> Self {
        Self { key }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, EngineError> {
        PrivateKeySigner::from_str(hex_key.trim())
            .map(Self::new)
            .map_err(|e| EngineError::Signing(format!("invalid private key: {e}")))
    }

    pub fn address(&self) -> alloy::primitives::Address {
        self.key.address()
    }

    fn sign_sync(&self, tx: &TransactionDescriptor) -> Result<SignedTransaction, EngineError> {
        if tx.from != self.key.address() {
            return Err(EngineError::Signing(format!(
                "descriptor is from {:#x}, key is {:#x}",
                tx.from,
                self.key.address()
            )));
        }
        let gas_price = u128::try_from(tx.gas_price)
            .map_err(|_e| EngineError::Signing(format!("gas price too large: {}", tx.gas_price)))?;

        let legacy = TxLegacy {
            chain_id: Some(tx.chain_id),
            nonce: tx.nonce,
            gas_price,
            gas_limit: tx.gas_limit,
            to: tx.to.map_or(TxKind::Create, TxKind::Call),
            value: tx.value,
            input: tx.data.clone(),
        };
        let sig = self
            .key
            .sign_hash_sync(&legacy.signature_hash())
            .map_err(|e| EngineError::Signing(format!("sign legacy: {e}")))?;
        let signed = legacy.into_signed(sig);
        let hash = *signed.hash();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();
        Ok(SignedTransaction {
            raw: Bytes::from(raw),
            hash,
        })
    }
}

impl TransactionSigner for LocalKeySigner {
    async fn sign(&self, tx: &TransactionDescriptor) -> Result<SignedTransaction, EngineError> {
        self.sign_sync(tx)
    }
}
