use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine error taxonomy.
///
/// Read-path callers (quotes, gas tiers) degrade on these instead of surfacing them;
/// write-path callers (broadcast) always get them back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    /// The node already holds this exact signed transaction.
    #[error("transaction already known: {0}")]
    AlreadyKnown(String),

    #[error("exchange rate unavailable")]
    RateUnavailable,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Classify a node-reported JSON-RPC error object.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let m = message.to_lowercase();
        if m.contains("already known") || m.contains("known transaction") {
            return Self::AlreadyKnown(message);
        }
        if m.contains("nonce too low")
            || m.contains("nonce is too low")
            || m.contains("replacement transaction underpriced")
        {
            return Self::NonceConflict(message);
        }
        if m.contains("insufficient funds") {
            return Self::InsufficientBalance(message);
        }
        Self::Rpc { code, message }
    }

    /// Only connectivity failures are worth retrying, and only for idempotent calls.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Rpc { .. } => "rpc_error",
            Self::InsufficientBalance(_) => "insufficient_balance",
            Self::NonceConflict(_) => "nonce_conflict",
            Self::AlreadyKnown(_) => "already_known",
            Self::RateUnavailable => "rate_unavailable",
            Self::Signing(_) => "signing_error",
            Self::Store(_) => "store_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidInput(_) => "invalid_input",
            Self::Decode(_) => "decode_error",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Persisted form of a failure, shown to the user after restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rpc_code: Option<i64>,
}

impl From<&EngineError> for ErrorRecord {
    fn from(e: &EngineError) -> Self {
        let rpc_code = match e {
            EngineError::Rpc { code, .. } => Some(*code),
            _ => None,
        };
        Self {
            code: e.code().to_owned(),
            message: e.to_string(),
            rpc_code,
        }
    }
}
