//! Transaction lifecycle engine for EVM chains.
//!
//! Builds unsigned transactions with chain-consistent nonces and bounded gas prices,
//! broadcasts them once through a batching JSON-RPC client, and tracks them to a terminal
//! state across restarts. Swap quotes are computed in integer base units.
#![recursion_limit = "256"]
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

pub mod amount;
pub mod builder;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fsutil;
pub mod gas;
pub mod nonce;
pub mod paths;
pub mod quote;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod signer;
pub mod store;
pub mod tracker;
pub mod tx;

pub use engine::TxEngine;
pub use errors::EngineError;
