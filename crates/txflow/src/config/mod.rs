mod loader;

pub use loader::ConfigStore;

use crate::gas::{GasBounds, GasPriceSet, GWEI};
use crate::quote::SlippagePercent;
use alloy::primitives::{Address, U256};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RPC_URL: &str = "https://ethereum-rpc.publicnode.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Primary endpoint. Broadcasts only ever go here.
    pub url: String,
    /// Tried in order after the primary for idempotent reads.
    pub fallback_urls: Vec<String>,
    pub chain_id: u64,
    pub timeout_seconds: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RPC_URL.into(),
            fallback_urls: vec![],
            chain_id: 1,
            timeout_seconds: 20,
        }
    }
}

/// Gas tiers in whole gwei, as written in `config.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasTiersGwei {
    pub low: u64,
    pub standard: u64,
    pub fast: u64,
    pub super_fast: u64,
}

impl Default for GasTiersGwei {
    fn default() -> Self {
        Self {
            low: 10,
            standard: 20,
            fast: 30,
            super_fast: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Cached gas-price service. When unset, tiers are derived from `eth_gasPrice`.
    pub price_url: Option<String>,
    pub poll_seconds: u64,
    pub floor_gwei: u64,
    pub ceiling_gwei: u64,
    /// Served until the first successful poll.
    pub default_tiers: GasTiersGwei,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            price_url: None,
            poll_seconds: 15,
            floor_gwei: 1,
            ceiling_gwei: 500,
            default_tiers: GasTiersGwei::default(),
        }
    }
}

/// Conservative gas limits used when `eth_estimateGas` is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasLimitsConfig {
    pub native_transfer: u64,
    pub token_transfer: u64,
    pub approve: u64,
    pub swap: u64,
    pub contract_call: u64,
}

impl Default for GasLimitsConfig {
    fn default() -> Self {
        Self {
            native_transfer: 120_000,
            token_transfer: 180_000,
            approve: 160_000,
            swap: 660_000,
            contract_call: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    pub slippage_percent: u8,
    pub fee_bps: u32,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            slippage_percent: 3,
            fee_bps: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Swap proxy exposing `trade(...)`.
    pub proxy_address: Option<String>,
    /// Passed through as `walletId` for fee sharing.
    pub wallet_id: String,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            proxy_address: None,
            wallet_id: format!("{:#x}", Address::ZERO),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub poll_seconds: u64,
    /// Polls per record per session before the poller gives up (record stays pending).
    pub max_poll_attempts: Option<u32>,
    /// How long terminal records are kept before eviction.
    pub retention_hours: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_seconds: 10,
            max_poll_attempts: None,
            retention_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TxflowConfig {
    pub rpc: RpcConfig,
    pub gas: GasConfig,
    pub gas_limits: GasLimitsConfig,
    pub quote: QuoteConfig,
    pub swap: SwapConfig,
    pub tracker: TrackerConfig,
}

fn gwei(v: u64) -> U256 {
    U256::from(v) * U256::from(GWEI)
}

impl TxflowConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.rpc.url.trim().is_empty() {
            eyre::bail!("rpc.url must not be empty");
        }
        if self.rpc.chain_id == 0 {
            eyre::bail!("rpc.chain_id must be > 0");
        }
        if self.gas.floor_gwei > self.gas.ceiling_gwei {
            eyre::bail!(
                "gas.floor_gwei ({}) exceeds gas.ceiling_gwei ({})",
                self.gas.floor_gwei,
                self.gas.ceiling_gwei
            );
        }
        if self.gas.poll_seconds == 0 || self.tracker.poll_seconds == 0 {
            eyre::bail!("poll intervals must be > 0 seconds");
        }
        SlippagePercent::new(self.quote.slippage_percent)
            .map_err(|e| eyre::eyre!("quote.slippage_percent: {e}"))?;
        if self.quote.fee_bps > 10_000 {
            eyre::bail!("quote.fee_bps must be <= 10000");
        }
        self.swap_proxy().context("swap.proxy_address")?;
        self.wallet_id().context("swap.wallet_id")?;
        Ok(())
    }

    /// Primary first, then fallbacks.
    pub fn rpc_endpoints(&self) -> Vec<String> {
        std::iter::once(self.rpc.url.clone())
            .chain(self.rpc.fallback_urls.iter().cloned())
            .collect()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.timeout_seconds.max(1))
    }

    pub fn gas_bounds(&self) -> eyre::Result<GasBounds> {
        GasBounds::new(gwei(self.gas.floor_gwei), gwei(self.gas.ceiling_gwei))
            .map_err(|e| eyre::eyre!("gas bounds: {e}"))
    }

    pub fn default_gas_tiers(&self) -> GasPriceSet {
        let t = self.gas.default_tiers;
        GasPriceSet {
            low: gwei(t.low),
            standard: gwei(t.standard),
            fast: gwei(t.fast),
            super_fast: gwei(t.super_fast),
        }
    }

    pub fn gas_poll_interval(&self) -> Duration {
        Duration::from_secs(self.gas.poll_seconds.max(1))
    }

    pub fn tracker_poll_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.poll_seconds.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.tracker.retention_hours.saturating_mul(3600))
    }

    pub fn swap_proxy(&self) -> eyre::Result<Option<Address>> {
        self.swap
            .proxy_address
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(crate::rpc::quantity::parse_address)
            .transpose()
            .map_err(Into::into)
    }

    pub fn wallet_id(&self) -> eyre::Result<Address> {
        Ok(crate::rpc::quantity::parse_address(&self.swap.wallet_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> eyre::Result<()> {
        let cfg = TxflowConfig::default();
        cfg.validate()?;
        let tiers = cfg.default_gas_tiers();
        assert!(
            tiers.low <= tiers.standard
                && tiers.standard <= tiers.fast
                && tiers.fast <= tiers.super_fast,
            "default tiers must be ordered: {tiers:?}"
        );
        assert_eq!(cfg.rpc_endpoints(), vec![DEFAULT_RPC_URL.to_owned()]);
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_values() {
        let mut cfg = TxflowConfig::default();
        cfg.gas.floor_gwei = 600;
        assert!(cfg.validate().is_err(), "floor above ceiling");

        let mut cfg = TxflowConfig::default();
        cfg.quote.slippage_percent = 101;
        assert!(cfg.validate().is_err(), "slippage above 100");

        let mut cfg = TxflowConfig::default();
        cfg.quote.fee_bps = 10_001;
        assert!(cfg.validate().is_err(), "fee above 100%");

        let mut cfg = TxflowConfig::default();
        cfg.rpc.chain_id = 0;
        assert!(cfg.validate().is_err(), "zero chain id");

        let mut cfg = TxflowConfig::default();
        cfg.swap.proxy_address = Some("0xnope".into());
        assert!(cfg.validate().is_err(), "bad proxy address");
    }

    #[test]
    fn partial_toml_fills_defaults() -> eyre::Result<()> {
        let cfg: TxflowConfig = toml::from_str(
            r#"
            [rpc]
            url = "http://127.0.0.1:8545"
            chain_id = 31337

            [gas]
            ceiling_gwei = 200
            "#,
        )?;
        assert_eq!(cfg.rpc.chain_id, 31337);
        assert_eq!(cfg.gas.ceiling_gwei, 200);
        assert_eq!(cfg.gas.poll_seconds, 15, "missing keys keep defaults");
        assert_eq!(cfg.gas_limits, GasLimitsConfig::default());
        Ok(())
    }
}
