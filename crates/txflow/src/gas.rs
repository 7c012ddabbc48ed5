//! Gas-price tiers: sources, normalization and the polling coordinator.

use crate::amount::parse_amount_ui_to_base;
use crate::errors::EngineError;
use crate::rpc::{RpcBatchClient, RpcTransport};
use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const GWEI: u64 = 1_000_000_000;
const GWEI_DECIMALS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasTier {
    Low,
    Standard,
    Fast,
    SuperFast,
}

impl GasTier {
    pub const ALL: [Self; 4] = [Self::Low, Self::Standard, Self::Fast, Self::SuperFast];

    /// Percent of the node's `eth_gasPrice` used for each tier.
    const fn node_multiplier_percent(self) -> u64 {
        match self {
            Self::Low => 100,
            Self::Standard => 125,
            Self::Fast => 150,
            Self::SuperFast => 200,
        }
    }
}

impl std::str::FromStr for GasTier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "low" | "slow" => Ok(Self::Low),
            "standard" | "default" | "average" => Ok(Self::Standard),
            "fast" => Ok(Self::Fast),
            "superfast" | "fastest" => Ok(Self::SuperFast),
            other => Err(EngineError::InvalidInput(format!("unknown gas tier: {other}"))),
        }
    }
}

/// Four tier prices in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasPriceSet {
    pub low: U256,
    pub standard: U256,
    pub fast: U256,
    pub super_fast: U256,
}

impl GasPriceSet {
    pub const fn get(&self, tier: GasTier) -> U256 {
        match tier {
            GasTier::Low => self.low,
            GasTier::Standard => self.standard,
            GasTier::Fast => self.fast,
            GasTier::SuperFast => self.super_fast,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.low <= self.standard && self.standard <= self.fast && self.fast <= self.super_fast
    }

    /// Clamp every tier into `bounds`, then lift any tier that sits below a cheaper one.
    pub fn normalize(self, bounds: GasBounds) -> Self {
        let low = bounds.clamp(self.low);
        let standard = bounds.clamp(self.standard).max(low);
        let fast = bounds.clamp(self.fast).max(standard);
        let super_fast = bounds.clamp(self.super_fast).max(fast);
        Self {
            low,
            standard,
            fast,
            super_fast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasBounds {
    floor: U256,
    ceiling: U256,
}

impl GasBounds {
    pub fn new(floor: U256, ceiling: U256) -> Result<Self, EngineError> {
        if floor > ceiling {
            return Err(EngineError::InvalidInput(format!(
                "gas floor {floor} exceeds ceiling {ceiling}"
            )));
        }
        Ok(Self { floor, ceiling })
    }

    pub const fn floor(&self) -> U256 {
        self.floor
    }

    pub const fn ceiling(&self) -> U256 {
        self.ceiling
    }

    pub fn clamp(&self, v: U256) -> U256 {
        v.clamp(self.floor, self.ceiling)
    }
}

/// What callers read. Always populated: the configured defaults until the first poll lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GasSnapshot {
    pub tiers: GasPriceSet,
    /// `None` while still serving the configured defaults.
    pub updated_at_ms: Option<i64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// An external supplier of raw (un-clamped) tier prices.
pub trait GasPriceSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<GasPriceSet, EngineError>> + Send;
}

/// HTTP service publishing cached tier prices in gwei.
///
/// Accepts `{"low": .., "standard": .., "fast": .., "superFast": ..}`, optionally wrapped
/// in `{"data": {...}}`. Values may be numbers or decimal strings.
#[derive(Debug, Clone)]
pub struct CachedGasPriceApi {
    client: reqwest::Client,
    url: String,
}

impl CachedGasPriceApi {
    pub fn new(url: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        use eyre::Context as _;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build gas price http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn gwei_field(obj: &Value, keys: &[&str]) -> Result<Option<U256>, EngineError> {
    let Some(v) = keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let s = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(EngineError::Decode(format!(
                "gas tier {} is not numeric: {other}",
                keys.first().copied().unwrap_or_default()
            )))
        }
    };
    parse_amount_ui_to_base(&s, GWEI_DECIMALS)
        .map(Some)
        .map_err(|e| EngineError::Decode(format!("gas tier {s:?}: {e}")))
}

/// Decode a cached gas-price payload into wei tiers. A missing super-fast tier is `2 × fast`.
pub fn parse_cached_gas_response(body: &Value) -> Result<GasPriceSet, EngineError> {
    let obj = body.get("data").filter(|d| d.is_object()).unwrap_or(body);
    if !obj.is_object() {
        return Err(EngineError::Decode(format!("gas price payload is not an object: {body}")));
    }
    let require = |keys: &[&str]| -> Result<U256, EngineError> {
        gwei_field(obj, keys)?.ok_or_else(|| {
            EngineError::Decode(format!("gas price payload missing {}", keys.join("/")))
        })
    };
    let low = require(&["low", "slow"])?;
    let standard = require(&["standard", "default", "average"])?;
    let fast = require(&["fast"])?;
    let super_fast = match gwei_field(obj, &["superFast", "super_fast", "fastest"])? {
        Some(v) => v,
        None => fast.saturating_mul(U256::from(2_u64)),
    };
    Ok(GasPriceSet {
        low,
        standard,
        fast,
        super_fast,
    })
}

impl GasPriceSource for CachedGasPriceApi {
    async fn fetch(&self) -> Result<GasPriceSet, EngineError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("gas price request: {e}")))?;
        if !resp.status().is_success() {
            return Err(EngineError::Transport(format!(
                "gas price http status {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Decode(format!("gas price body: {e}")))?;
        parse_cached_gas_response(&body)
    }
}

/// Tiers derived from the node's `eth_gasPrice`.
#[derive(Debug)]
pub struct RpcGasPriceSource<T> {
    rpc: Arc<RpcBatchClient<T>>,
}

impl<T> RpcGasPriceSource<T> {
    pub const fn new(rpc: Arc<RpcBatchClient<T>>) -> Self {
        Self { rpc }
    }
}

impl<T: RpcTransport> GasPriceSource for RpcGasPriceSource<T> {
    async fn fetch(&self) -> Result<GasPriceSet, EngineError> {
        let base = self.rpc.gas_price().await?;
        let scaled = |t: GasTier| {
            base.saturating_mul(U256::from(t.node_multiplier_percent())) / U256::from(100_u64)
        };
        Ok(GasPriceSet {
            low: scaled(GasTier::Low),
            standard: scaled(GasTier::Standard),
            fast: scaled(GasTier::Fast),
            super_fast: scaled(GasTier::SuperFast),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Updated,
    /// A previous poll was still outstanding.
    Skipped,
    /// The source failed; the previous tiers are kept.
    Failed,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct GasPriceCoordinator {
    bounds: GasBounds,
    interval: Duration,
    state: RwLock<GasSnapshot>,
    in_flight: AtomicBool,
}

impl GasPriceCoordinator {
    pub fn new(bounds: GasBounds, defaults: GasPriceSet, interval: Duration) -> Self {
        Self {
            bounds,
            interval,
            state: RwLock::new(GasSnapshot {
                tiers: defaults.normalize(bounds),
                updated_at_ms: None,
                consecutive_failures: 0,
                last_error: None,
            }),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> GasSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tiers(&self) -> GasPriceSet {
        self.state.read().unwrap_or_else(PoisonError::into_inner).tiers
    }

    pub fn price(&self, tier: GasTier) -> U256 {
        self.tiers().get(tier)
    }

    /// User-supplied prices never leave `[floor, ceiling]`.
    pub fn clamp_custom(&self, price: U256) -> U256 {
        let clamped = self.bounds.clamp(price);
        if clamped != price {
            warn!(requested = %price, used = %clamped, "custom gas price clamped");
        }
        clamped
    }

    pub const fn bounds(&self) -> GasBounds {
        self.bounds
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// One poll. No-op while another poll is outstanding.
    pub async fn poll_once<S: GasPriceSource>(&self, source: &S) -> PollOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("gas poll already in flight; skipping tick");
            return PollOutcome::Skipped;
        };

        match source.fetch().await {
            Ok(raw) => {
                let tiers = raw.normalize(self.bounds);
                let mut st = self.state.write().unwrap_or_else(PoisonError::into_inner);
                *st = GasSnapshot {
                    tiers,
                    updated_at_ms: Some(chrono::Utc::now().timestamp_millis()),
                    consecutive_failures: 0,
                    last_error: None,
                };
                debug!(
                    low = %tiers.low,
                    standard = %tiers.standard,
                    fast = %tiers.fast,
                    super_fast = %tiers.super_fast,
                    "gas tiers updated"
                );
                PollOutcome::Updated
            }
            Err(e) => {
                let mut st = self.state.write().unwrap_or_else(PoisonError::into_inner);
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.last_error = Some(e.to_string());
                warn!(
                    error = %e,
                    failures = st.consecutive_failures,
                    "gas poll failed; keeping last tiers"
                );
                PollOutcome::Failed
            }
        }
    }

    /// Poll on every interval tick until `shutdown` flips to `true` or its sender is gone.
    ///
    /// Polls run as child tasks so a slow source never delays the ticker; ticks that land
    /// while one is outstanding fall through the single-flight guard.
    pub async fn run<S: GasPriceSource>(
        self: Arc<Self>,
        source: Arc<S>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut polls = JoinSet::new();
        info!(interval = ?self.interval, "gas poller started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    while polls.try_join_next().is_some() {}
                    let me = Arc::clone(&self);
                    let src = Arc::clone(&source);
                    polls.spawn(async move {
                        me.poll_once(src.as_ref()).await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        polls.abort_all();
        info!("gas poller stopped");
    }
}
