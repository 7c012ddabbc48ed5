//! Swap quotes over exact integers.
//!
//! Amounts are base units of their token. Exchange rates follow the 10^18 convention: a
//! rate `r` means one whole source token buys `r / 10^18` whole destination tokens, so
//! rebasing between decimal scales happens once, in a single floor division.

use crate::amount::{parse_amount_ui_to_base, pow10, MAX_DECIMALS};
use crate::errors::EngineError;
use alloy::primitives::{address, Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use tracing::warn;

/// Address conventionally standing in for the chain's native asset.
pub const NATIVE_TOKEN_SENTINEL: Address = address!("0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");

const RATE_DECIMALS: u32 = 18;
const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    pub is_native: bool,
}

impl Token {
    pub fn native(symbol: impl Into<String>) -> Self {
        Self {
            address: NATIVE_TOKEN_SENTINEL,
            symbol: symbol.into(),
            decimals: 18,
            is_native: true,
        }
    }

    pub fn erc20(
        address: Address,
        symbol: impl Into<String>,
        decimals: u8,
    ) -> Result<Self, EngineError> {
        if decimals > MAX_DECIMALS {
            return Err(EngineError::InvalidInput(format!(
                "token decimals must be <= {MAX_DECIMALS}, got {decimals}"
            )));
        }
        if address == NATIVE_TOKEN_SENTINEL {
            return Err(EngineError::InvalidInput(
                "native sentinel is not an erc20 contract".into(),
            ));
        }
        Ok(Self {
            address,
            symbol: symbol.into(),
            decimals,
            is_native: false,
        })
    }
}

/// Integer slippage tolerance, 0 through 100 percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlippagePercent(u8);

impl SlippagePercent {
    pub fn new(percent: u8) -> Result<Self, EngineError> {
        if percent > 100 {
            return Err(EngineError::InvalidInput(format!(
                "slippage must be 0..=100 percent, got {percent}"
            )));
        }
        Ok(Self(percent))
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// `floor(v * (100 - percent) / 100)`.
    pub fn apply(self, v: U256) -> U256 {
        let keep = U256::from(100_u8 - self.0);
        v.checked_mul(keep)
            .map_or_else(|| v / U256::from(100_u8) * keep, |x| x / U256::from(100_u8))
    }
}

impl TryFrom<u8> for SlippagePercent {
    type Error = EngineError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::new(v)
    }
}

impl From<SlippagePercent> for u8 {
    fn from(v: SlippagePercent) -> Self {
        v.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteFlags {
    /// The oracle had no usable rate; `expected` and `min_acceptable` are zero.
    pub rate_unavailable: bool,
    /// Slippage rounds the minimum to zero while something is expected.
    pub high_slippage_risk: bool,
}

/// An immutable quote. A change of token, amount or rate produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub src: Token,
    pub dest: Token,
    pub src_amount: U256,
    pub fee: U256,
    pub amount_after_fee: U256,
    /// Rate used, 10^18-scaled. Zero when unavailable.
    pub rate: U256,
    pub expected: U256,
    pub min_acceptable: U256,
    pub slippage: SlippagePercent,
    pub fee_bps: u32,
    pub flags: QuoteFlags,
}

impl Quote {
    /// The rate floor handed to a swap contract: the rate reduced by the slippage percent.
    pub fn min_conversion_rate(&self) -> U256 {
        self.slippage.apply(self.rate)
    }
}

/// Rebase `amount` of `src_decimals` through a 10^18-scaled `rate` into `dest_decimals`.
///
/// `amount * rate * 10^dest / (10^src * 10^18)`, evaluated with one floor division.
pub fn convert_with_rate(
    amount: U256,
    rate: U256,
    src_decimals: u8,
    dest_decimals: u8,
) -> Result<U256, EngineError> {
    if src_decimals > MAX_DECIMALS || dest_decimals > MAX_DECIMALS {
        return Err(EngineError::InvalidInput(format!(
            "decimals must be <= {MAX_DECIMALS} (src={src_decimals}, dest={dest_decimals})"
        )));
    }
    let overflow = || EngineError::InvalidInput("quote arithmetic overflow".into());
    let product = amount.checked_mul(rate).ok_or_else(overflow)?;
    let (src, dest) = (u32::from(src_decimals), u32::from(dest_decimals));
    if dest >= src {
        let numerator = product
            .checked_mul(pow10(dest - src))
            .ok_or_else(overflow)?;
        Ok(numerator / pow10(RATE_DECIMALS))
    } else {
        Ok(product / pow10(RATE_DECIMALS + (src - dest)))
    }
}

/// Pure quote computation. `rate == None` or zero yields a flagged zero quote.
pub fn compute_quote(
    src: &Token,
    dest: &Token,
    amount: U256,
    rate: Option<U256>,
    fee_bps: u32,
    slippage: SlippagePercent,
) -> Result<Quote, EngineError> {
    if u64::from(fee_bps) > BPS_DENOMINATOR {
        return Err(EngineError::InvalidInput(format!(
            "fee must be <= {BPS_DENOMINATOR} bps, got {fee_bps}"
        )));
    }
    let fee = amount
        .checked_mul(U256::from(fee_bps))
        .ok_or_else(|| EngineError::InvalidInput("fee arithmetic overflow".into()))?
        / U256::from(BPS_DENOMINATOR);
    let amount_after_fee = amount - fee;

    let rate = rate.unwrap_or(U256::ZERO);
    let rate_unavailable = rate.is_zero();
    let expected = if rate_unavailable {
        U256::ZERO
    } else {
        convert_with_rate(amount_after_fee, rate, src.decimals, dest.decimals)?
    };
    let min_acceptable = slippage.apply(expected);

    Ok(Quote {
        src: src.clone(),
        dest: dest.clone(),
        src_amount: amount,
        fee,
        amount_after_fee,
        rate,
        expected,
        min_acceptable,
        slippage,
        fee_bps,
        flags: QuoteFlags {
            rate_unavailable,
            high_slippage_risk: min_acceptable.is_zero() && !expected.is_zero(),
        },
    })
}

/// External price oracle. Returns the 10^18-scaled rate from `src` to `dest`.
pub trait RateSource: Send + Sync {
    fn rate(&self, src: &Token, dest: &Token)
        -> impl Future<Output = Result<U256, EngineError>> + Send;
}

/// Fixed in-memory rates keyed by token address pair.
#[derive(Debug, Default)]
pub struct StaticRateSource {
    rates: RwLock<HashMap<(Address, Address), U256>>,
}

impl StaticRateSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rate(self, src: Address, dest: Address, rate: U256) -> Self {
        self.set_rate(src, dest, rate);
        self
    }

    pub fn set_rate(&self, src: Address, dest: Address, rate: U256) {
        self.rates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((src, dest), rate);
    }
}

impl RateSource for StaticRateSource {
    async fn rate(&self, src: &Token, dest: &Token) -> Result<U256, EngineError> {
        self.rates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(src.address, dest.address))
            .copied()
            .ok_or(EngineError::RateUnavailable)
    }
}

#[derive(Debug)]
pub struct QuoteEngine<R> {
    rates: R,
    slippage: SlippagePercent,
}

impl<R: RateSource> QuoteEngine<R> {
    pub const fn new(rates: R, slippage: SlippagePercent) -> Self {
        Self { rates, slippage }
    }

    pub const fn slippage(&self) -> SlippagePercent {
        self.slippage
    }

    pub const fn rates(&self) -> &R {
        &self.rates
    }

    /// Quote `amount` base units of `src`. Oracle failures degrade to a flagged quote;
    /// only malformed input is an error.
    pub async fn quote(
        &self,
        src: &Token,
        dest: &Token,
        amount: U256,
        fee_bps: u32,
    ) -> Result<Quote, EngineError> {
        let rate = if amount.is_zero() {
            None
        } else {
            match self.rates.rate(src, dest).await {
                Ok(r) if !r.is_zero() => Some(r),
                Ok(_) => {
                    warn!(src = %src.symbol, dest = %dest.symbol, "oracle returned zero rate");
                    None
                }
                Err(e) => {
                    warn!(src = %src.symbol, dest = %dest.symbol, error = %e, "rate unavailable");
                    None
                }
            }
        };
        let mut q = compute_quote(src, dest, amount, rate, fee_bps, self.slippage)?;
        if amount.is_zero() {
            // Nothing to price; a zero quote is not a rate problem.
            q.flags.rate_unavailable = false;
        }
        Ok(q)
    }

    /// Like [`Self::quote`], with a human amount ("1.5") in `src` units.
    pub async fn quote_ui(
        &self,
        src: &Token,
        dest: &Token,
        amount: &str,
        fee_bps: u32,
    ) -> Result<Quote, EngineError> {
        let base = parse_amount_ui_to_base(amount, src.decimals)
            .map_err(|e| EngineError::InvalidInput(format!("amount {amount:?}: {e}")))?;
        self.quote(src, dest, base, fee_bps).await
    }
}
