use alloy::primitives::U256;
use eyre::Context as _;

/// Largest token decimals the engine accepts.
pub const MAX_DECIMALS: u8 = 18;

/// `10^exp` as a `U256`. `exp` stays well below the 77-digit limit for every caller.
pub fn pow10(exp: u32) -> U256 {
    U256::from(10_u64).pow(U256::from(exp))
}

pub fn parse_amount_base(s: &str) -> eyre::Result<U256> {
    let s = s.trim();
    if s.is_empty() {
        eyre::bail!("empty amount");
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        eyre::bail!("base amount must be a non-negative integer");
    }
    s.parse::<U256>().context("parse base amount")
}

/// Parse a human amount ("1.5") into base units of a token with `decimals` decimals.
pub fn parse_amount_ui_to_base(s: &str, decimals: u8) -> eyre::Result<U256> {
    let s = s.trim();
    if s.is_empty() {
        eyre::bail!("empty amount");
    }
    if decimals > MAX_DECIMALS {
        eyre::bail!("decimals too large: {decimals}");
    }

    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));

    if whole.starts_with('-') {
        eyre::bail!("amount must be non-negative");
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        eyre::bail!("invalid amount: {s}");
    }
    if whole.is_empty() && frac.is_empty() {
        eyre::bail!("invalid amount: {s}");
    }

    let width = usize::from(decimals);
    if frac.len() > width {
        eyre::bail!("too many decimal places for token (decimals={decimals})");
    }

    let whole_v = if whole.is_empty() {
        U256::ZERO
    } else {
        whole.parse::<U256>().context("parse whole")?
    };
    let frac_v = if frac.is_empty() {
        U256::ZERO
    } else {
        let padded = format!("{frac:0<width$}");
        padded.parse::<U256>().context("parse fractional")?
    };

    whole_v
        .checked_mul(pow10(u32::from(decimals)))
        .and_then(|x| x.checked_add(frac_v))
        .ok_or_else(|| eyre::eyre!("amount overflow"))
}

/// Format a base-unit integer amount into a UI decimal string without using floats.
///
/// Examples:
/// - base=1500000, decimals=6 => "1.5"
/// - base=1, decimals=6 => "0.000001"
pub fn format_amount_base_to_ui_string(base: U256, decimals: u8) -> eyre::Result<String> {
    if decimals > MAX_DECIMALS {
        eyre::bail!("decimals too large: {decimals}");
    }
    if decimals == 0 {
        return Ok(base.to_string());
    }
    let scale = pow10(u32::from(decimals));
    let whole = base / scale;
    let frac = base % scale;
    if frac.is_zero() {
        return Ok(whole.to_string());
    }
    let frac_s = format!("{:0>width$}", frac.to_string(), width = usize::from(decimals));
    Ok(format!("{whole}.{}", frac_s.trim_end_matches('0')))
}
