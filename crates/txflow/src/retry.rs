use crate::errors::EngineError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Number of full rounds. Each round tries every endpoint once.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter (`0..=jitter_max_ms`) added to each backoff sleep.
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
            jitter_max_ms: 250,
        }
    }
}

impl BackoffConfig {
    /// A single attempt against the first endpoint only.
    pub const fn once() -> Self {
        Self {
            rounds: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        }
    }
}

fn compute_backoff_delay(cfg: &BackoffConfig, round: usize) -> Duration {
    let shift = u32::try_from(round.min(16)).unwrap_or(16_u32);
    let pow2 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(pow2).min(max_ms);
    let jitter = if cfg!(test) || cfg.jitter_max_ms == 0 {
        0
    } else {
        // Avoid holding a non-Send RNG across await points.
        let range = cfg.jitter_max_ms.saturating_add(1);
        rand::random::<u64>() % range
    };
    Duration::from_millis(ms.saturating_add(jitter))
}

/// Try `op(endpoint)` across all endpoints, in order, for `rounds` rounds, sleeping with
/// exponential backoff + jitter between rounds.
///
/// Only retryable (transport) failures move on to the next endpoint; a node-reported
/// error is returned as-is since another endpoint would answer the same way.
pub async fn try_endpoints_with_backoff<I, T, Fut>(
    endpoints: &[I],
    cfg: &BackoffConfig,
    mut op: impl FnMut(&I) -> Fut + Send,
    context_label: &'static str,
) -> Result<T, EngineError>
where
    I: Sync + std::fmt::Display,
    Fut: std::future::Future<Output = Result<T, EngineError>> + Send,
{
    if endpoints.is_empty() {
        return Err(EngineError::Transport("no endpoints configured".into()));
    }
    if cfg.rounds == 0 {
        return Err(EngineError::InvalidInput(
            "invalid backoff config: rounds=0".into(),
        ));
    }

    let mut last_err: Option<EngineError> = None;

    for round in 0..cfg.rounds {
        for endpoint in endpoints {
            match op(endpoint).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        %endpoint,
                        round,
                        error = %e,
                        label = context_label,
                        "endpoint failed"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if round + 1 < cfg.rounds {
            tokio::time::sleep(compute_backoff_delay(cfg, round)).await;
        }
    }

    Err(match last_err {
        Some(EngineError::Transport(msg)) => {
            EngineError::Transport(format!("{context_label}: {msg}"))
        }
        Some(e) => e,
        None => EngineError::Transport(format!("{context_label}: unknown error")),
    })
}
