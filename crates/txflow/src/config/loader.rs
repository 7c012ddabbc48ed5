use super::TxflowConfig;
use crate::paths::TxflowPaths;
use eyre::Context as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

/// Environment overrides applied on every load; they are never written back.
fn apply_env_overrides(cfg: &mut TxflowConfig) {
    fn apply_env(var: &str, setter: impl FnOnce(&str)) {
        if let Ok(u) = std::env::var(var) {
            let t = u.trim();
            if !t.is_empty() {
                setter(t);
            }
        }
    }

    apply_env("TXFLOW_RPC_URL", |v| v.clone_into(&mut cfg.rpc.url));
    apply_env("TXFLOW_GAS_PRICE_URL", |v| {
        cfg.gas.price_url = Some(v.to_owned());
    });
    apply_env("TXFLOW_CHAIN_ID", |v| match v.parse::<u64>() {
        Ok(n) if n > 0 => cfg.rpc.chain_id = n,
        _ => tracing::warn!(value = v, "ignoring invalid TXFLOW_CHAIN_ID"),
    });
    apply_env("TXFLOW_GAS_POLL_SECONDS", |v| match v.parse::<u64>() {
        Ok(n) if n > 0 => cfg.gas.poll_seconds = n,
        _ => tracing::warn!(value = v, "ignoring invalid TXFLOW_GAS_POLL_SECONDS"),
    });
}

impl ConfigStore {
    pub fn new(paths: &TxflowPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<TxflowConfig> {
        let mut cfg = if self.path.exists() {
            let s = std::fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            let cfg = TxflowConfig::default();
            self.save(&cfg)?;
            cfg
        };
        apply_env_overrides(&mut cfg);
        cfg.validate().context("invalid config")?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &TxflowConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes()).context("write config.toml")
    }
}
