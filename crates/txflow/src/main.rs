#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use eyre::Context as _;
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use txflow::amount::{format_amount_base_to_ui_string, parse_amount_ui_to_base};
use txflow::builder::{GasSelection, TransferRequest};
use txflow::config::{ConfigStore, TxflowConfig};
use txflow::gas::{CachedGasPriceApi, GasTier, RpcGasPriceSource};
use txflow::paths::TxflowPaths;
use txflow::quote::{QuoteEngine, SlippagePercent, StaticRateSource, Token};
use txflow::rpc::quantity::parse_address;
use txflow::rpc::HttpTransport;
use txflow::signer::LocalKeySigner;
use txflow::store::{FileStore, PersistentStore};
use txflow::TxEngine;

type Engine = TxEngine<HttpTransport, StaticRateSource>;

const PRIVATE_KEY_ENV: &str = "TXFLOW_PRIVATE_KEY";

#[derive(Parser, Debug)]
#[command(name = "txflow", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print resolved paths (useful for debugging).
    Paths,

    /// Print the effective configuration (file plus environment overrides).
    Config,

    /// Quote a conversion at a given rate. Works offline.
    Quote {
        /// Human amount of the source token, e.g. "1.5".
        #[arg(long)]
        amount: String,
        /// Destination units per source unit, e.g. "2000.5".
        #[arg(long)]
        rate: String,
        /// `native` or an ERC-20 address.
        #[arg(long, default_value = "native")]
        src: String,
        #[arg(long, default_value_t = 18)]
        src_decimals: u8,
        /// `native` or an ERC-20 address.
        #[arg(long)]
        dest: String,
        #[arg(long, default_value_t = 18)]
        dest_decimals: u8,
        /// Overrides `quote.fee_bps`.
        #[arg(long)]
        fee_bps: Option<u32>,
        /// Overrides `quote.slippage_percent`.
        #[arg(long)]
        slippage: Option<u8>,
    },

    /// Fetch gas tiers once from the configured source and print them.
    Gas,

    /// Print an account's nonce state, optionally reconciling it with the chain first.
    Nonce {
        address: String,
        #[arg(long, default_value_t = false)]
        sync: bool,
    },

    /// List tracked transactions.
    Txs {
        /// Only this account. Defaults to every account with records.
        #[arg(long)]
        address: Option<String>,
    },

    /// Remove a settled or never-broadcast transaction record.
    Dismiss { address: String, id: uuid::Uuid },

    /// Transfer native or ERC-20 value, signed with the key in `TXFLOW_PRIVATE_KEY`.
    Send {
        #[arg(long)]
        to: String,
        /// Human amount, e.g. "0.25".
        #[arg(long)]
        amount: String,
        /// ERC-20 address; omit for the native asset.
        #[arg(long)]
        token: Option<String>,
        #[arg(long, default_value_t = 18)]
        decimals: u8,
        /// low | standard | fast | super-fast
        #[arg(long, default_value = "standard")]
        tier: String,
        /// Explicit gas price in gwei (clamped to the configured bounds). Overrides `--tier`.
        #[arg(long)]
        gas_price_gwei: Option<String>,
        /// Poll until the transaction settles.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },

    /// Run the gas poller and resume tracking of pending transactions until Ctrl-C.
    Watch,
}

fn init_logging(paths: &TxflowPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("txflow.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn print_json(v: &impl Serialize) -> eyre::Result<()> {
    use std::io::Write as _;
    let s = serde_json::to_string_pretty(v).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

fn parse_token(s: &str, decimals: u8) -> eyre::Result<Token> {
    if s.trim().eq_ignore_ascii_case("native") {
        if decimals != 18 {
            eyre::bail!("the native asset has 18 decimals");
        }
        return Ok(Token::native("NATIVE"));
    }
    let address = parse_address(s)?;
    Ok(Token::erc20(address, format!("{address:#x}"), decimals)?)
}

fn build_engine(paths: &TxflowPaths, cfg: &TxflowConfig) -> eyre::Result<Engine> {
    let store: Arc<dyn PersistentStore> = Arc::new(FileStore::open(paths.state_dir())?);
    let transport = HttpTransport::new(Some(cfg.rpc_timeout()))?;
    TxEngine::new(transport, cfg, store, StaticRateSource::new())
}

#[derive(Debug, Serialize)]
struct QuoteView {
    src: Token,
    dest: Token,
    src_amount: String,
    fee: String,
    amount_after_fee: String,
    rate: String,
    expected: String,
    expected_ui: String,
    min_acceptable: String,
    min_acceptable_ui: String,
    min_conversion_rate: String,
    slippage_percent: u8,
    fee_bps: u32,
    rate_unavailable: bool,
    high_slippage_risk: bool,
}

#[expect(clippy::too_many_arguments, reason = "mirrors the CLI flags")]
async fn run_quote(
    cfg: &TxflowConfig,
    amount: &str,
    rate: &str,
    src: &str,
    src_decimals: u8,
    dest: &str,
    dest_decimals: u8,
    fee_bps: Option<u32>,
    slippage: Option<u8>,
) -> eyre::Result<()> {
    let src = parse_token(src, src_decimals)?;
    let dest = parse_token(dest, dest_decimals)?;
    let rate = parse_amount_ui_to_base(rate, 18).context("parse --rate")?;
    let slippage = SlippagePercent::new(slippage.unwrap_or(cfg.quote.slippage_percent))?;
    let engine = QuoteEngine::new(
        StaticRateSource::new().with_rate(src.address, dest.address, rate),
        slippage,
    );
    let q = engine
        .quote_ui(&src, &dest, amount, fee_bps.unwrap_or(cfg.quote.fee_bps))
        .await?;
    print_json(&QuoteView {
        src_amount: q.src_amount.to_string(),
        fee: q.fee.to_string(),
        amount_after_fee: q.amount_after_fee.to_string(),
        rate: q.rate.to_string(),
        expected: q.expected.to_string(),
        expected_ui: format_amount_base_to_ui_string(q.expected, q.dest.decimals)?,
        min_acceptable: q.min_acceptable.to_string(),
        min_acceptable_ui: format_amount_base_to_ui_string(q.min_acceptable, q.dest.decimals)?,
        min_conversion_rate: q.min_conversion_rate().to_string(),
        slippage_percent: q.slippage.get(),
        fee_bps: q.fee_bps,
        rate_unavailable: q.flags.rate_unavailable,
        high_slippage_risk: q.flags.high_slippage_risk,
        src: q.src,
        dest: q.dest,
    })
}

async fn run_gas(engine: &Engine, cfg: &TxflowConfig) -> eyre::Result<()> {
    let outcome = match cfg.gas.price_url.as_deref() {
        Some(url) => {
            let source = CachedGasPriceApi::new(url, cfg.rpc_timeout())?;
            engine.gas().poll_once(&source).await
        }
        None => {
            let source = RpcGasPriceSource::new(Arc::clone(engine.rpc()));
            engine.gas().poll_once(&source).await
        }
    };
    tracing::debug!(?outcome, "gas poll finished");
    print_json(&engine.gas().snapshot())
}

#[expect(clippy::too_many_arguments, reason = "mirrors the CLI flags")]
async fn run_send(
    engine: &Engine,
    to: &str,
    amount: &str,
    token: Option<&str>,
    decimals: u8,
    tier: &str,
    gas_price_gwei: Option<&str>,
    wait: bool,
) -> eyre::Result<()> {
    let key = std::env::var(PRIVATE_KEY_ENV)
        .with_context(|| format!("{PRIVATE_KEY_ENV} must hold the sender's private key"))?;
    let signer = LocalKeySigner::from_hex(&key)?;
    let token = match token {
        Some(t) => parse_token(t, decimals)?,
        None => parse_token("native", decimals)?,
    };
    let gas = match gas_price_gwei {
        Some(g) => GasSelection::Custom(
            parse_amount_ui_to_base(g, 9).context("parse --gas-price-gwei")?,
        ),
        None => GasSelection::Tier(tier.parse::<GasTier>()?),
    };
    let req = TransferRequest {
        from: signer.address(),
        token: token.clone(),
        to: parse_address(to)?,
        amount: parse_amount_ui_to_base(amount, token.decimals).context("parse --amount")?,
        gas,
    };
    let rec = engine.transfer(&req, &signer).await?;
    if !wait {
        return print_json(&rec);
    }
    let (_stop, rx) = tokio::sync::watch::channel(false);
    Arc::clone(engine.tracker()).poll_until_settled(rec.id, rx).await;
    print_json(&engine.tracker().get(rec.id)?)
}

async fn run_watch(engine: &Engine, cfg: &TxflowConfig) -> eyre::Result<()> {
    let session = match cfg.gas.price_url.as_deref() {
        Some(url) => {
            engine.start_session(Arc::new(CachedGasPriceApi::new(url, cfg.rpc_timeout())?))?
        }
        None => engine.start_session(Arc::new(RpcGasPriceSource::new(Arc::clone(engine.rpc()))))?,
    };
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    session.stop().await;
    Ok(())
}

fn accounts_for(engine: &Engine, address: Option<&str>) -> eyre::Result<Vec<Address>> {
    match address {
        Some(a) => Ok(vec![parse_address(a)?]),
        None => Ok(engine.tracker().known_accounts()?),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = TxflowPaths::discover()?;
    paths.ensure_private_dirs().context("create txflow dirs")?;
    let _log_guard = init_logging(&paths);
    let cfg = ConfigStore::new(&paths).load_or_init_default()?;

    match cli.cmd {
        Command::Paths => print_json(&paths),
        Command::Config => print_json(&cfg),
        Command::Quote {
            amount,
            rate,
            src,
            src_decimals,
            dest,
            dest_decimals,
            fee_bps,
            slippage,
        } => {
            run_quote(
                &cfg,
                &amount,
                &rate,
                &src,
                src_decimals,
                &dest,
                dest_decimals,
                fee_bps,
                slippage,
            )
            .await
        }
        Command::Gas => run_gas(&build_engine(&paths, &cfg)?, &cfg).await,
        Command::Nonce { address, sync } => {
            let engine = build_engine(&paths, &cfg)?;
            let address = parse_address(&address)?;
            let snap = if sync {
                engine
                    .nonces()
                    .resync_from_chain(address, engine.rpc())
                    .await?
            } else {
                engine.nonces().snapshot(address)?
            };
            print_json(&snap)
        }
        Command::Txs { address } => {
            let engine = build_engine(&paths, &cfg)?;
            let mut out = vec![];
            for account in accounts_for(&engine, address.as_deref())? {
                out.extend(engine.tracker().list(account)?);
            }
            out.sort_by_key(|r| r.created_at_ms);
            print_json(&out)
        }
        Command::Dismiss { address, id } => {
            let engine = build_engine(&paths, &cfg)?;
            let removed = engine.tracker().dismiss(parse_address(&address)?, id)?;
            print_json(&removed)
        }
        Command::Send {
            to,
            amount,
            token,
            decimals,
            tier,
            gas_price_gwei,
            wait,
        } => {
            let engine = build_engine(&paths, &cfg)?;
            run_send(
                &engine,
                &to,
                &amount,
                token.as_deref(),
                decimals,
                &tier,
                gas_price_gwei.as_deref(),
                wait,
            )
            .await
        }
        Command::Watch => run_watch(&build_engine(&paths, &cfg)?, &cfg).await,
    }
}
