//! Wires the components into one explicitly-constructed context.
//!
//! Nothing here is global: every component is built from a [`TxflowConfig`] and a store,
//! and handed to the pieces that need it.

use crate::builder::{
    ApproveRequest, BuilderSettings, ContractCallRequest, GasSelection, TransactionBuilder,
    TransferRequest,
};
use crate::config::TxflowConfig;
use crate::errors::EngineError;
use crate::gas::{GasPriceCoordinator, GasPriceSource};
use crate::nonce::NonceTracker;
use crate::quote::{Quote, QuoteEngine, RateSource, SlippagePercent, Token};
use crate::rpc::{RpcBatchClient, RpcTransport};
use crate::session::Session;
use crate::signer::TransactionSigner;
use crate::store::PersistentStore;
use crate::tracker::{TrackedTransaction, TrackerSettings, TransactionStatusTracker};
use crate::tx::TransactionDescriptor;
use alloy::primitives::{Address, U256};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct TxEngine<T, R> {
    rpc: Arc<RpcBatchClient<T>>,
    nonces: Arc<NonceTracker>,
    gas: Arc<GasPriceCoordinator>,
    builder: TransactionBuilder<T>,
    tracker: Arc<TransactionStatusTracker<T>>,
    quotes: QuoteEngine<R>,
    fee_bps: u32,
}

impl<T: RpcTransport, R: RateSource> TxEngine<T, R> {
    pub fn new(
        transport: T,
        cfg: &TxflowConfig,
        store: Arc<dyn PersistentStore>,
        rates: R,
    ) -> eyre::Result<Self> {
        cfg.validate()?;
        let rpc = Arc::new(RpcBatchClient::new(transport, cfg.rpc_endpoints()));
        let nonces = Arc::new(NonceTracker::new(Arc::clone(&store)));
        let gas = Arc::new(GasPriceCoordinator::new(
            cfg.gas_bounds()?,
            cfg.default_gas_tiers(),
            cfg.gas_poll_interval(),
        ));
        let builder = TransactionBuilder::new(
            Arc::clone(&rpc),
            Arc::clone(&nonces),
            Arc::clone(&gas),
            BuilderSettings {
                chain_id: cfg.rpc.chain_id,
                gas_limits: cfg.gas_limits,
                swap_proxy: cfg.swap_proxy()?,
                wallet_id: cfg.wallet_id()?,
                check_balance: true,
            },
        );
        let tracker = Arc::new(TransactionStatusTracker::new(
            Arc::clone(&rpc),
            Arc::clone(&nonces),
            store,
            TrackerSettings {
                poll_interval: cfg.tracker_poll_interval(),
                max_poll_attempts: cfg.tracker.max_poll_attempts,
                retention: cfg.retention(),
            },
        ));
        let quotes = QuoteEngine::new(rates, SlippagePercent::new(cfg.quote.slippage_percent)?);
        Ok(Self {
            rpc,
            nonces,
            gas,
            builder,
            tracker,
            quotes,
            fee_bps: cfg.quote.fee_bps,
        })
    }

    pub const fn rpc(&self) -> &Arc<RpcBatchClient<T>> {
        &self.rpc
    }

    pub const fn nonces(&self) -> &Arc<NonceTracker> {
        &self.nonces
    }

    pub const fn gas(&self) -> &Arc<GasPriceCoordinator> {
        &self.gas
    }

    pub const fn builder(&self) -> &TransactionBuilder<T> {
        &self.builder
    }

    pub const fn tracker(&self) -> &Arc<TransactionStatusTracker<T>> {
        &self.tracker
    }

    pub const fn quotes(&self) -> &QuoteEngine<R> {
        &self.quotes
    }

    /// Quote with the configured fee.
    pub async fn quote(
        &self,
        src: &Token,
        dest: &Token,
        amount: U256,
    ) -> Result<Quote, EngineError> {
        self.quotes.quote(src, dest, amount, self.fee_bps).await
    }

    /// Broadcast `descriptor` and start tracking it.
    ///
    /// When the node reports a nonce conflict the counter is resynced from the chain and
    /// the descriptor is re-sent once under a fresh nonce. Any other failure is returned
    /// as is; broadcasts are never blindly retried.
    pub async fn send<S: TransactionSigner>(
        &self,
        descriptor: TransactionDescriptor,
        signer: &S,
    ) -> Result<TrackedTransaction, EngineError> {
        let from = descriptor.from;
        match self.tracker.submit(descriptor.clone(), signer).await {
            Err(EngineError::NonceConflict(msg)) => {
                warn!(%from, nonce = descriptor.nonce, reason = %msg, "nonce conflict; resyncing");
                self.nonces.resync_from_chain(from, &self.rpc).await?;
                let nonce = self.nonces.next_nonce(from)?;
                info!(%from, nonce, "rebroadcasting with fresh nonce");
                self.tracker
                    .submit(TransactionDescriptor { nonce, ..descriptor }, signer)
                    .await
            }
            other => other,
        }
    }

    pub async fn transfer<S: TransactionSigner>(
        &self,
        req: &TransferRequest,
        signer: &S,
    ) -> Result<TrackedTransaction, EngineError> {
        let d = self.builder.build_transfer(req).await?;
        self.send(d, signer).await
    }

    pub async fn approve<S: TransactionSigner>(
        &self,
        req: &ApproveRequest,
        signer: &S,
    ) -> Result<TrackedTransaction, EngineError> {
        let d = self.builder.build_approve(req).await?;
        self.send(d, signer).await
    }

    pub async fn swap<S: TransactionSigner>(
        &self,
        from: Address,
        quote: &Quote,
        gas: GasSelection,
        signer: &S,
    ) -> Result<TrackedTransaction, EngineError> {
        let d = self.builder.build_swap(from, quote, gas).await?;
        self.send(d, signer).await
    }

    pub async fn contract_call<S: TransactionSigner>(
        &self,
        req: &ContractCallRequest,
        signer: &S,
    ) -> Result<TrackedTransaction, EngineError> {
        let d = self.builder.build_contract_call(req).await?;
        self.send(d, signer).await
    }

    /// Start background work: the gas poller, plus a receipt poller for every persisted
    /// `Pending` record. Expired terminal records are evicted on the way.
    pub fn start_session<S: GasPriceSource>(
        &self,
        gas_source: Arc<S>,
    ) -> Result<Session, EngineError> {
        let session = Session::new();
        session.spawn_gas_poller(Arc::clone(&self.gas), gas_source);

        let now = chrono::Utc::now().timestamp_millis();
        let mut resumed = 0_usize;
        for account in self.tracker.known_accounts()? {
            self.tracker.evict_expired(account, now)?;
            for id in self.tracker.resume(account)? {
                if session.track(&self.tracker, id) {
                    resumed += 1;
                }
            }
        }
        info!(resumed, "session started");
        Ok(session)
    }
}
