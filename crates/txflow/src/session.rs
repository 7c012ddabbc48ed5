//! Owner of every background task for one engine session.
//!
//! Pollers are spawned here, never detached: `stop` signals them through one shutdown
//! channel and joins them, aborting whatever outlives the grace period.

use crate::gas::{GasPriceCoordinator, GasPriceSource};
use crate::rpc::RpcTransport;
use crate::tracker::TransactionStatusTracker;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Session {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Returns `false`, dropping `fut` unpolled, once `stop` has begun.
    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopping() {
            debug!("session stopping; task refused");
            return false;
        }
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
        true
    }

    pub fn spawn_gas_poller<S: GasPriceSource>(
        &self,
        gas: Arc<GasPriceCoordinator>,
        source: Arc<S>,
    ) -> bool {
        self.spawn(gas.run(source, self.shutdown.subscribe()))
    }

    /// Poll `id` until it settles or the session stops.
    pub fn track<T: RpcTransport>(
        &self,
        tracker: &Arc<TransactionStatusTracker<T>>,
        id: Uuid,
    ) -> bool {
        debug!(%id, "tracking transaction");
        self.spawn(Arc::clone(tracker).poll_until_settled(id, self.shutdown.subscribe()))
    }

    /// Tasks still running.
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn stop(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            self.shutdown.send_replace(true);
            std::mem::take(&mut *guard)
        };
        let total = tasks.len();

        let drained = tokio::time::timeout(STOP_GRACE, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        warn!(error = %e, "session task failed");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "session tasks outlived grace period; aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!(tasks = total, "session stopped");
    }
}
