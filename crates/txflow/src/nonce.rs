//! Per-address nonce assignment.
//!
//! Each address owns an independent counter behind its own lock, so submissions from one
//! account are serialized while different accounts never contend. The counter and the
//! set of broadcast-but-unmined nonces are persisted after every change.

use crate::errors::EngineError;
use crate::rpc::{RpcBatchClient, RpcTransport};
use crate::store::{load_json, update_json, PersistentStore};
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const NAMESPACE: &str = "nonce";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NonceState {
    next: u64,
    /// Broadcast and not yet mined or failed.
    in_flight: BTreeSet<u64>,
    /// Drawn by a builder but not broadcast yet. Process-local: a crash abandons them.
    #[serde(skip)]
    reserved: BTreeSet<u64>,
    /// Whether this process has reconciled with the chain at least once.
    #[serde(skip)]
    synced: bool,
    #[serde(default)]
    updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceSnapshot {
    pub address: Address,
    pub next: u64,
    pub in_flight: Vec<u64>,
    pub reserved: Vec<u64>,
    pub synced: bool,
}

/// Nonce counters shared by every process that opens the same store.
///
/// `next` and `in_flight` live in the store and are re-read under its write lock on every
/// change, so concurrent processes never draw the same nonce. Only `reserved` and
/// `synced` are held in memory.
#[derive(Debug)]
pub struct NonceTracker {
    store: Arc<dyn PersistentStore>,
    local: Mutex<HashMap<Address, Arc<Mutex<NonceState>>>>,
}

fn poisoned(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(format!("nonce lock poisoned: {e}"))
}

impl NonceTracker {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            local: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, address: Address) -> Result<Arc<Mutex<NonceState>>, EngineError> {
        let mut local = self.local.lock().map_err(poisoned)?;
        Ok(Arc::clone(local.entry(address).or_default()))
    }

    /// Apply `f` to the stored state merged with this process's reservations, and persist
    /// it. A failed write leaves the in-memory reservations untouched.
    fn update<R>(
        &self,
        address: Address,
        f: impl FnOnce(&mut NonceState) -> R,
    ) -> Result<R, EngineError> {
        let entry = self.entry(address)?;
        let mut local = entry.lock().map_err(poisoned)?;
        let (out, next) = update_json(
            self.store.as_ref(),
            NAMESPACE,
            address,
            |s: &mut NonceState| {
                s.reserved.clone_from(&local.reserved);
                s.synced = local.synced;
                let r = f(s);
                s.updated_at_ms = chrono::Utc::now().timestamp_millis();
                Ok((r, s.clone()))
            },
        )?;
        *local = next;
        Ok(out)
    }

    /// Draw the next nonce. Concurrent callers on one address get consecutive values.
    pub fn next_nonce(&self, address: Address) -> Result<u64, EngineError> {
        let n = self.update(address, |s| {
            let n = s.next;
            s.next = s.next.saturating_add(1);
            s.reserved.insert(n);
            n
        })?;
        debug!(%address, nonce = n, "nonce drawn");
        Ok(n)
    }

    /// The nonce's transaction reached the node's pool.
    pub fn mark_in_flight(&self, address: Address, nonce: u64) -> Result<(), EngineError> {
        self.update(address, |s| {
            s.reserved.remove(&nonce);
            s.in_flight.insert(nonce);
        })
    }

    /// The nonce's transaction was mined, or its broadcast was rejected.
    pub fn clear_in_flight(&self, address: Address, nonce: u64) -> Result<(), EngineError> {
        self.update(address, |s| {
            s.reserved.remove(&nonce);
            s.in_flight.remove(&nonce);
        })
    }

    /// Return a drawn nonce whose descriptor was abandoned before broadcast.
    ///
    /// Only the most recently drawn nonce can be handed back; otherwise the counter keeps
    /// its value and the gap is left for the next chain resync to settle. Returns whether
    /// the counter moved back.
    pub fn release(&self, address: Address, nonce: u64) -> Result<bool, EngineError> {
        self.update(address, |s| {
            s.reserved.remove(&nonce);
            let rewind = s.next == nonce.saturating_add(1) && !s.in_flight.contains(&nonce);
            if rewind {
                s.next = nonce;
            }
            rewind
        })
    }

    /// Reconcile with the chain's pending transaction count.
    pub fn resync(&self, address: Address, pending: u64) -> Result<NonceSnapshot, EngineError> {
        self.reconcile(address, pending, None)
    }

    /// Reconcile with the chain's pending count and, when known, its mined count.
    ///
    /// The counter moves up whenever the chain is ahead. It only moves down when nothing
    /// is drawn or in flight, since lowering it would hand out a nonce already in use.
    /// In-flight markers are dropped only once the mined count has passed them; a
    /// transaction still sitting in the pool keeps its marker.
    pub fn reconcile(
        &self,
        address: Address,
        pending: u64,
        mined: Option<u64>,
    ) -> Result<NonceSnapshot, EngineError> {
        let before = self.update(address, |s| {
            let before = s.next;
            if let Some(mined) = mined {
                s.in_flight.retain(|n| *n >= mined);
            }
            s.reserved.retain(|n| *n >= pending);
            if pending > s.next
                || (pending < s.next && s.in_flight.is_empty() && s.reserved.is_empty())
            {
                s.next = pending;
            }
            s.synced = true;
            before
        })?;
        let snap = self.snapshot(address)?;
        if snap.next != before {
            info!(%address, from = before, to = snap.next, pending, "nonce resynced");
        }
        Ok(snap)
    }

    pub async fn resync_from_chain<T: RpcTransport>(
        &self,
        address: Address,
        rpc: &RpcBatchClient<T>,
    ) -> Result<NonceSnapshot, EngineError> {
        let (pending, mined) = rpc.transaction_counts(address).await?;
        let narrow = |count: U256| {
            u64::try_from(count).map_err(|_e| {
                EngineError::Decode(format!("transaction count overflows u64: {count}"))
            })
        };
        self.reconcile(address, narrow(pending)?, Some(narrow(mined)?))
    }

    pub fn is_synced(&self, address: Address) -> Result<bool, EngineError> {
        let entry = self.entry(address)?;
        let local = entry.lock().map_err(poisoned)?;
        Ok(local.synced)
    }

    pub fn snapshot(&self, address: Address) -> Result<NonceSnapshot, EngineError> {
        let entry = self.entry(address)?;
        let local = entry.lock().map_err(poisoned)?;
        let stored: NonceState =
            load_json(self.store.as_ref(), NAMESPACE, address)?.unwrap_or_default();
        Ok(NonceSnapshot {
            address,
            next: stored.next,
            in_flight: stored.in_flight.iter().copied().collect(),
            reserved: local.reserved.iter().copied().collect(),
            synced: local.synced,
        })
    }
}
