//! Transaction state machine, broadcast and receipt polling.
//!
//! ```text
//! Created -> Broadcasting -> Pending -> Success | Failed
//!                        \-> BroadcastError
//! ```
//!
//! Records are persisted per account after every transition, so a restarted process can
//! pick up polling for anything still `Pending`.

use crate::errors::{EngineError, ErrorRecord};
use crate::nonce::NonceTracker;
use crate::rpc::{ReceiptStatus, RpcBatchClient, RpcTransport, TxReceipt};
use crate::signer::TransactionSigner;
use crate::store::{load_json, update_json, PersistentStore};
use crate::tx::TransactionDescriptor;
use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NAMESPACE: &str = "txs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Created,
    Broadcasting,
    Pending,
    Success,
    Failed,
    BroadcastError,
}

impl TxState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::BroadcastError)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Broadcasting)
                | (Self::Broadcasting, Self::Pending | Self::BroadcastError)
                | (Self::Pending, Self::Success | Self::Failed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Broadcasting => "broadcasting",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::BroadcastError => "broadcast_error",
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<B256>,
    pub descriptor: TransactionDescriptor,
    pub state: TxState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TxReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub poll_attempts: u32,
}

impl TrackedTransaction {
    fn new(descriptor: TransactionDescriptor, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            hash: None,
            descriptor,
            state: TxState::Created,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            terminal_at_ms: None,
            receipt: None,
            error: None,
            poll_attempts: 0,
        }
    }

    pub const fn account(&self) -> Address {
        self.descriptor.from
    }

    fn transition(&mut self, next: TxState, now_ms: i64) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(id = %self.id, from = %self.state, to = %next, "transaction transition");
        self.state = next;
        self.updated_at_ms = now_ms;
        if next.is_terminal() {
            self.terminal_at_ms = Some(now_ms);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    /// Per-session cap on receipt polls for one record. Reaching it leaves the record
    /// `Pending`; the next session starts counting again.
    pub max_poll_attempts: Option<u32>,
    /// Terminal records older than this are evicted.
    pub retention: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: None,
            retention: Duration::from_secs(72 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Another poll for this record was outstanding.
    Skipped,
    /// Not in `Pending`; nothing to poll.
    NotPending(TxState),
    StillPending,
    Finalized(TxState),
}

struct PollGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> PollGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Result<Option<Self>, EngineError> {
        let mut g = set.lock().map_err(poisoned)?;
        Ok(g.insert(id).then_some(Self { set, id }))
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut g) = self.set.lock() {
            g.remove(&self.id);
        }
    }
}

fn poisoned(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(format!("tracker lock poisoned: {e}"))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Records live in the store and are re-read under its write lock on every change, so a
/// `watch` process and a `send` process can share one state directory.
#[derive(Debug)]
pub struct TransactionStatusTracker<T> {
    rpc: Arc<RpcBatchClient<T>>,
    nonces: Arc<NonceTracker>,
    store: Arc<dyn PersistentStore>,
    settings: TrackerSettings,
    /// Owning account of every id seen so far. Ids never change accounts.
    accounts: Mutex<HashMap<Uuid, Address>>,
    polling: Mutex<HashSet<Uuid>>,
}

impl<T: RpcTransport> TransactionStatusTracker<T> {
    pub fn new(
        rpc: Arc<RpcBatchClient<T>>,
        nonces: Arc<NonceTracker>,
        store: Arc<dyn PersistentStore>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            rpc,
            nonces,
            store,
            settings,
            accounts: Mutex::new(HashMap::new()),
            polling: Mutex::new(HashSet::new()),
        }
    }

    pub const fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    fn remember(&self, account: Address, recs: &[TrackedTransaction]) -> Result<(), EngineError> {
        let mut ids = self.accounts.lock().map_err(poisoned)?;
        ids.extend(recs.iter().map(|r| (r.id, account)));
        Ok(())
    }

    fn load_account(&self, account: Address) -> Result<Vec<TrackedTransaction>, EngineError> {
        let recs: Vec<TrackedTransaction> =
            load_json(self.store.as_ref(), NAMESPACE, account)?.unwrap_or_default();
        self.remember(account, &recs)?;
        Ok(recs)
    }

    /// Run `f` on the stored records of `account` and persist the result.
    fn with_account<R>(
        &self,
        account: Address,
        f: impl FnOnce(&mut Vec<TrackedTransaction>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        update_json(self.store.as_ref(), NAMESPACE, account, f)
    }

    fn with_record<R>(
        &self,
        account: Address,
        id: Uuid,
        f: impl FnOnce(&mut TrackedTransaction) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.with_account(account, |recs| {
            let rec = recs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| EngineError::NotFound(format!("transaction {id}")))?;
            f(rec)
        })
    }

    fn account_of(&self, id: Uuid) -> Result<Address, EngineError> {
        if let Some(a) = self.accounts.lock().map_err(poisoned)?.get(&id) {
            return Ok(*a);
        }
        for account in self.known_accounts()? {
            if self.load_account(account)?.iter().any(|r| r.id == id) {
                return Ok(account);
            }
        }
        Err(EngineError::NotFound(format!("transaction {id}")))
    }

    pub fn list(&self, account: Address) -> Result<Vec<TrackedTransaction>, EngineError> {
        self.load_account(account)
    }

    pub fn get(&self, id: Uuid) -> Result<TrackedTransaction, EngineError> {
        let account = self.account_of(id)?;
        self.load_account(account)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("transaction {id}")))
    }

    /// Sign and broadcast `descriptor` exactly once.
    ///
    /// A node rejection is persisted as `BroadcastError` and returned; the nonce is handed
    /// back so a rebuild can reuse or resync it. A lost response leaves the outcome
    /// unknown, so the record goes `Pending` under its locally computed hash and receipt
    /// polling settles it. A signing failure leaves no record.
    pub async fn submit<S: TransactionSigner>(
        &self,
        descriptor: TransactionDescriptor,
        signer: &S,
    ) -> Result<TrackedTransaction, EngineError> {
        let account = descriptor.from;
        let nonce = descriptor.nonce;
        let rec = TrackedTransaction::new(descriptor, now_ms());
        let id = rec.id;
        self.with_account(account, |recs| {
            recs.push(rec.clone());
            Ok(())
        })?;
        self.remember(account, std::slice::from_ref(&rec))?;

        let signed = match signer.sign(&rec.descriptor).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%id, error = %e, "signing failed; discarding record");
                self.with_account(account, |recs| {
                    recs.retain(|r| r.id != id);
                    Ok(())
                })?;
                self.nonces.release(account, nonce)?;
                return Err(e);
            }
        };

        self.with_record(account, id, |r| r.transition(TxState::Broadcasting, now_ms()))?;

        let hash = match self.rpc.send_raw_transaction(signed.raw).await {
            Ok(hash) => {
                if hash != signed.hash {
                    warn!(
                        %id,
                        node = %hash,
                        local = %signed.hash,
                        "node returned a different hash"
                    );
                }
                hash
            }
            Err(EngineError::AlreadyKnown(msg)) => {
                info!(%id, nonce, reason = %msg, "node already holds this transaction");
                signed.hash
            }
            Err(e @ EngineError::Transport(_)) => {
                warn!(
                    %id,
                    nonce,
                    hash = %signed.hash,
                    error = %e,
                    "broadcast outcome unknown; tracking by local hash"
                );
                signed.hash
            }
            Err(e) => {
                warn!(%id, nonce, error = %e, "broadcast rejected");
                self.with_record(account, id, |r| {
                    r.hash = Some(signed.hash);
                    r.error = Some(ErrorRecord::from(&e));
                    r.transition(TxState::BroadcastError, now_ms())
                })?;
                self.nonces.release(account, nonce)?;
                return Err(e);
            }
        };

        self.nonces.mark_in_flight(account, nonce)?;
        let rec = self.with_record(account, id, |r| {
            r.hash = Some(hash);
            r.transition(TxState::Pending, now_ms())?;
            Ok(r.clone())
        })?;
        info!(%id, %hash, nonce, "transaction broadcast");
        Ok(rec)
    }

    /// One receipt poll for a `Pending` record. Concurrent polls of one record collapse
    /// into one.
    pub async fn poll_once(&self, id: Uuid) -> Result<PollStatus, EngineError> {
        let Some(_guard) = PollGuard::acquire(&self.polling, id)? else {
            return Ok(PollStatus::Skipped);
        };
        let rec = self.get(id)?;
        if rec.state != TxState::Pending {
            return Ok(PollStatus::NotPending(rec.state));
        }
        let hash = rec
            .hash
            .ok_or_else(|| EngineError::Store(format!("pending transaction {id} has no hash")))?;
        let account = rec.account();

        let receipt = self.rpc.transaction_receipt(hash).await?;
        let Some(receipt) = receipt else {
            self.with_record(account, id, |r| {
                r.poll_attempts = r.poll_attempts.saturating_add(1);
                Ok(())
            })?;
            return Ok(PollStatus::StillPending);
        };

        let next = match receipt.status {
            ReceiptStatus::Success => TxState::Success,
            ReceiptStatus::Failure => TxState::Failed,
        };
        self.with_record(account, id, |r| {
            r.poll_attempts = r.poll_attempts.saturating_add(1);
            if next == TxState::Failed {
                r.error = Some(ErrorRecord {
                    code: "execution_reverted".into(),
                    message: format!("reverted in block {}", receipt.block_number),
                    rpc_code: None,
                });
            }
            r.receipt = Some(receipt.clone());
            r.transition(next, now_ms())
        })?;
        self.nonces.clear_in_flight(account, rec.descriptor.nonce)?;
        info!(%id, %hash, state = %next, block = %receipt.block_number, "transaction finalized");
        Ok(PollStatus::Finalized(next))
    }

    /// Poll `id` on the configured interval until it settles, the session attempt cap is
    /// hit, or `shutdown` fires. Read errors are logged and retried on the next tick.
    pub async fn poll_until_settled(
        self: Arc<Self>,
        id: Uuid,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                debug!(%id, "poller cancelled");
                return;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(%id, "poller cancelled");
                        return;
                    }
                    continue;
                }
            }

            if self
                .settings
                .max_poll_attempts
                .is_some_and(|max| attempts >= max)
            {
                warn!(%id, attempts, "poll attempts exhausted; leaving transaction pending");
                return;
            }
            attempts = attempts.saturating_add(1);

            match self.poll_once(id).await {
                Ok(PollStatus::StillPending | PollStatus::Skipped) => {}
                Ok(PollStatus::Finalized(_) | PollStatus::NotPending(_)) => return,
                Err(EngineError::NotFound(_)) => return,
                Err(e) => warn!(%id, error = %e, "receipt poll failed"),
            }
        }
    }

    /// Load `account`'s records and return the ids that still need polling.
    pub fn resume(&self, account: Address) -> Result<Vec<Uuid>, EngineError> {
        Ok(self
            .load_account(account)?
            .iter()
            .filter(|r| r.state == TxState::Pending)
            .map(|r| r.id)
            .collect())
    }

    /// Every account with persisted records.
    pub fn known_accounts(&self) -> Result<Vec<Address>, EngineError> {
        self.store.accounts(NAMESPACE)
    }

    /// Remove a record the user no longer wants to see.
    ///
    /// Terminal records and records that never reached the network can go. A `Pending`
    /// record cannot: its transaction may still be mined.
    pub fn dismiss(&self, account: Address, id: Uuid) -> Result<TrackedTransaction, EngineError> {
        let removed = self.with_account(account, |recs| {
            let (idx, rec) = recs
                .iter()
                .enumerate()
                .find(|(_, r)| r.id == id)
                .ok_or_else(|| EngineError::NotFound(format!("transaction {id}")))?;
            if rec.state == TxState::Pending {
                return Err(EngineError::InvalidTransition {
                    from: rec.state.to_string(),
                    to: "dismissed".into(),
                });
            }
            Ok(recs.remove(idx))
        })?;
        info!(%id, state = %removed.state, "transaction dismissed");
        Ok(removed)
    }

    /// Drop terminal records of `account` whose retention window has passed.
    pub fn evict_expired(&self, account: Address, now_ms: i64) -> Result<usize, EngineError> {
        let retention_ms = i64::try_from(self.settings.retention.as_millis()).unwrap_or(i64::MAX);
        let evicted = self.with_account(account, |recs| {
            let before = recs.len();
            recs.retain(|r| {
                r.terminal_at_ms
                    .is_none_or(|t| t.saturating_add(retention_ms) > now_ms)
            });
            Ok(before - recs.len())
        })?;
        if evicted > 0 {
            debug!(%account, evicted, "expired transactions evicted");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::batch::testing::{client, ScriptedNode};
    use crate::rpc::quantity::parse_data;
    use crate::signer::{LocalKeySigner, SignedTransaction};
    use crate::store::{FileStore, MemoryStore};
    use crate::tx::TxCategory;
    use alloy::primitives::{keccak256, Bytes, U256};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    type Tracker = TransactionStatusTracker<ScriptedNode>;

    struct Fixture {
        tracker: Arc<Tracker>,
        nonces: Arc<NonceTracker>,
        signer: LocalKeySigner,
    }

    fn fixture_with(
        node: ScriptedNode,
        store: Arc<dyn PersistentStore>,
        settings: TrackerSettings,
    ) -> eyre::Result<Fixture> {
        let rpc = Arc::new(client(node));
        let nonces = Arc::new(NonceTracker::new(Arc::clone(&store)));
        Ok(Fixture {
            tracker: Arc::new(TransactionStatusTracker::new(
                rpc,
                Arc::clone(&nonces),
                store,
                settings,
            )),
            nonces,
            signer: LocalKeySigner::from_hex(DEV_KEY)?,
        })
    }

    fn fixture(node: ScriptedNode) -> eyre::Result<Fixture> {
        fixture_with(node, Arc::new(MemoryStore::new()), TrackerSettings::default())
    }

    fn raw_hash(params: &Value) -> Result<Value, EngineError> {
        let raw = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidInput("missing raw tx".into()))?;
        Ok(json!(format!("{:#x}", keccak256(parse_data(raw)?))))
    }

    fn receipt_json(hash: &Value, status: &str) -> Value {
        json!({
            "transactionHash": hash,
            "blockNumber": "0x10",
            "status": status,
            "gasUsed": "0x5208"
        })
    }

    /// Broadcast succeeds; receipts are `null` for the first `pending_polls` polls.
    fn mining_node(pending_polls: usize, status: &'static str) -> ScriptedNode {
        let polls = Arc::new(AtomicUsize::new(0));
        ScriptedNode::new(move |method, params| match method {
            "eth_sendRawTransaction" => raw_hash(params),
            "eth_getTransactionReceipt" => {
                if polls.fetch_add(1, Ordering::SeqCst) < pending_polls {
                    Ok(Value::Null)
                } else {
                    Ok(receipt_json(params.get(0).unwrap_or(&Value::Null), status))
                }
            }
            other => Err(EngineError::from_rpc(-32601, format!("unexpected {other}"))),
        })
    }

    fn descriptor(f: &Fixture) -> eyre::Result<TransactionDescriptor> {
        let from = f.signer.address();
        if !f.nonces.is_synced(from)? {
            f.nonces.resync(from, 4)?;
        }
        Ok(TransactionDescriptor {
            category: TxCategory::NativeTransfer,
            from,
            to: Some(Address::repeat_byte(0x42)),
            value: U256::from(1_000_u64),
            data: Bytes::new(),
            gas_price: U256::from(1_000_000_000_u64),
            gas_limit: 21_000,
            nonce: f.nonces.next_nonce(from)?,
            chain_id: 1,
        })
    }

    #[test]
    fn state_machine_only_allows_forward_edges() {
        use TxState::*;
        let all = [Created, Broadcasting, Pending, Success, Failed, BroadcastError];
        let allowed = [
            (Created, Broadcasting),
            (Broadcasting, Pending),
            (Broadcasting, BroadcastError),
            (Pending, Success),
            (Pending, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(!Pending.can_transition_to(Broadcasting));
        for terminal in [Success, Failed, BroadcastError] {
            assert!(terminal.is_terminal());
            assert!(all.iter().all(|s| !terminal.can_transition_to(*s)), "{terminal} is final");
        }
    }

    #[tokio::test]
    async fn submit_then_poll_to_success() -> eyre::Result<()> {
        let f = fixture(mining_node(1, "0x1"))?;
        let d = descriptor(&f)?;
        let from = d.from;

        let rec = f.tracker.submit(d, &f.signer).await?;
        assert_eq!(rec.state, TxState::Pending);
        assert!(rec.hash.is_some());
        assert_eq!(f.nonces.snapshot(from)?.in_flight, vec![4]);

        assert_eq!(f.tracker.poll_once(rec.id).await?, PollStatus::StillPending);
        assert_eq!(
            f.tracker.poll_once(rec.id).await?,
            PollStatus::Finalized(TxState::Success)
        );
        let done = f.tracker.get(rec.id)?;
        assert_eq!(done.poll_attempts, 2);
        assert!(done.receipt.is_some() && done.terminal_at_ms.is_some());
        assert!(f.nonces.snapshot(from)?.in_flight.is_empty(), "mined nonce cleared");

        assert_eq!(
            f.tracker.poll_once(rec.id).await?,
            PollStatus::NotPending(TxState::Success),
            "terminal records are never polled again"
        );
        Ok(())
    }

    #[tokio::test]
    async fn reverted_receipt_is_failed_with_error() -> eyre::Result<()> {
        let f = fixture(mining_node(0, "0x0"))?;
        let rec = f.tracker.submit(descriptor(&f)?, &f.signer).await?;
        assert_eq!(
            f.tracker.poll_once(rec.id).await?,
            PollStatus::Finalized(TxState::Failed)
        );
        let failed = f.tracker.get(rec.id)?;
        assert_eq!(failed.error.map(|e| e.code), Some("execution_reverted".to_owned()));
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_rejection_is_terminal_and_surfaced() -> eyre::Result<()> {
        let f = fixture(ScriptedNode::new(|_, _| {
            Err(EngineError::Rpc {
                code: -32000,
                message: "nonce too low".into(),
            })
        }))?;
        let d = descriptor(&f)?;
        let from = d.from;
        let res = f.tracker.submit(d, &f.signer).await;
        assert!(matches!(res, Err(EngineError::NonceConflict(_))), "got {res:?}");

        let recs = f.tracker.list(from)?;
        assert_eq!(recs.len(), 1);
        let rec = recs.first().ok_or_else(|| eyre::eyre!("record missing"))?;
        assert_eq!(rec.state, TxState::BroadcastError);
        assert_eq!(rec.error.as_ref().map(|e| e.code.as_str()), Some("nonce_conflict"));
        let snap = f.nonces.snapshot(from)?;
        assert!(snap.in_flight.is_empty() && snap.reserved.is_empty());
        assert_eq!(snap.next, 4, "rejected nonce is handed back");
        Ok(())
    }

    #[tokio::test]
    async fn lost_broadcast_response_keeps_tracking() -> eyre::Result<()> {
        let pool = Arc::new(Mutex::new(HashSet::<String>::new()));
        let seen = Arc::clone(&pool);
        let node = ScriptedNode::new(move |method, params| {
            let mut held = seen
                .lock()
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            match method {
                "eth_sendRawTransaction" => {
                    let hash = raw_hash(params)?;
                    held.insert(hash.as_str().unwrap_or_default().to_owned());
                    Err(EngineError::Transport("timeout reading response".into()))
                }
                "eth_getTransactionReceipt" => {
                    let hash = params.get(0).cloned().unwrap_or(Value::Null);
                    if held.contains(hash.as_str().unwrap_or_default()) {
                        Ok(receipt_json(&hash, "0x1"))
                    } else {
                        Ok(Value::Null)
                    }
                }
                other => Err(EngineError::from_rpc(-32601, format!("unexpected {other}"))),
            }
        });
        let f = fixture(node)?;
        let d = descriptor(&f)?;
        let from = d.from;

        let rec = f.tracker.submit(d, &f.signer).await?;
        assert_eq!(rec.state, TxState::Pending, "unknown outcome is not a failure");
        assert!(rec.error.is_none(), "no error recorded: {:?}", rec.error);
        let hash = rec.hash.ok_or_else(|| eyre::eyre!("no hash"))?;
        let pooled = pool.lock().map_err(|e| eyre::eyre!("{e}"))?.clone();
        assert!(pooled.contains(&format!("{hash:#x}")), "tracked under the hash the node holds");

        let snap = f.nonces.snapshot(from)?;
        assert_eq!(snap.in_flight, vec![4], "nonce stays claimed");
        assert_eq!(snap.next, 5, "nonce is not handed out again");
        assert_eq!(f.tracker.resume(from)?, vec![rec.id]);
        assert_eq!(
            f.tracker.poll_once(rec.id).await?,
            PollStatus::Finalized(TxState::Success)
        );
        Ok(())
    }

    #[tokio::test]
    async fn already_known_is_a_successful_broadcast() -> eyre::Result<()> {
        let node = ScriptedNode::new(|method, _| match method {
            "eth_sendRawTransaction" => Err(EngineError::from_rpc(-32000, "already known")),
            _ => Ok(Value::Null),
        });
        let f = fixture(node)?;
        let d = descriptor(&f)?;
        let from = d.from;

        let rec = f.tracker.submit(d, &f.signer).await?;
        assert_eq!(rec.state, TxState::Pending);
        assert!(rec.hash.is_some(), "local hash recorded");
        assert_eq!(f.nonces.snapshot(from)?.in_flight, vec![4]);
        assert_eq!(f.tracker.list(from)?.len(), 1, "no second record");
        Ok(())
    }

    #[tokio::test]
    async fn failures_survive_restart_with_details() -> eyre::Result<()> {
        let td = tempfile::tempdir()?;
        let sends = Arc::new(AtomicUsize::new(0));
        let node = ScriptedNode::new(move |method, params| match method {
            "eth_sendRawTransaction" if sends.fetch_add(1, Ordering::SeqCst) == 0 => {
                Err(EngineError::from_rpc(-32010, "tx pool full"))
            }
            "eth_sendRawTransaction" => raw_hash(params),
            "eth_getTransactionReceipt" => {
                Ok(receipt_json(params.get(0).unwrap_or(&Value::Null), "0x0"))
            }
            other => Err(EngineError::from_rpc(-32601, format!("unexpected {other}"))),
        });
        let (rejected, reverted) = {
            let store: Arc<dyn PersistentStore> = Arc::new(FileStore::open(td.path())?);
            let f = fixture_with(node, store, TrackerSettings::default())?;
            let res = f.tracker.submit(descriptor(&f)?, &f.signer).await;
            assert!(matches!(res, Err(EngineError::Rpc { code: -32010, .. })), "got {res:?}");
            let rejected = f
                .tracker
                .list(f.signer.address())?
                .first()
                .map(|r| r.id)
                .ok_or_else(|| eyre::eyre!("rejected record missing"))?;
            let rec = f.tracker.submit(descriptor(&f)?, &f.signer).await?;
            f.tracker.poll_once(rec.id).await?;
            (rejected, rec.id)
        };

        let store: Arc<dyn PersistentStore> = Arc::new(FileStore::open(td.path())?);
        let f = fixture_with(mining_node(0, "0x1"), store, TrackerSettings::default())?;
        let account = f.signer.address();
        assert!(f.tracker.resume(account)?.is_empty(), "terminal records are not polled");

        let rec = f.tracker.get(rejected)?;
        assert_eq!(rec.state, TxState::BroadcastError);
        let err = rec.error.ok_or_else(|| eyre::eyre!("rejection details lost"))?;
        assert_eq!(err.code, "rpc_error");
        assert_eq!(err.rpc_code, Some(-32010));
        assert!(err.message.contains("tx pool full"), "message: {}", err.message);

        let rec = f.tracker.get(reverted)?;
        assert_eq!(rec.state, TxState::Failed);
        assert_eq!(rec.error.map(|e| e.code), Some("execution_reverted".to_owned()));
        assert!(rec.receipt.is_some() && rec.terminal_at_ms.is_some(), "receipt kept");
        Ok(())
    }

    #[tokio::test]
    async fn two_processes_share_one_state_dir() -> eyre::Result<()> {
        let td = tempfile::tempdir()?;
        let open = || -> eyre::Result<Arc<dyn PersistentStore>> {
            Ok(Arc::new(FileStore::open(td.path())?))
        };
        let watcher = fixture_with(mining_node(0, "0x1"), open()?, TrackerSettings::default())?;
        let sender = fixture_with(mining_node(0, "0x1"), open()?, TrackerSettings::default())?;
        let account = watcher.signer.address();

        let first = watcher.tracker.submit(descriptor(&watcher)?, &watcher.signer).await?;
        let second = sender.tracker.submit(descriptor(&sender)?, &sender.signer).await?;
        assert_eq!(second.descriptor.nonce, 5, "counter is shared through the store");

        assert_eq!(
            watcher.tracker.poll_once(first.id).await?,
            PollStatus::Finalized(TxState::Success)
        );

        let fresh = fixture_with(mining_node(0, "0x1"), open()?, TrackerSettings::default())?;
        let states: Vec<(Uuid, TxState)> = fresh
            .tracker
            .list(account)?
            .iter()
            .map(|r| (r.id, r.state))
            .collect();
        assert_eq!(
            states,
            vec![(first.id, TxState::Success), (second.id, TxState::Pending)],
            "a transition in one process keeps the other's record"
        );
        assert_eq!(watcher.tracker.get(second.id)?.state, TxState::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn poller_returns_at_once_when_already_stopped() -> eyre::Result<()> {
        let node = mining_node(usize::MAX, "0x1");
        let f = fixture(node.clone())?;
        let rec = f.tracker.submit(descriptor(&f)?, &f.signer).await?;

        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);
        let late = tx.subscribe();
        drop(rx);
        tokio::time::timeout(
            Duration::from_secs(1),
            Arc::clone(&f.tracker).poll_until_settled(rec.id, late),
        )
        .await?;
        assert!(
            !node.methods_seen().iter().any(|m| m == "eth_getTransactionReceipt"),
            "no poll after shutdown"
        );
        Ok(())
    }

    struct BrokenSigner;

    impl TransactionSigner for BrokenSigner {
        async fn sign(
            &self,
            _tx: &TransactionDescriptor,
        ) -> Result<SignedTransaction, EngineError> {
            Err(EngineError::Signing("keystore locked".into()))
        }
    }

    #[tokio::test]
    async fn signing_failure_leaves_no_trace() -> eyre::Result<()> {
        let node = mining_node(0, "0x1");
        let f = fixture(node.clone())?;
        let d = descriptor(&f)?;
        let from = d.from;
        let res = f.tracker.submit(d, &BrokenSigner).await;
        assert!(matches!(res, Err(EngineError::Signing(_))), "got {res:?}");
        assert!(f.tracker.list(from)?.is_empty(), "record discarded");
        assert_eq!(f.nonces.snapshot(from)?.next, 4, "nonce released");
        assert!(node.methods_seen().is_empty(), "nothing was broadcast");
        Ok(())
    }

    #[tokio::test]
    async fn pending_survives_restart_and_resumes() -> eyre::Result<()> {
        let td = tempfile::tempdir()?;
        let id = {
            let store: Arc<dyn PersistentStore> = Arc::new(FileStore::open(td.path())?);
            let node = mining_node(usize::MAX, "0x1");
            let f = fixture_with(node, store, TrackerSettings::default())?;
            f.tracker.submit(descriptor(&f)?, &f.signer).await?.id
        };

        let store: Arc<dyn PersistentStore> = Arc::new(FileStore::open(td.path())?);
        let f = fixture_with(mining_node(0, "0x1"), store, TrackerSettings::default())?;
        let account = f.signer.address();
        assert_eq!(f.tracker.known_accounts()?, vec![account]);
        assert_eq!(f.tracker.resume(account)?, vec![id]);
        assert_eq!(f.nonces.snapshot(account)?.in_flight, vec![4], "in-flight survives too");
        assert_eq!(
            f.tracker.poll_once(id).await?,
            PollStatus::Finalized(TxState::Success)
        );
        assert!(f.tracker.resume(account)?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poller_gives_up_but_leaves_pending() -> eyre::Result<()> {
        let settings = TrackerSettings {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: Some(3),
            ..TrackerSettings::default()
        };
        let node = mining_node(usize::MAX, "0x1");
        let f = fixture_with(node.clone(), Arc::new(MemoryStore::new()), settings)?;
        let rec = f.tracker.submit(descriptor(&f)?, &f.signer).await?;

        let (_tx, rx) = watch::channel(false);
        Arc::clone(&f.tracker).poll_until_settled(rec.id, rx).await;

        let after = f.tracker.get(rec.id)?;
        assert_eq!(after.state, TxState::Pending, "no implicit timeout-to-failure");
        assert_eq!(after.poll_attempts, 3);
        let receipt_calls = node
            .methods_seen()
            .iter()
            .filter(|m| *m == "eth_getTransactionReceipt")
            .count();
        assert_eq!(receipt_calls, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poller_stops_on_shutdown() -> eyre::Result<()> {
        let settings = TrackerSettings {
            poll_interval: Duration::from_secs(5),
            ..TrackerSettings::default()
        };
        let node = mining_node(usize::MAX, "0x1");
        let f = fixture_with(node, Arc::new(MemoryStore::new()), settings)?;
        let rec = f.tracker.submit(descriptor(&f)?, &f.signer).await?;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&f.tracker).poll_until_settled(rec.id, rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true)?;
        handle.await?;
        assert_eq!(f.tracker.get(rec.id)?.state, TxState::Pending);
        Ok(())
    }

    /// Receipt lookups take a while, so a second poll can overlap the first.
    #[derive(Clone)]
    struct SlowReceipts;

    impl RpcTransport for SlowReceipts {
        async fn post(&self, _url: &str, body: &Value) -> Result<Value, EngineError> {
            let req = body.get(0).cloned().unwrap_or(Value::Null);
            let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
            let params = req.get("params").cloned().unwrap_or(Value::Null);
            let result = if method == "eth_sendRawTransaction" {
                raw_hash(&params)?
            } else {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Value::Null
            };
            Ok(json!([{ "jsonrpc": "2.0", "id": req.get("id"), "result": result }]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_polls_collapse() -> eyre::Result<()> {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let nonces = Arc::new(NonceTracker::new(Arc::clone(&store)));
        let rpc = Arc::new(RpcBatchClient::new(SlowReceipts, vec!["http://slow".into()]));
        let tracker = TransactionStatusTracker::new(
            rpc,
            Arc::clone(&nonces),
            store,
            TrackerSettings::default(),
        );
        let signer = LocalKeySigner::from_hex(DEV_KEY)?;
        nonces.resync(signer.address(), 0)?;
        let d = TransactionDescriptor {
            category: TxCategory::NativeTransfer,
            from: signer.address(),
            to: Some(Address::repeat_byte(1)),
            value: U256::ZERO,
            data: Bytes::new(),
            gas_price: U256::from(1_u64),
            gas_limit: 21_000,
            nonce: nonces.next_nonce(signer.address())?,
            chain_id: 1,
        };
        let rec = tracker.submit(d, &signer).await?;
        let (a, b) = tokio::join!(tracker.poll_once(rec.id), tracker.poll_once(rec.id));
        assert_eq!(a?, PollStatus::StillPending);
        assert_eq!(b?, PollStatus::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn dismiss_and_evict_rules() -> eyre::Result<()> {
        let f = fixture(mining_node(0, "0x1"))?;
        let account = f.signer.address();
        let pending = f.tracker.submit(descriptor(&f)?, &f.signer).await?;

        let res = f.tracker.dismiss(account, pending.id);
        assert!(matches!(res, Err(EngineError::InvalidTransition { .. })), "got {res:?}");

        f.tracker.poll_once(pending.id).await?;
        let done = f.tracker.get(pending.id)?;
        let terminal_at = done.terminal_at_ms.ok_or_else(|| eyre::eyre!("no terminal time"))?;

        let retention_ms = i64::try_from(f.tracker.settings().retention.as_millis())?;
        assert_eq!(f.tracker.evict_expired(account, terminal_at + retention_ms - 1)?, 0);
        assert_eq!(f.tracker.evict_expired(account, terminal_at + retention_ms)?, 1);
        assert!(f.tracker.list(account)?.is_empty());

        let res = f.tracker.dismiss(account, Uuid::new_v4());
        assert!(matches!(res, Err(EngineError::NotFound(_))), "got {res:?}");
        Ok(())
    }

    #[tokio::test]
    async fn terminal_records_can_be_dismissed() -> eyre::Result<()> {
        let f = fixture(mining_node(0, "0x0"))?;
        let account = f.signer.address();
        let rec = f.tracker.submit(descriptor(&f)?, &f.signer).await?;
        f.tracker.poll_once(rec.id).await?;
        let removed = f.tracker.dismiss(account, rec.id)?;
        assert_eq!(removed.state, TxState::Failed);
        assert!(f.tracker.list(account)?.is_empty());
        Ok(())
    }
}
