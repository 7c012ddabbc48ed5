//! JSON-RPC batch client.
//!
//! Several calls share one HTTP exchange. Responses are matched back to requests by
//! numeric id, never by array position, because nodes are free to reorder a batch.

use super::types::{BlockTag, CallRequest, RpcCall, RpcResponse, TxReceipt};
use super::RpcTransport;
use crate::errors::EngineError;
use crate::retry::{try_endpoints_with_backoff, BackoffConfig};
use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Serialize)]
struct WireRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

fn wire_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Per-call outcome inside a batch that made it over the wire.
pub type CallResult = Result<RpcResponse, EngineError>;

#[derive(Debug)]
pub struct RpcBatchClient<T> {
    transport: T,
    endpoints: Vec<String>,
    backoff: BackoffConfig,
    next_id: AtomicU64,
}

impl<T: RpcTransport> RpcBatchClient<T> {
    /// `endpoints[0]` is the primary; the rest are fallbacks for idempotent reads.
    pub fn new(transport: T, endpoints: Vec<String>) -> Self {
        let mut uniq: Vec<String> = Vec::with_capacity(endpoints.len());
        for e in endpoints {
            let t = e.trim();
            if !t.is_empty() && !uniq.iter().any(|u| u == t) {
                uniq.push(t.to_owned());
            }
        }
        Self {
            transport,
            endpoints: uniq,
            backoff: BackoffConfig::default(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send `calls` as one batch and return one result per call, in request order.
    ///
    /// The outer error is a whole-batch failure (transport, or a node that rejected the
    /// batch as a unit); no partial results survive it. Inner errors are per call.
    pub async fn batch(&self, calls: &[RpcCall]) -> Result<Vec<CallResult>, EngineError> {
        if calls.is_empty() {
            return Ok(vec![]);
        }

        let first_id = self
            .next_id
            .fetch_add(calls.len() as u64, Ordering::Relaxed);
        let requests: Vec<WireRequest> = calls
            .iter()
            .zip(first_id..)
            .map(|(c, id)| WireRequest {
                jsonrpc: "2.0",
                id,
                method: c.method(),
                params: c.params(),
            })
            .collect();
        let body = serde_json::to_value(&requests)
            .map_err(|e| EngineError::InvalidInput(format!("encode rpc batch: {e}")))?;

        let idempotent = calls.iter().all(RpcCall::is_idempotent);
        let (endpoints, backoff) = if idempotent {
            (self.endpoints.as_slice(), self.backoff.clone())
        } else {
            // Never replay a broadcast: one attempt, primary endpoint only.
            (
                self.endpoints.get(..1).unwrap_or_default(),
                BackoffConfig::once(),
            )
        };

        let transport = &self.transport;
        let body_ref = &body;
        let raw = try_endpoints_with_backoff(
            endpoints,
            &backoff,
            |url| {
                let url = url.clone();
                async move { transport.post(&url, body_ref).await }
            },
            "rpc batch",
        )
        .await?;

        debug!(calls = calls.len(), first_id, "rpc batch answered");
        Self::correlate(calls, &requests, raw)
    }

    fn correlate(
        calls: &[RpcCall],
        requests: &[WireRequest],
        raw: Value,
    ) -> Result<Vec<CallResult>, EngineError> {
        let items: Vec<Value> = match raw {
            Value::Array(items) => items,
            Value::Object(obj) => {
                // A rejected batch comes back as one error object without an id.
                let single: WireResponse = serde_json::from_value(Value::Object(obj.clone()))
                    .map_err(|e| EngineError::Decode(format!("rpc response: {e}")))?;
                if let (None, Some(err)) = (wire_id(&single.id), single.error) {
                    return Err(EngineError::from_rpc(err.code, err.message));
                }
                vec![Value::Object(obj)]
            }
            other => {
                return Err(EngineError::Decode(format!(
                    "rpc response is neither array nor object: {other}"
                )))
            }
        };

        let mut by_id: HashMap<u64, WireResponse> = HashMap::with_capacity(items.len());
        for item in items {
            let resp: WireResponse = serde_json::from_value(item)
                .map_err(|e| EngineError::Decode(format!("rpc response item: {e}")))?;
            if let Some(id) = wire_id(&resp.id) {
                by_id.insert(id, resp);
            }
        }

        Ok(calls
            .iter()
            .zip(requests)
            .map(|(call, req)| match by_id.remove(&req.id) {
                None => Err(EngineError::Decode(format!(
                    "missing response for {} (id {})",
                    call.method(),
                    req.id
                ))),
                Some(WireResponse {
                    error: Some(err), ..
                }) => Err(EngineError::from_rpc(err.code, err.message)),
                Some(WireResponse { result, .. }) => {
                    call.decode(result.as_ref().unwrap_or(&Value::Null))
                }
            })
            .collect())
    }

    pub async fn call(&self, call: RpcCall) -> Result<RpcResponse, EngineError> {
        self.batch(std::slice::from_ref(&call))
            .await?
            .pop()
            .unwrap_or_else(|| Err(EngineError::Decode("empty rpc batch result".into())))
    }

    /// `(pending, mined)` transaction counts of `address`, read in one batch.
    pub async fn transaction_counts(&self, address: Address) -> Result<(U256, U256), EngineError> {
        let calls = [
            RpcCall::GetTransactionCount {
                address,
                block: BlockTag::Pending,
            },
            RpcCall::GetTransactionCount {
                address,
                block: BlockTag::Latest,
            },
        ];
        let mut counts = self
            .batch(&calls)
            .await?
            .into_iter()
            .map(|r| r.and_then(RpcResponse::into_quantity));
        let mut next = || {
            counts
                .next()
                .unwrap_or_else(|| Err(EngineError::Decode("short transaction count batch".into())))
        };
        let pending = next()?;
        let mined = next()?;
        Ok((pending, mined))
    }

    pub async fn gas_price(&self) -> Result<U256, EngineError> {
        self.call(RpcCall::GasPrice).await?.into_quantity()
    }

    pub async fn estimate_gas(&self, req: CallRequest) -> Result<U256, EngineError> {
        self.call(RpcCall::EstimateGas(req)).await?.into_quantity()
    }

    pub async fn balance(&self, address: Address) -> Result<U256, EngineError> {
        self.call(RpcCall::GetBalance {
            address,
            block: BlockTag::Latest,
        })
        .await?
        .into_quantity()
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, EngineError> {
        self.call(RpcCall::SendRawTransaction(raw)).await?.into_hash()
    }

    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, EngineError> {
        self.call(RpcCall::GetTransactionReceipt(hash))
            .await?
            .into_receipt()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-process node used by unit tests across the crate.

    use super::*;
    use std::sync::{Arc, Mutex};

    type Handler = dyn Fn(&str, &Value) -> Result<Value, EngineError> + Send + Sync;

    /// Answers each request of a batch with `handler(method, params)`.
    ///
    /// `Ok(v)` becomes `result: v`; `Err(Transport)` fails the whole exchange; any other
    /// error becomes a per-call `error` object carrying its message.
    #[derive(Clone)]
    pub struct ScriptedNode {
        handler: Arc<Handler>,
        pub seen: Arc<Mutex<Vec<String>>>,
        pub reverse: bool,
    }

    impl ScriptedNode {
        pub fn new(
            handler: impl Fn(&str, &Value) -> Result<Value, EngineError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Arc::new(handler),
                seen: Arc::new(Mutex::new(vec![])),
                reverse: false,
            }
        }

        pub fn methods_seen(&self) -> Vec<String> {
            self.seen.lock().map(|g| g.clone()).unwrap_or_default()
        }
    }

    impl RpcTransport for ScriptedNode {
        async fn post(&self, _url: &str, body: &Value) -> Result<Value, EngineError> {
            let reqs = body
                .as_array()
                .ok_or_else(|| EngineError::Transport("expected batch array".into()))?;
            let mut out = Vec::with_capacity(reqs.len());
            for r in reqs {
                let method = r.get("method").and_then(Value::as_str).unwrap_or_default();
                if let Ok(mut g) = self.seen.lock() {
                    g.push(method.to_owned());
                }
                let id = r.get("id").cloned().unwrap_or(Value::Null);
                let params = r.get("params").cloned().unwrap_or(Value::Null);
                let (code, message) = match (self.handler)(method, &params) {
                    Ok(result) => {
                        out.push(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}));
                        continue;
                    }
                    Err(EngineError::Transport(m)) => return Err(EngineError::Transport(m)),
                    Err(EngineError::Rpc { code, message }) => (code, message),
                    Err(
                        EngineError::NonceConflict(m)
                        | EngineError::AlreadyKnown(m)
                        | EngineError::InsufficientBalance(m),
                    ) => (-32000, m),
                    Err(other) => (-32000, other.to_string()),
                };
                out.push(serde_json::json!({
                    "jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}
                }));
            }
            if self.reverse {
                out.reverse();
            }
            Ok(Value::Array(out))
        }
    }

    pub fn client(node: ScriptedNode) -> RpcBatchClient<ScriptedNode> {
        RpcBatchClient::new(node, vec!["http://node.test".into()]).with_backoff(BackoffConfig {
            rounds: 1,
            base_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
            jitter_max_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{client, ScriptedNode};
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn correlates_by_id_even_when_node_reorders() -> eyre::Result<()> {
        let mut node = ScriptedNode::new(|method, _params| match method {
            "eth_getTransactionCount" => Ok(json!("0x7")),
            "eth_gasPrice" => Ok(json!("0x3b9aca00")),
            _ => Err(EngineError::from_rpc(-32601, "method not found")),
        });
        node.reverse = true;
        let c = client(node);

        let out = c
            .batch(&[
                RpcCall::GetTransactionCount {
                    address: Address::repeat_byte(1),
                    block: BlockTag::Pending,
                },
                RpcCall::GasPrice,
            ])
            .await?;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok(RpcResponse::TransactionCount(U256::from(7_u64))));
        assert_eq!(out[1], Ok(RpcResponse::GasPrice(U256::from(1_000_000_000_u64))));
        Ok(())
    }

    #[tokio::test]
    async fn per_call_errors_do_not_fail_the_batch() -> eyre::Result<()> {
        let c = client(ScriptedNode::new(|method, _| match method {
            "eth_gasPrice" => Ok(json!("0x1")),
            _ => Err(EngineError::from_rpc(-32000, "execution reverted")),
        }));
        let out = c
            .batch(&[
                RpcCall::EstimateGas(CallRequest::default()),
                RpcCall::GasPrice,
            ])
            .await?;
        assert!(matches!(out[0], Err(EngineError::Rpc { code: -32000, .. })), "got {:?}", out[0]);
        assert_eq!(out[1], Ok(RpcResponse::GasPrice(U256::from(1_u64))));
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_fails_whole_batch() {
        let c = client(ScriptedNode::new(|_, _| {
            Err(EngineError::Transport("connection reset".into()))
        }));
        let out = c.batch(&[RpcCall::GasPrice, RpcCall::BlockNumber]).await;
        assert!(matches!(out, Err(EngineError::Transport(_))), "got {out:?}");
    }

    #[tokio::test]
    async fn missing_ids_surface_per_call() -> eyre::Result<()> {
        struct DropsSecond;
        impl RpcTransport for DropsSecond {
            async fn post(&self, _url: &str, body: &Value) -> Result<Value, EngineError> {
                let id = body
                    .get(0)
                    .and_then(|r| r.get("id"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(json!([{ "jsonrpc": "2.0", "id": id, "result": "0x2" }]))
            }
        }
        let c = RpcBatchClient::new(DropsSecond, vec!["http://x".into()]);
        let out = c.batch(&[RpcCall::GasPrice, RpcCall::GasPrice]).await?;
        assert_eq!(out[0], Ok(RpcResponse::GasPrice(U256::from(2_u64))));
        assert!(matches!(out[1], Err(EngineError::Decode(_))), "got {:?}", out[1]);
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_is_sent_once_to_primary_only() -> eyre::Result<()> {
        #[derive(Clone, Default)]
        struct Flaky {
            hits: Arc<Mutex<Vec<String>>>,
        }
        impl RpcTransport for Flaky {
            async fn post(&self, url: &str, _body: &Value) -> Result<Value, EngineError> {
                if let Ok(mut g) = self.hits.lock() {
                    g.push(url.to_owned());
                }
                Err(EngineError::Transport("timeout".into()))
            }
        }
        let flaky = Flaky::default();
        let hits = Arc::clone(&flaky.hits);
        let c = RpcBatchClient::new(flaky, vec!["http://a".into(), "http://b".into()])
            .with_backoff(BackoffConfig {
                rounds: 3,
                base_delay: std::time::Duration::ZERO,
                max_delay: std::time::Duration::ZERO,
                jitter_max_ms: 0,
            });

        let res = c.send_raw_transaction(Bytes::from(vec![1_u8])).await;
        assert!(matches!(res, Err(EngineError::Transport(_))), "got {res:?}");
        let seen = hits.lock().map_err(|e| eyre::eyre!("poisoned: {e}"))?.clone();
        assert_eq!(seen, vec!["http://a".to_owned()], "broadcast must not be replayed");

        let _ = c.gas_price().await;
        let seen = hits.lock().map_err(|e| eyre::eyre!("poisoned: {e}"))?.len();
        assert_eq!(seen, 1 + 6, "reads retry across endpoints and rounds");
        Ok(())
    }

    #[tokio::test]
    async fn whole_batch_error_object_is_surfaced() {
        struct Rejects;
        impl RpcTransport for Rejects {
            async fn post(&self, _url: &str, _body: &Value) -> Result<Value, EngineError> {
                Ok(json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": -32600, "message": "batch too large"}
                }))
            }
        }
        let c = RpcBatchClient::new(Rejects, vec!["http://x".into()]);
        let out = c.batch(&[RpcCall::GasPrice]).await;
        assert!(matches!(out, Err(EngineError::Rpc { code: -32600, .. })), "got {out:?}");
    }
}
