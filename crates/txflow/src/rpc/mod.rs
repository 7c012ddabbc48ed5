pub mod batch;
pub mod quantity;
pub mod types;

pub use batch::RpcBatchClient;
pub use types::{BlockTag, CallRequest, ReceiptStatus, RpcCall, RpcResponse, TxReceipt};

use crate::errors::EngineError;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Moves one JSON-RPC payload to an endpoint and back.
///
/// Implementations map connectivity problems and non-2xx statuses to
/// [`EngineError::Transport`]; the body is returned undecoded.
pub trait RpcTransport: Send + Sync + 'static {
    fn post(&self, url: &str, body: &Value)
        -> impl Future<Output = Result<Value, EngineError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>) -> eyre::Result<Self> {
        use eyre::Context as _;
        let client = Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_RPC_TIMEOUT))
            .connect_timeout(DEFAULT_RPC_CONNECT_TIMEOUT)
            .build()
            .context("build rpc http client")?;
        Ok(Self { client })
    }
}

impl RpcTransport for HttpTransport {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, EngineError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("rpc request to {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(EngineError::Transport(format!(
                "rpc http status {} from {url}",
                resp.status()
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| EngineError::Transport(format!("rpc response body from {url}: {e}")))
    }
}
