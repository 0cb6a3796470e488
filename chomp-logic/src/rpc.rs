//! Chain RPC access: a process-local endpoint pool per chain with
//! round-robin rotation and per-endpoint cooldown after failure, over an
//! abstract JSON-RPC transport. Concrete chain client libraries stay
//! outside the core; the default transport speaks plain JSON-RPC 2.0 over
//! HTTP, which covers the EVM/SVM/Sui read paths the loaders need.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::LoadError;

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(
        &self,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LoadError>;
}

pub struct HttpJsonRpc {
    client: reqwest::Client,
}

impl HttpJsonRpc {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[async_trait]
impl RpcTransport for HttpJsonRpc {
    async fn request(
        &self,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LoadError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: JsonRpcResponse = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(LoadError::Rpc {
                chain_id: 0,
                message: format!("{} ({})", error.message, error.code),
            });
        }
        response.result.ok_or_else(|| LoadError::Rpc {
            chain_id: 0,
            message: "response carries neither result nor error".to_string(),
        })
    }
}

const ENDPOINT_COOLDOWN: Duration = Duration::from_secs(30);

/// Round-robin endpoint pool for one chain. Failed endpoints sit out a
/// cooldown; when every endpoint is cooling down the least-recently
/// penalized one is retried anyway.
pub struct RpcPool {
    chain_id: u64,
    endpoints: Vec<String>,
    cursor: AtomicUsize,
    penalized: Mutex<HashMap<usize, Instant>>,
    transport: Arc<dyn RpcTransport>,
}

impl std::fmt::Debug for RpcPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPool")
            .field("chain_id", &self.chain_id)
            .field("endpoints", &self.endpoints)
            .field("cursor", &self.cursor)
            .field("penalized", &self.penalized)
            .finish()
    }
}

impl RpcPool {
    pub fn new(
        chain_id: u64,
        endpoints: Vec<String>,
        transport: Arc<dyn RpcTransport>,
    ) -> Result<Self, LoadError> {
        if endpoints.is_empty() {
            return Err(LoadError::NoEndpoint(chain_id));
        }
        Ok(Self {
            chain_id,
            endpoints,
            cursor: AtomicUsize::new(0),
            penalized: Mutex::new(HashMap::new()),
            transport,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Next endpoint to try, skipping those in cooldown.
    pub fn pick(&self) -> (usize, &str) {
        let n = self.endpoints.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let penalized = self.penalized.lock().unwrap();
        for offset in 0..n {
            let idx = (start + offset) % n;
            let cooling = penalized
                .get(&idx)
                .is_some_and(|at| at.elapsed() < ENDPOINT_COOLDOWN);
            if !cooling {
                return (idx, &self.endpoints[idx]);
            }
        }
        (start, &self.endpoints[start])
    }

    pub fn penalize(&self, idx: usize) {
        self.penalized.lock().unwrap().insert(idx, Instant::now());
    }

    /// One JSON-RPC request with endpoint rotation: each failure penalizes
    /// the endpoint and moves on, up to `max_attempts`.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        max_attempts: u32,
    ) -> Result<serde_json::Value, LoadError> {
        self.request_counted(method, params, max_attempts)
            .await
            .map(|(value, _)| value)
    }

    /// As [`request`](Self::request), also reporting how many endpoints
    /// failed before the answer, so callers can account retries.
    pub async fn request_counted(
        &self,
        method: &str,
        params: serde_json::Value,
        max_attempts: u32,
    ) -> Result<(serde_json::Value, u32), LoadError> {
        let mut last_error = LoadError::NoEndpoint(self.chain_id);
        let mut failures = 0u32;
        for _ in 0..max_attempts.max(1) {
            let (idx, url) = self.pick();
            match self.transport.request(url, method, params.clone()).await {
                Ok(result) => return Ok((result, failures)),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        chain_id = self.chain_id,
                        endpoint = url,
                        error = %err,
                        "rpc request failed, rotating endpoint"
                    );
                    self.penalize(idx);
                    last_error = match err {
                        LoadError::Rpc { message, .. } => LoadError::Rpc {
                            chain_id: self.chain_id,
                            message,
                        },
                        other => other,
                    };
                }
            }
        }
        Err(last_error)
    }
}

/// Pools per chain id, built once from settings.
#[derive(Default)]
pub struct RpcPools {
    pools: HashMap<u64, Arc<RpcPool>>,
}

impl RpcPools {
    pub fn build(
        rpc_urls: &std::collections::BTreeMap<u64, Vec<String>>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        let pools = rpc_urls
            .iter()
            .filter(|(_, urls)| !urls.is_empty())
            .map(|(chain_id, urls)| {
                let pool = RpcPool::new(*chain_id, urls.clone(), transport.clone())
                    .expect("non-empty endpoint list");
                (*chain_id, Arc::new(pool))
            })
            .collect();
        Self { pools }
    }

    pub fn get(&self, chain_id: u64) -> Result<Arc<RpcPool>, LoadError> {
        self.pools
            .get(&chain_id)
            .cloned()
            .ok_or(LoadError::NoEndpoint(chain_id))
    }
}
