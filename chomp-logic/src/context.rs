//! Construction-time core context: every task borrows the same immutable
//! view of settings, adapters and per-ingester runtime state. There is no
//! process-wide mutable singleton.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    cache::Cache,
    epoch::EpochBuffer,
    plugins::PluginRegistry,
    rpc::{HttpJsonRpc, RpcPools},
    settings::CoreSettings,
    store::{Store, Tsdb},
    value::Value,
    vitals::RequestVitals,
};

pub struct Context {
    pub settings: CoreSettings,
    pub cache: Arc<dyn Cache>,
    pub store: Store,
    pub plugins: PluginRegistry,
    pub http: reqwest::Client,
    pub rpc: RpcPools,
    /// Last acquisition vitals per ingester, consumed by monitor kinds.
    pub vitals: DashMap<String, RequestVitals>,
    /// One epoch buffer per ws_api ingester, shared between its reader
    /// task and its tick task.
    pub epochs: DashMap<String, Arc<EpochBuffer>>,
    /// Last processed block per evm_logger ingester.
    pub log_cursors: DashMap<String, u64>,
    /// Per-tick event buckets for perpetual loggers.
    pub buckets: DashMap<String, Arc<Mutex<Vec<Vec<Value>>>>>,
}

impl Context {
    pub fn new(
        settings: CoreSettings,
        cache: Arc<dyn Cache>,
        tsdb: Arc<dyn Tsdb>,
        plugins: PluginRegistry,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("default reqwest client");
        let transport = Arc::new(HttpJsonRpc::new(http.clone()));
        Self::with_transport(settings, cache, tsdb, plugins, http, transport)
    }

    /// Same as [`Context::new`] with an explicit RPC transport; chain
    /// adapters and tests inject their own here.
    pub fn with_transport(
        settings: CoreSettings,
        cache: Arc<dyn Cache>,
        tsdb: Arc<dyn Tsdb>,
        plugins: PluginRegistry,
        http: reqwest::Client,
        transport: Arc<dyn crate::rpc::RpcTransport>,
    ) -> Arc<Self> {
        let rpc = RpcPools::build(&settings.rpc_urls, transport);
        let store = Store::new(tsdb, cache.clone(), &settings.namespace);

        Arc::new(Self {
            settings,
            cache,
            store,
            plugins,
            http,
            rpc,
            vitals: DashMap::new(),
            epochs: DashMap::new(),
            log_cursors: DashMap::new(),
            buckets: DashMap::new(),
        })
    }

    pub fn epoch_buffer(&self, ingester: &str) -> Arc<EpochBuffer> {
        self.epochs
            .entry(ingester.to_string())
            .or_insert_with(|| Arc::new(EpochBuffer::new()))
            .clone()
    }

    pub fn bucket(&self, ingester: &str) -> Arc<Mutex<Vec<Vec<Value>>>> {
        self.buckets
            .entry(ingester.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }
}
