use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("duplicate ingester name: {0}")]
    DuplicateIngester(String),
    #[error("duplicate field name {field} in ingester {ingester}")]
    DuplicateField { ingester: String, field: String },
    #[error("ingester {0} has no fields")]
    EmptyFields(String),
    #[error("invalid interval tag: {0}")]
    InvalidInterval(String),
    #[error("invalid probability {value} for ingester {ingester}: must be within [0, 1]")]
    InvalidProbability { ingester: String, value: f64 },
    #[error("transformer cycle in ingester {ingester} involving fields: {fields}")]
    TransformerCycle { ingester: String, fields: String },
    #[error("unknown field reference {{{reference}}} in {ingester}.{field}")]
    UnknownFieldReference {
        ingester: String,
        field: String,
        reference: String,
    },
    #[error("unknown plugin {plugin} referenced by {ingester}")]
    UnknownPlugin { ingester: String, plugin: String },
    #[error("invalid transformer expression in {ingester}.{field}: {message}")]
    InvalidExpression {
        ingester: String,
        field: String,
        message: String,
    },
    #[error("invalid target {target} for {ingester}: expected <chain_id>:<address>")]
    InvalidChainTarget { ingester: String, target: String },
    #[error("ingester {name} already registered with a different spec (hash {theirs}, ours {ours})")]
    SpecConflict {
        name: String,
        theirs: String,
        ours: String,
    },
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache error during registration: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("lock {0} could not be acquired")]
    LockTimeout(String),
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("rpc error on chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },
    #[error("no rpc endpoint configured for chain {0}")]
    NoEndpoint(u64),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("deadline exceeded after {0:?}")]
    Deadline(std::time::Duration),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("selector {selector} yielded nothing for field {field}")]
    Selection { field: String, selector: String },
    #[error("cannot coerce {value} to {ty} for field {field}")]
    Coercion {
        field: String,
        ty: String,
        value: String,
    },
    #[error("evaluation failed for field {field}: {message}")]
    Eval { field: String, message: String },
    #[error("unresolved cross reference {{{0}}}")]
    UnresolvedRef(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("incompatible schema change on table {table}: {message}")]
    SchemaMismatch { table: String, message: String },
    #[error("write to {table} refused: {message}")]
    WriteRefused { table: String, message: String },
    #[error("adapter error: {0}")]
    Adapter(#[from] anyhow::Error),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Error of a single scheduled tick. `ClaimLost` is the silent no-op case;
/// everything else counts against the per-tick retry budget.
#[derive(Error, Debug)]
pub enum TickError {
    #[error("claim lost")]
    ClaimLost,
    #[error("probabilistic skip")]
    Skipped,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl TickError {
    /// Transient errors are retried within the tick; the rest abandon it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TickError::Load(LoadError::Http(_))
                | TickError::Load(LoadError::Status { .. })
                | TickError::Load(LoadError::Rpc { .. })
                | TickError::Load(LoadError::Deadline(_))
                | TickError::Store(StoreError::Adapter(_))
                | TickError::Cache(_)
        )
    }
}
