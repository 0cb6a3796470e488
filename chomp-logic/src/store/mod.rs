//! Store & publish fan-out: schema bootstrap on first row, one write per
//! tick per ingester, latest-value cache refresh, and best-effort pub/sub
//! broadcast. Concrete database drivers live behind the [`Tsdb`] adapter.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    cache::{keys, Cache},
    error::StoreError,
    model::{Ingester, ResourceType},
    value::{FieldType, Value},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// `series`: append-only, unkeyed.
    Append,
    /// `timeseries`: append-only with uniqueness on `ts`; a repeated write
    /// for the same tick is a no-op.
    AppendUnique,
    /// `value`: the table holds exactly one row, replaced in place.
    Upsert,
}

impl From<ResourceType> for WriteMode {
    fn from(rt: ResourceType) -> Self {
        match rt {
            ResourceType::Series => WriteMode::Append,
            ResourceType::Timeseries => WriteMode::AppendUnique,
            ResourceType::Value => WriteMode::Upsert,
        }
    }
}

#[async_trait]
pub trait Tsdb: Send + Sync {
    /// Create the table if missing; otherwise reconcile the schema.
    /// Additive column changes are applied; removal or a type change is a
    /// [`StoreError::SchemaMismatch`].
    async fn ensure_table(&self, table: &str, columns: &[Column]) -> Result<(), StoreError>;

    async fn write(
        &self,
        table: &str,
        mode: WriteMode,
        ts: DateTime<Utc>,
        row: &[Value],
    ) -> Result<(), StoreError>;
}

/// Column layout of an ingester's table: `ts` followed by the non-transient
/// fields in declared order.
pub fn table_columns(ingester: &Ingester) -> Vec<Column> {
    let mut columns = vec![Column {
        name: "ts".to_string(),
        ty: FieldType::Timestamp,
    }];
    columns.extend(ingester.persistent_fields().map(|f| Column {
        name: f.name.clone(),
        ty: f.field_type(),
    }));
    columns
}

fn monitor_columns() -> Vec<Column> {
    [
        ("ts", FieldType::Timestamp),
        ("latency_ms", FieldType::Float64),
        ("response_bytes", FieldType::Uint64),
        ("status_code", FieldType::Uint32),
        ("field_count", FieldType::Uint32),
        ("cpu_percent", FieldType::Float64),
        ("rss_bytes", FieldType::Uint64),
        ("disk_read_bytes", FieldType::Uint64),
        ("disk_written_bytes", FieldType::Uint64),
    ]
    .into_iter()
    .map(|(name, ty)| Column {
        name: name.to_string(),
        ty,
    })
    .collect()
}

pub struct Store {
    tsdb: Arc<dyn Tsdb>,
    cache: Arc<dyn Cache>,
    ns: String,
    bootstrapped: DashMap<String, ()>,
}

impl Store {
    pub fn new(tsdb: Arc<dyn Tsdb>, cache: Arc<dyn Cache>, ns: &str) -> Self {
        Self {
            tsdb,
            cache,
            ns: ns.to_string(),
            bootstrapped: DashMap::new(),
        }
    }

    /// Persist one tick's row, refresh the latest-value record and
    /// broadcast. Transient fields reach the cache and the channel payload
    /// skips them; the table never sees them.
    pub async fn store_row(
        &self,
        ingester: &Ingester,
        tick: DateTime<Utc>,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        self.ensure_bootstrapped(ingester).await?;

        let row: Vec<Value> = ingester
            .persistent_fields()
            .map(|f| values.get(&f.name).cloned().unwrap_or(Value::Null))
            .collect();
        self.tsdb
            .write(
                &ingester.name,
                ingester.resource_type.into(),
                tick,
                &row,
            )
            .await?;

        self.write_latest(ingester, tick, values).await?;
        self.publish(ingester, tick, values).await;
        Ok(())
    }

    /// Bucket flush for perpetual loggers: many rows in one tick.
    pub async fn store_rows(
        &self,
        ingester: &Ingester,
        tick: DateTime<Utc>,
        rows: &[BTreeMap<String, Value>],
    ) -> Result<(), StoreError> {
        self.ensure_bootstrapped(ingester).await?;
        for values in rows {
            let row: Vec<Value> = ingester
                .persistent_fields()
                .map(|f| values.get(&f.name).cloned().unwrap_or(Value::Null))
                .collect();
            self.tsdb
                .write(&ingester.name, WriteMode::Append, tick, &row)
                .await?;
        }
        if let Some(last) = rows.last() {
            self.write_latest(ingester, tick, last).await?;
            self.publish(ingester, tick, last).await;
        }
        Ok(())
    }

    /// Sibling `{ingester}_monitor` table fed when monitoring is enabled:
    /// request vitals of the tick plus process measurements.
    pub async fn store_sibling_monitor(
        &self,
        ingester_name: &str,
        tick: DateTime<Utc>,
        vitals: &crate::vitals::RequestVitals,
        process: &crate::vitals::ProcessVitals,
    ) -> Result<(), StoreError> {
        let table = format!("{ingester_name}_monitor");
        if !self.bootstrapped.contains_key(&table) {
            self.tsdb.ensure_table(&table, &monitor_columns()).await?;
            self.bootstrapped.insert(table.clone(), ());
        }
        let row = vec![
            Value::Float(vitals.latency_ms),
            Value::UInt(vitals.response_bytes),
            Value::UInt(vitals.status_code as u64),
            Value::UInt(vitals.field_count as u64),
            Value::Float(process.cpu_percent),
            Value::UInt(process.rss_bytes),
            Value::UInt(process.disk_read_bytes),
            Value::UInt(process.disk_written_bytes),
        ];
        self.tsdb
            .write(&table, WriteMode::AppendUnique, tick, &row)
            .await
    }

    async fn ensure_bootstrapped(&self, ingester: &Ingester) -> Result<(), StoreError> {
        if self.bootstrapped.contains_key(&ingester.name) {
            return Ok(());
        }
        self.tsdb
            .ensure_table(&ingester.name, &table_columns(ingester))
            .await?;
        self.bootstrapped.insert(ingester.name.clone(), ());
        Ok(())
    }

    async fn write_latest(
        &self,
        ingester: &Ingester,
        tick: DateTime<Utc>,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut latest = serde_json::Map::new();
        latest.insert("ts".to_string(), serde_json::json!(tick.to_rfc3339()));
        for field in &ingester.fields {
            let value = values.get(&field.name).cloned().unwrap_or(Value::Null);
            latest.insert(field.name.clone(), value.to_json());
        }
        let key = keys::latest(&self.ns, &ingester.name);
        self.cache
            .set(&key, &serde_json::Value::Object(latest).to_string(), None)
            .await?;
        Ok(())
    }

    /// Best-effort: a publish failure is logged, never propagated.
    async fn publish(
        &self,
        ingester: &Ingester,
        tick: DateTime<Utc>,
        values: &BTreeMap<String, Value>,
    ) {
        let mut payload = serde_json::Map::new();
        payload.insert("ts".to_string(), serde_json::json!(tick.to_rfc3339()));
        for field in ingester.persistent_fields() {
            let value = values.get(&field.name).cloned().unwrap_or(Value::Null);
            payload.insert(field.name.clone(), value.to_json());
        }
        let channel = keys::channel(&self.ns, &ingester.name);
        let body = serde_json::Value::Object(payload).to_string();
        if let Err(err) = self.cache.publish(&channel, &body).await {
            tracing::warn!(channel, error = %err, "publish failed, row already stored");
        }
    }
}
