//! In-memory time-series adapter for tests and dry runs. Implements the
//! same schema discipline a SQL adapter would: additive alters only,
//! uniqueness on `ts` for timeseries tables.

use std::{
    collections::BTreeMap,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Column, Tsdb, WriteMode};
use crate::{error::StoreError, value::Value};

#[derive(Debug, Default)]
struct Table {
    columns: Vec<Column>,
    /// keyed rows for timeseries/value tables
    keyed: BTreeMap<i64, Vec<Value>>,
    /// unkeyed rows for series tables
    appended: Vec<(i64, Vec<Value>)>,
}

#[derive(Default)]
pub struct MemoryTsdb {
    tables: Mutex<BTreeMap<String, Table>>,
}

impl MemoryTsdb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(&self, table: &str) -> Option<Vec<Column>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.columns.clone())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.keyed.len() + t.appended.len())
            .unwrap_or(0)
    }

    /// All rows in storage order, `(ts, values)` with `ts` excluded from
    /// the value vector.
    pub fn rows(&self, table: &str) -> Vec<(DateTime<Utc>, Vec<Value>)> {
        let tables = self.tables.lock().unwrap();
        let Some(table) = tables.get(table) else {
            return Vec::new();
        };
        let mut out: Vec<(i64, Vec<Value>)> = table
            .keyed
            .iter()
            .map(|(ts, row)| (*ts, row.clone()))
            .collect();
        out.extend(table.appended.iter().cloned());
        out.into_iter()
            .map(|(ts, row)| {
                (
                    chrono::TimeZone::timestamp_opt(&Utc, ts, 0).unwrap(),
                    row,
                )
            })
            .collect()
    }
}

#[async_trait]
impl Tsdb for MemoryTsdb {
    async fn ensure_table(&self, table: &str, columns: &[Column]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        match tables.get_mut(table) {
            None => {
                tables.insert(
                    table.to_string(),
                    Table {
                        columns: columns.to_vec(),
                        ..Default::default()
                    },
                );
                Ok(())
            }
            Some(existing) => {
                if columns.len() < existing.columns.len() {
                    return Err(StoreError::SchemaMismatch {
                        table: table.to_string(),
                        message: "column removal is not supported".to_string(),
                    });
                }
                for (old, new) in existing.columns.iter().zip(columns) {
                    if old != new {
                        return Err(StoreError::SchemaMismatch {
                            table: table.to_string(),
                            message: format!(
                                "column {} changed from {} to {}",
                                old.name,
                                old.ty.sql_name(),
                                new.ty.sql_name()
                            ),
                        });
                    }
                }
                // additive alter: new columns appended, old rows padded
                if columns.len() > existing.columns.len() {
                    let added = columns.len() - existing.columns.len();
                    for row in existing.keyed.values_mut() {
                        row.extend(std::iter::repeat(Value::Null).take(added));
                    }
                    for (_, row) in existing.appended.iter_mut() {
                        row.extend(std::iter::repeat(Value::Null).take(added));
                    }
                    existing.columns = columns.to_vec();
                }
                Ok(())
            }
        }
    }

    async fn write(
        &self,
        table: &str,
        mode: WriteMode,
        ts: DateTime<Utc>,
        row: &[Value],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let table_state = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::WriteRefused {
                table: table.to_string(),
                message: "table was never bootstrapped".to_string(),
            })?;

        if row.len() + 1 != table_state.columns.len() {
            return Err(StoreError::WriteRefused {
                table: table.to_string(),
                message: format!(
                    "row has {} values, table has {} columns",
                    row.len(),
                    table_state.columns.len() - 1
                ),
            });
        }

        match mode {
            WriteMode::Append => table_state.appended.push((ts.timestamp(), row.to_vec())),
            WriteMode::AppendUnique => {
                // repeating a tick's store produces no duplicate row
                table_state
                    .keyed
                    .entry(ts.timestamp())
                    .or_insert_with(|| row.to_vec());
            }
            WriteMode::Upsert => {
                table_state.keyed.clear();
                table_state.keyed.insert(0, row.to_vec());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldType;
    use pretty_assertions::assert_eq;

    fn cols(names: &[(&str, FieldType)]) -> Vec<Column> {
        names
            .iter()
            .map(|(name, ty)| Column {
                name: name.to_string(),
                ty: *ty,
            })
            .collect()
    }

    #[tokio::test]
    async fn additive_alter_pads_existing_rows() {
        let tsdb = MemoryTsdb::new();
        let base = cols(&[("ts", FieldType::Timestamp), ("a", FieldType::Float64)]);
        tsdb.ensure_table("t", &base).await.unwrap();
        tsdb.write("t", WriteMode::AppendUnique, Utc::now(), &[Value::Float(1.0)])
            .await
            .unwrap();

        let extended = cols(&[
            ("ts", FieldType::Timestamp),
            ("a", FieldType::Float64),
            ("b", FieldType::Int64),
        ]);
        tsdb.ensure_table("t", &extended).await.unwrap();
        let rows = tsdb.rows("t");
        assert_eq!(rows[0].1, vec![Value::Float(1.0), Value::Null]);
    }

    #[tokio::test]
    async fn type_change_is_refused() {
        let tsdb = MemoryTsdb::new();
        tsdb.ensure_table(
            "t",
            &cols(&[("ts", FieldType::Timestamp), ("a", FieldType::Float64)]),
        )
        .await
        .unwrap();
        let err = tsdb
            .ensure_table(
                "t",
                &cols(&[("ts", FieldType::Timestamp), ("a", FieldType::Int64)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn column_removal_is_refused() {
        let tsdb = MemoryTsdb::new();
        tsdb.ensure_table(
            "t",
            &cols(&[
                ("ts", FieldType::Timestamp),
                ("a", FieldType::Float64),
                ("b", FieldType::Float64),
            ]),
        )
        .await
        .unwrap();
        let err = tsdb
            .ensure_table(
                "t",
                &cols(&[("ts", FieldType::Timestamp), ("a", FieldType::Float64)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }
}
