//! Persistent storage engine using RocksDB
//!
//! Receives the redo log of each committed unit of work as one `WriteBatch`,
//! so durable state changes all-or-nothing, and rebuilds the in-memory
//! tables on open.

use crate::error::{EngineError, Result};
use crate::relation::RelationEdge;
use crate::row_store::Row;
use crate::rules::SmartRule;
use crate::schema::{Column, Database};
use crate::store::StoreState;
use crate::transaction::Mutation;
use crate::types::{CellValue, ColumnId, RowId};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Column families for the different record kinds
const CF_DATABASES: &str = "databases";
const CF_COLUMNS: &str = "columns";
const CF_ROWS: &str = "rows";
const CF_CELLS: &str = "cells";
const CF_EDGES: &str = "edges";
const CF_RULES: &str = "rules";

/// Stored form of a cell together with the key it belongs to
#[derive(Debug, Serialize, Deserialize)]
struct StoredCell {
    row_id: RowId,
    column_id: ColumnId,
    value: CellValue,
}

/// Storage engine backed by RocksDB
pub struct StorageEngine {
    db: Arc<DB>,
}

impl StorageEngine {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_max_background_jobs(4);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![CF_DATABASES, CF_COLUMNS, CF_ROWS, CF_CELLS, CF_EDGES, CF_RULES];
        let db = DB::open_cf(&opts, path.as_ref(), cfs)
            .map_err(|e| EngineError::Storage(format!("Failed to open database: {}", e)))?;

        info!(path = %path.as_ref().display(), "opened storage engine");
        Ok(StorageEngine { db: Arc::new(db) })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EngineError::Storage(format!("Column family '{}' not found", name)))
    }

    /// Write one committed unit of work atomically
    pub fn persist(&self, mutations: &[Mutation]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for mutation in mutations {
            match mutation {
                Mutation::PutDatabase(db) => {
                    batch.put_cf(self.cf(CF_DATABASES)?, id_key(db.id.0), encode(db)?)
                }
                Mutation::DeleteDatabase(id) => batch.delete_cf(self.cf(CF_DATABASES)?, id_key(id.0)),
                Mutation::PutColumn(column) => {
                    batch.put_cf(self.cf(CF_COLUMNS)?, id_key(column.id.0), encode(column)?)
                }
                Mutation::DeleteColumn(id) => batch.delete_cf(self.cf(CF_COLUMNS)?, id_key(id.0)),
                Mutation::PutRow(row) => batch.put_cf(self.cf(CF_ROWS)?, id_key(row.id.0), encode(row)?),
                Mutation::DeleteRow(id) => batch.delete_cf(self.cf(CF_ROWS)?, id_key(id.0)),
                Mutation::PutCell {
                    row_id,
                    column_id,
                    value,
                } => {
                    let stored = StoredCell {
                        row_id: *row_id,
                        column_id: *column_id,
                        value: value.clone(),
                    };
                    batch.put_cf(self.cf(CF_CELLS)?, cell_key(*row_id, *column_id), encode(&stored)?)
                }
                Mutation::DeleteCell { row_id, column_id } => {
                    batch.delete_cf(self.cf(CF_CELLS)?, cell_key(*row_id, *column_id))
                }
                Mutation::PutEdge(edge) => batch.put_cf(
                    self.cf(CF_EDGES)?,
                    edge_key(edge.source_row_id, edge.source_column_id, edge.target_row_id),
                    encode(edge)?,
                ),
                Mutation::DeleteEdge {
                    source_row_id,
                    source_column_id,
                    target_row_id,
                } => batch.delete_cf(
                    self.cf(CF_EDGES)?,
                    edge_key(*source_row_id, *source_column_id, *target_row_id),
                ),
                Mutation::PutRule(rule) => {
                    batch.put_cf(self.cf(CF_RULES)?, id_key(rule.id.0), encode(rule)?)
                }
                Mutation::DeleteRule(id) => batch.delete_cf(self.cf(CF_RULES)?, id_key(id.0)),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| EngineError::Storage(format!("Batch write error: {}", e)))
    }

    /// Rebuild the in-memory tables from disk
    pub fn load(&self) -> Result<StoreState> {
        let mut state = StoreState::default();

        for db in self.scan::<Database>(CF_DATABASES)? {
            state.apply(&Mutation::PutDatabase(db));
        }
        for column in self.scan::<Column>(CF_COLUMNS)? {
            state.apply(&Mutation::PutColumn(column));
        }
        for row in self.scan::<Row>(CF_ROWS)? {
            state.apply(&Mutation::PutRow(row));
        }
        for stored in self.scan::<StoredCell>(CF_CELLS)? {
            state.apply(&Mutation::PutCell {
                row_id: stored.row_id,
                column_id: stored.column_id,
                value: stored.value,
            });
        }
        for edge in self.scan::<RelationEdge>(CF_EDGES)? {
            state.apply(&Mutation::PutEdge(edge));
        }
        for rule in self.scan::<SmartRule>(CF_RULES)? {
            state.apply(&Mutation::PutRule(rule));
        }

        Ok(state)
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &'static str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) =
                item.map_err(|e| EngineError::Storage(format!("Iterator error: {}", e)))?;
            records.push(bincode::deserialize(&value)?);
        }

        Ok(records)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| EngineError::Storage(format!("Flush error: {}", e)))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

// Key encoding functions

fn id_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn cell_key(row: RowId, column: ColumnId) -> Vec<u8> {
    format!("c:{}:{}", row.0, column.0).into_bytes()
}

fn edge_key(source: RowId, column: ColumnId, target: RowId) -> Vec<u8> {
    format!("g:{}:{}:{}", source.0, column.0, target.0).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::types::DatabaseId;
    use tempfile::TempDir;

    #[test]
    fn test_storage_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageEngine::open(temp_dir.path()).unwrap();

        let db = Database::new(DatabaseId::new(1), "Tasks".to_string());
        storage
            .persist(&[
                Mutation::PutDatabase(db.clone()),
                Mutation::PutCell {
                    row_id: RowId::new(5),
                    column_id: ColumnId::new(2),
                    value: CellValue::MultiSelect(vec!["x".to_string()]),
                },
                Mutation::PutEdge(RelationEdge {
                    source_row_id: RowId::new(5),
                    source_column_id: ColumnId::new(3),
                    target_row_id: RowId::new(6),
                    order: 0,
                }),
            ])
            .unwrap();

        let state = storage.load().unwrap();
        assert_eq!(state.database(db.id).unwrap().name, "Tasks");
        assert_eq!(
            state.cell(RowId::new(5), ColumnId::new(2)),
            Some(&CellValue::MultiSelect(vec!["x".to_string()]))
        );
        assert_eq!(
            state.targets(RowId::new(5), ColumnId::new(3)),
            vec![RowId::new(6)]
        );
    }

    #[test]
    fn test_deletes_are_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageEngine::open(temp_dir.path()).unwrap();
        let db = Database::new(DatabaseId::new(4), "Gone".to_string());

        storage.persist(&[Mutation::PutDatabase(db)]).unwrap();
        storage
            .persist(&[Mutation::DeleteDatabase(DatabaseId::new(4))])
            .unwrap();

        assert!(storage.load().unwrap().databases().next().is_none());
    }
}
