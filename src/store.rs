//! Shared relational store handle
//!
//! Holds every record (databases, columns, rows, cells, relation edges,
//! rules) in one set of in-memory tables guarded by a single lock, with an
//! optional RocksDB backend receiving each committed unit of work. Writers
//! serialize on the lock; readers take it per call.

use crate::error::Result;
use crate::relation::RelationEdge;
use crate::row_store::Row;
use crate::rules::SmartRule;
use crate::schema::{Column, Database};
use crate::storage::StorageEngine;
use crate::transaction::{rollback, Mutation, Transaction};
use crate::types::{CellValue, ColumnId, DatabaseId, RowId, RuleId};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// In-memory tables
#[derive(Debug, Default, Clone)]
pub struct StoreState {
    databases: BTreeMap<DatabaseId, Database>,
    columns: BTreeMap<ColumnId, Column>,
    rows: BTreeMap<RowId, Row>,
    cells: HashMap<(RowId, ColumnId), CellValue>,
    // (source row, column) -> edges ordered by `order`
    edges: BTreeMap<(RowId, ColumnId), Vec<RelationEdge>>,
    // target row -> (source row, column) pairs linking to it
    incoming: HashMap<RowId, BTreeSet<(RowId, ColumnId)>>,
    rules: BTreeMap<RuleId, SmartRule>,
}

impl StoreState {
    pub fn database(&self, id: DatabaseId) -> Option<&Database> {
        self.databases.get(&id)
    }

    pub fn databases(&self) -> impl Iterator<Item = &Database> {
        self.databases.values()
    }

    pub fn column(&self, id: ColumnId) -> Option<&Column> {
        self.columns.get(&id)
    }

    /// Columns of one database in display order
    pub fn columns_of(&self, database_id: DatabaseId) -> Vec<&Column> {
        let mut columns: Vec<&Column> = self
            .columns
            .values()
            .filter(|c| c.database_id == database_id)
            .collect();
        columns.sort_by_key(|c| (c.order, c.id));
        columns
    }

    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.get(&id)
    }

    pub fn rows_of(&self, database_id: DatabaseId) -> impl Iterator<Item = &Row> {
        self.rows.values().filter(move |r| r.database_id == database_id)
    }

    pub fn cell(&self, row_id: RowId, column_id: ColumnId) -> Option<&CellValue> {
        self.cells.get(&(row_id, column_id))
    }

    /// Cells stored for a column, across all rows
    pub fn cells_of_column(&self, column_id: ColumnId) -> Vec<RowId> {
        self.cells
            .keys()
            .filter(|(_, c)| *c == column_id)
            .map(|(r, _)| *r)
            .collect()
    }

    pub fn cells_of_row(&self, row_id: RowId) -> Vec<ColumnId> {
        self.cells
            .keys()
            .filter(|(r, _)| *r == row_id)
            .map(|(_, c)| *c)
            .collect()
    }

    /// Outgoing edges of (row, column), ordered
    pub fn edges(&self, row_id: RowId, column_id: ColumnId) -> &[RelationEdge] {
        self.edges
            .get(&(row_id, column_id))
            .map(|edges| edges.as_slice())
            .unwrap_or(&[])
    }

    /// Ordered target row ids of (row, column)
    pub fn targets(&self, row_id: RowId, column_id: ColumnId) -> Vec<RowId> {
        self.edges(row_id, column_id)
            .iter()
            .map(|e| e.target_row_id)
            .collect()
    }

    /// Every (row, column) edge list belonging to a column
    pub fn edge_sources_of_column(&self, column_id: ColumnId) -> Vec<RowId> {
        self.edges
            .keys()
            .filter(|(_, c)| *c == column_id)
            .map(|(r, _)| *r)
            .collect()
    }

    /// Outgoing (column, edges) lists of a row
    pub fn outgoing_columns(&self, row_id: RowId) -> Vec<ColumnId> {
        self.edges
            .range((row_id, ColumnId(0))..=(row_id, ColumnId(u64::MAX)))
            .map(|((_, c), _)| *c)
            .collect()
    }

    /// (source row, column) pairs pointing at `row_id`
    pub fn incoming(&self, row_id: RowId) -> Vec<(RowId, ColumnId)> {
        self.incoming
            .get(&row_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rule(&self, id: RuleId) -> Option<&SmartRule> {
        self.rules.get(&id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &SmartRule> {
        self.rules.values()
    }

    /// Highest id used by any record
    pub fn max_id(&self) -> u64 {
        let databases = self.databases.keys().map(|id| id.0).max().unwrap_or(0);
        let columns = self.columns.keys().map(|id| id.0).max().unwrap_or(0);
        let rows = self.rows.keys().map(|id| id.0).max().unwrap_or(0);
        let rules = self.rules.keys().map(|id| id.0).max().unwrap_or(0);
        databases.max(columns).max(rows).max(rules)
    }

    /// Apply one mutation, returning the mutation that reverts it
    pub(crate) fn apply(&mut self, mutation: &Mutation) -> Option<Mutation> {
        match mutation {
            Mutation::PutDatabase(db) => Some(
                match self.databases.insert(db.id, db.clone()) {
                    Some(prior) => Mutation::PutDatabase(prior),
                    None => Mutation::DeleteDatabase(db.id),
                },
            ),
            Mutation::DeleteDatabase(id) => self.databases.remove(id).map(Mutation::PutDatabase),
            Mutation::PutColumn(column) => Some(
                match self.columns.insert(column.id, column.clone()) {
                    Some(prior) => Mutation::PutColumn(prior),
                    None => Mutation::DeleteColumn(column.id),
                },
            ),
            Mutation::DeleteColumn(id) => self.columns.remove(id).map(Mutation::PutColumn),
            Mutation::PutRow(row) => Some(match self.rows.insert(row.id, row.clone()) {
                Some(prior) => Mutation::PutRow(prior),
                None => Mutation::DeleteRow(row.id),
            }),
            Mutation::DeleteRow(id) => self.rows.remove(id).map(Mutation::PutRow),
            Mutation::PutCell {
                row_id,
                column_id,
                value,
            } => Some(
                match self.cells.insert((*row_id, *column_id), value.clone()) {
                    Some(prior) => Mutation::PutCell {
                        row_id: *row_id,
                        column_id: *column_id,
                        value: prior,
                    },
                    None => Mutation::DeleteCell {
                        row_id: *row_id,
                        column_id: *column_id,
                    },
                },
            ),
            Mutation::DeleteCell { row_id, column_id } => self
                .cells
                .remove(&(*row_id, *column_id))
                .map(|prior| Mutation::PutCell {
                    row_id: *row_id,
                    column_id: *column_id,
                    value: prior,
                }),
            Mutation::PutEdge(edge) => Some(self.put_edge(edge)),
            Mutation::DeleteEdge {
                source_row_id,
                source_column_id,
                target_row_id,
            } => self
                .delete_edge(*source_row_id, *source_column_id, *target_row_id)
                .map(Mutation::PutEdge),
            Mutation::PutRule(rule) => Some(match self.rules.insert(rule.id, rule.clone()) {
                Some(prior) => Mutation::PutRule(prior),
                None => Mutation::DeleteRule(rule.id),
            }),
            Mutation::DeleteRule(id) => self.rules.remove(id).map(Mutation::PutRule),
        }
    }

    fn put_edge(&mut self, edge: &RelationEdge) -> Mutation {
        let key = (edge.source_row_id, edge.source_column_id);
        let list = self.edges.entry(key).or_default();

        let prior = list
            .iter()
            .position(|e| e.target_row_id == edge.target_row_id)
            .map(|idx| list.remove(idx));
        list.push(edge.clone());
        list.sort_by_key(|e| (e.order, e.target_row_id));

        self.incoming
            .entry(edge.target_row_id)
            .or_default()
            .insert(key);

        match prior {
            Some(prior) => Mutation::PutEdge(prior),
            None => Mutation::DeleteEdge {
                source_row_id: edge.source_row_id,
                source_column_id: edge.source_column_id,
                target_row_id: edge.target_row_id,
            },
        }
    }

    fn delete_edge(
        &mut self,
        source_row_id: RowId,
        source_column_id: ColumnId,
        target_row_id: RowId,
    ) -> Option<RelationEdge> {
        let key = (source_row_id, source_column_id);
        let list = self.edges.get_mut(&key)?;
        let idx = list.iter().position(|e| e.target_row_id == target_row_id)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            self.edges.remove(&key);
        }

        if let Some(sources) = self.incoming.get_mut(&target_row_id) {
            sources.remove(&key);
            if sources.is_empty() {
                self.incoming.remove(&target_row_id);
            }
        }

        Some(removed)
    }
}

/// Shared store handle passed to every component
pub struct Store {
    state: RwLock<StoreState>,
    storage: Option<StorageEngine>,
    next_id: AtomicU64,
    next_txn_id: AtomicU64,
}

impl Store {
    /// Purely in-memory store
    pub fn in_memory() -> Self {
        Store {
            state: RwLock::new(StoreState::default()),
            storage: None,
            next_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Open (or create) a RocksDB-backed store and reload its records
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = StorageEngine::open(path)?;
        let state = storage.load()?;
        let next_id = state.max_id() + 1;
        debug!(next_id, "store reloaded from disk");

        Ok(Store {
            state: RwLock::new(state),
            storage: Some(storage),
            next_id: AtomicU64::new(next_id),
            next_txn_id: AtomicU64::new(1),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.storage.is_some()
    }

    /// Shared read access; not a snapshot across calls
    pub fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read()
    }

    /// Run `work` as one atomic unit: either every mutation it applies
    /// commits (in memory and on disk) or none does.
    pub fn transact<T>(&self, work: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);

        let mut txn = Transaction::new(txn_id, &mut *state, &self.next_id);
        let outcome = work(&mut txn);
        let (undo, redo) = txn.finish();

        match outcome {
            Ok(value) => {
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.persist(&redo) {
                        error!(txn_id, error = %e, "persisting unit of work failed, rolling back");
                        rollback(&mut state, undo);
                        return Err(e);
                    }
                }
                debug!(txn_id, mutations = redo.len(), "unit of work committed");
                Ok(value)
            }
            Err(e) => {
                debug!(txn_id, error = %e, "unit of work rolled back");
                rollback(&mut state, undo);
                Err(e)
            }
        }
    }

    /// Flush the durable backend, if any
    pub fn flush(&self) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.flush(),
            None => Ok(()),
        }
    }
}
