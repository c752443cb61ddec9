//! Transaction Management
//!
//! Every multi-record mutation (cell writes, edge diffs with inverse
//! mirroring, schema changes) runs as one unit of work. Mutations are applied
//! to the in-memory tables immediately so later steps observe earlier ones;
//! each application records its inverse in an undo log, and the redo log is
//! what the durable backend receives on commit.

use crate::relation::RelationEdge;
use crate::row_store::Row;
use crate::rules::SmartRule;
use crate::schema::{Column, Database};
use crate::store::StoreState;
use crate::types::{CellValue, ColumnId, DatabaseId, RowId, RuleId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique transaction identifier
pub type TransactionId = u64;

/// A single record-level change
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PutDatabase(Database),
    DeleteDatabase(DatabaseId),
    PutColumn(Column),
    DeleteColumn(ColumnId),
    PutRow(Row),
    DeleteRow(RowId),
    PutCell {
        row_id: RowId,
        column_id: ColumnId,
        value: CellValue,
    },
    DeleteCell {
        row_id: RowId,
        column_id: ColumnId,
    },
    PutEdge(RelationEdge),
    DeleteEdge {
        source_row_id: RowId,
        source_column_id: ColumnId,
        target_row_id: RowId,
    },
    PutRule(SmartRule),
    DeleteRule(RuleId),
}

/// Open unit of work over the locked store state
pub struct Transaction<'a> {
    id: TransactionId,
    state: &'a mut StoreState,
    ids: &'a AtomicU64,
    undo: Vec<Mutation>,
    redo: Vec<Mutation>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(id: TransactionId, state: &'a mut StoreState, ids: &'a AtomicU64) -> Self {
        Transaction {
            id,
            state,
            ids,
            undo: Vec::new(),
            redo: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Current state, including this transaction's own writes
    pub fn state(&self) -> &StoreState {
        self.state
    }

    /// Allocate a fresh record id
    pub fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Apply a mutation and remember how to undo it
    pub fn apply(&mut self, mutation: Mutation) {
        if let Some(inverse) = self.state.apply(&mutation) {
            self.undo.push(inverse);
        }
        self.redo.push(mutation);
    }

    /// Number of mutations applied so far
    pub fn len(&self) -> usize {
        self.redo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redo.is_empty()
    }

    /// Close the transaction, handing back (undo, redo)
    pub(crate) fn finish(self) -> (Vec<Mutation>, Vec<Mutation>) {
        (self.undo, self.redo)
    }
}

/// Revert applied mutations, newest first
pub(crate) fn rollback(state: &mut StoreState, undo: Vec<Mutation>) {
    for inverse in undo.into_iter().rev() {
        state.apply(&inverse);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    #[test]
    fn test_rollback_restores_previous_state() {
        let mut state = StoreState::default();
        let ids = AtomicU64::new(1);
        let db = Database::new(DatabaseId::new(1), "Tasks".to_string());
        state.apply(&Mutation::PutDatabase(db.clone()));

        let mut txn = Transaction::new(1, &mut state, &ids);
        let mut renamed = db.clone();
        renamed.name = "Projects".to_string();
        txn.apply(Mutation::PutDatabase(renamed));
        txn.apply(Mutation::PutDatabase(Database::new(
            DatabaseId::new(2),
            "Other".to_string(),
        )));
        assert_eq!(txn.len(), 2);
        let (undo, _redo) = txn.finish();

        rollback(&mut state, undo);
        assert_eq!(state.database(DatabaseId::new(1)).unwrap().name, "Tasks");
        assert!(state.database(DatabaseId::new(2)).is_none());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut state = StoreState::default();
        let ids = AtomicU64::new(10);
        let txn = Transaction::new(7, &mut state, &ids);
        assert_eq!(txn.next_id(), 10);
        assert_eq!(txn.next_id(), 11);
        assert_eq!(txn.id(), 7);
    }
}
