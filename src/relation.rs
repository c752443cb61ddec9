//! Relation Linker
//!
//! Maintains directed, ordered edges between rows and keeps paired relation
//! columns symmetric: for a paired (C, I), an edge A -C-> B exists iff the
//! edge B -I-> A exists. All edge changes happen inside the caller's unit of
//! work, so mirroring either fully commits or fully rolls back.

use crate::error::{EngineError, Result};
use crate::schema::Column;
use crate::store::StoreState;
use crate::transaction::{Mutation, Transaction};
use crate::types::{ColumnId, DatabaseId, RowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Directed relation link, ordered within its (source row, column) list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEdge {
    pub source_row_id: RowId,
    pub source_column_id: ColumnId,
    pub target_row_id: RowId,
    pub order: u32,
}

/// Difference between an old and a new target list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EdgeSetDiff {
    pub added: Vec<RowId>,
    pub removed: Vec<RowId>,
    /// Kept targets changed relative order
    pub reordered: bool,
}

impl EdgeSetDiff {
    pub fn compute(old: &[RowId], new: &[RowId]) -> Self {
        let old_set: HashSet<RowId> = old.iter().copied().collect();
        let new_set: HashSet<RowId> = new.iter().copied().collect();

        let added: Vec<RowId> = new.iter().copied().filter(|r| !old_set.contains(r)).collect();
        let removed: Vec<RowId> = old.iter().copied().filter(|r| !new_set.contains(r)).collect();

        let kept_old = old.iter().filter(|r| new_set.contains(r));
        let kept_new = new.iter().filter(|r| old_set.contains(r));
        let reordered = !kept_old.eq(kept_new);

        EdgeSetDiff {
            added,
            removed,
            reordered,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.reordered
    }
}

/// Stateless edge maintenance over a unit of work
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationLinker;

impl RelationLinker {
    pub fn new() -> Self {
        RelationLinker
    }

    /// Replace the ordered target list of (row, column).
    ///
    /// Only added and removed targets are mirrored onto the inverse column;
    /// a pure reorder touches this side only.
    pub fn replace_edges(
        &self,
        txn: &mut Transaction<'_>,
        row_id: RowId,
        column_id: ColumnId,
        targets: &[RowId],
    ) -> Result<EdgeSetDiff> {
        let column = relation_column(txn.state(), column_id)?;
        let target_db = column
            .kind
            .relation_target()
            .ok_or_else(|| EngineError::validation(format!("column '{}' is not a relation", column.name)))?;
        let wanted = validate_targets(txn.state(), &column, target_db, targets)?;

        let current = txn.state().targets(row_id, column_id);
        let diff = EdgeSetDiff::compute(&current, &wanted);
        if diff.is_empty() {
            return Ok(diff);
        }
        let inverse = column.inverse();

        for target in &diff.removed {
            txn.apply(Mutation::DeleteEdge {
                source_row_id: row_id,
                source_column_id: column_id,
                target_row_id: *target,
            });
            if let Some(inverse) = inverse {
                mirror_remove(txn, inverse, *target, row_id);
            }
        }

        for (idx, target) in wanted.iter().enumerate() {
            let order = idx as u32;
            let unchanged = txn
                .state()
                .edges(row_id, column_id)
                .iter()
                .any(|e| e.target_row_id == *target && e.order == order);
            if !unchanged {
                txn.apply(Mutation::PutEdge(RelationEdge {
                    source_row_id: row_id,
                    source_column_id: column_id,
                    target_row_id: *target,
                    order,
                }));
            }
        }

        if let Some(inverse) = inverse {
            for target in &diff.added {
                mirror_add(txn, inverse, *target, row_id);
            }
        }

        debug!(
            row_id = %row_id,
            column_id = %column_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            reordered = diff.reordered,
            "relation edges replaced"
        );
        Ok(diff)
    }

    /// Append targets not already linked
    pub fn add_edges(
        &self,
        txn: &mut Transaction<'_>,
        row_id: RowId,
        column_id: ColumnId,
        targets: &[RowId],
    ) -> Result<EdgeSetDiff> {
        let mut wanted = txn.state().targets(row_id, column_id);
        for target in targets {
            if !wanted.contains(target) {
                wanted.push(*target);
            }
        }
        self.replace_edges(txn, row_id, column_id, &wanted)
    }

    /// Drop the given targets, keeping the rest in order
    pub fn remove_edges(
        &self,
        txn: &mut Transaction<'_>,
        row_id: RowId,
        column_id: ColumnId,
        targets: &[RowId],
    ) -> Result<EdgeSetDiff> {
        let wanted: Vec<RowId> = txn
            .state()
            .targets(row_id, column_id)
            .into_iter()
            .filter(|t| !targets.contains(t))
            .collect();
        self.replace_edges(txn, row_id, column_id, &wanted)
    }

    /// Delete every edge of a column without mirroring
    pub fn clear_column(&self, txn: &mut Transaction<'_>, column_id: ColumnId) {
        let mut removed = 0usize;
        for source in txn.state().edge_sources_of_column(column_id) {
            for target in txn.state().targets(source, column_id) {
                txn.apply(Mutation::DeleteEdge {
                    source_row_id: source,
                    source_column_id: column_id,
                    target_row_id: target,
                });
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(column_id = %column_id, removed, "relation column cleared");
        }
    }

    /// Remove every edge touching a row, mirrored where paired
    pub fn detach_row(&self, txn: &mut Transaction<'_>, row_id: RowId) {
        for column_id in txn.state().outgoing_columns(row_id) {
            let inverse = txn.state().column(column_id).and_then(Column::inverse);
            for target in txn.state().targets(row_id, column_id) {
                txn.apply(Mutation::DeleteEdge {
                    source_row_id: row_id,
                    source_column_id: column_id,
                    target_row_id: target,
                });
                if let Some(inverse) = inverse {
                    mirror_remove(txn, inverse, target, row_id);
                }
            }
        }

        for (source, column_id) in txn.state().incoming(row_id) {
            txn.apply(Mutation::DeleteEdge {
                source_row_id: source,
                source_column_id: column_id,
                target_row_id: row_id,
            });
        }
    }

    /// Bring a newly paired (a, b) into symmetry by mirroring existing edges
    pub fn sync_pair(&self, txn: &mut Transaction<'_>, a: ColumnId, b: ColumnId) {
        for (from, to) in [(a, b), (b, a)] {
            for source in txn.state().edge_sources_of_column(from) {
                for target in txn.state().targets(source, from) {
                    mirror_add(txn, to, target, source);
                }
            }
        }
    }
}

fn relation_column(state: &StoreState, column_id: ColumnId) -> Result<Column> {
    state
        .column(column_id)
        .cloned()
        .ok_or_else(|| EngineError::referential(format!("column {} not found", column_id)))
}

/// Dedupe keeping first occurrence; every target must live in `target_db`
fn validate_targets(
    state: &StoreState,
    column: &Column,
    target_db: DatabaseId,
    targets: &[RowId],
) -> Result<Vec<RowId>> {
    let mut seen = HashSet::new();
    let mut wanted = Vec::with_capacity(targets.len());
    for target in targets {
        if !seen.insert(*target) {
            continue;
        }
        let row = state
            .row(*target)
            .ok_or_else(|| EngineError::referential(format!("target row {} not found", target)))?;
        if row.database_id != target_db {
            return Err(EngineError::referential(format!(
                "row {} is not in database {} targeted by '{}'",
                target, target_db, column.name
            )));
        }
        wanted.push(*target);
    }
    Ok(wanted)
}

/// Ensure `row -inverse-> source` exists, appended at the end
fn mirror_add(txn: &mut Transaction<'_>, inverse: ColumnId, row_id: RowId, source: RowId) {
    let edges = txn.state().edges(row_id, inverse);
    if edges.iter().any(|e| e.target_row_id == source) {
        return;
    }
    let order = edges.iter().map(|e| e.order + 1).max().unwrap_or(0);
    trace!(row_id = %row_id, column_id = %inverse, target = %source, "mirroring edge");
    txn.apply(Mutation::PutEdge(RelationEdge {
        source_row_id: row_id,
        source_column_id: inverse,
        target_row_id: source,
        order,
    }));
}

fn mirror_remove(txn: &mut Transaction<'_>, inverse: ColumnId, row_id: RowId, source: RowId) {
    if txn.state().edges(row_id, inverse).iter().any(|e| e.target_row_id == source) {
        txn.apply(Mutation::DeleteEdge {
            source_row_id: row_id,
            source_column_id: inverse,
            target_row_id: source,
        });
    }
}
