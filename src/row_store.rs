//! Row Store
//!
//! Row CRUD, per-kind coercion of raw cell values, and the staged
//! materialization of a row:
//!
//! 1. stored cells and relation target lists
//! 2. FORMULA columns, in column order
//! 3. ROLLUP columns
//! 4. LOOKUP columns
//!
//! Rollups and lookups may chain into computed columns of other rows. Each
//! read tracks the (row, column) pairs it is resolving and yields
//! `#CYCLE_ERROR!` when it re-enters one.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::formula::{coerce_result, CompiledFormula};
use crate::relation::RelationLinker;
use crate::rollup::{aggregate_joined, RollupFunction};
use crate::rules::{RuleEngine, TriggerReport};
use crate::schema::{effective_value_type, Column, ColumnKind, LookupPolicy};
use crate::store::{Store, StoreState};
use crate::transaction::{Mutation, Transaction};
use crate::types::{
    date_from_millis, format_number, normalize_date, CellValue, ColumnId, DatabaseId, RawValue,
    RowId, Sentinel, Value,
};
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Raw values keyed by column, as handed in by a collaborator
pub type RowValues = BTreeMap<ColumnId, RawValue>;

/// Stored row record; cells and edges live in their own tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub database_id: DatabaseId,
    /// Manual display order
    pub order: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Row {
    pub fn new(id: RowId, database_id: DatabaseId) -> Self {
        let now = Utc::now();
        Row {
            id,
            database_id,
            order: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A row with every column resolved
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRow {
    pub id: RowId,
    pub database_id: DatabaseId,
    pub order: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub values: BTreeMap<ColumnId, Value>,
    /// Columns read from a cell slot rather than edges or computation
    pub stored: BTreeSet<ColumnId>,
}

static NULL: Value = Value::Null;

impl MaterializedRow {
    /// Value of a column, `Null` if the column is unknown
    pub fn get(&self, column_id: ColumnId) -> &Value {
        self.values.get(&column_id).unwrap_or(&NULL)
    }
}

impl Serialize for MaterializedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("MaterializedRow", 6)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("database_id", &self.database_id)?;
        state.serialize_field("order", &self.order)?;
        state.serialize_field("created_at", &self.created_at)?;
        state.serialize_field("updated_at", &self.updated_at)?;
        state.serialize_field("values", &WireValues(self))?;
        state.end()
    }
}

/// Stored cells go out as slot records; edges and computed values as-is
struct WireValues<'a>(&'a MaterializedRow);

impl Serialize for WireValues<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let row = self.0;
        let mut map = serializer.serialize_map(Some(row.values.len()))?;
        for (column_id, value) in &row.values {
            let record = if row.stored.contains(column_id) {
                value.to_cell_record()
            } else {
                None
            };
            match record {
                Some(record) => map.serialize_entry(column_id, &record)?,
                None => map.serialize_entry(column_id, value)?,
            }
        }
        map.end()
    }
}

/// Outcome of `update_row` and the link operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateReport {
    pub row_id: RowId,
    /// Columns the write touched
    pub written: Vec<ColumnId>,
    /// Computed columns named in the payload and ignored
    pub skipped: Vec<ColumnId>,
    pub triggers: TriggerReport,
}

/// Row CRUD and materialization over the shared store
pub struct RowStore {
    store: Arc<Store>,
    linker: RelationLinker,
    rules: RuleEngine,
    separator: String,
}

impl RowStore {
    pub fn new(store: Arc<Store>, config: &EngineConfig) -> Self {
        RowStore {
            rules: RuleEngine::new(Arc::clone(&store), config.max_trigger_depth),
            store,
            linker: RelationLinker::new(),
            separator: config.list_separator.clone(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Insert a row and its initial values in one unit of work
    #[instrument(skip_all, fields(database_id = %database_id))]
    pub fn add_row(&self, database_id: DatabaseId, values: &RowValues) -> Result<RowId> {
        self.store.transact(|txn| {
            if txn.state().database(database_id).is_none() {
                return Err(EngineError::not_found("database", database_id.0));
            }
            let row = Row::new(RowId::new(txn.next_id()), database_id);
            txn.apply(Mutation::PutRow(row.clone()));
            let (written, _) = self.write_values(txn, &row, values)?;
            debug!(row_id = %row.id, columns = written.len(), "row added");
            Ok(row.id)
        })
    }

    /// Write values, stamp `updated_at`, then run smart rules
    pub fn update_row(&self, row_id: RowId, values: &RowValues) -> Result<UpdateReport> {
        self.update_row_at_depth(row_id, values, 0)
    }

    /// `update_row` inside a rule cascade; `depth` is the cascade level
    #[instrument(skip_all, fields(row_id = %row_id, depth = depth))]
    pub(crate) fn update_row_at_depth(
        &self,
        row_id: RowId,
        values: &RowValues,
        depth: usize,
    ) -> Result<UpdateReport> {
        self.mutate_row(row_id, depth, |txn, row| self.write_values(txn, row, values))
    }

    /// Append targets to a relation cell, mirrored on the inverse
    #[instrument(skip_all, fields(row_id = %row_id, column_id = %column_id))]
    pub fn link_rows(
        &self,
        row_id: RowId,
        column_id: ColumnId,
        targets: &[RowId],
    ) -> Result<UpdateReport> {
        self.mutate_row(row_id, 0, |txn, row| {
            relation_of_row(txn.state(), row, column_id)?;
            self.linker.add_edges(txn, row_id, column_id, targets)?;
            Ok((vec![column_id], Vec::new()))
        })
    }

    /// Remove targets from a relation cell, mirrored on the inverse
    #[instrument(skip_all, fields(row_id = %row_id, column_id = %column_id))]
    pub fn unlink_rows(
        &self,
        row_id: RowId,
        column_id: ColumnId,
        targets: &[RowId],
    ) -> Result<UpdateReport> {
        self.mutate_row(row_id, 0, |txn, row| {
            relation_of_row(txn.state(), row, column_id)?;
            self.linker.remove_edges(txn, row_id, column_id, targets)?;
            Ok((vec![column_id], Vec::new()))
        })
    }

    fn mutate_row(
        &self,
        row_id: RowId,
        depth: usize,
        work: impl FnOnce(&mut Transaction<'_>, &Row) -> Result<(Vec<ColumnId>, Vec<ColumnId>)>,
    ) -> Result<UpdateReport> {
        let (written, skipped) = self.store.transact(|txn| {
            let mut row = txn
                .state()
                .row(row_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("row", row_id.0))?;
            let outcome = work(txn, &row)?;
            row.updated_at = Utc::now();
            txn.apply(Mutation::PutRow(row));
            Ok(outcome)
        })?;

        let triggers = if written.is_empty() {
            TriggerReport::new(depth)
        } else {
            self.rules.after_update(self, row_id, &written, depth)
        };

        Ok(UpdateReport {
            row_id,
            written,
            skipped,
            triggers,
        })
    }

    /// Remove a row with its cells and every edge touching it
    #[instrument(skip_all, fields(row_id = %row_id))]
    pub fn delete_row(&self, row_id: RowId) -> Result<()> {
        self.store.transact(|txn| {
            if txn.state().row(row_id).is_none() {
                return Err(EngineError::not_found("row", row_id.0));
            }
            delete_row_in(txn, &self.linker, row_id)
        })
    }

    /// Set or clear the manual display order
    pub fn set_row_order(&self, row_id: RowId, order: Option<f64>) -> Result<()> {
        if order.is_some_and(|o| !o.is_finite()) {
            return Err(EngineError::validation("row order must be a finite number"));
        }
        self.store.transact(|txn| {
            let mut row = txn
                .state()
                .row(row_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("row", row_id.0))?;
            row.order = order;
            row.updated_at = Utc::now();
            txn.apply(Mutation::PutRow(row));
            Ok(())
        })
    }

    /// Materialize one row under a single read lock
    pub fn get_row(&self, row_id: RowId) -> Result<MaterializedRow> {
        let state = self.store.read();
        let row = state
            .row(row_id)
            .ok_or_else(|| EngineError::not_found("row", row_id.0))?;
        let mut resolution = Resolution::new(Utc::now());
        Ok(self.materialize(&state, row, &mut resolution))
    }

    fn write_values(
        &self,
        txn: &mut Transaction<'_>,
        row: &Row,
        values: &RowValues,
    ) -> Result<(Vec<ColumnId>, Vec<ColumnId>)> {
        let mut written = Vec::new();
        let mut skipped = Vec::new();

        for (column_id, raw) in values {
            let column = txn.state().column(*column_id).cloned().ok_or_else(|| {
                EngineError::referential(format!("column {} not found", column_id))
            })?;
            if column.database_id != row.database_id {
                return Err(EngineError::referential(format!(
                    "column '{}' belongs to database {}, not {}",
                    column.name, column.database_id, row.database_id
                )));
            }

            if column.kind.is_computed() {
                warn!(
                    column_id = %column.id,
                    kind = column.kind.name(),
                    "write into computed column ignored"
                );
                skipped.push(column.id);
                continue;
            }

            if column.kind.is_relation() {
                let targets = parse_row_ids(&column, raw)?;
                self.linker.replace_edges(txn, row.id, column.id, &targets)?;
            } else {
                match coerce_raw(&column, raw)? {
                    Some(value) => txn.apply(Mutation::PutCell {
                        row_id: row.id,
                        column_id: column.id,
                        value,
                    }),
                    None => {
                        if txn.state().cell(row.id, column.id).is_some() {
                            txn.apply(Mutation::DeleteCell {
                                row_id: row.id,
                                column_id: column.id,
                            });
                        }
                    }
                }
            }
            written.push(column.id);
        }

        Ok((written, skipped))
    }

    fn materialize(
        &self,
        state: &StoreState,
        row: &Row,
        resolution: &mut Resolution,
    ) -> MaterializedRow {
        let columns = state.columns_of(row.database_id);
        let mut values = self.base_values(state, row, &columns, resolution.now);
        resolution.base.insert(row.id, values.clone());

        for pass in [Pass::Rollup, Pass::Lookup] {
            for column in columns.iter().filter(|c| pass.includes(&c.kind)) {
                let value = self.resolve_computed(state, row, column, resolution);
                values.insert(column.id, value);
            }
        }

        MaterializedRow {
            id: row.id,
            database_id: row.database_id,
            order: row.order,
            created_at: row.created_at,
            updated_at: row.updated_at,
            values,
            stored: columns
                .iter()
                .filter(|c| c.kind.is_scalar())
                .map(|c| c.id)
                .collect(),
        }
    }

    /// Passes 1 and 2: stored values, then formulas in column order
    fn base_values(
        &self,
        state: &StoreState,
        row: &Row,
        columns: &[&Column],
        now: DateTime<Utc>,
    ) -> BTreeMap<ColumnId, Value> {
        let mut values = BTreeMap::new();
        for column in columns.iter().filter(|c| !c.kind.is_computed()) {
            values.insert(column.id, read_stored(state, row.id, column));
        }

        for column in columns {
            if let ColumnKind::Formula {
                expression,
                result_type,
            } = &column.kind
            {
                let outcome = CompiledFormula::compile(expression, columns.iter().copied())
                    .and_then(|formula| formula.evaluate(&values, now))
                    .and_then(|value| match result_type {
                        Some(result_type) => coerce_result(value, *result_type),
                        None => Ok(value),
                    });
                let value = outcome.unwrap_or_else(|e| {
                    debug!(row_id = %row.id, column_id = %column.id, error = %e, "formula failed");
                    Value::Error(Sentinel::Error)
                });
                values.insert(column.id, value);
            }
        }

        values
    }

    /// Pass-1/2 value of another row, computed once per read
    fn base_value(
        &self,
        state: &StoreState,
        row: &Row,
        column_id: ColumnId,
        resolution: &mut Resolution,
    ) -> Value {
        if !resolution.base.contains_key(&row.id) {
            let columns = state.columns_of(row.database_id);
            let values = self.base_values(state, row, &columns, resolution.now);
            resolution.base.insert(row.id, values);
        }
        resolution
            .base
            .get(&row.id)
            .and_then(|values| values.get(&column_id))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn resolve_computed(
        &self,
        state: &StoreState,
        row: &Row,
        column: &Column,
        resolution: &mut Resolution,
    ) -> Value {
        let key = (row.id, column.id);
        if let Some(value) = resolution.computed.get(&key) {
            return value.clone();
        }
        if !resolution.in_progress.insert(key) {
            warn!(row_id = %row.id, column_id = %column.id, "computed column cycle detected");
            return Value::Error(Sentinel::CycleError);
        }

        let value = match &column.kind {
            ColumnKind::Rollup {
                source_relation_column_id,
                target_column_id,
                function,
            } => self.rollup(
                state,
                row,
                *source_relation_column_id,
                *target_column_id,
                *function,
                resolution,
            ),
            ColumnKind::Lookup {
                source_relation_column_id,
                target_column_id,
                policy,
            } => self.lookup(
                state,
                row,
                *source_relation_column_id,
                *target_column_id,
                *policy,
                resolution,
            ),
            _ => self.base_value(state, row, column.id, resolution),
        };

        resolution.in_progress.remove(&key);
        resolution.computed.insert(key, value.clone());
        value
    }

    /// Value of `column` in a linked row; `None` for a dangling target
    fn fetch_target(
        &self,
        state: &StoreState,
        row_id: RowId,
        column: &Column,
        resolution: &mut Resolution,
    ) -> Option<Value> {
        let row = state.row(row_id)?;
        let value = match column.kind {
            ColumnKind::Rollup { .. } | ColumnKind::Lookup { .. } => {
                self.resolve_computed(state, row, column, resolution)
            }
            _ => self.base_value(state, row, column.id, resolution),
        };
        Some(value)
    }

    fn rollup(
        &self,
        state: &StoreState,
        row: &Row,
        source_id: ColumnId,
        target_id: ColumnId,
        function: RollupFunction,
        resolution: &mut Resolution,
    ) -> Value {
        let (targets, target) = match linked_targets(state, row, source_id, target_id) {
            Ok(found) => found,
            Err(sentinel) => return Value::Error(sentinel),
        };
        let target_type = effective_value_type(state, target);

        let mut values = Vec::with_capacity(targets.len());
        for target_row in targets {
            match self.fetch_target(state, target_row, target, resolution) {
                Some(Value::Error(Sentinel::CycleError)) => {
                    return Value::Error(Sentinel::CycleError)
                }
                Some(value) => values.push(value),
                None => {}
            }
        }

        aggregate_joined(&values, function, target_type, &self.separator).unwrap_or_else(|e| {
            warn!(row_id = %row.id, error = %e, "rollup misconfigured");
            Value::Error(Sentinel::ConfigError)
        })
    }

    fn lookup(
        &self,
        state: &StoreState,
        row: &Row,
        source_id: ColumnId,
        target_id: ColumnId,
        policy: LookupPolicy,
        resolution: &mut Resolution,
    ) -> Value {
        let (targets, target) = match linked_targets(state, row, source_id, target_id) {
            Ok(found) => found,
            Err(sentinel) => return Value::Error(sentinel),
        };
        if matches!(
            target.kind,
            ColumnKind::Relation { .. } | ColumnKind::Rollup { .. } | ColumnKind::Lookup { .. }
        ) {
            return Value::Error(Sentinel::ConfigError);
        }

        match policy {
            LookupPolicy::First => targets
                .first()
                .and_then(|first| self.fetch_target(state, *first, target, resolution))
                .unwrap_or(Value::Null),
            LookupPolicy::ListUniqueStrings => {
                let mut seen = HashSet::new();
                let mut items = Vec::new();
                for target_row in targets {
                    let Some(value) = self.fetch_target(state, target_row, target, resolution)
                    else {
                        continue;
                    };
                    for item in value.string_items() {
                        let item = item.trim().to_string();
                        if !item.is_empty() && seen.insert(item.clone()) {
                            items.push(item);
                        }
                    }
                }
                Value::Text(items.join(&self.separator))
            }
        }
    }
}

/// Per-read resolution state
struct Resolution {
    now: DateTime<Utc>,
    base: HashMap<RowId, BTreeMap<ColumnId, Value>>,
    computed: HashMap<(RowId, ColumnId), Value>,
    in_progress: HashSet<(RowId, ColumnId)>,
}

impl Resolution {
    fn new(now: DateTime<Utc>) -> Self {
        Resolution {
            now,
            base: HashMap::new(),
            computed: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Pass {
    Rollup,
    Lookup,
}

impl Pass {
    fn includes(self, kind: &ColumnKind) -> bool {
        match self {
            Pass::Rollup => matches!(kind, ColumnKind::Rollup { .. }),
            Pass::Lookup => matches!(kind, ColumnKind::Lookup { .. }),
        }
    }
}

/// Source relation targets plus the target column, or the sentinel naming
/// what is misconfigured
fn linked_targets<'s>(
    state: &'s StoreState,
    row: &Row,
    source_id: ColumnId,
    target_id: ColumnId,
) -> std::result::Result<(Vec<RowId>, &'s Column), Sentinel> {
    let source = state.column(source_id).ok_or(Sentinel::ConfigError)?;
    if source.database_id != row.database_id {
        return Err(Sentinel::ConfigError);
    }
    let target_db = source.kind.relation_target().ok_or(Sentinel::ConfigError)?;
    let target = state.column(target_id).ok_or(Sentinel::TargetColumnError)?;
    if target.database_id != target_db {
        return Err(Sentinel::RelationError);
    }
    Ok((state.targets(row.id, source_id), target))
}

fn relation_of_row<'s>(state: &'s StoreState, row: &Row, column_id: ColumnId) -> Result<&'s Column> {
    let column = state
        .column(column_id)
        .ok_or_else(|| EngineError::referential(format!("column {} not found", column_id)))?;
    if column.database_id != row.database_id {
        return Err(EngineError::referential(format!(
            "column '{}' belongs to database {}, not {}",
            column.name, column.database_id, row.database_id
        )));
    }
    if !column.kind.is_relation() {
        return Err(EngineError::validation(format!(
            "column '{}' is {}, not RELATION",
            column.name,
            column.kind.name()
        )));
    }
    Ok(column)
}

/// Delete a row, its cells, and every edge touching it
pub(crate) fn delete_row_in(
    txn: &mut Transaction<'_>,
    linker: &RelationLinker,
    row_id: RowId,
) -> Result<()> {
    linker.detach_row(txn, row_id);
    for column_id in txn.state().cells_of_row(row_id) {
        txn.apply(Mutation::DeleteCell { row_id, column_id });
    }
    txn.apply(Mutation::DeleteRow(row_id));
    debug!(row_id = %row_id, "row deleted");
    Ok(())
}

/// Stored value of a non-computed column, read leniently by kind
pub(crate) fn read_stored(state: &StoreState, row_id: RowId, column: &Column) -> Value {
    if column.kind.is_relation() {
        return Value::Rows(state.targets(row_id, column.id));
    }
    stored_value(&column.kind, state.cell(row_id, column.id))
}

/// Read-side value of a cell slot; an unset BOOLEAN reads as unchecked
pub(crate) fn stored_value(kind: &ColumnKind, cell: Option<&CellValue>) -> Value {
    match cell {
        Some(cell) => cell_as(kind, cell),
        None if matches!(kind, ColumnKind::Boolean) => Value::Boolean(false),
        None => Value::Null,
    }
}

/// Interpret a stored cell under the column's current kind
fn cell_as(kind: &ColumnKind, cell: &CellValue) -> Value {
    match kind {
        ColumnKind::Text | ColumnKind::Select { .. } => {
            Value::Text(Value::from_cell(cell).to_display_string())
        }
        ColumnKind::Number => match cell {
            CellValue::Number(n) => Value::Number(*n),
            CellValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        ColumnKind::Date => match cell {
            CellValue::Text(s) => Value::Text(s.clone()),
            CellValue::Number(ms) => date_from_millis(*ms as i64)
                .map(Value::Text)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        ColumnKind::Boolean => match cell {
            CellValue::Boolean(b) => Value::Boolean(*b),
            CellValue::Text(s) => Value::Boolean(s.trim().eq_ignore_ascii_case("true")),
            CellValue::Number(n) => Value::Boolean(*n != 0.0),
            CellValue::MultiSelect(_) => Value::Boolean(false),
        },
        ColumnKind::MultiSelect { .. } => match cell {
            CellValue::MultiSelect(items) => Value::List(items.clone()),
            CellValue::Text(s) => Value::List(split_list(s)),
            other => Value::List(vec![Value::from_cell(other).to_display_string()]),
        },
        _ => Value::Null,
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_row_ids(column: &Column, raw: &RawValue) -> Result<Vec<RowId>> {
    let items = match raw {
        RawValue::Null => return Ok(Vec::new()),
        RawValue::Array(items) => items,
        _ => {
            return Err(EngineError::validation(format!(
                "RELATION column '{}' expects a list of row ids",
                column.name
            )))
        }
    };

    items
        .iter()
        .map(|item| {
            let id = match item {
                RawValue::Number(n) => n.as_u64(),
                RawValue::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            };
            id.map(RowId::new).ok_or_else(|| {
                EngineError::validation(format!(
                    "RELATION column '{}' got invalid row id {}",
                    column.name, item
                ))
            })
        })
        .collect()
}

/// Text form of a JSON number; integral floats drop the fraction
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(v) if n.is_f64() => format_number(v),
        _ => n.to_string(),
    }
}

/// Coerce a raw value for a scalar column; `None` clears the cell
pub fn coerce_raw(column: &Column, raw: &RawValue) -> Result<Option<CellValue>> {
    if raw.is_null() {
        return Ok(None);
    }
    let invalid = |what: &str| {
        EngineError::validation(format!(
            "{} column '{}' cannot accept {}: {}",
            column.kind.name(),
            column.name,
            what,
            raw
        ))
    };

    let cell = match &column.kind {
        ColumnKind::Text => match raw {
            RawValue::String(s) => CellValue::Text(s.clone()),
            RawValue::Number(n) => CellValue::Text(number_text(n)),
            RawValue::Bool(b) => CellValue::Text(b.to_string()),
            _ => return Err(invalid("a structured value")),
        },
        ColumnKind::Number => match raw {
            RawValue::Number(n) => CellValue::Number(n.as_f64().ok_or_else(|| invalid("this number"))?),
            RawValue::String(s) if s.trim().is_empty() => return Ok(None),
            RawValue::String(s) => CellValue::Number(
                s.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .ok_or_else(|| invalid("non-numeric text"))?,
            ),
            _ => return Err(invalid("a non-numeric value")),
        },
        ColumnKind::Date => match raw {
            RawValue::String(s) if s.trim().is_empty() => return Ok(None),
            RawValue::String(s) => {
                CellValue::Text(normalize_date(s).ok_or_else(|| invalid("an unparseable date"))?)
            }
            RawValue::Number(n) => {
                let ms = n.as_i64().ok_or_else(|| invalid("a fractional timestamp"))?;
                CellValue::Text(date_from_millis(ms).ok_or_else(|| invalid("an out-of-range timestamp"))?)
            }
            _ => return Err(invalid("a non-date value")),
        },
        ColumnKind::Boolean => match raw {
            RawValue::Bool(b) => CellValue::Boolean(*b),
            RawValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => CellValue::Boolean(true),
                "false" | "0" => CellValue::Boolean(false),
                _ => return Err(invalid("this text")),
            },
            RawValue::Number(n) => match n.as_f64() {
                Some(v) if v == 1.0 => CellValue::Boolean(true),
                Some(v) if v == 0.0 => CellValue::Boolean(false),
                _ => return Err(invalid("this number")),
            },
            _ => return Err(invalid("a non-boolean value")),
        },
        ColumnKind::Select { options } => {
            let choice = match raw {
                RawValue::String(s) => s.trim().to_string(),
                RawValue::Number(n) => number_text(n),
                _ => return Err(invalid("a non-text value")),
            };
            if choice.is_empty() {
                return Ok(None);
            }
            if !options.is_empty() && !options.contains(&choice) {
                return Err(invalid("an option outside its list"));
            }
            CellValue::Text(choice)
        }
        ColumnKind::MultiSelect { options } => {
            let items: Vec<String> = match raw {
                RawValue::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        RawValue::String(s) => Ok(s.trim().to_string()),
                        RawValue::Number(n) => Ok(number_text(n)),
                        _ => Err(invalid("a list with non-text items")),
                    })
                    .collect::<Result<_>>()?,
                RawValue::String(s) if s.trim_start().starts_with('[') => {
                    serde_json::from_str::<Vec<String>>(s).map_err(|_| invalid("a malformed list"))?
                }
                RawValue::String(s) => split_list(s),
                _ => return Err(invalid("a non-list value")),
            };

            let mut seen = HashSet::new();
            let mut unique = Vec::with_capacity(items.len());
            for item in items {
                if item.is_empty() || !seen.insert(item.clone()) {
                    continue;
                }
                if !options.is_empty() && !options.contains(&item) {
                    return Err(invalid("an option outside its list"));
                }
                unique.push(item);
            }
            CellValue::MultiSelect(unique)
        }
        ColumnKind::Relation { .. }
        | ColumnKind::Formula { .. }
        | ColumnKind::Rollup { .. }
        | ColumnKind::Lookup { .. } => return Err(invalid("a scalar value")),
    };

    Ok(Some(cell))
}
