//! Schema Registry
//!
//! Owns database and column definitions. Column kinds are a closed enum, so
//! each column carries exactly the configuration its kind needs and changing
//! kind replaces that configuration wholesale.

use crate::error::{EngineError, Result};
use crate::formula_parser::parse_formula;
use crate::relation::RelationLinker;
use crate::rollup::RollupFunction;
use crate::row_store::delete_row_in;
use crate::store::{Store, StoreState};
use crate::transaction::{Mutation, Transaction};
use crate::types::{ColumnId, DatabaseId, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A user-defined table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub id: DatabaseId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    pub fn new(id: DatabaseId, name: String) -> Self {
        let now = Utc::now();
        Database {
            id,
            name,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Column definition within a database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub database_id: DatabaseId,
    pub name: String,
    pub order: i64,
    pub kind: ColumnKind,
}

impl Column {
    /// Partner column of a bidirectional relation
    pub fn inverse(&self) -> Option<ColumnId> {
        match &self.kind {
            ColumnKind::Relation {
                inverse_column_id, ..
            } => *inverse_column_id,
            _ => None,
        }
    }
}

/// Declared result type of a formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormulaResultType {
    Text,
    Number,
    Boolean,
    Date,
}

impl FormulaResultType {
    pub fn value_type(self) -> ValueType {
        match self {
            FormulaResultType::Text => ValueType::Text,
            FormulaResultType::Number => ValueType::Number,
            FormulaResultType::Boolean => ValueType::Boolean,
            FormulaResultType::Date => ValueType::Date,
        }
    }
}

/// How a lookup picks values from the linked rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupPolicy {
    /// Value of the first linked row
    First,
    /// All linked values as strings, deduplicated and joined
    ListUniqueStrings,
}

/// Typed role of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnKind {
    Text,
    Number,
    Date,
    Boolean,
    Select {
        #[serde(default)]
        options: Vec<String>,
    },
    MultiSelect {
        #[serde(default)]
        options: Vec<String>,
    },
    Relation {
        target_database_id: DatabaseId,
        #[serde(default)]
        inverse_column_id: Option<ColumnId>,
    },
    Formula {
        expression: String,
        #[serde(default)]
        result_type: Option<FormulaResultType>,
    },
    Rollup {
        source_relation_column_id: ColumnId,
        target_column_id: ColumnId,
        function: RollupFunction,
    },
    Lookup {
        source_relation_column_id: ColumnId,
        target_column_id: ColumnId,
        policy: LookupPolicy,
    },
}

impl ColumnKind {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Number => "NUMBER",
            ColumnKind::Date => "DATE",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Select { .. } => "SELECT",
            ColumnKind::MultiSelect { .. } => "MULTI_SELECT",
            ColumnKind::Relation { .. } => "RELATION",
            ColumnKind::Formula { .. } => "FORMULA",
            ColumnKind::Rollup { .. } => "ROLLUP",
            ColumnKind::Lookup { .. } => "LOOKUP",
        }
    }

    /// FORMULA, ROLLUP and LOOKUP are derived at read time
    pub fn is_computed(&self) -> bool {
        matches!(
            self,
            ColumnKind::Formula { .. } | ColumnKind::Rollup { .. } | ColumnKind::Lookup { .. }
        )
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, ColumnKind::Relation { .. })
    }

    /// Stored in a cell slot
    pub fn is_scalar(&self) -> bool {
        !self.is_computed() && !self.is_relation()
    }

    pub fn relation_target(&self) -> Option<DatabaseId> {
        match self {
            ColumnKind::Relation {
                target_database_id, ..
            } => Some(*target_database_id),
            _ => None,
        }
    }

    fn same_variant(&self, other: &ColumnKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// How to pair a new or existing relation with its inverse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverseSpec {
    /// Attach to an unpaired relation in the target database pointing back
    Existing(ColumnId),
    /// Create the inverse in the target database; name generated if absent
    Create {
        #[serde(default)]
        name: Option<String>,
    },
}

/// Input to `add_column`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub order: Option<i64>,
    pub kind: ColumnKind,
    #[serde(default)]
    pub inverse: Option<InverseSpec>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        ColumnSpec {
            name: name.into(),
            order: None,
            kind,
            inverse: None,
        }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_inverse(mut self, inverse: InverseSpec) -> Self {
        self.inverse = Some(inverse);
        self
    }
}

/// Pairing change requested by `update_column`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverseUpdate {
    Attach(InverseSpec),
    Detach,
}

/// Input to `update_column`; absent fields stay unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub kind: Option<ColumnKind>,
    #[serde(default)]
    pub inverse: Option<InverseUpdate>,
}

/// Value shape a column produces, if it can be known from the schema
pub fn effective_value_type(state: &StoreState, column: &Column) -> Option<ValueType> {
    effective_value_type_bounded(state, column, 0)
}

fn effective_value_type_bounded(state: &StoreState, column: &Column, depth: usize) -> Option<ValueType> {
    // Misconfigured chains may loop; give up rather than recurse forever.
    if depth > 16 {
        return None;
    }
    match &column.kind {
        ColumnKind::Text | ColumnKind::Select { .. } => Some(ValueType::Text),
        ColumnKind::Number => Some(ValueType::Number),
        ColumnKind::Date => Some(ValueType::Date),
        ColumnKind::Boolean => Some(ValueType::Boolean),
        ColumnKind::MultiSelect { .. } => Some(ValueType::List),
        ColumnKind::Relation { .. } => Some(ValueType::Rows),
        ColumnKind::Formula { result_type, .. } => result_type.map(|t| t.value_type()),
        ColumnKind::Rollup {
            target_column_id,
            function,
            ..
        } => {
            let target = state
                .column(*target_column_id)
                .and_then(|t| effective_value_type_bounded(state, t, depth + 1));
            function.result_type(target)
        }
        ColumnKind::Lookup {
            target_column_id,
            policy,
            ..
        } => match policy {
            LookupPolicy::ListUniqueStrings => Some(ValueType::Text),
            LookupPolicy::First => state
                .column(*target_column_id)
                .and_then(|t| effective_value_type_bounded(state, t, depth + 1)),
        },
    }
}

/// Schema registry
pub struct SchemaRegistry {
    store: Arc<Store>,
    linker: RelationLinker,
}

impl SchemaRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        SchemaRegistry {
            store,
            linker: RelationLinker::new(),
        }
    }

    /// Create an empty database
    #[instrument(skip_all, fields(name = %name))]
    pub fn create_database(&self, name: &str) -> Result<Database> {
        let name = validate_label(name, "database")?;
        self.store.transact(|txn| {
            let db = Database::new(DatabaseId::new(txn.next_id()), name);
            txn.apply(Mutation::PutDatabase(db.clone()));
            info!(database_id = %db.id, "database created");
            Ok(db)
        })
    }

    pub fn rename_database(&self, id: DatabaseId, name: &str) -> Result<Database> {
        let name = validate_label(name, "database")?;
        self.store.transact(|txn| {
            let mut db = txn
                .state()
                .database(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("database", id.0))?;
            db.name = name;
            db.updated_at = Utc::now();
            txn.apply(Mutation::PutDatabase(db.clone()));
            Ok(db)
        })
    }

    /// Delete a database with its columns, rows, cells, edges and rules
    #[instrument(skip_all, fields(database_id = %id))]
    pub fn delete_database(&self, id: DatabaseId) -> Result<()> {
        self.store.transact(|txn| {
            if txn.state().database(id).is_none() {
                return Err(EngineError::not_found("database", id.0));
            }

            let row_ids: Vec<_> = txn.state().rows_of(id).map(|r| r.id).collect();
            for row_id in row_ids {
                delete_row_in(txn, &self.linker, row_id)?;
            }

            // Relations in other databases that point here go with it
            let state = txn.state();
            let foreign: Vec<Column> = state
                .databases()
                .filter(|db| db.id != id)
                .flat_map(|db| state.columns_of(db.id))
                .filter(|c| c.kind.relation_target() == Some(id))
                .cloned()
                .collect();
            for column in &foreign {
                self.remove_column_in(txn, column)?;
            }

            let columns: Vec<Column> = txn
                .state()
                .columns_of(id)
                .into_iter()
                .cloned()
                .collect();
            for column in &columns {
                self.remove_column_in(txn, column)?;
            }

            let rule_ids: Vec<_> = txn
                .state()
                .rules()
                .filter(|r| r.target_database_id == id)
                .map(|r| r.id)
                .collect();
            for rule_id in rule_ids {
                txn.apply(Mutation::DeleteRule(rule_id));
            }

            txn.apply(Mutation::DeleteDatabase(id));
            info!(mutations = txn.len(), "database deleted");
            Ok(())
        })
    }

    pub fn get_database(&self, id: DatabaseId) -> Result<Database> {
        self.store
            .read()
            .database(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("database", id.0))
    }

    pub fn list_databases(&self) -> Vec<Database> {
        self.store.read().databases().cloned().collect()
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Column> {
        self.store
            .read()
            .column(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("column", id.0))
    }

    /// Columns of a database in display order
    pub fn columns(&self, database_id: DatabaseId) -> Result<Vec<Column>> {
        let state = self.store.read();
        if state.database(database_id).is_none() {
            return Err(EngineError::not_found("database", database_id.0));
        }
        Ok(state.columns_of(database_id).into_iter().cloned().collect())
    }

    /// Case-insensitive lookup by name
    pub fn find_column(&self, database_id: DatabaseId, name: &str) -> Option<Column> {
        let wanted = name.trim().to_lowercase();
        self.store
            .read()
            .columns_of(database_id)
            .into_iter()
            .find(|c| c.name.to_lowercase() == wanted)
            .cloned()
    }

    /// Add a column after validating its kind-specific configuration
    #[instrument(skip_all, fields(database_id = %database_id, name = %spec.name))]
    pub fn add_column(&self, database_id: DatabaseId, spec: ColumnSpec) -> Result<Column> {
        self.store.transact(|txn| {
            let state = txn.state();
            if state.database(database_id).is_none() {
                return Err(EngineError::not_found("database", database_id.0));
            }

            let name = validate_column_name(state, database_id, &spec.name, None)?;
            let order = match spec.order {
                Some(order) => {
                    validate_order(state, database_id, order, None)?;
                    order
                }
                None => next_order(state, database_id),
            };

            if spec.kind.is_relation() && spec.kind != strip_inverse(&spec.kind) {
                return Err(EngineError::validation(
                    "inverse_column_id cannot be set directly; use the inverse field",
                ));
            }
            if spec.inverse.is_some() && !spec.kind.is_relation() {
                return Err(EngineError::validation(
                    "only RELATION columns can have an inverse",
                ));
            }
            validate_kind(state, database_id, None, &spec.kind)?;

            let column = Column {
                id: ColumnId::new(txn.next_id()),
                database_id,
                name,
                order,
                kind: spec.kind.clone(),
            };
            txn.apply(Mutation::PutColumn(column.clone()));
            debug!(column_id = %column.id, kind = column.kind.name(), "column added");

            if let Some(inverse) = &spec.inverse {
                self.pair_in(txn, column.id, inverse)?;
            }

            txn.state()
                .column(column.id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("column", column.id.0))
        })
    }

    /// Rename, reorder, retype or re-pair a column
    #[instrument(skip_all, fields(column_id = %id))]
    pub fn update_column(&self, id: ColumnId, update: ColumnUpdate) -> Result<Column> {
        self.store.transact(|txn| {
            let current = txn
                .state()
                .column(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("column", id.0))?;
            let mut next = current.clone();

            if let Some(name) = &update.name {
                next.name = validate_column_name(txn.state(), current.database_id, name, Some(id))?;
            }
            if let Some(order) = update.order {
                validate_order(txn.state(), current.database_id, order, Some(id))?;
                next.order = order;
            }

            if let Some(kind) = &update.kind {
                if kind.is_relation() && *kind != strip_inverse(kind) {
                    return Err(EngineError::validation(
                        "inverse_column_id cannot be set directly; use the inverse field",
                    ));
                }
                validate_kind(txn.state(), current.database_id, Some(id), kind)?;

                let retarget = !current.kind.same_variant(kind)
                    || current.kind.relation_target() != kind.relation_target();
                if retarget {
                    self.unpair_in(txn, &current);
                    self.linker.clear_column(txn, id);
                    if !kind.is_scalar() {
                        for row_id in txn.state().cells_of_column(id) {
                            txn.apply(Mutation::DeleteCell {
                                row_id,
                                column_id: id,
                            });
                        }
                    }
                    next.kind = kind.clone();
                    info!(from = current.kind.name(), to = kind.name(), "column retyped");
                } else if let ColumnKind::Relation {
                    target_database_id, ..
                } = kind
                {
                    next.kind = ColumnKind::Relation {
                        target_database_id: *target_database_id,
                        inverse_column_id: current.inverse(),
                    };
                } else {
                    next.kind = kind.clone();
                }
            }

            txn.apply(Mutation::PutColumn(next.clone()));

            match &update.inverse {
                Some(InverseUpdate::Detach) => {
                    self.unpair_in(txn, &next);
                }
                Some(InverseUpdate::Attach(spec)) => {
                    if !next.kind.is_relation() {
                        return Err(EngineError::validation(
                            "only RELATION columns can have an inverse",
                        ));
                    }
                    if next.inverse().is_some() {
                        return Err(EngineError::validation(format!(
                            "column '{}' is already paired; detach it first",
                            next.name
                        )));
                    }
                    self.pair_in(txn, id, spec)?;
                }
                None => {}
            }

            txn.state()
                .column(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("column", id.0))
        })
    }

    /// Delete a column; a paired partner loses its pairing first
    #[instrument(skip_all, fields(column_id = %id))]
    pub fn delete_column(&self, id: ColumnId) -> Result<()> {
        self.store.transact(|txn| {
            let column = txn
                .state()
                .column(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("column", id.0))?;
            self.remove_column_in(txn, &column)
        })
    }

    fn remove_column_in(&self, txn: &mut Transaction<'_>, column: &Column) -> Result<()> {
        self.unpair_in(txn, column);
        self.linker.clear_column(txn, column.id);
        for row_id in txn.state().cells_of_column(column.id) {
            txn.apply(Mutation::DeleteCell {
                row_id,
                column_id: column.id,
            });
        }
        txn.apply(Mutation::DeleteColumn(column.id));
        debug!(column_id = %column.id, "column removed");
        Ok(())
    }

    /// Clear the pairing on both sides
    fn unpair_in(&self, txn: &mut Transaction<'_>, column: &Column) {
        let Some(partner_id) = column.inverse() else {
            return;
        };

        if let Some(partner) = txn.state().column(partner_id).cloned() {
            if partner.inverse() == Some(column.id) {
                txn.apply(Mutation::PutColumn(with_inverse(&partner, None)));
            }
        }
        if let Some(own) = txn.state().column(column.id).cloned() {
            txn.apply(Mutation::PutColumn(with_inverse(&own, None)));
        }
        debug!(column_id = %column.id, partner_id = %partner_id, "relation pairing cleared");
    }

    fn pair_in(&self, txn: &mut Transaction<'_>, column_id: ColumnId, spec: &InverseSpec) -> Result<()> {
        let column = txn
            .state()
            .column(column_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("column", column_id.0))?;
        let target_db = column
            .kind
            .relation_target()
            .ok_or_else(|| EngineError::validation("only RELATION columns can have an inverse"))?;

        let partner = match spec {
            InverseSpec::Existing(partner_id) => {
                let partner = txn.state().column(*partner_id).cloned().ok_or_else(|| {
                    EngineError::referential(format!("inverse column {} not found", partner_id))
                })?;
                if partner.id == column.id {
                    return Err(EngineError::validation("a relation cannot be its own inverse"));
                }
                if partner.database_id != target_db {
                    return Err(EngineError::referential(format!(
                        "inverse column '{}' must live in database {}",
                        partner.name, target_db
                    )));
                }
                match &partner.kind {
                    ColumnKind::Relation {
                        target_database_id,
                        inverse_column_id,
                    } => {
                        if *target_database_id != column.database_id {
                            return Err(EngineError::validation(format!(
                                "inverse column '{}' does not point back to database {}",
                                partner.name, column.database_id
                            )));
                        }
                        if inverse_column_id.is_some() {
                            return Err(EngineError::validation(format!(
                                "inverse column '{}' is already paired",
                                partner.name
                            )));
                        }
                    }
                    other => {
                        return Err(EngineError::validation(format!(
                            "inverse column '{}' is {}, not RELATION",
                            partner.name,
                            other.name()
                        )))
                    }
                }
                partner
            }
            InverseSpec::Create { name } => {
                let generated = match name {
                    Some(name) => name.clone(),
                    None => {
                        let source_db = txn
                            .state()
                            .database(column.database_id)
                            .map(|d| d.name.clone())
                            .unwrap_or_default();
                        format!("{} ({})", source_db, column.name)
                    }
                };
                let name = validate_column_name(txn.state(), target_db, &generated, None)
                    .map_err(|e| match e {
                        EngineError::Validation(msg) => EngineError::Validation(format!(
                            "cannot create inverse column: {}",
                            msg
                        )),
                        other => other,
                    })?;
                let partner = Column {
                    id: ColumnId::new(txn.next_id()),
                    database_id: target_db,
                    name,
                    order: next_order(txn.state(), target_db),
                    kind: ColumnKind::Relation {
                        target_database_id: column.database_id,
                        inverse_column_id: None,
                    },
                };
                txn.apply(Mutation::PutColumn(partner.clone()));
                partner
            }
        };

        txn.apply(Mutation::PutColumn(with_inverse(&column, Some(partner.id))));
        txn.apply(Mutation::PutColumn(with_inverse(&partner, Some(column.id))));
        self.linker.sync_pair(txn, column.id, partner.id);
        info!(column_id = %column.id, partner_id = %partner.id, "relation paired");
        Ok(())
    }
}

fn with_inverse(column: &Column, inverse: Option<ColumnId>) -> Column {
    let mut updated = column.clone();
    if let ColumnKind::Relation {
        inverse_column_id, ..
    } = &mut updated.kind
    {
        *inverse_column_id = inverse;
    }
    updated
}

fn strip_inverse(kind: &ColumnKind) -> ColumnKind {
    match kind {
        ColumnKind::Relation {
            target_database_id, ..
        } => ColumnKind::Relation {
            target_database_id: *target_database_id,
            inverse_column_id: None,
        },
        other => other.clone(),
    }
}

fn validate_label(name: &str, what: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(format!("{} name must not be empty", what)));
    }
    Ok(trimmed.to_string())
}

fn validate_column_name(
    state: &StoreState,
    database_id: DatabaseId,
    name: &str,
    exclude: Option<ColumnId>,
) -> Result<String> {
    let name = validate_label(name, "column")?;
    let lowered = name.to_lowercase();
    let taken = state
        .columns_of(database_id)
        .into_iter()
        .any(|c| Some(c.id) != exclude && c.name.to_lowercase() == lowered);
    if taken {
        return Err(EngineError::validation(format!(
            "column name '{}' already exists in database {}",
            name, database_id
        )));
    }
    Ok(name)
}

fn validate_order(
    state: &StoreState,
    database_id: DatabaseId,
    order: i64,
    exclude: Option<ColumnId>,
) -> Result<()> {
    let taken = state
        .columns_of(database_id)
        .into_iter()
        .any(|c| Some(c.id) != exclude && c.order == order);
    if taken {
        return Err(EngineError::validation(format!(
            "column order {} already used in database {}",
            order, database_id
        )));
    }
    Ok(())
}

fn next_order(state: &StoreState, database_id: DatabaseId) -> i64 {
    state
        .columns_of(database_id)
        .into_iter()
        .map(|c| c.order)
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}

fn validate_options(options: &[String]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for option in options {
        if option.trim().is_empty() {
            return Err(EngineError::validation("select options must not be empty"));
        }
        if !seen.insert(option.as_str()) {
            return Err(EngineError::validation(format!(
                "duplicate select option '{}'",
                option
            )));
        }
    }
    Ok(())
}

/// Kind-specific prerequisites
fn validate_kind(
    state: &StoreState,
    database_id: DatabaseId,
    self_id: Option<ColumnId>,
    kind: &ColumnKind,
) -> Result<()> {
    match kind {
        ColumnKind::Text | ColumnKind::Number | ColumnKind::Date | ColumnKind::Boolean => Ok(()),
        ColumnKind::Select { options } | ColumnKind::MultiSelect { options } => {
            validate_options(options)
        }
        ColumnKind::Relation {
            target_database_id, ..
        } => {
            if state.database(*target_database_id).is_none() {
                return Err(EngineError::referential(format!(
                    "relation target database {} does not exist",
                    target_database_id
                )));
            }
            Ok(())
        }
        ColumnKind::Formula { expression, .. } => {
            if expression.trim().trim_start_matches('=').trim().is_empty() {
                return Err(EngineError::validation("formula expression must not be empty"));
            }
            parse_formula(expression)
                .map(|_| ())
                .map_err(|e| EngineError::validation(format!("invalid formula: {}", e)))
        }
        ColumnKind::Rollup {
            source_relation_column_id,
            target_column_id,
            function,
        } => {
            let target = validate_relation_path(
                state,
                database_id,
                self_id,
                *source_relation_column_id,
                *target_column_id,
            )?;
            let target_type = effective_value_type(state, target);
            if !function.accepts(target_type) {
                return Err(EngineError::validation(format!(
                    "rollup function {:?} is not compatible with target column '{}' ({})",
                    function,
                    target.name,
                    target.kind.name()
                )));
            }
            Ok(())
        }
        ColumnKind::Lookup {
            source_relation_column_id,
            target_column_id,
            ..
        } => {
            let target = validate_relation_path(
                state,
                database_id,
                self_id,
                *source_relation_column_id,
                *target_column_id,
            )?;
            if matches!(
                target.kind,
                ColumnKind::Relation { .. } | ColumnKind::Rollup { .. } | ColumnKind::Lookup { .. }
            ) {
                return Err(EngineError::validation(format!(
                    "lookup cannot target {} column '{}'",
                    target.kind.name(),
                    target.name
                )));
            }
            Ok(())
        }
    }
}

/// Source must be a RELATION in this database; target must live where it points
fn validate_relation_path<'s>(
    state: &'s StoreState,
    database_id: DatabaseId,
    self_id: Option<ColumnId>,
    source_id: ColumnId,
    target_id: ColumnId,
) -> Result<&'s Column> {
    if Some(source_id) == self_id || Some(target_id) == self_id {
        return Err(EngineError::validation("a column cannot reference itself"));
    }
    let source = state.column(source_id).ok_or_else(|| {
        EngineError::referential(format!("source relation column {} not found", source_id))
    })?;
    if source.database_id != database_id {
        return Err(EngineError::referential(format!(
            "source column '{}' belongs to another database",
            source.name
        )));
    }
    let relation_target = source.kind.relation_target().ok_or_else(|| {
        EngineError::validation(format!(
            "source column '{}' is {}, not RELATION",
            source.name,
            source.kind.name()
        ))
    })?;
    let target = state
        .column(target_id)
        .ok_or_else(|| EngineError::referential(format!("target column {} not found", target_id)))?;
    if target.database_id != relation_target {
        return Err(EngineError::referential(format!(
            "target column '{}' is not in the database that '{}' points to",
            target.name, source.name
        )));
    }
    Ok(target)
}
