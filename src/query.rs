//! Query Engine
//!
//! Filters a database's rows on stored values, then hands the matching ids
//! to the row store for full materialization. Filters and sorts that do not
//! fit the column they name are dropped and reported, never fatal.

use crate::error::{EngineError, Result};
use crate::row_store::{read_stored, MaterializedRow, RowStore};
use crate::schema::{effective_value_type, Column, ColumnKind};
use crate::store::{Store, StoreState};
use crate::types::{
    normalize_date, parse_date, ColumnId, DatabaseId, RawValue, RowId, Value, ValueType,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    IsEmpty,
    IsNotEmpty,
    #[serde(alias = "CONTAINS_ANY")]
    RelationContainsAny,
    #[serde(alias = "CONTAINS_ALL")]
    RelationContainsAll,
    RelationIsEmpty,
    RelationIsNotEmpty,
}

impl FilterOperator {
    fn is_relation_only(self) -> bool {
        matches!(
            self,
            FilterOperator::RelationContainsAny
                | FilterOperator::RelationContainsAll
                | FilterOperator::RelationIsEmpty
                | FilterOperator::RelationIsNotEmpty
        )
    }

    fn is_ordering(self) -> bool {
        matches!(
            self,
            FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column_id: ColumnId,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: RawValue,
}

impl Filter {
    pub fn new(column_id: ColumnId, operator: FilterOperator, value: RawValue) -> Self {
        Filter {
            column_id,
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column_id: ColumnId,
    #[serde(default)]
    pub direction: SortDirection,
}

/// A filter or sort the engine could not apply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryDiagnostic {
    IgnoredFilter {
        index: usize,
        column_id: ColumnId,
        reason: String,
    },
    IgnoredSort {
        column_id: ColumnId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<MaterializedRow>,
    pub diagnostics: Vec<QueryDiagnostic>,
}

pub struct QueryEngine {
    store: Arc<Store>,
    rows: Arc<RowStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<Store>, rows: Arc<RowStore>) -> Self {
        QueryEngine { store, rows }
    }

    #[instrument(skip_all, fields(database_id = %database_id, filters = filters.len()))]
    pub fn query_rows(
        &self,
        database_id: DatabaseId,
        filters: &[Filter],
        sort: Option<Sort>,
    ) -> Result<QueryResult> {
        let mut diagnostics = Vec::new();

        // Match on stored values under one read lock
        let (ids, sort_column) = {
            let state = self.store.read();
            if state.database(database_id).is_none() {
                return Err(EngineError::not_found("database", database_id.0));
            }

            let mut predicates = Vec::with_capacity(filters.len());
            for (index, filter) in filters.iter().enumerate() {
                match Predicate::compile(&state, database_id, filter) {
                    Ok(predicate) => predicates.push(predicate),
                    Err(reason) => {
                        warn!(index, column_id = %filter.column_id, %reason, "query filter ignored");
                        diagnostics.push(QueryDiagnostic::IgnoredFilter {
                            index,
                            column_id: filter.column_id,
                            reason,
                        });
                    }
                }
            }

            let mut rows: Vec<_> = state
                .rows_of(database_id)
                .filter(|row| predicates.iter().all(|p| p.matches(&state, row.id)))
                .map(|row| (row.id, row.order))
                .collect();
            rows.sort_by(|a, b| default_order(a.1, b.1).then(a.0.cmp(&b.0)));

            let sort_column = match sort {
                Some(sort) => match sort_key(&state, database_id, sort) {
                    Ok(key) => Some(key),
                    Err(reason) => {
                        warn!(column_id = %sort.column_id, %reason, "query sort ignored");
                        diagnostics.push(QueryDiagnostic::IgnoredSort {
                            column_id: sort.column_id,
                            reason,
                        });
                        None
                    }
                },
                None => None,
            };

            (rows.into_iter().map(|(id, _)| id).collect::<Vec<_>>(), sort_column)
        };

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            match self.rows.get_row(id) {
                Ok(row) => rows.push(row),
                Err(EngineError::NotFound { .. }) => {
                    warn!(row_id = %id, "row vanished during query materialization");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(key) = sort_column {
            rows.sort_by(|a, b| key.compare(a.get(key.column_id), b.get(key.column_id)));
        }

        debug!(matched = rows.len(), ignored = diagnostics.len(), "query complete");
        Ok(QueryResult { rows, diagnostics })
    }
}

/// Manual order ascending, unordered rows last
fn default_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone)]
enum Operand {
    None,
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(NaiveDateTime),
    Items(Vec<String>),
    Rows(HashSet<RowId>),
}

/// A filter bound to its column with a parsed operand
#[derive(Debug, Clone)]
struct Predicate {
    column: Column,
    operator: FilterOperator,
    operand: Operand,
}

impl Predicate {
    fn compile(
        state: &StoreState,
        database_id: DatabaseId,
        filter: &Filter,
    ) -> std::result::Result<Self, String> {
        let column = state
            .column(filter.column_id)
            .filter(|c| c.database_id == database_id)
            .cloned()
            .ok_or_else(|| format!("column {} is not in database {}", filter.column_id, database_id))?;
        let op = filter.operator;

        if column.kind.is_computed() {
            return Err(format!(
                "{} column '{}' cannot be filtered",
                column.kind.name(),
                column.name
            ));
        }

        let operand = if matches!(op, FilterOperator::IsEmpty | FilterOperator::IsNotEmpty) {
            Operand::None
        } else if column.kind.is_relation() {
            match op {
                FilterOperator::RelationIsEmpty | FilterOperator::RelationIsNotEmpty => Operand::None,
                FilterOperator::RelationContainsAny | FilterOperator::RelationContainsAll => {
                    let ids = row_id_set(&filter.value)
                        .ok_or_else(|| format!("{:?} needs a list of row ids", op))?;
                    if ids.is_empty() {
                        return Err(format!("{:?} needs at least one row id", op));
                    }
                    Operand::Rows(ids)
                }
                other => return Err(format!("{:?} does not apply to RELATION columns", other)),
            }
        } else if op.is_relation_only() {
            return Err(format!(
                "{:?} needs a RELATION column, '{}' is {}",
                op,
                column.name,
                column.kind.name()
            ));
        } else {
            scalar_operand(&column.kind, op, &filter.value)?
        };

        Ok(Predicate {
            column,
            operator: op,
            operand,
        })
    }

    fn matches(&self, state: &StoreState, row_id: RowId) -> bool {
        let value = read_stored(state, row_id, &self.column);
        match self.operator {
            FilterOperator::IsEmpty | FilterOperator::RelationIsEmpty => value.is_empty(),
            FilterOperator::IsNotEmpty | FilterOperator::RelationIsNotEmpty => !value.is_empty(),
            FilterOperator::RelationContainsAny => match (&self.operand, value.as_rows()) {
                (Operand::Rows(ids), Some(linked)) => linked.iter().any(|id| ids.contains(id)),
                _ => false,
            },
            FilterOperator::RelationContainsAll => match (&self.operand, value.as_rows()) {
                (Operand::Rows(ids), Some(linked)) => ids.iter().all(|id| linked.contains(id)),
                _ => false,
            },
            FilterOperator::Equals => self.equals(&value),
            FilterOperator::NotEquals => !self.equals(&value),
            FilterOperator::Contains => self.contains(&value),
            FilterOperator::NotContains => !self.contains(&value),
            op => match self.order(&value) {
                Some(ordering) => match op {
                    FilterOperator::GreaterThan => ordering == Ordering::Greater,
                    FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                    FilterOperator::LessThan => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                },
                None => false,
            },
        }
    }

    fn equals(&self, value: &Value) -> bool {
        match (&self.operand, value) {
            (Operand::Text(expected), Value::Text(actual)) => actual == expected,
            (Operand::Number(expected), Value::Number(actual)) => actual == expected,
            (Operand::Boolean(expected), Value::Boolean(actual)) => actual == expected,
            (Operand::Date(expected), Value::Text(actual)) => parse_date(actual) == Some(*expected),
            (Operand::Items(expected), Value::List(actual)) => {
                let expected: HashSet<&String> = expected.iter().collect();
                let actual: HashSet<&String> = actual.iter().collect();
                expected == actual
            }
            _ => false,
        }
    }

    /// Case-insensitive substring for text, membership for lists
    fn contains(&self, value: &Value) -> bool {
        match (&self.operand, value) {
            (Operand::Text(needle), Value::Text(haystack)) => {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
            (Operand::Text(needle), Value::List(items)) => {
                items.iter().any(|item| item.eq_ignore_ascii_case(needle))
            }
            (Operand::Items(needles), Value::List(items)) => needles
                .iter()
                .all(|needle| items.iter().any(|item| item.eq_ignore_ascii_case(needle))),
            _ => false,
        }
    }

    /// Ordering of the cell relative to the operand; `None` if incomparable
    fn order(&self, value: &Value) -> Option<Ordering> {
        match (&self.operand, value) {
            (Operand::Number(operand), Value::Number(actual)) => actual.partial_cmp(operand),
            (Operand::Date(operand), Value::Text(actual)) => {
                parse_date(actual).map(|actual| actual.cmp(operand))
            }
            (Operand::Text(operand), Value::Text(actual)) => {
                Some(actual.to_lowercase().cmp(&operand.to_lowercase()))
            }
            _ => None,
        }
    }
}

fn scalar_operand(
    kind: &ColumnKind,
    op: FilterOperator,
    raw: &RawValue,
) -> std::result::Result<Operand, String> {
    let text = match raw {
        RawValue::String(s) => Some(s.clone()),
        RawValue::Number(n) => Some(n.to_string()),
        RawValue::Bool(b) => Some(b.to_string()),
        _ => None,
    };

    match kind {
        ColumnKind::Text | ColumnKind::Select { .. } => {
            text.map(Operand::Text).ok_or_else(|| "operand must be text".to_string())
        }
        ColumnKind::Number => {
            if matches!(op, FilterOperator::Contains | FilterOperator::NotContains) {
                return Err("CONTAINS does not apply to NUMBER columns".to_string());
            }
            let n = match raw {
                RawValue::Number(n) => n.as_f64(),
                RawValue::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
                _ => None,
            };
            n.map(Operand::Number)
                .ok_or_else(|| format!("operand {} is not a number", raw))
        }
        ColumnKind::Date => {
            if matches!(op, FilterOperator::Contains | FilterOperator::NotContains) {
                return Err("CONTAINS does not apply to DATE columns".to_string());
            }
            text.as_deref()
                .and_then(normalize_date)
                .and_then(|normalized| parse_date(&normalized))
                .map(Operand::Date)
                .ok_or_else(|| format!("operand {} is not a date", raw))
        }
        ColumnKind::Boolean => {
            if !matches!(op, FilterOperator::Equals | FilterOperator::NotEquals) {
                return Err(format!("{:?} does not apply to BOOLEAN columns", op));
            }
            let b = match raw {
                RawValue::Bool(b) => Some(*b),
                RawValue::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" => Some(true),
                    "false" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            b.map(Operand::Boolean)
                .ok_or_else(|| format!("operand {} is not a boolean", raw))
        }
        ColumnKind::MultiSelect { .. } => {
            if op.is_ordering() {
                return Err(format!("{:?} does not apply to MULTI_SELECT columns", op));
            }
            match raw {
                RawValue::Array(items) => Ok(Operand::Items(
                    items
                        .iter()
                        .map(|item| match item {
                            RawValue::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                )),
                _ => match text {
                    Some(item) if op == FilterOperator::Equals || op == FilterOperator::NotEquals => {
                        Ok(Operand::Items(vec![item]))
                    }
                    Some(item) => Ok(Operand::Text(item)),
                    None => Err("operand must be text or a list".to_string()),
                },
            }
        }
        _ => Err(format!("{} columns cannot be filtered", kind.name())),
    }
}

fn row_id_set(raw: &RawValue) -> Option<HashSet<RowId>> {
    let one = |item: &RawValue| match item {
        RawValue::Number(n) => n.as_u64().map(RowId::new),
        RawValue::String(s) => s.trim().parse::<u64>().ok().map(RowId::new),
        _ => None,
    };
    match raw {
        RawValue::Array(items) => items.iter().map(one).collect(),
        other => one(other).map(|id| HashSet::from([id])),
    }
}

/// Resolved sort column
#[derive(Debug, Clone, Copy)]
struct SortKey {
    column_id: ColumnId,
    value_type: Option<ValueType>,
    direction: SortDirection,
}

fn sort_key(
    state: &StoreState,
    database_id: DatabaseId,
    sort: Sort,
) -> std::result::Result<SortKey, String> {
    let column = state
        .column(sort.column_id)
        .filter(|c| c.database_id == database_id)
        .ok_or_else(|| format!("column {} is not in database {}", sort.column_id, database_id))?;
    if column.kind.is_relation() {
        return Err(format!("RELATION column '{}' cannot be sorted", column.name));
    }
    Ok(SortKey {
        column_id: column.id,
        value_type: effective_value_type(state, column),
        direction: sort.direction,
    })
}

impl SortKey {
    /// Empty and error values sort last in either direction
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let blank = |v: &Value| v.is_empty() || v.is_error();
        match (blank(a), blank(b)) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }
        let ordering = self.compare_values(a, b);
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    fn compare_values(&self, a: &Value, b: &Value) -> Ordering {
        if self.value_type == Some(ValueType::Date) {
            if let (Some(x), Some(y)) = (
                a.as_str().and_then(parse_date),
                b.as_str().and_then(parse_date),
            ) {
                return x.cmp(&y);
            }
        }
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
            (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
            _ => a
                .to_display_string()
                .to_lowercase()
                .cmp(&b.to_display_string().to_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_wire_names_and_aliases() {
        let op: FilterOperator = serde_json::from_value(json!("CONTAINS_ANY")).unwrap();
        assert_eq!(op, FilterOperator::RelationContainsAny);
        let op: FilterOperator = serde_json::from_value(json!("RELATION_CONTAINS_ALL")).unwrap();
        assert_eq!(op, FilterOperator::RelationContainsAll);
        assert_eq!(
            serde_json::to_value(FilterOperator::GreaterThanOrEqual).unwrap(),
            json!("GREATER_THAN_OR_EQUAL")
        );
    }

    #[test]
    fn test_filter_value_defaults_to_null() {
        let filter: Filter =
            serde_json::from_value(json!({"column_id": 4, "operator": "IS_EMPTY"})).unwrap();
        assert_eq!(filter.value, RawValue::Null);
    }

    #[test]
    fn test_scalar_operand_checks_kind() {
        assert!(matches!(
            scalar_operand(&ColumnKind::Number, FilterOperator::GreaterThan, &json!("12.5")),
            Ok(Operand::Number(n)) if n == 12.5
        ));
        assert!(scalar_operand(&ColumnKind::Number, FilterOperator::Equals, &json!("abc")).is_err());
        assert!(scalar_operand(&ColumnKind::Boolean, FilterOperator::LessThan, &json!(true)).is_err());
        assert!(matches!(
            scalar_operand(&ColumnKind::Date, FilterOperator::LessThan, &json!("2024-01-31")),
            Ok(Operand::Date(_))
        ));
    }

    #[test]
    fn test_row_id_set_accepts_single_or_list() {
        assert_eq!(row_id_set(&json!(7)).map(|s| s.len()), Some(1));
        assert_eq!(row_id_set(&json!([1, "2", 3])).map(|s| s.len()), Some(3));
        assert!(row_id_set(&json!([1, {"x": 2}])).is_none());
    }

    #[test]
    fn test_sort_puts_blanks_last() {
        let key = SortKey {
            column_id: ColumnId::new(1),
            value_type: Some(ValueType::Number),
            direction: SortDirection::Desc,
        };
        let mut values = vec![Value::Null, Value::Number(1.0), Value::Number(3.0)];
        values.sort_by(|a, b| key.compare(a, b));
        assert_eq!(values, vec![Value::Number(3.0), Value::Number(1.0), Value::Null]);
    }
}
