//! Smart Rules
//!
//! Rule records, their write-time validation, and the engine that evaluates
//! them after a row update. Each evaluation walks a fixed sequence:
//! watch check, condition check, action apply. A non-empty action payload
//! re-enters the row store one cascade level deeper, up to the configured
//! ceiling.

use crate::error::{EngineError, Result};
use crate::formula::CompiledFormula;
use crate::row_store::{coerce_raw, stored_value, MaterializedRow, RowStore, RowValues};
use crate::schema::{Column, ColumnKind};
use crate::store::{Store, StoreState};
use crate::transaction::Mutation;
use crate::types::{CellValue, ColumnId, DatabaseId, RawValue, RowId, RuleId, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    OnRowUpdate,
}

/// When a rule is evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleTrigger {
    OnRowUpdate {
        /// Fire only when one of these columns was written; unset or empty
        /// means any update
        #[serde(default)]
        watched_column_ids: Option<Vec<ColumnId>>,
    },
}

impl RuleTrigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            RuleTrigger::OnRowUpdate { .. } => TriggerType::OnRowUpdate,
        }
    }
}

/// Value an action assigns to one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionValue {
    Literal(CellValue),
    Clear,
    /// Current timestamp
    Now,
    /// Formula evaluated against the row snapshot
    Formula(String),
}

impl ActionValue {
    /// Interpret a collaborator-supplied value: `"NOW()"` is the timestamp
    /// token, `=`-prefixed text is a formula, null clears.
    pub fn from_raw(raw: &RawValue) -> Result<Self> {
        let value = match raw {
            RawValue::Null => ActionValue::Clear,
            RawValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.eq_ignore_ascii_case("NOW()") || trimmed.eq_ignore_ascii_case("NOW") {
                    ActionValue::Now
                } else if trimmed.starts_with('=') {
                    ActionValue::Formula(trimmed.to_string())
                } else {
                    ActionValue::Literal(CellValue::Text(s.clone()))
                }
            }
            RawValue::Number(n) => ActionValue::Literal(CellValue::Number(
                n.as_f64()
                    .ok_or_else(|| EngineError::validation(format!("invalid number {}", n)))?,
            )),
            RawValue::Bool(b) => ActionValue::Literal(CellValue::Boolean(*b)),
            RawValue::Array(items) => ActionValue::Literal(CellValue::MultiSelect(
                items
                    .iter()
                    .map(|item| match item {
                        RawValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            RawValue::Object(_) => {
                return Err(EngineError::validation("rule action values cannot be objects"))
            }
        };
        Ok(value)
    }
}

/// What a rule does when it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    UpdateSameRow {
        updates: BTreeMap<ColumnId, ActionValue>,
    },
}

/// Stored automation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartRule {
    pub id: RuleId,
    pub target_database_id: DatabaseId,
    pub name: String,
    pub trigger: RuleTrigger,
    pub condition_formula: Option<String>,
    pub action: RuleAction,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn enabled_by_default() -> bool {
    true
}

/// Input to `create_rule` / `update_rule`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub target_database_id: DatabaseId,
    #[serde(default)]
    pub name: String,
    pub trigger: RuleTrigger,
    #[serde(default)]
    pub condition_formula: Option<String>,
    pub action: RuleAction,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

/// Optional filters for `list_rules_for_database`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Rule CRUD
pub struct RuleRegistry {
    store: Arc<Store>,
}

impl RuleRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        RuleRegistry { store }
    }

    #[instrument(skip_all, fields(database_id = %spec.target_database_id))]
    pub fn create_rule(&self, spec: RuleSpec) -> Result<SmartRule> {
        self.store.transact(|txn| {
            validate_rule(txn.state(), &spec)?;
            let now = Utc::now();
            let rule = SmartRule {
                id: RuleId::new(txn.next_id()),
                target_database_id: spec.target_database_id,
                name: spec.name.trim().to_string(),
                trigger: spec.trigger.clone(),
                condition_formula: normalized_condition(&spec.condition_formula),
                action: spec.action.clone(),
                enabled: spec.enabled,
                created_at: now,
                updated_at: now,
            };
            txn.apply(Mutation::PutRule(rule.clone()));
            info!(rule_id = %rule.id, "smart rule created");
            Ok(rule)
        })
    }

    /// Replace a rule's definition after full re-validation
    #[instrument(skip_all, fields(rule_id = %id))]
    pub fn update_rule(&self, id: RuleId, spec: RuleSpec) -> Result<SmartRule> {
        self.store.transact(|txn| {
            let existing = txn
                .state()
                .rule(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("rule", id.0))?;
            validate_rule(txn.state(), &spec)?;
            let rule = SmartRule {
                id,
                target_database_id: spec.target_database_id,
                name: spec.name.trim().to_string(),
                trigger: spec.trigger.clone(),
                condition_formula: normalized_condition(&spec.condition_formula),
                action: spec.action.clone(),
                enabled: spec.enabled,
                created_at: existing.created_at,
                updated_at: Utc::now(),
            };
            txn.apply(Mutation::PutRule(rule.clone()));
            Ok(rule)
        })
    }

    pub fn delete_rule(&self, id: RuleId) -> Result<()> {
        self.store.transact(|txn| {
            if txn.state().rule(id).is_none() {
                return Err(EngineError::not_found("rule", id.0));
            }
            txn.apply(Mutation::DeleteRule(id));
            Ok(())
        })
    }

    pub fn get_rule(&self, id: RuleId) -> Result<SmartRule> {
        self.store
            .read()
            .rule(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("rule", id.0))
    }

    pub fn list_rules_for_database(
        &self,
        database_id: DatabaseId,
        filter: RuleFilter,
    ) -> Result<Vec<SmartRule>> {
        let state = self.store.read();
        if state.database(database_id).is_none() {
            return Err(EngineError::not_found("database", database_id.0));
        }
        Ok(state
            .rules()
            .filter(|r| r.target_database_id == database_id)
            .filter(|r| filter.trigger_type.map_or(true, |t| r.trigger.trigger_type() == t))
            .filter(|r| filter.enabled.map_or(true, |e| r.enabled == e))
            .cloned()
            .collect())
    }
}

fn normalized_condition(condition: &Option<String>) -> Option<String> {
    condition
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Check a rule definition against the current schema
fn validate_rule(state: &StoreState, spec: &RuleSpec) -> Result<()> {
    let db = spec.target_database_id;
    if state.database(db).is_none() {
        return Err(EngineError::referential(format!(
            "rule target database {} does not exist",
            db
        )));
    }
    let columns = state.columns_of(db);
    let column_in_db = |id: ColumnId| -> Result<&Column> {
        columns.iter().copied().find(|c| c.id == id).ok_or_else(|| {
            EngineError::referential(format!("column {} is not in database {}", id, db))
        })
    };

    let RuleTrigger::OnRowUpdate { watched_column_ids } = &spec.trigger;
    for id in watched_column_ids.iter().flatten() {
        column_in_db(*id)?;
    }

    if let Some(condition) = normalized_condition(&spec.condition_formula) {
        CompiledFormula::compile(&condition, columns.iter().copied())
            .map_err(|e| EngineError::validation(format!("invalid rule condition: {}", e)))?;
    }

    let RuleAction::UpdateSameRow { updates } = &spec.action;
    if updates.is_empty() {
        return Err(EngineError::validation("rule action must update at least one column"));
    }
    for (column_id, value) in updates {
        let column = column_in_db(*column_id)?;
        if !column.kind.is_scalar() {
            return Err(EngineError::validation(format!(
                "rule cannot write {} column '{}'",
                column.kind.name(),
                column.name
            )));
        }
        match value {
            ActionValue::Literal(cell) => {
                coerce_raw(column, &cell.to_raw())?;
            }
            ActionValue::Clear => {}
            ActionValue::Now => {
                if !matches!(column.kind, ColumnKind::Text | ColumnKind::Date) {
                    return Err(EngineError::validation(format!(
                        "NOW() needs a DATE or TEXT column, '{}' is {}",
                        column.name,
                        column.kind.name()
                    )));
                }
            }
            ActionValue::Formula(source) => {
                CompiledFormula::compile(source, columns.iter().copied()).map_err(|e| {
                    EngineError::validation(format!("invalid action formula for '{}': {}", column.name, e))
                })?;
            }
        }
    }
    Ok(())
}

/// Rule evaluation or action failure, isolated to the rule
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum TriggerError {
    #[error("condition failed: {0}")]
    Condition(String),

    #[error("action failed: {0}")]
    Action(String),

    #[error("cascaded write failed: {0}")]
    Write(String),

    #[error("trigger depth exceeded at depth {depth}")]
    DepthExceeded { depth: usize },
}

/// Why a rule did not fire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotWatched,
    ConditionFalse,
    ConditionError(String),
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRule {
    pub rule_id: RuleId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule_id: RuleId,
    pub error: TriggerError,
}

/// What happened to every rule considered after one update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerReport {
    pub depth: usize,
    pub fired: Vec<RuleId>,
    pub skipped: Vec<SkippedRule>,
    pub failures: Vec<RuleFailure>,
    pub depth_exceeded: bool,
    /// Reports of the updates the fired rules caused
    pub cascades: Vec<TriggerReport>,
}

impl TriggerReport {
    pub fn new(depth: usize) -> Self {
        TriggerReport {
            depth,
            fired: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            depth_exceeded: false,
            cascades: Vec::new(),
        }
    }

    /// True if this report or any nested cascade hit the ceiling
    pub fn depth_limit_reached(&self) -> bool {
        self.depth_exceeded || self.cascades.iter().any(TriggerReport::depth_limit_reached)
    }

    /// Total rule firings across the whole cascade
    pub fn total_fired(&self) -> usize {
        self.fired.len() + self.cascades.iter().map(TriggerReport::total_fired).sum::<usize>()
    }
}

enum RuleOutcome {
    Skip(SkipReason),
    Failed(TriggerError),
    Apply(RowValues),
}

/// Evaluates rules after row updates
pub struct RuleEngine {
    store: Arc<Store>,
    max_depth: usize,
}

impl RuleEngine {
    pub fn new(store: Arc<Store>, max_depth: usize) -> Self {
        RuleEngine { store, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Evaluate every enabled rule of the row's database against one fresh
    /// snapshot and apply their payloads one level deeper.
    pub fn after_update(
        &self,
        rows: &RowStore,
        row_id: RowId,
        written: &[ColumnId],
        depth: usize,
    ) -> TriggerReport {
        let mut report = TriggerReport::new(depth);

        let (rules, columns) = {
            let state = self.store.read();
            let Some(row) = state.row(row_id) else {
                return report;
            };
            let rules: Vec<SmartRule> = state
                .rules()
                .filter(|r| r.enabled && r.target_database_id == row.database_id)
                .cloned()
                .collect();
            let columns: Vec<Column> = state
                .columns_of(row.database_id)
                .into_iter()
                .cloned()
                .collect();
            (rules, columns)
        };
        if rules.is_empty() {
            return report;
        }

        if depth >= self.max_depth {
            warn!(
                row_id = %row_id,
                depth,
                max_depth = self.max_depth,
                "trigger depth exceeded, refusing further cascade"
            );
            report.depth_exceeded = true;
            report.failures = rules
                .iter()
                .map(|rule| RuleFailure {
                    rule_id: rule.id,
                    error: TriggerError::DepthExceeded { depth },
                })
                .collect();
            return report;
        }

        let snapshot = match rows.get_row(row_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(row_id = %row_id, error = %e, "row vanished before rule evaluation");
                return report;
            }
        };
        let now = Utc::now();

        for rule in &rules {
            match evaluate_rule(rule, &snapshot, &columns, written, now) {
                RuleOutcome::Skip(reason) => {
                    debug!(rule_id = %rule.id, ?reason, "smart rule skipped");
                    report.skipped.push(SkippedRule {
                        rule_id: rule.id,
                        reason,
                    });
                }
                RuleOutcome::Failed(error) => {
                    warn!(rule_id = %rule.id, error = %error, "smart rule failed");
                    report.failures.push(RuleFailure {
                        rule_id: rule.id,
                        error,
                    });
                }
                RuleOutcome::Apply(payload) => {
                    match rows.update_row_at_depth(row_id, &payload, depth + 1) {
                        Ok(update) => {
                            debug!(rule_id = %rule.id, columns = payload.len(), "smart rule fired");
                            report.fired.push(rule.id);
                            report.cascades.push(update.triggers);
                        }
                        Err(e) => {
                            warn!(rule_id = %rule.id, error = %e, "smart rule write failed");
                            report.failures.push(RuleFailure {
                                rule_id: rule.id,
                                error: TriggerError::Write(e.to_string()),
                            });
                        }
                    }
                }
            }
        }

        report
    }
}

fn evaluate_rule(
    rule: &SmartRule,
    snapshot: &MaterializedRow,
    columns: &[Column],
    written: &[ColumnId],
    now: DateTime<Utc>,
) -> RuleOutcome {
    let RuleTrigger::OnRowUpdate { watched_column_ids } = &rule.trigger;
    if let Some(watched) = watched_column_ids {
        if !watched.is_empty() && !watched.iter().any(|c| written.contains(c)) {
            return RuleOutcome::Skip(SkipReason::NotWatched);
        }
    }

    if let Some(condition) = &rule.condition_formula {
        let compiled = match CompiledFormula::compile(condition, columns) {
            Ok(compiled) => compiled,
            Err(e) => return RuleOutcome::Failed(TriggerError::Condition(e.to_string())),
        };
        match compiled.evaluate(&snapshot.values, now) {
            Ok(value) if value.is_truthy() => {}
            Ok(_) => return RuleOutcome::Skip(SkipReason::ConditionFalse),
            Err(e) => return RuleOutcome::Skip(SkipReason::ConditionError(e.to_string())),
        }
    }

    let RuleAction::UpdateSameRow { updates } = &rule.action;
    let mut payload = RowValues::new();
    for (column_id, action) in updates {
        let Some(column) = columns.iter().find(|c| c.id == *column_id) else {
            return RuleOutcome::Failed(TriggerError::Action(format!(
                "column {} no longer exists",
                column_id
            )));
        };
        if !column.kind.is_scalar() {
            return RuleOutcome::Failed(TriggerError::Action(format!(
                "column '{}' is {} and cannot be written",
                column.name,
                column.kind.name()
            )));
        }

        let raw = match action {
            ActionValue::Literal(cell) => cell.to_raw(),
            ActionValue::Clear => RawValue::Null,
            ActionValue::Now => RawValue::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ActionValue::Formula(source) => {
                match CompiledFormula::compile(source, columns)
                    .and_then(|f| f.evaluate(&snapshot.values, now))
                {
                    Ok(value) => value_to_raw(&value),
                    Err(e) => return RuleOutcome::Failed(TriggerError::Action(e.to_string())),
                }
            }
        };

        let cell = match coerce_raw(column, &raw) {
            Ok(cell) => cell,
            Err(e) => return RuleOutcome::Failed(TriggerError::Action(e.to_string())),
        };
        if stored_value(&column.kind, cell.as_ref()) == *snapshot.get(*column_id) {
            continue;
        }
        payload.insert(*column_id, cell.map(|c| c.to_raw()).unwrap_or(RawValue::Null));
    }

    if payload.is_empty() {
        RuleOutcome::Skip(SkipReason::NoChanges)
    } else {
        RuleOutcome::Apply(payload)
    }
}

fn value_to_raw(value: &Value) -> RawValue {
    match value {
        Value::Null | Value::Error(_) => RawValue::Null,
        Value::Text(s) => RawValue::String(s.clone()),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(RawValue::Number)
            .unwrap_or(RawValue::Null),
        Value::Boolean(b) => RawValue::Bool(*b),
        Value::List(items) => RawValue::Array(items.iter().cloned().map(RawValue::String).collect()),
        Value::Rows(rows) => RawValue::Array(rows.iter().map(|r| RawValue::from(r.0)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(id: u64, name: &str, kind: ColumnKind) -> Column {
        Column {
            id: ColumnId::new(id),
            database_id: DatabaseId::new(1),
            name: name.to_string(),
            order: id as i64,
            kind,
        }
    }

    fn snapshot(values: &[(u64, Value)]) -> MaterializedRow {
        let now = Utc::now();
        MaterializedRow {
            id: RowId::new(10),
            database_id: DatabaseId::new(1),
            order: None,
            created_at: now,
            updated_at: now,
            values: values
                .iter()
                .map(|(id, v)| (ColumnId::new(*id), v.clone()))
                .collect(),
            stored: Default::default(),
        }
    }

    fn rule(watched: Option<Vec<u64>>, condition: Option<&str>, updates: Vec<(u64, ActionValue)>) -> SmartRule {
        let now = Utc::now();
        SmartRule {
            id: RuleId::new(99),
            target_database_id: DatabaseId::new(1),
            name: "test".to_string(),
            trigger: RuleTrigger::OnRowUpdate {
                watched_column_ids: watched.map(|ids| ids.into_iter().map(ColumnId::new).collect()),
            },
            condition_formula: condition.map(str::to_string),
            action: RuleAction::UpdateSameRow {
                updates: updates.into_iter().map(|(id, v)| (ColumnId::new(id), v)).collect(),
            },
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn columns() -> Vec<Column> {
        vec![
            column(1, "Status", ColumnKind::Text),
            column(2, "Done", ColumnKind::Boolean),
            column(3, "Points", ColumnKind::Number),
        ]
    }

    #[test]
    fn test_unwatched_write_skips() {
        let rule = rule(Some(vec![1]), None, vec![(2, ActionValue::Literal(CellValue::Boolean(true)))]);
        let row = snapshot(&[(1, Value::Text("Open".into())), (2, Value::Boolean(false))]);
        let outcome = evaluate_rule(&rule, &row, &columns(), &[ColumnId::new(3)], Utc::now());
        assert!(matches!(outcome, RuleOutcome::Skip(SkipReason::NotWatched)));
    }

    #[test]
    fn test_condition_gates_action() {
        let rule = rule(
            Some(vec![1]),
            Some("=[Status] = \"Closed\""),
            vec![(2, ActionValue::Literal(CellValue::Boolean(true)))],
        );
        let open = snapshot(&[(1, Value::Text("Open".into())), (2, Value::Boolean(false))]);
        let outcome = evaluate_rule(&rule, &open, &columns(), &[ColumnId::new(1)], Utc::now());
        assert!(matches!(outcome, RuleOutcome::Skip(SkipReason::ConditionFalse)));

        let closed = snapshot(&[(1, Value::Text("Closed".into())), (2, Value::Boolean(false))]);
        match evaluate_rule(&rule, &closed, &columns(), &[ColumnId::new(1)], Utc::now()) {
            RuleOutcome::Apply(payload) => assert_eq!(payload[&ColumnId::new(2)], json!(true)),
            _ => panic!("rule should fire"),
        }
    }

    #[test]
    fn test_unchanged_value_produces_no_payload() {
        let rule = rule(None, None, vec![(3, ActionValue::Formula("=[Points]".to_string()))]);
        let row = snapshot(&[(3, Value::Number(8.0)), (2, Value::Boolean(false))]);
        let outcome = evaluate_rule(&rule, &row, &columns(), &[ColumnId::new(3)], Utc::now());
        assert!(matches!(outcome, RuleOutcome::Skip(SkipReason::NoChanges)));
    }

    #[test]
    fn test_action_formula_error_is_failure() {
        let rule = rule(None, None, vec![(3, ActionValue::Formula("=[Status] * 2".to_string()))]);
        let row = snapshot(&[(1, Value::Text("abc".into()))]);
        let outcome = evaluate_rule(&rule, &row, &columns(), &[ColumnId::new(1)], Utc::now());
        assert!(matches!(outcome, RuleOutcome::Failed(TriggerError::Action(_))));
    }

    #[test]
    fn test_action_value_from_raw() {
        assert_eq!(ActionValue::from_raw(&json!("now()")).unwrap(), ActionValue::Now);
        assert_eq!(
            ActionValue::from_raw(&json!("=[Points] + 1")).unwrap(),
            ActionValue::Formula("=[Points] + 1".to_string())
        );
        assert_eq!(ActionValue::from_raw(&json!(null)).unwrap(), ActionValue::Clear);
        assert_eq!(
            ActionValue::from_raw(&json!(3)).unwrap(),
            ActionValue::Literal(CellValue::Number(3.0))
        );
        assert!(ActionValue::from_raw(&json!({"a": 1})).is_err());
    }
}
