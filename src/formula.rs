//! Formula Evaluator
//!
//! Compiles formula text against a database's column list and evaluates it
//! over one row's already-resolved values. Evaluation is pure: no store
//! access and no side effects.

use crate::formula_ast::{BinaryOp, Expr, Function, UnaryOp};
use crate::formula_parser::parse_formula;
use crate::schema::{Column, FormulaResultType};
use crate::types::{normalize_date, parse_date, ColumnId, Value};
use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown column [{0}]")]
    UnknownColumn(String),

    #[error("ambiguous column [{0}]")]
    AmbiguousColumn(String),

    #[error("column [{0}] holds an error value")]
    ErrorValue(String),

    #[error("column [{0}] is not resolved when this formula runs")]
    Unresolved(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("result is not a finite number: {0}")]
    NonFinite(String),
}

type EvalResult = Result<Value, FormulaError>;

/// Parsed formula with column names bound to ids
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    expr: Expr,
    bindings: HashMap<String, ColumnId>,
}

impl CompiledFormula {
    /// Parse and resolve every `[Name]` case-insensitively against `columns`
    pub fn compile<'a>(
        source: &str,
        columns: impl IntoIterator<Item = &'a Column>,
    ) -> Result<Self, FormulaError> {
        let expr = parse_formula(source).map_err(FormulaError::Syntax)?;

        let mut by_name: HashMap<String, Vec<ColumnId>> = HashMap::new();
        for column in columns {
            by_name
                .entry(column.name.trim().to_lowercase())
                .or_default()
                .push(column.id);
        }

        let mut bindings = HashMap::new();
        for name in expr.column_refs() {
            let key = name.to_lowercase();
            match by_name.get(&key).map(Vec::as_slice) {
                None | Some([]) => return Err(FormulaError::UnknownColumn(name.to_string())),
                Some([id]) => {
                    bindings.insert(key, *id);
                }
                Some(_) => return Err(FormulaError::AmbiguousColumn(name.to_string())),
            }
        }

        Ok(CompiledFormula { expr, bindings })
    }

    /// Column ids this formula reads
    pub fn references(&self) -> impl Iterator<Item = ColumnId> + '_ {
        self.bindings.values().copied()
    }

    pub fn evaluate(&self, values: &BTreeMap<ColumnId, Value>, now: DateTime<Utc>) -> EvalResult {
        let evaluator = Evaluator {
            formula: self,
            values,
            now,
        };
        let result = evaluator.eval(&self.expr)?;
        if let Value::Number(n) = result {
            finite(n, "formula result")?;
        }
        Ok(result)
    }
}

/// Compile and evaluate in one step
pub fn evaluate_formula<'a>(
    source: &str,
    columns: impl IntoIterator<Item = &'a Column>,
    values: &BTreeMap<ColumnId, Value>,
    now: DateTime<Utc>,
) -> EvalResult {
    CompiledFormula::compile(source, columns)?.evaluate(values, now)
}

/// Apply a FORMULA column's declared result type
pub fn coerce_result(value: Value, result_type: FormulaResultType) -> EvalResult {
    if matches!(value, Value::Null) {
        return Ok(Value::Null);
    }
    match result_type {
        FormulaResultType::Number => value
            .as_number()
            .map(Value::Number)
            .ok_or_else(|| FormulaError::Type(format!("'{}' is not a number", value.to_display_string()))),
        FormulaResultType::Boolean => Ok(Value::Boolean(value.is_truthy())),
        FormulaResultType::Text => Ok(Value::Text(value.to_display_string())),
        FormulaResultType::Date => {
            let text = value.to_display_string();
            normalize_date(&text)
                .map(Value::Text)
                .ok_or_else(|| FormulaError::Type(format!("'{}' is not a date", text)))
        }
    }
}

struct Evaluator<'a> {
    formula: &'a CompiledFormula,
    values: &'a BTreeMap<ColumnId, Value>,
    now: DateTime<Utc>,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Text(s) => Ok(Value::Text(s.clone())),
            Expr::Boolean(b) => Ok(Value::Boolean(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Column(name) => self.column(name),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(Value::Boolean(!value.is_truthy())),
                    UnaryOp::Negate => Ok(Value::Number(-number(&value)?)),
                }
            }
            Expr::Binary(op, left, right) => self.binary(*op, left, right),
            Expr::Call(function, args) => self.call(*function, args),
        }
    }

    fn column(&self, name: &str) -> EvalResult {
        let id = self
            .formula
            .bindings
            .get(&name.to_lowercase())
            .ok_or_else(|| FormulaError::UnknownColumn(name.to_string()))?;
        match self.values.get(id) {
            Some(Value::Error(_)) => Err(FormulaError::ErrorValue(name.to_string())),
            Some(value) => Ok(value.clone()),
            None => Err(FormulaError::Unresolved(name.to_string())),
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> EvalResult {
        // Logical operators short-circuit.
        match op {
            BinaryOp::And => {
                let l = self.eval(left)?;
                if !l.is_truthy() {
                    return Ok(Value::Boolean(false));
                }
                return Ok(Value::Boolean(self.eval(right)?.is_truthy()));
            }
            BinaryOp::Or => {
                let l = self.eval(left)?;
                if l.is_truthy() {
                    return Ok(Value::Boolean(true));
                }
                return Ok(Value::Boolean(self.eval(right)?.is_truthy()));
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;

        match op {
            BinaryOp::Add => {
                if is_non_numeric_text(&l) || is_non_numeric_text(&r) {
                    Ok(Value::Text(l.to_display_string() + &r.to_display_string()))
                } else {
                    finite(number(&l)? + number(&r)?, "addition")
                }
            }
            BinaryOp::Subtract => finite(number(&l)? - number(&r)?, "subtraction"),
            BinaryOp::Multiply => finite(number(&l)? * number(&r)?, "multiplication"),
            BinaryOp::Divide => {
                let divisor = number(&r)?;
                if divisor == 0.0 {
                    return Err(FormulaError::NonFinite("division by zero".to_string()));
                }
                finite(number(&l)? / divisor, "division")
            }
            BinaryOp::Modulo => {
                let divisor = number(&r)?;
                if divisor == 0.0 {
                    return Err(FormulaError::NonFinite("modulo by zero".to_string()));
                }
                finite(number(&l)? % divisor, "modulo")
            }
            BinaryOp::Concat => Ok(Value::Text(l.to_display_string() + &r.to_display_string())),
            BinaryOp::Equal => Ok(Value::Boolean(compare(&l, &r) == Some(Ordering::Equal))),
            BinaryOp::NotEqual => Ok(Value::Boolean(compare(&l, &r) != Some(Ordering::Equal))),
            BinaryOp::LessThan => Ok(Value::Boolean(compare(&l, &r) == Some(Ordering::Less))),
            BinaryOp::LessThanEq => Ok(Value::Boolean(matches!(
                compare(&l, &r),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            BinaryOp::GreaterThan => Ok(Value::Boolean(compare(&l, &r) == Some(Ordering::Greater))),
            BinaryOp::GreaterThanEq => Ok(Value::Boolean(matches!(
                compare(&l, &r),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn call(&self, function: Function, args: &[Expr]) -> EvalResult {
        if function == Function::If {
            let condition = self.eval(&args[0])?;
            return if condition.is_truthy() {
                self.eval(&args[1])
            } else {
                args.get(2).map_or(Ok(Value::Null), |e| self.eval(e))
            };
        }

        let values = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;

        match function {
            Function::If => unreachable!("handled above"),
            Function::Concat => Ok(Value::Text(
                values.iter().map(Value::to_display_string).collect(),
            )),
            Function::Upper => Ok(Value::Text(values[0].to_display_string().to_uppercase())),
            Function::Lower => Ok(Value::Text(values[0].to_display_string().to_lowercase())),
            Function::Len => {
                let len = match &values[0] {
                    Value::List(items) => items.len(),
                    Value::Rows(rows) => rows.len(),
                    other => other.to_display_string().chars().count(),
                };
                Ok(Value::Number(len as f64))
            }
            Function::Round => {
                let x = number(&values[0])?;
                let digits = match values.get(1) {
                    Some(d) => number(d)?.round().clamp(-15.0, 15.0) as i32,
                    None => 0,
                };
                let factor = 10f64.powi(digits);
                finite((x * factor).round() / factor, "ROUND")
            }
            Function::Abs => Ok(Value::Number(number(&values[0])?.abs())),
            Function::Sqrt => {
                let x = number(&values[0])?;
                if x < 0.0 {
                    return Err(FormulaError::NonFinite(
                        "square root of a negative number".to_string(),
                    ));
                }
                Ok(Value::Number(x.sqrt()))
            }
            Function::Pow => finite(number(&values[0])?.powf(number(&values[1])?), "POW"),
            Function::Min | Function::Max => {
                let mut numbers = Vec::new();
                for value in &values {
                    if !value.is_empty() {
                        numbers.push(number(value)?);
                    }
                }
                let pick = if function == Function::Min {
                    numbers.into_iter().reduce(f64::min)
                } else {
                    numbers.into_iter().reduce(f64::max)
                };
                Ok(pick.map(Value::Number).unwrap_or(Value::Null))
            }
            Function::Today => Ok(Value::Text(self.now.date_naive().format("%Y-%m-%d").to_string())),
            Function::Now => Ok(Value::Text(self.now.to_rfc3339_opts(SecondsFormat::Secs, true))),
            Function::Year | Function::Month | Function::Day => {
                let Some(date) = date(&values[0])? else {
                    return Ok(Value::Null);
                };
                let part = match function {
                    Function::Year => date.year() as f64,
                    Function::Month => date.month() as f64,
                    _ => date.day() as f64,
                };
                Ok(Value::Number(part))
            }
            Function::DateDiff => {
                let (Some(a), Some(b)) = (date(&values[0])?, date(&values[1])?) else {
                    return Ok(Value::Null);
                };
                let unit = values
                    .get(2)
                    .map(|u| u.to_display_string().to_lowercase())
                    .unwrap_or_else(|| "days".to_string());
                date_diff(a, b, &unit).map(|n| Value::Number(n as f64))
            }
            Function::IsEmpty => Ok(Value::Boolean(values[0].is_empty())),
        }
    }
}

fn finite(n: f64, what: &str) -> EvalResult {
    if n.is_finite() {
        Ok(Value::Number(n))
    } else {
        Err(FormulaError::NonFinite(format!("{} produced {}", what, n)))
    }
}

fn is_non_numeric_text(value: &Value) -> bool {
    matches!(value, Value::Text(_)) && !value.is_empty() && value.as_number().is_none()
}

/// Arithmetic operand; empty counts as zero
fn number(value: &Value) -> Result<f64, FormulaError> {
    if value.is_empty() && !matches!(value, Value::List(_) | Value::Rows(_)) {
        return Ok(0.0);
    }
    value.as_number().ok_or_else(|| {
        FormulaError::Type(format!("'{}' is not a number", value.to_display_string()))
    })
}

fn date(value: &Value) -> Result<Option<NaiveDateTime>, FormulaError> {
    if value.is_empty() {
        return Ok(None);
    }
    let text = value.to_display_string();
    parse_date(&text)
        .map(Some)
        .ok_or_else(|| FormulaError::Type(format!("'{}' is not a date", text)))
}

fn date_diff(a: NaiveDateTime, b: NaiveDateTime, unit: &str) -> Result<i64, FormulaError> {
    let delta = a - b;
    match unit {
        "minutes" | "minute" => Ok(delta.num_minutes()),
        "hours" | "hour" => Ok(delta.num_hours()),
        "days" | "day" => Ok(delta.num_days()),
        "weeks" | "week" => Ok(delta.num_weeks()),
        "months" | "month" => Ok(months_between(a, b)),
        "years" | "year" => Ok(months_between(a, b) / 12),
        other => Err(FormulaError::Type(format!("unknown DATE_DIFF unit '{}'", other))),
    }
}

/// Whole calendar months from `b` to `a`
fn months_between(a: NaiveDateTime, b: NaiveDateTime) -> i64 {
    let mut months = (a.year() as i64 - b.year() as i64) * 12 + (a.month() as i64 - b.month() as i64);
    if months > 0 && (a.day(), a.time()) < (b.day(), b.time()) {
        months -= 1;
    } else if months < 0 && (a.day(), a.time()) > (b.day(), b.time()) {
        months += 1;
    }
    months
}

/// Ordering used by comparison operators; `None` means incomparable
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => {
            if a.is_empty() && b.is_empty() {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => match (parse_date(x), parse_date(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        (Value::Number(x), Value::Text(_)) => b.as_number().and_then(|y| x.partial_cmp(&y)),
        (Value::Text(_), Value::Number(y)) => a.as_number().and_then(|x| x.partial_cmp(y)),
        (Value::Boolean(x), Value::Text(t)) | (Value::Text(t), Value::Boolean(x)) => {
            let parsed = match t.trim().to_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => return None,
            };
            let ordering = x.cmp(&parsed);
            Some(if matches!(a, Value::Boolean(_)) {
                ordering
            } else {
                ordering.reverse()
            })
        }
        (Value::List(x), Value::List(y)) => Some(x.cmp(y)),
        (Value::Rows(x), Value::Rows(y)) => Some(x.cmp(y)),
        _ => {
            let (x, y) = (a.to_display_string(), b.to_display_string());
            if x == y {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
    }
}
