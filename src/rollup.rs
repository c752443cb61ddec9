//! Rollup Aggregator
//!
//! Pure aggregation over the values fetched from linked rows. Every function
//! has a well-defined result for an empty input.

use crate::types::{parse_date, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Separator used by SHOW_UNIQUE unless configured otherwise
pub const DEFAULT_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollupFunction {
    CountAll,
    CountValues,
    CountUniqueValues,
    Sum,
    Avg,
    Min,
    Max,
    ShowUnique,
    PercentEmpty,
    PercentNotEmpty,
    CountChecked,
    CountUnchecked,
    PercentChecked,
    PercentUnchecked,
}

impl RollupFunction {
    pub const ALL: [RollupFunction; 14] = [
        RollupFunction::CountAll,
        RollupFunction::CountValues,
        RollupFunction::CountUniqueValues,
        RollupFunction::Sum,
        RollupFunction::Avg,
        RollupFunction::Min,
        RollupFunction::Max,
        RollupFunction::ShowUnique,
        RollupFunction::PercentEmpty,
        RollupFunction::PercentNotEmpty,
        RollupFunction::CountChecked,
        RollupFunction::CountUnchecked,
        RollupFunction::PercentChecked,
        RollupFunction::PercentUnchecked,
    ];

    fn is_checkbox(self) -> bool {
        matches!(
            self,
            RollupFunction::CountChecked
                | RollupFunction::CountUnchecked
                | RollupFunction::PercentChecked
                | RollupFunction::PercentUnchecked
        )
    }

    /// Whether this function can aggregate values of `target`.
    /// Unknown target types are accepted.
    pub fn accepts(self, target: Option<ValueType>) -> bool {
        let Some(target) = target else {
            return true;
        };
        match self {
            RollupFunction::Sum | RollupFunction::Avg => target == ValueType::Number,
            RollupFunction::Min | RollupFunction::Max => {
                matches!(target, ValueType::Number | ValueType::Date)
            }
            f if f.is_checkbox() => target == ValueType::Boolean,
            _ => true,
        }
    }

    /// Shape of the aggregate
    pub fn result_type(self, target: Option<ValueType>) -> Option<ValueType> {
        match self {
            RollupFunction::Min | RollupFunction::Max => target,
            RollupFunction::ShowUnique => Some(ValueType::Text),
            _ => Some(ValueType::Number),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RollupError {
    #[error("{function:?} cannot aggregate {target:?} values")]
    Incompatible {
        function: RollupFunction,
        target: ValueType,
    },
}

/// Aggregate with the default SHOW_UNIQUE separator
pub fn aggregate(
    values: &[Value],
    function: RollupFunction,
    target: Option<ValueType>,
) -> Result<Value, RollupError> {
    aggregate_joined(values, function, target, DEFAULT_SEPARATOR)
}

pub fn aggregate_joined(
    values: &[Value],
    function: RollupFunction,
    target: Option<ValueType>,
    separator: &str,
) -> Result<Value, RollupError> {
    if let Some(target) = target {
        if !function.accepts(Some(target)) {
            return Err(RollupError::Incompatible { function, target });
        }
    }

    let total = values.len();
    let result = match function {
        RollupFunction::CountAll => Value::Number(total as f64),
        RollupFunction::CountValues => {
            Value::Number(values.iter().map(count_items).sum::<usize>() as f64)
        }
        RollupFunction::CountUniqueValues => Value::Number(unique_items(values).len() as f64),
        RollupFunction::Sum => Value::Number(numbers(values).sum()),
        RollupFunction::Avg => {
            let numbers: Vec<f64> = numbers(values).collect();
            if numbers.is_empty() {
                Value::Number(0.0)
            } else {
                Value::Number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        RollupFunction::Min | RollupFunction::Max => {
            let want_max = function == RollupFunction::Max;
            if target == Some(ValueType::Date) {
                extreme_date(values, want_max)
            } else {
                let pick = if want_max {
                    numbers(values).reduce(f64::max)
                } else {
                    numbers(values).reduce(f64::min)
                };
                pick.map(Value::Number).unwrap_or(Value::Null)
            }
        }
        RollupFunction::ShowUnique => Value::Text(unique_items(values).join(separator)),
        RollupFunction::PercentEmpty => {
            percent(values.iter().filter(|v| v.is_empty()).count(), total)
        }
        RollupFunction::PercentNotEmpty => {
            percent(values.iter().filter(|v| !v.is_empty()).count(), total)
        }
        RollupFunction::CountChecked => Value::Number(checked(values) as f64),
        RollupFunction::CountUnchecked => Value::Number((total - checked(values)) as f64),
        RollupFunction::PercentChecked => percent(checked(values), total),
        RollupFunction::PercentUnchecked => percent(total - checked(values), total),
    };

    Ok(result)
}

fn numbers(values: &[Value]) -> impl Iterator<Item = f64> + '_ {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .filter_map(|v| match v {
            Value::Boolean(_) => None,
            other => other.as_number(),
        })
}

/// Lists count per item; everything else counts once unless empty
fn count_items(value: &Value) -> usize {
    match value {
        Value::List(items) => items.iter().filter(|i| !i.trim().is_empty()).count(),
        Value::Rows(rows) => rows.len(),
        other if other.is_empty() => 0,
        _ => 1,
    }
}

/// Distinct string items in first-seen order, lists flattened
fn unique_items(values: &[Value]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for value in values {
        for item in value.string_items() {
            let item = item.trim().to_string();
            if !item.is_empty() && seen.insert(item.clone()) {
                unique.push(item);
            }
        }
    }
    unique
}

fn is_checked(value: &Value) -> bool {
    match value {
        Value::Boolean(b) => *b,
        Value::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn checked(values: &[Value]) -> usize {
    values.iter().filter(|v| is_checked(v)).count()
}

/// Raw ratio scaled to 0..=100
fn percent(part: usize, total: usize) -> Value {
    if total == 0 {
        Value::Number(0.0)
    } else {
        Value::Number(part as f64 * 100.0 / total as f64)
    }
}

fn extreme_date(values: &[Value], want_max: bool) -> Value {
    let mut best: Option<(chrono::NaiveDateTime, &str)> = None;
    for value in values {
        let Value::Text(text) = value else { continue };
        let Some(parsed) = parse_date(text) else { continue };
        let better = match &best {
            None => true,
            Some((current, _)) => {
                if want_max {
                    parsed > *current
                } else {
                    parsed < *current
                }
            }
        };
        if better {
            best = Some((parsed, text.as_str()));
        }
    }
    best.map(|(_, text)| Value::Text(text.to_string()))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nums(values: &[f64]) -> Vec<Value> {
        values.iter().map(|n| Value::Number(*n)).collect()
    }

    #[test]
    fn test_empty_input_identities() {
        for function in RollupFunction::ALL {
            let result = aggregate(&[], function, None).unwrap();
            let expected = match function {
                RollupFunction::Min | RollupFunction::Max => Value::Null,
                RollupFunction::ShowUnique => Value::Text(String::new()),
                _ => Value::Number(0.0),
            };
            assert_eq!(result, expected, "{:?}", function);
        }
    }

    #[test]
    fn test_numeric_aggregates_skip_empty() {
        let mut values = nums(&[4.0, 1.0, 7.0]);
        values.push(Value::Null);
        values.push(Value::Text(String::new()));

        assert_eq!(aggregate(&values, RollupFunction::Sum, None), Ok(Value::Number(12.0)));
        assert_eq!(aggregate(&values, RollupFunction::Avg, None), Ok(Value::Number(4.0)));
        assert_eq!(aggregate(&values, RollupFunction::Min, None), Ok(Value::Number(1.0)));
        assert_eq!(aggregate(&values, RollupFunction::Max, None), Ok(Value::Number(7.0)));
        assert_eq!(aggregate(&values, RollupFunction::CountAll, None), Ok(Value::Number(5.0)));
        assert_eq!(aggregate(&values, RollupFunction::CountValues, None), Ok(Value::Number(3.0)));
        assert_eq!(
            aggregate(&values, RollupFunction::PercentEmpty, None),
            Ok(Value::Number(40.0))
        );
    }

    #[test]
    fn test_unique_values_flatten_lists() {
        let values = vec![
            Value::List(vec!["red".into(), "blue".into()]),
            Value::Text("red".into()),
            Value::List(vec!["green".into()]),
        ];
        assert_eq!(
            aggregate(&values, RollupFunction::ShowUnique, None),
            Ok(Value::Text("red, blue, green".into()))
        );
        assert_eq!(
            aggregate(&values, RollupFunction::CountUniqueValues, None),
            Ok(Value::Number(3.0))
        );
        assert_eq!(
            aggregate(&values, RollupFunction::CountValues, None),
            Ok(Value::Number(4.0))
        );
    }

    #[test]
    fn test_checkbox_family() {
        let values = vec![
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Boolean(true),
            Value::Null,
        ];
        let target = Some(ValueType::Boolean);
        assert_eq!(aggregate(&values, RollupFunction::CountChecked, target), Ok(Value::Number(2.0)));
        assert_eq!(aggregate(&values, RollupFunction::CountUnchecked, target), Ok(Value::Number(2.0)));
        assert_eq!(aggregate(&values, RollupFunction::PercentChecked, target), Ok(Value::Number(50.0)));
    }

    #[test]
    fn test_date_extremes() {
        let values = vec![
            Value::Text("2024-03-01".into()),
            Value::Text("2023-12-31".into()),
            Value::Null,
        ];
        let target = Some(ValueType::Date);
        assert_eq!(
            aggregate(&values, RollupFunction::Min, target),
            Ok(Value::Text("2023-12-31".into()))
        );
        assert_eq!(
            aggregate(&values, RollupFunction::Max, target),
            Ok(Value::Text("2024-03-01".into()))
        );
    }

    #[test]
    fn test_incompatible_target_rejected() {
        let result = aggregate(&[], RollupFunction::Sum, Some(ValueType::Text));
        assert!(matches!(result, Err(RollupError::Incompatible { .. })));
        assert!(RollupFunction::CountAll.accepts(Some(ValueType::Rows)));
        assert!(!RollupFunction::CountChecked.accepts(Some(ValueType::Number)));
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&RollupFunction::PercentNotEmpty).unwrap();
        assert_eq!(json, "\"PERCENT_NOT_EMPTY\"");
    }
}
