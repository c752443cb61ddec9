//! Core type definitions for Tabula
//!
//! Identifiers, stored cell values and the materialized value model shared
//! by every component.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                $name(id)
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Unique identifier for a database (user-defined table)
    DatabaseId
);
record_id!(
    /// Unique identifier for a column
    ColumnId
);
record_id!(
    /// Unique identifier for a row
    RowId
);
record_id!(
    /// Unique identifier for a smart rule
    RuleId
);

/// A raw value as handed in by a collaborator (CLI/UI/IPC layer).
///
/// Raw values are coerced per column kind before they are stored.
pub type RawValue = serde_json::Value;

/// Stored cell value. At most one per (row, column) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    MultiSelect(Vec<String>),
}

impl CellValue {
    /// Wire slot record for this cell
    pub fn to_record(&self) -> CellRecord {
        let mut record = CellRecord::default();
        match self {
            CellValue::Text(s) => record.text = Some(s.clone()),
            CellValue::Number(n) => record.number = Some(*n),
            CellValue::Boolean(b) => record.boolean = Some(*b),
            CellValue::MultiSelect(items) => {
                // A Vec<String> always serializes.
                record.list = Some(serde_json::to_string(items).unwrap_or_else(|_| "[]".into()))
            }
        }
        record
    }

    /// Rebuild a cell from its wire record; exactly one slot must be set.
    pub fn from_record(record: &CellRecord) -> Result<Self, String> {
        let populated = [
            record.text.is_some(),
            record.number.is_some(),
            record.boolean.is_some(),
            record.list.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if populated != 1 {
            return Err(format!(
                "cell record must populate exactly one slot, found {}",
                populated
            ));
        }

        if let Some(text) = &record.text {
            Ok(CellValue::Text(text.clone()))
        } else if let Some(n) = record.number {
            Ok(CellValue::Number(n))
        } else if let Some(b) = record.boolean {
            Ok(CellValue::Boolean(b))
        } else {
            let encoded = record.list.as_deref().unwrap_or("[]");
            serde_json::from_str::<Vec<String>>(encoded)
                .map(CellValue::MultiSelect)
                .map_err(|e| format!("invalid multi-select list: {}", e))
        }
    }

    /// Raw representation, used when a cell is fed back into a write
    pub fn to_raw(&self) -> RawValue {
        match self {
            CellValue::Text(s) => RawValue::String(s.clone()),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(RawValue::Number)
                .unwrap_or(RawValue::Null),
            CellValue::Boolean(b) => RawValue::Bool(*b),
            CellValue::MultiSelect(items) => {
                RawValue::Array(items.iter().cloned().map(RawValue::String).collect())
            }
        }
    }
}

/// Cell wire format: a tagged record with exactly one populated slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
    /// JSON-encoded list of strings (multi-select)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
}

/// Coded error strings written in place of a computed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentinel {
    /// Formula parse/evaluation failure
    Error,
    /// Rollup/lookup source misconfigured
    ConfigError,
    /// Relation does not point where the target column lives
    RelationError,
    /// Target column missing
    TargetColumnError,
    /// Computed column resolution re-entered itself
    CycleError,
}

impl Sentinel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Error => "#ERROR!",
            Sentinel::ConfigError => "#CONFIG_ERROR!",
            Sentinel::RelationError => "#RELATION_ERROR!",
            Sentinel::TargetColumnError => "#TARGET_COL_ERROR!",
            Sentinel::CycleError => "#CYCLE_ERROR!",
        }
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the values a column produces, used for compatibility checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Text,
    Number,
    Date,
    Boolean,
    List,
    Rows,
}

/// Materialized value of one column in one row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    List(Vec<String>),
    Rows(Vec<RowId>),
    Error(Sentinel),
}

impl Value {
    pub fn from_cell(cell: &CellValue) -> Self {
        match cell {
            CellValue::Text(s) => Value::Text(s.clone()),
            CellValue::Number(n) => Value::Number(*n),
            CellValue::Boolean(b) => Value::Boolean(*b),
            CellValue::MultiSelect(items) => Value::List(items.clone()),
        }
    }

    /// Wire record of a stored scalar; `None` for values no cell holds
    pub fn to_cell_record(&self) -> Option<CellRecord> {
        let cell = match self {
            Value::Text(s) => CellValue::Text(s.clone()),
            Value::Number(n) => CellValue::Number(*n),
            Value::Boolean(b) => CellValue::Boolean(*b),
            Value::List(items) => CellValue::MultiSelect(items.clone()),
            Value::Null | Value::Rows(_) | Value::Error(_) => return None,
        };
        Some(cell.to_record())
    }

    /// Empty in the rollup/query sense: null, blank text, empty list
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Rows(rows) => rows.is_empty(),
            Value::Number(_) | Value::Boolean(_) | Value::Error(_) => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Numeric view; numeric text parses
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[RowId]> {
        match self {
            Value::Rows(rows) => Some(rows.as_slice()),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Error(_) => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
            Value::List(items) => !items.is_empty(),
            Value::Rows(rows) => !rows.is_empty(),
        }
    }

    /// Individual string items, lists flattened. Empty for null.
    pub fn string_items(&self) -> Vec<String> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items.clone(),
            Value::Rows(rows) => rows.iter().map(|r| r.to_string()).collect(),
            other => vec![other.to_display_string()],
        }
    }

    /// Display form used by CONCAT, SHOW_UNIQUE and lookups
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Boolean(b) => b.to_string(),
            Value::List(items) => items.join(", "),
            Value::Rows(rows) => rows
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            Value::Error(s) => s.as_str().to_string(),
        }
    }
}

/// Integral floats print without a fractional part
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Parse a DATE value: `YYYY-MM-DD`, RFC 3339, or a naive date-time
pub fn parse_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

/// Canonical stored form of a date string
pub fn normalize_date(s: &str) -> Option<String> {
    let s = s.trim();
    if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
        return Some(s.to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    parse_date(s).map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Epoch milliseconds to a canonical UTC timestamp
pub fn date_from_millis(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Rows(rows) => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(&row.0)?;
                }
                seq.end()
            }
            Value::Error(sentinel) => serializer.serialize_str(sentinel.as_str()),
        }
    }
}
