//! Request/response wire types
//!
//! Plain data messages for the CLI/UI/IPC collaborator. Requests are JSON
//! objects keyed by the operation name, e.g.
//! `{"add_row": {"database_id": 1, "values": {"2": "Draft"}}}`.

use crate::error::EngineError;
use crate::query::{Filter, QueryResult, Sort};
use crate::row_store::{MaterializedRow, RowValues, UpdateReport};
use crate::rules::{RuleSpec, SmartRule, TriggerType};
use crate::schema::{Column, ColumnSpec, ColumnUpdate, Database};
use crate::types::{ColumnId, DatabaseId, RowId, RuleId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    CreateDatabase {
        name: String,
    },
    RenameDatabase {
        database_id: DatabaseId,
        name: String,
    },
    DeleteDatabase {
        database_id: DatabaseId,
    },
    GetDatabase {
        database_id: DatabaseId,
    },
    ListDatabases,
    AddColumn {
        database_id: DatabaseId,
        spec: ColumnSpec,
    },
    UpdateColumn {
        column_id: ColumnId,
        update: ColumnUpdate,
    },
    DeleteColumn {
        column_id: ColumnId,
    },
    ListColumns {
        database_id: DatabaseId,
    },
    AddRow {
        database_id: DatabaseId,
        #[serde(default)]
        values: RowValues,
    },
    GetRow {
        row_id: RowId,
    },
    UpdateRow {
        row_id: RowId,
        values: RowValues,
    },
    DeleteRow {
        row_id: RowId,
    },
    SetRowOrder {
        row_id: RowId,
        #[serde(default)]
        order: Option<f64>,
    },
    LinkRows {
        row_id: RowId,
        column_id: ColumnId,
        targets: Vec<RowId>,
    },
    UnlinkRows {
        row_id: RowId,
        column_id: ColumnId,
        targets: Vec<RowId>,
    },
    QueryRows {
        database_id: DatabaseId,
        #[serde(default)]
        filters: Vec<Filter>,
        #[serde(default)]
        sort: Option<Sort>,
    },
    CreateRule {
        spec: RuleSpec,
    },
    UpdateRule {
        rule_id: RuleId,
        spec: RuleSpec,
    },
    DeleteRule {
        rule_id: RuleId,
    },
    GetRule {
        rule_id: RuleId,
    },
    ListRules {
        database_id: DatabaseId,
        #[serde(default)]
        trigger_type: Option<TriggerType>,
        #[serde(default)]
        enabled: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Database(Database),
    Databases(Vec<Database>),
    Column(Column),
    Columns(Vec<Column>),
    RowId(RowId),
    Row(MaterializedRow),
    Updated(UpdateReport),
    Query(QueryResult),
    Rule(SmartRule),
    Rules(Vec<SmartRule>),
    Done,
    Error { code: String, message: String },
}

impl Response {
    pub fn from_error(error: &EngineError) -> Self {
        Response::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"error":{{"code":"SERIALIZATION_ERROR","message":{}}}}}"#,
                serde_json::Value::String(e.to_string())
            )
        })
    }
}
