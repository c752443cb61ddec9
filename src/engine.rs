//! Engine facade
//!
//! Wires every component to one shared store handle and exposes the
//! collaborator-facing operations, either as typed calls or as
//! request/response messages.

use crate::api::{Request, Response};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::query::{Filter, QueryEngine, QueryResult, Sort};
use crate::row_store::{MaterializedRow, RowStore, RowValues, UpdateReport};
use crate::rules::{RuleFilter, RuleRegistry, RuleSpec, SmartRule};
use crate::schema::{Column, ColumnSpec, ColumnUpdate, Database, SchemaRegistry};
use crate::store::Store;
use crate::types::{ColumnId, DatabaseId, RowId, RuleId};
use std::sync::Arc;
use tracing::{info, warn};

/// Embedded database engine
pub struct TabulaEngine {
    config: EngineConfig,
    store: Arc<Store>,
    schema: SchemaRegistry,
    rows: Arc<RowStore>,
    query: QueryEngine,
    rules: RuleRegistry,
}

impl TabulaEngine {
    /// Open an engine; `config.data_dir` selects durable storage
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = match &config.data_dir {
            Some(path) => Store::open(path)?,
            None => Store::in_memory(),
        };
        Ok(TabulaEngine::with_store(config, store))
    }

    /// Non-persistent engine with default settings
    pub fn in_memory() -> Self {
        TabulaEngine::with_store(EngineConfig::in_memory(), Store::in_memory())
    }

    fn with_store(config: EngineConfig, store: Store) -> Self {
        let store = Arc::new(store);
        let rows = Arc::new(RowStore::new(Arc::clone(&store), &config));

        info!(
            persistent = store.is_persistent(),
            max_trigger_depth = config.max_trigger_depth,
            "engine opened"
        );

        TabulaEngine {
            schema: SchemaRegistry::new(Arc::clone(&store)),
            query: QueryEngine::new(Arc::clone(&store), Arc::clone(&rows)),
            rules: RuleRegistry::new(Arc::clone(&store)),
            rows,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    // Schema

    pub fn create_database(&self, name: &str) -> Result<Database> {
        self.schema.create_database(name)
    }

    pub fn rename_database(&self, id: DatabaseId, name: &str) -> Result<Database> {
        self.schema.rename_database(id, name)
    }

    pub fn delete_database(&self, id: DatabaseId) -> Result<()> {
        self.schema.delete_database(id)
    }

    pub fn get_database(&self, id: DatabaseId) -> Result<Database> {
        self.schema.get_database(id)
    }

    pub fn list_databases(&self) -> Vec<Database> {
        self.schema.list_databases()
    }

    pub fn add_column(&self, database_id: DatabaseId, spec: ColumnSpec) -> Result<Column> {
        self.schema.add_column(database_id, spec)
    }

    pub fn update_column(&self, id: ColumnId, update: ColumnUpdate) -> Result<Column> {
        self.schema.update_column(id, update)
    }

    pub fn delete_column(&self, id: ColumnId) -> Result<()> {
        self.schema.delete_column(id)
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Column> {
        self.schema.get_column(id)
    }

    pub fn columns(&self, database_id: DatabaseId) -> Result<Vec<Column>> {
        self.schema.columns(database_id)
    }

    pub fn find_column(&self, database_id: DatabaseId, name: &str) -> Option<Column> {
        self.schema.find_column(database_id, name)
    }

    // Rows

    pub fn add_row(&self, database_id: DatabaseId, values: &RowValues) -> Result<RowId> {
        self.rows.add_row(database_id, values)
    }

    pub fn get_row(&self, row_id: RowId) -> Result<MaterializedRow> {
        self.rows.get_row(row_id)
    }

    pub fn update_row(&self, row_id: RowId, values: &RowValues) -> Result<UpdateReport> {
        self.rows.update_row(row_id, values)
    }

    pub fn delete_row(&self, row_id: RowId) -> Result<()> {
        self.rows.delete_row(row_id)
    }

    pub fn set_row_order(&self, row_id: RowId, order: Option<f64>) -> Result<()> {
        self.rows.set_row_order(row_id, order)
    }

    pub fn link_rows(&self, row_id: RowId, column_id: ColumnId, targets: &[RowId]) -> Result<UpdateReport> {
        self.rows.link_rows(row_id, column_id, targets)
    }

    pub fn unlink_rows(&self, row_id: RowId, column_id: ColumnId, targets: &[RowId]) -> Result<UpdateReport> {
        self.rows.unlink_rows(row_id, column_id, targets)
    }

    // Query

    pub fn query_rows(
        &self,
        database_id: DatabaseId,
        filters: &[Filter],
        sort: Option<Sort>,
    ) -> Result<QueryResult> {
        self.query.query_rows(database_id, filters, sort)
    }

    // Rules

    pub fn create_rule(&self, spec: RuleSpec) -> Result<SmartRule> {
        self.rules.create_rule(spec)
    }

    pub fn update_rule(&self, id: RuleId, spec: RuleSpec) -> Result<SmartRule> {
        self.rules.update_rule(id, spec)
    }

    pub fn delete_rule(&self, id: RuleId) -> Result<()> {
        self.rules.delete_rule(id)
    }

    pub fn get_rule(&self, id: RuleId) -> Result<SmartRule> {
        self.rules.get_rule(id)
    }

    pub fn list_rules_for_database(
        &self,
        database_id: DatabaseId,
        filter: RuleFilter,
    ) -> Result<Vec<SmartRule>> {
        self.rules.list_rules_for_database(database_id, filter)
    }

    // Messages

    /// Dispatch one request; errors become `Response::Error`
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(code = e.code(), error = %e, "request failed");
                Response::from_error(&e)
            }
        }
    }

    /// JSON in, JSON out
    pub fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => self.handle(request),
            Err(e) => Response::Error {
                code: "INVALID_REQUEST".to_string(),
                message: e.to_string(),
            },
        };
        response.to_json()
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::CreateDatabase { name } => Response::Database(self.create_database(&name)?),
            Request::RenameDatabase { database_id, name } => {
                Response::Database(self.rename_database(database_id, &name)?)
            }
            Request::DeleteDatabase { database_id } => {
                self.delete_database(database_id)?;
                Response::Done
            }
            Request::GetDatabase { database_id } => Response::Database(self.get_database(database_id)?),
            Request::ListDatabases => Response::Databases(self.list_databases()),
            Request::AddColumn { database_id, spec } => {
                Response::Column(self.add_column(database_id, spec)?)
            }
            Request::UpdateColumn { column_id, update } => {
                Response::Column(self.update_column(column_id, update)?)
            }
            Request::DeleteColumn { column_id } => {
                self.delete_column(column_id)?;
                Response::Done
            }
            Request::ListColumns { database_id } => Response::Columns(self.columns(database_id)?),
            Request::AddRow { database_id, values } => {
                Response::RowId(self.add_row(database_id, &values)?)
            }
            Request::GetRow { row_id } => Response::Row(self.get_row(row_id)?),
            Request::UpdateRow { row_id, values } => Response::Updated(self.update_row(row_id, &values)?),
            Request::DeleteRow { row_id } => {
                self.delete_row(row_id)?;
                Response::Done
            }
            Request::SetRowOrder { row_id, order } => {
                self.set_row_order(row_id, order)?;
                Response::Done
            }
            Request::LinkRows {
                row_id,
                column_id,
                targets,
            } => Response::Updated(self.link_rows(row_id, column_id, &targets)?),
            Request::UnlinkRows {
                row_id,
                column_id,
                targets,
            } => Response::Updated(self.unlink_rows(row_id, column_id, &targets)?),
            Request::QueryRows {
                database_id,
                filters,
                sort,
            } => Response::Query(self.query_rows(database_id, &filters, sort)?),
            Request::CreateRule { spec } => Response::Rule(self.create_rule(spec)?),
            Request::UpdateRule { rule_id, spec } => Response::Rule(self.update_rule(rule_id, spec)?),
            Request::DeleteRule { rule_id } => {
                self.delete_rule(rule_id)?;
                Response::Done
            }
            Request::GetRule { rule_id } => Response::Rule(self.get_rule(rule_id)?),
            Request::ListRules {
                database_id,
                trigger_type,
                enabled,
            } => Response::Rules(self.list_rules_for_database(
                database_id,
                RuleFilter {
                    trigger_type,
                    enabled,
                },
            )?),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;
    use serde_json::json;

    #[test]
    fn test_row_response_wire_shape() {
        let engine = TabulaEngine::in_memory();
        let projects = engine.create_database("Projects").unwrap().id;
        let tasks = engine.create_database("Tasks").unwrap().id;
        let column = |name: &str, kind: ColumnKind| {
            engine.add_column(tasks, ColumnSpec::new(name, kind)).unwrap().id
        };
        let title = column("Title", ColumnKind::Text);
        let points = column("Points", ColumnKind::Number);
        let done = column("Done", ColumnKind::Boolean);
        let tags = column("Tags", ColumnKind::MultiSelect { options: Vec::new() });
        let project_rel = column(
            "Project",
            ColumnKind::Relation {
                target_database_id: projects,
                inverse_column_id: None,
            },
        );
        let doubled = column(
            "Doubled",
            ColumnKind::Formula {
                expression: "=[Points] * 2".to_string(),
                result_type: None,
            },
        );
        let broken = column(
            "Broken",
            ColumnKind::Formula {
                expression: "=[Missing]".to_string(),
                result_type: None,
            },
        );

        let project = engine.add_row(projects, &RowValues::new()).unwrap();
        let values: RowValues = [
            (points, json!(4)),
            (tags, json!(["a"])),
            (project_rel, json!([project.0])),
        ]
        .into_iter()
        .collect();
        let task = engine.add_row(tasks, &values).unwrap();

        let response: serde_json::Value = serde_json::from_str(
            &engine.handle_json(&format!(r#"{{"get_row": {{"row_id": {}}}}}"#, task.0)),
        )
        .unwrap();
        let wire = &response["row"]["values"];
        let at = |id: ColumnId| &wire[id.0.to_string().as_str()];

        assert_eq!(response["row"]["id"], json!(task.0));
        assert_eq!(at(points), &json!({"number": 4.0}));
        assert_eq!(at(done), &json!({"boolean": false}));
        assert_eq!(at(tags), &json!({"list": r#"["a"]"#}));
        assert_eq!(at(title), &json!(null));
        assert_eq!(at(project_rel), &json!([project.0]));
        assert_eq!(at(doubled), &json!(8.0));
        assert_eq!(at(broken), &json!("#ERROR!"));
    }

    #[test]
    fn test_invalid_request_is_reported() {
        let engine = TabulaEngine::in_memory();
        let response: serde_json::Value =
            serde_json::from_str(&engine.handle_json(r#"{"get_row": {}}"#)).unwrap();
        assert_eq!(response["error"]["code"], "INVALID_REQUEST");
    }
}
