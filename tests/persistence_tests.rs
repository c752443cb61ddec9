//! Persistence Tests
//!
//! RocksDB-backed engines reload every record after a restart and keep
//! allocating fresh ids.

use serde_json::json;
use tabula_core::*;
use tempfile::TempDir;

fn values(pairs: &[(ColumnId, serde_json::Value)]) -> RowValues {
    pairs.iter().cloned().collect()
}

#[test]
fn test_reopen_restores_schema_rows_edges_and_rules() {
    let dir = TempDir::new().unwrap();

    let (projects, tasks, rel, inverse, title, project, task, rule) = {
        let engine = TabulaEngine::open(EngineConfig::persistent(dir.path())).unwrap();
        assert!(engine.store().is_persistent());

        let projects = engine.create_database("Projects").unwrap().id;
        let tasks = engine.create_database("Tasks").unwrap().id;
        let title = engine.add_column(tasks, ColumnSpec::new("Title", ColumnKind::Text)).unwrap().id;
        let tags = engine
            .add_column(
                tasks,
                ColumnSpec::new("Tags", ColumnKind::MultiSelect { options: Vec::new() }),
            )
            .unwrap()
            .id;
        let rel = engine
            .add_column(
                projects,
                ColumnSpec::new(
                    "Tasks",
                    ColumnKind::Relation {
                        target_database_id: tasks,
                        inverse_column_id: None,
                    },
                )
                .with_inverse(InverseSpec::Create { name: None }),
            )
            .unwrap();

        let task = engine
            .add_row(tasks, &values(&[(title, json!("Write docs")), (tags, json!(["a", "b"]))]))
            .unwrap();
        let project = engine
            .add_row(projects, &values(&[(rel.id, json!([task.0]))]))
            .unwrap();
        let rule = engine
            .create_rule(RuleSpec {
                target_database_id: tasks,
                name: "Tag on edit".to_string(),
                trigger: RuleTrigger::OnRowUpdate {
                    watched_column_ids: Some(vec![title]),
                },
                condition_formula: Some("=LEN([Title]) > 3".to_string()),
                action: RuleAction::UpdateSameRow {
                    updates: [(tags, ActionValue::Literal(CellValue::MultiSelect(vec!["edited".into()])))]
                        .into_iter()
                        .collect(),
                },
                enabled: true,
            })
            .unwrap();
        engine.flush().unwrap();

        (projects, tasks, rel.id, rel.inverse().unwrap(), title, project, task, rule)
    };

    let engine = TabulaEngine::open(EngineConfig::persistent(dir.path())).unwrap();

    assert_eq!(engine.get_database(projects).unwrap().name, "Projects");
    assert_eq!(engine.columns(tasks).unwrap().len(), 3);
    assert_eq!(engine.get_column(rel).unwrap().inverse(), Some(inverse));

    let restored_task = engine.get_row(task).unwrap();
    assert_eq!(restored_task.get(title), &Value::Text("Write docs".into()));
    assert_eq!(restored_task.get(inverse), &Value::Rows(vec![project]));
    assert_eq!(engine.get_row(project).unwrap().get(rel), &Value::Rows(vec![task]));

    let restored_rule = engine.get_rule(rule.id).unwrap();
    assert_eq!(restored_rule, rule);

    // New records never reuse persisted ids
    let fresh = engine.add_row(tasks, &RowValues::new()).unwrap();
    assert!(fresh.0 > rule.id.0);

    // Restored rules still run
    let report = engine
        .update_row(task, &values(&[(title, json!("Write more docs"))]))
        .unwrap();
    assert_eq!(report.triggers.fired, vec![rule.id]);
}

#[test]
fn test_deletes_are_durable() {
    let dir = TempDir::new().unwrap();

    let (db, kept, removed, column) = {
        let engine = TabulaEngine::open(EngineConfig::persistent(dir.path())).unwrap();
        let db = engine.create_database("Notes").unwrap().id;
        let column = engine.add_column(db, ColumnSpec::new("Body", ColumnKind::Text)).unwrap().id;
        let kept = engine.add_row(db, &values(&[(column, json!("keep"))])).unwrap();
        let removed = engine.add_row(db, &values(&[(column, json!("drop"))])).unwrap();
        engine.delete_row(removed).unwrap();
        engine.update_row(kept, &values(&[(column, json!(null))])).unwrap();
        (db, kept, removed, column)
    };

    let engine = TabulaEngine::open(EngineConfig::persistent(dir.path())).unwrap();
    assert!(matches!(engine.get_row(removed), Err(EngineError::NotFound { .. })));
    assert_eq!(engine.get_row(kept).unwrap().get(column), &Value::Null);
    assert_eq!(engine.query_rows(db, &[], None).unwrap().rows.len(), 1);
}

#[test]
fn test_failed_unit_of_work_leaves_no_trace() {
    let dir = TempDir::new().unwrap();

    let (db, row, name) = {
        let engine = TabulaEngine::open(EngineConfig::persistent(dir.path())).unwrap();
        let db = engine.create_database("Inventory").unwrap().id;
        let name = engine.add_column(db, ColumnSpec::new("Name", ColumnKind::Text)).unwrap().id;
        let qty = engine.add_column(db, ColumnSpec::new("Qty", ColumnKind::Number)).unwrap().id;
        let row = engine.add_row(db, &values(&[(name, json!("Widget"))])).unwrap();

        let failed = engine.update_row(row, &values(&[(name, json!("Gadget")), (qty, json!("x"))]));
        assert!(failed.is_err());
        (db, row, name)
    };

    let engine = TabulaEngine::open(EngineConfig::persistent(dir.path())).unwrap();
    assert_eq!(engine.get_row(row).unwrap().get(name), &Value::Text("Widget".into()));
    assert_eq!(engine.list_databases()[0].id, db);
}
