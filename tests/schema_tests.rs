//! Schema Registry Tests
//!
//! Database lifecycle, column validation, relation pairing and cascades.

use serde_json::json;
use std::collections::BTreeMap;
use tabula_core::*;

fn values(pairs: &[(ColumnId, serde_json::Value)]) -> RowValues {
    pairs.iter().cloned().collect::<BTreeMap<_, _>>()
}

#[test]
fn test_create_and_rename_database() {
    let engine = TabulaEngine::in_memory();

    let db = engine.create_database("  Projects ").unwrap();
    assert_eq!(db.name, "Projects");

    let renamed = engine.rename_database(db.id, "Active Projects").unwrap();
    assert_eq!(renamed.name, "Active Projects");
    assert_eq!(renamed.created_at, db.created_at);
    assert_eq!(engine.list_databases().len(), 1);

    assert!(matches!(
        engine.create_database("   "),
        Err(EngineError::Validation(_))
    ));
}

#[test]
fn test_column_names_unique_case_insensitive() {
    let engine = TabulaEngine::in_memory();
    let db = engine.create_database("Tasks").unwrap();

    engine.add_column(db.id, ColumnSpec::new("Title", ColumnKind::Text)).unwrap();
    let duplicate = engine.add_column(db.id, ColumnSpec::new("title", ColumnKind::Number));
    assert!(matches!(duplicate, Err(EngineError::Validation(_))));

    let other = engine.create_database("Notes").unwrap();
    assert!(engine.add_column(other.id, ColumnSpec::new("Title", ColumnKind::Text)).is_ok());
}

#[test]
fn test_columns_listed_in_display_order() {
    let engine = TabulaEngine::in_memory();
    let db = engine.create_database("Tasks").unwrap();

    engine.add_column(db.id, ColumnSpec::new("C", ColumnKind::Text).with_order(30)).unwrap();
    engine.add_column(db.id, ColumnSpec::new("A", ColumnKind::Text).with_order(10)).unwrap();
    engine.add_column(db.id, ColumnSpec::new("B", ColumnKind::Text).with_order(20)).unwrap();
    let appended = engine.add_column(db.id, ColumnSpec::new("D", ColumnKind::Text)).unwrap();
    assert_eq!(appended.order, 31);

    let names: Vec<_> = engine.columns(db.id).unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["A", "B", "C", "D"]);

    let clash = engine.add_column(db.id, ColumnSpec::new("E", ColumnKind::Text).with_order(20));
    assert!(matches!(clash, Err(EngineError::Validation(_))));
}

#[test]
fn test_formula_syntax_checked_at_add_time() {
    let engine = TabulaEngine::in_memory();
    let db = engine.create_database("Tasks").unwrap();

    let bad = engine.add_column(
        db.id,
        ColumnSpec::new(
            "Broken",
            ColumnKind::Formula {
                expression: "=[A] +".to_string(),
                result_type: None,
            },
        ),
    );
    assert!(matches!(bad, Err(EngineError::Validation(_))));

    let empty = engine.add_column(
        db.id,
        ColumnSpec::new(
            "Empty",
            ColumnKind::Formula {
                expression: "=".to_string(),
                result_type: None,
            },
        ),
    );
    assert!(matches!(empty, Err(EngineError::Validation(_))));
}

#[test]
fn test_rollup_requires_compatible_target() {
    let engine = TabulaEngine::in_memory();
    let projects = engine.create_database("Projects").unwrap();
    let tasks = engine.create_database("Tasks").unwrap();

    let title = engine.add_column(tasks.id, ColumnSpec::new("Title", ColumnKind::Text)).unwrap();
    let rel = engine
        .add_column(
            projects.id,
            ColumnSpec::new(
                "Tasks",
                ColumnKind::Relation {
                    target_database_id: tasks.id,
                    inverse_column_id: None,
                },
            ),
        )
        .unwrap();

    let sum_of_text = engine.add_column(
        projects.id,
        ColumnSpec::new(
            "Total",
            ColumnKind::Rollup {
                source_relation_column_id: rel.id,
                target_column_id: title.id,
                function: RollupFunction::Sum,
            },
        ),
    );
    assert!(matches!(sum_of_text, Err(EngineError::Validation(_))));

    let count = engine.add_column(
        projects.id,
        ColumnSpec::new(
            "Count",
            ColumnKind::Rollup {
                source_relation_column_id: rel.id,
                target_column_id: title.id,
                function: RollupFunction::CountAll,
            },
        ),
    );
    assert!(count.is_ok());

    // Target column must live in the database the relation points to
    let own = engine.add_column(projects.id, ColumnSpec::new("Name", ColumnKind::Text)).unwrap();
    let misdirected = engine.add_column(
        projects.id,
        ColumnSpec::new(
            "Wrong",
            ColumnKind::Lookup {
                source_relation_column_id: rel.id,
                target_column_id: own.id,
                policy: LookupPolicy::First,
            },
        ),
    );
    assert!(matches!(misdirected, Err(EngineError::Referential(_))));
}

#[test]
fn test_relation_requires_existing_target_database() {
    let engine = TabulaEngine::in_memory();
    let db = engine.create_database("Tasks").unwrap();

    let result = engine.add_column(
        db.id,
        ColumnSpec::new(
            "Owner",
            ColumnKind::Relation {
                target_database_id: DatabaseId::new(9_999),
                inverse_column_id: None,
            },
        ),
    );
    assert!(matches!(result, Err(EngineError::Referential(_))));
    assert!(engine.columns(db.id).unwrap().is_empty());
}

#[test]
fn test_inverse_created_with_generated_name() {
    let engine = TabulaEngine::in_memory();
    let projects = engine.create_database("Projects").unwrap();
    let tasks = engine.create_database("Tasks").unwrap();

    let rel = engine
        .add_column(
            projects.id,
            ColumnSpec::new(
                "Tasks",
                ColumnKind::Relation {
                    target_database_id: tasks.id,
                    inverse_column_id: None,
                },
            )
            .with_inverse(InverseSpec::Create { name: None }),
        )
        .unwrap();

    let inverse_id = rel.inverse().expect("paired");
    let inverse = engine.get_column(inverse_id).unwrap();
    assert_eq!(inverse.database_id, tasks.id);
    assert_eq!(inverse.name, "Projects (Tasks)");
    assert_eq!(inverse.inverse(), Some(rel.id));
}

#[test]
fn test_pairing_existing_columns_mirrors_edges() {
    let engine = TabulaEngine::in_memory();
    let people = engine.create_database("People").unwrap();
    let teams = engine.create_database("Teams").unwrap();

    let member_of = engine
        .add_column(
            people.id,
            ColumnSpec::new(
                "Teams",
                ColumnKind::Relation {
                    target_database_id: teams.id,
                    inverse_column_id: None,
                },
            ),
        )
        .unwrap();
    let members = engine
        .add_column(
            teams.id,
            ColumnSpec::new(
                "Members",
                ColumnKind::Relation {
                    target_database_id: people.id,
                    inverse_column_id: None,
                },
            ),
        )
        .unwrap();

    let team = engine.add_row(teams.id, &RowValues::new()).unwrap();
    let alice = engine
        .add_row(people.id, &values(&[(member_of.id, json!([team.0]))]))
        .unwrap();
    assert_eq!(engine.get_row(team).unwrap().get(members.id), &Value::Rows(vec![]));

    engine
        .update_column(
            member_of.id,
            ColumnUpdate {
                inverse: Some(InverseUpdate::Attach(InverseSpec::Existing(members.id))),
                ..ColumnUpdate::default()
            },
        )
        .unwrap();

    assert_eq!(
        engine.get_row(team).unwrap().get(members.id),
        &Value::Rows(vec![alice])
    );
}

#[test]
fn test_deleting_paired_column_clears_partner() {
    let engine = TabulaEngine::in_memory();
    let projects = engine.create_database("Projects").unwrap();
    let tasks = engine.create_database("Tasks").unwrap();

    let rel = engine
        .add_column(
            projects.id,
            ColumnSpec::new(
                "Tasks",
                ColumnKind::Relation {
                    target_database_id: tasks.id,
                    inverse_column_id: None,
                },
            )
            .with_inverse(InverseSpec::Create {
                name: Some("Project".to_string()),
            }),
        )
        .unwrap();
    let inverse_id = rel.inverse().unwrap();

    engine.delete_column(rel.id).unwrap();

    let partner = engine.get_column(inverse_id).unwrap();
    assert_eq!(partner.inverse(), None);
    assert!(matches!(
        engine.get_column(rel.id),
        Err(EngineError::NotFound { .. })
    ));
}

#[test]
fn test_retype_to_computed_drops_cells() {
    let engine = TabulaEngine::in_memory();
    let db = engine.create_database("Tasks").unwrap();
    let points = engine.add_column(db.id, ColumnSpec::new("Points", ColumnKind::Number)).unwrap();
    let label = engine.add_column(db.id, ColumnSpec::new("Label", ColumnKind::Text)).unwrap();

    let row = engine
        .add_row(db.id, &values(&[(points.id, json!(8)), (label.id, json!("12"))]))
        .unwrap();

    // Scalar to scalar keeps the stored cell and reads it under the new kind
    engine
        .update_column(
            label.id,
            ColumnUpdate {
                kind: Some(ColumnKind::Number),
                ..ColumnUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(engine.get_row(row).unwrap().get(label.id), &Value::Number(12.0));

    engine
        .update_column(
            points.id,
            ColumnUpdate {
                kind: Some(ColumnKind::Formula {
                    expression: "=[Label] * 2".to_string(),
                    result_type: None,
                }),
                ..ColumnUpdate::default()
            },
        )
        .unwrap();
    assert!(engine.store().read().cell(row, points.id).is_none());
    assert_eq!(engine.get_row(row).unwrap().get(points.id), &Value::Number(24.0));
}

#[test]
fn test_delete_database_cascades() {
    let engine = TabulaEngine::in_memory();
    let projects = engine.create_database("Projects").unwrap();
    let tasks = engine.create_database("Tasks").unwrap();

    let rel = engine
        .add_column(
            projects.id,
            ColumnSpec::new(
                "Tasks",
                ColumnKind::Relation {
                    target_database_id: tasks.id,
                    inverse_column_id: None,
                },
            )
            .with_inverse(InverseSpec::Create { name: None }),
        )
        .unwrap();
    let inverse_id = rel.inverse().unwrap();
    let done = engine.add_column(tasks.id, ColumnSpec::new("Done", ColumnKind::Boolean)).unwrap();

    let task = engine.add_row(tasks.id, &values(&[(done.id, json!(true))])).unwrap();
    let project = engine
        .add_row(projects.id, &values(&[(rel.id, json!([task.0]))]))
        .unwrap();
    engine
        .create_rule(RuleSpec {
            target_database_id: tasks.id,
            name: "noop".to_string(),
            trigger: RuleTrigger::OnRowUpdate {
                watched_column_ids: None,
            },
            condition_formula: None,
            action: RuleAction::UpdateSameRow {
                updates: [(done.id, ActionValue::Literal(CellValue::Boolean(false)))]
                    .into_iter()
                    .collect(),
            },
            enabled: true,
        })
        .unwrap();

    engine.delete_database(tasks.id).unwrap();

    assert!(matches!(engine.get_row(task), Err(EngineError::NotFound { .. })));
    assert!(matches!(engine.get_column(inverse_id), Err(EngineError::NotFound { .. })));
    assert_eq!(engine.get_row(project).unwrap().get(rel.id), &Value::Rows(vec![]));
    assert_eq!(engine.store().read().rules().count(), 0);
    assert_eq!(engine.list_databases().len(), 1);
}

fn paired_projects_tasks(engine: &TabulaEngine) -> (DatabaseId, DatabaseId, Column) {
    let projects = engine.create_database("Projects").unwrap().id;
    let tasks = engine.create_database("Tasks").unwrap().id;
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
            .with_inverse(InverseSpec::Create {
                name: Some("Project".to_string()),
            }),
        )
        .unwrap();
    (projects, tasks, rel)
}

#[test]
fn test_retyping_paired_relation_clears_edges_and_pairing() {
    let engine = TabulaEngine::in_memory();
    let (projects, tasks, rel) = paired_projects_tasks(&engine);
    let inverse_id = rel.inverse().unwrap();

    let task = engine.add_row(tasks, &RowValues::new()).unwrap();
    let project = engine
        .add_row(projects, &values(&[(rel.id, json!([task.0]))]))
        .unwrap();
    assert_eq!(
        engine.get_row(task).unwrap().get(inverse_id),
        &Value::Rows(vec![project])
    );

    let updated = engine
        .update_column(
            rel.id,
            ColumnUpdate {
                kind: Some(ColumnKind::Text),
                ..ColumnUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(updated.kind, ColumnKind::Text);
    assert_eq!(engine.get_column(inverse_id).unwrap().inverse(), None);
    assert_eq!(engine.get_row(task).unwrap().get(inverse_id), &Value::Rows(vec![]));
    assert_eq!(engine.get_row(project).unwrap().get(rel.id), &Value::Null);
}

#[test]
fn test_retargeting_paired_relation_clears_edges_and_pairing() {
    let engine = TabulaEngine::in_memory();
    let (projects, tasks, rel) = paired_projects_tasks(&engine);
    let inverse_id = rel.inverse().unwrap();
    let people = engine.create_database("People").unwrap().id;

    let task = engine.add_row(tasks, &RowValues::new()).unwrap();
    let project = engine
        .add_row(projects, &values(&[(rel.id, json!([task.0]))]))
        .unwrap();

    let updated = engine
        .update_column(
            rel.id,
            ColumnUpdate {
                kind: Some(ColumnKind::Relation {
                    target_database_id: people,
                    inverse_column_id: None,
                }),
                ..ColumnUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(updated.kind.relation_target(), Some(people));
    assert_eq!(updated.inverse(), None);
    assert_eq!(engine.get_column(inverse_id).unwrap().inverse(), None);
    assert_eq!(engine.get_row(project).unwrap().get(rel.id), &Value::Rows(vec![]));
    assert_eq!(engine.get_row(task).unwrap().get(inverse_id), &Value::Rows(vec![]));
}

#[test]
fn test_inverse_name_collision_is_rejected() {
    let engine = TabulaEngine::in_memory();
    let projects = engine.create_database("Projects").unwrap().id;
    let tasks = engine.create_database("Tasks").unwrap().id;
    engine
        .add_column(tasks, ColumnSpec::new("Projects (Tasks)", ColumnKind::Text))
        .unwrap();
    engine
        .add_column(tasks, ColumnSpec::new("Owner", ColumnKind::Text))
        .unwrap();

    let generated = engine.add_column(
        projects,
        ColumnSpec::new(
            "Tasks",
            ColumnKind::Relation {
                target_database_id: tasks,
                inverse_column_id: None,
            },
        )
        .with_inverse(InverseSpec::Create { name: None }),
    );
    assert!(matches!(generated, Err(EngineError::Validation(_))));

    let named = engine.add_column(
        projects,
        ColumnSpec::new(
            "Tasks",
            ColumnKind::Relation {
                target_database_id: tasks,
                inverse_column_id: None,
            },
        )
        .with_inverse(InverseSpec::Create {
            name: Some("owner".to_string()),
        }),
    );
    assert!(matches!(named, Err(EngineError::Validation(_))));

    // Nothing from the failed adds is left behind
    assert!(engine.find_column(projects, "Tasks").is_none());
    assert_eq!(engine.columns(tasks).unwrap().len(), 2);
}

#[test]
fn test_delete_database_removes_foreign_relations() {
    let engine = TabulaEngine::in_memory();
    let people = engine.create_database("People").unwrap().id;
    let teams = engine.create_database("Teams").unwrap().id;
    let name = engine
        .add_column(people, ColumnSpec::new("Name", ColumnKind::Text))
        .unwrap();
    let unpaired = engine
        .add_column(
            people,
            ColumnSpec::new(
                "Teams",
                ColumnKind::Relation {
                    target_database_id: teams,
                    inverse_column_id: None,
                },
            ),
        )
        .unwrap();

    let team = engine.add_row(teams, &RowValues::new()).unwrap();
    let person = engine
        .add_row(
            people,
            &values(&[(name.id, json!("Ada")), (unpaired.id, json!([team.0]))]),
        )
        .unwrap();

    engine.delete_database(teams).unwrap();

    assert!(matches!(
        engine.get_column(unpaired.id),
        Err(EngineError::NotFound { .. })
    ));
    let read = engine.get_row(person).unwrap();
    assert_eq!(read.get(name.id), &Value::Text("Ada".into()));
    assert!(!read.values.contains_key(&unpaired.id));
    assert_eq!(engine.columns(people).unwrap(), vec![name]);
}
