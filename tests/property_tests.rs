//! Property Tests
//!
//! Relation symmetry under arbitrary edit sequences and aggregator
//! identities over arbitrary inputs.

use proptest::prelude::*;
use serde_json::json;
use tabula_core::*;

#[derive(Debug, Clone)]
enum EdgeOp {
    Replace(usize, Vec<usize>),
    Link(usize, Vec<usize>),
    Unlink(usize, Vec<usize>),
    InverseReplace(usize, Vec<usize>),
    DeleteTarget(usize),
}

fn edge_op() -> impl Strategy<Value = EdgeOp> {
    let targets = prop::collection::vec(0usize..5, 0..5);
    prop_oneof![
        (0usize..4, targets.clone()).prop_map(|(s, t)| EdgeOp::Replace(s, t)),
        (0usize..4, targets.clone()).prop_map(|(s, t)| EdgeOp::Link(s, t)),
        (0usize..4, targets.clone()).prop_map(|(s, t)| EdgeOp::Unlink(s, t)),
        (0usize..5, prop::collection::vec(0usize..4, 0..4))
            .prop_map(|(s, t)| EdgeOp::InverseReplace(s, t)),
        (0usize..5).prop_map(EdgeOp::DeleteTarget),
    ]
}

fn ids(rows: &[RowId], picks: &[usize]) -> Vec<RowId> {
    picks.iter().map(|i| rows[*i]).collect()
}

fn to_json(rows: &[RowId]) -> serde_json::Value {
    json!(rows.iter().map(|r| r.0).collect::<Vec<_>>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_paired_relations_stay_symmetric(ops in prop::collection::vec(edge_op(), 1..25)) {
        let engine = TabulaEngine::in_memory();
        let left = engine.create_database("Left").unwrap().id;
        let right = engine.create_database("Right").unwrap().id;
        let rel = engine
            .add_column(
                left,
                ColumnSpec::new(
                    "Links",
                    ColumnKind::Relation { target_database_id: right, inverse_column_id: None },
                )
                .with_inverse(InverseSpec::Create { name: None }),
            )
            .unwrap();
        let inverse = rel.inverse().unwrap();

        let sources: Vec<RowId> = (0..4).map(|_| engine.add_row(left, &RowValues::new()).unwrap()).collect();
        let mut targets: Vec<RowId> = (0..5).map(|_| engine.add_row(right, &RowValues::new()).unwrap()).collect();

        for op in ops {
            // Ops naming a deleted target fail atomically; symmetry must hold either way
            let _ = match op {
                EdgeOp::Replace(s, t) => engine
                    .update_row(sources[s], &[(rel.id, to_json(&ids(&targets, &t)))].into_iter().collect())
                    .map(|_| ()),
                EdgeOp::Link(s, t) => engine.link_rows(sources[s], rel.id, &ids(&targets, &t)).map(|_| ()),
                EdgeOp::Unlink(s, t) => engine.unlink_rows(sources[s], rel.id, &ids(&targets, &t)).map(|_| ()),
                EdgeOp::InverseReplace(s, t) => engine
                    .update_row(targets[s], &[(inverse, to_json(&ids(&sources, &t)))].into_iter().collect())
                    .map(|_| ()),
                EdgeOp::DeleteTarget(s) => {
                    let result = engine.delete_row(targets[s]);
                    if result.is_ok() {
                        targets[s] = engine.add_row(right, &RowValues::new()).unwrap();
                    }
                    result
                }
            };
        }

        let state = engine.store().read();
        for source in &sources {
            for target in state.targets(*source, rel.id) {
                prop_assert!(state.targets(target, inverse).contains(source));
            }
        }
        for target in &targets {
            for source in state.targets(*target, inverse) {
                prop_assert!(state.targets(source, rel.id).contains(target));
            }
        }
    }

    #[test]
    fn prop_count_all_counts_every_input(values in prop::collection::vec(
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            (-1e6f64..1e6).prop_map(Value::Number),
            "[a-z]{0,6}".prop_map(Value::Text),
        ],
        0..40,
    )) {
        let count = aggregate(&values, RollupFunction::CountAll, None).unwrap();
        prop_assert_eq!(count, Value::Number(values.len() as f64));

        let empty = aggregate(&values, RollupFunction::PercentEmpty, None).unwrap();
        let not_empty = aggregate(&values, RollupFunction::PercentNotEmpty, None).unwrap();
        if values.is_empty() {
            prop_assert_eq!(empty, Value::Number(0.0));
        } else {
            let total = empty.as_number().unwrap() + not_empty.as_number().unwrap();
            prop_assert!((total - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn prop_sum_and_avg_match_plain_arithmetic(numbers in prop::collection::vec(-1e6f64..1e6, 0..40)) {
        let values: Vec<Value> = numbers.iter().copied().map(Value::Number).collect();
        let target = Some(ValueType::Number);

        let sum = aggregate(&values, RollupFunction::Sum, target).unwrap().as_number().unwrap();
        let expected: f64 = numbers.iter().sum();
        prop_assert!((sum - expected).abs() < 1e-6);

        let avg = aggregate(&values, RollupFunction::Avg, target).unwrap().as_number().unwrap();
        if numbers.is_empty() {
            prop_assert_eq!(avg, 0.0);
        } else {
            prop_assert!((avg - expected / numbers.len() as f64).abs() < 1e-6);
        }

        let min = aggregate(&values, RollupFunction::Min, target).unwrap();
        match numbers.iter().copied().reduce(f64::min) {
            Some(m) => prop_assert_eq!(min, Value::Number(m)),
            None => prop_assert_eq!(min, Value::Null),
        }
    }

    #[test]
    fn prop_checked_and_unchecked_partition(flags in prop::collection::vec(any::<bool>(), 0..40)) {
        let values: Vec<Value> = flags.iter().copied().map(Value::Boolean).collect();
        let target = Some(ValueType::Boolean);
        let checked = aggregate(&values, RollupFunction::CountChecked, target).unwrap().as_number().unwrap();
        let unchecked = aggregate(&values, RollupFunction::CountUnchecked, target).unwrap().as_number().unwrap();
        prop_assert_eq!(checked + unchecked, flags.len() as f64);
        prop_assert_eq!(checked, flags.iter().filter(|f| **f).count() as f64);
    }
}
