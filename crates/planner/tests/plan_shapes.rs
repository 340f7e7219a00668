//! End-to-end plan shape checks: AST in, physical op tree out.

mod support;

use chrono::{TimeZone, Utc};

use opal_expr::{
    AggregateOp, Binding, CmpOp, Expr, ExplainFormat, From, Order, Query, Select, TypeSet,
};
use opal_planner::{plan, plan_split, Op};
use support::{FieldTypes, FixedRange, Partitions, TestEnv};

fn scan(table: &str) -> Option<From> {
    Some(From::Table(Binding::auto(Expr::ident(table))))
}

#[test]
fn count_star_lowers_to_the_fast_path() {
    // SELECT COUNT(*) FROM input
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::count_star())],
        from: scan("input"),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();

    assert_eq!(tree.inputs.len(), 1);
    assert_eq!(tree.root.input, 0);
    let Op::CountStar(cs) = &tree.root.op else {
        panic!("expected CountStar root, got {:?}", tree.root.op);
    };
    assert_eq!(cs.result, "count");
    assert!(matches!(*cs.from, Op::Leaf(_)));
    assert_eq!(tree.root.output.len(), 1);
    assert_eq!(tree.root.output[0].name, "count");
}

#[test]
fn filters_become_scan_hints() {
    // SELECT x FROM input WHERE x > 5 AND y = 3
    let cond = Expr::and(
        Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
        Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3)),
    );
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        where_clause: Some(cond.clone()),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();

    assert_eq!(tree.inputs.len(), 1);
    let hints = &tree.inputs[0].hints;
    assert_eq!(hints.filter, Some(cond));
    assert_eq!(hints.fields, vec!["x".to_string(), "y".to_string()]);
    assert!(!hints.all_fields);

    // the filter is fully absorbed by the scan; only the projection runs
    let Op::Project(p) = &tree.root.op else {
        panic!("expected Project root, got {:?}", tree.root.op);
    };
    assert!(matches!(*p.from, Op::Leaf(_)));
    assert_eq!(p.using.len(), 1);
    assert_eq!(p.using[0].result(), Some("x"));
}

#[test]
fn order_by_fuses_limit_and_offset() {
    // SELECT x FROM input ORDER BY x DESC NULLS LAST LIMIT 2 OFFSET 1
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        order_by: vec![Order {
            column: Expr::ident("x"),
            desc: true,
            nulls_last: true,
        }],
        limit: Some(2),
        offset: Some(1),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();

    let Op::Project(p) = &tree.root.op else {
        panic!("expected Project root, got {:?}", tree.root.op);
    };
    let Op::OrderBy(ob) = p.from.as_ref() else {
        panic!("expected OrderBy under projection, got {:?}", p.from);
    };
    assert_eq!(ob.limit, Some(2));
    assert_eq!(ob.offset, 1);
    assert_eq!(ob.columns.len(), 1);
    assert!(ob.columns[0].desc);
    assert!(ob.columns[0].nulls_last);
    assert_eq!(ob.columns[0].column, Expr::ident("x"));
    assert!(matches!(*ob.from, Op::Leaf(_)));
}

#[test]
fn group_by_lowers_to_hash_aggregate() {
    // SELECT category, BOOL_AND(a) AS a_and FROM input GROUP BY category
    let q = Query::new(Select {
        columns: vec![
            Binding::auto(Expr::ident("category")),
            Binding::bind(
                Expr::aggregate(AggregateOp::BoolAnd, Some(Expr::ident("a"))),
                "a_and",
            ),
        ],
        from: scan("input"),
        group_by: vec![Binding::auto(Expr::ident("category"))],
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();

    let Op::HashAggregate(ha) = &tree.root.op else {
        panic!("expected HashAggregate root, got {:?}", tree.root.op);
    };
    assert_eq!(ha.agg.len(), 1);
    assert_eq!(ha.agg[0].agg.op, AggregateOp::BoolAnd);
    assert_eq!(ha.agg[0].agg.inner, Some(Expr::ident("a")));
    assert_eq!(ha.agg[0].result, "a_and");
    assert_eq!(ha.by.len(), 1);
    assert_eq!(ha.by[0].result(), Some("category"));
    assert!(ha.windows.is_empty());
    assert!(matches!(*ha.from, Op::Leaf(_)));
}

#[test]
fn order_by_aggregate_alias_becomes_hash_order() {
    let q = Query::new(Select {
        columns: vec![
            Binding::auto(Expr::ident("k")),
            Binding::bind(Expr::count_star(), "n"),
        ],
        from: scan("input"),
        group_by: vec![Binding::auto(Expr::ident("k"))],
        order_by: vec![Order {
            column: Expr::ident("n"),
            desc: true,
            nulls_last: false,
        }],
        limit: Some(10),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();

    let Op::HashAggregate(ha) = &tree.root.op else {
        panic!("expected HashAggregate root, got {:?}", tree.root.op);
    };
    assert_eq!(ha.order_by.len(), 1);
    // aggregate outputs precede group keys in the output layout
    assert_eq!(ha.order_by[0].column, 0);
    assert!(ha.order_by[0].desc);
    assert_eq!(ha.limit, Some(10));
}

#[test]
fn duplicate_order_expressions_are_rejected() {
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        order_by: vec![
            Order {
                column: Expr::ident("x"),
                desc: false,
                nulls_last: false,
            },
            Order {
                column: Expr::ident("x"),
                desc: true,
                nulls_last: true,
            },
        ],
        ..Select::default()
    });
    let err = plan(&q, &TestEnv::default()).unwrap_err();
    assert!(
        err.to_string().contains("duplicate order by expression"),
        "{err}"
    );
}

#[test]
fn select_into_requires_an_uploading_environment() {
    let mut q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        ..Select::default()
    });
    q.into = Some(Expr::dot(Expr::ident("db"), "dst"));
    let err = plan(&q, &TestEnv::default()).unwrap_err();
    assert!(err.to_string().contains("missing feature"), "{err}");
}

#[test]
fn split_plan_wraps_the_map_phase_in_a_union() {
    // GROUP BY over a partitioned column: per-peer COUNT, coordinator
    // SUM_COUNT, with the map phase exchanged on the partition key
    let env = TestEnv {
        schema: None,
        index: Some(Box::new(Partitions(vec!["k"]))),
    };
    let q = Query::new(Select {
        columns: vec![
            Binding::auto(Expr::ident("k")),
            Binding::bind(Expr::count_star(), "n"),
        ],
        from: scan("input"),
        group_by: vec![Binding::auto(Expr::ident("k"))],
        ..Select::default()
    });
    let tree = plan_split(&q, &env).unwrap();

    let Op::HashAggregate(ha) = &tree.root.op else {
        panic!("expected reducer aggregate, got {:?}", tree.root.op);
    };
    assert_eq!(ha.agg.len(), 1);
    assert_eq!(ha.agg[0].agg.op, AggregateOp::SumCount);
    assert_eq!(ha.agg[0].result, "n");
    assert_eq!(ha.by.len(), 1);
    assert_eq!(ha.by[0].result(), Some("k"));
    let Op::UnionPartition(up) = ha.from.as_ref() else {
        panic!("expected partitioned union under reducer, got {:?}", ha.from);
    };
    assert_eq!(up.by, vec![Expr::ident("k")]);
    let Op::HashAggregate(partial) = up.from.as_ref() else {
        panic!("expected map-side aggregate, got {:?}", up.from);
    };
    assert_eq!(partial.agg[0].agg.op, AggregateOp::Count);
    let Op::Leaf(leaf) = partial.from.as_ref() else {
        panic!("expected leaf under map aggregate, got {:?}", partial.from);
    };
    assert_eq!(leaf.on_equal, vec![Expr::ident("k")]);
    assert_eq!(leaf.equal_expr.len(), 1);
    // both phases share the single deduplicated input
    assert_eq!(tree.inputs.len(), 1);
}

#[test]
fn unpartitioned_split_plan_matches_single_node() {
    // without a partitioning key the map trace and the reducer would be
    // the same trace, so the distributed plan is the single-node plan
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::count_star())],
        from: scan("input"),
        ..Select::default()
    });
    let single = plan(&q, &TestEnv::default()).unwrap();
    let tree = plan_split(&q, &TestEnv::default()).unwrap();
    assert_eq!(tree, single);
    let Op::CountStar(cs) = &tree.root.op else {
        panic!("expected CountStar root, got {:?}", tree.root.op);
    };
    assert!(matches!(*cs.from, Op::Leaf(_)));
}

#[test]
fn explain_wraps_the_plan() {
    let mut q = Query::new(Select {
        columns: vec![Binding::auto(Expr::count_star())],
        from: scan("input"),
        ..Select::default()
    });
    q.explain = ExplainFormat::Text;
    let tree = plan(&q, &TestEnv::default()).unwrap();
    let Op::Explain(ex) = &tree.root.op else {
        panic!("expected Explain root, got {:?}", tree.root.op);
    };
    assert_eq!(ex.format, ExplainFormat::Text);
    assert!(ex.query.contains("COUNT(*)"));
    assert!(matches!(ex.tree.root.op, Op::CountStar(_)));
    let text = opal_planner::tree_text(&ex.tree);
    assert_eq!(text, "ITERATE input\nCOUNT(*) AS count\n");
}

#[test]
fn schema_hints_type_the_result_set() {
    let env = TestEnv {
        schema: Some(Box::new(FieldTypes(vec![
            ("x", TypeSet::INTEGER),
            ("y", TypeSet::STRING),
        ]))),
        index: None,
    };
    let q = Query::new(Select {
        columns: vec![
            Binding::auto(Expr::ident("x")),
            Binding::auto(Expr::ident("y")),
        ],
        from: scan("input"),
        ..Select::default()
    });
    let tree = plan(&q, &env).unwrap();
    assert_eq!(tree.root.output.len(), 2);
    assert_eq!(tree.root.output[0].ty, TypeSet::INTEGER);
    assert_eq!(tree.root.output[1].ty, TypeSet::STRING);
}

#[test]
fn index_time_range_drops_proven_filters() {
    // every row of the table is newer than the predicate's bound, so the
    // timestamp conjunct is dropped and only x > 5 remains as a hint
    let env = TestEnv {
        schema: None,
        index: Some(Box::new(FixedRange {
            path: vec!["when".to_string()],
            min: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            max: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        })),
    };
    let bound = Expr::Timestamp(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        where_clause: Some(Expr::and(
            Expr::cmp(CmpOp::Greater, Expr::ident("when"), bound),
            Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
        )),
        ..Select::default()
    });
    let tree = plan(&q, &env).unwrap();
    assert_eq!(tree.inputs.len(), 1);
    assert_eq!(
        tree.inputs[0].hints.filter,
        Some(Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)))
    );
}

#[test]
fn constant_subqueries_inline_before_lowering() {
    // WHERE x > (SELECT 5 AS v) folds the subquery away entirely
    let sub = Select {
        columns: vec![Binding::bind(Expr::Integer(5), "v")],
        ..Select::default()
    };
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        where_clause: Some(Expr::cmp(
            CmpOp::Greater,
            Expr::ident("x"),
            Expr::Select(Box::new(sub)),
        )),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();
    assert_eq!(tree.inputs.len(), 1);
    assert!(
        !matches!(tree.root.op, Op::Substitute(_)),
        "constant replacement should not survive to lowering"
    );
    assert_eq!(
        tree.inputs[0].hints.filter,
        Some(Expr::cmp(
            CmpOp::Greater,
            Expr::ident("x"),
            Expr::Integer(5)
        ))
    );
}
