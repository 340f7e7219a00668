//! Wire round-trips of complete plans.

mod support;

use opal_common::PlannerConfig;
use opal_expr::{AggregateOp, Binding, CmpOp, Expr, From, Order, Query, Select};
use opal_planner::{codec, plan, plan_split, Op};
use support::{Partitions, TestDecoder, TestEnv};

fn scan(table: &str) -> Option<From> {
    Some(From::Table(Binding::auto(Expr::ident(table))))
}

fn round_trip(q: &Query) -> (opal_planner::Tree, opal_planner::Tree) {
    let tree = plan(q, &TestEnv::default()).unwrap();
    let bytes = codec::encode(&tree, &PlannerConfig::default()).unwrap();
    let back = codec::decode(&bytes, &TestDecoder).unwrap();
    (tree, back)
}

#[test]
fn aggregate_plan_round_trips_bit_exact() {
    // the E4 shape: grouped aggregation
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
    let (tree, back) = round_trip(&q);
    assert_eq!(back, tree);

    // re-encoding the decoded tree yields identical bytes
    let bytes = codec::encode(&tree, &PlannerConfig::default()).unwrap();
    let again = codec::encode(&back, &PlannerConfig::default()).unwrap();
    assert_eq!(bytes, again);
}

#[test]
fn filtered_ordered_plan_round_trips() {
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        where_clause: Some(Expr::and(
            Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
            Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3)),
        )),
        order_by: vec![Order {
            column: Expr::ident("x"),
            desc: true,
            nulls_last: true,
        }],
        limit: Some(2),
        offset: Some(1),
        ..Select::default()
    });
    let (tree, back) = round_trip(&q);
    assert_eq!(back, tree);
}

#[test]
fn split_plan_with_replacements_round_trips() {
    // a partitioned GROUP BY with a hoisted subquery: the wire form
    // carries a UnionPartition and a Substitute node
    let env = TestEnv {
        schema: None,
        index: Some(Box::new(Partitions(vec!["k"]))),
    };
    let sub = Select {
        columns: vec![Binding::bind(
            Expr::aggregate(AggregateOp::Max, Some(Expr::ident("a"))),
            "m",
        )],
        from: scan("input"),
        ..Select::default()
    };
    let q = Query::new(Select {
        columns: vec![
            Binding::auto(Expr::ident("k")),
            Binding::bind(Expr::count_star(), "n"),
        ],
        from: scan("input"),
        where_clause: Some(Expr::cmp(
            CmpOp::Less,
            Expr::ident("a"),
            Expr::Select(Box::new(sub)),
        )),
        group_by: vec![Binding::auto(Expr::ident("k"))],
        ..Select::default()
    });
    let tree = plan_split(&q, &env).unwrap();
    let Op::HashAggregate(ha) = &tree.root.op else {
        panic!("expected reducer aggregate, got {:?}", tree.root.op);
    };
    assert!(matches!(ha.from.as_ref(), Op::UnionPartition(_)));

    let bytes = codec::encode(&tree, &PlannerConfig::default()).unwrap();
    let back = codec::decode(&bytes, &TestDecoder).unwrap();
    assert_eq!(back, tree);
}

#[test]
fn oversized_input_tables_compress_on_the_wire() {
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("x"))],
        from: scan("input"),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();

    // force the compressed path with a tiny threshold
    let cfg = PlannerConfig {
        compress_threshold_bytes: 4,
        ..PlannerConfig::default()
    };
    let bytes = codec::encode(&tree, &cfg).unwrap();
    let back = codec::decode(&bytes, &TestDecoder).unwrap();
    assert_eq!(back, tree);

    let plain = codec::encode(&tree, &PlannerConfig::default()).unwrap();
    assert_ne!(bytes, plain, "compressed framing must differ");
}

#[test]
fn corrupt_plans_are_rejected() {
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::count_star())],
        from: scan("input"),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();
    let bytes = codec::encode(&tree, &PlannerConfig::default()).unwrap();

    // truncation at any point is an error, never a panic
    for cut in [1usize, bytes.len() / 2, bytes.len() - 1] {
        assert!(codec::decode(&bytes[..cut], &TestDecoder).is_err());
    }
    // trailing garbage is rejected too
    let mut padded = bytes.clone();
    padded.extend_from_slice(b"zz");
    assert!(codec::decode(&padded, &TestDecoder).is_err());
}

#[test]
fn explain_plans_round_trip() {
    let mut q = Query::new(Select {
        columns: vec![Binding::auto(Expr::count_star())],
        from: scan("input"),
        ..Select::default()
    });
    q.explain = opal_expr::ExplainFormat::List;
    let (tree, back) = round_trip(&q);
    assert_eq!(back, tree);
    let Op::Explain(ex) = &back.root.op else {
        panic!("expected explain root");
    };
    assert_eq!(ex.format, opal_expr::ExplainFormat::List);
}
