//! Input deduplication across leaves that scan the same table.

mod support;

use chrono::{TimeZone, Utc};

use opal_expr::{AggregateOp, Binding, CmpOp, Expr, From, Query, Select};
use opal_planner::{plan, Op};
use support::TestEnv;

fn scan(table: &str) -> Option<From> {
    Some(From::Table(Binding::auto(Expr::ident(table))))
}

fn gt(field: &str, v: i64) -> Expr {
    Expr::cmp(CmpOp::Greater, Expr::ident(field), Expr::Integer(v))
}

fn lt(field: &str, v: i64) -> Expr {
    Expr::cmp(CmpOp::Less, Expr::ident(field), Expr::Integer(v))
}

/// A query with a scalar subquery over the same table, so the plan holds
/// two scans of `input` with different filters.
fn two_scans(outer: Expr, inner: Expr) -> Query {
    let sub = Select {
        columns: vec![Binding::bind(
            Expr::aggregate(AggregateOp::Max, Some(Expr::ident("a"))),
            "m",
        )],
        from: scan("input"),
        where_clause: Some(inner),
        ..Select::default()
    };
    Query::new(Select {
        columns: vec![Binding::auto(Expr::ident("b"))],
        from: scan("input"),
        where_clause: Some(Expr::and(
            outer,
            Expr::cmp(
                CmpOp::Less,
                Expr::ident("b"),
                Expr::Select(Box::new(sub)),
            ),
        )),
        ..Select::default()
    })
}

/// Find the standalone filter sitting directly on a leaf, if any.
fn leaf_filter(op: &Op) -> Option<&Expr> {
    match op {
        Op::Filter(f) if matches!(*f.from, Op::Leaf(_)) => Some(&f.cond),
        Op::Substitute(s) => leaf_filter(&s.from),
        Op::Filter(f) => leaf_filter(&f.from),
        Op::Project(p) => leaf_filter(&p.from),
        Op::HashAggregate(h) => leaf_filter(&h.from),
        Op::SimpleAggregate(s) => leaf_filter(&s.from),
        Op::CountStar(c) => leaf_filter(&c.from),
        _ => None,
    }
}

#[test]
fn overlapping_filters_share_one_input() {
    // outer: a > 10 AND b < 5 (plus the subquery comparison)
    // inner: a > 10
    let q = two_scans(Expr::and(gt("a", 10), lt("b", 5)), gt("a", 10));
    let tree = plan(&q, &TestEnv::default()).unwrap();

    assert_eq!(tree.inputs.len(), 1, "scans must merge into one input");
    let hints = &tree.inputs[0].hints;
    // the shared hint keeps exactly the common conjunction
    assert_eq!(hints.filter, Some(gt("a", 10)));
    assert!(hints.fields.contains(&"a".to_string()));
    assert!(hints.fields.contains(&"b".to_string()));

    // the outer leaf re-applies only its residual
    let residual = leaf_filter(&tree.root.op).expect("outer leaf keeps a residual filter");
    let mut has_b = false;
    let mut has_a = false;
    residual.walk(&mut |n| {
        if *n == lt("b", 5) {
            has_b = true;
        }
        if *n == gt("a", 10) {
            has_a = true;
        }
        true
    });
    assert!(has_b, "residual must keep b < 5: {residual:?}");
    assert!(!has_a, "residual must not repeat the shared a > 10");
}

#[test]
fn timestamp_filters_block_the_merge() {
    let ts = Expr::cmp(
        CmpOp::Greater,
        Expr::ident("when"),
        Expr::Timestamp(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
    );
    // the timestamp comparison appears on only one side, and dropping it
    // would forfeit block-level pruning, so both inputs survive
    let q = two_scans(Expr::and(ts, lt("b", 5)), gt("a", 10));
    let tree = plan(&q, &TestEnv::default()).unwrap();
    assert_eq!(tree.inputs.len(), 2, "timestamp hints must not be dropped");
}

#[test]
fn identical_scans_dedup_without_widening() {
    let q = two_scans(gt("a", 10), gt("a", 10));
    let tree = plan(&q, &TestEnv::default()).unwrap();
    assert_eq!(tree.inputs.len(), 1);
    assert_eq!(tree.inputs[0].hints.filter, Some(gt("a", 10)));
}

#[test]
fn slot_assignment_is_first_seen_and_deterministic() {
    let q = two_scans(Expr::and(gt("a", 10), lt("b", 5)), gt("a", 10));
    let t1 = plan(&q, &TestEnv::default()).unwrap();
    let t2 = plan(&q, &TestEnv::default()).unwrap();
    assert_eq!(t1.inputs.len(), t2.inputs.len());
    assert_eq!(t1.root.input, t2.root.input);
    assert_eq!(t1, t2, "planning must be deterministic");
}

#[test]
fn wildcard_scan_absorbs_field_lists() {
    // SELECT * subquery plus a narrow field scan: merged input reads
    // whole rows
    let sub = Select {
        columns: vec![Binding::auto(Expr::count_star())],
        from: scan("input"),
        ..Select::default()
    };
    let q = Query::new(Select {
        columns: vec![Binding::auto(Expr::Star)],
        from: scan("input"),
        where_clause: Some(Expr::cmp(
            CmpOp::Greater,
            Expr::ident("a"),
            Expr::Select(Box::new(sub)),
        )),
        ..Select::default()
    });
    let tree = plan(&q, &TestEnv::default()).unwrap();
    assert_eq!(tree.inputs.len(), 1);
    assert!(tree.inputs[0].hints.all_fields);
    assert!(tree.inputs[0].hints.fields.is_empty());
}
