//! Decomposition of a trace into a map phase and a reduce phase.
//!
//! The map trace runs on every peer against its share of the input; the
//! reduce trace runs on the coordinator over the (optionally partitioned)
//! union of the map outputs, with the map trace wrapped in a
//! [`Step::UnionMap`] leaf.
//!
//! Aggregate split table:
//! - `COUNT` maps to itself and reduces with `SUM_COUNT`
//! - `SUM`/`SUM_INT`/`SUM_COUNT` reduce with themselves
//! - `AVG` maps to a `SUM`/`COUNT` pair recombined by a projection above
//!   the reducer
//! - `MIN`/`MAX`/`EARLIEST`/`LATEST`/`BIT_*`/`BOOL_*` are idempotent
//! - `APPROX_COUNT_DISTINCT` maps to its `PARTIAL` form and reduces with
//!   `MERGE`; the datashape aggregate has an analogous merge variant
//! - windowed aggregates never split; `COUNT(DISTINCT ...)` cannot split
//!
//! `ORDER BY`, `LIMIT`, and the output steps always attach to the
//! reducer; `DISTINCT` additionally runs on the map side to shrink the
//! exchanged data.
//!
//! When the leaf carries no equality-partition keys the map trace and the
//! reducer would be the same trace, so it is left whole (the `NoSplit`
//! shape) instead of being wrapped in a union.

use opal_common::{Error, Result};
use opal_expr::{Aggregate, AggregateOp, ArithOp, Binding, Expr, NoHint};

use crate::trace::{
    AggBinding, AggregateStep, BindStep, DistinctStep, Step, Trace, UnionMapStep,
};

/// Split `trace` for distributed execution, returning the reduce trace
/// with the map trace embedded in its [`Step::UnionMap`] leaf.
///
/// A trace without a table scan (constant queries) or without a
/// partitioning key on its leaf is returned unchanged: in the first case
/// there is nothing to distribute, and in the second the map trace and
/// the reducer would be the same trace.
pub fn split(trace: Trace) -> Result<Trace> {
    let Trace {
        top,
        replacements,
        final_bindings,
    } = trace;

    // deconstruct the chain, leaf first
    let mut steps: Vec<Step> = Vec::new();
    let mut cur = top;
    loop {
        match cur.take_parent() {
            Some(parent) => {
                steps.push(cur);
                cur = *parent;
            }
            None => {
                steps.push(cur);
                break;
            }
        }
    }
    steps.reverse();

    let leaf = match &steps[0] {
        Step::IterTable(it) => it.clone(),
        // sentinel leaves have no input to distribute over
        _ => {
            let top = relink(steps);
            return Ok(Trace {
                top,
                replacements,
                final_bindings,
            });
        }
    };
    if leaf.on_equal.is_empty() {
        // no partitioning key: leave the trace whole
        let top = relink(steps);
        return Ok(Trace {
            top,
            replacements,
            final_bindings,
        });
    }

    let (map_steps, reduce_builder) = partition_steps(steps)?;

    let map_trace = Trace::new(relink(map_steps), replacements, &NoHint);

    let partition_by = leaf.on_equal.clone();
    let union = Step::UnionMap(UnionMapStep {
        inner: leaf,
        child: Box::new(map_trace),
        partition_by,
    });

    let top = reduce_builder.finish(union);
    Ok(Trace {
        top,
        replacements: Vec::new(),
        final_bindings,
    })
}

/// The reduce-side chain under construction: steps stored leaf-side
/// first, waiting for the union leaf to link under them.
struct ReduceChain {
    steps: Vec<Step>,
}

impl ReduceChain {
    fn finish(self, leaf: Step) -> Step {
        let mut cur = leaf;
        for s in self.steps {
            cur = attach(s, cur);
        }
        cur
    }
}

/// Attach `below` under the deepest slot of `s`. Reduce-side entries may
/// be small chains (a merge aggregate with its recombining projection)
/// terminated by a sentinel.
fn attach(mut s: Step, below: Step) -> Step {
    {
        let mut slot = &mut s;
        while matches!(slot.parent(), Some(p) if !matches!(p, Step::DummyOutput)) {
            slot = slot.parent_mut().expect("slot has a parent");
        }
        slot.set_parent(Box::new(below));
    }
    s
}

/// Relink a leaf-first step list into an owned chain, returning the top.
fn relink(steps: Vec<Step>) -> Step {
    let mut iter = steps.into_iter();
    let mut cur = iter.next().expect("relink of empty chain");
    for mut s in iter {
        s.set_parent(Box::new(cur));
        cur = s;
    }
    cur
}

/// Decide which steps run on the map side and build the reduce chain.
fn partition_steps(steps: Vec<Step>) -> Result<(Vec<Step>, ReduceChain)> {
    let mut map_steps: Vec<Step> = Vec::new();
    let mut reduce = ReduceChain { steps: Vec::new() };
    let mut reducing = false;

    for step in steps {
        if reducing {
            reduce.steps.push(step);
            continue;
        }
        match step {
            Step::Aggregate(agg) if agg.windows.is_empty() => {
                let (partial, merge) = split_aggregate(agg)?;
                map_steps.push(Step::Aggregate(partial));
                reduce.steps.push(merge);
                reducing = true;
            }
            // windowed aggregation needs the whole group in one place
            s @ Step::Aggregate(_) => {
                reduce.steps.push(s);
                reducing = true;
            }
            Step::Distinct(d) => {
                // deduplicate on both sides: peers shrink the exchange,
                // the reducer restores global uniqueness
                map_steps.push(Step::Distinct(DistinctStep {
                    columns: d.columns.clone(),
                    parent: Box::new(Step::DummyOutput),
                }));
                reduce.steps.push(Step::Distinct(d));
                reducing = true;
            }
            s @ (Step::Order(_) | Step::Limit(_) | Step::OutputPart(_) | Step::OutputIndex(_)) => {
                reduce.steps.push(s);
                reducing = true;
            }
            s => map_steps.push(s),
        }
    }
    Ok((map_steps, reduce))
}

/// Split one aggregate step into its per-peer partial form and the
/// coordinator merge form (plus a recombining projection when AVG is
/// present).
fn split_aggregate(agg: AggregateStep) -> Result<(AggregateStep, Step)> {
    let AggregateStep {
        agg: bindings,
        windows,
        group_by,
        parent,
    } = agg;
    debug_assert!(windows.is_empty());

    let mut partial: Vec<AggBinding> = Vec::new();
    let mut merge: Vec<AggBinding> = Vec::new();
    // present only when an AVG forces a recombining projection
    let mut post: Vec<Binding> = Vec::new();
    let mut needs_post = false;

    for (i, b) in bindings.into_iter().enumerate() {
        let AggBinding { agg, result } = b;
        match agg.op {
            AggregateOp::Count => {
                partial.push(named(agg, &result));
                merge.push(named(merge_of(AggregateOp::SumCount, &result), &result));
                post.push(Binding::bind(Expr::ident(result.clone()), result));
            }
            AggregateOp::Sum
            | AggregateOp::SumInt
            | AggregateOp::SumCount
            | AggregateOp::Min
            | AggregateOp::Max
            | AggregateOp::Earliest
            | AggregateOp::Latest
            | AggregateOp::BitAnd
            | AggregateOp::BitOr
            | AggregateOp::BitXor
            | AggregateOp::BoolAnd
            | AggregateOp::BoolOr => {
                let op = agg.op;
                partial.push(named(agg, &result));
                merge.push(named(merge_of(op, &result), &result));
                post.push(Binding::bind(Expr::ident(result.clone()), result));
            }
            AggregateOp::Avg => {
                let sum_name = format!("$_avg_sum{i}");
                let count_name = format!("$_avg_count{i}");
                let inner = agg.inner.clone().ok_or_else(|| {
                    Error::InvalidArgument("AVG without an argument".to_string())
                })?;
                partial.push(named(
                    Aggregate {
                        op: AggregateOp::Sum,
                        precision: 0,
                        inner: Some(inner.clone()),
                        over: None,
                        filter: agg.filter.clone(),
                    },
                    &sum_name,
                ));
                partial.push(named(
                    Aggregate {
                        op: AggregateOp::Count,
                        precision: 0,
                        inner: Some(inner),
                        over: None,
                        filter: agg.filter,
                    },
                    &count_name,
                ));
                merge.push(named(merge_of(AggregateOp::Sum, &sum_name), &sum_name));
                merge.push(named(
                    merge_of(AggregateOp::SumCount, &count_name),
                    &count_name,
                ));
                post.push(Binding::bind(
                    Expr::arith(
                        ArithOp::Div,
                        Expr::ident(sum_name),
                        Expr::ident(count_name),
                    ),
                    result,
                ));
                needs_post = true;
            }
            AggregateOp::ApproxCountDistinct => {
                let precision = agg.precision;
                partial.push(named(
                    Aggregate {
                        op: AggregateOp::ApproxCountDistinctPartial,
                        ..agg
                    },
                    &result,
                ));
                merge.push(named(
                    Aggregate {
                        op: AggregateOp::ApproxCountDistinctMerge,
                        precision,
                        inner: Some(Expr::ident(result.clone())),
                        over: None,
                        filter: None,
                    },
                    &result,
                ));
                post.push(Binding::bind(Expr::ident(result.clone()), result));
            }
            AggregateOp::Datashape => {
                partial.push(named(agg, &result));
                merge.push(named(
                    merge_of(AggregateOp::DatashapeMerge, &result),
                    &result,
                ));
                post.push(Binding::bind(Expr::ident(result.clone()), result));
            }
            AggregateOp::CountDistinct => {
                return Err(Error::NotSupported(
                    "COUNT(DISTINCT ...) in a distributed query".to_string(),
                ));
            }
            other => {
                return Err(Error::NotSupported(format!(
                    "{} in a distributed query",
                    other.name()
                )));
            }
        }
    }

    // group keys pass through the reducer under their own names
    let mut merge_group: Vec<Binding> = Vec::new();
    for (i, g) in group_by.iter().enumerate() {
        let name = g
            .result()
            .map(str::to_string)
            .unwrap_or_else(|| format!("$_group{i}"));
        merge_group.push(Binding::bind(Expr::ident(name.clone()), name.clone()));
        post.push(Binding::bind(Expr::ident(name.clone()), name));
    }

    let partial = AggregateStep {
        agg: partial,
        windows: Vec::new(),
        group_by,
        parent,
    };
    let merge_step = AggregateStep {
        agg: merge,
        windows: Vec::new(),
        group_by: merge_group,
        parent: Box::new(Step::DummyOutput),
    };
    let out = if needs_post {
        Step::Bind(BindStep {
            bindings: post,
            parent: Box::new(Step::Aggregate(merge_step)),
        })
    } else {
        Step::Aggregate(merge_step)
    };
    Ok((partial, out))
}

fn named(agg: Aggregate, result: &str) -> AggBinding {
    AggBinding {
        agg,
        result: result.to_string(),
    }
}

/// The reduce-phase aggregate consuming the map-phase column `source`.
fn merge_of(op: AggregateOp, source: &str) -> Aggregate {
    Aggregate {
        op,
        precision: 0,
        inner: Some(Expr::ident(source)),
        over: None,
        filter: None,
    }
}

/// Keep a trace on a single node: no map phase is produced and the trace
/// lowers as-is.
pub fn no_split(trace: Trace) -> Trace {
    trace
}

#[cfg(test)]
mod tests {
    use super::split;
    use crate::build::build;
    use crate::env::{Env, TableHandle};
    use crate::op::Hints;
    use crate::trace::{Step, StepKind};
    use opal_common::Result;
    use opal_expr::{AggregateOp, Binding, Expr, From, Query, Select};
    use opal_wire::Datum;

    #[derive(Debug)]
    struct NullHandle;

    impl TableHandle for NullHandle {
        fn encode(&self) -> Datum {
            Datum::Null
        }
    }

    struct TestEnv;

    impl Env for TestEnv {
        fn stat(&self, _: &Expr, _: &Hints) -> Result<Box<dyn TableHandle>> {
            Ok(Box::new(NullHandle))
        }
    }

    fn trace_for(sel: Select) -> crate::trace::Trace {
        build(&Query::new(sel), &TestEnv).unwrap()
    }

    /// Mark the leaf as equality-partitioned on `key`, the way the
    /// partition-detection pass does for indexed tables.
    fn partition_on(t: &mut crate::trace::Trace, key: &str) {
        let mut cur = &mut t.top;
        loop {
            if let Step::IterTable(it) = cur {
                it.on_equal = vec![Expr::ident(key)];
                return;
            }
            match cur.parent_mut() {
                Some(p) => cur = p,
                None => return,
            }
        }
    }

    fn agg_names(s: &Step) -> Vec<(AggregateOp, String)> {
        match s {
            Step::Aggregate(a) => a
                .agg
                .iter()
                .map(|b| (b.agg.op, b.result.clone()))
                .collect(),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn unpartitioned_traces_stay_whole() {
        // no partitioning key on the leaf: the map trace and the reducer
        // would be the same trace, so the chain is left untouched
        let t = trace_for(Select {
            columns: vec![Binding::auto(Expr::count_star())],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        let before: Vec<StepKind> = t.steps().map(Step::kind).collect();
        let out = split(t).unwrap();
        let after: Vec<StepKind> = out.steps().map(Step::kind).collect();
        assert_eq!(after, before);
        assert!(!after.contains(&StepKind::UnionMap));
        assert_eq!(
            agg_names(&out.top),
            vec![(AggregateOp::Count, "count".to_string())]
        );
    }

    #[test]
    fn count_splits_into_sum_count() {
        let mut t = trace_for(Select {
            columns: vec![Binding::auto(Expr::count_star())],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        partition_on(&mut t, "k");
        let reduced = split(t).unwrap();
        // reducer: SUM_COUNT over the union-map leaf
        assert_eq!(
            agg_names(&reduced.top),
            vec![(AggregateOp::SumCount, "count".to_string())]
        );
        let Step::Aggregate(a) = &reduced.top else {
            unreachable!()
        };
        let Step::UnionMap(u) = a.parent.as_ref() else {
            panic!("expected union map under reducer, got {:?}", a.parent);
        };
        // map side: the original COUNT(*)
        assert_eq!(
            agg_names(&u.child.top),
            vec![(AggregateOp::Count, "count".to_string())]
        );
    }

    #[test]
    fn avg_splits_into_sum_and_count() {
        let mut t = trace_for(Select {
            columns: vec![Binding::bind(
                Expr::aggregate(AggregateOp::Avg, Some(Expr::ident("v"))),
                "mean",
            )],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        partition_on(&mut t, "k");
        let reduced = split(t).unwrap();
        // a projection recombines sum/count into the mean
        let Step::Bind(bind) = &reduced.top else {
            panic!("expected recombining projection, got {:?}", reduced.top);
        };
        assert_eq!(bind.bindings.len(), 1);
        assert_eq!(bind.bindings[0].result(), Some("mean"));
        let ops: Vec<AggregateOp> = agg_names(&bind.parent)
            .into_iter()
            .map(|(op, _)| op)
            .collect();
        assert_eq!(ops, vec![AggregateOp::Sum, AggregateOp::SumCount]);
    }

    #[test]
    fn order_and_limit_stay_on_the_reducer() {
        let mut t = trace_for(Select {
            columns: vec![Binding::auto(Expr::ident("x"))],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            order_by: vec![opal_expr::Order {
                column: Expr::ident("x"),
                desc: true,
                nulls_last: true,
            }],
            limit: Some(2),
            offset: Some(1),
            ..Select::default()
        });
        partition_on(&mut t, "x");
        let reduced = split(t).unwrap();
        let kinds: Vec<StepKind> = {
            let mut v = Vec::new();
            let mut cur = Some(&reduced.top);
            while let Some(s) = cur {
                v.push(s.kind());
                cur = s.parent();
            }
            v
        };
        // sort, limit, and the projection above them all reduce; the map
        // side carries only the scan
        assert_eq!(
            kinds,
            vec![
                StepKind::Bind,
                StepKind::Limit,
                StepKind::Order,
                StepKind::UnionMap
            ]
        );
    }

    #[test]
    fn count_distinct_does_not_split() {
        let mut t = trace_for(Select {
            columns: vec![Binding::auto(Expr::aggregate(
                AggregateOp::CountDistinct,
                Some(Expr::ident("v")),
            ))],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        partition_on(&mut t, "k");
        let err = split(t).unwrap_err();
        assert!(err.to_string().contains("COUNT(DISTINCT"), "{err}");
    }

    #[test]
    fn approx_count_distinct_uses_partial_and_merge() {
        let mut t = trace_for(Select {
            columns: vec![Binding::bind(
                Expr::aggregate(AggregateOp::ApproxCountDistinct, Some(Expr::ident("v"))),
                "n",
            )],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        partition_on(&mut t, "k");
        let reduced = split(t).unwrap();
        assert_eq!(
            agg_names(&reduced.top),
            vec![(AggregateOp::ApproxCountDistinctMerge, "n".to_string())]
        );
        let Step::Aggregate(a) = &reduced.top else {
            unreachable!()
        };
        let Step::UnionMap(u) = a.parent.as_ref() else {
            panic!("expected union map");
        };
        assert_eq!(
            agg_names(&u.child.top),
            vec![(AggregateOp::ApproxCountDistinctPartial, "n".to_string())]
        );
    }
}
