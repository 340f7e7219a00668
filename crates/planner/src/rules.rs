//! Fixed-point rewriting over traces.
//!
//! Contract (mirrors the execution model of the rewrite layer):
//! - one pass walks the chain top-down following parent links;
//! - at each step, every rule registered for the step's kind runs in
//!   registration order and the first non-`Intact` status wins;
//! - `Updated` and `Replaced` both restart rule application at the
//!   current position so cascades resolve immediately;
//! - the outer loop ends when a full pass changes nothing.
//!
//! Rules cannot fail: a rule that does not apply returns its input with
//! [`Status::Intact`]. The rule set is confluent by construction; the
//! engine relies on convergence and enforces only the pass watchdog.

use std::collections::HashMap;

use tracing::debug;

use opal_common::{CancelToken, Error, PlannerConfig, Result};
use opal_expr::{flat_path, simplify, AggregateOp, Binding, BuiltinOp, CmpOp, Expr, NoHint};

use crate::build::{conjoin, conjunctions};
use crate::env::{Env, Index};
use crate::trace::{
    AggregateStep, BindStep, DistinctStep, FilterStep, IterTable, LimitStep, Step, StepKind,
    Trace, UnpivotAtDistinctStep,
};

/// Outcome of one rule application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The step was not modified.
    Intact,
    /// The step was modified in place.
    Updated,
    /// The returned step replaces the current one in the chain.
    Replaced,
}

/// A rewrite rule. The rule owns the step (and therefore its whole
/// upstream chain) for the duration of the call and must return a step
/// that preserves query semantics.
pub type Rule = fn(Step) -> (Step, Status);

/// Rule table keyed on step kind.
///
/// The `fn(Step) -> (Step, Status)` signature is validated by the
/// compiler at registration, which is all the install-time checking the
/// engine needs.
pub struct FixedPoint {
    rules: HashMap<StepKind, Vec<Rule>>,
}

impl Default for FixedPoint {
    fn default() -> Self {
        Self::standard()
    }
}

impl FixedPoint {
    /// An engine with no rules.
    pub fn empty() -> FixedPoint {
        FixedPoint {
            rules: HashMap::new(),
        }
    }

    /// The standard rule set.
    pub fn standard() -> FixedPoint {
        let mut fp = FixedPoint::empty();
        fp.add(StepKind::Filter, fold_filter_condition);
        fp.add(StepKind::Filter, merge_filters);
        fp.add(StepKind::Filter, push_filter_into_leaf);
        fp.add(StepKind::Filter, push_filter_below_bind);
        fp.add(StepKind::Filter, push_filter_below_unnest);
        fp.add(StepKind::Filter, drop_step_above_no_output);
        fp.add(StepKind::Limit, zero_limit_is_no_output);
        fp.add(StepKind::Limit, merge_limits);
        fp.add(StepKind::Limit, drop_step_above_no_output);
        fp.add(StepKind::Bind, drop_step_above_no_output);
        fp.add(StepKind::Distinct, eliminate_distinct_over_group_keys);
        fp.add(StepKind::Distinct, merge_distinct);
        fp.add(StepKind::Distinct, fuse_distinct_unpivot);
        fp.add(StepKind::Distinct, drop_step_above_no_output);
        fp.add(StepKind::Order, drop_step_above_no_output);
        fp.add(StepKind::IterValue, drop_step_above_no_output);
        fp.add(StepKind::Unpivot, drop_step_above_no_output);
        fp.add(StepKind::Aggregate, recognize_count_star);
        fp.add(StepKind::Aggregate, grouped_aggregate_over_no_output);
        fp.add(StepKind::Aggregate, groups_without_aggregates_are_distinct);
        fp
    }

    /// Register `rule` for steps of `kind`. Rules run in registration
    /// order.
    pub fn add(&mut self, kind: StepKind, rule: Rule) -> &mut FixedPoint {
        self.rules.entry(kind).or_default().push(rule);
        self
    }

    fn apply_at(&self, slot: &mut Step) -> Status {
        let kind = slot.kind();
        let Some(rules) = self.rules.get(&kind) else {
            return Status::Intact;
        };
        let mut node = std::mem::take(slot);
        let mut out = Status::Intact;
        for rule in rules {
            let (n, status) = rule(node);
            node = n;
            if status != Status::Intact {
                out = status;
                break;
            }
        }
        *slot = node;
        out
    }

    fn run_pass(&self, trace: &mut Trace) -> bool {
        let mut changed = false;
        let mut cur: &mut Step = &mut trace.top;
        loop {
            // retry the same position until nothing fires, so cascades
            // (a replacement enabling another rule) resolve immediately
            while self.apply_at(cur) != Status::Intact {
                changed = true;
            }
            match cur.parent_mut() {
                Some(p) => cur = p,
                None => break,
            }
        }
        changed
    }

    /// Rewrite `trace` (and its replacements) to a fixed point.
    ///
    /// The cancellation token is checked between passes; exceeding the
    /// configured pass bound is reported as an error rather than looping.
    pub fn optimize(
        &self,
        trace: &mut Trace,
        cfg: &PlannerConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        for rep in &mut trace.replacements {
            self.optimize_chain(rep, cfg, cancel)?;
        }
        // inline before the main pass so constant replacements take part
        // in folding and pushdown
        inline_constant_replacements(trace);
        self.optimize_chain(trace, cfg, cancel)?;
        Ok(())
    }

    fn optimize_chain(
        &self,
        trace: &mut Trace,
        cfg: &PlannerConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut passes = 0usize;
        loop {
            cancel.check()?;
            if !self.run_pass(trace) {
                break;
            }
            passes += 1;
            if passes > cfg.max_rewrite_passes {
                return Err(Error::InvalidArgument(format!(
                    "rewrite did not converge after {passes} passes"
                )));
            }
        }
        debug!(passes, "rewrite converged");
        Ok(())
    }
}

// ---------------------------------
// filter rules
// ---------------------------------

fn fold_filter_condition(s: Step) -> (Step, Status) {
    let Step::Filter(f) = s else {
        return (s, Status::Intact);
    };
    let cond = simplify(f.cond.clone(), &NoHint);
    match cond {
        Expr::Bool(true) => (*f.parent, Status::Replaced),
        // a filter that can never pass eliminates its entire subchain
        Expr::Bool(false) | Expr::Missing | Expr::Null => (Step::NoOutput, Status::Replaced),
        cond if cond != f.cond => (
            Step::Filter(FilterStep {
                cond,
                parent: f.parent,
            }),
            Status::Updated,
        ),
        _ => (Step::Filter(f), Status::Intact),
    }
}

fn merge_filters(s: Step) -> (Step, Status) {
    let Step::Filter(f) = s else {
        return (s, Status::Intact);
    };
    match *f.parent {
        Step::Filter(inner) => (
            Step::Filter(FilterStep {
                cond: Expr::and(inner.cond, f.cond),
                parent: inner.parent,
            }),
            Status::Replaced,
        ),
        parent => (
            Step::Filter(FilterStep {
                cond: f.cond,
                parent: Box::new(parent),
            }),
            Status::Intact,
        ),
    }
}

fn push_filter_into_leaf(s: Step) -> (Step, Status) {
    let Step::Filter(f) = s else {
        return (s, Status::Intact);
    };
    match *f.parent {
        Step::IterTable(mut it) => {
            it.filter = Some(match it.filter.take() {
                Some(prev) => Expr::and(prev, f.cond),
                None => f.cond,
            });
            (Step::IterTable(it), Status::Replaced)
        }
        parent => (
            Step::Filter(FilterStep {
                cond: f.cond,
                parent: Box::new(parent),
            }),
            Status::Intact,
        ),
    }
}

/// Names produced by a binding list.
fn bound_names(bindings: &[Binding]) -> Vec<&str> {
    bindings.iter().filter_map(Binding::result).collect()
}

/// Substitute `Ident(name)` references with the bound expressions.
fn substitute(e: Expr, bindings: &[Binding]) -> Expr {
    e.rewrite_with(&mut |n| {
        if let Expr::Ident(name) = &n {
            for b in bindings {
                if b.result() == Some(name.as_str()) {
                    return b.expr.clone();
                }
            }
        }
        n
    })
}

/// Returns whether every identifier in `e` appears in `names`.
fn refs_only(e: &Expr, names: &[&str]) -> bool {
    let mut ok = true;
    e.walk(&mut |n| {
        if let Expr::Ident(name) = n {
            if !names.contains(&name.as_str()) {
                ok = false;
            }
        }
        ok
    });
    ok
}

/// Returns whether `e` references the identifier `name`.
fn refs_name(e: &Expr, name: &str) -> bool {
    let mut found = false;
    e.walk(&mut |n| {
        if let Expr::Ident(i) = n {
            if i == name {
                found = true;
            }
        }
        !found
    });
    found
}

fn push_filter_below_bind(s: Step) -> (Step, Status) {
    let Step::Filter(f) = s else {
        return (s, Status::Intact);
    };
    match *f.parent {
        Step::Bind(bind) => {
            let names = bound_names(&bind.bindings);
            if !refs_only(&f.cond, &names) {
                return (
                    Step::Filter(FilterStep {
                        cond: f.cond,
                        parent: Box::new(Step::Bind(bind)),
                    }),
                    Status::Intact,
                );
            }
            let pushed = substitute(f.cond, &bind.bindings);
            (
                Step::Bind(BindStep {
                    bindings: bind.bindings,
                    parent: Box::new(Step::Filter(FilterStep {
                        cond: pushed,
                        parent: bind.parent,
                    })),
                }),
                Status::Replaced,
            )
        }
        parent => (
            Step::Filter(FilterStep {
                cond: f.cond,
                parent: Box::new(parent),
            }),
            Status::Intact,
        ),
    }
}

fn push_filter_below_unnest(s: Step) -> (Step, Status) {
    let Step::Filter(f) = s else {
        return (s, Status::Intact);
    };
    match *f.parent {
        Step::IterValue(iv) => {
            if refs_name(&f.cond, &iv.result) {
                return (
                    Step::Filter(FilterStep {
                        cond: f.cond,
                        parent: Box::new(Step::IterValue(iv)),
                    }),
                    Status::Intact,
                );
            }
            (
                Step::IterValue(crate::trace::IterValue {
                    value: iv.value,
                    result: iv.result,
                    parent: Box::new(Step::Filter(FilterStep {
                        cond: f.cond,
                        parent: iv.parent,
                    })),
                }),
                Status::Replaced,
            )
        }
        parent => (
            Step::Filter(FilterStep {
                cond: f.cond,
                parent: Box::new(parent),
            }),
            Status::Intact,
        ),
    }
}

/// Steps that merely transform rows produce nothing over an empty input.
fn drop_step_above_no_output(s: Step) -> (Step, Status) {
    match s.parent() {
        Some(Step::NoOutput) => (Step::NoOutput, Status::Replaced),
        _ => (s, Status::Intact),
    }
}

// ---------------------------------
// limit rules
// ---------------------------------

fn zero_limit_is_no_output(s: Step) -> (Step, Status) {
    let Step::Limit(l) = s else {
        return (s, Status::Intact);
    };
    if l.count == 0 {
        return (Step::NoOutput, Status::Replaced);
    }
    (Step::Limit(l), Status::Intact)
}

fn merge_limits(s: Step) -> (Step, Status) {
    let Step::Limit(outer) = s else {
        return (s, Status::Intact);
    };
    match *outer.parent {
        Step::Limit(inner) => {
            // rows visible to the outer limit start at inner.offset and
            // number at most inner.count
            let count = inner
                .count
                .saturating_sub(outer.offset)
                .min(outer.count);
            (
                Step::Limit(LimitStep {
                    count,
                    offset: inner.offset + outer.offset,
                    parent: inner.parent,
                }),
                Status::Replaced,
            )
        }
        parent => (
            Step::Limit(LimitStep {
                count: outer.count,
                offset: outer.offset,
                parent: Box::new(parent),
            }),
            Status::Intact,
        ),
    }
}

// ---------------------------------
// distinct rules
// ---------------------------------

fn merge_distinct(s: Step) -> (Step, Status) {
    let Step::Distinct(outer) = s else {
        return (s, Status::Intact);
    };
    match *outer.parent {
        Step::Distinct(inner) if inner.columns == outer.columns => (
            Step::Distinct(DistinctStep {
                columns: inner.columns,
                parent: inner.parent,
            }),
            Status::Replaced,
        ),
        parent => (
            Step::Distinct(DistinctStep {
                columns: outer.columns,
                parent: Box::new(parent),
            }),
            Status::Intact,
        ),
    }
}

/// DISTINCT over a grouped aggregate whose keys are all among the
/// distinct columns is a no-op: group keys are already unique per row.
fn eliminate_distinct_over_group_keys(s: Step) -> (Step, Status) {
    let Step::Distinct(d) = s else {
        return (s, Status::Intact);
    };
    let keeps_all_keys = match d.parent.as_ref() {
        Step::Aggregate(agg) if !agg.group_by.is_empty() => {
            agg.group_by.iter().all(|b| match b.result() {
                Some(name) => d
                    .columns
                    .iter()
                    .any(|c| matches!(c, Expr::Ident(i) if i == name)),
                None => false,
            })
        }
        _ => false,
    };
    if keeps_all_keys {
        (*d.parent, Status::Replaced)
    } else {
        (Step::Distinct(d), Status::Intact)
    }
}

/// `SELECT DISTINCT k FROM UNPIVOT ... AT k` needs only the distinct set
/// of field names, which the dedicated kernel computes without
/// materializing values.
fn fuse_distinct_unpivot(s: Step) -> (Step, Status) {
    let Step::Distinct(d) = s else {
        return (s, Status::Intact);
    };
    let fuses = match (d.columns.as_slice(), d.parent.as_ref()) {
        ([Expr::Ident(col)], Step::Unpivot(u)) => {
            u.as_name.is_none() && u.at_name.as_deref() == Some(col.as_str())
        }
        _ => false,
    };
    if !fuses {
        return (Step::Distinct(d), Status::Intact);
    }
    let Step::Unpivot(u) = *d.parent else {
        unreachable!()
    };
    (
        Step::UnpivotAtDistinct(UnpivotAtDistinctStep {
            at_name: u.at_name.expect("checked above"),
            parent: u.parent,
        }),
        Status::Replaced,
    )
}

// ---------------------------------
// aggregate rules
// ---------------------------------

/// COUNT of a non-null constant counts every row.
fn recognize_count_star(s: Step) -> (Step, Status) {
    let Step::Aggregate(mut agg) = s else {
        return (s, Status::Intact);
    };
    let mut changed = false;
    for a in &mut agg.agg {
        if a.agg.op != AggregateOp::Count {
            continue;
        }
        let constant = match &a.agg.inner {
            Some(e) => e.is_constant() && !matches!(e, Expr::Null),
            None => false,
        };
        if constant {
            a.agg.inner = Some(Expr::Star);
            changed = true;
        }
    }
    let status = if changed {
        Status::Updated
    } else {
        Status::Intact
    };
    (Step::Aggregate(agg), status)
}

/// A grouped aggregate over no rows produces no groups; an ungrouped one
/// still produces its single row and must be kept.
fn grouped_aggregate_over_no_output(s: Step) -> (Step, Status) {
    let Step::Aggregate(agg) = s else {
        return (s, Status::Intact);
    };
    if !agg.group_by.is_empty() && matches!(agg.parent.as_ref(), Step::NoOutput) {
        return (Step::NoOutput, Status::Replaced);
    }
    (Step::Aggregate(agg), Status::Intact)
}

/// GROUP BY with no aggregate outputs is DISTINCT on the keys.
fn groups_without_aggregates_are_distinct(s: Step) -> (Step, Status) {
    let Step::Aggregate(agg) = s else {
        return (s, Status::Intact);
    };
    if agg.agg.is_empty() && agg.windows.is_empty() && !agg.group_by.is_empty() {
        let AggregateStep {
            group_by, parent, ..
        } = agg;
        let columns = group_by.iter().map(|b| b.expr.clone()).collect();
        return (
            Step::Bind(BindStep {
                bindings: group_by,
                parent: Box::new(Step::Distinct(DistinctStep { columns, parent })),
            }),
            Status::Replaced,
        );
    }
    (Step::Aggregate(agg), Status::Intact)
}

// ---------------------------------
// replacement inlining
// ---------------------------------

/// The constant value a trace evaluates to, when it trivially reduces to
/// one: a single constant binding over the one-empty-row sentinel.
fn constant_trace_value(t: &Trace) -> Option<Expr> {
    match &t.top {
        Step::Bind(b) => {
            if b.bindings.len() != 1 || !matches!(b.parent.as_ref(), Step::DummyOutput) {
                return None;
            }
            let e = &b.bindings[0].expr;
            e.is_constant().then(|| e.clone())
        }
        _ => None,
    }
}

/// Inline replacement sub-traces that reduced to pure constants,
/// rewriting `PARTITION_VALUE(i)` placeholders and renumbering the
/// surviving replacements.
pub(crate) fn inline_constant_replacements(trace: &mut Trace) {
    if trace.replacements.is_empty() {
        return;
    }
    let values: Vec<Option<Expr>> = trace
        .replacements
        .iter()
        .map(constant_trace_value)
        .collect();
    if values.iter().all(Option::is_none) {
        return;
    }
    // renumber the survivors
    let mut remap: Vec<Option<i64>> = Vec::with_capacity(values.len());
    let mut next = 0i64;
    for v in &values {
        if v.is_some() {
            remap.push(None);
        } else {
            remap.push(Some(next));
            next += 1;
        }
    }
    let old = std::mem::take(&mut trace.replacements);
    trace.replacements = old
        .into_iter()
        .zip(&values)
        .filter_map(|(t, v)| v.is_none().then_some(t))
        .collect();
    trace.map_exprs(&mut |e| {
        e.rewrite_with(&mut |n| {
            let Expr::Builtin {
                func: BuiltinOp::PartitionValue,
                args,
            } = &n
            else {
                return n;
            };
            let Some(Expr::Integer(i)) = args.first() else {
                return n;
            };
            let idx = *i as usize;
            match values.get(idx) {
                Some(Some(value)) => value.clone(),
                Some(None) => Expr::call(
                    BuiltinOp::PartitionValue,
                    vec![Expr::Integer(remap[idx].unwrap_or(*i))],
                ),
                None => n,
            }
        })
    });
}

// ---------------------------------
// index-driven pruning
// ---------------------------------

/// Drop leaf filter conjuncts that the environment's index proves are
/// satisfied by every row (the whole time range of the scanned table
/// lies inside the predicate's range).
pub(crate) fn apply_index_rules(trace: &mut Trace, env: &dyn Env) -> Result<()> {
    for rep in &mut trace.replacements {
        apply_index_rules(rep, env)?;
    }
    let mut cur = &mut trace.top;
    loop {
        if let Step::IterTable(it) = cur {
            prune_leaf_filter(it, env)?;
            return Ok(());
        }
        match cur.parent_mut() {
            Some(p) => cur = p,
            None => return Ok(()),
        }
    }
}

fn prune_leaf_filter(it: &mut IterTable, env: &dyn Env) -> Result<()> {
    let Some(cond) = &it.filter else {
        return Ok(());
    };
    let Some(index) = env.index(&it.table.expr)? else {
        return Ok(());
    };
    let mut conj = Vec::new();
    conjunctions(cond, &mut conj);
    let before = conj.len();
    conj.retain(|c| !always_true_by_time_range(c, index));
    if conj.len() != before {
        it.filter = if conj.is_empty() {
            None
        } else {
            Some(conjoin(conj))
        };
    }
    Ok(())
}

/// Mark the leaf's equality-partition keys: grouping keys that the
/// environment's index reports the table as materially partitioned on.
/// A nonempty key set is what lets `split` produce a partitioned
/// map/reduce decomposition instead of leaving the trace whole.
pub(crate) fn apply_partition_rules(trace: &mut Trace, env: &dyn Env) -> Result<()> {
    let keys = {
        let Step::IterTable(it) = trace.leaf() else {
            return Ok(());
        };
        let Some(index) = env.index(&it.table.expr)? else {
            return Ok(());
        };
        let table = it.table.result().map(str::to_string);
        // the bottom-most aggregate is the one split() decomposes; its
        // group keys are the candidate partition keys
        let mut group_by: &[Binding] = &[];
        for s in trace.steps() {
            if let Step::Aggregate(a) = s {
                group_by = &a.group_by;
            }
        }
        let mut keys = Vec::new();
        for g in group_by {
            let Some(column) = partition_column(&g.expr, table.as_deref()) else {
                continue;
            };
            if index.has_partition(&column) {
                keys.push(g.expr.clone());
            }
        }
        keys
    };
    if keys.is_empty() {
        return Ok(());
    }
    let mut cur = &mut trace.top;
    loop {
        if let Step::IterTable(it) = cur {
            it.on_equal = keys;
            return Ok(());
        }
        match cur.parent_mut() {
            Some(p) => cur = p,
            None => return Ok(()),
        }
    }
}

/// The column name a grouping expression partitions on, relative to the
/// scanned row (the table binding prefix is stripped).
fn partition_column(e: &Expr, table: Option<&str>) -> Option<String> {
    let parts = flat_path(e)?;
    if parts.len() > 1 && table == Some(parts[0].as_str()) {
        return Some(parts[1..].join("."));
    }
    Some(parts.join("."))
}

fn always_true_by_time_range(e: &Expr, idx: &dyn Index) -> bool {
    let Expr::Cmp { op, left, right } = e else {
        return false;
    };
    let (path, lit, op) = match (left.as_ref(), right.as_ref()) {
        (p, Expr::Timestamp(t)) => (p, *t, *op),
        (Expr::Timestamp(t), p) => (p, *t, op.flip()),
        _ => return false,
    };
    let Some(parts) = flat_path(path) else {
        return false;
    };
    let Some((min, max)) = idx.time_range(&parts) else {
        return false;
    };
    match op {
        CmpOp::Greater => min > lit,
        CmpOp::GreaterEq => min >= lit,
        CmpOp::Less => max < lit,
        CmpOp::LessEq => max <= lit,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{FixedPoint, Status};
    use crate::trace::{
        AggBinding, AggregateStep, BindStep, DistinctStep, FilterStep, IterTable, LimitStep, Step,
        StepKind, Trace,
    };
    use opal_common::{CancelToken, PlannerConfig};
    use opal_expr::{Aggregate, AggregateOp, Binding, CmpOp, Expr, NoHint};

    fn scan(table: &str) -> Step {
        Step::IterTable(IterTable {
            table: Binding::auto(Expr::ident(table)),
            filter: None,
            fields: vec![],
            wildcard: false,
            on_equal: vec![],
        })
    }

    fn optimize(top: Step) -> Trace {
        let mut t = Trace::new(top, vec![], &NoHint);
        FixedPoint::standard()
            .optimize(&mut t, &PlannerConfig::default(), &CancelToken::new())
            .unwrap();
        t
    }

    fn filter(cond: Expr, parent: Step) -> Step {
        Step::Filter(FilterStep {
            cond,
            parent: Box::new(parent),
        })
    }

    #[test]
    fn filters_merge_and_push_into_leaf() {
        let a = Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5));
        let b = Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3));
        let t = optimize(filter(b.clone(), filter(a.clone(), scan("input"))));
        let Step::IterTable(it) = &t.top else {
            panic!("expected bare leaf, got {:?}", t.top);
        };
        assert_eq!(it.filter, Some(Expr::and(a, b)));
    }

    #[test]
    fn constant_true_filter_disappears() {
        let t = optimize(filter(
            Expr::cmp(CmpOp::Eq, Expr::Integer(1), Expr::Integer(1)),
            scan("input"),
        ));
        let Step::IterTable(it) = &t.top else {
            panic!("expected leaf, got {:?}", t.top);
        };
        assert_eq!(it.filter, None);
    }

    #[test]
    fn constant_false_filter_kills_the_chain() {
        let t = optimize(filter(
            Expr::cmp(CmpOp::Eq, Expr::Integer(1), Expr::Integer(2)),
            scan("input"),
        ));
        assert_eq!(t.top, Step::NoOutput);
    }

    #[test]
    fn filter_pushes_through_projection() {
        let bind = Step::Bind(BindStep {
            bindings: vec![Binding::bind(
                Expr::dot(Expr::ident("t"), "inner"),
                "x",
            )],
            parent: Box::new(scan("t")),
        });
        let cond = Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(0));
        let t = optimize(filter(cond, bind));
        // filter now sits below the bind, rewritten through the binding,
        // and then lands in the leaf
        let Step::Bind(b) = &t.top else {
            panic!("expected bind on top, got {:?}", t.top);
        };
        let Step::IterTable(it) = b.parent.as_ref() else {
            panic!("expected leaf under bind, got {:?}", b.parent);
        };
        assert_eq!(
            it.filter,
            Some(Expr::cmp(
                CmpOp::Greater,
                Expr::dot(Expr::ident("t"), "inner"),
                Expr::Integer(0)
            ))
        );
    }

    #[test]
    fn limits_merge() {
        let inner = Step::Limit(LimitStep {
            count: 10,
            offset: 2,
            parent: Box::new(scan("t")),
        });
        let outer = Step::Limit(LimitStep {
            count: 5,
            offset: 1,
            parent: Box::new(inner),
        });
        let t = optimize(outer);
        let Step::Limit(l) = &t.top else {
            panic!("expected limit, got {:?}", t.top);
        };
        assert_eq!((l.count, l.offset), (5, 3));
        assert_eq!(l.parent.kind(), StepKind::IterTable);
    }

    #[test]
    fn zero_limit_eliminates_everything() {
        let t = optimize(Step::Limit(LimitStep {
            count: 0,
            offset: 0,
            parent: Box::new(scan("t")),
        }));
        assert_eq!(t.top, Step::NoOutput);
    }

    #[test]
    fn count_of_constant_becomes_count_star() {
        let agg = Step::Aggregate(AggregateStep {
            agg: vec![AggBinding {
                agg: Aggregate {
                    op: AggregateOp::Count,
                    precision: 0,
                    inner: Some(Expr::Integer(1)),
                    over: None,
                    filter: None,
                },
                result: "count".to_string(),
            }],
            windows: vec![],
            group_by: vec![],
            parent: Box::new(scan("t")),
        });
        let t = optimize(agg);
        let Step::Aggregate(a) = &t.top else {
            panic!("expected aggregate, got {:?}", t.top);
        };
        assert_eq!(a.agg[0].agg.inner, Some(Expr::Star));
    }

    #[test]
    fn distinct_over_group_keys_is_dropped() {
        let agg = Step::Aggregate(AggregateStep {
            agg: vec![AggBinding {
                agg: Aggregate {
                    op: AggregateOp::Sum,
                    precision: 0,
                    inner: Some(Expr::ident("v")),
                    over: None,
                    filter: None,
                },
                result: "sum".to_string(),
            }],
            windows: vec![],
            group_by: vec![Binding::auto(Expr::ident("k"))],
            parent: Box::new(scan("t")),
        });
        let t = optimize(Step::Distinct(DistinctStep {
            columns: vec![Expr::ident("k"), Expr::ident("sum")],
            parent: Box::new(agg),
        }));
        assert_eq!(t.top.kind(), StepKind::Aggregate);
    }

    #[test]
    fn engine_terminates_within_watchdog_bound() {
        // deep chains of interacting rules must converge well inside the
        // default pass bound
        let mut step = scan("t");
        for i in 0..40 {
            step = filter(
                Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(i)),
                step,
            );
        }
        let mut t = Trace::new(step, vec![], &NoHint);
        let cfg = PlannerConfig::default();
        FixedPoint::standard()
            .optimize(&mut t, &cfg, &CancelToken::new())
            .unwrap();
        assert_eq!(t.top.kind(), StepKind::IterTable);
    }

    #[test]
    fn cancelled_token_stops_the_engine() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut t = Trace::new(filter(Expr::ident("p"), scan("t")), vec![], &NoHint);
        let err = FixedPoint::standard()
            .optimize(&mut t, &PlannerConfig::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, opal_common::Error::Cancelled));
    }

    #[test]
    fn custom_rule_registration() {
        // a rule that rewrites every limit to count 7, to prove
        // registration order and dispatch-by-kind work
        fn seven(s: Step) -> (Step, Status) {
            let Step::Limit(l) = s else {
                return (s, Status::Intact);
            };
            if l.count == 7 {
                return (Step::Limit(l), Status::Intact);
            }
            (
                Step::Limit(LimitStep {
                    count: 7,
                    offset: l.offset,
                    parent: l.parent,
                }),
                Status::Updated,
            )
        }
        let mut fp = FixedPoint::empty();
        fp.add(StepKind::Limit, seven);
        let mut t = Trace::new(
            Step::Limit(LimitStep {
                count: 100,
                offset: 0,
                parent: Box::new(scan("t")),
            }),
            vec![],
            &NoHint,
        );
        fp.optimize(&mut t, &PlannerConfig::default(), &CancelToken::new())
            .unwrap();
        let Step::Limit(l) = &t.top else {
            panic!("expected limit");
        };
        assert_eq!(l.count, 7);
    }
}
