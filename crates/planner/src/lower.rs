//! Trace lowering: physical op construction and input deduplication.
//!
//! Contract:
//! - every `IterTable` leaf resolves to a slot in the deduplicated input
//!   table; two scans share a slot when their table expressions are equal
//!   and their filter hints merge without dropping a predicate that is
//!   not safely removable (timestamp comparisons never are);
//! - the input's filter hint is semantic: rows failing it never reach the
//!   leaf, so each leaf re-applies only the residual of its own filter
//!   against the final merged hint;
//! - input slots are assigned in first-seen order after merging and each
//!   input is stat'd exactly once, with cancellation checked in between.

use tracing::debug;

use opal_common::{CancelToken, Error, PlannerConfig, Result};
use opal_expr::{to_text, Binding, BuiltinOp, Expr, ExplainFormat, Query};

use crate::build::{build, conjoin, conjunctions};
use crate::env::{Env, TableHandle};
use crate::op::{
    CountStar, Distinct, Explain, Filter, HashAggregate, HashOrder, Hints, Input, Leaf, Limit,
    Node, Op, OrderBy, OutputIndex, OutputPart, Project, ResultColumn, SimpleAggregate,
    Substitute, Tree, UnionMap, UnionPartition, Unnest, Unpivot, UnpivotAtDistinct,
};
use crate::rules::{apply_index_rules, apply_partition_rules, FixedPoint};
use crate::split::{no_split, split};
use crate::trace::{
    AggregateStep, IterTable, LimitStep, OrderStep, Step, Trace, UnionMapStep,
};

/// Options threaded through planning.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Planner configuration.
    pub config: PlannerConfig,
    /// Cooperative cancellation token.
    pub cancel: CancelToken,
}

/// Plan `q` for single-node execution.
pub fn plan(q: &Query, env: &dyn Env) -> Result<Tree> {
    plan_with(q, env, &PlanOptions::default(), false)
}

/// Plan `q` for distributed execution: the plan's scans run on every
/// peer and a reduction runs above a union-map boundary.
pub fn plan_split(q: &Query, env: &dyn Env) -> Result<Tree> {
    plan_with(q, env, &PlanOptions::default(), true)
}

/// Plan with explicit options. `split` selects the distributed shape.
pub fn plan_with(q: &Query, env: &dyn Env, opts: &PlanOptions, split_plan: bool) -> Result<Tree> {
    opts.cancel.check()?;
    let mut trace = build(q, env)?;
    FixedPoint::standard().optimize(&mut trace, &opts.config, &opts.cancel)?;
    // index probes run against the merged leaf filters
    apply_index_rules(&mut trace, env)?;
    let trace = if split_plan {
        apply_partition_rules(&mut trace, env)?;
        split(trace)?
    } else {
        no_split(trace)
    };
    let tree = to_tree(&trace, env, opts)?;
    debug!(inputs = tree.inputs.len(), "plan complete");

    if q.explain == ExplainFormat::None {
        return Ok(tree);
    }
    Ok(Tree {
        inputs: Vec::new(),
        root: Node {
            input: -1,
            op: Op::Explain(Explain {
                format: q.explain,
                query: to_text(&q.body),
                tree: Box::new(tree),
            }),
            output: Vec::new(),
        },
    })
}

fn reject(msg: &str) -> Error {
    Error::NotSupported(msg.to_string())
}

// ---------------------------------
// input accumulation
// ---------------------------------

struct InputBuilder {
    table: Binding,
    hints: Hints,
    handle: Option<Box<dyn TableHandle>>,
}

fn is_timestamp(e: &Expr) -> bool {
    matches!(e, Expr::Timestamp(_))
}

/// Returns whether dropping `e` from a filter hint is safe (i.e. likely
/// to be profitable). Expressions that contain timestamp comparisons, or
/// logical compositions thereof, are never dropped: they drive
/// block-level pruning.
fn can_remove_hint(e: &Expr) -> bool {
    match e {
        Expr::Logical { left, right, .. } => can_remove_hint(left) && can_remove_hint(right),
        Expr::Cmp { left, right, .. } => !(is_timestamp(left) || is_timestamp(right)),
        _ => true,
    }
}

/// Merge `y`'s filter hint into `x`: the merged hint is the intersection
/// of both conjunction sets, and the merge is refused when a left-over
/// conjunct on either side is not safely removable.
fn merge_filter_hint(x: &mut Hints, y: &Hints) -> bool {
    let mut xconj = Vec::new();
    if let Some(f) = &x.filter {
        conjunctions(f, &mut xconj);
    }
    let mut yconj = Vec::new();
    if let Some(f) = &y.filter {
        conjunctions(f, &mut yconj);
    }
    let mut overlap = Vec::new();
    let mut leftover = Vec::new();
    for cx in xconj {
        match yconj.iter().position(|cy| *cy == cx) {
            Some(i) => {
                yconj.remove(i);
                overlap.push(cx);
            }
            None => leftover.push(cx),
        }
    }
    if leftover.iter().chain(yconj.iter()).any(|e| !can_remove_hint(e)) {
        return false;
    }
    x.filter = if overlap.is_empty() {
        None
    } else {
        Some(conjoin(overlap))
    };
    true
}

impl InputBuilder {
    fn merge(&mut self, other: &InputBuilder) -> bool {
        if self.table.expr != other.table.expr {
            return false;
        }
        if !merge_filter_hint(&mut self.hints, &other.hints) {
            return false;
        }
        // the hints changed, so any previous stat result is stale
        self.handle = None;
        if self.hints.all_fields {
            return true;
        }
        if other.hints.all_fields {
            self.hints.fields.clear();
            self.hints.all_fields = true;
            return true;
        }
        self.hints
            .fields
            .extend(other.hints.fields.iter().cloned());
        self.hints.fields.sort();
        self.hints.fields.dedup();
        true
    }

    fn finish(mut self, env: &dyn Env) -> Result<Input> {
        let handle = match self.handle.take() {
            Some(h) => h,
            None => env.stat(&self.table.expr, &self.hints)?,
        };
        Ok(Input {
            table: self.table,
            hints: self.hints,
            handle: Some(handle),
        })
    }
}

/// Accumulates identical inputs while lowering a trace, so leaf nodes
/// that reference the same table can be deduplicated.
struct Walker {
    inputs: Vec<InputBuilder>,
    /// Slot most recently observed for the current sub-walk; -1 if none.
    latest: i64,
}

impl Walker {
    fn put(&mut self, it: &IterTable) {
        let trial = InputBuilder {
            table: it.table.clone(),
            hints: Hints {
                filter: it.filter.clone(),
                fields: it.fields.clone(),
                all_fields: it.wildcard,
            },
            handle: None,
        };
        for (i, existing) in self.inputs.iter_mut().enumerate() {
            if existing.merge(&trial) {
                self.latest = i as i64;
                return;
            }
        }
        self.latest = self.inputs.len() as i64;
        self.inputs.push(trial);
    }

    fn walk_build(&mut self, step: &Step, env: &dyn Env) -> Result<Op> {
        // leaves first
        match step {
            Step::IterTable(it) => {
                let equal_expr: Vec<Expr> = (0..it.on_equal.len() as i64)
                    .map(|i| Expr::call(BuiltinOp::PartitionValue, vec![Expr::Integer(i)]))
                    .collect();
                self.put(it);
                let mut out = Op::Leaf(Leaf {
                    orig: it.table.clone(),
                    on_equal: it.on_equal.clone(),
                    equal_expr,
                });
                if let Some(cond) = &it.filter {
                    // the residual pass trims this against the merged hint
                    out = Op::Filter(Filter {
                        from: Box::new(out),
                        cond: cond.clone(),
                    });
                }
                return Ok(out);
            }
            Step::NoOutput => return Ok(Op::NoOutput),
            Step::DummyOutput => return Ok(Op::DummyOutput),
            Step::UnionMap(u) => return self.lower_union_map(u, env),
            _ => {}
        }

        let parent = step.parent().expect("non-leaf step has a parent");
        let input = self.walk_build(parent, env)?;
        match step {
            Step::IterValue(s) => Ok(Op::Unnest(Unnest {
                from: Box::new(input),
                expr: s.value.clone(),
                result: s.result.clone(),
            })),
            Step::Filter(s) => Ok(Op::Filter(Filter {
                from: Box::new(input),
                cond: s.cond.clone(),
            })),
            Step::Distinct(s) => Ok(Op::Distinct(Distinct {
                from: Box::new(input),
                fields: s.columns.clone(),
                limit: None,
            })),
            Step::Bind(s) => Ok(Op::Project(Project {
                from: Box::new(input),
                using: s.bindings.clone(),
            })),
            Step::Aggregate(s) => lower_aggregate(s, input),
            Step::Limit(s) => lower_limit(s, input),
            Step::Order(s) => lower_order(s, input),
            Step::Unpivot(s) => Ok(Op::Unpivot(Unpivot {
                from: Box::new(input),
                as_name: s.as_name.clone(),
                at_name: s.at_name.clone(),
            })),
            Step::UnpivotAtDistinct(s) => Ok(Op::UnpivotAtDistinct(UnpivotAtDistinct {
                from: Box::new(input),
                at_name: s.at_name.clone(),
            })),
            Step::OutputPart(s) => lower_output_part(s, env, input),
            Step::OutputIndex(s) => lower_output_index(s, env, input),
            Step::IterTable(_) | Step::UnionMap(_) | Step::NoOutput | Step::DummyOutput => {
                unreachable!("leaves are handled above")
            }
        }
    }

    fn lower_union_map(&mut self, u: &UnionMapStep, env: &dyn Env) -> Result<Op> {
        let sub = self.walk_build(&u.child.top, env)?;
        let mut latest = self.latest;
        if latest == -1 {
            // the inner chain may have been eliminated entirely; still
            // partition over the right input
            self.put(&u.inner);
            latest = self.latest;
        }
        let sub = self.add_replace(sub, &u.child, env)?;
        self.latest = latest;
        if !u.partition_by.is_empty() {
            return Ok(Op::UnionPartition(UnionPartition {
                from: Box::new(sub),
                by: u.partition_by.clone(),
            }));
        }
        Ok(Op::UnionMap(UnionMap {
            from: Box::new(sub),
        }))
    }

    fn add_replace(&mut self, op: Op, trace: &Trace, env: &dyn Env) -> Result<Op> {
        if trace.replacements.is_empty() {
            return Ok(op);
        }
        let mut inner = Vec::with_capacity(trace.replacements.len());
        for rep in &trace.replacements {
            let mut node = Node {
                input: -1,
                op: Op::NoOutput,
                output: Vec::new(),
            };
            self.to_node(&mut node, rep, env)?;
            inner.push(node);
        }
        Ok(Op::Substitute(Substitute {
            from: Box::new(op),
            inner,
        }))
    }

    fn to_node(&mut self, node: &mut Node, trace: &Trace, env: &dyn Env) -> Result<()> {
        self.latest = -1;
        let op = self.walk_build(&trace.top, env)?;
        node.input = self.latest;
        let op = self.add_replace(op, trace, env)?;
        node.op = op;
        node.output = trace
            .final_bindings
            .iter()
            .map(|(name, ty)| ResultColumn {
                name: name.clone(),
                ty: *ty,
            })
            .collect();
        Ok(())
    }

    fn finish(self, env: &dyn Env, cancel: &CancelToken) -> Result<Vec<Input>> {
        let mut out = Vec::with_capacity(self.inputs.len());
        for b in self.inputs {
            cancel.check()?;
            out.push(b.finish(env)?);
        }
        Ok(out)
    }
}

// ---------------------------------
// per-step lowering
// ---------------------------------

fn iscountstar(s: &AggregateStep) -> bool {
    if s.agg.len() != 1 || !s.windows.is_empty() {
        return false;
    }
    let a = &s.agg[0];
    a.agg.op == opal_expr::AggregateOp::Count
        && a.agg.filter.is_none()
        && matches!(a.agg.inner, Some(Expr::Star))
}

fn lower_aggregate(s: &AggregateStep, from: Op) -> Result<Op> {
    if s.group_by.is_empty() && s.windows.is_empty() {
        // simple aggregate; check for COUNT(*) first
        if iscountstar(s) {
            return Ok(Op::CountStar(CountStar {
                from: Box::new(from),
                result: s.agg[0].result.clone(),
            }));
        }
        return Ok(Op::SimpleAggregate(SimpleAggregate {
            from: Box::new(from),
            outputs: s.agg.clone(),
        }));
    }
    Ok(Op::HashAggregate(HashAggregate {
        from: Box::new(from),
        agg: s.agg.clone(),
        windows: s.windows.clone(),
        by: s.group_by.clone(),
        order_by: Vec::new(),
        limit: None,
    }))
}

fn lower_limit(s: &LimitStep, from: Op) -> Result<Op> {
    if s.count == 0 {
        return Ok(Op::NoOutput);
    }
    // some operations accept LIMIT natively
    match from {
        Op::HashAggregate(mut ha) => {
            if s.offset != 0 {
                return Err(reject("non-zero OFFSET of hash aggregate result"));
            }
            ha.limit = Some(s.count);
            Ok(Op::HashAggregate(ha))
        }
        Op::OrderBy(mut ob) => {
            ob.limit = Some(s.count);
            ob.offset = s.offset;
            Ok(Op::OrderBy(ob))
        }
        Op::Distinct(mut d) => {
            if s.offset != 0 {
                return Err(reject("non-zero OFFSET of distinct result"));
            }
            d.limit = Some(s.count);
            Ok(Op::Distinct(d))
        }
        from => {
            if s.offset != 0 {
                return Err(reject("OFFSET without GROUP BY/ORDER BY not implemented"));
            }
            Ok(Op::Limit(Limit {
                from: Box::new(from),
                num: s.count,
            }))
        }
    }
}

fn lower_order(s: &OrderStep, from: Op) -> Result<Op> {
    // hash aggregates can accept ORDER BY directly when every sort key
    // resolves to one of their output columns by name
    let from = if let Op::HashAggregate(mut ha) = from {
        let mut resolved = Vec::with_capacity(s.columns.len());
        let mut all = true;
        for o in &s.columns {
            let idx = hash_order_column(&ha, &o.column);
            match idx {
                Some(column) => resolved.push(HashOrder {
                    column,
                    desc: o.desc,
                    nulls_last: o.nulls_last,
                }),
                None => {
                    // ORDER BY over an expression composed of several
                    // aggregate results cannot merge into the aggregate
                    all = false;
                    break;
                }
            }
        }
        if all {
            ha.order_by = resolved;
            return Ok(Op::HashAggregate(ha));
        }
        Op::HashAggregate(ha)
    } else {
        from
    };

    // ordinary sort; constant sort keys do not meaningfully order rows
    let mut columns = Vec::with_capacity(s.columns.len());
    for o in &s.columns {
        if o.column.is_constant() {
            continue;
        }
        columns.push(o.clone());
    }
    if columns.is_empty() {
        return Ok(from);
    }
    for i in 0..columns.len() {
        for j in i + 1..columns.len() {
            if columns[i].column == columns[j].column {
                return Err(Error::DuplicateOrderExpression(format!(
                    "{:?}",
                    to_text(&columns[j].column)
                )));
            }
        }
    }
    Ok(Op::OrderBy(OrderBy {
        from: Box::new(from),
        columns,
        limit: None,
        offset: 0,
    }))
}

/// Resolve a sort key to a hash-aggregate output position: aggregates
/// first, then group keys, then windows.
fn hash_order_column(ha: &HashAggregate, e: &Expr) -> Option<usize> {
    let Expr::Ident(name) = e else {
        return None;
    };
    for (i, a) in ha.agg.iter().enumerate() {
        if a.result == *name {
            return Some(i);
        }
    }
    for (i, b) in ha.by.iter().enumerate() {
        if b.result() == Some(name.as_str()) {
            return Some(ha.agg.len() + i);
        }
    }
    for (i, w) in ha.windows.iter().enumerate() {
        if w.result == *name {
            return Some(ha.agg.len() + ha.by.len() + i);
        }
    }
    None
}

fn lower_output_part(
    s: &crate::trace::OutputPartStep,
    env: &dyn Env,
    input: Op,
) -> Result<Op> {
    if env.uploader().is_none() {
        return Err(Error::MissingFeature(
            "INTO requires an environment that supports uploads".to_string(),
        ));
    }
    Ok(Op::OutputPart(OutputPart {
        from: Box::new(input),
        basename: s.basename.clone(),
    }))
}

fn lower_output_index(
    s: &crate::trace::OutputIndexStep,
    env: &dyn Env,
    input: Op,
) -> Result<Op> {
    if env.uploader().is_none() || env.signing_key().is_none() {
        return Err(Error::MissingFeature(
            "INTO requires an environment that supports uploads".to_string(),
        ));
    }
    let parts = opal_expr::flat_path(&s.table).ok_or_else(|| {
        Error::InvalidArgument(format!("invalid table expression {}", to_text(&s.table)))
    })?;
    if parts.len() != 2 {
        return Err(Error::InvalidArgument(format!(
            "invalid table expression {}",
            to_text(&s.table)
        )));
    }
    Ok(Op::OutputIndex(OutputIndex {
        from: Box::new(input),
        db: parts[0].clone(),
        table: parts[1].clone(),
        basename: s.basename.clone(),
    }))
}

// ---------------------------------
// residual filters
// ---------------------------------

/// Trim each leaf's standalone filter to the residual of its own
/// predicate conjunctions against the final (post-merge) input hint.
fn residual_pass(node: &mut Node, inputs: &[InputBuilder]) {
    let slot = node.input;
    let op = std::mem::replace(&mut node.op, Op::NoOutput);
    node.op = residual_op(op, slot, inputs);
}

fn residual_op(op: Op, slot: i64, inputs: &[InputBuilder]) -> Op {
    match op {
        Op::Filter(f) if matches!(*f.from, Op::Leaf(_)) => {
            let hint = usize::try_from(slot)
                .ok()
                .and_then(|i| inputs.get(i))
                .and_then(|b| b.hints.filter.as_ref());
            let mut conj = Vec::new();
            conjunctions(&f.cond, &mut conj);
            if let Some(hint) = hint {
                let mut hconj = Vec::new();
                conjunctions(hint, &mut hconj);
                conj.retain(|c| !hconj.contains(c));
            }
            if conj.is_empty() {
                *f.from
            } else {
                Op::Filter(Filter {
                    from: f.from,
                    cond: conjoin(conj),
                })
            }
        }
        Op::Substitute(mut s) => {
            for inner in &mut s.inner {
                residual_pass(inner, inputs);
            }
            let from = residual_op(*s.from, slot, inputs);
            Op::Substitute(Substitute {
                from: Box::new(from),
                inner: s.inner,
            })
        }
        mut other => {
            if let Some(from) = child_slot(&mut other) {
                let taken = std::mem::replace(&mut **from, Op::NoOutput);
                **from = residual_op(taken, slot, inputs);
            }
            other
        }
    }
}

/// Mutable access to the single upstream slot of a nonterminal op.
fn child_slot(op: &mut Op) -> Option<&mut Box<Op>> {
    match op {
        Op::Filter(x) => Some(&mut x.from),
        Op::Project(x) => Some(&mut x.from),
        Op::Distinct(x) => Some(&mut x.from),
        Op::Limit(x) => Some(&mut x.from),
        Op::OrderBy(x) => Some(&mut x.from),
        Op::HashAggregate(x) => Some(&mut x.from),
        Op::SimpleAggregate(x) => Some(&mut x.from),
        Op::CountStar(x) => Some(&mut x.from),
        Op::UnionMap(x) => Some(&mut x.from),
        Op::UnionPartition(x) => Some(&mut x.from),
        Op::Unnest(x) => Some(&mut x.from),
        Op::Unpivot(x) => Some(&mut x.from),
        Op::UnpivotAtDistinct(x) => Some(&mut x.from),
        Op::Substitute(x) => Some(&mut x.from),
        Op::OutputPart(x) => Some(&mut x.from),
        Op::OutputIndex(x) => Some(&mut x.from),
        Op::Leaf(_) | Op::Explain(_) | Op::NoOutput | Op::DummyOutput => None,
    }
}

/// Lower a finalized trace into a plan tree.
pub(crate) fn to_tree(trace: &Trace, env: &dyn Env, opts: &PlanOptions) -> Result<Tree> {
    let mut w = Walker {
        inputs: Vec::new(),
        latest: -1,
    };
    let mut root = Node {
        input: -1,
        op: Op::NoOutput,
        output: Vec::new(),
    };
    w.to_node(&mut root, trace, env)?;
    residual_pass(&mut root, &w.inputs);
    let inputs = w.finish(env, &opts.cancel)?;
    Ok(Tree { inputs, root })
}
