use opal_expr::{type_of, Aggregate, Binding, Expr, Hint, NoHint, Order, TypeSet};

/// One aggregate computation and the column name it binds.
#[derive(Debug, Clone, PartialEq)]
pub struct AggBinding {
    /// The aggregate expression.
    pub agg: Aggregate,
    /// Result column name.
    pub result: String,
}

/// A table scan: the terminal step of a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct IterTable {
    /// Table path expression plus its binding name.
    pub table: Binding,
    /// Filter pushed down onto the scan; every other filter in the chain
    /// is free-standing.
    pub filter: Option<Expr>,
    /// The exact paths the scan must produce. Ignored under `wildcard`.
    pub fields: Vec<String>,
    /// The scan must produce entire rows.
    pub wildcard: bool,
    /// Equality-join partition expressions, when the scan participates in
    /// a partitioned union.
    pub on_equal: Vec<Expr>,
}

/// Unnesting of a list-valued expression (`FROM ... , x.list AS item`).
#[derive(Debug, Clone, PartialEq)]
pub struct IterValue {
    /// The list-valued expression.
    pub value: Expr,
    /// Binding name for each produced element.
    pub result: String,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// A free-standing row filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStep {
    /// Predicate.
    pub cond: Expr,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Projection / renaming.
#[derive(Debug, Clone, PartialEq)]
pub struct BindStep {
    /// Output bindings.
    pub bindings: Vec<Binding>,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Row deduplication on a column list.
#[derive(Debug, Clone, PartialEq)]
pub struct DistinctStep {
    /// Deduplication key expressions.
    pub columns: Vec<Expr>,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Aggregation, with window functions split out.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStep {
    /// Non-windowed aggregates.
    pub agg: Vec<AggBinding>,
    /// Windowed aggregates (those carrying an `OVER` clause).
    pub windows: Vec<AggBinding>,
    /// Group keys; empty means a single global group.
    pub group_by: Vec<Binding>,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Sorting.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStep {
    /// Sort terms, most significant first.
    pub columns: Vec<Order>,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Row-count limiting.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitStep {
    /// Maximum rows to pass.
    pub count: u64,
    /// Rows to skip first.
    pub offset: u64,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// `UNPIVOT ... AS v AT k`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpivotStep {
    /// Value binding name.
    pub as_name: Option<String>,
    /// Key binding name.
    pub at_name: Option<String>,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// `UNPIVOT ... AT k GROUP BY k`: distinct field names only.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpivotAtDistinctStep {
    /// Key binding name.
    pub at_name: String,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Part upload for `SELECT INTO`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPartStep {
    /// Object basename prefix for uploaded parts.
    pub basename: String,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Index update for `SELECT INTO`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputIndexStep {
    /// Destination table path (`db.table`).
    pub table: Expr,
    /// Object basename prefix written by the part step.
    pub basename: String,
    /// Upstream step.
    pub parent: Box<Step>,
}

/// Distributed-map leaf: the child trace executes on every peer and the
/// parent trace reduces the union of their outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionMapStep {
    /// The scan the map phase iterates; used to pin the partitioned input
    /// when the child collapses to a sentinel.
    pub inner: IterTable,
    /// The map-phase trace.
    pub child: Box<Trace>,
    /// Equality-partition keys; non-empty selects a partitioned union.
    pub partition_by: Vec<Expr>,
}

/// One relational step in a [`Trace`] chain.
///
/// Steps are singly linked from the final step down to exactly one leaf
/// ([`Step::IterTable`], [`Step::UnionMap`], or a sentinel). Each step owns
/// its parent; rewrite rules consume and rebuild steps in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Table scan leaf.
    IterTable(IterTable),
    /// Unnest.
    IterValue(IterValue),
    /// Row filter.
    Filter(FilterStep),
    /// Projection.
    Bind(BindStep),
    /// Deduplication.
    Distinct(DistinctStep),
    /// Aggregation.
    Aggregate(AggregateStep),
    /// Sort.
    Order(OrderStep),
    /// Limit/offset.
    Limit(LimitStep),
    /// Unpivot.
    Unpivot(UnpivotStep),
    /// Distinct unpivot keys.
    UnpivotAtDistinct(UnpivotAtDistinctStep),
    /// `SELECT INTO` part upload.
    OutputPart(OutputPartStep),
    /// `SELECT INTO` index update.
    OutputIndex(OutputIndexStep),
    /// Distributed map leaf.
    UnionMap(UnionMapStep),
    /// Leaf producing no rows at all.
    NoOutput,
    /// Leaf producing exactly one empty row (`SELECT` without `FROM`).
    DummyOutput,
}

/// Discriminant of a [`Step`], used to key rewrite-rule registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StepKind {
    IterTable,
    IterValue,
    Filter,
    Bind,
    Distinct,
    Aggregate,
    Order,
    Limit,
    Unpivot,
    UnpivotAtDistinct,
    OutputPart,
    OutputIndex,
    UnionMap,
    NoOutput,
    DummyOutput,
}

impl Step {
    /// The kind of this step.
    pub fn kind(&self) -> StepKind {
        match self {
            Step::IterTable(_) => StepKind::IterTable,
            Step::IterValue(_) => StepKind::IterValue,
            Step::Filter(_) => StepKind::Filter,
            Step::Bind(_) => StepKind::Bind,
            Step::Distinct(_) => StepKind::Distinct,
            Step::Aggregate(_) => StepKind::Aggregate,
            Step::Order(_) => StepKind::Order,
            Step::Limit(_) => StepKind::Limit,
            Step::Unpivot(_) => StepKind::Unpivot,
            Step::UnpivotAtDistinct(_) => StepKind::UnpivotAtDistinct,
            Step::OutputPart(_) => StepKind::OutputPart,
            Step::OutputIndex(_) => StepKind::OutputIndex,
            Step::UnionMap(_) => StepKind::UnionMap,
            Step::NoOutput => StepKind::NoOutput,
            Step::DummyOutput => StepKind::DummyOutput,
        }
    }

    /// The upstream step, or `None` at a leaf.
    pub fn parent(&self) -> Option<&Step> {
        match self {
            Step::IterValue(s) => Some(&s.parent),
            Step::Filter(s) => Some(&s.parent),
            Step::Bind(s) => Some(&s.parent),
            Step::Distinct(s) => Some(&s.parent),
            Step::Aggregate(s) => Some(&s.parent),
            Step::Order(s) => Some(&s.parent),
            Step::Limit(s) => Some(&s.parent),
            Step::Unpivot(s) => Some(&s.parent),
            Step::UnpivotAtDistinct(s) => Some(&s.parent),
            Step::OutputPart(s) => Some(&s.parent),
            Step::OutputIndex(s) => Some(&s.parent),
            Step::IterTable(_) | Step::UnionMap(_) | Step::NoOutput | Step::DummyOutput => None,
        }
    }

    /// Mutable access to the upstream step.
    pub fn parent_mut(&mut self) -> Option<&mut Step> {
        match self {
            Step::IterValue(s) => Some(&mut s.parent),
            Step::Filter(s) => Some(&mut s.parent),
            Step::Bind(s) => Some(&mut s.parent),
            Step::Distinct(s) => Some(&mut s.parent),
            Step::Aggregate(s) => Some(&mut s.parent),
            Step::Order(s) => Some(&mut s.parent),
            Step::Limit(s) => Some(&mut s.parent),
            Step::Unpivot(s) => Some(&mut s.parent),
            Step::UnpivotAtDistinct(s) => Some(&mut s.parent),
            Step::OutputPart(s) => Some(&mut s.parent),
            Step::OutputIndex(s) => Some(&mut s.parent),
            Step::IterTable(_) | Step::UnionMap(_) | Step::NoOutput | Step::DummyOutput => None,
        }
    }

    /// Detach and return the upstream step, leaving a sentinel in place.
    pub fn take_parent(&mut self) -> Option<Box<Step>> {
        self.parent_mut()
            .map(|p| Box::new(std::mem::replace(p, Step::DummyOutput)))
    }

    /// Replace the upstream step.
    pub fn set_parent(&mut self, parent: Box<Step>) {
        if let Some(p) = self.parent_mut() {
            *p = *parent;
        }
    }

    /// Returns whether this step terminates a chain.
    pub fn is_leaf(&self) -> bool {
        self.parent().is_none()
    }

    /// The terminal step of the chain rooted at this step.
    pub fn leaf(&self) -> &Step {
        let mut cur = self;
        while let Some(p) = cur.parent() {
            cur = p;
        }
        cur
    }

    /// Apply `f` to every expression embedded in this single step (not
    /// its parents).
    pub fn map_exprs(&mut self, f: &mut dyn FnMut(Expr) -> Expr) {
        fn map_binding(b: &mut Binding, f: &mut dyn FnMut(Expr) -> Expr) {
            let expr = std::mem::replace(&mut b.expr, Expr::Null);
            b.expr = f(expr);
        }
        fn map_aggs(aggs: &mut [AggBinding], f: &mut dyn FnMut(Expr) -> Expr) {
            for a in aggs {
                if let Some(inner) = a.agg.inner.take() {
                    a.agg.inner = Some(f(inner));
                }
                if let Some(filter) = a.agg.filter.take() {
                    a.agg.filter = Some(f(filter));
                }
                if let Some(over) = &mut a.agg.over {
                    let parts = std::mem::take(&mut over.partition_by);
                    over.partition_by = parts.into_iter().map(&mut *f).collect();
                    for o in &mut over.order_by {
                        let col = std::mem::replace(&mut o.column, Expr::Null);
                        o.column = f(col);
                    }
                }
            }
        }
        match self {
            Step::IterTable(s) => {
                if let Some(cond) = s.filter.take() {
                    s.filter = Some(f(cond));
                }
                let eq = std::mem::take(&mut s.on_equal);
                s.on_equal = eq.into_iter().map(&mut *f).collect();
            }
            Step::IterValue(s) => {
                let v = std::mem::replace(&mut s.value, Expr::Null);
                s.value = f(v);
            }
            Step::Filter(s) => {
                let cond = std::mem::replace(&mut s.cond, Expr::Null);
                s.cond = f(cond);
            }
            Step::Bind(s) => {
                for b in &mut s.bindings {
                    map_binding(b, f);
                }
            }
            Step::Distinct(s) => {
                let cols = std::mem::take(&mut s.columns);
                s.columns = cols.into_iter().map(&mut *f).collect();
            }
            Step::Aggregate(s) => {
                map_aggs(&mut s.agg, f);
                map_aggs(&mut s.windows, f);
                for b in &mut s.group_by {
                    map_binding(b, f);
                }
            }
            Step::Order(s) => {
                for o in &mut s.columns {
                    let col = std::mem::replace(&mut o.column, Expr::Null);
                    o.column = f(col);
                }
            }
            Step::UnionMap(s) => {
                let by = std::mem::take(&mut s.partition_by);
                s.partition_by = by.into_iter().map(&mut *f).collect();
            }
            Step::OutputIndex(_)
            | Step::OutputPart(_)
            | Step::Limit(_)
            | Step::Unpivot(_)
            | Step::UnpivotAtDistinct(_)
            | Step::NoOutput
            | Step::DummyOutput => {}
        }
    }
}

/// A linear chain of relational steps plus its correlated-subquery
/// replacements and observable output description.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trace {
    /// The final step; parents chain down to the leaf.
    pub top: Step,
    /// Sub-traces substituted as values; `PARTITION_VALUE(i)` placeholders
    /// in the main chain refer to them by position.
    pub replacements: Vec<Trace>,
    /// Output column names with inferred type sets.
    pub final_bindings: Vec<(String, TypeSet)>,
}

impl Default for Step {
    fn default() -> Self {
        Step::DummyOutput
    }
}

impl Trace {
    /// Build a trace around a completed chain, computing final bindings
    /// with `hint`.
    pub fn new(top: Step, replacements: Vec<Trace>, hint: &dyn Hint) -> Trace {
        let final_bindings = output_bindings(&top, hint);
        Trace {
            top,
            replacements,
            final_bindings,
        }
    }

    /// The terminal step of the main chain.
    pub fn leaf(&self) -> &Step {
        self.top.leaf()
    }

    /// Recompute final binding types (names are preserved).
    pub fn retype(&mut self, hint: &dyn Hint) {
        self.final_bindings = output_bindings(&self.top, hint);
    }

    /// Apply `f` to every expression in every step of the main chain.
    pub fn map_exprs(&mut self, f: &mut dyn FnMut(Expr) -> Expr) {
        let mut cur = &mut self.top;
        loop {
            cur.map_exprs(f);
            match cur.parent_mut() {
                Some(p) => cur = p,
                None => break,
            }
        }
    }

    /// Iterate the chain from the final step down to the leaf.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        let mut next = Some(&self.top);
        std::iter::from_fn(move || {
            let cur = next?;
            next = cur.parent();
            Some(cur)
        })
    }
}

/// Compute the observable output columns of the chain ending at `step`.
fn output_bindings(step: &Step, hint: &dyn Hint) -> Vec<(String, TypeSet)> {
    match step {
        Step::Bind(s) => s
            .bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let name = b
                    .result()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("_{}", i + 1));
                (name, type_of(&b.expr, hint))
            })
            .collect(),
        Step::Aggregate(s) => {
            let mut out = Vec::new();
            for a in &s.agg {
                let e = Expr::Aggregate(Box::new(a.agg.clone()));
                out.push((a.result.clone(), type_of(&e, hint)));
            }
            for (i, b) in s.group_by.iter().enumerate() {
                let name = b
                    .result()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("_{}", i + 1));
                out.push((name, type_of(&b.expr, hint)));
            }
            for w in &s.windows {
                let e = Expr::Aggregate(Box::new(w.agg.clone()));
                out.push((w.result.clone(), type_of(&e, hint)));
            }
            out
        }
        Step::Filter(s) => output_bindings(&s.parent, hint),
        Step::Distinct(s) => output_bindings(&s.parent, hint),
        Step::Order(s) => output_bindings(&s.parent, hint),
        Step::Limit(s) => output_bindings(&s.parent, hint),
        Step::OutputPart(s) => output_bindings(&s.parent, hint),
        Step::OutputIndex(s) => output_bindings(&s.parent, hint),
        Step::IterValue(s) => {
            let mut out = output_bindings(&s.parent, hint);
            out.push((s.result.clone(), TypeSet::ANY));
            out
        }
        Step::Unpivot(s) => {
            let mut out = Vec::new();
            if let Some(v) = &s.as_name {
                out.push((v.clone(), TypeSet::ANY));
            }
            if let Some(k) = &s.at_name {
                out.push((k.clone(), TypeSet::STRING | TypeSet::SYMBOL));
            }
            out
        }
        Step::UnpivotAtDistinct(s) => {
            vec![(s.at_name.clone(), TypeSet::STRING | TypeSet::SYMBOL)]
        }
        Step::UnionMap(s) => s.child.final_bindings.clone(),
        // wildcard scans and sentinels have no fixed column set
        Step::IterTable(_) | Step::NoOutput | Step::DummyOutput => Vec::new(),
    }
}

/// Compute output bindings for a chain with no external hints.
pub fn untyped_output_bindings(step: &Step) -> Vec<(String, TypeSet)> {
    output_bindings(step, &NoHint)
}

#[cfg(test)]
mod tests {
    use super::{BindStep, FilterStep, IterTable, Step, StepKind, Trace};
    use opal_expr::{Binding, CmpOp, Expr, NoHint};

    fn scan(table: &str) -> Step {
        Step::IterTable(IterTable {
            table: Binding::auto(Expr::ident(table)),
            filter: None,
            fields: vec![],
            wildcard: false,
            on_equal: vec![],
        })
    }

    fn chain() -> Step {
        Step::Bind(BindStep {
            bindings: vec![Binding::auto(Expr::ident("x"))],
            parent: Box::new(Step::Filter(FilterStep {
                cond: Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
                parent: Box::new(scan("input")),
            })),
        })
    }

    #[test]
    fn chain_navigation() {
        let top = chain();
        assert_eq!(top.kind(), StepKind::Bind);
        assert_eq!(top.parent().unwrap().kind(), StepKind::Filter);
        assert_eq!(top.leaf().kind(), StepKind::IterTable);

        let t = Trace::new(top, vec![], &NoHint);
        let kinds: Vec<StepKind> = t.steps().map(Step::kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::Bind, StepKind::Filter, StepKind::IterTable]
        );
    }

    #[test]
    fn final_bindings_come_from_the_top() {
        let t = Trace::new(chain(), vec![], &NoHint);
        assert_eq!(t.final_bindings.len(), 1);
        assert_eq!(t.final_bindings[0].0, "x");
    }

    #[test]
    fn take_parent_leaves_a_sentinel() {
        let mut top = chain();
        let parent = top.take_parent().unwrap();
        assert_eq!(parent.kind(), StepKind::Filter);
        assert_eq!(top.parent().unwrap().kind(), StepKind::DummyOutput);
    }
}
