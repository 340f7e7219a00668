//! AST to trace lowering.
//!
//! Clause order, bottom (leaf) to top: scan, WHERE filters (decomposed
//! into top-level conjunctions), unnests and joins-as-unnests, group-by
//! plus aggregates (with window functions split out), HAVING, ORDER BY,
//! OFFSET+LIMIT, projection, DISTINCT, and finally the `INTO` output
//! steps. Scalar subqueries hoist into trace replacements and their use
//! sites become `PARTITION_VALUE(i)` placeholders.

use std::collections::{BTreeSet, HashSet};

use uuid::Uuid;

use opal_common::{Error, Result};
use opal_expr::{
    flat_path, Aggregate, Binding, BuiltinOp, Expr, From, JoinKind, NoHint, Order, Query, Select,
};

use crate::env::Env;
use crate::trace::{
    AggBinding, AggregateStep, BindStep, DistinctStep, FilterStep, IterTable, IterValue,
    LimitStep, OrderStep, OutputIndexStep, OutputPartStep, Step, Trace, UnpivotStep,
};

/// Lower a parsed query into a trace.
pub fn build(q: &Query, env: &dyn Env) -> Result<Trace> {
    match &q.body {
        Expr::Select(sel) => build_select(sel, q.into.as_ref(), env),
        Expr::Union(_) => Err(Error::NotSupported(
            "UNION queries are not planned by this layer".to_string(),
        )),
        other => Err(Error::InvalidArgument(format!(
            "query body must be a SELECT, got {other}"
        ))),
    }
}

/// Decompose `e` into its top-level AND conjunctions, preserving source
/// order.
pub fn conjunctions(e: &Expr, out: &mut Vec<Expr>) {
    match e {
        Expr::Logical {
            op: opal_expr::LogicalOp::And,
            left,
            right,
        } => {
            conjunctions(left, out);
            conjunctions(right, out);
        }
        other => out.push(other.clone()),
    }
}

/// Conjoin a non-empty list of predicates back into one expression.
pub fn conjoin(list: Vec<Expr>) -> Expr {
    let mut iter = list.into_iter();
    let first = iter.next().expect("conjoin of empty list");
    iter.fold(first, Expr::and)
}

struct Builder<'a> {
    env: &'a dyn Env,
    replacements: Vec<Trace>,
    /// Binding name of the scanned table, when the source is a plain table.
    table_name: Option<String>,
    /// Names introduced above the scan (unnest results, aggregate and
    /// group outputs); references to them are not scan fields.
    scope: HashSet<String>,
    fields: BTreeSet<String>,
    wildcard: bool,
}

fn build_select(sel: &Select, into: Option<&Expr>, env: &dyn Env) -> Result<Trace> {
    let mut b = Builder {
        env,
        replacements: Vec::new(),
        table_name: None,
        scope: HashSet::new(),
        fields: BTreeSet::new(),
        wildcard: false,
    };
    let step = b.lower(sel, into)?;
    let table_expr = match step.leaf() {
        Step::IterTable(it) => Some(it.table.expr.clone()),
        _ => None,
    };
    let mut step = step;
    b.store_leaf_hints(&mut step);

    let schema = table_expr.as_ref().and_then(|t| env.schema(t));
    let hint = schema.unwrap_or(&NoHint);
    Ok(Trace::new(step, b.replacements, hint))
}

impl<'a> Builder<'a> {
    fn lower(&mut self, sel: &Select, into: Option<&Expr>) -> Result<Step> {
        // scan + unnests
        let mut step = match &sel.from {
            None => Step::DummyOutput,
            Some(from) => self.lower_from(from)?,
        };

        // WHERE, one filter per top-level conjunction; the rewrite rules
        // merge them back and choose the pushdown site
        if let Some(cond) = &sel.where_clause {
            let cond = self.hoist(cond.clone())?;
            self.collect(&cond);
            let mut conj = Vec::new();
            conjunctions(&cond, &mut conj);
            for c in conj {
                step = Step::Filter(FilterStep {
                    cond: c,
                    parent: Box::new(step),
                });
            }
        }

        let mut columns: Vec<Binding> = Vec::new();
        let mut star = false;
        for b in &sel.columns {
            if matches!(b.expr, Expr::Star) {
                star = true;
            }
            columns.push(b.clone());
        }
        if star && (columns.len() != 1 || sel.distinct) {
            return Err(Error::NotSupported(
                "'*' mixed with other projections".to_string(),
            ));
        }

        // aggregation
        let grouped = !sel.group_by.is_empty();
        let has_aggregates = grouped
            || columns.iter().any(|b| contains_aggregate(&b.expr))
            || sel.having.as_ref().is_some_and(contains_aggregate)
            || sel.order_by.iter().any(|o| contains_aggregate(&o.column));

        let mut aggs: Vec<AggBinding> = Vec::new();
        let mut group_bindings: Vec<Binding> = Vec::new();
        if has_aggregates {
            for (i, g) in sel.group_by.iter().enumerate() {
                let name = match g.result() {
                    Some(n) => n.to_string(),
                    None => format!("$_group{i}"),
                };
                self.collect(&g.expr);
                group_bindings.push(Binding::bind(g.expr.clone(), name));
            }

            // gather aggregate expressions from every clause that may
            // carry them; result columns that are bare aggregates keep
            // their alias
            for b in &columns {
                if let Expr::Aggregate(a) = &b.expr {
                    let name = b
                        .result()
                        .map(str::to_string)
                        .unwrap_or_else(|| a.op.default_result().to_string());
                    self.record_aggregate(a, Some(name), &mut aggs)?;
                } else {
                    self.record_nested_aggregates(&b.expr, &mut aggs)?;
                }
            }
            if let Some(h) = &sel.having {
                self.record_nested_aggregates(h, &mut aggs)?;
            }
            for o in &sel.order_by {
                self.record_nested_aggregates(&o.column, &mut aggs)?;
            }

            let (plain, windows): (Vec<AggBinding>, Vec<AggBinding>) =
                aggs.clone().into_iter().partition(|a| a.agg.over.is_none());
            for w in &windows {
                if w.agg.op.window_only() && w.agg.over.is_none() {
                    return Err(Error::InvalidArgument(format!(
                        "{} requires an OVER clause",
                        w.agg.op.name()
                    )));
                }
            }
            for a in &plain {
                if a.agg.op.window_only() {
                    return Err(Error::InvalidArgument(format!(
                        "{} requires an OVER clause",
                        a.agg.op.name()
                    )));
                }
            }

            for a in &aggs {
                self.scope.insert(a.result.clone());
            }
            for g in &group_bindings {
                if let Some(n) = g.result() {
                    self.scope.insert(n.to_string());
                }
            }

            step = Step::Aggregate(AggregateStep {
                agg: plain,
                windows,
                group_by: group_bindings.clone(),
                parent: Box::new(step),
            });
        }

        let rewrite_outputs = |e: &Expr| -> Expr {
            if !has_aggregates {
                return e.clone();
            }
            rebind_aggregates(e.clone(), &aggs, &group_bindings)
        };

        // HAVING
        if let Some(h) = &sel.having {
            if !has_aggregates {
                return Err(Error::InvalidArgument(
                    "HAVING without aggregation".to_string(),
                ));
            }
            let cond = self.hoist(rewrite_outputs(h))?;
            self.collect(&cond);
            step = Step::Filter(FilterStep {
                cond,
                parent: Box::new(step),
            });
        }

        // the projected output columns, with aggregates and group keys
        // replaced by references to their bound names
        let mut out_columns: Vec<Binding> = Vec::new();
        if !star {
            for (i, b) in columns.iter().enumerate() {
                let expr = self.hoist(rewrite_outputs(&b.expr))?;
                self.collect(&expr);
                let name = match b.result() {
                    Some(n) => n.to_string(),
                    None => format!("_{}", i + 1),
                };
                out_columns.push(Binding::bind(expr, name));
            }
        }

        // ORDER BY; select aliases are visible to the sort keys even
        // though the projection step sits above the sort
        if !sel.order_by.is_empty() {
            let mut cols = Vec::new();
            for o in &sel.order_by {
                let mut col = rewrite_outputs(&o.column);
                if let Expr::Ident(name) = &col {
                    let mut replacement = None;
                    for c in &out_columns {
                        if c.result() == Some(name.as_str()) && !matches!(c.expr, Expr::Ident(_)) {
                            replacement = Some(c.expr.clone());
                        }
                    }
                    if let Some(r) = replacement {
                        col = r;
                    }
                }
                self.collect(&col);
                cols.push(Order {
                    column: col,
                    desc: o.desc,
                    nulls_last: o.nulls_last,
                });
            }
            step = Step::Order(OrderStep {
                columns: cols,
                parent: Box::new(step),
            });
        }

        // OFFSET + LIMIT
        match (sel.limit, sel.offset) {
            (Some(limit), offset) => {
                step = Step::Limit(LimitStep {
                    count: limit,
                    offset: offset.unwrap_or(0),
                    parent: Box::new(step),
                });
            }
            (None, Some(_)) => {
                return Err(Error::NotSupported("OFFSET without LIMIT".to_string()));
            }
            (None, None) => {}
        }

        // projection
        if star {
            self.wildcard = true;
        } else if !is_identity_projection(&out_columns, &step) {
            step = Step::Bind(BindStep {
                bindings: out_columns.clone(),
                parent: Box::new(step),
            });
        }

        // DISTINCT
        if sel.distinct {
            let columns = out_columns
                .iter()
                .filter_map(|b| b.result().map(Expr::ident))
                .collect();
            step = Step::Distinct(DistinctStep {
                columns,
                parent: Box::new(step),
            });
        }

        // INTO
        if let Some(dest) = into {
            let parts = flat_path(dest).ok_or_else(|| {
                Error::InvalidArgument(format!("invalid INTO destination {dest}"))
            })?;
            if parts.len() != 2 {
                return Err(Error::InvalidArgument(format!(
                    "INTO destination must be db.table, got {dest}"
                )));
            }
            let basename = format!("{}/{}/{}", parts[0], parts[1], Uuid::new_v4());
            step = Step::OutputPart(OutputPartStep {
                basename: basename.clone(),
                parent: Box::new(step),
            });
            step = Step::OutputIndex(OutputIndexStep {
                table: dest.clone(),
                basename,
                parent: Box::new(step),
            });
        }

        Ok(step)
    }

    fn lower_from(&mut self, from: &From) -> Result<Step> {
        match from {
            From::Table(b) => self.lower_table(b),
            From::Join {
                kind,
                on,
                left,
                right,
            } => {
                let step = self.lower_from(left)?;
                let name = right.result().ok_or_else(|| {
                    Error::InvalidArgument(format!("join source {} needs a binding name", right))
                })?;
                let value = self.hoist(right.expr.clone())?;
                self.collect(&value);
                let name = name.to_string();
                self.scope.insert(name.clone());
                let mut step = Step::IterValue(IterValue {
                    value,
                    result: name,
                    parent: Box::new(step),
                });
                match (kind, on) {
                    (JoinKind::Inner, Some(cond)) => {
                        let cond = self.hoist(cond.clone())?;
                        self.collect(&cond);
                        step = Step::Filter(FilterStep {
                            cond,
                            parent: Box::new(step),
                        });
                    }
                    (JoinKind::Inner, None) => {
                        return Err(Error::InvalidArgument(
                            "INNER JOIN requires an ON predicate".to_string(),
                        ));
                    }
                    (JoinKind::Cross, _) => {}
                }
                Ok(step)
            }
        }
    }

    fn lower_table(&mut self, b: &Binding) -> Result<Step> {
        // UNPIVOT sources wrap the scan of their operand
        if let Expr::Unpivot(u) = &b.expr {
            let inner = Binding::auto(u.inner.clone());
            let scan = self.lower_plain_table(&inner)?;
            if u.as_name.is_none() && u.at_name.is_none() {
                return Err(Error::InvalidArgument(
                    "UNPIVOT requires AS or AT".to_string(),
                ));
            }
            // the unpivot consumes whole rows
            self.wildcard = true;
            for n in [&u.as_name, &u.at_name].into_iter().flatten() {
                self.scope.insert(n.clone());
            }
            return Ok(Step::Unpivot(UnpivotStep {
                as_name: u.as_name.clone(),
                at_name: u.at_name.clone(),
                parent: Box::new(scan),
            }));
        }
        self.lower_plain_table(b)
    }

    fn lower_plain_table(&mut self, b: &Binding) -> Result<Step> {
        if !opal_expr::is_path(&b.expr) {
            return Err(Error::NotSupported(format!(
                "cannot iterate over table expression {}",
                b.expr
            )));
        }
        let name = b.result().ok_or_else(|| {
            Error::InvalidArgument(format!("table source {} needs a binding name", b.expr))
        })?;
        self.table_name = Some(name.to_string());
        Ok(Step::IterTable(IterTable {
            table: b.clone(),
            filter: None,
            fields: vec![],
            wildcard: false,
            on_equal: vec![],
        }))
    }

    /// Hoist scalar subqueries out of `e`, replacing each use site with a
    /// `PARTITION_VALUE(i)` placeholder over the replacement index.
    fn hoist(&mut self, e: Expr) -> Result<Expr> {
        if let Expr::Select(sub) = e {
            let t = build_select(&sub, None, self.env)?;
            let idx = self.replacements.len() as i64;
            self.replacements.push(t);
            return Ok(Expr::call(
                BuiltinOp::PartitionValue,
                vec![Expr::Integer(idx)],
            ));
        }
        let mut err: Option<Error> = None;
        let out = e.map_children(&mut |c| {
            if err.is_some() {
                return c;
            }
            let keep = c.clone();
            match self.hoist(c) {
                Ok(v) => v,
                Err(e) => {
                    err = Some(e);
                    keep
                }
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    fn record_aggregate(
        &mut self,
        a: &Aggregate,
        name: Option<String>,
        aggs: &mut Vec<AggBinding>,
    ) -> Result<()> {
        if let Some(inner) = &a.inner {
            match inner {
                Expr::Star => {
                    if !a.op.accepts_star() {
                        return Err(Error::InvalidArgument(format!(
                            "{} cannot be applied to '*'",
                            a.op.name()
                        )));
                    }
                }
                other => self.collect(other),
            }
        }
        if let Some(f) = &a.filter {
            self.collect(f);
        }
        if let Some(over) = &a.over {
            for p in &over.partition_by {
                self.collect(p);
            }
            for o in &over.order_by {
                self.collect(&o.column);
            }
        }
        let existing = aggs
            .iter()
            .find(|x| x.agg == *a)
            .map(|x| x.result.clone());
        match (existing, name) {
            // an unnamed duplicate reuses the existing output column
            (Some(_), None) => {}
            (Some(result), Some(name)) if result == name => {}
            // an aliased duplicate still gets its own output column
            (_, name) => {
                let result = name.unwrap_or_else(|| format!("$_agg{}", aggs.len()));
                aggs.push(AggBinding {
                    agg: a.clone(),
                    result,
                });
            }
        }
        Ok(())
    }

    fn record_nested_aggregates(
        &mut self,
        e: &Expr,
        aggs: &mut Vec<AggBinding>,
    ) -> Result<()> {
        let mut found: Vec<Aggregate> = Vec::new();
        e.walk(&mut |n| {
            if let Expr::Aggregate(a) = n {
                found.push((**a).clone());
                return false;
            }
            true
        });
        for a in found {
            self.record_aggregate(&a, None, aggs)?;
        }
        Ok(())
    }

    /// Record which scan fields `e` references, or flip the wildcard when
    /// it touches whole rows.
    fn collect(&mut self, e: &Expr) {
        let table = self.table_name.clone();
        let scope = &self.scope;
        let fields = &mut self.fields;
        let wildcard = &mut self.wildcard;
        e.walk(&mut |n| {
            if matches!(n, Expr::Star) {
                *wildcard = true;
                return false;
            }
            if matches!(n, Expr::Select(_)) {
                // subqueries scan their own tables
                return false;
            }
            if !opal_expr::is_path(n) {
                return true;
            }
            if let Some(parts) = path_spine(n) {
                let root = parts[0].as_str();
                if scope.contains(root) {
                    return false;
                }
                if table.as_deref() == Some(root) {
                    if parts.len() == 1 {
                        *wildcard = true;
                    } else {
                        fields.insert(parts[1..].join("."));
                    }
                } else {
                    fields.insert(parts.join("."));
                }
            }
            false
        });
    }

    /// Move the accumulated field set onto the leaf scan.
    fn store_leaf_hints(&mut self, top: &mut Step) {
        let fields: Vec<String> = self.fields.iter().cloned().collect();
        let mut cur = top;
        loop {
            if let Step::IterTable(it) = cur {
                it.wildcard = self.wildcard;
                if !self.wildcard {
                    it.fields = fields;
                }
                return;
            }
            match cur.parent_mut() {
                Some(p) => cur = p,
                None => return,
            }
        }
    }
}

/// The dotted prefix of a path expression, truncated at the first index
/// operation: `a.b[0].c` yields `["a", "b"]`.
fn path_spine(e: &Expr) -> Option<Vec<String>> {
    fn walk(e: &Expr) -> Option<(Vec<String>, bool)> {
        match e {
            Expr::Ident(name) => Some((vec![name.clone()], true)),
            Expr::Dot { inner, field } => {
                let (mut parts, exact) = walk(inner)?;
                if exact {
                    parts.push(field.clone());
                }
                Some((parts, exact))
            }
            Expr::Index { inner, .. } => {
                let (parts, _) = walk(inner)?;
                Some((parts, false))
            }
            _ => None,
        }
    }
    walk(e).map(|(parts, _)| parts)
}

fn contains_aggregate(e: &Expr) -> bool {
    let mut found = false;
    e.walk(&mut |n| {
        match n {
            Expr::Aggregate(_) => {
                found = true;
                false
            }
            // aggregates inside a subquery belong to the subquery
            Expr::Select(_) => false,
            _ => !found,
        }
    });
    found
}

/// Replace aggregate expressions and group-key expressions with
/// references to their bound output names.
fn rebind_aggregates(e: Expr, aggs: &[AggBinding], groups: &[Binding]) -> Expr {
    e.rewrite_with(&mut |n| {
        if let Expr::Aggregate(a) = &n {
            for rec in aggs {
                if rec.agg == **a {
                    return Expr::ident(rec.result.clone());
                }
            }
        }
        for g in groups {
            if g.expr == n {
                if let Some(name) = g.result() {
                    return Expr::ident(name);
                }
            }
        }
        n
    })
}

/// Returns whether `columns` merely re-selects the step's own outputs
/// (as a set), making a projection step pointless.
fn is_identity_projection(columns: &[Binding], step: &Step) -> bool {
    if columns.is_empty() {
        return false;
    }
    let outputs = crate::trace::untyped_output_bindings(step);
    if outputs.len() != columns.len() {
        return false;
    }
    let names: HashSet<&str> = outputs.iter().map(|(n, _)| n.as_str()).collect();
    let mut seen = HashSet::new();
    columns.iter().all(|b| match (&b.expr, b.result()) {
        (Expr::Ident(i), Some(out)) => i == out && names.contains(i.as_str()) && seen.insert(i),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::build;
    use crate::env::{Env, TableHandle};
    use crate::op::Hints;
    use crate::trace::{Step, StepKind};
    use opal_common::Result;
    use opal_expr::{Binding, CmpOp, Expr, From, Query, Select};
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

    fn select(sel: Select) -> Query {
        Query::new(sel)
    }

    #[test]
    fn where_decomposes_into_stacked_filters() {
        let q = select(Select {
            columns: vec![Binding::auto(Expr::ident("x"))],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            where_clause: Some(Expr::and(
                Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
                Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3)),
            )),
            ..Select::default()
        });
        let t = build(&q, &TestEnv).unwrap();
        let kinds: Vec<StepKind> = t.steps().map(Step::kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Bind,
                StepKind::Filter,
                StepKind::Filter,
                StepKind::IterTable
            ]
        );
        // leaf fields were computed from the referenced identifiers
        let Step::IterTable(it) = t.leaf() else {
            panic!("expected table leaf");
        };
        assert_eq!(it.fields, vec!["x".to_string(), "y".to_string()]);
        assert!(!it.wildcard);
    }

    #[test]
    fn select_star_sets_the_wildcard() {
        let q = select(Select {
            columns: vec![Binding::auto(Expr::Star)],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        let t = build(&q, &TestEnv).unwrap();
        let Step::IterTable(it) = &t.top else {
            panic!("expected bare scan, got {:?}", t.top);
        };
        assert!(it.wildcard);
    }

    #[test]
    fn count_star_does_not_require_fields() {
        let q = select(Select {
            columns: vec![Binding::auto(Expr::count_star())],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            ..Select::default()
        });
        let t = build(&q, &TestEnv).unwrap();
        assert_eq!(t.top.kind(), StepKind::Aggregate);
        let Step::IterTable(it) = t.leaf() else {
            panic!("expected table leaf");
        };
        assert!(!it.wildcard);
        assert!(it.fields.is_empty());
        assert_eq!(t.final_bindings.len(), 1);
        assert_eq!(t.final_bindings[0].0, "count");
    }

    #[test]
    fn grouped_aggregates_bind_select_aliases() {
        let q = select(Select {
            columns: vec![
                Binding::auto(Expr::ident("category")),
                Binding::bind(
                    Expr::aggregate(
                        opal_expr::AggregateOp::BoolAnd,
                        Some(Expr::ident("a")),
                    ),
                    "a_and",
                ),
            ],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            group_by: vec![Binding::auto(Expr::ident("category"))],
            ..Select::default()
        });
        let t = build(&q, &TestEnv).unwrap();
        // projection is an identity re-select of the aggregate outputs
        assert_eq!(t.top.kind(), StepKind::Aggregate);
        let names: Vec<&str> = t.final_bindings.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a_and", "category"]);
    }

    #[test]
    fn offset_without_limit_is_rejected() {
        let q = select(Select {
            columns: vec![Binding::auto(Expr::ident("x"))],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            offset: Some(3),
            ..Select::default()
        });
        let err = build(&q, &TestEnv).unwrap_err();
        assert!(err.to_string().contains("OFFSET without LIMIT"));
    }

    #[test]
    fn scalar_subqueries_hoist_into_replacements() {
        let sub = Select {
            columns: vec![Binding::bind(Expr::Integer(3), "v")],
            ..Select::default()
        };
        let q = select(Select {
            columns: vec![Binding::auto(Expr::ident("x"))],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            where_clause: Some(Expr::cmp(
                CmpOp::Greater,
                Expr::ident("x"),
                Expr::Select(Box::new(sub)),
            )),
            ..Select::default()
        });
        let t = build(&q, &TestEnv).unwrap();
        assert_eq!(t.replacements.len(), 1);
        let mut saw_placeholder = false;
        for s in t.steps() {
            if let Step::Filter(f) = s {
                f.cond.walk(&mut |n| {
                    if let Expr::Builtin {
                        func: opal_expr::BuiltinOp::PartitionValue,
                        ..
                    } = n
                    {
                        saw_placeholder = true;
                    }
                    true
                });
            }
        }
        assert!(saw_placeholder);
    }

    #[test]
    fn order_by_select_alias_resolves() {
        let q = select(Select {
            columns: vec![Binding::bind(
                Expr::arith(
                    opal_expr::ArithOp::Add,
                    Expr::ident("x"),
                    Expr::Integer(1),
                ),
                "y",
            )],
            from: Some(From::Table(Binding::auto(Expr::ident("input")))),
            order_by: vec![opal_expr::Order {
                column: Expr::ident("y"),
                desc: false,
                nulls_last: false,
            }],
            ..Select::default()
        });
        let t = build(&q, &TestEnv).unwrap();
        let order = t
            .steps()
            .find_map(|s| match s {
                Step::Order(o) => Some(o),
                _ => None,
            })
            .expect("order step");
        assert_eq!(
            order.columns[0].column,
            Expr::arith(
                opal_expr::ArithOp::Add,
                Expr::ident("x"),
                Expr::Integer(1)
            )
        );
    }
}
