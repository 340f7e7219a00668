use crate::node::{Expr, Order};
use crate::path::Binding;

/// `EXPLAIN` output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExplainFormat {
    /// Not an explain query.
    #[default]
    None,
    /// One text blob.
    Text,
    /// One line of plan text per row.
    List,
    /// Graphviz dot output.
    Graphviz,
}

/// Join flavor for `FROM` sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Comma / `CROSS JOIN`: the right side iterates relative to the left.
    Cross,
    /// `INNER JOIN ... ON`.
    Inner,
}

/// A `FROM` clause source.
#[derive(Debug, Clone, PartialEq)]
pub enum From {
    /// A single table; the binding expression is the table path.
    Table(Binding),
    /// A join; the right side unnests relative to the rows produced by the
    /// left side.
    Join {
        /// Join flavor.
        kind: JoinKind,
        /// `ON` predicate; `None` for cross joins.
        on: Option<Expr>,
        /// Left input.
        left: Box<From>,
        /// Right binding.
        right: Binding,
    },
}

impl From {
    /// The leftmost table binding of this source tree.
    pub fn base_table(&self) -> &Binding {
        match self {
            From::Table(b) => b,
            From::Join { left, .. } => left.base_table(),
        }
    }
}

/// A `SELECT` statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    /// `SELECT DISTINCT`.
    pub distinct: bool,
    /// Output columns; a single `*` binding selects everything.
    pub columns: Vec<Binding>,
    /// `FROM` clause; `None` produces a single empty row.
    pub from: Option<From>,
    /// `WHERE` predicate.
    pub where_clause: Option<Expr>,
    /// `GROUP BY` terms.
    pub group_by: Vec<Binding>,
    /// `HAVING` predicate.
    pub having: Option<Expr>,
    /// `ORDER BY` terms.
    pub order_by: Vec<Order>,
    /// `LIMIT` row count.
    pub limit: Option<u64>,
    /// `OFFSET` row count.
    pub offset: Option<u64>,
}

impl Select {
    fn each_expr<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        for b in &self.columns {
            f(&b.expr);
        }
        let mut from = self.from.as_ref();
        while let Some(src) = from {
            match src {
                From::Table(b) => {
                    f(&b.expr);
                    from = None;
                }
                From::Join { on, left, right, .. } => {
                    if let Some(on) = on {
                        f(on);
                    }
                    f(&right.expr);
                    from = Some(left.as_ref());
                }
            }
        }
        if let Some(w) = &self.where_clause {
            f(w);
        }
        for b in &self.group_by {
            f(&b.expr);
        }
        if let Some(h) = &self.having {
            f(h);
        }
        for o in &self.order_by {
            f(&o.column);
        }
    }

    /// Walk every expression in the statement with `f` (pre-order, as in
    /// [`Expr::walk`]).
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr) -> bool) {
        self.each_expr(&mut |e| e.walk(f));
    }

    /// Rebuild the statement with every embedded expression replaced by
    /// `f(expr)`.
    pub fn map_exprs(mut self, f: &mut dyn FnMut(Expr) -> Expr) -> Select {
        fn map_binding(b: Binding, f: &mut dyn FnMut(Expr) -> Expr) -> Binding {
            let name = b.explicit_result().map(str::to_string);
            let expr = f(b.expr);
            match name {
                Some(n) => Binding::bind(expr, n),
                None => Binding::auto(expr),
            }
        }
        fn map_from(src: From, f: &mut dyn FnMut(Expr) -> Expr) -> From {
            match src {
                From::Table(b) => From::Table(map_binding(b, f)),
                From::Join { kind, on, left, right } => From::Join {
                    kind,
                    on: on.map(&mut *f),
                    left: Box::new(map_from(*left, f)),
                    right: map_binding(right, f),
                },
            }
        }
        self.columns = self
            .columns
            .into_iter()
            .map(|b| map_binding(b, f))
            .collect();
        self.from = self.from.map(|src| map_from(src, f));
        self.where_clause = self.where_clause.map(&mut *f);
        self.group_by = self
            .group_by
            .into_iter()
            .map(|b| map_binding(b, f))
            .collect();
        self.having = self.having.map(&mut *f);
        for o in &mut self.order_by {
            let col = std::mem::replace(&mut o.column, Expr::Null);
            o.column = f(col);
        }
        self
    }
}

/// A complete parsed query, as handed to the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// `INTO` destination path (`db.table`), if any.
    pub into: Option<Expr>,
    /// Query body: a [`Select`] or [`crate::Union`] expression.
    pub body: Expr,
    /// Explain mode.
    pub explain: ExplainFormat,
}

impl Query {
    /// A plain query over `body` with no INTO and no EXPLAIN.
    pub fn new(body: Select) -> Query {
        Query {
            into: None,
            body: Expr::Select(Box::new(body)),
            explain: ExplainFormat::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{From, JoinKind, Select};
    use crate::node::Expr;
    use crate::path::Binding;

    fn sample() -> Select {
        Select {
            columns: vec![Binding::auto(Expr::ident("x"))],
            from: Some(From::Join {
                kind: JoinKind::Cross,
                on: None,
                left: Box::new(From::Table(Binding::auto(Expr::ident("input")))),
                right: Binding::bind(Expr::dot(Expr::ident("input"), "list"), "item"),
            }),
            where_clause: Some(Expr::cmp(
                crate::node::CmpOp::Greater,
                Expr::ident("x"),
                Expr::Integer(5),
            )),
            ..Select::default()
        }
    }

    #[test]
    fn base_table_follows_left_spine() {
        let s = sample();
        let base = s.from.as_ref().unwrap().base_table();
        assert_eq!(base.expr, Expr::ident("input"));
    }

    #[test]
    fn map_exprs_preserves_binding_names() {
        let s = sample();
        let mapped = s.map_exprs(&mut |e| e);
        let Some(From::Join { right, .. }) = &mapped.from else {
            panic!("expected join");
        };
        assert_eq!(right.result(), Some("item"));
    }

    #[test]
    fn walk_visits_all_clauses() {
        let s = sample();
        let mut idents = Vec::new();
        s.walk(&mut |e| {
            if let Expr::Ident(name) = e {
                idents.push(name.clone());
            }
            true
        });
        assert!(idents.contains(&"x".to_string()));
        assert!(idents.contains(&"input".to_string()));
    }
}
