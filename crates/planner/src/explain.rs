//! Text rendering of plan trees.

use std::fmt::Write;

use opal_expr::{to_text, Order};

use crate::op::{Node, Op, Tree};

fn order_term(o: &Order) -> String {
    let mut s = to_text(&o.column);
    s.push_str(if o.desc { " DESC" } else { " ASC" });
    if o.nulls_last {
        s.push_str(" NULLS LAST");
    } else {
        s.push_str(" NULLS FIRST");
    }
    s
}

fn comma<T>(items: &[T], f: impl Fn(&T) -> String) -> String {
    items.iter().map(f).collect::<Vec<_>>().join(", ")
}

/// One-line description of a single operator.
pub fn op_line(op: &Op) -> String {
    match op {
        Op::Leaf(x) => format!("ITERATE {}", x.orig),
        Op::Filter(x) => format!("FILTER {}", to_text(&x.cond)),
        Op::Project(x) => format!("PROJECT {}", comma(&x.using, |b| b.to_string())),
        Op::Distinct(x) => {
            let mut s = format!("DISTINCT {}", comma(&x.fields, to_text));
            if let Some(limit) = x.limit {
                let _ = write!(s, " LIMIT {limit}");
            }
            s
        }
        Op::Limit(x) => format!("LIMIT {}", x.num),
        Op::OrderBy(x) => {
            let mut s = format!("ORDER BY {}", comma(&x.columns, order_term));
            if let Some(limit) = x.limit {
                let _ = write!(s, " LIMIT {limit}");
            }
            if x.offset != 0 {
                let _ = write!(s, " OFFSET {}", x.offset);
            }
            s
        }
        Op::HashAggregate(x) => {
            let mut s = format!(
                "AGGREGATE {}",
                comma(&x.agg, |a| format!(
                    "{} AS {}",
                    to_text(&opal_expr::Expr::Aggregate(Box::new(a.agg.clone()))),
                    a.result
                ))
            );
            if !x.windows.is_empty() {
                let _ = write!(
                    s,
                    " WINDOWS {}",
                    comma(&x.windows, |a| format!(
                        "{} AS {}",
                        to_text(&opal_expr::Expr::Aggregate(Box::new(a.agg.clone()))),
                        a.result
                    ))
                );
            }
            let _ = write!(s, " BY {}", comma(&x.by, |b| b.to_string()));
            if let Some(limit) = x.limit {
                let _ = write!(s, " LIMIT {limit}");
            }
            s
        }
        Op::SimpleAggregate(x) => format!(
            "AGGREGATE {}",
            comma(&x.outputs, |a| format!(
                "{} AS {}",
                to_text(&opal_expr::Expr::Aggregate(Box::new(a.agg.clone()))),
                a.result
            ))
        ),
        Op::CountStar(x) => format!("COUNT(*) AS {}", x.result),
        Op::UnionMap(_) => "UNION MAP".to_string(),
        Op::UnionPartition(x) => {
            format!("UNION PARTITION BY {}", comma(&x.by, to_text))
        }
        Op::Unnest(x) => format!("ITERATE FIELD {} AS {}", to_text(&x.expr), x.result),
        Op::Unpivot(x) => {
            let mut s = "UNPIVOT".to_string();
            if let Some(v) = &x.as_name {
                let _ = write!(s, " AS {v}");
            }
            if let Some(k) = &x.at_name {
                let _ = write!(s, " AT {k}");
            }
            s
        }
        Op::UnpivotAtDistinct(x) => format!("UNPIVOT AT {} GROUP BY {}", x.at_name, x.at_name),
        Op::Substitute(x) => format!("SUBSTITUTE ({} replacements)", x.inner.len()),
        Op::OutputPart(x) => format!("OUTPUT PART {}", x.basename),
        Op::OutputIndex(x) => format!("OUTPUT INDEX {}.{}", x.db, x.table),
        Op::Explain(_) => "EXPLAIN".to_string(),
        Op::NoOutput => "NO OUTPUT".to_string(),
        Op::DummyOutput => "[{}]".to_string(),
    }
}

fn chain_lines(op: &Op, indent: usize, out: &mut Vec<String>) {
    // render in execution order: leaf first
    if let Some(from) = op.from_op() {
        chain_lines(from, indent, out);
    }
    out.push(format!("{}{}", "\t".repeat(indent), op_line(op)));
    match op {
        Op::UnionMap(_) | Op::UnionPartition(_) => {}
        Op::Substitute(x) => {
            for (i, n) in x.inner.iter().enumerate() {
                out.push(format!("{}WITH REPLACEMENT({i}):", "\t".repeat(indent + 1)));
                node_lines(n, indent + 2, out);
            }
        }
        Op::Explain(x) => {
            node_lines(&x.tree.root, indent + 1, out);
        }
        _ => {}
    }
}

fn node_lines(node: &Node, indent: usize, out: &mut Vec<String>) {
    chain_lines(&node.op, indent, out);
}

/// Render the plan as one line per operator, leaf first, with sub-plans
/// indented.
pub fn tree_lines(tree: &Tree) -> Vec<String> {
    let mut out = Vec::new();
    node_lines(&tree.root, 0, &mut out);
    out
}

/// Render the plan as a single text blob.
pub fn tree_text(tree: &Tree) -> String {
    let mut s = tree_lines(tree).join("\n");
    s.push('\n');
    s
}

#[cfg(test)]
mod tests {
    use super::{op_line, tree_text};
    use crate::op::{CountStar, Leaf, Node, Op, Tree};
    use opal_expr::{Binding, Expr};

    fn leaf() -> Op {
        Op::Leaf(Leaf {
            orig: Binding::auto(Expr::ident("input")),
            on_equal: vec![],
            equal_expr: vec![],
        })
    }

    #[test]
    fn op_lines_read_like_plans() {
        assert_eq!(op_line(&leaf()), "ITERATE input");
        let cs = Op::CountStar(CountStar {
            from: Box::new(leaf()),
            result: "count".to_string(),
        });
        assert_eq!(op_line(&cs), "COUNT(*) AS count");
    }

    #[test]
    fn tree_text_is_leaf_first() {
        let tree = Tree {
            inputs: vec![],
            root: Node {
                input: 0,
                op: Op::CountStar(CountStar {
                    from: Box::new(leaf()),
                    result: "count".to_string(),
                }),
                output: vec![],
            },
        };
        assert_eq!(tree_text(&tree), "ITERATE input\nCOUNT(*) AS count\n");
    }
}
