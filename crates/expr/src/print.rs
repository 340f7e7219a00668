use std::fmt::{self, Write};
use std::sync::OnceLock;

use ahash::RandomState;

use opal_wire::{Bag, Datum};

use crate::node::{
    Aggregate, AggregateOp, Case, Expr, IsKey, LogicalOp, Order, UnaryArithOp, UnionKind,
};
use crate::path::Binding;
use crate::query::{From, JoinKind, Select};
use crate::types::TypeSet;

static IS_KEYWORD: OnceLock<fn(&str) -> bool> = OnceLock::new();

/// Install the keyword predicate used when quoting identifiers.
///
/// The parser owns the keyword tables; this callback lets identifier
/// printing agree with it without a dependency in that direction. Setting
/// it more than once has no effect.
pub fn set_is_keyword(f: fn(&str) -> bool) {
    let _ = IS_KEYWORD.set(f);
}

fn is_keyword(s: &str) -> bool {
    IS_KEYWORD.get().is_some_and(|f| f(s))
}

/// Render `e` in approximately PartiQL syntax.
pub fn to_text(e: &Expr) -> String {
    let mut out = String::new();
    text(e, &mut out, false);
    out
}

/// Render `e` with every literal replaced by a deterministic surrogate:
/// floats map into `[0, 1)`, integers hash, strings scramble. Two equal
/// inputs always redact to the same output.
pub fn to_redacted(e: &Expr) -> String {
    let mut out = String::new();
    text(e, &mut out, true);
    out
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_text(self))
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_text(&self.expr))?;
        if let Some(name) = self.explicit_result() {
            write!(f, " AS {}", quote_id(name))?;
        }
        Ok(())
    }
}

// fixed seeds: redaction must be deterministic across runs and processes
fn surrogate_hasher() -> RandomState {
    RandomState::with_seeds(0x243f_6a88, 0x85a3_08d3, 0x1319_8a2e, 0x0370_7344)
}

fn redact_int(v: i64) -> i64 {
    (surrogate_hasher().hash_one(v) >> 1) as i64
}

fn redact_float(v: f64) -> f64 {
    let h = surrogate_hasher().hash_one(v.to_bits());
    // map onto [0, 1)
    (h >> 11) as f64 / (1u64 << 53) as f64
}

fn redact_string(s: &str) -> String {
    let seed = surrogate_hasher().hash_one(s);
    let state = surrogate_hasher();
    s.chars()
        .enumerate()
        .map(|(i, _)| {
            let h = state.hash_one((seed, i));
            char::from(b'a' + (h % 26) as u8)
        })
        .collect()
}

/// Quote an identifier when it collides with a keyword or contains
/// characters that would not re-parse.
fn quote_id(s: &str) -> String {
    let plain = !s.is_empty()
        && !is_keyword(s)
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        s.to_string()
    } else {
        format!("\"{}\"", s.escape_default())
    }
}

fn quote_str(dst: &mut String, s: &str) {
    dst.push('\'');
    for c in s.chars() {
        match c {
            '\'' => dst.push_str("''"),
            '\\' => dst.push_str("\\\\"),
            c if c.is_control() => {
                let _ = write!(dst, "\\u{:04x}", c as u32);
            }
            c => dst.push(c),
        }
    }
    dst.push('\'');
}

fn infix(e: &Expr) -> bool {
    matches!(e, Expr::Arith { .. } | Expr::Cmp { .. })
}

fn bag_text(src: &Bag, dst: &mut String, redact: bool) {
    if redact {
        let _ = write!(dst, "'<redacted; {} elements>'", src.len());
        return;
    }
    for (i, d) in src.iter().enumerate() {
        if i > 0 {
            dst.push_str(", ");
        }
        datum_text(d, dst);
    }
}

fn datum_text(d: &Datum, dst: &mut String) {
    match Expr::from_datum(d) {
        Some(e) => text(&e, dst, false),
        None => dst.push_str("'?'"),
    }
}

fn order_text(o: &Order, dst: &mut String, redact: bool) {
    text(&o.column, dst, redact);
    dst.push_str(if o.desc { " DESC" } else { " ASC" });
    if o.nulls_last {
        dst.push_str(" NULLS LAST");
    }
}

pub(crate) fn text(e: &Expr, dst: &mut String, redact: bool) {
    match e {
        Expr::Bool(b) => dst.push_str(if *b { "TRUE" } else { "FALSE" }),
        Expr::Integer(i) => {
            let v = if redact { redact_int(*i) } else { *i };
            let _ = write!(dst, "{v}");
        }
        Expr::Float(f) => {
            let v = if redact { redact_float(*f) } else { *f };
            let _ = write!(dst, "{v}");
        }
        Expr::Rational(r) => {
            use num_traits::ToPrimitive;
            if redact {
                let f = r.to_f64().unwrap_or(0.0);
                let _ = write!(dst, "{}", redact_float(f));
            } else if r.is_integer() {
                let _ = write!(dst, "{}", r.numer());
            } else if let Some(f) = r.to_f64() {
                let _ = write!(dst, "{f}");
            } else {
                let _ = write!(dst, "{}/{}", r.numer(), r.denom());
            }
        }
        Expr::String(s) => {
            if redact {
                quote_str(dst, &redact_string(s));
            } else {
                quote_str(dst, s);
            }
        }
        Expr::Timestamp(t) => {
            let _ = write!(dst, "`{}`", t.format("%Y-%m-%dT%H:%M:%S%.6fZ"));
        }
        Expr::Null => dst.push_str("NULL"),
        Expr::Missing => dst.push_str("MISSING"),
        Expr::Ident(name) => dst.push_str(&quote_id(name)),
        Expr::Dot { inner, field } => {
            text(inner, dst, redact);
            dst.push('.');
            dst.push_str(&quote_id(field));
        }
        Expr::Index { inner, offset } => {
            text(inner, dst, redact);
            let _ = write!(dst, "[{offset}]");
        }
        Expr::Star => dst.push('*'),
        Expr::Not(inner) => {
            dst.push_str("NOT ");
            let parens = matches!(inner.as_ref(), Expr::Logical { .. }) || infix(inner);
            if parens {
                dst.push('(');
            }
            text(inner, dst, redact);
            if parens {
                dst.push(')');
            }
        }
        Expr::UnaryArith { op, inner } => {
            dst.push_str(match op {
                UnaryArithOp::Neg => "-",
                UnaryArithOp::BitNot => "~",
            });
            dst.push('(');
            text(inner, dst, redact);
            dst.push(')');
        }
        Expr::Arith { op, left, right } => {
            // the rhs must be parenthesized when it is an infix binary
            // expression, in case it contains an operator of higher
            // precedence that left-associative re-parsing would capture
            let parens = infix(right);
            text(left, dst, redact);
            let _ = write!(dst, " {} ", op.symbol());
            if parens {
                dst.push('(');
            }
            text(right, dst, redact);
            if parens {
                dst.push(')');
            }
        }
        Expr::Cmp { op, left, right } => {
            // a comparison on the rhs of a comparison is always
            // parenthesized: A = B = C parses as (A = B) = C, so A = (B = C)
            // needs the parentheses to survive a round trip; logical
            // operands bind looser than comparisons on either side
            let parens = matches!(right.as_ref(), Expr::Cmp { .. } | Expr::Logical { .. });
            if matches!(left.as_ref(), Expr::Logical { .. }) {
                dst.push('(');
                text(left, dst, redact);
                dst.push(')');
            } else {
                text(left, dst, redact);
            }
            let _ = write!(dst, " {} ", op.symbol());
            if parens {
                dst.push('(');
            }
            text(right, dst, redact);
            if parens {
                dst.push(')');
            }
        }
        Expr::Logical { op, left, right } => {
            let parens = matches!(right.as_ref(), Expr::Logical { .. });
            text(left, dst, redact);
            dst.push_str(match op {
                LogicalOp::And => " AND ",
                LogicalOp::Or => " OR ",
                LogicalOp::Xor => " <> ",
                LogicalOp::Xnor => " = ",
            });
            if parens {
                dst.push('(');
            }
            text(right, dst, redact);
            if parens {
                dst.push(')');
            }
        }
        Expr::StringMatch {
            op,
            inner,
            pattern,
            escape,
        } => {
            text(inner, dst, redact);
            let _ = write!(dst, " {} ", op.keyword());
            if redact {
                quote_str(dst, &redact_string(pattern));
            } else {
                quote_str(dst, pattern);
            }
            if let Some(c) = escape {
                dst.push_str(" ESCAPE ");
                quote_str(dst, &c.to_string());
            }
        }
        Expr::Is { inner, key } => {
            text(inner, dst, redact);
            dst.push_str(" IS ");
            dst.push_str(match key {
                IsKey::Null => "NULL",
                IsKey::NotNull => "NOT NULL",
                IsKey::Missing => "MISSING",
                IsKey::NotMissing => "NOT MISSING",
                IsKey::True => "TRUE",
                IsKey::NotTrue => "NOT TRUE",
                IsKey::False => "FALSE",
                IsKey::NotFalse => "NOT FALSE",
            });
        }
        Expr::Member { arg, set } => {
            text(arg, dst, redact);
            dst.push_str(" IN (");
            bag_text(set, dst, redact);
            dst.push(')');
        }
        Expr::Lookup(l) => {
            dst.push_str("HASH_LOOKUP(");
            text(&l.expr, dst, redact);
            dst.push_str(", [");
            bag_text(&l.keys, dst, redact);
            dst.push_str("], [");
            bag_text(&l.values, dst, redact);
            dst.push(']');
            if let Some(e) = &l.else_expr {
                dst.push_str(", ");
                text(e, dst, redact);
            }
            dst.push(')');
        }
        Expr::Case(c) => case_text(c, dst, redact),
        Expr::Cast { inner, to } => {
            dst.push_str("CAST(");
            text(inner, dst, redact);
            dst.push_str(" AS ");
            dst.push_str(target_type_name(*to));
            dst.push(')');
        }
        Expr::Builtin { func, args } => {
            dst.push_str(func.name());
            dst.push('(');
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    dst.push_str(", ");
                }
                text(a, dst, redact);
            }
            dst.push(')');
        }
        Expr::Aggregate(a) => aggregate_text(a, dst, redact),
        Expr::Appended(values) => {
            if values.len() > 1 {
                dst.push('(');
            }
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    dst.push_str(" ++ ");
                }
                text(v, dst, redact);
            }
            if values.len() > 1 {
                dst.push(')');
            }
        }
        Expr::Struct(fields) => {
            dst.push('{');
            for (i, f) in fields.iter().enumerate() {
                if i > 0 {
                    dst.push_str(", ");
                }
                quote_str(dst, &f.label);
                dst.push_str(": ");
                text(&f.value, dst, redact);
            }
            dst.push('}');
        }
        Expr::List(items) => {
            dst.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    dst.push_str(", ");
                }
                text(item, dst, redact);
            }
            dst.push(']');
        }
        Expr::Unpivot(u) => {
            dst.push_str("UNPIVOT ");
            text(&u.inner, dst, redact);
            if let Some(v) = &u.as_name {
                let _ = write!(dst, " AS {}", quote_id(v));
            }
            if let Some(k) = &u.at_name {
                let _ = write!(dst, " AT {}", quote_id(k));
            }
        }
        Expr::Select(s) => {
            dst.push('(');
            select_text(s, dst, redact);
            dst.push(')');
        }
        Expr::Union(u) => {
            text(&u.left, dst, redact);
            dst.push_str(match u.kind {
                UnionKind::Distinct => " UNION ",
                UnionKind::All => " UNION ALL ",
            });
            text(&u.right, dst, redact);
        }
    }
}

fn case_text(c: &Case, dst: &mut String, redact: bool) {
    dst.push_str("CASE");
    for limb in &c.limbs {
        dst.push_str(" WHEN ");
        text(&limb.when, dst, redact);
        dst.push_str(" THEN ");
        text(&limb.then, dst, redact);
    }
    if let Some(e) = &c.else_expr {
        dst.push_str(" ELSE ");
        text(e, dst, redact);
    }
    dst.push_str(" END");
}

fn aggregate_text(a: &Aggregate, dst: &mut String, redact: bool) {
    match a.op {
        AggregateOp::CountDistinct => {
            dst.push_str("COUNT(DISTINCT ");
            if let Some(inner) = &a.inner {
                text(inner, dst, redact);
            }
            dst.push(')');
        }
        AggregateOp::ApproxCountDistinct
        | AggregateOp::ApproxCountDistinctPartial
        | AggregateOp::ApproxCountDistinctMerge => {
            dst.push_str(a.op.name());
            dst.push('(');
            if let Some(inner) = &a.inner {
                text(inner, dst, redact);
            }
            if a.precision > 0 {
                let _ = write!(dst, ", {}", a.precision);
            }
            dst.push(')');
        }
        _ => {
            dst.push_str(a.op.name());
            dst.push('(');
            if let Some(inner) = &a.inner {
                text(inner, dst, redact);
            }
            dst.push(')');
        }
    }
    if let Some(filter) = &a.filter {
        dst.push_str(" FILTER (WHERE ");
        text(filter, dst, redact);
        dst.push(')');
    }
    if let Some(over) = &a.over {
        dst.push_str(" OVER (");
        for (i, p) in over.partition_by.iter().enumerate() {
            dst.push_str(if i == 0 { "PARTITION BY " } else { ", " });
            text(p, dst, redact);
        }
        for (i, o) in over.order_by.iter().enumerate() {
            if i == 0 {
                if !over.partition_by.is_empty() {
                    dst.push(' ');
                }
                dst.push_str("ORDER BY ");
            } else {
                dst.push_str(", ");
            }
            order_text(o, dst, redact);
        }
        dst.push(')');
    }
}

fn select_text(s: &Select, dst: &mut String, redact: bool) {
    dst.push_str("SELECT ");
    if s.distinct {
        dst.push_str("DISTINCT ");
    }
    for (i, b) in s.columns.iter().enumerate() {
        if i > 0 {
            dst.push_str(", ");
        }
        binding_text(b, dst, redact);
    }
    if let Some(from) = &s.from {
        dst.push_str(" FROM ");
        from_text(from, dst, redact);
    }
    if let Some(w) = &s.where_clause {
        dst.push_str(" WHERE ");
        text(w, dst, redact);
    }
    for (i, b) in s.group_by.iter().enumerate() {
        dst.push_str(if i == 0 { " GROUP BY " } else { ", " });
        binding_text(b, dst, redact);
    }
    if let Some(h) = &s.having {
        dst.push_str(" HAVING ");
        text(h, dst, redact);
    }
    for (i, o) in s.order_by.iter().enumerate() {
        dst.push_str(if i == 0 { " ORDER BY " } else { ", " });
        order_text(o, dst, redact);
    }
    if let Some(limit) = s.limit {
        let _ = write!(dst, " LIMIT {limit}");
    }
    if let Some(offset) = s.offset {
        let _ = write!(dst, " OFFSET {offset}");
    }
}

fn binding_text(b: &Binding, dst: &mut String, redact: bool) {
    text(&b.expr, dst, redact);
    if let Some(name) = b.explicit_result() {
        let _ = write!(dst, " AS {}", quote_id(name));
    }
}

fn from_text(f: &From, dst: &mut String, redact: bool) {
    match f {
        From::Table(b) => binding_text(b, dst, redact),
        From::Join {
            kind,
            on,
            left,
            right,
        } => {
            from_text(left, dst, redact);
            dst.push_str(match kind {
                JoinKind::Cross => ", ",
                JoinKind::Inner => " JOIN ",
            });
            binding_text(right, dst, redact);
            if let Some(on) = on {
                dst.push_str(" ON ");
                text(on, dst, redact);
            }
        }
    }
}

/// The SQL name of a cast target type.
pub(crate) fn target_type_name(to: TypeSet) -> &'static str {
    match to {
        TypeSet::MISSING => "MISSING",
        TypeSet::NULL => "NULL",
        TypeSet::STRING => "STRING",
        TypeSet::INTEGER => "INTEGER",
        TypeSet::FLOAT => "FLOAT",
        TypeSet::BOOL => "BOOLEAN",
        TypeSet::TIME => "TIMESTAMP",
        TypeSet::STRUCT => "STRUCT",
        TypeSet::LIST => "LIST",
        TypeSet::DECIMAL => "DECIMAL",
        TypeSet::SYMBOL => "SYMBOL",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::{to_redacted, to_text};
    use crate::node::{ArithOp, CmpOp, Expr};

    #[test]
    fn precedence_parens() {
        // rhs infix gets wrapped, lhs does not
        let e = Expr::arith(
            ArithOp::Mul,
            Expr::arith(ArithOp::Add, Expr::ident("a"), Expr::ident("b")),
            Expr::arith(ArithOp::Add, Expr::ident("c"), Expr::ident("d")),
        );
        assert_eq!(to_text(&e), "a + b * (c + d)");

        // comparison on the rhs of a comparison is always parenthesized
        let e = Expr::cmp(
            CmpOp::Eq,
            Expr::ident("a"),
            Expr::cmp(CmpOp::Eq, Expr::ident("b"), Expr::ident("c")),
        );
        assert_eq!(to_text(&e), "a = (b = c)");

        let e = Expr::and(
            Expr::ident("a"),
            Expr::or(Expr::ident("b"), Expr::ident("c")),
        );
        assert_eq!(to_text(&e), "a AND (b OR c)");
    }

    #[test]
    fn plain_rendering() {
        let e = Expr::and(
            Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
            Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3)),
        );
        assert_eq!(to_text(&e), "x > 5 AND y = 3");
        assert_eq!(
            to_text(&Expr::dot(Expr::ident("t"), "field")),
            "t.field"
        );
        assert_eq!(to_text(&Expr::count_star()), "COUNT(*)");
    }

    #[test]
    fn redaction_is_deterministic_and_hides_literals() {
        let e = Expr::cmp(
            CmpOp::Eq,
            Expr::ident("name"),
            Expr::string("top-secret"),
        );
        let r1 = to_redacted(&e);
        let r2 = to_redacted(&e);
        assert_eq!(r1, r2);
        assert!(!r1.contains("top-secret"));
        // identifiers survive, literals do not
        assert!(r1.starts_with("name = "));

        let f = Expr::Float(1234.5);
        let red = to_redacted(&f);
        let v: f64 = red.parse().unwrap();
        assert!((0.0..1.0).contains(&v));
    }
}
