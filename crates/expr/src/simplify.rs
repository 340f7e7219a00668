use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};

use crate::node::{as_rational, ArithOp, Case, CmpOp, Expr, IsKey, LogicalOp, UnaryArithOp};
use crate::types::Hint;

/// Simplify `e` bottom-up: collapse field/index access on literals, fold
/// constant arithmetic, comparisons, and logical connectives, and prune
/// degenerate CASE limbs.
///
/// The result is a fixed point of this function: simplifying twice changes
/// nothing, which is what lets the rewrite rules report `Intact` on the
/// second visit.
pub fn simplify(e: Expr, h: &dyn Hint) -> Expr {
    let _ = h; // hints currently influence nothing here, but every caller has one
    e.rewrite_with(&mut simplify_one)
}

fn simplify_one(e: Expr) -> Expr {
    match e {
        Expr::Dot { inner, field } => simplify_dot(*inner, field),
        Expr::Index { inner, offset } => simplify_index(*inner, offset),
        Expr::Logical { op, left, right } => simplify_logical(op, *left, *right),
        Expr::Not(inner) => simplify_not(*inner),
        Expr::Cmp { op, left, right } => simplify_cmp(op, *left, *right),
        Expr::Arith { op, left, right } => simplify_arith(op, *left, *right),
        Expr::UnaryArith { op, inner } => simplify_unary(op, *inner),
        Expr::Is { inner, key } => simplify_is(*inner, key),
        Expr::Case(c) => simplify_case(*c),
        Expr::Member { arg, set } => {
            if let Some(d) = arg.as_datum() {
                return Expr::Bool(set.contains(&d));
            }
            Expr::Member { arg, set }
        }
        other => other,
    }
}

// {'x': v}.x -> v
fn simplify_dot(inner: Expr, field: String) -> Expr {
    match &inner {
        Expr::Struct(fields) => {
            for f in fields {
                if f.label == field {
                    return f.value.clone();
                }
            }
            Expr::Missing
        }
        Expr::Builtin {
            func: crate::node::BuiltinOp::MakeStruct,
            args,
        } => {
            for pair in args.chunks(2) {
                if let [Expr::String(label), value] = pair {
                    if *label == field {
                        return value.clone();
                    }
                }
            }
            Expr::Missing
        }
        _ => Expr::Dot {
            inner: Box::new(inner),
            field,
        },
    }
}

// [v][0] -> v
fn simplify_index(inner: Expr, offset: i64) -> Expr {
    match &inner {
        Expr::List(items) => match usize::try_from(offset).ok().and_then(|i| items.get(i)) {
            Some(v) => v.clone(),
            None => Expr::Missing,
        },
        Expr::Builtin {
            func: crate::node::BuiltinOp::MakeList,
            args,
        } => match usize::try_from(offset).ok().and_then(|i| args.get(i)) {
            Some(v) => v.clone(),
            None => Expr::Missing,
        },
        _ => Expr::Index {
            inner: Box::new(inner),
            offset,
        },
    }
}

fn simplify_logical(op: LogicalOp, left: Expr, right: Expr) -> Expr {
    match op {
        LogicalOp::And => match (&left, &right) {
            // FALSE absorbs even a NULL/MISSING operand
            (Expr::Bool(false), _) | (_, Expr::Bool(false)) => Expr::Bool(false),
            (Expr::Bool(true), _) => right,
            (_, Expr::Bool(true)) => left,
            _ => Expr::and(left, right),
        },
        LogicalOp::Or => match (&left, &right) {
            (Expr::Bool(true), _) | (_, Expr::Bool(true)) => Expr::Bool(true),
            (Expr::Bool(false), _) => right,
            (_, Expr::Bool(false)) => left,
            _ => Expr::or(left, right),
        },
        LogicalOp::Xor => match (&left, &right) {
            (Expr::Bool(a), Expr::Bool(b)) => Expr::Bool(a != b),
            _ => Expr::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        },
        LogicalOp::Xnor => match (&left, &right) {
            (Expr::Bool(a), Expr::Bool(b)) => Expr::Bool(a == b),
            _ => Expr::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        },
    }
}

fn simplify_not(inner: Expr) -> Expr {
    match inner {
        Expr::Bool(b) => Expr::Bool(!b),
        Expr::Not(e) => *e,
        Expr::Cmp { op, left, right } => Expr::Cmp {
            op: op.invert(),
            left,
            right,
        },
        Expr::Is { inner, key } => Expr::Is {
            inner,
            key: key.invert(),
        },
        other => Expr::not(other),
    }
}

fn simplify_cmp(op: CmpOp, left: Expr, right: Expr) -> Expr {
    if let (Some(a), Some(b)) = (as_rational(&left), as_rational(&right)) {
        return Expr::Bool(apply_cmp(op, a.cmp(&b)));
    }
    match (&left, &right) {
        (Expr::String(a), Expr::String(b)) => Expr::Bool(apply_cmp(op, a.cmp(b))),
        (Expr::Timestamp(a), Expr::Timestamp(b)) => Expr::Bool(apply_cmp(op, a.cmp(b))),
        (Expr::Bool(a), Expr::Bool(b)) if matches!(op, CmpOp::Eq | CmpOp::NotEq) => {
            Expr::Bool(apply_cmp(op, a.cmp(b)))
        }
        _ => Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
    }
}

fn apply_cmp(op: CmpOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ord == Equal,
        CmpOp::NotEq => ord != Equal,
        CmpOp::Less => ord == Less,
        CmpOp::LessEq => ord != Greater,
        CmpOp::Greater => ord == Greater,
        CmpOp::GreaterEq => ord != Less,
    }
}

fn simplify_arith(op: ArithOp, left: Expr, right: Expr) -> Expr {
    let keep = |left: Expr, right: Expr| Expr::Arith {
        op,
        left: Box::new(left),
        right: Box::new(right),
    };
    // bit operations and shifts fold only over integers
    if let (Expr::Integer(a), Expr::Integer(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        match op {
            ArithOp::BitAnd => return Expr::Integer(a & b),
            ArithOp::BitOr => return Expr::Integer(a | b),
            ArithOp::BitXor => return Expr::Integer(a ^ b),
            ArithOp::ShiftLeftLogical => return Expr::Integer(a.wrapping_shl(b as u32 & 63)),
            ArithOp::ShiftRightArith => return Expr::Integer(a.wrapping_shr(b as u32 & 63)),
            ArithOp::ShiftRightLogical => {
                return Expr::Integer(((a as u64).wrapping_shr(b as u32 & 63)) as i64)
            }
            ArithOp::Mod => {
                if b == 0 {
                    return Expr::Missing;
                }
                return Expr::Integer(a.wrapping_rem(b));
            }
            _ => {}
        }
    }
    let (Some(a), Some(b)) = (as_rational(&left), as_rational(&right)) else {
        return keep(left, right);
    };
    let float_result = matches!(left, Expr::Float(_)) || matches!(right, Expr::Float(_));
    let out = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b.is_zero() {
                // divide-by-zero yields MISSING, even on numeric operands
                return Expr::Missing;
            }
            a / b
        }
        ArithOp::Mod => {
            if b.is_zero() {
                return Expr::Missing;
            }
            a % b
        }
        _ => return keep(left, right),
    };
    canonical_number(out, float_result)
}

/// Integer-valued results canonicalize to integer literals; everything
/// else stays rational unless a float participated in the computation.
fn canonical_number(r: BigRational, float_result: bool) -> Expr {
    if r.is_integer() {
        if let Some(i) = r.numer().to_i64() {
            return Expr::Integer(i);
        }
    }
    if float_result {
        if let Some(f) = r.to_f64() {
            return Expr::Float(f);
        }
    }
    Expr::Rational(Box::new(r))
}

fn simplify_unary(op: UnaryArithOp, inner: Expr) -> Expr {
    match (op, &inner) {
        (UnaryArithOp::Neg, Expr::Integer(i)) => match i.checked_neg() {
            Some(n) => Expr::Integer(n),
            None => Expr::UnaryArith {
                op,
                inner: Box::new(inner),
            },
        },
        (UnaryArithOp::Neg, Expr::Float(f)) => Expr::Float(-f),
        (UnaryArithOp::Neg, Expr::Rational(r)) => {
            Expr::Rational(Box::new(-(**r).clone()))
        }
        (UnaryArithOp::BitNot, Expr::Integer(i)) => Expr::Integer(!i),
        _ => Expr::UnaryArith {
            op,
            inner: Box::new(inner),
        },
    }
}

fn simplify_is(inner: Expr, key: IsKey) -> Expr {
    let verdict = match (&inner, key) {
        (Expr::Null, IsKey::Null) | (Expr::Missing, IsKey::Missing) => Some(true),
        (Expr::Null, IsKey::NotNull) | (Expr::Missing, IsKey::NotMissing) => Some(false),
        // MISSING compares as absent-null in IS NULL tests
        (Expr::Missing, IsKey::Null) => Some(true),
        (Expr::Missing, IsKey::NotNull) => Some(false),
        (Expr::Bool(b), IsKey::True) => Some(*b),
        (Expr::Bool(b), IsKey::NotTrue) => Some(!*b),
        (Expr::Bool(b), IsKey::False) => Some(!*b),
        (Expr::Bool(b), IsKey::NotFalse) => Some(*b),
        _ => {
            if inner.is_constant() && !matches!(inner, Expr::Null) {
                match key {
                    IsKey::Null | IsKey::Missing => Some(false),
                    IsKey::NotNull | IsKey::NotMissing => Some(true),
                    _ => None,
                }
            } else {
                None
            }
        }
    };
    match verdict {
        Some(b) => Expr::Bool(b),
        None => Expr::Is {
            inner: Box::new(inner),
            key,
        },
    }
}

fn simplify_case(mut c: Case) -> Expr {
    // drop limbs that can never be taken
    c.limbs.retain(|l| !matches!(l.when, Expr::Bool(false)));
    if let Some(first) = c.limbs.first() {
        if matches!(first.when, Expr::Bool(true)) {
            return first.then.clone();
        }
    }
    if c.limbs.is_empty() {
        return c.else_expr.unwrap_or(Expr::Null);
    }
    Expr::Case(Box::new(c))
}

#[cfg(test)]
mod tests {
    use super::simplify;
    use crate::node::{ArithOp, CmpOp, Expr, IsKey, StructField};
    use crate::types::NoHint;
    use num_bigint::BigInt;
    use num_rational::BigRational;

    fn simp(e: Expr) -> Expr {
        simplify(e, &NoHint)
    }

    #[test]
    fn dot_on_struct_literal() {
        let s = Expr::Struct(vec![
            StructField {
                label: "k".to_string(),
                value: Expr::Integer(7),
            },
            StructField {
                label: "other".to_string(),
                value: Expr::Bool(true),
            },
        ]);
        assert_eq!(simp(Expr::dot(s.clone(), "k")), Expr::Integer(7));
        assert_eq!(simp(Expr::dot(s, "unknown")), Expr::Missing);
    }

    #[test]
    fn index_on_list_literal() {
        let l = Expr::List(vec![Expr::Integer(10), Expr::Integer(20)]);
        assert_eq!(simp(Expr::index(l.clone(), 1)), Expr::Integer(20));
        assert_eq!(simp(Expr::index(l.clone(), 5)), Expr::Missing);
        assert_eq!(simp(Expr::index(l, -1)), Expr::Missing);
    }

    #[test]
    fn constant_arithmetic_folds() {
        let e = Expr::arith(ArithOp::Add, Expr::Integer(2), Expr::Integer(3));
        assert_eq!(simp(e), Expr::Integer(5));
        // exact rational division canonicalizes back to an integer
        let e = Expr::arith(ArithOp::Div, Expr::Integer(6), Expr::Integer(3));
        assert_eq!(simp(e), Expr::Integer(2));
        let e = Expr::arith(ArithOp::Div, Expr::Integer(1), Expr::Integer(2));
        assert_eq!(
            simp(e),
            Expr::Rational(Box::new(BigRational::new(BigInt::from(1), BigInt::from(2))))
        );
        let e = Expr::arith(ArithOp::Div, Expr::Integer(1), Expr::Integer(0));
        assert_eq!(simp(e), Expr::Missing);
    }

    #[test]
    fn logical_folding_respects_three_valued_and() {
        let x = Expr::ident("x");
        let e = Expr::and(Expr::Bool(false), x.clone());
        assert_eq!(simp(e), Expr::Bool(false));
        let e = Expr::and(Expr::Bool(true), x.clone());
        assert_eq!(simp(e), x.clone());
        let e = Expr::or(x.clone(), Expr::Bool(false));
        assert_eq!(simp(e), x);
    }

    #[test]
    fn not_inverts_comparisons() {
        let e = Expr::not(Expr::cmp(CmpOp::Less, Expr::ident("x"), Expr::Integer(3)));
        assert_eq!(
            simp(e),
            Expr::cmp(CmpOp::GreaterEq, Expr::ident("x"), Expr::Integer(3))
        );
    }

    #[test]
    fn is_tests_on_literals() {
        assert_eq!(simp(Expr::is(Expr::Null, IsKey::Null)), Expr::Bool(true));
        assert_eq!(simp(Expr::is(Expr::Missing, IsKey::Null)), Expr::Bool(true));
        assert_eq!(
            simp(Expr::is(Expr::Integer(3), IsKey::NotNull)),
            Expr::Bool(true)
        );
        // IS TRUE over a non-boolean stays put
        let e = Expr::is(Expr::ident("x"), IsKey::True);
        assert_eq!(simp(e.clone()), e);
    }

    #[test]
    fn case_pruning() {
        let e = Expr::if_then_else(Expr::Bool(true), Expr::Integer(1), Expr::Integer(2));
        assert_eq!(simp(e), Expr::Integer(1));
        let e = Expr::if_then_else(Expr::Bool(false), Expr::Integer(1), Expr::Integer(2));
        assert_eq!(simp(e), Expr::Integer(2));
        // COALESCE of a non-null constant collapses to it
        let e = Expr::coalesce(vec![Expr::Integer(5), Expr::ident("x")]);
        assert_eq!(simp(e), Expr::Integer(5));
    }

    #[test]
    fn member_of_constant_folds() {
        let e = Expr::in_list(
            Expr::Integer(2),
            vec![Expr::Integer(1), Expr::Integer(2), Expr::Integer(3)],
        );
        assert_eq!(simp(e), Expr::Bool(true));
        let e = Expr::in_list(Expr::Integer(9), vec![Expr::Integer(1)]);
        assert_eq!(simp(e), Expr::Bool(false));
    }
}
