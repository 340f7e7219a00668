use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use crate::node::{AggregateOp, BuiltinOp, CmpOp, Expr};

/// A set of possible runtime types, represented as a bit-set.
///
/// Type inference is approximate by design: it answers "which types could
/// this expression evaluate to", never "which type will it have".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeSet(pub u16);

impl TypeSet {
    /// The empty set.
    pub const EMPTY: TypeSet = TypeSet(0);
    /// Untyped null.
    pub const NULL: TypeSet = TypeSet(1 << 0);
    /// Boolean.
    pub const BOOL: TypeSet = TypeSet(1 << 1);
    /// Unsigned integer.
    pub const UINT: TypeSet = TypeSet(1 << 2);
    /// Signed integer.
    pub const INT: TypeSet = TypeSet(1 << 3);
    /// 64-bit float.
    pub const FLOAT: TypeSet = TypeSet(1 << 4);
    /// Decimal.
    pub const DECIMAL: TypeSet = TypeSet(1 << 5);
    /// Timestamp.
    pub const TIME: TypeSet = TypeSet(1 << 6);
    /// UTF-8 string.
    pub const STRING: TypeSet = TypeSet(1 << 7);
    /// Interned symbol.
    pub const SYMBOL: TypeSet = TypeSet(1 << 8);
    /// Structure.
    pub const STRUCT: TypeSet = TypeSet(1 << 9);
    /// List.
    pub const LIST: TypeSet = TypeSet(1 << 10);
    /// MISSING (absent value).
    pub const MISSING: TypeSet = TypeSet(1 << 11);

    /// Any integer.
    pub const INTEGER: TypeSet = TypeSet(Self::UINT.0 | Self::INT.0);
    /// Any number.
    pub const NUMERIC: TypeSet =
        TypeSet(Self::UINT.0 | Self::INT.0 | Self::FLOAT.0 | Self::DECIMAL.0);
    /// The result set of comparisons and logical operators.
    pub const LOGICAL: TypeSet = TypeSet(Self::BOOL.0 | Self::MISSING.0 | Self::NULL.0);
    /// Every type.
    pub const ANY: TypeSet = TypeSet((1 << 12) - 1);

    /// Returns whether the intersection with `other` is non-empty.
    pub fn overlaps(self, other: TypeSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns whether every type in `other` is also in `self`.
    pub fn contains(self, other: TypeSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The set difference `self \ other`.
    pub fn without(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 & !other.0)
    }
}

impl BitOr for TypeSet {
    type Output = TypeSet;
    fn bitor(self, rhs: TypeSet) -> TypeSet {
        TypeSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeSet {
    fn bitor_assign(&mut self, rhs: TypeSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TypeSet {
    type Output = TypeSet;
    fn bitand(self, rhs: TypeSet) -> TypeSet {
        TypeSet(self.0 & rhs.0)
    }
}

impl Not for TypeSet {
    type Output = TypeSet;
    fn not(self) -> TypeSet {
        TypeSet(!self.0 & TypeSet::ANY.0)
    }
}

impl fmt::Debug for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TypeSet, &str); 12] = [
            (TypeSet::NULL, "null"),
            (TypeSet::BOOL, "bool"),
            (TypeSet::UINT, "uint"),
            (TypeSet::INT, "int"),
            (TypeSet::FLOAT, "float"),
            (TypeSet::DECIMAL, "decimal"),
            (TypeSet::TIME, "timestamp"),
            (TypeSet::STRING, "string"),
            (TypeSet::SYMBOL, "symbol"),
            (TypeSet::STRUCT, "struct"),
            (TypeSet::LIST, "list"),
            (TypeSet::MISSING, "missing"),
        ];
        write!(f, "{{")?;
        let mut first = true;
        for (bit, name) in NAMES {
            if self.overlaps(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, "}}")
    }
}

/// Provides externally-known type information for expressions, typically
/// derived from table schemas. Identifiers and paths can only be typed
/// through hints.
pub trait Hint {
    /// The possible types of `e`, or [`TypeSet::ANY`] when unknown.
    fn type_of(&self, e: &Expr) -> TypeSet;
}

/// The hint that knows nothing.
pub struct NoHint;

impl Hint for NoHint {
    fn type_of(&self, _: &Expr) -> TypeSet {
        TypeSet::ANY
    }
}

/// Compute the set of types that `e` could evaluate to at runtime.
pub fn type_of(e: &Expr, h: &dyn Hint) -> TypeSet {
    match e {
        // identifiers and paths can only be typed via hints
        Expr::Ident(_) | Expr::Dot { .. } | Expr::Index { .. } => h.type_of(e),

        Expr::Bool(_) => TypeSet::BOOL,
        Expr::Integer(_) => TypeSet::INTEGER,
        Expr::Float(_) | Expr::Rational(_) => TypeSet::NUMERIC,
        Expr::String(_) => TypeSet::STRING,
        Expr::Timestamp(_) => TypeSet::TIME,
        Expr::Null => TypeSet::NULL,
        Expr::Missing => TypeSet::MISSING,
        Expr::Star => TypeSet::ANY,

        Expr::Cmp { .. } | Expr::Logical { .. } | Expr::Not(_) => TypeSet::LOGICAL,
        // IS, unlike comparisons, always produces TRUE or FALSE
        Expr::Is { .. } => TypeSet::BOOL,
        Expr::Member { .. } | Expr::StringMatch { .. } => TypeSet::LOGICAL,

        Expr::UnaryArith { inner, .. } => {
            let mut out = TypeSet::NUMERIC;
            let ct = type_of(inner, h);
            out |= TypeSet::MISSING & ct;
            if !ct.without(TypeSet::MISSING | TypeSet::NUMERIC).is_empty() {
                out |= TypeSet::MISSING;
            }
            out
        }
        Expr::Arith { op, left, right } => arith_type(*op, left, right, h),

        Expr::Cast { inner, to } => {
            let ft = type_of(inner, h);
            if !ft.overlaps(*to) {
                return TypeSet::MISSING;
            }
            let mut out = *to;
            if ft & *to != ft {
                out |= TypeSet::MISSING;
            }
            out
        }
        Expr::Case(c) => {
            // the union type of every THEN limb, plus ELSE (or NULL)
            let mut out = TypeSet::EMPTY;
            for limb in &c.limbs {
                out |= type_of(&limb.then, h);
            }
            match &c.else_expr {
                Some(e) => out | type_of(e, h),
                None => out | TypeSet::NULL,
            }
        }
        Expr::Aggregate(a) => aggregate_type(a.op, a.inner.as_ref(), h),
        Expr::Builtin { func, .. } => builtin_type(*func),

        Expr::Lookup(_) => TypeSet::ANY,
        Expr::Appended(_) | Expr::List(_) => TypeSet::LIST,
        Expr::Struct(_) => TypeSet::STRUCT,
        Expr::Unpivot(_) => TypeSet::ANY,
        Expr::Select(_) | Expr::Union(_) => TypeSet::ANY,
    }
}

fn arith_type(op: crate::node::ArithOp, left: &Expr, right: &Expr, h: &dyn Hint) -> TypeSet {
    use crate::node::ArithOp;
    let lt = type_of(left, h);
    if !lt.overlaps(TypeSet::NUMERIC) {
        return TypeSet::MISSING;
    }
    let rt = type_of(right, h);
    if !rt.overlaps(TypeSet::NUMERIC) {
        return TypeSet::MISSING;
    }
    let mut both = lt | rt;
    // div and mod can yield MISSING on a zero divisor even when both
    // inputs are always numbers; non-numeric inputs also yield MISSING
    if matches!(op, ArithOp::Div | ArithOp::Mod)
        || !both.without(TypeSet::NUMERIC).is_empty()
    {
        both |= TypeSet::MISSING;
    }
    both & (TypeSet::NUMERIC | TypeSet::MISSING)
}

fn aggregate_type(op: AggregateOp, inner: Option<&Expr>, h: &dyn Hint) -> TypeSet {
    match op {
        AggregateOp::Count
        | AggregateOp::CountDistinct
        | AggregateOp::SumCount
        | AggregateOp::ApproxCountDistinct
        | AggregateOp::ApproxCountDistinctMerge
        | AggregateOp::RowNumber
        | AggregateOp::Rank
        | AggregateOp::DenseRank => TypeSet::UINT,
        // if the inner type is only ever unsigned, so is the sum
        AggregateOp::SumInt => inner.map_or(TypeSet::INTEGER, |e| type_of(e, h)),
        AggregateOp::Earliest | AggregateOp::Latest => TypeSet::TIME | TypeSet::NULL,
        AggregateOp::BoolAnd | AggregateOp::BoolOr => TypeSet::BOOL | TypeSet::NULL,
        AggregateOp::Datashape | AggregateOp::DatashapeMerge => TypeSet::STRUCT,
        AggregateOp::ApproxCountDistinctPartial => TypeSet::LIST,
        _ => TypeSet::NUMERIC | TypeSet::NULL,
    }
}

fn builtin_type(func: BuiltinOp) -> TypeSet {
    use BuiltinOp::*;
    match func {
        Upper | Lower | Trim | Ltrim | Rtrim | Concat | Substring => {
            TypeSet::STRING | TypeSet::MISSING
        }
        Abs | Round | Floor | Ceil | Sqrt | Ln | Log | Exp | Pow | Least | Greatest => {
            TypeSet::NUMERIC | TypeSet::MISSING
        }
        DateAdd | DateTrunc => TypeSet::TIME | TypeSet::MISSING,
        DateDiff | DateExtract | CharLength => TypeSet::INTEGER | TypeSet::MISSING,
        MakeList => TypeSet::LIST,
        MakeStruct => TypeSet::STRUCT,
        TypeBit => TypeSet::UINT,
        PartitionValue => TypeSet::ANY,
    }
}

/// Returns whether `op` compares for order (`<`, `<=`, `>`, `>=`) rather
/// than identity.
pub fn is_ordinal(op: CmpOp) -> bool {
    matches!(op, CmpOp::Less | CmpOp::LessEq | CmpOp::Greater | CmpOp::GreaterEq)
}

#[cfg(test)]
mod tests {
    use super::{type_of, NoHint, TypeSet};
    use crate::node::Expr;

    #[test]
    fn set_algebra() {
        assert!(TypeSet::NUMERIC.contains(TypeSet::INT));
        assert!(!TypeSet::NUMERIC.overlaps(TypeSet::STRING));
        assert_eq!(
            TypeSet::LOGICAL.without(TypeSet::BOOL),
            TypeSet::MISSING | TypeSet::NULL
        );
        assert_eq!(!TypeSet::ANY, TypeSet::EMPTY);
        assert_eq!(format!("{:?}", TypeSet::BOOL | TypeSet::NULL), "{null|bool}");
    }

    #[test]
    fn comparison_and_is_types() {
        let cmp = Expr::cmp(
            crate::node::CmpOp::Less,
            Expr::ident("x"),
            Expr::Integer(3),
        );
        assert_eq!(type_of(&cmp, &NoHint), TypeSet::LOGICAL);
        let is = Expr::is(Expr::ident("x"), crate::node::IsKey::Null);
        assert_eq!(type_of(&is, &NoHint), TypeSet::BOOL);
    }

    #[test]
    fn division_adds_missing() {
        let div = Expr::arith(
            crate::node::ArithOp::Div,
            Expr::Integer(10),
            Expr::Integer(2),
        );
        let t = type_of(&div, &NoHint);
        assert!(t.contains(TypeSet::MISSING));
        let add = Expr::arith(
            crate::node::ArithOp::Add,
            Expr::Integer(10),
            Expr::Integer(2),
        );
        let t = type_of(&add, &NoHint);
        assert!(!t.contains(TypeSet::MISSING));
    }
}
