use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::ToPrimitive;

use opal_wire::{Bag, Datum};

use crate::path::Binding;
use crate::query::Select;

/// A comparison operator.
///
/// The ordinal operators are kept contiguous so order comparisons can be
/// detected cheaply; see [`crate::types::is_ordinal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Less,
    /// `<=`
    LessEq,
    /// `>`
    Greater,
    /// `>=`
    GreaterEq,
}

impl CmpOp {
    /// The operator equivalent to `self` with the operand order reversed.
    pub fn flip(self) -> CmpOp {
        match self {
            CmpOp::Less => CmpOp::Greater,
            CmpOp::LessEq => CmpOp::GreaterEq,
            CmpOp::Greater => CmpOp::Less,
            CmpOp::GreaterEq => CmpOp::LessEq,
            other => other,
        }
    }

    /// The operator computing `NOT (a self b)`.
    pub fn invert(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::NotEq,
            CmpOp::NotEq => CmpOp::Eq,
            CmpOp::Less => CmpOp::GreaterEq,
            CmpOp::LessEq => CmpOp::Greater,
            CmpOp::Greater => CmpOp::LessEq,
            CmpOp::GreaterEq => CmpOp::Less,
        }
    }

    pub(crate) fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "<>",
            CmpOp::Less => "<",
            CmpOp::LessEq => "<=",
            CmpOp::Greater => ">",
            CmpOp::GreaterEq => ">=",
        }
    }
}

/// A logical connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    /// `A AND B`
    And,
    /// `A OR B`
    Or,
    /// `A XNOR B` (`A = B` over booleans)
    Xnor,
    /// `A XOR B` (`A <> B` over booleans)
    Xor,
}

/// A binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeftLogical,
    ShiftRightArith,
    ShiftRightLogical,
}

impl ArithOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::BitAnd => "&",
            ArithOp::BitOr => "|",
            ArithOp::BitXor => "^",
            ArithOp::ShiftLeftLogical => "<<",
            ArithOp::ShiftRightArith => ">>",
            ArithOp::ShiftRightLogical => ">>>",
        }
    }
}

/// A unary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryArithOp {
    /// Numeric negation (`-x`).
    Neg,
    /// Bitwise complement (`~x`).
    BitNot,
}

/// A string pattern-match operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringMatchOp {
    /// Case-sensitive `LIKE`.
    Like,
    /// Case-insensitive `LIKE`.
    Ilike,
    /// `SIMILAR TO` regular expression.
    SimilarTo,
    /// POSIX regular expression match (`~`).
    RegexpMatch,
    /// Case-insensitive POSIX match (`~*`).
    RegexpMatchCi,
}

impl StringMatchOp {
    pub(crate) fn keyword(self) -> &'static str {
        match self {
            StringMatchOp::Like => "LIKE",
            StringMatchOp::Ilike => "ILIKE",
            StringMatchOp::SimilarTo => "SIMILAR TO",
            StringMatchOp::RegexpMatch => "~",
            StringMatchOp::RegexpMatchCi => "~*",
        }
    }
}

/// The keyword operand of an `IS` test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum IsKey {
    Null,
    NotNull,
    Missing,
    NotMissing,
    True,
    NotTrue,
    False,
    NotFalse,
}

impl IsKey {
    /// The keyword testing the complementary condition.
    pub fn invert(self) -> IsKey {
        match self {
            IsKey::Null => IsKey::NotNull,
            IsKey::NotNull => IsKey::Null,
            IsKey::Missing => IsKey::NotMissing,
            IsKey::NotMissing => IsKey::Missing,
            IsKey::True => IsKey::NotTrue,
            IsKey::NotTrue => IsKey::True,
            IsKey::False => IsKey::NotFalse,
            IsKey::NotFalse => IsKey::False,
        }
    }
}

/// An aggregation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    /// `COUNT(...)`
    Count,
    /// `SUM(...)`
    Sum,
    /// `AVG(...)`
    Avg,
    /// `MIN(...)`
    Min,
    /// `MAX(...)`
    Max,
    /// `COUNT(DISTINCT ...)`
    CountDistinct,
    /// `SUM` restricted to integer inputs (always yields an integer).
    SumInt,
    /// `SUM` that yields 0 instead of NULL on empty input; used to merge
    /// `COUNT` results in the reduction phase.
    SumCount,
    /// `BIT_AND(...)`
    BitAnd,
    /// `BIT_OR(...)`
    BitOr,
    /// `BIT_XOR(...)`
    BitXor,
    /// `BOOL_AND(...)`
    BoolAnd,
    /// `BOOL_OR(...)`
    BoolOr,
    /// `MIN` over timestamps.
    Earliest,
    /// `MAX` over timestamps.
    Latest,
    /// `APPROX_COUNT_DISTINCT(...)`
    ApproxCountDistinct,
    /// Per-node partial state of `APPROX_COUNT_DISTINCT`.
    ApproxCountDistinctPartial,
    /// Merge of `APPROX_COUNT_DISTINCT` partial states.
    ApproxCountDistinctMerge,
    /// `VARIANCE_POP(...)`
    VariancePop,
    /// `STDDEV_POP(...)`
    StdDevPop,
    /// `ROW_NUMBER()` window function.
    RowNumber,
    /// `RANK()` window function.
    Rank,
    /// `DENSE_RANK()` window function.
    DenseRank,
    /// `OPAL_DATASHAPE(...)` schema sampling aggregate.
    Datashape,
    /// Merge of `OPAL_DATASHAPE` partial results.
    DatashapeMerge,
}

impl AggregateOp {
    /// The SQL spelling of the operation.
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Count => "COUNT",
            AggregateOp::Sum => "SUM",
            AggregateOp::Avg => "AVG",
            AggregateOp::Min => "MIN",
            AggregateOp::Max => "MAX",
            AggregateOp::CountDistinct => "COUNT DISTINCT",
            AggregateOp::SumInt => "SUM_INT",
            AggregateOp::SumCount => "SUM_COUNT",
            AggregateOp::BitAnd => "BIT_AND",
            AggregateOp::BitOr => "BIT_OR",
            AggregateOp::BitXor => "BIT_XOR",
            AggregateOp::BoolAnd => "BOOL_AND",
            AggregateOp::BoolOr => "BOOL_OR",
            AggregateOp::Earliest => "EARLIEST",
            AggregateOp::Latest => "LATEST",
            AggregateOp::ApproxCountDistinct => "APPROX_COUNT_DISTINCT",
            AggregateOp::ApproxCountDistinctPartial => "APPROX_COUNT_DISTINCT_PARTIAL",
            AggregateOp::ApproxCountDistinctMerge => "APPROX_COUNT_DISTINCT_MERGE",
            AggregateOp::VariancePop => "VARIANCE_POP",
            AggregateOp::StdDevPop => "STDDEV_POP",
            AggregateOp::RowNumber => "ROW_NUMBER",
            AggregateOp::Rank => "RANK",
            AggregateOp::DenseRank => "DENSE_RANK",
            AggregateOp::Datashape => "OPAL_DATASHAPE",
            AggregateOp::DatashapeMerge => "OPAL_DATASHAPE_MERGE",
        }
    }

    /// The result-column name used when a binding has no explicit alias.
    pub fn default_result(self) -> &'static str {
        match self {
            AggregateOp::Count
            | AggregateOp::CountDistinct
            | AggregateOp::SumCount
            | AggregateOp::ApproxCountDistinct
            | AggregateOp::ApproxCountDistinctPartial
            | AggregateOp::ApproxCountDistinctMerge => "count",
            AggregateOp::Sum | AggregateOp::SumInt => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min | AggregateOp::Earliest => "min",
            AggregateOp::Max | AggregateOp::Latest => "max",
            AggregateOp::BitAnd => "bit_and",
            AggregateOp::BitOr => "bit_or",
            AggregateOp::BitXor => "bit_xor",
            AggregateOp::BoolAnd => "bool_and",
            AggregateOp::BoolOr => "bool_or",
            AggregateOp::VariancePop => "variance_pop",
            AggregateOp::StdDevPop => "stddev_pop",
            AggregateOp::RowNumber => "row_number",
            AggregateOp::Rank => "rank",
            AggregateOp::DenseRank => "dense_rank",
            AggregateOp::Datashape | AggregateOp::DatashapeMerge => "datashape",
        }
    }

    /// Returns whether the op is only valid inside a window.
    pub fn window_only(self) -> bool {
        matches!(
            self,
            AggregateOp::RowNumber | AggregateOp::Rank | AggregateOp::DenseRank
        )
    }

    /// Returns whether the op can be applied to `*`.
    pub fn accepts_star(self) -> bool {
        matches!(self, AggregateOp::Count | AggregateOp::Datashape)
    }
}

/// An `OVER (...)` window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// `PARTITION BY` expressions.
    pub partition_by: Vec<Expr>,
    /// `ORDER BY` terms.
    pub order_by: Vec<Order>,
}

/// One ordering term (used by `ORDER BY` and windows).
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Sort key expression.
    pub column: Expr,
    /// Descending order.
    pub desc: bool,
    /// `NULLS LAST` placement.
    pub nulls_last: bool,
}

/// An aggregation expression, possibly windowed and filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// The aggregation operation.
    pub op: AggregateOp,
    /// Precision parameter for the approximate-count family; 0 means the
    /// engine default.
    pub precision: u8,
    /// The aggregated expression; `None` for pure window functions.
    pub inner: Option<Expr>,
    /// The `OVER` clause, if any.
    pub over: Option<Window>,
    /// The `FILTER (WHERE ...)` clause, if any.
    pub filter: Option<Expr>,
}

/// One `WHEN ... THEN ...` limb.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseLimb {
    /// Condition.
    pub when: Expr,
    /// Result when the condition holds.
    pub then: Expr,
}

/// A `CASE` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    /// The case limbs; there ought to be at least one.
    pub limbs: Vec<CaseLimb>,
    /// The `ELSE` limb, or `None` if unspecified.
    pub else_expr: Option<Expr>,
    /// Result-type hint forwarded to expression compilation; some
    /// lowerings make the valence of the CASE obvious.
    pub valence: Option<String>,
}

/// An associative lookup against a constant table.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    /// The value to look up in `keys`.
    pub expr: Expr,
    /// Value when no key matches; MISSING when `None`.
    pub else_expr: Option<Expr>,
    /// Lookup keys.
    pub keys: Bag,
    /// Values corresponding to `keys`, position-wise.
    pub values: Bag,
}

/// A labeled member of a struct literal.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    /// Field label.
    pub label: String,
    /// Field value; constant by construction.
    pub value: Expr,
}

/// An `UNPIVOT ... AS v AT k` source expression.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpivotExpr {
    /// The tuple being unpivoted.
    pub inner: Expr,
    /// Binding for field values.
    pub as_name: Option<String>,
    /// Binding for field names.
    pub at_name: Option<String>,
}

/// `UNION` flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnionKind {
    /// `UNION` (duplicates removed).
    Distinct,
    /// `UNION ALL`.
    All,
}

/// A pair of queries joined by `UNION`.
#[derive(Debug, Clone, PartialEq)]
pub struct Union {
    /// Union flavor.
    pub kind: UnionKind,
    /// Left query.
    pub left: Expr,
    /// Right query.
    pub right: Expr,
}

/// A scalar builtin function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BuiltinOp {
    Upper,
    Lower,
    Trim,
    Ltrim,
    Rtrim,
    Concat,
    Substring,
    CharLength,
    Abs,
    Round,
    Floor,
    Ceil,
    Sqrt,
    Ln,
    Log,
    Exp,
    Pow,
    Least,
    Greatest,
    DateAdd,
    DateDiff,
    DateExtract,
    DateTrunc,
    MakeList,
    MakeStruct,
    TypeBit,
    /// Placeholder resolved by the execution layer to the value of a
    /// partition slot or a substituted sub-plan result.
    PartitionValue,
}

impl BuiltinOp {
    /// The SQL spelling of the function.
    pub fn name(self) -> &'static str {
        match self {
            BuiltinOp::Upper => "UPPER",
            BuiltinOp::Lower => "LOWER",
            BuiltinOp::Trim => "TRIM",
            BuiltinOp::Ltrim => "LTRIM",
            BuiltinOp::Rtrim => "RTRIM",
            BuiltinOp::Concat => "CONCAT",
            BuiltinOp::Substring => "SUBSTRING",
            BuiltinOp::CharLength => "CHAR_LENGTH",
            BuiltinOp::Abs => "ABS",
            BuiltinOp::Round => "ROUND",
            BuiltinOp::Floor => "FLOOR",
            BuiltinOp::Ceil => "CEIL",
            BuiltinOp::Sqrt => "SQRT",
            BuiltinOp::Ln => "LN",
            BuiltinOp::Log => "LOG",
            BuiltinOp::Exp => "EXP",
            BuiltinOp::Pow => "POW",
            BuiltinOp::Least => "LEAST",
            BuiltinOp::Greatest => "GREATEST",
            BuiltinOp::DateAdd => "DATE_ADD",
            BuiltinOp::DateDiff => "DATE_DIFF",
            BuiltinOp::DateExtract => "EXTRACT",
            BuiltinOp::DateTrunc => "DATE_TRUNC",
            BuiltinOp::MakeList => "MAKE_LIST",
            BuiltinOp::MakeStruct => "MAKE_STRUCT",
            BuiltinOp::TypeBit => "TYPE_BIT",
            BuiltinOp::PartitionValue => "PARTITION_VALUE",
        }
    }

    /// Resolve an upper-cased function name.
    pub fn from_name(name: &str) -> Option<BuiltinOp> {
        const ALL: [BuiltinOp; 27] = [
            BuiltinOp::Upper,
            BuiltinOp::Lower,
            BuiltinOp::Trim,
            BuiltinOp::Ltrim,
            BuiltinOp::Rtrim,
            BuiltinOp::Concat,
            BuiltinOp::Substring,
            BuiltinOp::CharLength,
            BuiltinOp::Abs,
            BuiltinOp::Round,
            BuiltinOp::Floor,
            BuiltinOp::Ceil,
            BuiltinOp::Sqrt,
            BuiltinOp::Ln,
            BuiltinOp::Log,
            BuiltinOp::Exp,
            BuiltinOp::Pow,
            BuiltinOp::Least,
            BuiltinOp::Greatest,
            BuiltinOp::DateAdd,
            BuiltinOp::DateDiff,
            BuiltinOp::DateExtract,
            BuiltinOp::DateTrunc,
            BuiltinOp::MakeList,
            BuiltinOp::MakeStruct,
            BuiltinOp::TypeBit,
            BuiltinOp::PartitionValue,
        ];
        ALL.into_iter().find(|op| op.name() == name)
    }
}

/// An expression AST node.
///
/// Equality (`==`) is structural equivalence with numeric coercion:
/// `Integer(0)`, `Float(0.0)`, and `Rational(0/1)` compare equal.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Float literal.
    Float(f64),
    /// Arbitrary-precision rational literal.
    Rational(Box<BigRational>),
    /// String literal.
    String(String),
    /// Timestamp literal.
    Timestamp(DateTime<Utc>),
    /// The NULL literal.
    Null,
    /// The MISSING literal.
    Missing,
    /// A top-level identifier.
    Ident(String),
    /// Field access: `inner.field`.
    Dot {
        /// Base expression.
        inner: Box<Expr>,
        /// Field name.
        field: String,
    },
    /// List indexing: `inner[offset]`. The offset is constant.
    Index {
        /// Base expression (list-typed).
        inner: Box<Expr>,
        /// Zero-based constant offset.
        offset: i64,
    },
    /// The `*` path component.
    Star,
    /// Logical negation.
    Not(Box<Expr>),
    /// Unary arithmetic.
    UnaryArith {
        /// Operator.
        op: UnaryArithOp,
        /// Operand.
        inner: Box<Expr>,
    },
    /// Binary arithmetic.
    Arith {
        /// Operator.
        op: ArithOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Comparison.
    Cmp {
        /// Operator.
        op: CmpOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical connective.
    Logical {
        /// Operator.
        op: LogicalOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// String pattern match.
    StringMatch {
        /// Operator.
        op: StringMatchOp,
        /// Matched expression.
        inner: Box<Expr>,
        /// Pattern literal.
        pattern: String,
        /// Optional escape character.
        escape: Option<char>,
    },
    /// `IS` keyword test.
    Is {
        /// Tested expression.
        inner: Box<Expr>,
        /// Keyword operand.
        key: IsKey,
    },
    /// `IN` against a bag of constants.
    Member {
        /// Tested expression.
        arg: Box<Expr>,
        /// Constant membership set.
        set: Bag,
    },
    /// Hash lookup against a constant table.
    Lookup(Box<Lookup>),
    /// `CASE` expression.
    Case(Box<Case>),
    /// `CAST(inner AS to)`.
    Cast {
        /// Source expression.
        inner: Box<Expr>,
        /// Target type; typically a single bit.
        to: crate::types::TypeSet,
    },
    /// Builtin function call.
    Builtin {
        /// Function.
        func: BuiltinOp,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// Aggregate expression.
    Aggregate(Box<Aggregate>),
    /// Append (`++`) of two or more values.
    Appended(Vec<Expr>),
    /// Struct literal; field values are constants.
    Struct(Vec<StructField>),
    /// List literal; elements are constants.
    List(Vec<Expr>),
    /// `UNPIVOT` source expression.
    Unpivot(Box<UnpivotExpr>),
    /// Subquery.
    Select(Box<Select>),
    /// `UNION` of two queries.
    Union(Box<Union>),
}

impl Expr {
    /// Identifier constructor.
    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Ident(name.into())
    }

    /// String literal constructor.
    pub fn string(s: impl Into<String>) -> Expr {
        Expr::String(s.into())
    }

    /// `inner.field`
    pub fn dot(inner: Expr, field: impl Into<String>) -> Expr {
        Expr::Dot {
            inner: Box::new(inner),
            field: field.into(),
        }
    }

    /// `inner[offset]`
    pub fn index(inner: Expr, offset: i64) -> Expr {
        Expr::Index {
            inner: Box::new(inner),
            offset,
        }
    }

    /// Comparison constructor.
    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Binary arithmetic constructor.
    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Expr {
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left AND right`
    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::Logical {
            op: LogicalOp::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left OR right`
    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::Logical {
            op: LogicalOp::Or,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `NOT inner`
    pub fn not(inner: Expr) -> Expr {
        Expr::Not(Box::new(inner))
    }

    /// `inner IS key`
    pub fn is(inner: Expr, key: IsKey) -> Expr {
        Expr::Is {
            inner: Box::new(inner),
            key,
        }
    }

    /// Builtin call constructor.
    pub fn call(func: BuiltinOp, args: Vec<Expr>) -> Expr {
        Expr::Builtin { func, args }
    }

    /// `val BETWEEN lo AND hi`, expressed as a conjunction.
    pub fn between(val: Expr, lo: Expr, hi: Expr) -> Expr {
        Expr::and(
            Expr::cmp(CmpOp::GreaterEq, val.clone(), lo),
            Expr::cmp(CmpOp::LessEq, val, hi),
        )
    }

    /// `val IN (items...)`.
    ///
    /// An all-constant right-hand side lowers to a [`Expr::Member`] bag
    /// test; anything else expands to a chain of equality ORs. An empty
    /// list never matches.
    pub fn in_list(val: Expr, items: Vec<Expr>) -> Expr {
        if items.is_empty() {
            return Expr::Bool(false);
        }
        if items.iter().all(|e| e.as_datum().is_some()) {
            let set: Bag = items.iter().filter_map(Expr::as_datum).collect();
            return Expr::Member {
                arg: Box::new(val),
                set,
            };
        }
        let mut iter = items.into_iter();
        let first = iter.next().expect("list is non-empty");
        let mut out = Expr::cmp(CmpOp::Eq, val.clone(), first);
        for item in iter {
            out = Expr::or(out, Expr::cmp(CmpOp::Eq, val.clone(), item));
        }
        out
    }

    /// `COALESCE(args...)` lowered to a CASE with `IS NOT NULL` tests.
    pub fn coalesce(args: Vec<Expr>) -> Expr {
        let limbs = args
            .iter()
            .map(|e| CaseLimb {
                when: Expr::is(e.clone(), IsKey::NotNull),
                then: e.clone(),
            })
            .collect();
        Expr::Case(Box::new(Case {
            limbs,
            else_expr: Some(Expr::Null),
            valence: None,
        }))
    }

    /// `NULLIF(a, b)` lowered to `CASE WHEN a = b THEN NULL ELSE a END`.
    pub fn null_if(a: Expr, b: Expr) -> Expr {
        Expr::if_then_else(Expr::cmp(CmpOp::Eq, a.clone(), b), Expr::Null, a)
    }

    /// Ternary conditional as a single-limb CASE.
    pub fn if_then_else(when: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Case(Box::new(Case {
            limbs: vec![CaseLimb { when, then }],
            else_expr: Some(otherwise),
            valence: None,
        }))
    }

    /// `COUNT(e)`
    pub fn count(e: Expr) -> Expr {
        Expr::aggregate(AggregateOp::Count, Some(e))
    }

    /// `COUNT(*)`
    pub fn count_star() -> Expr {
        Expr::aggregate(AggregateOp::Count, Some(Expr::Star))
    }

    /// `SUM(e)`
    pub fn sum(e: Expr) -> Expr {
        Expr::aggregate(AggregateOp::Sum, Some(e))
    }

    /// Plain aggregate constructor (no window, no filter).
    pub fn aggregate(op: AggregateOp, inner: Option<Expr>) -> Expr {
        Expr::Aggregate(Box::new(Aggregate {
            op,
            precision: 0,
            inner,
            over: None,
            filter: None,
        }))
    }

    /// Append (`++`); nested appends flatten.
    pub fn append(left: Expr, right: Expr) -> Expr {
        let mut values = Vec::new();
        for e in [left, right] {
            match e {
                Expr::Appended(inner) => values.extend(inner),
                other => values.push(other),
            }
        }
        Expr::Appended(values)
    }

    /// Returns whether this node is a constant value.
    pub fn is_constant(&self) -> bool {
        self.as_datum().is_some()
    }

    /// The wire datum for a constant node, or `None` for anything else.
    ///
    /// Integer-valued rationals canonicalize to integers; struct and list
    /// literals convert member-wise.
    pub fn as_datum(&self) -> Option<Datum> {
        match self {
            Expr::Bool(b) => Some(Datum::Bool(*b)),
            Expr::Integer(i) => Some(Datum::Int(*i)),
            Expr::Float(f) => Some(Datum::Float(*f)),
            Expr::String(s) => Some(Datum::String(s.clone())),
            Expr::Timestamp(t) => Some(Datum::Timestamp(*t)),
            Expr::Null => Some(Datum::Null),
            Expr::Rational(r) => {
                if r.is_integer() {
                    if let Some(i) = r.numer().to_i64() {
                        return Some(Datum::Int(i));
                    }
                }
                r.to_f64().map(Datum::Float)
            }
            Expr::Struct(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    out.push(opal_wire::Field::new(f.label.clone(), f.value.as_datum()?));
                }
                Some(Datum::Struct(out))
            }
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.as_datum()?);
                }
                Some(Datum::List(out))
            }
            _ => None,
        }
    }

    /// The constant expression for a wire datum, or `None` when the datum
    /// has no literal form (symbols, blobs).
    pub fn from_datum(d: &Datum) -> Option<Expr> {
        match d {
            Datum::Null => Some(Expr::Null),
            Datum::Bool(b) => Some(Expr::Bool(*b)),
            Datum::Int(i) => Some(Expr::Integer(*i)),
            Datum::Uint(u) => i64::try_from(*u).ok().map(Expr::Integer),
            Datum::Float(f) => Some(Expr::Float(*f)),
            Datum::String(s) => Some(Expr::String(s.clone())),
            Datum::Timestamp(t) => Some(Expr::Timestamp(*t)),
            Datum::List(items) => items
                .iter()
                .map(Expr::from_datum)
                .collect::<Option<Vec<_>>>()
                .map(Expr::List),
            Datum::Struct(fields) => fields
                .iter()
                .map(|f| {
                    Expr::from_datum(&f.value).map(|value| StructField {
                        label: f.label.clone(),
                        value,
                    })
                })
                .collect::<Option<Vec<_>>>()
                .map(Expr::Struct),
            Datum::Symbol(_) | Datum::Blob(_) => None,
        }
    }

    /// Pre-order traversal. The callback decides whether to descend into
    /// the children of each visited node; terminal leaves (literals,
    /// including struct and list literals) have no children.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr) -> bool) {
        if !f(self) {
            return;
        }
        match self {
            Expr::Bool(_)
            | Expr::Integer(_)
            | Expr::Float(_)
            | Expr::Rational(_)
            | Expr::String(_)
            | Expr::Timestamp(_)
            | Expr::Null
            | Expr::Missing
            | Expr::Ident(_)
            | Expr::Star
            | Expr::Struct(_)
            | Expr::List(_) => {}
            Expr::Dot { inner, .. }
            | Expr::Index { inner, .. }
            | Expr::Not(inner)
            | Expr::UnaryArith { inner, .. }
            | Expr::Is { inner, .. }
            | Expr::Cast { inner, .. }
            | Expr::StringMatch { inner, .. } => inner.walk(f),
            Expr::Arith { left, right, .. }
            | Expr::Cmp { left, right, .. }
            | Expr::Logical { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Member { arg, .. } => arg.walk(f),
            Expr::Lookup(l) => {
                l.expr.walk(f);
                if let Some(e) = &l.else_expr {
                    e.walk(f);
                }
            }
            Expr::Case(c) => {
                for limb in &c.limbs {
                    limb.when.walk(f);
                    limb.then.walk(f);
                }
                if let Some(e) = &c.else_expr {
                    e.walk(f);
                }
            }
            Expr::Builtin { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            Expr::Aggregate(a) => {
                if let Some(inner) = &a.inner {
                    inner.walk(f);
                }
                if let Some(over) = &a.over {
                    for p in &over.partition_by {
                        p.walk(f);
                    }
                    for o in &over.order_by {
                        o.column.walk(f);
                    }
                }
                if let Some(filter) = &a.filter {
                    filter.walk(f);
                }
            }
            Expr::Appended(values) => {
                for v in values {
                    v.walk(f);
                }
            }
            Expr::Unpivot(u) => u.inner.walk(f),
            Expr::Select(s) => s.walk(f),
            Expr::Union(u) => {
                u.left.walk(f);
                u.right.walk(f);
            }
        }
    }

    /// Rebuild this node with every direct child replaced by `f(child)`.
    pub fn map_children(self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        match self {
            Expr::Dot { inner, field } => Expr::Dot {
                inner: Box::new(f(*inner)),
                field,
            },
            Expr::Index { inner, offset } => Expr::Index {
                inner: Box::new(f(*inner)),
                offset,
            },
            Expr::Not(inner) => Expr::Not(Box::new(f(*inner))),
            Expr::UnaryArith { op, inner } => Expr::UnaryArith {
                op,
                inner: Box::new(f(*inner)),
            },
            Expr::Arith { op, left, right } => Expr::Arith {
                op,
                left: Box::new(f(*left)),
                right: Box::new(f(*right)),
            },
            Expr::Cmp { op, left, right } => Expr::Cmp {
                op,
                left: Box::new(f(*left)),
                right: Box::new(f(*right)),
            },
            Expr::Logical { op, left, right } => Expr::Logical {
                op,
                left: Box::new(f(*left)),
                right: Box::new(f(*right)),
            },
            Expr::StringMatch {
                op,
                inner,
                pattern,
                escape,
            } => Expr::StringMatch {
                op,
                inner: Box::new(f(*inner)),
                pattern,
                escape,
            },
            Expr::Is { inner, key } => Expr::Is {
                inner: Box::new(f(*inner)),
                key,
            },
            Expr::Member { arg, set } => Expr::Member {
                arg: Box::new(f(*arg)),
                set,
            },
            Expr::Lookup(mut l) => {
                l.expr = f(l.expr);
                l.else_expr = l.else_expr.map(&mut *f);
                Expr::Lookup(l)
            }
            Expr::Case(mut c) => {
                for limb in &mut c.limbs {
                    let when = std::mem::replace(&mut limb.when, Expr::Null);
                    let then = std::mem::replace(&mut limb.then, Expr::Null);
                    limb.when = f(when);
                    limb.then = f(then);
                }
                c.else_expr = c.else_expr.map(&mut *f);
                Expr::Case(c)
            }
            Expr::Cast { inner, to } => Expr::Cast {
                inner: Box::new(f(*inner)),
                to,
            },
            Expr::Builtin { func, args } => Expr::Builtin {
                func,
                args: args.into_iter().map(&mut *f).collect(),
            },
            Expr::Aggregate(mut a) => {
                a.inner = a.inner.map(&mut *f);
                if let Some(over) = &mut a.over {
                    let partition = std::mem::take(&mut over.partition_by);
                    over.partition_by = partition.into_iter().map(&mut *f).collect();
                    for o in &mut over.order_by {
                        let col = std::mem::replace(&mut o.column, Expr::Null);
                        o.column = f(col);
                    }
                }
                a.filter = a.filter.map(&mut *f);
                Expr::Aggregate(a)
            }
            Expr::Appended(values) => Expr::Appended(values.into_iter().map(&mut *f).collect()),
            Expr::Unpivot(mut u) => {
                u.inner = f(u.inner);
                Expr::Unpivot(u)
            }
            Expr::Union(mut u) => {
                u.left = f(u.left);
                u.right = f(u.right);
                Expr::Union(u)
            }
            Expr::Select(s) => Expr::Select(Box::new(s.map_exprs(f))),
            // terminal leaves, including struct/list literals
            leaf => leaf,
        }
    }
}

/// Post-order rewriter with a descend predicate.
pub trait Rewriter {
    /// Returns whether traversal should proceed into the children of `e`.
    fn descend(&mut self, e: &Expr) -> bool {
        let _ = e;
        true
    }

    /// Transform one node after its children have been rewritten.
    fn rewrite(&mut self, e: Expr) -> Expr;
}

impl Expr {
    /// Apply a [`Rewriter`] in depth-first (post-order) fashion.
    pub fn rewrite(self, r: &mut dyn Rewriter) -> Expr {
        let e = if r.descend(&self) {
            self.map_children(&mut |c| c.rewrite(r))
        } else {
            self
        };
        r.rewrite(e)
    }

    /// Apply a transform bottom-up, descending everywhere.
    pub fn rewrite_with(self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        let e = self.map_children(&mut |c| c.rewrite_with(f));
        f(e)
    }
}

pub(crate) fn as_rational(e: &Expr) -> Option<BigRational> {
    match e {
        Expr::Integer(i) => Some(BigRational::from_integer(BigInt::from(*i))),
        Expr::Float(f) => BigRational::from_float(*f),
        Expr::Rational(r) => Some((**r).clone()),
        _ => None,
    }
}

fn numeric_eq(a: &Expr, b: &Expr) -> Option<bool> {
    match (a, b) {
        (Expr::Integer(x), Expr::Integer(y)) => Some(x == y),
        (Expr::Float(x), Expr::Float(y)) => Some(x == y),
        (Expr::Integer(i), Expr::Float(f)) | (Expr::Float(f), Expr::Integer(i)) => {
            let trunc = *f as i64;
            Some(trunc as f64 == *f && trunc == *i)
        }
        (Expr::Rational(r), other) | (other, Expr::Rational(r)) => {
            let o = as_rational(other)?;
            Some(**r == o)
        }
        _ => None,
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Expr) -> bool {
        if let Some(eq) = numeric_eq(self, other) {
            return eq;
        }
        match (self, other) {
            (Expr::Bool(a), Expr::Bool(b)) => a == b,
            (Expr::String(a), Expr::String(b)) => a == b,
            (Expr::Timestamp(a), Expr::Timestamp(b)) => a == b,
            (Expr::Null, Expr::Null) => true,
            (Expr::Missing, Expr::Missing) => true,
            (Expr::Ident(a), Expr::Ident(b)) => a == b,
            (
                Expr::Dot { inner: ai, field: af },
                Expr::Dot { inner: bi, field: bf },
            ) => af == bf && ai == bi,
            (
                Expr::Index { inner: ai, offset: ao },
                Expr::Index { inner: bi, offset: bo },
            ) => ao == bo && ai == bi,
            (Expr::Star, Expr::Star) => true,
            (Expr::Not(a), Expr::Not(b)) => a == b,
            (
                Expr::UnaryArith { op: ao, inner: ai },
                Expr::UnaryArith { op: bo, inner: bi },
            ) => ao == bo && ai == bi,
            (
                Expr::Arith { op: ao, left: al, right: ar },
                Expr::Arith { op: bo, left: bl, right: br },
            ) => ao == bo && al == bl && ar == br,
            (
                Expr::Cmp { op: ao, left: al, right: ar },
                Expr::Cmp { op: bo, left: bl, right: br },
            ) => ao == bo && al == bl && ar == br,
            (
                Expr::Logical { op: ao, left: al, right: ar },
                Expr::Logical { op: bo, left: bl, right: br },
            ) => ao == bo && al == bl && ar == br,
            (
                Expr::StringMatch { op: ao, inner: ai, pattern: ap, escape: ae },
                Expr::StringMatch { op: bo, inner: bi, pattern: bp, escape: be },
            ) => ao == bo && ap == bp && ae == be && ai == bi,
            (
                Expr::Is { inner: ai, key: ak },
                Expr::Is { inner: bi, key: bk },
            ) => ak == bk && ai == bi,
            (
                Expr::Member { arg: aa, set: als },
                Expr::Member { arg: ba, set: bls },
            ) => als == bls && aa == ba,
            (Expr::Lookup(a), Expr::Lookup(b)) => a == b,
            (Expr::Case(a), Expr::Case(b)) => a == b,
            (
                Expr::Cast { inner: ai, to: at },
                Expr::Cast { inner: bi, to: bt },
            ) => at == bt && ai == bi,
            (
                Expr::Builtin { func: af, args: aa },
                Expr::Builtin { func: bf, args: ba },
            ) => af == bf && aa == ba,
            (Expr::Aggregate(a), Expr::Aggregate(b)) => a == b,
            (Expr::Appended(a), Expr::Appended(b)) => a == b,
            (Expr::Struct(a), Expr::Struct(b)) => a == b,
            (Expr::List(a), Expr::List(b)) => a == b,
            (Expr::Unpivot(a), Expr::Unpivot(b)) => a == b,
            (Expr::Select(a), Expr::Select(b)) => a == b,
            (Expr::Union(a), Expr::Union(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregateOp, ArithOp, CmpOp, Expr};
    use num_bigint::BigInt;
    use num_rational::BigRational;

    fn rat(n: i64, d: i64) -> Expr {
        Expr::Rational(Box::new(BigRational::new(BigInt::from(n), BigInt::from(d))))
    }

    #[test]
    fn numeric_equivalence_law() {
        let zero_i = Expr::Integer(0);
        let zero_f = Expr::Float(0.0);
        let zero_r = rat(0, 1);
        // reflexivity, symmetry across representations
        assert_eq!(zero_i, zero_f);
        assert_eq!(zero_f, zero_i);
        assert_eq!(zero_i, zero_r);
        assert_eq!(zero_r, zero_i);
        assert_eq!(zero_f, zero_r);
        assert_eq!(zero_r, zero_f);
        // non-equal values stay non-equal
        assert_ne!(Expr::Integer(1), Expr::Float(1.5));
        assert_ne!(rat(1, 2), Expr::Integer(1));
        assert_eq!(rat(3, 2), Expr::Float(1.5));
        assert_eq!(rat(4, 2), Expr::Integer(2));
    }

    #[test]
    fn structural_equality_is_strict_about_order() {
        let a = Expr::and(
            Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
            Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3)),
        );
        let b = Expr::and(
            Expr::cmp(CmpOp::Eq, Expr::ident("y"), Expr::Integer(3)),
            Expr::cmp(CmpOp::Greater, Expr::ident("x"), Expr::Integer(5)),
        );
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn in_list_of_constants_becomes_member() {
        let e = Expr::in_list(
            Expr::ident("x"),
            vec![Expr::Integer(1), Expr::string("two"), Expr::Float(3.0)],
        );
        let Expr::Member { set, .. } = &e else {
            panic!("expected member, got {e:?}");
        };
        assert_eq!(set.len(), 3);

        let e = Expr::in_list(Expr::ident("x"), vec![Expr::Integer(1), Expr::ident("y")]);
        assert!(matches!(e, Expr::Logical { .. }));
    }

    #[test]
    fn append_flattens() {
        let e = Expr::append(
            Expr::append(Expr::ident("a"), Expr::ident("b")),
            Expr::ident("c"),
        );
        let Expr::Appended(values) = &e else {
            panic!("expected append");
        };
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn walk_is_preorder_and_skippable() {
        let e = Expr::arith(
            ArithOp::Add,
            Expr::arith(ArithOp::Mul, Expr::ident("a"), Expr::Integer(2)),
            Expr::ident("b"),
        );
        let mut seen = Vec::new();
        e.walk(&mut |n| {
            seen.push(crate::to_text(n));
            true
        });
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], "a * 2 + b");

        // refuse to descend into the multiply
        let mut count = 0usize;
        e.walk(&mut |n| {
            count += 1;
            !matches!(n, Expr::Arith { op: ArithOp::Mul, .. })
        });
        assert_eq!(count, 3);
    }

    #[test]
    fn rewrite_is_postorder() {
        let e = Expr::arith(ArithOp::Add, Expr::Integer(1), Expr::Integer(2));
        let out = e.rewrite_with(&mut |n| match n {
            Expr::Integer(i) => Expr::Integer(i * 10),
            other => other,
        });
        assert_eq!(
            out,
            Expr::arith(ArithOp::Add, Expr::Integer(10), Expr::Integer(20))
        );
    }

    #[test]
    fn default_result_names() {
        assert_eq!(AggregateOp::Count.default_result(), "count");
        assert_eq!(AggregateOp::SumCount.default_result(), "count");
        assert_eq!(AggregateOp::BoolAnd.default_result(), "bool_and");
    }
}
