use num_bigint::BigInt;
use num_rational::BigRational;

use opal_common::{Error, Result};
use opal_wire::{Bag, Datum, Field};

use crate::node::{
    Aggregate, AggregateOp, ArithOp, Case, CaseLimb, CmpOp, Expr, IsKey, LogicalOp, Lookup, Order,
    StringMatchOp, StructField, UnaryArithOp, Union, UnionKind, UnpivotExpr, Window,
};
use crate::node::BuiltinOp;
use crate::path::Binding;
use crate::query::{From, JoinKind, Select};
use crate::types::TypeSet;

// Wire codes follow declaration order and never change; appending new
// variants is the only compatible evolution.
macro_rules! op_codes {
    ($ty:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        impl $ty {
            fn code(self) -> u64 {
                match self { $($ty::$variant => $code),+ }
            }
            fn from_code(c: u64) -> Result<Self> {
                match c {
                    $($code => Ok($ty::$variant),)+
                    other => Err(Error::Decode(format!(
                        "bad {} code {other}", stringify!($ty),
                    ))),
                }
            }
        }
    };
}

op_codes!(CmpOp {
    Eq = 0,
    NotEq = 1,
    Less = 2,
    LessEq = 3,
    Greater = 4,
    GreaterEq = 5,
});

op_codes!(LogicalOp {
    And = 0,
    Or = 1,
    Xnor = 2,
    Xor = 3,
});

op_codes!(ArithOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    BitAnd = 5,
    BitOr = 6,
    BitXor = 7,
    ShiftLeftLogical = 8,
    ShiftRightArith = 9,
    ShiftRightLogical = 10,
});

op_codes!(UnaryArithOp {
    Neg = 0,
    BitNot = 1,
});

op_codes!(StringMatchOp {
    Like = 0,
    Ilike = 1,
    SimilarTo = 2,
    RegexpMatch = 3,
    RegexpMatchCi = 4,
});

op_codes!(IsKey {
    Null = 0,
    NotNull = 1,
    Missing = 2,
    NotMissing = 3,
    True = 4,
    NotTrue = 5,
    False = 6,
    NotFalse = 7,
});

op_codes!(AggregateOp {
    Count = 1,
    Sum = 2,
    Avg = 3,
    Min = 4,
    Max = 5,
    CountDistinct = 6,
    SumInt = 7,
    SumCount = 8,
    BitAnd = 9,
    BitOr = 10,
    BitXor = 11,
    BoolAnd = 12,
    BoolOr = 13,
    Earliest = 14,
    Latest = 15,
    ApproxCountDistinct = 16,
    ApproxCountDistinctPartial = 17,
    ApproxCountDistinctMerge = 18,
    VariancePop = 19,
    StdDevPop = 20,
    RowNumber = 21,
    Rank = 22,
    DenseRank = 23,
    Datashape = 24,
    DatashapeMerge = 25,
});

op_codes!(UnionKind {
    Distinct = 0,
    All = 1,
});

op_codes!(JoinKind {
    Cross = 0,
    Inner = 1,
});

fn tagged(ty: &str, fields: Vec<Field>) -> Datum {
    let mut all = Vec::with_capacity(fields.len() + 1);
    all.push(Field::new("type", Datum::Symbol(ty.to_string())));
    all.extend(fields);
    Datum::Struct(all)
}

fn sym(s: &str) -> Datum {
    Datum::Symbol(s.to_string())
}

impl Expr {
    /// Encode this expression as a wire datum.
    ///
    /// Bare literals encode as the corresponding primitives; every other
    /// variant encodes as a struct tagged with a `type` symbol.
    pub fn encode(&self) -> Datum {
        match self {
            Expr::Bool(b) => Datum::Bool(*b),
            Expr::Integer(i) => Datum::Int(*i),
            Expr::Float(f) => Datum::Float(*f),
            Expr::String(s) => Datum::String(s.clone()),
            Expr::Timestamp(t) => Datum::Timestamp(*t),
            Expr::Null => Datum::Null,
            Expr::Ident(name) => Datum::Symbol(name.clone()),
            Expr::Missing => tagged("missing", vec![]),
            Expr::Star => tagged("star", vec![]),
            Expr::Rational(r) => tagged(
                "rat",
                vec![
                    Field::new("num", Datum::Blob(r.numer().to_signed_bytes_le())),
                    Field::new("den", Datum::Blob(r.denom().to_signed_bytes_le())),
                ],
            ),
            Expr::Dot { inner, field } => tagged(
                "dot",
                vec![
                    Field::new("inner", inner.encode()),
                    Field::new("field", sym(field)),
                ],
            ),
            Expr::Index { inner, offset } => tagged(
                "index",
                vec![
                    Field::new("inner", inner.encode()),
                    Field::new("offset", Datum::Int(*offset)),
                ],
            ),
            Expr::Not(inner) => tagged("not", vec![Field::new("inner", inner.encode())]),
            Expr::UnaryArith { op, inner } => tagged(
                "unaryArith",
                vec![
                    Field::new("op", Datum::Uint(op.code())),
                    Field::new("child", inner.encode()),
                ],
            ),
            Expr::Arith { op, left, right } => tagged(
                "arith",
                vec![
                    Field::new("op", Datum::Uint(op.code())),
                    Field::new("left", left.encode()),
                    Field::new("right", right.encode()),
                ],
            ),
            Expr::Cmp { op, left, right } => tagged(
                "cmp",
                vec![
                    Field::new("op", Datum::Uint(op.code())),
                    Field::new("left", left.encode()),
                    Field::new("right", right.encode()),
                ],
            ),
            Expr::Logical { op, left, right } => tagged(
                "logical",
                vec![
                    Field::new("op", Datum::Uint(op.code())),
                    Field::new("left", left.encode()),
                    Field::new("right", right.encode()),
                ],
            ),
            Expr::StringMatch {
                op,
                inner,
                pattern,
                escape,
            } => {
                let mut fields = vec![
                    Field::new("op", Datum::Uint(op.code())),
                    Field::new("expr", inner.encode()),
                    Field::new("pattern", Datum::String(pattern.clone())),
                ];
                if let Some(c) = escape {
                    fields.push(Field::new("escape", Datum::String(c.to_string())));
                }
                tagged("stringmatch", fields)
            }
            Expr::Is { inner, key } => tagged(
                "is",
                vec![
                    Field::new("key", Datum::Uint(key.code())),
                    Field::new("inner", inner.encode()),
                ],
            ),
            Expr::Member { arg, set } => tagged(
                "member",
                vec![
                    Field::new("arg", arg.encode()),
                    Field::new("values", set.to_list()),
                ],
            ),
            Expr::Lookup(l) => {
                let mut fields = vec![Field::new("expr", l.expr.encode())];
                if let Some(e) = &l.else_expr {
                    fields.push(Field::new("else", e.encode()));
                }
                fields.push(Field::new("keys", l.keys.to_list()));
                fields.push(Field::new("values", l.values.to_list()));
                tagged("lookup", fields)
            }
            Expr::Case(c) => {
                // limbs encode as [[when, then] ...]
                let limbs = c
                    .limbs
                    .iter()
                    .map(|l| Datum::List(vec![l.when.encode(), l.then.encode()]))
                    .collect();
                let mut fields = vec![Field::new("limbs", Datum::List(limbs))];
                if let Some(e) = &c.else_expr {
                    fields.push(Field::new("else", e.encode()));
                }
                if let Some(v) = &c.valence {
                    fields.push(Field::new("valence", Datum::String(v.clone())));
                }
                tagged("case", fields)
            }
            Expr::Cast { inner, to } => tagged(
                "cast",
                vec![
                    Field::new("from", inner.encode()),
                    Field::new("to", Datum::Int(to.0 as i64)),
                ],
            ),
            Expr::Builtin { func, args } => tagged(
                "builtin",
                vec![
                    Field::new("func", Datum::String(func.name().to_string())),
                    Field::new(
                        "args",
                        Datum::List(args.iter().map(Expr::encode).collect()),
                    ),
                ],
            ),
            Expr::Aggregate(a) => encode_aggregate(a),
            Expr::Appended(values) => tagged(
                "append",
                vec![Field::new(
                    "values",
                    Datum::List(values.iter().map(Expr::encode).collect()),
                )],
            ),
            Expr::Struct(fields) => tagged(
                "struct",
                vec![Field::new(
                    "fields",
                    Datum::List(
                        fields
                            .iter()
                            .map(|f| {
                                Datum::List(vec![
                                    Datum::String(f.label.clone()),
                                    f.value.encode(),
                                ])
                            })
                            .collect(),
                    ),
                )],
            ),
            Expr::List(items) => tagged(
                "list",
                vec![Field::new(
                    "values",
                    Datum::List(items.iter().map(Expr::encode).collect()),
                )],
            ),
            Expr::Unpivot(u) => {
                let mut fields = vec![Field::new("expr", u.inner.encode())];
                if let Some(v) = &u.as_name {
                    fields.push(Field::new("as", Datum::String(v.clone())));
                }
                if let Some(k) = &u.at_name {
                    fields.push(Field::new("at", Datum::String(k.clone())));
                }
                tagged("unpivot", fields)
            }
            Expr::Select(s) => encode_select(s),
            Expr::Union(u) => tagged(
                "union",
                vec![
                    Field::new("uniontype", Datum::Uint(u.kind.code())),
                    Field::new("left", u.left.encode()),
                    Field::new("right", u.right.encode()),
                ],
            ),
        }
    }
}

fn encode_aggregate(a: &Aggregate) -> Datum {
    let mut fields = vec![Field::new("op", Datum::Uint(a.op.code()))];
    if matches!(
        a.op,
        AggregateOp::ApproxCountDistinct
            | AggregateOp::ApproxCountDistinctPartial
            | AggregateOp::ApproxCountDistinctMerge
    ) {
        fields.push(Field::new("precision", Datum::Uint(a.precision as u64)));
    }
    if let Some(inner) = &a.inner {
        fields.push(Field::new("inner", inner.encode()));
    }
    if let Some(over) = &a.over {
        fields.push(Field::new(
            "over_partition",
            Datum::List(over.partition_by.iter().map(Expr::encode).collect()),
        ));
        if !over.order_by.is_empty() {
            fields.push(Field::new("over_order_by", encode_orders(&over.order_by)));
        }
    }
    if let Some(filter) = &a.filter {
        fields.push(Field::new("filter_where", filter.encode()));
    }
    tagged("aggregate", fields)
}

/// Encode an ordering list.
pub fn encode_orders(orders: &[Order]) -> Datum {
    Datum::List(
        orders
            .iter()
            .map(|o| {
                Datum::Struct(vec![
                    Field::new("col", o.column.encode()),
                    Field::new("desc", Datum::Bool(o.desc)),
                    Field::new("nulls_last", Datum::Bool(o.nulls_last)),
                ])
            })
            .collect(),
    )
}

/// Encode a binding.
pub fn encode_binding(b: &Binding) -> Datum {
    let mut fields = vec![Field::new("expr", b.expr.encode())];
    if let Some(name) = b.explicit_result() {
        fields.push(Field::new("bind", Datum::String(name.to_string())));
    }
    Datum::Struct(fields)
}

/// Encode a binding list.
pub fn encode_bindings(bindings: &[Binding]) -> Datum {
    Datum::List(bindings.iter().map(encode_binding).collect())
}

fn encode_from(f: &From) -> Datum {
    match f {
        From::Table(b) => tagged("table", vec![Field::new("binding", encode_binding(b))]),
        From::Join {
            kind,
            on,
            left,
            right,
        } => {
            let mut fields = vec![Field::new("kind", Datum::Uint(kind.code()))];
            if let Some(on) = on {
                fields.push(Field::new("on", on.encode()));
            }
            fields.push(Field::new("left", encode_from(left)));
            fields.push(Field::new("right", encode_binding(right)));
            tagged("join", fields)
        }
    }
}

fn encode_select(s: &Select) -> Datum {
    let mut fields = Vec::new();
    if s.distinct {
        fields.push(Field::new("distinct", Datum::Bool(true)));
    }
    fields.push(Field::new("columns", encode_bindings(&s.columns)));
    if let Some(from) = &s.from {
        fields.push(Field::new("from", encode_from(from)));
    }
    if let Some(w) = &s.where_clause {
        fields.push(Field::new("where", w.encode()));
    }
    if !s.group_by.is_empty() {
        fields.push(Field::new("group_by", encode_bindings(&s.group_by)));
    }
    if let Some(h) = &s.having {
        fields.push(Field::new("having", h.encode()));
    }
    if !s.order_by.is_empty() {
        fields.push(Field::new("order_by", encode_orders(&s.order_by)));
    }
    if let Some(limit) = s.limit {
        fields.push(Field::new("limit", Datum::Uint(limit)));
    }
    if let Some(offset) = s.offset {
        fields.push(Field::new("offset", Datum::Uint(offset)));
    }
    tagged("select", fields)
}

fn unexpected(label: &str) -> Error {
    Error::Decode(format!("unexpected field '{label}'"))
}

fn field_expr(f: &Field) -> Result<Expr> {
    decode(&f.value).map_err(|e| e.in_field(&f.label))
}

/// Decode an expression from a wire datum.
pub fn decode(d: &Datum) -> Result<Expr> {
    match d {
        Datum::Null => Ok(Expr::Null),
        Datum::Bool(b) => Ok(Expr::Bool(*b)),
        Datum::Int(i) => Ok(Expr::Integer(*i)),
        Datum::Uint(u) => i64::try_from(*u)
            .map(Expr::Integer)
            .map_err(|_| Error::Decode(format!("integer literal {u} out of range"))),
        Datum::Float(f) => Ok(Expr::Float(*f)),
        Datum::String(s) => Ok(Expr::String(s.clone())),
        Datum::Symbol(s) => Ok(Expr::ident(s.clone())),
        Datum::Timestamp(t) => Ok(Expr::Timestamp(*t)),
        Datum::Struct(fields) => decode_struct(fields),
        other => Err(Error::Decode(format!(
            "cannot decode expression from {}",
            other.type_name()
        ))),
    }
}

fn struct_type<'a>(fields: &'a [Field]) -> Result<&'a str> {
    for f in fields {
        if f.label == "type" {
            return f.value.as_str().map_err(|e| e.in_field("type"));
        }
    }
    Err(Error::Decode("expression struct has no 'type' field".to_string()))
}

fn decode_struct(fields: &[Field]) -> Result<Expr> {
    let ty = struct_type(fields)?;
    let rest: Vec<&Field> = fields.iter().filter(|f| f.label != "type").collect();
    match ty {
        "missing" => expect_empty(&rest).map(|_| Expr::Missing),
        "star" => expect_empty(&rest).map(|_| Expr::Star),
        "rat" => decode_rat(&rest),
        "dot" => decode_dot(&rest),
        "index" => decode_index(&rest),
        "not" => decode_not(&rest),
        "unaryArith" => decode_unary(&rest),
        "arith" => decode_binop(&rest, |op, left, right| {
            Ok(Expr::arith(ArithOp::from_code(op)?, left, right))
        }),
        "cmp" => decode_binop(&rest, |op, left, right| {
            Ok(Expr::cmp(CmpOp::from_code(op)?, left, right))
        }),
        "logical" => decode_binop(&rest, |op, left, right| {
            Ok(Expr::Logical {
                op: LogicalOp::from_code(op)?,
                left: Box::new(left),
                right: Box::new(right),
            })
        }),
        "stringmatch" => decode_stringmatch(&rest),
        "is" => decode_is(&rest),
        "member" => decode_member(&rest),
        "lookup" => decode_lookup(&rest),
        "case" => decode_case(&rest),
        "cast" => decode_cast(&rest),
        "builtin" => decode_builtin(&rest),
        "aggregate" => decode_aggregate(&rest),
        "append" => decode_append(&rest),
        "struct" => decode_struct_literal(&rest),
        "list" => decode_list_literal(&rest),
        "unpivot" => decode_unpivot(&rest),
        "select" => decode_select(&rest).map(|s| Expr::Select(Box::new(s))),
        "union" => decode_union(&rest),
        other => Err(Error::Decode(format!("unknown expression type '{other}'"))),
    }
}

fn expect_empty(fields: &[&Field]) -> Result<()> {
    match fields.first() {
        None => Ok(()),
        Some(f) => Err(unexpected(&f.label)),
    }
}

fn decode_rat(fields: &[&Field]) -> Result<Expr> {
    let mut num = None;
    let mut den = None;
    for f in fields {
        match f.label.as_str() {
            "num" => num = Some(f.value.as_blob().map_err(|e| e.in_field("num"))?),
            "den" => den = Some(f.value.as_blob().map_err(|e| e.in_field("den"))?),
            other => return Err(unexpected(other)),
        }
    }
    let (num, den) = match (num, den) {
        (Some(n), Some(d)) => (n, d),
        _ => return Err(Error::Decode("rational is missing num/den".to_string())),
    };
    let num = BigInt::from_signed_bytes_le(num);
    let den = BigInt::from_signed_bytes_le(den);
    if den == BigInt::from(0) {
        return Err(Error::Decode("rational with zero denominator".to_string()));
    }
    Ok(Expr::Rational(Box::new(BigRational::new(num, den))))
}

fn decode_dot(fields: &[&Field]) -> Result<Expr> {
    let mut inner = None;
    let mut name = None;
    for f in fields {
        match f.label.as_str() {
            "inner" => inner = Some(field_expr(f)?),
            "field" => name = Some(f.value.as_str().map_err(|e| e.in_field("field"))?),
            other => return Err(unexpected(other)),
        }
    }
    match (inner, name) {
        (Some(inner), Some(name)) => Ok(Expr::dot(inner, name)),
        _ => Err(Error::Decode("dot is missing inner/field".to_string())),
    }
}

fn decode_index(fields: &[&Field]) -> Result<Expr> {
    let mut inner = None;
    let mut offset = None;
    for f in fields {
        match f.label.as_str() {
            "inner" => inner = Some(field_expr(f)?),
            "offset" => offset = Some(f.value.as_int().map_err(|e| e.in_field("offset"))?),
            other => return Err(unexpected(other)),
        }
    }
    match (inner, offset) {
        (Some(inner), Some(offset)) => Ok(Expr::index(inner, offset)),
        _ => Err(Error::Decode("index is missing inner/offset".to_string())),
    }
}

fn decode_not(fields: &[&Field]) -> Result<Expr> {
    let mut inner = None;
    for f in fields {
        match f.label.as_str() {
            "inner" => inner = Some(field_expr(f)?),
            other => return Err(unexpected(other)),
        }
    }
    inner
        .map(Expr::not)
        .ok_or_else(|| Error::Decode("not is missing inner".to_string()))
}

fn decode_unary(fields: &[&Field]) -> Result<Expr> {
    let mut op = None;
    let mut child = None;
    for f in fields {
        match f.label.as_str() {
            "op" => op = Some(f.value.as_uint().map_err(|e| e.in_field("op"))?),
            "child" => child = Some(field_expr(f)?),
            other => return Err(unexpected(other)),
        }
    }
    match (op, child) {
        (Some(op), Some(child)) => Ok(Expr::UnaryArith {
            op: UnaryArithOp::from_code(op)?,
            inner: Box::new(child),
        }),
        _ => Err(Error::Decode("unaryArith is missing op/child".to_string())),
    }
}

fn decode_binop(
    fields: &[&Field],
    build: impl FnOnce(u64, Expr, Expr) -> Result<Expr>,
) -> Result<Expr> {
    let mut op = None;
    let mut left = None;
    let mut right = None;
    for f in fields {
        match f.label.as_str() {
            "op" => op = Some(f.value.as_uint().map_err(|e| e.in_field("op"))?),
            "left" => left = Some(field_expr(f)?),
            "right" => right = Some(field_expr(f)?),
            other => return Err(unexpected(other)),
        }
    }
    match (op, left, right) {
        (Some(op), Some(left), Some(right)) => build(op, left, right),
        _ => Err(Error::Decode("binary op is missing op/left/right".to_string())),
    }
}

fn decode_stringmatch(fields: &[&Field]) -> Result<Expr> {
    let mut op = None;
    let mut expr = None;
    let mut pattern = None;
    let mut escape = None;
    for f in fields {
        match f.label.as_str() {
            "op" => op = Some(f.value.as_uint().map_err(|e| e.in_field("op"))?),
            "expr" => expr = Some(field_expr(f)?),
            "pattern" => {
                pattern = Some(f.value.as_str().map_err(|e| e.in_field("pattern"))?.to_string())
            }
            "escape" => {
                let s = f.value.as_str().map_err(|e| e.in_field("escape"))?;
                escape = s.chars().next();
            }
            other => return Err(unexpected(other)),
        }
    }
    match (op, expr, pattern) {
        (Some(op), Some(expr), Some(pattern)) => Ok(Expr::StringMatch {
            op: StringMatchOp::from_code(op)?,
            inner: Box::new(expr),
            pattern,
            escape,
        }),
        _ => Err(Error::Decode("stringmatch is missing fields".to_string())),
    }
}

fn decode_is(fields: &[&Field]) -> Result<Expr> {
    let mut key = None;
    let mut inner = None;
    for f in fields {
        match f.label.as_str() {
            "key" => key = Some(f.value.as_uint().map_err(|e| e.in_field("key"))?),
            "inner" => inner = Some(field_expr(f)?),
            other => return Err(unexpected(other)),
        }
    }
    match (key, inner) {
        (Some(key), Some(inner)) => Ok(Expr::is(inner, IsKey::from_code(key)?)),
        _ => Err(Error::Decode("is is missing key/inner".to_string())),
    }
}

fn decode_member(fields: &[&Field]) -> Result<Expr> {
    let mut arg = None;
    let mut set = None;
    for f in fields {
        match f.label.as_str() {
            "arg" => arg = Some(field_expr(f)?),
            "values" => set = Some(Bag::from_list(&f.value).map_err(|e| e.in_field("values"))?),
            other => return Err(unexpected(other)),
        }
    }
    match (arg, set) {
        (Some(arg), Some(set)) => Ok(Expr::Member {
            arg: Box::new(arg),
            set,
        }),
        _ => Err(Error::Decode("member is missing arg/values".to_string())),
    }
}

fn decode_lookup(fields: &[&Field]) -> Result<Expr> {
    let mut expr = None;
    let mut else_expr = None;
    let mut keys = None;
    let mut values = None;
    for f in fields {
        match f.label.as_str() {
            "expr" => expr = Some(field_expr(f)?),
            "else" => else_expr = Some(field_expr(f)?),
            "keys" => keys = Some(Bag::from_list(&f.value).map_err(|e| e.in_field("keys"))?),
            "values" => {
                values = Some(Bag::from_list(&f.value).map_err(|e| e.in_field("values"))?)
            }
            other => return Err(unexpected(other)),
        }
    }
    match (expr, keys, values) {
        (Some(expr), Some(keys), Some(values)) => Ok(Expr::Lookup(Box::new(Lookup {
            expr,
            else_expr,
            keys,
            values,
        }))),
        _ => Err(Error::Decode("lookup is missing fields".to_string())),
    }
}

fn decode_case(fields: &[&Field]) -> Result<Expr> {
    let mut limbs = Vec::new();
    let mut else_expr = None;
    let mut valence = None;
    for f in fields {
        match f.label.as_str() {
            "limbs" => {
                for item in f.value.as_list().map_err(|e| e.in_field("limbs"))? {
                    let pair = item.as_list().map_err(|e| e.in_field("limbs"))?;
                    if pair.len() != 2 {
                        return Err(Error::Decode(format!(
                            "case limb has {} elements, want 2",
                            pair.len()
                        )));
                    }
                    limbs.push(CaseLimb {
                        when: decode(&pair[0]).map_err(|e| e.in_field("limbs"))?,
                        then: decode(&pair[1]).map_err(|e| e.in_field("limbs"))?,
                    });
                }
            }
            "else" => else_expr = Some(field_expr(f)?),
            "valence" => {
                valence = Some(f.value.as_str().map_err(|e| e.in_field("valence"))?.to_string())
            }
            other => return Err(unexpected(other)),
        }
    }
    Ok(Expr::Case(Box::new(Case {
        limbs,
        else_expr,
        valence,
    })))
}

fn decode_cast(fields: &[&Field]) -> Result<Expr> {
    let mut from = None;
    let mut to = None;
    for f in fields {
        match f.label.as_str() {
            "from" => from = Some(field_expr(f)?),
            "to" => to = Some(f.value.as_int().map_err(|e| e.in_field("to"))?),
            other => return Err(unexpected(other)),
        }
    }
    match (from, to) {
        (Some(from), Some(to)) => Ok(Expr::Cast {
            inner: Box::new(from),
            to: TypeSet(to as u16),
        }),
        _ => Err(Error::Decode("cast is missing from/to".to_string())),
    }
}

fn decode_builtin(fields: &[&Field]) -> Result<Expr> {
    let mut func = None;
    let mut args = Vec::new();
    for f in fields {
        match f.label.as_str() {
            "func" => {
                let name = f.value.as_str().map_err(|e| e.in_field("func"))?;
                func = Some(BuiltinOp::from_name(name).ok_or_else(|| {
                    Error::Decode(format!("unknown builtin function '{name}'"))
                })?);
            }
            "args" => {
                for item in f.value.as_list().map_err(|e| e.in_field("args"))? {
                    args.push(decode(item).map_err(|e| e.in_field("args"))?);
                }
            }
            other => return Err(unexpected(other)),
        }
    }
    match func {
        Some(func) => Ok(Expr::Builtin { func, args }),
        None => Err(Error::Decode("builtin is missing func".to_string())),
    }
}

fn decode_aggregate(fields: &[&Field]) -> Result<Expr> {
    let mut op = None;
    let mut precision = 0u8;
    let mut inner = None;
    let mut over: Option<Window> = None;
    let mut filter = None;
    for f in fields {
        match f.label.as_str() {
            "op" => op = Some(f.value.as_uint().map_err(|e| e.in_field("op"))?),
            "precision" => {
                precision = f.value.as_uint().map_err(|e| e.in_field("precision"))? as u8
            }
            "inner" => inner = Some(field_expr(f)?),
            "over_partition" => {
                let w = over.get_or_insert_with(|| Window {
                    partition_by: vec![],
                    order_by: vec![],
                });
                for item in f.value.as_list().map_err(|e| e.in_field("over_partition"))? {
                    w.partition_by
                        .push(decode(item).map_err(|e| e.in_field("over_partition"))?);
                }
            }
            "over_order_by" => {
                let w = over.get_or_insert_with(|| Window {
                    partition_by: vec![],
                    order_by: vec![],
                });
                w.order_by = decode_orders(&f.value).map_err(|e| e.in_field("over_order_by"))?;
            }
            "filter_where" => filter = Some(field_expr(f)?),
            other => return Err(unexpected(other)),
        }
    }
    match op {
        Some(op) => Ok(Expr::Aggregate(Box::new(Aggregate {
            op: AggregateOp::from_code(op)?,
            precision,
            inner,
            over,
            filter,
        }))),
        None => Err(Error::Decode("aggregate is missing op".to_string())),
    }
}

fn decode_append(fields: &[&Field]) -> Result<Expr> {
    let mut values = Vec::new();
    for f in fields {
        match f.label.as_str() {
            "values" => {
                for item in f.value.as_list().map_err(|e| e.in_field("values"))? {
                    values.push(decode(item).map_err(|e| e.in_field("values"))?);
                }
            }
            other => return Err(unexpected(other)),
        }
    }
    Ok(Expr::Appended(values))
}

fn decode_struct_literal(fields: &[&Field]) -> Result<Expr> {
    let mut out = Vec::new();
    for f in fields {
        match f.label.as_str() {
            "fields" => {
                for item in f.value.as_list().map_err(|e| e.in_field("fields"))? {
                    let pair = item.as_list().map_err(|e| e.in_field("fields"))?;
                    if pair.len() != 2 {
                        return Err(Error::Decode("struct field is not a pair".to_string()));
                    }
                    out.push(StructField {
                        label: pair[0].as_str().map_err(|e| e.in_field("fields"))?.to_string(),
                        value: decode(&pair[1]).map_err(|e| e.in_field("fields"))?,
                    });
                }
            }
            other => return Err(unexpected(other)),
        }
    }
    Ok(Expr::Struct(out))
}

fn decode_list_literal(fields: &[&Field]) -> Result<Expr> {
    let mut items = Vec::new();
    for f in fields {
        match f.label.as_str() {
            "values" => {
                for item in f.value.as_list().map_err(|e| e.in_field("values"))? {
                    items.push(decode(item).map_err(|e| e.in_field("values"))?);
                }
            }
            other => return Err(unexpected(other)),
        }
    }
    Ok(Expr::List(items))
}

fn decode_unpivot(fields: &[&Field]) -> Result<Expr> {
    let mut inner = None;
    let mut as_name = None;
    let mut at_name = None;
    for f in fields {
        match f.label.as_str() {
            "expr" => inner = Some(field_expr(f)?),
            "as" => as_name = Some(f.value.as_str().map_err(|e| e.in_field("as"))?.to_string()),
            "at" => at_name = Some(f.value.as_str().map_err(|e| e.in_field("at"))?.to_string()),
            other => return Err(unexpected(other)),
        }
    }
    match inner {
        Some(inner) => Ok(Expr::Unpivot(Box::new(UnpivotExpr {
            inner,
            as_name,
            at_name,
        }))),
        None => Err(Error::Decode("unpivot is missing expr".to_string())),
    }
}

fn decode_union(fields: &[&Field]) -> Result<Expr> {
    let mut kind = None;
    let mut left = None;
    let mut right = None;
    for f in fields {
        match f.label.as_str() {
            "uniontype" => kind = Some(f.value.as_uint().map_err(|e| e.in_field("uniontype"))?),
            "left" => left = Some(field_expr(f)?),
            "right" => right = Some(field_expr(f)?),
            other => return Err(unexpected(other)),
        }
    }
    match (kind, left, right) {
        (Some(kind), Some(left), Some(right)) => Ok(Expr::Union(Box::new(Union {
            kind: UnionKind::from_code(kind)?,
            left,
            right,
        }))),
        _ => Err(Error::Decode("union is missing fields".to_string())),
    }
}

/// Decode an ordering list (the inverse of [`encode_orders`]).
pub fn decode_orders(d: &Datum) -> Result<Vec<Order>> {
    let mut out = Vec::new();
    for item in d.as_list()? {
        let mut column = None;
        let mut desc = false;
        let mut nulls_last = false;
        for f in item.as_struct()? {
            match f.label.as_str() {
                "col" => column = Some(field_expr(f)?),
                "desc" => desc = f.value.as_bool().map_err(|e| e.in_field("desc"))?,
                "nulls_last" => {
                    nulls_last = f.value.as_bool().map_err(|e| e.in_field("nulls_last"))?
                }
                other => return Err(unexpected(other)),
            }
        }
        out.push(Order {
            column: column.ok_or_else(|| Error::Decode("order term is missing col".to_string()))?,
            desc,
            nulls_last,
        });
    }
    Ok(out)
}

/// Decode a binding (the inverse of [`encode_binding`]).
pub fn decode_binding(d: &Datum) -> Result<Binding> {
    let mut expr = None;
    let mut bind = None;
    for f in d.as_struct()? {
        match f.label.as_str() {
            "expr" => expr = Some(field_expr(f)?),
            "bind" => bind = Some(f.value.as_str().map_err(|e| e.in_field("bind"))?.to_string()),
            other => return Err(unexpected(other)),
        }
    }
    let expr = expr.ok_or_else(|| Error::Decode("binding is missing expr".to_string()))?;
    Ok(match bind {
        Some(name) => Binding::bind(expr, name),
        None => Binding::auto(expr),
    })
}

/// Decode a binding list (the inverse of [`encode_bindings`]).
pub fn decode_bindings(d: &Datum) -> Result<Vec<Binding>> {
    d.as_list()?.iter().map(decode_binding).collect()
}

fn decode_from(fields: &[&Field]) -> Result<From> {
    let ty = struct_type_of(fields)?;
    let rest: Vec<&Field> = fields.iter().copied().filter(|f| f.label != "type").collect();
    match ty {
        "table" => {
            let mut binding = None;
            for f in &rest {
                match f.label.as_str() {
                    "binding" => {
                        binding = Some(decode_binding(&f.value).map_err(|e| e.in_field("binding"))?)
                    }
                    other => return Err(unexpected(other)),
                }
            }
            binding
                .map(From::Table)
                .ok_or_else(|| Error::Decode("table is missing binding".to_string()))
        }
        "join" => {
            let mut kind = None;
            let mut on = None;
            let mut left = None;
            let mut right = None;
            for f in &rest {
                match f.label.as_str() {
                    "kind" => kind = Some(f.value.as_uint().map_err(|e| e.in_field("kind"))?),
                    "on" => on = Some(field_expr(f)?),
                    "left" => {
                        let inner: Vec<&Field> =
                            f.value.as_struct().map_err(|e| e.in_field("left"))?.iter().collect();
                        left = Some(decode_from(&inner).map_err(|e| e.in_field("left"))?);
                    }
                    "right" => {
                        right = Some(decode_binding(&f.value).map_err(|e| e.in_field("right"))?)
                    }
                    other => return Err(unexpected(other)),
                }
            }
            match (kind, left, right) {
                (Some(kind), Some(left), Some(right)) => Ok(From::Join {
                    kind: JoinKind::from_code(kind)?,
                    on,
                    left: Box::new(left),
                    right,
                }),
                _ => Err(Error::Decode("join is missing fields".to_string())),
            }
        }
        other => Err(Error::Decode(format!("unknown from type '{other}'"))),
    }
}

fn struct_type_of<'a>(fields: &'a [&Field]) -> Result<&'a str> {
    for f in fields {
        if f.label == "type" {
            return f.value.as_str().map_err(|e| e.in_field("type"));
        }
    }
    Err(Error::Decode("struct has no 'type' field".to_string()))
}

fn decode_select(fields: &[&Field]) -> Result<Select> {
    let mut out = Select::default();
    for f in fields {
        match f.label.as_str() {
            "distinct" => out.distinct = f.value.as_bool().map_err(|e| e.in_field("distinct"))?,
            "columns" => {
                out.columns = decode_bindings(&f.value).map_err(|e| e.in_field("columns"))?
            }
            "from" => {
                let inner: Vec<&Field> =
                    f.value.as_struct().map_err(|e| e.in_field("from"))?.iter().collect();
                out.from = Some(decode_from(&inner).map_err(|e| e.in_field("from"))?);
            }
            "where" => out.where_clause = Some(field_expr(f)?),
            "group_by" => {
                out.group_by = decode_bindings(&f.value).map_err(|e| e.in_field("group_by"))?
            }
            "having" => out.having = Some(field_expr(f)?),
            "order_by" => {
                out.order_by = decode_orders(&f.value).map_err(|e| e.in_field("order_by"))?
            }
            "limit" => out.limit = Some(f.value.as_uint().map_err(|e| e.in_field("limit"))?),
            "offset" => out.offset = Some(f.value.as_uint().map_err(|e| e.in_field("offset"))?),
            other => return Err(unexpected(other)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::decode;
    use crate::node::{
        Aggregate, AggregateOp, ArithOp, CmpOp, Expr, IsKey, Lookup, Order, StringMatchOp,
        StructField, UnaryArithOp, Union, UnionKind, UnpivotExpr, Window,
    };
    use crate::path::Binding;
    use crate::query::{From, JoinKind, Select};
    use chrono::{TimeZone, Utc};
    use num_bigint::BigInt;
    use num_rational::BigRational;
    use opal_wire::{Bag, Datum, Symtab};

    fn round_trip(e: &Expr) -> Expr {
        // full wire round trip: datum -> bytes -> datum -> expr
        let d = e.encode();
        let mut st = Symtab::new();
        let mut buf = Vec::new();
        d.write_into(&mut st, &mut buf);
        let (back, rest) = Datum::read(&buf, &st).unwrap();
        assert!(rest.is_empty());
        decode(&back).unwrap()
    }

    fn check(e: Expr) {
        let back = round_trip(&e);
        assert_eq!(back, e, "round trip changed {e:?}");
    }

    #[test]
    fn every_variant_round_trips() {
        let ts = Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap();
        let mut bag = Bag::new();
        bag.push(Datum::Int(3));
        bag.push(Datum::String("foo".to_string()));

        check(Expr::Bool(true));
        check(Expr::Integer(-42));
        check(Expr::Float(2.5));
        check(Expr::Rational(Box::new(BigRational::new(
            BigInt::from(-10),
            BigInt::from(3),
        ))));
        check(Expr::string("hello"));
        check(Expr::Timestamp(ts));
        check(Expr::Null);
        check(Expr::Missing);
        check(Expr::ident("x"));
        check(Expr::dot(Expr::ident("t"), "field"));
        check(Expr::index(Expr::ident("lst"), 3));
        check(Expr::Star);
        check(Expr::not(Expr::ident("b")));
        check(Expr::UnaryArith {
            op: UnaryArithOp::BitNot,
            inner: Box::new(Expr::ident("m")),
        });
        check(Expr::arith(ArithOp::Mod, Expr::ident("a"), Expr::Integer(7)));
        check(Expr::cmp(CmpOp::LessEq, Expr::ident("a"), Expr::Float(1.5)));
        check(Expr::and(Expr::ident("p"), Expr::ident("q")));
        check(Expr::StringMatch {
            op: StringMatchOp::Ilike,
            inner: Box::new(Expr::ident("name")),
            pattern: "%ab_%".to_string(),
            escape: Some('\\'),
        });
        check(Expr::is(Expr::ident("x"), IsKey::NotMissing));
        check(Expr::Member {
            arg: Box::new(Expr::ident("x")),
            set: bag.clone(),
        });
        check(Expr::Lookup(Box::new(Lookup {
            expr: Expr::ident("k"),
            else_expr: Some(Expr::Integer(0)),
            keys: bag.clone(),
            values: bag,
        })));
        check(Expr::if_then_else(
            Expr::ident("c"),
            Expr::Integer(1),
            Expr::Integer(2),
        ));
        check(Expr::Cast {
            inner: Box::new(Expr::ident("x")),
            to: crate::types::TypeSet::FLOAT,
        });
        check(Expr::call(
            crate::node::BuiltinOp::Upper,
            vec![Expr::ident("s")],
        ));
        check(Expr::Aggregate(Box::new(Aggregate {
            op: AggregateOp::ApproxCountDistinct,
            precision: 12,
            inner: Some(Expr::ident("x")),
            over: None,
            filter: Some(Expr::cmp(
                CmpOp::Greater,
                Expr::ident("y"),
                Expr::Integer(0),
            )),
        })));
        check(Expr::Aggregate(Box::new(Aggregate {
            op: AggregateOp::RowNumber,
            precision: 0,
            inner: None,
            over: Some(Window {
                partition_by: vec![Expr::ident("grp")],
                order_by: vec![Order {
                    column: Expr::ident("ts"),
                    desc: true,
                    nulls_last: true,
                }],
            }),
            filter: None,
        })));
        check(Expr::append(Expr::ident("a"), Expr::ident("b")));
        check(Expr::Struct(vec![StructField {
            label: "k".to_string(),
            value: Expr::Integer(1),
        }]));
        check(Expr::List(vec![Expr::Integer(1), Expr::string("two")]));
        check(Expr::Unpivot(Box::new(UnpivotExpr {
            inner: Expr::ident("row"),
            as_name: Some("v".to_string()),
            at_name: Some("k".to_string()),
        })));
        check(Expr::Union(Box::new(Union {
            kind: UnionKind::All,
            left: Expr::Select(Box::new(Select {
                columns: vec![Binding::auto(Expr::ident("x"))],
                from: Some(From::Table(Binding::auto(Expr::ident("a")))),
                ..Select::default()
            })),
            right: Expr::Select(Box::new(Select {
                columns: vec![Binding::auto(Expr::ident("x"))],
                from: Some(From::Table(Binding::auto(Expr::ident("b")))),
                ..Select::default()
            })),
        })));
    }

    #[test]
    fn select_with_every_clause_round_trips() {
        let sel = Select {
            distinct: true,
            columns: vec![
                Binding::bind(Expr::ident("x"), "col"),
                Binding::auto(Expr::count_star()),
            ],
            from: Some(From::Join {
                kind: JoinKind::Inner,
                on: Some(Expr::cmp(
                    CmpOp::Eq,
                    Expr::dot(Expr::ident("a"), "id"),
                    Expr::dot(Expr::ident("b"), "id"),
                )),
                left: Box::new(From::Table(Binding::bind(Expr::ident("tbl"), "a"))),
                right: Binding::bind(Expr::dot(Expr::ident("a"), "items"), "b"),
            }),
            where_clause: Some(Expr::cmp(
                CmpOp::Greater,
                Expr::ident("x"),
                Expr::Integer(5),
            )),
            group_by: vec![Binding::auto(Expr::ident("x"))],
            having: Some(Expr::cmp(
                CmpOp::Greater,
                Expr::count_star(),
                Expr::Integer(1),
            )),
            order_by: vec![Order {
                column: Expr::ident("x"),
                desc: false,
                nulls_last: false,
            }],
            limit: Some(10),
            offset: Some(2),
        };
        check(Expr::Select(Box::new(sel)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let d = Expr::dot(Expr::ident("t"), "f").encode();
        let Datum::Struct(mut fields) = d else {
            panic!("expected struct");
        };
        fields.push(opal_wire::Field::new("bogus", Datum::Int(1)));
        let err = decode(&Datum::Struct(fields)).unwrap_err();
        assert!(err.to_string().contains("unexpected field 'bogus'"), "{err}");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let d = Datum::Struct(vec![opal_wire::Field::new(
            "type",
            Datum::Symbol("frobnicate".to_string()),
        )]);
        assert!(decode(&d).is_err());
    }

    #[test]
    fn nested_decode_errors_name_the_field() {
        // blob where an expression is expected, nested under 'left'
        let d = Datum::Struct(vec![
            opal_wire::Field::new("type", Datum::Symbol("cmp".to_string())),
            opal_wire::Field::new("op", Datum::Uint(0)),
            opal_wire::Field::new("left", Datum::Blob(vec![1, 2, 3])),
            opal_wire::Field::new("right", Datum::Int(1)),
        ]);
        let err = decode(&d).unwrap_err();
        assert!(err.to_string().contains("field 'left'"), "{err}");
    }
}
