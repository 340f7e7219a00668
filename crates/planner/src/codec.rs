//! Wire codec for plan trees.
//!
//! Layout: a length-prefixed symbol table block followed by the top-level
//! `{inputs, root}` struct. Every operator serializes as a struct tagged
//! with a `type` symbol; decoders dispatch on the tag and reject unknown
//! fields. Input handles are encoded and decoded by the environment; the
//! codec moves their bytes without interpreting them. The input list is
//! compressed when its encoded body exceeds the configured threshold.

use opal_common::{Error, PlannerConfig, Result};
use opal_expr::{
    decode as decode_expr, decode_binding, decode_bindings, decode_orders, encode_binding,
    encode_bindings, encode_orders, Expr, ExplainFormat,
};
use opal_wire::{compress, Datum, Field, Symtab};

use crate::env::HandleDecoder;
use crate::op::{
    CountStar, Distinct, Explain, Filter, HashAggregate, HashOrder, Hints, Input, Leaf, Limit,
    Node, Op, OrderBy, OutputIndex, OutputPart, Project, ResultColumn, SimpleAggregate,
    Substitute, Tree, UnionMap, UnionPartition, Unnest, Unpivot, UnpivotAtDistinct,
};
use crate::trace::AggBinding;

/// Serialize a plan tree.
pub fn encode(tree: &Tree, cfg: &PlannerConfig) -> Result<Vec<u8>> {
    let mut st = Symtab::new();
    let d = tree_datum(tree, cfg, &mut st)?;
    let mut body = Vec::new();
    d.write_into(&mut st, &mut body);
    let mut out = Vec::new();
    st.encode(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a plan tree. `dec` supplies the environment-owned handle
/// decoding.
pub fn decode(bytes: &[u8], dec: &dyn HandleDecoder) -> Result<Tree> {
    let (st, rest) = Symtab::decode(bytes)?;
    let (d, tail) = Datum::read(rest, &st)?;
    if !tail.is_empty() {
        return Err(Error::Decode(format!(
            "{} trailing bytes after plan",
            tail.len()
        )));
    }
    decode_tree(&d, &st, dec)
}

fn tagged(ty: &str, fields: Vec<Field>) -> Datum {
    let mut all = Vec::with_capacity(fields.len() + 1);
    all.push(Field::new("type", Datum::Symbol(ty.to_string())));
    all.extend(fields);
    Datum::Struct(all)
}

fn explain_code(f: ExplainFormat) -> u64 {
    match f {
        ExplainFormat::None => 0,
        ExplainFormat::Text => 1,
        ExplainFormat::List => 2,
        ExplainFormat::Graphviz => 3,
    }
}

fn explain_from_code(c: u64) -> Result<ExplainFormat> {
    match c {
        0 => Ok(ExplainFormat::None),
        1 => Ok(ExplainFormat::Text),
        2 => Ok(ExplainFormat::List),
        3 => Ok(ExplainFormat::Graphviz),
        other => Err(Error::Decode(format!("bad explain format {other}"))),
    }
}

fn tree_datum(tree: &Tree, cfg: &PlannerConfig, st: &mut Symtab) -> Result<Datum> {
    let mut inputs = Vec::with_capacity(tree.inputs.len());
    for input in &tree.inputs {
        inputs.push(input_datum(input)?);
    }
    let inputs = compress::compress_list(&inputs, cfg.compress_threshold_bytes, st)?;
    Ok(Datum::Struct(vec![
        Field::new("inputs", inputs),
        Field::new("root", node_datum(&tree.root, cfg, st)?),
    ]))
}

fn input_datum(input: &Input) -> Result<Datum> {
    let mut fields = vec![Field::new("table", encode_binding(&input.table))];
    if let Some(f) = &input.hints.filter {
        fields.push(Field::new("filter", f.encode()));
    }
    if !input.hints.fields.is_empty() {
        fields.push(Field::new(
            "fields",
            Datum::List(
                input
                    .hints
                    .fields
                    .iter()
                    .map(|s| Datum::String(s.clone()))
                    .collect(),
            ),
        ));
    }
    if input.hints.all_fields {
        fields.push(Field::new("all_fields", Datum::Bool(true)));
    }
    let handle = input
        .handle
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("cannot encode an un-stat'd input".to_string()))?;
    fields.push(Field::new("handle", handle.encode()));
    Ok(Datum::Struct(fields))
}

fn node_datum(node: &Node, cfg: &PlannerConfig, st: &mut Symtab) -> Result<Datum> {
    let output = node
        .output
        .iter()
        .map(|c| {
            Datum::Struct(vec![
                Field::new("name", Datum::String(c.name.clone())),
                Field::new("bits", Datum::Uint(c.ty.0 as u64)),
            ])
        })
        .collect();
    Ok(Datum::Struct(vec![
        Field::new("input", Datum::Int(node.input)),
        Field::new("op", op_datum(&node.op, cfg, st)?),
        Field::new("output", Datum::List(output)),
    ]))
}

fn agg_bindings_datum(aggs: &[AggBinding]) -> Datum {
    Datum::List(
        aggs.iter()
            .map(|a| {
                Datum::Struct(vec![
                    Field::new("agg", Expr::Aggregate(Box::new(a.agg.clone())).encode()),
                    Field::new("bind", Datum::String(a.result.clone())),
                ])
            })
            .collect(),
    )
}

fn exprs_datum(exprs: &[Expr]) -> Datum {
    Datum::List(exprs.iter().map(Expr::encode).collect())
}

fn op_datum(op: &Op, cfg: &PlannerConfig, st: &mut Symtab) -> Result<Datum> {
    let from = |from: &Op, st: &mut Symtab| -> Result<Field> {
        Ok(Field::new("from", op_datum(from, cfg, st)?))
    };
    match op {
        Op::Leaf(x) => {
            let mut fields = vec![Field::new("table", encode_binding(&x.orig))];
            if !x.on_equal.is_empty() {
                fields.push(Field::new("on_equal", exprs_datum(&x.on_equal)));
                fields.push(Field::new("equal_expr", exprs_datum(&x.equal_expr)));
            }
            Ok(tagged("leaf", fields))
        }
        Op::Filter(x) => Ok(tagged(
            "filter",
            vec![from(&x.from, st)?, Field::new("expr", x.cond.encode())],
        )),
        Op::Project(x) => Ok(tagged(
            "project",
            vec![
                from(&x.from, st)?,
                Field::new("project", encode_bindings(&x.using)),
            ],
        )),
        Op::Distinct(x) => {
            let mut fields = vec![
                from(&x.from, st)?,
                Field::new("fields", exprs_datum(&x.fields)),
            ];
            if let Some(limit) = x.limit {
                fields.push(Field::new("limit", Datum::Uint(limit)));
            }
            Ok(tagged("distinct", fields))
        }
        Op::Limit(x) => Ok(tagged(
            "limit",
            vec![from(&x.from, st)?, Field::new("num", Datum::Uint(x.num))],
        )),
        Op::OrderBy(x) => {
            let mut fields = vec![
                from(&x.from, st)?,
                Field::new("columns", encode_orders(&x.columns)),
            ];
            if let Some(limit) = x.limit {
                fields.push(Field::new("limit", Datum::Uint(limit)));
            }
            if x.offset != 0 {
                fields.push(Field::new("offset", Datum::Uint(x.offset)));
            }
            Ok(tagged("order", fields))
        }
        Op::HashAggregate(x) => {
            let mut fields = vec![
                from(&x.from, st)?,
                Field::new("agg", agg_bindings_datum(&x.agg)),
            ];
            if !x.windows.is_empty() {
                fields.push(Field::new("windows", agg_bindings_datum(&x.windows)));
            }
            fields.push(Field::new("by", encode_bindings(&x.by)));
            if !x.order_by.is_empty() {
                fields.push(Field::new(
                    "order",
                    Datum::List(
                        x.order_by
                            .iter()
                            .map(|o| {
                                Datum::Struct(vec![
                                    Field::new("col", Datum::Uint(o.column as u64)),
                                    Field::new("desc", Datum::Bool(o.desc)),
                                    Field::new("nulls_last", Datum::Bool(o.nulls_last)),
                                ])
                            })
                            .collect(),
                    ),
                ));
            }
            if let Some(limit) = x.limit {
                fields.push(Field::new("limit", Datum::Uint(limit)));
            }
            Ok(tagged("hashagg", fields))
        }
        Op::SimpleAggregate(x) => Ok(tagged(
            "simpleagg",
            vec![
                from(&x.from, st)?,
                Field::new("agg", agg_bindings_datum(&x.outputs)),
            ],
        )),
        Op::CountStar(x) => Ok(tagged(
            "countstar",
            vec![
                from(&x.from, st)?,
                Field::new("as", Datum::String(x.result.clone())),
            ],
        )),
        Op::UnionMap(x) => Ok(tagged("unionmap", vec![from(&x.from, st)?])),
        Op::UnionPartition(x) => Ok(tagged(
            "unionpartition",
            vec![from(&x.from, st)?, Field::new("by", exprs_datum(&x.by))],
        )),
        Op::Unnest(x) => Ok(tagged(
            "unnest",
            vec![
                from(&x.from, st)?,
                Field::new("expr", x.expr.encode()),
                Field::new("result", Datum::String(x.result.clone())),
            ],
        )),
        Op::Unpivot(x) => {
            let mut fields = vec![from(&x.from, st)?];
            if let Some(v) = &x.as_name {
                fields.push(Field::new("as", Datum::String(v.clone())));
            }
            if let Some(k) = &x.at_name {
                fields.push(Field::new("at", Datum::String(k.clone())));
            }
            Ok(tagged("unpivot", fields))
        }
        Op::UnpivotAtDistinct(x) => Ok(tagged(
            "unpivotatdistinct",
            vec![
                from(&x.from, st)?,
                Field::new("at", Datum::String(x.at_name.clone())),
            ],
        )),
        Op::Substitute(x) => {
            let mut inner = Vec::with_capacity(x.inner.len());
            for n in &x.inner {
                inner.push(node_datum(n, cfg, st)?);
            }
            Ok(tagged(
                "substitute",
                vec![from(&x.from, st)?, Field::new("inner", Datum::List(inner))],
            ))
        }
        Op::OutputPart(x) => Ok(tagged(
            "outputpart",
            vec![
                from(&x.from, st)?,
                Field::new("basename", Datum::String(x.basename.clone())),
            ],
        )),
        Op::OutputIndex(x) => Ok(tagged(
            "outputindex",
            vec![
                from(&x.from, st)?,
                Field::new("db", Datum::String(x.db.clone())),
                Field::new("table", Datum::String(x.table.clone())),
                Field::new("basename", Datum::String(x.basename.clone())),
            ],
        )),
        Op::Explain(x) => Ok(tagged(
            "explain",
            vec![
                Field::new("format", Datum::Uint(explain_code(x.format))),
                Field::new("query", Datum::String(x.query.clone())),
                Field::new("tree", tree_datum(&x.tree, cfg, st)?),
            ],
        )),
        Op::NoOutput => Ok(tagged("nooutput", vec![])),
        Op::DummyOutput => Ok(tagged("dummyoutput", vec![])),
    }
}

// ---------------------------------
// decoding
// ---------------------------------

fn unexpected(label: &str) -> Error {
    Error::Decode(format!("unexpected field '{label}'"))
}

fn decode_tree(d: &Datum, st: &Symtab, dec: &dyn HandleDecoder) -> Result<Tree> {
    let mut inputs: Option<Vec<Input>> = None;
    let mut root_datum: Option<&Datum> = None;
    for f in d.as_struct()? {
        match f.label.as_str() {
            "inputs" => {
                let items =
                    compress::decompress_list(&f.value, st).map_err(|e| e.in_field("inputs"))?;
                let mut list = Vec::with_capacity(items.len());
                for item in &items {
                    list.push(decode_input(item, dec).map_err(|e| e.in_field("inputs"))?);
                }
                inputs = Some(list);
            }
            "root" => root_datum = Some(&f.value),
            other => return Err(unexpected(other)),
        }
    }
    let inputs = inputs.ok_or_else(|| Error::Decode("plan is missing inputs".to_string()))?;
    let root_datum =
        root_datum.ok_or_else(|| Error::Decode("plan is missing root".to_string()))?;
    let root = decode_node(root_datum, st, dec, inputs.len()).map_err(|e| e.in_field("root"))?;
    Ok(Tree { inputs, root })
}

fn decode_input(d: &Datum, dec: &dyn HandleDecoder) -> Result<Input> {
    let mut table = None;
    let mut hints = Hints::default();
    let mut handle = None;
    for f in d.as_struct()? {
        match f.label.as_str() {
            "table" => table = Some(decode_binding(&f.value).map_err(|e| e.in_field("table"))?),
            "filter" => {
                hints.filter = Some(decode_expr(&f.value).map_err(|e| e.in_field("filter"))?)
            }
            "fields" => {
                for item in f.value.as_list().map_err(|e| e.in_field("fields"))? {
                    hints
                        .fields
                        .push(item.as_str().map_err(|e| e.in_field("fields"))?.to_string());
                }
            }
            "all_fields" => {
                hints.all_fields = f.value.as_bool().map_err(|e| e.in_field("all_fields"))?
            }
            "handle" => handle = Some(dec.decode_handle(&f.value).map_err(|e| e.in_field("handle"))?),
            other => return Err(unexpected(other)),
        }
    }
    Ok(Input {
        table: table.ok_or_else(|| Error::Decode("input is missing table".to_string()))?,
        hints,
        handle: Some(
            handle.ok_or_else(|| Error::Decode("input is missing handle".to_string()))?,
        ),
    })
}

fn decode_node(d: &Datum, st: &Symtab, dec: &dyn HandleDecoder, ninputs: usize) -> Result<Node> {
    let mut input = -1i64;
    let mut op = None;
    let mut output = Vec::new();
    for f in d.as_struct()? {
        match f.label.as_str() {
            "input" => input = f.value.as_int().map_err(|e| e.in_field("input"))?,
            "op" => op = Some(decode_op(&f.value, st, dec, ninputs).map_err(|e| e.in_field("op"))?),
            "output" => {
                for item in f.value.as_list().map_err(|e| e.in_field("output"))? {
                    output.push(decode_result(item).map_err(|e| e.in_field("output"))?);
                }
            }
            other => return Err(unexpected(other)),
        }
    }
    if input < -1 || input >= ninputs as i64 {
        return Err(Error::Decode(format!(
            "input slot {input} out of range (plan has {ninputs} inputs)"
        )));
    }
    Ok(Node {
        input,
        op: op.ok_or_else(|| Error::Decode("node is missing op".to_string()))?,
        output,
    })
}

fn decode_result(d: &Datum) -> Result<ResultColumn> {
    let mut name = None;
    let mut ty = 0u64;
    for f in d.as_struct()? {
        match f.label.as_str() {
            "name" => name = Some(f.value.as_str().map_err(|e| e.in_field("name"))?.to_string()),
            "bits" => ty = f.value.as_uint().map_err(|e| e.in_field("bits"))?,
            other => return Err(unexpected(other)),
        }
    }
    Ok(ResultColumn {
        name: name.ok_or_else(|| Error::Decode("result is missing name".to_string()))?,
        ty: opal_expr::TypeSet(ty as u16),
    })
}

fn decode_agg_bindings(d: &Datum) -> Result<Vec<AggBinding>> {
    let mut out = Vec::new();
    for item in d.as_list()? {
        let mut agg = None;
        let mut bind = None;
        for f in item.as_struct()? {
            match f.label.as_str() {
                "agg" => {
                    let e = decode_expr(&f.value).map_err(|e| e.in_field("agg"))?;
                    let Expr::Aggregate(a) = e else {
                        return Err(Error::Decode("agg binding is not an aggregate".to_string()));
                    };
                    agg = Some(*a);
                }
                "bind" => {
                    bind = Some(f.value.as_str().map_err(|e| e.in_field("bind"))?.to_string())
                }
                other => return Err(unexpected(other)),
            }
        }
        out.push(AggBinding {
            agg: agg.ok_or_else(|| Error::Decode("agg binding is missing agg".to_string()))?,
            result: bind
                .ok_or_else(|| Error::Decode("agg binding is missing bind".to_string()))?,
        });
    }
    Ok(out)
}

fn decode_exprs(d: &Datum) -> Result<Vec<Expr>> {
    d.as_list()?.iter().map(decode_expr).collect()
}

struct OpFields<'a> {
    fields: Vec<&'a Field>,
}

impl<'a> OpFields<'a> {
    fn take(&mut self, label: &str) -> Option<&'a Datum> {
        let pos = self.fields.iter().position(|f| f.label == label)?;
        Some(&self.fields.remove(pos).value)
    }

    fn done(self) -> Result<()> {
        match self.fields.first() {
            None => Ok(()),
            Some(f) => Err(unexpected(&f.label)),
        }
    }
}

fn decode_op(d: &Datum, st: &Symtab, dec: &dyn HandleDecoder, ninputs: usize) -> Result<Op> {
    let all = d.as_struct()?;
    let mut ty = None;
    let mut fields = Vec::with_capacity(all.len());
    for f in all {
        if f.label == "type" {
            ty = Some(f.value.as_str().map_err(|e| e.in_field("type"))?);
        } else {
            fields.push(f);
        }
    }
    let ty = ty.ok_or_else(|| Error::Decode("op struct has no 'type' field".to_string()))?;
    let mut fields = OpFields { fields };

    let mut sub = |fields: &mut OpFields| -> Result<Box<Op>> {
        let d = fields
            .take("from")
            .ok_or_else(|| Error::Decode(format!("{ty} op is missing from")))?;
        Ok(Box::new(
            decode_op(d, st, dec, ninputs).map_err(|e| e.in_field("from"))?,
        ))
    };

    let op = match ty {
        "leaf" => {
            let table = fields
                .take("table")
                .ok_or_else(|| Error::Decode("leaf is missing table".to_string()))?;
            let orig = decode_binding(table).map_err(|e| e.in_field("table"))?;
            let on_equal = match fields.take("on_equal") {
                Some(d) => decode_exprs(d).map_err(|e| e.in_field("on_equal"))?,
                None => Vec::new(),
            };
            let equal_expr = match fields.take("equal_expr") {
                Some(d) => decode_exprs(d).map_err(|e| e.in_field("equal_expr"))?,
                None => Vec::new(),
            };
            Op::Leaf(Leaf {
                orig,
                on_equal,
                equal_expr,
            })
        }
        "filter" => {
            let from = sub(&mut fields)?;
            let cond = fields
                .take("expr")
                .ok_or_else(|| Error::Decode("filter is missing expr".to_string()))?;
            Op::Filter(Filter {
                from,
                cond: decode_expr(cond).map_err(|e| e.in_field("expr"))?,
            })
        }
        "project" => {
            let from = sub(&mut fields)?;
            let using = fields
                .take("project")
                .ok_or_else(|| Error::Decode("project is missing bindings".to_string()))?;
            Op::Project(Project {
                from,
                using: decode_bindings(using).map_err(|e| e.in_field("project"))?,
            })
        }
        "distinct" => {
            let from = sub(&mut fields)?;
            let cols = fields
                .take("fields")
                .ok_or_else(|| Error::Decode("distinct is missing fields".to_string()))?;
            let limit = fields
                .take("limit")
                .map(|d| d.as_uint().map_err(|e| e.in_field("limit")))
                .transpose()?;
            Op::Distinct(Distinct {
                from,
                fields: decode_exprs(cols).map_err(|e| e.in_field("fields"))?,
                limit,
            })
        }
        "limit" => {
            let from = sub(&mut fields)?;
            let num = fields
                .take("num")
                .ok_or_else(|| Error::Decode("limit is missing num".to_string()))?
                .as_uint()
                .map_err(|e| e.in_field("num"))?;
            Op::Limit(Limit { from, num })
        }
        "order" => {
            let from = sub(&mut fields)?;
            let columns = fields
                .take("columns")
                .ok_or_else(|| Error::Decode("order is missing columns".to_string()))?;
            let limit = fields
                .take("limit")
                .map(|d| d.as_uint().map_err(|e| e.in_field("limit")))
                .transpose()?;
            let offset = match fields.take("offset") {
                Some(d) => d.as_uint().map_err(|e| e.in_field("offset"))?,
                None => 0,
            };
            Op::OrderBy(OrderBy {
                from,
                columns: decode_orders(columns).map_err(|e| e.in_field("columns"))?,
                limit,
                offset,
            })
        }
        "hashagg" => {
            let from = sub(&mut fields)?;
            let agg = fields
                .take("agg")
                .ok_or_else(|| Error::Decode("hashagg is missing agg".to_string()))?;
            let agg = decode_agg_bindings(agg).map_err(|e| e.in_field("agg"))?;
            let windows = match fields.take("windows") {
                Some(d) => decode_agg_bindings(d).map_err(|e| e.in_field("windows"))?,
                None => Vec::new(),
            };
            let by = match fields.take("by") {
                Some(d) => decode_bindings(d).map_err(|e| e.in_field("by"))?,
                None => Vec::new(),
            };
            let order_by = match fields.take("order") {
                Some(d) => decode_hash_orders(d).map_err(|e| e.in_field("order"))?,
                None => Vec::new(),
            };
            let limit = fields
                .take("limit")
                .map(|d| d.as_uint().map_err(|e| e.in_field("limit")))
                .transpose()?;
            Op::HashAggregate(HashAggregate {
                from,
                agg,
                windows,
                by,
                order_by,
                limit,
            })
        }
        "simpleagg" => {
            let from = sub(&mut fields)?;
            let agg = fields
                .take("agg")
                .ok_or_else(|| Error::Decode("simpleagg is missing agg".to_string()))?;
            Op::SimpleAggregate(SimpleAggregate {
                from,
                outputs: decode_agg_bindings(agg).map_err(|e| e.in_field("agg"))?,
            })
        }
        "countstar" => {
            let from = sub(&mut fields)?;
            let result = fields
                .take("as")
                .ok_or_else(|| Error::Decode("countstar is missing as".to_string()))?
                .as_str()
                .map_err(|e| e.in_field("as"))?
                .to_string();
            Op::CountStar(CountStar { from, result })
        }
        "unionmap" => Op::UnionMap(UnionMap {
            from: sub(&mut fields)?,
        }),
        "unionpartition" => {
            let from = sub(&mut fields)?;
            let by = fields
                .take("by")
                .ok_or_else(|| Error::Decode("unionpartition is missing by".to_string()))?;
            Op::UnionPartition(UnionPartition {
                from,
                by: decode_exprs(by).map_err(|e| e.in_field("by"))?,
            })
        }
        "unnest" => {
            let from = sub(&mut fields)?;
            let expr = fields
                .take("expr")
                .ok_or_else(|| Error::Decode("unnest is missing expr".to_string()))?;
            let result = fields
                .take("result")
                .ok_or_else(|| Error::Decode("unnest is missing result".to_string()))?
                .as_str()
                .map_err(|e| e.in_field("result"))?
                .to_string();
            Op::Unnest(Unnest {
                from,
                expr: decode_expr(expr).map_err(|e| e.in_field("expr"))?,
                result,
            })
        }
        "unpivot" => {
            let from = sub(&mut fields)?;
            let as_name = fields
                .take("as")
                .map(|d| d.as_str().map(str::to_string).map_err(|e| e.in_field("as")))
                .transpose()?;
            let at_name = fields
                .take("at")
                .map(|d| d.as_str().map(str::to_string).map_err(|e| e.in_field("at")))
                .transpose()?;
            Op::Unpivot(Unpivot {
                from,
                as_name,
                at_name,
            })
        }
        "unpivotatdistinct" => {
            let from = sub(&mut fields)?;
            let at_name = fields
                .take("at")
                .ok_or_else(|| Error::Decode("unpivotatdistinct is missing at".to_string()))?
                .as_str()
                .map_err(|e| e.in_field("at"))?
                .to_string();
            Op::UnpivotAtDistinct(UnpivotAtDistinct { from, at_name })
        }
        "substitute" => {
            let from = sub(&mut fields)?;
            let inner = fields
                .take("inner")
                .ok_or_else(|| Error::Decode("substitute is missing inner".to_string()))?;
            let mut nodes = Vec::new();
            for item in inner.as_list().map_err(|e| e.in_field("inner"))? {
                nodes.push(decode_node(item, st, dec, ninputs).map_err(|e| e.in_field("inner"))?);
            }
            Op::Substitute(Substitute { from, inner: nodes })
        }
        "outputpart" => {
            let from = sub(&mut fields)?;
            let basename = fields
                .take("basename")
                .ok_or_else(|| Error::Decode("outputpart is missing basename".to_string()))?
                .as_str()
                .map_err(|e| e.in_field("basename"))?
                .to_string();
            Op::OutputPart(OutputPart { from, basename })
        }
        "outputindex" => {
            let from = sub(&mut fields)?;
            let take_str = |fields: &mut OpFields, label: &str| -> Result<String> {
                fields
                    .take(label)
                    .ok_or_else(|| Error::Decode(format!("outputindex is missing {label}")))?
                    .as_str()
                    .map(str::to_string)
                    .map_err(|e| e.in_field(label))
            };
            let db = take_str(&mut fields, "db")?;
            let table = take_str(&mut fields, "table")?;
            let basename = take_str(&mut fields, "basename")?;
            Op::OutputIndex(OutputIndex {
                from,
                db,
                table,
                basename,
            })
        }
        "explain" => {
            let format = fields
                .take("format")
                .ok_or_else(|| Error::Decode("explain is missing format".to_string()))?
                .as_uint()
                .map_err(|e| e.in_field("format"))?;
            let query = fields
                .take("query")
                .ok_or_else(|| Error::Decode("explain is missing query".to_string()))?
                .as_str()
                .map_err(|e| e.in_field("query"))?
                .to_string();
            let tree = fields
                .take("tree")
                .ok_or_else(|| Error::Decode("explain is missing tree".to_string()))?;
            Op::Explain(Explain {
                format: explain_from_code(format)?,
                query,
                tree: Box::new(decode_tree(tree, st, dec).map_err(|e| e.in_field("tree"))?),
            })
        }
        "nooutput" => Op::NoOutput,
        "dummyoutput" => Op::DummyOutput,
        other => return Err(Error::Decode(format!("unknown op type '{other}'"))),
    };
    fields.done()?;
    Ok(op)
}

fn decode_hash_orders(d: &Datum) -> Result<Vec<HashOrder>> {
    let mut out = Vec::new();
    for item in d.as_list()? {
        let mut column = None;
        let mut desc = false;
        let mut nulls_last = false;
        for f in item.as_struct()? {
            match f.label.as_str() {
                "col" => column = Some(f.value.as_uint().map_err(|e| e.in_field("col"))? as usize),
                "desc" => desc = f.value.as_bool().map_err(|e| e.in_field("desc"))?,
                "nulls_last" => {
                    nulls_last = f.value.as_bool().map_err(|e| e.in_field("nulls_last"))?
                }
                other => return Err(unexpected(other)),
            }
        }
        out.push(HashOrder {
            column: column
                .ok_or_else(|| Error::Decode("hash order is missing col".to_string()))?,
            desc,
            nulls_last,
        });
    }
    Ok(out)
}
