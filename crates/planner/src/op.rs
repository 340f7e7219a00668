use std::fmt;

use opal_expr::{Binding, Expr, ExplainFormat, Order, TypeSet};

use crate::env::TableHandle;
use crate::trace::AggBinding;

/// Pushdown metadata shipped to [`crate::env::Env::stat`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Hints {
    /// Predicate applied by the scan: rows that fail it never reach the
    /// leaf. Leaves re-apply only the residual of their own filters.
    pub filter: Option<Expr>,
    /// Sorted, duplicate-free set of path strings the scan must produce.
    /// Ignored under `all_fields`.
    pub fields: Vec<String>,
    /// The scan must produce entire rows.
    pub all_fields: bool,
}

/// One deduplicated scan source. Leaves reference inputs by slot index.
#[derive(Debug)]
pub struct Input {
    /// Table path expression plus binding name.
    pub table: Binding,
    /// Merged pushdown hints for every leaf sharing this input.
    pub hints: Hints,
    /// Environment handle; present once the input has been stat'd.
    pub handle: Option<Box<dyn TableHandle>>,
}

impl PartialEq for Input {
    fn eq(&self, other: &Input) -> bool {
        let handle_eq = match (&self.handle, &other.handle) {
            (None, None) => true,
            (Some(a), Some(b)) => a.encode() == b.encode(),
            _ => false,
        };
        handle_eq && self.table == other.table && self.hints == other.hints
    }
}

/// One output column: name plus the set of types it may carry.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    /// Column name.
    pub name: String,
    /// Possible encodings of the column value.
    pub ty: TypeSet,
}

/// Ordered output column descriptions.
pub type ResultSet = Vec<ResultColumn>;

/// The physical operator tree.
#[derive(Debug, PartialEq)]
pub enum Op {
    /// Scan of a deduplicated input.
    Leaf(Leaf),
    /// Row filter.
    Filter(Filter),
    /// Projection / renaming.
    Project(Project),
    /// Deduplication.
    Distinct(Distinct),
    /// Row-count limit.
    Limit(Limit),
    /// Sort, with optional fused limit/offset.
    OrderBy(OrderBy),
    /// Grouped (and/or windowed) aggregation.
    HashAggregate(HashAggregate),
    /// Ungrouped aggregation.
    SimpleAggregate(SimpleAggregate),
    /// `SELECT COUNT(*)` fast path.
    CountStar(CountStar),
    /// Distributed map over every peer.
    UnionMap(UnionMap),
    /// Distributed map partitioned by equality keys.
    UnionPartition(UnionPartition),
    /// Unnest of a list-valued expression.
    Unnest(Unnest),
    /// Unpivot of row fields into (key, value) rows.
    Unpivot(Unpivot),
    /// Distinct unpivot keys.
    UnpivotAtDistinct(UnpivotAtDistinct),
    /// Attach substituted sub-plan results.
    Substitute(Substitute),
    /// `SELECT INTO` part upload.
    OutputPart(OutputPart),
    /// `SELECT INTO` index update.
    OutputIndex(OutputIndex),
    /// Plan description instead of execution.
    Explain(Explain),
    /// Produce no rows.
    NoOutput,
    /// Produce exactly one empty row.
    DummyOutput,
}

impl Op {
    /// The upstream operator, or `None` for terminal ops.
    pub fn from_op(&self) -> Option<&Op> {
        match self {
            Op::Filter(x) => Some(&x.from),
            Op::Project(x) => Some(&x.from),
            Op::Distinct(x) => Some(&x.from),
            Op::Limit(x) => Some(&x.from),
            Op::OrderBy(x) => Some(&x.from),
            Op::HashAggregate(x) => Some(&x.from),
            Op::SimpleAggregate(x) => Some(&x.from),
            Op::CountStar(x) => Some(&x.from),
            Op::UnionMap(x) => Some(&x.from),
            Op::UnionPartition(x) => Some(&x.from),
            Op::Unnest(x) => Some(&x.from),
            Op::Unpivot(x) => Some(&x.from),
            Op::UnpivotAtDistinct(x) => Some(&x.from),
            Op::Substitute(x) => Some(&x.from),
            Op::OutputPart(x) => Some(&x.from),
            Op::OutputIndex(x) => Some(&x.from),
            Op::Leaf(_) | Op::Explain(_) | Op::NoOutput | Op::DummyOutput => None,
        }
    }
}

/// Physical scan operator. The input slot lives on the enclosing
/// [`Node`]; the leaf itself records what the scan looked like before
/// deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    /// Original table path expression.
    pub orig: Binding,
    /// Equality-partition key expressions, when partitioned.
    pub on_equal: Vec<Expr>,
    /// `PARTITION_VALUE(i)` placeholders paired with `on_equal`.
    pub equal_expr: Vec<Expr>,
}

/// Row filter operator.
#[derive(Debug, PartialEq)]
pub struct Filter {
    /// Input operator.
    pub from: Box<Op>,
    /// Predicate.
    pub cond: Expr,
}

/// Projection operator.
#[derive(Debug, PartialEq)]
pub struct Project {
    /// Input operator.
    pub from: Box<Op>,
    /// `(expr, output name)` bindings.
    pub using: Vec<Binding>,
}

/// Deduplication operator.
#[derive(Debug, PartialEq)]
pub struct Distinct {
    /// Input operator.
    pub from: Box<Op>,
    /// Deduplication key expressions.
    pub fields: Vec<Expr>,
    /// Stop after this many distinct rows.
    pub limit: Option<u64>,
}

/// Limit operator.
#[derive(Debug, PartialEq)]
pub struct Limit {
    /// Input operator.
    pub from: Box<Op>,
    /// Maximum number of rows.
    pub num: u64,
}

/// Sort operator.
#[derive(Debug, PartialEq)]
pub struct OrderBy {
    /// Input operator.
    pub from: Box<Op>,
    /// Sort terms, most significant first.
    pub columns: Vec<Order>,
    /// Fused `LIMIT`.
    pub limit: Option<u64>,
    /// Fused `OFFSET`.
    pub offset: u64,
}

/// Sort term applied to hash-aggregate output, identified by output
/// column position (aggregates, then group keys, then windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashOrder {
    /// Output column position.
    pub column: usize,
    /// Descending order.
    pub desc: bool,
    /// `NULLS LAST` placement.
    pub nulls_last: bool,
}

/// Grouped aggregation operator.
#[derive(Debug, PartialEq)]
pub struct HashAggregate {
    /// Input operator.
    pub from: Box<Op>,
    /// Non-windowed aggregates.
    pub agg: Vec<AggBinding>,
    /// Windowed aggregates.
    pub windows: Vec<AggBinding>,
    /// Group keys.
    pub by: Vec<Binding>,
    /// Output ordering fused from a downstream ORDER BY.
    pub order_by: Vec<HashOrder>,
    /// Fused `LIMIT`.
    pub limit: Option<u64>,
}

/// Ungrouped aggregation operator.
#[derive(Debug, PartialEq)]
pub struct SimpleAggregate {
    /// Input operator.
    pub from: Box<Op>,
    /// Aggregate outputs.
    pub outputs: Vec<AggBinding>,
}

/// `COUNT(*)` fast-path operator.
#[derive(Debug, PartialEq)]
pub struct CountStar {
    /// Input operator.
    pub from: Box<Op>,
    /// Output column name.
    pub result: String,
}

/// Distributed map operator: `from` executes on every peer and the
/// outputs are concatenated.
#[derive(Debug, PartialEq)]
pub struct UnionMap {
    /// The map sub-plan.
    pub from: Box<Op>,
}

/// Distributed map partitioned on equality keys: peers exchange rows so
/// that equal keys land on the same peer.
#[derive(Debug, PartialEq)]
pub struct UnionPartition {
    /// The map sub-plan.
    pub from: Box<Op>,
    /// Partition key expressions.
    pub by: Vec<Expr>,
}

/// Unnest operator.
#[derive(Debug, PartialEq)]
pub struct Unnest {
    /// Input operator.
    pub from: Box<Op>,
    /// List-valued expression.
    pub expr: Expr,
    /// Binding name for produced elements.
    pub result: String,
}

/// Unpivot operator.
#[derive(Debug, PartialEq)]
pub struct Unpivot {
    /// Input operator.
    pub from: Box<Op>,
    /// Value binding name.
    pub as_name: Option<String>,
    /// Key binding name.
    pub at_name: Option<String>,
}

/// Distinct-unpivot-keys operator; the execution kernel deduplicates
/// field names with the concurrent unifier.
#[derive(Debug, PartialEq)]
pub struct UnpivotAtDistinct {
    /// Input operator.
    pub from: Box<Op>,
    /// Key binding name.
    pub at_name: String,
}

/// Substitution operator: executes `inner` sub-plans and makes their
/// results available to `PARTITION_VALUE(i)` placeholders in `from`.
#[derive(Debug, PartialEq)]
pub struct Substitute {
    /// The consuming plan.
    pub from: Box<Op>,
    /// Substituted sub-plans, position-indexed.
    pub inner: Vec<Node>,
}

/// Part-upload operator for `SELECT INTO`.
#[derive(Debug, PartialEq)]
pub struct OutputPart {
    /// Input operator.
    pub from: Box<Op>,
    /// Object basename prefix for uploaded parts.
    pub basename: String,
}

/// Index-update operator for `SELECT INTO`.
#[derive(Debug, PartialEq)]
pub struct OutputIndex {
    /// Input operator.
    pub from: Box<Op>,
    /// Destination database.
    pub db: String,
    /// Destination table.
    pub table: String,
    /// Object basename prefix written by the part step.
    pub basename: String,
}

/// Explain operator: renders the wrapped plan instead of executing it.
#[derive(Debug, PartialEq)]
pub struct Explain {
    /// Output format.
    pub format: ExplainFormat,
    /// The original query text.
    pub query: String,
    /// The plan being described.
    pub tree: Box<Tree>,
}

/// One plan node: an operator plus the input slot its leaf references and
/// the output columns it produces.
#[derive(Debug, PartialEq)]
pub struct Node {
    /// Input slot index used by the leaf of `op`, or -1 when the node has
    /// no table input.
    pub input: i64,
    /// The operator tree.
    pub op: Op,
    /// Output column descriptions.
    pub output: ResultSet,
}

/// A complete physical plan: the deduplicated input table plus the root
/// node. Workers share `inputs` by slot index.
#[derive(Debug, PartialEq)]
pub struct Tree {
    /// Deduplicated inputs, each stat'd exactly once.
    pub inputs: Vec<Input>,
    /// Root node.
    pub root: Node,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::explain::op_line(self))
    }
}
