//! Expression AST for the opal PartiQL dialect.
//!
//! Architecture role:
//! - algebraic expression tree consumed by the planner ([`Expr`])
//! - structural equivalence with numeric coercion
//! - pre-order walk and post-order rewrite traversals
//! - type inference over a [`TypeSet`] bit-set with caller-provided hints
//! - faithful and redacted printing
//! - binary codec over `opal_wire` datums
//! - path/binding utilities and the query surface (`SELECT`/`UNION`)
//!
//! The parser that produces these trees and the engine that evaluates them
//! live elsewhere; this crate has no runtime evaluation beyond constant
//! simplification.

mod codec;
mod node;
mod path;
mod print;
mod query;
mod simplify;
mod types;

pub use codec::{
    decode, decode_binding, decode_bindings, decode_orders, encode_binding, encode_bindings,
    encode_orders,
};
pub use node::{
    Aggregate, AggregateOp, ArithOp, Case, CaseLimb, CmpOp, Expr, IsKey, LogicalOp, Lookup, Order,
    StringMatchOp, StructField, UnaryArithOp, Union, UnionKind, UnpivotExpr, Window,
};
pub use node::{BuiltinOp, Rewriter};
pub use path::{flat_path, is_path, make_path, parse_bindings, parse_path, Binding};
pub use print::{set_is_keyword, to_redacted, to_text};
pub use query::{ExplainFormat, From, JoinKind, Query, Select};
pub use simplify::simplify;
pub use types::{type_of, Hint, NoHint, TypeSet};
