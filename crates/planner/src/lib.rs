//! Query planner for the opal engine.
//!
//! Architecture role:
//! - lowers a parsed query AST into the trace IR ([`build`])
//! - rewrites traces to a fixed point ([`rules`])
//! - decomposes traces into map/reduce phases for distribution ([`split`])
//! - lowers traces into physical op trees with deduplicated inputs
//!   ([`lower`], [`op`])
//! - serializes plans for coordinator/worker transport ([`codec`])
//!
//! Key entry points:
//! - [`plan`] / [`plan_split`] for callers
//! - the [`env::Env`] contract for environments
//!
//! The planner is pure and single-threaded per query; it may be invoked
//! from many threads, one query per thread, without synchronization.

pub mod build;
pub mod codec;
pub mod env;
pub mod explain;
pub mod lower;
pub mod op;
pub mod rules;
pub mod split;
pub mod trace;

pub use build::build;
pub use env::{Env, HandleDecoder, Index, SigningKey, TableHandle, UploadFs};
pub use explain::{tree_lines, tree_text};
pub use lower::{plan, plan_split, plan_with, PlanOptions};
pub use op::{Hints, Input, Node, Op, ResultColumn, ResultSet, Tree};
pub use rules::{FixedPoint, Rule, Status};
pub use split::split;
pub use trace::{AggBinding, Step, StepKind, Trace};
