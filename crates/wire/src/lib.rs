//! Self-describing binary value format with symbol interning.
//!
//! Architecture role:
//! - [`Symtab`]: append-only string interning table, encoded as a
//!   length-prefixed block ahead of the payload
//! - [`Datum`]: tagged value tree (null, bool, int, uint, float, string,
//!   symbol, blob, timestamp, struct, list) with a single-pass
//!   length-prefixed writer and a checked reader
//! - [`Bag`]: ordered collection of datums used for literal sets
//! - [`compress`]: transparent gzip wrapping for oversized encoded lists
//!
//! The format is transient: it exists to ship plans and expressions between
//! coordinator and worker nodes, not to persist them.

pub mod compress;
mod datum;
mod symtab;

pub use datum::{Bag, Datum, Field};
pub use symtab::{Symbol, Symtab};
