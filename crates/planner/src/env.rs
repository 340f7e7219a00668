use std::fmt;

use chrono::{DateTime, Utc};

use opal_common::{Error, Result};
use opal_expr::{Expr, Hint};
use opal_wire::Datum;

use crate::op::Hints;

/// An opaque, environment-defined descriptor for a resolved table.
///
/// The planner obtains handles through [`Env::stat`] and threads them
/// through plans without interpreting them; only the environment that
/// produced a handle can decode it again on the far side of the wire.
pub trait TableHandle: fmt::Debug {
    /// Encode the handle for wire transport.
    fn encode(&self) -> Datum;
}

/// Partition and time-range metadata for a table, used by rewrite rules.
pub trait Index {
    /// Returns whether the table is materially partitioned on `column`.
    fn has_partition(&self, column: &str) -> bool {
        let _ = column;
        false
    }

    /// The inclusive [min, max] range of the timestamp values reachable
    /// under `path`, when the index tracks one.
    fn time_range(&self, path: &[String]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let _ = path;
        None
    }
}

/// An uploadable object store, required only for `SELECT INTO`.
pub trait UploadFs: fmt::Debug {
    /// Encode the store description for wire transport.
    fn encode(&self) -> Datum;
}

/// Key used to sign index objects written by `SELECT INTO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey(pub Vec<u8>);

/// The planner's view of the outside world.
///
/// `stat` is the only required capability; the rest default to "absent"
/// and unlock optional behavior (schema-informed typing, index-driven
/// rewrites, uploads).
pub trait Env {
    /// Resolve a table expression plus pushdown hints into a handle.
    ///
    /// Must be deterministic for identical inputs: the deduplicator
    /// relies on equal `(table, hints)` pairs producing equal handles.
    fn stat(&self, table: &Expr, hints: &Hints) -> Result<Box<dyn TableHandle>>;

    /// Type hints for expressions over `table`, if known.
    fn schema(&self, table: &Expr) -> Option<&dyn Hint> {
        let _ = table;
        None
    }

    /// Index metadata for `table`, if any.
    fn index(&self, table: &Expr) -> Result<Option<&dyn Index>> {
        let _ = table;
        Ok(None)
    }

    /// The upload store, when this environment supports `SELECT INTO`.
    fn uploader(&self) -> Option<&dyn UploadFs> {
        None
    }

    /// The signing key paired with [`Env::uploader`].
    fn signing_key(&self) -> Option<&SigningKey> {
        None
    }
}

/// Decodes the environment-owned pieces of a serialized plan.
pub trait HandleDecoder {
    /// Decode a table handle produced by [`TableHandle::encode`].
    fn decode_handle(&self, d: &Datum) -> Result<Box<dyn TableHandle>>;

    /// Decode an upload store produced by [`UploadFs::encode`].
    fn decode_uploader(&self, d: &Datum) -> Result<Box<dyn UploadFs>> {
        let _ = d;
        Err(Error::MissingFeature(
            "this environment cannot decode uploaders".to_string(),
        ))
    }
}
