use thiserror::Error;

/// Canonical opal error taxonomy used across crates.
///
/// Classification guidance:
/// - [`Error::NotSupported`]: syntactically valid query shapes with no lowering
/// - [`Error::InvalidArgument`]: malformed ASTs, paths, or caller inputs
/// - [`Error::MissingFeature`]: upload-only constructs against a read-only environment
/// - [`Error::DuplicateOrderExpression`]: repeated ORDER BY sort keys
/// - [`Error::Decode`]: malformed wire bytes or unexpected struct fields
/// - [`Error::Cancelled`]: the caller's cancellation token fired mid-plan
/// - [`Error::Env`]: `stat` or another environment callback failed
#[derive(Debug, Error)]
pub enum Error {
    /// Query planning reached a construct with no supported lowering.
    ///
    /// Examples:
    /// - `OFFSET` without `GROUP BY`/`ORDER BY`
    /// - a correlated subquery shape the builder does not recognize
    /// - `COUNT(DISTINCT ...)` under a distributed split
    #[error("plan: query not supported: {0}")]
    NotSupported(String),

    /// Malformed caller input discovered before lowering.
    ///
    /// Examples:
    /// - an empty path expression
    /// - a binding string that does not parse
    /// - an aggregate used where none is permitted
    #[error("plan: invalid argument: {0}")]
    InvalidArgument(String),

    /// A query construct requires an environment capability that is absent.
    ///
    /// Currently this means `SELECT INTO` against an environment without
    /// an uploader.
    #[error("plan: missing feature: {0}")]
    MissingFeature(String),

    /// The same expression appears more than once in an ORDER BY list.
    #[error("plan: duplicate order by expression {0}")]
    DuplicateOrderExpression(String),

    /// Wire decoding failed; the message names the field that triggered it.
    #[error("plan/decode: {0}")]
    Decode(String),

    /// The cancellation token fired between planning phases.
    #[error("plan: cancelled")]
    Cancelled,

    /// An environment callback (`stat`, handle decode) reported failure.
    #[error("plan: environment: {0}")]
    Env(String),
}

impl Error {
    /// Wrap a decode error with the label of the field being decoded.
    ///
    /// Nested decoders call this as errors propagate upward so the final
    /// message reads like a path: `plan/decode: field 'left': ...`.
    pub fn in_field(self, label: &str) -> Error {
        match self {
            Error::Decode(msg) => Error::Decode(format!("field '{label}': {msg}")),
            other => other,
        }
    }
}

/// Standard opal result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn messages_carry_phase_prefix() {
        let e = Error::NotSupported("non-zero OFFSET of distinct result".to_string());
        assert_eq!(
            e.to_string(),
            "plan: query not supported: non-zero OFFSET of distinct result"
        );
        let e = Error::Decode("expected struct".to_string()).in_field("left");
        assert_eq!(e.to_string(), "plan/decode: field 'left': expected struct");
    }
}
