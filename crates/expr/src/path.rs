use opal_common::{Error, Result};

use crate::node::Expr;

/// An expression paired with its result name.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Bound expression.
    pub expr: Expr,
    explicit: Option<String>,
}

impl Binding {
    /// Bind `expr` with an explicit result name.
    pub fn bind(expr: Expr, name: impl Into<String>) -> Binding {
        Binding {
            expr,
            explicit: Some(name.into()),
        }
    }

    /// Bind `expr` with no explicit name; the result name derives from the
    /// expression shape (see [`Binding::result`]).
    pub fn auto(expr: Expr) -> Binding {
        Binding {
            expr,
            explicit: None,
        }
    }

    /// Returns whether an explicit name was supplied.
    pub fn is_explicit(&self) -> bool {
        self.explicit.is_some()
    }

    /// The explicit name, if one was supplied.
    pub fn explicit_result(&self) -> Option<&str> {
        self.explicit.as_deref()
    }

    /// Set the result name.
    pub fn set_result(&mut self, name: impl Into<String>) {
        self.explicit = Some(name.into());
    }

    /// The result name: the explicit name when present, otherwise a name
    /// derived from the expression (identifier text, dot field, aggregate
    /// default). Expressions with no natural name yield `None`; the
    /// builder assigns those positional names.
    pub fn result(&self) -> Option<&str> {
        if let Some(name) = &self.explicit {
            return Some(name);
        }
        match &self.expr {
            Expr::Ident(name) => Some(name),
            Expr::Dot { field, .. } => Some(field),
            Expr::Aggregate(a) => Some(a.op.default_result()),
            _ => None,
        }
    }
}

/// Returns whether `e` is a path expression: composed entirely of
/// identifier, dot, and index operations.
pub fn is_path(e: &Expr) -> bool {
    match e {
        Expr::Ident(_) => true,
        Expr::Dot { inner, .. } | Expr::Index { inner, .. } => is_path(inner),
        _ => false,
    }
}

/// Construct a path expression from identifier components.
/// This is the reverse operation of [`flat_path`].
pub fn make_path(parts: &[String]) -> Expr {
    let mut p = Expr::ident(parts[0].clone());
    for field in &parts[1..] {
        p = Expr::dot(p, field.clone());
    }
    p
}

/// Flatten `e` into its path components: `a.b.c` becomes
/// `["a", "b", "c"]`. Returns `None` if `e` is not a dotted path
/// (index operations do not flatten).
pub fn flat_path(e: &Expr) -> Option<Vec<String>> {
    match e {
        Expr::Ident(name) => Some(vec![name.clone()]),
        Expr::Dot { inner, field } => {
            let mut parts = flat_path(inner)?;
            parts.push(field.clone());
            Some(parts)
        }
        _ => None,
    }
}

/// Parse simple path expressions like `a.b.z` or `a[0].y`.
pub fn parse_path(x: &str) -> Result<Expr> {
    if x.is_empty() {
        return Err(Error::InvalidArgument("empty path expression".to_string()));
    }
    let mut cur: Option<Expr> = None;
    let mut rest = x;

    fn push_field(cur: Option<Expr>, field: &str) -> Expr {
        let field = field.trim_matches('"');
        match cur {
            None => Expr::ident(field),
            Some(inner) => Expr::dot(inner, field),
        }
    }

    loop {
        if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']').ok_or_else(|| {
                Error::InvalidArgument(format!("unterminated index in {x:?}"))
            })?;
            let offset: i64 = tail[..end].parse().map_err(|_| {
                Error::InvalidArgument(format!("bad index {:?} in {x:?}", &tail[..end]))
            })?;
            let inner = cur.ok_or_else(|| {
                Error::InvalidArgument(format!("leading index in {x:?}"))
            })?;
            cur = Some(Expr::index(inner, offset));
            rest = &tail[end + 1..];
            rest = rest.strip_prefix('.').unwrap_or(rest);
            if rest.is_empty() {
                break;
            }
            continue;
        }
        let split = rest.find(['.', '[']).unwrap_or(rest.len());
        let (field, tail) = rest.split_at(split);
        if field.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "zero-length field in {x:?} not supported"
            )));
        }
        cur = Some(push_field(cur, field));
        match tail.strip_prefix('.') {
            Some(t) if !t.is_empty() => rest = t,
            Some(_) => {
                return Err(Error::InvalidArgument(format!(
                    "trailing '.' in {x:?}"
                )))
            }
            None if tail.is_empty() => break,
            None => rest = tail, // '[' handled above
        }
    }
    cur.ok_or_else(|| Error::InvalidArgument(format!("empty path {x:?}")))
}

/// Parse a comma-separated binding list like `a.b as x, c`.
pub fn parse_bindings(s: &str) -> Result<Vec<Binding>> {
    let mut out = Vec::new();
    for (i, part) in s.split(',').enumerate() {
        let fields: Vec<&str> = part.split_whitespace().collect();
        match fields.as_slice() {
            [path] => out.push(Binding::auto(parse_path(path)?)),
            [path, kw, name] if kw.eq_ignore_ascii_case("as") => {
                out.push(Binding::bind(parse_path(path)?, *name));
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "binding expression {i}: unexpected input {part:?}"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{flat_path, is_path, make_path, parse_bindings, parse_path, Binding};
    use crate::node::Expr;

    #[test]
    fn path_round_trip() {
        for parts in [vec!["a"], vec!["a", "b"], vec!["tbl", "x", "y", "z"]] {
            let parts: Vec<String> = parts.into_iter().map(String::from).collect();
            let p = make_path(&parts);
            assert!(is_path(&p));
            assert_eq!(flat_path(&p), Some(parts));
        }
    }

    #[test]
    fn non_paths_do_not_flatten() {
        assert_eq!(flat_path(&Expr::Integer(3)), None);
        let idx = Expr::index(Expr::ident("a"), 0);
        assert!(is_path(&idx));
        assert_eq!(flat_path(&idx), None);
        let through = Expr::dot(idx, "y");
        assert!(is_path(&through));
        assert_eq!(flat_path(&through), None);
    }

    #[test]
    fn parse_simple_and_indexed_paths() {
        assert_eq!(parse_path("a.b.z").unwrap(), make_path(&["a".into(), "b".into(), "z".into()]));
        let p = parse_path("a[0].y").unwrap();
        assert_eq!(p, Expr::dot(Expr::index(Expr::ident("a"), 0), "y"));
        assert!(parse_path("").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[xyz]").is_err());
    }

    #[test]
    fn parse_binding_lists() {
        let b = parse_bindings("a.b as x, c").unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].result(), Some("x"));
        assert_eq!(b[1].result(), Some("c"));
        assert!(parse_bindings("a nonsense b c").is_err());
    }

    #[test]
    fn result_name_derivation() {
        assert_eq!(Binding::auto(Expr::ident("x")).result(), Some("x"));
        assert_eq!(
            Binding::auto(Expr::dot(Expr::ident("t"), "field")).result(),
            Some("field")
        );
        assert_eq!(Binding::auto(Expr::count_star()).result(), Some("count"));
        assert_eq!(Binding::auto(Expr::Integer(3)).result(), None);
        assert_eq!(
            Binding::bind(Expr::Integer(3), "three").result(),
            Some("three")
        );
    }
}
