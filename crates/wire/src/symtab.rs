use std::collections::HashMap;

use opal_common::{Error, Result};

use crate::datum::{read_uvarint, write_uvarint};

/// Interned string handle. Symbols are only meaningful relative to the
/// [`Symtab`] that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub(crate) u32);

impl Symbol {
    /// Raw table index of this symbol.
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Append-only string interning table.
///
/// Interning the same string twice yields the same symbol; symbols are
/// assigned in first-use order, which is what makes encoding deterministic
/// for a fixed traversal order. The table is owned by the call site; the
/// codec interns only as needed and never retains the table.
#[derive(Debug, Default, Clone)]
pub struct Symtab {
    names: Vec<String>,
    ids: HashMap<String, Symbol>,
}

impl Symtab {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning its (possibly pre-existing) symbol.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.ids.get(name) {
            return sym;
        }
        let sym = Symbol(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), sym);
        sym
    }

    /// Look up an already-interned string without adding it.
    pub fn find(&self, name: &str) -> Option<Symbol> {
        self.ids.get(name).copied()
    }

    /// Resolve a symbol back to its string.
    pub fn name(&self, sym: Symbol) -> Option<&str> {
        self.names.get(sym.0 as usize).map(String::as_str)
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Append the length-prefixed symbol table block to `out`.
    ///
    /// Layout: entry count, then each entry as a length-prefixed UTF-8
    /// string, all varint-framed.
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_uvarint(out, self.names.len() as u64);
        for name in &self.names {
            write_uvarint(out, name.len() as u64);
            out.extend_from_slice(name.as_bytes());
        }
    }

    /// Parse a symbol table block from the front of `buf`, returning the
    /// table and the remaining bytes.
    pub fn decode(buf: &[u8]) -> Result<(Symtab, &[u8])> {
        let (count, mut rest) = read_uvarint(buf)?;
        let mut st = Symtab::new();
        for _ in 0..count {
            let (len, tail) = read_uvarint(rest)?;
            let len = len as usize;
            if tail.len() < len {
                return Err(Error::Decode("symbol table truncated".to_string()));
            }
            let name = std::str::from_utf8(&tail[..len])
                .map_err(|_| Error::Decode("symbol table entry is not UTF-8".to_string()))?;
            st.intern(name);
            rest = &tail[len..];
        }
        Ok((st, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::Symtab;

    #[test]
    fn intern_is_idempotent() {
        let mut st = Symtab::new();
        let a = st.intern("type");
        let b = st.intern("inputs");
        assert_ne!(a, b);
        assert_eq!(st.intern("type"), a);
        assert_eq!(st.len(), 2);
        assert_eq!(st.name(a), Some("type"));
        assert_eq!(st.find("inputs"), Some(b));
        assert_eq!(st.find("root"), None);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut st = Symtab::new();
        for name in ["type", "left", "right", "op", ""] {
            st.intern(name);
        }
        let mut buf = Vec::new();
        st.encode(&mut buf);
        buf.extend_from_slice(b"tail");
        let (back, rest) = Symtab::decode(&buf).unwrap();
        assert_eq!(rest, b"tail");
        assert_eq!(back.len(), st.len());
        for name in ["type", "left", "right", "op", ""] {
            assert_eq!(back.find(name), st.find(name));
        }
    }
}
