use chrono::{DateTime, Utc};

use opal_common::{Error, Result};

use crate::symtab::Symtab;

// Value tags. The payload after each tag is either fixed-size, varint, or
// varint-length-prefixed; see `write_into` for the exact framing.
const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_UINT: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_SYMBOL: u8 = 0x07;
const TAG_BLOB: u8 = 0x08;
const TAG_TIMESTAMP: u8 = 0x09;
const TAG_LIST: u8 = 0x0a;
const TAG_STRUCT: u8 = 0x0b;

/// One labeled member of a struct datum.
///
/// Labels are interned as symbols on the wire and resolved back to strings
/// at parse time so decoders can dispatch on field names.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field label.
    pub label: String,
    /// Field value.
    pub value: Datum,
}

impl Field {
    /// Convenience constructor.
    pub fn new(label: impl Into<String>, value: Datum) -> Self {
        Field {
            label: label.into(),
            value,
        }
    }
}

/// A self-describing wire value.
#[derive(Debug, Clone)]
pub enum Datum {
    /// Untyped null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer (zigzag varint on the wire).
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Symbol reference; resolved against the symbol table on read.
    Symbol(String),
    /// Opaque bytes.
    Blob(Vec<u8>),
    /// Microsecond-precision UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Ordered value sequence.
    List(Vec<Datum>),
    /// Ordered labeled members.
    Struct(Vec<Field>),
}

impl PartialEq for Datum {
    fn eq(&self, other: &Datum) -> bool {
        use Datum::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Uint(a), Uint(b)) => a == b,
            // ints and uints compare by value so that re-encoded data
            // does not change identity when a value crosses zero
            (Int(a), Uint(b)) | (Uint(b), Int(a)) => *a >= 0 && *a as u64 == *b,
            // bit comparison: round-trips must be exact, including NaN
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Symbol(a), Symbol(b)) => a == b,
            (Blob(a), Blob(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Struct(a), Struct(b)) => a == b,
            _ => false,
        }
    }
}

impl Datum {
    /// Short name of the value kind, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "int",
            Datum::Uint(_) => "uint",
            Datum::Float(_) => "float",
            Datum::String(_) => "string",
            Datum::Symbol(_) => "symbol",
            Datum::Blob(_) => "blob",
            Datum::Timestamp(_) => "timestamp",
            Datum::List(_) => "list",
            Datum::Struct(_) => "struct",
        }
    }

    fn unexpected(&self, want: &str) -> Error {
        Error::Decode(format!("expected {want}, found {}", self.type_name()))
    }

    /// Unsigned integer value; accepts a non-negative signed value too.
    pub fn as_uint(&self) -> Result<u64> {
        match self {
            Datum::Uint(u) => Ok(*u),
            Datum::Int(i) if *i >= 0 => Ok(*i as u64),
            other => Err(other.unexpected("uint")),
        }
    }

    /// Signed integer value; accepts an in-range unsigned value too.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Datum::Int(i) => Ok(*i),
            Datum::Uint(u) if *u <= i64::MAX as u64 => Ok(*u as i64),
            other => Err(other.unexpected("int")),
        }
    }

    /// Float value.
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Datum::Float(f) => Ok(*f),
            other => Err(other.unexpected("float")),
        }
    }

    /// Boolean value.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Datum::Bool(b) => Ok(*b),
            other => Err(other.unexpected("bool")),
        }
    }

    /// String value; symbols resolve to their interned text.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Datum::String(s) | Datum::Symbol(s) => Ok(s),
            other => Err(other.unexpected("string")),
        }
    }

    /// Blob contents.
    pub fn as_blob(&self) -> Result<&[u8]> {
        match self {
            Datum::Blob(b) => Ok(b),
            other => Err(other.unexpected("blob")),
        }
    }

    /// Timestamp value.
    pub fn as_timestamp(&self) -> Result<DateTime<Utc>> {
        match self {
            Datum::Timestamp(t) => Ok(*t),
            other => Err(other.unexpected("timestamp")),
        }
    }

    /// List elements.
    pub fn as_list(&self) -> Result<&[Datum]> {
        match self {
            Datum::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    /// Struct fields.
    pub fn as_struct(&self) -> Result<&[Field]> {
        match self {
            Datum::Struct(fields) => Ok(fields),
            other => Err(other.unexpected("struct")),
        }
    }

    /// Serialize this value, interning labels and symbols into `st`.
    pub fn write_into(&self, st: &mut Symtab, out: &mut Vec<u8>) {
        match self {
            Datum::Null => out.push(TAG_NULL),
            Datum::Bool(false) => out.push(TAG_FALSE),
            Datum::Bool(true) => out.push(TAG_TRUE),
            Datum::Int(i) => {
                out.push(TAG_INT);
                write_uvarint(out, zigzag(*i));
            }
            Datum::Uint(u) => {
                out.push(TAG_UINT);
                write_uvarint(out, *u);
            }
            Datum::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Datum::String(s) => {
                out.push(TAG_STRING);
                write_uvarint(out, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            Datum::Symbol(s) => {
                out.push(TAG_SYMBOL);
                write_uvarint(out, st.intern(s).id() as u64);
            }
            Datum::Blob(b) => {
                out.push(TAG_BLOB);
                write_uvarint(out, b.len() as u64);
                out.extend_from_slice(b);
            }
            Datum::Timestamp(t) => {
                out.push(TAG_TIMESTAMP);
                write_uvarint(out, zigzag(t.timestamp_micros()));
            }
            Datum::List(items) => {
                let mut body = Vec::new();
                for item in items {
                    item.write_into(st, &mut body);
                }
                out.push(TAG_LIST);
                write_uvarint(out, body.len() as u64);
                out.extend_from_slice(&body);
            }
            Datum::Struct(fields) => {
                let mut body = Vec::new();
                for f in fields {
                    write_uvarint(&mut body, st.intern(&f.label).id() as u64);
                    f.value.write_into(st, &mut body);
                }
                out.push(TAG_STRUCT);
                write_uvarint(out, body.len() as u64);
                out.extend_from_slice(&body);
            }
        }
    }

    /// Parse one value from the front of `buf`, resolving symbols against
    /// `st`. Returns the value and the remaining bytes.
    pub fn read<'a>(buf: &'a [u8], st: &Symtab) -> Result<(Datum, &'a [u8])> {
        let (&tag, rest) = buf
            .split_first()
            .ok_or_else(|| Error::Decode("truncated value".to_string()))?;
        match tag {
            TAG_NULL => Ok((Datum::Null, rest)),
            TAG_FALSE => Ok((Datum::Bool(false), rest)),
            TAG_TRUE => Ok((Datum::Bool(true), rest)),
            TAG_INT => {
                let (u, rest) = read_uvarint(rest)?;
                Ok((Datum::Int(unzigzag(u)), rest))
            }
            TAG_UINT => {
                let (u, rest) = read_uvarint(rest)?;
                Ok((Datum::Uint(u), rest))
            }
            TAG_FLOAT => {
                if rest.len() < 8 {
                    return Err(Error::Decode("truncated float".to_string()));
                }
                let bits = u64::from_le_bytes(rest[..8].try_into().unwrap());
                Ok((Datum::Float(f64::from_bits(bits)), &rest[8..]))
            }
            TAG_STRING => {
                let (bytes, rest) = read_prefixed(rest, "string")?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Error::Decode("string is not UTF-8".to_string()))?;
                Ok((Datum::String(s.to_string()), rest))
            }
            TAG_SYMBOL => {
                let (id, rest) = read_uvarint(rest)?;
                let name = st
                    .name(crate::symtab::Symbol(id as u32))
                    .ok_or_else(|| Error::Decode(format!("symbol {id} out of range")))?;
                Ok((Datum::Symbol(name.to_string()), rest))
            }
            TAG_BLOB => {
                let (bytes, rest) = read_prefixed(rest, "blob")?;
                Ok((Datum::Blob(bytes.to_vec()), rest))
            }
            TAG_TIMESTAMP => {
                let (u, rest) = read_uvarint(rest)?;
                let micros = unzigzag(u);
                let t = DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| Error::Decode(format!("timestamp {micros} out of range")))?;
                Ok((Datum::Timestamp(t), rest))
            }
            TAG_LIST => {
                let (mut body, rest) = read_prefixed(rest, "list")?;
                let mut items = Vec::new();
                while !body.is_empty() {
                    let (item, tail) = Datum::read(body, st)?;
                    items.push(item);
                    body = tail;
                }
                Ok((Datum::List(items), rest))
            }
            TAG_STRUCT => {
                let (mut body, rest) = read_prefixed(rest, "struct")?;
                let mut fields = Vec::new();
                while !body.is_empty() {
                    let (id, tail) = read_uvarint(body)?;
                    let label = st
                        .name(crate::symtab::Symbol(id as u32))
                        .ok_or_else(|| Error::Decode(format!("field symbol {id} out of range")))?
                        .to_string();
                    let (value, tail) = Datum::read(tail, st)?;
                    fields.push(Field { label, value });
                    body = tail;
                }
                Ok((Datum::Struct(fields), rest))
            }
            other => Err(Error::Decode(format!("unknown value tag {other:#04x}"))),
        }
    }
}

/// An ordered collection of constant datums.
///
/// Bags back the literal sets of member tests and lookup tables. Order is
/// preserved (it is part of wire identity); equality is element-wise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bag {
    items: Vec<Datum>,
}

impl Bag {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a datum.
    pub fn push(&mut self, d: Datum) {
        self.items.push(d);
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate the contents in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Datum> {
        self.items.iter()
    }

    /// Returns whether an equal datum is present.
    pub fn contains(&self, d: &Datum) -> bool {
        self.items.iter().any(|x| x == d)
    }

    /// The contents as a list datum.
    pub fn to_list(&self) -> Datum {
        Datum::List(self.items.clone())
    }

    /// Build a bag from the elements of a list datum.
    pub fn from_list(d: &Datum) -> Result<Bag> {
        Ok(Bag {
            items: d.as_list()?.to_vec(),
        })
    }
}

impl FromIterator<Datum> for Bag {
    fn from_iter<T: IntoIterator<Item = Datum>>(iter: T) -> Self {
        Bag {
            items: iter.into_iter().collect(),
        }
    }
}

fn read_prefixed<'a>(buf: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8])> {
    let (len, rest) = read_uvarint(buf)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::Decode(format!("truncated {what}")));
    }
    Ok((&rest[..len], &rest[len..]))
}

fn zigzag(i: i64) -> u64 {
    ((i << 1) ^ (i >> 63)) as u64
}

fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

pub(crate) fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            return;
        }
    }
}

pub(crate) fn read_uvarint(buf: &[u8]) -> Result<(u64, &[u8])> {
    let mut v = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            break;
        }
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((v, &buf[i + 1..]));
        }
        shift += 7;
    }
    Err(Error::Decode("malformed varint".to_string()))
}

#[cfg(test)]
mod tests {
    use super::{unzigzag, zigzag, Bag, Datum, Field};
    use crate::symtab::Symtab;
    use chrono::{TimeZone, Utc};

    fn round_trip(d: &Datum) -> Datum {
        let mut st = Symtab::new();
        let mut buf = Vec::new();
        d.write_into(&mut st, &mut buf);
        let (back, rest) = Datum::read(&buf, &st).unwrap();
        assert!(rest.is_empty());
        back
    }

    #[test]
    fn zigzag_inverts() {
        for i in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(i)), i);
        }
    }

    #[test]
    fn scalar_round_trips() {
        let ts = Utc.with_ymd_and_hms(2021, 7, 1, 12, 30, 0).unwrap();
        for d in [
            Datum::Null,
            Datum::Bool(true),
            Datum::Bool(false),
            Datum::Int(-7),
            Datum::Int(i64::MIN),
            Datum::Uint(u64::MAX),
            Datum::Float(3.5),
            Datum::Float(f64::NAN),
            Datum::String("hello".to_string()),
            Datum::Symbol("count".to_string()),
            Datum::Blob(vec![0, 1, 2, 255]),
            Datum::Timestamp(ts),
        ] {
            assert_eq!(round_trip(&d), d);
        }
    }

    #[test]
    fn nested_round_trips() {
        let d = Datum::Struct(vec![
            Field::new("type", Datum::Symbol("cmp".to_string())),
            Field::new("op", Datum::Uint(2)),
            Field::new(
                "args",
                Datum::List(vec![Datum::Int(1), Datum::String("x".to_string()), Datum::Null]),
            ),
            Field::new("inner", Datum::Struct(vec![Field::new("type", Datum::Symbol("star".to_string()))])),
        ]);
        assert_eq!(round_trip(&d), d);
    }

    #[test]
    fn symbols_share_table_entries() {
        let mut st = Symtab::new();
        let mut buf = Vec::new();
        let d = Datum::List(vec![
            Datum::Symbol("type".to_string()),
            Datum::Symbol("type".to_string()),
        ]);
        d.write_into(&mut st, &mut buf);
        assert_eq!(st.len(), 1);
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        let mut st = Symtab::new();
        let mut buf = Vec::new();
        Datum::String("hello world".to_string()).write_into(&mut st, &mut buf);
        for cut in 0..buf.len() {
            assert!(Datum::read(&buf[..cut], &st).is_err());
        }
        // unknown tag
        assert!(Datum::read(&[0x7f], &st).is_err());
        // symbol id out of range
        assert!(Datum::read(&[0x07, 0x05], &st).is_err());
    }

    #[test]
    fn bag_preserves_order_and_membership() {
        let mut bag = Bag::new();
        bag.push(Datum::Int(3));
        bag.push(Datum::String("foo".to_string()));
        assert_eq!(bag.len(), 2);
        assert!(bag.contains(&Datum::Int(3)));
        assert!(bag.contains(&Datum::Uint(3)));
        assert!(!bag.contains(&Datum::Int(4)));
        let back = Bag::from_list(&bag.to_list()).unwrap();
        assert_eq!(back, bag);
    }
}
