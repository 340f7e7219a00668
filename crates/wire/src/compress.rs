//! Transparent compression for oversized encoded lists.
//!
//! Contract:
//! - a list whose encoded body exceeds the caller's threshold is written as
//!   a `{algo, size, data}` struct instead of a plain list
//! - `size` is the uncompressed body length, used to pre-size the read
//!   buffer and to reject corrupt frames
//! - readers accept both shapes, so small lists pay no wrapping cost

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use opal_common::{Error, Result};

use crate::datum::{Datum, Field};
use crate::symtab::Symtab;

const ALGO: &str = "gzip";

/// Encode `items` as a list datum, compressing when the encoded body
/// exceeds `threshold` bytes.
pub fn compress_list(items: &[Datum], threshold: usize, st: &mut Symtab) -> Result<Datum> {
    let mut body = Vec::new();
    for item in items {
        item.write_into(st, &mut body);
    }
    if body.len() <= threshold {
        return Ok(Datum::List(items.to_vec()));
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&body)
        .and_then(|_| enc.finish())
        .map(|data| {
            Datum::Struct(vec![
                Field::new("algo", Datum::String(ALGO.to_string())),
                Field::new("size", Datum::Uint(body.len() as u64)),
                Field::new("data", Datum::Blob(data)),
            ])
        })
        .map_err(|e| Error::Decode(format!("list compression failed: {e}")))
}

/// Decode a datum produced by [`compress_list`], returning the list items.
pub fn decompress_list(d: &Datum, st: &Symtab) -> Result<Vec<Datum>> {
    let fields = match d {
        Datum::List(items) => return Ok(items.clone()),
        Datum::Struct(fields) => fields,
        other => {
            return Err(Error::Decode(format!(
                "expected list or compressed list, found {}",
                other.type_name()
            )))
        }
    };
    let mut algo = None;
    let mut size = None;
    let mut data = None;
    for f in fields {
        match f.label.as_str() {
            "algo" => algo = Some(f.value.as_str().map_err(|e| e.in_field("algo"))?),
            "size" => size = Some(f.value.as_uint().map_err(|e| e.in_field("size"))? as usize),
            "data" => data = Some(f.value.as_blob().map_err(|e| e.in_field("data"))?),
            other => return Err(Error::Decode(format!("unexpected field '{other}'"))),
        }
    }
    let (algo, size, data) = match (algo, size, data) {
        (Some(a), Some(s), Some(d)) => (a, s, d),
        _ => return Err(Error::Decode("compressed list is missing fields".to_string())),
    };
    if algo != ALGO {
        return Err(Error::Decode(format!("unknown compression algo {algo:?}")));
    }
    let mut body = Vec::with_capacity(size);
    GzDecoder::new(data)
        .read_to_end(&mut body)
        .map_err(|e| Error::Decode(format!("list decompression failed: {e}")))?;
    if body.len() != size {
        return Err(Error::Decode(format!(
            "compressed list size mismatch: expected {size}, got {}",
            body.len()
        )));
    }
    let mut items = Vec::new();
    let mut rest = body.as_slice();
    while !rest.is_empty() {
        let (item, tail) = Datum::read(rest, st)?;
        items.push(item);
        rest = tail;
    }
    Ok(items)
}
