//! Shared environment doubles for planner integration tests.

use chrono::{DateTime, Utc};

use opal_common::Result;
use opal_expr::{to_text, Expr, Hint, TypeSet};
use opal_planner::env::{Env, HandleDecoder, Index, TableHandle};
use opal_planner::Hints;
use opal_wire::{Datum, Field};

/// Deterministic handle: echoes the table expression and the hints the
/// planner sent to `stat`.
#[derive(Debug)]
pub struct TestHandle {
    pub table: String,
    pub fields: Vec<String>,
    pub all_fields: bool,
}

impl TableHandle for TestHandle {
    fn encode(&self) -> Datum {
        Datum::Struct(vec![
            Field::new("table", Datum::String(self.table.clone())),
            Field::new(
                "fields",
                Datum::List(
                    self.fields
                        .iter()
                        .map(|f| Datum::String(f.clone()))
                        .collect(),
                ),
            ),
            Field::new("all_fields", Datum::Bool(self.all_fields)),
        ])
    }
}

/// A read-only environment over any table name.
pub struct TestEnv {
    pub schema: Option<Box<dyn Hint>>,
    pub index: Option<Box<dyn Index>>,
}

impl Default for TestEnv {
    fn default() -> Self {
        TestEnv {
            schema: None,
            index: None,
        }
    }
}

impl Env for TestEnv {
    fn stat(&self, table: &Expr, hints: &Hints) -> Result<Box<dyn TableHandle>> {
        Ok(Box::new(TestHandle {
            table: to_text(table),
            fields: hints.fields.clone(),
            all_fields: hints.all_fields,
        }))
    }

    fn schema(&self, _table: &Expr) -> Option<&dyn Hint> {
        self.schema.as_deref()
    }

    fn index(&self, _table: &Expr) -> Result<Option<&dyn Index>> {
        Ok(self.index.as_deref())
    }
}

/// Decoder matching [`TestHandle::encode`].
pub struct TestDecoder;

impl HandleDecoder for TestDecoder {
    fn decode_handle(&self, d: &Datum) -> Result<Box<dyn TableHandle>> {
        let mut table = String::new();
        let mut fields = Vec::new();
        let mut all_fields = false;
        for f in d.as_struct()? {
            match f.label.as_str() {
                "table" => table = f.value.as_str()?.to_string(),
                "fields" => {
                    for item in f.value.as_list()? {
                        fields.push(item.as_str()?.to_string());
                    }
                }
                "all_fields" => all_fields = f.value.as_bool()?,
                _ => {}
            }
        }
        Ok(Box::new(TestHandle {
            table,
            fields,
            all_fields,
        }))
    }
}

/// A fixed-schema hint provider keyed on identifier names.
pub struct FieldTypes(pub Vec<(&'static str, TypeSet)>);

impl Hint for FieldTypes {
    fn type_of(&self, e: &Expr) -> TypeSet {
        if let Expr::Ident(name) = e {
            for (n, t) in &self.0 {
                if n == name {
                    return *t;
                }
            }
        }
        TypeSet::ANY
    }
}

/// An index reporting the given columns as materially partitioned.
pub struct Partitions(pub Vec<&'static str>);

impl Index for Partitions {
    fn has_partition(&self, column: &str) -> bool {
        self.0.contains(&column)
    }
}

/// An index reporting a fixed time range for one path.
pub struct FixedRange {
    pub path: Vec<String>,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

impl Index for FixedRange {
    fn time_range(&self, path: &[String]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        (path == self.path.as_slice()).then_some((self.min, self.max))
    }
}
