//! Text-format value parsers.
//!
//! Both the HTTP path (raw text output) and the socket path (simple query,
//! text format) hand back column values as Postgres text. [`TypeParsers`]
//! turns them into JSON values keyed by type OID.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// PostgreSQL Type OIDs
/// Reference: https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat
#[allow(dead_code)]
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20; // bigint
    pub const INT2: u32 = 21; // smallint
    pub const INT4: u32 = 23; // integer
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// Parser from the text representation of one column value.
pub type TypeParser = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// OID → parser table. Unlisted OIDs stay strings.
#[derive(Clone)]
pub struct TypeParsers {
    parsers: HashMap<u32, TypeParser>,
}

impl Default for TypeParsers {
    fn default() -> Self {
        let mut parsers = Self::empty();
        for type_oid in [oid::INT2, oid::INT4, oid::OID] {
            parsers.set(type_oid, parse_integer);
        }
        parsers.set(oid::FLOAT4, parse_float);
        parsers.set(oid::FLOAT8, parse_float);
        parsers.set(oid::BOOL, parse_bool);
        parsers.set(oid::JSON, parse_json);
        parsers.set(oid::JSONB, parse_json);
        parsers
    }
}

impl fmt::Debug for TypeParsers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut oids: Vec<_> = self.parsers.keys().collect();
        oids.sort();
        f.debug_struct("TypeParsers").field("oids", &oids).finish()
    }
}

impl TypeParsers {
    /// No parsers at all: every value is a string.
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Register (or replace) the parser for `type_oid`.
    pub fn set(&mut self, type_oid: u32, parser: impl Fn(&str) -> Value + Send + Sync + 'static) {
        self.parsers.insert(type_oid, Arc::new(parser));
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, type_oid: u32, parser: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        self.set(type_oid, parser);
        self
    }

    /// Overlay `other`: its parsers win.
    pub fn extend(&mut self, other: &TypeParsers) {
        for (type_oid, parser) in &other.parsers {
            self.parsers.insert(*type_oid, Arc::clone(parser));
        }
    }

    /// Parse one value. SQL NULL stays null regardless of type.
    pub fn parse(&self, type_oid: u32, text: Option<&str>) -> Value {
        match text {
            None => Value::Null,
            Some(text) => match self.parsers.get(&type_oid) {
                Some(parser) => parser(text),
                None => Value::String(text.to_string()),
            },
        }
    }
}

fn parse_integer(text: &str) -> Value {
    text.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_float(text: &str) -> Value {
    // NaN and ±Infinity have no JSON number form
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

fn parse_bool(text: &str) -> Value {
    Value::Bool(matches!(text, "t" | "true"))
}

fn parse_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
