//! Parameterized queries and Postgres text-format parameters.

use serde_json::{Value, json};
use std::fmt::Write as _;

use crate::error::{ServerlessError, ServerlessResult};

/// A query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Param>),
    Json(Value),
}

impl Param {
    pub fn array<T: Into<Param>>(items: impl IntoIterator<Item = T>) -> Self {
        Param::Array(items.into_iter().map(Into::into).collect())
    }

    /// Postgres text representation; `None` is SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Param::Null => None,
            Param::Bool(b) => Some(b.to_string()),
            Param::Int(n) => Some(n.to_string()),
            Param::Float(f) => Some(f.to_string()),
            Param::Text(s) => Some(s.clone()),
            Param::Bytes(bytes) => Some(format!("\\x{}", hex(bytes))),
            Param::Array(items) => Some(array_literal(items)),
            Param::Json(value) => Some(value.to_string()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// `{"1",NULL,"a \"b\"",{"2","3"}}`
fn array_literal(items: &[Param]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Param::Null => out.push_str("NULL"),
            Param::Array(nested) => out.push_str(&array_literal(nested)),
            // backslash is itself escaped inside an array element
            Param::Bytes(bytes) => {
                let _ = write!(out, "\"\\\\x{}\"", hex(bytes));
            }
            other => {
                let text = other.to_text().unwrap_or_default();
                out.push('"');
                out.push_str(&text.replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
            }
        }
    }
    out.push('}');
    out
}

macro_rules! param_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Param {
                fn from(v: $ty) -> Self {
                    Param::$variant(v $(as $cast)?)
                }
            }
        )*
    };
}

param_from!(
    bool => Bool,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    u32 => Int as i64,
    f32 => Float as f64,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
    Vec<Param> => Array,
    Value => Json,
);

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<&[u8]> for Param {
    fn from(v: &[u8]) -> Self {
        Param::Bytes(v.to_vec())
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Param::Null)
    }
}

/// Query text plus ordered parameters. Built per call.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedQuery {
    pub query: String,
    pub params: Vec<Param>,
}

impl ParameterizedQuery {
    pub fn new(query: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }

    /// Build from a format-style template: each `{}` becomes the next `$n`
    /// placeholder; `{{` and `}}` are literal braces.
    pub fn from_template(template: &str, params: Vec<Param>) -> ServerlessResult<Self> {
        let mut query = String::with_capacity(template.len() + params.len() * 2);
        let mut placeholders = 0;
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match (c, chars.peek().copied()) {
                ('{', Some('{')) | ('}', Some('}')) => {
                    chars.next();
                    query.push(c);
                }
                ('{', Some('}')) => {
                    chars.next();
                    placeholders += 1;
                    let _ = write!(query, "${}", placeholders);
                }
                ('{', _) | ('}', _) => {
                    return Err(ServerlessError::Config(format!(
                        "Unmatched '{}' in query template; use '{}{}' for a literal brace",
                        c, c, c
                    )));
                }
                _ => query.push(c),
            }
        }

        if placeholders != params.len() {
            return Err(ServerlessError::Config(format!(
                "Query template has {} placeholders but {} parameters",
                placeholders,
                params.len()
            )));
        }
        Ok(Self { query, params })
    }

    /// `{"query": ..., "params": [...]}` with parameters in text format.
    pub(crate) fn to_wire(&self) -> Value {
        json!({
            "query": self.query,
            "params": self.params.iter().map(Param::to_text).collect::<Vec<_>>(),
        })
    }
}

/// Build a [`ParameterizedQuery`] from a template, `format!`-style:
/// each `{}` becomes `$1`, `$2`, ... bound to the arguments in order.
///
/// ```ignore
/// let id = 42;
/// let q = sql!("SELECT * FROM users WHERE id = {} AND active = {}", id, true)?;
/// assert_eq!(q.query, "SELECT * FROM users WHERE id = $1 AND active = $2");
/// ```
#[macro_export]
macro_rules! sql {
    ($template:expr $(, $param:expr)* $(,)?) => {
        $crate::http::ParameterizedQuery::from_template(
            $template,
            vec![$($crate::http::Param::from($param)),*],
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scalar_text_forms() {
        assert_eq!(Param::Null.to_text(), None);
        assert_eq!(Param::from(true).to_text().as_deref(), Some("true"));
        assert_eq!(Param::from(42).to_text().as_deref(), Some("42"));
        assert_eq!(Param::from(1.5).to_text().as_deref(), Some("1.5"));
        assert_eq!(Param::from(vec![0xdeu8, 0xad]).to_text().as_deref(), Some("\\xdead"));
        assert_eq!(Param::from(None::<i32>), Param::Null);
        assert_eq!(
            Param::from(serde_json::json!({"a": 1})).to_text().as_deref(),
            Some(r#"{"a":1}"#)
        );
    }

    #[test]
    fn test_array_literal_quoting() {
        let param = Param::Array(vec![
            Param::from(1),
            Param::Null,
            Param::from(r#"say "hi" \ bye"#),
            Param::array([2, 3]),
        ]);
        assert_eq!(
            param.to_text().unwrap(),
            r#"{"1",NULL,"say \"hi\" \\ bye",{"2","3"}}"#
        );
    }

    #[test]
    fn test_bytes_inside_array() {
        let param = Param::Array(vec![Param::from(vec![0x01u8])]);
        assert_eq!(param.to_text().unwrap(), r#"{"\\x01"}"#);
    }

    #[test]
    fn test_sql_macro_numbers_placeholders() {
        let q = crate::sql!("SELECT * FROM t WHERE a = {} AND b = {}", 1, "x").unwrap();
        assert_eq!(q.query, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(q.params, vec![Param::Int(1), Param::Text("x".to_string())]);
        assert_eq!(
            q,
            ParameterizedQuery::new(
                "SELECT * FROM t WHERE a = $1 AND b = $2",
                vec![Param::from(1), Param::from("x")]
            )
        );
    }

    #[test]
    fn test_sql_macro_escaped_braces() {
        let q = crate::sql!("SELECT '{{}}'::jsonb, {}", 1).unwrap();
        assert_eq!(q.query, "SELECT '{}'::jsonb, $1");
    }

    #[test]
    fn test_template_errors() {
        assert!(ParameterizedQuery::from_template("SELECT {}", vec![]).is_err());
        assert!(ParameterizedQuery::from_template("SELECT 1", vec![Param::Null]).is_err());
        assert!(ParameterizedQuery::from_template("SELECT '{'", vec![]).is_err());
    }

    #[test]
    fn test_wire_body() {
        let q = ParameterizedQuery::new("SELECT $1, $2", vec![Param::Null, Param::from(false)]);
        assert_eq!(
            q.to_wire(),
            serde_json::json!({"query": "SELECT $1, $2", "params": [null, "false"]})
        );
    }
}
