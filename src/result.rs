//! Result envelope and row shaping.
//!
//! The HTTP executor and the socket client both end with a [`RawResult`]
//! (column metadata plus text values) and shape it the same way.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ServerlessError, ServerlessResult};
use crate::protocol::FieldDescription;
use crate::types::TypeParsers;

/// Column metadata, named as the HTTP endpoint names it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "tableID", default)]
    pub table_id: u32,
    #[serde(rename = "columnID", default)]
    pub column_id: i32,
    #[serde(rename = "dataTypeID")]
    pub data_type_id: u32,
    #[serde(default)]
    pub data_type_size: i32,
    #[serde(default)]
    pub data_type_modifier: i32,
    #[serde(default = "text_format")]
    pub format: String,
}

fn text_format() -> String {
    "text".to_string()
}

impl From<&FieldDescription> for FieldDef {
    fn from(f: &FieldDescription) -> Self {
        Self {
            name: f.name.clone(),
            table_id: f.table_oid,
            column_id: f.column_attr as i32,
            data_type_id: f.type_oid,
            data_type_size: f.type_size as i32,
            data_type_modifier: f.type_modifier,
            format: if f.format == 1 { "binary" } else { "text" }.to_string(),
        }
    }
}

/// One statement's result before shaping: values still in text form.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResult {
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub row_count: Option<u64>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Full result envelope (`full_results = true`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub fields: Vec<FieldDef>,
    pub command: String,
    pub row_count: Option<u64>,
    pub rows: Vec<Value>,
    pub row_as_array: bool,
}

/// What a query returns: bare rows, or the full envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    Rows(Vec<Value>),
    Full(QueryResult),
}

impl QueryOutput {
    /// The rows, whichever shape was requested.
    pub fn rows(&self) -> &[Value] {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Full(result) => &result.rows,
        }
    }

    pub fn into_rows(self) -> Vec<Value> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Full(result) => result.rows,
        }
    }

    pub fn full(&self) -> Option<&QueryResult> {
        match self {
            QueryOutput::Full(result) => Some(result),
            QueryOutput::Rows(_) => None,
        }
    }
}

/// Shape one raw result.
///
/// `array_mode` picks positional arrays over objects keyed by column name
/// (column order preserved; a repeated name keeps its first position and its
/// last value). `full_results` wraps the rows in a [`QueryResult`].
pub fn shape(
    raw: RawResult,
    parsers: &TypeParsers,
    array_mode: bool,
    full_results: bool,
) -> ServerlessResult<QueryOutput> {
    let mut rows = Vec::with_capacity(raw.rows.len());
    for (i, row) in raw.rows.into_iter().enumerate() {
        if row.len() != raw.fields.len() {
            return Err(ServerlessError::MalformedResponse(format!(
                "row {} has {} values for {} fields",
                i,
                row.len(),
                raw.fields.len()
            )));
        }
        let values = raw
            .fields
            .iter()
            .zip(row)
            .map(|(field, text)| (field, parsers.parse(field.data_type_id, text.as_deref())));

        rows.push(if array_mode {
            Value::Array(values.map(|(_, v)| v).collect())
        } else {
            let mut object = Map::new();
            for (field, value) in values {
                object.insert(field.name.clone(), value);
            }
            Value::Object(object)
        });
    }

    if !full_results {
        return Ok(QueryOutput::Rows(rows));
    }

    Ok(QueryOutput::Full(QueryResult {
        command: raw.command.unwrap_or_default(),
        row_count: raw.row_count,
        fields: raw.fields,
        rows,
        row_as_array: array_mode,
    }))
}

/// `"INSERT 0 5"` → `("INSERT", Some(5))`, `"CREATE TABLE"` → `("CREATE", None)`.
pub(crate) fn parse_command_tag(tag: &str) -> (String, Option<u64>) {
    let command = tag.split_whitespace().next().unwrap_or_default().to_string();
    let count = tag.split_whitespace().last().and_then(|s| s.parse().ok());
    (command, count)
}
