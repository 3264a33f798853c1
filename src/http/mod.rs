//! Stateless queries over HTTP.
//!
//! Every call is one POST to the query endpoint: a single statement, or a
//! batch run server-side as one non-interactive transaction. Results come
//! back as raw text and are shaped locally, the same way the socket client
//! shapes them.
//!
//! ```ignore
//! let db = HttpClient::new("postgres://user:pw@ep-cool.example.com/main")?;
//! let rows = db.query("SELECT $1::int AS n", vec![1.into()]).await?;
//!
//! let results = db
//!     .transaction(
//!         vec![sql!("INSERT INTO t VALUES ({})", 1)?, sql!("SELECT count(*) FROM t")?],
//!         TransactionOptions::new().isolation_level(IsolationLevel::Serializable),
//!     )
//!     .await?;
//! ```

mod options;
mod query;

pub use options::{
    AuthToken, FetchOptions, HttpQueryOptions, IsolationLevel, QueryCallback, ResolvedOptions,
    ResultCallback, TransactionOptions,
};
pub use query::{Param, ParameterizedQuery};

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};

use crate::client::ConnectionString;
use crate::config::{self, Endpoint, ServerlessConfig};
use crate::error::{DatabaseError, ServerlessError, ServerlessResult};
use crate::result::{QueryOutput, RawResult, shape};

/// A query together with its own options.
///
/// Inside a transaction the member's options are ignored; the
/// transaction's apply to every member.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub query: ParameterizedQuery,
    pub options: HttpQueryOptions,
}

impl From<ParameterizedQuery> for PreparedQuery {
    fn from(query: ParameterizedQuery) -> Self {
        Self {
            query,
            options: HttpQueryOptions::default(),
        }
    }
}

/// Executes queries against the HTTP endpoint for one connection string.
#[derive(Clone)]
pub struct HttpClient {
    connection_string: String,
    host: String,
    port: u16,
    options: HttpQueryOptions,
    config: ServerlessConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(connection_string: &str) -> ServerlessResult<Self> {
        Self::with_options(connection_string, HttpQueryOptions::default())
    }

    /// Client whose calls start from `options` instead of library defaults.
    pub fn with_options(connection_string: &str, options: HttpQueryOptions) -> ServerlessResult<Self> {
        let parsed = ConnectionString::parse(connection_string)?;
        Ok(Self {
            connection_string: connection_string.to_string(),
            host: parsed.host,
            port: parsed.port,
            options,
            config: ServerlessConfig::default(),
            http: reqwest::Client::new(),
        })
    }

    /// Instance-level configuration overrides (e.g. `fetch_endpoint`).
    pub fn with_config(mut self, config: ServerlessConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a preconfigured reqwest client.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Pair a query with call-site options, for [`run`](Self::run) or a
    /// transaction.
    pub fn prepare(&self, text: &str, params: Vec<Param>) -> PreparedQuery {
        ParameterizedQuery::new(text, params).into()
    }

    /// One statement with the client's options.
    pub async fn query(&self, text: &str, params: Vec<Param>) -> ServerlessResult<QueryOutput> {
        self.run(ParameterizedQuery::new(text, params), HttpQueryOptions::default())
            .await
    }

    /// One statement with call-site options.
    pub async fn query_with(
        &self,
        text: &str,
        params: Vec<Param>,
        options: HttpQueryOptions,
    ) -> ServerlessResult<QueryOutput> {
        self.run(ParameterizedQuery::new(text, params), options).await
    }

    /// Run a prepared query; `options` layer over the query's own.
    pub async fn run(
        &self,
        query: impl Into<PreparedQuery>,
        options: HttpQueryOptions,
    ) -> ServerlessResult<QueryOutput> {
        let prepared = query.into();
        let layered = self.options.layered(&prepared.options).layered(&options);
        let resolved = layered.resolve();

        if let Some(callback) = &layered.query_callback {
            callback(&prepared.query);
        }

        let body = prepared.query.to_wire();
        let response = self
            .post(&body, &layered, &resolved, HeaderMap::new())
            .await?;

        let output = shape_one(&response, &resolved)?;
        if let Some(callback) = &layered.result_callback {
            callback(&prepared.query, &response, &output, &resolved);
        }
        Ok(output)
    }

    /// Run all queries in one request, inside one server-side transaction.
    /// Returns one result per query, in order.
    pub async fn transaction<Q: Into<PreparedQuery>>(
        &self,
        queries: impl IntoIterator<Item = Q>,
        options: TransactionOptions,
    ) -> ServerlessResult<Vec<QueryOutput>> {
        let queries: Vec<ParameterizedQuery> =
            queries.into_iter().map(|q| q.into().query).collect();

        let layered = self.options.layered(&options.query);
        let mut resolved = layered.resolve();
        resolved.isolation_level = options.isolation_level;
        resolved.read_only = options.read_only;
        resolved.deferrable = options.deferrable;

        if let Some(callback) = &layered.query_callback {
            queries.iter().for_each(|q| callback(q));
        }

        let mut batch_headers = HeaderMap::new();
        if let Some(level) = resolved.isolation_level {
            batch_headers.insert(
                HeaderName::from_static("neon-batch-isolation-level"),
                HeaderValue::from_static(level.as_str()),
            );
        }
        if let Some(read_only) = resolved.read_only {
            batch_headers.insert(
                HeaderName::from_static("neon-batch-read-only"),
                bool_header(read_only),
            );
        }
        if let Some(deferrable) = resolved.deferrable {
            batch_headers.insert(
                HeaderName::from_static("neon-batch-deferrable"),
                bool_header(deferrable),
            );
        }

        let body = json!({
            "queries": queries.iter().map(ParameterizedQuery::to_wire).collect::<Vec<_>>(),
        });
        let response = self.post(&body, &layered, &resolved, batch_headers).await?;

        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ServerlessError::MalformedResponse("batch response has no results array".to_string())
            })?;
        if results.len() != queries.len() {
            return Err(ServerlessError::MalformedResponse(format!(
                "batch of {} queries returned {} results",
                queries.len(),
                results.len()
            )));
        }

        let mut outputs = Vec::with_capacity(results.len());
        for (query, raw) in queries.iter().zip(results) {
            let output = shape_one(raw, &resolved)?;
            if let Some(callback) = &layered.result_callback {
                callback(query, raw, &output, &resolved);
            }
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Build the batch with a closure over this client, then run it as
    /// [`transaction`](Self::transaction).
    pub async fn transaction_with<F>(
        &self,
        build: F,
        options: TransactionOptions,
    ) -> ServerlessResult<Vec<QueryOutput>>
    where
        F: FnOnce(&Self) -> Vec<PreparedQuery>,
    {
        let queries = build(self);
        self.transaction(queries, options).await
    }

    fn endpoint(&self) -> String {
        match config::fetch_endpoint(&self.config) {
            Endpoint::Url(url) => url,
            Endpoint::Resolver(f) => f(&self.host, self.port),
        }
    }

    async fn post(
        &self,
        body: &Value,
        options: &HttpQueryOptions,
        resolved: &ResolvedOptions,
        extra_headers: HeaderMap,
    ) -> ServerlessResult<Value> {
        let url = self.endpoint();

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("neon-connection-string"),
            HeaderValue::from_str(&self.connection_string)
                .map_err(|e| ServerlessError::Http(format!("Invalid connection string header: {}", e)))?,
        );
        headers.insert(HeaderName::from_static("neon-raw-text-output"), bool_header(true));
        // rows always come back positional; objects are built locally
        headers.insert(HeaderName::from_static("neon-array-mode"), bool_header(true));
        headers.extend(extra_headers);

        if let Some(token) = &options.auth_token {
            let token = token.resolve().await?;
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ServerlessError::Http(format!("Invalid auth token: {}", e)))?,
            );
        }

        for (name, value) in &resolved.fetch_options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ServerlessError::Http(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ServerlessError::Http(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        tracing::debug!(%url, "http query");
        let mut request = self.http.post(&url).headers(headers).json(body);
        if let Some(timeout) = resolved.fetch_options.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(DatabaseError::connecting)?;
        let status = response.status();
        let text = response.text().await.map_err(DatabaseError::connecting)?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "http query failed");
            return Err(error_from_body(status.as_u16(), &text).into());
        }

        serde_json::from_str(&text).map_err(|e| {
            ServerlessError::MalformedResponse(format!("response is not JSON: {}", e))
        })
    }
}

fn bool_header(value: bool) -> HeaderValue {
    HeaderValue::from_static(if value { "true" } else { "false" })
}

fn shape_one(raw: &Value, resolved: &ResolvedOptions) -> ServerlessResult<QueryOutput> {
    let parsed: RawResult = serde_json::from_value(raw.clone())
        .map_err(|e| ServerlessError::MalformedResponse(format!("unexpected result shape: {}", e)))?;
    shape(parsed, &resolved.types, resolved.array_mode, resolved.full_results)
}

/// Postgres diagnostics from an error body, or the raw body when it has none.
fn error_from_body(status: u16, body: &str) -> DatabaseError {
    let fields = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) if fields.contains_key("message") => fields,
        _ => {
            return DatabaseError::new(format!("Server error (HTTP status {}): {}", status, body));
        }
    };

    let text = |key: &str| -> Option<String> {
        match fields.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    };

    DatabaseError {
        message: text("message").unwrap_or_default(),
        severity: text("severity"),
        code: text("code"),
        detail: text("detail"),
        hint: text("hint"),
        position: text("position"),
        internal_position: text("internalPosition"),
        internal_query: text("internalQuery"),
        r#where: text("where"),
        schema: text("schema"),
        table: text("table"),
        column: text("column"),
        data_type: text("dataType"),
        constraint: text("constraint"),
        file: text("file"),
        line: text("line"),
        routine: text("routine"),
        source_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_fields() {
        let err = error_from_body(
            400,
            r#"{"message":"relation \"nope\" does not exist","code":"42P01","position":15,"severity":"ERROR"}"#,
        );
        assert_eq!(err.message, "relation \"nope\" does not exist");
        assert_eq!(err.code.as_deref(), Some("42P01"));
        assert_eq!(err.position.as_deref(), Some("15"));
        assert_eq!(err.severity.as_deref(), Some("ERROR"));
        assert_eq!(err.hint, None);
    }

    #[test]
    fn test_error_body_not_json() {
        let err = error_from_body(502, "Bad Gateway");
        assert_eq!(err.message, "Server error (HTTP status 502): Bad Gateway");
    }

    #[test]
    fn test_default_endpoint() {
        let client = HttpClient::new("postgres://u:p@ep-cool.example.com/db").unwrap();
        assert_eq!(client.endpoint(), "https://ep-cool.example.com/sql");

        let client = client.with_config(
            ServerlessConfig::builder()
                .fetch_endpoint(Endpoint::resolver(|host, port| format!("http://{}:{}/q", host, port)))
                .build(),
        );
        assert_eq!(client.endpoint(), "http://ep-cool.example.com:5432/q");
    }
}
