//! Query options and their layering.
//!
//! Options resolve as: library defaults, then the options the
//! [`HttpClient`](super::HttpClient) was built with, then the options passed
//! at the call site. A transaction's own options then apply to every member
//! query alike.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::query::ParameterizedQuery;
use crate::error::ServerlessResult;
use crate::result::QueryOutput;
use crate::types::TypeParsers;

/// Fires with each query before it is sent.
pub type QueryCallback = Arc<dyn Fn(&ParameterizedQuery) + Send + Sync>;

/// Fires after a response: the query, the raw server result, the shaped
/// output, and the options it was shaped with.
pub type ResultCallback =
    Arc<dyn Fn(&ParameterizedQuery, &Value, &QueryOutput, &ResolvedOptions) + Send + Sync>;

type TokenSupplier = Arc<dyn Fn() -> BoxFuture<'static, ServerlessResult<String>> + Send + Sync>;

/// Bearer credential: fixed, or fetched fresh for every request.
#[derive(Clone)]
pub enum AuthToken {
    Literal(String),
    Supplier(TokenSupplier),
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthToken::Literal(_) => f.write_str("Literal(<redacted>)"),
            AuthToken::Supplier(_) => f.write_str("Supplier(<fn>)"),
        }
    }
}

impl AuthToken {
    pub fn literal(token: impl Into<String>) -> Self {
        Self::Literal(token.into())
    }

    /// Async supplier, awaited on every request.
    pub fn supplier<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServerlessResult<String>> + Send + 'static,
    {
        Self::Supplier(Arc::new(move || f().boxed()))
    }

    /// Synchronous supplier, called on every request.
    pub fn from_fn(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self::supplier(move || {
            let token = f();
            async move { Ok(token) }
        })
    }

    pub(crate) async fn resolve(&self) -> ServerlessResult<String> {
        match self {
            AuthToken::Literal(token) => Ok(token.clone()),
            AuthToken::Supplier(f) => f().await,
        }
    }
}

impl From<&str> for AuthToken {
    fn from(token: &str) -> Self {
        Self::literal(token)
    }
}

impl From<String> for AuthToken {
    fn from(token: String) -> Self {
        Self::Literal(token)
    }
}

/// Passed through to the HTTP request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// Applied after the library's own headers, so these win.
    pub headers: Vec<(String, String)>,
    /// Whole-request timeout, enforced by the HTTP client.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `other` on top of `self`: headers accumulate (later wins per name),
    /// a set timeout replaces.
    fn layer(&self, other: &FetchOptions) -> FetchOptions {
        let mut merged = self.clone();
        merged.headers.extend(other.headers.iter().cloned());
        if other.timeout.is_some() {
            merged.timeout = other.timeout;
        }
        merged
    }
}

/// Per-query options. `None` defers to the next layer down.
#[derive(Clone, Default)]
pub struct HttpQueryOptions {
    pub array_mode: Option<bool>,
    pub full_results: Option<bool>,
    pub fetch_options: Option<FetchOptions>,
    pub auth_token: Option<AuthToken>,
    /// Extra column parsers, layered over the defaults.
    pub types: Option<TypeParsers>,
    pub query_callback: Option<QueryCallback>,
    pub result_callback: Option<ResultCallback>,
}

impl fmt::Debug for HttpQueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpQueryOptions")
            .field("array_mode", &self.array_mode)
            .field("full_results", &self.full_results)
            .field("fetch_options", &self.fetch_options)
            .field("auth_token", &self.auth_token)
            .field("types", &self.types)
            .field("query_callback", &self.query_callback.is_some())
            .field("result_callback", &self.result_callback.is_some())
            .finish()
    }
}

impl HttpQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn array_mode(mut self, enabled: bool) -> Self {
        self.array_mode = Some(enabled);
        self
    }

    pub fn full_results(mut self, enabled: bool) -> Self {
        self.full_results = Some(enabled);
        self
    }

    pub fn fetch_options(mut self, options: FetchOptions) -> Self {
        self.fetch_options = Some(options);
        self
    }

    pub fn auth_token(mut self, token: impl Into<AuthToken>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn types(mut self, types: TypeParsers) -> Self {
        self.types = Some(types);
        self
    }

    pub fn query_callback(mut self, f: impl Fn(&ParameterizedQuery) + Send + Sync + 'static) -> Self {
        self.query_callback = Some(Arc::new(f));
        self
    }

    pub fn result_callback(
        mut self,
        f: impl Fn(&ParameterizedQuery, &Value, &QueryOutput, &ResolvedOptions) + Send + Sync + 'static,
    ) -> Self {
        self.result_callback = Some(Arc::new(f));
        self
    }

    /// `over` on top of `self`.
    pub fn layered(&self, over: &HttpQueryOptions) -> HttpQueryOptions {
        let types = match (&self.types, &over.types) {
            (Some(base), Some(top)) => {
                let mut merged = base.clone();
                merged.extend(top);
                Some(merged)
            }
            (base, top) => top.clone().or_else(|| base.clone()),
        };
        let fetch_options = match (&self.fetch_options, &over.fetch_options) {
            (Some(base), Some(top)) => Some(base.layer(top)),
            (base, top) => top.clone().or_else(|| base.clone()),
        };
        HttpQueryOptions {
            array_mode: over.array_mode.or(self.array_mode),
            full_results: over.full_results.or(self.full_results),
            fetch_options,
            auth_token: over.auth_token.clone().or_else(|| self.auth_token.clone()),
            types,
            query_callback: over.query_callback.clone().or_else(|| self.query_callback.clone()),
            result_callback: over.result_callback.clone().or_else(|| self.result_callback.clone()),
        }
    }

    pub(crate) fn resolve(&self) -> ResolvedOptions {
        let mut types = TypeParsers::default();
        if let Some(custom) = &self.types {
            types.extend(custom);
        }
        ResolvedOptions {
            array_mode: self.array_mode.unwrap_or(false),
            full_results: self.full_results.unwrap_or(false),
            fetch_options: self.fetch_options.clone().unwrap_or_default(),
            types,
            isolation_level: None,
            read_only: None,
            deferrable: None,
        }
    }
}

/// Transaction isolation, sent as `Neon-Batch-Isolation-Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "ReadUncommitted",
            IsolationLevel::ReadCommitted => "ReadCommitted",
            IsolationLevel::RepeatableRead => "RepeatableRead",
            IsolationLevel::Serializable => "Serializable",
        }
    }
}

/// Options for a batched transaction. These apply to every member query;
/// members cannot override them.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub query: HttpQueryOptions,
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }

    pub fn array_mode(mut self, enabled: bool) -> Self {
        self.query.array_mode = Some(enabled);
        self
    }

    pub fn full_results(mut self, enabled: bool) -> Self {
        self.query.full_results = Some(enabled);
        self
    }

    pub fn fetch_options(mut self, options: FetchOptions) -> Self {
        self.query.fetch_options = Some(options);
        self
    }

    pub fn auth_token(mut self, token: impl Into<AuthToken>) -> Self {
        self.query.auth_token = Some(token.into());
        self
    }

    pub fn options(mut self, options: HttpQueryOptions) -> Self {
        self.query = options;
        self
    }
}

/// Options after layering, as used for one request.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub array_mode: bool,
    pub full_results: bool,
    pub fetch_options: FetchOptions,
    pub types: TypeParsers,
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
}
