//! Process-wide configuration.
//!
//! Values resolve in three layers, most specific first:
//!
//! 1. instance overrides (a [`ServerlessConfig`] handed to a socket or client),
//! 2. process-wide overrides ([`set`] / [`update`]),
//! 3. library defaults.
//!
//! Resolution happens at the point of use, never at construction: a socket
//! created before a call to [`update`] sees the new value the next time it
//! reads it.
//!
//! ```ignore
//! qail_serverless::config::update(|c| {
//!     c.ws_proxy = Some(Endpoint::url("proxy.example.com/v2"));
//!     c.coalesce_writes = Some(false);
//! });
//! ```

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::{ServerlessError, ServerlessResult};
use crate::socket::{TungsteniteConnector, WebSocketConnector};

/// Function computing an address from `(host, port)`.
pub type AddressResolver = Arc<dyn Fn(&str, u16) -> String + Send + Sync>;

/// An address given either literally or as a function of `(host, port)`.
#[derive(Clone)]
pub enum Endpoint {
    Url(String),
    Resolver(AddressResolver),
}

impl Endpoint {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn resolver(f: impl Fn(&str, u16) -> String + Send + Sync + 'static) -> Self {
        Self::Resolver(Arc::new(f))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Endpoint::Resolver(_) => f.write_str("Resolver(<fn>)"),
        }
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Endpoint::Url)
    }
}

/// Startup pipelining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineConnect {
    /// Send the cleartext password without waiting to be asked.
    ///
    /// Only for servers that authenticate with a cleartext password. If the
    /// server asks for SCRAM or MD5 instead, the first query fails with
    /// [`ServerlessError::ProtocolDesync`](crate::error::ServerlessError::ProtocolDesync);
    /// there is no fallback. Use [`PipelineConnect::Disabled`] for those servers.
    Password,
    Disabled,
}

/// One configuration layer. `None` means "defer to the next layer".
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerlessConfig {
    /// HTTP query endpoint. Default: `https://{host}/sql`.
    pub fetch_endpoint: Option<Endpoint>,
    /// WebSocket proxy. A literal proxy becomes `{proxy}?address={host}:{port}`.
    /// Default: `{host}/v2`.
    pub ws_proxy: Option<Endpoint>,
    /// Merge writes issued in one scheduling turn into one frame. Default: true.
    pub coalesce_writes: Option<bool>,
    /// `wss://` rather than `ws://`. Default: true.
    pub use_secure_web_socket: Option<bool>,
    /// Never negotiate Postgres-level TLS inside the tunnel. Default: true.
    pub force_disable_pg_ssl: Option<bool>,
    /// Omit SNI from the Postgres-level TLS handshake. Default: false.
    pub disable_sni: Option<bool>,
    /// Default: [`PipelineConnect::Password`].
    pub pipeline_connect: Option<PipelineConnect>,
    /// Assume the proxy accepts the SSL upgrade and start TLS immediately.
    /// Default: false.
    pub pipeline_tls: Option<bool>,
    /// Trusted roots for Postgres-level TLS as a PEM bundle. Default: empty,
    /// meaning the webpki root store.
    pub root_certs: Option<String>,
    /// Opens the WebSocket. Default: [`TungsteniteConnector`].
    #[serde(skip)]
    pub web_socket_connector: Option<Arc<dyn WebSocketConnector>>,
}

impl fmt::Debug for ServerlessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerlessConfig")
            .field("fetch_endpoint", &self.fetch_endpoint)
            .field("ws_proxy", &self.ws_proxy)
            .field("coalesce_writes", &self.coalesce_writes)
            .field("use_secure_web_socket", &self.use_secure_web_socket)
            .field("force_disable_pg_ssl", &self.force_disable_pg_ssl)
            .field("disable_sni", &self.disable_sni)
            .field("pipeline_connect", &self.pipeline_connect)
            .field("pipeline_tls", &self.pipeline_tls)
            .field("root_certs", &self.root_certs.as_ref().map(|pem| pem.len()))
            .field(
                "web_socket_connector",
                &self.web_socket_connector.as_ref().map(|_| "<connector>"),
            )
            .finish()
    }
}

impl ServerlessConfig {
    /// Create a new configuration builder
    pub fn builder() -> ServerlessConfigBuilder {
        ServerlessConfigBuilder::default()
    }

    /// Parse the serializable keys from TOML.
    ///
    /// ```toml
    /// ws_proxy = "proxy.example.com/v2"
    /// coalesce_writes = true
    /// pipeline_connect = "password"
    /// ```
    pub fn from_toml_str(source: &str) -> ServerlessResult<Self> {
        toml::from_str(source).map_err(|e| ServerlessError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ServerlessResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Overlay `other` on `self`: every key set in `other` wins.
    pub fn merge(&mut self, other: ServerlessConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $( if other.$field.is_some() { self.$field = other.$field; } )*
            };
        }
        take!(
            fetch_endpoint,
            ws_proxy,
            coalesce_writes,
            use_secure_web_socket,
            force_disable_pg_ssl,
            disable_sni,
            pipeline_connect,
            pipeline_tls,
            root_certs,
            web_socket_connector
        );
    }
}

/// Builder for ServerlessConfig
#[derive(Debug, Default)]
pub struct ServerlessConfigBuilder {
    config: ServerlessConfig,
}

impl ServerlessConfigBuilder {
    pub fn fetch_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.fetch_endpoint = Some(endpoint);
        self
    }

    pub fn ws_proxy(mut self, proxy: Endpoint) -> Self {
        self.config.ws_proxy = Some(proxy);
        self
    }

    pub fn coalesce_writes(mut self, enabled: bool) -> Self {
        self.config.coalesce_writes = Some(enabled);
        self
    }

    pub fn use_secure_web_socket(mut self, enabled: bool) -> Self {
        self.config.use_secure_web_socket = Some(enabled);
        self
    }

    pub fn force_disable_pg_ssl(mut self, disabled: bool) -> Self {
        self.config.force_disable_pg_ssl = Some(disabled);
        self
    }

    pub fn disable_sni(mut self, disabled: bool) -> Self {
        self.config.disable_sni = Some(disabled);
        self
    }

    pub fn pipeline_connect(mut self, mode: PipelineConnect) -> Self {
        self.config.pipeline_connect = Some(mode);
        self
    }

    pub fn pipeline_tls(mut self, enabled: bool) -> Self {
        self.config.pipeline_tls = Some(enabled);
        self
    }

    pub fn root_certs(mut self, pem: impl Into<String>) -> Self {
        self.config.root_certs = Some(pem.into());
        self
    }

    pub fn web_socket_connector(mut self, connector: Arc<dyn WebSocketConnector>) -> Self {
        self.config.web_socket_connector = Some(connector);
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerlessConfig {
        self.config
    }
}

static GLOBAL: LazyLock<RwLock<ServerlessConfig>> =
    LazyLock::new(|| RwLock::new(ServerlessConfig::default()));

/// Replace the process-wide overrides.
pub fn set(config: ServerlessConfig) {
    let mut global = GLOBAL.write().unwrap_or_else(|e| e.into_inner());
    *global = config;
}

/// Mutate the process-wide overrides in place.
pub fn update(f: impl FnOnce(&mut ServerlessConfig)) {
    let mut global = GLOBAL.write().unwrap_or_else(|e| e.into_inner());
    f(&mut global);
}

/// Drop all process-wide overrides, back to library defaults.
pub fn reset() {
    set(ServerlessConfig::default());
}

/// Snapshot of the process-wide overrides.
pub fn global() -> ServerlessConfig {
    GLOBAL.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn layered<T: Clone>(
    instance: &ServerlessConfig,
    pick: impl Fn(&ServerlessConfig) -> Option<&T>,
) -> Option<T> {
    if let Some(value) = pick(instance) {
        return Some(value.clone());
    }
    let global = GLOBAL.read().unwrap_or_else(|e| e.into_inner());
    pick(&global).cloned()
}

// Read-time resolution, one function per key.

pub(crate) fn fetch_endpoint(instance: &ServerlessConfig) -> Endpoint {
    layered(instance, |c| c.fetch_endpoint.as_ref())
        .unwrap_or_else(|| Endpoint::resolver(|host, _port| format!("https://{}/sql", host)))
}

pub(crate) fn ws_proxy(instance: &ServerlessConfig) -> Endpoint {
    layered(instance, |c| c.ws_proxy.as_ref())
        .unwrap_or_else(|| Endpoint::resolver(|host, _port| format!("{}/v2", host)))
}

pub(crate) fn coalesce_writes(instance: &ServerlessConfig) -> bool {
    layered(instance, |c| c.coalesce_writes.as_ref()).unwrap_or(true)
}

pub(crate) fn use_secure_web_socket(instance: &ServerlessConfig) -> bool {
    layered(instance, |c| c.use_secure_web_socket.as_ref()).unwrap_or(true)
}

pub(crate) fn force_disable_pg_ssl(instance: &ServerlessConfig) -> bool {
    layered(instance, |c| c.force_disable_pg_ssl.as_ref()).unwrap_or(true)
}

pub(crate) fn disable_sni(instance: &ServerlessConfig) -> bool {
    layered(instance, |c| c.disable_sni.as_ref()).unwrap_or(false)
}

pub(crate) fn pipeline_connect(instance: &ServerlessConfig) -> PipelineConnect {
    layered(instance, |c| c.pipeline_connect.as_ref()).unwrap_or(PipelineConnect::Password)
}

pub(crate) fn pipeline_tls(instance: &ServerlessConfig) -> bool {
    layered(instance, |c| c.pipeline_tls.as_ref()).unwrap_or(false)
}

pub(crate) fn root_certs(instance: &ServerlessConfig) -> String {
    layered(instance, |c| c.root_certs.as_ref()).unwrap_or_default()
}

pub(crate) fn web_socket_connector(instance: &ServerlessConfig) -> Arc<dyn WebSocketConnector> {
    layered(instance, |c| c.web_socket_connector.as_ref())
        .unwrap_or_else(|| Arc::new(TungsteniteConnector::default()))
}

/// Resolve an endpoint for `(host, port)`, proxy-style: a literal address
/// gets the target appended as `?address=host:port`.
pub(crate) fn proxy_address(endpoint: &Endpoint, host: &str, port: u16) -> String {
    match endpoint {
        Endpoint::Url(proxy) => format!("{}?address={}:{}", proxy, host, port),
        Endpoint::Resolver(f) => f(host, port),
    }
}
