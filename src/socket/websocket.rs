//! WebSocket boundary.
//!
//! The transport only needs a binary sink and a frame stream. Anything that
//! can provide them (tokio-tungstenite, an in-memory pair, a runtime's native
//! WebSocket) plugs in through [`WebSocketConnector`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};

use crate::error::{ServerlessError, ServerlessResult};

/// One inbound WebSocket frame, as the transport sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// Binary payload. Text frames arrive here as their UTF-8 bytes.
    Binary(Bytes),
    Close,
}

pub type WsSink = Pin<Box<dyn Sink<Bytes, Error = ServerlessError> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = ServerlessResult<WsFrame>> + Send>>;

/// An open binary WebSocket, split into halves.
pub struct WsChannel {
    pub sink: WsSink,
    pub stream: WsStream,
}

impl WsChannel {
    pub fn new(
        sink: impl Sink<Bytes, Error = ServerlessError> + Send + 'static,
        stream: impl Stream<Item = ServerlessResult<WsFrame>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens WebSockets. Resolves once the socket is open.
#[async_trait]
pub trait WebSocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> ServerlessResult<WsChannel>;
}

/// Default connector backed by tokio-tungstenite.
///
/// `wss://` endpoints use rustls with the webpki root store unless a client
/// config is supplied.
#[derive(Clone, Default)]
pub struct TungsteniteConnector {
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for TungsteniteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteConnector")
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}

impl TungsteniteConnector {
    /// Use a specific rustls client config for `wss://`.
    pub fn with_tls_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self { tls: Some(config) }
    }

    fn tls_config(&self) -> ServerlessResult<Arc<rustls::ClientConfig>> {
        if let Some(config) = &self.tls {
            return Ok(Arc::clone(config));
        }
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = rustls::crypto::ring::default_provider();
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerlessError::Tls(format!("Failed to set protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

#[async_trait]
impl WebSocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> ServerlessResult<WsChannel> {
        let connector = if url.starts_with("wss://") {
            Some(Connector::Rustls(self.tls_config()?))
        } else {
            Some(Connector::Plain)
        };

        let (ws, response) = connect_async_tls_with_config(url, None, true, connector)
            .await
            .map_err(|e| ServerlessError::Transport(format!("WebSocket connect to {} failed: {}", url, e)))?;
        tracing::debug!(url, status = %response.status(), "websocket open");

        let (sink, stream) = ws.split();

        let sink = sink
            .with(|bytes: Bytes| future::ready(Ok::<_, WsError>(Message::Binary(bytes))))
            .sink_map_err(|e| ServerlessError::WebSocket(e.to_string()));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(bytes)) => Some(Ok(WsFrame::Binary(bytes))),
                Ok(Message::Text(text)) => {
                    Some(Ok(WsFrame::Binary(Bytes::copy_from_slice(text.as_str().as_bytes()))))
                }
                Ok(Message::Close(_)) => Some(Ok(WsFrame::Close)),
                // ping/pong are answered by tungstenite itself
                Ok(_) => None,
                Err(e) => Some(Err(ServerlessError::WebSocket(e.to_string()))),
            })
        });

        Ok(WsChannel::new(sink, stream))
    }
}
