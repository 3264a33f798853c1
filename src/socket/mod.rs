//! Stream-socket emulation over a WebSocket.
//!
//! [`WsSocket`] is the handle a protocol driver talks to: `connect`,
//! `write`, `start_tls`, `end`, `destroy`, plus the state flags a stream
//! socket carries. The WebSocket and the TLS engine live in one driver task
//! per socket; the handle reaches it through an unbounded command channel,
//! and everything the task observes comes back as [`SocketEvent`]s.
//!
//! ```ignore
//! let (mut socket, mut events) = WsSocket::new(ServerlessConfig::default());
//! socket.connect(5432, "db.example.com")?;
//! socket.write(&startup);
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SocketEvent::Data(bytes) => { /* feed the protocol decoder */ }
//!         SocketEvent::Close => break,
//!         _ => {}
//!     }
//! }
//! ```

mod driver;
pub mod tls;
pub mod websocket;

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use crate::config::{self, Endpoint, PipelineConnect, ServerlessConfig};
use crate::error::{ServerlessError, ServerlessResult};
use driver::{Command, Driver};

pub use tls::{RustlsEngine, TlsEngine, TlsOutput, TlsPhase};
pub use websocket::{TungsteniteConnector, WebSocketConnector, WsChannel, WsFrame, WsSink, WsStream};

/// Stream-socket flags. Frozen once `destroyed` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportState {
    pub connecting: bool,
    pub pending: bool,
    pub writable: bool,
    pub encrypted: bool,
    pub authorized: bool,
    pub destroyed: bool,
}

/// What the driver task reports.
#[derive(Debug)]
pub enum SocketEvent {
    /// WebSocket open; queued writes have been flushed.
    Connect,
    /// Plaintext from the server, in arrival order.
    Data(Bytes),
    /// TLS handshake finished.
    SecureConnect,
    /// Always followed by `Close`.
    Error(ServerlessError),
    /// Emitted exactly once per socket.
    Close,
}

/// Receiving side of a socket's events.
#[derive(Debug)]
pub struct SocketEvents {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketEvents {
    /// Next event; `None` after `Close` once the socket is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SocketEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Status {
    pub state: TransportState,
    pub tls: TlsPhase,
}

/// State shared between the handle and its driver task.
#[derive(Debug)]
pub(crate) struct Shared {
    status: watch::Sender<Status>,
    events: mpsc::UnboundedSender<SocketEvent>,
    closed: AtomicBool,
}

impl Shared {
    /// Apply `f` unless the socket is already destroyed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Status)) {
        self.status.send_if_modified(|status| {
            if status.state.destroyed {
                return false;
            }
            f(status);
            true
        });
    }

    pub(crate) fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub(crate) fn emit(&self, event: SocketEvent) {
        if matches!(event, SocketEvent::Close) && self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Transport-level configuration, resolved at the point of use: instance
/// overrides first, then the process-wide configuration, then defaults.
pub trait TransportConfig {
    fn overrides(&self) -> &ServerlessConfig;

    fn ws_proxy(&self) -> Endpoint {
        config::ws_proxy(self.overrides())
    }

    fn use_secure_web_socket(&self) -> bool {
        config::use_secure_web_socket(self.overrides())
    }

    fn coalesce_writes(&self) -> bool {
        config::coalesce_writes(self.overrides())
    }

    fn force_disable_pg_ssl(&self) -> bool {
        config::force_disable_pg_ssl(self.overrides())
    }

    fn pipeline_connect(&self) -> PipelineConnect {
        config::pipeline_connect(self.overrides())
    }

    fn pipeline_tls(&self) -> bool {
        config::pipeline_tls(self.overrides())
    }

    fn disable_sni(&self) -> bool {
        config::disable_sni(self.overrides())
    }

    fn root_certs(&self) -> String {
        config::root_certs(self.overrides())
    }

    fn web_socket_connector(&self) -> Arc<dyn WebSocketConnector> {
        config::web_socket_connector(self.overrides())
    }
}

/// A stream socket carried over a WebSocket.
pub struct WsSocket {
    config: ServerlessConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    /// Taken by the driver task on connect.
    queued: Option<mpsc::UnboundedReceiver<Command>>,
    pipelined_tls: bool,
}

impl std::fmt::Debug for WsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSocket")
            .field("state", &self.state())
            .field("tls", &self.tls_phase())
            .field("pipelined_tls", &self.pipelined_tls)
            .finish_non_exhaustive()
    }
}

impl TransportConfig for WsSocket {
    fn overrides(&self) -> &ServerlessConfig {
        &self.config
    }
}

impl WsSocket {
    /// New unconnected socket with instance-level configuration overrides.
    pub fn new(config: ServerlessConfig) -> (Self, SocketEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands, queued) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status::default());

        let socket = Self {
            config,
            shared: Arc::new(Shared {
                status,
                events: events_tx,
                closed: AtomicBool::new(false),
            }),
            commands,
            queued: Some(queued),
            pipelined_tls: false,
        };
        (socket, SocketEvents { rx: events_rx })
    }

    /// Arm pipelined TLS: right after `Connect`, report the server's
    /// SSL-acceptance byte without waiting for it, and strip the real one
    /// when it arrives. Only valid for proxies that always accept the
    /// upgrade; anything else is a protocol desync.
    pub fn pipeline_tls_on_connect(&mut self) {
        self.pipelined_tls = true;
    }

    /// Open the WebSocket for `host:port`. Writes issued before the socket
    /// opens are queued and flushed in order.
    pub fn connect(&mut self, port: u16, host: &str) -> ServerlessResult<()> {
        if self.destroyed() {
            return Err(ServerlessError::Transport("Socket is destroyed".to_string()));
        }
        let commands = self
            .queued
            .take()
            .ok_or_else(|| ServerlessError::Transport("Socket already connecting".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ServerlessError::Transport(format!("No async runtime: {}", e)))?;

        let address = config::proxy_address(&self.ws_proxy(), host, port);
        let scheme = if self.use_secure_web_socket() { "wss" } else { "ws" };
        let url = format!("{}://{}", scheme, address);

        self.shared.update(|s| {
            s.state.connecting = true;
            s.state.pending = true;
        });
        tracing::debug!(%url, pipelined_tls = self.pipelined_tls, "socket connecting");

        let driver = Driver::new(
            Arc::clone(&self.shared),
            commands,
            self.coalesce_writes(),
            self.pipelined_tls,
        );
        runtime.spawn(driver.run(self.web_socket_connector(), url));
        Ok(())
    }

    /// Queue bytes for the server. Returns false once destroyed.
    ///
    /// With coalescing on, writes queued before the driver task next wakes
    /// share a frame. On a current-thread runtime that is every write in one
    /// scheduling turn; on a multi-thread runtime the driver can wake between
    /// writes, so a burst may span several frames.
    /// While TLS is handshaking writes are held, then encrypted and released
    /// once it completes.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.destroyed() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.commands
            .send(Command::Write(Bytes::copy_from_slice(data)))
            .is_ok()
    }

    /// Upgrade to TLS with the default rustls engine.
    pub fn start_tls(&self, host: &str) -> ServerlessResult<()> {
        let engine = RustlsEngine::new(host, &self.root_certs(), self.disable_sni())?;
        self.start_tls_with(Box::new(engine))
    }

    /// Upgrade to TLS with any engine.
    pub fn start_tls_with(&self, engine: Box<dyn TlsEngine>) -> ServerlessResult<()> {
        if self.destroyed() {
            return Err(ServerlessError::Transport("Socket is destroyed".to_string()));
        }
        if self.tls_phase() != TlsPhase::Idle {
            return Err(ServerlessError::Tls("TLS already started".to_string()));
        }
        self.shared.update(|s| s.tls = TlsPhase::Handshaking);
        self.commands
            .send(Command::StartTls(engine))
            .map_err(|_| ServerlessError::Transport("Socket is closed".to_string()))
    }

    /// Flush pending writes, then close.
    pub fn end(&self) {
        if self.destroyed() {
            return;
        }
        if self.queued.is_some() {
            // never connected: nothing to flush
            self.destroy();
            return;
        }
        let _ = self.commands.send(Command::End);
    }

    /// Close immediately. Idempotent; `Close` is emitted once.
    pub fn destroy(&self) {
        if self.destroyed() {
            return;
        }
        self.shared.update(|s| {
            s.state.destroyed = true;
            s.state.writable = false;
        });
        if self.queued.is_some() {
            self.shared.emit(SocketEvent::Close);
        }
    }

    pub fn state(&self) -> TransportState {
        self.shared.status().state
    }

    pub fn tls_phase(&self) -> TlsPhase {
        self.shared.status().tls
    }

    pub fn connecting(&self) -> bool {
        self.state().connecting
    }

    pub fn pending(&self) -> bool {
        self.state().pending
    }

    pub fn writable(&self) -> bool {
        self.state().writable
    }

    pub fn encrypted(&self) -> bool {
        self.state().encrypted
    }

    pub fn authorized(&self) -> bool {
        self.state().authorized
    }

    pub fn destroyed(&self) -> bool {
        self.state().destroyed
    }

    // Stream-socket compatibility; nothing to configure on a WebSocket.

    pub fn set_no_delay(&self, _no_delay: bool) {}

    pub fn set_keep_alive(&self, _enable: bool) {}

    pub fn ref_(&self) {}

    pub fn unref(&self) {}
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        // the driver task notices the closed command channel and shuts down
        if self.queued.is_some() {
            self.destroy();
        }
    }
}
