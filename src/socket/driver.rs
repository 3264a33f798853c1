//! The task behind a [`WsSocket`](super::WsSocket).
//!
//! Owns the WebSocket and the TLS engine. Commands from the handle are
//! drained in batches: every command queued since the task last ran is
//! applied, and with coalescing on their output leaves as one frame.

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::tls::{TlsEngine, TlsPhase};
use super::websocket::{WebSocketConnector, WsChannel, WsFrame};
use super::{Shared, SocketEvent, Status};
use crate::error::{ServerlessError, ServerlessResult};
use crate::protocol::SSL_ACCEPTED;

pub(crate) enum Command {
    Write(Bytes),
    StartTls(Box<dyn TlsEngine>),
    End,
}

enum Step {
    Destroyed,
    Commands(Option<Command>),
    Frame(Option<ServerlessResult<WsFrame>>),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Default)]
struct TlsSession {
    phase: TlsPhase,
    engine: Option<Box<dyn TlsEngine>>,
    /// Application writes issued during the handshake.
    held: Vec<Bytes>,
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    status: watch::Receiver<Status>,
    commands: mpsc::UnboundedReceiver<Command>,
    coalesce: bool,
    pipelined_tls: bool,
    /// Pipelined TLS: the real SSL-acceptance byte is still to come.
    expect_preamble: bool,
    tls: TlsSession,
}

async fn destroyed(status: &mut watch::Receiver<Status>) {
    let _ = status.wait_for(|s| s.state.destroyed).await;
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        coalesce: bool,
        pipelined_tls: bool,
    ) -> Self {
        Self {
            status: shared.subscribe(),
            shared,
            commands,
            coalesce,
            pipelined_tls,
            expect_preamble: false,
            tls: TlsSession::default(),
        }
    }

    pub(crate) async fn run(mut self, connector: Arc<dyn WebSocketConnector>, url: String) {
        let opened = tokio::select! {
            biased;
            _ = destroyed(&mut self.status) => None,
            result = connector.connect(&url) => Some(result),
        };

        match opened {
            None => {}
            Some(Err(e)) => {
                tracing::warn!(%url, error = %e, "websocket failed to open");
                self.shared.emit(SocketEvent::Error(e));
            }
            Some(Ok(mut channel)) => {
                if let Err(e) = self.serve(&mut channel).await {
                    tracing::debug!(error = %e, "socket failed");
                    self.shared.emit(SocketEvent::Error(e));
                }
                let _ = channel.sink.close().await;
            }
        }

        self.shared.update(|s| {
            s.state.writable = false;
            s.state.connecting = false;
            s.state.pending = false;
        });
        self.shared.emit(SocketEvent::Close);
    }

    async fn serve(&mut self, channel: &mut WsChannel) -> ServerlessResult<()> {
        // Everything written before the socket opened, in order.
        let mut queued = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            queued.push(command);
        }
        if self.apply(channel, queued).await? == Flow::Stop {
            return Ok(());
        }

        self.shared.update(|s| {
            s.state.connecting = false;
            s.state.pending = false;
            s.state.writable = true;
        });
        self.shared.emit(SocketEvent::Connect);

        if self.pipelined_tls {
            self.expect_preamble = true;
            self.shared
                .emit(SocketEvent::Data(Bytes::from_static(&[SSL_ACCEPTED])));
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = destroyed(&mut self.status) => Step::Destroyed,
                command = self.commands.recv() => Step::Commands(command),
                frame = channel.stream.next() => Step::Frame(frame),
            };

            match step {
                Step::Destroyed => return Ok(()),
                // handle dropped
                Step::Commands(None) => return Ok(()),
                Step::Commands(Some(first)) => {
                    let mut batch = vec![first];
                    if self.coalesce {
                        while let Ok(command) = self.commands.try_recv() {
                            batch.push(command);
                        }
                    }
                    if self.apply(channel, batch).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                Step::Frame(Some(Ok(WsFrame::Binary(chunk)))) => {
                    self.inbound(channel, chunk).await?;
                }
                Step::Frame(Some(Ok(WsFrame::Close))) | Step::Frame(None) => {
                    tracing::debug!("websocket closed by peer");
                    return Ok(());
                }
                Step::Frame(Some(Err(e))) => return Err(e),
            }
        }
    }

    /// Apply commands in order. With coalescing, everything they produce
    /// goes out as one frame; without, one frame per command.
    async fn apply(&mut self, channel: &mut WsChannel, batch: Vec<Command>) -> ServerlessResult<Flow> {
        let mut out = BytesMut::new();

        for command in batch {
            match command {
                Command::Write(bytes) => match self.tls.phase {
                    TlsPhase::Idle => out.extend_from_slice(&bytes),
                    TlsPhase::Handshaking => self.tls.held.push(bytes),
                    TlsPhase::Established => {
                        let record = self.engine()?.encrypt(&bytes)?;
                        out.extend_from_slice(&record);
                    }
                },
                Command::StartTls(mut engine) => {
                    if self.tls.engine.is_some() {
                        return Err(ServerlessError::Tls("TLS already started".to_string()));
                    }
                    let hello = engine.start()?;
                    out.extend_from_slice(&hello);
                    self.tls.engine = Some(engine);
                    self.tls.phase = TlsPhase::Handshaking;
                    tracing::debug!(bytes = hello.len(), "tls handshake started");
                }
                Command::End => {
                    send(channel, &mut out).await?;
                    return Ok(Flow::Stop);
                }
            }
            if !self.coalesce {
                send(channel, &mut out).await?;
            }
        }

        send(channel, &mut out).await?;
        Ok(Flow::Continue)
    }

    async fn inbound(&mut self, channel: &mut WsChannel, mut chunk: Bytes) -> ServerlessResult<()> {
        if self.expect_preamble && !chunk.is_empty() {
            if chunk[0] != SSL_ACCEPTED {
                return Err(ServerlessError::desync(format!(
                    "expected SSL acceptance byte 'S' from pipelined TLS upgrade, got {:?}",
                    chunk[0] as char
                )));
            }
            chunk.advance(1);
            self.expect_preamble = false;
            if chunk.is_empty() {
                return Ok(());
            }
        }

        match self.tls.phase {
            TlsPhase::Idle => {
                self.shared.emit(SocketEvent::Data(chunk));
            }
            TlsPhase::Handshaking => {
                let output = self.engine()?.read_tls(&chunk)?;
                let mut out = BytesMut::from(&output.to_send[..]);

                if !self.engine()?.is_handshaking() {
                    let authorized = self.engine()?.authorized();
                    self.tls.phase = TlsPhase::Established;
                    self.shared.update(|s| {
                        s.tls = TlsPhase::Established;
                        s.state.encrypted = true;
                        s.state.authorized = authorized;
                    });
                    tracing::debug!(authorized, "tls established");
                    self.shared.emit(SocketEvent::SecureConnect);

                    for bytes in std::mem::take(&mut self.tls.held) {
                        let record = self.engine()?.encrypt(&bytes)?;
                        out.extend_from_slice(&record);
                    }
                }
                send(channel, &mut out).await?;

                if !output.plaintext.is_empty() {
                    self.shared.emit(SocketEvent::Data(output.plaintext));
                }
            }
            TlsPhase::Established => {
                let output = self.engine()?.read_tls(&chunk)?;
                let mut out = BytesMut::from(&output.to_send[..]);
                send(channel, &mut out).await?;
                if !output.plaintext.is_empty() {
                    self.shared.emit(SocketEvent::Data(output.plaintext));
                }
            }
        }
        Ok(())
    }

    fn engine(&mut self) -> ServerlessResult<&mut Box<dyn TlsEngine>> {
        self.tls
            .engine
            .as_mut()
            .ok_or_else(|| ServerlessError::Tls("TLS engine missing".to_string()))
    }
}

/// Send `out` as one frame if non-empty, leaving it empty.
async fn send(channel: &mut WsChannel, out: &mut BytesMut) -> ServerlessResult<()> {
    if out.is_empty() {
        return Ok(());
    }
    let frame = out.split().freeze();
    tracing::trace!(bytes = frame.len(), "frame out");
    channel.sink.send(frame).await
}
