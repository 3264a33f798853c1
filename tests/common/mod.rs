//! Shared test fixtures: an in-memory WebSocket, a toy TLS engine, and
//! backend message builders for scripting a fake server.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qail_serverless::error::{ServerlessError, ServerlessResult};
use qail_serverless::socket::{TlsEngine, TlsOutput, WebSocketConnector, WsChannel, WsFrame};

/// Hands out one prepared in-memory channel.
pub struct MemoryConnector {
    channel: Mutex<Option<WsChannel>>,
    pub url: Mutex<Option<String>>,
}

#[async_trait]
impl WebSocketConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> ServerlessResult<WsChannel> {
        *self.url.lock().unwrap() = Some(url.to_string());
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ServerlessError::WebSocket("memory socket already used".to_string()))
    }
}

/// Server end of an in-memory WebSocket.
pub struct MemoryServer {
    frames: mpsc::UnboundedReceiver<Bytes>,
    to_client: mpsc::UnboundedSender<ServerlessResult<WsFrame>>,
    /// Bytes received but not yet consumed by `read_message`.
    pending: BytesMut,
}

impl MemoryServer {
    /// Next frame from the client, or `None` once it has closed.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// No frame arrives within a short grace period.
    pub async fn assert_quiet(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(50), self.frames.next()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    pub fn send(&self, bytes: impl Into<Bytes>) {
        self.to_client
            .unbounded_send(Ok(WsFrame::Binary(bytes.into())))
            .unwrap();
    }

    pub fn close(&self) {
        let _ = self.to_client.unbounded_send(Ok(WsFrame::Close));
    }

    /// Next frontend message, reassembled across frames. `startup` reads an
    /// untagged message.
    pub async fn read_message(&mut self, startup: bool) -> (u8, Bytes) {
        let header = if startup { 4 } else { 5 };
        loop {
            if self.pending.len() >= header {
                let at = header - 4;
                let len = u32::from_be_bytes(self.pending[at..at + 4].try_into().unwrap()) as usize;
                if self.pending.len() >= at + len {
                    let frame = self.pending.split_to(at + len);
                    let tag = if startup { 0 } else { frame[0] };
                    return (tag, frame.freeze().slice(header..));
                }
            }
            let frame = self.next_frame().await.expect("client closed");
            self.pending.extend_from_slice(&frame);
        }
    }
}

pub fn memory_socket() -> (Arc<MemoryConnector>, MemoryServer) {
    let (client_tx, frames) = mpsc::unbounded::<Bytes>();
    let (to_client, client_rx) = mpsc::unbounded::<ServerlessResult<WsFrame>>();

    let sink = client_tx.sink_map_err(|e| ServerlessError::WebSocket(e.to_string()));
    let channel = WsChannel::new(sink, client_rx);

    let connector = Arc::new(MemoryConnector {
        channel: Mutex::new(Some(channel)),
        url: Mutex::new(None),
    });
    let server = MemoryServer {
        frames,
        to_client,
        pending: BytesMut::new(),
    };
    (connector, server)
}

pub const XOR_KEY: u8 = 0x5a;
pub const CLIENT_HELLO: &[u8] = b"HELLO";
pub const SERVER_HELLO: &[u8] = b"SERVER-HELLO";
pub const FINISHED: &[u8] = b"FINISHED";

pub fn xor(data: &[u8]) -> Bytes {
    data.iter().map(|b| b ^ XOR_KEY).collect::<Vec<_>>().into()
}

/// Toy record layer: `HELLO` out, `SERVER-HELLO` in, `FINISHED` out, then
/// every byte XORed with a fixed key.
#[derive(Debug, Default)]
pub struct XorTls {
    handshaking: bool,
    unverified: bool,
}

impl XorTls {
    /// Finishes the handshake but reports the peer as unverified.
    pub fn unverified() -> Self {
        Self {
            unverified: true,
            ..Self::default()
        }
    }
}

impl TlsEngine for XorTls {
    fn start(&mut self) -> ServerlessResult<Bytes> {
        self.handshaking = true;
        Ok(Bytes::from_static(CLIENT_HELLO))
    }

    fn read_tls(&mut self, data: &[u8]) -> ServerlessResult<TlsOutput> {
        if self.handshaking {
            let rest = data
                .strip_prefix(SERVER_HELLO)
                .ok_or_else(|| ServerlessError::Tls("bad server hello".to_string()))?;
            self.handshaking = false;
            return Ok(TlsOutput {
                plaintext: xor(rest),
                to_send: Bytes::from_static(FINISHED),
            });
        }
        Ok(TlsOutput {
            plaintext: xor(data),
            to_send: Bytes::new(),
        })
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> ServerlessResult<Bytes> {
        Ok(xor(plaintext))
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn authorized(&self) -> bool {
        !self.handshaking && !self.unverified
    }
}

/// Backend message builders.
pub mod backend {
    use super::*;

    fn message(tag: u8, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(body.len() + 5);
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.extend_from_slice(body);
        buf.freeze()
    }

    fn auth(code: i32, extra: &[u8]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i32(code);
        body.extend_from_slice(extra);
        message(b'R', &body)
    }

    fn cstr(buf: &mut BytesMut, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.put_u8(0);
    }

    pub fn auth_ok() -> Bytes {
        auth(0, &[])
    }

    pub fn auth_cleartext() -> Bytes {
        auth(3, &[])
    }

    pub fn auth_sasl(mechanisms: &[&str]) -> Bytes {
        let mut extra = BytesMut::new();
        for mechanism in mechanisms {
            cstr(&mut extra, mechanism);
        }
        extra.put_u8(0);
        auth(10, &extra)
    }

    pub fn auth_sasl_continue(data: &str) -> Bytes {
        auth(11, data.as_bytes())
    }

    pub fn auth_sasl_final(data: &str) -> Bytes {
        auth(12, data.as_bytes())
    }

    pub fn parameter_status(name: &str, value: &str) -> Bytes {
        let mut body = BytesMut::new();
        cstr(&mut body, name);
        cstr(&mut body, value);
        message(b'S', &body)
    }

    pub fn backend_key(process_id: i32, secret_key: i32) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i32(process_id);
        body.put_i32(secret_key);
        message(b'K', &body)
    }

    pub fn ready(status: u8) -> Bytes {
        message(b'Z', &[status])
    }

    /// Text-format columns of the given type OIDs.
    pub fn row_description(columns: &[(&str, u32)]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for (name, oid) in columns {
            cstr(&mut body, name);
            body.put_u32(0);
            body.put_i16(0);
            body.put_u32(*oid);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(0);
        }
        message(b'T', &body)
    }

    pub fn data_row(values: &[Option<&str>]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    body.put_i32(v.len() as i32);
                    body.extend_from_slice(v.as_bytes());
                }
                None => body.put_i32(-1),
            }
        }
        message(b'D', &body)
    }

    pub fn command_complete(tag: &str) -> Bytes {
        let mut body = BytesMut::new();
        cstr(&mut body, tag);
        message(b'C', &body)
    }

    pub fn error(severity: &str, code: &str, text: &str) -> Bytes {
        let mut body = BytesMut::new();
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', text)] {
            body.put_u8(field);
            cstr(&mut body, value);
        }
        body.put_u8(0);
        message(b'E', &body)
    }

    pub fn concat(parts: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::new();
        for part in parts {
            buf.extend_from_slice(part);
        }
        buf.freeze()
    }
}
