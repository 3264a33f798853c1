//! Connection pipelining.
//!
//! Two round trips can be skipped when the other end is known:
//!
//! - **TLS**: a proxy that always accepts the SSL upgrade does not need to
//!   be asked. The socket reports the `S` reply itself and the handshake
//!   starts at once ([`engage_tls_pipelining`]).
//! - **Startup**: with cleartext password auth, the password can follow the
//!   startup message immediately and the connection can be treated as ready
//!   before the server says so ([`StartupPipeline`]).

use bytes::{Bytes, BytesMut};

use crate::config::PipelineConnect;
use crate::error::{ServerlessError, ServerlessResult};
use crate::protocol::{BackendMessage, FrontendMessage};
use crate::socket::{TransportConfig, WsSocket};

/// Arm pipelined TLS on `socket` if it is configured and an SSL upgrade will
/// be requested. Must be called before `connect`. Returns whether it was
/// armed.
pub fn engage_tls_pipelining(socket: &mut WsSocket, ssl_requested: bool) -> bool {
    let engaged = ssl_requested && socket.pipeline_tls();
    if engaged {
        socket.pipeline_tls_on_connect();
    }
    engaged
}

/// What to do with an authentication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Already answered by the pipelined password.
    Ignore,
    /// Handle normally.
    Proceed,
}

/// What to do with a `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyAction {
    /// The startup one, already assumed.
    Absorb,
    Handle,
}

/// Startup pipelining state for one connection.
///
/// Engaged only in [`PipelineConnect::Password`] mode with a password
/// configured. One handler consults it for every auth request and every
/// `ReadyForQuery`, so nothing is swapped in or out at runtime.
///
/// Known limitation: the connection reports ready before the server has
/// accepted the password. A wrong password is not seen at connect time; it
/// surfaces as the first query failing with the server's authentication
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPipeline {
    engaged: bool,
    awaiting_first_ready: bool,
}

impl StartupPipeline {
    pub fn new(mode: PipelineConnect, password: Option<&str>) -> Self {
        let engaged = mode == PipelineConnect::Password && password.is_some();
        Self {
            engaged,
            awaiting_first_ready: engaged,
        }
    }

    pub fn engaged(&self) -> bool {
        self.engaged
    }

    /// Ready-for-query is assumed true from the start.
    pub fn ready_assumed(&self) -> bool {
        self.engaged
    }

    /// Bytes to send once the connection is up (after `SecureConnect` when
    /// TLS is in use): the startup message, followed by the password when
    /// engaged.
    pub fn startup_messages(&self, user: &str, database: &str, password: Option<&str>) -> Bytes {
        let mut out = BytesMut::new();
        out.extend_from_slice(
            &FrontendMessage::Startup {
                user: user.to_string(),
                database: database.to_string(),
            }
            .encode(),
        );
        if let (true, Some(password)) = (self.engaged, password) {
            out.extend_from_slice(&FrontendMessage::PasswordMessage(password.to_string()).encode());
        }
        out.freeze()
    }

    /// Route an authentication request.
    ///
    /// While engaged, a cleartext request is already answered. A SASL or MD5
    /// request means the server got a password message it was not expecting;
    /// the streams no longer line up.
    pub fn on_auth_request(&self, request: &BackendMessage) -> ServerlessResult<AuthAction> {
        if !self.engaged {
            return Ok(AuthAction::Proceed);
        }
        match request {
            BackendMessage::AuthenticationCleartextPassword => Ok(AuthAction::Ignore),
            BackendMessage::AuthenticationSASL(_) => Err(ServerlessError::desync(
                "password was pipelined but the server requested SASL authentication; \
                 disable pipeline_connect for this server",
            )),
            BackendMessage::AuthenticationMD5Password(_) => Err(ServerlessError::desync(
                "password was pipelined but the server requested MD5 authentication; \
                 disable pipeline_connect for this server",
            )),
            _ => Ok(AuthAction::Proceed),
        }
    }

    /// Route a `ReadyForQuery`: the first one while engaged is absorbed.
    pub fn on_ready_for_query(&mut self) -> ReadyAction {
        if self.awaiting_first_ready {
            self.awaiting_first_ready = false;
            ReadyAction::Absorb
        } else {
            ReadyAction::Handle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerlessConfig;

    #[test]
    fn test_engages_only_for_password_mode_with_password() {
        assert!(StartupPipeline::new(PipelineConnect::Password, Some("pw")).engaged());
        assert!(!StartupPipeline::new(PipelineConnect::Password, None).engaged());
        assert!(!StartupPipeline::new(PipelineConnect::Disabled, Some("pw")).engaged());
    }

    #[test]
    fn test_startup_messages_carry_password_when_engaged() {
        let engaged = StartupPipeline::new(PipelineConnect::Password, Some("pw"));
        let bytes = engaged.startup_messages("alice", "main", Some("pw"));
        assert!(bytes.ends_with(b"p\0\0\0\x07pw\0"));

        let inert = StartupPipeline::new(PipelineConnect::Disabled, Some("pw"));
        let bytes = inert.startup_messages("alice", "main", Some("pw"));
        assert!(bytes.ends_with(b"UTF8\0\0"));
    }

    #[test]
    fn test_first_ready_absorbed_once() {
        let mut pipeline = StartupPipeline::new(PipelineConnect::Password, Some("pw"));
        assert_eq!(pipeline.on_ready_for_query(), ReadyAction::Absorb);
        assert_eq!(pipeline.on_ready_for_query(), ReadyAction::Handle);
        assert_eq!(pipeline.on_ready_for_query(), ReadyAction::Handle);

        let mut inert = StartupPipeline::new(PipelineConnect::Disabled, None);
        assert_eq!(inert.on_ready_for_query(), ReadyAction::Handle);
    }

    #[test]
    fn test_auth_routing() {
        let pipeline = StartupPipeline::new(PipelineConnect::Password, Some("pw"));
        assert_eq!(
            pipeline
                .on_auth_request(&BackendMessage::AuthenticationCleartextPassword)
                .unwrap(),
            AuthAction::Ignore
        );
        assert_eq!(
            pipeline.on_auth_request(&BackendMessage::AuthenticationOk).unwrap(),
            AuthAction::Proceed
        );
        let err = pipeline
            .on_auth_request(&BackendMessage::AuthenticationSASL(vec!["SCRAM-SHA-256".into()]))
            .unwrap_err();
        assert!(matches!(err, ServerlessError::ProtocolDesync(_)));

        let inert = StartupPipeline::new(PipelineConnect::Disabled, Some("pw"));
        assert_eq!(
            inert
                .on_auth_request(&BackendMessage::AuthenticationSASL(vec![]))
                .unwrap(),
            AuthAction::Proceed
        );
    }

    #[tokio::test]
    async fn test_tls_pipelining_requires_config_and_ssl() {
        let (mut socket, _events) =
            WsSocket::new(ServerlessConfig::builder().pipeline_tls(true).build());
        assert!(!engage_tls_pipelining(&mut socket, false));
        assert!(engage_tls_pipelining(&mut socket, true));

        let (mut socket, _events) =
            WsSocket::new(ServerlessConfig::builder().pipeline_tls(false).build());
        assert!(!engage_tls_pipelining(&mut socket, true));
    }
}
