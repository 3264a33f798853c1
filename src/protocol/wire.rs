//! PostgreSQL Wire Protocol Messages
//!
//! The subset of the Frontend/Backend Protocol the serverless core touches:
//! SSL negotiation, startup, authentication, and the simple query cycle.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DatabaseError, ServerlessError, ServerlessResult};

/// SSLRequest message bytes (request code: 80877103)
pub const SSL_REQUEST: [u8; 8] = [0, 0, 0, 8, 4, 210, 22, 47];

/// Server reply to SSLRequest: willing to upgrade.
pub const SSL_ACCEPTED: u8 = b'S';

/// Server reply to SSLRequest: refuses to upgrade.
pub const SSL_REFUSED: u8 = b'N';

/// Largest backend message accepted; the server never sends more than 1 GiB.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Frontend (client → server) message types
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    SslRequest,
    /// Startup message (sent first, no type byte)
    Startup { user: String, database: String },
    /// Cleartext password response
    PasswordMessage(String),
    Query(String),
    Terminate,
    /// SASL initial response (first message in SCRAM)
    SASLInitialResponse { mechanism: String, data: Vec<u8> },
    /// SASL response (subsequent messages in SCRAM)
    SASLResponse(Vec<u8>),
}

/// Backend (server → client) message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    AuthenticationSASLContinue(Vec<u8>),
    AuthenticationSASLFinal(Vec<u8>),
    /// Parameter status (server config)
    ParameterStatus {
        name: String,
        value: String,
    },
    /// Backend key data (for cancel)
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    /// Notice response (warning/info messages, not errors)
    NoticeResponse(ErrorFields),
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,    // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Error fields from ErrorResponse / NoticeResponse, keyed by field code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub r#where: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl From<ErrorFields> for DatabaseError {
    fn from(f: ErrorFields) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        DatabaseError {
            message: f.message,
            severity: non_empty(f.severity),
            code: non_empty(f.code),
            detail: f.detail,
            hint: f.hint,
            position: f.position,
            internal_position: f.internal_position,
            internal_query: f.internal_query,
            r#where: f.r#where,
            schema: f.schema,
            table: f.table,
            column: f.column,
            data_type: f.data_type,
            constraint: f.constraint,
            file: f.file,
            line: f.line,
            routine: f.routine,
            source_error: None,
        }
    }
}

impl FrontendMessage {
    /// Encode message to bytes for sending over the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            FrontendMessage::SslRequest => {
                buf.extend_from_slice(&SSL_REQUEST);
            }
            FrontendMessage::Startup { user, database } => {
                let mut body = BytesMut::new();
                // Protocol version 3.0
                body.put_i32(196608);
                for (key, value) in [
                    ("user", user.as_str()),
                    ("database", database.as_str()),
                    ("client_encoding", "UTF8"),
                ] {
                    put_cstr(&mut body, key);
                    put_cstr(&mut body, value);
                }
                body.put_u8(0); // Terminator

                // Length includes itself
                buf.put_i32((body.len() + 4) as i32);
                buf.extend_from_slice(&body);
            }
            FrontendMessage::PasswordMessage(password) => {
                buf.put_u8(b'p');
                buf.put_i32((password.len() + 1 + 4) as i32);
                put_cstr(&mut buf, password);
            }
            FrontendMessage::Query(sql) => {
                buf.put_u8(b'Q');
                buf.put_i32((sql.len() + 1 + 4) as i32);
                put_cstr(&mut buf, sql);
            }
            FrontendMessage::Terminate => {
                buf.extend_from_slice(&[b'X', 0, 0, 0, 4]);
            }
            FrontendMessage::SASLInitialResponse { mechanism, data } => {
                buf.put_u8(b'p'); // SASLInitialResponse uses 'p'
                let len = 4 + mechanism.len() + 1 + 4 + data.len();
                buf.put_i32(len as i32);
                put_cstr(&mut buf, mechanism);
                buf.put_i32(data.len() as i32);
                buf.extend_from_slice(data);
            }
            FrontendMessage::SASLResponse(data) => {
                buf.put_u8(b'p'); // SASLResponse also uses 'p'
                buf.put_i32((data.len() + 4) as i32);
                buf.extend_from_slice(data);
            }
        }
        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

fn protocol(message: impl Into<String>) -> ServerlessError {
    ServerlessError::Protocol(message.into())
}

fn be_i32(payload: &[u8], pos: usize) -> ServerlessResult<i32> {
    payload
        .get(pos..pos + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| protocol("Message truncated"))
}

fn be_i16(payload: &[u8], pos: usize) -> ServerlessResult<i16> {
    payload
        .get(pos..pos + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| protocol("Message truncated"))
}

/// Read a null-terminated string starting at `pos`; returns it and the
/// position after the terminator.
fn cstr(payload: &[u8], pos: usize) -> ServerlessResult<(String, usize)> {
    let rest = payload.get(pos..).ok_or_else(|| protocol("Message truncated"))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| protocol("Missing null terminator"))?;
    let s = String::from_utf8_lossy(&rest[..end]).to_string();
    Ok((s, pos + end + 1))
}

impl BackendMessage {
    /// Length of the first complete message in `buf`, if there is one.
    ///
    /// A header whose length is below 4 or above [`MAX_MESSAGE_LEN`] is an
    /// error, so a corrupt stream fails instead of buffering forever.
    pub fn frame_len(buf: &[u8]) -> ServerlessResult<Option<usize>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(protocol(format!("Invalid message length: {}", len)));
        }
        Ok(if buf.len() > len { Some(len + 1) } else { None })
    }

    /// Decode a message from wire bytes.
    /// Returns the message and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> ServerlessResult<(Self, usize)> {
        if buf.len() < 5 {
            return Err(protocol("Buffer too short"));
        }

        let msg_type = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(protocol(format!("Invalid message length: {}", len)));
        }
        let len = len as usize;

        if buf.len() < len + 1 {
            return Err(protocol("Incomplete message"));
        }

        let payload = &buf[5..len + 1];

        let message = match msg_type {
            b'R' => Self::decode_auth(payload)?,
            b'S' => Self::decode_parameter_status(payload)?,
            b'K' => BackendMessage::BackendKeyData {
                process_id: be_i32(payload, 0)?,
                secret_key: be_i32(payload, 4)?,
            },
            b'Z' => Self::decode_ready_for_query(payload)?,
            b'T' => Self::decode_row_description(payload)?,
            b'D' => Self::decode_data_row(payload)?,
            b'C' => BackendMessage::CommandComplete(
                String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(Self::parse_error_fields(payload)),
            b'N' => BackendMessage::NoticeResponse(Self::parse_error_fields(payload)),
            _ => {
                return Err(protocol(format!(
                    "Unknown message type: {}",
                    msg_type as char
                )));
            }
        };

        Ok((message, len + 1))
    }

    fn decode_auth(payload: &[u8]) -> ServerlessResult<Self> {
        let auth_type = be_i32(payload, 0)?;
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let salt: [u8; 4] = payload
                    .get(4..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| protocol("MD5 salt truncated"))?;
                Ok(BackendMessage::AuthenticationMD5Password(salt))
            }
            10 => {
                // SASL - parse mechanism list
                let mut mechanisms = Vec::new();
                let mut pos = 4;
                while pos < payload.len() && payload[pos] != 0 {
                    let (mechanism, next) = cstr(payload, pos)?;
                    mechanisms.push(mechanism);
                    pos = next;
                }
                Ok(BackendMessage::AuthenticationSASL(mechanisms))
            }
            // SASL Continue - server challenge
            11 => Ok(BackendMessage::AuthenticationSASLContinue(payload[4..].to_vec())),
            // SASL Final - server signature
            12 => Ok(BackendMessage::AuthenticationSASLFinal(payload[4..].to_vec())),
            _ => Err(protocol(format!("Unknown auth type: {}", auth_type))),
        }
    }

    fn decode_parameter_status(payload: &[u8]) -> ServerlessResult<Self> {
        let (name, pos) = cstr(payload, 0)?;
        let (value, _) = cstr(payload, pos)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_ready_for_query(payload: &[u8]) -> ServerlessResult<Self> {
        let status = match payload.first() {
            Some(b'I') => TransactionStatus::Idle,
            Some(b'T') => TransactionStatus::InBlock,
            Some(b'E') => TransactionStatus::Failed,
            _ => return Err(protocol("Unknown transaction status")),
        };
        Ok(BackendMessage::ReadyForQuery(status))
    }

    fn decode_row_description(payload: &[u8]) -> ServerlessResult<Self> {
        let field_count = be_i16(payload, 0)?.max(0) as usize;
        let mut fields = Vec::with_capacity(field_count);
        let mut pos = 2;

        for _ in 0..field_count {
            let (name, next) = cstr(payload, pos)?;
            pos = next;

            // Ensure we have enough bytes for the fixed fields
            if pos + 18 > payload.len() {
                return Err(protocol("RowDescription field truncated"));
            }

            fields.push(FieldDescription {
                name,
                table_oid: be_i32(payload, pos)? as u32,
                column_attr: be_i16(payload, pos + 4)?,
                type_oid: be_i32(payload, pos + 6)? as u32,
                type_size: be_i16(payload, pos + 10)?,
                type_modifier: be_i32(payload, pos + 12)?,
                format: be_i16(payload, pos + 16)?,
            });
            pos += 18;
        }

        Ok(BackendMessage::RowDescription(fields))
    }

    fn decode_data_row(payload: &[u8]) -> ServerlessResult<Self> {
        let column_count = be_i16(payload, 0)?.max(0) as usize;
        let mut columns = Vec::with_capacity(column_count);
        let mut pos = 2;

        for _ in 0..column_count {
            let len = be_i32(payload, pos)?;
            pos += 4;

            if len == -1 {
                // NULL value
                columns.push(None);
                continue;
            }
            if len < -1 {
                return Err(protocol(format!("Invalid DataRow column length: {}", len)));
            }
            let end = pos
                .checked_add(len as usize)
                .ok_or_else(|| protocol("DataRow column data truncated"))?;
            let data = payload
                .get(pos..end)
                .ok_or_else(|| protocol("DataRow column data truncated"))?;
            columns.push(Some(data.to_vec()));
            pos = end;
        }

        Ok(BackendMessage::DataRow(columns))
    }

    fn parse_error_fields(payload: &[u8]) -> ErrorFields {
        let mut fields = ErrorFields::default();
        let mut i = 0;
        while i < payload.len() && payload[i] != 0 {
            let field_type = payload[i];
            i += 1;
            let end = payload[i..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| p + i)
                .unwrap_or(payload.len());
            let value = String::from_utf8_lossy(&payload[i..end]).to_string();
            i = end + 1;

            match field_type {
                b'S' => fields.severity = value,
                b'V' => {} // non-localized severity
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = Some(value),
                b'p' => fields.internal_position = Some(value),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.r#where = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = Some(value),
                b'R' => fields.routine = Some(value),
                _ => {}
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![msg_type];
        buf.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_password_message() {
        let bytes = FrontendMessage::PasswordMessage("secret".to_string()).encode();
        assert_eq!(&bytes[..], b"p\0\0\0\x0bsecret\0");
    }

    #[test]
    fn test_startup_length_prefix() {
        let bytes = FrontendMessage::Startup {
            user: "alice".to_string(),
            database: "main".to_string(),
        }
        .encode();
        let len = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len());
        assert_eq!(&bytes[4..8], &196608i32.to_be_bytes());
        assert!(bytes.ends_with(b"UTF8\0\0"));
    }

    #[test]
    fn test_sasl_initial_response() {
        let bytes = FrontendMessage::SASLInitialResponse {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: b"n,,n=*,r=abc".to_vec(),
        }
        .encode();
        assert_eq!(bytes[0], b'p');
        let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(len + 1, bytes.len());
        assert!(bytes.ends_with(b"\0\0\0\0\x0cn,,n=*,r=abc"));
    }

    #[test]
    fn test_decode_auth_requests() {
        let (msg, used) = BackendMessage::decode(&backend(b'R', &3i32.to_be_bytes())).unwrap();
        assert_eq!(msg, BackendMessage::AuthenticationCleartextPassword);
        assert_eq!(used, 9);

        let mut sasl = 10i32.to_be_bytes().to_vec();
        sasl.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let (msg, _) = BackendMessage::decode(&backend(b'R', &sasl)).unwrap();
        assert_eq!(
            msg,
            BackendMessage::AuthenticationSASL(vec![
                "SCRAM-SHA-256-PLUS".to_string(),
                "SCRAM-SHA-256".to_string()
            ])
        );
    }

    #[test]
    fn test_decode_truncated_auth_is_error() {
        assert!(BackendMessage::decode(&backend(b'R', &[0, 0])).is_err());
    }

    #[test]
    fn test_decode_error_response_fields() {
        let payload = b"SERROR\0VERROR\0C42P01\0Mrelation \"nope\" does not exist\0P15\0Fparse_relation.c\0L1392\0RparserOpenTable\0\0";
        let (msg, _) = BackendMessage::decode(&backend(b'E', payload)).unwrap();
        let BackendMessage::ErrorResponse(fields) = msg else {
            panic!("expected ErrorResponse");
        };
        let err = DatabaseError::from(fields);
        assert_eq!(err.code.as_deref(), Some("42P01"));
        assert_eq!(err.position.as_deref(), Some("15"));
        assert_eq!(err.routine.as_deref(), Some("parserOpenTable"));
        assert_eq!(err.message, "relation \"nope\" does not exist");
    }

    #[test]
    fn test_frame_len() {
        let buf = backend(b'Z', b"I");
        assert_eq!(BackendMessage::frame_len(&buf).unwrap(), Some(6));
        assert_eq!(BackendMessage::frame_len(&buf[..5]).unwrap(), None);
    }

    #[test]
    fn test_frame_len_rejects_corrupt_header() {
        let huge = [b'D', 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            BackendMessage::frame_len(&huge),
            Err(ServerlessError::Protocol(_))
        ));

        let short = [b'Z', 0, 0, 0, 3, b'I'];
        assert!(matches!(
            BackendMessage::frame_len(&short),
            Err(ServerlessError::Protocol(_))
        ));
    }

    #[test]
    fn test_data_row_negative_length_is_error() {
        let mut payload = 1i16.to_be_bytes().to_vec();
        payload.extend_from_slice(&(-2i32).to_be_bytes());
        let err = BackendMessage::decode(&backend(b'D', &payload)).unwrap_err();
        assert!(matches!(err, ServerlessError::Protocol(ref m) if m.contains("column length")));
    }

    #[test]
    fn test_data_row_overlong_column_is_error() {
        let mut payload = 1i16.to_be_bytes().to_vec();
        payload.extend_from_slice(&i32::MAX.to_be_bytes());
        payload.extend_from_slice(b"abc");
        assert!(matches!(
            BackendMessage::decode(&backend(b'D', &payload)),
            Err(ServerlessError::Protocol(_))
        ));
    }

    #[test]
    fn test_data_row_with_null() {
        let mut payload = 2i16.to_be_bytes().to_vec();
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"42");
        let (msg, _) = BackendMessage::decode(&backend(b'D', &payload)).unwrap();
        assert_eq!(msg, BackendMessage::DataRow(vec![None, Some(b"42".to_vec())]));
    }
}
