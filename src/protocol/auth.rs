//! SCRAM-SHA-256 Authentication
//!
//! Client side of the SASL SCRAM-SHA-256 exchange, driven through an async
//! [`CryptoProvider`].
//! Reference: RFC 5802, RFC 7677, PostgreSQL SASL documentation.
//!
//! ```text
//! AwaitingServerFirst → BuildingProof → AwaitingServerFinal → Done
//!          └──────────────────┴──────────────────┴──────────→ Aborted
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use std::fmt;
use std::sync::Arc;

use super::crypto::{BlockingPoolCrypto, CryptoProvider};
use crate::error::{ServerlessError, ServerlessResult};

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Where a session is in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramState {
    /// Client-first sent (`SASLInitialResponse`).
    AwaitingServerFirst,
    /// Deriving keys; only observable if the caller's future is dropped mid-way.
    BuildingProof,
    /// Client-final sent (`SASLResponse`).
    AwaitingServerFinal,
    Done,
    Aborted,
}

/// One SCRAM-SHA-256 exchange. Never reused across connections.
pub struct ScramSession {
    username: String,
    client_nonce: String,
    server_nonce: Option<String>,
    salt: Option<Vec<u8>>,
    iteration_count: Option<u32>,
    salted_password: Option<[u8; 32]>,
    client_key: Option<[u8; 32]>,
    stored_key: Option<[u8; 32]>,
    /// Expected server signature, base64.
    server_signature: Option<String>,
    state: ScramState,
    crypto: Arc<dyn CryptoProvider>,
}

impl fmt::Debug for ScramSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramSession")
            .field("client_nonce", &self.client_nonce)
            .field("server_nonce", &self.server_nonce)
            .field("iteration_count", &self.iteration_count)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Parsed server-first-message.
struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iteration_count: u32,
}

impl ScramSession {
    /// Start an exchange if the server offers SCRAM-SHA-256.
    pub fn start(mechanisms: &[String]) -> ServerlessResult<Self> {
        if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(ServerlessError::scram(format!(
                "Only mechanism SCRAM-SHA-256 is currently supported (server offered {:?})",
                mechanisms
            )));
        }

        let mut nonce = [0u8; 18];
        rand::rng().fill(&mut nonce);

        // Postgres ignores the SCRAM username in favour of the startup user.
        Ok(Self::with_nonce("*", BASE64.encode(nonce)))
    }

    /// Session with a fixed username and nonce.
    pub fn with_nonce(username: impl Into<String>, client_nonce: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            client_nonce: client_nonce.into(),
            server_nonce: None,
            salt: None,
            iteration_count: None,
            salted_password: None,
            client_key: None,
            stored_key: None,
            server_signature: None,
            state: ScramState::AwaitingServerFirst,
            crypto: Arc::new(BlockingPoolCrypto),
        }
    }

    /// Use a different crypto provider.
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn mechanism(&self) -> &'static str {
        SCRAM_SHA_256
    }

    pub fn state(&self) -> ScramState {
        self.state
    }

    pub fn client_nonce(&self) -> &str {
        &self.client_nonce
    }

    /// Format: `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Process the server-first-message and produce the client-final-message.
    ///
    /// Any validation failure aborts the session.
    pub async fn continue_with_server_first(
        &mut self,
        server_data: &[u8],
        password: &str,
    ) -> ServerlessResult<String> {
        let result = self.continue_inner(server_data, password).await;
        self.state = match result {
            Ok(_) => ScramState::AwaitingServerFinal,
            Err(_) => ScramState::Aborted,
        };
        result
    }

    async fn continue_inner(
        &mut self,
        server_data: &[u8],
        password: &str,
    ) -> ServerlessResult<String> {
        if self.state != ScramState::AwaitingServerFirst {
            return Err(ServerlessError::scram("Last message was not SASLInitialResponse"));
        }
        if password.is_empty() {
            return Err(ServerlessError::scram(
                "SCRAM-SERVER-FIRST-MESSAGE: client password must be a non-empty string",
            ));
        }
        let server_first = std::str::from_utf8(server_data).map_err(|_| {
            ServerlessError::scram("SCRAM-SERVER-FIRST-MESSAGE: serverData must be valid UTF-8")
        })?;

        let parsed = parse_server_first(server_first)?;

        if !parsed.nonce.starts_with(&self.client_nonce) {
            return Err(ServerlessError::scram(
                "SCRAM-SERVER-FIRST-MESSAGE: server nonce does not start with client nonce",
            ));
        }
        if parsed.nonce.len() == self.client_nonce.len() {
            return Err(ServerlessError::scram(
                "SCRAM-SERVER-FIRST-MESSAGE: server nonce is too short",
            ));
        }

        self.state = ScramState::BuildingProof;
        let crypto = Arc::clone(&self.crypto);

        let salted_password = crypto
            .pbkdf2_sha256(password.as_bytes(), &parsed.salt, parsed.iteration_count)
            .await?;
        let client_key = crypto.hmac_sha256(&salted_password, b"Client Key").await?;
        let stored_key = crypto.sha256(&client_key).await?;

        let client_final_without_proof = format!("c=biws,r={}", parsed.nonce); // biws = base64("n,,")
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = crypto
            .hmac_sha256(&stored_key, auth_message.as_bytes())
            .await?;
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = crypto.hmac_sha256(&salted_password, b"Server Key").await?;
        let server_signature = crypto
            .hmac_sha256(&server_key, auth_message.as_bytes())
            .await?;

        self.server_nonce = Some(parsed.nonce.to_string());
        self.salt = Some(parsed.salt);
        self.iteration_count = Some(parsed.iteration_count);
        self.salted_password = Some(salted_password);
        self.client_key = Some(client_key);
        self.stored_key = Some(stored_key);
        self.server_signature = Some(BASE64.encode(server_signature));

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        ))
    }

    /// Verify the server-final-message. A signature mismatch is fatal.
    pub fn finalize(&mut self, server_data: &[u8]) -> ServerlessResult<()> {
        let result = self.finalize_inner(server_data);
        self.state = match result {
            Ok(()) => ScramState::Done,
            Err(_) => ScramState::Aborted,
        };
        result
    }

    fn finalize_inner(&self, server_data: &[u8]) -> ServerlessResult<()> {
        if self.state != ScramState::AwaitingServerFinal {
            return Err(ServerlessError::scram("Last message was not SASLResponse"));
        }
        let server_final = std::str::from_utf8(server_data).map_err(|_| {
            ServerlessError::scram("SCRAM-SERVER-FINAL-MESSAGE: serverData must be valid UTF-8")
        })?;

        let attrs = parse_attribute_pairs(server_final)?;
        if let Some(reason) = attr(&attrs, 'e') {
            return Err(ServerlessError::scram(format!(
                "SCRAM-SERVER-FINAL-MESSAGE: server reported error: {}",
                reason
            )));
        }
        let signature = attr(&attrs, 'v').ok_or_else(|| {
            ServerlessError::scram("SCRAM-SERVER-FINAL-MESSAGE: server signature is missing")
        })?;
        if !is_base64(signature) {
            return Err(ServerlessError::scram(
                "SCRAM-SERVER-FINAL-MESSAGE: server signature must be base64",
            ));
        }

        if self.server_signature.as_deref() != Some(signature) {
            return Err(ServerlessError::scram(
                "SCRAM-SERVER-FINAL-MESSAGE: server signature does not match",
            ));
        }
        Ok(())
    }
}

/// Split `k=v,k=v`, splitting each entry only on its first `=`.
fn parse_attribute_pairs(text: &str) -> ServerlessResult<Vec<(char, &str)>> {
    text.split(',')
        .map(|entry| {
            let mut chars = entry.chars();
            match (chars.next(), chars.next()) {
                (Some(name), Some('=')) => Ok((name, &entry[name.len_utf8() + 1..])),
                _ => Err(ServerlessError::scram("Invalid attribute pair entry")),
            }
        })
        .collect()
}

fn attr<'a>(attrs: &[(char, &'a str)], name: char) -> Option<&'a str> {
    attrs.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

fn parse_server_first(text: &str) -> ServerlessResult<ServerFirst<'_>> {
    let attrs = parse_attribute_pairs(text)?;

    let nonce = attr(&attrs, 'r')
        .ok_or_else(|| ServerlessError::scram("SCRAM-SERVER-FIRST-MESSAGE: nonce missing"))?;
    if !is_printable(nonce) {
        return Err(ServerlessError::scram(
            "SCRAM-SERVER-FIRST-MESSAGE: nonce must only contain printable characters",
        ));
    }

    let salt = attr(&attrs, 's')
        .ok_or_else(|| ServerlessError::scram("SCRAM-SERVER-FIRST-MESSAGE: salt missing"))?;
    if !is_base64(salt) {
        return Err(ServerlessError::scram(
            "SCRAM-SERVER-FIRST-MESSAGE: salt must be base64",
        ));
    }
    let salt = BASE64
        .decode(salt)
        .map_err(|_| ServerlessError::scram("SCRAM-SERVER-FIRST-MESSAGE: salt must be base64"))?;

    let iterations = attr(&attrs, 'i').ok_or_else(|| {
        ServerlessError::scram("SCRAM-SERVER-FIRST-MESSAGE: iteration missing")
    })?;
    if !is_positive_integer(iterations) {
        return Err(ServerlessError::scram(
            "SCRAM-SERVER-FIRST-MESSAGE: invalid iteration count",
        ));
    }
    let iteration_count = iterations.parse::<u32>().map_err(|_| {
        ServerlessError::scram("SCRAM-SERVER-FIRST-MESSAGE: invalid iteration count")
    })?;

    Ok(ServerFirst {
        nonce,
        salt,
        iteration_count,
    })
}

/// Printable ASCII excluding comma: `[!-+--~]+`.
fn is_printable(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| matches!(b, 0x21..=0x2B | 0x2D..=0x7E))
}

/// Canonical padded base64.
fn is_base64(text: &str) -> bool {
    text.len() % 4 == 0
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        && BASE64.decode(text).is_ok()
}

/// `[1-9][0-9]*`
fn is_positive_integer(text: &str) -> bool {
    let mut bytes = text.bytes();
    matches!(bytes.next(), Some(b'1'..=b'9')) && bytes.all(|b| b.is_ascii_digit())
}
