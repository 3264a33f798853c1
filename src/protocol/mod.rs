//! PostgreSQL Wire Protocol
//!
//! Message codec, SCRAM-SHA-256 client, and the async crypto provider it
//! runs on. No I/O here.

pub mod auth;
pub mod crypto;
pub mod wire;

pub use auth::{SCRAM_SHA_256, ScramSession, ScramState};
pub use crypto::{BlockingPoolCrypto, CryptoProvider};
pub use wire::*;
