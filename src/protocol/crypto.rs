//! Asynchronous cryptographic provider for SCRAM.
//!
//! The SCRAM exchange calls every primitive through [`CryptoProvider`], so a
//! caller on a single-threaded runtime is never stalled by the iteration
//! count. Implementations may offload to a thread pool or a platform API.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{ServerlessError, ServerlessResult};

type HmacSha256 = Hmac<Sha256>;

/// Async HMAC-SHA-256 / SHA-256 / PBKDF2 provider.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    async fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> ServerlessResult<[u8; 32]>;

    async fn sha256(&self, data: &[u8]) -> ServerlessResult<[u8; 32]>;

    /// PBKDF2-HMAC-SHA-256 with a single 32-byte output block: `iterations`
    /// rounds of HMAC keyed by the password, seeded with `salt || 0x00000001`,
    /// each round XOR-accumulated into the result.
    async fn pbkdf2_sha256(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> ServerlessResult<[u8; 32]>;
}

/// Default provider. Key stretching runs on tokio's blocking pool; the
/// single-block HMAC and hash calls are cheap enough to run in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingPoolCrypto;

#[async_trait]
impl CryptoProvider for BlockingPoolCrypto {
    async fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> ServerlessResult<[u8; 32]> {
        hmac_sha256(key, data)
    }

    async fn sha256(&self, data: &[u8]) -> ServerlessResult<[u8; 32]> {
        Ok(Sha256::digest(data).into())
    }

    async fn pbkdf2_sha256(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> ServerlessResult<[u8; 32]> {
        let password = password.to_vec();
        let salt = salt.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut output = [0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(&password, &salt, iterations, &mut output);
            output
        })
        .await
        .map_err(|e| ServerlessError::scram(format!("key derivation task failed: {}", e)))
    }
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> ServerlessResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ServerlessError::scram(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The spelled-out single-block derivation, for comparison.
    fn pbkdf2_by_hand(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut seed = salt.to_vec();
        seed.extend_from_slice(&1u32.to_be_bytes());
        let mut u = hmac_sha256(password, &seed).unwrap();
        let mut acc = u;
        for _ in 1..iterations {
            u = hmac_sha256(password, &u).unwrap();
            for (a, b) in acc.iter_mut().zip(u.iter()) {
                *a ^= b;
            }
        }
        acc
    }

    #[tokio::test]
    async fn test_pbkdf2_matches_manual_rounds() {
        let crypto = BlockingPoolCrypto;
        let derived = crypto.pbkdf2_sha256(b"pencil", b"salty", 64).await.unwrap();
        assert_eq!(derived, pbkdf2_by_hand(b"pencil", b"salty", 64));
    }

    #[tokio::test]
    async fn test_sha256_empty() {
        let digest = BlockingPoolCrypto.sha256(b"").await.unwrap();
        assert_eq!(digest[..4], [0xe3, 0xb0, 0xc4, 0x42]);
    }
}
