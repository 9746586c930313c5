//! RSA-PSS request signing for the Kalshi API.
//!
//! Every REST request and the WebSocket upgrade are signed with the same
//! scheme: `timestamp_ms + METHOD + path` signed with RSA-PSS over SHA-256,
//! carried in the `KALSHI-ACCESS-*` headers.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::SigningKey;
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;

pub const HEADER_KEY: &str = "KALSHI-ACCESS-KEY";
pub const HEADER_TIMESTAMP: &str = "KALSHI-ACCESS-TIMESTAMP";
pub const HEADER_SIGNATURE: &str = "KALSHI-ACCESS-SIGNATURE";

pub struct RequestSigner {
    api_key_id: String,
    signing_key: SigningKey<Sha256>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key_id", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    /// Load the PKCS#8 PEM private key from disk.
    pub fn from_key_file(api_key_id: &str, path: &str) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("reading private key from {}", path))?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .with_context(|| format!("parsing private key PEM at {}", path))?;
        Ok(Self::new(api_key_id, key))
    }

    pub fn new(api_key_id: &str, key: RsaPrivateKey) -> Self {
        Self {
            api_key_id: api_key_id.to_string(),
            signing_key: SigningKey::<Sha256>::new(key),
        }
    }

    /// Produce the header set for one request. `path` must be the full
    /// signing path including the API prefix, e.g. `/trade-api/v2/markets`.
    pub fn headers(&self, method: &str, path: &str) -> Result<Vec<(&'static str, String)>> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?
            .as_millis() as i64;

        let message = format!("{}{}{}", timestamp_ms, method, path);
        let signature = self
            .signing_key
            .sign_with_rng(&mut rand::thread_rng(), message.as_bytes());

        Ok(vec![
            (HEADER_KEY, self.api_key_id.clone()),
            (HEADER_TIMESTAMP, timestamp_ms.to_string()),
            (HEADER_SIGNATURE, BASE64.encode(signature.to_bytes())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_shape() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let signer = RequestSigner::new("test-key-id", key);

        let headers = signer.headers("GET", "/trade-api/v2/markets").unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], (HEADER_KEY, "test-key-id".to_string()));

        // Timestamp is numeric milliseconds.
        let ts: i64 = headers[1].1.parse().unwrap();
        assert!(ts > 1_600_000_000_000);

        // Signature is non-empty base64.
        assert!(BASE64.decode(&headers[2].1).is_ok());
        assert!(!headers[2].1.is_empty());
    }

    #[test]
    fn test_signatures_are_randomized() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let signer = RequestSigner::new("k", key);

        let a = signer.headers("GET", "/trade-api/v2/portfolio/balance").unwrap();
        let b = signer.headers("GET", "/trade-api/v2/portfolio/balance").unwrap();
        // PSS uses a random salt, so two signatures over the same message differ.
        assert_ne!(a[2].1, b[2].1);
    }
}
