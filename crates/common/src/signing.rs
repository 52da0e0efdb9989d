//! HMAC-SHA256 body signatures carried in the `HashSHA256` header.

use {
    hmac::{Hmac, Mac},
    secrecy::{ExposeSecret, Secret},
    sha2::Sha256,
};

use crate::{Error, Result};

/// Header holding the hex-encoded signature of the body.
pub const HASH_HEADER: &str = "HashSHA256";

type HmacSha256 = Hmac<Sha256>;

/// Shared secret used to sign and verify request and response bodies.
pub struct SigningKey {
    key: Secret<String>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey([REDACTED])")
    }
}

impl SigningKey {
    pub fn new(key: Secret<String>) -> Self {
        Self { key }
    }

    /// `None` for an absent or blank key, which disables signing.
    pub fn from_optional(key: Option<&Secret<String>>) -> Option<Self> {
        key.filter(|k| !k.expose_secret().is_empty())
            .map(|k| Self::new(Secret::new(k.expose_secret().clone())))
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(self.key.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts any key length"),
        }
    }

    /// Lowercase hex HMAC-SHA256 of `body`.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check `signature` (hex, any case) against `body` in constant time.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<()> {
        let expected = hex::decode(signature.trim()).map_err(|_| Error::MalformedSignature)?;
        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| Error::SignatureMismatch)
    }
}
