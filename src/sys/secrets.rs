// src/sys/secrets.rs

use rand::{Rng, distr::Alphanumeric};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Credential is a memory-safe wrapper for database passwords, mailbox
/// passwords, private keys and API tokens.
///
/// Debug output is always `[REDACTED]`, and the backing buffer is zeroized
/// when the value is dropped.
pub struct Credential {
    token: Secret<Vec<u8>>,
}

impl Credential {
    /// Wraps raw bytes in a zeroizing Secret. Takes ownership so the plaintext
    /// is not duplicated by the allocator.
    pub fn new(raw_token: Vec<u8>) -> Self {
        Self {
            token: Secret::new(raw_token),
        }
    }

    /// Random alphanumeric credential, used when the operator leaves a
    /// password field empty.
    pub fn generate(len: usize) -> Self {
        let bytes: Vec<u8> = rand::rng().sample_iter(&Alphanumeric).take(len).collect();
        Self::new(bytes)
    }

    /// Exposes the secret to a closure; the slice cannot outlive the call.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.token.expose_secret())
    }

    /// Same as `use_secret`, for callers that need text. Non-UTF-8 content
    /// is exposed as an empty string.
    pub fn use_str<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        self.use_secret(|bytes| action(std::str::from_utf8(bytes).unwrap_or_default()))
    }

    /// Proactively scrubs the buffer instead of waiting for scope exit.
    pub fn destroy(self) {
        drop(self);
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self::new(self.token.expose_secret().clone())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Credential::from)
    }
}
