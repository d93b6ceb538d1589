use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Source of the symmetric message key. Storage and rotation live behind
/// this seam (env var today, secret store later); the codec only ever asks
/// for the current key.
pub trait KeyProvider: Send + Sync {
    fn message_key(&self) -> Result<[u8; 32]>;
}

/// Provider that holds one fixed key for the process lifetime.
pub struct StaticKeyProvider {
    key: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build from a base64-encoded 256-bit key, as handed over by the
    /// deployment's secret store.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid key length"))?;
        Ok(Self::new(key))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn message_key(&self) -> Result<[u8; 32]> {
        Ok(self.key)
    }
}

/// Generate a random 256-bit key. Dev convenience; production deployments
/// inject the key via configuration.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encode a key to base64 for display/sharing.
pub fn key_to_base64(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}
