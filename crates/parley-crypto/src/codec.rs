use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use serde_json::Value;
use thiserror::Error;

use crate::keys::KeyProvider;

/// Recoverable codec failure. Decrypt errors cover both tampered
/// ciphertext and key mismatch; callers degrade per-message rather than
/// failing a whole page.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key unavailable: {0}")]
    Key(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("decrypted payload is not valid JSON")]
    Payload,
}

/// Encrypts and decrypts JSON message payloads with AES-256-GCM.
#[derive(Clone)]
pub struct MessageCodec {
    provider: Arc<dyn KeyProvider>,
}

impl MessageCodec {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    /// Encrypt a JSON payload. Returns (ciphertext, nonce); both are needed
    /// to decrypt. A fresh nonce is drawn from the OS RNG on every call.
    pub fn encrypt_json(&self, payload: &Value) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let key = self
            .provider
            .message_key()
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(payload).map_err(|_| CryptoError::Encrypt)?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| CryptoError::Encrypt)?;

        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    /// Decrypt a stored payload back to JSON.
    pub fn decrypt_json(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Value, CryptoError> {
        let key = self
            .provider
            .message_key()
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        if nonce.len() != 12 {
            return Err(CryptoError::Decrypt);
        }
        let nonce = Nonce::from_slice(nonce);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{StaticKeyProvider, generate_key};
    use serde_json::json;

    fn codec() -> MessageCodec {
        MessageCodec::new(Arc::new(StaticKeyProvider::new(generate_key())))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let codec = codec();
        let payload = json!({ "text": "Hello from Parley!" });

        let (ciphertext, nonce) = codec.encrypt_json(&payload).unwrap();
        assert_ne!(ciphertext, serde_json::to_vec(&payload).unwrap());

        let decrypted = codec.decrypt_json(&ciphertext, &nonce).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let codec = codec();
        let payload = json!({ "text": "same payload" });

        let (c1, n1) = codec.encrypt_json(&payload).unwrap();
        let (c2, n2) = codec.encrypt_json(&payload).unwrap();

        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn wrong_key_fails() {
        let a = codec();
        let b = codec();
        let payload = json!({ "text": "secret" });

        let (ciphertext, nonce) = a.encrypt_json(&payload).unwrap();
        assert!(matches!(
            b.decrypt_json(&ciphertext, &nonce),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let codec = codec();
        let (mut ciphertext, nonce) = codec.encrypt_json(&json!({ "text": "hi" })).unwrap();
        ciphertext[0] ^= 0xff;
        assert!(codec.decrypt_json(&ciphertext, &nonce).is_err());
    }
}
