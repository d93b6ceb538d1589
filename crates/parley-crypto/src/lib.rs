/// Parley Crypto
///
/// Symmetric encryption-at-rest for stored message content (AES-256-GCM).
/// Every encryption call draws a fresh random 96-bit nonce; nonce reuse is
/// forbidden because it can leak plaintext relationships.
///
/// Key material is isolated behind the [`KeyProvider`] trait so that
/// rotation or a secret-store integration never touches codec call sites.
pub mod codec;
pub mod keys;

pub use codec::{CryptoError, MessageCodec};
pub use keys::{KeyProvider, StaticKeyProvider};
