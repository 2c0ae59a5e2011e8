//! Cryptographic primitives
//!
//! Three concerns, kept separate from the components that use them:
//!
//! - [`handshake`]: ephemeral X25519 key agreement fed through HKDF into a
//!   symmetric AEAD key
//! - [`envelope`]: XChaCha20-Poly1305 payload sealing with the base64 wire
//!   codec and direction-bound associated data
//! - [`jwt`]: bearer token minting and validation (HS256 / EdDSA)

pub mod envelope;
pub mod handshake;
pub mod jwt;

pub use envelope::{Direction, EncryptedPayload, PayloadCipher};
pub use handshake::{derive_session_key, HandshakeKeys, SessionKey};
pub use jwt::{Claims, JwtSigner, TokenKind};
