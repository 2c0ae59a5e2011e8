//! X25519 handshake and session key derivation
//!
//! Both sides contribute an ephemeral X25519 keypair; the raw shared secret
//! is never used directly but expanded through HKDF-SHA256 with a
//! domain-separation label into the 32-byte XChaCha20-Poly1305 session key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Error, Result};

const KDF_INFO: &[u8] = b"aura-gateway session v1";

/// Derived symmetric session key
#[derive(Clone)]
pub struct SessionKey(pub [u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "SessionKey(..)")
    }
}

/// Server-side handshake output
pub struct HandshakeKeys {
    /// Server's ephemeral public key, sent back to the client
    pub server_public: [u8; 32],
    /// Symmetric key both sides derive
    pub session_key: SessionKey,
}

fn expand(shared: &[u8]) -> SessionKey {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    hk.expand(KDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SessionKey(key)
}

/// Run the server side of the handshake against a client public key
pub fn derive_session_key(client_public: &[u8; 32]) -> HandshakeKeys {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*client_public));

    HandshakeKeys {
        server_public: server_public.to_bytes(),
        session_key: expand(shared.as_bytes()),
    }
}

/// Client side of the handshake
///
/// Used by embedded clients (IPC consumers inside the platform) and by the
/// test suite. The client generates first, sends its public key, then
/// finishes with the server's reply.
pub struct ClientHandshake {
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl ClientHandshake {
    /// Generate the client keypair
    pub fn start() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Public key to send as `handshake_request`
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Derive the session key from the server's public key
    pub fn finish(self, server_public: &[u8; 32]) -> SessionKey {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*server_public));
        expand(shared.as_bytes())
    }
}

/// Decode a base64 32-byte public key from the handshake request
pub fn decode_public_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = BASE64.decode(b64).map_err(|e| Error::BadPayload {
        pointer: "/handshake_request".into(),
        message: format!("invalid base64: {}", e),
    })?;
    let key: [u8; 32] = bytes.try_into().map_err(|_| Error::BadPayload {
        pointer: "/handshake_request".into(),
        message: "public key must be exactly 32 bytes".into(),
    })?;
    Ok(key)
}

/// Encode a public key for the handshake response
pub fn encode_public_key(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_key() {
        let client = ClientHandshake::start();
        let server = derive_session_key(&client.public_key());
        let client_key = client.finish(&server.server_public);
        assert_eq!(client_key.0, server.session_key.0);
    }

    #[test]
    fn test_handshakes_produce_distinct_keys() {
        let client_public = [7u8; 32];
        let a = derive_session_key(&client_public);
        let b = derive_session_key(&client_public);
        assert_ne!(a.session_key.0, b.session_key.0);
        assert_ne!(a.server_public, b.server_public);
    }

    #[test]
    fn test_public_key_codec() {
        let key = [42u8; 32];
        let encoded = encode_public_key(&key);
        assert_eq!(decode_public_key(&encoded).unwrap(), key);

        assert!(decode_public_key("not base64 !!!").is_err());
        // wrong length
        let short = BASE64.encode([1u8; 16]);
        assert!(decode_public_key(&short).is_err());
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = SessionKey([9u8; 32]);
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }
}
