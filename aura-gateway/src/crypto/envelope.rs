//! AEAD payload sealing and the encrypted envelope wire codec
//!
//! Every protected payload travels as
//! `{"nonce": <b64 24 bytes>, "alg": "xchacha20-poly1305", "ciphertext": <b64>}`
//! with a fresh random nonce per message. The associated data binds the
//! frame to its session and direction: `client_id` bytes followed by the
//! direction tag, so a server-to-client frame can never be replayed back as
//! a client-to-server request.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::handshake::SessionKey;
use crate::error::{Error, Result};

/// Algorithm tag carried in every envelope
pub const ALGORITHM: &str = "xchacha20-poly1305";

const NONCE_LEN: usize = 24;

/// Frame direction, mixed into the associated data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server
    C2S,
    /// Server to client
    S2C,
}

impl Direction {
    fn tag(&self) -> &'static [u8] {
        match self {
            Self::C2S => b"C2S",
            Self::S2C => b"S2C",
        }
    }
}

/// Wire form of a sealed payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 24-byte nonce
    pub nonce: String,

    /// Algorithm tag; anything but [`ALGORITHM`] is rejected
    pub alg: String,

    /// Base64 ciphertext with the Poly1305 tag appended
    pub ciphertext: String,
}

/// AEAD cipher bound to one session key
pub struct PayloadCipher {
    cipher: XChaCha20Poly1305,
}

impl PayloadCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    fn aad(client_id: &str, direction: Direction) -> Vec<u8> {
        let mut aad = Vec::with_capacity(client_id.len() + 3);
        aad.extend_from_slice(client_id.as_bytes());
        aad.extend_from_slice(direction.tag());
        aad
    }

    /// Seal plaintext into the wire envelope form
    pub fn seal(
        &self,
        plaintext: &[u8],
        client_id: &str,
        direction: Direction,
    ) -> Result<EncryptedPayload> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let aad = Self::aad(client_id, direction);
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Internal("AEAD encryption failed".into()))?;

        Ok(EncryptedPayload {
            nonce: BASE64.encode(nonce_bytes),
            alg: ALGORITHM.to_string(),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Open a wire envelope back into plaintext
    pub fn open(
        &self,
        payload: &EncryptedPayload,
        client_id: &str,
        direction: Direction,
    ) -> Result<Vec<u8>> {
        if payload.alg != ALGORITHM {
            return Err(Error::DecryptFail(format!(
                "unsupported algorithm '{}'",
                payload.alg
            )));
        }

        let nonce_bytes = BASE64
            .decode(&payload.nonce)
            .map_err(|_| Error::DecryptFail("nonce is not valid base64".into()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::DecryptFail(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce_bytes.len()
            )));
        }

        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .map_err(|_| Error::DecryptFail("ciphertext is not valid base64".into()))?;

        let aad = Self::aad(client_id, direction);
        self.cipher
            .decrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::DecryptFail("ciphertext failed to authenticate".into()))
    }

    /// Seal a JSON value (the common case for chunked responses)
    pub fn seal_json(
        &self,
        value: &serde_json::Value,
        client_id: &str,
        direction: Direction,
    ) -> Result<EncryptedPayload> {
        let plaintext = serde_json::to_vec(value)?;
        self.seal(&plaintext, client_id, direction)
    }

    /// Open an envelope and parse the plaintext as JSON
    pub fn open_json(
        &self,
        payload: &EncryptedPayload,
        client_id: &str,
        direction: Direction,
    ) -> Result<serde_json::Value> {
        let plaintext = self.open(payload, client_id, direction)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::DecryptFail(format!("plaintext is not valid JSON: {}", e)))
    }
}
