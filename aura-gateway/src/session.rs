//! Per-client encryption session management
//!
//! One live session per client id, established by the handshake and
//! replaced atomically on re-handshake. Sessions expire on idle and
//! absolute TTLs, lazily on access and via a periodic sweeper. Repeated
//! decrypt failures invalidate the session so the client is forced back
//! through the handshake.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::crypto::handshake::{self, SessionKey};
use crate::crypto::{Direction, EncryptedPayload, PayloadCipher};
use crate::error::{Error, Result};

/// A live encryption session for one client id
pub struct EncryptionSession {
    /// Session identifier returned by the handshake
    pub session_id: String,

    /// Client's X25519 public key from the handshake
    pub client_public: [u8; 32],

    /// Monotonic counter bumped on every successful re-handshake
    pub generation: u64,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    key: SessionKey,
    last_used: Mutex<DateTime<Utc>>,
    failures: AtomicU32,
    seen_nonces: Mutex<VecDeque<String>>,
}

impl EncryptionSession {
    /// Cipher bound to this session's key
    pub fn cipher(&self) -> PayloadCipher {
        PayloadCipher::new(&self.key)
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.lock().expect("last_used lock poisoned")
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_used.lock().expect("last_used lock poisoned") = now;
    }

    fn is_expired(&self, now: DateTime<Utc>, config: &SessionConfig) -> bool {
        let idle = now - self.last_used();
        let age = now - self.created_at;
        idle.num_seconds() >= config.idle_ttl_secs as i64
            || age.num_seconds() >= config.max_ttl_secs as i64
    }

    /// Record a nonce; errors if it was already seen within the window
    fn check_replay(&self, nonce: &str, window: usize) -> Result<()> {
        if window == 0 {
            return Ok(());
        }
        let mut seen = self.seen_nonces.lock().expect("nonce lock poisoned");
        if seen.iter().any(|n| n == nonce) {
            return Err(Error::NonceReplay);
        }
        if seen.len() == window {
            seen.pop_front();
        }
        seen.push_back(nonce.to_string());
        Ok(())
    }
}

/// Result of a successful handshake
pub struct HandshakeOutcome {
    pub server_public: [u8; 32],
    pub session_id: String,
    pub client_id: String,
    pub generation: u64,
}

/// Owns the session map and its lifecycle
///
/// Reads are concurrent; handshake replacement is serialized per client id
/// by a lock that also owns the generation counter, so the live session's
/// generation is always the highest one handed out.
pub struct SessionManager {
    sessions: DashMap<String, Arc<EncryptionSession>>,
    generations: DashMap<String, Arc<Mutex<u64>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            generations: DashMap::new(),
            config,
        }
    }

    /// Run the server side of the handshake, atomically replacing any
    /// prior session for this client id
    ///
    /// The generation counter outlives individual sessions so rotations
    /// remain observable across re-handshakes.
    pub fn begin_handshake(
        &self,
        client_id: Option<String>,
        client_public: &[u8; 32],
    ) -> HandshakeOutcome {
        let client_id =
            client_id.unwrap_or_else(|| format!("c_{}", Uuid::new_v4().simple()));

        let counter = self
            .generations
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();
        let mut current = counter.lock().expect("generation lock poisoned");
        *current += 1;
        let generation = *current;

        let keys = handshake::derive_session_key(client_public);
        let now = Utc::now();
        let session = Arc::new(EncryptionSession {
            session_id: Uuid::new_v4().to_string(),
            client_public: *client_public,
            generation,
            created_at: now,
            key: keys.session_key,
            last_used: Mutex::new(now),
            failures: AtomicU32::new(0),
            seen_nonces: Mutex::new(VecDeque::new()),
        });
        let session_id = session.session_id.clone();

        // single insert while holding the per-client lock: the old session
        // stays observable until this point, after it only the new one is
        self.sessions.insert(client_id.clone(), session);
        drop(current);

        tracing::info!(client_id = %client_id, generation, "Encryption session established");

        HandshakeOutcome {
            server_public: keys.server_public,
            session_id,
            client_id,
            generation,
        }
    }

    /// Look up the live session for a client id, expiring lazily
    pub fn get(&self, client_id: &str) -> Option<Arc<EncryptionSession>> {
        let now = Utc::now();
        let session = self.sessions.get(client_id)?.clone();
        if session.is_expired(now, &self.config) {
            drop(
                self.sessions
                    .remove_if(client_id, |_, s| Arc::ptr_eq(s, &session)),
            );
            tracing::debug!(client_id, "Session expired on access");
            return None;
        }
        session.touch(now);
        Some(session)
    }

    /// Decrypt a client-to-server payload for this client id
    ///
    /// Failure bumps the session's failure counter; at the configured
    /// threshold the session is invalidated.
    pub fn decrypt_request(
        &self,
        client_id: &str,
        payload: &EncryptedPayload,
    ) -> Result<serde_json::Value> {
        let session = self
            .get(client_id)
            .ok_or_else(|| Error::NoSession(client_id.to_string()))?;

        session.check_replay(&payload.nonce, self.config.nonce_replay_window)?;

        match session
            .cipher()
            .open_json(payload, client_id, Direction::C2S)
        {
            Ok(value) => {
                session.failures.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                let failures = session.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        client_id,
                        failures,
                        "Decrypt failure threshold reached, invalidating session"
                    );
                    self.invalidate(client_id);
                }
                Err(e)
            }
        }
    }

    /// Encrypt a server-to-client JSON payload under the current session
    pub fn encrypt_response(
        &self,
        client_id: &str,
        value: &serde_json::Value,
    ) -> Result<EncryptedPayload> {
        let session = self
            .get(client_id)
            .ok_or_else(|| Error::NoSession(client_id.to_string()))?;
        session
            .cipher()
            .seal_json(value, client_id, Direction::S2C)
    }

    /// Drop the session for a client id
    pub fn invalidate(&self, client_id: &str) {
        if self.sessions.remove(client_id).is_some() {
            tracing::info!(client_id, "Encryption session invalidated");
        }
    }

    /// Remove every session that has passed its idle or absolute TTL
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.is_expired(now, &self.config));
        let swept = before - self.sessions.len();
        if swept > 0 {
            tracing::debug!(swept, "Swept expired sessions");
        }
        swept
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Periodic sweeper, cancelled on shutdown
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Session sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.sweep_expired(Utc::now());
                    }
                }
            }
        });
    }
}
