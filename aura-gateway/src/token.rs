//! Access/refresh token lifecycle
//!
//! Tokens are self-contained JWTs; the only server-side state is a small
//! set of consumed refresh-token ids so rotation actually consumes the old
//! token. The set is pruned as entries pass their expiry, keeping lookups
//! O(1) and memory bounded by the refresh TTL.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::crypto::jwt::{decode_expiry, Claims, JwtSigner, TokenKind};
use crate::error::{Error, Result};

/// Freshly minted access + refresh pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp the access token expires at
    pub access_expires_at: i64,
    pub token_type: String,
}

/// Issues, validates and rotates tokens
pub struct TokenManager {
    signer: JwtSigner,
    access_ttl: Duration,
    refresh_ttl: Duration,
    consumed: DashMap<String, i64>,
}

impl TokenManager {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            signer: JwtSigner::new(config)?,
            access_ttl: Duration::from_secs(config.access_token_ttl_secs),
            refresh_ttl: Duration::from_secs(config.refresh_token_ttl_secs),
            consumed: DashMap::new(),
        })
    }

    /// Mint a fresh pair for an identity
    pub fn mint(&self, identity: &str, scope: Vec<String>) -> Result<TokenPair> {
        let access = self.signer.mint(
            identity,
            TokenKind::Access,
            self.access_ttl,
            Some(Uuid::new_v4().to_string()),
            scope.clone(),
        )?;
        let refresh = self.signer.mint(
            identity,
            TokenKind::Refresh,
            self.refresh_ttl,
            Some(Uuid::new_v4().to_string()),
            scope,
        )?;
        Ok(TokenPair {
            access_expires_at: decode_expiry(&access)?,
            access_token: access,
            refresh_token: refresh,
            token_type: "Bearer".to_string(),
        })
    }

    /// Validate an access token and return the caller identity
    pub fn verify(&self, access_token: &str) -> Result<Claims> {
        self.signer.verify(access_token, TokenKind::Access)
    }

    /// Rotate: consume the refresh token, return a new pair
    ///
    /// A consumed or expired refresh token no longer refreshes; reuse is a
    /// hard failure rather than a silent re-issue.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.signer.verify(refresh_token, TokenKind::Refresh)?;
        let jti = claims
            .jti
            .clone()
            .ok_or_else(|| Error::AuthInvalid("refresh token has no jti".into()))?;

        // insert-if-absent is the consume step; a second use finds the entry
        let newly_consumed = match self.consumed.entry(jti) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(claims.exp);
                true
            }
        };
        if !newly_consumed {
            return Err(Error::AuthInvalid(
                "refresh token has already been used".into(),
            ));
        }

        self.mint(&claims.sub, claims.scope)
    }

    /// Drop consumed entries whose tokens have expired anyway
    pub fn prune_consumed(&self, now: i64) -> usize {
        let before = self.consumed.len();
        self.consumed.retain(|_, exp| *exp > now);
        before - self.consumed.len()
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }

    /// Periodic pruning task, cancelled on shutdown
    pub fn spawn_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Token maintenance stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.prune_consumed(Utc::now().timestamp());
                    }
                }
            }
        });
    }
}

/// Holds a live token pair for the server's own outbound calls
///
/// Mirrors the platform clients: a supervised periodic task rotates the
/// pair before the access token expires, so callers always read a valid
/// bearer. On a rejected refresh (e.g. after a manager restart) it falls
/// back to minting a fresh pair. Downstream callers seeing a 401 despite
/// this are expected to retry exactly once after forcing a refresh.
pub struct TokenClient {
    manager: Arc<TokenManager>,
    identity: String,
    scope: Vec<String>,
    pair: tokio::sync::RwLock<TokenPair>,
    skew: Duration,
    pre_refresh_window: Duration,
}

impl TokenClient {
    pub fn new(
        manager: Arc<TokenManager>,
        identity: impl Into<String>,
        scope: Vec<String>,
        config: &SecurityConfig,
    ) -> Result<Arc<Self>> {
        let identity = identity.into();
        let pair = manager.mint(&identity, scope.clone())?;
        Ok(Arc::new(Self {
            manager,
            identity,
            scope,
            pair: tokio::sync::RwLock::new(pair),
            skew: Duration::from_secs(config.clock_skew_secs),
            pre_refresh_window: Duration::from_secs(config.pre_refresh_window_secs),
        }))
    }

    /// Current access token
    pub async fn access_token(&self) -> String {
        self.pair.read().await.access_token.clone()
    }

    /// True when the pair is inside the proactive-refresh window
    pub async fn needs_refresh(&self) -> bool {
        let exp = self.pair.read().await.access_expires_at;
        let now = Utc::now().timestamp();
        now + self.skew.as_secs() as i64 > exp - self.pre_refresh_window.as_secs() as i64
    }

    /// Rotate now, falling back to a fresh mint when rotation is rejected
    pub async fn force_refresh(&self) -> Result<()> {
        let refresh_token = self.pair.read().await.refresh_token.clone();
        let new_pair = match self.manager.refresh(&refresh_token) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "Refresh rejected, minting a fresh pair");
                self.manager.mint(&self.identity, self.scope.clone())?
            }
        };
        *self.pair.write().await = new_pair;
        Ok(())
    }

    /// Supervised proactive-refresh task
    pub fn spawn_refresher(self: Arc<Self>, cancel: CancellationToken) {
        let check_interval =
            Duration::from_secs((self.pre_refresh_window.as_secs() / 4).clamp(1, 30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(identity = %self.identity, "Token refresher stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if self.needs_refresh().await {
                    if let Err(e) = self.force_refresh().await {
                        tracing::error!(identity = %self.identity, error = %e, "Proactive token refresh failed");
                    } else {
                        tracing::debug!(identity = %self.identity, "Token pair rotated proactively");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        let config = SecurityConfig {
            jwt_secret: Some("test-secret".into()),
            ..SecurityConfig::default()
        };
        TokenManager::new(&config).unwrap()
    }

    #[test]
    fn test_mint_and_verify() {
        let m = manager();
        let pair = m.mint("user:amy", vec!["chat".into()]).unwrap();
        assert_eq!(pair.token_type, "Bearer");

        let claims = m.verify(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "user:amy");
        assert!(claims.has_scope("chat"));
        assert!(pair.access_expires_at > Utc::now().timestamp());
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let m = manager();
        let pair = m.mint("user:amy", vec![]).unwrap();
        assert!(m.verify(&pair.refresh_token).is_err());
    }

    #[test]
    fn test_refresh_rotates_and_consumes() {
        let m = manager();
        let pair = m.mint("user:amy", vec!["chat".into()]).unwrap();

        let rotated = m.refresh(&pair.refresh_token).unwrap();
        assert_ne!(rotated.access_token, pair.access_token);
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        let claims = m.verify(&rotated.access_token).unwrap();
        assert_eq!(claims.sub, "user:amy");
        assert!(claims.has_scope("chat"));

        // the old refresh token no longer refreshes
        let err = m.refresh(&pair.refresh_token).unwrap_err();
        assert_eq!(err.code(), "auth/invalid");

        // the new one still does
        assert!(m.refresh(&rotated.refresh_token).is_ok());
    }

    #[test]
    fn test_access_token_cannot_refresh() {
        let m = manager();
        let pair = m.mint("user:amy", vec![]).unwrap();
        assert!(m.refresh(&pair.access_token).is_err());
    }

    #[test]
    fn test_prune_consumed() {
        let m = manager();
        let pair = m.mint("user:amy", vec![]).unwrap();
        m.refresh(&pair.refresh_token).unwrap();
        assert_eq!(m.consumed_count(), 1);

        // nothing expired yet
        assert_eq!(m.prune_consumed(Utc::now().timestamp()), 0);
        // far future: everything prunable
        let far = Utc::now().timestamp() + 365 * 24 * 3600;
        assert_eq!(m.prune_consumed(far), 1);
        assert_eq!(m.consumed_count(), 0);
    }

    #[tokio::test]
    async fn test_token_client_rotates_in_window() {
        let config = SecurityConfig {
            jwt_secret: Some("test-secret".into()),
            // expiry is already inside the refresh window
            access_token_ttl_secs: 60,
            pre_refresh_window_secs: 120,
            ..SecurityConfig::default()
        };
        let manager = Arc::new(TokenManager::new(&config).unwrap());
        let client =
            TokenClient::new(manager.clone(), "svc:gateway", vec![], &config).unwrap();

        assert!(client.needs_refresh().await);
        let before = client.access_token().await;
        client.force_refresh().await.unwrap();
        let after = client.access_token().await;
        assert_ne!(before, after);
        assert!(manager.verify(&after).is_ok());
    }

    #[tokio::test]
    async fn test_token_client_outside_window() {
        let config = SecurityConfig {
            jwt_secret: Some("test-secret".into()),
            access_token_ttl_secs: 3600,
            pre_refresh_window_secs: 120,
            clock_skew_secs: 0,
            ..SecurityConfig::default()
        };
        let manager = Arc::new(TokenManager::new(&config).unwrap());
        let client = TokenClient::new(manager, "svc:gateway", vec![], &config).unwrap();
        assert!(!client.needs_refresh().await);
    }

    #[tokio::test]
    async fn test_token_client_recovers_from_rejected_refresh() {
        let config = SecurityConfig {
            jwt_secret: Some("test-secret".into()),
            ..SecurityConfig::default()
        };
        let manager = Arc::new(TokenManager::new(&config).unwrap());
        let client =
            TokenClient::new(manager.clone(), "svc:gateway", vec![], &config).unwrap();

        // consume the client's refresh token behind its back
        let stolen = client.pair.read().await.refresh_token.clone();
        manager.refresh(&stolen).unwrap();

        // rotation falls back to a fresh mint
        client.force_refresh().await.unwrap();
        assert!(manager.verify(&client.access_token().await).is_ok());
    }
}
