//! Bearer token minting and validation
//!
//! Tokens are signed JWTs (HS256 by default, EdDSA when a PEM keypair is
//! configured). Validation checks signature, `exp`, `nbf` and, when
//! configured, `iss`/`aud`, with leeway equal to the tolerated clock skew.

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::config::SecurityConfig;
use crate::error::{Error, Result};

/// Token role, carried in the `kind` claim
///
/// A refresh token presented where an access token is expected (or the
/// reverse) is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Caller identity
    pub sub: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Not before (Unix timestamp)
    pub nbf: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Token ID, used for refresh rotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Issuer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Granted scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,

    /// Access or refresh
    pub kind: TokenKind,
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.iter().any(|s| s == scope)
    }
}

/// Signer/verifier pair built from the security configuration
pub struct JwtSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: Option<String>,
    audience: Option<String>,
    leeway_secs: u64,
}

impl JwtSigner {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let algorithm = parse_algorithm(&config.jwt_algorithm)?;

        let (encoding_key, decoding_key) = match algorithm {
            Algorithm::HS256 => {
                let secret = config.jwt_secret.as_deref().ok_or_else(|| {
                    Error::Config(Box::new(figment::Error::from(
                        "security.jwt_secret is required for HS256".to_string(),
                    )))
                })?;
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
            Algorithm::EdDSA => {
                let path = config.jwt_key_path.as_ref().ok_or_else(|| {
                    Error::Config(Box::new(figment::Error::from(
                        "security.jwt_key_path is required for EdDSA".to_string(),
                    )))
                })?;
                let pem = fs::read(path).map_err(|e| {
                    Error::Config(Box::new(figment::Error::from(format!(
                        "Failed to read JWT key '{}': {}",
                        path.display(),
                        e
                    ))))
                })?;
                (
                    EncodingKey::from_ed_pem(&pem).map_err(|e| Error::Jwt(Box::new(e)))?,
                    DecodingKey::from_ed_pem(&pem).map_err(|e| Error::Jwt(Box::new(e)))?,
                )
            }
            _ => unreachable!("parse_algorithm only yields HS256 or EdDSA"),
        };

        Ok(Self {
            encoding_key,
            decoding_key,
            algorithm,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_secs: config.clock_skew_secs,
        })
    }

    /// Mint a token for `identity` expiring after `ttl`
    pub fn mint(
        &self,
        identity: &str,
        kind: TokenKind,
        ttl: Duration,
        jti: Option<String>,
        scope: Vec<String>,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: identity.to_string(),
            exp: now + ttl.as_secs() as i64,
            nbf: now,
            iat: now,
            jti,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            scope,
            kind,
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| Error::Jwt(Box::new(e)))
    }

    /// Verify a token's signature and time claims, returning its claims
    pub fn verify(&self, token: &str, expected_kind: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;

        if data.claims.kind != expected_kind {
            return Err(Error::AuthInvalid(format!(
                "expected {:?} token",
                expected_kind
            )));
        }

        // Fail fast when the issuer clock ran ahead of ours beyond the
        // tolerated skew: a token "issued" in the future is not trustworthy.
        let now = Utc::now().timestamp();
        if data.claims.iat > now + self.leeway_secs as i64 {
            return Err(Error::AuthInvalid("token issued in the future".into()));
        }

        Ok(data.claims)
    }
}

fn parse_algorithm(alg: &str) -> Result<Algorithm> {
    match alg.to_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "EDDSA" => Ok(Algorithm::EdDSA),
        _ => Err(Error::Config(Box::new(figment::Error::from(format!(
            "Unsupported JWT algorithm: {}",
            alg
        ))))),
    }
}

/// Extract `exp` without verifying the signature
///
/// Clients schedule proactive refresh from this; it is never used to grant
/// access.
pub fn decode_expiry(token: &str) -> Result<i64> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::AuthInvalid("malformed token".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::AuthInvalid("malformed token payload".into()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|_| Error::AuthInvalid("token payload is not JSON".into()))?;
    value
        .get("exp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::AuthInvalid("token has no exp claim".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn signer() -> JwtSigner {
        let config = SecurityConfig {
            jwt_secret: Some("test-secret-please-rotate".into()),
            ..SecurityConfig::default()
        };
        JwtSigner::new(&config).unwrap()
    }

    #[test]
    fn test_mint_and_verify() {
        let signer = signer();
        let token = signer
            .mint(
                "user:amy",
                TokenKind::Access,
                Duration::from_secs(900),
                None,
                vec!["chat".into()],
            )
            .unwrap();
        let claims = signer.verify(&token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, "user:amy");
        assert!(claims.has_scope("chat"));
        assert!(!claims.has_scope("admin"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = SecurityConfig {
            jwt_secret: Some("test-secret".into()),
            clock_skew_secs: 0,
            ..SecurityConfig::default()
        };
        let signer = JwtSigner::new(&config).unwrap();
        // already a minute past exp
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "user:amy".into(),
            exp: now - 60,
            nbf: now - 120,
            iat: now - 120,
            jti: None,
            iss: None,
            aud: None,
            scope: vec![],
            kind: TokenKind::Access,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        let err = signer.verify(&token, TokenKind::Access).unwrap_err();
        assert_eq!(err.code(), "auth/expired");
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let signer = signer();
        let refresh = signer
            .mint(
                "user:amy",
                TokenKind::Refresh,
                Duration::from_secs(3600),
                Some("jti-1".into()),
                vec![],
            )
            .unwrap();
        assert!(signer.verify(&refresh, TokenKind::Access).is_err());
        assert!(signer.verify(&refresh, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let signer = signer();
        let token = signer
            .mint("user:amy", TokenKind::Access, Duration::from_secs(900), None, vec![])
            .unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(signer.verify(&tampered, TokenKind::Access).is_err());
    }

    #[test]
    fn test_issuer_validated_when_configured() {
        let mut config = SecurityConfig {
            jwt_secret: Some("test-secret".into()),
            ..SecurityConfig::default()
        };
        config.issuer = Some("aura".into());
        let issuing = JwtSigner::new(&config).unwrap();
        let token = issuing
            .mint("user:amy", TokenKind::Access, Duration::from_secs(900), None, vec![])
            .unwrap();
        assert!(issuing.verify(&token, TokenKind::Access).is_ok());

        config.issuer = Some("someone-else".into());
        let other = JwtSigner::new(&config).unwrap();
        assert!(other.verify(&token, TokenKind::Access).is_err());
    }

    #[test]
    fn test_decode_expiry_without_verification() {
        let signer = signer();
        let token = signer
            .mint("user:amy", TokenKind::Access, Duration::from_secs(900), None, vec![])
            .unwrap();
        let exp = decode_expiry(&token).unwrap();
        let now = Utc::now().timestamp();
        assert!(exp > now + 800 && exp <= now + 900 + 1);

        assert!(decode_expiry("garbage").is_err());
    }

    #[test]
    fn test_unsupported_algorithm_is_config_error() {
        let config = SecurityConfig {
            jwt_algorithm: "RS256".into(),
            jwt_secret: Some("x".into()),
            ..SecurityConfig::default()
        };
        assert!(JwtSigner::new(&config).is_err());
    }
}
