//! Encryption plugin: envelope enforcement, decrypt on request,
//! re-encrypt on response
//!
//! Protected routes require the full envelope
//! `{"encrypted": true, "client_id": ..., "payload": {...}}`; anything
//! else is rejected as `encryption/no_session` so clients are steered back
//! to the handshake. Public routes pass through untouched, but a client
//! that chooses to send an envelope to a public route gets it decrypted
//! (and malformed envelopes rejected) rather than silently forwarded.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::crypto::EncryptedPayload;
use crate::error::{Error, Result};
use crate::pipeline::context::{
    GatewayResponse, RequestContext, ResponseBody, StreamBody,
};
use crate::pipeline::{priority, Plugin, PluginFlow, PluginMetadata};
use crate::session::SessionManager;
use crate::streaming::SecureStream;

/// Wire form of the outer envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    encrypted: bool,
    client_id: String,
    payload: EncryptedPayload,
}

pub struct EncryptionPlugin {
    sessions: Arc<SessionManager>,
}

impl EncryptionPlugin {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    fn parse_envelope(value: &serde_json::Value) -> Result<Envelope> {
        let envelope: Envelope = serde_json::from_value(value.clone())
            .map_err(|_| Error::NoSession("malformed encryption envelope".into()))?;
        if !envelope.encrypted {
            return Err(Error::NoSession(
                "envelope must set encrypted: true".into(),
            ));
        }
        Ok(envelope)
    }

    fn decrypt_into(&self, ctx: &mut RequestContext, value: &serde_json::Value) -> Result<()> {
        let envelope = Self::parse_envelope(value)?;
        let plaintext = self
            .sessions
            .decrypt_request(&envelope.client_id, &envelope.payload)?;
        ctx.client_id = Some(envelope.client_id);
        ctx.payload = Some(plaintext);
        Ok(())
    }

    fn looks_like_envelope(value: &serde_json::Value) -> bool {
        value.get("encrypted").is_some()
    }
}

#[async_trait]
impl Plugin for EncryptionPlugin {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn priority(&self) -> i32 {
        priority::ENCRYPTION
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            description: "end-to-end payload encryption over per-client sessions",
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<PluginFlow> {
        let raw = ctx.raw_payload.clone();
        match raw {
            Some(value) if ctx.route.encrypted => {
                self.decrypt_into(ctx, &value)?;
            }
            None if ctx.route.encrypted => {
                return Err(Error::NoSession(
                    "protected route requires an encrypted payload".into(),
                ));
            }
            Some(value) if Self::looks_like_envelope(&value) => {
                // optional encryption on a public route still has to be
                // well-formed
                self.decrypt_into(ctx, &value)?;
            }
            other => {
                ctx.payload = other;
            }
        }
        Ok(PluginFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &mut RequestContext,
        response: &mut GatewayResponse,
    ) -> Result<()> {
        if !ctx.route.encrypted {
            return Ok(());
        }
        let Some(client_id) = ctx.client_id.clone() else {
            return Ok(());
        };

        // plain errors (including no_session itself) go out unencrypted so
        // the client can recover
        if response.is_error() {
            return Ok(());
        }

        match std::mem::replace(&mut response.body, ResponseBody::Empty) {
            ResponseBody::Json(value) => {
                match self.sessions.encrypt_response(&client_id, &value) {
                    Ok(sealed) => {
                        response.body = ResponseBody::Json(serde_json::json!({
                            "encrypted": true,
                            "client_id": client_id,
                            "payload": sealed,
                        }));
                    }
                    Err(Error::NoSession(_)) => {
                        // rotated away mid-request; surface it rather than
                        // leaking plaintext
                        *response =
                            GatewayResponse::from_error(&Error::NoSession(client_id));
                    }
                    Err(e) => return Err(e),
                }
            }
            ResponseBody::Stream(StreamBody::Plain(inner)) => {
                // re-encrypt per frame at emit time so mid-stream
                // invalidation is observable
                response.body = ResponseBody::Stream(StreamBody::Secure(SecureStream::new(
                    inner,
                    self.sessions.clone(),
                    client_id,
                )));
            }
            other => response.body = other,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::crypto::handshake::ClientHandshake;
    use crate::crypto::{Direction, PayloadCipher};
    use crate::pipeline::context::TransportKind;
    use crate::routes::{Route, RouteKind};
    use http::Method;
    use serde_json::json;

    fn setup() -> (Arc<SessionManager>, PayloadCipher, EncryptionPlugin) {
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let client = ClientHandshake::start();
        let outcome = sessions.begin_handshake(Some("c_abc".into()), &client.public_key());
        let cipher = PayloadCipher::new(&client.finish(&outcome.server_public));
        let plugin = EncryptionPlugin::new(sessions.clone());
        (sessions, cipher, plugin)
    }

    fn protected_ctx() -> RequestContext {
        let route = Arc::new(Route::protected(
            Method::POST,
            "/echo",
            "gateway.echo",
            RouteKind::Unary,
        ));
        RequestContext::new(TransportKind::Http, Method::POST, "/echo", route)
    }

    fn public_ctx() -> RequestContext {
        let route = Arc::new(Route::public(Method::GET, "/health", "gateway.health"));
        RequestContext::new(TransportKind::Http, Method::GET, "/health", route)
    }

    fn envelope(cipher: &PayloadCipher, value: serde_json::Value) -> serde_json::Value {
        let sealed = cipher
            .seal_json(&value, "c_abc", Direction::C2S)
            .unwrap();
        json!({"encrypted": true, "client_id": "c_abc", "payload": sealed})
    }

    #[tokio::test]
    async fn test_protected_route_decrypts() {
        let (_, cipher, plugin) = setup();
        let mut ctx = protected_ctx();
        ctx.raw_payload = Some(envelope(&cipher, json!({"message": "hello"})));

        plugin.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.payload.as_ref().unwrap()["message"], "hello");
        assert_eq!(ctx.client_id.as_deref(), Some("c_abc"));
    }

    #[tokio::test]
    async fn test_protected_route_rejects_plaintext() {
        let (_, _, plugin) = setup();
        let mut ctx = protected_ctx();
        ctx.raw_payload = Some(json!({"message": "hello"}));

        let err = plugin.on_request(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), "encryption/no_session");
    }

    #[tokio::test]
    async fn test_protected_route_rejects_missing_body() {
        let (_, _, plugin) = setup();
        let mut ctx = protected_ctx();
        let err = plugin.on_request(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), "encryption/no_session");
    }

    #[tokio::test]
    async fn test_unknown_client_rejected() {
        let (_, cipher, plugin) = setup();
        let mut ctx = protected_ctx();
        let sealed = cipher
            .seal_json(&json!({"x": 1}), "c_abc", Direction::C2S)
            .unwrap();
        ctx.raw_payload =
            Some(json!({"encrypted": true, "client_id": "c_ghost", "payload": sealed}));

        let err = plugin.on_request(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), "encryption/no_session");
    }

    #[tokio::test]
    async fn test_public_route_passthrough() {
        let (_, _, plugin) = setup();
        let mut ctx = public_ctx();
        ctx.raw_payload = Some(json!({"q": 1}));
        plugin.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.payload.as_ref().unwrap()["q"], 1);
    }

    #[tokio::test]
    async fn test_public_route_envelope_must_be_well_formed() {
        let (_, cipher, plugin) = setup();

        // a well-formed envelope on a public route decrypts fine
        let mut ctx = public_ctx();
        ctx.raw_payload = Some(envelope(&cipher, json!({"q": 1})));
        plugin.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.payload.as_ref().unwrap()["q"], 1);

        // a malformed one is rejected, not forwarded
        let mut ctx = public_ctx();
        ctx.raw_payload = Some(json!({"encrypted": true}));
        assert!(plugin.on_request(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_response_reencrypted() {
        let (_, cipher, plugin) = setup();
        let mut ctx = protected_ctx();
        ctx.raw_payload = Some(envelope(&cipher, json!({"message": "hello"})));
        plugin.on_request(&mut ctx).await.unwrap();

        let mut response = GatewayResponse::json(json!({"message": "hello"}));
        plugin.on_response(&mut ctx, &mut response).await.unwrap();

        let ResponseBody::Json(body) = &response.body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["encrypted"], true);
        let sealed: EncryptedPayload =
            serde_json::from_value(body["payload"].clone()).unwrap();
        let opened = cipher.open_json(&sealed, "c_abc", Direction::S2C).unwrap();
        assert_eq!(opened["message"], "hello");
    }

    #[tokio::test]
    async fn test_error_responses_stay_plain() {
        let (_, cipher, plugin) = setup();
        let mut ctx = protected_ctx();
        ctx.raw_payload = Some(envelope(&cipher, json!({"x": 1})));
        plugin.on_request(&mut ctx).await.unwrap();

        let mut response = GatewayResponse::from_error(&Error::AuthExpired);
        plugin.on_response(&mut ctx, &mut response).await.unwrap();
        let ResponseBody::Json(body) = &response.body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_session_gone_at_response_time() {
        let (sessions, cipher, plugin) = setup();
        let mut ctx = protected_ctx();
        ctx.raw_payload = Some(envelope(&cipher, json!({"x": 1})));
        plugin.on_request(&mut ctx).await.unwrap();

        sessions.invalidate("c_abc");
        let mut response = GatewayResponse::json(json!({"x": 1}));
        plugin.on_response(&mut ctx, &mut response).await.unwrap();
        assert_eq!(response.error_code, Some("encryption/no_session"));
    }
}
