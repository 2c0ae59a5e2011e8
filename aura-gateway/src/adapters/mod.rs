//! Protocol adapters
//!
//! All three front ends share one contract: accept a wire frame, build a
//! [`RequestContext`], run the pipeline, write the response back in the
//! transport's shape. The shared pieces live here; the transports are
//! [`http`] (REST + WebSocket upgrade) and [`ipc`] (Unix domain socket).
//!
//! WebSocket and IPC carry the same routing envelope per frame:
//! `{"method": "POST", "path": "/echo", "headers": {...}, "body": {...},
//! "correlation_id": "..."}`. Replies echo the correlation id, so
//! full-duplex callers match responses by id and may observe them in any
//! order.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::bus::BusClient;
use crate::config::Config;
use crate::container::ServiceContainer;
use crate::crypto::handshake;
use crate::error::{Error, Result};
use crate::pipeline::{GatewayResponse, Pipeline, RequestContext, TransportKind};
use crate::routes::RouteTable;
use crate::session::SessionManager;
use crate::token::TokenManager;

pub mod http;
pub mod ipc;
pub mod ws;

/// Shared state every adapter drives
pub struct GatewayCore {
    pub config: Config,
    pub sessions: Arc<SessionManager>,
    pub tokens: Arc<TokenManager>,
    pub bus: BusClient,
    pub pipeline: Arc<Pipeline>,
    pub routes: Arc<RouteTable>,
    container: std::sync::OnceLock<Weak<ServiceContainer>>,
}

impl GatewayCore {
    pub fn new(
        config: Config,
        sessions: Arc<SessionManager>,
        tokens: Arc<TokenManager>,
        bus: BusClient,
        pipeline: Arc<Pipeline>,
        routes: Arc<RouteTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            tokens,
            bus,
            pipeline,
            routes,
            container: std::sync::OnceLock::new(),
        })
    }

    /// Wire up the container after construction (the container also owns
    /// the adapters, so this reference must stay weak)
    pub fn attach_container(&self, container: &Arc<ServiceContainer>) {
        let _ = self.container.set(Arc::downgrade(container));
    }

    /// Container health rollup, or `down` before the container is attached
    pub async fn health(&self) -> serde_json::Value {
        match self.container.get().and_then(Weak::upgrade) {
            Some(container) => container.health_rollup().await,
            None => serde_json::json!({"status": "down", "components": {}}),
        }
    }

    /// Resolve a route and build the context for one request
    pub fn build_context(
        &self,
        transport: TransportKind,
        method: ::http::Method,
        path: &str,
        query: HashMap<String, String>,
        headers: HashMap<String, String>,
        body: Option<serde_json::Value>,
        peer: Option<String>,
    ) -> Result<RequestContext> {
        let (route, path_params) = self
            .routes
            .resolve(&method, path)
            .ok_or_else(|| Error::UpstreamUnavailable(format!("no route for {} {}", method, path)))?;

        let mut ctx = RequestContext::new(transport, method, path, route);
        ctx.query = query;
        ctx.headers = headers;
        ctx.raw_payload = body;
        ctx.path_params = path_params;
        ctx.peer = peer;
        ctx.deadline = Some(Instant::now() + self.config.request_timeout());
        Ok(ctx)
    }

    /// Run the pipeline for a built context
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> GatewayResponse {
        let response = self.pipeline.run(ctx).await;
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            transport = ctx.transport.as_str(),
            method = %ctx.method,
            path = %ctx.path,
            status = response.status.as_u16(),
            elapsed_ms = ctx.started.elapsed().as_millis() as u64,
            "Request completed"
        );

        let level = if response.is_error() { "warn" } else { "info" };
        let mut event = crate::logstore::LogEvent::new(
            level,
            "gateway",
            format!("{} {} -> {}", ctx.method, ctx.path, response.status.as_u16()),
        );
        let mut extras = serde_json::Map::new();
        extras.insert("correlation_id".into(), ctx.correlation_id.clone().into());
        extras.insert("transport".into(), ctx.transport.as_str().into());
        if let Some(code) = response.error_code {
            extras.insert("error_code".into(), code.into());
        }
        event.extras = Some(extras);
        crate::logstore::publish_log(&self.bus, &event).await;

        response
    }
}

/// Wire form of the handshake request
#[derive(Debug, Deserialize)]
struct HandshakeRequest {
    handshake_request: String,
    #[serde(default)]
    client_id: Option<String>,
}

/// Handle `POST /handshake` for any transport
pub fn handle_handshake(
    core: &GatewayCore,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let request: HandshakeRequest = serde_json::from_value(body.clone())
        .map_err(|_| Error::BadPayload {
            pointer: "/handshake_request".into(),
            message: "expected {\"handshake_request\": <base64 public key>}".into(),
        })?;
    let client_public = handshake::decode_public_key(&request.handshake_request)?;
    let outcome = core
        .sessions
        .begin_handshake(request.client_id, &client_public);
    Ok(serde_json::json!({
        "server_public_key": handshake::encode_public_key(&outcome.server_public),
        "session_id": outcome.session_id,
        "client_id": outcome.client_id,
    }))
}

/// Routing envelope carried in each WebSocket/IPC frame
#[derive(Debug, Deserialize)]
pub struct FrameEnvelope {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl FrameEnvelope {
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: FrameEnvelope = serde_json::from_str(text).map_err(|e| Error::BadPayload {
            pointer: "".into(),
            message: format!("malformed frame envelope: {}", e),
        })?;
        Ok(envelope)
    }

    pub fn method(&self) -> Result<::http::Method> {
        self.method
            .to_uppercase()
            .parse()
            .map_err(|_| Error::BadPayload {
                pointer: "/method".into(),
                message: format!("unknown method '{}'", self.method),
            })
    }

    /// Lowercase the header names the way the context expects
    pub fn normalized_headers(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect()
    }
}
