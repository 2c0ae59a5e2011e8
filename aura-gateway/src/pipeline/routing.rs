//! Routing plugin: hands validated requests to internal handlers over the
//! bus and waits for a reply or a stream handle
//!
//! The handler request is an explicit JSON codec: correlation id, caller,
//! route information and the decrypted payload. Unary replies may carry a
//! `status` bus header to override the 200 default. Only idempotent routes
//! retry, only on timeout, and only once.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::bus::BusClient;
use crate::error::{Error, Result};
use crate::pipeline::context::{GatewayResponse, RequestContext};
use crate::pipeline::{priority, Plugin, PluginFlow, PluginMetadata};
use crate::routes::RouteKind;
use crate::streaming::ResponseStream;

pub struct RoutingPlugin {
    bus: BusClient,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl RoutingPlugin {
    pub fn new(
        bus: BusClient,
        request_timeout: Duration,
        stream_idle_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            request_timeout,
            stream_idle_timeout,
        }
    }

    /// Wire form of the request handed to handlers
    fn handler_request(ctx: &RequestContext) -> serde_json::Value {
        serde_json::json!({
            "correlation_id": ctx.correlation_id,
            "client_id": ctx.client_id,
            "identity": ctx.identity.as_ref().map(|c| c.sub.clone()),
            "scope": ctx.identity.as_ref().map(|c| c.scope.clone()).unwrap_or_default(),
            "transport": ctx.transport.as_str(),
            "method": ctx.method.as_str(),
            "path": ctx.path,
            "path_params": ctx.path_params,
            "query": ctx.query,
            "payload": ctx.payload,
        })
    }

    async fn unary(&self, ctx: &RequestContext, body: Bytes) -> Result<GatewayResponse> {
        let subject = &ctx.route.subject;
        let timeout = ctx.remaining().unwrap_or(self.request_timeout);

        let reply = match self
            .bus
            .request_with_timeout(subject, body.clone(), timeout)
            .await
        {
            Err(Error::UpstreamTimeout(_)) if ctx.route.idempotent => {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    subject,
                    "Upstream timeout, retrying idempotent route once"
                );
                self.bus
                    .request_with_timeout(subject, body, self.request_timeout)
                    .await?
            }
            other => other?,
        };

        let status = reply
            .headers
            .get("status")
            .and_then(|s| s.parse::<u16>().ok())
            .and_then(|s| http::StatusCode::from_u16(s).ok())
            .unwrap_or(http::StatusCode::OK);

        let mut response = GatewayResponse::json(reply.json()?);
        response.status = status;
        if !status.is_success() {
            response.error_code = Some("upstream/error");
        }
        Ok(response)
    }

    async fn stream(&self, ctx: &RequestContext, body: Bytes) -> Result<GatewayResponse> {
        let sub = self.bus.request_stream(&ctx.route.subject, body).await?;
        Ok(GatewayResponse::stream(ResponseStream::new(
            sub,
            self.stream_idle_timeout,
        )))
    }
}

#[async_trait]
impl Plugin for RoutingPlugin {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn priority(&self) -> i32 {
        priority::ROUTING
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            description: "dispatch to internal handlers over the bus",
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<PluginFlow> {
        let body = Bytes::from(serde_json::to_vec(&Self::handler_request(ctx))?);
        let response = match ctx.route.kind {
            RouteKind::Unary => self.unary(ctx, body).await?,
            RouteKind::Stream => self.stream(ctx, body).await?,
        };
        Ok(PluginFlow::Respond(response))
    }

    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut GatewayResponse,
    ) -> Result<()> {
        Ok(())
    }
}
