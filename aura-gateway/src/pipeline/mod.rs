//! Request/response plugin pipeline
//!
//! Plugins are sorted once at construction by ascending priority (ties
//! broken by name) and never reordered. The request side runs in that
//! order until a plugin short-circuits with a response or fails; the
//! response side then runs in descending order over the full stack, so a
//! rate-limit rejection still passes back through encryption.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod auth;
pub mod context;
pub mod encryption;
pub mod rate_limit;
pub mod routing;
pub mod validation;

pub use auth::AuthPlugin;
pub use context::{
    GatewayResponse, RequestContext, ResponseBody, StreamBody, TransportKind,
};
pub use encryption::EncryptionPlugin;
pub use rate_limit::RateLimitPlugin;
pub use routing::RoutingPlugin;
pub use validation::ValidationPlugin;

/// Default plugin priorities
pub mod priority {
    pub const ENCRYPTION: i32 = 10;
    pub const AUTH: i32 = 20;
    pub const RATE_LIMIT: i32 = 30;
    pub const VALIDATION: i32 = 40;
    pub const ROUTING: i32 = 90;
}

/// Descriptive plugin metadata
#[derive(Debug, Clone, Default)]
pub struct PluginMetadata {
    pub description: &'static str,
}

/// Outcome of a request-side plugin stage
#[derive(Debug)]
pub enum PluginFlow {
    /// Hand the context to the next stage
    Continue,
    /// Short-circuit with this response; remaining request stages are
    /// skipped, the response side still runs
    Respond(GatewayResponse),
}

/// A pipeline stage
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable unique name; also the priority tie-breaker
    fn name(&self) -> &'static str;

    /// Lower runs earlier on the request side
    fn priority(&self) -> i32;

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::default()
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<PluginFlow>;

    async fn on_response(
        &self,
        ctx: &mut RequestContext,
        response: &mut GatewayResponse,
    ) -> Result<()>;
}

/// The assembled pipeline
pub struct Pipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    /// Sort plugins by (priority, name); registration order is irrelevant
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self { plugins }
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run one request through the full pipeline
    ///
    /// Never panics the caller with an error: failures become taxonomy
    /// responses. Cancellation is checked before every stage.
    pub async fn run(&self, ctx: &mut RequestContext) -> GatewayResponse {
        let mut response: Option<GatewayResponse> = None;

        for plugin in &self.plugins {
            if ctx.cancel.is_cancelled() {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    "Request cancelled before stage '{}'",
                    plugin.name()
                );
                response = Some(GatewayResponse::from_error(&Error::Internal(
                    "request cancelled".into(),
                )));
                break;
            }

            tracing::trace!(
                correlation_id = %ctx.correlation_id,
                plugin = plugin.name(),
                "Request stage"
            );
            match plugin.on_request(ctx).await {
                Ok(PluginFlow::Continue) => {}
                Ok(PluginFlow::Respond(r)) => {
                    response = Some(r);
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        correlation_id = %ctx.correlation_id,
                        plugin = plugin.name(),
                        code = e.code(),
                        "Request stage failed: {}",
                        e
                    );
                    response = Some(GatewayResponse::from_error(&e));
                    break;
                }
            }
        }

        let mut response = response.unwrap_or_else(|| {
            GatewayResponse::from_error(&Error::Internal(format!(
                "no pipeline stage produced a response for {} {} ({})",
                ctx.method, ctx.path, ctx.correlation_id
            )))
        });

        // response side always runs over the whole stack, in reverse
        for plugin in self.plugins.iter().rev() {
            if let Err(e) = plugin.on_response(ctx, &mut response).await {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    plugin = plugin.name(),
                    code = e.code(),
                    "Response stage failed: {}",
                    e
                );
                response = GatewayResponse::from_error(&e);
            }
        }

        response
    }
}
