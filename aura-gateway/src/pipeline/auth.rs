//! Auth plugin: bearer extraction and verification

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pipeline::context::{GatewayResponse, RequestContext};
use crate::pipeline::{priority, Plugin, PluginFlow, PluginMetadata};
use crate::token::TokenManager;

pub struct AuthPlugin {
    tokens: Arc<TokenManager>,
}

impl AuthPlugin {
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self { tokens }
    }

    /// Pull the token out of `Authorization: Bearer <jwt>`
    fn extract_bearer(ctx: &RequestContext) -> Result<&str> {
        let header = ctx.header("authorization").ok_or(Error::AuthMissing)?;
        header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::AuthInvalid("Authorization header is not a bearer".into()))
    }
}

#[async_trait]
impl Plugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn priority(&self) -> i32 {
        priority::AUTH
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            description: "bearer token verification",
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<PluginFlow> {
        if !ctx.route.authenticated || ctx.auth_exempt {
            return Ok(PluginFlow::Continue);
        }
        let token = Self::extract_bearer(ctx)?;
        let claims = self.tokens.verify(token)?;
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            identity = %claims.sub,
            "Caller authenticated"
        );
        ctx.identity = Some(claims);
        Ok(PluginFlow::Continue)
    }

    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut GatewayResponse,
    ) -> Result<()> {
        Ok(())
    }
}
