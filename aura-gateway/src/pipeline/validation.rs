//! Validation plugin: per-route payload contracts

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::context::{GatewayResponse, RequestContext};
use crate::pipeline::{priority, Plugin, PluginFlow, PluginMetadata};

pub struct ValidationPlugin;

impl ValidationPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ValidationPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ValidationPlugin {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn priority(&self) -> i32 {
        priority::VALIDATION
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            description: "schema checks against per-route contracts",
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<PluginFlow> {
        if let Some(contract) = &ctx.route.contract {
            // requests with no body are checked against an empty object so
            // required fields still fail with a pointer
            let empty = serde_json::Value::Object(Default::default());
            let payload = ctx.payload.as_ref().unwrap_or(&empty);
            contract.validate(payload)?;
        }
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
