//! Rate-limit plugin: in-process token buckets
//!
//! One bucket per caller: authenticated requests bucket by identity,
//! unauthenticated traffic by client id, then transport peer. Capacity is
//! `requests_per_minute + burst`, refilled continuously at the sustained
//! rate, so a cold bucket admits exactly that many requests in a tight
//! burst before rejecting with a retry hint.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::pipeline::context::{GatewayResponse, RequestContext};
use crate::pipeline::{priority, Plugin, PluginFlow, PluginMetadata};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimitPlugin {
    capacity: f64,
    refill_per_sec: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl RateLimitPlugin {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: (config.requests_per_minute + config.burst) as f64,
            refill_per_sec: config.requests_per_minute as f64 / 60.0,
            buckets: DashMap::new(),
        }
    }

    /// Take one token, or report how long until one is available
    fn try_acquire(&self, key: &str) -> std::result::Result<(), u64> {
        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.capacity,
                last_refill: Instant::now(),
            })
        });
        let mut bucket = bucket.lock().expect("bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait_ms = (deficit / self.refill_per_sec * 1000.0).ceil() as u64;
            Err(wait_ms.max(1))
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn priority(&self) -> i32 {
        priority::RATE_LIMIT
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            description: "token-bucket admission per caller",
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<PluginFlow> {
        let key = ctx.rate_limit_key();
        match self.try_acquire(&key) {
            Ok(()) => Ok(PluginFlow::Continue),
            Err(retry_after_ms) => {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id,
                    key = %key,
                    retry_after_ms,
                    "Rate limit exceeded"
                );
                Err(Error::RateLimited { retry_after_ms })
            }
        }
    }

    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut GatewayResponse,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::TransportKind;
    use crate::routes::{Route, RouteKind};
    use http::Method;
    use std::sync::Arc;

    fn plugin(rpm: u32, burst: u32) -> RateLimitPlugin {
        RateLimitPlugin::new(&RateLimitConfig {
            enabled: true,
            requests_per_minute: rpm,
            burst,
        })
    }

    fn ctx_for(client: &str) -> RequestContext {
        let route = Arc::new(Route::protected(
            Method::POST,
            "/echo",
            "gateway.echo",
            RouteKind::Unary,
        ));
        let mut ctx = RequestContext::new(TransportKind::Http, Method::POST, "/echo", route);
        ctx.client_id = Some(client.to_string());
        ctx
    }

    #[tokio::test]
    async fn test_admits_exactly_rpm_plus_burst() {
        let plugin = plugin(100, 20);
        let mut ctx = ctx_for("c_abc");

        for i in 0..120 {
            let result = plugin.on_request(&mut ctx).await;
            assert!(result.is_ok(), "request {} should be admitted", i + 1);
        }
        // the 121st is rejected with a positive retry hint
        let err = plugin.on_request(&mut ctx).await.unwrap_err();
        match err {
            Error::RateLimited { retry_after_ms } => assert!(retry_after_ms > 0),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buckets_are_per_caller() {
        let plugin = plugin(1, 0);
        let mut a = ctx_for("c_a");
        let mut b = ctx_for("c_b");

        assert!(plugin.on_request(&mut a).await.is_ok());
        assert!(plugin.on_request(&mut a).await.is_err());
        // a different caller has its own bucket
        assert!(plugin.on_request(&mut b).await.is_ok());
        assert_eq!(plugin.bucket_count(), 2);
    }

    #[test]
    fn test_refill_restores_admission() {
        let plugin = plugin(6000, 0); // 100 tokens per second
        while plugin.try_acquire("k").is_ok() {}
        let wait_ms = plugin.try_acquire("k").unwrap_err();
        assert!(wait_ms >= 1 && wait_ms <= 20);

        std::thread::sleep(std::time::Duration::from_millis(wait_ms + 5));
        assert!(plugin.try_acquire("k").is_ok());
    }

    #[tokio::test]
    async fn test_identity_takes_precedence_over_client() {
        let plugin = plugin(1, 0);
        let mut ctx = ctx_for("c_abc");
        ctx.identity = Some(crate::crypto::Claims {
            sub: "user:amy".into(),
            exp: 0,
            nbf: 0,
            iat: 0,
            jti: None,
            iss: None,
            aud: None,
            scope: vec![],
            kind: crate::crypto::TokenKind::Access,
        });
        plugin.on_request(&mut ctx).await.unwrap();

        // same client id but unauthenticated: separate bucket, still admits
        let mut anon = ctx_for("c_abc");
        assert!(plugin.on_request(&mut anon).await.is_ok());
    }
}
