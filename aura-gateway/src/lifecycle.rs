//! Lifecycle manager: one startup/shutdown coordinator for the process
//!
//! Builds every singleton, registers them in the service container with
//! explicit dependencies, and drives the whole scope from a single root
//! cancellation token. Adapters start last and stop first; the log
//! consumer outlives them on the way down so late events still land in
//! the store; the bus and store go last.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{http as http_adapter, GatewayCore};
use crate::bus::BusClient;
use crate::config::Config;
use crate::container::{ComponentHealth, Service, ServiceContainer};
use crate::error::{Error, Result};
use crate::logstore::{LogConsumer, LogStore};
use crate::pipeline::{
    AuthPlugin, EncryptionPlugin, Pipeline, Plugin, RateLimitPlugin, RoutingPlugin,
    ValidationPlugin,
};
use crate::routes::{FieldKind, PayloadContract, Route, RouteKind, RouteTable};
use crate::session::SessionManager;
use crate::token::{TokenClient, TokenManager};

/// Default route table for the companion platform
///
/// Handlers for the protected subjects live in other components; the
/// gateway only owns `/handshake` (adapter-level) and `users.refresh`.
pub fn default_routes() -> Result<RouteTable> {
    Ok(RouteTable::builder()
        .route(Route::encrypted_only(
            http::Method::POST,
            "/users/authenticate",
            "users.authenticate",
        ))?
        .route(
            Route::encrypted_only(http::Method::POST, "/users/refresh", "users.refresh")
                .with_contract(
                    PayloadContract::new().require("/refresh_token", FieldKind::String),
                ),
        )?
        .route(Route::protected(
            http::Method::POST,
            "/echo",
            "gateway.echo",
            RouteKind::Unary,
        ))?
        .route(
            Route::protected(
                http::Method::POST,
                "/conversation/send",
                "conversation.send",
                RouteKind::Unary,
            )
            .with_contract(PayloadContract::new().require("/message", FieldKind::String)),
        )?
        .route(Route::protected(
            http::Method::GET,
            "/users/{id}",
            "users.get",
            RouteKind::Unary,
        ))?
        .route(
            Route::protected(
                http::Method::POST,
                "/tts/synthesize",
                "tts.synthesize",
                RouteKind::Stream,
            )
            .with_contract(PayloadContract::new().require("/text", FieldKind::String)),
        )?
        .build())
}

/// The assembled gateway process
pub struct Gateway {
    container: Arc<ServiceContainer>,
    core: Arc<GatewayCore>,
    cancel: CancellationToken,
    http: Arc<HttpAdapter>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Construct everything and register it with the container
    ///
    /// Fail-fast: a bad key, unreadable store or misconfiguration errors
    /// here, before anything is listening.
    pub async fn build(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();

        let sessions = Arc::new(SessionManager::new(config.security.session.clone()));
        let tokens = Arc::new(TokenManager::new(&config.security)?);
        let bus = BusClient::new(config.bus.clone());
        let store = Arc::new(LogStore::open(&config.database).await?);
        let routes = Arc::new(default_routes()?);

        if config.api_gateway.tls.is_some() {
            tracing::warn!(
                "api_gateway.tls is configured; this build expects TLS termination at the fronting listener"
            );
        }

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        if config.plugins.encryption_enabled {
            plugins.push(Arc::new(EncryptionPlugin::new(sessions.clone())));
        } else {
            tracing::warn!("Encryption plugin disabled; protected routes will not decrypt");
        }
        if config.plugins.auth_enabled {
            plugins.push(Arc::new(AuthPlugin::new(tokens.clone())));
        }
        if config.plugins.rate_limiting.enabled {
            plugins.push(Arc::new(RateLimitPlugin::new(&config.plugins.rate_limiting)));
        }
        if config.plugins.validation_enabled {
            plugins.push(Arc::new(ValidationPlugin::new()));
        }
        plugins.push(Arc::new(RoutingPlugin::new(
            bus.clone(),
            config.request_timeout(),
            config.stream_idle_timeout(),
        )));
        let pipeline = Arc::new(Pipeline::new(plugins));

        let core = GatewayCore::new(
            config.clone(),
            sessions.clone(),
            tokens.clone(),
            bus.clone(),
            pipeline.clone(),
            routes,
        );

        let http = Arc::new(HttpAdapter::new(core.clone(), cancel.child_token()));

        let mut container = ServiceContainer::new();
        container.register("bus", Arc::new(BusService { _bus: bus.clone() }), &[], 10)?;
        container.register(
            "session-manager",
            Arc::new(SessionService {
                sessions: sessions.clone(),
                cancel: cancel.child_token(),
            }),
            &[],
            20,
        )?;
        container.register(
            "token-manager",
            Arc::new(TokenService {
                tokens: tokens.clone(),
                bus: bus.clone(),
                security: config.security.clone(),
                cancel: cancel.child_token(),
            }),
            &["bus"],
            21,
        )?;
        container.register(
            "log-consumer",
            Arc::new(LogConsumer::new(bus.clone(), store, &config.logging)),
            &["bus"],
            30,
        )?;
        container.register(
            "pipeline",
            Arc::new(PipelineService {
                pipeline: pipeline.clone(),
            }),
            &["session-manager", "token-manager"],
            40,
        )?;
        container.register(
            "http-adapter",
            http.clone(),
            &["bus", "session-manager", "token-manager", "pipeline", "log-consumer"],
            90,
        )?;
        #[cfg(unix)]
        if config.api_gateway.ipc.enabled {
            container.register(
                "ipc-adapter",
                Arc::new(crate::adapters::ipc::IpcAdapter::new(core.clone())),
                &["bus", "session-manager", "token-manager", "pipeline", "log-consumer"],
                91,
            )?;
        }

        let container = Arc::new(container);
        core.attach_container(&container);

        Ok(Self {
            container,
            core,
            cancel,
            http,
        })
    }

    pub fn core(&self) -> Arc<GatewayCore> {
        self.core.clone()
    }

    pub fn container(&self) -> Arc<ServiceContainer> {
        self.container.clone()
    }

    /// Token that shuts the whole gateway down when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Address the HTTP adapter actually bound (useful with port 0)
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.http.bound_addr().await
    }

    /// Start every service in dependency order
    pub async fn start(&self) -> Result<()> {
        self.container.start_all().await
    }

    /// Stop everything in reverse order
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.container.stop_all().await;
    }

    /// Start, then run until the shutdown token fires, then stop
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        tracing::info!("Gateway running");
        self.cancel.cancelled().await;
        tracing::info!("Shutdown requested, stopping services");
        self.container.stop_all().await;
        Ok(())
    }
}

/// The bus is a plain handle with no lifecycle of its own; this wrapper
/// gives the container something to own and report on
struct BusService {
    _bus: BusClient,
}

#[async_trait::async_trait]
impl Service for BusService {}

struct SessionService {
    sessions: Arc<SessionManager>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl Service for SessionService {
    async fn start(&self) -> Result<()> {
        self.sessions.clone().spawn_sweeper(self.cancel.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn health(&self) -> ComponentHealth {
        ComponentHealth::ok()
    }
}

struct TokenService {
    tokens: Arc<TokenManager>,
    bus: BusClient,
    security: crate::config::SecurityConfig,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl Service for TokenService {
    async fn start(&self) -> Result<()> {
        self.tokens
            .clone()
            .spawn_maintenance(self.cancel.clone());
        spawn_refresh_handler(&self.bus, self.tokens.clone(), self.cancel.clone());

        // the gateway's own outbound identity, rotated proactively like
        // any other platform client
        let client = TokenClient::new(
            self.tokens.clone(),
            "svc:gateway",
            vec!["internal".into()],
            &self.security,
        )?;
        client.spawn_refresher(self.cancel.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

struct PipelineService {
    pipeline: Arc<Pipeline>,
}

#[async_trait::async_trait]
impl Service for PipelineService {
    async fn start(&self) -> Result<()> {
        tracing::info!(plugins = ?self.pipeline.plugin_names(), "Pipeline assembled");
        Ok(())
    }
}

/// Gateway-owned handler for the `users.refresh` subject
///
/// Refresh rotation is token-manager business, so it lives here rather
/// than in a downstream component. The refresh token arrives in the
/// request body, never in the Authorization header.
pub fn spawn_refresh_handler(
    bus: &BusClient,
    tokens: Arc<TokenManager>,
    cancel: CancellationToken,
) {
    let mut subscription = bus.subscribe("users.refresh");
    let bus = bus.clone();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = subscription.next() => match message {
                    Some(message) => message,
                    None => return,
                },
            };
            let refresh_token = message
                .json()
                .ok()
                .and_then(|v| v["payload"]["refresh_token"].as_str().map(str::to_string));

            let (status, body) = match refresh_token {
                Some(token) => match tokens.refresh(&token) {
                    Ok(pair) => (200u16, serde_json::to_value(&pair).unwrap_or_default()),
                    Err(e) => (e.status().as_u16(), e.to_wire()),
                },
                None => {
                    let e = Error::BadPayload {
                        pointer: "/refresh_token".into(),
                        message: "required field is missing".into(),
                    };
                    (e.status().as_u16(), e.to_wire())
                }
            };
            let mut headers = std::collections::BTreeMap::new();
            headers.insert("status".to_string(), status.to_string());
            let payload = serde_json::to_vec(&body).unwrap_or_default();
            if let Err(e) = bus
                .respond_with_headers(&message, headers, payload.into())
                .await
            {
                tracing::debug!(error = %e, "Refresh reply not delivered");
            }
        }
    });
}

/// HTTP adapter as a managed service
pub struct HttpAdapter {
    core: Arc<GatewayCore>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl HttpAdapter {
    pub fn new(core: Arc<GatewayCore>, cancel: CancellationToken) -> Self {
        Self {
            core,
            cancel,
            task: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().await
    }
}

#[async_trait::async_trait]
impl Service for HttpAdapter {
    async fn start(&self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.core.config.api_gateway.host, self.core.config.api_gateway.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind '{}': {}", addr, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("no local addr: {}", e)))?;
        *self.bound.lock().await = Some(bound);
        tracing::info!(addr = %bound, "HTTP adapter listening");

        let router = http_adapter::router(self.core.clone());
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP adapter exited with error");
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn health(&self) -> ComponentHealth {
        match self.task.lock().await.as_ref() {
            Some(handle) if !handle.is_finished() => ComponentHealth::ok(),
            _ => ComponentHealth::down("server task not running"),
        }
    }
}
