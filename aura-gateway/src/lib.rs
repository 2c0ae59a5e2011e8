//! # aura-gateway
//!
//! Backend API gateway core for the Aura companion platform: multi-transport
//! connection handling with a uniform security pipeline per request.
//!
//! ## What lives here
//!
//! - **Protocol adapters**: REST + WebSocket (axum) and a Unix-socket IPC
//!   front end, all driving the same plugin pipeline
//! - **End-to-end encryption**: per-client X25519 handshake sessions,
//!   XChaCha20-Poly1305 payload envelopes on every protected route
//! - **Auth**: short-lived bearer tokens with rotation and a proactive
//!   background refresh client
//! - **Plugin pipeline**: encryption, auth, rate limiting, validation and
//!   routing stages in a fixed priority order
//! - **In-process message bus**: pub/sub and request/reply between the
//!   gateway and internal handlers, including reply streams
//! - **Streaming**: chunked JSON and binary frames with mid-stream
//!   session-invalidation semantics
//! - **Service container + lifecycle**: ordered startup/shutdown and one
//!   health rollup
//! - **Encrypted log store**: crash-safe batched persistence of structured
//!   log events
//!
//! ## Example
//!
//! ```rust,no_run
//! use aura_gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let gateway = Gateway::build(config).await?;
//!     gateway.run().await
//! }
//! ```

pub mod adapters;
pub mod bus;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod logstore;
pub mod observability;
pub mod pipeline;
pub mod routes;
pub mod session;
pub mod streaming;
pub mod token;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapters::GatewayCore;
    pub use crate::bus::{BusClient, BusMessage, Subscription};
    pub use crate::config::{Config, ConfigStore};
    pub use crate::container::{ComponentHealth, Service, ServiceContainer, ServiceState};
    pub use crate::crypto::{Claims, Direction, EncryptedPayload, PayloadCipher, TokenKind};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::lifecycle::Gateway;
    pub use crate::logstore::{LogConsumer, LogEvent, LogStore, LOG_SUBJECT};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        GatewayResponse, Pipeline, Plugin, PluginFlow, RequestContext, TransportKind,
    };
    pub use crate::routes::{FieldKind, PayloadContract, Route, RouteKind, RouteTable};
    pub use crate::session::SessionManager;
    pub use crate::streaming::{Frame, StreamProducer};
    pub use crate::token::{TokenClient, TokenManager, TokenPair};

    pub use tokio_util::sync::CancellationToken;
}
