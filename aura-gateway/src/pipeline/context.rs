//! Request context and response model
//!
//! One [`RequestContext`] is built per request by the owning adapter and
//! moves through the pipeline stages in turn. Plugins attach fields (the
//! decrypted payload, the caller identity) but never remove them; the
//! context dies when the response has been written or the error path ran.

use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::Claims;
use crate::error::Error;
use crate::routes::Route;
use crate::streaming::{ResponseStream, SecureStream};

/// Transport the request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
    Ipc,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Ipc => "ipc",
        }
    }
}

/// Per-request state owned by one pipeline run
#[derive(Debug)]
pub struct RequestContext {
    /// Unique per request; echoed in logs and internal errors
    pub correlation_id: String,

    /// Wall-clock arrival time
    pub received_at: DateTime<Utc>,

    /// Monotonic arrival time for latency accounting
    pub started: Instant,

    /// Opaque client identifier; pinned by the connection or taken from
    /// the encryption envelope
    pub client_id: Option<String>,

    pub transport: TransportKind,
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,

    /// Header map with lowercased names
    pub headers: HashMap<String, String>,

    /// Body exactly as it arrived (JSON), before any decryption
    pub raw_payload: Option<serde_json::Value>,

    /// Decrypted payload; set by the encryption plugin
    pub payload: Option<serde_json::Value>,

    /// Caller identity; set by the auth plugin
    pub identity: Option<Claims>,

    /// Resolved route and its path parameters
    pub route: Arc<Route>,
    pub path_params: HashMap<String, String>,

    /// Remote peer (socket address or peer uid), used as the rate-limit
    /// fallback key before a client id exists
    pub peer: Option<String>,

    /// Set by the IPC adapter when the peer-uid check passed and the
    /// deployment waived bearer auth for local processes
    pub auth_exempt: bool,

    /// Fired when the client goes away or the adapter shuts down
    pub cancel: CancellationToken,

    /// Absolute deadline for unary requests
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(transport: TransportKind, method: Method, path: impl Into<String>, route: Arc<Route>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            started: Instant::now(),
            client_id: None,
            transport,
            method,
            path: path.into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            raw_payload: None,
            payload: None,
            identity: None,
            route,
            path_params: HashMap::new(),
            peer: None,
            auth_exempt: false,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Case-insensitive header lookup (names are stored lowercased)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Time left until the deadline; `None` when no deadline is set
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Identity string for rate limiting: caller identity, then client id,
    /// then transport peer
    pub fn rate_limit_key(&self) -> String {
        if let Some(identity) = &self.identity {
            return format!("id:{}", identity.sub);
        }
        if let Some(client_id) = &self.client_id {
            return format!("client:{}", client_id);
        }
        match &self.peer {
            Some(peer) => format!("peer:{}", peer),
            None => "anonymous".to_string(),
        }
    }
}

/// Response stream in plain or re-encrypting form
///
/// The encryption plugin upgrades `Plain` to `Secure` on protected routes;
/// adapters drain either through the same `next()` surface.
pub enum StreamBody {
    Plain(ResponseStream),
    Secure(SecureStream),
}

impl StreamBody {
    pub async fn next(&mut self) -> Option<crate::streaming::Frame> {
        match self {
            Self::Plain(stream) => stream.next().await,
            Self::Secure(stream) => stream.next().await,
        }
    }
}

/// Response body variants the adapters know how to write
pub enum ResponseBody {
    Json(serde_json::Value),
    Stream(StreamBody),
    Empty,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

/// Transport-agnostic response produced by the pipeline
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub body: ResponseBody,
    /// Taxonomy code when this response is an error, for adapters that
    /// need more than the status (WS close codes)
    pub error_code: Option<&'static str>,
}

impl GatewayResponse {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: ResponseBody::Json(value),
            error_code: None,
        }
    }

    pub fn stream(stream: ResponseStream) -> Self {
        Self {
            status: StatusCode::OK,
            body: ResponseBody::Stream(StreamBody::Plain(stream)),
            error_code: None,
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Self {
            status: error.status(),
            body: ResponseBody::Json(error.to_wire()),
            error_code: Some(error.code()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some() || !self.status.is_success()
    }
}
