//! REST/HTTP adapter
//!
//! Public meta routes (`/handshake`, `/health`, `/docs`, `/openapi.json`)
//! are mounted directly on the router; everything else falls through to
//! the pipeline dispatcher. Unary replies are plain JSON; stream replies
//! go out chunked, one JSON object per line with a final
//! `{"complete":true}` line, or as raw bytes when the producer emits
//! binary frames.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer, cors::CorsLayer, limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::error::{Error, ErrorKind};
use crate::pipeline::{GatewayResponse, ResponseBody, TransportKind};
use crate::streaming::Frame;

use super::{handle_handshake, ws, GatewayCore};

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Aura Gateway</title></head>
<body>
<h1>Aura Gateway</h1>
<p>The machine-readable contract lives at <a href="/openapi.json">/openapi.json</a>.</p>
<p>Protected routes require an encryption session (<code>POST /handshake</code>)
and a bearer token.</p>
</body>
</html>
"#;

/// Build the axum router for the REST + WebSocket front end
///
/// Layers mirror the usual front-door stack: panic recovery innermost,
/// then tracing, body size limit, request timeout (time to first byte,
/// so long streams survive), and CORS outermost.
pub fn router(core: Arc<GatewayCore>) -> Router {
    let body_limit = core.config.api_gateway.body_limit_mb * 1024 * 1024;
    let timeout = core.config.request_timeout();

    Router::new()
        .route("/handshake", post(handshake_handler))
        .route("/health", get(health_handler))
        .route("/openapi.json", get(openapi_handler))
        .route("/docs", get(docs_handler))
        .route("/ws", get(ws::upgrade_handler))
        .fallback(dispatch_handler)
        .with_state(core)
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(timeout))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

async fn handshake_handler(
    State(core): State<Arc<GatewayCore>>,
    body: Bytes,
) -> Response {
    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return Error::BadPayload {
                pointer: "".into(),
                message: "handshake body must be JSON".into(),
            }
            .into_response()
        }
    };
    match handle_handshake(&core, &parsed) {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health_handler(State(core): State<Arc<GatewayCore>>) -> Response {
    let rollup = core.health().await;
    let status = if rollup["status"] == "down" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(rollup)).into_response()
}

async fn openapi_handler(State(core): State<Arc<GatewayCore>>) -> Response {
    Json(core.routes.openapi()).into_response()
}

async fn docs_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        DOCS_HTML,
    )
        .into_response()
}

/// Everything that is not a meta route runs the pipeline
async fn dispatch_handler(State(core): State<Arc<GatewayCore>>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());

    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parse_query(parts.uri.query().unwrap_or(""));
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let limit = core.config.api_gateway.body_limit_mb * 1024 * 1024;
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Error::BadPayload {
                pointer: "".into(),
                message: "request body too large or unreadable".into(),
            }
            .into_response()
        }
    };
    let payload = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                return Error::BadPayload {
                    pointer: "".into(),
                    message: "request body must be JSON".into(),
                }
                .into_response()
            }
        }
    };

    let mut ctx = match core.build_context(
        TransportKind::Http,
        method,
        &path,
        query,
        headers,
        payload,
        peer,
    ) {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    let response = core.dispatch(&mut ctx).await;
    write_response(response).await
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Auth | ErrorKind::Encryption => StatusCode::UNAUTHORIZED,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Upstream => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_line(kind: ErrorKind, message: &str) -> Bytes {
    let wire = serde_json::json!({
        "success": false,
        "error": { "kind": kind.as_str(), "message": message },
    });
    let mut line = serde_json::to_vec(&wire).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

fn chunk_line(seq: u64, data: &serde_json::Value) -> Bytes {
    let mut line =
        serde_json::to_vec(&serde_json::json!({"seq": seq, "data": data})).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

/// Translate a pipeline response into an axum response
pub async fn write_response(response: GatewayResponse) -> Response {
    match response.body {
        ResponseBody::Json(value) => (response.status, Json(value)).into_response(),
        ResponseBody::Empty => response.status.into_response(),
        ResponseBody::Stream(mut stream_body) => {
            // peek so pre-stream failures still get a proper status line
            let first = stream_body.next().await;
            match first {
                None => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/x-ndjson")],
                    Body::from(Bytes::from("{\"complete\":true}\n")),
                )
                    .into_response(),
                Some(Frame::Error { kind, message }) => {
                    let status = status_for_kind(kind);
                    let wire = serde_json::json!({
                        "success": false,
                        "error": { "kind": kind.as_str(), "message": message },
                    });
                    (status, Json(wire)).into_response()
                }
                Some(first) => {
                    let binary = matches!(first, Frame::Binary(_));
                    let content_type = if binary {
                        "application/octet-stream"
                    } else {
                        "application/x-ndjson"
                    };
                    let body_stream = stream::unfold(
                        (Some(first), stream_body),
                        move |(pending, mut inner)| async move {
                            let frame = match pending {
                                Some(frame) => frame,
                                None => inner.next().await?,
                            };
                            let bytes = match frame {
                                Frame::Chunk { seq, data } => chunk_line(seq, &data),
                                Frame::Binary(bytes) => bytes,
                                Frame::Complete => {
                                    if binary {
                                        return None;
                                    }
                                    Bytes::from("{\"complete\":true}\n")
                                }
                                Frame::Error { kind, message } => error_line(kind, &message),
                                Frame::KeepAlive => Bytes::new(),
                            };
                            Some((Ok::<_, Infallible>(bytes), (None, inner)))
                        },
                    );

                    let mut http_response = Response::builder()
                        .status(response.status)
                        .body(Body::from_stream(body_stream))
                        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
                    http_response.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static(content_type),
                    );
                    http_response
                }
            }
        }
    }
}
