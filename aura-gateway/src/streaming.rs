//! Streaming engine: lazy frame sequences between handlers and adapters
//!
//! Two modes share one frame model: chunked JSON (each chunk carries a
//! monotonic sequence number, a final `complete` marker ends the stream)
//! and binary (raw bytes; adapters length-prefix them on WS/IPC and rely
//! on chunked transfer encoding over HTTP).
//!
//! A `complete` marker is final: the producer helper discards anything
//! sent after it and the consumer stops reading at it, so the marker is
//! idempotent from both ends. Mid-stream failures travel as a single
//! structured error frame; earlier chunks are never retracted.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusClient, BusMessage, StreamSubscription};
use crate::error::{Error, ErrorKind, Result};
use crate::session::SessionManager;

const HDR_FRAME: &str = "frame";
const HDR_SEQ: &str = "seq";
const HDR_ERROR_KIND: &str = "error-kind";

/// Message shown to clients when the session disappears mid-stream
pub const SESSION_EXPIRED_MESSAGE: &str = "Encryption session expired";

/// One frame of a streaming response
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Chunked JSON with a monotonically increasing sequence number
    Chunk { seq: u64, data: serde_json::Value },

    /// Raw binary bytes (audio and similar)
    Binary(Bytes),

    /// Terminal success marker
    Complete,

    /// Terminal structured error
    Error { kind: ErrorKind, message: String },

    /// Liveness signal on otherwise idle streams; never reaches clients
    KeepAlive,
}

impl Frame {
    /// Encode for transport over a bus inbox
    pub fn into_bus_parts(self) -> (BTreeMap<String, String>, Bytes) {
        let mut headers = BTreeMap::new();
        match self {
            Frame::Chunk { seq, data } => {
                headers.insert(HDR_FRAME.into(), "chunk".into());
                headers.insert(HDR_SEQ.into(), seq.to_string());
                let payload = serde_json::to_vec(&data).unwrap_or_default();
                (headers, Bytes::from(payload))
            }
            Frame::Binary(bytes) => {
                headers.insert(HDR_FRAME.into(), "binary".into());
                (headers, bytes)
            }
            Frame::Complete => {
                headers.insert(HDR_FRAME.into(), "complete".into());
                (headers, Bytes::new())
            }
            Frame::Error { kind, message } => {
                headers.insert(HDR_FRAME.into(), "error".into());
                headers.insert(HDR_ERROR_KIND.into(), kind.as_str().into());
                (headers, Bytes::from(message.into_bytes()))
            }
            Frame::KeepAlive => {
                headers.insert(HDR_FRAME.into(), "keepalive".into());
                (headers, Bytes::new())
            }
        }
    }

    /// Decode from a bus inbox message
    pub fn from_bus(message: &BusMessage) -> Result<Frame> {
        let tag = message
            .headers
            .get(HDR_FRAME)
            .map(String::as_str)
            .unwrap_or("chunk");
        match tag {
            "chunk" => {
                let seq = message
                    .headers
                    .get(HDR_SEQ)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                Ok(Frame::Chunk {
                    seq,
                    data: message.json()?,
                })
            }
            "binary" => Ok(Frame::Binary(message.payload.clone())),
            "complete" => Ok(Frame::Complete),
            "error" => {
                let kind = match message.headers.get(HDR_ERROR_KIND).map(String::as_str) {
                    Some("auth") => ErrorKind::Auth,
                    Some("validation") => ErrorKind::Validation,
                    Some("ratelimit") => ErrorKind::RateLimit,
                    Some("encryption") => ErrorKind::Encryption,
                    Some("upstream") => ErrorKind::Upstream,
                    _ => ErrorKind::Internal,
                };
                Ok(Frame::Error {
                    kind,
                    message: String::from_utf8_lossy(&message.payload).into_owned(),
                })
            }
            "keepalive" => Ok(Frame::KeepAlive),
            other => Err(Error::Internal(format!("unknown frame tag '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Complete | Frame::Error { .. })
    }
}

/// Handler-side stream producer
///
/// Assigns sequence numbers, discards frames after the terminal marker and
/// keeps the stream alive while the producer is quiet.
pub struct StreamProducer {
    bus: BusClient,
    request: BusMessage,
    state: Arc<Mutex<ProducerState>>,
    keepalive_cancel: CancellationToken,
}

struct ProducerState {
    seq: u64,
    finished: bool,
    last_send: tokio::time::Instant,
}

impl StreamProducer {
    /// Wrap a stream request; spawns the keep-alive task
    pub fn new(bus: BusClient, request: BusMessage) -> Self {
        let keepalive = Duration::from_secs(bus.config().stream_keepalive_secs.max(1));
        let state = Arc::new(Mutex::new(ProducerState {
            seq: 0,
            finished: false,
            last_send: tokio::time::Instant::now(),
        }));
        let cancel = CancellationToken::new();

        let task_bus = bus.clone();
        let task_request = request.clone();
        let task_state = state.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let idle = {
                    let state = task_state.lock().await;
                    if state.finished {
                        return;
                    }
                    state.last_send.elapsed() >= keepalive
                };
                if idle {
                    let (headers, payload) = Frame::KeepAlive.into_bus_parts();
                    if task_bus
                        .respond_with_headers(&task_request, headers, payload)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });

        Self {
            bus,
            request,
            state,
            keepalive_cancel: cancel,
        }
    }

    async fn emit(&self, frame: Frame) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.finished {
            // complete already went out; silently discard
            return Ok(());
        }
        let frame = match frame {
            Frame::Chunk { data, .. } => {
                state.seq += 1;
                Frame::Chunk {
                    seq: state.seq,
                    data,
                }
            }
            other => other,
        };
        if frame.is_terminal() {
            state.finished = true;
        }
        state.last_send = tokio::time::Instant::now();
        let (headers, payload) = frame.into_bus_parts();
        self.bus
            .respond_with_headers(&self.request, headers, payload)
            .await
    }

    /// Send one JSON chunk
    pub async fn chunk(&self, data: serde_json::Value) -> Result<()> {
        self.emit(Frame::Chunk { seq: 0, data }).await
    }

    /// Send raw binary bytes
    pub async fn binary(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.emit(Frame::Binary(bytes.into())).await
    }

    /// Terminate the stream successfully; later sends are discarded
    pub async fn complete(&self) -> Result<()> {
        self.emit(Frame::Complete).await
    }

    /// Terminate the stream with a structured error
    pub async fn error(&self, kind: ErrorKind, message: impl Into<String>) -> Result<()> {
        self.emit(Frame::Error {
            kind,
            message: message.into(),
        })
        .await
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        self.keepalive_cancel.cancel();
    }
}

/// Gateway-side view of a reply stream
///
/// Filters keep-alives, enforces the idle timeout and stops at the first
/// terminal frame no matter what the producer does afterwards.
pub struct ResponseStream {
    sub: StreamSubscription,
    idle_timeout: Duration,
    done: bool,
}

impl ResponseStream {
    pub fn new(sub: StreamSubscription, idle_timeout: Duration) -> Self {
        Self {
            sub,
            idle_timeout,
            done: false,
        }
    }

    /// Next client-visible frame; `None` after the terminal frame
    pub async fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        loop {
            match tokio::time::timeout(self.idle_timeout, self.sub.next()).await {
                Err(_) => {
                    self.done = true;
                    return Some(Frame::Error {
                        kind: ErrorKind::Upstream,
                        message: "stream idle timeout".into(),
                    });
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Ok(Some(message)) => match Frame::from_bus(&message) {
                    Ok(Frame::KeepAlive) => continue,
                    Ok(frame) => {
                        if frame.is_terminal() {
                            self.done = true;
                        }
                        return Some(frame);
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Frame::Error {
                            kind: ErrorKind::Internal,
                            message: e.to_string(),
                        });
                    }
                },
            }
        }
    }
}

/// Adapter-side wrapper re-encrypting protected streams per frame
///
/// Consults the session manager at emit time, so a session invalidated
/// behind the producer's back surfaces as exactly one structured error
/// frame and the stream stops.
pub struct SecureStream {
    inner: ResponseStream,
    sessions: Arc<SessionManager>,
    client_id: String,
    done: bool,
}

impl SecureStream {
    pub fn new(inner: ResponseStream, sessions: Arc<SessionManager>, client_id: String) -> Self {
        Self {
            inner,
            sessions,
            client_id,
            done: false,
        }
    }

    fn session_expired(&mut self) -> Option<Frame> {
        self.done = true;
        self.sessions.invalidate(&self.client_id);
        Some(Frame::Error {
            kind: ErrorKind::Encryption,
            message: SESSION_EXPIRED_MESSAGE.into(),
        })
    }

    pub async fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let frame = self.inner.next().await?;
        match frame {
            Frame::Chunk { seq, data } => {
                match self.sessions.encrypt_response(&self.client_id, &data) {
                    Ok(sealed) => Some(Frame::Chunk {
                        seq,
                        data: serde_json::json!({
                            "encrypted": true,
                            "client_id": self.client_id,
                            "payload": sealed,
                        }),
                    }),
                    Err(_) => self.session_expired(),
                }
            }
            Frame::Binary(bytes) => {
                // binary chunks travel raw, but the session must still be live
                if self.sessions.get(&self.client_id).is_none() {
                    return self.session_expired();
                }
                Some(Frame::Binary(bytes))
            }
            terminal => {
                self.done = true;
                Some(terminal)
            }
        }
    }
}
