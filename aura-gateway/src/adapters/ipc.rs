//! IPC adapter: Unix domain socket front end
//!
//! Frames are newline-delimited JSON using the same routing envelope as
//! the WebSocket adapter. Binary stream chunks are announced with a
//! `{"correlation_id", "binary": <len>}` line followed by exactly that
//! many raw bytes.
//!
//! Peers are checked against the process uid via `SO_PEERCRED` before any
//! frame is read. Bearer auth still applies on top unless the deployment
//! sets `api_gateway.ipc.require_bearer = false`, in which case the
//! uid check alone authenticates local callers.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::{ComponentHealth, Service};
use crate::error::{Error, Result};
use crate::pipeline::{GatewayResponse, ResponseBody, TransportKind};
use crate::streaming::Frame;

use super::{handle_handshake, FrameEnvelope, GatewayCore};

/// Local socket adapter, managed by the service container
pub struct IpcAdapter {
    core: Arc<GatewayCore>,
    socket_path: PathBuf,
    require_bearer: bool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcAdapter {
    pub fn new(core: Arc<GatewayCore>) -> Self {
        let ipc = core.config.api_gateway.ipc.clone();
        Self {
            core,
            socket_path: ipc.socket_path,
            require_bearer: ipc.require_bearer,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Service for IpcAdapter {
    async fn start(&self) -> Result<()> {
        // a stale socket file from a previous run blocks bind
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            Error::Internal(format!(
                "failed to bind IPC socket '{}': {}",
                self.socket_path.display(),
                e
            ))
        })?;
        tracing::info!(path = %self.socket_path.display(), "IPC adapter listening");

        let core = self.core.clone();
        let cancel = self.cancel.clone();
        let require_bearer = self.require_bearer;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let core = core.clone();
                                let conn_cancel = cancel.child_token();
                                tokio::spawn(async move {
                                    handle_connection(core, stream, require_bearer, conn_cancel)
                                        .await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "IPC accept failed");
                            }
                        }
                    }
                }
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
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn health(&self) -> ComponentHealth {
        match self.task.lock().await.as_ref() {
            Some(handle) if !handle.is_finished() => ComponentHealth::ok(),
            _ => ComponentHealth::down("accept loop not running"),
        }
    }
}

async fn handle_connection(
    core: Arc<GatewayCore>,
    stream: UnixStream,
    require_bearer: bool,
    cancel: CancellationToken,
) {
    let peer_uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            tracing::warn!(error = %e, "IPC peer credentials unavailable, dropping connection");
            return;
        }
    };
    let own_uid = unsafe { libc::getuid() };
    if peer_uid != own_uid {
        tracing::warn!(peer_uid, own_uid, "IPC peer uid mismatch, dropping connection");
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(write_loop(write_half, rx));

    // client id pinned by the first handshake on this connection
    let pinned_client = Arc::new(Mutex::new(None::<String>));

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let core = core.clone();
        let tx = tx.clone();
        let frame_cancel = cancel.child_token();
        let peer = format!("uid:{}", peer_uid);
        let pinned = pinned_client.clone();
        tokio::spawn(async move {
            handle_frame(core, tx, line, peer, pinned, require_bearer, frame_cancel).await;
        });
    }

    drop(tx);
    let _ = writer.await;
    tracing::debug!("IPC connection closed");
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(message) = rx.recv().await {
        if write_half.write_all(&message).await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

fn reply_line(correlation_id: &str, status: u16, body: Option<&serde_json::Value>) -> Vec<u8> {
    let mut frame = serde_json::json!({
        "correlation_id": correlation_id,
        "status": status,
    });
    if let Some(body) = body {
        frame["body"] = body.clone();
    }
    let mut line = frame.to_string().into_bytes();
    line.push(b'\n');
    line
}

async fn handle_frame(
    core: Arc<GatewayCore>,
    tx: mpsc::Sender<Vec<u8>>,
    line: String,
    peer: String,
    pinned_client: Arc<Mutex<Option<String>>>,
    require_bearer: bool,
    cancel: CancellationToken,
) {
    let envelope = match FrameEnvelope::parse(&line) {
        Ok(envelope) => envelope,
        Err(e) => {
            let _ = tx
                .send(reply_line(
                    &Uuid::new_v4().to_string(),
                    e.status().as_u16(),
                    Some(&e.to_wire()),
                ))
                .await;
            return;
        }
    };
    let correlation_id = envelope
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if envelope.path == "/handshake" {
        let body = envelope.body.clone().unwrap_or(serde_json::Value::Null);
        let reply = match handle_handshake(&core, &body) {
            Ok(reply) => {
                *pinned_client.lock().await =
                    reply["client_id"].as_str().map(str::to_string);
                reply_line(&correlation_id, 200, Some(&reply))
            }
            Err(e) => reply_line(&correlation_id, e.status().as_u16(), Some(&e.to_wire())),
        };
        let _ = tx.send(reply).await;
        return;
    }
    if envelope.path == "/health" {
        let rollup = core.health().await;
        let _ = tx.send(reply_line(&correlation_id, 200, Some(&rollup))).await;
        return;
    }

    let method = match envelope.method() {
        Ok(method) => method,
        Err(e) => {
            let _ = tx
                .send(reply_line(
                    &correlation_id,
                    e.status().as_u16(),
                    Some(&e.to_wire()),
                ))
                .await;
            return;
        }
    };

    let mut ctx = match core.build_context(
        TransportKind::Ipc,
        method,
        &envelope.path,
        Default::default(),
        envelope.normalized_headers(),
        envelope.body.clone(),
        Some(peer),
    ) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = tx
                .send(reply_line(
                    &correlation_id,
                    e.status().as_u16(),
                    Some(&e.to_wire()),
                ))
                .await;
            return;
        }
    };
    ctx.correlation_id = correlation_id.clone();
    ctx.client_id = pinned_client.lock().await.clone();
    ctx.auth_exempt = !require_bearer;
    ctx.cancel = cancel;

    let response = core.dispatch(&mut ctx).await;
    write_response(&tx, &correlation_id, response).await;
}

async fn write_response(
    tx: &mpsc::Sender<Vec<u8>>,
    correlation_id: &str,
    response: GatewayResponse,
) {
    match response.body {
        ResponseBody::Json(body) => {
            let _ = tx
                .send(reply_line(
                    correlation_id,
                    response.status.as_u16(),
                    Some(&body),
                ))
                .await;
        }
        ResponseBody::Empty => {
            let _ = tx
                .send(reply_line(correlation_id, response.status.as_u16(), None))
                .await;
        }
        ResponseBody::Stream(mut stream) => {
            while let Some(frame) = stream.next().await {
                let message = match frame {
                    Frame::Chunk { seq, data } => {
                        let mut line = serde_json::json!({
                            "correlation_id": correlation_id,
                            "seq": seq,
                            "data": data,
                        })
                        .to_string()
                        .into_bytes();
                        line.push(b'\n');
                        line
                    }
                    Frame::Binary(bytes) => {
                        // announcement line, then the raw bytes
                        let mut message = serde_json::json!({
                            "correlation_id": correlation_id,
                            "binary": bytes.len(),
                        })
                        .to_string()
                        .into_bytes();
                        message.push(b'\n');
                        message.extend_from_slice(&bytes);
                        message
                    }
                    Frame::Complete => {
                        let mut line = serde_json::json!({
                            "correlation_id": correlation_id,
                            "complete": true,
                        })
                        .to_string()
                        .into_bytes();
                        line.push(b'\n');
                        let _ = tx.send(line).await;
                        return;
                    }
                    Frame::Error { kind, message } => {
                        let mut line = serde_json::json!({
                            "correlation_id": correlation_id,
                            "success": false,
                            "error": { "kind": kind.as_str(), "message": message },
                        })
                        .to_string()
                        .into_bytes();
                        line.push(b'\n');
                        let _ = tx.send(line).await;
                        return;
                    }
                    Frame::KeepAlive => continue,
                };
                if tx.send(message).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tests::{test_config, test_core};
    use crate::crypto::handshake::ClientHandshake;
    use crate::crypto::{Direction, EncryptedPayload, PayloadCipher};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    struct TestAdapter {
        core: Arc<GatewayCore>,
        adapter: IpcAdapter,
        socket_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn start_adapter(require_bearer: bool) -> TestAdapter {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("gateway.sock");

        let mut config = test_config();
        config.api_gateway.ipc.socket_path = socket_path.clone();
        config.api_gateway.ipc.require_bearer = require_bearer;
        let core = test_core(config).await;
        let adapter = IpcAdapter::new(core.clone());
        adapter.start().await.unwrap();
        TestAdapter {
            core,
            adapter,
            socket_path,
            _dir: dir,
        }
    }

    async fn send_line(stream: &mut UnixStream, value: &serde_json::Value) {
        let mut line = value.to_string().into_bytes();
        line.push(b'\n');
        stream.write_all(&line).await.unwrap();
    }

    async fn read_json_line(reader: &mut BufReader<UnixStream>) -> serde_json::Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn ipc_handshake(
        reader: &mut BufReader<UnixStream>,
        client_id: &str,
    ) -> PayloadCipher {
        let client = ClientHandshake::start();
        send_line(
            reader.get_mut(),
            &json!({
                "method": "POST",
                "path": "/handshake",
                "body": {
                    "handshake_request": BASE64.encode(client.public_key()),
                    "client_id": client_id,
                },
            }),
        )
        .await;
        let reply = read_json_line(reader).await;
        assert_eq!(reply["status"], 200);
        let server_public: [u8; 32] = BASE64
            .decode(reply["body"]["server_public_key"].as_str().unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        PayloadCipher::new(&client.finish(&server_public))
    }

    #[tokio::test]
    async fn test_echo_over_ipc_without_bearer() {
        let t = start_adapter(false).await;
        let stream = UnixStream::connect(&t.socket_path).await.unwrap();
        let mut reader = BufReader::new(stream);

        let cipher = ipc_handshake(&mut reader, "c_ipc").await;
        let sealed = cipher
            .seal_json(&json!({"message": "local"}), "c_ipc", Direction::C2S)
            .unwrap();
        send_line(
            reader.get_mut(),
            &json!({
                "method": "POST",
                "path": "/echo",
                "correlation_id": "r1",
                "body": {"encrypted": true, "client_id": "c_ipc", "payload": sealed},
            }),
        )
        .await;

        let reply = read_json_line(&mut reader).await;
        assert_eq!(reply["correlation_id"], "r1");
        assert_eq!(reply["status"], 200);
        let sealed: EncryptedPayload =
            serde_json::from_value(reply["body"]["payload"].clone()).unwrap();
        let plain = cipher.open_json(&sealed, "c_ipc", Direction::S2C).unwrap();
        assert_eq!(plain["message"], "local");

        t.adapter.stop().await.unwrap();
        assert!(!t.socket_path.exists());
    }

    #[tokio::test]
    async fn test_bearer_still_required_by_default() {
        let t = start_adapter(true).await;
        let stream = UnixStream::connect(&t.socket_path).await.unwrap();
        let mut reader = BufReader::new(stream);

        let cipher = ipc_handshake(&mut reader, "c_ipc").await;
        let sealed = cipher
            .seal_json(&json!({"message": "x"}), "c_ipc", Direction::C2S)
            .unwrap();

        // no Authorization header in the envelope
        send_line(
            reader.get_mut(),
            &json!({
                "method": "POST",
                "path": "/echo",
                "correlation_id": "r1",
                "body": {"encrypted": true, "client_id": "c_ipc", "payload": sealed},
            }),
        )
        .await;
        let reply = read_json_line(&mut reader).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["body"]["error"]["kind"], "auth");

        // with a bearer it goes through
        let token = t.core.tokens.mint("user:amy", vec![]).unwrap().access_token;
        let sealed = cipher
            .seal_json(&json!({"message": "x"}), "c_ipc", Direction::C2S)
            .unwrap();
        send_line(
            reader.get_mut(),
            &json!({
                "method": "POST",
                "path": "/echo",
                "correlation_id": "r2",
                "headers": {"Authorization": format!("Bearer {}", token)},
                "body": {"encrypted": true, "client_id": "c_ipc", "payload": sealed},
            }),
        )
        .await;
        let reply = read_json_line(&mut reader).await;
        assert_eq!(reply["status"], 200);

        t.adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_binary_stream_over_ipc() {
        let t = start_adapter(false).await;

        let mut tts = t.core.bus.subscribe("tts.synthesize");
        let tts_bus = t.core.bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = tts.next().await {
                let producer = crate::streaming::StreamProducer::new(tts_bus.clone(), msg);
                producer.binary(vec![0xaau8; 32]).await.unwrap();
                producer.complete().await.unwrap();
            }
        });

        let stream = UnixStream::connect(&t.socket_path).await.unwrap();
        let mut reader = BufReader::new(stream);
        let cipher = ipc_handshake(&mut reader, "c_tts").await;
        let sealed = cipher
            .seal_json(&json!({"text": "hi"}), "c_tts", Direction::C2S)
            .unwrap();
        send_line(
            reader.get_mut(),
            &json!({
                "method": "POST",
                "path": "/tts/synthesize",
                "correlation_id": "s1",
                "body": {"encrypted": true, "client_id": "c_tts", "payload": sealed},
            }),
        )
        .await;

        let announcement = read_json_line(&mut reader).await;
        assert_eq!(announcement["correlation_id"], "s1");
        let len = announcement["binary"].as_u64().unwrap() as usize;
        assert_eq!(len, 32);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, vec![0xaau8; 32]);

        let complete = read_json_line(&mut reader).await;
        assert_eq!(complete["complete"], true);

        t.adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_line() {
        let t = start_adapter(false).await;
        let mut stream = UnixStream::connect(&t.socket_path).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let reply = read_json_line(&mut reader).await;
        assert_eq!(reply["body"]["success"], false);
        t.adapter.stop().await.unwrap();
    }
}
