//! WebSocket adapter
//!
//! One long-lived channel per client. Every text frame carries the routing
//! envelope; replies echo the frame's correlation id, so a full-duplex
//! client may pipeline requests and match replies in any order. The client
//! id from the first handshake frame is pinned to the connection and
//! reused for subsequent frames that omit an envelope of their own.
//!
//! Stream replies fan out as text frames (`{"correlation_id", "seq",
//! "data"}`), binary chunks as binary messages carrying a 4-byte
//! big-endian length prefix. A mid-stream session invalidation sends the
//! structured error frame and then closes the socket with code 4401.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::pipeline::{GatewayResponse, ResponseBody, TransportKind};
use crate::streaming::Frame;

use super::{handle_handshake, FrameEnvelope, GatewayCore};

/// Close code sent when the encryption session dies mid-stream
pub const CLOSE_SESSION_EXPIRED: u16 = 4401;

/// `GET /ws` upgrade endpoint
pub async fn upgrade_handler(
    State(core): State<Arc<GatewayCore>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(core, socket))
}

/// Per-connection state shared by concurrent frame handlers
struct ConnectionState {
    client_id: Mutex<Option<String>>,
}

async fn handle_socket(core: Arc<GatewayCore>, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    // single writer; frame handlers send through the channel
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || close {
                break;
            }
        }
    });

    let state = Arc::new(ConnectionState {
        client_id: Mutex::new(None),
    });
    let cancel = CancellationToken::new();

    while let Some(Ok(message)) = source.next().await {
        match message {
            Message::Text(text) => {
                let core = core.clone();
                let state = state.clone();
                let tx = tx.clone();
                let frame_cancel = cancel.child_token();
                tokio::spawn(async move {
                    handle_frame(core, state, tx, text.to_string(), frame_cancel).await;
                });
            }
            Message::Close(_) => break,
            // pings are answered by axum; binary requests are not part of
            // the envelope contract
            _ => {}
        }
    }

    cancel.cancel();
    drop(tx);
    let _ = writer.await;
    tracing::debug!("WebSocket connection closed");
}

fn reply_frame(correlation_id: &str, status: u16, body: Option<&serde_json::Value>) -> Message {
    let mut frame = serde_json::json!({
        "correlation_id": correlation_id,
        "status": status,
    });
    if let Some(body) = body {
        frame["body"] = body.clone();
    }
    Message::Text(frame.to_string().into())
}

fn length_prefixed(bytes: &[u8]) -> Message {
    let mut framed = Vec::with_capacity(4 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    framed.extend_from_slice(bytes);
    Message::Binary(framed.into())
}

async fn handle_frame(
    core: Arc<GatewayCore>,
    state: Arc<ConnectionState>,
    tx: mpsc::Sender<Message>,
    text: String,
    cancel: CancellationToken,
) {
    let envelope = match FrameEnvelope::parse(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let _ = tx
                .send(reply_frame(
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

    // handshake and health are adapter-level, like the public HTTP routes
    if envelope.path == "/handshake" {
        let body = envelope.body.clone().unwrap_or(serde_json::Value::Null);
        match handle_handshake(&core, &body) {
            Ok(reply) => {
                *state.client_id.lock().await =
                    reply["client_id"].as_str().map(str::to_string);
                let _ = tx.send(reply_frame(&correlation_id, 200, Some(&reply))).await;
            }
            Err(e) => {
                let _ = tx
                    .send(reply_frame(
                        &correlation_id,
                        e.status().as_u16(),
                        Some(&e.to_wire()),
                    ))
                    .await;
            }
        }
        return;
    }
    if envelope.path == "/health" {
        let rollup = core.health().await;
        let _ = tx.send(reply_frame(&correlation_id, 200, Some(&rollup))).await;
        return;
    }

    let method = match envelope.method() {
        Ok(method) => method,
        Err(e) => {
            let _ = tx
                .send(reply_frame(
                    &correlation_id,
                    e.status().as_u16(),
                    Some(&e.to_wire()),
                ))
                .await;
            return;
        }
    };

    let mut ctx = match core.build_context(
        TransportKind::WebSocket,
        method,
        &envelope.path,
        Default::default(),
        envelope.normalized_headers(),
        envelope.body.clone(),
        None,
    ) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = tx
                .send(reply_frame(
                    &correlation_id,
                    e.status().as_u16(),
                    Some(&e.to_wire()),
                ))
                .await;
            return;
        }
    };
    ctx.correlation_id = correlation_id.clone();
    ctx.client_id = state.client_id.lock().await.clone();
    ctx.cancel = cancel;

    let response = core.dispatch(&mut ctx).await;
    write_response(&tx, &correlation_id, response).await;
}

async fn write_response(
    tx: &mpsc::Sender<Message>,
    correlation_id: &str,
    response: GatewayResponse,
) {
    match response.body {
        ResponseBody::Json(body) => {
            let _ = tx
                .send(reply_frame(
                    correlation_id,
                    response.status.as_u16(),
                    Some(&body),
                ))
                .await;
        }
        ResponseBody::Empty => {
            let _ = tx
                .send(reply_frame(correlation_id, response.status.as_u16(), None))
                .await;
        }
        ResponseBody::Stream(mut stream) => {
            while let Some(frame) = stream.next().await {
                match frame {
                    Frame::Chunk { seq, data } => {
                        let text = serde_json::json!({
                            "correlation_id": correlation_id,
                            "seq": seq,
                            "data": data,
                        });
                        if tx.send(Message::Text(text.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                    Frame::Binary(bytes) => {
                        if tx.send(length_prefixed(&bytes)).await.is_err() {
                            return;
                        }
                    }
                    Frame::Complete => {
                        let text = serde_json::json!({
                            "correlation_id": correlation_id,
                            "complete": true,
                        });
                        let _ = tx.send(Message::Text(text.to_string().into())).await;
                        return;
                    }
                    Frame::Error { kind, message } => {
                        let text = serde_json::json!({
                            "correlation_id": correlation_id,
                            "success": false,
                            "error": { "kind": kind.as_str(), "message": message.clone() },
                        });
                        let _ = tx.send(Message::Text(text.to_string().into())).await;
                        if kind == ErrorKind::Encryption {
                            let _ = tx
                                .send(Message::Close(Some(CloseFrame {
                                    code: CLOSE_SESSION_EXPIRED,
                                    reason: message.into(),
                                })))
                                .await;
                        }
                        return;
                    }
                    Frame::KeepAlive => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http::router;
    use crate::adapters::tests::{test_config, test_core};
    use crate::crypto::handshake::ClientHandshake;
    use crate::crypto::{Direction, EncryptedPayload, PayloadCipher};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use futures::{SinkExt as _, StreamExt as _};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    #[test]
    fn test_reply_frame_shape() {
        let body = serde_json::json!({"ok": true});
        let Message::Text(text) = reply_frame("r1", 200, Some(&body)) else {
            panic!("expected text frame");
        };
        let parsed: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(parsed["correlation_id"], "r1");
        assert_eq!(parsed["status"], 200);
        assert_eq!(parsed["body"]["ok"], true);
    }

    #[test]
    fn test_length_prefix() {
        let Message::Binary(framed) = length_prefixed(&[9u8, 8, 7]) else {
            panic!("expected binary frame");
        };
        assert_eq!(&framed[..4], &3u32.to_be_bytes());
        assert_eq!(&framed[4..], &[9, 8, 7]);
    }

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn connect() -> (Arc<GatewayCore>, WsClient) {
        let core = test_core(test_config()).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(core.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        (core, client)
    }

    async fn send_frame(client: &mut WsClient, value: serde_json::Value) {
        client
            .send(ClientMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn recv_json(client: &mut WsClient) -> serde_json::Value {
        loop {
            match client.next().await.unwrap().unwrap() {
                ClientMessage::Text(text) => {
                    return serde_json::from_str(text.as_str()).unwrap()
                }
                ClientMessage::Ping(_) => continue,
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    async fn ws_handshake(client: &mut WsClient, client_id: &str) -> PayloadCipher {
        let handshake = ClientHandshake::start();
        send_frame(
            client,
            json!({
                "method": "POST",
                "path": "/handshake",
                "correlation_id": "hs",
                "body": {
                    "handshake_request": BASE64.encode(handshake.public_key()),
                    "client_id": client_id,
                },
            }),
        )
        .await;
        let reply = recv_json(client).await;
        assert_eq!(reply["correlation_id"], "hs");
        assert_eq!(reply["status"], 200);
        let server_public: [u8; 32] = BASE64
            .decode(reply["body"]["server_public_key"].as_str().unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        PayloadCipher::new(&handshake.finish(&server_public))
    }

    #[tokio::test]
    async fn test_echo_over_websocket() {
        let (core, mut client) = connect().await;
        let cipher = ws_handshake(&mut client, "c_ws").await;
        let token = core.tokens.mint("user:amy", vec![]).unwrap().access_token;

        let sealed = cipher
            .seal_json(&json!({"message": "over ws"}), "c_ws", Direction::C2S)
            .unwrap();
        send_frame(
            &mut client,
            json!({
                "method": "POST",
                "path": "/echo",
                "correlation_id": "r1",
                "headers": {"Authorization": format!("Bearer {}", token)},
                "body": {"encrypted": true, "client_id": "c_ws", "payload": sealed},
            }),
        )
        .await;

        let reply = recv_json(&mut client).await;
        assert_eq!(reply["correlation_id"], "r1");
        assert_eq!(reply["status"], 200);
        let sealed: EncryptedPayload =
            serde_json::from_value(reply["body"]["payload"].clone()).unwrap();
        let plain = cipher.open_json(&sealed, "c_ws", Direction::S2C).unwrap();
        assert_eq!(plain["message"], "over ws");
    }

    #[tokio::test]
    async fn test_duplex_replies_match_by_correlation_id() {
        let (core, mut client) = connect().await;
        let cipher = ws_handshake(&mut client, "c_ws").await;
        let token = core.tokens.mint("user:amy", vec![]).unwrap().access_token;

        for id in ["first", "second"] {
            let sealed = cipher
                .seal_json(&json!({"message": id}), "c_ws", Direction::C2S)
                .unwrap();
            send_frame(
                &mut client,
                json!({
                    "method": "POST",
                    "path": "/echo",
                    "correlation_id": id,
                    "headers": {"Authorization": format!("Bearer {}", token)},
                    "body": {"encrypted": true, "client_id": "c_ws", "payload": sealed},
                }),
            )
            .await;
        }

        // replies may arrive in any order; match them by id
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let reply = recv_json(&mut client).await;
            assert_eq!(reply["status"], 200);
            let id = reply["correlation_id"].as_str().unwrap().to_string();
            let sealed: EncryptedPayload =
                serde_json::from_value(reply["body"]["payload"].clone()).unwrap();
            let plain = cipher.open_json(&sealed, "c_ws", Direction::S2C).unwrap();
            assert_eq!(plain["message"], id.as_str());
            seen.insert(id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_binary_stream_with_length_prefix() {
        let (core, mut client) = connect().await;

        let mut tts = core.bus.subscribe("tts.synthesize");
        let tts_bus = core.bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = tts.next().await {
                let producer = crate::streaming::StreamProducer::new(tts_bus.clone(), msg);
                producer.binary(vec![0x42u8; 16]).await.unwrap();
                producer.complete().await.unwrap();
            }
        });

        let cipher = ws_handshake(&mut client, "c_ws").await;
        let token = core.tokens.mint("user:amy", vec![]).unwrap().access_token;
        let sealed = cipher
            .seal_json(&json!({"text": "hi"}), "c_ws", Direction::C2S)
            .unwrap();
        send_frame(
            &mut client,
            json!({
                "method": "POST",
                "path": "/tts/synthesize",
                "correlation_id": "s1",
                "headers": {"Authorization": format!("Bearer {}", token)},
                "body": {"encrypted": true, "client_id": "c_ws", "payload": sealed},
            }),
        )
        .await;

        let ClientMessage::Binary(framed) = client.next().await.unwrap().unwrap() else {
            panic!("expected binary frame");
        };
        assert_eq!(&framed[..4], &16u32.to_be_bytes());
        assert_eq!(&framed[4..], &[0x42u8; 16][..]);

        let complete = recv_json(&mut client).await;
        assert_eq!(complete["correlation_id"], "s1");
        assert_eq!(complete["complete"], true);
    }

    #[tokio::test]
    async fn test_session_error_closes_with_code() {
        let (core, mut client) = connect().await;

        let mut tts = core.bus.subscribe("tts.synthesize");
        let tts_bus = core.bus.clone();
        let sessions = core.sessions.clone();
        tokio::spawn(async move {
            while let Some(msg) = tts.next().await {
                let producer = crate::streaming::StreamProducer::new(tts_bus.clone(), msg);
                producer.chunk(json!({"word": "hi"})).await.unwrap();
                // let the first chunk clear the gateway before the session dies
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                sessions.invalidate("c_ws");
                let _ = producer.chunk(json!({"word": "there"})).await;
            }
        });

        let cipher = ws_handshake(&mut client, "c_ws").await;
        let token = core.tokens.mint("user:amy", vec![]).unwrap().access_token;
        let sealed = cipher
            .seal_json(&json!({"text": "hi"}), "c_ws", Direction::C2S)
            .unwrap();
        send_frame(
            &mut client,
            json!({
                "method": "POST",
                "path": "/tts/synthesize",
                "correlation_id": "s1",
                "headers": {"Authorization": format!("Bearer {}", token)},
                "body": {"encrypted": true, "client_id": "c_ws", "payload": sealed},
            }),
        )
        .await;

        // first chunk arrives encrypted
        let chunk = recv_json(&mut client).await;
        assert_eq!(chunk["data"]["encrypted"], true);

        // then the structured error, then a close with the session code
        let error = recv_json(&mut client).await;
        assert_eq!(error["error"]["kind"], "encryption");
        assert!(error["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Encryption session"));

        match client.next().await.unwrap().unwrap() {
            ClientMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_SESSION_EXPIRED);
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}

