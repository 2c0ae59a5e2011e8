//! In-process message bus: pub/sub fan-out plus request/reply
//!
//! Subjects are hierarchical strings (`"users.authenticate"`,
//! `"logs.entries.v1"`) matched exactly. Fan-out subscriptions sit on
//! bounded queues; a slow subscriber loses the oldest messages and gets a
//! warning rather than stalling publishers. Request/reply runs over
//! point-to-point inbox subjects with correlation ids; reply streams use a
//! bounded channel whose backpressure blocks the producer.
//!
//! Within a single publisher and subject, subscribers observe messages in
//! publish order; nothing is promised across subjects.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::error::{Error, Result};

const INBOX_PREFIX: &str = "_inbox.";

/// One message on the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,

    /// Inbox subject to reply on, set for request/reply traffic
    pub reply: Option<String>,

    /// Correlates replies (and stream frames) with their request
    pub correlation_id: String,

    /// Small string headers; the streaming frame codec lives here
    pub headers: BTreeMap<String, String>,

    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            correlation_id: Uuid::new_v4().to_string(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Parse the payload as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Internal(format!("bus payload is not JSON: {}", e)))
    }
}

enum InboxSlot {
    Oneshot(oneshot::Sender<BusMessage>),
    Stream(mpsc::Sender<BusMessage>),
}

struct BusInner {
    subjects: DashMap<String, broadcast::Sender<BusMessage>>,
    inboxes: DashMap<String, InboxSlot>,
    config: BusConfig,
}

/// Handle to the in-process bus; cheap to clone
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<BusInner>,
}

impl BusClient {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subjects: DashMap::new(),
                inboxes: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Fan-out publish; returns how many subscribers observed the message
    pub async fn publish(&self, message: BusMessage) -> Result<usize> {
        if message.subject.starts_with(INBOX_PREFIX) {
            return self.deliver_to_inbox(message).await;
        }

        let Some(sender) = self
            .inner
            .subjects
            .get(&message.subject)
            .map(|s| s.clone())
        else {
            return Ok(0);
        };
        // broadcast::send only errors with zero receivers
        Ok(sender.send(message).unwrap_or(0))
    }

    /// Publish a JSON value
    pub async fn publish_json(
        &self,
        subject: impl Into<String>,
        value: &serde_json::Value,
    ) -> Result<usize> {
        let payload = serde_json::to_vec(value)?;
        self.publish(BusMessage::new(subject, payload)).await
    }

    async fn deliver_to_inbox(&self, message: BusMessage) -> Result<usize> {
        let subject = message.subject.clone();
        // oneshot slots are consumed by delivery; stream slots persist
        let is_stream = matches!(
            self.inner.inboxes.get(&subject).as_deref(),
            Some(InboxSlot::Stream(_))
        );
        if is_stream {
            let sender = match self.inner.inboxes.get(&subject).as_deref() {
                Some(InboxSlot::Stream(tx)) => tx.clone(),
                _ => return Ok(0),
            };
            // bounded send: a blocked consumer blocks the producer
            if sender.send(message).await.is_err() {
                self.inner.inboxes.remove(&subject);
                return Err(Error::UpstreamUnavailable(format!(
                    "stream consumer for '{}' is gone",
                    subject
                )));
            }
            return Ok(1);
        }

        match self.inner.inboxes.remove(&subject) {
            Some((_, InboxSlot::Oneshot(tx))) => {
                let _ = tx.send(message);
                Ok(1)
            }
            Some((_, InboxSlot::Stream(_))) => unreachable!("stream slots handled above"),
            // the requester timed out or dropped its stream; tell the
            // producer so it stops emitting
            None => Err(Error::UpstreamUnavailable(format!(
                "inbox '{}' is gone",
                subject
            ))),
        }
    }

    /// Subscribe to a subject with a bounded queue
    pub fn subscribe(&self, subject: impl Into<String>) -> Subscription {
        let subject = subject.into();
        let rx = self
            .inner
            .subjects
            .entry(subject.clone())
            .or_insert_with(|| broadcast::channel(self.inner.config.queue_depth).0)
            .subscribe();
        Subscription { subject, rx }
    }

    fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .get(subject)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Point-to-point request; waits for a single reply
    pub async fn request(&self, subject: &str, payload: Bytes) -> Result<BusMessage> {
        self.request_with_timeout(
            subject,
            payload,
            Duration::from_secs(self.inner.config.request_timeout_secs),
        )
        .await
    }

    /// Point-to-point request with an explicit deadline
    pub async fn request_with_timeout(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage> {
        if self.subscriber_count(subject) == 0 {
            return Err(Error::UpstreamUnavailable(format!(
                "no handler for '{}'",
                subject
            )));
        }

        let inbox = format!("{}{}", INBOX_PREFIX, Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.inner
            .inboxes
            .insert(inbox.clone(), InboxSlot::Oneshot(tx));

        let mut message = BusMessage::new(subject, payload);
        message.reply = Some(inbox.clone());
        let correlation_id = message.correlation_id.clone();
        self.publish(message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                if reply.correlation_id != correlation_id {
                    return Err(Error::Internal(format!(
                        "correlation mismatch on '{}'",
                        subject
                    )));
                }
                Ok(reply)
            }
            Ok(Err(_)) => Err(Error::UpstreamUnavailable(format!(
                "handler for '{}' dropped the reply",
                subject
            ))),
            Err(_) => {
                self.inner.inboxes.remove(&inbox);
                Err(Error::UpstreamTimeout(subject.to_string()))
            }
        }
    }

    /// Request whose reply is a stream of messages on the inbox
    ///
    /// The returned receiver yields frames until the consumer drops it; the
    /// caller interprets frame headers (see the streaming engine).
    pub async fn request_stream(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<StreamSubscription> {
        if self.subscriber_count(subject) == 0 {
            return Err(Error::UpstreamUnavailable(format!(
                "no handler for '{}'",
                subject
            )));
        }

        let inbox = format!("{}{}", INBOX_PREFIX, Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(self.inner.config.queue_depth);
        self.inner
            .inboxes
            .insert(inbox.clone(), InboxSlot::Stream(tx));

        let mut message = BusMessage::new(subject, payload);
        message.reply = Some(inbox.clone());
        let correlation_id = message.correlation_id.clone();
        self.publish(message).await?;

        Ok(StreamSubscription {
            bus: self.clone(),
            inbox,
            correlation_id,
            rx,
        })
    }

    /// Reply to a request message
    pub async fn respond(&self, request: &BusMessage, payload: Bytes) -> Result<()> {
        self.respond_with_headers(request, BTreeMap::new(), payload)
            .await
    }

    /// Reply to a request message with headers (stream frames use this)
    pub async fn respond_with_headers(
        &self,
        request: &BusMessage,
        headers: BTreeMap<String, String>,
        payload: Bytes,
    ) -> Result<()> {
        let reply_subject = request.reply.clone().ok_or_else(|| {
            Error::Internal(format!("message on '{}' has no reply inbox", request.subject))
        })?;
        let reply = BusMessage {
            subject: reply_subject,
            reply: None,
            correlation_id: request.correlation_id.clone(),
            headers,
            payload,
        };
        self.publish(reply).await?;
        Ok(())
    }
}

/// Bounded fan-out subscription
pub struct Subscription {
    subject: String,
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, skipping over dropped backlog
    ///
    /// Returns `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    tracing::warn!(
                        subject = %self.subject,
                        dropped,
                        "Subscriber lagging, oldest messages dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Reply-stream subscription; unregisters its inbox on drop
pub struct StreamSubscription {
    bus: BusClient,
    inbox: String,
    correlation_id: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl StreamSubscription {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.bus.inner.inboxes.remove(&self.inbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    fn bus() -> BusClient {
        BusClient::new(BusConfig::default())
    }

    #[tokio::test]
    async fn test_publish_subscribe_fan_out() {
        let bus = bus();
        let mut a = bus.subscribe("conversation.send");
        let mut b = bus.subscribe("conversation.send");

        let delivered = bus
            .publish(BusMessage::new("conversation.send", "hi".as_bytes()))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.next().await.unwrap().payload, Bytes::from("hi"));
        assert_eq!(b.next().await.unwrap().payload, Bytes::from("hi"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = bus();
        let delivered = bus
            .publish(BusMessage::new("nobody.home", Bytes::new()))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let bus = bus();
        let mut sub = bus.subscribe("ordered");
        for i in 0..50u32 {
            bus.publish(BusMessage::new("ordered", i.to_string().into_bytes()))
                .await
                .unwrap();
        }
        for i in 0..50u32 {
            let msg = sub.next().await.unwrap();
            assert_eq!(msg.payload, Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = BusClient::new(BusConfig {
            queue_depth: 4,
            ..BusConfig::default()
        });
        let mut sub = bus.subscribe("noisy");
        for i in 0..10u32 {
            bus.publish(BusMessage::new("noisy", i.to_string().into_bytes()))
                .await
                .unwrap();
        }
        // the first message we can still read is one of the newest four
        let first = sub.next().await.unwrap();
        let n: u32 = String::from_utf8(first.payload.to_vec())
            .unwrap()
            .parse()
            .unwrap();
        assert!(n >= 6);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = bus();
        let mut handler = bus.subscribe("users.authenticate");
        let bus_for_handler = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = handler.next().await {
                bus_for_handler
                    .respond(&msg, Bytes::from("ok"))
                    .await
                    .unwrap();
            }
        });

        let reply = bus
            .request("users.authenticate", Bytes::from("creds"))
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from("ok"));
    }

    #[tokio::test]
    async fn test_request_no_handler_is_unavailable() {
        let bus = bus();
        let err = bus.request("ghost.subject", Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), "upstream/unavailable");
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let bus = bus();
        let _handler = bus.subscribe("slow.subject");
        let err = bus
            .request_with_timeout("slow.subject", Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream/timeout");
    }

    #[tokio::test]
    async fn test_reply_correlation_id_matches() {
        let bus = bus();
        let mut handler = bus.subscribe("corr.check");
        let bus_for_handler = bus.clone();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen_clone = seen.clone();
        tokio::spawn(async move {
            let msg = handler.next().await.unwrap();
            *seen_clone.lock().unwrap() = msg.correlation_id.clone();
            bus_for_handler.respond(&msg, Bytes::new()).await.unwrap();
        });

        let reply = bus.request("corr.check", Bytes::new()).await.unwrap();
        assert_eq!(reply.correlation_id, *seen.lock().unwrap());
    }

    #[tokio::test]
    async fn test_request_stream_frames_in_order() {
        let bus = bus();
        let mut handler = bus.subscribe("tts.synthesize");
        let bus_for_handler = bus.clone();
        tokio::spawn(async move {
            let msg = handler.next().await.unwrap();
            for i in 0..5u8 {
                bus_for_handler
                    .respond(&msg, Bytes::from(vec![i]))
                    .await
                    .unwrap();
            }
        });

        let mut stream = bus
            .request_stream("tts.synthesize", Bytes::from("hi"))
            .await
            .unwrap();
        for i in 0..5u8 {
            let frame = stream.next().await.unwrap();
            assert_eq!(frame.payload, Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_consumer_fails_producer() {
        let bus = bus();
        let mut handler = bus.subscribe("drops");
        let bus_for_handler = bus.clone();

        let stream = bus
            .request_stream("drops", Bytes::new())
            .await
            .unwrap();
        let request = handler.next().await.unwrap();
        drop(stream);

        // delivery to a dropped consumer surfaces as unavailable
        let err = bus_for_handler
            .respond(&request, Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream/unavailable");
    }
}
