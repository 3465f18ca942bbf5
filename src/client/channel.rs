//! Client channel: a lazily dialed, shared connection to one server address.

use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::client::retry::RetryPolicy;
use crate::client::stream::ResponseStream;
use crate::payload::{Codec, JsonCodec};
use crate::transport::codec::{CallKind, RequestHead};
use crate::transport::dialer::{Dialer, TcpDialer};
use crate::transport::mux::{Connection, ConnectionConfig, Delivery, Role};
use crate::types::{ClientConfig, Error, Result};

/// Handle for issuing calls to one address. Cheap to clone; clones share the
/// underlying connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    retry: RetryPolicy,
    conn: Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.config.address)
            .finish()
    }
}

impl Channel {
    /// Channel over TCP. No connection is made until the first call.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_dialer(config, Arc::new(TcpDialer))
    }

    pub fn with_dialer(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ChannelInner {
                retry: RetryPolicy::new(config.retry.clone()),
                config,
                dialer,
                conn: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The current connection, dialing a new one if there is none or the
    /// previous one died or is draining. Fails with `Cancelled` once the
    /// channel is closed.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = self.inner.conn.lock().await;
        if self.is_closed() {
            return Err(Error::cancelled("channel closed"));
        }
        if let Some(conn) = slot.as_ref() {
            if conn.is_usable() {
                return Ok(conn.clone());
            }
            tracing::debug!(conn = %conn.id(), "replacing_connection: {:?}", conn.liveness());
        }

        let config = &self.inner.config;
        let io = self
            .inner
            .dialer
            .dial(&config.address, config.connect_timeout)
            .await?;
        let conn = Connection::establish(io, config.address.clone(), ConnectionConfig::from(config), Role::Client);
        tracing::info!(conn = %conn.id(), "connected: {}", config.address);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Issue a unary call under the retry policy.
    pub async fn call_unary(&self, method: &str, request: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        let deadline = deadline_after(timeout);
        self.inner
            .retry
            .run(method, deadline, |_| self.unary_attempt(method, &request, deadline))
            .await
    }

    async fn unary_attempt(&self, method: &str, request: &[u8], deadline: Option<Instant>) -> Result<Bytes> {
        match self.unary_exchange(method, request, deadline).await {
            Err(Error::ConnectionLost(_)) if self.is_closed() => Err(Error::cancelled("channel closed")),
            result => result,
        }
    }

    async fn unary_exchange(&self, method: &str, request: &[u8], deadline: Option<Instant>) -> Result<Bytes> {
        let conn = self.connection().await?;
        let mut stream = conn.open_stream(CallKind::Unary).await?;
        stream.send_request(&request_head(method, CallKind::Unary, deadline), request)?;

        let response = match stream.recv().await {
            Delivery::Message(bytes) => bytes,
            Delivery::Failed(err) => return Err(err),
            Delivery::End => return Err(Error::internal("unary call ended without a response")),
        };
        match stream.recv().await {
            Delivery::End => Ok(response),
            Delivery::Failed(err) => Err(err),
            Delivery::Message(_) => Err(Error::internal("unary call produced more than one response")),
        }
    }

    /// Open a server-streaming call. Streaming calls are not retried.
    pub async fn call_server_stream(
        &self,
        method: &str,
        request: Bytes,
        timeout: Option<Duration>,
    ) -> Result<ResponseStream> {
        let deadline = deadline_after(timeout);
        let open = async {
            let conn = self.connection().await?;
            let mut stream = conn.open_stream(CallKind::ServerStreaming).await?;
            stream.send_request(&request_head(method, CallKind::ServerStreaming, deadline), &request)?;
            Ok::<_, Error>(stream)
        };
        let stream = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, open)
                .await
                .map_err(|_| Error::DeadlineExceeded)??,
            None => open.await?,
        };
        Ok(ResponseStream::new(method, stream, deadline))
    }

    /// Typed unary call with JSON payloads.
    pub async fn unary<Req, Resp>(&self, method: &str, request: &Req, timeout: Option<Duration>) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = JsonCodec.serialize(request)?;
        let response = self.call_unary(method, body, timeout).await?;
        JsonCodec.deserialize(&response)
    }

    /// Typed server-streaming call with JSON payloads.
    pub async fn server_stream<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<impl Stream<Item = Result<Resp>> + Unpin>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = JsonCodec.serialize(request)?;
        Ok(self.call_server_stream(method, body, timeout).await?.decoded())
    }

    /// Close the channel and its connection. Unary calls in flight and every
    /// later call fail with `Cancelled`; open response streams end with
    /// `ConnectionLost`. No new connection is dialed.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = self.inner.conn.lock().await.take() {
            conn.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        // Streams still in flight keep the connection; the server reaps it once idle.
        if let Some(conn) = self.conn.get_mut().take() {
            if conn.open_streams() == 0 {
                conn.close();
            }
        }
    }
}

/// A timeout too large to represent as an instant means no deadline.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

fn request_head(method: &str, kind: CallKind, deadline: Option<Instant>) -> RequestHead {
    RequestHead {
        method: method.to_string(),
        kind,
        timeout_ms: deadline.map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::{decode_request, Decoded, Frame, FrameCodec, FrameKind};
    use crate::transport::dialer::BoxedTransport;
    use crate::types::{Code, RetryConfig, StreamId};
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_util::codec::Framed;

    /// Hands out in-memory pipes; the far ends go to the test.
    struct PipeDialer {
        peers: mpsc::UnboundedSender<Framed<DuplexStream, FrameCodec>>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn dial(&self, _address: &str, _timeout: Duration) -> Result<BoxedTransport> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(Framed::new(far, FrameCodec::new(1 << 20, 1 << 20)));
            Ok(Box::new(near))
        }
    }

    fn channel(retry: RetryConfig) -> (Channel, Arc<PipeDialer>, mpsc::UnboundedReceiver<Framed<DuplexStream, FrameCodec>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(PipeDialer {
            peers: tx,
            dials: AtomicUsize::new(0),
        });
        let config = ClientConfig {
            address: "memory".into(),
            retry,
            ..ClientConfig::default()
        };
        (Channel::with_dialer(config, dialer.clone()).unwrap(), dialer, rx)
    }

    async fn next_request(peer: &mut Framed<DuplexStream, FrameCodec>) -> (StreamId, RequestHead, Bytes) {
        loop {
            match peer.next().await {
                Some(Ok(Decoded::Frame(frame))) if frame.kind == FrameKind::Request => {
                    let (head, body) = decode_request(frame.payload).unwrap();
                    return (frame.stream_id, head, body);
                }
                Some(Ok(_)) => continue,
                other => panic!("peer stream ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unary_reuses_connection() {
        let (channel, dialer, mut peers) = channel(RetryConfig::disabled());
        let client = channel.clone();
        let calls = tokio::spawn(async move {
            let a = client.call_unary("svc/Echo", Bytes::from_static(b"one"), None).await;
            let b = client.call_unary("svc/Echo", Bytes::from_static(b"two"), None).await;
            (a, b)
        });

        let mut peer = peers.recv().await.unwrap();
        for _ in 0..2 {
            let (id, head, body) = next_request(&mut peer).await;
            assert_eq!(head.method, "svc/Echo");
            assert_eq!(head.kind, CallKind::Unary);
            peer.send(Frame::new(FrameKind::Response, id, body)).await.unwrap();
        }

        let (a, b) = calls.await.unwrap();
        assert_eq!(a.unwrap().as_ref(), b"one");
        assert_eq!(b.unwrap().as_ref(), b"two");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unary_retries_on_fresh_connection() {
        let (channel, dialer, mut peers) = channel(RetryConfig {
            initial_backoff: Duration::from_millis(1),
            ..RetryConfig::default()
        });
        let call = tokio::spawn(async move { channel.call_unary("svc/M", Bytes::new(), None).await });

        // First connection drops mid-call.
        let mut first = peers.recv().await.unwrap();
        next_request(&mut first).await;
        drop(first);

        let mut second = peers.recv().await.unwrap();
        let (id, _, _) = next_request(&mut second).await;
        second
            .send(Frame::new(FrameKind::Response, id, "ok"))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap().as_ref(), b"ok");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_status_error_surfaces_unchanged() {
        let (channel, _dialer, mut peers) = channel(RetryConfig::default());
        let call = tokio::spawn(async move { channel.call_unary("svc/M", Bytes::new(), None).await });

        let mut peer = peers.recv().await.unwrap();
        let (id, _, _) = next_request(&mut peer).await;
        let err = Error::not_found("no such thing");
        peer.send(Frame::new(FrameKind::Error, id, crate::transport::codec::encode_error(&err)))
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(Error::Status { code, message }) => {
                assert_eq!(code, Code::NotFound);
                assert_eq!(message, "no such thing");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_sends_cancel() {
        let (channel, _dialer, mut peers) = channel(RetryConfig::default());
        let call = tokio::spawn(async move {
            channel
                .call_unary("svc/Slow", Bytes::new(), Some(Duration::from_millis(50)))
                .await
        });

        let mut peer = peers.recv().await.unwrap();
        let (id, head, _) = next_request(&mut peer).await;
        assert!(head.timeout_ms.unwrap() <= 50);

        assert!(matches!(call.await.unwrap(), Err(Error::DeadlineExceeded)));
        loop {
            match peer.next().await {
                Some(Ok(Decoded::Frame(frame))) if frame.kind == FrameKind::Cancel => {
                    assert_eq!(frame.stream_id, id);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("no cancel: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_server_stream_messages_then_end() {
        let (channel, _dialer, mut peers) = channel(RetryConfig::default());
        let consumer = tokio::spawn(async move {
            let mut stream = channel
                .call_server_stream("svc/List", Bytes::new(), None)
                .await
                .unwrap();
            let mut got = Vec::new();
            while let Some(message) = stream.message().await.unwrap() {
                got.push(message);
            }
            assert!(stream.next().await.is_none());
            got
        });

        let mut peer = peers.recv().await.unwrap();
        let (id, head, _) = next_request(&mut peer).await;
        assert_eq!(head.kind, CallKind::ServerStreaming);
        for m in ["a", "b", "c"] {
            peer.send(Frame::new(FrameKind::StreamChunk, id, m)).await.unwrap();
        }
        peer.send(Frame::empty(FrameKind::StreamEnd, id)).await.unwrap();

        let got = consumer.await.unwrap();
        assert_eq!(got, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_draining_connection_is_replaced() {
        let (channel, dialer, mut peers) = channel(RetryConfig::disabled());
        let conn = {
            let c = channel.clone();
            let handle = tokio::spawn(async move { c.connection().await.unwrap() });
            let mut peer = peers.recv().await.unwrap();
            let conn = handle.await.unwrap();
            peer.send(Frame::new(FrameKind::GoAway, StreamId::CONNECTION, "age"))
                .await
                .unwrap();
            while !conn.is_draining() {
                tokio::task::yield_now().await;
            }
            conn
        };

        let fresh = channel.connection().await.unwrap();
        assert_ne!(fresh.id(), conn.id());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_call() {
        let (channel, dialer, mut peers) = channel(RetryConfig::default());
        let client = channel.clone();
        let call = tokio::spawn(async move { client.call_unary("svc/Slow", Bytes::new(), None).await });

        let mut peer = peers.recv().await.unwrap();
        let _ = next_request(&mut peer).await;
        channel.close().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "got {:?}", err);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        let later = channel.call_unary("svc/Echo", Bytes::new(), None).await.unwrap_err();
        assert!(matches!(later, Error::Cancelled(_)));
        assert!(channel.is_closed());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let (channel, _dialer, mut peers) = channel(RetryConfig::disabled());
        let call = tokio::spawn(async move {
            channel
                .call_unary("svc/Echo", Bytes::from_static(b"hi"), Some(Duration::MAX))
                .await
        });

        let mut peer = peers.recv().await.unwrap();
        let (id, head, body) = next_request(&mut peer).await;
        assert_eq!(head.timeout_ms, None);
        peer.send(Frame::new(FrameKind::Response, id, body)).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap().as_ref(), b"hi");
    }
}
