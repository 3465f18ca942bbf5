//! Pull-based consumer for server-streaming responses.

use bytes::Bytes;
use futures::stream::{FusedStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Instant, Sleep};

use crate::payload::{Codec, JsonCodec};
use crate::transport::mux::{Delivery, LogicalStream};
use crate::types::{Error, Result};

/// Messages of one server-streaming call, in production order.
///
/// Yields `Ok(message)` per message, then ends (`None`) on a clean finish, or
/// yields a single `Err` and ends on failure. The stream is fused. Dropping it
/// early cancels the call on the server.
pub struct ResponseStream {
    method: String,
    inner: Option<LogicalStream>,
    deadline: Option<Pin<Box<Sleep>>>,
    received: usize,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("method", &self.method)
            .field("received", &self.received)
            .field("terminated", &self.inner.is_none())
            .finish()
    }
}

impl ResponseStream {
    pub(crate) fn new(method: impl Into<String>, inner: LogicalStream, deadline: Option<Instant>) -> Self {
        Self {
            method: method.into(),
            inner: Some(inner),
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            received: 0,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Messages received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Next message, `Ok(None)` after a clean end.
    pub async fn message(&mut self) -> Result<Option<Bytes>> {
        self.next().await.transpose()
    }

    /// Stop consuming and cancel the call.
    pub fn close(&mut self) {
        self.inner.take();
    }

    /// Decode every message as `T` with JSON.
    pub fn decoded<T: DeserializeOwned>(self) -> impl Stream<Item = Result<T>> + Unpin {
        self.map(|item| item.and_then(|bytes| JsonCodec.deserialize(&bytes)))
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let delivery = match inner.poll_recv(cx) {
            Poll::Ready(delivery) => delivery,
            Poll::Pending => {
                if let Some(deadline) = this.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        tracing::debug!(
                            method = %this.method,
                            received = this.received,
                            "stream_deadline_exceeded"
                        );
                        this.inner.take();
                        return Poll::Ready(Some(Err(Error::DeadlineExceeded)));
                    }
                }
                return Poll::Pending;
            }
        };

        match delivery {
            Delivery::Message(bytes) => {
                this.received += 1;
                Poll::Ready(Some(Ok(bytes)))
            }
            Delivery::End => {
                this.inner.take();
                Poll::Ready(None)
            }
            Delivery::Failed(err) => {
                this.inner.take();
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl FusedStream for ResponseStream {
    fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }
}
