//! Interceptor chain around unary handlers.
//!
//! Interceptors are composed once at server build time. The first one
//! configured is the outermost: for `[A, B]` around handler `H` the order is
//! A-before, B-before, H, B-after, A-after. Each interceptor receives a
//! single-use [`Next`] and may rewrite the request, short-circuit by not
//! calling it, or inspect and replace the outcome.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::server::router::UnaryHandler;
use crate::types::{Result, StreamId};

/// Per-call information visible to interceptors and handlers.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: String,
    peer: String,
    stream_id: StreamId,
    deadline: Option<Instant>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(
        method: impl Into<String>,
        peer: impl Into<String>,
        stream_id: StreamId,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            method: method.into(),
            peer: peer.into(),
            stream_id,
            deadline,
            started_at: Instant::now(),
            cancel,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when the call has none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fires when the client cancels or the connection goes away.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, ctx: &CallContext, request: Bytes, next: Next<'_>) -> Result<Bytes>;
}

/// The rest of the chain. Consumed by [`Next::run`], so the handler runs at most once.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn UnaryHandler,
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").field("remaining", &self.rest.len()).finish()
    }
}

impl Next<'_> {
    pub async fn run(self, ctx: &CallContext, request: Bytes) -> Result<Bytes> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    rest,
                    handler: self.handler,
                };
                first.intercept(ctx, request, next).await
            }
            None => self.handler.call(ctx, request).await,
        }
    }
}

/// Ordered, immutable list of interceptors.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self {
            interceptors: Arc::from(Vec::new()),
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it runs inside all previously added ones.
    #[must_use]
    pub fn layer<I: Interceptor>(self, interceptor: I) -> Self {
        self.layer_arc(Arc::new(interceptor))
    }

    #[must_use]
    pub fn layer_arc(self, interceptor: Arc<dyn Interceptor>) -> Self {
        let mut interceptors = self.interceptors.to_vec();
        interceptors.push(interceptor);
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the chain around `handler`.
    pub async fn call(&self, ctx: &CallContext, request: Bytes, handler: &dyn UnaryHandler) -> Result<Bytes> {
        Next {
            rest: &self.interceptors,
            handler,
        }
        .run(ctx, request)
        .await
    }
}

/// Logs method, duration and outcome of each call. The result passes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept(&self, ctx: &CallContext, request: Bytes, next: Next<'_>) -> Result<Bytes> {
        let started = Instant::now();
        let result = next.run(ctx, request).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => tracing::info!(
                method = %ctx.method(),
                peer = %ctx.peer(),
                duration_ms,
                bytes = response.len(),
                "call_completed"
            ),
            Err(e) => tracing::warn!(
                method = %ctx.method(),
                peer = %ctx.peer(),
                duration_ms,
                code = %e.code(),
                "call_failed: {}",
                e
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Code, Error};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        trace: Trace,
    }

    #[async_trait]
    impl Interceptor for Recording {
        async fn intercept(&self, ctx: &CallContext, request: Bytes, next: Next<'_>) -> Result<Bytes> {
            self.trace.lock().push(format!("{}-before", self.name));
            let result = next.run(ctx, request).await;
            self.trace.lock().push(format!("{}-after", self.name));
            result
        }
    }

    struct Deny;

    #[async_trait]
    impl Interceptor for Deny {
        async fn intercept(&self, _ctx: &CallContext, _request: Bytes, _next: Next<'_>) -> Result<Bytes> {
            Err(Error::status(Code::FailedPrecondition, "denied"))
        }
    }

    struct Upper;

    #[async_trait]
    impl Interceptor for Upper {
        async fn intercept(&self, ctx: &CallContext, request: Bytes, next: Next<'_>) -> Result<Bytes> {
            let upper = Bytes::from(request.to_ascii_uppercase());
            next.run(ctx, upper).await
        }
    }

    struct Echo {
        trace: Trace,
    }

    #[async_trait]
    impl UnaryHandler for Echo {
        async fn call(&self, _ctx: &CallContext, request: Bytes) -> Result<Bytes> {
            self.trace.lock().push("handler".to_string());
            Ok(request)
        }
    }

    fn ctx() -> CallContext {
        CallContext::new("svc/Echo", "test", StreamId::new(1), None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_first_interceptor_is_outermost() {
        let trace = Trace::default();
        let chain = InterceptorChain::new()
            .layer(Recording {
                name: "A",
                trace: trace.clone(),
            })
            .layer(Recording {
                name: "B",
                trace: trace.clone(),
            });
        let handler = Echo {
            trace: trace.clone(),
        };

        let out = chain.call(&ctx(), Bytes::from("x"), &handler).await.unwrap();
        assert_eq!(out.as_ref(), b"x");
        assert_eq!(
            *trace.lock(),
            vec!["A-before", "B-before", "handler", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let trace = Trace::default();
        let chain = InterceptorChain::new()
            .layer(Recording {
                name: "A",
                trace: trace.clone(),
            })
            .layer(Deny);
        let handler = Echo {
            trace: trace.clone(),
        };

        let err = chain.call(&ctx(), Bytes::new(), &handler).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(*trace.lock(), vec!["A-before", "A-after"]);
    }

    #[tokio::test]
    async fn test_interceptor_rewrites_request() {
        let chain = InterceptorChain::new().layer(Upper);
        let handler = Echo {
            trace: Trace::default(),
        };
        let out = chain.call(&ctx(), Bytes::from("hello"), &handler).await.unwrap();
        assert_eq!(out.as_ref(), b"HELLO");
    }

    #[tokio::test]
    async fn test_empty_chain_calls_handler() {
        let trace = Trace::default();
        let handler = Echo {
            trace: trace.clone(),
        };
        InterceptorChain::new()
            .call(&ctx(), Bytes::new(), &handler)
            .await
            .unwrap();
        assert_eq!(*trace.lock(), vec!["handler"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_logging_forwards_failure_unchanged() {
        let chain = InterceptorChain::new().layer(LoggingInterceptor).layer(Deny);
        let handler = Echo {
            trace: Trace::default(),
        };

        match chain.call(&ctx(), Bytes::new(), &handler).await {
            Err(Error::Status { code, message }) => {
                assert_eq!(code, Code::FailedPrecondition);
                assert_eq!(message, "denied");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(logs_contain("call_failed"));
        assert!(logs_contain("svc/Echo"));
    }
}
