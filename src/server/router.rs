//! Method routing and handler traits.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::payload::{Codec, JsonCodec};
use crate::server::interceptor::CallContext;
use crate::transport::codec::{CallKind, Frame, FrameKind};
use crate::transport::mux::Connection;
use crate::types::{Error, Result, StreamId};

/// Fully qualified name of the built-in method listing service.
pub const REFLECTION_METHOD: &str = "rpc.reflection.ServerReflection/ListMethods";

#[async_trait]
pub trait UnaryHandler: Send + Sync + 'static {
    async fn call(&self, ctx: &CallContext, request: Bytes) -> Result<Bytes>;
}

#[async_trait]
pub trait StreamingHandler: Send + Sync + 'static {
    /// Produce messages through `sink`. `Ok` ends the stream cleanly, `Err`
    /// ends it with that error after whatever was already sent.
    async fn call(&self, ctx: &CallContext, request: Bytes, sink: ResponseSink) -> Result<()>;
}

/// Outbound half of a server-streaming call.
pub struct ResponseSink {
    conn: Arc<Connection>,
    stream_id: StreamId,
    ctx: CallContext,
    sent: usize,
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSink")
            .field("stream_id", &self.stream_id)
            .field("sent", &self.sent)
            .finish()
    }
}

impl ResponseSink {
    pub(crate) fn new(conn: Arc<Connection>, ctx: CallContext) -> Self {
        Self {
            conn,
            stream_id: ctx.stream_id(),
            ctx,
            sent: 0,
        }
    }

    /// Send one message. Fails with `Cancelled` once the client has gone.
    pub async fn send(&mut self, message: Bytes) -> Result<()> {
        if self.ctx.is_cancelled() {
            return Err(Error::cancelled("call cancelled by client"));
        }
        self.conn
            .send(Frame::new(FrameKind::StreamChunk, self.stream_id, message))
            .await?;
        self.sent += 1;
        Ok(())
    }

    pub async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = JsonCodec.serialize(message)?;
        self.send(bytes).await
    }

    /// Messages sent so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }
}

// =============================================================================
// Closure adapters
// =============================================================================

struct UnaryFn<F>(F);

#[async_trait]
impl<F, Fut> UnaryHandler for UnaryFn<F>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Bytes) -> Result<Bytes> {
        (self.0)(ctx.clone(), request).await
    }
}

struct StreamingFn<F>(F);

#[async_trait]
impl<F, Fut> StreamingHandler for StreamingFn<F>
where
    F: Fn(CallContext, Bytes, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Bytes, sink: ResponseSink) -> Result<()> {
        (self.0)(ctx.clone(), request, sink).await
    }
}

struct UnaryJson<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<F, Fut, Req, Resp> UnaryHandler for UnaryJson<F, Req, Resp>
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Bytes) -> Result<Bytes> {
        let request = decode_json(ctx, &request)?;
        let response = (self.f)(ctx.clone(), request).await?;
        JsonCodec.serialize(&response)
    }
}

struct StreamingJson<F, Req> {
    f: F,
    _types: PhantomData<fn(Req)>,
}

#[async_trait]
impl<F, Fut, Req> StreamingHandler for StreamingJson<F, Req>
where
    F: Fn(CallContext, Req, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Bytes, sink: ResponseSink) -> Result<()> {
        let request = decode_json(ctx, &request)?;
        (self.f)(ctx.clone(), request, sink).await
    }
}

fn decode_json<T: DeserializeOwned>(ctx: &CallContext, request: &[u8]) -> Result<T> {
    JsonCodec
        .deserialize(request)
        .map_err(|e| Error::invalid_argument(format!("{}: malformed request: {}", ctx.method(), e)))
}

// =============================================================================
// Router
// =============================================================================

#[derive(Clone)]
pub enum MethodHandler {
    Unary(Arc<dyn UnaryHandler>),
    ServerStreaming(Arc<dyn StreamingHandler>),
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MethodHandler::{:?}", self.kind())
    }
}

impl MethodHandler {
    pub fn kind(&self) -> CallKind {
        match self {
            MethodHandler::Unary(_) => CallKind::Unary,
            MethodHandler::ServerStreaming(_) => CallKind::ServerStreaming,
        }
    }
}

/// A registered method, as listed by reflection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: CallKind,
}

/// Maps fully qualified method names (`package.Service/Method`) to handlers.
#[derive(Clone, Default)]
pub struct Router {
    methods: BTreeMap<String, MethodHandler>,
    reflection: bool,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("reflection", &self.reflection)
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: impl Into<String>, handler: MethodHandler) -> Self {
        let method = method.into();
        if self.methods.insert(method.clone(), handler).is_some() {
            tracing::warn!("method registered twice, keeping the last: {}", method);
        }
        self
    }

    pub fn unary<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.route(method, MethodHandler::Unary(Arc::new(UnaryFn(f))))
    }

    pub fn server_streaming<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Bytes, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.route(method, MethodHandler::ServerStreaming(Arc::new(StreamingFn(f))))
    }

    /// Unary method with JSON request and response.
    pub fn unary_json<Req, Resp, F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.route(
            method,
            MethodHandler::Unary(Arc::new(UnaryJson {
                f,
                _types: PhantomData,
            })),
        )
    }

    /// Server-streaming method with a JSON request; use [`ResponseSink::send_json`].
    pub fn server_streaming_json<Req, F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Req, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
    {
        self.route(
            method,
            MethodHandler::ServerStreaming(Arc::new(StreamingJson {
                f,
                _types: PhantomData,
            })),
        )
    }

    /// Also serve [`REFLECTION_METHOD`], listing every registered method.
    pub fn with_reflection(mut self) -> Self {
        self.reflection = true;
        self
    }

    /// Registered methods in name order.
    pub fn describe(&self) -> Vec<MethodDescriptor> {
        let mut methods: Vec<MethodDescriptor> = self
            .methods
            .iter()
            .map(|(name, handler)| MethodDescriptor {
                name: name.clone(),
                kind: handler.kind(),
            })
            .collect();
        if self.reflection && !self.methods.contains_key(REFLECTION_METHOD) {
            methods.push(MethodDescriptor {
                name: REFLECTION_METHOD.to_string(),
                kind: CallKind::Unary,
            });
            methods.sort_by(|a, b| a.name.cmp(&b.name));
        }
        methods
    }

    /// Freeze the method set, installing the reflection handler if enabled.
    pub(crate) fn seal(self) -> Self {
        if !self.reflection || self.methods.contains_key(REFLECTION_METHOD) {
            return self;
        }
        let listing = self.describe();
        self.unary(REFLECTION_METHOD, move |_ctx, _request| {
            let body = JsonCodec.serialize(&listing);
            async move { body }
        })
    }

    pub fn resolve(&self, method: &str) -> Option<&MethodHandler> {
        self.methods.get(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Code;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    fn ctx(method: &str) -> CallContext {
        CallContext::new(method, "test", StreamId::new(1), None, CancellationToken::new())
    }

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn router() -> Router {
        Router::new()
            .unary("math.Calc/Echo", |_ctx, req| async move { Ok(req) })
            .unary_json("math.Calc/Add", |_ctx, req: Add| async move { Ok(req.a + req.b) })
            .server_streaming("math.Calc/Count", |_ctx, _req, _sink| async move { Ok(()) })
    }

    #[test]
    fn test_describe_lists_methods_in_order() {
        let described = router().with_reflection().describe();
        let names: Vec<(&str, CallKind)> = described.iter().map(|d| (d.name.as_str(), d.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("math.Calc/Add", CallKind::Unary),
                ("math.Calc/Count", CallKind::ServerStreaming),
                ("math.Calc/Echo", CallKind::Unary),
                (REFLECTION_METHOD, CallKind::Unary),
            ]
        );
        assert!(router().describe().iter().all(|d| d.name != REFLECTION_METHOD));
    }

    #[tokio::test]
    async fn test_reflection_handler_returns_descriptors() {
        let router = router().with_reflection().seal();
        let Some(MethodHandler::Unary(handler)) = router.resolve(REFLECTION_METHOD) else {
            panic!("reflection not registered");
        };
        let body = handler.call(&ctx(REFLECTION_METHOD), Bytes::new()).await.unwrap();
        let listed: Vec<MethodDescriptor> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed, router.describe());
        assert_eq!(listed.len(), 4);
    }

    #[tokio::test]
    async fn test_json_handler_decodes_and_encodes() {
        let router = router();
        let Some(MethodHandler::Unary(handler)) = router.resolve("math.Calc/Add") else {
            panic!("missing method");
        };
        let out = handler
            .call(&ctx("math.Calc/Add"), Bytes::from(r#"{"a":2,"b":3}"#))
            .await
            .unwrap();
        assert_eq!(out.as_ref(), b"5");

        let err = handler
            .call(&ctx("math.Calc/Add"), Bytes::from("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_unknown_method_resolves_to_none() {
        assert!(router().resolve("math.Calc/Missing").is_none());
        assert_eq!(router().len(), 3);
    }
}
