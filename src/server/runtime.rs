//! RPC server: accept loop, per-connection supervision and call execution.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::server::interceptor::{CallContext, InterceptorChain};
use crate::server::router::{MethodHandler, ResponseSink, Router};
use crate::transport::codec::{encode_error, Frame, FrameKind, RequestHead};
use crate::transport::mux::{Admission, Connection, ConnectionConfig, Dispatcher, IncomingCall, Role};
use crate::types::{Error, Result, ServerConfig};

/// State shared by every call on every connection.
struct Runtime {
    router: Router,
    interceptors: InterceptorChain,
    workers: Arc<Semaphore>,
}

#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    runtime: Arc<Runtime>,
    connections: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("router", &self.router)
            .field("interceptors", &self.interceptors)
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig, router: Router) -> Result<Self> {
        Self::with_interceptors(config, router, InterceptorChain::new())
    }

    pub fn with_interceptors(config: ServerConfig, router: Router, interceptors: InterceptorChain) -> Result<Self> {
        config.validate()?;
        let workers = config.worker_count();
        Ok(Self {
            runtime: Arc::new(Runtime {
                router: router.seal(),
                interceptors,
                workers: Arc::new(Semaphore::new(workers)),
            }),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.runtime.router
    }

    /// Bind `listen_addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve_with_listener(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "server listening on {} (max_connections={}, workers={})",
            listener.local_addr()?,
            self.config.max_connections,
            self.config.worker_count(),
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };

                    // Backpressure when at capacity.
                    let permit = match self.connections.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                    }

                    tracing::debug!(
                        "connection from {} (active={})",
                        peer,
                        self.config.max_connections - self.connections.available_permits(),
                    );
                    self.spawn_connection(stream, peer.to_string(), Some(permit));
                }
            }
        }
        Ok(())
    }

    /// Serve calls arriving on an already accepted byte stream.
    pub fn serve_connection<IO>(&self, io: IO, peer: impl Into<String>) -> Arc<Connection>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.spawn_connection(io, peer.into(), None)
    }

    /// Stop accepting; open connections are sent `GoAway` and drained.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_connection<IO>(&self, io: IO, peer: String, permit: Option<OwnedSemaphorePermit>) -> Arc<Connection>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = self.runtime.clone();
        let dispatcher: Dispatcher = Arc::new(move |conn: Arc<Connection>, call: IncomingCall| {
            tokio::spawn(run_call(runtime.clone(), conn, call));
        });
        let conn = Connection::establish(
            io,
            peer,
            ConnectionConfig::from(&self.config),
            Role::Server {
                dispatcher,
                enforcement: self.config.enforcement.clone(),
            },
        );
        tokio::spawn(supervise(
            conn.clone(),
            self.config.clone(),
            self.cancel.clone(),
            permit,
        ));
        conn
    }
}

/// Enforce idle and age limits; drain on shutdown. Holds the connection permit.
async fn supervise(
    conn: Arc<Connection>,
    config: ServerConfig,
    shutdown: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let age_limit = Instant::now().checked_add(config.max_connection_age);

    loop {
        let idle_since = conn.idle_since();
        let idle_deadline = idle_since.and_then(|since| since.checked_add(config.max_connection_idle));
        tokio::select! {
            _ = conn.closed() => break,
            _ = shutdown.cancelled() => {
                drain(&conn, "server shutdown", config.max_connection_age_grace).await;
                break;
            }
            _ = sleep_until_some(age_limit) => {
                drain(&conn, "max_connection_age", config.max_connection_age_grace).await;
                break;
            }
            _ = conn.wait_idle(), if idle_since.is_none() => {}
            _ = sleep_until_some(idle_deadline), if idle_since.is_some() => {
                let expired = conn
                    .idle_since()
                    .and_then(|since| since.checked_add(config.max_connection_idle))
                    .is_some_and(|deadline| deadline <= Instant::now());
                if expired {
                    tracing::debug!(conn = %conn.id(), "closing idle connection");
                    conn.go_away("max_connection_idle");
                    conn.close();
                    break;
                }
            }
        }
    }
    tracing::debug!(conn = %conn.id(), "connection released: {}", conn.address());
}

/// Sleep until `deadline`; without one, never wake.
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn drain(conn: &Connection, reason: &str, grace: Duration) {
    conn.go_away(reason);
    tokio::select! {
        _ = conn.wait_idle() => {}
        _ = conn.closed() => {}
        _ = tokio::time::sleep(grace) => {
            tracing::info!(
                conn = %conn.id(),
                streams = conn.open_streams(),
                "drain grace expired: {}",
                reason
            );
        }
    }
    conn.close();
}

async fn run_call(runtime: Arc<Runtime>, conn: Arc<Connection>, call: IncomingCall) {
    let IncomingCall {
        stream_id,
        head,
        body,
        admission,
        cancel,
    } = call;
    let deadline = head
        .timeout_ms
        .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)));
    let ctx = CallContext::new(head.method.clone(), conn.address(), stream_id, deadline, cancel.clone());

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled("call cancelled by client")),
        result = with_deadline(deadline, execute(&runtime, &conn, &ctx, &head, body, admission)) => result,
    };

    match result {
        Ok(()) => {
            tracing::debug!(conn = %conn.id(), stream = %stream_id, method = %head.method, "call_finished");
        }
        Err(e) if cancel.is_cancelled() => {
            tracing::debug!(conn = %conn.id(), stream = %stream_id, method = %head.method, "call_abandoned: {}", e);
        }
        Err(e) => {
            tracing::debug!(
                conn = %conn.id(),
                stream = %stream_id,
                method = %head.method,
                code = %e.code(),
                "call_failed: {}",
                e
            );
            let frame = Frame::new(FrameKind::Error, stream_id, encode_error(&e));
            if let Err(send_err) = conn.send(frame).await {
                tracing::debug!(conn = %conn.id(), stream = %stream_id, "error frame not sent: {}", send_err);
            }
        }
    }
    conn.finish_serving(stream_id);
}

async fn execute(
    runtime: &Runtime,
    conn: &Arc<Connection>,
    ctx: &CallContext,
    head: &RequestHead,
    body: Bytes,
    admission: Admission,
) -> Result<()> {
    let _slot = admission.into_permit().await?;
    let handler = runtime
        .router
        .resolve(&head.method)
        .ok_or_else(|| Error::unimplemented(format!("unknown method: {}", head.method)))?;
    if handler.kind() != head.kind {
        return Err(Error::invalid_argument(format!(
            "{} is {:?}, called as {:?}",
            head.method,
            handler.kind(),
            head.kind
        )));
    }

    match handler {
        MethodHandler::Unary(handler) => {
            let _worker = runtime
                .workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::unavailable("worker pool closed"))?;
            let response = runtime
                .interceptors
                .call(ctx, body, handler.as_ref())
                .await?;
            conn.send(Frame::new(FrameKind::Response, ctx.stream_id(), response))
                .await
        }
        MethodHandler::ServerStreaming(handler) => {
            let sink = ResponseSink::new(conn.clone(), ctx.clone());
            handler.call(ctx, body, sink).await?;
            conn.send(Frame::empty(FrameKind::StreamEnd, ctx.stream_id()))
                .await
        }
    }
}

async fn with_deadline<T>(deadline: Option<Instant>, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or(Err(Error::DeadlineExceeded)),
        None => fut.await,
    }
}
