//! Demo greeter service: one unary and one server-streaming method.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::server::{CallContext, ResponseSink, Router};
use crate::types::Result;

pub const SAY_HELLO: &str = "hello.HelloService/SayHello";
pub const SAY_HELLO_STREAM: &str = "hello.HelloService/SayHelloStream";

/// Pause between streamed greetings.
pub const STREAM_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
    /// Unix epoch milliseconds at which the reply was produced.
    pub timestamp: i64,
}

impl HelloReply {
    fn now(message: String) -> Self {
        Self {
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub async fn say_hello(_ctx: CallContext, request: HelloRequest) -> Result<HelloReply> {
    tracing::debug!(name = %request.name, "say_hello");
    Ok(HelloReply::now(format!("Hello, {}! Greetings from the server.", request.name)))
}

pub async fn say_hello_stream(ctx: CallContext, request: HelloRequest, mut sink: ResponseSink) -> Result<()> {
    let name = &request.name;
    let messages = [
        format!("Hello, {}! This is message 1.", name),
        format!("Hello, {}! This is message 2.", name),
        format!("Hello, {}! This is message 3.", name),
        format!("Goodbye, {}! The stream is complete.", name),
    ];

    for (i, message) in messages.into_iter().enumerate() {
        sink.send_json(&HelloReply::now(message)).await?;
        tracing::debug!(method = %ctx.method(), "sent greeting {}", i + 1);
        tokio::time::sleep(STREAM_INTERVAL).await;
    }
    Ok(())
}

/// Router with both greeter methods and reflection enabled.
pub fn router() -> Router {
    Router::new()
        .unary_json(SAY_HELLO, say_hello)
        .server_streaming_json(SAY_HELLO_STREAM, say_hello_stream)
        .with_reflection()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Channel;
    use crate::server::{InterceptorChain, LoggingInterceptor, Server};
    use crate::transport::dialer::{BoxedTransport, Dialer};
    use crate::types::{ClientConfig, ServerConfig};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Arc;

    struct Loopback(Arc<Server>);

    #[async_trait]
    impl Dialer for Loopback {
        async fn dial(&self, _address: &str, _timeout: Duration) -> Result<BoxedTransport> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.0.serve_connection(server, "loopback");
            Ok(Box::new(client))
        }
    }

    fn channel() -> Channel {
        let server = Server::with_interceptors(
            ServerConfig::default(),
            router(),
            InterceptorChain::new().layer(LoggingInterceptor),
        )
        .unwrap();
        Channel::with_dialer(ClientConfig::default(), Arc::new(Loopback(Arc::new(server)))).unwrap()
    }

    #[tokio::test]
    async fn test_say_hello() {
        let reply: HelloReply = channel()
            .unary(
                SAY_HELLO,
                &HelloRequest {
                    name: "Ada".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(reply.message.contains("Ada"));
        assert!(reply.timestamp > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_say_hello_stream_sends_four() {
        let started = tokio::time::Instant::now();
        let stream = channel()
            .server_stream::<_, HelloReply>(
                SAY_HELLO_STREAM,
                &HelloRequest {
                    name: "Ada".into(),
                },
                None,
            )
            .await
            .unwrap();
        let replies: Vec<HelloReply> = stream.map(|r| r.unwrap()).collect().await;

        assert_eq!(replies.len(), 4);
        assert!(replies[3].message.starts_with("Goodbye, Ada"));
        assert!(started.elapsed() >= STREAM_INTERVAL * 4);
    }
}
