//! Establishing byte streams to a remote address.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::types::{Error, Result};

/// A connected, bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports for a channel. Swappable so tests can dial in-memory pipes.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &str, timeout: Duration) -> Result<BoxedTransport>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str, timeout: Duration) -> Result<BoxedTransport> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::Dial {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(Error::Dial {
                    address: address.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", timeout),
                    ),
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", address, e);
        }
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpDialer
            .dial(&addr, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Dial { .. }));
        assert_eq!(err.code(), crate::types::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        assert!(TcpDialer.dial(&addr, Duration::from_secs(1)).await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
