//! Byte stream transports
//!
//! A session runs over any bidirectional byte stream. TCP to an INDI server
//! is the default; tests and embedders can supply their own.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::IndiConfig;
use crate::error::{IndiError, IndiResult};

/// Bidirectional byte stream a session can run on
pub trait IndiStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IndiStream for T {}

pub type BoxedStream = Box<dyn IndiStream>;

/// Opens the byte stream for a session
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &IndiConfig) -> IndiResult<BoxedStream>;
}

/// TCP connection to `config.host:config.port`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, config: &IndiConfig) -> IndiResult<BoxedStream> {
        let addr = config.address();
        let connection_timeout = config.connection_timeout();
        tracing::debug!("Connecting to INDI server at {}", addr);

        // Apply connection timeout
        let stream = match timeout(connection_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}. Check that the server is running and the address is correct.",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(IndiError::ConnectionTimeout {
                    host: config.host.clone(),
                    port: config.port,
                    duration: connection_timeout,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle on {}: {}", addr, e);
        }
        Ok(Box::new(stream))
    }
}
