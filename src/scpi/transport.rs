//! TCP transport for SCPI sinks.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{ScpiConnector, ScpiLink, ScpiResponse, RESPONSE_TIMEOUT_MS, SCPI_PORT};
use crate::error::{BenchError, BenchResult};

/// Connect timeout for the TCP handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest response chunk read in one go
const READ_CHUNK: usize = 4096;

/// Opens [`TcpScpiLink`]s to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpScpiConnector {
    port: u16,
    response_timeout: Duration,
}

impl Default for TcpScpiConnector {
    fn default() -> Self {
        Self::new(SCPI_PORT, Duration::from_millis(RESPONSE_TIMEOUT_MS))
    }
}

impl TcpScpiConnector {
    /// Create a connector for a given port and response window
    pub fn new(port: u16, response_timeout: Duration) -> Self {
        Self {
            port,
            response_timeout,
        }
    }

    /// Port this connector dials
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Response window applied to every command
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }
}

#[async_trait]
impl ScpiConnector for TcpScpiConnector {
    async fn open(&self, host: &str) -> BenchResult<Box<dyn ScpiLink>> {
        let mut link = TcpScpiLink::connect(host, self.port, self.response_timeout).await?;

        match link.send("*IDN?").await {
            Ok(identity) => {
                info!(host, port = self.port, identity = %identity.msg, "SCPI device identified");
                Ok(Box::new(link))
            }
            Err(err) => {
                link.close().await;
                Err(BenchError::Identification {
                    host: host.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// A single TCP connection to an SCPI device.
#[derive(Debug)]
pub struct TcpScpiLink {
    host: String,
    stream: Option<TcpStream>,
    response_timeout: Duration,
}

impl TcpScpiLink {
    /// Open the TCP connection without identifying the peer
    pub async fn connect(host: &str, port: u16, response_timeout: Duration) -> BenchResult<Self> {
        if host.trim().is_empty() || host.contains(char::is_whitespace) {
            return Err(BenchError::InvalidAddress(host.to_string()));
        }

        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(BenchError::Connect {
                    host: host.to_string(),
                    port,
                    source,
                })
            }
            Err(_) => {
                return Err(BenchError::Connect {
                    host: host.to_string(),
                    port,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection attempt timed out",
                    ),
                })
            }
        };

        // Commands are tiny; don't let Nagle hold them back.
        stream.set_nodelay(true).map_err(|source| BenchError::Connect {
            host: host.to_string(),
            port,
            source,
        })?;

        debug!(host, port, "SCPI connection opened");

        Ok(Self {
            host: host.to_string(),
            stream: Some(stream),
            response_timeout,
        })
    }

    fn stream(&mut self, command: &str) -> BenchResult<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| BenchError::Transport {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "link already closed"),
        })
    }
}

#[async_trait]
impl ScpiLink for TcpScpiLink {
    async fn send(&mut self, command: &str) -> BenchResult<ScpiResponse> {
        let response_timeout = self.response_timeout;
        let host = self.host.clone();
        let stream = self.stream(command)?;

        debug!(host = %host, command, "SCPI write");
        let line = format!("{command}\n");
        let transport = |source| BenchError::Transport {
            command: command.to_string(),
            source,
        };
        stream.write_all(line.as_bytes()).await.map_err(transport)?;
        stream.flush().await.map_err(transport)?;

        // Whatever arrives next is the response. A reply that misses the window
        // is read as the response to the following command.
        let mut buf = vec![0u8; READ_CHUNK];
        match timeout(response_timeout, stream.read(&mut buf)).await {
            Err(_) => {
                debug!(host = %host, command, "No response within window");
                Ok(ScpiResponse::no_data())
            }
            Ok(Ok(0)) => Err(BenchError::ConnectionClosed(command.to_string())),
            Ok(Ok(n)) => {
                let response = ScpiResponse::data(String::from_utf8_lossy(&buf[..n]));
                debug!(host = %host, command, response = %response.msg, "SCPI response");
                Ok(response)
            }
            Ok(Err(source)) => Err(transport(source)),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                warn!(host = %self.host, error = %err, "Error shutting down SCPI connection");
            }
            debug!(host = %self.host, "SCPI connection closed");
        }
    }
}
