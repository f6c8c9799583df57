//! TCP transport: connect with timeout, `sendall` then accumulate reads up
//! to a configured buffer size until timeout or the peer sends FIN.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result, TransportError};

pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, stream: None }
    }

    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Transport(TransportError::ConnectionTimeout(addr.clone())))?
            .map_err(|e| Error::Transport(TransportError::ConnectionRefused(format!("{addr}: {e}"))))?;
        self.stream = Some(stream);
        Ok(())
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            Error::Transport(TransportError::Send("not connected".to_string()))
        })?;
        stream.write_all(data).await.map_err(|e| Error::Transport(TransportError::Send(e.to_string())))?;
        stream.flush().await.map_err(|e| Error::Transport(TransportError::Send(e.to_string())))?;
        Ok(())
    }

    /// Reads until `buffer_size` bytes are collected, the peer closes the
    /// connection (FIN, a zero-length read), or an individual read times
    /// out. A timeout with no bytes yet collected is reported distinctly
    /// from a connection reset so callers can tell "nothing came back" from
    /// "the target died".
    pub async fn recv(&mut self, timeout: Duration, buffer_size: usize) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            Error::Transport(TransportError::Receive("not connected".to_string()))
        })?;

        let mut out = Vec::new();
        let mut chunk = vec![0u8; buffer_size];
        loop {
            if out.len() >= buffer_size {
                break;
            }
            match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break, // FIN
                Ok(Ok(n)) => {
                    out.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => {
                    return Err(Error::Transport(TransportError::Receive(e.to_string())));
                }
                Err(_) if out.is_empty() => {
                    return Err(Error::Transport(TransportError::ReceiveTimeout(format!(
                        "no data within {timeout:?}"
                    ))));
                }
                Err(_) => break, // partial read already collected, timeout ends the read loop
            }
        }
        Ok(out)
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
