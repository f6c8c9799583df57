//! UDP transport: single datagram send, single datagram recv with timeout.

use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{Error, Result, TransportError};

pub struct UdpTransport {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, socket: None }
    }

    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let socket = tokio::time::timeout(timeout, UdpSocket::bind("0.0.0.0:0"))
            .await
            .map_err(|_| Error::Transport(TransportError::ConnectionTimeout(addr.clone())))?
            .map_err(|e| Error::Transport(TransportError::ConnectionRefused(e.to_string())))?;
        socket.connect(&addr).await.map_err(|e| Error::Transport(TransportError::ConnectionRefused(e.to_string())))?;
        self.socket = Some(socket);
        Ok(())
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            Error::Transport(TransportError::Send("not connected".to_string()))
        })?;
        socket.send(data).await.map_err(|e| Error::Transport(TransportError::Send(e.to_string())))?;
        Ok(())
    }

    pub async fn recv(&mut self, timeout: Duration, buffer_size: usize) -> Result<Vec<u8>> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            Error::Transport(TransportError::Receive("not connected".to_string()))
        })?;
        let mut buf = vec![0u8; buffer_size];
        let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Transport(TransportError::ReceiveTimeout(format!("no datagram within {timeout:?}"))))?
            .map_err(|e| Error::Transport(TransportError::Receive(e.to_string())))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}
