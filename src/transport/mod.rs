//! Network transports: TCP and UDP, behind one enum so the connection
//! manager can hold either without a trait object.

pub mod tcp;
pub mod udp;

use std::time::Duration;

use crate::error::Result;
use crate::session::TransportKind;

use tcp::TcpTransport;
use udp::UdpTransport;

pub enum Transport {
    Tcp(TcpTransport),
    Udp(UdpTransport),
}

impl Transport {
    pub fn new(kind: TransportKind, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        match kind {
            TransportKind::Tcp => Transport::Tcp(TcpTransport::new(host, port)),
            TransportKind::Udp => Transport::Udp(UdpTransport::new(host, port)),
        }
    }

    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.connect(timeout).await,
            Transport::Udp(t) => t.connect(timeout).await,
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.send(data).await,
            Transport::Udp(t) => t.send(data).await,
        }
    }

    pub async fn recv(&mut self, timeout: Duration, buffer_size: usize) -> Result<Vec<u8>> {
        match self {
            Transport::Tcp(t) => t.recv(timeout, buffer_size).await,
            Transport::Udp(t) => t.recv(timeout, buffer_size).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.close().await,
            Transport::Udp(t) => t.close().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Tcp(t) => t.is_connected(),
            Transport::Udp(t) => t.is_connected(),
        }
    }

    pub async fn send_and_receive(&mut self, data: &[u8], timeout: Duration, buffer_size: usize) -> Result<Vec<u8>> {
        self.send(data).await?;
        self.recv(timeout, buffer_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_echo_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut socket, &buf[..n]).await.unwrap();
        });

        let mut transport = Transport::new(TransportKind::Tcp, addr.ip().to_string(), addr.port());
        transport.connect(Duration::from_secs(1)).await.unwrap();
        let reply = transport.send_and_receive(b"ping", Duration::from_secs(1), 64).await.unwrap();
        assert_eq!(reply, b"ping");
    }
}
