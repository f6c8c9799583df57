//! Persistent transport management: health tracking, a per-transport send
//! lock, reply demultiplexing, and reconnect-with-backoff.
//!
//! There is no dedicated background reader task here; `send_with_lock`
//! holds the transport's mutex for the whole request/reply exchange,
//! which gives the single-reader-owns-receive-side guarantee the spec
//! describes without a second task to keep in sync. Unsolicited traffic is
//! anything read that the configured correlator doesn't match.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::{Error, Result, TransportError};
use crate::session::{ConnectionMode, TransportKind};
use crate::transport::Transport;

pub type RebootstrapFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;
pub type CorrelatorFn = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxStrategy {
    Sequential,
    Tagged,
    TypeBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsolicitedPolicy {
    Log,
    Queue,
    Ignore,
}

#[derive(Clone)]
pub struct DemuxConfig {
    pub strategy: DemuxStrategy,
    pub correlator: Option<CorrelatorFn>,
    pub unsolicited: UnsolicitedPolicy,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self { strategy: DemuxStrategy::Sequential, correlator: None, unsolicited: UnsolicitedPolicy::Log }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ops_in: u64,
    pub ops_out: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub healthy: bool,
    pub stats: TransportStats,
}

pub struct ManagedTransport {
    transport: Transport,
    pub connected: bool,
    pub healthy: bool,
    pub stats: TransportStats,
    unsolicited: Vec<Vec<u8>>,
}

impl ManagedTransport {
    fn new(transport: Transport) -> Self {
        Self { transport, connected: false, healthy: true, stats: TransportStats::default(), unsolicited: Vec::new() }
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        self.transport.connect(timeout).await?;
        self.connected = true;
        self.healthy = true;
        Ok(())
    }

    /// Sends `data` then waits for the correlated reply, draining and
    /// filing away any unsolicited traffic read along the way per
    /// `demux.unsolicited`.
    async fn send_with_lock(
        &mut self,
        data: &[u8],
        timeout: Duration,
        buffer_size: usize,
        correlation_key: Option<&str>,
        demux: &DemuxConfig,
    ) -> Result<Vec<u8>> {
        self.stats.ops_out += 1;
        self.stats.bytes_out += data.len() as u64;
        if let Err(e) = self.transport.send(data).await {
            self.healthy = false;
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        const MAX_UNSOLICITED_SKIPS: u32 = 32;
        for _ in 0..MAX_UNSOLICITED_SKIPS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Transport(TransportError::ReceiveTimeout(
                    "deadline exceeded while demultiplexing replies".to_string(),
                )));
            }
            let reply = match self.transport.recv(remaining, buffer_size).await {
                Ok(r) => r,
                Err(e) => {
                    self.healthy = false;
                    return Err(e);
                }
            };
            self.stats.ops_in += 1;
            self.stats.bytes_in += reply.len() as u64;

            let matches = match (demux.strategy, correlation_key, &demux.correlator) {
                (DemuxStrategy::Sequential, _, _) => true,
                (_, Some(key), Some(extract)) => extract(&reply).as_deref() == Some(key),
                _ => true,
            };
            if matches {
                return Ok(reply);
            }
            match demux.unsolicited {
                UnsolicitedPolicy::Log => tracing::warn!(len = reply.len(), "unsolicited reply discarded"),
                UnsolicitedPolicy::Queue => self.unsolicited.push(reply),
                UnsolicitedPolicy::Ignore => {}
            }
        }
        Err(Error::Transport(TransportError::Receive("too many unsolicited replies before a match".to_string())))
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.transport.close().await
    }

    pub fn take_unsolicited(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.unsolicited)
    }
}

pub struct ConnectionManager {
    mode: ConnectionMode,
    demux: DemuxConfig,
    connect_timeout: Duration,
    buffer_size: usize,
    backoff_ms: u64,
    max_reconnects: u32,
    transports: Mutex<HashMap<String, Arc<Mutex<ManagedTransport>>>>,
}

impl ConnectionManager {
    pub fn new(
        mode: ConnectionMode,
        demux: DemuxConfig,
        connect_timeout: Duration,
        buffer_size: usize,
        backoff_ms: u64,
        max_reconnects: u32,
    ) -> Self {
        Self {
            mode,
            demux,
            connect_timeout,
            buffer_size,
            backoff_ms,
            max_reconnects,
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Connection ids are scoped by `(session_id, current_stage)` in
    /// `per_stage`, by `session_id` alone in `session`; `per_test` never
    /// reuses a key so every call gets a fresh transport.
    fn key(&self, session_id: &str, stage: &str, call_id: u64) -> String {
        match self.mode {
            ConnectionMode::Session => session_id.to_string(),
            ConnectionMode::PerStage => format!("{session_id}:{stage}"),
            ConnectionMode::PerTest => format!("{session_id}:{stage}:{call_id}"),
        }
    }

    pub async fn get_or_connect(
        &self,
        session_id: &str,
        stage: &str,
        call_id: u64,
        kind: TransportKind,
        host: &str,
        port: u16,
    ) -> Result<Arc<Mutex<ManagedTransport>>> {
        let key = self.key(session_id, stage, call_id);
        let mut transports = self.transports.lock().await;
        if let Some(existing) = transports.get(&key) {
            return Ok(existing.clone());
        }
        let mut managed = ManagedTransport::new(Transport::new(kind, host, port));
        managed.connect(self.connect_timeout).await?;
        let handle = Arc::new(Mutex::new(managed));
        transports.insert(key, handle.clone());
        Ok(handle)
    }

    pub async fn send_with_lock(
        &self,
        handle: &Arc<Mutex<ManagedTransport>>,
        data: &[u8],
        timeout: Duration,
        correlation_key: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut guard = handle.lock().await;
        let result = guard.send_with_lock(data, timeout, self.buffer_size, correlation_key, &self.demux).await;
        if matches!(self.mode, ConnectionMode::PerTest) {
            let _ = guard.close().await;
        }
        result
    }

    /// Reports the current transport's connectedness/health for the
    /// `(session_id, stage, call_id)` key without touching it — `None` if
    /// nothing has ever connected under that key.
    pub async fn connection_status(&self, session_id: &str, stage: &str, call_id: u64) -> Option<ConnectionStatus> {
        let key = self.key(session_id, stage, call_id);
        let transports = self.transports.lock().await;
        let handle = transports.get(&key)?;
        let guard = handle.lock().await;
        Some(ConnectionStatus { connected: guard.connected, healthy: guard.healthy, stats: guard.stats })
    }

    pub async fn cleanup_unhealthy(&self, session_id: &str, stage: &str, call_id: u64) {
        let key = self.key(session_id, stage, call_id);
        let mut transports = self.transports.lock().await;
        if let Some(handle) = transports.get(&key) {
            let healthy = handle.lock().await.healthy;
            if !healthy {
                transports.remove(&key);
            }
        }
    }

    /// Reconnects with exponential backoff, capped by `max_reconnects`
    /// attempts. If `rebootstrap` is set, it is invoked once the transport
    /// is reconnected; the stage runner it closes over keeps bootstrap
    /// sequence numbers descending without collision.
    pub async fn reconnect(
        &self,
        session_id: &str,
        stage: &str,
        call_id: u64,
        kind: TransportKind,
        host: &str,
        port: u16,
        rebootstrap: Option<&RebootstrapFn>,
    ) -> Result<()> {
        let key = self.key(session_id, stage, call_id);
        let mut delay = self.backoff_ms;
        let mut last_err = None;
        for attempt in 0..self.max_reconnects {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let mut managed = ManagedTransport::new(Transport::new(kind, host, port));
            match managed.connect(self.connect_timeout).await {
                Ok(()) => {
                    self.transports.lock().await.insert(key.clone(), Arc::new(Mutex::new(managed)));
                    if let Some(cb) = rebootstrap {
                        cb().await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, session_id, "reconnect attempt failed: {e}");
                    last_err = Some(e);
                    delay *= 2;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Transport(TransportError::ConnectionRefused(host.to_string()))))
    }
}
