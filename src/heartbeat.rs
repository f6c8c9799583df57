//! Per-session keep-alive task. Sends a configured message on an interval,
//! using the connection manager's send mutex so a heartbeat can never
//! interleave with a fuzz send mid-packet.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::context::ProtocolContext;
use crate::data_model::{parser, DataModel, FieldMap};
use crate::error::{Error, OrchestrationError, Result};

#[derive(Debug, Clone)]
pub enum IntervalSource {
    FixedMs(u64),
    FromContext(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutAction {
    Warn,
    Reconnect,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatStatus {
    Healthy,
    Warning,
    Failed,
    Disabled,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: IntervalSource,
    pub jitter_ms: u64,
    pub data_model: DataModel,
    pub expect_response: bool,
    pub response_timeout: Duration,
    pub on_timeout: TimeoutAction,
    pub max_failures: u32,
}

pub type SendFn = Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> + Send + Sync>;
pub type ReconnectFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;
pub type AbortFn = Arc<dyn Fn() + Send + Sync>;

/// Shared, lock-free status handle the orchestrator can poll without
/// touching the task that owns the scheduler loop.
#[derive(Clone)]
pub struct HeartbeatHandle {
    status: Arc<std::sync::Mutex<HeartbeatStatus>>,
    failures: Arc<AtomicU32>,
    stop: watch::Sender<bool>,
}

impl HeartbeatHandle {
    pub fn status(&self) -> HeartbeatStatus {
        *self.status.lock().unwrap()
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Shares `status`/`failures` with the running scheduler, so this
    /// takes effect on its very next tick without a restart.
    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.status.lock().unwrap() = HeartbeatStatus::Healthy;
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

pub struct HeartbeatScheduler {
    config: HeartbeatConfig,
    send: SendFn,
    reconnect: Option<ReconnectFn>,
    abort: AbortFn,
    status: Arc<std::sync::Mutex<HeartbeatStatus>>,
    failures: Arc<AtomicU32>,
}

impl HeartbeatScheduler {
    pub fn new(config: HeartbeatConfig, send: SendFn, reconnect: Option<ReconnectFn>, abort: AbortFn) -> Self {
        Self {
            config,
            send,
            reconnect,
            abort,
            status: Arc::new(std::sync::Mutex::new(HeartbeatStatus::Healthy)),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.status.lock().unwrap() = HeartbeatStatus::Healthy;
    }

    pub fn status(&self) -> HeartbeatStatus {
        *self.status.lock().unwrap()
    }

    fn interval_ms(&self, ctx: &ProtocolContext) -> u64 {
        match &self.config.interval {
            IntervalSource::FixedMs(ms) => *ms,
            IntervalSource::FromContext(key) => match ctx.get(key) {
                Some(crate::context::ContextValue::Int(v)) if *v > 0 => *v as u64,
                _ => 1000,
            },
        }
    }

    /// Spawns the tick loop as a background task and returns a handle the
    /// caller uses to observe status and request a stop. `ctx` is behind a
    /// mutex because the stage runner and response planner also touch it.
    pub fn spawn(mut self, ctx: Arc<tokio::sync::Mutex<ProtocolContext>>) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = HeartbeatHandle { status: self.status.clone(), failures: self.failures.clone(), stop: stop_tx };

        tokio::spawn(async move {
            loop {
                let interval_ms = {
                    let guard = ctx.lock().await;
                    self.interval_ms(&guard)
                };
                let jitter = if self.config.jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=self.config.jitter_ms * 2) as i64 - self.config.jitter_ms as i64
                } else {
                    0
                };
                let sleep_ms = (interval_ms as i64 + jitter).max(0) as u64;

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                    _ = stop_rx.changed() => {
                        *self.status.lock().unwrap() = HeartbeatStatus::Stopped;
                        return;
                    }
                }

                if let Err(e) = self.tick(&ctx).await {
                    tracing::warn!("heartbeat tick failed: {e}");
                }

                if *stop_rx.borrow() {
                    *self.status.lock().unwrap() = HeartbeatStatus::Stopped;
                    return;
                }
            }
        });

        handle
    }

    async fn tick(&mut self, ctx: &Arc<tokio::sync::Mutex<ProtocolContext>>) -> Result<()> {
        let request = {
            let guard = ctx.lock().await;
            let serialize_ctx = parser::SerializeContext::new(&guard, 0);
            parser::serialize(&self.config.data_model, &FieldMap::new(), &serialize_ctx)?.0
        };

        let outcome = if self.config.expect_response {
            tokio::time::timeout(self.config.response_timeout, (self.send)(request)).await
        } else {
            let _ = (self.send)(request).await;
            return Ok(());
        };

        match outcome {
            Ok(Ok(_reply)) => {
                self.reset_failures();
                Ok(())
            }
            Ok(Err(e)) => {
                self.on_failure().await;
                Err(e)
            }
            Err(_) => {
                self.on_failure().await;
                Err(Error::Orchestration(OrchestrationError::HeartbeatAbort("response timed out".to_string())))
            }
        }
    }

    async fn on_failure(&mut self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.config.max_failures {
            *self.status.lock().unwrap() = HeartbeatStatus::Warning;
            return;
        }

        match self.config.on_timeout {
            TimeoutAction::Warn => {
                *self.status.lock().unwrap() = HeartbeatStatus::Warning;
            }
            TimeoutAction::Reconnect => {
                if let Some(reconnect) = &self.reconnect {
                    match reconnect().await {
                        Ok(()) => self.reset_failures(),
                        Err(e) => {
                            tracing::warn!("heartbeat reconnect failed: {e}");
                            *self.status.lock().unwrap() = HeartbeatStatus::Failed;
                        }
                    }
                }
            }
            TimeoutAction::Abort => {
                *self.status.lock().unwrap() = HeartbeatStatus::Failed;
                (self.abort)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Block, FieldType};
    use std::sync::atomic::AtomicBool;

    fn ping_model() -> DataModel {
        DataModel::new(vec![Block::new("ping", FieldType::UInt8)]).unwrap()
    }

    fn config(max_failures: u32, on_timeout: TimeoutAction) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: IntervalSource::FixedMs(10),
            jitter_ms: 0,
            data_model: ping_model(),
            expect_response: true,
            response_timeout: Duration::from_millis(50),
            on_timeout,
            max_failures,
        }
    }

    #[tokio::test]
    async fn successful_tick_resets_failures() {
        let send: SendFn = Arc::new(|_| Box::pin(async { Ok(vec![1]) }));
        let mut scheduler = HeartbeatScheduler::new(config(3, TimeoutAction::Warn), send, None, Arc::new(|| {}));
        let ctx = Arc::new(tokio::sync::Mutex::new(ProtocolContext::new()));
        scheduler.tick(&ctx).await.unwrap();
        assert_eq!(scheduler.status(), HeartbeatStatus::Healthy);
        assert_eq!(scheduler.failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn abort_action_invokes_callback_after_max_failures() {
        let send: SendFn = Arc::new(|_| Box::pin(async { Err(Error::Orchestration(OrchestrationError::ConnectionAbort("down".to_string()))) }));
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_clone = aborted.clone();
        let abort: AbortFn = Arc::new(move || aborted_clone.store(true, Ordering::Relaxed));
        let mut scheduler = HeartbeatScheduler::new(config(1, TimeoutAction::Abort), send, None, abort);
        let ctx = Arc::new(tokio::sync::Mutex::new(ProtocolContext::new()));
        let _ = scheduler.tick(&ctx).await;
        assert!(aborted.load(Ordering::Relaxed));
        assert_eq!(scheduler.status(), HeartbeatStatus::Failed);
    }

    #[tokio::test]
    async fn reconnect_action_resets_on_success() {
        let send: SendFn = Arc::new(|_| Box::pin(async { Err(Error::Orchestration(OrchestrationError::ConnectionAbort("down".to_string()))) }));
        let reconnect: ReconnectFn = Arc::new(|| Box::pin(async { Ok(()) }));
        let mut scheduler = HeartbeatScheduler::new(config(1, TimeoutAction::Reconnect), send, Some(reconnect), Arc::new(|| {}));
        let ctx = Arc::new(tokio::sync::Mutex::new(ProtocolContext::new()));
        let _ = scheduler.tick(&ctx).await;
        assert_eq!(scheduler.status(), HeartbeatStatus::Healthy);
    }

    #[test]
    fn handle_reset_failures_clears_shared_scheduler_state() {
        let send: SendFn = Arc::new(|_| Box::pin(async { Ok(vec![]) }));
        let scheduler = HeartbeatScheduler::new(config(3, TimeoutAction::Warn), send, None, Arc::new(|| {}));
        scheduler.failures.store(2, Ordering::Relaxed);
        *scheduler.status.lock().unwrap() = HeartbeatStatus::Warning;

        let handle = HeartbeatHandle {
            status: scheduler.status.clone(),
            failures: scheduler.failures.clone(),
            stop: watch::channel(false).0,
        };
        handle.reset_failures();

        assert_eq!(scheduler.failures.load(Ordering::Relaxed), 0);
        assert_eq!(scheduler.status(), HeartbeatStatus::Healthy);
        assert_eq!(handle.failures(), 0);
        assert_eq!(handle.status(), HeartbeatStatus::Healthy);
    }

    #[test]
    fn from_context_interval_falls_back_when_missing() {
        let send: SendFn = Arc::new(|_| Box::pin(async { Ok(vec![]) }));
        let scheduler = HeartbeatScheduler::new(
            HeartbeatConfig { interval: IntervalSource::FromContext("hb_interval".to_string()), ..config(3, TimeoutAction::Warn) },
            send,
            None,
            Arc::new(|| {}),
        );
        let ctx = ProtocolContext::new();
        assert_eq!(scheduler.interval_ms(&ctx), 1000);
    }
}
