//! Session lifecycle, the fuzzing loop, and component wiring. The
//! orchestrator is the sole owner of runtime state for every session it
//! manages: connection manager, stateful session, mutation engine, and
//! history writer all live behind `Arc`s handed to the session's tasks
//! rather than ambient singletons.

pub mod replay;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::SharedAgentDispatcher;
use crate::config::FuzzerConfig;
use crate::connection::{ConnectionManager, DemuxConfig, DemuxStrategy, UnsolicitedPolicy};
use crate::context::{ContextValue, ProtocolContext};
use crate::corpus::{CorpusStore, FindingKind, FindingReport, Severity};
use crate::data_model::parser::SerializeContext;
use crate::data_model::{parser, BehaviorOp, DataModel, FieldMap, FieldValue};
use crate::error::{Error, Result, SessionError};
use crate::heartbeat::{
    HeartbeatConfig, HeartbeatHandle, HeartbeatScheduler, HeartbeatStatus, IntervalSource, TimeoutAction,
};
use crate::history::{ExecutionHistory, TestCaseExecutionRecord, TestResult};
use crate::mutation::MutationEngine;
use crate::plugin::{PluginCallbacks, PluginManager, ResponseVerdict};
use crate::session::stateful::{self, StatefulSession};
use crate::session::{ConnectionMode, ExecutionMode, FuzzSession, FuzzingMode, Target};
use crate::session_store::SessionStore;
use crate::stage::{Role, Stage, StageRunner};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn now_unix() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Tracks per-field counter state for `behavior: increment` fields.
/// `add_constant` is stateless (always `initial + step`) so it needs no
/// entry here; `increment` accumulates `step` on every call and wraps back
/// to `initial` once it would reach `wrap`.
#[derive(Default)]
struct BehaviorTracker {
    counters: HashMap<String, i64>,
}

impl BehaviorTracker {
    fn apply(&mut self, model: &DataModel, overrides: &mut FieldMap) {
        for block in &model.blocks {
            let Some(spec) = &block.behavior else { continue };
            let next = match spec.operation {
                BehaviorOp::AddConstant => spec.initial + spec.step,
                BehaviorOp::Increment => {
                    let current = *self.counters.get(&block.name).unwrap_or(&spec.initial);
                    let mut candidate = current + spec.step;
                    if let Some(wrap) = spec.wrap {
                        if candidate >= wrap {
                            candidate = spec.initial;
                        }
                    }
                    self.counters.insert(block.name.clone(), candidate);
                    candidate
                }
            };
            let value =
                if block.field_type.is_signed() { FieldValue::Int(next) } else { FieldValue::UInt(next.max(0) as u64) };
            overrides.insert(block.name.clone(), value);
        }
    }
}

/// Builds the `overrides` map the fuzz loop re-serializes with: the
/// mutated bytes re-parsed against the model (so structurally-untouched
/// fields round-trip), `from_context` fields stripped back out (parser's
/// own `resolve` must derive those fresh, or a stale re-parsed value would
/// wrongly win over the correct context-derived one), an optional
/// message-type override for stateful transition enforcement, and behavior
/// values layered on top.
///
/// Returns `None` when the mutated bytes no longer parse against the model
/// at all (a mutation broke the layout past recovery) — the caller skips
/// the iteration in that case, per the parser-error propagation policy.
fn build_overrides(
    model: &DataModel,
    mutated: &[u8],
    command_override: Option<(String, FieldValue)>,
    behaviors: &mut BehaviorTracker,
) -> Option<FieldMap> {
    let mut overrides = match parser::parse(model, mutated) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::debug!("mutated bytes no longer parse against the data model, skipping iteration: {e}");
            return None;
        }
    };
    for block in &model.blocks {
        if block.from_context.is_some() {
            overrides.shift_remove(&block.name);
        }
    }
    if let Some((name, value)) = command_override {
        overrides.insert(name, value);
    }
    behaviors.apply(model, &mut overrides);
    Some(overrides)
}

/// Records a run of bootstrap `StageOutcome`s as history entries with
/// descending sequence numbers, continuing from wherever `bootstrap_seq`
/// last left off so a reconnect-triggered rebootstrap never collides with
/// the session's original bootstrap numbers.
async fn record_bootstrap_outcomes(
    history: &ExecutionHistory,
    bootstrap_seq: &AtomicI64,
    context: &AsyncMutex<ProtocolContext>,
    session_id: Uuid,
    outcomes: &[crate::stage::StageOutcome],
) -> Result<()> {
    let mut seq = bootstrap_seq.load(Ordering::Relaxed);
    for outcome in outcomes {
        seq -= 1;
        let context_snapshot = Some(context.lock().await.snapshot()?);
        let record = TestCaseExecutionRecord {
            session_id,
            sequence_number: seq,
            timestamp_sent: now_unix(),
            timestamp_response: Some(now_unix()),
            payload_bytes: outcome.request.clone(),
            payload_sha256: sha256_hex(&outcome.request),
            payload_size: outcome.request.len(),
            stage_name: outcome.stage_name.clone(),
            current_state: None,
            context_snapshot,
            parsed_fields: outcome.parsed_response.clone(),
            response_preview: outcome.response.clone(),
            result: if outcome.passed { TestResult::Pass } else { TestResult::LogicalFailure },
            duration_ms: 0,
            connection_sequence: None,
        };
        history.record(record)?;
    }
    bootstrap_seq.store(seq, Ordering::Relaxed);
    Ok(())
}

fn finding_kind_for(result: TestResult) -> Option<(FindingKind, Severity)> {
    match result {
        TestResult::Pass => None,
        TestResult::Crash => Some((FindingKind::Crash, Severity::High)),
        TestResult::Hang => Some((FindingKind::Hang, Severity::Medium)),
        TestResult::LogicalFailure => Some((FindingKind::LogicalFailure, Severity::Medium)),
        TestResult::Anomaly => Some((FindingKind::Anomaly, Severity::Low)),
    }
}

/// Everything the orchestrator needs to run and stop a session's fuzz
/// loop, bootstrap/teardown, and heartbeat. One instance per active
/// session, held in [`Orchestrator::runtimes`].
struct SessionRuntime {
    target: Target,
    connection: Arc<ConnectionManager>,
    context: Arc<AsyncMutex<ProtocolContext>>,
    history: Arc<ExecutionHistory>,
    mutation: Arc<AsyncMutex<MutationEngine>>,
    stateful: Option<Arc<AsyncMutex<StatefulSession>>>,
    behaviors: Arc<std::sync::Mutex<BehaviorTracker>>,
    bootstrap_seq: Arc<AtomicI64>,
    stages: Vec<Stage>,
    fuzz_model: DataModel,
    response_model: Option<DataModel>,
    callbacks: Option<PluginCallbacks>,
    seeds: Vec<Vec<u8>>,
    checkpoint_frequency: u64,
    heartbeat_spec: Option<crate::plugin::HeartbeatSpec>,
    heartbeat: Option<HeartbeatHandle>,
    cancel: watch::Sender<bool>,
    loop_handle: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    config: FuzzerConfig,
    plugins: Arc<AsyncMutex<PluginManager>>,
    session_store: Arc<SessionStore>,
    corpus: Arc<AsyncMutex<CorpusStore>>,
    agents: SharedAgentDispatcher,
    sessions: Arc<AsyncMutex<HashMap<Uuid, FuzzSession>>>,
    runtimes: Arc<AsyncMutex<HashMap<Uuid, SessionRuntime>>>,
}

/// Aggregate view for the `stats` operation: the session's own counters
/// plus its live heartbeat/connection status, neither of which `FuzzSession`
/// itself tracks (both belong to the runtime, not the persisted record).
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub status: crate::session::SessionStatus,
    pub counters: crate::session::SessionCounters,
    pub heartbeat_status: HeartbeatStatus,
    pub connection_status: Option<crate::connection::ConnectionStatus>,
}

/// Parameters for [`Orchestrator::create_session`]; one screen's worth of
/// knobs a caller (the HTTP layer, in the full system) fills in from a
/// request body.
pub struct SessionSpec {
    pub plugin_name: String,
    pub target: Target,
    pub connection_mode: ConnectionMode,
    pub execution_mode: ExecutionMode,
    pub fuzzing_mode: FuzzingMode,
    pub target_state: Option<String>,
    pub mutation: crate::session::MutationConfig,
    pub stateful: Option<crate::session::StatefulConfig>,
    pub rng_seed: u64,
}

impl Orchestrator {
    pub fn new(
        config: FuzzerConfig,
        plugins: PluginManager,
        session_store: SessionStore,
        corpus: CorpusStore,
        agents: SharedAgentDispatcher,
    ) -> Self {
        Self {
            config,
            plugins: Arc::new(AsyncMutex::new(plugins)),
            session_store: Arc::new(session_store),
            corpus: Arc::new(AsyncMutex::new(corpus)),
            agents,
            sessions: Arc::new(AsyncMutex::new(HashMap::new())),
            runtimes: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Restores every persisted session on process startup. Sessions that
    /// were `running`/`paused` come back as `paused`; their runtime
    /// helpers no longer exist (the previous process owned them), so a
    /// user-driven `start_session` rebuilds them.
    pub fn reconcile_on_startup(&self) -> Result<()> {
        let restored = crate::session_store::reconcile_on_startup(&self.session_store, |session| {
            // The plugin must still exist for this session to be resumable.
            futures_block_on_plugins(&self.plugins, &session.protocol_name)
        })?;
        let mut sessions = self.sessions.blocking_lock();
        for session in restored {
            sessions.insert(session.id, session);
        }
        Ok(())
    }

    fn stage_role_model(stages: &[Stage], role: Role) -> Vec<&Stage> {
        stages.iter().filter(|s| s.role == role).collect()
    }

    /// Loads the plugin, persists a fresh session, seeds the corpus from
    /// the plugin's declared seeds (or auto-generates defaults), and
    /// builds its runtime (not yet started).
    pub async fn create_session(&self, spec: SessionSpec) -> Result<Uuid> {
        let manifest = {
            let plugins = self.plugins.lock().await;
            plugins
                .get_plugin(&spec.plugin_name)
                .cloned()
                .ok_or_else(|| Error::Plugin(crate::error::PluginError::Load(spec.plugin_name.clone())))?
        };
        let callbacks = {
            let plugins = self.plugins.lock().await;
            plugins.get_callbacks(&spec.plugin_name).cloned()
        };

        let mut session = FuzzSession::new(spec.plugin_name.clone(), spec.target.clone(), spec.connection_mode);
        session.mutation = spec.mutation.clone();
        session.execution_mode = spec.execution_mode;
        session.fuzzing_mode = spec.fuzzing_mode;
        session.target_state = spec.target_state.clone();
        session.stateful = spec.stateful.clone();

        let stages = manifest.protocol_stack.clone().unwrap_or_else(|| {
            vec![Stage::new("fuzz_target", Role::FuzzTarget, manifest.data_model.clone())]
        });
        let fuzz_stage = stages
            .iter()
            .find(|s| s.role == Role::FuzzTarget)
            .ok_or_else(|| Error::Session(SessionError::Initialization("no fuzz_target stage declared".to_string())))?;
        let fuzz_model = fuzz_stage.data_model.clone();
        let response_model = fuzz_stage.response_model.clone().or_else(|| manifest.response_model.clone());

        let seed_bytes = {
            let declared = manifest.decoded_seeds()?;
            if declared.is_empty() {
                crate::corpus::seeds::generate_default_seeds(&fuzz_model)?
            } else {
                declared
            }
        };
        {
            let mut corpus = self.corpus.lock().await;
            for seed in &seed_bytes {
                corpus.put_seed(seed)?;
            }
        }

        let demux = DemuxConfig {
            strategy: DemuxStrategy::Sequential,
            correlator: None,
            unsolicited: UnsolicitedPolicy::Log,
        };
        let conn_spec = manifest.connection.clone();
        let connection = Arc::new(ConnectionManager::new(
            spec.connection_mode,
            demux,
            conn_spec.as_ref().map(|c| Duration::from_millis(c.connect_timeout_ms)).unwrap_or(Duration::from_secs(5)),
            match spec.target.transport {
                crate::session::TransportKind::Tcp => self.config.tcp_buffer_size,
                crate::session::TransportKind::Udp => self.config.udp_buffer_size,
            },
            conn_spec.as_ref().map(|c| c.backoff_ms).unwrap_or(100),
            conn_spec.as_ref().map(|c| c.max_reconnects).unwrap_or(5),
        ));

        let history_dir = self.config.corpus_dir.join("history");
        std::fs::create_dir_all(&history_dir)?;
        let history_path = history_dir.join(format!("{}.db", session.id));
        let history = Arc::new({
            let mut h = ExecutionHistory::new(&history_path, session.id, self.config.default_history_limit)?;
            h.start_writer();
            h
        });

        let stateful = manifest.state_model.clone().map(|model| {
            let reset_interval = spec
                .stateful
                .as_ref()
                .map(|s| s.reset_interval)
                .unwrap_or_else(|| match spec.fuzzing_mode {
                    FuzzingMode::Bfs => self.config.stateful_reset_interval_bfs,
                    FuzzingMode::Dfs => self.config.stateful_reset_interval_dfs,
                    FuzzingMode::Targeted => self.config.stateful_reset_interval_targeted,
                    FuzzingMode::Random => self.config.stateful_reset_interval_random,
                });
            let enable_termination = spec.stateful.as_ref().map(|s| s.enable_termination_fuzzing).unwrap_or(false);
            let termination_interval =
                spec.stateful.as_ref().map(|s| s.termination_test_interval).unwrap_or(self.config.termination_test_interval);
            let termination_window =
                spec.stateful.as_ref().map(|s| s.termination_test_window).unwrap_or(self.config.termination_test_window);
            Arc::new(AsyncMutex::new(StatefulSession::new(
                model,
                spec.fuzzing_mode,
                spec.target_state.clone(),
                self.config.stateful_progression_weight,
                reset_interval,
                enable_termination,
                termination_interval,
                termination_window,
                spec.rng_seed,
            )))
        });

        let mutation = Arc::new(AsyncMutex::new(MutationEngine::new(
            session.mutation.mode,
            session.mutation.structure_aware_weight,
            spec.rng_seed,
            self.config.havoc_max_size,
        )));

        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let runtime = SessionRuntime {
            target: spec.target.clone(),
            connection,
            context: Arc::new(AsyncMutex::new(ProtocolContext::new())),
            history,
            mutation,
            stateful,
            behaviors: Arc::new(std::sync::Mutex::new(BehaviorTracker::default())),
            bootstrap_seq: Arc::new(AtomicI64::new(0)),
            stages,
            fuzz_model,
            response_model,
            callbacks,
            seeds: seed_bytes,
            checkpoint_frequency: self.config.checkpoint_frequency,
            heartbeat_spec: manifest.heartbeat.clone(),
            heartbeat: None,
            cancel: cancel_tx,
            loop_handle: None,
        };

        self.session_store.save(&session)?;
        let id = session.id;
        self.sessions.lock().await.insert(id, session);
        self.runtimes.lock().await.insert(id, runtime);
        Ok(id)
    }

    /// Runs bootstrap stages, starts the heartbeat if configured, and
    /// spawns the fuzzing loop task.
    pub async fn start_session(&self, id: Uuid) -> Result<()> {
        let mut runtimes = self.runtimes.lock().await;
        let runtime = runtimes
            .get_mut(&id)
            .ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;

        let bootstrap_stages: Vec<Stage> =
            runtime.stages.iter().filter(|s| s.role == Role::Bootstrap).cloned().collect();
        if !bootstrap_stages.is_empty() {
            let outcomes = {
                let connection = runtime.connection.clone();
                let target = runtime.target.clone();
                let ctx = runtime.context.clone();
                run_stages_blocking(connection, target, ctx, bootstrap_stages.clone(), StageOp::Bootstrap)?
            };
            record_bootstrap_outcomes(&runtime.history, &runtime.bootstrap_seq, &runtime.context, id, &outcomes)
                .await?;
        }

        if let Some(hb_spec) = runtime.heartbeat_spec.clone() {
            let connection = runtime.connection.clone();
            let target = runtime.target.clone();
            let hb_config = HeartbeatConfig {
                interval: hb_spec
                    .interval_from_context
                    .clone()
                    .map(IntervalSource::FromContext)
                    .unwrap_or(IntervalSource::FixedMs(hb_spec.interval_ms)),
                jitter_ms: hb_spec.jitter_ms,
                data_model: hb_spec.data_model.clone(),
                expect_response: hb_spec.expect_response,
                response_timeout: Duration::from_millis(hb_spec.response_timeout_ms),
                on_timeout: TimeoutAction::Reconnect,
                max_failures: hb_spec.max_failures,
            };
            let send: crate::heartbeat::SendFn = {
                let connection = connection.clone();
                let target = target.clone();
                Arc::new(move |bytes: Vec<u8>| {
                    let connection = connection.clone();
                    let target = target.clone();
                    Box::pin(async move {
                        let handle = connection
                            .get_or_connect(
                                &target_key(&target),
                                "heartbeat",
                                0,
                                target.transport,
                                &target.host,
                                target.port,
                            )
                            .await?;
                        connection.send_with_lock(&handle, &bytes, Duration::from_secs(5), None).await
                    })
                })
            };
            let bootstrap_for_reconnect = bootstrap_stages.clone();
            let reconnect: crate::heartbeat::ReconnectFn = {
                let connection = connection.clone();
                let target = target.clone();
                let ctx = runtime.context.clone();
                let history = runtime.history.clone();
                let bootstrap_seq = runtime.bootstrap_seq.clone();
                Arc::new(move || {
                    let connection = connection.clone();
                    let target = target.clone();
                    let ctx = ctx.clone();
                    let history = history.clone();
                    let bootstrap_seq = bootstrap_seq.clone();
                    let stages = bootstrap_for_reconnect.clone();
                    Box::pin(async move {
                        connection
                            .reconnect(&target_key(&target), "fuzz_target", 0, target.transport, &target.host, target.port, None)
                            .await?;
                        if !stages.is_empty() {
                            let outcomes =
                                run_stages_blocking(connection.clone(), target.clone(), ctx.clone(), stages, StageOp::Bootstrap)?;
                            record_bootstrap_outcomes(&history, &bootstrap_seq, &ctx, id, &outcomes).await?;
                        }
                        Ok(())
                    })
                })
            };
            let abort: crate::heartbeat::AbortFn = {
                let cancel = runtime.cancel.clone();
                Arc::new(move || {
                    let _ = cancel.send(true);
                })
            };
            let scheduler = HeartbeatScheduler::new(hb_config, send, Some(reconnect), abort);
            runtime.heartbeat = Some(scheduler.spawn(runtime.context.clone()));
        }

        let mut session = self
            .sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        session.start();
        session.current_stage = Some("fuzz_target".to_string());
        self.session_store.save(&session)?;
        self.sessions.lock().await.insert(id, session);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        runtime.cancel = cancel_tx;
        let fuzz_ctx = FuzzLoopContext {
            session_id: id,
            connection: runtime.connection.clone(),
            target: runtime.target.clone(),
            context: runtime.context.clone(),
            history: runtime.history.clone(),
            mutation: runtime.mutation.clone(),
            stateful: runtime.stateful.clone(),
            behaviors: runtime.behaviors.clone(),
            fuzz_model: runtime.fuzz_model.clone(),
            response_model: runtime.response_model.clone(),
            callbacks: runtime.callbacks.clone(),
            seeds: runtime.seeds.clone(),
            checkpoint_frequency: runtime.checkpoint_frequency,
            bootstrap_stages: bootstrap_stages.clone(),
            bootstrap_seq: runtime.bootstrap_seq.clone(),
            corpus: self.corpus.clone(),
            sessions: self.sessions.clone(),
            session_store: self.session_store.clone(),
            cancel: cancel_rx,
        };
        runtime.loop_handle = Some(tokio::spawn(fuzz_loop(fuzz_ctx)));

        Ok(())
    }

    /// Cancels the fuzz loop, runs teardown (best-effort), stops the
    /// heartbeat, flushes history, and checkpoints.
    pub async fn stop_session(&self, id: Uuid) -> Result<()> {
        let mut runtimes = self.runtimes.lock().await;
        let runtime = runtimes
            .get_mut(&id)
            .ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;

        let _ = runtime.cancel.send(true);
        if let Some(handle) = runtime.loop_handle.take() {
            let _ = handle.await;
        }
        if let Some(hb) = runtime.heartbeat.take() {
            hb.stop();
        }

        let teardown_stages: Vec<Stage> =
            runtime.stages.iter().filter(|s| s.role == Role::Teardown).cloned().collect();
        if !teardown_stages.is_empty() {
            let connection = runtime.connection.clone();
            let target = runtime.target.clone();
            let ctx = runtime.context.clone();
            match run_stages_blocking(connection, target, ctx, teardown_stages, StageOp::Teardown) {
                Ok(_) => {}
                Err(e) => tracing::warn!(session = %id, "teardown failed: {e}"),
            }
        }

        runtime.history.flush().await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&id) {
            session.complete();
            self.session_store.save(session)?;
        }
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        if self.runtimes.lock().await.contains_key(&id) {
            let _ = self.stop_session(id).await;
        }
        self.agents.discard_session(id).await;
        self.session_store.delete(id)?;
        self.sessions.lock().await.remove(&id);
        self.runtimes.lock().await.remove(&id);
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<FuzzSession> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))
    }

    pub async fn list_sessions(&self) -> Vec<FuzzSession> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn get_context(&self, id: Uuid, key: &str) -> Result<Option<ContextValue>> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        Ok(runtime.context.lock().await.get(key).cloned())
    }

    pub async fn set_context(&self, id: Uuid, key: String, value: ContextValue) -> Result<()> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        runtime.context.lock().await.set(key, value);
        Ok(())
    }

    pub async fn delete_context(&self, id: Uuid, key: &str) -> Result<()> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        runtime.context.lock().await.delete(key);
        Ok(())
    }

    pub async fn list_stages(&self, id: Uuid) -> Result<Vec<String>> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        Ok(runtime.stages.iter().map(|s| s.name.clone()).collect())
    }

    /// Manually re-executes a named bootstrap stage without clearing the
    /// rest of the context.
    pub async fn rerun_stage(&self, id: Uuid, name: &str) -> Result<()> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        let connection = runtime.connection.clone();
        let target = runtime.target.clone();
        let ctx = runtime.context.clone();
        let stages = runtime.stages.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let handle = tokio::runtime::Handle::current();
            let mut ctx_guard = handle.block_on(ctx.lock());
            let mut runner = StageRunner::new(|bytes, timeout| {
                handle.block_on(send_via_connection(&connection, &target, "rerun", bytes, timeout))
            });
            runner.rerun_stage(&stages, &name, &mut ctx_guard)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Session(SessionError::State(e.to_string())))??;
        Ok(())
    }

    pub async fn get_heartbeat_status(&self, id: Uuid) -> Result<HeartbeatStatus> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        Ok(runtime.heartbeat.as_ref().map(|h| h.status()).unwrap_or(HeartbeatStatus::Disabled))
    }

    pub async fn reset_heartbeat_failures(&self, id: Uuid) -> Result<()> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        if let Some(handle) = runtime.heartbeat.as_ref() {
            handle.reset_failures();
        }
        Ok(())
    }

    /// Combines the session's own counters with its live heartbeat and
    /// connection status, so a caller doesn't need three separate round
    /// trips to get a full picture of a running session.
    pub async fn stats(&self, id: Uuid) -> Result<SessionStats> {
        let session = self.get_session(id).await?;
        let heartbeat_status = self.get_heartbeat_status(id).await?;
        let connection_status = self.get_connection_status(id).await?;
        Ok(SessionStats { status: session.status, counters: session.counters, heartbeat_status, connection_status })
    }

    pub async fn get_connection_status(&self, id: Uuid) -> Result<Option<crate::connection::ConnectionStatus>> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        Ok(runtime.connection.connection_status(&target_key(&runtime.target), "fuzz_target", 0).await)
    }

    /// Forces a reconnect of the session's fuzz-target transport outside
    /// the heartbeat's own failure-driven path, then reruns bootstrap on
    /// the fresh connection the same way a periodic stateful reset does.
    pub async fn force_reconnect(&self, id: Uuid) -> Result<()> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
        let connection = runtime.connection.clone();
        let target = runtime.target.clone();

        connection
            .reconnect(&target_key(&target), "fuzz_target", 0, target.transport, &target.host, target.port, None)
            .await?;

        let bootstrap_stages: Vec<Stage> =
            runtime.stages.iter().filter(|s| s.role == Role::Bootstrap).cloned().collect();
        if !bootstrap_stages.is_empty() {
            let ctx = runtime.context.clone();
            let outcomes = run_stages_blocking(connection, target, ctx, bootstrap_stages, StageOp::Bootstrap)?;
            record_bootstrap_outcomes(&runtime.history, &runtime.bootstrap_seq, &runtime.context, id, &outcomes)
                .await?;
        }
        Ok(())
    }

    /// Dry-runs `count` fuzz payloads for `name`'s `fuzz_target` stage
    /// without opening a connection: same seed-selection and mutation path
    /// the live fuzz loop uses, minus sending and context feedback.
    pub async fn preview(&self, name: &str, mode: FuzzingMode, count: usize) -> Result<Vec<Vec<u8>>> {
        let manifest = {
            let plugins = self.plugins.lock().await;
            plugins
                .get_plugin(name)
                .cloned()
                .ok_or_else(|| Error::Plugin(crate::error::PluginError::Load(name.to_string())))?
        };
        let stages = manifest.protocol_stack.clone().unwrap_or_else(|| {
            vec![Stage::new("fuzz_target", Role::FuzzTarget, manifest.data_model.clone())]
        });
        let fuzz_stage = stages
            .iter()
            .find(|s| s.role == Role::FuzzTarget)
            .ok_or_else(|| Error::Session(SessionError::Initialization("no fuzz_target stage declared".to_string())))?;
        let fuzz_model = fuzz_stage.data_model.clone();

        let seeds = {
            let declared = manifest.decoded_seeds()?;
            if declared.is_empty() { crate::corpus::seeds::generate_default_seeds(&fuzz_model)? } else { declared }
        };
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let parsed_seeds: Vec<FieldMap> =
            seeds.iter().map(|s| parser::parse(&fuzz_model, s).unwrap_or_default()).collect();

        let mut stateful = manifest.state_model.clone().map(|model| {
            StatefulSession::new(model, mode, None, self.config.stateful_progression_weight, u64::MAX, false, u64::MAX, 0, 0)
        });

        let mut engine = MutationEngine::new(crate::mutation::MutationMode::Hybrid, 50, 0, self.config.havoc_max_size);
        let empty_ctx = ProtocolContext::new();
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let transition = stateful.as_mut().and_then(|s| s.choose_next());
            let seed_idx = match &transition {
                Some(t) => stateful::find_matching_seed(&fuzz_model, &t.trigger, parsed_seeds.iter()).unwrap_or(i % seeds.len()),
                None => i % seeds.len(),
            };
            let sctx = SerializeContext::new(&empty_ctx, i as u64);
            match engine.mutate(&seeds[seed_idx], Some(&fuzz_model), None, &sctx) {
                Ok(bytes) => samples.push(bytes),
                Err(e) => tracing::debug!("preview mutation failed, skipping sample: {e}"),
            }
        }
        Ok(samples)
    }

    /// One-off execution outside any session: core mode only. `config`'s
    /// data model is used to serialize `payload_bytes` as-is (no mutation).
    pub async fn execute(
        &self,
        target: Target,
        payload_bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<(TestResult, u64, Option<Vec<u8>>)> {
        let connection = ConnectionManager::new(
            ConnectionMode::PerTest,
            DemuxConfig::default(),
            Duration::from_secs(5),
            4096,
            100,
            3,
        );
        let started = Instant::now();
        let handle = connection
            .get_or_connect(&target_key(&target), "execute", 0, target.transport, &target.host, target.port)
            .await?;
        let outcome = connection.send_with_lock(&handle, &payload_bytes, timeout, None).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(response) => Ok((TestResult::Pass, duration_ms, Some(response))),
            Err(Error::Transport(crate::error::TransportError::ReceiveTimeout(_))) => {
                Ok((TestResult::Hang, duration_ms, None))
            }
            Err(_) => Ok((TestResult::Crash, duration_ms, None)),
        }
    }
}

fn target_key(target: &Target) -> String {
    format!("{}:{}", target.host, target.port)
}

#[derive(Clone, Copy)]
enum StageOp {
    Bootstrap,
    Teardown,
}

/// Bridges the synchronous `StageRunner` closure to the async
/// `ConnectionManager`. `StageRunner::run_stage` is invoked from inside a
/// blocking task via `block_in_place` + `block_on`, which is sound because
/// the runtime this is called from always has the `rt-multi-thread`
/// feature enabled.
fn run_stages_blocking(
    connection: Arc<ConnectionManager>,
    target: Target,
    ctx: Arc<AsyncMutex<ProtocolContext>>,
    stages: Vec<Stage>,
    op: StageOp,
) -> Result<Vec<crate::stage::StageOutcome>> {
    tokio::task::block_in_place(|| {
        let handle = tokio::runtime::Handle::current();
        let mut ctx_guard = handle.block_on(ctx.lock());
        let mut runner = StageRunner::new(|bytes, timeout| {
            handle.block_on(send_via_connection(&connection, &target, "bootstrap", bytes, timeout))
        });
        match op {
            StageOp::Bootstrap => runner.run_bootstrap(&stages, &mut ctx_guard),
            StageOp::Teardown => Ok(runner.run_teardown(&stages, &mut ctx_guard)),
        }
    })
}

async fn send_via_connection(
    connection: &ConnectionManager,
    target: &Target,
    stage: &str,
    bytes: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let handle = connection.get_or_connect(&target_key(target), stage, 0, target.transport, &target.host, target.port).await?;
    connection.send_with_lock(&handle, bytes, timeout, None).await
}

/// Everything the spawned fuzz loop task needs, bundled so
/// `Orchestrator::start_session` doesn't have to hand over a dozen
/// separate arguments.
struct FuzzLoopContext {
    session_id: Uuid,
    connection: Arc<ConnectionManager>,
    target: Target,
    context: Arc<AsyncMutex<ProtocolContext>>,
    history: Arc<ExecutionHistory>,
    mutation: Arc<AsyncMutex<MutationEngine>>,
    stateful: Option<Arc<AsyncMutex<StatefulSession>>>,
    behaviors: Arc<std::sync::Mutex<BehaviorTracker>>,
    fuzz_model: DataModel,
    response_model: Option<DataModel>,
    callbacks: Option<PluginCallbacks>,
    seeds: Vec<Vec<u8>>,
    checkpoint_frequency: u64,
    bootstrap_stages: Vec<Stage>,
    bootstrap_seq: Arc<AtomicI64>,
    corpus: Arc<AsyncMutex<CorpusStore>>,
    sessions: Arc<AsyncMutex<HashMap<Uuid, FuzzSession>>>,
    session_store: Arc<SessionStore>,
    cancel: watch::Receiver<bool>,
}

async fn fuzz_loop(mut ctx: FuzzLoopContext) {
    let parsed_seeds: Vec<FieldMap> =
        ctx.seeds.iter().map(|s| parser::parse(&ctx.fuzz_model, s).unwrap_or_default()).collect();

    let mut iteration: u64 = 0;
    loop {
        if *ctx.cancel.borrow() {
            return;
        }
        if ctx.seeds.is_empty() {
            tracing::warn!(session = %ctx.session_id, "no seeds available, stopping fuzz loop");
            return;
        }

        // 1. Select seed.
        let transition = if let Some(stateful) = &ctx.stateful {
            stateful.lock().await.choose_next()
        } else {
            None
        };
        let seed_idx = match &transition {
            Some(t) => stateful::find_matching_seed(&ctx.fuzz_model, &t.trigger, parsed_seeds.iter())
                .unwrap_or((iteration as usize) % ctx.seeds.len()),
            None => (iteration as usize) % ctx.seeds.len(),
        };
        let seed = &ctx.seeds[seed_idx];

        // 2. Mutate.
        let mutated = {
            let sctx_ctx = ctx.context.lock().await;
            let sctx = SerializeContext::new(&sctx_ctx, iteration);
            let mut engine = ctx.mutation.lock().await;
            match engine.mutate(seed, Some(&ctx.fuzz_model), None, &sctx) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!("mutation failed, skipping iteration: {e}");
                    continue;
                }
            }
        };

        // 3 + 4 + 5. Enforce message type, apply behaviors, re-inject
        // context, re-serialize.
        let command_override = transition.as_ref().and_then(|t| {
            let command_field = ctx.fuzz_model.command_field()?;
            let value = stateful::command_value_for_message_type(&ctx.fuzz_model, &t.trigger)?;
            Some((command_field.name.clone(), FieldValue::Int(value)))
        });
        let overrides = {
            let mut behaviors = ctx.behaviors.lock().unwrap();
            build_overrides(&ctx.fuzz_model, &mutated, command_override, &mut behaviors)
        };
        let Some(overrides) = overrides else { continue };

        let (wire_bytes, resolved_fields) = {
            let guard = ctx.context.lock().await;
            let sctx = SerializeContext::new(&guard, iteration);
            match parser::serialize(&ctx.fuzz_model, &overrides, &sctx) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("re-serialization failed, skipping iteration: {e}");
                    continue;
                }
            }
        };

        // 6. Send.
        let started = Instant::now();
        let send_result = {
            let handle = match ctx
                .connection
                .get_or_connect(
                    &target_key(&ctx.target),
                    "fuzz_target",
                    iteration,
                    ctx.target.transport,
                    &ctx.target.host,
                    ctx.target.port,
                )
                .await
            {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(session = %ctx.session_id, "connection failed: {e}");
                    continue;
                }
            };
            ctx.connection.send_with_lock(&handle, &wire_bytes, Duration::from_secs(5), None).await
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        // 7. Classify.
        let (result, response) = classify(&send_result, ctx.callbacks.as_ref());

        // 8. Record execution.
        iteration += 1;
        let mut session_guard = ctx.sessions.lock().await;
        let Some(session) = session_guard.get_mut(&ctx.session_id) else { return };
        session.counters.total_tests += 1;
        let sequence_number = session.counters.total_tests as i64;
        match result {
            TestResult::Crash => session.counters.crashes += 1,
            TestResult::Hang => session.counters.hangs += 1,
            TestResult::Anomaly | TestResult::LogicalFailure => session.counters.anomalies += 1,
            TestResult::Pass => {}
        }
        let checkpoint_due = session.counters.total_tests % ctx.checkpoint_frequency == 0;
        let current_state = ctx.stateful.as_ref();
        let current_state_name = match current_state {
            Some(s) => Some(s.lock().await.current_state().to_string()),
            None => None,
        };

        let parsed_fields = match &ctx.response_model {
            Some(model) => response.as_deref().and_then(|r| parser::parse(model, r).ok()),
            None => None,
        };
        let response_preview = response.as_ref().map(|r| r[..r.len().min(512)].to_vec());
        let record = TestCaseExecutionRecord {
            session_id: ctx.session_id,
            sequence_number,
            timestamp_sent: now_unix(),
            timestamp_response: response.as_ref().map(|_| now_unix()),
            payload_bytes: wire_bytes.clone(),
            payload_sha256: sha256_hex(&wire_bytes),
            payload_size: wire_bytes.len(),
            stage_name: "fuzz_target".to_string(),
            current_state: current_state_name,
            context_snapshot: if checkpoint_due { ctx.context.lock().await.snapshot().ok() } else { None },
            parsed_fields: parsed_fields.or(Some(resolved_fields)),
            response_preview,
            result,
            duration_ms,
            connection_sequence: None,
        };
        if let Err(e) = ctx.history.record(record) {
            tracing::error!(session = %ctx.session_id, "failed to record execution: {e}");
        }

        // 9. Save findings for non-PASS results.
        if let Some((kind, severity)) = finding_kind_for(result) {
            let report = FindingReport {
                session_id: ctx.session_id,
                timestamp: now_unix(),
                kind,
                severity,
                error: send_result.as_ref().err().map(|e| e.to_string()),
                agent_telemetry: None,
            };
            let mut corpus = ctx.corpus.lock().await;
            if let Err(e) = corpus.save_finding(&wire_bytes, response.as_deref(), &report) {
                tracing::error!(session = %ctx.session_id, "failed to save finding: {e}");
            }
            if kind == FindingKind::Crash {
                let _ = corpus.put_seed(&wire_bytes);
            }
        }

        // 10. Update stateful coverage, consider periodic reset.
        let mut needs_rebootstrap = false;
        if let (Some(stateful), Some(transition)) = (&ctx.stateful, &transition) {
            let mut stateful_guard = stateful.lock().await;
            stateful_guard.record_transition(transition);
            session.current_state = Some(stateful_guard.current_state().to_string());
            session.state_coverage = stateful_guard.state_coverage().clone();
            session.transition_coverage = stateful_guard.transition_coverage().clone();
            if stateful_guard.should_reset() {
                stateful_guard.reset();
                session.counters.session_resets += 1;
                needs_rebootstrap = true;
            }
        }

        if checkpoint_due {
            if let Err(e) = ctx.session_store.save(session) {
                tracing::error!(session = %ctx.session_id, "checkpoint save failed: {e}");
            }
        }
        drop(session_guard);

        // A periodic reset resynchronizes the physical connection, not
        // just local state-machine bookkeeping: force a reconnect and
        // rerun bootstrap so the target sees the same handshake a fresh
        // session would. Held locks are dropped first so a slow
        // reconnect/backoff cycle doesn't stall other sessions sharing
        // the session map's lock.
        if needs_rebootstrap && !ctx.bootstrap_stages.is_empty() {
            let reconnected = ctx
                .connection
                .reconnect(
                    &target_key(&ctx.target),
                    "fuzz_target",
                    iteration,
                    ctx.target.transport,
                    &ctx.target.host,
                    ctx.target.port,
                    None,
                )
                .await;
            match reconnected {
                Ok(()) => {
                    let outcomes = run_stages_blocking(
                        ctx.connection.clone(),
                        ctx.target.clone(),
                        ctx.context.clone(),
                        ctx.bootstrap_stages.clone(),
                        StageOp::Bootstrap,
                    );
                    match outcomes {
                        Ok(outcomes) => {
                            if let Err(e) = record_bootstrap_outcomes(
                                &ctx.history,
                                &ctx.bootstrap_seq,
                                &ctx.context,
                                ctx.session_id,
                                &outcomes,
                            )
                            .await
                            {
                                tracing::warn!(session = %ctx.session_id, "failed to record periodic rebootstrap: {e}");
                            }
                        }
                        Err(e) => tracing::warn!(session = %ctx.session_id, "periodic rebootstrap failed: {e}"),
                    }
                }
                Err(e) => tracing::warn!(session = %ctx.session_id, "periodic reset reconnect failed: {e}"),
            }
        }

        // 11. Cooperative yield (rate limiting is a future knob; no delay
        // configured today beyond yielding the task).
        tokio::task::yield_now().await;
    }
}

fn classify(
    send_result: &Result<Vec<u8>>,
    callbacks: Option<&PluginCallbacks>,
) -> (TestResult, Option<Vec<u8>>) {
    match send_result {
        Ok(response) => {
            let verdict = callbacks
                .and_then(|c| c.validate_response.as_ref())
                .map(|validate| validate(response));
            match verdict {
                None => (TestResult::Pass, Some(response.clone())),
                Some(Ok(ResponseVerdict::Pass)) => (TestResult::Pass, Some(response.clone())),
                Some(Ok(ResponseVerdict::LogicalFailure)) => (TestResult::LogicalFailure, Some(response.clone())),
                Some(Ok(ResponseVerdict::Anomaly)) => (TestResult::Anomaly, Some(response.clone())),
                Some(Err(_)) => (TestResult::LogicalFailure, Some(response.clone())),
            }
        }
        Err(Error::Transport(crate::error::TransportError::ReceiveTimeout(_))) => (TestResult::Hang, None),
        Err(_) => (TestResult::Crash, None),
    }
}

/// Used by `reconcile_on_startup`, which runs before the async runtime's
/// session map is populated and so has no `Orchestrator` instance to call
/// back into; it only needs to confirm the plugin a persisted session
/// names still exists.
fn futures_block_on_plugins(plugins: &Arc<AsyncMutex<PluginManager>>, protocol_name: &str) -> Result<()> {
    let exists = plugins.blocking_lock().get_plugin(protocol_name).is_some();
    if exists {
        Ok(())
    } else {
        Err(Error::Session(SessionError::Initialization(format!("plugin `{protocol_name}` no longer available"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Block, BehaviorOp, BehaviorSpec, DataModel, FieldType};

    #[test]
    fn add_constant_behavior_is_stateless() {
        let model = DataModel::new(vec![{
            let mut b = Block::new("seq", FieldType::Int32);
            b.behavior = Some(BehaviorSpec { operation: BehaviorOp::AddConstant, initial: 10, step: 5, wrap: None });
            b
        }])
        .unwrap();
        let mut tracker = BehaviorTracker::default();
        let mut overrides = FieldMap::new();
        tracker.apply(&model, &mut overrides);
        assert_eq!(overrides.get("seq"), Some(&FieldValue::Int(15)));
        overrides.clear();
        tracker.apply(&model, &mut overrides);
        assert_eq!(overrides.get("seq"), Some(&FieldValue::Int(15)));
    }

    #[test]
    fn increment_behavior_accumulates_and_wraps() {
        let model = DataModel::new(vec![{
            let mut b = Block::new("counter", FieldType::UInt32);
            b.behavior = Some(BehaviorSpec { operation: BehaviorOp::Increment, initial: 0, step: 1, wrap: Some(3) });
            b
        }])
        .unwrap();
        let mut tracker = BehaviorTracker::default();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let mut overrides = FieldMap::new();
            tracker.apply(&model, &mut overrides);
            seen.push(overrides.get("counter").unwrap().as_u64().unwrap());
        }
        assert_eq!(seen, vec![1, 2, 0, 1]);
    }

    #[test]
    fn build_overrides_returns_none_on_unparseable_bytes() {
        let model = DataModel::new(vec![Block::new("value", FieldType::UInt32)]).unwrap();
        let mut tracker = BehaviorTracker::default();
        assert!(build_overrides(&model, &[1, 2], None, &mut tracker).is_none());
    }

    #[test]
    fn build_overrides_strips_from_context_fields() {
        let model = DataModel::new(vec![
            Block::new("token", FieldType::UInt32).from_context("session_token"),
            Block::new("payload", FieldType::Bytes),
        ])
        .unwrap();
        let mutated = vec![0, 0, 0, 1, 9, 9, 9];
        let mut tracker = BehaviorTracker::default();
        let overrides = build_overrides(&model, &mutated, None, &mut tracker).unwrap();
        assert!(!overrides.contains_key("token"));
        assert_eq!(overrides.get("payload"), Some(&FieldValue::Bytes(vec![9, 9, 9])));
    }

    #[test]
    fn build_overrides_applies_command_override() {
        let model = DataModel::new(vec![Block::new("command", FieldType::UInt8)]).unwrap();
        let mutated = vec![5u8];
        let mut tracker = BehaviorTracker::default();
        let overrides =
            build_overrides(&model, &mutated, Some(("command".to_string(), FieldValue::Int(42))), &mut tracker)
                .unwrap();
        assert_eq!(overrides.get("command"), Some(&FieldValue::Int(42)));
    }

    #[test]
    fn target_key_formats_host_and_port() {
        let target = Target { host: "127.0.0.1".to_string(), port: 9000, transport: crate::session::TransportKind::Tcp };
        assert_eq!(target_key(&target), "127.0.0.1:9000");
    }
}
