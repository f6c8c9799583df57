//! Dispatches fuzz cases to remote agent processes for sessions in `agent`
//! execution mode: a per-target FIFO queue agents poll, with results
//! correlated back to the orchestrator by a generated id rather than by
//! local send/recv.
//!
//! Stateful coverage is still updated for agent-mode sessions: the single
//! [`crate::session::stateful::StatefulSession`] per session_id already
//! serializes ordering, so handing sends off to a remote process doesn't
//! need its own synchronization on top of that.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AgentError, Error, Result};
use crate::history::TestResult;

fn now_unix() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Registration record for a remote agent, keyed by the id `register_agent`
/// hands back. `telemetry` is whatever the agent last reported on its own
/// `heartbeat` call — shape is agent-defined, not interpreted here.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub target: String,
    pub registered_at: u64,
    pub last_heartbeat_at: Option<u64>,
    pub telemetry: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct MutationDirective {
    pub seed_hash: String,
    pub rng_seed: u64,
}

#[derive(Debug, Clone)]
pub struct FuzzCase {
    pub correlation_id: Uuid,
    pub session_id: Uuid,
    pub seed: Vec<u8>,
    pub directive: MutationDirective,
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    pub correlation_id: Uuid,
    pub response: Option<Vec<u8>>,
    pub result: TestResult,
    pub duration_ms: u64,
}

struct TargetQueue {
    pending: VecDeque<FuzzCase>,
    in_flight: HashMap<Uuid, FuzzCase>,
}

impl TargetQueue {
    fn new() -> Self {
        Self { pending: VecDeque::new(), in_flight: HashMap::new() }
    }
}

pub struct AgentDispatcher {
    queues: Mutex<HashMap<String, TargetQueue>>,
    agents: Mutex<HashMap<Uuid, AgentInfo>>,
}

impl Default for AgentDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDispatcher {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()), agents: Mutex::new(HashMap::new()) }
    }

    /// Registers a new agent against `target`, creating its queue if this
    /// is the first agent to claim it, and returns the id the agent uses
    /// for every later `next_case`/`submit_result`/`heartbeat` call.
    pub async fn register_agent(&self, target: &str) -> Uuid {
        self.queues.lock().await.entry(target.to_string()).or_insert_with(TargetQueue::new);
        let agent_id = Uuid::new_v4();
        self.agents.lock().await.insert(
            agent_id,
            AgentInfo { target: target.to_string(), registered_at: now_unix(), last_heartbeat_at: None, telemetry: None },
        );
        agent_id
    }

    /// Records a liveness ping and the agent's self-reported telemetry.
    pub async fn heartbeat(&self, agent_id: Uuid, telemetry: Option<serde_json::Value>) -> Result<()> {
        let mut agents = self.agents.lock().await;
        let info = agents
            .get_mut(&agent_id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(agent_id.to_string())))?;
        info.last_heartbeat_at = Some(now_unix());
        info.telemetry = telemetry;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: Uuid) -> Option<AgentInfo> {
        self.agents.lock().await.get(&agent_id).cloned()
    }

    pub async fn enqueue(&self, target: &str, session_id: Uuid, seed: Vec<u8>, directive: MutationDirective) -> Uuid {
        let correlation_id = Uuid::new_v4();
        let case = FuzzCase { correlation_id, session_id, seed, directive };
        let mut queues = self.queues.lock().await;
        queues.entry(target.to_string()).or_insert_with(TargetQueue::new).pending.push_back(case);
        correlation_id
    }

    /// Pops the next case for `target`, moving it into the in-flight map
    /// keyed by its correlation id until a result comes back.
    pub async fn get_next_case(&self, target: &str) -> Option<FuzzCase> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(target)?;
        let case = queue.pending.pop_front()?;
        queue.in_flight.insert(case.correlation_id, case.clone());
        Some(case)
    }

    /// Matches a result against its pending case by correlation id. The
    /// matched case is returned so the caller can feed it, together with
    /// the result, back into the orchestrator's classification pipeline.
    pub async fn handle_result(&self, target: &str, result: AgentResult) -> Result<FuzzCase> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(target)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(target.to_string())))?;
        queue
            .in_flight
            .remove(&result.correlation_id)
            .ok_or_else(|| Error::Agent(AgentError::Communication(format!(
                "no pending case for correlation id {}",
                result.correlation_id
            ))))
    }

    /// Drops every pending and in-flight case belonging to `session_id`
    /// across all targets, called when a session stops.
    pub async fn discard_session(&self, session_id: Uuid) {
        let mut queues = self.queues.lock().await;
        for queue in queues.values_mut() {
            queue.pending.retain(|c| c.session_id != session_id);
            queue.in_flight.retain(|_, c| c.session_id != session_id);
        }
    }

    pub async fn pending_count(&self, target: &str) -> usize {
        self.queues.lock().await.get(target).map(|q| q.pending.len()).unwrap_or(0)
    }
}

pub type SharedAgentDispatcher = Arc<AgentDispatcher>;
