//! `FuzzSession`: the persisted, resumable unit of work the orchestrator
//! drives. [`stateful`] holds the state-machine navigation logic used when
//! a session's protocol declares a `state_model`.

pub mod stateful;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mutation::MutationMode;

fn now_unix() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Core,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FuzzingMode {
    #[default]
    Random,
    Bfs,
    Dfs,
    Targeted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    PerTest,
    PerStage,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    pub mode: MutationMode,
    pub enabled_mutators: Vec<String>,
    pub structure_aware_weight: u8,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self { mode: MutationMode::default(), enabled_mutators: Vec::new(), structure_aware_weight: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatefulConfig {
    pub reset_interval: u64,
    pub enable_termination_fuzzing: bool,
    pub termination_test_interval: u64,
    pub termination_test_window: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub total_tests: u64,
    pub crashes: u64,
    pub hangs: u64,
    pub anomalies: u64,
    pub session_resets: u64,
    pub termination_tests: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzSession {
    pub id: Uuid,
    pub protocol_name: String,
    pub target: Target,
    pub mutation: MutationConfig,
    pub execution_mode: ExecutionMode,
    pub fuzzing_mode: FuzzingMode,
    pub target_state: Option<String>,
    pub stateful: Option<StatefulConfig>,
    pub current_state: Option<String>,
    pub state_coverage: HashMap<String, u64>,
    pub transition_coverage: HashMap<String, u64>,
    pub status: SessionStatus,
    pub counters: SessionCounters,
    pub current_stage: Option<String>,
    pub connection_mode: ConnectionMode,
    pub heartbeat_enabled: bool,
    pub context_snapshot: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl FuzzSession {
    pub fn new(protocol_name: impl Into<String>, target: Target, connection_mode: ConnectionMode) -> Self {
        let now = now_unix();
        Self {
            id: Uuid::new_v4(),
            protocol_name: protocol_name.into(),
            target,
            mutation: MutationConfig::default(),
            execution_mode: ExecutionMode::Core,
            fuzzing_mode: FuzzingMode::default(),
            target_state: None,
            stateful: None,
            current_state: None,
            state_coverage: HashMap::new(),
            transition_coverage: HashMap::new(),
            status: SessionStatus::Idle,
            counters: SessionCounters::default(),
            current_stage: None,
            connection_mode,
            heartbeat_enabled: false,
            context_snapshot: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_unix();
    }

    pub fn start(&mut self) {
        self.status = SessionStatus::Running;
        self.started_at = Some(now_unix());
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.error_message = Some(message.into());
        self.touch();
    }

    pub fn complete(&mut self) {
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now_unix());
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_idle() {
        let target = Target { host: "127.0.0.1".to_string(), port: 9000, transport: TransportKind::Tcp };
        let session = FuzzSession::new("echo", target, ConnectionMode::Session);
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.started_at.is_none());
    }

    #[test]
    fn start_sets_running_and_timestamp() {
        let target = Target { host: "127.0.0.1".to_string(), port: 9000, transport: TransportKind::Tcp };
        let mut session = FuzzSession::new("echo", target, ConnectionMode::Session);
        session.start();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.started_at.is_some());
    }
}
