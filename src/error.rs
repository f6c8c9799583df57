//! Typed error hierarchy.
//!
//! Mirrors the families named in the error handling design: each family is
//! its own enum so callers can match on "this was a transport problem"
//! without string comparison, and every variant can carry a free-form
//! `details` map for the handful of fields (stage name, available context
//! keys, ...) that don't deserve their own struct field.

use std::collections::HashMap;
use thiserror::Error;

pub type Details = HashMap<String, String>;

fn one(key: &str, value: impl std::fmt::Display) -> Details {
    let mut m = HashMap::new();
    m.insert(key.to_string(), value.to_string());
    m
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("parse error: {message}")]
    Parse { message: String, details: Details },
    #[error("serialization error: {message}")]
    Serialization { message: String, details: Details },
    #[error("field validation error: {message}")]
    FieldValidation { message: String, details: Details },
}

impl ProtocolError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into(), details: Details::new() }
    }

    pub fn missing_context(key: &str, available: &[String]) -> Self {
        Self::Serialization {
            message: format!("missing context value for key `{key}`"),
            details: one("available_keys", available.join(", ")),
        }
    }

    pub fn field_overflow(field: &str, bit_width: u32) -> Self {
        Self::FieldValidation {
            message: format!("value for field `{field}` exceeds {bit_width}-bit width, masked"),
            details: one("field", field),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("receive timed out: {0}")]
    ReceiveTimeout(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session state error: {0}")]
    State(String),
    #[error("session initialization failed: {0}")]
    Initialization(String),
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("seed not found: {0}")]
    SeedNotFound(String),
    #[error("corpus storage error: {0}")]
    Storage(String),
    #[error("failed to save finding: {0}")]
    FindingSave(String),
    #[error("finding not found: {0}")]
    FindingNotFound(String),
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("mutator not found: {0}")]
    NotFound(String),
    #[error("mutation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StatefulError {
    #[error("state transition error: {0}")]
    Transition(String),
    #[error("state not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("memory limit exceeded: {0}")]
    MemoryLimit(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("queue full: {0}")]
    QueueFull(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("agent communication error: {0}")]
    Communication(String),
    #[error("agent timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("bootstrap failed at stage `{stage}`: {message}")]
    Bootstrap { stage: String, message: String },
    #[error("bootstrap validation failed at stage `{stage}`: {message}")]
    BootstrapValidation { stage: String, message: String },
    #[error("heartbeat aborted the session: {0}")]
    HeartbeatAbort(String),
    #[error("connection aborted: {0}")]
    ConnectionAbort(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to load plugin: {0}")]
    Load(String),
    #[error("plugin validation failed: {0}")]
    Validation(String),
}

/// Top-level error, composing every family.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Stateful(#[from] StatefulError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
