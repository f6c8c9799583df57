//! Ordered bootstrap / fuzz_target / teardown stages. A [`StageRunner`]
//! drives the bootstrap handshake before fuzzing starts and the teardown
//! sequence when a session stops, exporting response fields into the
//! session's [`ProtocolContext`] along the way.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{ContextValue, ProtocolContext};
use crate::data_model::{parser, transform, DataModel, FieldMap, FieldValue, TransformOp};
use crate::error::{Error, OrchestrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Bootstrap,
    FuzzTarget,
    Teardown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, backoff_ms: 0 }
    }
}

/// An export copies a response field into the context, optionally under a
/// dotted path (`header.token`) and through a transform pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub field: String,
    pub context_key: String,
    #[serde(default)]
    pub transform: Vec<TransformOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expect {
    pub field: String,
    pub equals: FieldValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub role: Role,
    pub data_model: DataModel,
    pub response_model: Option<DataModel>,
    pub exports: Vec<Export>,
    pub expect: Vec<Expect>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl Stage {
    pub fn new(name: impl Into<String>, role: Role, data_model: DataModel) -> Self {
        Self {
            name: name.into(),
            role,
            data_model,
            response_model: None,
            exports: Vec::new(),
            expect: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of running one stage, enough for the caller to build a history
/// record without the stage runner knowing about `ExecutionHistory` itself.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage_name: String,
    pub request: Vec<u8>,
    pub response: Option<Vec<u8>>,
    pub parsed_response: Option<FieldMap>,
    pub passed: bool,
    pub error: Option<String>,
}

/// Navigates a dotted path (`header.token`) against a flat [`FieldMap`].
/// Flat field maps have no real nesting, so anything past the first
/// segment is matched verbatim against the remaining dotted tail, which
/// lets protocols name fields like `header.token` directly.
fn lookup_dotted<'a>(fields: &'a FieldMap, path: &str) -> Option<&'a FieldValue> {
    if let Some(v) = fields.get(path) {
        return Some(v);
    }
    let (head, _) = path.split_once('.')?;
    fields.get(head)
}

/// Mirrors `parser::resolve_from_context`'s direction: `transform` only
/// ever applies to integer values, bytes/strings pass through untouched.
fn field_value_to_context(value: &FieldValue, transform_ops: &[TransformOp]) -> ContextValue {
    match value {
        FieldValue::UInt(v) => ContextValue::Int(transform::apply(transform_ops, *v) as i64),
        FieldValue::Int(v) => ContextValue::Int(transform::apply(transform_ops, *v as u64) as i64),
        FieldValue::Bytes(b) => ContextValue::Bytes(b.clone()),
        FieldValue::Str(s) => ContextValue::Str(s.clone()),
    }
}

pub struct StageRunner<'a> {
    send_recv: Box<dyn FnMut(&[u8], Duration) -> Result<Vec<u8>> + 'a>,
}

impl<'a> StageRunner<'a> {
    /// `send_recv` is supplied by the caller (the orchestrator, via the
    /// connection manager) so the stage runner never has to know about
    /// transports or connection pooling.
    pub fn new(send_recv: impl FnMut(&[u8], Duration) -> Result<Vec<u8>> + 'a) -> Self {
        Self { send_recv: Box::new(send_recv) }
    }

    pub fn run_bootstrap(&mut self, stages: &[Stage], ctx: &mut ProtocolContext) -> Result<Vec<StageOutcome>> {
        let mut outcomes = Vec::new();
        for stage in stages.iter().filter(|s| s.role == Role::Bootstrap) {
            outcomes.push(self.run_stage(stage, ctx)?);
        }
        Ok(outcomes)
    }

    /// Best-effort: errors are collected but never propagated, matching
    /// the "teardown never fails the session" rule.
    pub fn run_teardown(&mut self, stages: &[Stage], ctx: &mut ProtocolContext) -> Vec<StageOutcome> {
        let mut outcomes = Vec::new();
        for stage in stages.iter().filter(|s| s.role == Role::Teardown) {
            match self.run_stage(stage, ctx) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(stage = %stage.name, "teardown stage failed: {e}");
                    outcomes.push(StageOutcome {
                        stage_name: stage.name.clone(),
                        request: Vec::new(),
                        response: None,
                        parsed_response: None,
                        passed: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes
    }

    pub fn rerun_stage(&mut self, stages: &[Stage], name: &str, ctx: &mut ProtocolContext) -> Result<StageOutcome> {
        let stage = stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Orchestration(OrchestrationError::Bootstrap {
                stage: name.to_string(),
                message: "no such stage".to_string(),
            }))?;
        self.run_stage(stage, ctx)
    }

    fn run_stage(&mut self, stage: &Stage, ctx: &mut ProtocolContext) -> Result<StageOutcome> {
        let mut attempt = 0;
        let mut last_err = None;
        loop {
            attempt += 1;
            match self.try_stage_once(stage, ctx) {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    last_err = Some(e);
                    if attempt >= stage.retry.max_attempts {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(stage.retry.backoff_ms));
                }
            }
        }
        let message = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(Error::Orchestration(OrchestrationError::Bootstrap { stage: stage.name.clone(), message }))
    }

    fn try_stage_once(&mut self, stage: &Stage, ctx: &mut ProtocolContext) -> Result<StageOutcome> {
        let serialize_ctx = parser::SerializeContext::new(ctx, 0);
        let (request, _) = parser::serialize(&stage.data_model, &FieldMap::new(), &serialize_ctx)?;

        let response = (self.send_recv)(&request, stage.timeout)?;

        let parsed_response = match &stage.response_model {
            Some(model) => Some(parser::parse(model, &response)?),
            None => None,
        };

        if let Some(parsed) = &parsed_response {
            for expect in &stage.expect {
                let actual = lookup_dotted(parsed, &expect.field);
                if actual != Some(&expect.equals) {
                    return Err(Error::Orchestration(OrchestrationError::BootstrapValidation {
                        stage: stage.name.clone(),
                        message: format!("expected `{}` == {:?}, got {:?}", expect.field, expect.equals, actual),
                    }));
                }
            }
            for export in &stage.exports {
                if let Some(value) = lookup_dotted(parsed, &export.field) {
                    ctx.set(export.context_key.clone(), field_value_to_context(value, &export.transform));
                }
            }
        }

        Ok(StageOutcome {
            stage_name: stage.name.clone(),
            request,
            response: Some(response),
            parsed_response,
            passed: true,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Block, FieldType};

    fn echo_model() -> DataModel {
        DataModel::new(vec![Block::new("token", FieldType::UInt32).with_default(FieldValue::UInt(42))]).unwrap()
    }

    #[test]
    fn successful_stage_exports_into_context() {
        let stage = Stage {
            exports: vec![Export {
                field: "token".to_string(),
                context_key: "session_token".to_string(),
                transform: Vec::new(),
            }],
            response_model: Some(echo_model()),
            ..Stage::new("login", Role::Bootstrap, echo_model())
        };
        let mut ctx = ProtocolContext::new();
        let mut runner = StageRunner::new(|req, _| Ok(req.to_vec()));
        let outcome = runner.run_stage(&stage, &mut ctx).unwrap();
        assert!(outcome.passed);
        assert_eq!(ctx.get("session_token"), Some(&ContextValue::Int(42)));
    }

    #[test]
    fn export_transform_runs_before_context_set() {
        let stage = Stage {
            exports: vec![Export {
                field: "token".to_string(),
                context_key: "session_token".to_string(),
                transform: vec![TransformOp::AddConstant(1)],
            }],
            response_model: Some(echo_model()),
            ..Stage::new("login", Role::Bootstrap, echo_model())
        };
        let mut ctx = ProtocolContext::new();
        let mut runner = StageRunner::new(|req, _| Ok(req.to_vec()));
        runner.run_stage(&stage, &mut ctx).unwrap();
        assert_eq!(ctx.get("session_token"), Some(&ContextValue::Int(43)));
    }

    #[test]
    fn expect_mismatch_fails_stage() {
        let stage = Stage {
            expect: vec![Expect { field: "token".to_string(), equals: FieldValue::UInt(99) }],
            response_model: Some(echo_model()),
            ..Stage::new("login", Role::Bootstrap, echo_model())
        };
        let mut ctx = ProtocolContext::new();
        let mut runner = StageRunner::new(|req, _| Ok(req.to_vec()));
        assert!(runner.run_stage(&stage, &mut ctx).is_err());
    }

    #[test]
    fn retry_exhausts_then_fails() {
        let stage = Stage { retry: RetryPolicy { max_attempts: 2, backoff_ms: 0 }, ..Stage::new("login", Role::Bootstrap, echo_model()) };
        let mut ctx = ProtocolContext::new();
        let mut attempts = 0;
        let mut runner = StageRunner::new(|_, _| {
            attempts += 1;
            Err(Error::Orchestration(OrchestrationError::ConnectionAbort("refused".to_string())))
        });
        assert!(runner.run_stage(&stage, &mut ctx).is_err());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn teardown_failure_does_not_propagate() {
        let stages = vec![Stage::new("close", Role::Teardown, echo_model())];
        let mut ctx = ProtocolContext::new();
        let mut runner = StageRunner::new(|_, _| Err(Error::Orchestration(OrchestrationError::ConnectionAbort("gone".to_string()))));
        let outcomes = runner.run_teardown(&stages, &mut ctx);
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].passed);
    }
}
