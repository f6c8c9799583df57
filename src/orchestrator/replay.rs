//! Reproduces a session's recorded test cases against the target. Runs on
//! a connection manager scoped to the replay call, never the session's
//! live fuzz connection, so a replay in progress can't interleave with
//! (or get cancelled by) the active fuzz loop.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::connection::{ConnectionManager, DemuxConfig};
use crate::context::ProtocolContext;
use crate::data_model::parser::{self, SerializeContext};
use crate::error::{Error, Result, SessionError};
use crate::history::TestCaseExecutionRecord;
use crate::session::ConnectionMode;
use crate::stage::Role;

use super::{run_stages_blocking, target_key, Orchestrator, StageOp};

const REPLAY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Re-run bootstrap on a fresh transport, then re-serialize each
    /// record's parsed fields against the resulting context.
    Fresh,
    /// Send each record's exact historical bytes; context is restored
    /// from the first record's snapshot but never drives serialization.
    Stored,
    /// No bootstrap, no context, raw bytes as recorded.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayResult {
    Success,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct ReplayRecordOutcome {
    pub sequence_number: i64,
    pub sent_bytes: Vec<u8>,
    pub response: Option<Vec<u8>>,
    pub result: ReplayResult,
    /// Whether `response` (truncated to the same 512-byte preview window)
    /// matches the originally recorded `response_preview`.
    pub matches_original: bool,
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub session_id: Uuid,
    pub mode: ReplayMode,
    pub outcomes: Vec<ReplayRecordOutcome>,
}

fn truncate_preview(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len().min(512)].to_vec()
}

fn classify_send(result: &Result<Vec<u8>>) -> ReplayResult {
    match result {
        Ok(_) => ReplayResult::Success,
        Err(Error::Transport(crate::error::TransportError::ReceiveTimeout(_))) => ReplayResult::Timeout,
        Err(_) => ReplayResult::Error,
    }
}

fn matches_original(response: Option<&[u8]>, original: &Option<Vec<u8>>) -> bool {
    let got = response.map(truncate_preview);
    got.as_ref() == original.as_ref()
}

/// Only positive sequence numbers are actual fuzz test cases; bootstrap
/// records use negative numbers and are never replay targets.
fn fuzz_records_only(records: Vec<TestCaseExecutionRecord>) -> Vec<TestCaseExecutionRecord> {
    records.into_iter().filter(|r| r.sequence_number > 0).collect()
}

impl Orchestrator {
    /// Replays a session's recorded test cases (ascending sequence order,
    /// optionally bounded) per `mode`. The session need not be running;
    /// its runtime (target, data model, bootstrap stages, history) stays
    /// registered until `delete_session`.
    pub async fn replay_session(
        &self,
        id: Uuid,
        mode: ReplayMode,
        from_seq: Option<i64>,
        to_seq: Option<i64>,
    ) -> Result<ReplayReport> {
        let (target, fuzz_model, bootstrap_stages, history) = {
            let runtimes = self.runtimes.lock().await;
            let runtime =
                runtimes.get(&id).ok_or_else(|| Error::Session(SessionError::NotFound(id.to_string())))?;
            let bootstrap_stages: Vec<_> =
                runtime.stages.iter().filter(|s| s.role == Role::Bootstrap).cloned().collect();
            (runtime.target.clone(), runtime.fuzz_model.clone(), bootstrap_stages, runtime.history.clone())
        };

        let records = fuzz_records_only(history.range(from_seq, to_seq)?);

        let connection = Arc::new(ConnectionManager::new(
            ConnectionMode::Session,
            DemuxConfig::default(),
            Duration::from_secs(5),
            4096,
            100,
            3,
        ));
        let context = Arc::new(tokio::sync::Mutex::new(ProtocolContext::new()));

        if mode == ReplayMode::Fresh && !bootstrap_stages.is_empty() {
            run_stages_blocking(connection.clone(), target.clone(), context.clone(), bootstrap_stages, StageOp::Bootstrap)?;
        }
        if mode == ReplayMode::Stored {
            if let Some(first) = records.first() {
                if let Some(snapshot) = &first.context_snapshot {
                    *context.lock().await = ProtocolContext::restore(snapshot)?;
                }
            }
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let sent_bytes = match mode {
                ReplayMode::Fresh => {
                    let parsed = parser::parse(&fuzz_model, &record.payload_bytes)?;
                    let guard = context.lock().await;
                    let sctx = SerializeContext::new(&guard, i as u64);
                    let (bytes, _) = parser::serialize(&fuzz_model, &parsed, &sctx)?;
                    bytes
                }
                ReplayMode::Stored | ReplayMode::Skip => record.payload_bytes.clone(),
            };

            let send_result = async {
                let handle = connection
                    .get_or_connect(&target_key(&target), "replay", i as u64, target.transport, &target.host, target.port)
                    .await?;
                connection.send_with_lock(&handle, &sent_bytes, REPLAY_TIMEOUT, None).await
            }
            .await;

            let result = classify_send(&send_result);
            let response = send_result.ok();
            let outcome = ReplayRecordOutcome {
                sequence_number: record.sequence_number,
                matches_original: matches_original(response.as_deref(), &record.response_preview),
                sent_bytes,
                response,
                result,
            };
            outcomes.push(outcome);
        }

        Ok(ReplayReport { session_id: id, mode, outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn classify_send_maps_timeout_and_error() {
        assert_eq!(classify_send(&Ok(vec![1])), ReplayResult::Success);
        assert_eq!(
            classify_send(&Err(Error::Transport(TransportError::ReceiveTimeout("t".to_string())))),
            ReplayResult::Timeout
        );
        assert_eq!(
            classify_send(&Err(Error::Transport(TransportError::ConnectionRefused("c".to_string())))),
            ReplayResult::Error
        );
    }

    #[test]
    fn matches_original_compares_truncated_preview() {
        let original = Some(vec![1, 2, 3]);
        assert!(matches_original(Some(&[1, 2, 3]), &original));
        assert!(!matches_original(Some(&[1, 2, 4]), &original));
        assert!(!matches_original(None, &original));
    }

    #[test]
    fn fuzz_records_only_drops_negative_bootstrap_sequence_numbers() {
        fn rec(seq: i64) -> TestCaseExecutionRecord {
            TestCaseExecutionRecord {
                session_id: Uuid::new_v4(),
                sequence_number: seq,
                timestamp_sent: 0,
                timestamp_response: None,
                payload_bytes: vec![],
                payload_sha256: String::new(),
                payload_size: 0,
                stage_name: "x".to_string(),
                current_state: None,
                context_snapshot: None,
                parsed_fields: None,
                response_preview: None,
                result: crate::history::TestResult::Pass,
                duration_ms: 0,
                connection_sequence: None,
            }
        }
        let filtered = fuzz_records_only(vec![rec(-2), rec(-1), rec(1), rec(2)]);
        let seqs: Vec<i64> = filtered.iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }
}
