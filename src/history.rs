//! Durable, append-only execution history. Writes are batched on a
//! background task so the fuzz loop never blocks on disk I/O per test
//! case; reads merge the persisted store with whatever's still sitting in
//! the write queue so the first page of a session's history is never
//! stale.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::data_model::{FieldMap, FieldValue};
use crate::error::Result;

pub const DEFAULT_CACHE_SIZE: usize = 100;
const BATCH_SIZE: usize = 100;
const BATCH_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestResult {
    Pass,
    Crash,
    Hang,
    LogicalFailure,
    Anomaly,
}

impl TestResult {
    pub fn as_str(self) -> &'static str {
        match self {
            TestResult::Pass => "PASS",
            TestResult::Crash => "CRASH",
            TestResult::Hang => "HANG",
            TestResult::LogicalFailure => "LOGICAL_FAILURE",
            TestResult::Anomaly => "ANOMALY",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "CRASH" => TestResult::Crash,
            "HANG" => TestResult::Hang,
            "LOGICAL_FAILURE" => TestResult::LogicalFailure,
            "ANOMALY" => TestResult::Anomaly,
            _ => TestResult::Pass,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseExecutionRecord {
    pub session_id: Uuid,
    pub sequence_number: i64,
    pub timestamp_sent: u64,
    pub timestamp_response: Option<u64>,
    pub payload_bytes: Vec<u8>,
    pub payload_sha256: String,
    pub payload_size: usize,
    pub stage_name: String,
    pub current_state: Option<String>,
    pub context_snapshot: Option<Vec<u8>>,
    pub parsed_fields: Option<FieldMap>,
    pub response_preview: Option<Vec<u8>>,
    pub result: TestResult,
    pub duration_ms: u64,
    pub connection_sequence: Option<u64>,
}

/// Base64-encodes any byte payloads before the record goes into a JSON
/// column, matching the schema's `_json_safe()` convention.
fn json_safe_context(bytes: &Option<Vec<u8>>) -> serde_json::Value {
    use base64::Engine;
    match bytes {
        Some(b) => serde_json::json!(base64::engine::general_purpose::STANDARD.encode(b)),
        None => serde_json::Value::Null,
    }
}

fn json_safe_fields(fields: &Option<FieldMap>) -> serde_json::Value {
    use base64::Engine;
    match fields {
        Some(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let value = match v {
                    FieldValue::UInt(n) => serde_json::json!(n),
                    FieldValue::Int(n) => serde_json::json!(n),
                    FieldValue::Str(s) => serde_json::json!(s),
                    FieldValue::Bytes(b) => serde_json::json!(base64::engine::general_purpose::STANDARD.encode(b)),
                };
                out.insert(k.clone(), value);
            }
            serde_json::Value::Object(out)
        }
        None => serde_json::Value::Null,
    }
}

enum WriterMsg {
    Record(TestCaseExecutionRecord),
    Flush(oneshot::Sender<()>),
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS executions (
            session_id TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            timestamp_sent INTEGER NOT NULL,
            timestamp_response INTEGER,
            payload_bytes BLOB NOT NULL,
            payload_sha256 TEXT NOT NULL,
            payload_size INTEGER NOT NULL,
            stage_name TEXT NOT NULL,
            current_state TEXT,
            context_snapshot TEXT,
            parsed_fields TEXT,
            response_preview BLOB,
            result TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            connection_sequence INTEGER,
            PRIMARY KEY (session_id, sequence_number)
        );",
    )
}

fn insert_record(conn: &Connection, record: &TestCaseExecutionRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO executions (
            session_id, sequence_number, timestamp_sent, timestamp_response, payload_bytes,
            payload_sha256, payload_size, stage_name, current_state, context_snapshot,
            parsed_fields, response_preview, result, duration_ms, connection_sequence
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        rusqlite::params![
            record.session_id.to_string(),
            record.sequence_number,
            record.timestamp_sent,
            record.timestamp_response,
            record.payload_bytes,
            record.payload_sha256,
            record.payload_size as i64,
            record.stage_name,
            record.current_state,
            json_safe_context(&record.context_snapshot).to_string(),
            json_safe_fields(&record.parsed_fields).to_string(),
            record.response_preview,
            record.result.as_str(),
            record.duration_ms as i64,
            record.connection_sequence.map(|v| v as i64),
        ],
    )?;
    Ok(())
}

/// Decodes the `context_snapshot` column back into bytes. The column holds
/// a JSON string produced by `json_safe_context` (a base64 string, or
/// `null`); anything else means the row predates this format or is
/// corrupt, and is treated as no snapshot rather than failing the read.
fn decode_context_snapshot(raw: Option<String>) -> Option<Vec<u8>> {
    use base64::Engine;
    let raw = raw?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let encoded = value.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestCaseExecutionRecord> {
    let session_id: String = row.get("session_id")?;
    let result: String = row.get("result")?;
    let context_snapshot: Option<String> = row.get("context_snapshot")?;
    Ok(TestCaseExecutionRecord {
        session_id: Uuid::parse_str(&session_id).unwrap_or_default(),
        sequence_number: row.get("sequence_number")?,
        timestamp_sent: row.get("timestamp_sent")?,
        timestamp_response: row.get("timestamp_response")?,
        payload_bytes: row.get("payload_bytes")?,
        payload_sha256: row.get("payload_sha256")?,
        payload_size: row.get::<_, i64>("payload_size")? as usize,
        stage_name: row.get("stage_name")?,
        current_state: row.get("current_state")?,
        context_snapshot: decode_context_snapshot(context_snapshot),
        // `parsed_fields` loses its per-field type tags (int vs uint vs
        // bytes) once round-tripped through `json_safe_fields`; callers
        // that need typed fields back (replay) re-derive them by parsing
        // `payload_bytes` against the data model instead of trusting this
        // column.
        parsed_fields: None,
        response_preview: row.get("response_preview")?,
        result: TestResult::from_str(&result),
        duration_ms: row.get::<_, i64>("duration_ms")? as u64,
        connection_sequence: row.get::<_, Option<i64>>("connection_sequence")?.map(|v| v as u64),
    })
}

async fn run_writer(db_path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    let conn = match Connection::open(&db_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("execution history writer failed to open {}: {e}", db_path.display());
            return;
        }
    };
    if let Err(e) = ensure_schema(&conn) {
        tracing::error!("execution history schema setup failed: {e}");
        return;
    }

    let mut batch = Vec::new();
    loop {
        let mut waiters = Vec::new();
        let deadline = tokio::time::sleep(BATCH_WINDOW);
        tokio::pin!(deadline);
        let mut closed = false;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WriterMsg::Record(r)) => {
                        batch.push(r);
                        if batch.len() >= BATCH_SIZE { break; }
                    }
                    Some(WriterMsg::Flush(done)) => {
                        waiters.push(done);
                        break;
                    }
                    None => { closed = true; break; }
                },
                _ = &mut deadline => break,
            }
        }
        if !batch.is_empty() {
            for record in &batch {
                if let Err(e) = insert_record(&conn, record) {
                    tracing::error!("execution history insert failed: {e}");
                }
            }
            batch.clear();
        }
        for done in waiters {
            let _ = done.send(());
        }
        if closed {
            return;
        }
    }
}

pub struct ExecutionHistory {
    session_id: Uuid,
    db_path: PathBuf,
    cache: Mutex<VecDeque<TestCaseExecutionRecord>>,
    cache_cap: usize,
    tx: Option<mpsc::UnboundedSender<WriterMsg>>,
    fallback_conn: Mutex<Option<Connection>>,
    sequence_counter: Arc<std::sync::atomic::AtomicI64>,
}

impl ExecutionHistory {
    pub fn new(db_path: impl AsRef<Path>, session_id: Uuid, cache_cap: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        {
            let conn = Connection::open(&db_path)?;
            ensure_schema(&conn)?;
        }
        Ok(Self {
            session_id,
            db_path,
            cache: Mutex::new(VecDeque::with_capacity(cache_cap)),
            cache_cap,
            tx: None,
            fallback_conn: Mutex::new(None),
            sequence_counter: Arc::new(std::sync::atomic::AtomicI64::new(0)),
        })
    }

    /// Spawns the background writer task. If this is never called, or the
    /// channel later closes, `record()` falls back to a synchronous write.
    pub fn start_writer(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(self.db_path.clone(), rx));
        self.tx = Some(tx);
    }

    fn push_cache(&self, record: TestCaseExecutionRecord) {
        let mut cache = self.cache.lock().unwrap();
        cache.push_back(record);
        while cache.len() > self.cache_cap {
            cache.pop_front();
        }
    }

    fn write_fallback(&self, record: &TestCaseExecutionRecord) -> Result<()> {
        let mut guard = self.fallback_conn.lock().unwrap();
        if guard.is_none() {
            let conn = Connection::open(&self.db_path)?;
            ensure_schema(&conn)?;
            *guard = Some(conn);
        }
        insert_record(guard.as_ref().unwrap(), record)?;
        Ok(())
    }

    pub fn record(&self, record: TestCaseExecutionRecord) -> Result<()> {
        self.sequence_counter.fetch_max(record.sequence_number, std::sync::atomic::Ordering::Relaxed);
        self.push_cache(record.clone());
        match &self.tx {
            Some(tx) if tx.send(WriterMsg::Record(record.clone())).is_ok() => Ok(()),
            _ => self.write_fallback(&record),
        }
    }

    /// Synchronously drains any queued records. A no-op if the background
    /// writer was never started (every write went synchronous already).
    pub async fn flush(&self) -> Result<()> {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WriterMsg::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
        Ok(())
    }

    fn query_persistent(&self, offset: usize, limit: usize) -> Result<Vec<TestCaseExecutionRecord>> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM executions WHERE session_id = ?1 ORDER BY sequence_number ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![self.session_id.to_string(), limit as i64, offset as i64],
            row_to_record,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn persistent_count(&self) -> Result<usize> {
        let conn = Connection::open(&self.db_path)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE session_id = ?1",
            rusqlite::params![self.session_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// `offset == 0` merges in-flight cache records not yet durably
    /// written on top of the persistent store; `offset > 0` reads the
    /// persistent store only, since anything beyond the first page is
    /// assumed to have already flushed.
    pub fn list(&self, offset: usize, limit: usize) -> Result<Vec<TestCaseExecutionRecord>> {
        let persisted = self.query_persistent(offset, limit)?;
        if offset > 0 {
            return Ok(persisted);
        }

        let mut seen: std::collections::HashSet<i64> = persisted.iter().map(|r| r.sequence_number).collect();
        let mut merged = persisted;
        for record in self.cache.lock().unwrap().iter() {
            if seen.insert(record.sequence_number) {
                merged.push(record.clone());
            }
        }
        merged.sort_by_key(|r| r.sequence_number);
        merged.truncate(limit);
        Ok(merged)
    }

    pub fn total_count(&self) -> Result<usize> {
        let persisted = self.persistent_count()?;
        let cache_count = self.cache.lock().unwrap().len();
        Ok(persisted.max(cache_count))
    }

    pub fn find_by_sequence(&self, sequence_number: i64) -> Result<Option<TestCaseExecutionRecord>> {
        if let Some(hit) = self.cache.lock().unwrap().iter().find(|r| r.sequence_number == sequence_number) {
            return Ok(Some(hit.clone()));
        }
        let conn = Connection::open(&self.db_path)?;
        let mut stmt =
            conn.prepare("SELECT * FROM executions WHERE session_id = ?1 AND sequence_number = ?2")?;
        let mut rows =
            stmt.query_map(rusqlite::params![self.session_id.to_string(), sequence_number], row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Records in ascending sequence order, bounded inclusively on either
    /// end. `None` leaves that end unbounded. Reads the persistent store
    /// only: replay targets completed sessions, whose writer has already
    /// flushed by the time a replay is requested.
    pub fn range(&self, from_seq: Option<i64>, to_seq: Option<i64>) -> Result<Vec<TestCaseExecutionRecord>> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM executions
             WHERE session_id = ?1
               AND (?2 IS NULL OR sequence_number >= ?2)
               AND (?3 IS NULL OR sequence_number <= ?3)
             ORDER BY sequence_number ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![self.session_id.to_string(), from_seq, to_seq], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_at_time(&self, timestamp: u64) -> Result<Option<TestCaseExecutionRecord>> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM executions WHERE session_id = ?1 AND timestamp_sent <= ?2
             ORDER BY timestamp_sent DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![self.session_id.to_string(), timestamp as i64], row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: i64) -> TestCaseExecutionRecord {
        TestCaseExecutionRecord {
            session_id: Uuid::new_v4(),
            sequence_number: seq,
            timestamp_sent: seq as u64,
            timestamp_response: None,
            payload_bytes: vec![1, 2, 3],
            payload_sha256: "deadbeef".to_string(),
            payload_size: 3,
            stage_name: "fuzz_target".to_string(),
            current_state: None,
            context_snapshot: None,
            parsed_fields: None,
            response_preview: None,
            result: TestResult::Pass,
            duration_ms: 5,
            connection_sequence: None,
        }
    }

    fn tmp_db(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("statefuzz-history-test-{name}-{}.sqlite", Uuid::new_v4()))
    }

    #[test]
    fn fallback_write_persists_without_writer_started() {
        let path = tmp_db("fallback");
        let history = ExecutionHistory::new(&path, Uuid::new_v4(), 10).unwrap();
        let mut rec = record(1);
        rec.session_id = history.session_id;
        history.record(rec).unwrap();
        assert_eq!(history.persistent_count().unwrap(), 1);
    }

    #[test]
    fn list_merges_cache_when_offset_zero() {
        let path = tmp_db("merge");
        let history = ExecutionHistory::new(&path, Uuid::new_v4(), 10).unwrap();
        let mut rec = record(1);
        rec.session_id = history.session_id;
        history.push_cache(rec);
        let page = history.list(0, 10).unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn range_returns_ascending_bounded_slice() {
        let path = tmp_db("range");
        let history = ExecutionHistory::new(&path, Uuid::new_v4(), 10).unwrap();
        for i in 1..=5 {
            let mut rec = record(i);
            rec.session_id = history.session_id;
            history.record(rec).unwrap();
        }
        let slice = history.range(Some(2), Some(4)).unwrap();
        let seqs: Vec<i64> = slice.iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn range_unbounded_returns_everything() {
        let path = tmp_db("range-unbounded");
        let history = ExecutionHistory::new(&path, Uuid::new_v4(), 10).unwrap();
        for i in 1..=3 {
            let mut rec = record(i);
            rec.session_id = history.session_id;
            history.record(rec).unwrap();
        }
        assert_eq!(history.range(None, None).unwrap().len(), 3);
    }

    #[test]
    fn total_count_uses_cache_when_ahead_of_disk() {
        let path = tmp_db("count");
        let history = ExecutionHistory::new(&path, Uuid::new_v4(), 10).unwrap();
        for i in 1..=3 {
            let mut rec = record(i);
            rec.session_id = history.session_id;
            history.push_cache(rec);
        }
        assert_eq!(history.total_count().unwrap(), 3);
    }
}
