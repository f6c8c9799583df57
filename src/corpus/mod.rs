//! Content-addressed seed corpus and crash finding persistence.
//!
//! Per the concurrency model, this store is touched by a single task (the
//! owning session's fuzz loop), so the LRU cache needs no internal lock.

pub mod seeds;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CorpusError, Error, Result};

fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindingKind {
    Crash,
    Hang,
    LogicalFailure,
    Anomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingReport {
    pub session_id: Uuid,
    pub timestamp: u64,
    pub kind: FindingKind,
    pub severity: Severity,
    pub error: Option<String>,
    pub agent_telemetry: Option<serde_json::Value>,
}

/// An order-preserving LRU: `touch` moves a key to the back (most recently
/// used); eviction removes from the front.
struct Lru {
    order: indexmap::IndexMap<String, Arc<Vec<u8>>>,
    max_size: usize,
}

impl Lru {
    fn new(max_size: usize) -> Self {
        Self { order: indexmap::IndexMap::new(), max_size }
    }

    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.order.get(key).cloned()
    }

    fn touch(&mut self, key: &str) {
        if let Some(value) = self.order.shift_remove(key) {
            self.order.insert(key.to_string(), value);
        }
    }

    fn insert(&mut self, key: String, value: Arc<Vec<u8>>) {
        self.order.shift_remove(&key);
        self.order.insert(key, value);
        while self.order.len() > self.max_size {
            self.order.shift_remove_index(0);
        }
    }

    fn entries(&self) -> Vec<(String, Arc<Vec<u8>>)> {
        self.order.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

pub struct CorpusStore {
    corpus_dir: PathBuf,
    crash_dir: PathBuf,
    cache: Lru,
}

impl CorpusStore {
    pub fn new(corpus_dir: impl Into<PathBuf>, crash_dir: impl Into<PathBuf>, cache_max_size: usize) -> Result<Self> {
        let corpus_dir = corpus_dir.into();
        let crash_dir = crash_dir.into();
        fs::create_dir_all(corpus_dir.join("seeds"))?;
        fs::create_dir_all(&crash_dir)?;
        Ok(Self { corpus_dir, crash_dir, cache: Lru::new(cache_max_size) })
    }

    fn seed_path(&self, hash: &str) -> PathBuf {
        self.corpus_dir.join("seeds").join(format!("{hash}.bin"))
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        self.corpus_dir.join("seeds").join(format!("{hash}.meta.json"))
    }

    /// Writes a new seed to disk (content-addressed, a no-op if the hash
    /// already exists) and returns its id. The sidecar metadata file gets
    /// `null` when none is supplied, since every seed still needs one on
    /// disk per the persisted layout.
    pub fn put_seed(&mut self, bytes: &[u8]) -> Result<String> {
        self.write_seed(bytes, None)
    }

    /// The caller-facing "add a seed with metadata" operation: writes
    /// `<hash>.bin` and `<hash>.meta.json`, overwriting the sidecar if the
    /// seed already exists so re-adding a known seed can update its tags.
    pub fn add_seed(&mut self, bytes: &[u8], metadata: serde_json::Value) -> Result<String> {
        self.write_seed(bytes, Some(metadata))
    }

    fn write_seed(&mut self, bytes: &[u8], metadata: Option<serde_json::Value>) -> Result<String> {
        let hash = hash_hex(bytes);
        let path = self.seed_path(&hash);
        if !path.exists() {
            fs::write(&path, bytes).map_err(|e| Error::Corpus(CorpusError::Storage(e.to_string())))?;
        }
        let meta_path = self.meta_path(&hash);
        if metadata.is_some() || !meta_path.exists() {
            let json = serde_json::to_vec_pretty(&metadata.unwrap_or(serde_json::Value::Null))?;
            fs::write(&meta_path, json).map_err(|e| Error::Corpus(CorpusError::Storage(e.to_string())))?;
        }
        self.cache.insert(hash.clone(), Arc::new(bytes.to_vec()));
        Ok(hash)
    }

    pub fn get_seed_metadata(&self, hash: &str) -> Result<serde_json::Value> {
        let bytes = fs::read(self.meta_path(hash)).map_err(|_| Error::Corpus(CorpusError::SeedNotFound(hash.to_string())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Promotes `hash` in the LRU on a cache hit; loads from disk and
    /// inserts (evicting the oldest entry if over capacity) on a miss.
    pub fn get_seed(&mut self, hash: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) = self.cache.get(hash) {
            self.cache.touch(hash);
            return Ok(cached);
        }
        let path = self.seed_path(hash);
        let bytes = fs::read(&path).map_err(|_| Error::Corpus(CorpusError::SeedNotFound(hash.to_string())))?;
        let arc = Arc::new(bytes);
        self.cache.insert(hash.to_string(), arc.clone());
        Ok(arc)
    }

    pub fn get_cached_seeds(&self) -> Vec<(String, Arc<Vec<u8>>)> {
        self.cache.entries()
    }

    pub fn get_all_seed_ids(&self) -> Result<Vec<String>> {
        let dir = self.corpus_dir.join("seeds");
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Writes `crashes/<finding_id>/` with `input.bin`, optional
    /// `response.bin`, `report.json`, and `report.msgpack`. Returns the
    /// generated finding id.
    pub fn save_finding(&self, input: &[u8], response: Option<&[u8]>, report: &FindingReport) -> Result<Uuid> {
        let finding_id = Uuid::new_v4();
        let dir = self.crash_dir.join(finding_id.to_string());
        fs::create_dir_all(&dir).map_err(|e| Error::Corpus(CorpusError::FindingSave(e.to_string())))?;

        fs::write(dir.join("input.bin"), input).map_err(|e| Error::Corpus(CorpusError::FindingSave(e.to_string())))?;
        if let Some(response) = response {
            fs::write(dir.join("response.bin"), response)
                .map_err(|e| Error::Corpus(CorpusError::FindingSave(e.to_string())))?;
        }

        let json = serde_json::to_vec_pretty(report)?;
        fs::write(dir.join("report.json"), json).map_err(|e| Error::Corpus(CorpusError::FindingSave(e.to_string())))?;

        let msgpack = rmp_serde::to_vec(report)
            .map_err(|e| Error::Corpus(CorpusError::FindingSave(e.to_string())))?;
        fs::write(dir.join("report.msgpack"), msgpack)
            .map_err(|e| Error::Corpus(CorpusError::FindingSave(e.to_string())))?;

        Ok(finding_id)
    }

    pub fn list_findings(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.crash_dir)? {
            let entry = entry?;
            if let Ok(id) = Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn get_finding(&self, id: Uuid) -> Result<FindingReport> {
        let path = self.crash_dir.join(id.to_string()).join("report.json");
        let bytes = fs::read(&path).map_err(|_| Error::Corpus(CorpusError::FindingNotFound(id.to_string())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Aggregate counts for the `corpus_stats` operation: seed/finding
    /// totals plus a per-kind breakdown so callers don't have to read every
    /// finding report themselves just to count crashes vs hangs.
    pub fn corpus_stats(&self) -> Result<CorpusStats> {
        let seed_ids = self.get_all_seed_ids()?;
        let finding_ids = self.list_findings()?;

        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for id in &finding_ids {
            if let Ok(report) = self.get_finding(*id) {
                *by_kind.entry(format!("{:?}", report.kind)).or_insert(0) += 1;
            }
        }

        Ok(CorpusStats {
            seed_count: seed_ids.len(),
            cached_seed_count: self.cache.entries().len(),
            finding_count: finding_ids.len(),
            findings_by_kind: by_kind,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusStats {
    pub seed_count: usize,
    pub cached_seed_count: usize,
    pub finding_count: usize,
    pub findings_by_kind: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("statefuzz-corpus-test-{name}-{}", Uuid::new_v4()));
        dir
    }

    #[test]
    fn put_then_get_seed_round_trips() {
        let dir = tmp_dir("roundtrip");
        let mut store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        let hash = store.put_seed(b"hello").unwrap();
        let seed = store.get_seed(&hash).unwrap();
        assert_eq!(&**seed, b"hello");
    }

    #[test]
    fn lru_evicts_oldest_over_capacity() {
        let dir = tmp_dir("lru");
        let mut store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 2).unwrap();
        let a = store.put_seed(b"a").unwrap();
        let _b = store.put_seed(b"b").unwrap();
        let _c = store.put_seed(b"c").unwrap();
        assert!(store.cache.get(&a).is_none());
        assert_eq!(store.get_cached_seeds().len(), 2);
    }

    #[test]
    fn get_all_seed_ids_lists_disk_contents() {
        let dir = tmp_dir("ids");
        let mut store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        store.put_seed(b"one").unwrap();
        store.put_seed(b"two").unwrap();
        assert_eq!(store.get_all_seed_ids().unwrap().len(), 2);
    }

    #[test]
    fn save_finding_writes_both_report_formats() {
        let dir = tmp_dir("finding");
        let store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        let report = FindingReport {
            session_id: Uuid::new_v4(),
            timestamp: 0,
            kind: FindingKind::Crash,
            severity: Severity::High,
            error: Some("connection reset".to_string()),
            agent_telemetry: None,
        };
        let id = store.save_finding(b"bad input", Some(b"partial reply"), &report).unwrap();
        let finding_dir = dir.join("crashes").join(id.to_string());
        assert!(finding_dir.join("input.bin").exists());
        assert!(finding_dir.join("response.bin").exists());
        assert!(finding_dir.join("report.json").exists());
        assert!(finding_dir.join("report.msgpack").exists());
    }

    #[test]
    fn put_seed_writes_null_metadata_sidecar() {
        let dir = tmp_dir("sidecar-default");
        let mut store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        let hash = store.put_seed(b"hello").unwrap();
        assert_eq!(store.get_seed_metadata(&hash).unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn add_seed_overwrites_existing_metadata() {
        let dir = tmp_dir("sidecar-overwrite");
        let mut store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        store.put_seed(b"hello").unwrap();
        let hash = store.add_seed(b"hello", serde_json::json!({"source": "manual"})).unwrap();
        assert_eq!(store.get_seed_metadata(&hash).unwrap(), serde_json::json!({"source": "manual"}));
    }

    #[test]
    fn get_seed_metadata_for_unknown_hash_errors() {
        let dir = tmp_dir("sidecar-missing");
        let store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        assert!(store.get_seed_metadata("deadbeef").is_err());
    }

    #[test]
    fn get_finding_round_trips_report() {
        let dir = tmp_dir("get-finding");
        let store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        let report = FindingReport {
            session_id: Uuid::new_v4(),
            timestamp: 0,
            kind: FindingKind::Hang,
            severity: Severity::Medium,
            error: None,
            agent_telemetry: None,
        };
        let id = store.save_finding(b"input", None, &report).unwrap();
        let fetched = store.get_finding(id).unwrap();
        assert_eq!(fetched.kind, FindingKind::Hang);
        assert_eq!(fetched.severity, Severity::Medium);
    }

    #[test]
    fn get_finding_for_unknown_id_errors() {
        let dir = tmp_dir("get-finding-missing");
        let store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        assert!(store.get_finding(Uuid::new_v4()).is_err());
    }

    #[test]
    fn corpus_stats_counts_seeds_and_findings_by_kind() {
        let dir = tmp_dir("stats");
        let mut store = CorpusStore::new(dir.join("corpus"), dir.join("crashes"), 10).unwrap();
        store.put_seed(b"one").unwrap();
        store.put_seed(b"two").unwrap();

        let crash_report = FindingReport {
            session_id: Uuid::new_v4(),
            timestamp: 0,
            kind: FindingKind::Crash,
            severity: Severity::Critical,
            error: None,
            agent_telemetry: None,
        };
        let hang_report = FindingReport { kind: FindingKind::Hang, ..crash_report.clone() };
        store.save_finding(b"a", None, &crash_report).unwrap();
        store.save_finding(b"b", None, &hang_report).unwrap();

        let stats = store.corpus_stats().unwrap();
        assert_eq!(stats.seed_count, 2);
        assert_eq!(stats.finding_count, 2);
        assert_eq!(stats.findings_by_kind.get("Crash"), Some(&1));
        assert_eq!(stats.findings_by_kind.get("Hang"), Some(&1));
    }
}
