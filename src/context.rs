//! Session-scoped key-value store shared across stages and heartbeat.
//!
//! Thread-safety is the caller's responsibility to hold behind a
//! `tokio::sync::Mutex` (the orchestrator does this per session); the type
//! itself is a plain value type so it can be cloned for snapshotting and
//! cheaply passed around.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolError, Result};

/// 64 KiB cap on a snapshot, matching the resource cap in the concurrency
/// model.
pub const SNAPSHOT_CAP_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    Int(i64),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Str(String),
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Per-session key-value store. Keys are sorted on every snapshot so two
/// contexts with identical contents always serialize to identical bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolContext {
    values: BTreeMap<String, ContextValue>,
}

impl ProtocolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: ContextValue) {
        self.values.insert(key.into(), value);
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<ContextValue> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Merges `other` into `self`, `other` winning on key collision.
    pub fn merge(&mut self, other: &ProtocolContext) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Deterministic JSON snapshot: keys sorted (guaranteed by `BTreeMap`'s
    /// iteration order), bytes values base64-encoded under a type tag.
    /// Returns an error if the encoded snapshot would exceed
    /// [`SNAPSHOT_CAP_BYTES`] once excess keys (in sorted order, from the
    /// end) are dropped — in practice we drop keys until it fits and warn,
    /// rather than fail, since a session shouldn't die over an oversized
    /// debug blob.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut trimmed = self.clone();
        loop {
            let bytes = serde_json::to_vec(&trimmed)?;
            if bytes.len() <= SNAPSHOT_CAP_BYTES {
                return Ok(bytes);
            }
            match trimmed.values.keys().next_back().cloned() {
                Some(last_key) => {
                    tracing::warn!(key = %last_key, "context snapshot exceeds cap, dropping key");
                    trimmed.values.remove(&last_key);
                }
                None => {
                    // A single remaining key still exceeds the cap (e.g. one huge
                    // blob); nothing more to drop.
                    return Ok(bytes);
                }
            }
        }
    }

    pub fn restore(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(ProtocolError::parse(format!("invalid context snapshot: {e}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_deterministic() {
        let mut a = ProtocolContext::new();
        a.set("b", ContextValue::Int(2));
        a.set("a", ContextValue::Int(1));

        let mut b = ProtocolContext::new();
        b.set("a", ContextValue::Int(1));
        b.set("b", ContextValue::Int(2));

        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn restore_round_trips() {
        let mut ctx = ProtocolContext::new();
        ctx.set("token", ContextValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        ctx.set("name", ContextValue::Str("hello".to_string()));
        let snap = ctx.snapshot().unwrap();
        let restored = ProtocolContext::restore(&snap).unwrap();
        assert_eq!(restored.get("token"), ctx.get("token"));
        assert_eq!(restored.get("name"), ctx.get("name"));
    }

    #[test]
    fn merge_prefers_other() {
        let mut a = ProtocolContext::new();
        a.set("k", ContextValue::Int(1));
        let mut b = ProtocolContext::new();
        b.set("k", ContextValue::Int(2));
        a.merge(&b);
        assert_eq!(a.get("k"), Some(&ContextValue::Int(2)));
    }
}
