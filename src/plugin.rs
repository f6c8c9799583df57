//! Plugin contract and tiered discovery. A plugin is a JSON manifest
//! naming a protocol's data model plus everything needed to drive it:
//! optional state model, response model, seeds, multi-stage
//! `protocol_stack`, connection and heartbeat configuration.
//!
//! `validate_response` and per-field response handlers are native closures
//! the embedding application registers separately under the plugin's
//! name — a JSON manifest has no way to carry executable code, so those
//! two contract members live in [`PluginCallbacks`] instead of
//! [`PluginManifest`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::data_model::{DataModel, FieldMap};
use crate::error::{Error, PluginError, Result};
use crate::session::TransportKind;
use crate::session::stateful::StateModel;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginTier {
    Custom,
    Examples,
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub mode: crate::session::ConnectionMode,
    pub connect_timeout_ms: u64,
    pub backoff_ms: u64,
    pub max_reconnects: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSpec {
    pub interval_ms: u64,
    pub interval_from_context: Option<String>,
    pub jitter_ms: u64,
    pub data_model: DataModel,
    pub expect_response: bool,
    pub response_timeout_ms: u64,
    pub max_failures: u32,
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub data_model: DataModel,
    pub state_model: Option<StateModel>,
    pub response_model: Option<DataModel>,
    #[serde(default)]
    pub seeds: Vec<String>,
    pub protocol_stack: Option<Vec<Stage>>,
    pub connection: Option<ConnectionSpec>,
    pub heartbeat: Option<HeartbeatSpec>,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
}

impl PluginManifest {
    /// Base64-decoded seed bytes; a manifest with none yields an empty
    /// list, leaving auto-generation to `corpus::seeds`.
    pub fn decoded_seeds(&self) -> Result<Vec<Vec<u8>>> {
        self.seeds
            .iter()
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| Error::Plugin(PluginError::Load(format!("seed is not valid base64: {e}"))))
            })
            .collect()
    }
}

/// A response oracle's verdict: `LogicalFailure` is a definite spec
/// violation (`false` or an error raised by the oracle itself), `Anomaly`
/// is a softer "this looks wrong but isn't a confirmed violation" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseVerdict {
    Pass,
    LogicalFailure,
    Anomaly,
}

/// Native callbacks a plugin can't express as JSON: the response oracle
/// and per-message response handlers. Registered separately from the
/// manifest, keyed by plugin name.
#[derive(Clone)]
pub struct PluginCallbacks {
    pub validate_response: Option<std::sync::Arc<dyn Fn(&[u8]) -> Result<ResponseVerdict> + Send + Sync>>,
    pub response_handlers: Option<std::sync::Arc<dyn Fn(&FieldMap) -> Result<()> + Send + Sync>>,
}

impl Default for PluginCallbacks {
    fn default() -> Self {
        Self { validate_response: None, response_handlers: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parses `code` as a plugin manifest and runs sanity checks beyond plain
/// JSON-schema validity. Parse failure is the only hard error; everything
/// else is a warning so a slightly underspecified plugin still loads.
pub fn validate_plugin(code: &str) -> ValidationResult {
    let manifest: PluginManifest = match serde_json::from_str(code) {
        Ok(m) => m,
        Err(e) => {
            return ValidationResult { valid: false, errors: vec![e.to_string()], warnings: Vec::new() };
        }
    };

    let mut warnings = Vec::new();
    if manifest.seeds.is_empty() {
        warnings.push("no seeds declared; corpus::seeds will auto-generate defaults".to_string());
    }
    if manifest.response_model.is_none() {
        warnings.push("no response_model; stage exports/expect and response classification are unavailable".to_string());
    }
    if manifest.state_model.is_some() && manifest.data_model.command_field().is_none() {
        warnings.push("state_model present but data_model has no command/message_type field for seed matching".to_string());
    }

    ValidationResult { valid: true, errors: Vec::new(), warnings }
}

pub struct PluginManager {
    plugins: HashMap<String, PluginManifest>,
    callbacks: HashMap<String, PluginCallbacks>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self { plugins: HashMap::new(), callbacks: HashMap::new() }
    }

    /// Scans each `(tier, dir)` pair for `*.json` files and loads them as
    /// manifests, regardless of the order `roots` is given in: tiers are
    /// always processed `custom` first, `standard` last, and a name
    /// already claimed by an earlier tier is never overwritten (a
    /// conflict is logged and the later definition dropped).
    pub fn discover(&mut self, roots: &[(PluginTier, PathBuf)]) -> Result<()> {
        let mut ordered: Vec<&(PluginTier, PathBuf)> = roots.iter().collect();
        ordered.sort_by_key(|(tier, _)| *tier);

        for (tier, dir) in ordered {
            if !dir.is_dir() {
                continue;
            }
            let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(std::result::Result::ok).collect();
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let code = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Plugin(PluginError::Load(format!("{}: {e}", path.display()))))?;
                let manifest: PluginManifest = serde_json::from_str(&code)
                    .map_err(|e| Error::Plugin(PluginError::Load(format!("{}: {e}", path.display()))))?;

                if self.plugins.contains_key(&manifest.name) {
                    tracing::warn!(
                        plugin = %manifest.name, tier = ?tier, path = %path.display(),
                        "plugin name already claimed by a higher-priority tier, skipping"
                    );
                    continue;
                }
                self.plugins.insert(manifest.name.clone(), manifest);
            }
        }
        Ok(())
    }

    pub fn register_callbacks(&mut self, name: impl Into<String>, callbacks: PluginCallbacks) {
        self.callbacks.insert(name.into(), callbacks);
    }

    pub fn get_plugin(&self, name: &str) -> Option<&PluginManifest> {
        self.plugins.get(name)
    }

    pub fn get_callbacks(&self, name: &str) -> Option<&PluginCallbacks> {
        self.callbacks.get(name)
    }

    pub fn list_plugins(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_plugin(dir: &Path, name: &str, plugin_name: &str) {
        let manifest = serde_json::json!({
            "name": plugin_name,
            "data_model": {"blocks": []},
            "state_model": null,
            "response_model": null,
            "seeds": [],
            "protocol_stack": null,
            "connection": null,
            "heartbeat": null,
            "transport": "tcp",
        });
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        write!(file, "{}", serde_json::to_string(&manifest).unwrap()).unwrap();
    }

    fn tmp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("statefuzz-plugin-test-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn custom_tier_wins_over_standard_on_name_conflict() {
        let custom_dir = tmp_dir("custom");
        let standard_dir = tmp_dir("standard");
        write_plugin(&custom_dir, "echo.json", "echo");
        write_plugin(&standard_dir, "echo.json", "echo");

        let mut manager = PluginManager::new();
        manager
            .discover(&[(PluginTier::Standard, standard_dir), (PluginTier::Custom, custom_dir)])
            .unwrap();

        assert_eq!(manager.list_plugins(), vec!["echo"]);
    }

    #[test]
    fn validate_plugin_rejects_invalid_json() {
        let result = validate_plugin("not json");
        assert!(!result.valid);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn validate_plugin_warns_on_missing_seeds() {
        let manifest = serde_json::json!({
            "name": "echo",
            "data_model": {"blocks": []},
            "state_model": null,
            "response_model": null,
            "seeds": [],
            "protocol_stack": null,
            "connection": null,
            "heartbeat": null,
            "transport": "tcp",
        });
        let result = validate_plugin(&manifest.to_string());
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("seeds")));
    }
}
