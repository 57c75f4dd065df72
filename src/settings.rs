//! Persistent user settings (`settings.json`).
//!
//! Loading never fails: a missing or corrupt file yields the defaults. Saving
//! validates first and replaces the file atomically.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid settings: {reason}")]
    Invalid { reason: String },

    #[error("failed to write settings to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        reason: reason.into(),
    }
}

/// The settings document. Keys this server does not know are carried through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub mcp_config_path: String,
    #[serde(default)]
    pub active_voice_agent: Option<String>,
    #[serde(default)]
    pub voice_agent_config: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_theme() -> String {
    "light".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            mcp_config_path: String::new(),
            active_voice_agent: None,
            voice_agent_config: Map::new(),
            extra: Map::new(),
        }
    }
}

impl Settings {
    /// Validate a document submitted by a client and decode it.
    pub fn from_value(value: Value) -> Result<Self, SettingsError> {
        let obj = value
            .as_object()
            .ok_or_else(|| invalid("settings must be a JSON object"))?;

        match obj.get("theme") {
            Some(Value::String(theme)) if !theme.trim().is_empty() => {}
            _ => return Err(invalid("theme must be a non-empty string")),
        }
        match obj.get("mcp_config_path") {
            None | Some(Value::String(_)) => {}
            Some(_) => return Err(invalid("mcp_config_path must be a string")),
        }
        match obj.get("active_voice_agent") {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => return Err(invalid("active_voice_agent must be a string or null")),
        }
        match obj.get("voice_agent_config") {
            None => {}
            Some(Value::Object(configs)) => {
                if let Some((agent, _)) = configs.iter().find(|(_, c)| !c.is_object()) {
                    return Err(invalid(format!(
                        "voice_agent_config.{agent} must be an object"
                    )));
                }
            }
            Some(_) => return Err(invalid("voice_agent_config must be an object")),
        }

        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
    }

    /// Stored config for one agent type, if any.
    pub fn agent_config(&self, agent_type: &str) -> Option<Value> {
        self.voice_agent_config.get(agent_type).cloned()
    }
}

/// Settings held in memory and mirrored to disk.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load from `path`, falling back to defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = read_settings(&path);
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn agent_config(&self, agent_type: &str) -> Option<Value> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .agent_config(agent_type)
    }

    /// Configured tool server file, if one is set.
    pub fn mcp_config_path(&self) -> Option<PathBuf> {
        let settings = self.current.read().unwrap_or_else(PoisonError::into_inner);
        let raw = settings.mcp_config_path.trim();
        (!raw.is_empty()).then(|| PathBuf::from(raw))
    }

    /// Validate, persist and adopt a new settings document.
    pub fn save(&self, value: Value) -> Result<Settings, SettingsError> {
        let settings = Settings::from_value(value)?;
        write_settings(&self.path, &settings)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(settings)
    }
}

fn read_settings(path: &Path) -> Settings {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Settings::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read settings, using defaults");
            return Settings::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt settings file, using defaults");
            Settings::default()
        }
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let content = serde_json::to_string_pretty(settings).map_err(|e| invalid(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json"));
        assert_eq!(store.get(), Settings::default());
        assert!(store.mcp_config_path().is_none());
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(SettingsStore::load(&path).get().theme, "light");
    }

    #[test]
    fn test_partial_file_merges_defaults_and_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"theme": "dark", "font_size": 14}"#).unwrap();

        let settings = SettingsStore::load(&path).get();
        assert_eq!(settings.theme, "dark");
        assert!(settings.voice_agent_config.is_empty());
        assert_eq!(settings.extra.get("font_size"), Some(&json!(14)));

        let round = serde_json::to_value(&settings).unwrap();
        assert_eq!(round["font_size"], 14);
    }

    #[test]
    fn test_save_validates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::load(&path);

        let err = store.save(json!({"theme": ""})).unwrap_err();
        assert!(err.to_string().contains("theme"));
        let err = store
            .save(json!({"theme": "dark", "voice_agent_config": {"Echo": 3}}))
            .unwrap_err();
        assert!(err.to_string().contains("voice_agent_config.Echo"));
        assert!(!path.exists());

        store
            .save(json!({
                "theme": "dark",
                "mcp_config_path": "/tmp/servers.json",
                "active_voice_agent": "Echo",
                "voice_agent_config": {"Echo": {"prefix": "> "}}
            }))
            .unwrap();
        assert_eq!(store.agent_config("Echo"), Some(json!({"prefix": "> "})));
        assert_eq!(
            store.mcp_config_path(),
            Some(PathBuf::from("/tmp/servers.json"))
        );

        let reloaded = SettingsStore::load(&path);
        assert_eq!(reloaded.get(), store.get());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
