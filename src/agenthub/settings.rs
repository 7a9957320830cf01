//! Global settings and process-state documents.
//!
//! Two small JSON documents live at the data-directory root: the global
//! settings (per-provider credentials and toggles, plugin search roots)
//! and the process state (onboarding and menu-bar preferences owned by
//! the outer shell; the core only stores and returns them).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agenthub::persist::{read_json, write_json_atomic};

/// Credentials and endpoint configuration for one LLM provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Custom base URL; each adapter falls back to its provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The "global settings" document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "GlobalSettings::current_version")]
    pub version: u32,
    /// Keyed by provider id: `"openai"`, `"anthropic"`, `"ollama"`.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Ordered plugin search roots, scanned front to back.
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
    /// Free-form feature toggles consumed by the outer layers.
    #[serde(default)]
    pub toggles: HashMap<String, bool>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            version: Self::current_version(),
            providers: HashMap::new(),
            plugin_dirs: Vec::new(),
            toggles: HashMap::new(),
        }
    }
}

impl GlobalSettings {
    fn current_version() -> u32 {
        1
    }

    /// Load settings from `path`, returning defaults when the file does
    /// not exist yet.
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        write_json_atomic(path, self)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderSettings> {
        self.providers.get(id)
    }
}

/// The "process state" document: onboarding/menu-bar preferences the
/// outer shell persists through the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(default)]
    pub onboarding_complete: bool,
    #[serde(default)]
    pub menu_bar_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_agent: Option<String>,
}

impl ProcessState {
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        write_json_atomic(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GlobalSettings::load(&dir.path().join("settings.json")).unwrap();
        assert!(settings.providers.is_empty());
        assert_eq!(settings.version, 1);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = GlobalSettings::default();
        settings.providers.insert(
            "openai".to_string(),
            ProviderSettings {
                api_key: Some("sk-test".to_string()),
                ..Default::default()
            },
        );
        settings.save(&path).unwrap();
        let back = GlobalSettings::load(&path).unwrap();
        assert_eq!(
            back.provider("openai").unwrap().api_key.as_deref(),
            Some("sk-test")
        );
        assert!(back.provider("openai").unwrap().enabled);
    }
}
