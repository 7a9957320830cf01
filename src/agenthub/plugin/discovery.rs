//! Plugin discovery: scan search roots, introspect candidates, and
//! maintain the registry documents.
//!
//! Each candidate executable is spawned once in a short-lived
//! introspection session: handshake, `definition`, then the optional
//! surface (`version`, `metadata`, `compatibility`, `required_config`,
//! `web_page_list`), then `shutdown`. Results land in an in-memory
//! [`PluginIndex`] and are mirrored to a registry JSON document keyed by
//! plugin id with absolute executable paths and content hashes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use plugin_rpc::wire::{Compatibility, ConfigVar, PluginMetadata, WebPage};

use super::process::PluginProcess;
use super::PluginError;
use crate::agenthub::persist::{read_json, write_json_atomic};
use crate::agenthub::tool_protocol::ToolMetadata;

/// Version string this host advertises for compatibility checks.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capability flags derived during introspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginCapabilities {
    pub versioned: bool,
    pub metadata_provider: bool,
    pub init_config_provider: bool,
    pub web_page_provider: bool,
}

/// Everything discovery learned about one plugin executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Plugin id, derived from the declared tool name.
    pub id: String,
    /// Absolute executable path.
    pub path: PathBuf,
    /// SHA-256 of the executable at introspection time.
    pub sha256: String,
    pub description: String,
    pub parameters_schema: Value,
    /// Per-call timeout declared by the plugin, overriding the host
    /// default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PluginMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<Compatibility>,
    #[serde(default)]
    pub required_config: Vec<ConfigVar>,
    #[serde(default)]
    pub web_pages: Vec<WebPage>,
    #[serde(default)]
    pub capabilities: PluginCapabilities,
    pub discovered_at: DateTime<Utc>,
}

impl PluginRecord {
    pub fn tool_metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            self.id.clone(),
            self.description.clone(),
            self.parameters_schema.clone(),
        )
    }
}

/// Outcome of evaluating a plugin's host-compatibility bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatLevel {
    Compatible,
    /// Within min/max but older than the recommended host version.
    Warning(String),
    /// Outside min/max; the plugin must not be enabled.
    Error(String),
}

/// Compare dotted version strings segment-wise, missing segments = 0.
fn cmp_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|seg| {
                seg.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Evaluate the host version against a plugin's declared bounds.
pub fn evaluate_compatibility(host_version: &str, compat: Option<&Compatibility>) -> CompatLevel {
    let compat = match compat {
        Some(c) => c,
        None => return CompatLevel::Compatible,
    };
    if let Some(min) = compat.min_host_version.as_deref() {
        if cmp_versions(host_version, min) == std::cmp::Ordering::Less {
            return CompatLevel::Error(format!(
                "host {} is older than required minimum {}",
                host_version, min
            ));
        }
    }
    if let Some(max) = compat.max_host_version.as_deref() {
        if cmp_versions(host_version, max) == std::cmp::Ordering::Greater {
            return CompatLevel::Error(format!(
                "host {} is newer than supported maximum {}",
                host_version, max
            ));
        }
    }
    if let Some(recommended) = compat.recommended_host_version.as_deref() {
        if cmp_versions(host_version, recommended) == std::cmp::Ordering::Less {
            return CompatLevel::Warning(format!(
                "host {} is older than recommended {}",
                host_version, recommended
            ));
        }
    }
    CompatLevel::Compatible
}

/// In-memory plugin index, keyed by plugin id.
#[derive(Default)]
pub struct PluginIndex {
    records: HashMap<String, PluginRecord>,
}

impl PluginIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<PluginRecord>) -> Self {
        let mut index = Self::new();
        for record in records {
            index.insert(record);
        }
        index
    }

    /// Insert a record; the first record for an id wins (search roots
    /// are scanned in precedence order).
    pub fn insert(&mut self, record: PluginRecord) {
        self.records.entry(record.id.clone()).or_insert(record);
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.records.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The persisted registry document (one local, one cached-remote).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginRegistryDoc {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginRecord>,
}

impl PluginRegistryDoc {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        write_json_atomic(path, self)
    }

    pub fn from_index(index: &PluginIndex) -> Self {
        Self {
            version: 1,
            plugins: index
                .records
                .values()
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
        }
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Spawn `path` in introspection mode and build its [`PluginRecord`].
pub async fn introspect_executable(path: &Path) -> Result<PluginRecord, PluginError> {
    let path = path
        .canonicalize()
        .map_err(|e| PluginError::Spawn(format!("{}: {}", path.display(), e)))?;
    let mut process = PluginProcess::spawn(&path).await?;

    let definition = process.definition().await?;
    if definition.name.trim().is_empty()
        || definition.name.chars().any(|c| c.is_whitespace())
    {
        process.shutdown(Duration::from_secs(1)).await;
        return Err(PluginError::SchemaMismatch(format!(
            "plugin id must be a single whitespace-free token, got {:?}",
            definition.name
        )));
    }

    let version = process.version().await.ok().flatten();
    let metadata = process.metadata().await.ok().flatten();
    let compatibility = process.compatibility().await.ok().flatten();
    let required_config = process.required_config().await.unwrap_or_default();
    let web_pages = process.web_page_list().await.unwrap_or_default();
    process.shutdown(Duration::from_secs(2)).await;

    let capabilities = PluginCapabilities {
        versioned: version.is_some(),
        metadata_provider: metadata.is_some(),
        init_config_provider: !required_config.is_empty(),
        web_page_provider: !web_pages.is_empty(),
    };

    Ok(PluginRecord {
        id: definition.name,
        sha256: sha256_file(&path).map_err(|e| PluginError::Spawn(e.to_string()))?,
        path,
        description: definition.description,
        parameters_schema: definition.parameters_schema,
        call_timeout_secs: definition.timeout_secs,
        version: version.map(|v| v.version),
        metadata,
        compatibility,
        required_config,
        web_pages,
        capabilities,
        discovered_at: Utc::now(),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Scan the ordered search roots and introspect every executable found.
///
/// Earlier roots take precedence on id collisions. Candidates that fail
/// the handshake or introspection are logged and skipped.
pub async fn scan_roots(roots: &[PathBuf]) -> PluginIndex {
    let mut index = PluginIndex::new();
    for root in roots {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("plugin root {} not scanned: {}", root.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_executable(&path) {
                continue;
            }
            match introspect_executable(&path).await {
                Ok(record) => {
                    log::info!("discovered plugin {} at {}", record.id, path.display());
                    index.insert(record);
                }
                Err(e) => {
                    log::warn!("skipping {}: {}", path.display(), e);
                }
            }
        }
    }
    index
}
