//! Engine configuration (`syncing.json`).
//!
//! Holds the remote credential, the collection id, exclusion patterns, and
//! the poka-yoke threshold. Loaded once per sync attempt and persisted
//! whenever a field changes (credential reset, first-sync id assignment,
//! revision bookkeeping).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// File name of the engine's private config inside the user config root.
pub const SYNCING_FILE_NAME: &str = "syncing.json";

/// Debounce window for the change watcher, in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncingConfig {
    /// Remote store access token. Cleared when the remote answers 401.
    pub remote_token: Option<String>,

    /// Identifier of the remote collection. Cleared when the remote answers
    /// 404; assigned on first upload when the collection is created.
    pub remote_collection_id: Option<String>,

    /// Proxy URL override for all remote traffic.
    pub proxy_url: Option<String>,

    /// Number of counted structural changes at which an upload/download
    /// requires explicit confirmation. Zero disables the gate.
    pub exclusion_threshold: u32,

    /// Globs matched against extension ids (lowercased). Matching
    /// extensions never leave the machine and are never removed.
    pub excluded_extension_patterns: Vec<String>,

    /// Globs matched against top-level settings keys. Matching keys are
    /// stripped before upload and repopulated from the local copy on
    /// download.
    pub excluded_setting_keys_patterns: Vec<String>,

    /// Upload keybindings under a platform-specific remote name.
    pub separate_keybindings_by_platform: bool,

    /// Upgrade synced extensions to the latest engine-compatible version
    /// during download.
    pub auto_update_extensions: bool,

    /// Revision timestamp of the last successful upload.
    pub last_uploaded: Option<String>,

    /// Revision timestamp of the last successful download.
    pub last_downloaded: Option<String>,
}

impl Default for SyncingConfig {
    fn default() -> Self {
        Self {
            remote_token: None,
            remote_collection_id: None,
            proxy_url: None,
            exclusion_threshold: 10,
            excluded_extension_patterns: Vec::new(),
            excluded_setting_keys_patterns: Vec::new(),
            separate_keybindings_by_platform: false,
            auto_update_extensions: false,
            last_uploaded: None,
            last_downloaded: None,
        }
    }
}

impl SyncingConfig {
    /// Load the config from `syncing.json`, falling back to defaults when
    /// the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no syncing.json, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SyncingConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Persist the config, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Clear the stored credential (remote answered 401) and persist.
    pub fn reset_token(&mut self, path: &Path) -> Result<()> {
        self.remote_token = None;
        self.save(path)
    }

    /// Clear the stored collection id (remote answered 404) and persist.
    pub fn reset_collection_id(&mut self, path: &Path) -> Result<()> {
        self.remote_collection_id = None;
        self.save(path)
    }
}
