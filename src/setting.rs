//! The local setting model: what files exist, how they map to remote
//! names, and how their content is loaded and saved.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::SyncingConfig;
use crate::env::Environment;
use crate::errors::SyncError;

/// Prefix prepended to snippet file names in the remote collection.
pub const SNIPPET_PREFIX: &str = "snippet-";

pub const SETTINGS_FILE: &str = "settings.json";
pub const KEYBINDINGS_FILE: &str = "keybindings.json";
pub const KEYBINDINGS_MAC_FILE: &str = "keybindings-mac.json";
pub const LOCALE_FILE: &str = "locale.json";
pub const EXTENSIONS_FILE: &str = "extensions.json";

/// Kinds of synchronized settings, in processing order. Extensions are
/// always last: every other kind must be durably written before extensions
/// are touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingKind {
    Settings,
    Keybindings,
    Locale,
    Snippets,
    Extensions,
}

impl SettingKind {
    pub const ORDERED: [SettingKind; 5] = [
        SettingKind::Settings,
        SettingKind::Keybindings,
        SettingKind::Locale,
        SettingKind::Snippets,
        SettingKind::Extensions,
    ];
}

/// One synchronized item. Identity is `(kind, remote_name)`. Content stays
/// `None` until loaded; an item whose load failed is excluded from write
/// batches and recorded as an error.
#[derive(Debug, Clone)]
pub struct Setting {
    pub kind: SettingKind,
    pub local_path: PathBuf,
    pub remote_name: String,
    pub content: Option<String>,
}

impl Setting {
    pub fn new(kind: SettingKind, local_path: PathBuf, remote_name: impl Into<String>) -> Self {
        Self {
            kind,
            local_path,
            remote_name: remote_name.into(),
            content: None,
        }
    }

    /// Read the file content from disk. A missing or unreadable file leaves
    /// `content` as `None` and reports `ContentLoad`; callers accumulate the
    /// error and keep going.
    pub fn load_content(&mut self) -> Result<(), SyncError> {
        match fs::read_to_string(&self.local_path) {
            Ok(content) => {
                self.content = Some(content);
                Ok(())
            }
            Err(source) => Err(SyncError::ContentLoad {
                name: self.remote_name.clone(),
                source,
            }),
        }
    }

    /// Write content to the local path, creating parent directories.
    pub fn save_content(&self, content: &str) -> Result<(), SyncError> {
        if let Some(parent) = self.local_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::Save {
                name: self.remote_name.clone(),
                reason: e.to_string(),
            })?;
        }
        fs::write(&self.local_path, content).map_err(|e| SyncError::Save {
            name: self.remote_name.clone(),
            reason: e.to_string(),
        })
    }

    pub fn delete_local(&self) -> Result<(), SyncError> {
        if self.local_path.exists() {
            fs::remove_file(&self.local_path).map_err(|e| SyncError::Save {
                name: self.remote_name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Remote file name for the keybindings setting under the current platform
/// and config.
pub fn keybindings_remote_name(env: &Environment, config: &SyncingConfig) -> &'static str {
    if config.separate_keybindings_by_platform && env.is_mac() {
        KEYBINDINGS_MAC_FILE
    } else {
        KEYBINDINGS_FILE
    }
}

/// True when a remote file name denotes a snippet.
pub fn is_snippet_remote_name(name: &str) -> bool {
    name.starts_with(SNIPPET_PREFIX)
}

/// Local snippet path for a remote snippet name (prefix stripped).
pub fn snippet_local_path(env: &Environment, remote_name: &str) -> PathBuf {
    let file_name = remote_name.strip_prefix(SNIPPET_PREFIX).unwrap_or(remote_name);
    env.snippets_dir().join(file_name)
}

/// Enumerate the local settings in the fixed processing order. The
/// Extensions entry is always present and always last; its content is
/// serialized by the orchestrator from the installed extension list rather
/// than read from disk.
pub fn gather_local(env: &Environment, config: &SyncingConfig) -> Vec<Setting> {
    let root = env.config_root();
    let mut settings = vec![
        Setting::new(
            SettingKind::Settings,
            root.join(SETTINGS_FILE),
            SETTINGS_FILE,
        ),
        Setting::new(
            SettingKind::Keybindings,
            root.join(KEYBINDINGS_FILE),
            keybindings_remote_name(env, config),
        ),
        Setting::new(SettingKind::Locale, root.join(LOCALE_FILE), LOCALE_FILE),
    ];

    settings.extend(gather_snippets(env));

    settings.push(Setting::new(
        SettingKind::Extensions,
        root.join(EXTENSIONS_FILE),
        EXTENSIONS_FILE,
    ));
    settings
}

fn gather_snippets(env: &Environment) -> Vec<Setting> {
    let dir = env.snippets_dir();
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut snippets: Vec<Setting> = WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            Setting::new(
                SettingKind::Snippets,
                entry.path().to_path_buf(),
                format!("{}{}", SNIPPET_PREFIX, file_name),
            )
        })
        .collect();
    snippets.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
    debug!(count = snippets.len(), "gathered local snippets");
    snippets
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(dir: &TempDir) -> Environment {
        Environment::new(dir.path(), dir.path().join("extensions"), "1.90.0")
    }

    #[test]
    fn test_gather_orders_extensions_last() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        fs::create_dir_all(env.snippets_dir()).unwrap();
        fs::write(env.snippets_dir().join("rust.json"), "{}").unwrap();

        let settings = gather_local(&env, &SyncingConfig::default());
        assert_eq!(settings.first().unwrap().kind, SettingKind::Settings);
        assert_eq!(settings.last().unwrap().kind, SettingKind::Extensions);
        assert!(
            settings
                .iter()
                .any(|s| s.remote_name == "snippet-rust.json")
        );
    }

    #[test]
    fn test_keybindings_name_follows_platform_flag() {
        let dir = TempDir::new().unwrap();
        let mac = env(&dir).with_mac(true);
        let other = env(&dir).with_mac(false);
        let mut config = SyncingConfig::default();

        assert_eq!(keybindings_remote_name(&mac, &config), KEYBINDINGS_FILE);
        config.separate_keybindings_by_platform = true;
        assert_eq!(keybindings_remote_name(&mac, &config), KEYBINDINGS_MAC_FILE);
        assert_eq!(keybindings_remote_name(&other, &config), KEYBINDINGS_FILE);
    }

    #[test]
    fn test_load_content_missing_file_reports_content_load() {
        let dir = TempDir::new().unwrap();
        let mut setting = Setting::new(
            SettingKind::Settings,
            dir.path().join("absent.json"),
            SETTINGS_FILE,
        );
        let err = setting.load_content().unwrap_err();
        assert!(matches!(err, SyncError::ContentLoad { .. }));
        assert!(setting.content.is_none());
    }

    #[test]
    fn test_snippet_remote_name_roundtrip() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        assert!(is_snippet_remote_name("snippet-rust.json"));
        assert!(!is_snippet_remote_name("settings.json"));
        assert_eq!(
            snippet_local_path(&env, "snippet-rust.json"),
            env.snippets_dir().join("rust.json")
        );
    }
}
