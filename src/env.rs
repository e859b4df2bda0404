//! Resolved filesystem layout for the engine.
//!
//! One `Environment` is built at the composition root and passed by
//! reference to every component that touches the disk. There are no
//! process-wide singletons; tests construct an `Environment` over a temp
//! directory.

use std::path::{Path, PathBuf};

use crate::config::SYNCING_FILE_NAME;

/// Subdirectory of the config root holding snippet files.
pub const SNIPPETS_DIR_NAME: &str = "snippets";

#[derive(Debug, Clone)]
pub struct Environment {
    /// User configuration root (the directory holding `settings.json`).
    config_root: PathBuf,
    /// Root directory for installed extensions (`publisher.name-version`
    /// subdirectories).
    extensions_root: PathBuf,
    /// Host editor version, used to pick engine-compatible extension
    /// versions during auto-update.
    host_version: String,
    /// Whether keybindings are stored under the macOS remote name.
    is_mac: bool,
}

impl Environment {
    pub fn new(
        config_root: impl Into<PathBuf>,
        extensions_root: impl Into<PathBuf>,
        host_version: impl Into<String>,
    ) -> Self {
        Self {
            config_root: config_root.into(),
            extensions_root: extensions_root.into(),
            host_version: host_version.into(),
            is_mac: cfg!(target_os = "macos"),
        }
    }

    /// Override platform detection; used by tests and by the platform
    /// keybindings flag handling.
    pub fn with_mac(mut self, is_mac: bool) -> Self {
        self.is_mac = is_mac;
        self
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn extensions_root(&self) -> &Path {
        &self.extensions_root
    }

    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    pub fn is_mac(&self) -> bool {
        self.is_mac
    }

    pub fn snippets_dir(&self) -> PathBuf {
        self.config_root.join(SNIPPETS_DIR_NAME)
    }

    pub fn syncing_file(&self) -> PathBuf {
        self.config_root.join(SYNCING_FILE_NAME)
    }

    /// Directory an extension version unpacks into.
    pub fn extension_dir(&self, id: &str, version: &str) -> PathBuf {
        self.extensions_root
            .join(format!("{}-{}", id.to_lowercase(), version))
    }
}
