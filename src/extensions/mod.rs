//! Extension synchronization.
//!
//! The reconciler computes add/update/remove deltas between the desired
//! (remote) extension list and the locally installed set; the installer
//! and metadata query are collaborators behind traits.

pub mod host;
pub mod installer;
pub mod metadata;
pub mod reconciler;

pub use host::{DirExtensionHost, ExtensionHost};
pub use installer::{ExtensionInstaller, VsixInstaller};
pub use metadata::{ExtensionMetadata, MetadataProvider, VersionInfo, latest_compatible};
pub use reconciler::{ExtensionSyncResult, PhaseOutcome, ReconcilePlan, apply_plan, reconcile};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::SyncError;

/// One installed or desired extension. Identity is the id in the form
/// `publisher.name`, compared case-insensitively everywhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub id: String,
    pub name: String,
    pub publisher: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip)]
    pub local_archive_path: Option<PathBuf>,
}

impl Extension {
    pub fn new(
        publisher: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let publisher = publisher.into();
        let name = name.into();
        Self {
            id: format!("{}.{}", publisher, name),
            name,
            publisher,
            version: version.into(),
            download_url: None,
            local_archive_path: None,
        }
    }

    /// Lowercased id, the map/set key used for every comparison.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }
}

/// Parse the `extensions.json` payload (an array of extension objects).
pub fn parse_extension_list(content: &str) -> Result<Vec<Extension>, SyncError> {
    serde_json::from_str(content)
        .map_err(|e| SyncError::Document(format!("invalid extension list: {}", e)))
}

/// Serialize an extension list for upload, 4-space indented like the rest
/// of the settings documents.
pub fn serialize_extension_list(extensions: &[Extension]) -> String {
    crate::jsonc::to_pretty(&serde_json::json!(extensions))
}
