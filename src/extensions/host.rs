//! Installed-extension enumeration.
//!
//! The editor host owns the real list; outside the editor the versioned
//! directory layout under the extensions root is authoritative.

use semver::Version;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::extensions::Extension;

pub trait ExtensionHost {
    fn installed_extensions(&self) -> Vec<Extension>;
}

/// Reads `publisher.name-version` directories under the extensions root.
pub struct DirExtensionHost {
    root: PathBuf,
}

impl DirExtensionHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Split a versioned directory name into `(id, version)`. The version is
/// the suffix after the rightmost `-` that parses as semver, so ids with
/// hyphens and prerelease versions both resolve.
fn parse_dir_name(name: &str) -> Option<(String, String)> {
    for (idx, _) in name.match_indices('-').collect::<Vec<_>>().into_iter().rev() {
        let version = &name[idx + 1..];
        if Version::parse(version).is_ok() {
            return Some((name[..idx].to_string(), version.to_string()));
        }
    }
    None
}

impl ExtensionHost for DirExtensionHost {
    fn installed_extensions(&self) -> Vec<Extension> {
        let mut extensions = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return extensions,
        };
        for entry in entries.filter_map(Result::ok) {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, version)) = parse_dir_name(&dir_name) else {
                continue;
            };
            let Some((publisher, name)) = id.split_once('.') else {
                continue;
            };
            let mut ext = Extension::new(publisher, name, version);
            ext.id = id;
            extensions.push(ext);
        }
        extensions.sort_by(|a, b| a.key().cmp(&b.key()));
        debug!(count = extensions.len(), root = %self.root.display(), "scanned installed extensions");
        extensions
    }
}
