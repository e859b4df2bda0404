//! Extension package install, update, and removal.
//!
//! Install downloads the package archive, unpacks it into a versioned
//! directory named `publisher.name-version`, and is tolerant of a metadata
//! sidecar being absent. Update removes the previous version's directory
//! after the new one is in place; remove deletes the versioned directory.

use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use zip::read::ZipArchive;

use crate::env::Environment;
use crate::errors::{SyncError, SyncResult};
use crate::extensions::Extension;

/// Directory inside a package archive holding the extension payload.
const ARCHIVE_PAYLOAD_DIR: &str = "extension/";

#[allow(async_fn_in_trait)]
pub trait ExtensionInstaller {
    async fn install(&self, ext: &Extension) -> SyncResult<()>;
    /// Replace `old_version` with `ext.version`: download and unpack the
    /// new directory, then drop the old one.
    async fn update(&self, old_version: &str, ext: &Extension) -> SyncResult<()>;
    async fn remove(&self, ext: &Extension) -> SyncResult<()>;
}

pub struct VsixInstaller {
    http: reqwest::Client,
    env: Environment,
}

impl VsixInstaller {
    pub fn new(env: Environment, proxy_url: Option<&str>) -> SyncResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("edsync/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| SyncError::Network(format!("bad proxy url: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            http: builder
                .build()
                .map_err(|e| SyncError::Network(e.to_string()))?,
            env,
        })
    }

    fn install_error(ext: &Extension, reason: impl Into<String>) -> SyncError {
        SyncError::Install {
            id: ext.id.clone(),
            reason: reason.into(),
        }
    }

    async fn fetch_archive(&self, ext: &Extension) -> SyncResult<bytes::Bytes> {
        if let Some(path) = &ext.local_archive_path {
            let data = fs::read(path)
                .map_err(|e| Self::install_error(ext, format!("archive read: {}", e)))?;
            return Ok(bytes::Bytes::from(data));
        }
        let url = ext
            .download_url
            .as_deref()
            .ok_or_else(|| Self::install_error(ext, "no download URL"))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Self::install_error(ext, format!("download: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Self::install_error(ext, format!("download HTTP {}", status)));
        }
        resp.bytes()
            .await
            .map_err(|e| Self::install_error(ext, format!("download: {}", e)))
    }

    /// Find the versioned directory for an installed extension. Editors
    /// create these with the id's original casing, so fall back to a
    /// case-insensitive scan when the lowercased default is absent.
    fn locate_dir(&self, id: &str, version: &str) -> PathBuf {
        let default = self.env.extension_dir(id, version);
        if default.exists() {
            return default;
        }
        let want = format!("{}-{}", id, version).to_lowercase();
        if let Ok(entries) = fs::read_dir(self.env.extensions_root()) {
            for entry in entries.filter_map(Result::ok) {
                if entry.file_name().to_string_lossy().to_lowercase() == want {
                    return entry.path();
                }
            }
        }
        default
    }

    /// Unpack the archive's `extension/` payload into the versioned
    /// directory, guarding against path traversal.
    fn unpack(&self, ext: &Extension, data: &[u8]) -> SyncResult<()> {
        let target = self.env.extension_dir(&ext.id, &ext.version);
        if target.exists() {
            fs::remove_dir_all(&target)
                .map_err(|e| Self::install_error(ext, format!("clear target: {}", e)))?;
        }
        fs::create_dir_all(&target)
            .map_err(|e| Self::install_error(ext, format!("create target: {}", e)))?;

        let mut zip = ZipArchive::new(Cursor::new(data))
            .map_err(|e| Self::install_error(ext, format!("archive: {}", e)))?;
        for i in 0..zip.len() {
            let mut file = zip
                .by_index(i)
                .map_err(|e| Self::install_error(ext, format!("archive: {}", e)))?;
            let raw_name = file.name().to_string();
            let rel = match raw_name.strip_prefix(ARCHIVE_PAYLOAD_DIR) {
                Some(rel) if !rel.is_empty() => rel,
                _ => continue,
            };
            if Path::new(rel)
                .components()
                .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(Self::install_error(ext, "path traversal in archive"));
            }
            let outpath = target.join(rel);
            if file.is_dir() {
                fs::create_dir_all(&outpath)
                    .map_err(|e| Self::install_error(ext, format!("mkdir: {}", e)))?;
            } else {
                if let Some(parent) = outpath.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| Self::install_error(ext, format!("mkdir: {}", e)))?;
                }
                let mut out = fs::File::create(&outpath)
                    .map_err(|e| Self::install_error(ext, format!("write: {}", e)))?;
                std::io::copy(&mut file, &mut out)
                    .map_err(|e| Self::install_error(ext, format!("write: {}", e)))?;
            }
        }
        debug!(id = %ext.id, version = %ext.version, "unpacked extension");
        Ok(())
    }
}

impl ExtensionInstaller for VsixInstaller {
    async fn install(&self, ext: &Extension) -> SyncResult<()> {
        let data = self.fetch_archive(ext).await?;
        self.unpack(ext, &data)
    }

    async fn update(&self, old_version: &str, ext: &Extension) -> SyncResult<()> {
        let data = self.fetch_archive(ext).await?;
        let old_dir = self.locate_dir(&ext.id, old_version);
        if old_dir.exists() {
            fs::remove_dir_all(&old_dir)
                .map_err(|e| Self::install_error(ext, format!("remove old version: {}", e)))?;
        }
        self.unpack(ext, &data)
    }

    async fn remove(&self, ext: &Extension) -> SyncResult<()> {
        let dir = self.locate_dir(&ext.id, &ext.version);
        if !dir.exists() {
            warn!(id = %ext.id, "versioned directory already gone");
            return Ok(());
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| Self::install_error(ext, format!("remove: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn vsix_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            let opts = SimpleFileOptions::default();
            zip.start_file("extension/package.json", opts).unwrap();
            zip.write_all(b"{\"name\": \"demo\"}").unwrap();
            zip.start_file("extension/out/main.js", opts).unwrap();
            zip.write_all(b"exports.activate = () => {};").unwrap();
            zip.start_file("[Content_Types].xml", opts).unwrap();
            zip.write_all(b"<Types/>").unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    fn installer(dir: &TempDir) -> VsixInstaller {
        let env = Environment::new(dir.path().join("cfg"), dir.path().join("ext"), "1.90.0");
        VsixInstaller::new(env, None).unwrap()
    }

    #[tokio::test]
    async fn test_install_from_local_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("demo.vsix");
        fs::write(&archive, vsix_bytes()).unwrap();

        let installer = installer(&dir);
        let mut ext = Extension::new("acme", "demo", "1.0.0");
        ext.local_archive_path = Some(archive);
        installer.install(&ext).await.unwrap();

        let target = dir.path().join("ext").join("acme.demo-1.0.0");
        assert!(target.join("package.json").exists());
        assert!(target.join("out/main.js").exists());
        // Archive metadata outside extension/ is not extracted.
        assert!(!target.join("[Content_Types].xml").exists());
    }

    #[tokio::test]
    async fn test_update_drops_old_version_dir() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("demo.vsix");
        fs::write(&archive, vsix_bytes()).unwrap();

        let installer = installer(&dir);
        let old_dir = dir.path().join("ext").join("acme.demo-1.0.0");
        fs::create_dir_all(&old_dir).unwrap();

        let mut ext = Extension::new("acme", "demo", "2.0.0");
        ext.local_archive_path = Some(archive);
        installer.update("1.0.0", &ext).await.unwrap();

        assert!(!old_dir.exists());
        assert!(
            dir.path()
                .join("ext")
                .join("acme.demo-2.0.0")
                .join("package.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_install_without_source_fails() {
        let dir = TempDir::new().unwrap();
        let installer = installer(&dir);
        let ext = Extension::new("acme", "demo", "1.0.0");
        let err = installer.install(&ext).await.unwrap_err();
        assert!(matches!(err, SyncError::Install { .. }));
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let dir = TempDir::new().unwrap();
        let installer = installer(&dir);
        let ext = Extension::new("acme", "demo", "1.0.0");
        installer.remove(&ext).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_matches_directory_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let installer = installer(&dir);
        // Editor-created directories keep the id's original casing.
        let mixed = dir.path().join("ext").join("Acme.Demo-1.0.0");
        fs::create_dir_all(&mixed).unwrap();

        let ext = Extension::new("Acme", "Demo", "1.0.0");
        installer.remove(&ext).await.unwrap();
        assert!(!mixed.exists());
    }

    #[tokio::test]
    async fn test_update_drops_mixed_case_old_dir() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("demo.vsix");
        fs::write(&archive, vsix_bytes()).unwrap();

        let installer = installer(&dir);
        let old_dir = dir.path().join("ext").join("Acme.Demo-1.0.0");
        fs::create_dir_all(&old_dir).unwrap();

        let mut ext = Extension::new("Acme", "Demo", "2.0.0");
        ext.local_archive_path = Some(archive);
        installer.update("1.0.0", &ext).await.unwrap();

        assert!(!old_dir.exists());
        assert!(
            dir.path()
                .join("ext")
                .join("acme.demo-2.0.0")
                .join("package.json")
                .exists()
        );
    }
}
