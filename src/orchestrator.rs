//! The upload/download pipeline.
//!
//! One attempt moves Idle → Preparing → InFlight → {Succeeded | Failed |
//! Aborted} → Idle. Only one attempt may be in flight; a request arriving
//! while one is running is silently ignored. Setting kinds are processed
//! strictly in the fixed order of [`crate::setting::SettingKind::ORDERED`],
//! extensions always last.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::SyncingConfig;
use crate::diff;
use crate::env::Environment;
use crate::errors::{SyncError, SyncResult};
use crate::extensions::{
    self, Extension, ExtensionHost, ExtensionInstaller, ExtensionSyncResult, MetadataProvider,
};
use crate::filter;
use crate::gist::{COLLECTION_DESCRIPTION, FileChanges, RemoteSnapshot, RemoteStorage};
use crate::setting::{
    EXTENSIONS_FILE, SETTINGS_FILE, Setting, SettingKind, gather_local, is_snippet_remote_name,
    snippet_local_path,
};

/// Top-level settings key through which a settings document declares its
/// own exclusion patterns. During the upload gate the REMOTE document's
/// declaration is authoritative for what "excluded" means.
pub const EXCLUSION_DECLARATION_KEY: &str = "syncing.excludedSettingKeys";

/// Asks the user to approve an overwrite once the poka-yoke gate trips.
pub trait Confirmer {
    fn confirm(&self, change_count: usize) -> bool;
}

#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    /// The user declined the confirmation; nothing was written. Not an
    /// error.
    Aborted,
    /// Another attempt was already in flight; this request was ignored.
    AlreadyInFlight,
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    /// Remote names written (remotely on upload, locally on download).
    pub saved: Vec<String>,
    /// Remote names deleted (snippet-kind only).
    pub deleted: Vec<String>,
    /// Remote names skipped because the content was already identical.
    pub skipped: Vec<String>,
    /// Remote names whose local content could not be loaded.
    pub load_errors: Vec<String>,
    pub extensions: Option<ExtensionSyncResult>,
    /// Revision timestamp of the snapshot after the operation.
    pub revision: Option<DateTime<Utc>>,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator<R, I, M, H, C> {
    env: Environment,
    remote: R,
    installer: I,
    metadata: M,
    host: H,
    confirmer: C,
    in_flight: AtomicBool,
}

impl<R, I, M, H, C> SyncOrchestrator<R, I, M, H, C>
where
    R: RemoteStorage,
    I: ExtensionInstaller,
    M: MetadataProvider,
    H: ExtensionHost,
    C: Confirmer,
{
    pub fn new(env: Environment, remote: R, installer: I, metadata: M, host: H, confirmer: C) -> Self {
        Self {
            env,
            remote,
            installer,
            metadata,
            host,
            confirmer,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    pub fn confirmer(&self) -> &C {
        &self.confirmer
    }

    fn enter_flight(&self) -> Option<FlightGuard<'_>> {
        // Checked and set before the first suspension point, so two
        // attempts can never interleave.
        match self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Some(FlightGuard(&self.in_flight)),
            Err(_) => None,
        }
    }

    /// Convert a remote-store failure into its taxonomy kind, resetting the
    /// stored credential or collection id where the kind demands it.
    fn classify_remote_error(&self, config: &mut SyncingConfig, e: SyncError) -> SyncError {
        match &e {
            SyncError::Unauthorized => {
                warn!("remote rejected the token, clearing it");
                if let Err(save_err) = config.reset_token(&self.env.syncing_file()) {
                    warn!(error = %save_err, "failed to persist the cleared token");
                }
            }
            SyncError::NotFound(_) => {
                warn!("remote collection vanished, clearing the stored id");
                if let Err(save_err) = config.reset_collection_id(&self.env.syncing_file()) {
                    warn!(error = %save_err, "failed to persist the cleared collection id");
                }
            }
            _ => {}
        }
        e
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    pub async fn upload(&self) -> SyncResult<SyncOutcome> {
        let _guard = match self.enter_flight() {
            Some(guard) => guard,
            None => return Ok(SyncOutcome::AlreadyInFlight),
        };
        let mut config = SyncingConfig::load(&self.env.syncing_file())
            .map_err(|e| SyncError::Document(e.to_string()))?;

        let mut summary = SyncSummary::default();
        let payloads = self.collect_upload_payloads(&config, &mut summary)?;

        // First sync: create the collection and persist its identity.
        let Some(collection_id) = config.remote_collection_id.clone() else {
            let files: FileChanges = payloads
                .iter()
                .map(|(name, content)| (name.clone(), Some(content.clone())))
                .collect();
            let snapshot = self
                .remote
                .create(files, COLLECTION_DESCRIPTION, false)
                .await
                .map_err(|e| self.classify_remote_error(&mut config, e))?;
            info!(id = %snapshot.id, "created remote collection");
            config.remote_collection_id = Some(snapshot.id.clone());
            config.last_uploaded = Some(snapshot.updated_at.to_rfc3339());
            config
                .save(&self.env.syncing_file())
                .map_err(|e| SyncError::Document(e.to_string()))?;
            summary.saved = payloads.keys().cloned().collect();
            summary.revision = Some(snapshot.updated_at);
            return Ok(SyncOutcome::Completed(summary));
        };

        let snapshot = self
            .remote
            .get(&collection_id)
            .await
            .map_err(|e| self.classify_remote_error(&mut config, e))?;

        // Poka-yoke gate: the remote's own exclusion declaration governs
        // what is ignored while counting.
        if config.exclusion_threshold > 0 {
            let count = upload_change_count(&payloads, &snapshot);
            debug!(count, threshold = config.exclusion_threshold, "upload gate");
            if count as u32 >= config.exclusion_threshold && !self.confirmer.confirm(count) {
                info!("upload aborted at the confirmation gate");
                return Ok(SyncOutcome::Aborted);
            }
        }

        // Minimal write set: only files that changed or are new; remote
        // snippet files with no local counterpart are deleted.
        let mut changes = FileChanges::new();
        for (name, content) in &payloads {
            match snapshot.file_content(name) {
                Some(remote) if remote == content => summary.skipped.push(name.clone()),
                _ => {
                    changes.insert(name.clone(), Some(content.clone()));
                }
            }
        }
        for name in snapshot.files.keys() {
            if is_snippet_remote_name(name) && !payloads.contains_key(name) {
                changes.insert(name.clone(), None);
                summary.deleted.push(name.clone());
            }
        }

        if changes.is_empty() {
            info!("nothing to upload");
            summary.revision = Some(snapshot.updated_at);
            return Ok(SyncOutcome::Completed(summary));
        }

        summary.saved = changes
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        let updated = self
            .remote
            .update(&collection_id, changes)
            .await
            .map_err(|e| self.classify_remote_error(&mut config, e))?;

        config.last_uploaded = Some(updated.updated_at.to_rfc3339());
        config
            .save(&self.env.syncing_file())
            .map_err(|e| SyncError::Document(e.to_string()))?;
        summary.revision = Some(updated.updated_at);
        info!(files = summary.saved.len(), "upload complete");
        Ok(SyncOutcome::Completed(summary))
    }

    /// Load every local setting in order and produce the remote payload
    /// map. Load failures are accumulated, never fatal. Settings content
    /// has the locally-excluded keys stripped; the extension list is
    /// serialized from the installed set minus excluded ids.
    fn collect_upload_payloads(
        &self,
        config: &SyncingConfig,
        summary: &mut SyncSummary,
    ) -> SyncResult<BTreeMap<String, String>> {
        let mut payloads = BTreeMap::new();
        for mut setting in gather_local(&self.env, config) {
            if setting.kind == SettingKind::Extensions {
                let list: Vec<Extension> = self
                    .host
                    .installed_extensions()
                    .into_iter()
                    .filter(|e| !filter::matches_any(&config.excluded_extension_patterns, &e.key()))
                    .collect();
                payloads.insert(
                    setting.remote_name.clone(),
                    extensions::serialize_extension_list(&list),
                );
                continue;
            }
            if let Err(e) = setting.load_content() {
                debug!(name = %setting.remote_name, error = %e, "skipping unreadable setting");
                summary.load_errors.push(setting.remote_name.clone());
                continue;
            }
            // A setting with no content never reaches a write.
            let Some(content) = setting.content.clone() else {
                continue;
            };
            let content = if setting.kind == SettingKind::Settings {
                let parsed = crate::jsonc::parse(&content)?;
                filter::exclude(&content, &parsed, &config.excluded_setting_keys_patterns)?
            } else {
                content
            };
            payloads.insert(setting.remote_name.clone(), content);
        }
        Ok(payloads)
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    pub async fn download(&self) -> SyncResult<SyncOutcome> {
        let _guard = match self.enter_flight() {
            Some(guard) => guard,
            None => return Ok(SyncOutcome::AlreadyInFlight),
        };
        let mut config = SyncingConfig::load(&self.env.syncing_file())
            .map_err(|e| SyncError::Document(e.to_string()))?;
        let collection_id = config
            .remote_collection_id
            .clone()
            .ok_or_else(|| SyncError::NotFound("no remote collection configured".into()))?;

        let snapshot = self
            .remote
            .get(&collection_id)
            .await
            .map_err(|e| self.classify_remote_error(&mut config, e))?;

        let (stages, deletions) = self.stage_download(&config, &snapshot);

        if config.exclusion_threshold > 0 {
            let count = self.download_change_count(&config, &stages, &deletions);
            debug!(count, threshold = config.exclusion_threshold, "download gate");
            if count as u32 >= config.exclusion_threshold && !self.confirmer.confirm(count) {
                info!("download aborted at the confirmation gate");
                return Ok(SyncOutcome::Aborted);
            }
        }

        let mut summary = SyncSummary::default();
        for setting in &deletions {
            setting.delete_local()?;
            summary.deleted.push(setting.remote_name.clone());
        }
        for (setting, incoming) in &stages {
            match setting.kind {
                SettingKind::Extensions => {
                    let desired = extensions::parse_extension_list(incoming)?;
                    let local = self.host.installed_extensions();
                    let plan = extensions::reconcile(
                        &desired,
                        &local,
                        &config.excluded_extension_patterns,
                        config.auto_update_extensions,
                        self.env.host_version(),
                        &self.metadata,
                    )
                    .await?;
                    let result = extensions::apply_plan(&plan, &self.installer).await;
                    summary.extensions = Some(result);
                    summary.saved.push(setting.remote_name.clone());
                }
                SettingKind::Settings => {
                    // Locally excluded keys survive the incoming copy.
                    let local_text = std::fs::read_to_string(&setting.local_path)
                        .unwrap_or_default();
                    let merged = filter::merge(
                        incoming,
                        &local_text,
                        &config.excluded_setting_keys_patterns,
                    )?;
                    setting.save_content(&merged)?;
                    summary.saved.push(setting.remote_name.clone());
                }
                _ => {
                    setting.save_content(incoming)?;
                    summary.saved.push(setting.remote_name.clone());
                }
            }
        }

        config.last_downloaded = Some(snapshot.updated_at.to_rfc3339());
        config
            .save(&self.env.syncing_file())
            .map_err(|e| SyncError::Document(e.to_string()))?;
        summary.revision = Some(snapshot.updated_at);
        info!(files = summary.saved.len(), "download complete");
        Ok(SyncOutcome::Completed(summary))
    }

    /// Decide what to save and what to delete locally. Extensions are
    /// staged last; a local snippet with no remote counterpart is staged
    /// for deletion; a remote snippet with no local counterpart is staged
    /// for creation.
    fn stage_download(
        &self,
        config: &SyncingConfig,
        snapshot: &RemoteSnapshot,
    ) -> (Vec<(Setting, String)>, Vec<Setting>) {
        let locals = gather_local(&self.env, config);
        let mut stages = Vec::new();
        let mut extension_stage = None;
        let mut deletions = Vec::new();

        for setting in locals {
            match snapshot.file_content(&setting.remote_name) {
                Some(content) => {
                    if setting.kind == SettingKind::Extensions {
                        extension_stage = Some((setting, content.to_string()));
                    } else {
                        stages.push((setting, content.to_string()));
                    }
                }
                None => {
                    // Only snippet-kind files are ever deleted.
                    if setting.kind == SettingKind::Snippets {
                        deletions.push(setting);
                    }
                }
            }
        }

        let staged_names: Vec<String> = stages.iter().map(|(s, _)| s.remote_name.clone()).collect();
        for (name, file) in &snapshot.files {
            if is_snippet_remote_name(name) && !staged_names.contains(name) {
                stages.push((
                    Setting::new(
                        SettingKind::Snippets,
                        snippet_local_path(&self.env, name),
                        name.clone(),
                    ),
                    file.content.clone(),
                ));
            }
        }

        if let Some(stage) = extension_stage {
            stages.push(stage);
        }
        (stages, deletions)
    }

    /// Gate count for download: the settings pair is normalized with the
    /// local exclusion patterns first, so a key differing only because it
    /// is locally excluded does not count.
    fn download_change_count(
        &self,
        config: &SyncingConfig,
        stages: &[(Setting, String)],
        deletions: &[Setting],
    ) -> usize {
        let mut total = deletions.len();
        for (setting, incoming) in stages {
            let local_text = std::fs::read_to_string(&setting.local_path).ok();
            let incoming_text = if setting.kind == SettingKind::Settings {
                match filter::merge(
                    incoming,
                    local_text.as_deref().unwrap_or(""),
                    &config.excluded_setting_keys_patterns,
                ) {
                    Ok(merged) => merged,
                    Err(_) => incoming.clone(),
                }
            } else {
                incoming.clone()
            };
            total += count_text_pair(&setting.remote_name, local_text.as_deref(), Some(&incoming_text));
        }
        total
    }
}

/// Gate count for upload, filtered on both sides by the REMOTE settings
/// document's own exclusion declaration.
fn upload_change_count(payloads: &BTreeMap<String, String>, snapshot: &RemoteSnapshot) -> usize {
    let remote_patterns = declared_exclusions(snapshot.file_content(SETTINGS_FILE));
    let mut names: Vec<&str> = payloads.keys().map(String::as_str).collect();
    for name in snapshot.files.keys() {
        if !payloads.contains_key(name) {
            names.push(name);
        }
    }

    let mut total = 0;
    for name in names {
        let local = payloads.get(name).map(String::as_str);
        let remote = snapshot.file_content(name);
        if name == SETTINGS_FILE {
            let local_value = local.and_then(|t| crate::jsonc::parse(t).ok()).map(|mut v| {
                strip_excluded(&mut v, &remote_patterns);
                v
            });
            let remote_value = remote.and_then(|t| crate::jsonc::parse(t).ok()).map(|mut v| {
                strip_excluded(&mut v, &remote_patterns);
                v
            });
            total += diff::count(local_value.as_ref(), remote_value.as_ref(), None);
        } else {
            total += count_text_pair(name, local, remote);
        }
    }
    total
}

/// Exclusion patterns a settings document declares about itself.
fn declared_exclusions(settings_text: Option<&str>) -> Vec<String> {
    let Some(text) = settings_text else {
        return Vec::new();
    };
    let Ok(value) = crate::jsonc::parse(text) else {
        return Vec::new();
    };
    value
        .get(EXCLUSION_DECLARATION_KEY)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn strip_excluded(value: &mut Value, patterns: &[String]) {
    if patterns.is_empty() {
        return;
    }
    if let Some(obj) = value.as_object_mut() {
        obj.retain(|key, _| !filter::matches_any(patterns, key));
    }
}

/// Structural count for one file pair. Extension lists diff under the
/// `id` identity key; documents that fail tolerant parsing fall back to
/// text comparison.
fn count_text_pair(name: &str, local: Option<&str>, remote: Option<&str>) -> usize {
    let array_key = if name == EXTENSIONS_FILE { Some("id") } else { None };
    let parse = |text: Option<&str>| text.and_then(|t| crate::jsonc::parse(t).ok());
    match (local, remote) {
        (None, None) => 0,
        _ => {
            let (lv, rv) = (parse(local), parse(remote));
            if lv.is_none() && rv.is_none() {
                return usize::from(local != remote);
            }
            diff::count(lv.as_ref(), rv.as_ref(), array_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_exclusions_parsing() {
        let text = r#"{ "syncing.excludedSettingKeys": ["http.*", "window.zoom"], "a": 1 }"#;
        assert_eq!(
            declared_exclusions(Some(text)),
            vec!["http.*".to_string(), "window.zoom".to_string()]
        );
        assert!(declared_exclusions(None).is_empty());
        assert!(declared_exclusions(Some("{}")).is_empty());
    }

    #[test]
    fn test_count_text_pair_extensions_uses_id_key() {
        let a = r#"[{"id": "a.b", "name": "b", "publisher": "a", "version": "1.0.0"}]"#;
        let b = r#"[{"id": "A.B", "name": "b", "publisher": "a", "version": "1.0.0"}]"#;
        let c = r#"[{"id": "a.b", "name": "b", "publisher": "a", "version": "2.0.0"}]"#;
        assert_eq!(count_text_pair(EXTENSIONS_FILE, Some(a), Some(a)), 0);
        // Ids compare case-insensitively, so a casing-only difference is
        // not a change; a version bump on the matched item is.
        assert_eq!(count_text_pair(EXTENSIONS_FILE, Some(a), Some(b)), 0);
        assert_eq!(count_text_pair(EXTENSIONS_FILE, Some(a), Some(c)), 1);
    }

    #[test]
    fn test_count_text_pair_non_json_falls_back_to_text() {
        assert_eq!(count_text_pair("x", Some("not json"), Some("not json")), 0);
        assert_eq!(count_text_pair("x", Some("not json"), Some("other")), 1);
    }
}
