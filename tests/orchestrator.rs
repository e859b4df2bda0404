//! End-to-end orchestrator behavior over an in-memory remote store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use edsync::Environment;
use edsync::config::SyncingConfig;
use edsync::errors::{SyncError, SyncResult};
use edsync::extensions::{
    Extension, ExtensionHost, ExtensionInstaller, ExtensionMetadata, MetadataProvider,
};
use edsync::gist::{
    COLLECTION_DESCRIPTION, FileChanges, RemoteFile, RemoteSnapshot, RemoteStorage,
};
use edsync::orchestrator::{Confirmer, SyncOrchestrator, SyncOutcome};

// ----------------------------------------------------------------------
// Fakes
// ----------------------------------------------------------------------

enum FailKind {
    Unauthorized,
    NotFound,
}

#[derive(Default)]
struct MemoryRemote {
    snapshot: Mutex<Option<RemoteSnapshot>>,
    revision: AtomicUsize,
    update_calls: AtomicUsize,
    fail_next: Mutex<Option<FailKind>>,
    get_delay: Option<Duration>,
}

fn ts(revision: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, revision as u32).unwrap()
}

fn remote_files(entries: &[(&str, &str)]) -> std::collections::BTreeMap<String, RemoteFile> {
    entries
        .iter()
        .map(|(name, content)| {
            (
                name.to_string(),
                RemoteFile {
                    filename: name.to_string(),
                    content: content.to_string(),
                },
            )
        })
        .collect()
}

impl MemoryRemote {
    fn seeded(files: &[(&str, &str)]) -> Self {
        let remote = Self::default();
        *remote.snapshot.lock().unwrap() = Some(RemoteSnapshot {
            id: "gist-1".into(),
            description: COLLECTION_DESCRIPTION.into(),
            files: remote_files(files),
            updated_at: ts(1),
        });
        remote.revision.store(1, Ordering::SeqCst);
        remote
    }

    fn fail_next(self, kind: FailKind) -> Self {
        *self.fail_next.lock().unwrap() = Some(kind);
        self
    }

    fn take_failure(&self) -> SyncResult<()> {
        match self.fail_next.lock().unwrap().take() {
            Some(FailKind::Unauthorized) => Err(SyncError::Unauthorized),
            Some(FailKind::NotFound) => Err(SyncError::NotFound("gone".into())),
            None => Ok(()),
        }
    }

    fn files(&self) -> Vec<String> {
        self.snapshot
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl RemoteStorage for MemoryRemote {
    async fn get(&self, id: &str) -> SyncResult<RemoteSnapshot> {
        self.take_failure()?;
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }
        match self.snapshot.lock().unwrap().as_ref() {
            Some(s) if s.id == id => Ok(s.clone()),
            _ => Err(SyncError::NotFound(id.to_string())),
        }
    }

    async fn create(
        &self,
        files: FileChanges,
        description: &str,
        _public: bool,
    ) -> SyncResult<RemoteSnapshot> {
        self.take_failure()?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = RemoteSnapshot {
            id: "gist-1".into(),
            description: description.to_string(),
            files: files
                .into_iter()
                .filter_map(|(name, content)| {
                    content.map(|content| {
                        (
                            name.clone(),
                            RemoteFile {
                                filename: name,
                                content,
                            },
                        )
                    })
                })
                .collect(),
            updated_at: ts(revision),
        };
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn update(&self, id: &str, files: FileChanges) -> SyncResult<RemoteSnapshot> {
        self.take_failure()?;
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.snapshot.lock().unwrap();
        let snapshot = guard.as_mut().filter(|s| s.id == id).ok_or_else(|| {
            SyncError::NotFound(id.to_string())
        })?;
        for (name, content) in files {
            match content {
                Some(content) => {
                    snapshot.files.insert(
                        name.clone(),
                        RemoteFile {
                            filename: name,
                            content,
                        },
                    );
                }
                None => {
                    snapshot.files.remove(&name);
                }
            }
        }
        snapshot.updated_at = ts(revision);
        Ok(snapshot.clone())
    }

    async fn list_all(&self) -> SyncResult<Vec<RemoteSnapshot>> {
        self.take_failure()?;
        Ok(self.snapshot.lock().unwrap().iter().cloned().collect())
    }

    async fn delete(&self, _id: &str) -> SyncResult<()> {
        self.snapshot.lock().unwrap().take();
        Ok(())
    }
}

#[derive(Default)]
struct RecordingInstaller {
    calls: Mutex<Vec<String>>,
}

impl ExtensionInstaller for RecordingInstaller {
    async fn install(&self, ext: &Extension) -> SyncResult<()> {
        self.calls.lock().unwrap().push(format!("install {}", ext.id));
        Ok(())
    }

    async fn update(&self, _old_version: &str, ext: &Extension) -> SyncResult<()> {
        self.calls.lock().unwrap().push(format!("update {}", ext.id));
        Ok(())
    }

    async fn remove(&self, ext: &Extension) -> SyncResult<()> {
        self.calls.lock().unwrap().push(format!("remove {}", ext.id));
        Ok(())
    }
}

struct NoMetadata;

impl MetadataProvider for NoMetadata {
    async fn query(&self, _ids: &[String]) -> SyncResult<HashMap<String, ExtensionMetadata>> {
        Ok(HashMap::new())
    }
}

struct StaticHost(Vec<Extension>);

impl ExtensionHost for StaticHost {
    fn installed_extensions(&self) -> Vec<Extension> {
        self.0.clone()
    }
}

struct ScriptedConfirmer {
    accept: bool,
    calls: AtomicUsize,
}

impl ScriptedConfirmer {
    fn accepting(accept: bool) -> Self {
        Self {
            accept,
            calls: AtomicUsize::new(0),
        }
    }

    fn prompted(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, _change_count: usize) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.accept
    }
}

// ----------------------------------------------------------------------
// Fixture
// ----------------------------------------------------------------------

struct Fixture {
    _dir: TempDir,
    env: Environment,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let env = Environment::new(dir.path(), dir.path().join("extensions"), "1.90.0")
            .with_mac(false);
        Self { _dir: dir, env }
    }

    fn write_config(&self, config: &SyncingConfig) {
        config.save(&self.env.syncing_file()).unwrap();
    }

    fn read_config(&self) -> SyncingConfig {
        SyncingConfig::load(&self.env.syncing_file()).unwrap()
    }

    fn write_file(&self, name: &str, content: &str) {
        std::fs::write(self.env.config_root().join(name), content).unwrap();
    }

    fn write_snippet(&self, name: &str, content: &str) {
        let dir = self.env.snippets_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }
}

type TestOrchestrator =
    SyncOrchestrator<MemoryRemote, RecordingInstaller, NoMetadata, StaticHost, ScriptedConfirmer>;

fn orchestrator(
    fx: &Fixture,
    remote: MemoryRemote,
    host: Vec<Extension>,
    confirmer: ScriptedConfirmer,
) -> TestOrchestrator {
    SyncOrchestrator::new(
        fx.env.clone(),
        remote,
        RecordingInstaller::default(),
        NoMetadata,
        StaticHost(host),
        confirmer,
    )
}

fn configured(threshold: u32) -> SyncingConfig {
    SyncingConfig {
        remote_collection_id: Some("gist-1".into()),
        exclusion_threshold: threshold,
        ..Default::default()
    }
}

fn completed(outcome: SyncOutcome) -> edsync::SyncSummary {
    match outcome {
        SyncOutcome::Completed(summary) => summary,
        other => panic!("expected Completed, got {:?}", other),
    }
}

// ----------------------------------------------------------------------
// Upload
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_first_upload_creates_collection_and_persists_id() {
    let fx = Fixture::new();
    fx.write_file("settings.json", r#"{ "editor.fontSize": 14 }"#);

    let orch = orchestrator(&fx, MemoryRemote::default(), vec![], ScriptedConfirmer::accepting(true));
    let summary = completed(orch.upload().await.unwrap());

    assert!(summary.saved.contains(&"settings.json".to_string()));
    assert!(summary.saved.contains(&"extensions.json".to_string()));
    // keybindings.json and locale.json do not exist locally.
    assert_eq!(summary.load_errors.len(), 2);

    let config = fx.read_config();
    assert_eq!(config.remote_collection_id.as_deref(), Some("gist-1"));
    assert!(config.last_uploaded.is_some());
}

#[tokio::test]
async fn test_unchanged_upload_writes_nothing() {
    let fx = Fixture::new();
    fx.write_config(&configured(10));
    fx.write_file("settings.json", r#"{ "a": 1 }"#);

    let remote = MemoryRemote::seeded(&[
        ("settings.json", r#"{ "a": 1 }"#),
        ("extensions.json", "[]"),
    ]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let summary = completed(orch.upload().await.unwrap());

    assert!(summary.saved.is_empty());
    assert!(summary.skipped.contains(&"settings.json".to_string()));
    assert!(summary.skipped.contains(&"extensions.json".to_string()));
    assert_eq!(orch.remote().update_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upload_deletes_remote_snippet_without_local_counterpart() {
    let fx = Fixture::new();
    fx.write_config(&configured(0));
    fx.write_file("settings.json", r#"{ "a": 1 }"#);

    let remote = MemoryRemote::seeded(&[
        ("settings.json", r#"{ "a": 1 }"#),
        ("extensions.json", "[]"),
        ("snippet-stale.json", "{}"),
    ]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let summary = completed(orch.upload().await.unwrap());

    assert_eq!(summary.deleted, vec!["snippet-stale.json".to_string()]);
    assert!(!orch.remote().files().contains(&"snippet-stale.json".to_string()));
}

#[tokio::test]
async fn test_gate_decline_aborts_without_writing() {
    let fx = Fixture::new();
    fx.write_config(&configured(5));
    fx.write_file(
        "settings.json",
        r#"{ "a": 1, "b": 2, "c": 3, "d": 4, "e": 5 }"#,
    );

    let remote = MemoryRemote::seeded(&[("settings.json", "{}"), ("extensions.json", "[]")]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(false));
    let outcome = orch.upload().await.unwrap();

    assert!(matches!(outcome, SyncOutcome::Aborted));
    assert_eq!(orch.confirmer().prompted(), 1);
    assert_eq!(orch.remote().update_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_gate_accept_proceeds() {
    let fx = Fixture::new();
    fx.write_config(&configured(5));
    fx.write_file(
        "settings.json",
        r#"{ "a": 1, "b": 2, "c": 3, "d": 4, "e": 5 }"#,
    );

    let remote = MemoryRemote::seeded(&[("settings.json", "{}"), ("extensions.json", "[]")]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let summary = completed(orch.upload().await.unwrap());

    assert_eq!(orch.confirmer().prompted(), 1);
    assert!(summary.saved.contains(&"settings.json".to_string()));
}

#[tokio::test]
async fn test_gate_below_threshold_never_prompts() {
    let fx = Fixture::new();
    fx.write_config(&configured(5));
    fx.write_file("settings.json", r#"{ "a": 1, "b": 2, "c": 3, "d": 4 }"#);

    let remote = MemoryRemote::seeded(&[("settings.json", "{}"), ("extensions.json", "[]")]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(false));
    let summary = completed(orch.upload().await.unwrap());

    assert_eq!(orch.confirmer().prompted(), 0);
    assert!(summary.saved.contains(&"settings.json".to_string()));
}

#[tokio::test]
async fn test_gate_disabled_at_zero_threshold() {
    let fx = Fixture::new();
    fx.write_config(&configured(0));
    let keys: Vec<String> = (0..20).map(|i| format!("\"k{}\": {}", i, i)).collect();
    fx.write_file("settings.json", &format!("{{ {} }}", keys.join(", ")));

    let remote = MemoryRemote::seeded(&[("settings.json", "{}"), ("extensions.json", "[]")]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(false));
    completed(orch.upload().await.unwrap());

    assert_eq!(orch.confirmer().prompted(), 0);
}

#[tokio::test]
async fn test_upload_gate_ignores_remote_declared_exclusions() {
    let fx = Fixture::new();
    fx.write_config(&configured(1));
    // The only difference between local and remote is a key the REMOTE
    // document itself declares excluded, so the gate counts zero.
    fx.write_file(
        "settings.json",
        r#"{ "syncing.excludedSettingKeys": ["window.*"], "window.zoom": 2 }"#,
    );

    let remote = MemoryRemote::seeded(&[
        (
            "settings.json",
            r#"{ "syncing.excludedSettingKeys": ["window.*"] }"#,
        ),
        ("extensions.json", "[]"),
    ]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(false));
    completed(orch.upload().await.unwrap());

    assert_eq!(orch.confirmer().prompted(), 0);
}

#[tokio::test]
async fn test_upload_strips_locally_excluded_keys() {
    let fx = Fixture::new();
    let mut config = configured(0);
    config.excluded_setting_keys_patterns = vec!["http.*".into()];
    fx.write_config(&config);
    fx.write_file(
        "settings.json",
        "{\n    \"a\": 1,\n    \"http.proxy\": \"http://localhost:3128\"\n}",
    );

    let remote = MemoryRemote::seeded(&[("extensions.json", "[]")]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    completed(orch.upload().await.unwrap());

    let snapshot = orch.remote().snapshot.lock().unwrap().clone().unwrap();
    let uploaded = snapshot.file_content("settings.json").unwrap();
    assert!(uploaded.contains("\"a\""));
    assert!(!uploaded.contains("http.proxy"));
}

#[tokio::test]
async fn test_upload_omits_excluded_extensions() {
    let fx = Fixture::new();
    let mut config = configured(0);
    config.excluded_extension_patterns = vec!["local.*".into()];
    fx.write_config(&config);

    let host = vec![
        Extension::new("acme", "demo", "1.0.0"),
        Extension::new("local", "scratch", "0.1.0"),
    ];
    let remote = MemoryRemote::seeded(&[]);
    let orch = orchestrator(&fx, remote, host, ScriptedConfirmer::accepting(true));
    completed(orch.upload().await.unwrap());

    let snapshot = orch.remote().snapshot.lock().unwrap().clone().unwrap();
    let uploaded = snapshot.file_content("extensions.json").unwrap();
    assert!(uploaded.contains("acme.demo"));
    assert!(!uploaded.contains("local.scratch"));
}

// ----------------------------------------------------------------------
// Download
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_download_without_collection_id_fails() {
    let fx = Fixture::new();
    let orch = orchestrator(&fx, MemoryRemote::default(), vec![], ScriptedConfirmer::accepting(true));
    let err = orch.download().await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn test_download_keeps_locally_excluded_keys() {
    let fx = Fixture::new();
    let mut config = configured(0);
    config.excluded_setting_keys_patterns = vec!["window.*".into()];
    fx.write_config(&config);
    fx.write_file(
        "settings.json",
        "{\n    \"a\": 1,\n    \"window.zoom\": 2\n}",
    );

    let remote = MemoryRemote::seeded(&[("settings.json", "{\n    \"a\": 5\n}")]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let summary = completed(orch.download().await.unwrap());

    assert!(summary.saved.contains(&"settings.json".to_string()));
    let written =
        std::fs::read_to_string(fx.env.config_root().join("settings.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(value["a"], 5);
    assert_eq!(value["window.zoom"], 2);
}

#[tokio::test]
async fn test_download_syncs_snippet_set() {
    let fx = Fixture::new();
    fx.write_config(&configured(0));
    fx.write_snippet("old.json", "{}");

    let remote = MemoryRemote::seeded(&[("snippet-new.json", r#"{ "x": 1 }"#)]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let summary = completed(orch.download().await.unwrap());

    assert_eq!(summary.deleted, vec!["snippet-old.json".to_string()]);
    assert!(!fx.env.snippets_dir().join("old.json").exists());
    assert_eq!(
        std::fs::read_to_string(fx.env.snippets_dir().join("new.json")).unwrap(),
        r#"{ "x": 1 }"#
    );
}

#[tokio::test]
async fn test_download_reconciles_extensions_after_files() {
    let fx = Fixture::new();
    fx.write_config(&configured(0));

    let remote = MemoryRemote::seeded(&[
        ("settings.json", r#"{ "a": 1 }"#),
        (
            "extensions.json",
            r#"[{ "id": "acme.demo", "name": "demo", "publisher": "acme", "version": "1.0.0" }]"#,
        ),
    ]);
    let host = vec![Extension::new("other", "stale", "1.0.0")];
    let orch = orchestrator(&fx, remote, host, ScriptedConfirmer::accepting(true));
    let summary = completed(orch.download().await.unwrap());

    // Extensions are always the final stage.
    assert_eq!(summary.saved.last().map(String::as_str), Some("extensions.json"));
    let result = summary.extensions.unwrap();
    assert_eq!(result.added.succeeded.len(), 1);
    assert_eq!(result.removed.succeeded.len(), 1);

    let calls = orch.installer().calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["install acme.demo", "remove other.stale"]);
}

#[tokio::test]
async fn test_download_gate_decline_leaves_disk_untouched() {
    let fx = Fixture::new();
    fx.write_config(&configured(2));
    fx.write_file("settings.json", r#"{ "a": 1 }"#);

    let remote = MemoryRemote::seeded(&[("settings.json", r#"{ "a": 2, "b": 3, "c": 4 }"#)]);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(false));
    let outcome = orch.download().await.unwrap();

    assert!(matches!(outcome, SyncOutcome::Aborted));
    assert_eq!(
        std::fs::read_to_string(fx.env.config_root().join("settings.json")).unwrap(),
        r#"{ "a": 1 }"#
    );
}

// ----------------------------------------------------------------------
// Credential and identity recovery
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_unauthorized_clears_stored_token() {
    let fx = Fixture::new();
    let mut config = configured(0);
    config.remote_token = Some("tok".into());
    fx.write_config(&config);

    let remote = MemoryRemote::seeded(&[]).fail_next(FailKind::Unauthorized);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let err = orch.upload().await.unwrap_err();

    assert!(matches!(err, SyncError::Unauthorized));
    let config = fx.read_config();
    assert!(config.remote_token.is_none());
    assert_eq!(config.remote_collection_id.as_deref(), Some("gist-1"));
}

#[tokio::test]
async fn test_vanished_collection_clears_stored_id() {
    let fx = Fixture::new();
    let mut config = configured(0);
    config.remote_token = Some("tok".into());
    fx.write_config(&config);

    let remote = MemoryRemote::seeded(&[]).fail_next(FailKind::NotFound);
    let orch = orchestrator(&fx, remote, vec![], ScriptedConfirmer::accepting(true));
    let err = orch.upload().await.unwrap_err();

    assert!(matches!(err, SyncError::NotFound(_)));
    let config = fx.read_config();
    assert!(config.remote_collection_id.is_none());
    assert_eq!(config.remote_token.as_deref(), Some("tok"));
}

// ----------------------------------------------------------------------
// Single-flight
// ----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_request_during_flight_is_ignored() {
    let fx = Fixture::new();
    fx.write_config(&configured(0));

    let mut remote = MemoryRemote::seeded(&[("extensions.json", "[]")]);
    remote.get_delay = Some(Duration::from_secs(5));
    let orch = std::sync::Arc::new(orchestrator(
        &fx,
        remote,
        vec![],
        ScriptedConfirmer::accepting(true),
    ));

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.upload().await })
    };
    // Let the first attempt claim the flight slot and park on the remote.
    tokio::task::yield_now().await;

    let second = orch.download().await.unwrap();
    assert!(matches!(second, SyncOutcome::AlreadyInFlight));

    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
}
