//! Debounced change watching.
//!
//! Merges filesystem events under the configuration root with the host's
//! "installed extensions changed" notification into one payloadless
//! signal. Consumers re-read current state when the signal fires instead
//! of trusting event payloads.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::DEFAULT_DEBOUNCE_MS;
use crate::env::Environment;
use crate::errors::{SyncError, SyncResult};

/// The single-variant "something changed" notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal;

/// Editor-internal subdirectories of the config root that churn constantly
/// and never hold synchronized settings.
const IGNORED_DIRS: [&str; 5] = [
    "globalStorage",
    "workspaceStorage",
    "logs",
    "History",
    "Backups",
];

/// Trailing-edge debounce timer. `schedule` restarts the window; `cancel`
/// is idempotent (canceling twice, or with nothing pending, is a no-op).
struct Debouncer {
    out: mpsc::Sender<ChangeSignal>,
    pending: Option<tokio::task::JoinHandle<()>>,
}

impl Debouncer {
    fn new(out: mpsc::Sender<ChangeSignal>) -> Self {
        Self { out, pending: None }
    }

    fn schedule(&mut self, delay: Duration) {
        self.cancel();
        let out = self.out.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = out.send(ChangeSignal).await;
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

enum Control {
    Changed,
    Pause,
    Resume,
    Stop,
}

/// Merged, debounced change watcher over the configuration directory and
/// the extension list.
pub struct ChangeWatcher {
    ctl: mpsc::UnboundedSender<Control>,
    signals: mpsc::Receiver<ChangeSignal>,
    fs_watcher: Option<RecommendedWatcher>,
}

impl ChangeWatcher {
    /// Watch the environment's config root recursively. `debounce` of
    /// `None` uses the default window; `Some(Duration::ZERO)` disables
    /// debouncing (each signal is forwarded immediately).
    pub fn new(env: &Environment, debounce: Option<Duration>) -> SyncResult<Self> {
        let mut watcher = Self::detached(debounce);

        let ctl = watcher.ctl.clone();
        let root = env.config_root().to_path_buf();
        let mut fs_watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| match event {
                Ok(event) => {
                    if event.paths.iter().any(|p| is_relevant(&root, p)) {
                        let _ = ctl.send(Control::Changed);
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            },
        )
        .map_err(|e| SyncError::Network(format!("failed to start watcher: {}", e)))?;
        fs_watcher
            .watch(env.config_root(), RecursiveMode::Recursive)
            .map_err(|e| SyncError::Network(format!("failed to watch config root: {}", e)))?;

        watcher.fs_watcher = Some(fs_watcher);
        Ok(watcher)
    }

    /// A watcher without a filesystem source; events are injected through
    /// [`ChangeWatcher::notify_changed`]. Used for the extension-list-only
    /// case and by tests.
    pub fn detached(debounce: Option<Duration>) -> Self {
        let delay = debounce.unwrap_or(Duration::from_millis(DEFAULT_DEBOUNCE_MS));
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(4);
        tokio::spawn(drive(ctl_rx, out_tx, delay));
        Self {
            ctl: ctl_tx,
            signals: out_rx,
            fs_watcher: None,
        }
    }

    /// Inject a change event, e.g. the host's "installed extension list
    /// changed" notification.
    pub fn notify_changed(&self) {
        let _ = self.ctl.send(Control::Changed);
    }

    /// Drop events entirely while paused; they are not queued and do not
    /// count toward a debounce window.
    pub fn pause(&self) {
        let _ = self.ctl.send(Control::Pause);
    }

    /// Resume watching. Any emission pending from before or during the
    /// pause is cancelled; whoever paused is responsible for re-checking
    /// state afterwards.
    pub fn resume(&self) {
        let _ = self.ctl.send(Control::Resume);
    }

    /// Permanently detach both sources. A stopped watcher cannot be
    /// restarted; construct a fresh one instead.
    pub fn stop(&mut self) {
        self.fs_watcher = None;
        let _ = self.ctl.send(Control::Stop);
    }

    /// Wait for the next merged signal. Returns `None` after `stop()`.
    pub async fn recv(&mut self) -> Option<ChangeSignal> {
        self.signals.recv().await
    }
}

async fn drive(
    mut ctl: mpsc::UnboundedReceiver<Control>,
    out: mpsc::Sender<ChangeSignal>,
    delay: Duration,
) {
    let mut paused = false;
    let mut debouncer = Debouncer::new(out.clone());
    while let Some(event) = ctl.recv().await {
        match event {
            Control::Changed => {
                if paused {
                    continue;
                }
                if delay.is_zero() {
                    let _ = out.send(ChangeSignal).await;
                } else {
                    debouncer.schedule(delay);
                }
            }
            Control::Pause => {
                paused = true;
                debouncer.cancel();
            }
            Control::Resume => {
                paused = false;
                debouncer.cancel();
            }
            Control::Stop => {
                debouncer.cancel();
                break;
            }
        }
    }
    debug!("change watcher stopped");
}

/// Filter for filesystem events: the engine's own config file, junk files,
/// non-JSON paths, and editor-internal subdirectories never signal.
fn is_relevant(root: &Path, path: &PathBuf) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return false,
    };
    let mut components = rel.components();
    if let Some(first) = components.next() {
        let first = first.as_os_str().to_string_lossy();
        if IGNORED_DIRS.iter().any(|d| *d == first) {
            return false;
        }
    }
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    if name == crate::config::SYNCING_FILE_NAME {
        return false;
    }
    if name.starts_with('.') || name.ends_with('~') || name.ends_with(".tmp") {
        return false;
    }
    Path::new(name)
        .extension()
        .map(|e| e == "json" || e == "code-snippets")
        .unwrap_or(false)
}
